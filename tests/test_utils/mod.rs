#![allow(dead_code)]

mod setup;
mod tables;

pub use setup::*;
pub use tables::*;
