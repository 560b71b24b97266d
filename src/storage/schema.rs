use crate::io::{read_exact, Decodeable, Encodeable};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Type {
    Int64,

    /// Variable-length byte string with the given capacity. The
    /// on-disk form is a 2-byte length prefix plus the payload, so
    /// rows of the same schema may differ in size.
    Bytes(u16),
}

impl Encodeable for Type {
    fn encode(&self) -> Vec<u8> {
        match self {
            Type::Int64 => vec![1, 0, 0],
            Type::Bytes(cap) => {
                let mut buf = vec![2];
                buf.extend_from_slice(&cap.to_le_bytes());
                buf
            }
        }
    }
}

impl Decodeable for Type {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let bytes = read_exact(reader, 3);
        match bytes[0] {
            1 => Type::Int64,
            2 => Type::Bytes(u16::from_le_bytes([bytes[1], bytes[2]])),
            _ => panic!("invalid type tag: {}", bytes[0]),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Field {
    pub name: String,
    t: Type,
    pub is_primary: bool,
}

impl Field {
    pub fn new(name: &str, t: Type, is_primary: bool) -> Self {
        Self {
            name: name.to_string(),
            t,
            is_primary,
        }
    }

    pub fn get_type(&self) -> Type {
        self.t
    }
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    fields: Vec<Field>,
}

impl TableSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn small_int_schema(width: usize) -> Self {
        let mut fields: Vec<Field> = Vec::new();
        for i in 0..width {
            let field = Field::new(&format!("int-column-{}", i), Type::Int64, i == 0);

            fields.push(field);
        }

        Self::new(fields)
    }

    /// One int key plus one variable-length payload column, the shape
    /// most tests use.
    pub fn int_bytes_schema(bytes_cap: u16) -> Self {
        Self::new(vec![
            Field::new("key", Type::Int64, true),
            Field::new("payload", Type::Bytes(bytes_cap), false),
        ])
    }
}

impl TableSchema {
    /// Get the position of the key field.
    pub fn get_key_pos(&self) -> usize {
        for (i, field) in self.get_fields().iter().enumerate() {
            if field.is_primary {
                return i;
            }
        }
        panic!("no key field found");
    }

    pub fn get_field_pos(&self, field_name: &str) -> Option<usize> {
        for (i, field) in self.get_fields().iter().enumerate() {
            if field.name == field_name {
                return Some(i);
            }
        }
        None
    }

    pub fn get_fields(&self) -> &Vec<Field> {
        &self.fields
    }
}
