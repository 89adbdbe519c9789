//! Table and index schemas plus typed literal values.

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::encoding::keycode::{order_f64, order_i64};
use crate::error::{Error, Result};
use crate::pack::BlockType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Uint64,
    Int64,
    Uint32,
    Int32,
    Uint16,
    Int16,
    Uint8,
    Int8,
    Float64,
    Float32,
    Boolean,
    String,
    Bytes,
}

impl FieldType {
    pub fn block_type(self) -> BlockType {
        match self {
            FieldType::Uint64 => BlockType::U64,
            FieldType::Int64 => BlockType::I64,
            FieldType::Uint32 => BlockType::U32,
            FieldType::Int32 => BlockType::I32,
            FieldType::Uint16 => BlockType::U16,
            FieldType::Int16 => BlockType::I16,
            FieldType::Uint8 => BlockType::U8,
            FieldType::Int8 => BlockType::I8,
            FieldType::Float64 => BlockType::F64,
            FieldType::Float32 => BlockType::F32,
            FieldType::Boolean => BlockType::Bool,
            FieldType::String | FieldType::Bytes => BlockType::Bytes,
        }
    }

    /// Whether values of this type have a total order in the u64 key domain.
    pub fn is_orderable(self) -> bool {
        !matches!(self, FieldType::String | FieldType::Bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: FieldType) -> Self {
        Self {
            name: name.into(),
            typ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Returns the position and definition of a field.
    pub fn find(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    pub fn block_types(&self) -> Vec<BlockType> {
        self.fields.iter().map(|f| f.typ.block_type()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Ordered index over one integer or float field.
    Int,
    /// Hash of one field.
    Hash,
    /// Hash over several fields.
    Composite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub kind: IndexKind,
    /// Indexed source fields, in key order.
    pub fields: Vec<String>,
    /// Source field holding the row id.
    pub row_id: String,
}

impl IndexSchema {
    pub fn new(
        name: impl Into<String>,
        kind: IndexKind,
        fields: &[&str],
        row_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            row_id: row_id.into(),
        }
    }

    /// Checks the index definition against its table.
    pub fn validate(&self, table: &Schema) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidSchema("index name is empty".into()));
        }
        match (self.kind, self.fields.len()) {
            (IndexKind::Int | IndexKind::Hash, 1) => {}
            (IndexKind::Composite, n) if n >= 2 => {}
            (kind, n) => {
                return Err(Error::InvalidSchema(format!(
                    "{kind:?} index {} cannot have {n} fields",
                    self.name
                )))
            }
        }
        for name in &self.fields {
            let (_, field) = table.find(name).ok_or_else(|| {
                Error::InvalidSchema(format!("field {name} not in table {}", table.name))
            })?;
            if self.kind == IndexKind::Int && !field.typ.is_orderable() {
                return Err(Error::InvalidSchema(format!(
                    "field {name} of type {:?} cannot back an ordered index",
                    field.typ
                )));
            }
        }
        match table.find(&self.row_id) {
            Some((_, f)) if f.typ == FieldType::Uint64 => Ok(()),
            Some((_, f)) => Err(Error::InvalidSchema(format!(
                "row id field {} must be Uint64, found {:?}",
                self.row_id, f.typ
            ))),
            None => Err(Error::InvalidSchema(format!(
                "row id field {} not in table {}",
                self.row_id, table.name
            ))),
        }
    }
}

/// A literal used in filter conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Range(Box<Value>, Box<Value>),
}

fn out_of_range(v: &Value, typ: FieldType) -> Error {
    Error::InvalidValue(format!("{v:?} does not fit {typ:?}"))
}

impl Value {
    pub fn range(from: Value, to: Value) -> Self {
        Value::Range(Box::new(from), Box::new(to))
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Uint(u) => Some(*u as i128),
            Value::Int(i) => Some(*i as i128),
            Value::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Uint(u) => Some(*u as f64),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn int_in(&self, typ: FieldType, min: i128, max: i128) -> Result<i128> {
        match self.as_i128() {
            Some(i) if (min..=max).contains(&i) => Ok(i),
            _ => Err(out_of_range(self, typ)),
        }
    }

    /// Maps the literal into the u64 key domain of an ordered index on a
    /// field of type `typ`. Matches the mapping applied to column values.
    pub fn order_key(&self, typ: FieldType) -> Result<u64> {
        Ok(match typ {
            FieldType::Uint64 => self.int_in(typ, 0, u64::MAX as i128)? as u64,
            FieldType::Uint32 => self.int_in(typ, 0, u32::MAX as i128)? as u64,
            FieldType::Uint16 => self.int_in(typ, 0, u16::MAX as i128)? as u64,
            FieldType::Uint8 => self.int_in(typ, 0, u8::MAX as i128)? as u64,
            FieldType::Int64 => order_i64(self.int_in(typ, i64::MIN as i128, i64::MAX as i128)? as i64),
            FieldType::Int32 => order_i64(self.int_in(typ, i32::MIN as i128, i32::MAX as i128)? as i64),
            FieldType::Int16 => order_i64(self.int_in(typ, i16::MIN as i128, i16::MAX as i128)? as i64),
            FieldType::Int8 => order_i64(self.int_in(typ, i8::MIN as i128, i8::MAX as i128)? as i64),
            FieldType::Float64 => order_f64(self.as_f64().ok_or_else(|| out_of_range(self, typ))?),
            FieldType::Float32 => {
                let f = self.as_f64().ok_or_else(|| out_of_range(self, typ))?;
                order_f64(f as f32 as f64)
            }
            FieldType::Boolean => match self {
                Value::Bool(b) => *b as u64,
                _ => return Err(out_of_range(self, typ)),
            },
            FieldType::String | FieldType::Bytes => {
                return Err(Error::InvalidValue(format!("{typ:?} has no key order")))
            }
        })
    }

    /// Appends the literal's wire encoding as a value of type `typ`.
    /// Produces the same bytes as the column block of that type.
    pub fn write_wire(&self, typ: FieldType, buf: &mut Vec<u8>) -> Result<()> {
        match typ {
            FieldType::Uint64 => buf.write_u64::<LittleEndian>(self.int_in(typ, 0, u64::MAX as i128)? as u64)?,
            FieldType::Uint32 => buf.write_u32::<LittleEndian>(self.int_in(typ, 0, u32::MAX as i128)? as u32)?,
            FieldType::Uint16 => buf.write_u16::<LittleEndian>(self.int_in(typ, 0, u16::MAX as i128)? as u16)?,
            FieldType::Uint8 => buf.push(self.int_in(typ, 0, u8::MAX as i128)? as u8),
            FieldType::Int64 => buf.write_i64::<LittleEndian>(self.int_in(typ, i64::MIN as i128, i64::MAX as i128)? as i64)?,
            FieldType::Int32 => buf.write_i32::<LittleEndian>(self.int_in(typ, i32::MIN as i128, i32::MAX as i128)? as i32)?,
            FieldType::Int16 => buf.write_i16::<LittleEndian>(self.int_in(typ, i16::MIN as i128, i16::MAX as i128)? as i16)?,
            FieldType::Int8 => buf.write_i8(self.int_in(typ, i8::MIN as i128, i8::MAX as i128)? as i8)?,
            FieldType::Float64 => buf.write_f64::<LittleEndian>(self.as_f64().ok_or_else(|| out_of_range(self, typ))?)?,
            FieldType::Float32 => buf.write_f32::<LittleEndian>(self.as_f64().ok_or_else(|| out_of_range(self, typ))? as f32)?,
            FieldType::Boolean => match self {
                Value::Bool(b) => buf.push(*b as u8),
                _ => return Err(out_of_range(self, typ)),
            },
            FieldType::String | FieldType::Bytes => {
                let bytes: &[u8] = match self {
                    Value::String(s) => s.as_bytes(),
                    Value::Bytes(b) => b.as_slice(),
                    _ => return Err(out_of_range(self, typ)),
                };
                buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
                buf.extend_from_slice(bytes);
            }
        }
        Ok(())
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    u64 => Uint,
    u32 => Uint,
    i64 => Int,
    i32 => Int,
    f64 => Float,
    bool => Bool,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::Block;

    fn table() -> Schema {
        Schema::new(
            "accounts",
            vec![
                Field::new("id", FieldType::Uint64),
                Field::new("balance", FieldType::Int64),
                Field::new("name", FieldType::String),
                Field::new("region", FieldType::Uint16),
            ],
        )
    }

    #[test]
    fn test_index_schema_validation() {
        let t = table();
        assert!(IndexSchema::new("i", IndexKind::Int, &["balance"], "id").validate(&t).is_ok());
        assert!(IndexSchema::new("h", IndexKind::Hash, &["name"], "id").validate(&t).is_ok());
        assert!(IndexSchema::new("c", IndexKind::Composite, &["name", "region"], "id")
            .validate(&t)
            .is_ok());

        assert!(IndexSchema::new("i", IndexKind::Int, &["name"], "id").validate(&t).is_err());
        assert!(IndexSchema::new("c", IndexKind::Composite, &["name"], "id").validate(&t).is_err());
        assert!(IndexSchema::new("h", IndexKind::Hash, &["missing"], "id").validate(&t).is_err());
        assert!(IndexSchema::new("h", IndexKind::Hash, &["name"], "balance").validate(&t).is_err());
    }

    #[test]
    fn test_wire_matches_block_encoding() {
        let mut from_value = Vec::new();
        Value::Int(-7).write_wire(FieldType::Int32, &mut from_value).unwrap();
        let mut from_block = Vec::new();
        Block::I32(vec![-7]).write_wire(0, &mut from_block).unwrap();
        assert_eq!(from_value, from_block);

        let mut from_value = Vec::new();
        Value::String("abc".into()).write_wire(FieldType::String, &mut from_value).unwrap();
        let mut from_block = Vec::new();
        Block::Bytes(vec![b"abc".to_vec()]).write_wire(0, &mut from_block).unwrap();
        assert_eq!(from_value, from_block);
    }

    #[test]
    fn test_casts_reject_lossy_values() {
        let mut buf = Vec::new();
        assert!(Value::Int(-1).write_wire(FieldType::Uint64, &mut buf).is_err());
        assert!(Value::Uint(300).order_key(FieldType::Uint8).is_err());
        assert!(Value::String("x".into()).order_key(FieldType::Int64).is_err());
        assert_eq!(Value::Uint(5).order_key(FieldType::Int64).unwrap(), order_i64(5));
    }
}
