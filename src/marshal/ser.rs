// src/marshal/ser.rs
//! Host → script conversion built on `serde::Serialize`

use crate::value::{Table, Value};
use crate::ArgumentError;
use serde::ser::{self, Serialize};
use std::cmp::Ordering;

/// Convert any serializable host value into a [`Value`]
///
/// Structs become tables keyed by field name in declaration order, sequences
/// and tuples become tables keyed `1..n`, and maps become tables whose
/// entries are sorted by key so the result does not depend on the host's
/// iteration order.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, ArgumentError> {
    value.serialize(ValueSerializer)
}

/// Serializer whose output is a [`Value`]
pub struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = ArgumentError;

    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantBuilder<SeqBuilder>;
    type SerializeMap = MapBuilder;
    type SerializeStruct = StructBuilder;
    type SerializeStructVariant = VariantBuilder<StructBuilder>;

    fn serialize_bool(self, v: bool) -> Result<Value, ArgumentError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_i16(self, v: i16) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_i32(self, v: i32) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_i64(self, v: i64) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_u8(self, v: u8) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_u16(self, v: u16) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_u32(self, v: u32) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_u64(self, v: u64) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_f32(self, v: f32) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v as f64))
    }

    fn serialize_f64(self, v: f64) -> Result<Value, ArgumentError> {
        Ok(Value::Number(v))
    }

    fn serialize_char(self, v: char) -> Result<Value, ArgumentError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value, ArgumentError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, ArgumentError> {
        Ok(Value::from(v.to_vec()))
    }

    fn serialize_none(self) -> Result<Value, ArgumentError> {
        Ok(Value::Nil)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, ArgumentError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, ArgumentError> {
        Ok(Value::Nil)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, ArgumentError> {
        Ok(Value::Nil)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Value, ArgumentError> {
        Ok(Value::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, ArgumentError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, ArgumentError> {
        let mut table = Table::with_capacity(1);
        table.insert(variant, to_value(value)?);
        Ok(Value::Table(table))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, ArgumentError> {
        Ok(SeqBuilder::new(len.unwrap_or(0)))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, ArgumentError> {
        Ok(SeqBuilder::new(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqBuilder, ArgumentError> {
        Ok(SeqBuilder::new(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantBuilder<SeqBuilder>, ArgumentError> {
        Ok(VariantBuilder {
            variant,
            inner: SeqBuilder::new(len),
        })
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapBuilder, ArgumentError> {
        Ok(MapBuilder {
            entries: Vec::with_capacity(len.unwrap_or(0)),
            pending: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<StructBuilder, ArgumentError> {
        Ok(StructBuilder {
            table: Table::with_capacity(len),
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantBuilder<StructBuilder>, ArgumentError> {
        Ok(VariantBuilder {
            variant,
            inner: StructBuilder {
                table: Table::with_capacity(len),
            },
        })
    }
}

pub struct SeqBuilder {
    table: Table,
    next: usize,
}

impl SeqBuilder {
    fn new(len: usize) -> Self {
        Self {
            table: Table::with_capacity(len),
            next: 1,
        }
    }

    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ArgumentError> {
        let value = to_value(value)?;
        self.table.insert(Value::Number(self.next as f64), value);
        self.next += 1;
        Ok(())
    }
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ArgumentError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, ArgumentError> {
        Ok(Value::Table(self.table))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ArgumentError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, ArgumentError> {
        Ok(Value::Table(self.table))
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ArgumentError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, ArgumentError> {
        Ok(Value::Table(self.table))
    }
}

pub struct StructBuilder {
    table: Table,
}

impl ser::SerializeStruct for StructBuilder {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ArgumentError> {
        let value = to_value(value)?;
        self.table.insert(key, value);
        Ok(())
    }

    fn end(self) -> Result<Value, ArgumentError> {
        Ok(Value::Table(self.table))
    }
}

/// Wraps the payload of a tuple or struct variant as `{ Variant = payload }`
pub struct VariantBuilder<B> {
    variant: &'static str,
    inner: B,
}

impl<B> VariantBuilder<B> {
    fn wrap(variant: &'static str, payload: Value) -> Value {
        let mut table = Table::with_capacity(1);
        table.insert(variant, payload);
        Value::Table(table)
    }
}

impl ser::SerializeTupleVariant for VariantBuilder<SeqBuilder> {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ArgumentError> {
        self.inner.push(value)
    }

    fn end(self) -> Result<Value, ArgumentError> {
        Ok(Self::wrap(self.variant, Value::Table(self.inner.table)))
    }
}

impl ser::SerializeStructVariant for VariantBuilder<StructBuilder> {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ArgumentError> {
        ser::SerializeStruct::serialize_field(&mut self.inner, key, value)
    }

    fn end(self) -> Result<Value, ArgumentError> {
        Ok(Self::wrap(self.variant, Value::Table(self.inner.table)))
    }
}

/// Collects map entries, then sorts them by key on `end`
pub struct MapBuilder {
    entries: Vec<(Value, Value)>,
    pending: Option<Value>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = Value;
    type Error = ArgumentError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), ArgumentError> {
        let key = to_value(key)?;
        match &key {
            Value::Nil => return Err(ArgumentError::mismatch("map key", "nil")),
            Value::Number(n) if n.is_nan() => {
                return Err(ArgumentError::mismatch("map key", "NaN"))
            }
            _ => {}
        }
        self.pending = Some(key);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ArgumentError> {
        let key = self
            .pending
            .take()
            .ok_or_else(|| ArgumentError::custom("map value without a key"))?;
        self.entries.push((key, to_value(value)?));
        Ok(())
    }

    fn end(mut self) -> Result<Value, ArgumentError> {
        sort_entries(&mut self.entries);
        Ok(Value::Table(self.entries.into_iter().collect()))
    }
}

/// Deterministic key order: strings ascending when every key is a string,
/// otherwise `false < true < numbers < strings < tables`
pub(crate) fn sort_entries(entries: &mut [(Value, Value)]) {
    if entries.iter().all(|(k, _)| matches!(k, Value::String(_))) {
        entries.sort_by(|(a, _), (b, _)| match (a, b) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => Ordering::Equal,
        });
    } else {
        entries.sort_by(|(a, _), (b, _)| compare_keys(a, b));
    }
}

fn compare_keys(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Table(_) => 4,
        }
    }

    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}
