// src/marshal/de.rs
//! Script → host conversion built on `serde::Deserialize`
//!
//! Conversions are strict. A number only fills an integer destination when
//! it is integral and in range, and `nil` only fills `Option`, `()` and unit
//! structs.

use crate::value::{Table, Value};
use crate::ArgumentError;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, VariantAccess, Visitor,
};

/// Convert a [`Value`] into any deserializable host type
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ArgumentError> {
    T::deserialize(value)
}

/// Short description of a value for error messages
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Number(n) if n.fract() != 0.0 => format!("number {}", n),
        other => other.kind().name().to_string(),
    }
}

fn mismatch(expected: &str, value: &Value) -> ArgumentError {
    ArgumentError::mismatch(expected, describe(value))
}

macro_rules! deserialize_integer {
    ($($method:ident => $ty:ty, $visit:ident;)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
                match self {
                    Value::Number(n) => {
                        if n.fract() != 0.0 || !n.is_finite() {
                            return Err(ArgumentError::mismatch(
                                concat!("integer (", stringify!($ty), ")"),
                                format!("number {}", n),
                            ));
                        }
                        // MAX + 1 is a power of two, exact as f64 even where
                        // MAX itself rounds up to it
                        if n < <$ty>::MIN as f64 || n >= <$ty>::MAX as f64 + 1.0 {
                            return Err(ArgumentError::mismatch(
                                concat!("integer (", stringify!($ty), ")"),
                                format!("out of range number {}", n),
                            ));
                        }
                        visitor.$visit(n as $ty)
                    }
                    other => Err(mismatch("number", &other)),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for Value {
    type Error = ArgumentError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Nil => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    visitor.visit_i64(n as i64)
                } else {
                    visitor.visit_f64(n)
                }
            }
            Value::String(s) => visitor.visit_string(s),
            Value::Table(t) => {
                if !t.is_empty() && t.is_sequence() {
                    visit_sequence(t, visitor)
                } else {
                    visit_table(t, visitor)
                }
            }
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Bool(b) => visitor.visit_bool(b),
            other => Err(mismatch("boolean", &other)),
        }
    }

    deserialize_integer! {
        deserialize_i8 => i8, visit_i8;
        deserialize_i16 => i16, visit_i16;
        deserialize_i32 => i32, visit_i32;
        deserialize_i64 => i64, visit_i64;
        deserialize_u8 => u8, visit_u8;
        deserialize_u16 => u16, visit_u16;
        deserialize_u32 => u32, visit_u32;
        deserialize_u64 => u64, visit_u64;
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            // Finite values keep the nearest f32; only overflow is refused
            Value::Number(n) if n.is_finite() && n.abs() > f32::MAX as f64 => Err(
                ArgumentError::mismatch("number (f32)", format!("out of range number {}", n)),
            ),
            Value::Number(n) => visitor.visit_f32(n as f32),
            other => Err(mismatch("number", &other)),
        }
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Number(n) => visitor.visit_f64(n),
            other => Err(mismatch("number", &other)),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::String(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => visitor.visit_char(c),
                    _ => Err(ArgumentError::mismatch(
                        "single character",
                        format!("string of length {}", s.chars().count()),
                    )),
                }
            }
            other => Err(mismatch("string", &other)),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::String(s) => visitor.visit_string(s),
            other => Err(mismatch("string", &other)),
        }
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::String(s) => visitor.visit_byte_buf(s.into_bytes()),
            Value::Table(t) => visit_sequence(t, visitor),
            other => Err(mismatch("string", &other)),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Nil => visitor.visit_none(),
            other => visitor.visit_some(other),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Nil => visitor.visit_unit(),
            other => Err(mismatch("nil", &other)),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Table(t) => visit_sequence(t, visitor),
            other => Err(mismatch("table", &other)),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ArgumentError> {
        match self {
            Value::Table(t) => visit_table(t, visitor),
            other => Err(mismatch("table", &other)),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        match self {
            Value::String(variant) => visitor.visit_enum(VariantDeserializer {
                variant,
                payload: None,
            }),
            Value::Table(t) if t.len() == 1 => {
                let mut entries = t.into_iter();
                match entries.next() {
                    Some((Value::String(variant), payload)) => {
                        visitor.visit_enum(VariantDeserializer {
                            variant,
                            payload: Some(payload),
                        })
                    }
                    _ => Err(ArgumentError::mismatch("variant name", "non-string key")),
                }
            }
            other => Err(mismatch("enum variant", &other)),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        match self {
            Value::String(s) => visitor.visit_string(s),
            Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => visitor.visit_u64(n as u64),
            other => Err(mismatch("field name", &other)),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        visitor.visit_unit()
    }
}

impl<'de> IntoDeserializer<'de, ArgumentError> for Value {
    type Deserializer = Value;

    fn into_deserializer(self) -> Value {
        self
    }
}

fn visit_sequence<'de, V: Visitor<'de>>(table: Table, visitor: V) -> Result<V::Value, ArgumentError> {
    let items = table
        .into_sequence()
        .map_err(|_| ArgumentError::mismatch("sequence", "table with non-sequence keys"))?;
    let mut seq = SeqDeserializer::<_, ArgumentError>::new(items.into_iter());
    let value = visitor.visit_seq(&mut seq)?;
    seq.end()?;
    Ok(value)
}

fn visit_table<'de, V: Visitor<'de>>(table: Table, visitor: V) -> Result<V::Value, ArgumentError> {
    let mut map = MapDeserializer::<_, ArgumentError>::new(table.into_iter());
    let value = visitor.visit_map(&mut map)?;
    map.end()?;
    Ok(value)
}

struct VariantDeserializer {
    variant: String,
    payload: Option<Value>,
}

impl<'de> EnumAccess<'de> for VariantDeserializer {
    type Error = ArgumentError;
    type Variant = VariantPayload;

    fn variant_seed<S: DeserializeSeed<'de>>(
        self,
        seed: S,
    ) -> Result<(S::Value, VariantPayload), ArgumentError> {
        let variant = seed.deserialize(Value::String(self.variant))?;
        Ok((variant, VariantPayload(self.payload)))
    }
}

struct VariantPayload(Option<Value>);

impl<'de> VariantAccess<'de> for VariantPayload {
    type Error = ArgumentError;

    fn unit_variant(self) -> Result<(), ArgumentError> {
        match self.0 {
            None | Some(Value::Nil) => Ok(()),
            Some(other) => Err(mismatch("unit variant", &other)),
        }
    }

    fn newtype_variant_seed<S: DeserializeSeed<'de>>(
        self,
        seed: S,
    ) -> Result<S::Value, ArgumentError> {
        seed.deserialize(self.0.unwrap_or_default())
    }

    fn tuple_variant<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        de::Deserializer::deserialize_seq(self.0.unwrap_or_default(), visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, ArgumentError> {
        de::Deserializer::deserialize_map(self.0.unwrap_or_default(), visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::to_value;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Age")]
        age: u32,
        tags: Vec<String>,
        nickname: Option<String>,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Point,
        Circle(f64),
        Rect { w: f64, h: f64 },
    }

    #[test]
    fn test_struct_round_trip() {
        let person = Person {
            name: "Roman".into(),
            age: 15,
            tags: vec!["a".into(), "b".into()],
            nickname: None,
        };
        let value = to_value(&person).unwrap();
        let back: Person = from_value(value).unwrap();
        assert_eq!(back, person);
    }

    #[test]
    fn test_strict_integers() {
        assert_eq!(from_value::<i32>(Value::Number(42.0)).unwrap(), 42);

        let err = from_value::<i32>(Value::Number(1.5)).unwrap_err();
        assert_eq!(err.actual, "number 1.5");

        assert!(from_value::<u8>(Value::Number(300.0)).is_err());
        assert!(from_value::<u32>(Value::Number(-1.0)).is_err());
        assert_eq!(from_value::<f64>(Value::Number(1.5)).unwrap(), 1.5);
    }

    #[test]
    fn test_integer_bounds_are_exact() {
        let two_63 = 2f64.powi(63);
        let two_64 = 2f64.powi(64);

        let err = from_value::<i64>(Value::Number(two_63)).unwrap_err();
        assert_eq!(err.expected, "integer (i64)");
        assert!(err.actual.starts_with("out of range number"));
        assert_eq!(from_value::<i64>(Value::Number(-two_63)).unwrap(), i64::MIN);
        assert!(from_value::<i64>(Value::Number(-two_63 - 4096.0)).is_err());

        assert!(from_value::<u64>(Value::Number(two_64)).is_err());
        assert!(from_value::<usize>(Value::Number(two_64)).is_err());
        assert_eq!(
            from_value::<u64>(Value::Number(two_64 - 2048.0)).unwrap(),
            u64::MAX - 2047
        );

        assert_eq!(from_value::<i8>(Value::Number(127.0)).unwrap(), 127);
        assert!(from_value::<i8>(Value::Number(128.0)).is_err());
        assert_eq!(from_value::<u32>(Value::Number(4_294_967_295.0)).unwrap(), u32::MAX);
        assert!(from_value::<u32>(Value::Number(4_294_967_296.0)).is_err());
    }

    #[test]
    fn test_f32_range() {
        assert_eq!(from_value::<f32>(Value::Number(1.5)).unwrap(), 1.5);
        assert_eq!(from_value::<f32>(Value::Number(0.1)).unwrap(), 0.1f32);
        assert_eq!(
            from_value::<f32>(Value::Number(f64::INFINITY)).unwrap(),
            f32::INFINITY
        );

        let err = from_value::<f32>(Value::Number(1e39)).unwrap_err();
        assert_eq!(err.expected, "number (f32)");
        assert!(from_value::<f32>(Value::Number(-1e300)).is_err());
    }

    #[test]
    fn test_type_mismatches() {
        let err = from_value::<String>(Value::Number(1.0)).unwrap_err();
        assert_eq!(err.expected, "string");
        assert_eq!(err.actual, "number");

        let err = from_value::<bool>(Value::Nil).unwrap_err();
        assert_eq!(err.actual, "nil");

        assert!(from_value::<String>(Value::Nil).is_err());
        assert_eq!(from_value::<Option<String>>(Value::Nil).unwrap(), None);
        assert_eq!(from_value::<()>(Value::Nil).unwrap(), ());
    }

    #[test]
    fn test_char() {
        assert_eq!(from_value::<char>(Value::from("x")).unwrap(), 'x');
        assert!(from_value::<char>(Value::from("xy")).is_err());
    }

    #[test]
    fn test_maps_and_sequences() {
        let mut table = Table::new();
        table.insert("one", 1);
        table.insert("two", 2);
        let map: HashMap<String, i64> = from_value(Value::Table(table)).unwrap();
        assert_eq!(map["two"], 2);

        let list: Vec<i32> = from_value(Value::from(vec![3, 4, 5])).unwrap();
        assert_eq!(list, vec![3, 4, 5]);

        let empty: Vec<i32> = from_value(Value::Table(Table::new())).unwrap();
        assert!(empty.is_empty());

        let mut sparse = Table::new();
        sparse.insert(1, 1);
        sparse.insert(5, 5);
        assert!(from_value::<Vec<i32>>(Value::Table(sparse)).is_err());
    }

    #[test]
    fn test_enums() {
        for shape in [Shape::Point, Shape::Circle(1.0), Shape::Rect { w: 1.0, h: 2.0 }] {
            let value = to_value(&shape).unwrap();
            assert_eq!(from_value::<Shape>(value).unwrap(), shape);
        }
    }

    #[test]
    fn test_value_passthrough() {
        let value = Value::from(vec!["x"]);
        assert_eq!(from_value::<Value>(value.clone()).unwrap(), value);
        assert_eq!(from_value::<Value>(Value::Number(2.5)).unwrap(), Value::Number(2.5));
    }
}
