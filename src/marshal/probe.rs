// src/marshal/probe.rs
//! Shape probe used to validate host function signatures at registration
//!
//! A [`Probe`] is a deserializer that never produces a value. The first
//! `deserialize_*` call made by a type's `Deserialize` impl reveals what
//! shape of [`Value`](crate::Value) the type accepts, and the probe aborts
//! with that answer.

use crate::value::Type;
use serde::de::{self, DeserializeOwned, Visitor};
use std::fmt;

/// Shape of value a parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Any value (`Value` parameters)
    Any,
    Nil,
    Bool,
    Number,
    String,
    Table,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Any => "any",
            Kind::Nil => "nil",
            Kind::Bool => "boolean",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Table => "table",
        };
        f.write_str(name)
    }
}

/// One parameter of a registered host function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Param {
    pub kind: Kind,
    /// `nil` is accepted (an `Option` parameter, `()` or `Value`)
    pub nullable: bool,
}

impl Param {
    /// Whether a value of type `ty` can be handed to this parameter
    pub fn accepts(&self, ty: Type) -> bool {
        match (self.kind, ty) {
            (Kind::Any, _) => true,
            (_, Type::Nil) => self.nullable,
            (Kind::Bool, Type::Bool)
            | (Kind::Number, Type::Number)
            | (Kind::String, Type::String)
            | (Kind::Table, Type::Table) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable && !matches!(self.kind, Kind::Any | Kind::Nil) {
            write!(f, "{}?", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

/// Determine the [`Param`] shape of a deserializable type
///
/// Fails with a reason for types that cannot be built from a script value
/// (raw bytes, enums, bare identifiers).
pub fn probe<T: DeserializeOwned>() -> Result<Param, String> {
    match T::deserialize(Probe { nullable: false }) {
        Err(Outcome::Shape(param)) => Ok(param),
        Err(Outcome::Unsupported(reason)) => Err(reason),
        Err(Outcome::Custom(message)) => Err(message),
        Ok(_) => Err("type accepted a value without inspecting it".to_string()),
    }
}

#[derive(Debug)]
pub enum Outcome {
    Shape(Param),
    Unsupported(String),
    Custom(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Shape(param) => write!(f, "shape {}", param),
            Outcome::Unsupported(reason) | Outcome::Custom(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for Outcome {}

impl de::Error for Outcome {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Outcome::Custom(msg.to_string())
    }
}

pub struct Probe {
    nullable: bool,
}

impl Probe {
    fn found<V>(&self, kind: Kind) -> Result<V, Outcome> {
        Err(Outcome::Shape(Param {
            kind,
            nullable: self.nullable || kind == Kind::Nil,
        }))
    }
}

macro_rules! probe_as {
    ($kind:expr => $($method:ident),*) => {
        $(
            fn $method<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Outcome> {
                self.found($kind)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for Probe {
    type Error = Outcome;

    probe_as!(Kind::Bool => deserialize_bool);
    probe_as!(Kind::Number => deserialize_i8, deserialize_i16, deserialize_i32, deserialize_i64,
        deserialize_u8, deserialize_u16, deserialize_u32, deserialize_u64,
        deserialize_f32, deserialize_f64);
    probe_as!(Kind::String => deserialize_char, deserialize_str, deserialize_string);
    probe_as!(Kind::Nil => deserialize_unit);
    probe_as!(Kind::Table => deserialize_seq, deserialize_map);

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Outcome> {
        Err(Outcome::Shape(Param {
            kind: Kind::Any,
            nullable: true,
        }))
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Outcome> {
        self.deserialize_any(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Outcome> {
        Err(Outcome::Unsupported("raw byte buffers are not marshalable".into()))
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Outcome> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Outcome> {
        Err(Outcome::Unsupported("identifiers are not marshalable".into()))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Outcome> {
        Err(Outcome::Unsupported(format!("enum {} is not marshalable", name)))
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Outcome> {
        visitor.visit_some(Probe { nullable: true })
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _visitor: V,
    ) -> Result<V::Value, Outcome> {
        self.found(Kind::Nil)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Outcome> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, _visitor: V) -> Result<V::Value, Outcome> {
        self.found(Kind::Table)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        _visitor: V,
    ) -> Result<V::Value, Outcome> {
        self.found(Kind::Table)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Outcome> {
        self.found(Kind::Table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Point {
        x: f64,
        y: f64,
    }

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Meters(f64);

    #[derive(Deserialize)]
    #[allow(dead_code)]
    enum Mode {
        Fast,
        Slow,
    }

    fn shape<T: DeserializeOwned>() -> Param {
        probe::<T>().unwrap()
    }

    #[test]
    fn test_scalar_shapes() {
        assert_eq!(shape::<bool>().kind, Kind::Bool);
        assert_eq!(shape::<u16>().kind, Kind::Number);
        assert_eq!(shape::<f32>().kind, Kind::Number);
        assert_eq!(shape::<String>().kind, Kind::String);
        assert_eq!(shape::<char>().kind, Kind::String);
        assert!(!shape::<String>().nullable);
    }

    #[test]
    fn test_composite_shapes() {
        assert_eq!(shape::<Vec<i32>>().kind, Kind::Table);
        assert_eq!(shape::<HashMap<String, i32>>().kind, Kind::Table);
        assert_eq!(shape::<Point>().kind, Kind::Table);
        assert_eq!(shape::<(i32, String)>().kind, Kind::Table);
        assert_eq!(shape::<Meters>().kind, Kind::Number);
    }

    #[test]
    fn test_nullable_shapes() {
        let opt = shape::<Option<i64>>();
        assert_eq!(opt.kind, Kind::Number);
        assert!(opt.nullable);
        assert_eq!(opt.to_string(), "number?");

        let unit = shape::<()>();
        assert_eq!(unit.kind, Kind::Nil);
        assert!(unit.nullable);

        let any = shape::<Value>();
        assert_eq!(any.kind, Kind::Any);
        assert!(any.accepts(Type::Table));
    }

    #[test]
    fn test_unsupported_shapes() {
        assert!(probe::<Mode>().is_err());
        assert!(probe::<serde::de::IgnoredAny>().is_ok());
    }

    #[test]
    fn test_accepts() {
        let number = shape::<f64>();
        assert!(number.accepts(Type::Number));
        assert!(!number.accepts(Type::String));
        assert!(!number.accepts(Type::Nil));
        assert!(shape::<Option<f64>>().accepts(Type::Nil));
    }
}
