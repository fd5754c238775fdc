// src/marshal/mod.rs
//! Conversion between host data and script [`Value`](crate::Value)s
//!
//! Host → script goes through [`to_value`], which accepts anything that
//! implements `Serialize`. Script → host goes through [`from_value`], which
//! produces anything that implements `Deserialize`. Both report failures as
//! [`ArgumentError`].
//!
//! Host structs that should be shared with a script by reference rather than
//! copied implement [`Record`], usually through the [`record!`](crate::record)
//! macro.

pub mod de;
pub mod probe;
pub mod record;
pub mod ser;

pub use de::from_value;
pub use record::{Arg, Record};
pub use ser::to_value;

use crate::ArgumentError;
use std::fmt::Display;

impl serde::ser::Error for ArgumentError {
    fn custom<T: Display>(msg: T) -> Self {
        ArgumentError::custom(msg)
    }
}

impl serde::de::Error for ArgumentError {
    fn custom<T: Display>(msg: T) -> Self {
        ArgumentError::custom(msg)
    }

    fn invalid_type(unexp: serde::de::Unexpected, exp: &dyn serde::de::Expected) -> Self {
        ArgumentError::mismatch(exp.to_string(), unexp.to_string())
    }

    fn invalid_value(unexp: serde::de::Unexpected, exp: &dyn serde::de::Expected) -> Self {
        ArgumentError::mismatch(exp.to_string(), unexp.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        ArgumentError::mismatch(format!("field '{}'", field), "nil")
    }
}
