// src/marshal/record.rs
//! Host structs shared with a script by reference

use crate::value::{Table, Value};
use crate::ArgumentError;
use serde::Serialize;

/// A host struct whose fields a script can read and write in place
///
/// A record passed to [`Script::run`](crate::Script::run) through
/// [`Arg::Record`] appears in the script as a table-like proxy: `p.Name`
/// calls [`get_field`](Record::get_field) and `p.Name = v` calls
/// [`set_field`](Record::set_field) on the host value for the duration of
/// the run.
///
/// Implement it with the [`record!`](crate::record) macro.
pub trait Record {
    /// Names of the fields visible to scripts, in iteration order
    fn fields(&self) -> &'static [&'static str];

    /// Current value of a field, `None` when the record has no such field
    fn get_field(&self, name: &str) -> Result<Option<Value>, ArgumentError>;

    /// Store a value into a field, `false` when the record has no such field
    fn set_field(&mut self, name: &str, value: Value) -> Result<bool, ArgumentError>;

    /// Copy every field into a plain table
    fn snapshot(&self) -> Result<Table, ArgumentError> {
        let mut table = Table::with_capacity(self.fields().len());
        for name in self.fields() {
            if let Some(value) = self.get_field(name)? {
                table.insert(*name, value);
            }
        }
        Ok(table)
    }
}

/// Implement [`Record`] for a struct from a `"ScriptName" => field` list
///
/// Every listed field must implement `Serialize` and `DeserializeOwned`.
///
/// ```rust
/// use hostlua::{record, Record, Value};
///
/// struct Account {
///     owner: String,
///     balance: f64,
/// }
///
/// record!(Account { "Owner" => owner, "Balance" => balance });
///
/// let mut account = Account { owner: "ada".into(), balance: 10.0 };
/// assert_eq!(account.get_field("Owner").unwrap(), Some(Value::from("ada")));
/// assert!(account.set_field("Balance", Value::Number(12.5)).unwrap());
/// assert_eq!(account.balance, 12.5);
/// ```
#[macro_export]
macro_rules! record {
    ($name:ident { $($key:literal => $field:ident),* $(,)? }) => {
        impl $crate::Record for $name {
            fn fields(&self) -> &'static [&'static str] {
                &[$($key),*]
            }

            fn get_field(
                &self,
                name: &str,
            ) -> ::std::result::Result<::std::option::Option<$crate::Value>, $crate::ArgumentError> {
                match name {
                    $($key => $crate::to_value(&self.$field).map(::std::option::Option::Some),)*
                    _ => ::std::result::Result::Ok(::std::option::Option::None),
                }
            }

            fn set_field(
                &mut self,
                name: &str,
                value: $crate::Value,
            ) -> ::std::result::Result<bool, $crate::ArgumentError> {
                match name {
                    $($key => {
                        self.$field = $crate::from_value(value)?;
                        ::std::result::Result::Ok(true)
                    })*
                    _ => ::std::result::Result::Ok(false),
                }
            }
        }
    };
}

/// One argument passed to a script's `main`
pub enum Arg<'a> {
    /// Deep copy of a host value
    Value(Value),
    /// Mutable reference to a host record, shared for the run
    Record(&'a mut (dyn Record + 'a)),
}

impl<'a> Arg<'a> {
    /// Marshal any serializable host value into a copied argument
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, ArgumentError> {
        crate::to_value(value).map(Arg::Value)
    }
}

impl std::fmt::Debug for Arg<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Record(r) => f.debug_tuple("Record").field(&r.fields()).finish(),
        }
    }
}

impl<'a, R: Record + 'a> From<&'a mut R> for Arg<'a> {
    fn from(record: &'a mut R) -> Self {
        Arg::Record(record)
    }
}

macro_rules! impl_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg<'_> {
                fn from(v: $ty) -> Self {
                    Arg::Value(Value::from(v))
                }
            }
        )*
    };
}

impl_arg_from!(
    bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String, Table, Value, ()
);

impl From<&str> for Arg<'_> {
    fn from(v: &str) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Arg<'_> {
    fn from(v: Option<T>) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Arg<'_> {
    fn from(v: Vec<T>) -> Self {
        Arg::Value(Value::from(v))
    }
}

/// Build the argument list for [`Script::run`](crate::Script::run)
///
/// Each element goes through `Arg::from`: scalars, strings, `Value`s and
/// tables are copied, `&mut record` is shared by reference.
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Arg<'_>>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Arg::from($arg)),+]
    };
}
