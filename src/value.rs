// src/value.rs
//! Values that cross the boundary between the host and a script

use ahash::HashMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// Type tag of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Nil,
    Bool,
    Number,
    String,
    Table,
}

impl Type {
    /// Name of the type as scripts see it (`type(v)`)
    pub fn name(&self) -> &'static str {
        match self {
            Type::Nil => "nil",
            Type::Bool => "boolean",
            Type::Number => "number",
            Type::String => "string",
            Type::Table => "table",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value passed to or returned from a script
///
/// Values handed to the host are owned snapshots: a table returned by a
/// script is copied out of the VM and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Table(Table),
}

impl Value {
    /// Type tag of this value
    pub fn kind(&self) -> Type {
        match self {
            Value::Nil => Type::Nil,
            Value::Bool(_) => Type::Bool,
            Value::Number(_) => Type::Number,
            Value::String(_) => Type::String,
            Value::Table(_) => Type::Table,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Lua truthiness: everything except `nil` and `false` is true
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::Table(_) => f.write_str("table"),
        }
    }
}

/// Ordered key/value collection returned to the host
///
/// Entries keep the order in which they were inserted. Keys are unique and
/// never nil or NaN.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
    // Positions of string and number keys; other keys are found by scan
    strings: HashMap<String, usize>,
    numbers: HashMap<u64, usize>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// Hash slot for a number key; `-0.0` and `0.0` share one
fn number_bits(n: f64) -> u64 {
    (n + 0.0).to_bits()
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry, keeping the position of an existing key
    ///
    /// Returns the previous value for the key, if any. Inserting `nil`
    /// removes the key, as assignment does in a script. A nil or NaN key
    /// can never be stored, so inserting one does nothing and returns `None`.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) if value.is_nil() => {
                match &key {
                    Value::String(s) => {
                        self.strings.remove(s.as_str());
                    }
                    Value::Number(n) => {
                        self.numbers.remove(&number_bits(*n));
                    }
                    _ => {}
                }
                let (_, old) = self.entries.remove(i);
                self.reindex(i);
                Some(old)
            }
            Some(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None if value.is_nil() || !Self::storable(&key) => None,
            None => {
                self.push_unique(key, value);
                None
            }
        }
    }

    /// Append an entry whose key is known to be absent
    pub(crate) fn push_unique(&mut self, key: Value, value: Value) {
        let at = self.entries.len();
        self.index(&key, at);
        self.entries.push((key, value));
    }

    /// Look up a string key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.strings.get(key).map(|&i| &self.entries[i].1)
    }

    /// Look up an arbitrary key
    pub fn get_key(&self, key: &Value) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    /// Look up a 1-based sequence index
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.get_key(&Value::Number(index as f64))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// True when the keys are exactly `1..=len` (in any order)
    pub fn is_sequence(&self) -> bool {
        let len = self.entries.len();
        self.entries.iter().all(|(k, _)| match k {
            Value::Number(n) => n.fract() == 0.0 && *n >= 1.0 && *n <= len as f64,
            _ => false,
        })
    }

    /// Values ordered by sequence index, or the table back when it is not
    /// a sequence
    pub fn into_sequence(self) -> Result<Vec<Value>, Table> {
        if !self.is_sequence() {
            return Err(self);
        }
        let mut slots: Vec<Value> = vec![Value::Nil; self.entries.len()];
        for (k, v) in self.entries {
            if let Value::Number(n) = k {
                slots[n as usize - 1] = v;
            }
        }
        Ok(slots)
    }

    fn storable(key: &Value) -> bool {
        match key {
            Value::Nil => false,
            Value::Number(n) => !n.is_nan(),
            _ => true,
        }
    }

    fn position(&self, key: &Value) -> Option<usize> {
        match key {
            Value::String(s) => self.strings.get(s.as_str()).copied(),
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) => self.numbers.get(&number_bits(*n)).copied(),
            _ => self.entries.iter().position(|(k, _)| k == key),
        }
    }

    fn index(&mut self, key: &Value, at: usize) {
        match key {
            Value::String(s) => {
                self.strings.insert(s.clone(), at);
            }
            Value::Number(n) => {
                self.numbers.insert(number_bits(*n), at);
            }
            _ => {}
        }
    }

    /// Shift the positions of every entry from `from` onwards after a
    /// removal moved them down by one
    fn reindex(&mut self, from: usize) {
        for (at, (key, _)) in self.entries.iter().enumerate().skip(from) {
            let slot = match key {
                Value::String(s) => self.strings.get_mut(s.as_str()),
                Value::Number(n) => self.numbers.get_mut(&number_bits(*n)),
                _ => None,
            };
            if let Some(slot) = slot {
                *slot = at;
            }
        }
    }
}

impl FromIterator<(Value, Value)> for Table {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

impl IntoIterator for Table {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Table(t) => t.serialize(serializer),
        }
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_sequence() {
            let mut ordered: Vec<(usize, &Value)> = self
                .entries
                .iter()
                .filter_map(|(k, v)| k.as_number().map(|n| (n as usize, v)))
                .collect();
            ordered.sort_by_key(|(i, _)| *i);

            let mut seq = serializer.serialize_seq(Some(ordered.len()))?;
            for (_, v) in ordered {
                seq.serialize_element(v)?;
            }
            seq.end()
        } else {
            let mut map = serializer.serialize_map(Some(self.entries.len()))?;
            for (k, v) in &self.entries {
                map.serialize_entry(&k.to_string(), v)?;
            }
            map.end()
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

impl<'de> Deserialize<'de> for Table {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(TableVisitor)
    }
}

struct TableVisitor;

impl<'de> Visitor<'de> for TableVisitor {
    type Value = Table;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a table")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Table, A::Error> {
        match ValueVisitor.visit_seq(seq)? {
            Value::Table(table) => Ok(table),
            _ => Ok(Table::new()),
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Table, A::Error> {
        match ValueVisitor.visit_map(map)? {
            Value::Table(table) => Ok(table),
            _ => Ok(Table::new()),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any script value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut table = Table::with_capacity(seq.size_hint().unwrap_or(0));
        let mut index = 0usize;
        while let Some(v) = seq.next_element::<Value>()? {
            index += 1;
            table.insert(Value::Number(index as f64), v);
        }
        Ok(Value::Table(table))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut table = Table::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry::<Value, Value>()? {
            table.insert(k, v);
        }
        Ok(Value::Table(table))
    }
}

// Convenient conversions
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

impl_from_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Table(
            v.into_iter()
                .enumerate()
                .map(|(i, x)| (Value::Number((i + 1) as f64), x.into()))
                .collect(),
        )
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Nil,
        }
    }
}
