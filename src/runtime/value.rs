// src/runtime/value.rs
//! Values as the VM sees them
//!
//! Tables, closures and upvalue cells are shared and mutable, so they live
//! behind `Arc<Mutex<..>>`. A table lock is never held while calling back
//! into the VM.

use crate::compiler::bytecode::Proto;
use crate::module::HostFunction;
use crate::runtime::vm::{GuestError, Machine};
use crate::value::Value;
use ahash::HashMap;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// Shared storage of a captured local
pub type Cell = Arc<Mutex<Val>>;

pub fn new_cell(value: Val) -> Cell {
    Arc::new(Mutex::new(value))
}

/// Dynamic value inside the VM
#[derive(Clone, Default)]
pub enum Val {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    Str(Arc<str>),
    Table(TableRef),
    Function(Function),
    /// Proxy for a host record bound to the current run
    Record(RecordHandle),
}

impl Val {
    pub fn str(s: &str) -> Val {
        Val::Str(Arc::from(s))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Val::Nil)
    }

    /// Everything except `nil` and `false` is true
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Val::Nil | Val::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Nil => "nil",
            Val::Bool(_) => "boolean",
            Val::Number(_) => "number",
            Val::Str(_) => "string",
            Val::Table(_) | Val::Record(_) => "table",
            Val::Function(_) => "function",
        }
    }

    /// Number value, converting numeric strings
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Val::Number(n) => Some(*n),
            Val::Str(s) => parse_number(s),
            _ => None,
        }
    }

    /// String value, converting numbers
    pub fn to_str(&self) -> Option<Arc<str>> {
        match self {
            Val::Str(s) => Some(Arc::clone(s)),
            Val::Number(n) => Some(Arc::from(fmt_number(*n).as_str())),
            _ => None,
        }
    }

    /// Primitive equality: by value for scalars and strings, by identity
    /// for everything else
    pub fn raw_equal(&self, other: &Val) -> bool {
        match (self, other) {
            (Val::Nil, Val::Nil) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Number(a), Val::Number(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Table(a), Val::Table(b)) => a.ptr_eq(b),
            (Val::Function(a), Val::Function(b)) => a.identity() == b.identity(),
            (Val::Record(a), Val::Record(b)) => a == b,
            _ => false,
        }
    }

    /// Convert a host value into a fresh VM value
    pub fn import(value: Value) -> Val {
        match value {
            Value::Nil => Val::Nil,
            Value::Bool(b) => Val::Bool(b),
            Value::Number(n) => Val::Number(n),
            Value::String(s) => Val::Str(Arc::from(s)),
            Value::Table(table) => {
                let mut data = TableData::default();
                for (k, v) in table {
                    // `Table::insert` refuses nil and NaN keys, the only
                    // keys `set` rejects
                    let stored = data.set(Val::import(k), Val::import(v));
                    debug_assert!(stored.is_ok(), "host table held an invalid key");
                }
                Val::Table(TableRef::from_data(data))
            }
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nil => f.write_str("nil"),
            Val::Bool(b) => write!(f, "{}", b),
            Val::Number(n) => f.write_str(&fmt_number(*n)),
            Val::Str(s) => f.write_str(s),
            Val::Table(t) => write!(f, "table: {:#x}", t.ptr()),
            Val::Function(func) => match func {
                Function::Builtin(b) => write!(f, "function: builtin: {}", b.name),
                other => write!(f, "function: {:#x}", other.identity()),
            },
            Val::Record(handle) => write!(f, "table: record #{}", handle.slot + 1),
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Str(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

/// Identifies a record argument of one particular run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    pub run: u64,
    pub slot: usize,
}

#[derive(Clone)]
pub enum Function {
    Lua(Arc<Closure>),
    Builtin(Builtin),
    Host(Arc<HostFunction>),
}

impl Function {
    fn identity(&self) -> usize {
        match self {
            Function::Lua(c) => Arc::as_ptr(c) as usize,
            Function::Builtin(b) => b.name.as_ptr() as usize,
            Function::Host(h) => Arc::as_ptr(h) as usize,
        }
    }
}

pub struct Closure {
    pub proto: Arc<Proto>,
    pub upvalues: Vec<Cell>,
}

pub type BuiltinFn = fn(&mut Machine<'_, '_>, Vec<Val>) -> Result<Vec<Val>, GuestError>;

/// A function of the standard library
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

/// Hashable form of a table key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Bool(bool),
    Number(u64),
    Str(Arc<str>),
    Ref(usize),
    Record(u64, usize),
}

impl Key {
    fn of(value: &Val) -> Option<Key> {
        let key = match value {
            Val::Nil => return None,
            Val::Bool(b) => Key::Bool(*b),
            Val::Number(n) if n.is_nan() => return None,
            // -0.0 and 0.0 are the same key
            Val::Number(n) => Key::Number((n + 0.0).to_bits()),
            Val::Str(s) => Key::Str(Arc::clone(s)),
            Val::Table(t) => Key::Ref(t.ptr()),
            Val::Function(f) => Key::Ref(f.identity()),
            Val::Record(h) => Key::Record(h.run, h.slot),
        };
        Some(key)
    }
}

fn array_index(n: f64) -> Option<usize> {
    if n.fract() == 0.0 && n >= 1.0 && n < 4_294_967_296.0 {
        Some(n as usize)
    } else {
        None
    }
}

/// Contents of a table: a dense array part for keys `1..n` and an
/// insertion-ordered hash part
#[derive(Default)]
pub struct TableData {
    array: Vec<Val>,
    entries: Vec<(Val, Val)>,
    index: HashMap<Key, usize>,
    tombstones: usize,
}

impl TableData {
    pub fn get(&self, key: &Val) -> Val {
        if let Val::Number(n) = key {
            if let Some(i) = array_index(*n) {
                if i <= self.array.len() {
                    return self.array[i - 1].clone();
                }
            }
        }
        match Key::of(key).and_then(|k| self.index.get(&k)) {
            Some(&pos) => self.entries[pos].1.clone(),
            None => Val::Nil,
        }
    }

    pub fn set(&mut self, key: Val, value: Val) -> Result<(), &'static str> {
        match &key {
            Val::Nil => return Err("table index is nil"),
            Val::Number(n) if n.is_nan() => return Err("table index is NaN"),
            _ => {}
        }

        if let Val::Number(n) = key {
            if let Some(i) = array_index(n) {
                let len = self.array.len();
                if i <= len {
                    self.array[i - 1] = value;
                    if i == len {
                        self.trim_array();
                    }
                    return Ok(());
                }
                if i == len + 1 && !value.is_nil() {
                    self.clear_hash(&key);
                    self.array.push(value);
                    self.migrate_from_hash();
                    return Ok(());
                }
            }
        }

        let Some(k) = Key::of(&key) else {
            return Err("invalid table index");
        };
        match self.index.get(&k) {
            Some(&pos) => {
                let slot = &mut self.entries[pos].1;
                match (slot.is_nil(), value.is_nil()) {
                    (false, true) => self.tombstones += 1,
                    (true, false) => self.tombstones -= 1,
                    _ => {}
                }
                *slot = value;
            }
            None if value.is_nil() => {}
            None => {
                if self.tombstones > 8 && self.tombstones * 2 > self.entries.len() {
                    self.compact();
                }
                self.index.insert(k, self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    /// Length of the sequence part (`#t`)
    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.entries.len() == self.tombstones
    }

    /// Entry following `key` in iteration order: the array part first,
    /// then the hash part in insertion order
    pub fn next(&self, key: &Val) -> Result<Option<(Val, Val)>, &'static str> {
        let (array_from, hash_from) = match key {
            Val::Nil => (0, 0),
            // Keys migrated into the array part keep a dead slot in the
            // hash part, so the array range is checked first
            Val::Number(n) if array_index(*n).is_some_and(|i| i <= self.array.len()) => {
                (array_index(*n).unwrap_or(0), 0)
            }
            other => {
                let hashed = Key::of(other).and_then(|k| self.index.get(&k).copied());
                match (other, hashed) {
                    (_, Some(pos)) => (self.array.len(), pos + 1),
                    (Val::Number(n), None) => match array_index(*n) {
                        Some(i) if i <= self.array.len() => (i, 0),
                        // The array shrank under the iteration
                        Some(_) => (self.array.len(), 0),
                        None => return Err("invalid key to 'next'"),
                    },
                    _ => return Err("invalid key to 'next'"),
                }
            }
        };

        for i in array_from..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Val::Number((i + 1) as f64), self.array[i].clone())));
            }
        }
        for (k, v) in self.entries.iter().skip(hash_from) {
            if !v.is_nil() {
                return Ok(Some((k.clone(), v.clone())));
            }
        }
        Ok(None)
    }

    /// Every live entry in iteration order
    pub fn snapshot(&self) -> Vec<(Val, Val)> {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Val::Number((i + 1) as f64), v.clone()));
        let hash = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .cloned();
        array.chain(hash).collect()
    }

    /// The array part, for `table.*` helpers
    pub fn array(&self) -> &[Val] {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut Vec<Val> {
        &mut self.array
    }

    pub fn trim_array(&mut self) {
        while self.array.last().is_some_and(Val::is_nil) {
            self.array.pop();
        }
    }

    fn clear_hash(&mut self, key: &Val) {
        if let Some(&pos) = Key::of(key).and_then(|k| self.index.get(&k)) {
            if !self.entries[pos].1.is_nil() {
                self.entries[pos].1 = Val::Nil;
                self.tombstones += 1;
            }
        }
    }

    fn migrate_from_hash(&mut self) {
        loop {
            let next = Val::Number((self.array.len() + 1) as f64);
            let Some(&pos) = Key::of(&next).and_then(|k| self.index.get(&k)) else {
                break;
            };
            if self.entries[pos].1.is_nil() {
                break;
            }
            let value = std::mem::take(&mut self.entries[pos].1);
            self.tombstones += 1;
            self.array.push(value);
        }
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (pos, (k, _)) in self.entries.iter().enumerate() {
            if let Some(key) = Key::of(k) {
                self.index.insert(key, pos);
            }
        }
        self.tombstones = 0;
    }
}

/// Shared handle to a table
#[derive(Clone, Default)]
pub struct TableRef(Arc<Mutex<TableData>>);

impl TableRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: TableData) -> Self {
        TableRef(Arc::new(Mutex::new(data)))
    }

    pub fn lock(&self) -> MutexGuard<'_, TableData> {
        self.0.lock()
    }

    pub fn ptr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn get(&self, key: &Val) -> Val {
        self.lock().get(key)
    }

    pub fn get_str(&self, key: &str) -> Val {
        self.lock().get(&Val::str(key))
    }

    pub fn set(&self, key: Val, value: Val) -> Result<(), &'static str> {
        self.lock().set(key, value)
    }

    /// Store under a string key, which can never fail
    pub fn set_str(&self, key: &str, value: Val) {
        let _ = self.lock().set(Val::str(key), value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Format a number the way `tostring` does (`%.14g`)
pub fn fmt_number(n: f64) -> String {
    fmt_general(n, 14)
}

/// `%.<precision>g` formatting
pub fn fmt_general(n: f64, precision: usize) -> String {
    let precision = precision.max(1);
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < 10f64.powi(precision as i32) {
        if n == 0.0 && n.is_sign_negative() {
            return "-0".to_string();
        }
        return format!("{}", n as i64);
    }

    let sci = format!("{:.*e}", precision - 1, n);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= precision as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, n)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Parse a numeric string the way `tonumber` does
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (negative, body) = match text.as_bytes()[0] {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let n = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -n } else { n });
    }

    let numeric = text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !numeric {
        return None;
    }
    text.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(fmt_number(89.0), "89");
        assert_eq!(fmt_number(-3.0), "-3");
        assert_eq!(fmt_number(10.15), "10.15");
        assert_eq!(fmt_number(0.1), "0.1");
        assert_eq!(fmt_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(fmt_number(1e100), "1e+100");
        assert_eq!(fmt_number(1.5e-7), "1.5e-07");
        assert_eq!(fmt_number(f64::INFINITY), "inf");
        assert_eq!(fmt_number(1e15), "1e+15");
        assert_eq!(fmt_number(2f64.powi(40)), "1099511627776");
        assert_eq!(fmt_general(1234567.0, 6), "1.23457e+06");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 42 "), Some(42.0));
        assert_eq!(parse_number("0x10"), Some(16.0));
        assert_eq!(parse_number("-1.5e2"), Some(-150.0));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("12abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_array_part_and_migration() {
        let mut t = TableData::default();
        t.set(Val::Number(2.0), Val::str("b")).unwrap();
        assert_eq!(t.len(), 0);
        t.set(Val::Number(1.0), Val::str("a")).unwrap();
        assert_eq!(t.len(), 2);

        t.set(Val::Number(2.0), Val::Nil).unwrap();
        assert_eq!(t.len(), 1);
        assert!(t.get(&Val::Number(2.0)).is_nil());
    }

    #[test]
    fn test_iteration_after_migration() {
        let mut t = TableData::default();
        t.set(Val::Number(2.0), Val::str("b")).unwrap();
        t.set(Val::str("name"), Val::str("x")).unwrap();
        t.set(Val::Number(1.0), Val::str("a")).unwrap();
        t.set(Val::Number(3.0), Val::str("c")).unwrap();

        let mut keys = Vec::new();
        let mut key = Val::Nil;
        while let Some((k, _)) = t.next(&key).unwrap() {
            keys.push(k.to_string());
            key = k;
        }
        assert_eq!(keys, vec!["1", "2", "3", "name"]);
        assert_eq!(t.snapshot().len(), 4);
    }

    #[test]
    fn test_insertion_order_iteration() {
        let mut t = TableData::default();
        for key in ["z", "a", "m"] {
            t.set(Val::str(key), Val::Bool(true)).unwrap();
        }
        t.set(Val::Number(1.0), Val::Number(10.0)).unwrap();

        let mut keys = Vec::new();
        let mut key = Val::Nil;
        while let Some((k, _)) = t.next(&key).unwrap() {
            keys.push(k.to_string());
            key = k;
        }
        assert_eq!(keys, vec!["1", "z", "a", "m"]);
    }

    #[test]
    fn test_clearing_during_traversal() {
        let mut t = TableData::default();
        for i in 0..20 {
            t.set(Val::str(&format!("k{}", i)), Val::Number(i as f64)).unwrap();
        }
        let mut key = Val::Nil;
        let mut seen = 0;
        while let Some((k, _)) = t.next(&key).unwrap() {
            t.set(k.clone(), Val::Nil).unwrap();
            key = k;
            seen += 1;
        }
        assert_eq!(seen, 20);
        assert!(t.is_empty());
    }

    #[test]
    fn test_invalid_keys() {
        let mut t = TableData::default();
        assert!(t.set(Val::Nil, Val::Bool(true)).is_err());
        assert!(t.set(Val::Number(f64::NAN), Val::Bool(true)).is_err());
        assert!(t.next(&Val::str("missing")).is_err());
        // Negative zero and zero are one key
        t.set(Val::Number(-0.0), Val::str("zero")).unwrap();
        assert_eq!(t.get(&Val::Number(0.0)).to_string(), "zero");
    }
}
