// src/runtime/stdlib.rs
//! Standard library available to every script
//!
//! Base functions, `string`, `table`, `math` and the `json` module loaded
//! through `require`.

use crate::module::Module;
use crate::runtime::value::{fmt_general, Builtin, BuiltinFn, Function, TableRef, Val};
use crate::runtime::vm::{less_than, GuestError, Machine};
use crate::value::Value;
use std::sync::Arc;

type Ret = Result<Vec<Val>, GuestError>;

/// Longest string `string.rep` may build
const MAX_STRING: usize = 1 << 28;

/// Most values `unpack` may return
const MAX_UNPACK: i64 = 1 << 20;

const BASE: &[(&str, BuiltinFn)] = &[
    ("assert", base_assert),
    ("error", base_error),
    ("ipairs", base_ipairs),
    ("next", base_next),
    ("pairs", base_pairs),
    ("pcall", base_pcall),
    ("print", base_print),
    ("rawequal", base_rawequal),
    ("rawget", base_rawget),
    ("rawlen", base_rawlen),
    ("rawset", base_rawset),
    ("require", base_require),
    ("select", base_select),
    ("tonumber", base_tonumber),
    ("tostring", base_tostring),
    ("type", base_type),
    ("unpack", base_unpack),
];

const STRING: &[(&str, BuiltinFn)] = &[
    ("byte", str_byte),
    ("char", str_char),
    ("find", str_find),
    ("format", str_format),
    ("len", str_len),
    ("lower", str_lower),
    ("rep", str_rep),
    ("reverse", str_reverse),
    ("sub", str_sub),
    ("upper", str_upper),
];

const TABLE: &[(&str, BuiltinFn)] = &[
    ("concat", table_concat),
    ("insert", table_insert),
    ("remove", table_remove),
    ("sort", table_sort),
    ("unpack", base_unpack),
];

const MATH: &[(&str, BuiltinFn)] = &[
    ("abs", math_abs),
    ("ceil", math_ceil),
    ("exp", math_exp),
    ("floor", math_floor),
    ("fmod", math_fmod),
    ("log", math_log),
    ("max", math_max),
    ("min", math_min),
    ("pow", math_pow),
    ("sqrt", math_sqrt),
];

const JSON: &[(&str, BuiltinFn)] = &[("decode", json_decode), ("encode", json_encode)];

/// Install the library into `globals`; returns the string table used for
/// method calls on string values
pub fn install(globals: &TableRef) -> TableRef {
    register(globals, BASE);

    let string = library(STRING);
    globals.set_str("string", Val::Table(string.clone()));
    globals.set_str("table", Val::Table(library(TABLE)));

    let math = library(MATH);
    math.set_str("huge", Val::Number(f64::INFINITY));
    math.set_str("pi", Val::Number(std::f64::consts::PI));
    globals.set_str("math", Val::Table(math));

    string
}

fn builtin(name: &'static str, func: BuiltinFn) -> Val {
    Val::Function(Function::Builtin(Builtin { name, func }))
}

fn register(table: &TableRef, entries: &[(&'static str, BuiltinFn)]) {
    for (name, func) in entries {
        table.set_str(name, builtin(name, *func));
    }
}

fn library(entries: &[(&'static str, BuiltinFn)]) -> TableRef {
    let table = TableRef::new();
    register(&table, entries);
    table
}

/// Table of dispatch functions for a registered module
fn module_table(module: &Module) -> Val {
    let table = TableRef::new();
    for function in module.host_functions() {
        table.set_str(function.name(), Val::Function(Function::Host(Arc::clone(function))));
    }
    Val::Table(table)
}

// Argument helpers

fn arg(args: &[Val], i: usize) -> Val {
    args.get(i).cloned().unwrap_or_default()
}

fn bad_argument(m: &Machine<'_, '_>, i: usize, name: &str, expected: &str, got: Option<&Val>) -> GuestError {
    let got = got.map_or("no value", Val::type_name);
    m.error(format!(
        "bad argument #{} to '{}' ({} expected, got {})",
        i + 1,
        name,
        expected,
        got
    ))
}

fn check_any(m: &Machine<'_, '_>, args: &[Val], i: usize, name: &str) -> Result<Val, GuestError> {
    match args.get(i) {
        Some(value) => Ok(value.clone()),
        None => Err(m.error(format!("bad argument #{} to '{}' (value expected)", i + 1, name))),
    }
}

fn check_table(m: &Machine<'_, '_>, args: &[Val], i: usize, name: &str) -> Result<TableRef, GuestError> {
    match args.get(i) {
        Some(Val::Table(table)) => Ok(table.clone()),
        other => Err(bad_argument(m, i, name, "table", other)),
    }
}

fn check_number(m: &Machine<'_, '_>, args: &[Val], i: usize, name: &str) -> Result<f64, GuestError> {
    args.get(i)
        .and_then(Val::to_number)
        .ok_or_else(|| bad_argument(m, i, name, "number", args.get(i)))
}

fn check_str(m: &Machine<'_, '_>, args: &[Val], i: usize, name: &str) -> Result<Arc<str>, GuestError> {
    args.get(i)
        .and_then(Val::to_str)
        .ok_or_else(|| bad_argument(m, i, name, "string", args.get(i)))
}

fn opt_number(
    m: &Machine<'_, '_>,
    args: &[Val],
    i: usize,
    name: &str,
    default: f64,
) -> Result<f64, GuestError> {
    match args.get(i) {
        None | Some(Val::Nil) => Ok(default),
        Some(_) => check_number(m, args, i, name),
    }
}

// Base functions

fn base_assert(_m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    if args.first().is_some_and(Val::is_truthy) {
        return Ok(args);
    }
    match args.get(1) {
        Some(message) if !message.is_nil() => Err(GuestError::Runtime(message.clone())),
        _ => Err(GuestError::message("assertion failed!")),
    }
}

fn base_error(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let level = opt_number(m, &args, 1, "error", 1.0)?;
    match arg(&args, 0) {
        Val::Str(message) if level > 0.0 => Err(m.error(message)),
        value => Err(GuestError::Runtime(value)),
    }
}

fn base_ipairs(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    match args.first() {
        Some(value @ (Val::Table(_) | Val::Record(_))) => Ok(vec![
            builtin("ipairs_iterator", ipairs_next),
            value.clone(),
            Val::Number(0.0),
        ]),
        other => Err(bad_argument(m, 0, "ipairs", "table", other)),
    }
}

fn ipairs_next(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let i = check_number(m, &args, 1, "ipairs_iterator")? + 1.0;
    let value = m
        .index(&arg(&args, 0), &Val::Number(i))
        .map_err(|e| m.error(e))?;
    if value.is_nil() {
        Ok(vec![Val::Nil])
    } else {
        Ok(vec![Val::Number(i), value])
    }
}

fn base_next(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "next")?;
    let entry = table.lock().next(&arg(&args, 1)).map_err(|e| m.error(e))?;
    match entry {
        Some((key, value)) => Ok(vec![key, value]),
        None => Ok(vec![Val::Nil]),
    }
}

fn base_pairs(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    match args.first() {
        Some(Val::Table(table)) => Ok(vec![
            builtin("next", base_next),
            Val::Table(table.clone()),
            Val::Nil,
        ]),
        Some(Val::Record(handle)) => Ok(vec![
            builtin("record_next", record_next),
            Val::Record(*handle),
            Val::Nil,
        ]),
        other => Err(bad_argument(m, 0, "pairs", "table", other)),
    }
}

/// `next` over the fields of a record proxy
fn record_next(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let Val::Record(handle) = arg(&args, 0) else {
        return Err(bad_argument(m, 0, "next", "table", args.first()));
    };
    let fields = m.ctx.record(handle).map_err(|e| m.error(e))?.fields();

    let position = match arg(&args, 1) {
        Val::Nil => 0,
        Val::Str(name) => match fields.iter().position(|field| *field == &*name) {
            Some(found) => found + 1,
            None => return Err(m.error("invalid key to 'next'")),
        },
        _ => return Err(m.error("invalid key to 'next'")),
    };

    match fields.get(position) {
        Some(name) => {
            let key = Val::str(name);
            let value = m
                .index(&Val::Record(handle), &key)
                .map_err(|e| m.error(e))?;
            Ok(vec![key, value])
        }
        None => Ok(vec![Val::Nil]),
    }
}

fn base_pcall(m: &mut Machine<'_, '_>, mut args: Vec<Val>) -> Ret {
    if args.is_empty() {
        return Err(bad_argument(m, 0, "pcall", "value", None));
    }
    let func = args.remove(0);
    match m.call(&func, args) {
        Ok(mut values) => {
            values.insert(0, Val::Bool(true));
            Ok(values)
        }
        Err(GuestError::Runtime(value)) => Ok(vec![Val::Bool(false), value]),
        Err(GuestError::Argument(err)) => Ok(vec![Val::Bool(false), Val::str(&err.to_string())]),
        Err(cancelled) => Err(cancelled),
    }
}

fn base_print(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let line = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t");
    tracing::info!(target: "hostlua", chunk = m.chunk(), "{}", line);
    Ok(Vec::new())
}

fn base_rawequal(_m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    Ok(vec![Val::Bool(arg(&args, 0).raw_equal(&arg(&args, 1)))])
}

fn base_rawget(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "rawget")?;
    Ok(vec![table.get(&arg(&args, 1))])
}

fn base_rawlen(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    match args.first() {
        Some(Val::Table(table)) => Ok(vec![Val::Number(table.len() as f64)]),
        Some(Val::Str(s)) => Ok(vec![Val::Number(s.len() as f64)]),
        other => Err(bad_argument(m, 0, "rawlen", "table or string", other)),
    }
}

fn base_rawset(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "rawset")?;
    table
        .set(arg(&args, 1), arg(&args, 2))
        .map_err(|e| m.error(e))?;
    Ok(vec![Val::Table(table)])
}

fn base_require(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let name = check_str(m, &args, 0, "require")?;
    let cached = m.instance.loaded.get(&Val::Str(Arc::clone(&name)));
    if !cached.is_nil() {
        return Ok(vec![cached]);
    }

    let module = m.instance.modules.iter().find(|module| module.name() == &*name);
    let library = match module {
        Some(module) => module_table(module),
        None if &*name == "json" => Val::Table(library(JSON)),
        None => return Err(m.error(format!("module '{}' not found", name))),
    };

    m.instance.loaded.set_str(&name, library.clone());
    Ok(vec![library])
}

fn base_select(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let count = args.len().saturating_sub(1);
    if matches!(args.first(), Some(Val::Str(s)) if &**s == "#") {
        return Ok(vec![Val::Number(count as f64)]);
    }

    let n = check_number(m, &args, 0, "select")? as i64;
    let skip = if n < 0 {
        let back = n.unsigned_abs() as usize;
        if back > count {
            return Err(m.error("bad argument #1 to 'select' (index out of range)"));
        }
        count - back
    } else if n == 0 {
        return Err(m.error("bad argument #1 to 'select' (index out of range)"));
    } else {
        (n as usize - 1).min(count)
    };
    Ok(args.into_iter().skip(1 + skip).collect())
}

fn base_tonumber(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    match args.get(1) {
        None | Some(Val::Nil) => {
            let value = check_any(m, &args, 0, "tonumber")?;
            Ok(vec![value.to_number().map_or(Val::Nil, Val::Number)])
        }
        Some(_) => {
            let base = check_number(m, &args, 1, "tonumber")? as u32;
            if !(2..=36).contains(&base) {
                return Err(m.error("bad argument #2 to 'tonumber' (base out of range)"));
            }
            let text = check_str(m, &args, 0, "tonumber")?;
            let text = text.trim().to_ascii_lowercase();
            let parsed = match text.strip_prefix('-') {
                Some(digits) => i64::from_str_radix(digits, base).ok().map(|n| -n),
                None => i64::from_str_radix(&text, base).ok(),
            };
            Ok(vec![parsed.map_or(Val::Nil, |n| Val::Number(n as f64))])
        }
    }
}

fn base_tostring(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let value = check_any(m, &args, 0, "tostring")?;
    Ok(vec![Val::str(&value.to_string())])
}

fn base_type(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let value = check_any(m, &args, 0, "type")?;
    Ok(vec![Val::str(value.type_name())])
}

fn base_unpack(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "unpack")?;
    let len = table.len();
    let i = opt_number(m, &args, 1, "unpack", 1.0)? as i64;
    let j = opt_number(m, &args, 2, "unpack", len as f64)? as i64;
    if i > j {
        return Ok(Vec::new());
    }
    if j.checked_sub(i).map_or(true, |span| span >= MAX_UNPACK) {
        return Err(m.error("too many results to unpack"));
    }

    let data = table.lock();
    Ok((i..=j).map(|k| data.get(&Val::Number(k as f64))).collect())
}

// string

/// Lua string positions (1-based, negative from the end) to a byte range
fn byte_range(len: usize, i: i64, j: i64) -> (usize, usize) {
    let len = len as i64;
    let start = if i < 0 {
        (len + i + 1).max(1)
    } else {
        i.max(1)
    };
    let end = if j < 0 { len + j + 1 } else { j.min(len) };
    if start > end {
        (0, 0)
    } else {
        ((start - 1) as usize, end as usize)
    }
}

fn lossy(bytes: &[u8]) -> Val {
    Val::str(&String::from_utf8_lossy(bytes))
}

fn str_byte(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "byte")?;
    let i = opt_number(m, &args, 1, "byte", 1.0)? as i64;
    let j = opt_number(m, &args, 2, "byte", i as f64)? as i64;
    let (start, end) = byte_range(s.len(), i, j);
    Ok(s.as_bytes()[start..end]
        .iter()
        .map(|b| Val::Number(*b as f64))
        .collect())
}

fn str_char(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let mut bytes = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let n = check_number(m, &args, i, "char")?;
        if !(0.0..=255.0).contains(&n) {
            return Err(m.error(format!("bad argument #{} to 'char' (value out of range)", i + 1)));
        }
        bytes.push(n as u8);
    }
    Ok(vec![lossy(&bytes)])
}

/// Plain substring search; pattern characters have no special meaning
fn str_find(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "find")?;
    let needle = check_str(m, &args, 1, "find")?;
    let init = opt_number(m, &args, 2, "find", 1.0)? as i64;
    let start = if init < 0 {
        (s.len() as i64 + init).max(0) as usize
    } else {
        (init - 1).max(0) as usize
    };
    if start > s.len() {
        return Ok(vec![Val::Nil]);
    }

    let haystack = &s.as_bytes()[start..];
    let found = if needle.is_empty() {
        Some(0)
    } else {
        haystack
            .windows(needle.len())
            .position(|window| window == needle.as_bytes())
    };
    match found {
        Some(pos) => Ok(vec![
            Val::Number((start + pos + 1) as f64),
            Val::Number((start + pos + needle.len()) as f64),
        ]),
        None => Ok(vec![Val::Nil]),
    }
}

#[derive(Default)]
struct FormatSpec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    width: usize,
    precision: Option<usize>,
}

impl FormatSpec {
    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    fn pad(&self, sign: &str, body: &str, numeric: bool) -> String {
        let len = sign.len() + body.chars().count();
        if len >= self.width {
            return format!("{}{}", sign, body);
        }
        let fill = self.width - len;
        if self.left {
            format!("{}{}{}", sign, body, " ".repeat(fill))
        } else if self.zero && numeric {
            format!("{}{}{}", sign, "0".repeat(fill), body)
        } else {
            format!("{}{}{}", " ".repeat(fill), sign, body)
        }
    }
}

fn read_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> usize {
    let mut n = 0usize;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = n.saturating_mul(10).saturating_add(d as usize);
        chars.next();
    }
    n
}

/// `%e` with a C-style exponent (`1.500000e+02`)
fn fmt_exponent(n: f64, precision: usize, upper: bool) -> String {
    let text = format!("{:.*e}", precision, n);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((text.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let out = format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    if upper {
        out.to_uppercase()
    } else {
        out
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn str_format(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let template = check_str(m, &args, 0, "format")?;
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next = 1;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut spec = FormatSpec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => {}
                _ => break,
            }
            chars.next();
        }
        spec.width = read_digits(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(read_digits(&mut chars));
        }

        let Some(conversion) = chars.next() else {
            return Err(m.error("invalid conversion '%' to 'format'"));
        };
        let i = next;
        next += 1;

        let piece = match conversion {
            'd' | 'i' => {
                let n = check_number(m, &args, i, "format")?.trunc();
                let mut digits = format!("{}", n.abs() as u64);
                if let Some(precision) = spec.precision {
                    while digits.len() < precision {
                        digits.insert(0, '0');
                    }
                }
                spec.pad(spec.sign(n < 0.0), &digits, spec.precision.is_none())
            }
            'f' | 'F' => {
                let n = check_number(m, &args, i, "format")?;
                let body = format!("{:.*}", spec.precision.unwrap_or(6), n.abs());
                spec.pad(spec.sign(n.is_sign_negative() && n != 0.0), &body, true)
            }
            'e' | 'E' => {
                let n = check_number(m, &args, i, "format")?;
                let body = fmt_exponent(n.abs(), spec.precision.unwrap_or(6), conversion == 'E');
                spec.pad(spec.sign(n < 0.0), &body, true)
            }
            'g' | 'G' => {
                let n = check_number(m, &args, i, "format")?;
                let mut body = fmt_general(n.abs(), spec.precision.unwrap_or(6));
                if conversion == 'G' {
                    body = body.to_uppercase();
                }
                spec.pad(spec.sign(n < 0.0), &body, true)
            }
            'x' | 'X' | 'o' => {
                let n = check_number(m, &args, i, "format")?.trunc() as i64 as u64;
                let body = match conversion {
                    'x' => format!("{:x}", n),
                    'X' => format!("{:X}", n),
                    _ => format!("{:o}", n),
                };
                spec.pad("", &body, true)
            }
            'c' => {
                let n = check_number(m, &args, i, "format")?;
                let c = char::from_u32(n as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                spec.pad("", &c.to_string(), false)
            }
            's' => {
                let value = check_any(m, &args, i, "format")?;
                let text = value.to_string();
                let text: String = match spec.precision {
                    Some(precision) => text.chars().take(precision).collect(),
                    None => text,
                };
                spec.pad("", &text, false)
            }
            'q' => {
                let text = check_str(m, &args, i, "format")?;
                quote(&text)
            }
            other => {
                return Err(m.error(format!("invalid option '%{}' to 'format'", other)));
            }
        };
        out.push_str(&piece);
    }

    Ok(vec![Val::str(&out)])
}

fn str_len(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "len")?;
    Ok(vec![Val::Number(s.len() as f64)])
}

fn str_lower(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "lower")?;
    Ok(vec![Val::str(&s.to_lowercase())])
}

fn str_upper(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "upper")?;
    Ok(vec![Val::str(&s.to_uppercase())])
}

fn str_rep(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "rep")?;
    let n = check_number(m, &args, 1, "rep")?;
    let sep = match args.get(2) {
        None | Some(Val::Nil) => Arc::from(""),
        Some(_) => check_str(m, &args, 2, "rep")?,
    };
    if n < 1.0 {
        return Ok(vec![Val::str("")]);
    }

    let n = n as usize;
    let total = s
        .len()
        .saturating_add(sep.len())
        .saturating_mul(n);
    if total > MAX_STRING {
        return Err(m.error("resulting string too large"));
    }

    let mut out = String::with_capacity(total);
    for i in 0..n {
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(&s);
    }
    Ok(vec![Val::str(&out)])
}

fn str_reverse(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "reverse")?;
    Ok(vec![Val::str(&s.chars().rev().collect::<String>())])
}

fn str_sub(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let s = check_str(m, &args, 0, "sub")?;
    let i = opt_number(m, &args, 1, "sub", 1.0)? as i64;
    let j = opt_number(m, &args, 2, "sub", -1.0)? as i64;
    let (start, end) = byte_range(s.len(), i, j);
    Ok(vec![lossy(&s.as_bytes()[start..end])])
}

// table

fn table_concat(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "concat")?;
    let sep = match args.get(1) {
        None | Some(Val::Nil) => Arc::from(""),
        Some(_) => check_str(m, &args, 1, "concat")?,
    };
    let len = table.len();
    let i = opt_number(m, &args, 2, "concat", 1.0)? as i64;
    let j = opt_number(m, &args, 3, "concat", len as f64)? as i64;

    let data = table.lock();
    let mut out = String::new();
    for k in i..=j {
        let Some(piece) = data.get(&Val::Number(k as f64)).to_str() else {
            return Err(m.error(format!(
                "invalid value (at index {}) in table for 'concat'",
                k
            )));
        };
        out.push_str(&piece);
        if k < j {
            out.push_str(&sep);
        }
    }
    Ok(vec![Val::str(&out)])
}

fn table_insert(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "insert")?;
    match args.len() {
        2 => {
            let mut data = table.lock();
            let n = data.len();
            let _ = data.set(Val::Number((n + 1) as f64), args[1].clone());
        }
        3 => {
            let pos = check_number(m, &args, 1, "insert")?;
            let mut data = table.lock();
            let n = data.len();
            if pos.fract() != 0.0 || pos < 1.0 || pos > (n + 1) as f64 {
                return Err(m.error("bad argument #2 to 'insert' (position out of bounds)"));
            }
            let pos = pos as usize;
            for k in (pos..=n).rev() {
                let value = data.get(&Val::Number(k as f64));
                let _ = data.set(Val::Number((k + 1) as f64), value);
            }
            let _ = data.set(Val::Number(pos as f64), args[2].clone());
        }
        _ => return Err(m.error("wrong number of arguments to 'insert'")),
    }
    Ok(Vec::new())
}

fn table_remove(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "remove")?;
    let n = table.len();
    let pos = match args.get(1) {
        None | Some(Val::Nil) => {
            if n == 0 {
                return Ok(vec![Val::Nil]);
            }
            n as f64
        }
        Some(_) => check_number(m, &args, 1, "remove")?,
    };
    if pos.fract() != 0.0 || pos < 1.0 || pos > (n + 1) as f64 {
        return Err(m.error("bad argument #2 to 'remove' (position out of bounds)"));
    }

    let pos = pos as usize;
    let mut data = table.lock();
    let removed = data.get(&Val::Number(pos as f64));
    for k in pos..n {
        let value = data.get(&Val::Number((k + 1) as f64));
        let _ = data.set(Val::Number(k as f64), value);
    }
    if pos <= n {
        let _ = data.set(Val::Number(n as f64), Val::Nil);
    }
    Ok(vec![removed])
}

fn table_sort(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let table = check_table(m, &args, 0, "sort")?;
    let comparator = match args.get(1) {
        None | Some(Val::Nil) => None,
        Some(f @ Val::Function(_)) => Some(f.clone()),
        other => return Err(bad_argument(m, 1, "sort", "function", other)),
    };

    // Sort a copy so no lock is held while the comparator runs
    let items = table.lock().array().to_vec();
    let mut less = |a: &Val, b: &Val| -> Result<bool, GuestError> {
        match &comparator {
            Some(f) => {
                let result = m.call(f, vec![a.clone(), b.clone()])?;
                Ok(result.first().is_some_and(Val::is_truthy))
            }
            None => less_than(a, b).map_err(|e| m.error(e)),
        }
    };
    let sorted = merge_sort(items, &mut less)?;

    let mut data = table.lock();
    for (i, value) in sorted.into_iter().enumerate() {
        let _ = data.set(Val::Number((i + 1) as f64), value);
    }
    Ok(Vec::new())
}

/// Stable merge sort with a fallible comparator
fn merge_sort(
    mut items: Vec<Val>,
    less: &mut dyn FnMut(&Val, &Val) -> Result<bool, GuestError>,
) -> Result<Vec<Val>, GuestError> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, less)?;
    let right = merge_sort(right, less)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if less(&right[j], &left[i])? {
            out.push(right[j].clone());
            j += 1;
        } else {
            out.push(left[i].clone());
            i += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    Ok(out)
}

// math

fn math_unary(m: &Machine<'_, '_>, args: &[Val], name: &str, f: fn(f64) -> f64) -> Ret {
    let x = check_number(m, args, 0, name)?;
    Ok(vec![Val::Number(f(x))])
}

fn math_abs(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_unary(m, &args, "abs", f64::abs)
}

fn math_ceil(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_unary(m, &args, "ceil", f64::ceil)
}

fn math_floor(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_unary(m, &args, "floor", f64::floor)
}

fn math_sqrt(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_unary(m, &args, "sqrt", f64::sqrt)
}

fn math_exp(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_unary(m, &args, "exp", f64::exp)
}

fn math_fmod(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let a = check_number(m, &args, 0, "fmod")?;
    let b = check_number(m, &args, 1, "fmod")?;
    Ok(vec![Val::Number(a % b)])
}

fn math_pow(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let a = check_number(m, &args, 0, "pow")?;
    let b = check_number(m, &args, 1, "pow")?;
    Ok(vec![Val::Number(a.powf(b))])
}

fn math_log(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let x = check_number(m, &args, 0, "log")?;
    let n = match args.get(1) {
        None | Some(Val::Nil) => x.ln(),
        Some(_) => {
            let base = check_number(m, &args, 1, "log")?;
            if base == 2.0 {
                x.log2()
            } else if base == 10.0 {
                x.log10()
            } else {
                x.ln() / base.ln()
            }
        }
    };
    Ok(vec![Val::Number(n)])
}

fn math_extreme(m: &Machine<'_, '_>, args: &[Val], name: &str, pick: fn(f64, f64) -> bool) -> Ret {
    let mut best = check_number(m, args, 0, name)?;
    for i in 1..args.len() {
        let x = check_number(m, args, i, name)?;
        if pick(x, best) {
            best = x;
        }
    }
    Ok(vec![Val::Number(best)])
}

fn math_max(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_extreme(m, &args, "max", |x, best| x > best)
}

fn math_min(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    math_extreme(m, &args, "min", |x, best| x < best)
}

// json

fn json_encode(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let value = m
        .ctx
        .export(&arg(&args, 0))
        .map_err(|e| m.error(format!("json.encode: {}", e)))?;
    let text = serde_json::to_string(&value).map_err(|e| m.error(format!("json.encode: {}", e)))?;
    Ok(vec![Val::str(&text)])
}

fn json_decode(m: &mut Machine<'_, '_>, args: Vec<Val>) -> Ret {
    let text = check_str(m, &args, 0, "decode")?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| m.error(format!("json.decode: {}", e)))?;
    Ok(vec![Val::import(value)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptConfig;
    use crate::runtime::context::{Context, ExecutionContext};
    use crate::runtime::pool::Instance;
    use crate::runtime::value::Closure;

    fn eval(source: &str) -> String {
        let chunk = crate::compiler::compile("lib", source).unwrap();
        let instance = Instance::new(Arc::from(Vec::<Module>::new()));
        let context = Context::background();
        let config = ScriptConfig::default();
        let mut exec = ExecutionContext::new(&context, &config);
        let mut machine = Machine::new(&mut exec, &instance, "lib");
        let top = Val::Function(Function::Lua(Arc::new(Closure {
            proto: chunk,
            upvalues: Vec::new(),
        })));
        match machine.call(&top, Vec::new()) {
            Ok(values) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Err(err) => format!("error: {}", err),
        }
    }

    #[test]
    fn test_type_and_tostring() {
        assert_eq!(eval("return type(nil), type(1), type('x'), type({}), type(print)"),
            "nil,number,string,table,function");
        assert_eq!(eval("return tostring(1.5), tostring(true), tostring(nil)"), "1.5,true,nil");
        assert_eq!(eval("return type()"), "error: lib:1: bad argument #1 to 'type' (value expected)");
    }

    #[test]
    fn test_tonumber() {
        assert_eq!(eval("return tonumber('0x1F'), tonumber(' 12 '), tonumber('z')"), "31,12,nil");
        assert_eq!(eval("return tonumber('ff', 16), tonumber('777', 8)"), "255,511");
    }

    #[test]
    fn test_select_and_unpack() {
        assert_eq!(eval("return select('#', 1, nil, 3)"), "3");
        assert_eq!(eval("return select(2, 'a', 'b', 'c')"), "b,c");
        assert_eq!(eval("return select(-1, 'a', 'b', 'c')"), "c");
        assert_eq!(eval("return unpack({1, 2, 3})"), "1,2,3");
        assert_eq!(eval("return table.unpack({1, 2, 3}, 2)"), "2,3");
        assert_eq!(eval("return select('#', unpack({1, 2}, 3, 1))"), "0");
    }

    #[test]
    fn test_unpack_huge_span() {
        let out = eval("return table.unpack({}, -2^63, 2^63)");
        assert!(out.contains("too many results to unpack"), "{}", out);
        let out = eval("return unpack({}, 1, 2^40)");
        assert!(out.contains("too many results to unpack"), "{}", out);
        assert_eq!(eval("return select('#', unpack({}, 1, 3))"), "3");
    }

    #[test]
    fn test_ipairs_stops_at_hole() {
        let source = r#"
            local t = { 1, 2, nil, 4 }
            local n = 0
            for _, v in ipairs(t) do n = n + v end
            return n
        "#;
        assert_eq!(eval(source), "3");
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval("return string.sub('hello', 2, -2)"), "ell");
        assert_eq!(eval("return ('hello'):sub(-3)"), "llo");
        assert_eq!(eval("return string.byte('A'), string.char(72, 105)"), "65,Hi");
        assert_eq!(eval("return string.find('a.b.c', '.', 3)"), "4,4");
        assert_eq!(eval("return string.find('abc', 'x')"), "nil");
        assert_eq!(eval("return string.rep('ab', 3, '-')"), "ab-ab-ab");
        assert_eq!(eval("return string.reverse('abc'), string.len('abc')"), "cba,3");
        assert_eq!(eval("return ('MiXeD'):lower(), ('MiXeD'):upper()"), "mixed,MIXED");
    }

    #[test]
    fn test_string_format() {
        assert_eq!(eval("return string.format('%d items', 3.7)"), "3 items");
        assert_eq!(eval("return string.format('%5.2f|%-4s|%03d', 3.14159, 'ab', 7)"), " 3.14|ab  |007");
        assert_eq!(eval("return string.format('%x %X %o', 255, 255, 8)"), "ff FF 10");
        assert_eq!(eval("return string.format('%q', 'say \"hi\"')"), "\"say \\\"hi\\\"\"");
        assert_eq!(eval("return string.format('%g %e', 0.5, 150)"), "0.5 1.500000e+02");
        assert_eq!(eval("return string.format('100%%')"), "100%");
        assert_eq!(eval("return string.format('%s and %s', 1, true)"), "1 and true");
    }

    #[test]
    fn test_table_functions() {
        let source = r#"
            local t = { 'b' }
            table.insert(t, 'c')
            table.insert(t, 1, 'a')
            local removed = table.remove(t, 2)
            return table.concat(t, ','), removed, #t
        "#;
        assert_eq!(eval(source), "a,c,b,2");
    }

    #[test]
    fn test_table_sort() {
        assert_eq!(eval("local t = {3, 1, 2}; table.sort(t); return table.concat(t, ' ')"), "1 2 3");
        assert_eq!(
            eval("local t = {3, 1, 2}; table.sort(t, function(a, b) return a > b end); return table.concat(t, ' ')"),
            "3 2 1"
        );
        assert_eq!(
            eval("local t = {1, 'x'}; table.sort(t)"),
            "error: lib:1: attempt to compare string with number"
        );
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(eval("return math.floor(3.7), math.ceil(3.2), math.abs(-2)"), "3,4,2");
        assert_eq!(eval("return math.max(1, 5, 3), math.min(4, 2, 8)"), "5,2");
        assert_eq!(eval("return math.sqrt(16), math.pow(2, 10), math.fmod(7, 3)"), "4,1024,1");
        assert_eq!(eval("return math.huge, math.log(8, 2)"), "inf,3");
    }

    #[test]
    fn test_error_and_assert() {
        assert_eq!(eval("error('plain', 0)"), "error: plain");
        assert_eq!(eval("\nerror('located')"), "error: lib:2: located");
        assert_eq!(eval("assert(false, 'nope')"), "error: nope");
        assert_eq!(eval("return assert(1, 'unused')"), "1,unused");
    }

    #[test]
    fn test_json_module() {
        let source = r#"
            local json = require("json")
            local decoded = json.decode('{"n": 2, "list": [1, 2]}')
            return json.encode({ a = 1, b = { true, "x" } }), decoded.n + decoded.list[2]
        "#;
        assert_eq!(eval(source), r#"{"a":1,"b":[true,"x"]},4"#);
        assert_eq!(eval("return require('json') == require('json')"), "true");
    }

    #[test]
    fn test_json_rejects_functions() {
        let out = eval("return require('json').encode({ f = print })");
        assert!(out.starts_with("error: lib:1: json.encode:"), "{}", out);
    }

    #[test]
    fn test_require_unknown_module() {
        assert_eq!(eval("require('nope')"), "error: lib:1: module 'nope' not found");
    }
}
