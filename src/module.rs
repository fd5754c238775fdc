// src/module.rs
//! Host modules: named groups of Rust functions callable from scripts
//!
//! Each function is validated when it is registered. Its parameter types are
//! probed through serde to build a [`Signature`], and the dispatcher checks
//! every call against that signature before any argument is converted.

pub use crate::marshal::probe::{Kind, Param};

use crate::marshal::de::describe;
use crate::marshal::probe::probe;
use crate::marshal::{from_value, to_value};
use crate::parser::lexer::is_keyword;
use crate::value::{Table, Value};
use crate::{ArgumentError, RegisterError};
use ahash::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Parameter shapes of a registered function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Param>,
    /// Returns `Result`, so a call can fail with a script error
    pub fallible: bool,
}

impl Signature {
    /// Number of leading arguments a caller must supply
    pub fn required(&self) -> usize {
        self.params
            .iter()
            .rposition(|p| !p.nullable)
            .map_or(0, |i| i + 1)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")?;
        if self.fallible {
            f.write_str(" -> result")?;
        }
        Ok(())
    }
}

/// Why a host call did not produce a value
#[derive(Debug, Clone, PartialEq)]
pub enum HostFailure {
    /// An argument or the return value could not be converted
    Argument(ArgumentError),
    /// The function returned `Err`; carries its message
    Failed(String),
}

type Thunk = Box<dyn Fn(Vec<Value>) -> Result<Value, HostFailure> + Send + Sync>;

/// A registered function together with its signature
pub struct HostFunction {
    name: String,
    qualified: String,
    signature: Signature,
    thunk: Thunk,
}

impl HostFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `module.function`
    pub fn qualified(&self) -> &str {
        &self.qualified
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Check `args` against the signature, then invoke the function
    pub fn call(&self, mut args: Vec<Value>) -> Result<Value, HostFailure> {
        while args.last().is_some_and(Value::is_nil) {
            args.pop();
        }

        let params = &self.signature.params;
        let required = self.signature.required();
        if args.len() > params.len() || args.len() < required {
            let expected = if required == params.len() {
                required.to_string()
            } else {
                format!("{} to {}", required, params.len())
            };
            return Err(HostFailure::Argument(ArgumentError::count(
                &self.qualified,
                expected,
                args.len(),
            )));
        }

        for (i, (param, arg)) in params.iter().zip(&args).enumerate() {
            if !param.accepts(arg.kind()) {
                let err = ArgumentError::mismatch(param.to_string(), describe(arg))
                    .at(i + 1)
                    .in_function(&self.qualified);
                return Err(HostFailure::Argument(err));
            }
        }

        (self.thunk)(args).map_err(|failure| match failure {
            HostFailure::Argument(err) => HostFailure::Argument(err.in_function(&self.qualified)),
            other => other,
        })
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.qualified)
            .field("signature", &self.signature)
            .finish()
    }
}

/// A Rust function that can be registered in a [`Module`]
///
/// Implemented for `Fn(A1, ..., An) -> R` with up to 8 parameters, where
/// every `Ai` is an owned `Deserialize` type and `R` implements
/// [`HostReturn`].
pub trait IntoHostFunction<Args>: Send + Sync + 'static {
    /// Probe the parameter shapes; fails with the 1-based position and
    /// reason of the first unsupported parameter
    fn signature() -> Result<Signature, (usize, String)>;

    fn into_thunk(self) -> Thunk;
}

macro_rules! impl_into_host_function {
    ($($arg:ident),*) => {
        impl<F, R, $($arg,)*> IntoHostFunction<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: HostReturn + 'static,
            $($arg: DeserializeOwned + 'static,)*
        {
            fn signature() -> Result<Signature, (usize, String)> {
                #[allow(unused_mut)]
                let mut params = Vec::new();
                $(
                    let position = params.len() + 1;
                    let param = probe::<$arg>().map_err(|reason| (position, reason))?;
                    params.push(param);
                )*
                Ok(Signature {
                    params,
                    fallible: R::FALLIBLE,
                })
            }

            #[allow(non_snake_case, unused_mut, unused_variables, unused_assignments)]
            fn into_thunk(self) -> Thunk {
                Box::new(move |args: Vec<Value>| {
                    let mut args = args.into_iter();
                    let mut position = 0;
                    $(
                        position += 1;
                        let $arg: $arg = from_value(args.next().unwrap_or_default())
                            .map_err(|e| HostFailure::Argument(e.at(position)))?;
                    )*
                    (self)($($arg),*).into_outcome()
                })
            }
        }
    };
}

impl_into_host_function!();
impl_into_host_function!(A1);
impl_into_host_function!(A1, A2);
impl_into_host_function!(A1, A2, A3);
impl_into_host_function!(A1, A2, A3, A4);
impl_into_host_function!(A1, A2, A3, A4, A5);
impl_into_host_function!(A1, A2, A3, A4, A5, A6);
impl_into_host_function!(A1, A2, A3, A4, A5, A6, A7);
impl_into_host_function!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Return types a host function may have
///
/// Plain values are marshaled back to the script. `Result<T, E>` makes the
/// function fallible: `Err(e)` raises a script error with `e.to_string()`.
pub trait HostReturn {
    const FALLIBLE: bool = false;

    fn into_outcome(self) -> Result<Value, HostFailure>;
}

impl<T: Serialize, E: fmt::Display> HostReturn for Result<T, E> {
    const FALLIBLE: bool = true;

    fn into_outcome(self) -> Result<Value, HostFailure> {
        match self {
            Ok(value) => to_value(&value).map_err(HostFailure::Argument),
            Err(err) => Err(HostFailure::Failed(err.to_string())),
        }
    }
}

macro_rules! impl_host_return {
    ($($ty:ty),*) => {
        $(
            impl HostReturn for $ty {
                fn into_outcome(self) -> Result<Value, HostFailure> {
                    to_value(&self).map_err(HostFailure::Argument)
                }
            }
        )*
    };
}

impl_host_return!(
    (), bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String, &'static str
);

// Tuples come back as one sequence table
macro_rules! impl_host_return_tuple {
    ($($t:ident),+) => {
        impl<$($t: Serialize),+> HostReturn for ($($t,)+) {
            fn into_outcome(self) -> Result<Value, HostFailure> {
                to_value(&self).map_err(HostFailure::Argument)
            }
        }
    };
}

impl_host_return_tuple!(T1, T2);
impl_host_return_tuple!(T1, T2, T3);
impl_host_return_tuple!(T1, T2, T3, T4);

impl HostReturn for Value {
    fn into_outcome(self) -> Result<Value, HostFailure> {
        Ok(self)
    }
}

impl HostReturn for Table {
    fn into_outcome(self) -> Result<Value, HostFailure> {
        Ok(Value::Table(self))
    }
}

impl<T: Serialize> HostReturn for Vec<T> {
    fn into_outcome(self) -> Result<Value, HostFailure> {
        to_value(&self).map_err(HostFailure::Argument)
    }
}

impl<T: Serialize> HostReturn for Option<T> {
    fn into_outcome(self) -> Result<Value, HostFailure> {
        to_value(&self).map_err(HostFailure::Argument)
    }
}

impl<T: Serialize, S> HostReturn for std::collections::HashMap<String, T, S> {
    fn into_outcome(self) -> Result<Value, HostFailure> {
        to_value(&self).map_err(HostFailure::Argument)
    }
}

impl<T: Serialize> HostReturn for BTreeMap<String, T> {
    fn into_outcome(self) -> Result<Value, HostFailure> {
        to_value(&self).map_err(HostFailure::Argument)
    }
}

/// A named group of host functions, loaded by scripts with `require`
///
/// ```rust
/// use hostlua::{Kind, Module};
///
/// let mut math = Module::new("mathx");
/// math.register("add", |a: f64, b: f64| a + b).unwrap();
/// math.register("div", |a: f64, b: f64| {
///     if b == 0.0 {
///         Err("division by zero")
///     } else {
///         Ok(a / b)
///     }
/// })
/// .unwrap();
///
/// assert_eq!(math.functions(), vec!["add", "div"]);
/// let signature = math.signature("div").unwrap();
/// assert_eq!(signature.params[0].kind, Kind::Number);
/// assert!(signature.fallible);
/// ```
#[derive(Clone)]
pub struct Module {
    name: String,
    functions: Vec<Arc<HostFunction>>,
    index: HashMap<String, usize>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            index: HashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered function names, in registration order
    pub fn functions(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name()).collect()
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.index
            .get(name)
            .map(|&i| self.functions[i].signature())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Register a function under `name`
    ///
    /// Fails when the name is not a valid identifier, is already taken in
    /// this module, or a parameter type cannot be built from a script value.
    pub fn register<F, Args>(&mut self, name: &str, function: F) -> Result<(), RegisterError>
    where
        F: IntoHostFunction<Args>,
    {
        if !is_identifier(name) {
            return Err(RegisterError::InvalidName(name.to_string()));
        }
        if self.index.contains_key(name) {
            return Err(RegisterError::Duplicate {
                module: self.name.clone(),
                name: name.to_string(),
            });
        }

        let signature = F::signature().map_err(|(position, reason)| RegisterError::Unsupported {
            name: name.to_string(),
            position,
            reason,
        })?;

        tracing::debug!(
            target: "hostlua",
            module = %self.name,
            function = name,
            signature = %signature,
            "registered host function"
        );

        self.index.insert(name.to_string(), self.functions.len());
        self.functions.push(Arc::new(HostFunction {
            name: name.to_string(),
            qualified: format!("{}.{}", self.name, name),
            signature,
            thunk: function.into_thunk(),
        }));
        Ok(())
    }

    pub(crate) fn host_functions(&self) -> impl Iterator<Item = &Arc<HostFunction>> {
        self.functions.iter()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("functions", &self.functions())
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !is_keyword(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn host(module: &Module, name: &str) -> Arc<HostFunction> {
        let i = module.index[name];
        Arc::clone(&module.functions[i])
    }

    #[test]
    fn test_register_and_call() {
        let mut module = Module::new("strings");
        module
            .register("join", |a: String, b: String| format!("{}{}", a, b))
            .unwrap();

        let out = host(&module, "join")
            .call(vec![Value::from("ab"), Value::from("cd")])
            .unwrap();
        assert_eq!(out, Value::from("abcd"));
        assert_eq!(module.functions(), vec!["join"]);
        assert_eq!(module.signature("join").unwrap().to_string(), "(string, string)");
    }

    #[test]
    fn test_invalid_names() {
        let mut module = Module::new("m");
        for name in ["", "1abc", "has space", "end", "a-b"] {
            assert_eq!(
                module.register(name, || ()),
                Err(RegisterError::InvalidName(name.to_string()))
            );
        }
        assert!(module.register("_ok2", || ()).is_ok());
    }

    #[test]
    fn test_duplicate_names() {
        let mut module = Module::new("m");
        module.register("f", || 1).unwrap();
        assert_eq!(
            module.register("f", || 2),
            Err(RegisterError::Duplicate {
                module: "m".into(),
                name: "f".into()
            })
        );
    }

    #[test]
    fn test_unsupported_parameter() {
        #[derive(Deserialize)]
        enum Color {
            Red,
        }

        let mut module = Module::new("m");
        let err = module
            .register("paint", |_n: f64, _c: Color| ())
            .unwrap_err();
        assert!(matches!(err, RegisterError::Unsupported { position: 2, .. }));
        assert!(module.is_empty());
        let _ = Color::Red;
    }

    #[test]
    fn test_arity_checks() {
        let mut module = Module::new("m");
        module
            .register("greet", |name: String, title: Option<String>| match title {
                Some(t) => format!("{} {}", t, name),
                None => name,
            })
            .unwrap();
        let greet = host(&module, "greet");
        assert_eq!(greet.signature().required(), 1);

        assert_eq!(greet.call(vec![Value::from("Ada")]).unwrap(), Value::from("Ada"));
        // Trailing nils are ignored
        assert_eq!(
            greet.call(vec![Value::from("Ada"), Value::Nil, Value::Nil]).unwrap(),
            Value::from("Ada")
        );

        let Err(HostFailure::Argument(err)) = greet.call(vec![]) else {
            panic!("missing argument accepted");
        };
        assert_eq!(
            err.to_string(),
            "bad argument to 'm.greet' (1 to 2 argument(s) expected, got 0)"
        );

        let too_many = vec![Value::from("a"), Value::from("b"), Value::from("c")];
        assert!(matches!(greet.call(too_many), Err(HostFailure::Argument(_))));
    }

    #[test]
    fn test_type_mismatch_names_position() {
        let mut module = Module::new("m");
        module.register("add", |a: f64, b: f64| a + b).unwrap();

        let Err(HostFailure::Argument(err)) =
            host(&module, "add").call(vec![Value::Number(1.0), Value::from("x")])
        else {
            panic!("string accepted as number");
        };
        assert_eq!(err.to_string(), "bad argument #2 to 'm.add' (number expected, got string)");
    }

    #[test]
    fn test_integer_conversion_is_strict() {
        let mut module = Module::new("m");
        module.register("twice", |n: u8| n as u32 * 2).unwrap();
        let twice = host(&module, "twice");

        assert_eq!(twice.call(vec![Value::Number(4.0)]).unwrap(), Value::Number(8.0));
        let Err(HostFailure::Argument(err)) = twice.call(vec![Value::Number(1.5)]) else {
            panic!("fraction accepted as integer");
        };
        assert_eq!(err.position, Some(1));
        assert_eq!(err.function.as_deref(), Some("m.twice"));
        assert!(matches!(twice.call(vec![Value::Number(300.0)]), Err(HostFailure::Argument(_))));
    }

    #[test]
    fn test_fallible_functions() {
        let mut module = Module::new("m");
        module
            .register("check", |n: f64| {
                if n < 0.0 {
                    Err(format!("negative: {}", n))
                } else {
                    Ok(n.sqrt())
                }
            })
            .unwrap();
        let check = host(&module, "check");
        assert!(check.signature().fallible);
        assert_eq!(check.call(vec![Value::Number(9.0)]).unwrap(), Value::Number(3.0));
        assert_eq!(
            check.call(vec![Value::Number(-1.0)]),
            Err(HostFailure::Failed("negative: -1".to_string()))
        );
    }

    #[test]
    fn test_value_and_table_parameters() {
        let mut module = Module::new("m");
        module
            .register("kind", |v: Value| v.kind().name().to_string())
            .unwrap();
        module
            .register("size", |t: Table| t.len())
            .unwrap();
        module
            .register("keys", |m: BTreeMap<String, f64>| m.into_keys().collect::<Vec<_>>())
            .unwrap();

        assert_eq!(host(&module, "kind").call(vec![]).unwrap(), Value::from("nil"));
        let table: Table = [(Value::from("a"), Value::from(1.0)), (Value::from("b"), Value::from(2.0))]
            .into_iter()
            .collect();
        assert_eq!(
            host(&module, "size").call(vec![Value::Table(table.clone())]).unwrap(),
            Value::Number(2.0)
        );
        let keys = host(&module, "keys").call(vec![Value::Table(table)]).unwrap();
        assert_eq!(keys.as_table().unwrap().get_index(2), Some(&Value::from("b")));
    }

    #[test]
    fn test_tuple_results_are_sequences() {
        let mut module = Module::new("m");
        module
            .register("split", |s: String| {
                let (head, tail) = s.split_at(1);
                (head.to_string(), tail.to_string())
            })
            .unwrap();
        let out = host(&module, "split").call(vec![Value::from("abc")]).unwrap();
        let table = out.as_table().unwrap();
        assert_eq!(table.get_index(1), Some(&Value::from("a")));
        assert_eq!(table.get_index(2), Some(&Value::from("bc")));
    }

    #[test]
    fn test_eight_parameters() {
        let mut module = Module::new("m");
        module
            .register(
                "sum",
                |a: f64, b: f64, c: f64, d: f64, e: f64, f: f64, g: f64, h: f64| {
                    a + b + c + d + e + f + g + h
                },
            )
            .unwrap();
        let args = (1..=8).map(|n| Value::Number(n as f64)).collect();
        assert_eq!(host(&module, "sum").call(args).unwrap(), Value::Number(36.0));
    }
}
