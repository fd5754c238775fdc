// src/runtime/context.rs
//! Cancellation contexts and the per-run execution state

use crate::config::ScriptConfig;
use crate::marshal::Record;
use crate::runtime::value::{RecordHandle, Val};
use crate::runtime::vm::GuestError;
use crate::value::{Table, Value};
use crate::ArgumentError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why a run was stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("context cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

/// Host-side handle that can stop a run
///
/// A context carries an optional [`CancellationToken`] and an optional
/// deadline. Scripts poll it at function calls and loop back-edges.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: None,
            deadline: Some(deadline),
        }
    }

    /// Add a deadline to this context, keeping the earlier one
    pub fn and_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Add a cancellation token, replacing any previous one
    pub fn and_cancel(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    /// `Some` once the token fired or the deadline passed
    pub fn done(&self) -> Option<CancelReason> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }
}

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// State of one run: the host context, bound records, call depth and the
/// interrupt budget
pub struct ExecutionContext<'r> {
    context: &'r Context,
    records: Vec<&'r mut (dyn Record + 'r)>,
    run_id: u64,
    depth: usize,
    max_depth: usize,
    fuel: u32,
    interval: u32,
}

impl<'r> ExecutionContext<'r> {
    pub fn new(context: &'r Context, config: &ScriptConfig) -> Self {
        let interval = config.interrupt_interval.max(1);
        Self {
            context,
            records: Vec::new(),
            run_id: NEXT_RUN.fetch_add(1, Ordering::Relaxed),
            depth: 0,
            max_depth: config.max_call_depth,
            fuel: interval,
            interval,
        }
    }

    /// Bind a host record to this run and return its proxy
    pub fn bind(&mut self, record: &'r mut (dyn Record + 'r)) -> Val {
        self.records.push(record);
        Val::Record(RecordHandle {
            run: self.run_id,
            slot: self.records.len() - 1,
        })
    }

    /// Count one checkpoint, polling the host context when the budget runs
    /// out
    #[inline]
    pub fn checkpoint(&mut self) -> Result<(), GuestError> {
        self.fuel -= 1;
        if self.fuel == 0 {
            self.fuel = self.interval;
            if let Some(reason) = self.context.done() {
                return Err(GuestError::Cancelled(reason));
            }
        }
        Ok(())
    }

    /// Enter a function call
    #[inline]
    pub fn enter(&mut self) -> Result<(), GuestError> {
        if self.depth >= self.max_depth {
            return Err(GuestError::Runtime(Val::str("stack overflow")));
        }
        self.checkpoint()?;
        self.depth += 1;
        Ok(())
    }

    #[inline]
    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn record(&self, handle: RecordHandle) -> Result<&(dyn Record + 'r), String> {
        if handle.run != self.run_id {
            return Err(stale_record());
        }
        self.records
            .get(handle.slot)
            .map(|r| &**r)
            .ok_or_else(stale_record)
    }

    pub fn record_mut(&mut self, handle: RecordHandle) -> Result<&mut (dyn Record + 'r), String> {
        if handle.run != self.run_id {
            return Err(stale_record());
        }
        match self.records.get_mut(handle.slot) {
            Some(record) => Ok(&mut **record),
            None => Err(stale_record()),
        }
    }

    /// Deep-copy a VM value into a host value
    pub fn export(&self, value: &Val) -> Result<Value, ArgumentError> {
        let mut path = Vec::new();
        self.export_inner(value, &mut path)
    }

    fn export_inner(&self, value: &Val, path: &mut Vec<usize>) -> Result<Value, ArgumentError> {
        let value = match value {
            Val::Nil => Value::Nil,
            Val::Bool(b) => Value::Bool(*b),
            Val::Number(n) => Value::Number(*n),
            Val::Str(s) => Value::String(s.to_string()),
            Val::Function(_) => return Err(ArgumentError::mismatch("value", "function")),
            Val::Record(handle) => {
                let record = self.record(*handle).map_err(ArgumentError::custom)?;
                Value::Table(record.snapshot()?)
            }
            Val::Table(table) => {
                let ptr = table.ptr();
                if path.contains(&ptr) {
                    return Err(ArgumentError::custom("cannot marshal a table that contains itself"));
                }
                // Copy the entries out so no lock is held while recursing
                let entries = table.lock().snapshot();
                path.push(ptr);
                let mut out = Table::with_capacity(entries.len());
                for (k, v) in &entries {
                    let key = self.export_inner(k, path)?;
                    let value = self.export_inner(v, path)?;
                    out.push_unique(key, value);
                }
                path.pop();
                Value::Table(out)
            }
        };
        Ok(value)
    }
}

fn stale_record() -> String {
    "record is no longer bound to a running script".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::TableRef;

    struct Counter {
        hits: i64,
    }

    crate::record!(Counter { "Hits" => hits });

    #[test]
    fn test_background_is_never_done() {
        assert_eq!(Context::background().done(), None);
    }

    #[test]
    fn test_cancel_and_deadline() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancel(token.clone());
        assert_eq!(ctx.done(), None);
        token.cancel();
        assert_eq!(ctx.done(), Some(CancelReason::Cancelled));

        let ctx = Context::with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(ctx.done(), Some(CancelReason::DeadlineExceeded));

        let ctx = Context::with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.done(), None);
        assert!(ctx.deadline().is_some());
    }

    #[test]
    fn test_checkpoint_polls_every_interval() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = Context::with_cancel(token);
        let config = ScriptConfig::default().with_interrupt_interval(3);
        let mut exec = ExecutionContext::new(&ctx, &config);

        assert!(exec.checkpoint().is_ok());
        assert!(exec.checkpoint().is_ok());
        assert!(matches!(
            exec.checkpoint(),
            Err(GuestError::Cancelled(CancelReason::Cancelled))
        ));
    }

    #[test]
    fn test_call_depth_limit() {
        let ctx = Context::background();
        let config = ScriptConfig::default().with_max_call_depth(2);
        let mut exec = ExecutionContext::new(&ctx, &config);
        exec.enter().unwrap();
        exec.enter().unwrap();
        assert!(matches!(exec.enter(), Err(GuestError::Runtime(_))));
        exec.leave();
        assert!(exec.enter().is_ok());
    }

    #[test]
    fn test_export_tables_and_records() {
        let ctx = Context::background();
        let config = ScriptConfig::default();
        let mut counter = Counter { hits: 3 };
        let mut exec = ExecutionContext::new(&ctx, &config);
        let proxy = exec.bind(&mut counter);

        let table = TableRef::new();
        table.set_str("counter", proxy);
        table.set(Val::Number(1.0), Val::str("first")).unwrap();

        let exported = exec.export(&Val::Table(table)).unwrap();
        let exported = exported.as_table().unwrap();
        assert_eq!(exported.get_index(1), Some(&Value::from("first")));
        let counter = exported.get("counter").unwrap().as_table().unwrap();
        assert_eq!(counter.get("Hits"), Some(&Value::Number(3.0)));
    }

    #[test]
    fn test_export_rejects_cycles() {
        let ctx = Context::background();
        let config = ScriptConfig::default();
        let exec = ExecutionContext::new(&ctx, &config);

        let table = TableRef::new();
        table.set_str("self", Val::Table(table.clone()));
        assert!(exec.export(&Val::Table(table.clone())).is_err());
        // Break the cycle so the table is freed
        table.set_str("self", Val::Nil);

        // Shared but acyclic references are fine
        let shared = TableRef::new();
        let outer = TableRef::new();
        outer.set_str("a", Val::Table(shared.clone()));
        outer.set_str("b", Val::Table(shared));
        assert!(exec.export(&Val::Table(outer)).is_ok());
    }

    #[test]
    fn test_stale_handles_are_rejected() {
        let ctx = Context::background();
        let config = ScriptConfig::default();
        let exec = ExecutionContext::new(&ctx, &config);
        let handle = RecordHandle { run: 0, slot: 0 };
        assert!(exec.record(handle).is_err());
        assert!(exec.export(&Val::Record(handle)).is_err());
    }
}
