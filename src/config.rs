// src/config.rs
//! Execution limits applied to every run of a script

use serde::{Deserialize, Serialize};

/// Limits for a compiled [`Script`](crate::Script)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum nesting of guest and host calls before a run fails with a
    /// stack overflow error
    pub max_call_depth: usize,

    /// Number of checkpoints (calls and loop back-edges) between two polls
    /// of the cancellation context. `1` polls at every checkpoint.
    pub interrupt_interval: u32,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 200,
            interrupt_interval: 1024,
        }
    }
}

impl ScriptConfig {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_interrupt_interval(mut self, interval: u32) -> Self {
        self.interrupt_interval = interval.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config = ScriptConfig::default();
        assert_eq!(config.max_call_depth, 200);

        let config = config.with_interrupt_interval(0).with_max_call_depth(16);
        assert_eq!(config.interrupt_interval, 1);
        assert_eq!(config.max_call_depth, 16);

        let parsed: ScriptConfig = serde_json::from_str(r#"{"max_call_depth":8}"#).unwrap();
        assert_eq!(parsed.max_call_depth, 8);
        assert_eq!(parsed.interrupt_interval, 1024);
    }
}
