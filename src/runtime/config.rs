//! Runtime configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `op_budget` | 128 synchronous steps per fiber turn |
//! | `initial_flags` | interruption, cooperative yielding, supervision |

use crate::fiber::flags::RuntimeFlags;

/// Concrete values driving runtime behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How many synchronous steps a fiber may execute in one turn before
    /// the scheduler forces a cooperative yield.
    pub op_budget: u32,
    /// The runtime flags the root fiber starts with.
    pub initial_flags: RuntimeFlags,
}

impl RuntimeConfig {
    /// The default op budget.
    pub const DEFAULT_OP_BUDGET: u32 = 128;

    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            op_budget: Self::DEFAULT_OP_BUDGET,
            initial_flags: RuntimeFlags::default_flags(),
        }
    }

    /// Sets the per-turn op budget (clamped to at least 1).
    #[must_use]
    pub const fn with_op_budget(mut self, budget: u32) -> Self {
        self.op_budget = if budget == 0 { 1 } else { budget };
        self
    }

    /// Sets the root fiber's starting flags.
    #[must_use]
    pub const fn with_initial_flags(mut self, flags: RuntimeFlags) -> Self {
        self.initial_flags = flags;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::flags::RuntimeFlag;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.op_budget, 128);
        assert!(config.initial_flags.interruption());
        assert!(config.initial_flags.cooperative_yielding());
    }

    #[test]
    fn zero_budget_is_clamped() {
        assert_eq!(RuntimeConfig::new().with_op_budget(0).op_budget, 1);
    }

    #[test]
    fn flags_override() {
        let flags = RuntimeFlags::NONE.enable(RuntimeFlag::Interruption);
        let config = RuntimeConfig::new().with_initial_flags(flags);
        assert!(!config.initial_flags.cooperative_yielding());
    }
}
