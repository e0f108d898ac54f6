//! Machine configuration.

/// Configuration for a [`crate::Machine`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineOptions {
    /// Cycle budget per entry point (0 = unlimited).
    pub max_cycles: u64,

    /// Reject any mutation of durable state.
    pub read_only: bool,

    /// Record New/Mod/Del operations on every realm.
    pub realm_op_log: bool,
}

impl MachineOptions {
    /// Creates a configuration for queries that must not mutate state.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Creates a configuration with a cycle budget.
    #[must_use]
    pub fn metered(limit: u64) -> Self {
        Self {
            max_cycles: limit,
            ..Self::default()
        }
    }

    /// Builder method to set the cycle budget.
    #[must_use]
    pub fn with_max_cycles(mut self, limit: u64) -> Self {
        self.max_cycles = limit;
        self
    }

    /// Builder method to set read-only mode.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Builder method to enable/disable realm operation logs.
    #[must_use]
    pub fn with_realm_op_log(mut self, log: bool) -> Self {
        self.realm_op_log = log;
        self
    }
}
