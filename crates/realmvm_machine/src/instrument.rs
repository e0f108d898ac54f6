//! Optional coverage and profiling hooks.
//!
//! Both hooks are absent by default and never change what the machine
//! computes. Shared handles (`Rc<RefCell<T>>`) implement the traits so a
//! host can keep a handle and read the data after a run.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use crate::op::Op;

/// Receives every executed source line.
pub trait CoverageTracker {
    /// Called when a statement annotated with a line starts executing.
    fn record_line_executed(&mut self, pkg_path: &str, file: &str, line: u32);
}

/// Receives the estimated cost of every dispatched op.
pub trait Profiler {
    /// Called once per dispatch.
    fn record_op_cost(&mut self, op: Op, cycles: u64, alloc: u64);
}

impl<T: CoverageTracker> CoverageTracker for Rc<RefCell<T>> {
    fn record_line_executed(&mut self, pkg_path: &str, file: &str, line: u32) {
        self.borrow_mut().record_line_executed(pkg_path, file, line);
    }
}

impl<T: Profiler> Profiler for Rc<RefCell<T>> {
    fn record_op_cost(&mut self, op: Op, cycles: u64, alloc: u64) {
        self.borrow_mut().record_op_cost(op, cycles, alloc);
    }
}

// =============================================================================
// Line coverage
// =============================================================================

/// Executed lines per `(package, file)`.
#[derive(Clone, Debug, Default)]
pub struct LineCoverage {
    lines: BTreeMap<(String, String), BTreeSet<u32>>,
}

impl LineCoverage {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Executed lines of one file, in order.
    #[must_use]
    pub fn lines(&self, pkg_path: &str, file: &str) -> Vec<u32> {
        self.lines
            .get(&(pkg_path.to_string(), file.to_string()))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of distinct executed lines across all files.
    #[must_use]
    pub fn total(&self) -> usize {
        self.lines.values().map(BTreeSet::len).sum()
    }
}

impl CoverageTracker for LineCoverage {
    fn record_line_executed(&mut self, pkg_path: &str, file: &str, line: u32) {
        self.lines
            .entry((pkg_path.to_string(), file.to_string()))
            .or_default()
            .insert(line);
    }
}

// =============================================================================
// Op profile
// =============================================================================

/// Dispatch counts and cycle totals per op name.
#[derive(Clone, Debug, Default)]
pub struct OpProfile {
    counts: HashMap<&'static str, (u64, u64)>,
    total_cycles: u64,
    total_alloc: u64,
}

impl OpProfile {
    /// Creates an empty profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Times an op was dispatched.
    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).map_or(0, |(n, _)| *n)
    }

    /// Cycles charged for an op.
    #[must_use]
    pub fn cycles(&self, name: &str) -> u64 {
        self.counts.get(name).map_or(0, |(_, c)| *c)
    }

    /// Cycles charged across all ops.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Allocation estimate across all ops.
    #[must_use]
    pub fn total_alloc(&self) -> u64 {
        self.total_alloc
    }

    /// Ops sorted by charged cycles, most expensive first.
    #[must_use]
    pub fn hottest(&self) -> Vec<(&'static str, u64)> {
        let mut v: Vec<_> = self.counts.iter().map(|(k, (_, c))| (*k, *c)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        v
    }
}

impl Profiler for OpProfile {
    fn record_op_cost(&mut self, op: Op, cycles: u64, alloc: u64) {
        let entry = self.counts.entry(op.name()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += cycles;
        self.total_cycles += cycles;
        self.total_alloc += alloc;
    }
}
