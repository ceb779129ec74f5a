//! Composable orderings over sample entries.
//!
//! A comparator is an ordered list of field-comparator functions; the
//! composite yields the first non-equal result. The same object defines
//! equality for aggregation and the sort order for presentation, so no
//! trait-object hierarchy is needed.

use std::cmp::Ordering;

use super::SampleEntry;

/// A single field comparison.
pub type CompareFn = fn(&SampleEntry, &SampleEntry) -> Ordering;

/// An ordered list of field comparators.
#[derive(Clone, Default)]
pub struct SampleComparator {
    fns: Vec<CompareFn>,
}

impl SampleComparator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one field comparison.
    pub fn add_compare_function(&mut self, f: CompareFn) {
        self.fns.push(f);
    }

    /// Append every comparison of another comparator.
    pub fn add_comparator(&mut self, other: &SampleComparator) {
        self.fns.extend_from_slice(&other.fns);
    }

    /// Compare two entries field by field; the first non-equal result wins.
    pub fn compare(&self, a: &SampleEntry, b: &SampleEntry) -> Ordering {
        for f in &self.fns {
            let ord = f(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Whether two entries aggregate into the same row.
    pub fn is_same(&self, a: &SampleEntry, b: &SampleEntry) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

pub fn compare_pid(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.pid.cmp(&b.pid)
}

pub fn compare_tid(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.tid.cmp(&b.tid)
}

pub fn compare_comm(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.comm.cmp(&b.comm)
}

pub fn compare_dso(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.dso.cmp(&b.dso)
}

pub fn compare_symbol(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.symbol.cmp(&b.symbol)
}

pub fn compare_vaddr_in_file(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.vaddr_in_file.cmp(&b.vaddr_in_file)
}

pub fn compare_dso_from(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.branch_dso().cmp(b.branch_dso())
}

pub fn compare_symbol_from(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.branch_symbol().cmp(b.branch_symbol())
}

/// Self-plus-accumulated period, descending. The primary sort key of the
/// report.
pub fn compare_total_period(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    let ta = a.period.max(a.accumulated_period);
    let tb = b.period.max(b.accumulated_period);
    tb.cmp(&ta)
}

/// Self period, descending.
pub fn compare_period(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    b.period.cmp(&a.period)
}

/// Entries whose call chain is part of another entry's chain sort last among
/// otherwise-equal rows.
pub fn compare_callchain_duplicated(a: &SampleEntry, b: &SampleEntry) -> Ordering {
    a.callchain.duplicated.cmp(&b.callchain.duplicated)
}
