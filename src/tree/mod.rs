//! The sample aggregation engine.
//!
//! Raw sample records are folded into unique [`SampleEntry`] rows keyed by a
//! configurable [`comparator::SampleComparator`]. Call-chain costs are
//! accumulated into ancestors and collected into per-entry
//! [`callchain::CallChainRoot`] tries. The engine is strictly single-threaded;
//! builders own their aggregation state exclusively.

pub mod builder;
pub mod callchain;
pub mod comparator;
pub mod display;

use std::sync::Arc;

use self::callchain::CallChainRoot;

/// Index of an entry inside its builder's arena. Entries reference each other
/// (call-chain membership) through ids, never through owning pointers.
pub type EntryId = usize;

/// Branch-source fields of an entry built from a branch-stack item.
#[derive(Debug, Clone)]
pub struct BranchFrom {
    /// Report path of the image the branch left from.
    pub dso: Arc<str>,
    /// Symbol the branch left from.
    pub symbol: Arc<str>,
    /// Image-relative address of the branch source.
    pub vaddr_in_file: u64,
    /// Raw branch flags from the record.
    pub flags: u64,
}

/// One aggregated report row.
///
/// Identity is defined by the configured comparator over the identity fields;
/// the measure fields add up as equal samples are folded in.
#[derive(Debug)]
pub struct SampleEntry {
    /// Time of the most recent fold.
    pub time: u64,
    /// Self cost.
    pub period: u64,
    /// Cost accumulated by appearing on call chains. Includes the entry's own
    /// period when accumulation is enabled, so `accumulated_period >= period`.
    pub accumulated_period: u64,
    /// Number of raw samples (or branch items) folded in.
    pub sample_count: u64,
    pub cpu: u32,
    pub pid: u32,
    pub tid: u32,
    /// Thread name snapshot taken at fold time.
    pub comm: Arc<str>,
    /// Report path of the image the instruction pointer resolved to.
    pub dso: Arc<str>,
    /// Symbol name (demangled unless demangling is disabled).
    pub symbol: Arc<str>,
    /// Instruction pointer translated into the image's own address space.
    pub vaddr_in_file: u64,
    /// Branch-source fields; only present in branch mode.
    pub branch_from: Option<BranchFrom>,
    /// Union of all call chains observed for this key.
    pub callchain: CallChainRoot,
}

impl SampleEntry {
    fn branch_dso(&self) -> &str {
        self.branch_from.as_ref().map_or("", |b| &b.dso)
    }

    fn branch_symbol(&self) -> &str {
        self.branch_from.as_ref().map_or("", |b| &b.symbol)
    }
}

/// The finished aggregation for one event: entry arena, display order and
/// running totals.
#[derive(Debug)]
pub struct SampleTree {
    /// Entry arena; [`EntryId`]s index into this.
    pub entries: Vec<SampleEntry>,
    /// Entry ids in presentation order.
    pub display_order: Vec<EntryId>,
    pub total_samples: u64,
    pub total_period: u64,
    pub total_error_callchains: u64,
    pub event_name: String,
}

impl SampleTree {
    /// Sort the presentation order with the given sort comparator. The sort
    /// comparator ends with the identity comparator, so ties are broken
    /// deterministically.
    pub fn sort_by(&mut self, sort_comparator: &comparator::SampleComparator) {
        let entries = &self.entries;
        self.display_order
            .sort_by(|&a, &b| sort_comparator.compare(&entries[a], &entries[b]));
    }
}
