//! Folds raw sample records into a tree of unique sample entries.
//!
//! One builder exists per recorded event. The builder owns its entry arena
//! exclusively; identity is decided by the configured comparator, and the
//! comparator-sorted index gives set semantics over the arena.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::record::SampleRecord;
use crate::symbols::ThreadTable;

use super::comparator::SampleComparator;
use super::{BranchFrom, EntryId, SampleEntry, SampleTree};
use super::callchain::CallChainRoot;

/// How a sample's period is computed.
///
/// `EventCount` takes the period straight from the record. `TimeDelta`
/// models off-CPU time: each record is held per-tid until its successor
/// arrives, and is then emitted with the elapsed time between the two as its
/// period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodPolicy {
    EventCount,
    TimeDelta,
}

/// User-supplied allowlists applied when an entry is created. An empty list
/// places no restriction.
#[derive(Debug, Default, Clone)]
pub struct SampleFilters {
    pub cpus: HashSet<u32>,
    pub pids: HashSet<u32>,
    pub tids: HashSet<u32>,
    pub comms: HashSet<String>,
    pub dsos: HashSet<String>,
    pub symbols: HashSet<String>,
}

impl SampleFilters {
    fn accepts(&self, entry: &SampleEntry) -> bool {
        if !self.cpus.is_empty() && !self.cpus.contains(&entry.cpu) {
            return false;
        }
        if !self.pids.is_empty() && !self.pids.contains(&entry.pid) {
            return false;
        }
        if !self.tids.is_empty() && !self.tids.contains(&entry.tid) {
            return false;
        }
        if !self.comms.is_empty() && !self.comms.contains(&*entry.comm) {
            return false;
        }
        if !self.dsos.is_empty() && !self.dsos.contains(&*entry.dso) {
            return false;
        }
        if !self.symbols.is_empty() && !self.symbols.contains(&*entry.symbol) {
            return false;
        }
        true
    }
}

/// Construction-time options for a builder.
#[derive(Debug, Default, Clone)]
pub struct BuilderOptions {
    pub use_branch_address: bool,
    /// Accumulate call-chain costs into ancestors (`--children`).
    pub accumulate_callchain: bool,
    /// Build per-entry call-chain tries for the call-graph printer.
    pub build_callchain: bool,
    /// Root the printed graph at the outermost caller (default) rather than
    /// the sampled function.
    pub use_caller_as_callchain_root: bool,
}

pub struct SampleTreeBuilder {
    comparator: SampleComparator,
    entries: Vec<SampleEntry>,
    /// Entry ids kept sorted by `comparator`; binary search over this gives
    /// set semantics.
    index: Vec<EntryId>,
    policy: PeriodPolicy,
    /// TimeDelta only: the most recent record per tid, awaiting its
    /// successor.
    pending: HashMap<u32, SampleRecord>,
    filters: SampleFilters,
    opts: BuilderOptions,
    total_samples: u64,
    total_period: u64,
    total_error_callchains: u64,
    event_name: String,
}

impl SampleTreeBuilder {
    pub fn new(comparator: SampleComparator, policy: PeriodPolicy) -> Self {
        Self {
            comparator,
            entries: Vec::new(),
            index: Vec::new(),
            policy,
            pending: HashMap::new(),
            filters: SampleFilters::default(),
            opts: BuilderOptions::default(),
            total_samples: 0,
            total_period: 0,
            total_error_callchains: 0,
            event_name: String::new(),
        }
    }

    pub fn set_filters(&mut self, filters: SampleFilters) {
        self.filters = filters;
    }

    pub fn set_options(&mut self, opts: BuilderOptions) {
        self.opts = opts;
    }

    pub fn set_event_name(&mut self, name: &str) {
        self.event_name = name.to_string();
    }

    /// Fold one sample record in. With the `TimeDelta` policy the record may
    /// be held until its per-tid successor arrives.
    pub fn process_sample_record(&mut self, registry: &mut ThreadTable, record: &SampleRecord) {
        match self.policy {
            PeriodPolicy::EventCount => {
                self.ingest(registry, record, record.period);
            }
            PeriodPolicy::TimeDelta => match self.pending.entry(record.tid) {
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
                Entry::Occupied(mut slot) => {
                    let prev = slot.insert(record.clone());
                    let period = if record.time > prev.time {
                        record.time - prev.time
                    } else {
                        // Out-of-order timestamps; fall back to a unit period.
                        tracing::debug!(
                            tid = record.tid,
                            prev_time = prev.time,
                            time = record.time,
                            "sample time inversion, using period 1"
                        );
                        1
                    };
                    self.ingest(registry, &prev, period);
                }
            },
        }
    }

    fn ingest(&mut self, registry: &mut ThreadTable, record: &SampleRecord, period: u64) {
        if self.opts.use_branch_address {
            for item in &record.branch_stack {
                if item.from != 0 && item.to != 0 {
                    self.create_branch_sample(registry, record, item.from, item.to, item.flags);
                }
            }
            return;
        }
        let acc_info = period;
        let Some(sample_id) = self.create_sample(registry, record, period) else {
            return;
        };
        if self.opts.accumulate_callchain || self.opts.build_callchain {
            self.process_callchain(registry, record, sample_id, acc_info);
        }
    }

    fn create_sample(
        &mut self,
        registry: &mut ThreadTable,
        record: &SampleRecord,
        period: u64,
    ) -> Option<EntryId> {
        let thread = registry.find_thread_or_new(record.pid, record.tid);
        let map = registry.find_map(record.pid, record.ip, Some(record.in_kernel));
        let (symbol, vaddr_in_file) = registry.find_symbol(&map, record.ip);
        self.insert_sample(SampleEntry {
            time: record.time,
            period,
            accumulated_period: 0,
            sample_count: 1,
            cpu: record.cpu,
            pid: record.pid,
            tid: record.tid,
            comm: thread.comm,
            dso: map.path,
            symbol,
            vaddr_in_file,
            branch_from: None,
            callchain: CallChainRoot::default(),
        })
    }

    fn create_branch_sample(
        &mut self,
        registry: &mut ThreadTable,
        record: &SampleRecord,
        from: u64,
        to: u64,
        flags: u64,
    ) -> Option<EntryId> {
        let thread = registry.find_thread_or_new(record.pid, record.tid);
        let from_map = registry.find_map(record.pid, from, None);
        let (from_symbol, from_vaddr) = registry.find_symbol(&from_map, from);
        let to_map = registry.find_map(record.pid, to, None);
        let (to_symbol, to_vaddr) = registry.find_symbol(&to_map, to);
        self.insert_sample(SampleEntry {
            time: record.time,
            period: record.period,
            accumulated_period: 0,
            sample_count: 1,
            cpu: record.cpu,
            pid: record.pid,
            tid: record.tid,
            comm: thread.comm,
            dso: to_map.path,
            symbol: to_symbol,
            vaddr_in_file: to_vaddr,
            branch_from: Some(BranchFrom {
                dso: from_map.path,
                symbol: from_symbol,
                vaddr_in_file: from_vaddr,
                flags,
            }),
            callchain: CallChainRoot::default(),
        })
    }

    /// Insert an originating sample: filter, update totals, then merge into
    /// an equal entry or keep as new. Totals always add the new sample's own
    /// values, never merged ones.
    fn insert_sample(&mut self, entry: SampleEntry) -> Option<EntryId> {
        if !self.filters.accepts(&entry) {
            return None;
        }
        self.update_summary(&entry);
        Some(match self.search(&entry) {
            Ok(pos) => {
                let id = self.index[pos];
                let existing = &mut self.entries[id];
                existing.period += entry.period;
                existing.accumulated_period += entry.accumulated_period;
                existing.sample_count += entry.sample_count;
                id
            }
            Err(pos) => self.store(entry, pos),
        })
    }

    fn update_summary(&mut self, entry: &SampleEntry) {
        self.total_samples += entry.sample_count;
        self.total_period += entry.period;
    }

    /// Expand the record's frame list into call-chain entries, accumulating
    /// `acc_info` into each (and into the originating entry itself), then
    /// record the chain in the trie of every entry along it.
    fn process_callchain(
        &mut self,
        registry: &mut ThreadTable,
        record: &SampleRecord,
        sample_id: EntryId,
        acc_info: u64,
    ) {
        self.entries[sample_id].accumulated_period += acc_info;

        let mut chain = vec![sample_id];
        let mut frames = record.callchain.as_slice();
        // The unwinder's first frame usually repeats the sampled ip.
        if frames.first() == Some(&record.ip) {
            frames = &frames[1..];
        }
        let comm = self.entries[sample_id].comm.clone();
        for &ip in frames {
            let map = registry.find_map(record.pid, ip, None);
            if map.is_unknown() {
                // Unwinders can produce addresses that map to no image; drop
                // the rest of this chain.
                self.total_error_callchains += 1;
                break;
            }
            let (symbol, vaddr_in_file) = registry.find_symbol(&map, ip);
            let entry = SampleEntry {
                time: record.time,
                period: 0,
                accumulated_period: acc_info,
                sample_count: 0,
                cpu: record.cpu,
                pid: record.pid,
                tid: record.tid,
                comm: comm.clone(),
                dso: map.path,
                symbol,
                vaddr_in_file,
                branch_from: None,
                callchain: CallChainRoot::default(),
            };
            let id = self.insert_callchain_sample(entry, &chain);
            chain.push(id);
        }

        if self.opts.build_callchain && chain.len() >= 2 {
            if self.opts.use_caller_as_callchain_root {
                chain.reverse();
            }
            // Every entry along the chain records the suffix above it, so
            // each row's printed graph starts at that row. Recursive chains
            // only insert once per entry.
            let mut added = HashSet::new();
            for pos in 0..chain.len() - 1 {
                let id = chain[pos];
                if !added.insert(id) {
                    continue;
                }
                let suffix = chain[pos + 1..].to_vec();
                self.entries[id].callchain.add_callchain(&suffix, acc_info);
            }
        }
    }

    /// Insert a call-chain entry: no filtering, no totals. Merging into an
    /// entry already on this sample's chain does not accumulate again, so a
    /// recursive function is only charged once per originating sample.
    fn insert_callchain_sample(&mut self, entry: SampleEntry, chain: &[EntryId]) -> EntryId {
        match self.search(&entry) {
            Ok(pos) => {
                let id = self.index[pos];
                if !chain.contains(&id) {
                    self.entries[id].accumulated_period += entry.accumulated_period;
                }
                id
            }
            Err(pos) => self.store(entry, pos),
        }
    }

    fn search(&self, entry: &SampleEntry) -> Result<usize, usize> {
        self.index
            .binary_search_by(|&id| self.comparator.compare(&self.entries[id], entry))
    }

    fn store(&mut self, entry: SampleEntry, pos: usize) -> EntryId {
        let id = self.entries.len();
        self.entries.push(entry);
        self.index.insert(pos, id);
        id
    }

    /// Finish the aggregation: mark duplicated chains, order each trie for
    /// presentation and hand out the tree.
    pub fn finish(mut self) -> SampleTree {
        if self.opts.build_callchain {
            let mut marks = HashSet::new();
            for id in 0..self.entries.len() {
                self.entries[id]
                    .callchain
                    .collect_path_duplicates(id, &mut marks);
            }
            for id in marks {
                self.entries[id].callchain.duplicated = true;
            }
            for entry in &mut self.entries {
                entry.callchain.sort_by_period();
            }
        }
        SampleTree {
            display_order: self.index,
            entries: self.entries,
            total_samples: self.total_samples,
            total_period: self.total_period,
            total_error_callchains: self.total_error_callchains,
            event_name: self.event_name,
        }
    }
}
