//! The report command: drives the decoder, registry and engine, and prints
//! the aggregated breakdown.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::record::{EventAttr, Record, RecordFileReader, SampleRecord};
use crate::record::{META_SYSTEM_WIDE, META_TRACE_OFFCPU};
use crate::symbols::{Symbol, ThreadTable};
use crate::tree::builder::{
    BuilderOptions, PeriodPolicy, SampleFilters, SampleTreeBuilder,
};
use crate::tree::comparator::{self, SampleComparator};
use crate::tree::display::{self, CallgraphDisplayer, SampleDisplayer};
use crate::tree::SampleTree;

/// Tracepoint name that drives the off-CPU fan-out.
const SCHED_SWITCH_EVENT: &str = "sched:sched_switch";

/// Sort keys that are only valid in branch mode.
const BRANCH_SORT_KEYS: &[&str] = &["dso_from", "dso_to", "symbol_from", "symbol_to"];

/// Everything the report command needs, already parsed from the CLI.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub record_file: PathBuf,
    /// Report destination; stdout when unset.
    pub report_file: Option<PathBuf>,
    pub use_branch_address: bool,
    pub accumulate_callchain: bool,
    pub print_callgraph: bool,
    pub callgraph_show_callee: bool,
    pub full_callgraph: bool,
    pub max_stack: u32,
    pub percent_limit: f64,
    pub print_sample_count: bool,
    pub demangle: bool,
    pub show_ip: bool,
    pub csv: bool,
    pub raw_period: bool,
    pub sort_keys: Vec<String>,
    pub comm_filter: HashSet<String>,
    pub dso_filter: HashSet<String>,
    pub symbol_filter: HashSet<String>,
    pub cpu_filter: HashSet<u32>,
    pub pid_filter: HashSet<u32>,
    pub tid_filter: HashSet<u32>,
    pub kallsyms: Option<PathBuf>,
    pub vmlinux: Option<PathBuf>,
    pub symfs: Option<PathBuf>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            record_file: PathBuf::from("perf.data"),
            report_file: None,
            use_branch_address: false,
            accumulate_callchain: false,
            print_callgraph: false,
            callgraph_show_callee: false,
            full_callgraph: false,
            max_stack: u32::MAX,
            percent_limit: 0.0,
            print_sample_count: false,
            demangle: true,
            show_ip: true,
            csv: false,
            raw_period: false,
            sort_keys: default_sort_keys(),
            comm_filter: HashSet::new(),
            dso_filter: HashSet::new(),
            symbol_filter: HashSet::new(),
            cpu_filter: HashSet::new(),
            pid_filter: HashSet::new(),
            tid_filter: HashSet::new(),
            kallsyms: None,
            vmlinux: None,
            symfs: None,
        }
    }
}

/// The default aggregation and sort keys.
pub fn default_sort_keys() -> Vec<String> {
    ["comm", "pid", "tid", "dso", "symbol"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub struct ReportCommand {
    opts: ReportOptions,
    comparator: SampleComparator,
    sort_comparator: SampleComparator,
    displayer: SampleDisplayer,
    registry: ThreadTable,
    attrs: Vec<EventAttr>,
    trees: Vec<SampleTree>,
    record_cmdline: String,
    record_arch: String,
    trace_offcpu: bool,
    system_wide: bool,
    sched_switch_attr_id: usize,
}

impl ReportCommand {
    /// Validate the options and assemble the comparator and displayer.
    /// Configuration errors surface here, before any record is read.
    pub fn new(opts: ReportOptions) -> Result<Self> {
        let (comparator, displayer) = build_comparator_and_displayer(&opts)?;

        let mut sort_comparator = SampleComparator::new();
        sort_comparator.add_compare_function(comparator::compare_total_period);
        if opts.print_callgraph {
            sort_comparator.add_compare_function(comparator::compare_callchain_duplicated);
        }
        sort_comparator.add_compare_function(comparator::compare_period);
        sort_comparator.add_comparator(&comparator);

        Ok(Self {
            opts,
            comparator,
            sort_comparator,
            displayer,
            registry: ThreadTable::new(),
            attrs: Vec::new(),
            trees: Vec::new(),
            record_cmdline: String::new(),
            record_arch: String::new(),
            trace_offcpu: false,
            system_wide: false,
            sched_switch_attr_id: 0,
        })
    }

    /// Read the record file, build the sample trees and print the report.
    pub fn run(mut self) -> Result<()> {
        self.configure_registry()?;
        self.read_sample_trees()?;
        self.print_report()
    }

    fn configure_registry(&mut self) -> Result<()> {
        self.registry.set_demangle(self.opts.demangle);
        self.registry.set_show_ip_for_unknown_symbol(self.opts.show_ip);
        if let Some(dir) = &self.opts.symfs {
            self.registry.set_symfs_dir(dir)?;
        }
        if let Some(path) = &self.opts.kallsyms {
            self.registry.load_kernel_symbols(path)?;
        }
        if let Some(path) = &self.opts.vmlinux {
            self.registry.load_kernel_symbols(path)?;
        }
        Ok(())
    }

    fn read_sample_trees(&mut self) -> Result<()> {
        let mut reader = RecordFileReader::open(&self.opts.record_file)?;

        self.trace_offcpu = reader.meta_bool(META_TRACE_OFFCPU);
        self.system_wide = reader.meta_bool(META_SYSTEM_WIDE);
        self.record_cmdline = reader.cmdline().join(" ");
        self.record_arch = reader.arch().to_string();
        if reader.meta().contains_key(META_SYSTEM_WIDE)
            && cmdline_requests_system_wide(reader.cmdline())
        {
            // TODO: replace the cmdline scan once the container carries a
            // definitive meta key for this.
            self.system_wide = true;
        }
        tracing::debug!(
            system_wide = self.system_wide,
            trace_offcpu = self.trace_offcpu,
            "record meta"
        );

        self.attrs = reader.attrs().to_vec();
        if self.attrs.is_empty() {
            bail!(
                "{} contains no event attrs",
                self.opts.record_file.display()
            );
        }
        if self.opts.use_branch_address
            && !self.attrs.iter().all(EventAttr::has_branch_stack)
        {
            bail!(
                "{} is not recorded with branch stack sampling",
                self.opts.record_file.display()
            );
        }
        if self.trace_offcpu {
            self.sched_switch_attr_id = self
                .attrs
                .iter()
                .position(|a| a.name == SCHED_SWITCH_EVENT)
                .with_context(|| {
                    format!(
                        "off-cpu recording without a {SCHED_SWITCH_EVENT} event attr"
                    )
                })?;
        }

        let policy = if self.trace_offcpu {
            PeriodPolicy::TimeDelta
        } else {
            PeriodPolicy::EventCount
        };
        let builder_opts = BuilderOptions {
            use_branch_address: self.opts.use_branch_address,
            accumulate_callchain: self.opts.accumulate_callchain,
            build_callchain: self.opts.print_callgraph,
            use_caller_as_callchain_root: !self.opts.callgraph_show_callee,
        };
        let filters = SampleFilters {
            cpus: self.opts.cpu_filter.clone(),
            pids: self.opts.pid_filter.clone(),
            tids: self.opts.tid_filter.clone(),
            comms: self.opts.comm_filter.clone(),
            dsos: self.opts.dso_filter.clone(),
            symbols: self.opts.symbol_filter.clone(),
        };
        let mut builders: Vec<SampleTreeBuilder> = self
            .attrs
            .iter()
            .map(|attr| {
                let mut b = SampleTreeBuilder::new(self.comparator.clone(), policy);
                b.set_filters(filters.clone());
                b.set_options(builder_opts.clone());
                b.set_event_name(&attr.name);
                b
            })
            .collect();

        let registry = &mut self.registry;
        let attrs = &mut self.attrs;
        let trace_offcpu = self.trace_offcpu;
        let sched_id = self.sched_switch_attr_id;
        reader.for_each_record(|record| {
            match record {
                Record::Comm(r) => registry.set_thread_comm(r.pid, r.tid, &r.comm),
                Record::MapImage(r) => {
                    registry.add_map(r.pid, r.in_kernel, r.start, r.len, r.pgoff, &r.path)
                }
                Record::ImageSymbols(r) => {
                    let symbols = r
                        .symbols
                        .into_iter()
                        .map(|(addr, len, name)| Symbol {
                            addr,
                            len,
                            name: name.into(),
                        })
                        .collect();
                    registry.add_image_symbols(&r.path, r.in_kernel, symbols);
                }
                Record::TracingData(r) => apply_tracing_data(attrs, &r.events),
                Record::Comment(text) => tracing::debug!(%text, "comment record"),
                Record::Sample(r) => {
                    dispatch_sample(&mut builders, registry, trace_offcpu, sched_id, &r)?
                }
            }
            Ok(())
        })?;

        // Tracing data seen mid-stream may have renamed tracepoint attrs.
        for (builder, attr) in builders.iter_mut().zip(self.attrs.iter()) {
            builder.set_event_name(&attr.name);
        }
        self.trees = builders.into_iter().map(SampleTreeBuilder::finish).collect();
        for tree in &mut self.trees {
            tree.sort_by(&self.sort_comparator);
        }
        Ok(())
    }

    fn print_report(&mut self) -> Result<()> {
        let result = match &self.opts.report_file {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("failed to open file {}", path.display()))?;
                let mut w = BufWriter::new(file);
                self.write_report(&mut w).and_then(|()| w.flush())
            }
            None => {
                let stdout = io::stdout();
                let mut w = stdout.lock();
                self.write_report(&mut w).and_then(|()| w.flush())
            }
        };
        result.context("print report failed")
    }

    fn write_report(&self, w: &mut dyn Write) -> io::Result<()> {
        if !self.record_cmdline.is_empty() {
            writeln!(w, "Cmdline: {}", self.record_cmdline)?;
        }
        writeln!(w, "Arch: {}", self.record_arch)?;
        if self.system_wide {
            writeln!(w, "System-wide: true")?;
        }
        for (i, attr) in self.attrs.iter().enumerate() {
            if self.trace_offcpu && i == self.sched_switch_attr_id {
                continue;
            }
            if i != 0 {
                writeln!(w)?;
            }
            let tree = &self.trees[i];
            writeln!(
                w,
                "Event: {} (type {}, config {})",
                attr.name, attr.kind, attr.config
            )?;
            writeln!(w, "Samples: {}", tree.total_samples)?;
            if tree.total_error_callchains != 0 {
                writeln!(
                    w,
                    "Error Callchains: {}, {:.2}%",
                    tree.total_error_callchains,
                    tree.total_error_callchains as f64 * 100.0 / tree.total_samples as f64
                )?;
            }
            let period_prefix = if self.trace_offcpu {
                "Time in ns"
            } else {
                "Event count"
            };
            writeln!(w, "{}: {}\n", period_prefix, tree.total_period)?;
            self.displayer.display_samples(w, tree)?;
        }
        Ok(())
    }
}

fn dispatch_sample(
    builders: &mut [SampleTreeBuilder],
    registry: &mut ThreadTable,
    trace_offcpu: bool,
    sched_id: usize,
    record: &SampleRecord,
) -> Result<()> {
    let attr_index = record.attr_index as usize;
    if attr_index >= builders.len() {
        bail!(
            "sample references attr {} but the file declares {}",
            attr_index,
            builders.len()
        );
    }
    if trace_offcpu && attr_index == sched_id {
        // Broadcast the off-CPU boundary into every other pipeline; the
        // driver's own aggregation is suppressed at print time.
        for (i, builder) in builders.iter_mut().enumerate() {
            if i != sched_id {
                builder.process_sample_record(registry, record);
            }
        }
    } else {
        builders[attr_index].process_sample_record(registry, record);
    }
    Ok(())
}

fn apply_tracing_data(attrs: &mut [EventAttr], events: &[(u64, String)]) {
    for attr in attrs.iter_mut() {
        if attr.is_tracepoint() {
            if let Some((_, name)) = events.iter().find(|(id, _)| *id == attr.config) {
                attr.name = name.clone();
            }
        }
    }
}

/// The recorder puts `-a` on its command line for system-wide collection.
/// Scanning for it is fragile (kept for compatibility with old files): only
/// the options region between the `record` subcommand and the profiled
/// command is searched, skipping the values of value-taking options.
fn cmdline_requests_system_wide(cmdline: &[String]) -> bool {
    const VALUE_OPTIONS: &[&str] = &[
        "--call-graph",
        "--cpu",
        "-e",
        "-f",
        "-F",
        "-j",
        "-m",
        "-o",
        "-p",
        "-t",
    ];
    // Options start after the "record" subcommand; without one, after the
    // leading recorder binary.
    let mut i = cmdline
        .iter()
        .position(|arg| arg == "record")
        .map_or(1, |pos| pos + 1);
    while i < cmdline.len() {
        let arg = &cmdline[i];
        if arg == "-a" {
            return true;
        } else if VALUE_OPTIONS.contains(&arg.as_str()) {
            i += 1;
        } else if !arg.is_empty() && !arg.starts_with('-') {
            break;
        }
        i += 1;
    }
    false
}

fn build_comparator_and_displayer(
    opts: &ReportOptions,
) -> Result<(SampleComparator, SampleDisplayer)> {
    let mut comparator = SampleComparator::new();
    let mut displayer = SampleDisplayer::new(opts.csv);

    if opts.accumulate_callchain {
        if opts.raw_period {
            displayer.add_display_function("Children", display::display_accumulated_period);
            displayer.add_display_function("Self", display::display_self_period);
        } else {
            displayer.add_display_function("Children", display::display_accumulated_overhead);
            displayer.add_display_function("Self", display::display_self_overhead);
        }
    } else if opts.raw_period {
        displayer.add_display_function("Overhead", display::display_self_period);
    } else {
        displayer.add_display_function("Overhead", display::display_self_overhead);
    }
    if opts.print_sample_count {
        displayer.add_display_function("Sample", display::display_sample_count);
    }

    for key in &opts.sort_keys {
        if !opts.use_branch_address && BRANCH_SORT_KEYS.contains(&key.as_str()) {
            bail!("sort key '{key}' can only be used with -b");
        }
        match key.as_str() {
            "pid" => {
                comparator.add_compare_function(comparator::compare_pid);
                displayer.add_display_function("Pid", display::display_pid);
            }
            "tid" => {
                comparator.add_compare_function(comparator::compare_tid);
                displayer.add_display_function("Tid", display::display_tid);
            }
            "comm" => {
                comparator.add_compare_function(comparator::compare_comm);
                displayer.add_display_function("Command", display::display_comm);
            }
            "dso" => {
                comparator.add_compare_function(comparator::compare_dso);
                displayer.add_display_function("Shared Object", display::display_dso);
            }
            "symbol" => {
                comparator.add_compare_function(comparator::compare_symbol);
                displayer.add_display_function("Symbol", display::display_symbol);
            }
            "vaddr_in_file" => {
                comparator.add_compare_function(comparator::compare_vaddr_in_file);
                displayer.add_display_function("VaddrInFile", display::display_vaddr_in_file);
            }
            "dso_from" => {
                comparator.add_compare_function(comparator::compare_dso_from);
                displayer
                    .add_display_function("Source Shared Object", display::display_dso_from);
            }
            "dso_to" => {
                comparator.add_compare_function(comparator::compare_dso);
                displayer.add_display_function("Target Shared Object", display::display_dso);
            }
            "symbol_from" => {
                comparator.add_compare_function(comparator::compare_symbol_from);
                displayer.add_display_function("Source Symbol", display::display_symbol_from);
            }
            "symbol_to" => {
                comparator.add_compare_function(comparator::compare_symbol);
                displayer.add_display_function("Target Symbol", display::display_symbol);
            }
            other => bail!("unknown sort key: {other}"),
        }
    }

    if opts.csv {
        if opts.accumulate_callchain {
            displayer.add_display_function("AccEventCount", display::display_accumulated_period);
            displayer.add_display_function("SelfEventCount", display::display_self_period);
        } else {
            displayer.add_display_function("EventCount", display::display_self_period);
        }
        displayer.add_display_function("EventName", display::display_event_name);
    }

    if opts.print_callgraph {
        let has_symbol_key = opts.sort_keys.iter().any(|k| k == "symbol");
        let has_vaddr_key = opts.sort_keys.iter().any(|k| k == "vaddr_in_file");
        if has_symbol_key {
            displayer.add_exclusive_display_function(CallgraphDisplayer::new(
                opts.max_stack,
                opts.percent_limit,
                !opts.full_callgraph,
                has_vaddr_key,
            ));
        }
    }

    Ok((comparator, displayer))
}

/// Parse a comma-separated cpu list; items are numbers or ranges like `0-3`.
pub fn parse_cpu_list(value: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().context("bad cpu range")?;
                let hi: u32 = hi.trim().parse().context("bad cpu range")?;
                if lo > hi {
                    bail!("bad cpu range {item}");
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(item.parse().with_context(|| format!("bad cpu {item}"))?),
        }
    }
    Ok(cpus)
}

/// Parse a comma-separated pid/tid list.
pub fn parse_id_list(value: &str) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("invalid id '{s}'")))
        .collect()
}
