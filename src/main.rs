use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use sampreport::report::{self, ReportCommand, ReportOptions};

/// Report where time and events were spent in a recorded sampling profile.
#[derive(Parser)]
#[command(name = "sampreport", version, about)]
struct Cli {
    /// Path of the record file.
    #[arg(short = 'i', value_name = "FILE", default_value = "perf.data")]
    input: PathBuf,

    /// Write the report to this file instead of stdout.
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Use the branch-to addresses of sampled taken branches instead of the
    /// instruction addresses. Only valid for records with branch stacks.
    #[arg(short = 'b')]
    branch: bool,

    /// Print the overhead accumulated by appearing in call chains.
    #[arg(long)]
    children: bool,

    /// Print the call graph. The optional value roots it at the callee or
    /// the caller (default: caller).
    #[arg(short = 'g', value_name = "MODE", num_args = 0..=1, default_missing_value = "caller")]
    callgraph: Option<String>,

    /// Print the full call graph instead of the brief one.
    #[arg(long)]
    full_callgraph: bool,

    /// Max stack frames shown when printing the call graph.
    #[arg(long, value_name = "N")]
    max_stack: Option<u32>,

    /// Minimum percentage shown when printing the call graph.
    #[arg(long, value_name = "PCT", default_value_t = 0.0)]
    percent_limit: f64,

    /// Print the sample count for each row.
    #[arg(short = 'n')]
    sample_count: bool,

    /// Don't demangle symbol names.
    #[arg(long)]
    no_demangle: bool,

    /// Don't show the address in file for unknown symbols.
    #[arg(long)]
    no_show_ip: bool,

    /// Report in CSV format.
    #[arg(long)]
    csv: bool,

    /// Report period counts instead of percentages.
    #[arg(long)]
    raw_period: bool,

    /// Keys used to aggregate, sort and print the report, comma separated.
    /// Possible keys: pid, tid, comm, dso, symbol, vaddr_in_file; with -b
    /// also dso_from, dso_to, symbol_from, symbol_to.
    #[arg(long, value_name = "KEYS")]
    sort: Option<String>,

    /// Report only for the selected thread names, comma separated.
    #[arg(long, value_name = "COMMS")]
    comms: Vec<String>,

    /// Report only for the selected binary images, comma separated.
    #[arg(long, value_name = "DSOS")]
    dsos: Vec<String>,

    /// Report only for the selected symbols, semicolon separated.
    #[arg(long, value_name = "SYMBOLS")]
    symbols: Vec<String>,

    /// Report only samples on the selected cpus; items are cpu numbers or
    /// ranges like 0-3.
    #[arg(long, value_name = "CPUS")]
    cpu: Vec<String>,

    /// Report only for the selected process ids, comma separated.
    #[arg(long, value_name = "PIDS")]
    pids: Vec<String>,

    /// Report only for the selected thread ids, comma separated.
    #[arg(long, value_name = "TIDS")]
    tids: Vec<String>,

    /// Read kernel symbols from this /proc/kallsyms-format file.
    #[arg(long, value_name = "FILE")]
    kallsyms: Option<PathBuf>,

    /// Read kernel symbols from this file (kallsyms format).
    #[arg(long, value_name = "FILE")]
    vmlinux: Option<PathBuf>,

    /// Look for per-image .sym files relative to this directory.
    #[arg(long, value_name = "DIR")]
    symfs: Option<PathBuf>,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opts = build_options(cli)?;
    ReportCommand::new(opts)?.run()
}

fn build_options(cli: Cli) -> Result<ReportOptions> {
    let mut opts = ReportOptions {
        record_file: cli.input,
        report_file: cli.output,
        use_branch_address: cli.branch,
        accumulate_callchain: cli.children,
        full_callgraph: cli.full_callgraph,
        max_stack: cli.max_stack.unwrap_or(u32::MAX),
        percent_limit: cli.percent_limit,
        print_sample_count: cli.sample_count,
        demangle: !cli.no_demangle,
        show_ip: !cli.no_show_ip,
        csv: cli.csv,
        raw_period: cli.raw_period,
        kallsyms: cli.kallsyms,
        vmlinux: cli.vmlinux,
        symfs: cli.symfs,
        ..Default::default()
    };

    if let Some(mode) = &cli.callgraph {
        opts.print_callgraph = true;
        // Printing the graph implies accumulating into ancestors.
        opts.accumulate_callchain = true;
        match mode.as_str() {
            "callee" => opts.callgraph_show_callee = true,
            "caller" => opts.callgraph_show_callee = false,
            other => bail!("unknown argument for -g: {other}"),
        }
    }

    if let Some(sort) = &cli.sort {
        opts.sort_keys = sort.split(',').map(str::to_string).collect();
    }

    opts.comm_filter = split_list(&cli.comms, ',');
    opts.dso_filter = split_list(&cli.dsos, ',');
    opts.symbol_filter = split_list(&cli.symbols, ';');
    for value in &cli.cpu {
        opts.cpu_filter.extend(report::parse_cpu_list(value)?);
    }
    for value in &cli.pids {
        opts.pid_filter.extend(report::parse_id_list(value)?);
    }
    for value in &cli.tids {
        opts.tid_filter.extend(report::parse_id_list(value)?);
    }

    Ok(opts)
}

fn split_list(values: &[String], separator: char) -> HashSet<String> {
    values
        .iter()
        .flat_map(|v| v.split(separator))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
