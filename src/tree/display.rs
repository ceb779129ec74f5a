//! Rendering of aggregated sample trees.
//!
//! A displayer is an ordered list of (header, formatter) column pairs plus an
//! optional exclusive call-graph printer. Text mode pads every column to its
//! widest cell; CSV mode joins cells with commas.

use std::io::{self, Write};

use super::{EntryId, SampleEntry, SampleTree};
use super::callchain::CallChainNode;

/// Formats one cell for one entry.
pub type DisplayFn = fn(&SampleEntry, &SampleTree) -> String;

struct Column {
    header: &'static str,
    format: DisplayFn,
}

/// Renders the rows of one sample tree.
pub struct SampleDisplayer {
    columns: Vec<Column>,
    csv: bool,
    callgraph: Option<CallgraphDisplayer>,
}

impl SampleDisplayer {
    pub fn new(csv: bool) -> Self {
        Self {
            columns: Vec::new(),
            csv,
            callgraph: None,
        }
    }

    /// Append one column.
    pub fn add_display_function(&mut self, header: &'static str, format: DisplayFn) {
        self.columns.push(Column { header, format });
    }

    /// Set the exclusive per-row call-graph printer.
    pub fn add_exclusive_display_function(&mut self, callgraph: CallgraphDisplayer) {
        self.callgraph = Some(callgraph);
    }

    /// Print the header row and every entry in display order.
    pub fn display_samples(&self, w: &mut dyn Write, tree: &SampleTree) -> io::Result<()> {
        if self.csv {
            return self.display_csv(w, tree);
        }

        // Pad each column to the widest of its header and cells.
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.header.len()).collect();
        let mut rows: Vec<Vec<String>> = Vec::with_capacity(tree.display_order.len());
        for &id in &tree.display_order {
            let entry = &tree.entries[id];
            let row: Vec<String> = self
                .columns
                .iter()
                .map(|c| (c.format)(entry, tree))
                .collect();
            for (width, cell) in widths.iter_mut().zip(&row) {
                *width = (*width).max(cell.len());
            }
            rows.push(row);
        }

        write_padded(
            w,
            &widths,
            self.columns.iter().map(|c| c.header.to_string()),
        )?;
        for (row, &id) in rows.iter().zip(&tree.display_order) {
            write_padded(w, &widths, row.iter().cloned())?;
            if let Some(cg) = &self.callgraph {
                cg.print(w, tree, &tree.entries[id])?;
            }
        }
        Ok(())
    }

    fn display_csv(&self, w: &mut dyn Write, tree: &SampleTree) -> io::Result<()> {
        let header: Vec<String> = self
            .columns
            .iter()
            .map(|c| csv_cell(c.header))
            .collect();
        writeln!(w, "{}", header.join(","))?;
        for &id in &tree.display_order {
            let entry = &tree.entries[id];
            let row: Vec<String> = self
                .columns
                .iter()
                .map(|c| csv_cell(&(c.format)(entry, tree)))
                .collect();
            writeln!(w, "{}", row.join(","))?;
        }
        Ok(())
    }
}

fn write_padded(
    w: &mut dyn Write,
    widths: &[usize],
    cells: impl Iterator<Item = String>,
) -> io::Result<()> {
    let mut line = String::new();
    for (i, (cell, width)) in cells.zip(widths).enumerate() {
        if i != 0 {
            line.push_str("  ");
        }
        line.push_str(&cell);
        // The last column stays unpadded.
        if i + 1 != widths.len() {
            for _ in cell.len()..*width {
                line.push(' ');
            }
        }
    }
    writeln!(w, "{}", line.trim_end())
}

fn csv_cell(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn percentage(part: u64, total: u64) -> String {
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", part as f64 * 100.0 / total as f64)
}

pub fn display_self_overhead(entry: &SampleEntry, tree: &SampleTree) -> String {
    percentage(entry.period, tree.total_period)
}

pub fn display_accumulated_overhead(entry: &SampleEntry, tree: &SampleTree) -> String {
    percentage(entry.accumulated_period, tree.total_period)
}

pub fn display_self_period(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.period.to_string()
}

pub fn display_accumulated_period(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.accumulated_period.to_string()
}

pub fn display_sample_count(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.sample_count.to_string()
}

pub fn display_pid(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.pid.to_string()
}

pub fn display_tid(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.tid.to_string()
}

pub fn display_comm(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.comm.to_string()
}

pub fn display_dso(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.dso.to_string()
}

pub fn display_symbol(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.symbol.to_string()
}

pub fn display_vaddr_in_file(entry: &SampleEntry, _tree: &SampleTree) -> String {
    format!("0x{:x}", entry.vaddr_in_file)
}

pub fn display_dso_from(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry.branch_from.as_ref().map_or_else(String::new, |b| b.dso.to_string())
}

pub fn display_symbol_from(entry: &SampleEntry, _tree: &SampleTree) -> String {
    entry
        .branch_from
        .as_ref()
        .map_or_else(String::new, |b| b.symbol.to_string())
}

pub fn display_event_name(_entry: &SampleEntry, tree: &SampleTree) -> String {
    tree.event_name.clone()
}

/// Prints the call-chain trie under a row, indented, hottest subtree first.
pub struct CallgraphDisplayer {
    max_stack: u32,
    percent_limit: f64,
    /// Brief mode elides graphs whose chain already prints under another row.
    brief: bool,
    /// Append the vaddr-in-file to every printed name.
    show_vaddr: bool,
}

impl CallgraphDisplayer {
    pub fn new(max_stack: u32, percent_limit: f64, brief: bool, show_vaddr: bool) -> Self {
        Self {
            max_stack,
            percent_limit,
            brief,
            show_vaddr,
        }
    }

    pub fn print(
        &self,
        w: &mut dyn Write,
        tree: &SampleTree,
        entry: &SampleEntry,
    ) -> io::Result<()> {
        if entry.callchain.children.is_empty() {
            return Ok(());
        }
        if self.brief && entry.callchain.duplicated {
            return Ok(());
        }
        if self.max_stack == 0 {
            return Ok(());
        }
        let mut prefix = String::from("       ");
        writeln!(w, "{prefix}|")?;
        writeln!(w, "{prefix}-- {}", self.sample_name(entry))?;
        prefix.push_str("   ");
        let parent_period = entry.period + entry.callchain.children_period;
        for (i, child) in entry.callchain.children.iter().enumerate() {
            self.print_node(
                w,
                tree,
                child,
                1,
                prefix.clone(),
                parent_period,
                i + 1 == entry.callchain.children.len(),
            )?;
        }
        Ok(())
    }

    /// `frames_above` counts the call frames already printed on this path,
    /// including the row's own line. The stack limit bounds frames, not trie
    /// nodes, so a compressed run is cut off mid-chain once it is reached.
    fn print_node(
        &self,
        w: &mut dyn Write,
        tree: &SampleTree,
        node: &CallChainNode,
        frames_above: u32,
        mut prefix: String,
        parent_period: u64,
        last: bool,
    ) -> io::Result<()> {
        if frames_above >= self.max_stack {
            return Ok(());
        }
        let node_period = node.period + node.children_period;
        let percent = if parent_period == 0 {
            100.0
        } else {
            node_period as f64 * 100.0 / parent_period as f64
        };
        if percent < self.percent_limit {
            return Ok(());
        }
        let marker = if (percent - 100.0).abs() < f64::EPSILON {
            "-- ".to_string()
        } else {
            format!("--{percent:.2}%-- ")
        };

        prefix.push('|');
        writeln!(w, "{prefix}")?;
        if last {
            prefix.pop();
            prefix.push(' ');
        }
        let budget = (self.max_stack - frames_above) as usize;
        let shown = node.chain.len().min(budget);
        writeln!(w, "{prefix}{marker}{}", self.entry_name(tree, node.chain[0]))?;
        let pad = " ".repeat(marker.len());
        for &id in &node.chain[1..shown] {
            writeln!(w, "{prefix}{pad}{}", self.entry_name(tree, id))?;
        }
        if shown < node.chain.len() {
            return Ok(());
        }
        prefix.push_str(&pad);
        let child_parent = node.period + node.children_period;
        for (i, child) in node.children.iter().enumerate() {
            self.print_node(
                w,
                tree,
                child,
                frames_above + shown as u32,
                prefix.clone(),
                child_parent,
                i + 1 == node.children.len(),
            )?;
        }
        Ok(())
    }

    fn entry_name(&self, tree: &SampleTree, id: EntryId) -> String {
        self.sample_name(&tree.entries[id])
    }

    fn sample_name(&self, entry: &SampleEntry) -> String {
        if self.show_vaddr {
            format!("{} [+0x{:x}]", entry.symbol, entry.vaddr_in_file)
        } else {
            entry.symbol.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::callchain::CallChainRoot;
    use super::*;

    fn entry(symbol: &str, period: u64, accumulated: u64, count: u64) -> SampleEntry {
        SampleEntry {
            time: 0,
            period,
            accumulated_period: accumulated,
            sample_count: count,
            cpu: 0,
            pid: 1,
            tid: 1,
            comm: Arc::from("main"),
            dso: Arc::from("a.so"),
            symbol: Arc::from(symbol),
            vaddr_in_file: 0x100,
            branch_from: None,
            callchain: CallChainRoot::default(),
        }
    }

    fn tree(entries: Vec<SampleEntry>) -> SampleTree {
        let total_period = entries.iter().map(|e| e.period).sum();
        let total_samples = entries.iter().map(|e| e.sample_count).sum();
        SampleTree {
            display_order: (0..entries.len()).collect(),
            entries,
            total_samples,
            total_period,
            total_error_callchains: 0,
            event_name: "cycles".to_string(),
        }
    }

    fn render(displayer: &SampleDisplayer, tree: &SampleTree) -> String {
        let mut out = Vec::new();
        displayer.display_samples(&mut out, tree).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_overhead_percentages() {
        let t = tree(vec![entry("f", 150, 0, 2), entry("g", 50, 0, 1)]);
        assert_eq!(display_self_overhead(&t.entries[0], &t), "75.00%");
        assert_eq!(display_self_overhead(&t.entries[1], &t), "25.00%");
    }

    #[test]
    fn test_overhead_zero_total() {
        let t = tree(vec![entry("f", 0, 0, 0)]);
        assert_eq!(display_self_overhead(&t.entries[0], &t), "0.00%");
    }

    #[test]
    fn test_text_columns_padded() {
        let mut d = SampleDisplayer::new(false);
        d.add_display_function("Overhead", display_self_overhead);
        d.add_display_function("Symbol", display_symbol);

        let t = tree(vec![entry("long_function_name", 100, 0, 1)]);
        let out = render(&d, &t);
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("Overhead  Symbol"));
        assert_eq!(lines.next(), Some("100.00%   long_function_name"));
    }

    #[test]
    fn test_csv_rows() {
        let mut d = SampleDisplayer::new(true);
        d.add_display_function("Overhead", display_self_overhead);
        d.add_display_function("Symbol", display_symbol);
        d.add_display_function("EventName", display_event_name);

        let t = tree(vec![entry("f", 100, 0, 1)]);
        let out = render(&d, &t);
        assert_eq!(out, "Overhead,Symbol,EventName\n100.00%,f,cycles\n");
    }

    #[test]
    fn test_csv_quotes_commas() {
        let mut d = SampleDisplayer::new(true);
        d.add_display_function("Symbol", display_symbol);

        let t = tree(vec![entry("foo<int, long>", 1, 0, 1)]);
        let out = render(&d, &t);
        assert_eq!(out, "Symbol\n\"foo<int, long>\"\n");
    }

    #[test]
    fn test_callgraph_prints_chain() {
        let mut leaf = entry("f", 80, 80, 1);
        leaf.callchain.add_callchain(&[1], 80);
        let callee = entry("g", 0, 80, 0);
        let t = tree(vec![leaf, callee]);

        let mut d = SampleDisplayer::new(false);
        d.add_display_function("Symbol", display_symbol);
        d.add_exclusive_display_function(CallgraphDisplayer::new(u32::MAX, 0.0, false, false));

        let out = render(&d, &t);
        assert!(out.contains("-- f\n"), "root line missing:\n{out}");
        assert!(out.contains("-- g\n"), "child line missing:\n{out}");
    }

    #[test]
    fn test_callgraph_percent_limit_prunes() {
        let mut leaf = entry("f", 90, 0, 1);
        leaf.callchain.add_callchain(&[1], 5);
        leaf.callchain.add_callchain(&[2], 90);
        // children_period is 95, node percentages ~5% and ~95%.
        let cold = entry("cold", 0, 5, 0);
        let hot = entry("hot", 0, 90, 0);
        let t = tree(vec![leaf, cold, hot]);

        let mut d = SampleDisplayer::new(false);
        d.add_display_function("Symbol", display_symbol);
        d.add_exclusive_display_function(CallgraphDisplayer::new(u32::MAX, 20.0, false, false));

        // Parent period is 90 + 95; "hot" sits at ~48% and survives, "cold"
        // at ~3% is pruned.
        let out = render(&d, &t);
        assert!(out.contains("hot"));
        assert!(!out.contains("cold"));
    }

    #[test]
    fn test_callgraph_max_stack_bounds_frames() {
        // One compressed run holding two frames under the root.
        let mut leaf = entry("f", 10, 0, 1);
        leaf.callchain.add_callchain(&[1, 2], 10);
        let mid = entry("mid", 0, 10, 0);
        let deep = entry("deep", 0, 10, 0);
        let mut t = tree(vec![leaf, mid, deep]);
        // Only the root row is displayed; "mid"/"deep" exist for the graph.
        t.display_order = vec![0];

        let mut d = SampleDisplayer::new(false);
        d.add_display_function("Symbol", display_symbol);
        d.add_exclusive_display_function(CallgraphDisplayer::new(2, 0.0, false, false));

        // Root "f" is frame 1 and "mid" frame 2; "deep" exceeds the limit
        // even though it sits in the same trie node.
        let out = render(&d, &t);
        assert!(out.contains("-- f\n"));
        assert!(out.contains("mid"));
        assert!(!out.contains("deep"));

        // A limit of one frame prints the root line alone.
        let mut d1 = SampleDisplayer::new(false);
        d1.add_display_function("Symbol", display_symbol);
        d1.add_exclusive_display_function(CallgraphDisplayer::new(1, 0.0, false, false));
        let out1 = render(&d1, &t);
        assert!(out1.contains("-- f\n"));
        assert!(!out1.contains("mid"));
    }

    #[test]
    fn test_brief_mode_elides_duplicated() {
        let mut leaf = entry("f", 10, 0, 1);
        leaf.callchain.add_callchain(&[1], 10);
        leaf.callchain.duplicated = true;
        let other = entry("g", 0, 10, 0);
        let t = tree(vec![leaf, other]);

        let mut d = SampleDisplayer::new(false);
        d.add_display_function("Symbol", display_symbol);
        d.add_exclusive_display_function(CallgraphDisplayer::new(u32::MAX, 0.0, true, false));

        let out = render(&d, &t);
        assert!(!out.contains("-- f"));
    }

    #[test]
    fn test_callgraph_vaddr_names() {
        let mut leaf = entry("f", 10, 0, 1);
        leaf.callchain.add_callchain(&[1], 10);
        let other = entry("g", 0, 10, 0);
        let t = tree(vec![leaf, other]);

        let mut d = SampleDisplayer::new(false);
        d.add_display_function("Symbol", display_symbol);
        d.add_exclusive_display_function(CallgraphDisplayer::new(u32::MAX, 0.0, false, true));

        let out = render(&d, &t);
        assert!(out.contains("f [+0x100]"));
    }
}
