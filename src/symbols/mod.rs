//! Thread, map and symbol registry.
//!
//! Built incrementally from thread/mapping/symbol records, this table answers
//! "which image and symbol does this instruction pointer belong to" for the
//! aggregation engine. The registry owns every image and symbol table; the
//! engine only carries cheap shared handles, and the registry outlives every
//! aggregation pass.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Report path used for addresses that resolve to no loaded image.
pub const UNKNOWN_IMAGE: &str = "unknown";

/// Placeholder symbol name when an address has no covering symbol and
/// show-ip is disabled.
pub const UNKNOWN_SYMBOL: &str = "unknown";

/// Well-known report path of the kernel image loaded from kallsyms-format
/// files.
pub const KERNEL_IMAGE: &str = "[kernel.kallsyms]";

/// What kind of binary an image is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    User,
    Kernel,
    Unknown,
}

/// Stable image identifier; an index into the registry's image arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(usize);

/// One symbol inside an image, addresses in the image's own address space.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub addr: u64,
    pub len: u64,
    pub name: Arc<str>,
}

#[derive(Debug)]
struct ImageData {
    path: Arc<str>,
    kind: ImageKind,
    /// Sorted by addr; lengths are closed at load time.
    symbols: Vec<Symbol>,
    /// Set when symbols came from a symfs file, which wins over symbol
    /// records in the stream.
    symbols_locked: bool,
}

#[derive(Debug, Clone)]
struct Thread {
    comm: Arc<str>,
}

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    start: u64,
    len: u64,
    pgoff: u64,
    image: ImageId,
}

/// A resolved address range handed to the engine. Cheap to clone; the path
/// handle stays valid for the registry's lifetime.
#[derive(Debug, Clone)]
pub struct MapHandle {
    pub image: ImageId,
    pub path: Arc<str>,
    pub kind: ImageKind,
    start: u64,
    pgoff: u64,
}

impl MapHandle {
    pub fn is_unknown(&self) -> bool {
        self.kind == ImageKind::Unknown
    }

    /// Translate an instruction pointer into the image's own address space.
    pub fn vaddr_in_file(&self, ip: u64) -> u64 {
        match self.kind {
            // Kernel symbols are keyed by absolute address.
            ImageKind::Kernel => ip,
            ImageKind::User => ip.wrapping_sub(self.start).wrapping_add(self.pgoff),
            ImageKind::Unknown => ip,
        }
    }
}

/// A thread snapshot handed to the engine.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    pub pid: u32,
    pub tid: u32,
    pub comm: Arc<str>,
}

/// The registry. Mutated only by the ingestion loop; read by every builder.
pub struct ThreadTable {
    threads: HashMap<(u32, u32), Thread>,
    user_maps: HashMap<u32, Vec<MapEntry>>,
    kernel_maps: Vec<MapEntry>,
    images: Vec<ImageData>,
    image_ids: HashMap<String, ImageId>,
    unknown_comm: Arc<str>,
    unknown_symbol: Arc<str>,
    demangle: bool,
    show_ip_for_unknown_symbol: bool,
    symfs_dir: Option<PathBuf>,
}

impl ThreadTable {
    pub fn new() -> Self {
        let mut table = Self {
            threads: HashMap::new(),
            user_maps: HashMap::new(),
            kernel_maps: Vec::new(),
            images: Vec::new(),
            image_ids: HashMap::new(),
            unknown_comm: Arc::from("unknown"),
            unknown_symbol: Arc::from(UNKNOWN_SYMBOL),
            demangle: true,
            show_ip_for_unknown_symbol: true,
            symfs_dir: None,
        };
        // Image 0 is the shared unknown image.
        table.intern_image(UNKNOWN_IMAGE, ImageKind::Unknown);
        table
    }

    /// Disable demangling; symbol names are then reported raw.
    pub fn set_demangle(&mut self, demangle: bool) {
        self.demangle = demangle;
    }

    /// When disabled, addresses without a covering symbol report the literal
    /// name `unknown` instead of their hex vaddr.
    pub fn set_show_ip_for_unknown_symbol(&mut self, show: bool) {
        self.show_ip_for_unknown_symbol = show;
    }

    /// Directory searched for `<image-path>.sym` symbol files; these take
    /// precedence over symbol tables carried in the record stream.
    pub fn set_symfs_dir(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            bail!("symfs directory {} does not exist", dir.display());
        }
        self.symfs_dir = Some(dir.to_path_buf());
        Ok(())
    }

    /// Load kernel symbols from a `/proc/kallsyms`-format text file into the
    /// well-known kernel image and map it over the full address space.
    pub fn load_kernel_symbols(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("can't read kernel symbols from {}", path.display()))?;
        let symbols = parse_kallsyms(&text);
        if symbols.is_empty() {
            bail!("no kernel symbols found in {}", path.display());
        }
        let min_addr = symbols.iter().map(|s| s.addr).min().unwrap_or(0);
        let image = self.intern_image(KERNEL_IMAGE, ImageKind::Kernel);
        self.set_symbols(image, symbols, true);
        if !self.kernel_maps.iter().any(|m| m.image == image) {
            self.kernel_maps.push(MapEntry {
                start: min_addr,
                len: u64::MAX - min_addr,
                pgoff: 0,
                image,
            });
        }
        Ok(())
    }

    /// Record a thread name.
    pub fn set_thread_comm(&mut self, pid: u32, tid: u32, comm: &str) {
        self.threads.insert(
            (pid, tid),
            Thread {
                comm: Arc::from(comm),
            },
        );
    }

    /// Record a loaded image range for a process (or the kernel).
    pub fn add_map(&mut self, pid: u32, in_kernel: bool, start: u64, len: u64, pgoff: u64, path: &str) {
        let kind = if in_kernel {
            ImageKind::Kernel
        } else {
            ImageKind::User
        };
        let image = self.intern_image(path, kind);
        let entry = MapEntry {
            start,
            len,
            pgoff,
            image,
        };
        if in_kernel {
            self.kernel_maps.push(entry);
        } else {
            self.user_maps.entry(pid).or_default().push(entry);
        }
    }

    /// Attach a symbol table to an image, unless a symfs file already won.
    pub fn add_image_symbols(&mut self, path: &str, in_kernel: bool, symbols: Vec<Symbol>) {
        let kind = if in_kernel {
            ImageKind::Kernel
        } else {
            ImageKind::User
        };
        let image = self.intern_image(path, kind);
        self.set_symbols(image, symbols, false);
    }

    /// Look up a thread, creating a placeholder if it was never announced.
    pub fn find_thread_or_new(&mut self, pid: u32, tid: u32) -> ThreadHandle {
        let unknown = self.unknown_comm.clone();
        let thread = self
            .threads
            .entry((pid, tid))
            .or_insert_with(|| Thread { comm: unknown });
        ThreadHandle {
            pid,
            tid,
            comm: thread.comm.clone(),
        }
    }

    /// Find the map covering `ip`. `in_kernel` restricts the search when
    /// known; `None` (branch addresses, call-chain frames) tries kernel
    /// ranges first, then the process's user maps.
    pub fn find_map(&self, pid: u32, ip: u64, in_kernel: Option<bool>) -> MapHandle {
        let found = match in_kernel {
            Some(true) => find_in(&self.kernel_maps, ip),
            Some(false) => self
                .user_maps
                .get(&pid)
                .and_then(|maps| find_in(maps, ip)),
            None => find_in(&self.kernel_maps, ip)
                .or_else(|| self.user_maps.get(&pid).and_then(|maps| find_in(maps, ip))),
        };
        match found {
            Some(entry) => {
                let image = &self.images[entry.image.0];
                MapHandle {
                    image: entry.image,
                    path: image.path.clone(),
                    kind: image.kind,
                    start: entry.start,
                    pgoff: entry.pgoff,
                }
            }
            None => self.unknown_map(),
        }
    }

    /// Resolve a symbol inside a map; returns the symbol name and the
    /// vaddr-in-image of `ip`.
    pub fn find_symbol(&self, map: &MapHandle, ip: u64) -> (Arc<str>, u64) {
        let vaddr = map.vaddr_in_file(ip);
        let image = &self.images[map.image.0];
        let idx = image.symbols.partition_point(|s| s.addr <= vaddr);
        if idx > 0 {
            let sym = &image.symbols[idx - 1];
            if vaddr - sym.addr < sym.len {
                return (sym.name.clone(), vaddr);
            }
        }
        if self.show_ip_for_unknown_symbol {
            (Arc::from(format!("0x{vaddr:x}")), vaddr)
        } else {
            (self.unknown_symbol.clone(), vaddr)
        }
    }

    fn unknown_map(&self) -> MapHandle {
        MapHandle {
            image: ImageId(0),
            path: self.images[0].path.clone(),
            kind: ImageKind::Unknown,
            start: 0,
            pgoff: 0,
        }
    }

    fn intern_image(&mut self, path: &str, kind: ImageKind) -> ImageId {
        if let Some(&id) = self.image_ids.get(path) {
            return id;
        }
        let id = ImageId(self.images.len());
        self.images.push(ImageData {
            path: Arc::from(path),
            kind,
            symbols: Vec::new(),
            symbols_locked: false,
        });
        self.image_ids.insert(path.to_string(), id);
        if let Some(symbols) = self.load_symfs_symbols(path) {
            self.images[id.0].symbols = close_symbol_lengths(symbols, self.demangle);
            self.images[id.0].symbols_locked = true;
        }
        id
    }

    fn set_symbols(&mut self, id: ImageId, symbols: Vec<Symbol>, lock: bool) {
        let image = &mut self.images[id.0];
        if image.symbols_locked && !lock {
            return;
        }
        image.symbols = close_symbol_lengths(symbols, self.demangle);
        image.symbols_locked = lock;
    }

    fn load_symfs_symbols(&self, path: &str) -> Option<Vec<Symbol>> {
        let dir = self.symfs_dir.as_ref()?;
        let mut file = dir.join(path.trim_start_matches('/'));
        let mut name = file.file_name()?.to_os_string();
        name.push(".sym");
        file.set_file_name(name);
        let text = fs::read_to_string(&file).ok()?;
        let symbols = parse_symfile(&text);
        if symbols.is_empty() {
            tracing::warn!(file = %file.display(), "symfs file contains no symbols");
            return None;
        }
        tracing::debug!(file = %file.display(), count = symbols.len(), "loaded symfs symbols");
        Some(symbols)
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

fn find_in(maps: &[MapEntry], ip: u64) -> Option<MapEntry> {
    // Later mappings win over earlier overlapping ones.
    maps.iter()
        .rev()
        .find(|m| ip >= m.start && ip - m.start < m.len)
        .copied()
}

/// Sort symbols, give zero-length ones a length reaching the next symbol, and
/// demangle names when enabled.
fn close_symbol_lengths(mut symbols: Vec<Symbol>, demangle: bool) -> Vec<Symbol> {
    symbols.sort_by_key(|s| s.addr);
    for i in 0..symbols.len() {
        if symbols[i].len == 0 {
            symbols[i].len = match symbols.get(i + 1) {
                Some(next) => next.addr - symbols[i].addr,
                None => u64::MAX - symbols[i].addr,
            };
        }
        if demangle {
            symbols[i].name = demangle_name(&symbols[i].name);
        }
    }
    symbols
}

fn demangle_name(raw: &str) -> Arc<str> {
    match Name::from(raw).demangle(DemangleOptions::name_only()) {
        Some(demangled) => Arc::from(demangled.as_str()),
        None => Arc::from(raw),
    }
}

/// Parse `/proc/kallsyms`-format text: `<hex-addr> <type> <name> [module]`.
/// Non-function symbols and malformed lines are skipped.
fn parse_kallsyms(text: &str) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(ty), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(addr) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        if !matches!(ty, "t" | "T" | "w" | "W") {
            continue;
        }
        symbols.push(Symbol {
            addr,
            len: 0,
            name: Arc::from(name),
        });
    }
    symbols
}

/// Parse a symfs `.sym` file: one `<hex-addr> <hex-len> <name>` per line,
/// `#` comments allowed.
fn parse_symfile(text: &str) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(len), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let (Ok(addr), Ok(len)) = (
            u64::from_str_radix(addr.trim_start_matches("0x"), 16),
            u64::from_str_radix(len.trim_start_matches("0x"), 16),
        ) else {
            continue;
        };
        symbols.push(Symbol {
            addr,
            len,
            name: Arc::from(name),
        });
    }
    symbols
}
