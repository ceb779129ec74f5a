//! On-disk layout of the record container.
//!
//! A record file starts with a fixed header (magic, version, attr count),
//! followed by the attr table, the meta key/value section, the recorded
//! command line, the architecture string, and finally a stream of
//! length-prefixed records. All integers are little-endian; strings are
//! u16-length-prefixed UTF-8.

use thiserror::Error;

/// File magic, first eight bytes of every record file.
pub const MAGIC: &[u8; 8] = b"SAMPREC1";

/// Highest container version this reader understands.
pub const VERSION: u16 = 1;

/// Event kind numbers, following the perf numbering.
pub const EVENT_KIND_HARDWARE: u32 = 0;
pub const EVENT_KIND_SOFTWARE: u32 = 1;
pub const EVENT_KIND_TRACEPOINT: u32 = 2;

/// Attr flag: samples for this attr carry branch stacks.
pub const ATTR_FLAG_BRANCH_STACK: u64 = 1;

/// Sample flag: the instruction pointer is a kernel address.
pub const SAMPLE_FLAG_IN_KERNEL: u8 = 1;

/// Record kind tags in the data section.
pub const RECORD_COMM: u16 = 1;
pub const RECORD_MAP_IMAGE: u16 = 2;
pub const RECORD_IMAGE_SYMBOLS: u16 = 3;
pub const RECORD_SAMPLE: u16 = 4;
pub const RECORD_TRACING_DATA: u16 = 5;
pub const RECORD_COMMENT: u16 = 6;

/// Meta-info keys every record file is expected to carry.
pub const META_SYSTEM_WIDE: &str = "system_wide_collection";
pub const META_TRACE_OFFCPU: &str = "trace_offcpu";

/// Errors raised while decoding a record file.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("i/o error reading record file: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a record file (bad magic)")]
    BadMagic,

    #[error("unsupported record file version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("reading {what}: unexpected end of data")]
    Truncated { what: &'static str },

    #[error("reading {what}: string is not valid UTF-8")]
    InvalidString { what: &'static str },

    #[error("record payload of {len} bytes exceeds the {limit} byte limit")]
    OversizedRecord { len: u32, limit: u32 },
}

/// One event attr from the attr table.
#[derive(Debug, Clone)]
pub struct EventAttr {
    /// Event kind (hardware, software, tracepoint).
    pub kind: u32,
    /// Kind-specific configuration value; the tracepoint id for tracepoints.
    pub config: u64,
    /// Attr flag bits.
    pub flags: u64,
    /// Event name; tracepoint names may be rewritten from tracing data.
    pub name: String,
}

impl EventAttr {
    pub fn has_branch_stack(&self) -> bool {
        self.flags & ATTR_FLAG_BRANCH_STACK != 0
    }

    pub fn is_tracepoint(&self) -> bool {
        self.kind == EVENT_KIND_TRACEPOINT
    }
}

/// A thread-name update.
#[derive(Debug, Clone)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

/// A loaded-image range update.
#[derive(Debug, Clone)]
pub struct MapImageRecord {
    pub pid: u32,
    pub in_kernel: bool,
    pub start: u64,
    pub len: u64,
    pub pgoff: u64,
    pub path: String,
}

/// A symbol table captured at record time for one image.
#[derive(Debug, Clone)]
pub struct ImageSymbolsRecord {
    pub path: String,
    pub in_kernel: bool,
    /// (addr, len, name) triples in the image's own address space.
    pub symbols: Vec<(u64, u64, String)>,
}

/// One taken branch captured with a sample.
#[derive(Debug, Clone, Copy)]
pub struct BranchItem {
    pub from: u64,
    pub to: u64,
    pub flags: u64,
}

/// A sample record.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    /// Index into the attr table of the event that produced this sample.
    pub attr_index: u32,
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub time: u64,
    pub ip: u64,
    pub period: u64,
    pub in_kernel: bool,
    /// Call-chain frames, leaf first, already expanded by the unwinder. The
    /// leading frame may repeat `ip`.
    pub callchain: Vec<u64>,
    pub branch_stack: Vec<BranchItem>,
}

/// Tracepoint-id-to-name mappings.
#[derive(Debug, Clone)]
pub struct TracingDataRecord {
    pub events: Vec<(u64, String)>,
}

/// One decoded record from the data section.
#[derive(Debug, Clone)]
pub enum Record {
    Comm(CommRecord),
    MapImage(MapImageRecord),
    ImageSymbols(ImageSymbolsRecord),
    Sample(SampleRecord),
    TracingData(TracingDataRecord),
    Comment(String),
}

/// Cursor over one record payload. Length checks happen per read; offsets
/// never go backwards.
pub(crate) struct Payload<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Payload<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(DecodeError::Truncated { what: self.what })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DecodeError::InvalidString { what: self.what })
    }
}

pub(crate) fn decode_comm(data: &[u8]) -> Result<CommRecord, DecodeError> {
    let mut p = Payload::new(data, "comm record");
    Ok(CommRecord {
        pid: p.u32()?,
        tid: p.u32()?,
        comm: p.string()?,
    })
}

pub(crate) fn decode_map_image(data: &[u8]) -> Result<MapImageRecord, DecodeError> {
    let mut p = Payload::new(data, "map record");
    Ok(MapImageRecord {
        pid: p.u32()?,
        in_kernel: p.u8()? != 0,
        start: p.u64()?,
        len: p.u64()?,
        pgoff: p.u64()?,
        path: p.string()?,
    })
}

pub(crate) fn decode_image_symbols(data: &[u8]) -> Result<ImageSymbolsRecord, DecodeError> {
    let mut p = Payload::new(data, "image symbols record");
    let path = p.string()?;
    let in_kernel = p.u8()? != 0;
    let count = p.u32()? as usize;
    let mut symbols = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let addr = p.u64()?;
        let len = p.u64()?;
        let name = p.string()?;
        symbols.push((addr, len, name));
    }
    Ok(ImageSymbolsRecord {
        path,
        in_kernel,
        symbols,
    })
}

pub(crate) fn decode_sample(data: &[u8]) -> Result<SampleRecord, DecodeError> {
    let mut p = Payload::new(data, "sample record");
    let attr_index = p.u32()?;
    let pid = p.u32()?;
    let tid = p.u32()?;
    let cpu = p.u32()?;
    let time = p.u64()?;
    let ip = p.u64()?;
    let period = p.u64()?;
    let flags = p.u8()?;
    let nframes = p.u32()? as usize;
    let mut callchain = Vec::with_capacity(nframes.min(1 << 16));
    for _ in 0..nframes {
        callchain.push(p.u64()?);
    }
    let nbranches = p.u32()? as usize;
    let mut branch_stack = Vec::with_capacity(nbranches.min(1 << 16));
    for _ in 0..nbranches {
        branch_stack.push(BranchItem {
            from: p.u64()?,
            to: p.u64()?,
            flags: p.u64()?,
        });
    }
    Ok(SampleRecord {
        attr_index,
        pid,
        tid,
        cpu,
        time,
        ip,
        period,
        in_kernel: flags & SAMPLE_FLAG_IN_KERNEL != 0,
        callchain,
        branch_stack,
    })
}

pub(crate) fn decode_tracing_data(data: &[u8]) -> Result<TracingDataRecord, DecodeError> {
    let mut p = Payload::new(data, "tracing data record");
    let count = p.u32()? as usize;
    let mut events = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let id = p.u64()?;
        let name = p.string()?;
        events.push((id, name));
    }
    Ok(TracingDataRecord { events })
}

pub(crate) fn decode_comment(data: &[u8]) -> Result<String, DecodeError> {
    Payload::new(data, "comment record").string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lstr(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u16).to_le_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn test_decode_comm() {
        let mut data = Vec::new();
        data.extend_from_slice(&42u32.to_le_bytes());
        data.extend_from_slice(&43u32.to_le_bytes());
        data.extend_from_slice(&lstr("worker"));

        let r = decode_comm(&data).unwrap();
        assert_eq!(r.pid, 42);
        assert_eq!(r.tid, 43);
        assert_eq!(r.comm, "worker");
    }

    #[test]
    fn test_decode_comm_truncated() {
        let err = decode_comm(&[0u8; 6]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_decode_map_image() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u32.to_le_bytes());
        data.push(0);
        data.extend_from_slice(&0x1000u64.to_le_bytes());
        data.extend_from_slice(&0x2000u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&lstr("/lib/a.so"));

        let r = decode_map_image(&data).unwrap();
        assert_eq!(r.pid, 7);
        assert!(!r.in_kernel);
        assert_eq!(r.start, 0x1000);
        assert_eq!(r.len, 0x2000);
        assert_eq!(r.path, "/lib/a.so");
    }

    #[test]
    fn test_decode_sample_with_callchain_and_branches() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes()); // attr_index
        data.extend_from_slice(&10u32.to_le_bytes()); // pid
        data.extend_from_slice(&11u32.to_le_bytes()); // tid
        data.extend_from_slice(&2u32.to_le_bytes()); // cpu
        data.extend_from_slice(&1000u64.to_le_bytes()); // time
        data.extend_from_slice(&0x2000u64.to_le_bytes()); // ip
        data.extend_from_slice(&80u64.to_le_bytes()); // period
        data.push(SAMPLE_FLAG_IN_KERNEL);
        data.extend_from_slice(&2u32.to_le_bytes()); // nframes
        data.extend_from_slice(&0x2000u64.to_le_bytes());
        data.extend_from_slice(&0x1500u64.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes()); // nbranches
        data.extend_from_slice(&0xAu64.to_le_bytes());
        data.extend_from_slice(&0xBu64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());

        let r = decode_sample(&data).unwrap();
        assert_eq!(r.attr_index, 1);
        assert_eq!(r.pid, 10);
        assert_eq!(r.cpu, 2);
        assert_eq!(r.period, 80);
        assert!(r.in_kernel);
        assert_eq!(r.callchain, vec![0x2000, 0x1500]);
        assert_eq!(r.branch_stack.len(), 1);
        assert_eq!(r.branch_stack[0].from, 0xA);
        assert_eq!(r.branch_stack[0].to, 0xB);
    }

    #[test]
    fn test_decode_sample_truncated_callchain() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&1u64.to_le_bytes());
        data.push(0);
        data.extend_from_slice(&5u32.to_le_bytes()); // claims 5 frames
        data.extend_from_slice(&0u64.to_le_bytes()); // provides 1

        let err = decode_sample(&data).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_decode_image_symbols() {
        let mut data = Vec::new();
        data.extend_from_slice(&lstr("/bin/app"));
        data.push(0);
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0x100u64.to_le_bytes());
        data.extend_from_slice(&0x10u64.to_le_bytes());
        data.extend_from_slice(&lstr("f"));
        data.extend_from_slice(&0x200u64.to_le_bytes());
        data.extend_from_slice(&0x20u64.to_le_bytes());
        data.extend_from_slice(&lstr("g"));

        let r = decode_image_symbols(&data).unwrap();
        assert_eq!(r.path, "/bin/app");
        assert_eq!(r.symbols.len(), 2);
        assert_eq!(r.symbols[1], (0x200, 0x20, "g".to_string()));
    }

    #[test]
    fn test_decode_tracing_data() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&77u64.to_le_bytes());
        data.extend_from_slice(&lstr("sched:sched_switch"));

        let r = decode_tracing_data(&data).unwrap();
        assert_eq!(r.events, vec![(77, "sched:sched_switch".to_string())]);
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&[0xFF, 0xFE]);

        let err = decode_comm(&data).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidString { .. }));
    }
}
