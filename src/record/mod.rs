//! Streaming reader for record files.
//!
//! [`RecordFileReader::open`] parses the header sections eagerly (attr table,
//! meta info, recorded cmdline, arch) and then iterates the data section one
//! record at a time, so sample-heavy files never sit in memory whole.

mod format;

pub use format::{
    BranchItem, CommRecord, DecodeError, EventAttr, ImageSymbolsRecord, MapImageRecord, Record,
    SampleRecord, TracingDataRecord, ATTR_FLAG_BRANCH_STACK, EVENT_KIND_HARDWARE,
    EVENT_KIND_SOFTWARE, EVENT_KIND_TRACEPOINT, MAGIC, META_SYSTEM_WIDE, META_TRACE_OFFCPU,
    RECORD_COMMENT, RECORD_COMM, RECORD_IMAGE_SYMBOLS, RECORD_MAP_IMAGE, RECORD_SAMPLE,
    RECORD_TRACING_DATA, SAMPLE_FLAG_IN_KERNEL, VERSION,
};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};

/// Largest accepted record payload. A cap this size only exists to turn a
/// corrupt length prefix into an error instead of an allocation storm.
const MAX_RECORD_LEN: u32 = 64 << 20;

/// A parsed record file: header sections plus a streaming data section.
#[derive(Debug)]
pub struct RecordFileReader<R> {
    reader: R,
    attrs: Vec<EventAttr>,
    meta: HashMap<String, String>,
    cmdline: Vec<String>,
    arch: String,
}

impl RecordFileReader<BufReader<File>> {
    /// Open a record file on disk and parse its header sections.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("can't open record file {}", path.display()))?;
        Self::new(BufReader::new(file))
            .with_context(|| format!("can't parse record file {}", path.display()))
    }
}

impl<R: Read> RecordFileReader<R> {
    /// Parse the header sections from any byte stream.
    pub fn new(mut reader: R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = read_u16(&mut reader)?;
        if version > VERSION {
            return Err(DecodeError::UnsupportedVersion { version });
        }
        let attr_count = read_u16(&mut reader)?;

        let mut attrs = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            attrs.push(EventAttr {
                kind: read_u32(&mut reader)?,
                config: read_u64(&mut reader)?,
                flags: read_u64(&mut reader)?,
                name: read_string(&mut reader, "attr name")?,
            });
        }

        let meta_count = read_u32(&mut reader)?;
        let mut meta = HashMap::with_capacity(meta_count as usize);
        for _ in 0..meta_count {
            let key = read_string(&mut reader, "meta key")?;
            let value = read_string(&mut reader, "meta value")?;
            meta.insert(key, value);
        }

        let cmdline_count = read_u32(&mut reader)?;
        let mut cmdline = Vec::with_capacity(cmdline_count as usize);
        for _ in 0..cmdline_count {
            cmdline.push(read_string(&mut reader, "cmdline arg")?);
        }

        let arch = read_string(&mut reader, "arch")?;

        Ok(Self {
            reader,
            attrs,
            meta,
            cmdline,
            arch,
        })
    }

    /// The attr table, one entry per recorded event.
    pub fn attrs(&self) -> &[EventAttr] {
        &self.attrs
    }

    /// Meta key/value section.
    pub fn meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    /// The command line the recording was made with.
    pub fn cmdline(&self) -> &[String] {
        &self.cmdline
    }

    /// Architecture of the recorded machine.
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Whether the given meta key holds the string `"true"`.
    pub fn meta_bool(&self, key: &str) -> bool {
        self.meta.get(key).is_some_and(|v| v == "true")
    }

    /// Stream the data section, invoking `f` for each decoded record. Records
    /// of unknown kinds are skipped over their length prefix. Stops early
    /// with the callback's error if it fails.
    pub fn for_each_record(
        &mut self,
        mut f: impl FnMut(Record) -> Result<()>,
    ) -> Result<()> {
        let mut payload = Vec::new();
        loop {
            let kind = match read_u16(&mut self.reader) {
                Ok(kind) => kind,
                Err(DecodeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let len = read_u32(&mut self.reader).context("reading record length")?;
            if len > MAX_RECORD_LEN {
                return Err(DecodeError::OversizedRecord {
                    len,
                    limit: MAX_RECORD_LEN,
                }
                .into());
            }
            payload.resize(len as usize, 0);
            self.reader
                .read_exact(&mut payload)
                .context("reading record payload")?;

            let record = match kind {
                RECORD_COMM => Record::Comm(format::decode_comm(&payload)?),
                RECORD_MAP_IMAGE => Record::MapImage(format::decode_map_image(&payload)?),
                RECORD_IMAGE_SYMBOLS => {
                    Record::ImageSymbols(format::decode_image_symbols(&payload)?)
                }
                RECORD_SAMPLE => Record::Sample(format::decode_sample(&payload)?),
                RECORD_TRACING_DATA => {
                    Record::TracingData(format::decode_tracing_data(&payload)?)
                }
                RECORD_COMMENT => Record::Comment(format::decode_comment(&payload)?),
                other => {
                    tracing::debug!(kind = other, len, "skipping unknown record kind");
                    continue;
                }
            };
            f(record)?;
        }
    }
}

fn read_u16(r: &mut impl Read) -> Result<u16, DecodeError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32, DecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64, DecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read, what: &'static str) -> Result<String, DecodeError> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| DecodeError::InvalidString { what })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lstr(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u16).to_le_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    /// Minimal header: one attr named "cycles", no meta, no cmdline.
    fn minimal_header() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&VERSION.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // attr count
        data.extend_from_slice(&EVENT_KIND_HARDWARE.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes()); // config
        data.extend_from_slice(&0u64.to_le_bytes()); // flags
        data.extend_from_slice(&lstr("cycles"));
        data.extend_from_slice(&0u32.to_le_bytes()); // meta count
        data.extend_from_slice(&0u32.to_le_bytes()); // cmdline count
        data.extend_from_slice(&lstr("x86_64"));
        data
    }

    fn comm_record(pid: u32, tid: u32, comm: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&pid.to_le_bytes());
        payload.extend_from_slice(&tid.to_le_bytes());
        payload.extend_from_slice(&lstr(comm));
        frame(RECORD_COMM, &payload)
    }

    fn frame(kind: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = kind.to_le_bytes().to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_header_parses() {
        let header = minimal_header();
        let reader = RecordFileReader::new(&header[..]).unwrap();
        assert_eq!(reader.attrs().len(), 1);
        assert_eq!(reader.attrs()[0].name, "cycles");
        assert_eq!(reader.arch(), "x86_64");
        assert!(reader.cmdline().is_empty());
        assert!(!reader.meta_bool(META_TRACE_OFFCPU));
    }

    #[test]
    fn test_bad_magic() {
        let err = RecordFileReader::new(&b"NOTAFILE"[..]).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic));
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&99u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        let err = RecordFileReader::new(&data[..]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnsupportedVersion { version: 99 }
        ));
    }

    #[test]
    fn test_streams_records_until_eof() {
        let mut data = minimal_header();
        data.extend_from_slice(&comm_record(1, 1, "a"));
        data.extend_from_slice(&comm_record(2, 2, "b"));

        let mut reader = RecordFileReader::new(&data[..]).unwrap();
        let mut comms = Vec::new();
        reader
            .for_each_record(|record| {
                if let Record::Comm(c) = record {
                    comms.push(c.comm);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(comms, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_record_kind_skipped() {
        let mut data = minimal_header();
        data.extend_from_slice(&frame(999, &[1, 2, 3, 4]));
        data.extend_from_slice(&comm_record(1, 1, "after"));

        let mut reader = RecordFileReader::new(&data[..]).unwrap();
        let mut seen = 0;
        reader
            .for_each_record(|_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_callback_error_stops_stream() {
        let mut data = minimal_header();
        data.extend_from_slice(&comm_record(1, 1, "a"));
        data.extend_from_slice(&comm_record(2, 2, "b"));

        let mut reader = RecordFileReader::new(&data[..]).unwrap();
        let mut seen = 0;
        let err = reader.for_each_record(|_| {
            seen += 1;
            anyhow::bail!("stop")
        });
        assert!(err.is_err());
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_truncated_record_payload_is_error() {
        let mut data = minimal_header();
        data.extend_from_slice(&RECORD_COMM.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes()); // claims 100 bytes
        data.extend_from_slice(&[0u8; 4]); // provides 4

        let mut reader = RecordFileReader::new(&data[..]).unwrap();
        assert!(reader.for_each_record(|_| Ok(())).is_err());
    }

    #[test]
    fn test_oversized_record_is_error() {
        let mut data = minimal_header();
        data.extend_from_slice(&RECORD_COMM.to_le_bytes());
        data.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut reader = RecordFileReader::new(&data[..]).unwrap();
        assert!(reader.for_each_record(|_| Ok(())).is_err());
    }
}
