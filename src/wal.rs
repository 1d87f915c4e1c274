//! Append-only event log, one file per business.
//!
//! Entry layout: `[u32 le: len][bincode Event: len bytes][u32 le: crc32 of payload]`.
//! Recovery keeps the longest prefix of intact entries and cuts everything
//! after it, so a crash mid-write costs at most the entry being written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Upper bound on one encoded entry. A larger length prefix can only come
/// from a torn or corrupt write.
const MAX_ENTRY_LEN: usize = 1 << 20;

/// Length prefix plus checksum.
const FRAMING: usize = 8;

fn encode_entry(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let word: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(word))
}

/// Decode entries from the start of `bytes`. Returns the events and the
/// length of the intact prefix they came from.
fn decode_entries(bytes: &[u8]) -> (Vec<Event>, usize) {
    let mut events = Vec::new();
    let mut offset = 0;
    while let Some(len) = read_u32(bytes, offset) {
        let len = len as usize;
        if len > MAX_ENTRY_LEN {
            break;
        }
        let start = offset + 4;
        let (Some(payload), Some(crc)) = (bytes.get(start..start + len), read_u32(bytes, start + len))
        else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            break;
        }
        let Ok(event) = bincode::deserialize::<Event>(payload) else {
            break;
        };
        events.push(event);
        offset += len + FRAMING;
    }
    (events, offset)
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open the log at `path`, creating it if missing, and return the events
    /// it holds. An unreadable tail is truncated before the file is reopened
    /// for appending, so new entries never land behind it.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let (events, intact) = decode_entries(&bytes);
        if intact < bytes.len() {
            warn!(
                path = %path.display(),
                replayed = events.len(),
                discarded_bytes = bytes.len() - intact,
                "truncating unreadable WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact as u64)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until [`flush_sync`](Self::flush_sync).
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_entry(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// First half of compaction: write `events` to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_entry(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Second half: rename the side file over the log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}
