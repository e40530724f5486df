use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::StoreEvent;

/// Durable log behind `InMemoryStore`.
///
/// Each event is one frame: `[u32 le: payload len][bincode payload][u32 le: crc32]`.
/// A store batch is encoded up front and hits the file in a single write
/// followed by one fsync. Replay keeps every frame up to the first one that
/// is short, fails its checksum or does not decode.
pub struct Wal {
    file: File,
    path: PathBuf,
    events_since_compact: u64,
}

fn push_frame(buf: &mut Vec<u8>, event: &StoreEvent) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

fn encode_all(events: &[StoreEvent]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for event in events {
        push_frame(&mut buf, event)?;
    }
    Ok(buf)
}

/// `Ok(false)` on a clean or torn end of file.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact frame, or `None` where the usable log ends.
fn next_frame(reader: &mut impl Read) -> io::Result<Option<StoreEvent>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: OpenOptions::new().create(true).append(true).open(path)?,
            path: path.to_path_buf(),
            events_since_compact: 0,
        })
    }

    /// Write one store batch and fsync it.
    pub fn append_batch(&mut self, events: &[StoreEvent]) -> io::Result<()> {
        let buf = encode_all(events)?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.events_since_compact += events.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events_since_compact(&self) -> u64 {
        self.events_since_compact
    }

    /// Swap the log for a snapshot of current state via a sibling temp file.
    pub fn compact(&mut self, snapshot: &[StoreEvent]) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut out = File::create(&tmp)?;
        out.write_all(&encode_all(snapshot)?)?;
        out.sync_all()?;
        drop(out);
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.events_since_compact = 0;
        Ok(())
    }

    /// Every intact event in the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<StoreEvent>> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        while let Some(event) = next_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
