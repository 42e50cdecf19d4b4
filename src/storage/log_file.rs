//! Append-only message log file for one channel.
//!
//! Record layout (little endian):
//!
//! ```text
//! magic "MSG\0" | version u8 | flags u8 | sequence u64 | published_at i64
//! topic_len u32 | topic (MessagePack) | payload_len u32 | payload (UTF-8)
//! crc32 u32 over topic and payload
//! ```

use crate::error::{BrokerError, Result};
use crate::topic::Topic;
use crate::types::{Message, MessageInput, Sequence, Timestamp};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for message records.
const LOG_MAGIC: &[u8; 4] = b"MSG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Fixed header size: magic + version + flags + sequence + timestamp.
const RECORD_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 8;

/// Append-only message log with an in-memory sequence index.
pub struct LogFile {
    /// Path to the log file.
    path: PathBuf,

    /// Write handle.
    file: File,

    /// Offset of each record; sequence `n` lives at `offsets[n - 1]`.
    offsets: Vec<u64>,

    /// Current file size (for appending).
    size: u64,

    /// Number of writes since last sync.
    writes_since_sync: u64,

    /// Sync every N writes.
    sync_interval: u64,
}

impl LogFile {
    /// Open or create a log, rebuilding the sequence index by scanning it.
    ///
    /// A torn record at the very end (crash mid-append) is truncated away.
    /// Anything else that fails to decode is reported as corruption.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (offsets, valid_size) = Self::scan(&path, file_size)?;

        if valid_size < file_size {
            warn!(
                path = %path.display(),
                dropped_bytes = file_size - valid_size,
                "truncating torn record at end of log"
            );
            file.set_len(valid_size)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file,
            offsets,
            size: valid_size,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a message, assigning the next sequence.
    pub fn append(&mut self, input: MessageInput) -> Result<Message> {
        let sequence = self.tail().next();
        let message = input.into_message(sequence);
        let bytes = encode_record(&message)?;

        let offset = self.size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;

        self.size = offset + bytes.len() as u64;
        self.offsets.push(offset);

        // Sync periodically based on sync_interval
        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }

        Ok(message)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Last assigned sequence.
    pub fn tail(&self) -> Sequence {
        Sequence(self.offsets.len() as u64)
    }

    pub fn offset_of(&self, sequence: Sequence) -> Option<u64> {
        let index = sequence.0.checked_sub(1)?;
        self.offsets.get(index as usize).copied()
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read records from `from` up to the current end of the file.
    ///
    /// The reader owns its own file handle, so appends may continue while
    /// it is consumed; it stops at the end captured here.
    pub fn reader(&self, from: Sequence) -> Result<LogReader> {
        let start = match self.offset_of(from.max(Sequence(1))) {
            Some(offset) => offset,
            None => self.size,
        };
        LogReader::open(&self.path, start, self.size)
    }

    /// Walk the file, returning record offsets and the end of the last
    /// complete record.
    fn scan(path: &Path, file_size: u64) -> Result<(Vec<u64>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut offsets = Vec::new();
        let mut offset = 0u64;

        while offset < file_size {
            match decode_record(&mut reader) {
                Ok((message, len)) => {
                    let expected = Sequence(offsets.len() as u64 + 1);
                    if message.sequence != expected {
                        return Err(BrokerError::Corruption(format!(
                            "{}: expected {:?} at offset {}, found {:?}",
                            path.display(),
                            expected,
                            offset,
                            message.sequence
                        )));
                    }
                    offsets.push(offset);
                    offset += len;
                }
                Err(BrokerError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((offsets, offset))
    }
}

/// Sequential reader over a byte range of a log file.
pub struct LogReader {
    reader: BufReader<File>,
    offset: u64,
    end: u64,
}

impl LogReader {
    fn open(path: &Path, start: u64, end: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: start,
            end,
        })
    }
}

impl Iterator for LogReader {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        match decode_record(&mut self.reader) {
            Ok((message, len)) => {
                self.offset += len;
                Some(Ok(message))
            }
            Err(e) => {
                self.offset = self.end; // Stop iteration on error
                Some(Err(e))
            }
        }
    }
}

fn encode_record(message: &Message) -> Result<Vec<u8>> {
    let topic = rmp_serde::to_vec(&message.topic)?;
    let payload = message.payload.as_bytes();

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + 12 + topic.len() + payload.len());
    buf.extend_from_slice(LOG_MAGIC);
    buf.push(LOG_VERSION);
    buf.push(0u8); // flags (reserved)
    buf.extend_from_slice(&message.sequence.0.to_le_bytes());
    buf.extend_from_slice(&message.published_at.0.to_le_bytes());

    buf.extend_from_slice(&(topic.len() as u32).to_le_bytes());
    buf.extend_from_slice(&topic);

    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    buf.extend_from_slice(&checksum(&topic, payload).to_le_bytes());
    Ok(buf)
}

/// Decode one record, returning it with its encoded length.
fn decode_record(reader: &mut impl Read) -> Result<(Message, u64)> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    if &header[0..4] != LOG_MAGIC {
        return Err(BrokerError::InvalidFormat("Invalid record magic".into()));
    }
    if header[4] != LOG_VERSION {
        return Err(BrokerError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[4]
        )));
    }

    let sequence = Sequence(u64::from_le_bytes(le_array(&header[6..14])));
    let published_at = Timestamp(i64::from_le_bytes(le_array(&header[14..22])));

    let topic_bytes = read_block(reader)?;
    let payload_bytes = read_block(reader)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = checksum(&topic_bytes, &payload_bytes);
    if stored != computed {
        return Err(BrokerError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let topic: Topic = rmp_serde::from_slice(&topic_bytes)?;
    let payload = String::from_utf8(payload_bytes)
        .map_err(|e| BrokerError::Corruption(format!("payload is not UTF-8: {}", e)))?;

    let len = (RECORD_HEADER_SIZE + 4 + topic_bytes.len() + 4 + payload.len() + 4) as u64;
    Ok((
        Message {
            topic,
            payload,
            sequence,
            published_at,
        },
        len,
    ))
}

fn read_block(reader: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let mut block = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut block)?;
    Ok(block)
}

fn checksum(topic: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(topic);
    hasher.update(payload);
    hasher.finalize()
}

fn le_array(bytes: &[u8]) -> [u8; 8] {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    arr
}
