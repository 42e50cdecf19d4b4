//! Durable, directory-backed storage connection.
//!
//! Layout:
//!
//! ```text
//! <path>/MANIFEST                 magic + format version
//! <path>/LOCK                     exclusive process lock
//! <path>/channels/<name>/channel.json
//! <path>/channels/<name>/messages.log
//! ```

use super::feed::{Backlog, Feed, MessageStream};
use super::log_file::LogFile;
use super::{validate_channel_name, MessageFilter, StorageConnection};
use crate::error::{BrokerError, Result};
use crate::topic::TopicShape;
use crate::types::{Message, MessageInput, Sequence, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"RPS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const CHANNELS_DIR: &str = "channels";
const CHANNEL_META: &str = "channel.json";
const CHANNEL_LOG: &str = "messages.log";

/// File connection configuration.
#[derive(Clone, Debug)]
pub struct FileConnectionConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync every N appends per channel (1 = every append).
    pub sync_interval: u64,
}

impl Default for FileConnectionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./repubsub"),
            create_if_missing: true,
            sync_interval: 1,
        }
    }
}

/// Persisted channel metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChannelMeta {
    name: String,
    shape: TopicShape,
    created: Timestamp,
}

struct FileChannel {
    meta: ChannelMeta,
    /// Serializes appends; also held while a stream captures its backlog.
    log: Mutex<LogFile>,
    feed: Arc<Feed>,
}

/// Storage connection keeping one append-only log file per channel.
///
/// The store is single-process: opening takes an exclusive `LOCK`, so a
/// second process fails with `Locked`. Publishers and subscribers that
/// share a store must share one connection inside one process.
pub struct FileConnection {
    config: FileConnectionConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    channels: RwLock<HashMap<String, Arc<FileChannel>>>,

    connected: AtomicBool,
}

impl FileConnection {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: FileConnectionConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(BrokerError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: FileConnectionConfig) -> Result<Self> {
        fs::create_dir_all(config.path.join(CHANNELS_DIR))?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        info!(path = %config.path.display(), "store created");
        Ok(Self {
            config,
            _lock_file: lock_file,
            channels: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
        })
    }

    /// Open an existing store, loading every channel.
    pub fn open(config: FileConnectionConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let mut channels = HashMap::new();
        for entry in fs::read_dir(config.path.join(CHANNELS_DIR))? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            if !dir.join(CHANNEL_META).exists() {
                warn!(dir = %dir.display(), "skipping channel directory without metadata");
                continue;
            }
            let channel = Self::load_channel(&dir, config.sync_interval)?;
            channels.insert(channel.meta.name.clone(), Arc::new(channel));
        }

        info!(path = %config.path.display(), channels = channels.len(), "store opened");
        Ok(Self {
            config,
            _lock_file: lock_file,
            channels: RwLock::new(channels),
            connected: AtomicBool::new(true),
        })
    }

    /// Flush every channel log to disk.
    pub fn sync(&self) -> Result<()> {
        for channel in self.channels.read().values() {
            channel.log.lock().sync()?;
        }
        Ok(())
    }

    /// Drop the connection. Open streams end with `ConnectionLost`.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        for channel in self.channels.read().values() {
            // Waits out an in-flight append so it is delivered before the close.
            let _log = channel.log.lock();
            channel.feed.close("file connection closed");
        }
    }

    /// Names of all channels in the store.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of open streams on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, |c| c.feed.listener_count())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn load_channel(dir: &Path, sync_interval: u64) -> Result<FileChannel> {
        let meta_bytes = fs::read(dir.join(CHANNEL_META))?;
        let meta: ChannelMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| BrokerError::Deserialization(e.to_string()))?;
        let log = LogFile::open(dir.join(CHANNEL_LOG), sync_interval)?;
        debug!(channel = %meta.name, tail = log.tail().0, "channel loaded");

        Ok(FileChannel {
            feed: Arc::new(Feed::new(meta.name.clone())),
            meta,
            log: Mutex::new(log),
        })
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost("file connection closed".into()))
        }
    }

    fn channel(&self, name: &str) -> Result<Arc<FileChannel>> {
        self.check_connected()?;
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(BrokerError::NotInitialized);
        }

        let mut file = File::open(manifest_path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| BrokerError::Locked)?;

        Ok(lock_file)
    }
}

impl StorageConnection for FileConnection {
    fn ensure_channel(&self, channel: &str, shape: TopicShape) -> Result<TopicShape> {
        self.check_connected()?;
        validate_channel_name(channel)?;

        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(channel) {
            if existing.meta.shape != shape {
                return Err(BrokerError::ShapeMismatch {
                    expected: existing.meta.shape,
                    got: shape,
                });
            }
            return Ok(existing.meta.shape);
        }

        let dir = self.config.path.join(CHANNELS_DIR).join(channel);
        fs::create_dir_all(&dir)?;

        let meta = ChannelMeta {
            name: channel.to_string(),
            shape,
            created: Timestamp::now(),
        };
        // Write-then-rename so a crash never leaves half a metadata file.
        let tmp = dir.join(format!("{}.tmp", CHANNEL_META));
        fs::write(&tmp, serde_json::to_vec_pretty(&meta)?)?;
        fs::rename(&tmp, dir.join(CHANNEL_META))?;

        let log = LogFile::open(dir.join(CHANNEL_LOG), self.config.sync_interval)?;
        channels.insert(
            channel.to_string(),
            Arc::new(FileChannel {
                meta,
                log: Mutex::new(log),
                feed: Arc::new(Feed::new(channel)),
            }),
        );

        info!(channel, %shape, "channel created");
        Ok(shape)
    }

    fn append_document(&self, channel: &str, input: MessageInput) -> Result<Message> {
        let channel = self.channel(channel)?;

        let mut log = channel.log.lock();
        self.check_connected()?;
        let message = log.append(input)?;
        channel.feed.broadcast(&message);

        debug!(channel = %channel.meta.name, sequence = message.sequence.0, "appended");
        Ok(message)
    }

    fn stream_matching(
        &self,
        channel: &str,
        filter: Arc<dyn MessageFilter>,
        from: Sequence,
    ) -> Result<MessageStream> {
        let channel = self.channel(channel)?;

        let log = channel.log.lock();
        let backlog: Backlog = Box::new(log.reader(from)?);
        channel.feed.register(filter, backlog, from)
    }

    fn tail(&self, channel: &str) -> Result<Sequence> {
        let channel = self.channel(channel)?;
        let tail = channel.log.lock().tail();
        Ok(tail)
    }

    fn scan(&self, channel: &str) -> Result<Vec<Message>> {
        let channel = self.channel(channel)?;
        let reader = channel.log.lock().reader(Sequence(1))?;
        reader.collect()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for FileConnection {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.sync() {
            warn!(error = %e, "sync on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::{Predicate, Topic};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> FileConnectionConfig {
        FileConnectionConfig {
            path: dir.path().join("store"),
            create_if_missing: true,
            sync_interval: 1,
        }
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let conn = FileConnection::create(test_config(&dir)).unwrap();
        assert!(conn.path().join("MANIFEST").exists());
        assert!(conn.channel_names().is_empty());
    }

    #[test]
    fn test_append_and_tail() {
        let dir = TempDir::new().unwrap();
        let conn = FileConnection::create(test_config(&dir)).unwrap();
        conn.ensure_channel("tags_demo", TopicShape::Tags).unwrap();

        let message = conn
            .append_document(
                "tags_demo",
                MessageInput::new(Topic::tags(["teamups", "superheroes"]), "hi"),
            )
            .unwrap();
        assert_eq!(message.sequence, Sequence(1));
        assert_eq!(conn.tail("tags_demo").unwrap(), Sequence(1));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let conn = FileConnection::create(test_config(&dir)).unwrap();
            conn.ensure_channel("regex_demo", TopicShape::Path).unwrap();
            for i in 1..=3 {
                conn.append_document(
                    "regex_demo",
                    MessageInput::new(Topic::path("fights.superheroes.Batman"), format!("{}", i)),
                )
                .unwrap();
            }
        }

        {
            let conn = FileConnection::open(test_config(&dir)).unwrap();
            assert_eq!(conn.channel_names(), vec!["regex_demo".to_string()]);
            assert_eq!(conn.tail("regex_demo").unwrap(), Sequence(3));

            let payloads: Vec<String> = conn
                .scan("regex_demo")
                .unwrap()
                .into_iter()
                .map(|m| m.payload)
                .collect();
            assert_eq!(payloads, vec!["1", "2", "3"]);

            // Shape survives reopen.
            let result = conn.ensure_channel("regex_demo", TopicShape::Hierarchy);
            assert!(matches!(result, Err(BrokerError::ShapeMismatch { .. })));
        }
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let _conn = FileConnection::create(test_config(&dir)).unwrap();

        let result = FileConnection::open(test_config(&dir));
        assert!(matches!(result, Err(BrokerError::Locked)));
    }

    #[test]
    fn test_open_missing_store() {
        let dir = TempDir::new().unwrap();
        let config = FileConnectionConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        let result = FileConnection::open_or_create(config);
        assert!(matches!(result, Err(BrokerError::NotInitialized)));
    }

    #[test]
    fn test_stream_from_disk_then_live() {
        let dir = TempDir::new().unwrap();
        let conn = FileConnection::create(test_config(&dir)).unwrap();
        conn.ensure_channel("regex_demo", TopicShape::Path).unwrap();

        let publish = |topic: &str| {
            conn.append_document("regex_demo", MessageInput::new(Topic::path(topic), topic))
                .unwrap()
        };
        publish("fights.superheroes.Batman");
        publish("events.sidekicks.Robin");

        let filter = Arc::new(Predicate::pattern(r"^fights\.").unwrap());
        let mut stream = conn.stream_matching("regex_demo", filter, Sequence(1)).unwrap();

        publish("fights.supervillains.Joker");

        let seqs: Vec<u64> = (0..2)
            .map(|_| stream.next().unwrap().unwrap().sequence.0)
            .collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn test_rejects_bad_channel_name() {
        let dir = TempDir::new().unwrap();
        let conn = FileConnection::create(test_config(&dir)).unwrap();
        let result = conn.ensure_channel("../outside", TopicShape::Path);
        assert!(matches!(result, Err(BrokerError::InvalidChannel(_))));
    }
}
