//! File-backed broker: one append-only, checksummed log per domain.

use super::{Broker, BrokerRecord, Deliver};
use crate::error::{Result, StreamError};
use crate::stream::Subscription;
use crate::types::{Sequence, Subject, Timestamp};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

/// Magic bytes for the broker manifest.
const BROKER_MAGIC: &[u8; 4] = b"SWB\0";

/// Current broker format version.
const BROKER_VERSION: u8 = 1;

/// Magic bytes for a log frame.
const FRAME_MAGIC: &[u8; 4] = b"SWL\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// Frame header size (fixed part).
const FRAME_HEADER_SIZE: u64 = 4 + 1 + 1 + 8 + 8 + 4; // magic + version + flags + seq + timestamp + len

/// Checksum trailer size.
const FRAME_TRAILER_SIZE: u64 = 4;

/// Largest payload a frame may carry.
const MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Log broker configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogBrokerConfig {
    /// Directory holding the domain logs.
    pub path: PathBuf,

    /// Sync every N appends per domain (0 and 1 both sync every append).
    pub sync_interval: u64,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for LogBrokerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./broker"),
            sync_interval: 100,
            create_if_missing: true,
        }
    }
}

/// A decoded frame.
struct Frame {
    sequence: Sequence,
    time: Timestamp,
    payload: Vec<u8>,
}

impl Frame {
    fn encoded_len(&self) -> u64 {
        FRAME_HEADER_SIZE + self.payload.len() as u64 + FRAME_TRAILER_SIZE
    }
}

fn encode_frame(sequence: Sequence, time: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity((FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as usize + payload.len());

    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(FRAME_VERSION);

    // Flags (reserved)
    buf.push(0u8);

    buf.extend_from_slice(&sequence.0.to_le_bytes());
    buf.extend_from_slice(&time.0.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf
}

fn read_frame(reader: &mut impl Read) -> Result<Frame> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != FRAME_MAGIC {
        return Err(StreamError::InvalidFormat("Invalid frame magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != FRAME_VERSION {
        return Err(StreamError::InvalidFormat(format!(
            "Unsupported frame version: {}",
            version[0]
        )));
    }

    let mut _flags = [0u8; 1];
    reader.read_exact(&mut _flags)?;

    let mut seq_bytes = [0u8; 8];
    reader.read_exact(&mut seq_bytes)?;
    let sequence = Sequence(u64::from_le_bytes(seq_bytes));

    let mut ts_bytes = [0u8; 8];
    reader.read_exact(&mut ts_bytes)?;
    let time = Timestamp(i64::from_le_bytes(ts_bytes));

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        return Err(StreamError::Corruption("Frame payload too large".into()));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(&payload);
    if stored_checksum != computed_checksum {
        return Err(StreamError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    Ok(Frame {
        sequence,
        time,
        payload,
    })
}

fn log_file_name(domain: &str) -> String {
    format!("{}.log", hex::encode(domain))
}

fn domain_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".log")?;
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

/// Append-only log of one domain.
struct DomainLog {
    domain: String,
    path: PathBuf,
    sync_interval: u64,
    state: Mutex<LogState>,
    /// Signalled on every append and on close.
    appended: Condvar,
}

struct LogState {
    file: File,
    /// File offset of each frame; index `i` holds sequence `i + 1`.
    offsets: Vec<u64>,
    size: u64,
    writes_since_sync: u64,
    closed: bool,
}

impl DomainLog {
    fn open(path: PathBuf, domain: String, sync_interval: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (offsets, good_end) = Self::scan(&file, file_size, &domain)?;
        if good_end < file_size {
            warn!(
                domain = %domain,
                good_end,
                file_size,
                "truncating torn tail of domain log"
            );
            file.set_len(good_end)?;
            file.sync_all()?;
        }

        Ok(Self {
            domain,
            path,
            sync_interval: sync_interval.max(1),
            state: Mutex::new(LogState {
                file,
                offsets,
                size: good_end,
                writes_since_sync: 0,
                closed: false,
            }),
            appended: Condvar::new(),
        })
    }

    /// Index every intact frame. Returns the offsets and the end of the last
    /// intact frame. Only a damaged final frame is treated as a torn tail; a
    /// bad frame followed by more data is corruption.
    fn scan(file: &File, file_size: u64, domain: &str) -> Result<(Vec<u64>, u64)> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;

        let mut offsets = Vec::new();
        let mut pos = 0u64;
        while pos < file_size {
            match read_frame(&mut reader) {
                Ok(frame) => {
                    let expected = Sequence(offsets.len() as u64 + 1);
                    if frame.sequence != expected {
                        return Err(StreamError::Corruption(format!(
                            "domain '{}': expected {:?} at offset {}, found {:?}",
                            domain, expected, pos, frame.sequence
                        )));
                    }
                    offsets.push(pos);
                    pos += frame.encoded_len();
                }
                Err(StreamError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!(domain = %domain, offset = pos, "incomplete frame at end of log");
                    break;
                }
                Err(e) => {
                    if reader.stream_position()? < file_size {
                        return Err(StreamError::Corruption(format!(
                            "domain '{}': unreadable frame at offset {}: {}",
                            domain, pos, e
                        )));
                    }
                    warn!(domain = %domain, offset = pos, error = %e, "damaged frame at end of log");
                    break;
                }
            }
        }
        Ok((offsets, pos))
    }

    fn last_sequence(&self) -> Sequence {
        Sequence(self.state.lock().offsets.len() as u64)
    }

    fn append(&self, payload: &[u8]) -> Result<Sequence> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(StreamError::InvalidFormat(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_PAYLOAD
            )));
        }

        let sequence = Sequence(state.offsets.len() as u64 + 1);
        let buf = encode_frame(sequence, Timestamp::now(), payload);

        let offset = state.size;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&buf)?;
        state.size += buf.len() as u64;
        state.offsets.push(offset);

        state.writes_since_sync += 1;
        if state.writes_since_sync >= self.sync_interval {
            state.file.sync_all()?;
            state.writes_since_sync = 0;
        }

        self.appended.notify_all();
        Ok(sequence)
    }

    /// Block until `next` exists. `None` once the log or the subscription
    /// closes.
    fn wait_for(&self, next: Sequence, closed: &AtomicBool) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if closed.load(Ordering::Acquire) || state.closed {
                return None;
            }
            let index = next.0 as usize;
            if index >= 1 && index <= state.offsets.len() {
                return Some(state.offsets[index - 1]);
            }
            self.appended.wait(&mut state);
        }
    }

    fn wake(&self) {
        let _state = self.state.lock();
        self.appended.notify_all();
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.appended.notify_all();
        state.file.sync_all()?;
        Ok(())
    }
}

/// Single-node durable broker backed by one log file per domain.
pub struct LogBroker {
    config: LogBrokerConfig,
    _lock_file: File,
    domains: RwLock<HashMap<String, Arc<DomainLog>>>,
    closed: AtomicBool,
}

impl LogBroker {
    /// Open an existing broker directory or create a new one.
    pub fn open_or_create(config: LogBrokerConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StreamError::NotInitialized)
        }
    }

    /// Create a new broker directory.
    pub fn create(config: LogBrokerConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        info!(path = %config.path.display(), "log broker created");
        Ok(Self {
            config,
            _lock_file: lock_file,
            domains: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Open an existing broker directory, indexing every domain log.
    pub fn open(config: LogBrokerConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let mut domains = HashMap::new();
        for entry in fs::read_dir(&config.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".log") {
                continue;
            }
            match domain_from_file_name(name) {
                Some(domain) => {
                    let log = DomainLog::open(entry.path(), domain.clone(), config.sync_interval)?;
                    domains.insert(domain, Arc::new(log));
                }
                None => warn!(file = name, "skipping log with undecodable name"),
            }
        }

        info!(path = %config.path.display(), domains = domains.len(), "log broker opened");
        Ok(Self {
            config,
            _lock_file: lock_file,
            domains: RwLock::new(domains),
            closed: AtomicBool::new(false),
        })
    }

    /// Domains with at least a log file.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.read().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Read the record at `sequence`, if stored.
    pub fn get(&self, domain: &str, sequence: Sequence) -> Result<Option<BrokerRecord>> {
        let Some(log) = self.domain_log(domain, false)? else {
            return Ok(None);
        };
        let offset = {
            let state = log.state.lock();
            match (sequence.0 as usize).checked_sub(1).and_then(|i| state.offsets.get(i)) {
                Some(offset) => *offset,
                None => return Ok(None),
            }
        };
        let mut file = File::open(&log.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let frame = read_frame(&mut BufReader::new(file))?;
        Ok(Some(BrokerRecord {
            domain: domain.to_string(),
            sequence: frame.sequence,
            time: frame.time,
            data: frame.payload,
        }))
    }

    fn domain_log(&self, domain: &str, create: bool) -> Result<Option<Arc<DomainLog>>> {
        if let Some(log) = self.domains.read().get(domain) {
            return Ok(Some(log.clone()));
        }
        if !create {
            return Ok(None);
        }

        let mut domains = self.domains.write();
        if let Some(log) = domains.get(domain) {
            return Ok(Some(log.clone()));
        }
        let path = self.config.path.join(log_file_name(domain));
        let log = Arc::new(DomainLog::open(path, domain.to_string(), self.config.sync_interval)?);
        domains.insert(domain.to_string(), log.clone());
        debug!(domain, "domain log created");
        Ok(Some(log))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(BROKER_MAGIC)?;
        file.write_all(&[BROKER_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BROKER_MAGIC {
            return Err(StreamError::InvalidFormat("Invalid broker magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BROKER_VERSION {
            return Err(StreamError::InvalidFormat(format!(
                "Unsupported broker version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StreamError::Locked)?;
        Ok(lock_file)
    }
}

impl Broker for LogBroker {
    fn last_sequence(&self, domain: &str) -> Result<Sequence> {
        Subject::validate_domain(domain)?;
        Ok(self
            .domain_log(domain, false)?
            .map(|log| log.last_sequence())
            .unwrap_or_default())
    }

    fn publish(&self, domain: &str, data: &[u8]) -> Result<Sequence> {
        Subject::validate_domain(domain)?;
        self.ensure_open()?;
        let log = self
            .domain_log(domain, true)?
            .ok_or_else(|| StreamError::Corruption(format!("domain log '{}' missing", domain)))?;
        log.append(data)
    }

    fn subscribe(&self, domain: &str, from: Sequence, deliver: Deliver) -> Result<Box<dyn Subscription>> {
        Subject::validate_domain(domain)?;
        self.ensure_open()?;
        let log = self
            .domain_log(domain, true)?
            .ok_or_else(|| StreamError::Corruption(format!("domain log '{}' missing", domain)))?;

        let shared = Arc::new(FollowerShared {
            closed: AtomicBool::new(false),
            delivering: Mutex::new(()),
        });
        let follower = Follower {
            reader: File::open(&log.path)?,
            log: log.clone(),
            next: from.max(Sequence(1)),
            shared: shared.clone(),
            deliver,
        };
        let handle = thread::Builder::new()
            .name(format!("broker-{}", domain))
            .spawn(move || follower.run())?;

        debug!(domain, from = from.0, "log broker subscribed");
        Ok(Box::new(LogSubscription {
            domain: domain.to_string(),
            log,
            shared,
            worker: handle.thread().id(),
        }))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut last_err = None;
        for log in self.domains.read().values() {
            if let Err(e) = log.close() {
                error!(domain = %log.domain, error = %e, "closing domain log failed");
                last_err = Some(e);
            }
        }
        info!(path = %self.config.path.display(), "log broker closed");
        last_err.map_or(Ok(()), Err)
    }
}

impl Drop for LogBroker {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = Broker::close(self);
    }
}

struct FollowerShared {
    closed: AtomicBool,
    delivering: Mutex<()>,
}

/// Replays a domain log from a sequence and then follows appends.
struct Follower {
    log: Arc<DomainLog>,
    reader: File,
    next: Sequence,
    shared: Arc<FollowerShared>,
    deliver: Deliver,
}

impl Follower {
    fn run(mut self) {
        while let Some(offset) = self.log.wait_for(self.next, &self.shared.closed) {
            let frame = match self.read_at(offset) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(domain = %self.log.domain, sequence = self.next.0, error = %e, "reading domain log failed");
                    break;
                }
            };

            let _delivering = self.shared.delivering.lock();
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }
            (self.deliver)(BrokerRecord {
                domain: self.log.domain.clone(),
                sequence: frame.sequence,
                time: frame.time,
                data: frame.payload,
            });
            self.next = self.next.next();
        }
        debug!(domain = %self.log.domain, "log follower exited");
    }

    fn read_at(&mut self, offset: u64) -> Result<Frame> {
        self.reader.seek(SeekFrom::Start(offset))?;
        read_frame(&mut BufReader::new(&mut self.reader))
    }
}

struct LogSubscription {
    domain: String,
    log: Arc<DomainLog>,
    shared: Arc<FollowerShared>,
    worker: ThreadId,
}

impl Subscription for LogSubscription {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        self.log.wake();
        if thread::current().id() != self.worker {
            drop(self.shared.delivering.lock());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LogBrokerConfig {
        LogBrokerConfig {
            path: dir.path().join("broker"),
            sync_interval: 1,
            create_if_missing: true,
        }
    }

    #[test]
    fn test_publish_assigns_sequences() {
        let dir = TempDir::new().unwrap();
        let broker = LogBroker::create(test_config(&dir)).unwrap();

        assert_eq!(broker.last_sequence("team").unwrap(), Sequence(0));
        assert_eq!(broker.publish("team", b"one").unwrap(), Sequence(1));
        assert_eq!(broker.publish("team", b"two").unwrap(), Sequence(2));
        assert_eq!(broker.publish("member", b"uno").unwrap(), Sequence(1));
        assert_eq!(broker.last_sequence("team").unwrap(), Sequence(2));

        let record = broker.get("team", Sequence(2)).unwrap().unwrap();
        assert_eq!(record.data, b"two");
        assert!(broker.get("team", Sequence(3)).unwrap().is_none());
        assert!(broker.get("team", Sequence(0)).unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_domain() {
        let dir = TempDir::new().unwrap();
        let broker = LogBroker::create(test_config(&dir)).unwrap();
        assert!(matches!(
            broker.publish("team:updated", b"x"),
            Err(StreamError::InvalidSubject(_))
        ));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let broker = LogBroker::create(config.clone()).unwrap();
            for i in 0..5 {
                broker.publish("team", format!("record {}", i).as_bytes()).unwrap();
            }
        }

        let broker = LogBroker::open(config).unwrap();
        assert_eq!(broker.domains(), vec!["team".to_string()]);
        assert_eq!(broker.last_sequence("team").unwrap(), Sequence(5));
        assert_eq!(broker.publish("team", b"record 5").unwrap(), Sequence(6));
    }

    #[test]
    fn test_broker_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let _broker = LogBroker::create(config.clone()).unwrap();
        let result = LogBroker::open(config);
        assert!(matches!(result, Err(StreamError::Locked)));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = LogBrokerConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            LogBroker::open_or_create(config),
            Err(StreamError::NotInitialized)
        ));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let broker = LogBroker::create(config.clone()).unwrap();
            broker.publish("team", b"one").unwrap();
            broker.publish("team", b"two").unwrap();
        }

        // Half-written frame at the end.
        let path = config.path.join(log_file_name("team"));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&FRAME_MAGIC[..]).unwrap();
        file.write_all(&[FRAME_VERSION, 0, 3]).unwrap();
        drop(file);

        let broker = LogBroker::open(config).unwrap();
        assert_eq!(broker.last_sequence("team").unwrap(), Sequence(2));
        assert_eq!(broker.publish("team", b"three").unwrap(), Sequence(3));
        assert_eq!(broker.get("team", Sequence(3)).unwrap().unwrap().data, b"three");
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let broker = LogBroker::create(config.clone()).unwrap();
            let big = vec![0u8; MAX_PAYLOAD + 1];
            assert!(matches!(
                broker.publish("big", &big),
                Err(StreamError::InvalidFormat(_))
            ));
            assert_eq!(broker.publish("big", b"small").unwrap(), Sequence(1));
        }

        let broker = LogBroker::open(config).unwrap();
        assert_eq!(broker.last_sequence("big").unwrap(), Sequence(1));
        assert_eq!(broker.get("big", Sequence(1)).unwrap().unwrap().data, b"small");
    }

    #[test]
    fn test_damaged_frame_before_end_is_corruption() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let broker = LogBroker::create(config.clone()).unwrap();
            for record in [b"one", b"two", b"six"] {
                broker.publish("team", record).unwrap();
            }
        }

        // Flip a payload byte of the second frame.
        let path = config.path.join(log_file_name("team"));
        let mut bytes = fs::read(&path).unwrap();
        let second = (FRAME_HEADER_SIZE + 3 + FRAME_TRAILER_SIZE) as usize;
        bytes[second + FRAME_HEADER_SIZE as usize] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            LogBroker::open(config),
            Err(StreamError::Corruption(_))
        ));
        assert_eq!(fs::metadata(&path).unwrap().len(), bytes.len() as u64);
    }

    #[test]
    fn test_damaged_last_frame_is_truncated() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let broker = LogBroker::create(config.clone()).unwrap();
            broker.publish("team", b"one").unwrap();
            broker.publish("team", b"two").unwrap();
        }

        let path = config.path.join(log_file_name("team"));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let broker = LogBroker::open(config).unwrap();
        assert_eq!(broker.last_sequence("team").unwrap(), Sequence(1));
    }

    #[test]
    fn test_subscribe_replays_then_follows() {
        let dir = TempDir::new().unwrap();
        let broker = LogBroker::create(test_config(&dir)).unwrap();
        broker.publish("team", b"one").unwrap();
        broker.publish("team", b"two").unwrap();

        let (tx, rx) = unbounded();
        let sub = broker
            .subscribe("team", Sequence(0), Box::new(move |record: BrokerRecord| {
                let _ = tx.send(record);
            }))
            .unwrap();

        broker.publish("team", b"three").unwrap();

        let got: Vec<(u64, Vec<u8>)> = (0..3)
            .map(|_| {
                let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                (r.sequence.0, r.data)
            })
            .collect();
        assert_eq!(
            got,
            vec![(1, b"one".to_vec()), (2, b"two".to_vec()), (3, b"three".to_vec())]
        );

        sub.close().unwrap();
        broker.publish("team", b"four").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_subscribe_from_sequence() {
        let dir = TempDir::new().unwrap();
        let broker = LogBroker::create(test_config(&dir)).unwrap();
        for i in 1..=4u8 {
            broker.publish("team", &[i]).unwrap();
        }

        let (tx, rx) = unbounded();
        let _sub = broker
            .subscribe("team", Sequence(3), Box::new(move |record: BrokerRecord| {
                let _ = tx.send(record.sequence);
            }))
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Sequence(3));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Sequence(4));
    }

    #[test]
    fn test_close_waits_for_in_flight_delivery() {
        let dir = TempDir::new().unwrap();
        let broker = LogBroker::create(test_config(&dir)).unwrap();
        for i in 1..=3u8 {
            broker.publish("team", &[i]).unwrap();
        }

        let (entered_tx, entered_rx) = unbounded();
        let (gate_tx, gate_rx) = unbounded::<()>();
        let (tx, rx) = unbounded();
        let sub = broker
            .subscribe("team", Sequence(1), Box::new(move |record: BrokerRecord| {
                let _ = tx.send(record.sequence);
                let _ = entered_tx.send(());
                let _ = gate_rx.recv();
            }))
            .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (closed_tx, closed_rx) = unbounded();
        let closer = thread::spawn(move || {
            sub.close().unwrap();
            let _ = closed_tx.send(());
        });

        // Blocked behind the delivery.
        assert!(closed_rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(gate_tx);
        closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        closer.join().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Sequence(1));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_close_rejects_publish() {
        let dir = TempDir::new().unwrap();
        let broker = LogBroker::create(test_config(&dir)).unwrap();
        broker.publish("team", b"one").unwrap();
        Broker::close(&broker).unwrap();
        assert!(matches!(broker.publish("team", b"two"), Err(StreamError::Closed)));
    }
}
