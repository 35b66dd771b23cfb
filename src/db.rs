//! The kiln database stores information about previous builds for determining
//! which targets are up to date.
//!
//! On disk it is an append-only log: a signature and version, then one record
//! per committed node.  A record is a count followed by that many entries of
//! (op, key, fingerprint).  Because a node's entries share one record, a crash
//! mid-write loses at most that node's commit, and the truncated tail is
//! dropped on the next load.

use crate::hash::Fingerprint;
use anyhow::{anyhow, bail, Context};
use dashmap::DashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SIGNATURE: &[u8] = b"kilndb";
const VERSION: u32 = 1;

/// Below this many dead entries the log is never rewritten.
const COMPACT_MIN_DEAD: usize = 1000;

/// Key of a build state entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// A produced file.
    Target(String),
    /// A node that produces no files.
    Node(String),
}

/// Persisted mapping from state key to the fingerprint that last produced it.
/// Written concurrently by workers, each committing a different node.
pub trait StateStore: Sync {
    fn get(&self, key: &StateKey) -> Option<Fingerprint>;
    /// Records all of one node's entries as a unit.
    fn set(&self, entries: &[(StateKey, Fingerprint)]) -> anyhow::Result<()>;
    fn delete(&self, keys: &[StateKey]) -> anyhow::Result<()>;
}

/// Build state held only in memory.
#[derive(Default)]
pub struct MemStore {
    entries: DashMap<StateKey, Fingerprint>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemStore {
    fn get(&self, key: &StateKey) -> Option<Fingerprint> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    fn set(&self, entries: &[(StateKey, Fingerprint)]) -> anyhow::Result<()> {
        for (key, fingerprint) in entries {
            self.entries.insert(key.clone(), *fingerprint);
        }
        Ok(())
    }

    fn delete(&self, keys: &[StateKey]) -> anyhow::Result<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum Op {
    SetTarget = 0,
    SetNode = 1,
    DeleteTarget = 2,
    DeleteNode = 3,
}

impl Op {
    fn from_byte(b: u8) -> Option<Op> {
        Some(match b {
            0 => Op::SetTarget,
            1 => Op::SetNode,
            2 => Op::DeleteTarget,
            3 => Op::DeleteNode,
            _ => return None,
        })
    }

    fn key(self, name: String) -> StateKey {
        match self {
            Op::SetTarget | Op::DeleteTarget => StateKey::Target(name),
            Op::SetNode | Op::DeleteNode => StateKey::Node(name),
        }
    }
}

fn encode_entry(
    buf: &mut Vec<u8>,
    key: &StateKey,
    delete: bool,
    fingerprint: Fingerprint,
) -> anyhow::Result<()> {
    let (op, name) = match (key, delete) {
        (StateKey::Target(name), false) => (Op::SetTarget, name),
        (StateKey::Node(name), false) => (Op::SetNode, name),
        (StateKey::Target(name), true) => (Op::DeleteTarget, name),
        (StateKey::Node(name), true) => (Op::DeleteNode, name),
    };
    let len = u16::try_from(name.len()).map_err(|_| anyhow!("key too long: {:?}", name))?;
    buf.push(op as u8);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&fingerprint.0.to_le_bytes());
    Ok(())
}

fn encode_record<'a>(
    entries: impl ExactSizeIterator<Item = (&'a StateKey, Fingerprint)>,
    delete: bool,
) -> anyhow::Result<Vec<u8>> {
    let count =
        u16::try_from(entries.len()).map_err(|_| anyhow!("too many entries in one record"))?;
    let mut buf = Vec::new();
    buf.extend_from_slice(&count.to_le_bytes());
    for (key, fingerprint) in entries {
        encode_entry(&mut buf, key, delete, fingerprint)?;
    }
    Ok(buf)
}

/// Reads values out of the loaded log, failing with None at end of input.
struct Cursor<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.ofs..self.ofs + n)?;
        self.ofs += n;
        Some(bytes)
    }
    fn read_u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }
    fn read_u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }
    fn read_u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }
}

/// Result of replaying a log.
struct Replay {
    /// Offset just past the last complete record.
    valid_len: usize,
    /// Entries read, live or not; used to decide on compaction.
    entries_read: usize,
}

/// Replays one record into the store, returning the number of entries, or
/// None if the record is truncated.  A truncated record is not applied.
fn read_record(r: &mut Cursor, store: &MemStore) -> anyhow::Result<Option<usize>> {
    let Some(count) = r.read_u16() else {
        return Ok(None);
    };
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Some(op) = r.read_u8() else {
            return Ok(None);
        };
        let op = Op::from_byte(op).ok_or_else(|| anyhow!("corrupt entry op {}", op))?;
        let Some(len) = r.read_u16() else {
            return Ok(None);
        };
        let Some(name) = r.take(len as usize) else {
            return Ok(None);
        };
        let name = String::from_utf8(name.to_vec()).context("corrupt entry key")?;
        let Some(fingerprint) = r.read_u64() else {
            return Ok(None);
        };
        ops.push((op, name, Fingerprint(fingerprint)));
    }
    for (op, name, fingerprint) in ops {
        let key = op.key(name);
        match op {
            Op::SetTarget | Op::SetNode => {
                store.entries.insert(key, fingerprint);
            }
            Op::DeleteTarget | Op::DeleteNode => {
                store.entries.remove(&key);
            }
        }
    }
    Ok(Some(count as usize))
}

fn replay(buf: &[u8], store: &MemStore) -> anyhow::Result<Replay> {
    let mut r = Cursor { buf, ofs: 0 };
    match r.take(SIGNATURE.len()) {
        Some(sig) if sig == SIGNATURE => {}
        _ => bail!("invalid db signature"),
    }
    let version = r
        .take(4)
        .and_then(|v| v.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| anyhow!("truncated db header"))?;
    if version != VERSION {
        bail!("db version mismatch: got {}, want {}", version, VERSION);
    }

    let mut replay = Replay {
        valid_len: r.ofs,
        entries_read: 0,
    };
    while r.ofs < buf.len() {
        match read_record(&mut r, store)? {
            Some(n) => {
                replay.entries_read += n;
                replay.valid_len = r.ofs;
            }
            None => {
                tracing::warn!(
                    "db: dropping truncated record ({} bytes)",
                    buf.len() - replay.valid_len
                );
                break;
            }
        }
    }
    Ok(replay)
}

fn header() -> Vec<u8> {
    let mut buf = SIGNATURE.to_vec();
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf
}

/// Writes the live entries to a fresh log and renames it over `path`.
fn compact(path: &Path, store: &MemStore) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        let mut w = BufWriter::new(file);
        w.write_all(&header())?;
        let entries: Vec<(StateKey, Fingerprint)> = store
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for chunk in entries.chunks(u16::MAX as usize) {
            w.write_all(&encode_record(chunk.iter().map(|(k, f)| (k, *f)), false)?)?;
        }
        w.flush()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("rename {}", tmp.display()))?;
    Ok(())
}

/// Build state persisted across runs.
pub struct Db {
    path: PathBuf,
    mem: MemStore,
    w: Mutex<BufWriter<File>>,
}

impl Db {
    /// Loads the state at `path`, creating the file if needed.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Db> {
        let path = path.into();
        let mem = MemStore::new();

        let mut file = match std::fs::OpenOptions::new().read(true).append(true).open(&path) {
            Ok(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                let replay =
                    replay(&buf, &mem).with_context(|| format!("load {}", path.display()))?;
                let dead = replay.entries_read.saturating_sub(mem.len());
                if dead >= COMPACT_MIN_DEAD && dead > mem.len() {
                    tracing::debug!("db: compacting, {} live / {} dead entries", mem.len(), dead);
                    drop(f);
                    compact(&path, &mem)?;
                    std::fs::OpenOptions::new().append(true).open(&path)?
                } else {
                    if replay.valid_len < buf.len() {
                        f.set_len(replay.valid_len as u64)?;
                    }
                    f
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("create {}", path.display()))?;
                f.write_all(&header())?;
                f
            }
            Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
        };
        file.flush()?;

        Ok(Db {
            path,
            mem,
            w: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    fn append(&self, record: &[u8]) -> anyhow::Result<()> {
        let mut w = self.w.lock().map_err(|_| anyhow!("db writer poisoned"))?;
        w.write_all(record)?;
        w.flush()?;
        Ok(())
    }
}

impl StateStore for Db {
    fn get(&self, key: &StateKey) -> Option<Fingerprint> {
        self.mem.get(key)
    }

    fn set(&self, entries: &[(StateKey, Fingerprint)]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let record = encode_record(entries.iter().map(|(k, f)| (k, *f)), false)?;
        self.append(&record)?;
        self.mem.set(entries)
    }

    fn delete(&self, keys: &[StateKey]) -> anyhow::Result<()> {
        let keys: Vec<&StateKey> = keys.iter().filter(|k| self.mem.get(k).is_some()).collect();
        if keys.is_empty() {
            return Ok(());
        }
        let record = encode_record(keys.iter().map(|&k| (k, Fingerprint(0))), true)?;
        self.append(&record)?;
        for key in keys {
            self.mem.entries.remove(key);
        }
        Ok(())
    }
}
