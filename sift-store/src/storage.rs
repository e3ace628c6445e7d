use memmap2::{Mmap, MmapOptions};
use sift_base::{err, ErrorKind, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Running total of bytes held by every storage attached to it. The
/// manager consults the ledger before acquisitions; storages update it on
/// construction, growth and drop. The counter is advisory, not a gate:
/// two threads can race past a check and over-commit, and the next unload
/// catches up.
///
/// The ledger also carries the memory-available condition variable, so
/// that dropping the last reference to a storage can wake a thread
/// blocked in eviction without going through the manager's lock.
#[derive(Debug, Default)]
pub struct MemLedger {
    total: AtomicU64,
    pub(crate) avail: parking_lot::Condvar,
}

impl MemLedger {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn sub(&self, n: u64) {
        self.total.fetch_sub(n, Ordering::Relaxed);
        self.avail.notify_all();
    }
}

/// Seconds since the first storage was created in this process. Cheap
/// monotonic clock for access statistics; wall-clock accuracy is not
/// needed, only ordering.
fn now_secs() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs()
}

enum Body {
    Heap(Vec<u8>),
    Map(Mmap),
    // Externally supplied region; never freed by the storage.
    Extern(&'static [u8]),
}

/// One contiguous byte region with access statistics. File-backed
/// storages carry their path; anonymous heap buffers have none.
///
/// Sharing is expressed through Arc: the manager keeps one reference in
/// its table and every outstanding view holds another, so a storage is
/// pinned exactly while Arc::strong_count exceeds the table's own count.
/// Mutating operations take &mut self and are therefore only reachable
/// while the storage is unshared.
pub struct Storage {
    name: Option<PathBuf>,
    body: Body,
    ledger: Option<Arc<MemLedger>>,
    /// Number of past acquisitions, feeds the eviction score.
    nacc: AtomicU32,
    opened: u64,
    last_use: AtomicU64,
}

impl Storage {
    fn with_body(name: Option<PathBuf>, body: Body, ledger: Option<Arc<MemLedger>>) -> Storage {
        let now = now_secs();
        let st = Storage {
            name,
            body,
            ledger,
            nacc: AtomicU32::new(0),
            opened: now,
            last_use: AtomicU64::new(now),
        };
        if let Some(l) = &st.ledger {
            l.add(st.len() as u64);
        }
        st
    }

    pub fn empty() -> Storage {
        Storage::with_body(None, Body::Heap(Vec::new()), None)
    }

    /// Anonymous heap buffer of n zeroed bytes. Allocation failure is
    /// reported, not retried; the manager owns the free-and-retry loop.
    pub fn anonymous(n: usize, ledger: Option<Arc<MemLedger>>) -> Result<Storage> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(n)
            .map_err(|e| err(ErrorKind::InsufficientMemory, format!("alloc {} bytes: {}", n, e)))?;
        buf.resize(n, 0);
        Ok(Storage::with_body(None, Body::Heap(buf), ledger))
    }

    /// Wrap an externally owned region. The storage never frees it.
    pub fn from_static(bytes: &'static [u8]) -> Storage {
        Storage::with_body(None, Body::Extern(bytes), None)
    }

    /// Read the byte range [begin, end) of the named file into a fresh
    /// heap buffer. A short read is not fatal: the resulting storage
    /// holds the bytes actually read and the caller checks the length.
    pub fn read_range(
        path: &Path,
        begin: u64,
        end: u64,
        ledger: Option<Arc<MemLedger>>,
    ) -> Result<Storage> {
        let mut file = File::open(path)?;
        let mut st = Storage::read_fd(&mut file, begin, end, ledger)?;
        st.name = Some(path.to_path_buf());
        Ok(st)
    }

    /// As read_range but from an already-open descriptor.
    pub fn read_fd(
        file: &mut File,
        begin: u64,
        end: u64,
        ledger: Option<Arc<MemLedger>>,
    ) -> Result<Storage> {
        if end < begin {
            return Err(err(ErrorKind::InternalInvariant, "read range ends before it begins"));
        }
        let want = (end - begin) as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(want)
            .map_err(|e| err(ErrorKind::InsufficientMemory, format!("alloc {} bytes: {}", want, e)))?;
        file.seek(SeekFrom::Start(begin))?;
        let mut got = 0;
        buf.resize(want, 0);
        while got < want {
            let n = file.read(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got < want {
            debug!(target: "sift", want, got, "short read");
            buf.truncate(got);
        }
        Ok(Storage::with_body(None, Body::Heap(buf), ledger))
    }

    /// Map the whole named file read-only.
    pub fn map_path(path: &Path, ledger: Option<Arc<MemLedger>>) -> Result<Storage> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the engine never writes to
        // a file it has mapped; truncation by an outside writer is
        // undefined behavior we accept, as every mmap user does.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Storage::with_body(Some(path.to_path_buf()), Body::Map(map), ledger))
    }

    /// Map the byte range [begin, end) of the named file read-only.
    pub fn map_range(
        path: &Path,
        begin: u64,
        end: u64,
        ledger: Option<Arc<MemLedger>>,
    ) -> Result<Storage> {
        if end < begin {
            return Err(err(ErrorKind::InternalInvariant, "map range ends before it begins"));
        }
        let file = File::open(path)?;
        let map = unsafe {
            MmapOptions::new()
                .offset(begin)
                .len((end - begin) as usize)
                .map(&file)?
        };
        Ok(Storage::with_body(Some(path.to_path_buf()), Body::Map(map), ledger))
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            Body::Heap(v) => v,
            Body::Map(m) => m,
            Body::Extern(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file; None for anonymous storage.
    pub fn filename(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    pub fn is_file_map(&self) -> bool {
        matches!(self.body, Body::Map(_))
    }

    /// Record one acquisition. Called by the manager each time the
    /// storage is handed out.
    pub fn mark_use(&self) {
        self.nacc.fetch_add(1, Ordering::Relaxed);
        self.last_use.store(now_secs(), Ordering::Relaxed);
    }

    /// Number of past acquisitions.
    pub fn past_use(&self) -> u32 {
        self.nacc.load(Ordering::Relaxed)
    }

    /// Eviction priority: large, cold, rarely-used storages score
    /// highest and go first. The access count is normalized by how long
    /// the storage has been alive, so an old entry with a burst of use
    /// long ago does not outrank a young busy one.
    pub(crate) fn score(&self, now: u64) -> f64 {
        let size_mb = self.len() as f64 * 1e-6;
        let idle = now.saturating_sub(self.last_use.load(Ordering::Relaxed)) as f64;
        let live = now.saturating_sub(self.opened) as f64;
        let rate = self.nacc.load(Ordering::Relaxed) as f64 / (live + 1.0);
        (size_mb + 1.0).sqrt() * (idle + 1.0) / (1.0 + rate)
    }

    pub(crate) fn now() -> u64 {
        now_secs()
    }

    /// Grow the buffer to at least n bytes, or by the golden ratio when
    /// n is zero. Always lands on a private heap buffer: growing a file
    /// map or a borrowed region copies it first.
    pub fn enlarge(&mut self, n: usize) -> Result<()> {
        let old = self.len();
        let want = if n == 0 {
            // ~1.618x, with a floor so tiny buffers don't crawl.
            (old + (old >> 1) + (old >> 3)).max(64)
        } else if n <= old {
            return Ok(());
        } else {
            n
        };
        let mut buf = Vec::new();
        buf.try_reserve_exact(want)
            .map_err(|e| err(ErrorKind::InsufficientMemory, format!("enlarge to {}: {}", want, e)))?;
        buf.extend_from_slice(self.bytes());
        buf.resize(want, 0);
        debug!(target: "sift", old, new = want, "storage enlarged");
        if let Some(l) = &self.ledger {
            l.add((want - old) as u64);
        }
        self.body = Body::Heap(buf);
        Ok(())
    }

    /// Refill the buffer from a file range, replacing the current
    /// content. Returns the number of bytes actually read.
    pub fn read(&mut self, path: &Path, begin: u64, end: u64) -> Result<u64> {
        let ledger = self.ledger.clone();
        let fresh = Storage::read_range(path, begin, end, ledger)?;
        let got = fresh.len() as u64;
        *self = fresh;
        Ok(got)
    }

    /// Write the full buffer to the named file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(self.bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Transfer the bytes to the caller. A file map or borrowed region
    /// is copied out.
    pub fn release(mut self) -> Vec<u8> {
        let n = self.len() as u64;
        if let Some(l) = self.ledger.take() {
            l.sub(n);
        }
        match std::mem::replace(&mut self.body, Body::Heap(Vec::new())) {
            Body::Heap(v) => v,
            Body::Map(m) => m.to_vec(),
            Body::Extern(b) => b.to_vec(),
        }
    }

    /// Free or unmap the region. The manager only calls this for
    /// unshared storages; a shared one is left alone with a warning.
    pub fn clear(&mut self) {
        let n = self.len() as u64;
        if let Some(l) = &self.ledger {
            l.sub(n);
        }
        self.body = Body::Heap(Vec::new());
        self.name = None;
    }

    /// Exchange contents with another storage. Access counters stay
    /// put: the common use is swapping a freshly built buffer into a
    /// long-lived storage, and the statistics belong to the holder.
    pub fn swap(&mut self, other: &mut Storage) {
        std::mem::swap(&mut self.name, &mut other.name);
        std::mem::swap(&mut self.body, &mut other.body);
        std::mem::swap(&mut self.ledger, &mut other.ledger);
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(l) = &self.ledger {
            l.sub(self.len() as u64);
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("mapped", &self.is_file_map())
            .field("nacc", &self.past_use())
            .finish()
    }
}

/// Warn-and-skip helper for table entries that are still referenced.
pub(crate) fn warn_in_use(path: &Path, refs: usize) {
    warn!(target: "sift", path = %path.display(), refs, "storage still in use, not released");
}
