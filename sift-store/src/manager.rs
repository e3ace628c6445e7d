// The file cache. Two tables keyed by absolute path (mapped and incore),
// a set of paths currently being read, and a byte budget enforced by
// score-based eviction of zero-reference entries.
//
// Lock discipline: one mutex protects the tables, the reading set, the
// cleaner list and the adjustable budget. Slow file IO never happens
// under the mutex: an acquiring thread publishes its path in `reading`,
// releases the lock across the syscalls, and wakes waiters on
// `readers_done` when it republishes the result. Threads that observe
// the marker wait on the condition variable instead of racing to open
// the same file. The second condition variable lives on the byte ledger
// and is signalled whenever storage bytes are returned or the budget
// rises; `unload` sleeps on it in quarter-deadline slices when eviction
// alone cannot satisfy a request, re-scanning for candidates at each
// wakeup.

use crate::storage::{warn_in_use, MemLedger, Storage};
use parking_lot::{Condvar, Mutex, MutexGuard};
use sift_base::{err, ErrorKind, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hint passed to get_file: whether to map the file or read it into the
/// heap. The default maps only files large enough to be worth a
/// descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessPreference {
    MmapLargeFiles,
    PreferRead,
    PreferMmap,
}

/// Callback registered by higher layers that own caches of their own;
/// invoked during eviction so they can drop what they can.
pub trait Cleaner: Send + Sync {
    fn clean(&self);
}

#[derive(Clone, Debug)]
pub struct FileManagerConfig {
    /// Cache byte budget. Default: half of physical memory.
    pub max_bytes: u64,
    /// Maximum number of simultaneously mapped files. Default: 3/4 of
    /// the descriptor soft limit, floor 8.
    pub max_open_files: usize,
    /// Files below this size are read rather than mapped.
    pub min_map_size: u64,
    /// Total time unload may spend waiting for references to drop.
    pub max_wait: Duration,
}

const PAGE_SIZE: u64 = 4096;

impl Default for FileManagerConfig {
    fn default() -> Self {
        FileManagerConfig {
            max_bytes: half_physical_memory(),
            max_open_files: default_open_files(),
            min_map_size: 1 << 20,
            max_wait: Duration::from_secs(600),
        }
    }
}

/// Half of MemTotal, or a 1 GiB fallback when the probe fails.
fn half_physical_memory() -> u64 {
    let fallback = 1 << 30;
    let Ok(text) = std::fs::read_to_string("/proc/meminfo") else {
        return fallback;
    };
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|w| w.parse::<u64>().ok()) {
                return (kb * 1024) / 2;
            }
        }
    }
    fallback
}

/// Three quarters of the fd soft limit, floor 8.
fn default_open_files() -> usize {
    let mut soft = 1024_u64;
    if let Ok(text) = std::fs::read_to_string("/proc/self/limits") {
        for line in text.lines() {
            if line.starts_with("Max open files") {
                if let Some(w) = line.split_whitespace().nth(3) {
                    if let Ok(n) = w.parse::<u64>() {
                        soft = n;
                    }
                }
            }
        }
    }
    ((soft * 3 / 4) as usize).max(8)
}

struct Tables {
    mapped: BTreeMap<PathBuf, Arc<Storage>>,
    incore: BTreeMap<PathBuf, Arc<Storage>>,
    reading: BTreeSet<PathBuf>,
    cleaners: Vec<Arc<dyn Cleaner>>,
    max_bytes: u64,
    nwaiting: u32,
}

impl Tables {
    /// A table entry is evictable when nobody outside the table holds a
    /// reference and it has been acquired at least once.
    fn candidates(&self) -> Vec<(PathBuf, bool)> {
        let mut out = Vec::new();
        for (p, st) in &self.mapped {
            if Arc::strong_count(st) == 1 && st.past_use() > 0 {
                out.push((p.clone(), true));
            }
        }
        for (p, st) in &self.incore {
            if Arc::strong_count(st) == 1 && st.past_use() > 0 {
                out.push((p.clone(), false));
            }
        }
        out
    }

    fn get(&self, path: &Path) -> Option<&Arc<Storage>> {
        self.mapped.get(path).or_else(|| self.incore.get(path))
    }
}

pub struct FileManager {
    inner: Mutex<Tables>,
    readers_done: Condvar,
    ledger: Arc<MemLedger>,
    max_open_files: usize,
    min_map_size: u64,
    max_wait: Duration,
}

impl FileManager {
    pub fn new(cfg: FileManagerConfig) -> FileManager {
        FileManager {
            inner: Mutex::new(Tables {
                mapped: BTreeMap::new(),
                incore: BTreeMap::new(),
                reading: BTreeSet::new(),
                cleaners: Vec::new(),
                max_bytes: cfg.max_bytes,
                nwaiting: 0,
            }),
            readers_done: Condvar::new(),
            ledger: Arc::new(MemLedger::default()),
            max_open_files: cfg.max_open_files,
            min_map_size: cfg.min_map_size,
            max_wait: cfg.max_wait,
        }
    }

    /// The process-wide instance, built with default budgets on first
    /// use. Explicit instances (FileManager::new) are preferred where a
    /// caller can thread one through; the global exists for code that
    /// cannot.
    pub fn global() -> &'static FileManager {
        static GLOBAL: OnceLock<FileManager> = OnceLock::new();
        GLOBAL.get_or_init(|| FileManager::new(FileManagerConfig::default()))
    }

    /// The byte ledger shared with every storage this manager created.
    pub fn ledger(&self) -> &Arc<MemLedger> {
        &self.ledger
    }

    /// Bytes currently on record across mapped, incore and anonymous
    /// storages.
    pub fn total_bytes(&self) -> u64 {
        self.ledger.total()
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.lock().max_bytes
    }

    /// Acquire the named file, sharing any resident copy. Blocks while
    /// another thread reads the same path, and evicts under pressure.
    pub fn get_file(&self, path: &Path, pref: AccessPreference) -> Result<Arc<Storage>> {
        let bytes = Self::stat_nonempty(path)?;
        let mut g = self.inner.lock();
        loop {
            if let Some(st) = g.get(path) {
                st.mark_use();
                return Ok(st.clone());
            }
            if g.reading.contains(path) {
                debug!(target: "sift", path = %path.display(), "waiting for another reader");
                self.readers_done.wait(&mut g);
                // Re-check the tables; if the other reader failed we
                // become the reader ourselves on the next pass.
                continue;
            }
            break;
        }
        g.reading.insert(path.to_path_buf());

        if bytes + self.ledger.total() > g.max_bytes {
            if let Err(e) = self.unload(&mut g, bytes) {
                g.reading.remove(path);
                self.readers_done.notify_all();
                return Err(e);
            }
        } else if g.mapped.len() >= self.max_open_files && bytes >= self.min_map_size {
            let _ = self.unload(&mut g, 0);
        }
        let use_map = self.should_map(&g, bytes, pref);
        drop(g);

        let built = self.build_storage(path, bytes, use_map);

        let mut g = self.inner.lock();
        g.reading.remove(path);
        self.readers_done.notify_all();
        let st = built?;
        if st.len() as u64 != bytes {
            return Err(err(
                ErrorKind::IoShort,
                format!("wanted {} bytes of {}, got {}", bytes, path.display(), st.len()),
            ));
        }
        let st = Arc::new(st);
        st.mark_use();
        if st.is_file_map() {
            g.mapped.insert(path.to_path_buf(), st.clone());
        } else {
            g.incore.insert(path.to_path_buf(), st.clone());
        }
        debug!(target: "sift", path = %path.display(), bytes,
               mapped = st.is_file_map(), "file acquired");
        Ok(st)
    }

    /// Like get_file but never waits: a path being read by another
    /// thread is BusyReading, and a request past the budget is
    /// InsufficientMemory without any eviction.
    pub fn try_get_file(&self, path: &Path, pref: AccessPreference) -> Result<Arc<Storage>> {
        let bytes = Self::stat_nonempty(path)?;
        let mut g = self.inner.lock();
        if let Some(st) = g.get(path) {
            st.mark_use();
            return Ok(st.clone());
        }
        if g.reading.contains(path) {
            return Err(err(ErrorKind::BusyReading, format!("{} is being read", path.display())));
        }
        if bytes + self.ledger.total() > g.max_bytes {
            return Err(err(
                ErrorKind::InsufficientMemory,
                format!("{} bytes over budget for {}", bytes, path.display()),
            ));
        }
        g.reading.insert(path.to_path_buf());
        let use_map = self.should_map(&g, bytes, pref);
        drop(g);

        let built = self.build_storage(path, bytes, use_map);

        let mut g = self.inner.lock();
        g.reading.remove(path);
        self.readers_done.notify_all();
        let st = built?;
        if st.len() as u64 != bytes {
            return Err(err(
                ErrorKind::IoShort,
                format!("wanted {} bytes of {}, got {}", bytes, path.display(), st.len()),
            ));
        }
        let st = Arc::new(st);
        st.mark_use();
        if st.is_file_map() {
            g.mapped.insert(path.to_path_buf(), st.clone());
        } else {
            g.incore.insert(path.to_path_buf(), st.clone());
        }
        Ok(st)
    }

    /// Acquire an unshared storage for the byte range [begin, end) of a
    /// file. Segments are not registered in the tables; their lifetime
    /// belongs entirely to the caller. Short reads are reported through
    /// the storage length, which the caller checks.
    pub fn get_file_segment(
        &self,
        path: &Path,
        fd: Option<&mut File>,
        begin: u64,
        end: u64,
    ) -> Result<Storage> {
        if end <= begin {
            return Err(err(ErrorKind::InternalInvariant, "empty file segment"));
        }
        let bytes = end - begin;
        let nmapped = {
            let mut g = self.inner.lock();
            if bytes + self.ledger.total() > g.max_bytes {
                self.unload(&mut g, bytes)?;
            }
            g.mapped.len()
        };
        if nmapped * 2 < self.max_open_files && bytes >= 4 * PAGE_SIZE {
            match Storage::map_range(path, begin, end, Some(self.ledger.clone())) {
                Ok(st) => return Ok(st),
                Err(e) => {
                    debug!(target: "sift", path = %path.display(),
                           kind = ?e.kind(), "segment map failed, reading instead");
                }
            }
        }
        match fd {
            Some(f) => Storage::read_fd(f, begin, end, Some(self.ledger.clone())),
            None => Storage::read_range(path, begin, end, Some(self.ledger.clone())),
        }
    }

    /// Anonymous heap buffer, with one free-and-retry pass on failure.
    pub fn alloc(&self, n: usize) -> Result<Storage> {
        match Storage::anonymous(n, Some(self.ledger.clone())) {
            Ok(st) => Ok(st),
            Err(e) if e.kind() == ErrorKind::InsufficientMemory => {
                let mut g = self.inner.lock();
                self.unload(&mut g, n as u64)?;
                drop(g);
                Storage::anonymous(n, Some(self.ledger.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Grow a storage, freeing cache space as needed. Two eviction
    /// retries before giving up.
    pub fn enlarge(&self, st: &mut Storage, n: usize) -> Result<()> {
        for attempt in 0..3 {
            match st.enlarge(n) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::InsufficientMemory && attempt < 2 => {
                    let mut g = self.inner.lock();
                    self.unload(&mut g, 0)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(err(ErrorKind::InsufficientMemory, "enlarge failed after eviction retries"))
    }

    /// Drop the record of one file if nothing references it.
    pub fn flush_file(&self, path: &Path) {
        let mut g = self.inner.lock();
        Self::flush_entry(&mut g.mapped, path);
        Self::flush_entry(&mut g.incore, path);
        self.ledger.avail.notify_all();
    }

    /// Drop every zero-reference record under the named directory.
    /// Matches whole path components, never a sibling directory with a
    /// longer name.
    pub fn flush_dir(&self, dir: &Path) {
        let mut g = self.inner.lock();
        let t = &mut *g;
        for table in [&mut t.mapped, &mut t.incore] {
            let victims: Vec<PathBuf> = table
                .keys()
                .filter(|p| p.starts_with(dir))
                .cloned()
                .collect();
            for p in victims {
                Self::flush_entry(table, &p);
            }
        }
        self.ledger.avail.notify_all();
    }

    fn flush_entry(table: &mut BTreeMap<PathBuf, Arc<Storage>>, path: &Path) {
        if let Some(st) = table.get(path) {
            let refs = Arc::strong_count(st) - 1;
            if refs > 0 {
                warn_in_use(path, refs);
            } else {
                table.remove(path);
            }
        }
    }

    /// Drop every zero-reference record; in-use entries are retained
    /// with a warning.
    pub fn clear_all(&self) {
        let mut g = self.inner.lock();
        let t = &mut *g;
        for table in [&mut t.mapped, &mut t.incore] {
            table.retain(|p, st| {
                let refs = Arc::strong_count(st) - 1;
                if refs > 0 {
                    warn_in_use(p, refs);
                }
                refs > 0
            });
        }
        self.ledger.avail.notify_all();
    }

    /// Raise (never lower below use) the byte budget.
    pub fn adjust_cache_size(&self, newsize: u64) -> Result<()> {
        let mut g = self.inner.lock();
        if newsize < self.ledger.total() {
            return Err(err(
                ErrorKind::InsufficientMemory,
                format!("cache size {} below {} bytes in use", newsize, self.ledger.total()),
            ));
        }
        g.max_bytes = newsize;
        self.ledger.avail.notify_all();
        Ok(())
    }

    pub fn add_cleaner(&self, cl: Arc<dyn Cleaner>) {
        let mut g = self.inner.lock();
        if !g.cleaners.iter().any(|c| Arc::ptr_eq(c, &cl)) {
            g.cleaners.push(cl);
        }
    }

    pub fn remove_cleaner(&self, cl: &Arc<dyn Cleaner>) {
        let mut g = self.inner.lock();
        g.cleaners.retain(|c| !Arc::ptr_eq(c, cl));
    }

    /// Wake anyone waiting inside unload; called by code that has just
    /// dropped references to storages.
    pub fn signal_memory_available(&self) {
        self.ledger.avail.notify_all();
    }

    /// Introspection: is the path resident, and how many references are
    /// outstanding beyond the table's own.
    pub fn resident(&self, path: &Path) -> Option<(bool, usize)> {
        let g = self.inner.lock();
        if let Some(st) = g.mapped.get(path) {
            return Some((true, Arc::strong_count(st) - 1));
        }
        g.incore.get(path).map(|st| (false, Arc::strong_count(st) - 1))
    }

    /// One-line-per-entry report of both tables and the byte totals.
    pub fn status(&self, out: &mut impl std::io::Write) -> Result<()> {
        let g = self.inner.lock();
        writeln!(
            out,
            "file manager: {} mapped, {} incore, {} reading, {} / {} bytes",
            g.mapped.len(),
            g.incore.len(),
            g.reading.len(),
            self.ledger.total(),
            g.max_bytes
        )?;
        for (label, table) in [("mapped", &g.mapped), ("incore", &g.incore)] {
            for (p, st) in table {
                writeln!(
                    out,
                    "  {} {} ({} bytes, {} refs, {} past uses)",
                    label,
                    p.display(),
                    st.len(),
                    Arc::strong_count(st) - 1,
                    st.past_use()
                )?;
            }
        }
        Ok(())
    }

    fn stat_nonempty(path: &Path) -> Result<u64> {
        let meta = std::fs::metadata(path)?;
        if meta.len() == 0 {
            return Err(err(ErrorKind::EmptyFile, format!("{} is empty", path.display())));
        }
        Ok(meta.len())
    }

    /// To map or not to map. The threshold rises to the largest of the
    /// first ten mapped files once the table is half full, a coarse way
    /// to avoid churning many small maps.
    fn should_map(&self, g: &Tables, bytes: u64, pref: AccessPreference) -> bool {
        if g.mapped.len() >= self.max_open_files {
            return false;
        }
        match pref {
            AccessPreference::PreferMmap => true,
            AccessPreference::PreferRead => false,
            AccessPreference::MmapLargeFiles => {
                let mut threshold = self.min_map_size;
                if g.mapped.len() > self.max_open_files / 2 {
                    for st in g.mapped.values().take(10) {
                        threshold = threshold.max(st.len() as u64);
                    }
                }
                bytes >= threshold
            }
        }
    }

    fn build_storage(&self, path: &Path, bytes: u64, use_map: bool) -> Result<Storage> {
        if use_map {
            match Storage::map_path(path, Some(self.ledger.clone())) {
                Ok(st) => return Ok(st),
                Err(e) => {
                    debug!(target: "sift", path = %path.display(),
                           kind = ?e.kind(), "map failed, reading instead");
                }
            }
        }
        match Storage::read_range(path, 0, bytes, Some(self.ledger.clone())) {
            Ok(st) => Ok(st),
            Err(e) if e.kind() == ErrorKind::InsufficientMemory => {
                {
                    let mut g = self.inner.lock();
                    let _ = self.unload(&mut g, 0);
                }
                Storage::read_range(path, 0, bytes, Some(self.ledger.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Eviction. With needed == 0, drop everything droppable and
    /// return. Otherwise evict by descending score until the budget
    /// fits, then wait (bounded, single waiter) for references to drop.
    fn unload(&self, g: &mut MutexGuard<'_, Tables>, needed: u64) -> Result<()> {
        if needed > 0 && self.ledger.total() + needed <= g.max_bytes {
            return Ok(());
        }
        if needed > g.max_bytes {
            return Err(err(
                ErrorKind::InsufficientMemory,
                format!("{} bytes exceeds the whole budget of {}", needed, g.max_bytes),
            ));
        }
        let start = Instant::now();
        loop {
            // Let the layers above drop caches they own. Never under
            // the lock: a cleaner may call back into this manager.
            let cleaners = g.cleaners.clone();
            if !cleaners.is_empty() {
                MutexGuard::unlocked(g, || {
                    for c in &cleaners {
                        c.clean();
                    }
                });
            }

            let mut cand = g.candidates();
            let now = Storage::now();
            cand.sort_by(|a, b| {
                let sa = Self::cand_score(g, a, now);
                let sb = Self::cand_score(g, b, now);
                sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
            });

            if needed == 0 {
                debug!(target: "sift", n = cand.len(), "unloading all inactive files");
                for (p, mapped) in cand {
                    Self::evict(g, &p, mapped);
                }
                return Ok(());
            }

            for (p, mapped) in cand {
                if self.ledger.total() + needed <= g.max_bytes {
                    break;
                }
                Self::evict(g, &p, mapped);
            }
            if self.ledger.total() + needed <= g.max_bytes {
                return Ok(());
            }

            if g.nwaiting > 0 {
                // Only one thread may wait for memory; a second waiter
                // fails fast rather than risking a deadlock.
                return Err(err(
                    ErrorKind::AnotherWaiterPresent,
                    "yielding to a thread already waiting for memory",
                ));
            }
            if start.elapsed() >= self.max_wait {
                return Err(err(
                    ErrorKind::WaitTimeout,
                    format!("timed out waiting to free {} bytes", needed),
                ));
            }
            g.nwaiting += 1;
            let quarter = self.max_wait / 4;
            debug!(target: "sift", needed, "waiting for memory");
            self.ledger.avail.wait_for(g, quarter);
            g.nwaiting -= 1;
        }
    }

    fn cand_score(g: &Tables, cand: &(PathBuf, bool), now: u64) -> f64 {
        let table = if cand.1 { &g.mapped } else { &g.incore };
        table.get(&cand.0).map(|st| st.score(now)).unwrap_or(0.0)
    }

    fn evict(g: &mut Tables, path: &Path, mapped: bool) {
        let table = if mapped { &mut g.mapped } else { &mut g.incore };
        if let Some(st) = table.get(path) {
            // A reference may have appeared since the candidate scan.
            if Arc::strong_count(st) > 1 {
                warn!(target: "sift", path = %path.display(), "eviction candidate became active");
                return;
            }
            debug!(target: "sift", path = %path.display(), bytes = st.len(), "evicting");
            table.remove(path);
        }
    }
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock();
        f.debug_struct("FileManager")
            .field("mapped", &g.mapped.len())
            .field("incore", &g.incore.len())
            .field("total_bytes", &self.ledger.total())
            .field("max_bytes", &g.max_bytes)
            .finish()
    }
}
