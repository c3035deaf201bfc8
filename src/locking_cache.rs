use std::fs::OpenOptions;
use std::io::{ErrorKind, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use crate::error::IoAt;
use crate::fingerprint;
use crate::prelude::*;

const MEGABYTE: u64 = 1 << 20;

// Appended to the prefix to name the accounting file.
const CACHE_INFO_SUFFIX: &str = ".cache_info";

/// Process-safe, file-per-entry cache over a shared directory.
///
/// Many server processes on one host share the directory; there is no
/// coordinating daemon. All cross-process coordination happens through
/// advisory file locks: a shared/exclusive lock per entry file, plus one
/// whole-cache lock on the accounting file that brackets every compound
/// operation on the persisted total (`update_cache_info`, `update_and_purge`,
/// `purge_file`).
///
/// `create_and_lock` and `get_read_lock` open and lock entry files: the
/// former creates the file and locks it exclusively iff it does not exist,
/// the latter obtains a shared lock iff the file already exists. Writers
/// downgrade to a shared lock once the entry is complete so readers can
/// proceed while the writer updates the accounting, and so the purger (which
/// probes entries with a non-blocking exclusive lock) will not evict an
/// entry that is still being read.
///
/// Advisory locks are per-process. Holding a lock in one process keeps other
/// processes out, but does not serialize threads within this process; the
/// internal mutex only protects the path-to-descriptor map. Callers that
/// need intra-process exclusion must provide their own.
#[derive(Debug)]
pub struct FileLockingCache {
    enabled: AtomicBool,
    dir: PathBuf,
    prefix: String,
    /// Size cap in bytes; 0 means unbounded.
    max_bytes: u64,
    /// What the purger reduces the cache to: 80% of the cap.
    target_bytes: u64,
    cache_info_path: PathBuf,
    /// Held open for the process lifetime; the whole-cache lock lives on
    /// this descriptor. `None` only on disabled instances.
    cache_info: Option<File>,
    /// Advisory locks are released by closing the descriptor, so unlocking
    /// by path has to find the descriptor the lock was taken on.
    locks: Mutex<HashMap<PathBuf, File>>,
}

/// One entry observed during a purge scan.
struct CacheFileInfo {
    path: PathBuf,
    size: u64,
    time: SystemTime,
}

/// fs2's lock calls are thin wrappers around flock(2) and don't handle EINTR.
fn retry_interrupted(mut f: impl FnMut() -> std::io::Result<()>) -> std::io::Result<()> {
    loop {
        match f() {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub fn dir_exists(dir: &Path) -> bool {
    dir.is_dir()
}

impl FileLockingCache {
    /// Build a cache over `dir`, with entry names starting with `prefix` and
    /// a soft size cap of `size_mb` megabytes (0 = unbounded).
    ///
    /// An empty or missing directory yields a *disabled* instance rather
    /// than an error: every `create_and_lock` / `get_read_lock` on it
    /// returns false and callers fall through to uncached operation. An
    /// empty prefix on an otherwise usable directory is a configuration
    /// error.
    pub fn new(dir: &str, prefix: &str, size_mb: u64) -> Result<FileLockingCache> {
        if dir.is_empty() || !dir_exists(Path::new(dir)) {
            debug!("cache directory {dir:?} unset or missing; cache disabled");
            return Ok(FileLockingCache {
                enabled: AtomicBool::new(false),
                dir: PathBuf::from(dir),
                prefix: prefix.to_string(),
                max_bytes: 0,
                target_bytes: 0,
                cache_info_path: PathBuf::new(),
                cache_info: None,
                locks: Mutex::new(HashMap::new()),
            });
        }
        if prefix.is_empty() {
            return Err(CacheError::config(
                "prefix",
                "cache file prefix must be non-empty",
            ));
        }

        let dir = PathBuf::from(dir);
        let max_bytes = size_mb * MEGABYTE;
        let cache_info_path = dir.join(format!("{prefix}{CACHE_INFO_SUFFIX}"));
        let cache_info = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&cache_info_path)
            .at(&cache_info_path)?;

        let cache = FileLockingCache {
            enabled: AtomicBool::new(true),
            dir,
            prefix: prefix.to_string(),
            max_bytes,
            target_bytes: max_bytes / 5 * 4,
            cache_info_path,
            cache_info: Some(cache_info),
            locks: Mutex::new(HashMap::new()),
        };

        // Seed the accounting record on first use.
        cache.lock_cache_write()?;
        let seeded = (|| {
            if cache.info()?.metadata().at(&cache.cache_info_path)?.len() == 0 {
                cache.write_total(0)?;
            }
            Ok(())
        })();
        let unlocked = cache.unlock_cache();
        seeded.and(unlocked)?;

        Ok(cache)
    }

    pub fn cache_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn get_cache_directory(&self) -> &Path {
        &self.dir
    }

    pub fn get_cache_file_prefix(&self) -> &str {
        &self.prefix
    }

    /// Compute the file path for a logical source name. Pure; no I/O.
    ///
    /// With `mangle`, `src` is treated as a pathname and encoded as a single
    /// component (see [`fingerprint::mangle`]); otherwise it is used as a
    /// raw suffix. Either way the result is a direct child of the cache
    /// directory, named prefix-first.
    pub fn get_cache_file_name(&self, src: &str, mangle: bool) -> PathBuf {
        let suffix = if mangle {
            fingerprint::mangle(src)
        } else {
            src.to_string()
        };
        self.dir.join(format!("{}{}", self.prefix, suffix))
    }

    /// Atomically create `target` iff it does not exist and take an
    /// exclusive lock on it. Returns false when the file already exists
    /// (some other process won the creation race) or the cache is disabled.
    pub fn create_and_lock(&self, target: &Path) -> Result<bool> {
        if !self.cache_enabled() {
            return Ok(false);
        }
        let fd = match OpenOptions::new().write(true).create_new(true).open(target) {
            Ok(fd) => fd,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(CacheError::io(target, e)),
        };
        retry_interrupted(|| fd.lock_exclusive()).at(target)?;
        trace!("created and locked {}", target.display());
        self.record_descriptor(target, fd);
        Ok(true)
    }

    /// Take a shared lock on `target`. Returns false immediately (without
    /// blocking) when the file does not exist; otherwise blocks until the
    /// shared lock is granted.
    pub fn get_read_lock(&self, target: &Path) -> Result<bool> {
        if !self.cache_enabled() {
            return Ok(false);
        }
        let fd = match File::open(target) {
            Ok(fd) => fd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::io(target, e)),
        };
        retry_interrupted(|| fd.lock_shared()).at(target)?;
        trace!("read-locked {}", target.display());
        self.record_descriptor(target, fd);
        Ok(true)
    }

    /// Downgrade the exclusive lock held on `target` to a shared lock
    /// without releasing it; flock converts the lock in place. No-op if no
    /// descriptor is recorded for `target`.
    pub fn exclusive_to_shared_lock(&self, target: &Path) -> Result<()> {
        // Clone the descriptor so the (never-blocking) conversion happens
        // outside the map mutex. The clone shares the open file description,
        // so locking through it affects the recorded lock; dropping it does
        // not release the lock while the original stays open.
        let fd = {
            let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            match locks.get(target) {
                Some(fd) => fd.try_clone().at(target)?,
                None => {
                    warn!("no lock recorded for {}; skipping downgrade", target.display());
                    return Ok(());
                }
            }
        };
        retry_interrupted(|| fd.lock_shared()).at(target)
    }

    /// Release the lock held on `target` and close its descriptor. No-op if
    /// the path has no recorded descriptor.
    pub fn unlock_and_close(&self, target: &Path) -> Result<()> {
        let fd = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.remove(target)
        };
        if let Some(fd) = fd {
            fd.unlock().at(target)?;
            trace!("unlocked {}", target.display());
        }
        Ok(())
    }

    /// Wrap an already read-locked entry in a guard that releases the lock
    /// on drop. The guard reads through its own descriptor; the lock stays
    /// on the recorded one.
    pub fn locked_entry(&self, path: PathBuf) -> Result<LockedEntry<'_>> {
        let file = File::open(&path).at(&path)?;
        Ok(LockedEntry {
            cache: self,
            path,
            file,
        })
    }

    pub fn lock_cache_read(&self) -> Result<()> {
        let info = self.info()?;
        retry_interrupted(|| info.lock_shared()).at(&self.cache_info_path)
    }

    pub fn lock_cache_write(&self) -> Result<()> {
        let info = self.info()?;
        retry_interrupted(|| info.lock_exclusive()).at(&self.cache_info_path)
    }

    pub fn unlock_cache(&self) -> Result<()> {
        self.info()?.unlock().at(&self.cache_info_path)
    }

    /// Add the size of `entry` to the persisted total and return the new
    /// total, atomically with respect to other processes.
    pub fn update_cache_info(&self, entry: &Path) -> Result<u64> {
        self.with_cache_write_lock(|| {
            let size = fs::metadata(entry).at(entry)?.len();
            let total = self.read_total()? + size;
            self.write_total(total)?;
            debug!("cache size now {total} bytes (+{size} for {})", entry.display());
            Ok(total)
        })
    }

    /// The persisted total, read under the shared whole-cache lock.
    pub fn get_cache_size(&self) -> Result<u64> {
        self.lock_cache_read()?;
        let total = self.read_total();
        let unlocked = self.unlock_cache();
        let total = total?;
        unlocked?;
        Ok(total)
    }

    pub fn cache_too_big(&self, current_size: u64) -> bool {
        self.max_bytes > 0 && current_size > self.max_bytes
    }

    /// Evict least-recently-used entries until the cache is back under the
    /// purge target (80% of the cap), then rewrite the accounting record
    /// with a total recomputed from the directory scan.
    ///
    /// `exempt` is never deleted even when it is the oldest entry. Entries
    /// another process holds locked are detected with a non-blocking
    /// exclusive probe and skipped. Ordering is by access time, oldest
    /// first; on file systems mounted `noatime` this degrades to
    /// modification time.
    pub fn update_and_purge(&self, exempt: &Path) -> Result<()> {
        if self.max_bytes == 0 {
            return Ok(());
        }
        self.with_cache_write_lock(|| {
            let contents = self.collect_cache_dir_info()?;
            let mut total: u64 = contents.iter().map(|info| info.size).sum();
            debug!(
                "purging {} toward {} bytes ({} entries, {total} bytes)",
                self.dir.display(),
                self.target_bytes,
                contents.len()
            );

            for info in &contents {
                if total <= self.target_bytes {
                    break;
                }
                if info.path == exempt {
                    continue;
                }
                let fd = match File::open(&info.path) {
                    Ok(fd) => fd,
                    // Vanished since the scan; nothing to delete.
                    Err(_) => continue,
                };
                if fd.try_lock_exclusive().is_err() {
                    trace!("{} is locked; skipping", info.path.display());
                    continue;
                }
                fs::remove_file(&info.path).at(&info.path)?;
                total -= info.size;
                trace!("purged {} ({} bytes)", info.path.display(), info.size);
            }

            self.write_total(total)?;
            Ok(())
        })
    }

    /// Delete one entry (if present) and subtract its size from the
    /// persisted total.
    pub fn purge_file(&self, path: &Path) -> Result<()> {
        self.with_cache_write_lock(|| {
            let size = match fs::metadata(path) {
                Ok(md) => md.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(CacheError::io(path, e)),
            };
            fs::remove_file(path).at(path)?;
            let total = self.read_total()?.saturating_sub(size);
            self.write_total(total)?;
            debug!("purged {} ({size} bytes), cache size now {total}", path.display());
            Ok(())
        })
    }

    fn info(&self) -> Result<&File> {
        self.cache_info
            .as_ref()
            .ok_or_else(|| eyre!("operation on a disabled cache").into())
    }

    fn with_cache_write_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.lock_cache_write()?;
        let result = f();
        let unlocked = self.unlock_cache();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    fn read_total(&self) -> Result<u64> {
        let mut info = self.info()?;
        info.seek(SeekFrom::Start(0)).at(&self.cache_info_path)?;
        let mut text = String::new();
        info.read_to_string(&mut text).at(&self.cache_info_path)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(0);
        }
        text.parse().map_err(|_| {
            CacheError::corrupt(
                &self.cache_info_path,
                format!("unparsable size record {text:?}"),
            )
        })
    }

    fn write_total(&self, total: u64) -> Result<()> {
        let mut info = self.info()?;
        info.set_len(0).at(&self.cache_info_path)?;
        info.seek(SeekFrom::Start(0)).at(&self.cache_info_path)?;
        writeln!(info, "{total}").at(&self.cache_info_path)?;
        info.flush().at(&self.cache_info_path)
    }

    /// Scan the cache directory for entry files (prefix match, accounting
    /// file excluded), oldest access first. Stable sort, so ties keep a
    /// consistent order within one purge.
    fn collect_cache_dir_info(&self) -> Result<Vec<CacheFileInfo>> {
        let info_name = self.cache_info_path.file_name();
        let mut contents = Vec::new();
        for dirent in fs::read_dir(&self.dir).at(&self.dir)? {
            let dirent = dirent.at(&self.dir)?;
            let name = dirent.file_name();
            if Some(name.as_os_str()) == info_name {
                continue;
            }
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&self.prefix) {
                continue;
            }
            // Entries can be purged by other processes mid-scan.
            let Ok(md) = dirent.metadata() else { continue };
            if !md.is_file() {
                continue;
            }
            let time = md.accessed().or_else(|_| md.modified()).unwrap_or(UNIX_EPOCH);
            contents.push(CacheFileInfo {
                path: dirent.path(),
                size: md.len(),
                time,
            });
        }
        contents.sort_by_key(|info| info.time);
        Ok(contents)
    }

    fn record_descriptor(&self, path: &Path, fd: File) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.insert(path.to_path_buf(), fd);
    }
}

/// A cache entry held under a shared read lock. Dropping the guard releases
/// the lock; reads go through a private descriptor opened at creation.
#[derive(Debug)]
pub struct LockedEntry<'a> {
    cache: &'a FileLockingCache,
    path: PathBuf,
    file: File,
}

impl LockedEntry<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for LockedEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LockedEntry<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Drop for LockedEntry<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.cache.unlock_and_close(&self.path) {
            warn!("failed to release read lock on {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::FileTimes;
    use std::time::Duration;

    const PREFIX: &str = "bes_cache";

    fn tmp_cache(size_mb: u64) -> (tempfile::TempDir, FileLockingCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileLockingCache::new(dir.path().to_str().unwrap(), PREFIX, size_mb).unwrap();
        (dir, cache)
    }

    /// Write an entry file directly and fold it into the accounting, giving
    /// it an access/modification time `age_secs` in the past so purge
    /// ordering is deterministic.
    fn add_entry(cache: &FileLockingCache, name: &str, len: usize, age_secs: u64) -> PathBuf {
        let path = cache.get_cache_file_name(name, true);
        fs::write(&path, vec![b'x'; len]).unwrap();
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        let fd = OpenOptions::new().write(true).open(&path).unwrap();
        fd.set_times(FileTimes::new().set_accessed(when).set_modified(when))
            .unwrap();
        cache.update_cache_info(&path).unwrap();
        path
    }

    #[test]
    fn test_empty_dir_name_gives_disabled_cache() {
        let cache = FileLockingCache::new("", PREFIX, 1).unwrap();
        assert!(!cache.cache_enabled());
        assert!(!cache.create_and_lock(Path::new("/tmp/nope")).unwrap());
        assert!(!cache.get_read_lock(Path::new("/tmp/nope")).unwrap());
    }

    #[test]
    fn test_missing_dir_gives_disabled_cache() {
        let cache = FileLockingCache::new("/no/such/dir/anywhere", PREFIX, 1).unwrap();
        assert!(!cache.cache_enabled());
    }

    #[test]
    fn test_empty_prefix_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileLockingCache::new(dir.path().to_str().unwrap(), "", 1),
            Err(CacheError::Config { .. })
        ));
    }

    #[test]
    fn test_size_zero_means_unbounded() {
        let (_dir, cache) = tmp_cache(0);
        assert!(cache.cache_enabled());
        assert!(!cache.cache_too_big(u64::MAX));
    }

    #[test]
    fn test_cache_info_seeded_to_zero() {
        let (dir, cache) = tmp_cache(1);
        let info = dir.path().join(format!("{PREFIX}{CACHE_INFO_SUFFIX}"));
        assert_eq!(fs::read_to_string(info).unwrap(), "0\n");
        assert_eq!(cache.get_cache_size().unwrap(), 0);
    }

    #[test]
    fn test_cache_file_name_mangling() {
        let (dir, cache) = tmp_cache(1);
        assert_eq!(
            cache.get_cache_file_name("/usr/local/data/x.nc", true),
            dir.path().join(format!("{PREFIX}#usr#local#data#x.nc"))
        );
        assert_eq!(
            cache.get_cache_file_name("12345", false),
            dir.path().join(format!("{PREFIX}12345"))
        );
        // pure and deterministic
        assert_eq!(
            cache.get_cache_file_name("/a/b", true),
            cache.get_cache_file_name("/a/b", true)
        );
    }

    #[test]
    fn test_create_and_lock_is_exclusive() {
        let (dir, cache) = tmp_cache(1);
        let target = dir.path().join(format!("{PREFIX}entry"));
        assert!(cache.create_and_lock(&target).unwrap());
        // The file now exists, so a second creation attempt loses the race.
        assert!(!cache.create_and_lock(&target).unwrap());
        cache.unlock_and_close(&target).unwrap();
    }

    #[test]
    fn test_read_lock_on_missing_file_returns_false() {
        let (dir, cache) = tmp_cache(1);
        let target = dir.path().join(format!("{PREFIX}no-such-entry"));
        assert!(!cache.get_read_lock(&target).unwrap());
    }

    #[test]
    fn test_downgrade_then_read_lock() {
        let (dir, cache) = tmp_cache(1);
        let target = dir.path().join(format!("{PREFIX}entry"));
        assert!(cache.create_and_lock(&target).unwrap());
        cache.exclusive_to_shared_lock(&target).unwrap();

        // A second descriptor can now take a shared lock without blocking.
        let other = File::open(&target).unwrap();
        other.try_lock_shared().unwrap();
        other.unlock().unwrap();

        cache.unlock_and_close(&target).unwrap();
    }

    #[test]
    fn test_unlock_and_close_is_idempotent() {
        let (dir, cache) = tmp_cache(1);
        let target = dir.path().join(format!("{PREFIX}entry"));
        cache.unlock_and_close(&target).unwrap();
        assert!(cache.create_and_lock(&target).unwrap());
        cache.unlock_and_close(&target).unwrap();
        cache.unlock_and_close(&target).unwrap();
    }

    #[test]
    fn test_disable_turns_lookups_off() {
        let (dir, cache) = tmp_cache(1);
        let target = dir.path().join(format!("{PREFIX}entry"));
        fs::write(&target, b"x").unwrap();

        cache.disable();
        assert!(!cache.get_read_lock(&target).unwrap());

        cache.enable();
        assert!(cache.get_read_lock(&target).unwrap());
        cache.unlock_and_close(&target).unwrap();
    }

    #[test]
    fn test_accounting_tracks_entry_sizes() {
        let (_dir, cache) = tmp_cache(1);
        let a = add_entry(&cache, "/data/a", 100, 30);
        let _b = add_entry(&cache, "/data/b", 250, 20);
        assert_eq!(cache.get_cache_size().unwrap(), 350);

        cache.purge_file(&a).unwrap();
        assert_eq!(cache.get_cache_size().unwrap(), 250);
        assert!(!a.exists());

        // Purging a file that is already gone is a no-op.
        cache.purge_file(&a).unwrap();
        assert_eq!(cache.get_cache_size().unwrap(), 250);
    }

    #[test]
    fn test_no_purge_at_exactly_the_cap() {
        let (_dir, cache) = tmp_cache(1);
        let exempt = add_entry(&cache, "/data/full", MEGABYTE as usize, 10);
        assert!(!cache.cache_too_big(MEGABYTE));
        assert!(cache.cache_too_big(MEGABYTE + 1));

        // At the cap exactly, nothing is evicted.
        cache.update_and_purge(&exempt).unwrap();
        assert!(exempt.exists());
        assert_eq!(cache.get_cache_size().unwrap(), MEGABYTE);
    }

    #[test]
    fn test_purge_evicts_oldest_down_to_target() {
        let (_dir, cache) = tmp_cache(1);
        let oldest = add_entry(&cache, "/data/one", 300 * 1024, 40);
        let second = add_entry(&cache, "/data/two", 300 * 1024, 30);
        let third = add_entry(&cache, "/data/three", 300 * 1024, 20);
        let newest = add_entry(&cache, "/data/four", 300 * 1024, 10);

        let total = cache.get_cache_size().unwrap();
        assert_eq!(total, 1200 * 1024);
        assert!(cache.cache_too_big(total));

        cache.update_and_purge(&newest).unwrap();

        // 1200K -> 900K -> 600K; 600K is under the 80% target (819.2K).
        assert!(!oldest.exists());
        assert!(!second.exists());
        assert!(third.exists());
        assert!(newest.exists());
        assert_eq!(cache.get_cache_size().unwrap(), 600 * 1024);
    }

    #[test]
    fn test_purge_never_deletes_the_exempt_entry() {
        let (_dir, cache) = tmp_cache(1);
        let exempt = add_entry(&cache, "/data/huge", 2 * MEGABYTE as usize, 50);
        cache.update_and_purge(&exempt).unwrap();
        assert!(exempt.exists());
        // The total is recomputed from the scan, exempt included.
        assert_eq!(cache.get_cache_size().unwrap(), 2 * MEGABYTE);
    }

    #[test]
    fn test_purge_skips_entries_held_under_a_read_lock() {
        let (_dir, cache) = tmp_cache(1);
        let pinned = add_entry(&cache, "/data/pinned", MEGABYTE as usize, 40);
        let newest = add_entry(&cache, "/data/new", MEGABYTE as usize, 10);

        assert!(cache.get_read_lock(&pinned).unwrap());
        cache.update_and_purge(&newest).unwrap();
        // The oldest entry is in use, so it survives even though the cache
        // stays over target.
        assert!(pinned.exists());
        assert!(newest.exists());
        assert_eq!(cache.get_cache_size().unwrap(), 2 * MEGABYTE);
        cache.unlock_and_close(&pinned).unwrap();

        cache.update_and_purge(&newest).unwrap();
        assert!(!pinned.exists());
        assert_eq!(cache.get_cache_size().unwrap(), MEGABYTE);
    }

    #[test]
    fn test_purge_recomputes_total_from_directory() {
        let (_dir, cache) = tmp_cache(1);
        let entry = add_entry(&cache, "/data/only", 1024, 10);
        // Corrupt the persisted total; a purge must restore it from a scan.
        cache.lock_cache_write().unwrap();
        cache.write_total(987_654_321).unwrap();
        cache.unlock_cache().unwrap();

        cache.update_and_purge(&entry).unwrap();
        assert_eq!(cache.get_cache_size().unwrap(), 1024);
    }

    #[test]
    fn test_locked_entry_guard_releases_on_drop() {
        let (dir, cache) = tmp_cache(1);
        let target = dir.path().join(format!("{PREFIX}entry"));
        fs::write(&target, b"payload").unwrap();

        assert!(cache.get_read_lock(&target).unwrap());
        {
            let mut entry = cache.locked_entry(target.clone()).unwrap();
            let mut text = String::new();
            entry.read_to_string(&mut text).unwrap();
            assert_eq!(text, "payload");
        }
        // Guard dropped: the lock is gone, an exclusive lock succeeds.
        let fd = File::open(&target).unwrap();
        fd.try_lock_exclusive().unwrap();
        fd.unlock().unwrap();
    }
}
