use std::fs::OpenOptions;

use crate::config::{self, CacheConfig};
use crate::error::IoAt;
use crate::fingerprint;
use crate::keys::Keys;
use crate::locking_cache::{FileLockingCache, LockedEntry};
use crate::prelude::*;

static INSTANCE: OnceCell<Option<HttpResourceCache>> = OnceCell::new();

/// Cache of remote resource bodies, keyed by URL and isolated per
/// authenticated user.
///
/// Entry names are content hashes of the URL, so arbitrarily long URLs fit
/// in a file name; the user id is spliced in before the hash so users
/// sharing the cache directory never see each other's copies. Bodies are
/// stored verbatim; response headers and staleness policy belong to the
/// HTTP layer, not here.
pub struct HttpResourceCache {
    cache: FileLockingCache,
}

impl HttpResourceCache {
    pub const DIR_KEY: &'static str = "http_cache.dir";
    pub const PREFIX_KEY: &'static str = "http_cache.prefix";
    pub const SIZE_KEY: &'static str = "http_cache.size";

    pub fn new(dir: &str, prefix: &str, size_mb: u64) -> Result<HttpResourceCache> {
        Ok(HttpResourceCache {
            cache: FileLockingCache::new(dir, prefix, size_mb)?,
        })
    }

    /// The process-wide instance, configured from the `http_cache.*` keys;
    /// `Ok(None)` when disabled. Initialization happens exactly once.
    pub fn get_instance() -> Result<Option<&'static HttpResourceCache>> {
        config::instance_from_keys(
            &INSTANCE,
            Keys::the_keys(),
            Self::DIR_KEY,
            Self::PREFIX_KEY,
            Self::SIZE_KEY,
            |config: CacheConfig| {
                let cache = HttpResourceCache::new(&config.dir, &config.prefix, config.size_mb)?;
                Ok(cache.cache.cache_enabled().then_some(cache))
            },
        )
    }

    pub fn locking_cache(&self) -> &FileLockingCache {
        &self.cache
    }

    /// `<dir>/<prefix>[<uid>_]<sha256-hex of the url>`. An empty `uid`
    /// omits the separator.
    pub fn get_cache_file_name(&self, uid: &str, url: &str) -> Result<PathBuf> {
        let hash = fingerprint::sha256_hex(url)?;
        let suffix = if uid.is_empty() {
            hash
        } else {
            format!("{uid}_{hash}")
        };
        Ok(self.cache.get_cache_file_name(&suffix, false))
    }

    /// Return the cached body for `(uid, url)`, fetching it through the
    /// callback first if no process has cached it yet. No staleness check
    /// is applied here; revalidation is the caller's concern.
    ///
    /// The returned guard holds a shared lock on the entry; the purger will
    /// not evict it until the guard is dropped.
    pub fn get_or_fetch<F>(&self, uid: &str, url: &str, mut fetch: F) -> Result<LockedEntry<'_>>
    where
        F: FnMut(&mut dyn Write) -> eyre::Result<()>,
    {
        let cache_file = self.get_cache_file_name(uid, url)?;

        loop {
            if self.cache.get_read_lock(&cache_file)? {
                return self.cache.locked_entry(cache_file);
            }

            if self.cache.create_and_lock(&cache_file)? {
                debug!("fetching {url} into {}", cache_file.display());
                let fetched = self.fill_entry(&cache_file, &mut fetch).and_then(|()| {
                    self.cache.exclusive_to_shared_lock(&cache_file)?;
                    let size = self.cache.update_cache_info(&cache_file)?;
                    if self.cache.cache_too_big(size) {
                        self.cache.update_and_purge(&cache_file)?;
                    }
                    Ok(())
                });
                if let Err(e) = fetched {
                    // Leave the partial entry for the purger.
                    let _ = self.cache.unlock_and_close(&cache_file);
                    return Err(e);
                }
                return self.cache.locked_entry(cache_file);
            }

            // Lost the creation race; the read lock above will block until
            // the winner finishes writing.
            trace!("lost creation race for {url}; waiting on reader");
        }
    }

    fn fill_entry<F>(&self, cache_file: &Path, fetch: &mut F) -> Result<()>
    where
        F: FnMut(&mut dyn Write) -> eyre::Result<()>,
    {
        let mut out = OpenOptions::new().append(true).open(cache_file).at(cache_file)?;
        fetch(&mut out)?;
        out.flush().at(cache_file)
    }
}
