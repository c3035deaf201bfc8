use std::fs::OpenOptions;
use std::io::BufReader;
use std::time::SystemTime;

use flate2::read::MultiGzDecoder;

use crate::config::{self, CacheConfig};
use crate::error::IoAt;
use crate::fingerprint;
use crate::keys::Keys;
use crate::locking_cache::{FileLockingCache, LockedEntry};
use crate::prelude::*;

static INSTANCE: OnceCell<Option<DecompressCache>> = OnceCell::new();

/// Cache of decompressed copies of compressed source files.
///
/// The key is the source path with its compression extension stripped, so
/// the cache file for `/data/y.nc.gz` is named after `/data/y.nc`. The key
/// is fully determined by the source path; there are no collisions and no
/// collision chain.
pub struct DecompressCache {
    cache: FileLockingCache,
}

impl DecompressCache {
    pub const DIR_KEY: &'static str = "decompress_cache.dir";
    pub const PREFIX_KEY: &'static str = "decompress_cache.prefix";
    pub const SIZE_KEY: &'static str = "decompress_cache.size";

    pub fn new(dir: &str, prefix: &str, size_mb: u64) -> Result<DecompressCache> {
        Ok(DecompressCache {
            cache: FileLockingCache::new(dir, prefix, size_mb)?,
        })
    }

    /// The process-wide instance, configured from the `decompress_cache.*`
    /// keys; `Ok(None)` when disabled. Initialization happens exactly once.
    pub fn get_instance() -> Result<Option<&'static DecompressCache>> {
        config::instance_from_keys(
            &INSTANCE,
            Keys::the_keys(),
            Self::DIR_KEY,
            Self::PREFIX_KEY,
            Self::SIZE_KEY,
            |config: CacheConfig| {
                let cache = DecompressCache::new(&config.dir, &config.prefix, config.size_mb)?;
                Ok(cache.cache.cache_enabled().then_some(cache))
            },
        )
    }

    pub fn locking_cache(&self) -> &FileLockingCache {
        &self.cache
    }

    /// Where the decompressed copy of `src` lives: the source name minus its
    /// final extension, mangled into the cache directory.
    pub fn get_cache_file_name(&self, src: &str) -> PathBuf {
        self.cache
            .get_cache_file_name(fingerprint::strip_compression_suffix(src), true)
    }

    /// Return the decompressed copy of `src`, inflating it into the cache
    /// first if no process has yet. `inflate` receives a writable stream and
    /// must emit the fully decompressed bytes (see [`inflate_gzip`] for the
    /// gzip case).
    ///
    /// The returned guard holds a shared lock on the entry; the purger will
    /// not evict it until the guard is dropped.
    pub fn get_or_decompress<F>(&self, src: &Path, mut inflate: F) -> Result<LockedEntry<'_>>
    where
        F: FnMut(&mut dyn Write) -> eyre::Result<()>,
    {
        let cache_file = self.get_cache_file_name(&src.to_string_lossy());

        loop {
            // Blocks while a writer holds the entry exclusively; returns
            // false only when the entry does not exist at all.
            if self.cache.get_read_lock(&cache_file)? {
                if self.is_valid(&cache_file, src)? {
                    return self.cache.locked_entry(cache_file);
                }
                debug!("{} is older than its source; rebuilding", cache_file.display());
                self.cache.unlock_and_close(&cache_file)?;
                self.cache.purge_file(&cache_file)?;
            }

            if self.cache.create_and_lock(&cache_file)? {
                let built = self.fill_entry(&cache_file, &mut inflate).and_then(|()| {
                    self.cache.exclusive_to_shared_lock(&cache_file)?;
                    let size = self.cache.update_cache_info(&cache_file)?;
                    if self.cache.cache_too_big(size) {
                        self.cache.update_and_purge(&cache_file)?;
                    }
                    Ok(())
                });
                if let Err(e) = built {
                    // Leave the partial entry for the purger.
                    let _ = self.cache.unlock_and_close(&cache_file);
                    return Err(e);
                }
                return self.cache.locked_entry(cache_file);
            }

            // Another process created the entry between our probe and our
            // create; loop back to the (blocking) read lock.
            trace!("lost creation race for {}; waiting on reader", cache_file.display());
        }
    }

    /// An entry is fresh iff it is at least as new as the compressed source.
    fn is_valid(&self, entry: &Path, src: &Path) -> Result<bool> {
        let entry_time: SystemTime = match fs::metadata(entry) {
            Ok(md) => md.modified().at(entry)?,
            Err(_) => return Ok(false),
        };
        let src_time = match fs::metadata(src) {
            Ok(md) if md.is_file() => md.modified().at(src)?,
            _ => return Ok(true),
        };
        Ok(entry_time >= src_time)
    }

    fn fill_entry<F>(&self, cache_file: &Path, inflate: &mut F) -> Result<()>
    where
        F: FnMut(&mut dyn Write) -> eyre::Result<()>,
    {
        let mut out = OpenOptions::new().append(true).open(cache_file).at(cache_file)?;
        inflate(&mut out)?;
        out.flush().at(cache_file)
    }
}

/// Inflate a gzip-compressed file into `w`; returns the decompressed size.
/// Usable directly as the decoder for `.gz` sources; other codecs are
/// supplied by their handlers.
pub fn inflate_gzip(src: &Path, w: &mut dyn Write) -> eyre::Result<u64> {
    let f = File::open(src).wrap_err_with(|| format!("opening {}", src.display()))?;
    let mut gz = MultiGzDecoder::new(BufReader::new(f));
    Ok(std::io::copy(&mut gz, w)?)
}
