use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::time::SystemTime;

use crate::config::{self, CacheConfig};
use crate::fingerprint;
use crate::keys::Keys;
use crate::locking_cache::FileLockingCache;
use crate::prelude::*;
use crate::error::IoAt;

/// Separator line between the metadata and data sections of an entry.
/// Scanned byte-for-byte; the stream goes binary right after it.
pub const DATA_MARK: &str = "--DATA:";

/// Responses whose dataset path + constraint exceed this length are computed
/// and returned without being cached.
pub const MAX_RESOURCE_ID_LEN: usize = 4096;

const DEFAULT_MAX_COLLISIONS: u32 = 50;

static INSTANCE: OnceCell<Option<FunctionResponseCache>> = OnceCell::new();

/// Writes the two payload sections of a tagged entry. The cache itself
/// writes the resource-id line and the [`DATA_MARK`] separator, so the
/// on-disk layout is guaranteed regardless of the builder.
pub trait PayloadBuilder {
    fn write_metadata(&mut self, w: &mut dyn Write) -> eyre::Result<()>;
    fn write_data(&mut self, w: &mut dyn Write) -> eyre::Result<()>;
}

/// Reconstructs a response object from a cached entry. The reader is
/// positioned at the start of the metadata section, immediately after the
/// resource-id line.
pub trait PayloadDecoder {
    type Output;
    fn decode(&mut self, r: &mut dyn BufRead) -> eyre::Result<Self::Output>;
}

/// Outcome of a collision-chain probe.
pub enum Loaded<T> {
    Hit(T),
    /// No entry matched. The path is the first absent link of the chain and
    /// is the name to pass to a subsequent [`FunctionResponseCache::write_to_cache`].
    Miss(PathBuf),
}

/// Cache for server-side function evaluations, keyed by the composite
/// `(dataset path, constraint expression)`.
///
/// The composite can be impractically long for a file name and longer than a
/// short hash can keep collision-free, so entries are named by a 64-bit
/// fingerprint of the composite and carry the full composite verbatim as
/// their first line. Fingerprint collisions are resolved by a linear chain
/// of `_0`, `_1`, ... suffixes, probed from 0 upward; the chain ends at a
/// match, at the first absent file, or at the configured ceiling.
pub struct FunctionResponseCache {
    cache: FileLockingCache,
    // injectable so tests can force collisions
    hash: fn(&str) -> u64,
    max_collisions: u32,
}

impl FunctionResponseCache {
    pub const DIR_KEY: &'static str = "function_cache.dir";
    pub const PREFIX_KEY: &'static str = "function_cache.prefix";
    pub const SIZE_KEY: &'static str = "function_cache.size";

    pub fn new(dir: &str, prefix: &str, size_mb: u64) -> Result<FunctionResponseCache> {
        Ok(FunctionResponseCache {
            cache: FileLockingCache::new(dir, prefix, size_mb)?,
            hash: fingerprint::resource_hash,
            max_collisions: DEFAULT_MAX_COLLISIONS,
        })
    }

    /// The process-wide instance, configured from the `function_cache.*`
    /// keys. `Ok(None)` means the variant is disabled and callers should
    /// evaluate without caching. Initialization happens exactly once.
    pub fn get_instance() -> Result<Option<&'static FunctionResponseCache>> {
        config::instance_from_keys(
            &INSTANCE,
            Keys::the_keys(),
            Self::DIR_KEY,
            Self::PREFIX_KEY,
            Self::SIZE_KEY,
            |config: CacheConfig| {
                let cache = FunctionResponseCache::new(&config.dir, &config.prefix, config.size_mb)?;
                Ok(cache.cache.cache_enabled().then_some(cache))
            },
        )
    }

    pub fn locking_cache(&self) -> &FileLockingCache {
        &self.cache
    }

    /// The full logical identifier for one cached response: the dataset
    /// path and the constraint glued with `#`.
    pub fn resource_id(dataset: &Path, constraint: &str) -> String {
        format!("{}#{}", dataset.display(), constraint)
    }

    /// Callers must test this before attempting to store; oversize
    /// responses are computed and returned uncached.
    pub fn can_be_cached(dataset: &Path, constraint: &str) -> bool {
        dataset.as_os_str().len() + constraint.len() <= MAX_RESOURCE_ID_LEN
    }

    /// Base pathname for a resource id: the prefix plus the decimal 64-bit
    /// fingerprint. Collision suffixes are appended by the probe loop.
    pub fn hash_basename(&self, resource_id: &str) -> PathBuf {
        self.cache
            .get_cache_file_name(&(self.hash)(resource_id).to_string(), false)
    }

    /// Probe the collision chain for `resource_id` and decode the matching
    /// entry if one exists.
    ///
    /// Entries that fail the validity check (empty, or older than the
    /// dataset file) are purged and reported as the miss hole, so the next
    /// write reuses their slot.
    pub fn load_from_cache<D: PayloadDecoder>(
        &self,
        resource_id: &str,
        dataset: &Path,
        decoder: &mut D,
    ) -> Result<Loaded<D::Output>> {
        let base = self.hash_basename(resource_id);

        let mut suffix_counter = 0u32;
        loop {
            if suffix_counter > self.max_collisions {
                return Err(CacheError::CollisionLimitExceeded {
                    resource_id: resource_id.to_string(),
                    limit: self.max_collisions,
                });
            }
            let candidate = PathBuf::from(format!("{}_{suffix_counter}", base.display()));
            trace!("probing {}", candidate.display());

            if !self.cache.get_read_lock(&candidate)? {
                // First absent link: the chain ends here, and this is the
                // name a future create_and_lock should use.
                return Ok(Loaded::Miss(candidate));
            }

            if !self.is_valid(&candidate, dataset)? {
                debug!("{} is stale or empty; purging", candidate.display());
                self.cache.unlock_and_close(&candidate)?;
                self.cache.purge_file(&candidate)?;
                return Ok(Loaded::Miss(candidate));
            }

            let matched = self.read_entry(&candidate, resource_id, decoder);
            self.cache.unlock_and_close(&candidate)?;
            match matched? {
                Some(value) => {
                    debug!("cache hit for {resource_id:?} at {}", candidate.display());
                    return Ok(Loaded::Hit(value));
                }
                None => suffix_counter += 1,
            }
        }
    }

    /// Create `path`, write the resource-id line, the builder's metadata
    /// section, the [`DATA_MARK`] separator and the builder's data section,
    /// then downgrade to a shared lock, fold the entry into the accounting
    /// and purge if the cache went over its cap.
    ///
    /// Losing the creation race raises [`CacheError::AlreadyExists`]; the
    /// caller restarts with a (now blocking) read. A builder failure leaves
    /// the partial entry behind for the purger rather than unlinking it.
    pub fn write_to_cache<B: PayloadBuilder>(
        &self,
        resource_id: &str,
        path: &Path,
        builder: &mut B,
    ) -> Result<()> {
        if !self.cache.create_and_lock(path)? {
            return Err(CacheError::AlreadyExists(path.to_path_buf()));
        }

        let written = self.write_entry(path, resource_id, builder).and_then(|()| {
            self.cache.exclusive_to_shared_lock(path)?;
            let size = self.cache.update_cache_info(path)?;
            if self.cache.cache_too_big(size) {
                self.cache.update_and_purge(path)?;
            }
            Ok(())
        });
        let unlocked = self.cache.unlock_and_close(path);
        written?;
        unlocked
    }

    /// The read -> build -> re-read orchestration. Returns the decoded
    /// response, building and caching it first if no process has yet.
    pub fn get_or_build<D, B>(
        &self,
        dataset: &Path,
        constraint: &str,
        decoder: &mut D,
        builder: &mut B,
    ) -> Result<D::Output>
    where
        D: PayloadDecoder,
        B: PayloadBuilder,
    {
        if !Self::can_be_cached(dataset, constraint) {
            return Err(eyre!(
                "resource id for {} exceeds {MAX_RESOURCE_ID_LEN} bytes; compute it uncached",
                dataset.display()
            )
            .into());
        }
        let resource_id = Self::resource_id(dataset, constraint);

        let target = match self.load_from_cache(&resource_id, dataset, decoder)? {
            Loaded::Hit(value) => return Ok(value),
            Loaded::Miss(target) => target,
        };

        match self.write_to_cache(&resource_id, &target, builder) {
            Ok(()) => {}
            // Some other process created the entry between our probe and
            // our create; its read lock below blocks until the entry is
            // complete.
            Err(CacheError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        match self.load_from_cache(&resource_id, dataset, decoder)? {
            Loaded::Hit(value) => Ok(value),
            Loaded::Miss(path) => Err(CacheError::corrupt(
                path,
                "entry disappeared between write and re-read",
            )),
        }
    }

    /// An entry is usable iff it is non-empty and not older than the
    /// dataset it was derived from. When the dataset is not a regular file
    /// (a URL, say) there is nothing to compare against and the entry is
    /// always considered fresh.
    fn is_valid(&self, entry: &Path, dataset: &Path) -> Result<bool> {
        let entry_md = match fs::metadata(entry) {
            Ok(md) => md,
            Err(_) => return Ok(false),
        };
        if entry_md.len() == 0 {
            return Ok(false);
        }
        let entry_time: SystemTime = entry_md.modified().at(entry)?;

        let dataset_time = match fs::metadata(dataset) {
            Ok(md) if md.is_file() => md.modified().at(dataset)?,
            _ => return Ok(true),
        };
        Ok(entry_time >= dataset_time)
    }

    fn read_entry<D: PayloadDecoder>(
        &self,
        candidate: &Path,
        resource_id: &str,
        decoder: &mut D,
    ) -> Result<Option<D::Output>> {
        let mut reader = BufReader::new(File::open(candidate).at(candidate)?);
        let mut first_line = Vec::new();
        reader.read_until(b'\n', &mut first_line).at(candidate)?;
        if first_line.last() == Some(&b'\n') {
            first_line.pop();
        }
        if first_line != resource_id.as_bytes() {
            return Ok(None);
        }
        let value = decoder.decode(&mut reader)?;
        Ok(Some(value))
    }

    fn write_entry<B: PayloadBuilder>(
        &self,
        path: &Path,
        resource_id: &str,
        builder: &mut B,
    ) -> Result<()> {
        let mut out = OpenOptions::new().append(true).open(path).at(path)?;
        writeln!(out, "{resource_id}").at(path)?;
        builder.write_metadata(&mut out)?;
        writeln!(out, "{DATA_MARK}").at(path)?;
        builder.write_data(&mut out)?;
        out.flush().at(path)
    }
}
