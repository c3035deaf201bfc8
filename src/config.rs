use crate::keys::Keys;
use crate::prelude::*;

/// The three-key configuration triple every cache variant is built from.
///
/// By convention a variant declares `<ns>.dir`, `<ns>.prefix` and
/// `<ns>.size` keys. The dir is required but may be empty (empty or missing
/// means "this variant is disabled"); the prefix is required, non-empty and
/// lowercased on read; the size is a required positive integer in megabytes.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: String,
    pub prefix: String,
    pub size_mb: u64,
}

impl CacheConfig {
    /// Read a variant's triple. `Ok(None)` means the variant is disabled by
    /// configuration; errors mean a key was present but invalid, or a
    /// required companion key was missing.
    pub fn from_keys(
        keys: &Keys,
        dir_key: &str,
        prefix_key: &str,
        size_key: &str,
    ) -> Result<Option<CacheConfig>> {
        let dir = match keys.get(dir_key) {
            None => return Ok(None),
            Some(dir) if dir.is_empty() => return Ok(None),
            Some(dir) => dir,
        };

        let prefix = keys
            .get(prefix_key)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CacheError::config(prefix_key, "must be set and non-empty"))?
            .to_lowercase();

        let size_text = keys
            .get(size_key)
            .ok_or_else(|| CacheError::config(size_key, "must be set (megabytes)"))?;
        let size_mb: u64 = size_text
            .trim()
            .parse()
            .map_err(|_| CacheError::config(size_key, format!("not an integer: {size_text:?}")))?;
        if size_mb == 0 {
            return Err(CacheError::config(size_key, "must be a positive number of megabytes"));
        }

        Ok(Some(CacheConfig {
            dir,
            prefix,
            size_mb,
        }))
    }
}

/// Shared once-only initialization for the per-variant singletons.
///
/// Exactly one caller per process runs `build`; a disabled configuration or
/// a failed build pins the slot to `None` for the process lifetime. The
/// first caller observes the error, everyone after that sees `Ok(None)`.
pub(crate) fn instance_from_keys<'a, T>(
    cell: &'a OnceCell<Option<T>>,
    keys: &Keys,
    dir_key: &str,
    prefix_key: &str,
    size_key: &str,
    build: impl FnOnce(CacheConfig) -> Result<Option<T>>,
) -> Result<Option<&'a T>> {
    let mut init_error = None;
    let slot = cell.get_or_init(|| {
        match CacheConfig::from_keys(keys, dir_key, prefix_key, size_key) {
            Ok(None) => {
                debug!("{dir_key} unset or empty; cache variant disabled");
                None
            }
            Ok(Some(config)) => match build(config) {
                Ok(instance) => instance,
                Err(e) => {
                    init_error = Some(e);
                    None
                }
            },
            Err(e) => {
                init_error = Some(e);
                None
            }
        }
    });
    match init_error {
        Some(e) => Err(e),
        None => Ok(slot.as_ref()),
    }
}
