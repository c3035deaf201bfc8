use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use ring::digest;

use crate::prelude::*;

/// Sentinel that replaces path separators when a source pathname is encoded
/// as a single cache file name component.
pub const MANGLE_CHAR: char = '#';

/// Encode a source pathname as a single file-name component: strip any
/// trailing `/`, then replace every `/` with [`MANGLE_CHAR`].
///
/// The mangling is lossy but deterministic. Two distinct sources that mangle
/// to the same string share a single cache entry; the callers that use this
/// rule only pass sources whose path already uniquely identifies the
/// artifact.
pub fn mangle(src: &str) -> String {
    src.trim_end_matches('/').replace('/', "#")
}

/// Drop the final `.suffix` from a source name, if there is one. Used by the
/// decompression cache, whose entries are keyed by the source path with its
/// compression extension removed.
pub fn strip_compression_suffix(src: &str) -> &str {
    match src.rfind('.') {
        Some(dot) => &src[..dot],
        None => src,
    }
}

/// Lowercase-hex SHA-256 of a logical key.
///
/// A `/` is prepended to the key before hashing when it doesn't already start
/// with one, so `"foo"` and `"/foo"` produce the same fingerprint.
pub fn sha256_hex(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(eyre!("refusing to fingerprint an empty cache key").into());
    }
    let slashed = if key.starts_with('/') {
        std::borrow::Cow::Borrowed(key)
    } else {
        std::borrow::Cow::Owned(format!("/{key}"))
    };
    let digest = digest::digest(&digest::SHA256, slashed.as_bytes());
    Ok(data_encoding::HEXLOWER.encode(digest.as_ref()))
}

/// Short non-cryptographic fingerprint for resource ids whose full text is
/// stored in the entry itself (the tagged-payload cache disambiguates the
/// inevitable collisions with a numeric suffix chain).
pub fn resource_hash(resource_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(resource_id.as_bytes());
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mangle() {
        assert_eq!(mangle("/usr/local/data/x.nc"), "#usr#local#data#x.nc");
        assert_eq!(mangle("/data/"), "#data");
        assert_eq!(mangle("plain"), "plain");
        // deterministic, pure
        assert_eq!(mangle("/a/b"), mangle("/a/b"));
    }

    #[test]
    fn test_strip_compression_suffix() {
        assert_eq!(strip_compression_suffix("/data/y.nc.gz"), "/data/y.nc");
        assert_eq!(strip_compression_suffix("foo.bz2"), "foo");
        assert_eq!(strip_compression_suffix("no_suffix"), "no_suffix");
    }

    #[test]
    fn test_sha256_hex_prepends_slash() {
        let bare = sha256_hex("foo").unwrap();
        let slashed = sha256_hex("/foo").unwrap();
        assert_eq!(bare, slashed);
        assert_eq!(bare.len(), 64);
        assert!(bare.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_sha256_hex_rejects_empty() {
        assert!(sha256_hex("").is_err());
    }

    #[test]
    fn test_resource_hash_is_stable() {
        let a = resource_hash("/data/x.nc#var=a");
        assert_eq!(a, resource_hash("/data/x.nc#var=a"));
        assert_ne!(a, resource_hash("/data/x.nc#var=b"));
    }
}
