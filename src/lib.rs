#![forbid(unsafe_code)]

//! Multi-process, file-system-backed cache for derived artifacts.
//!
//! Server processes on one host turn expensive inputs (remote fetches,
//! server-side function evaluations, decompressed copies of compressed
//! files) into byte streams stored on a shared local disk; later requests
//! with the same fingerprint reuse the artifact instead of recomputing it.
//! There is no coordinating daemon: processes coordinate entirely through
//! advisory file locks on the shared file system.
//!
//! [`locking_cache::FileLockingCache`] is the base: file-per-entry storage,
//! the shared/exclusive lock protocol, size accounting and LRU-style
//! eviction. Three variants specialize its naming and validity rules:
//! [`function_cache::FunctionResponseCache`] (tagged payloads with collision
//! chains), [`decompress_cache::DecompressCache`] (one artifact per
//! compressed source) and [`http_cache::HttpResourceCache`] (content-hashed,
//! per-user remote resources). Each variant exposes one process-wide
//! instance configured from a three-key triple in [`keys::Keys`].

mod prelude;

pub mod config;
pub mod decompress_cache;
pub mod error;
pub mod fingerprint;
pub mod function_cache;
pub mod http_cache;
pub mod keys;
pub mod locking_cache;

pub use error::{CacheError, Result};
