//! Small builder functions for engine-level tests: disposable backing
//! files and deterministic-shaped random payloads.

use common::{DbResult, EngineConfig};
use engine::Engine;
use hostfile::{HostFile, PosixHostFile};
use rand::Rng;
use tempfile::NamedTempFile;

/// Opens a fresh `PosixHostFile` backed by a uniquely-named temporary file.
///
/// The returned `NamedTempFile` must be kept alive for as long as the host
/// file is in use; its `Drop` impl removes the backing file from disk.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let (host, _guard) = temp_host_file().unwrap();
/// let engine = engine::Engine::init(host, common::EngineConfig::builder().build()).unwrap();
/// assert_eq!(engine.composite_size(), 3);
/// ```
pub fn temp_host_file() -> DbResult<(PosixHostFile, NamedTempFile)> {
    let named = NamedTempFile::new()?;
    let host = PosixHostFile::open(named.path())?;
    Ok((host, named))
}

/// Initializes a fresh engine over a temporary on-disk file, using a small
/// `EngineConfig` suited to tests (few cached pages, so eviction and
/// recovery paths actually exercise).
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let (engine, _guard) = temp_engine().unwrap();
/// assert_eq!(engine.max_folder_id(), 0);
/// ```
pub fn temp_engine() -> DbResult<(Engine<PosixHostFile>, NamedTempFile)> {
    let (host, guard) = temp_host_file()?;
    let engine = Engine::init(host, test_config())?;
    Ok((engine, guard))
}

/// An `EngineConfig` tuned for tests: a small cache so eviction paths are
/// exercised by modestly sized fixtures rather than needing huge ones.
pub fn test_config() -> EngineConfig {
    EngineConfig::builder().max_cached_pages(32).build()
}

/// A pseudo-random key of exactly `len` bytes.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let key = random_key(16);
/// assert_eq!(key.len(), 16);
/// ```
pub fn random_key(len: usize) -> Vec<u8> {
    random_bytes(len)
}

/// A pseudo-random byte string of exactly `len` bytes, suitable as a
/// stream or value payload in tests that don't care about its content.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let payload = random_bytes(4096 * 3 + 17);
/// assert_eq!(payload.len(), 4096 * 3 + 17);
/// ```
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    let mut buf = vec![0u8; len];
    rng.fill(buf.as_mut_slice());
    buf
}

/// A set of `count` distinct random keys, each `key_len` bytes long.
///
/// Collisions are resolved by redrawing, so the returned set always has
/// exactly `count` members; only safe for small `count` relative to
/// `256.pow(key_len)`.
pub fn distinct_random_keys(count: usize, key_len: usize) -> Vec<Vec<u8>> {
    let mut seen = std::collections::BTreeSet::new();
    while seen.len() < count {
        seen.insert(random_key(key_len));
    }
    seen.into_iter().collect()
}

/// Draws a random page count in `1..=max_pages` worth of bytes, biased
/// toward exercising multi-page streams.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let bytes = random_multi_page_payload(5);
/// assert!(bytes.len() >= common::PAGE_SIZE);
/// assert!(bytes.len() <= 5 * common::PAGE_SIZE);
/// ```
pub fn random_multi_page_payload(max_pages: usize) -> Vec<u8> {
    let pages = rand::rng().random_range(1..=max_pages);
    random_bytes(pages * common::PAGE_SIZE)
}
