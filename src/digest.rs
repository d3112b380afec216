//! SHA-256 digests of entry content.

use log::warn;
use sha2::{Digest, Sha256};

use crate::entry::Entry;
use crate::error::Result;

const CHUNK: usize = 64 * 1024;

/// The digest of the bytes a reader delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDigest {
    /// Lowercase hex SHA-256.
    pub sha256: String,
    /// Number of bytes hashed.
    pub length: u64,
    /// `false` when reading stopped before the end of the mapped content.
    pub complete: bool,
}

/// Hashes the content of `entry`, streaming it in logical order.
///
/// Returns `None` for folders and entries without recoverable content. A
/// recoverable read failure ends the digest early with `complete` unset.
///
/// # Errors
/// Fatal conditions only: unavailable source, cancellation, timeout.
pub fn sha256_entry(entry: &Entry) -> Result<Option<ContentDigest>> {
    let mut reader = match entry.new_reader() {
        Ok(Some(reader)) => reader,
        Ok(None) => return Ok(None),
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            warn!("{}: {}", entry.path(), err);
            return Ok(None);
        }
    };

    let mut hasher = Sha256::new();
    let mut length = 0;
    let mut complete = true;

    loop {
        entry.filesystem().control().check()?;
        match reader.read(CHUNK) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => {
                length += chunk.len() as u64;
                hasher.update(&chunk);
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!("{}: digest stops at byte {}: {}", entry.path(), length, err);
                complete = false;
                break;
            }
        }
    }
    reader.close();

    Ok(Some(ContentDigest {
        sha256: hex::encode(hasher.finalize()),
        length,
        complete,
    }))
}
