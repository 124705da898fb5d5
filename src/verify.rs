//! MD5 checksums over raw file bytes.

use crate::error::SyncError;
use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;

/// Lowercase hex MD5 of a byte slice.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

/// Computes the MD5 hash of a local file.
///
/// The file is read as raw bytes in 1MB chunks, so the digest never
/// depends on text encoding and large files are not loaded whole.
///
/// # Arguments
///
/// * `path` - Path to the file
///
/// # Returns
///
/// The MD5 hash as a 32-character lowercase hexadecimal string.
pub fn compute_file_md5(path: &Path) -> Result<String, SyncError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Checks transferred bytes against the checksum recorded for `path`.
pub(crate) fn verify_bytes(path: &str, bytes: &[u8], expected: &str) -> Result<(), SyncError> {
    let actual = md5_hex(bytes);
    if actual != expected {
        return Err(SyncError::ChecksumMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
