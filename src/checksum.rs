//! MD5 content digests
//!
//! Checksums are lowercase hex strings, the form remove requests carry.

use crate::Result;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// MD5 of an in-memory buffer
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// MD5 of a file, streamed in 64 KiB blocks
///
/// # Errors
///
/// Returns `Io` if the file cannot be opened or read.
pub fn md5_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
