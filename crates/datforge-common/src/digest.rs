//! Field-framed SHA-256 digests
//!
//! [`FieldHasher`] frames every field with its length before hashing, so
//! `("ab", "c")` and `("a", "bc")` never collide.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;

const READ_BUFFER_SIZE: usize = 64 * 1024;

fn update_from_reader<R: Read>(hasher: &mut Sha256, reader: &mut R) -> Result<u64> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok(total)
}

/// Incremental SHA-256 over length-prefixed fields
#[derive(Clone, Default)]
pub struct FieldHasher {
    inner: Sha256,
}

impl FieldHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one framed field
    pub fn field(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    /// Append a stream as the final field and return the hex digest
    ///
    /// The stream length is hashed after the content, since it is only known
    /// once the reader is exhausted.
    pub fn finish_with_reader<R: Read>(mut self, reader: &mut R) -> Result<String> {
        let total = update_from_reader(&mut self.inner, reader)?;
        self.inner.update(total.to_le_bytes());
        Ok(hex::encode(self.inner.finalize()))
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}
