use sha3::{Digest, Keccak256};

use canopy_types::Hash;

/// Keccak-256 digest of a byte slice.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash::from_bytes(hasher.finalize().into())
}

/// Incremental Keccak-256 hasher for streaming content into the ref store.
///
/// Also implements [`std::io::Write`] so it can sit on the write side of a
/// tee while a blob streams to disk.
#[derive(Default)]
pub struct Keccak256Hasher(Keccak256);

impl Keccak256Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash::from_bytes(self.0.finalize().into())
    }
}

impl std::io::Write for Keccak256Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
