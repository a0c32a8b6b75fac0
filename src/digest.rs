//! SHA-1 content digests for blob identification.

use std::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;

use sha1::Digest as _;
use sha1::Sha1;

/// Size of a blob digest in bytes.
pub const DIGEST_SIZE: usize = 20;

/// SHA-1 digest of a blob's uncompressed content.
///
/// Blobs are deduplicated by digest: two streams with equal content share a
/// single blob descriptor in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Digest of an in-memory buffer.
    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Digest of a file's contents, streamed in chunks.
    pub fn of_file(path: &Path) -> io::Result<Digest> {
        let mut file = File::open(path)?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest(hasher.finalize().into()))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl From<[u8; DIGEST_SIZE]> for Digest {
    fn from(bytes: [u8; DIGEST_SIZE]) -> Digest {
        Digest(bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to identify a blob in logs.
        write!(f, "Digest({}..)", &hex::encode(&self.0[..4]))
    }
}
