//! The seam between the mount core and the archive codec.
//!
//! Decoding and encoding the archive container (compression, chunk tables,
//! XML metadata) is not this crate's business. The mount core consumes an
//! [`ArchiveProvider`]: it loads one image's metadata tree at mount time,
//! reads blob payloads by content digest while mounted, and hands the final
//! image state back to [`ArchiveProvider::commit`] on a committing unmount.
//!
//! [`InMemoryArchive`] is a complete reference provider backed by plain
//! maps. It is what the test suite mounts.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use bitflags::bitflags;
use log::debug;

use crate::digest::Digest;
use crate::error::MountError;

bitflags! {
    /// Options forwarded to the archive writer by a committing unmount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Append integrity information to the rewritten archive.
        const CHECK_INTEGRITY = 0x0000_0001;
        /// Rebuild the whole archive instead of appending.
        const REBUILD = 0x0000_0002;
        /// Recompress all blobs, including unmodified ones.
        const RECOMPRESS = 0x0000_0004;
    }
}

bitflags! {
    /// Windows file attribute word stored on every inode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        /// `FILE_ATTRIBUTE_READONLY`
        const READONLY = 0x0000_0001;
        /// `FILE_ATTRIBUTE_HIDDEN`
        const HIDDEN = 0x0000_0002;
        /// `FILE_ATTRIBUTE_SYSTEM`
        const SYSTEM = 0x0000_0004;
        /// `FILE_ATTRIBUTE_DIRECTORY`
        const DIRECTORY = 0x0000_0010;
        /// `FILE_ATTRIBUTE_ARCHIVE`
        const ARCHIVE = 0x0000_0020;
        /// `FILE_ATTRIBUTE_NORMAL`
        const NORMAL = 0x0000_0080;
        /// `FILE_ATTRIBUTE_SPARSE_FILE`
        const SPARSE_FILE = 0x0000_0200;
        /// `FILE_ATTRIBUTE_REPARSE_POINT`
        const REPARSE_POINT = 0x0000_0400;
        /// `FILE_ATTRIBUTE_COMPRESSED`
        const COMPRESSED = 0x0000_0800;
        /// `FILE_ATTRIBUTE_ENCRYPTED`
        const ENCRYPTED = 0x0000_4000;
    }
}

/// Reparse tag identifying a symbolic link.
pub const REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Where a stream's payload lives, as described to (or by) the codec.
///
/// `load_metadata` produces only `Archive` sources; `commit` receives
/// `File` sources for staged streams and `Buffer` sources for attached
/// buffers (symlink targets, xattr values) alongside untouched `Archive`
/// sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// Payload already inside the archive, addressed by digest.
    Archive {
        /// Content digest.
        digest: Digest,
        /// Uncompressed size in bytes.
        size: u64,
    },
    /// Payload in a file on disk (a finalized staging file).
    File {
        /// Content digest.
        digest: Digest,
        /// File holding the payload.
        path: PathBuf,
        /// Payload size in bytes.
        size: u64,
    },
    /// Payload held in memory.
    Buffer {
        /// Content digest.
        digest: Digest,
        /// The payload itself.
        bytes: Vec<u8>,
    },
}

impl BlobSource {
    /// Content digest of the payload.
    pub fn digest(&self) -> Digest {
        match self {
            BlobSource::Archive { digest, .. }
            | BlobSource::File { digest, .. }
            | BlobSource::Buffer { digest, .. } => *digest,
        }
    }

    /// Uncompressed payload size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            BlobSource::Archive { size, .. } | BlobSource::File { size, .. } => *size,
            BlobSource::Buffer { bytes, .. } => bytes.len() as u64,
        }
    }
}

/// One stream of a [`DentrySpec`]: the unnamed stream has `name == None`,
/// alternate data streams carry their name. An empty stream has no source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Stream name, or `None` for the unnamed (main content) stream.
    pub name: Option<Vec<u8>>,
    /// Payload source, or `None` for an empty stream.
    pub source: Option<BlobSource>,
}

/// One node of an image's metadata tree, both as loaded from the archive
/// and as handed back to the writer at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentrySpec {
    /// Entry name (case-preserving bytes). Empty for the root.
    pub name: Vec<u8>,
    /// Windows attribute flags.
    pub attributes: FileAttributes,
    /// Reparse tag; meaningful only with `REPARSE_POINT` set.
    pub reparse_tag: u32,
    /// Creation time, 100-ns ticks since 1601.
    pub creation_ticks: u64,
    /// Last write time, 100-ns ticks since 1601.
    pub last_write_ticks: u64,
    /// Last access time, 100-ns ticks since 1601.
    pub last_access_ticks: u64,
    /// Nonzero id shared by all dentries aliasing one inode (hard links).
    /// Zero means the entry is not hard-linked.
    pub hard_link_group: u64,
    /// Streams; the unnamed stream first by convention.
    pub streams: Vec<StreamSpec>,
    /// Children, for directories.
    pub children: Vec<DentrySpec>,
}

impl DentrySpec {
    /// A bare directory entry with the given name.
    pub fn directory(name: &[u8]) -> DentrySpec {
        DentrySpec {
            name: name.to_vec(),
            attributes: FileAttributes::DIRECTORY,
            reparse_tag: 0,
            creation_ticks: crate::time::UNIX_EPOCH_TICKS,
            last_write_ticks: crate::time::UNIX_EPOCH_TICKS,
            last_access_ticks: crate::time::UNIX_EPOCH_TICKS,
            hard_link_group: 0,
            streams: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A regular-file entry whose unnamed stream has the given source.
    pub fn file(name: &[u8], source: Option<BlobSource>) -> DentrySpec {
        DentrySpec {
            name: name.to_vec(),
            attributes: FileAttributes::NORMAL,
            reparse_tag: 0,
            creation_ticks: crate::time::UNIX_EPOCH_TICKS,
            last_write_ticks: crate::time::UNIX_EPOCH_TICKS,
            last_access_ticks: crate::time::UNIX_EPOCH_TICKS,
            hard_link_group: 0,
            streams: vec![StreamSpec { name: None, source }],
            children: Vec::new(),
        }
    }
}

/// Access to one WIM archive (or split-archive set) for the mount core.
///
/// Implementations own all on-disk format knowledge. Every method that can
/// fail reports a [`MountError`] so the daemon can surface it through the
/// unmount protocol unchanged.
pub trait ArchiveProvider: Send {
    /// Path of the (first part of the) backing archive file. Used for the
    /// advisory lock and for naming the staging directory.
    fn path(&self) -> &Path;

    /// Number of parts in the set. Read-write mounts require 1.
    fn part_count(&self) -> usize {
        1
    }

    /// Number of images in the archive. Image indices are 1-based.
    fn image_count(&self) -> usize;

    /// Cross-checks that all parts of a split set are present and
    /// consistent.
    fn verify_split_set(&self) -> Result<(), MountError> {
        Ok(())
    }

    /// Pins the image's metadata in memory until the provider is dropped or
    /// the image is committed. A read-write mount pins its image so the
    /// metadata cannot be evicted between mount and commit.
    fn pin_metadata(&mut self, image: usize) -> Result<(), MountError>;

    /// Loads the metadata tree of the given image.
    fn load_metadata(&mut self, image: usize) -> Result<DentrySpec, MountError>;

    /// Reads up to `buf.len()` bytes of the blob `digest` starting at
    /// `offset`. Returns the number of bytes read; short only at the end of
    /// the blob.
    fn read_blob(&self, digest: &Digest, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Atomically rewrites the archive so that image `image` has the tree
    /// `root`. The writer reads `File` and `Buffer` sources, deduplicates
    /// by digest, and replaces the archive file by rename.
    fn commit(
        &mut self,
        image: usize,
        root: &DentrySpec,
        flags: WriteFlags,
    ) -> Result<(), MountError>;
}

/// Advisory exclusive lock on the archive file, held by the daemon for the
/// lifetime of a read-write mount.
#[derive(Debug)]
pub(crate) struct ArchiveLock {
    file: Option<File>,
}

impl ArchiveLock {
    /// Takes the lock, failing with [`MountError::AlreadyLocked`] if any
    /// other process holds it. A provider without a backing file (the
    /// in-memory reference provider) has nothing to conflict with and gets
    /// a no-op lock.
    pub(crate) fn acquire(path: &Path) -> Result<ArchiveLock, MountError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no archive file at {path:?}, skipping advisory lock");
                return Ok(ArchiveLock { file: None });
            }
            Err(e) => return Err(MountError::Io(e)),
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(MountError::AlreadyLocked)
            } else {
                Err(MountError::Io(err))
            };
        }
        debug!("acquired advisory lock on {path:?}");
        Ok(ArchiveLock { file: Some(file) })
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[derive(Debug)]
struct ImageEntry {
    root: DentrySpec,
    pins: u32,
}

#[derive(Debug, Default)]
struct ArchiveState {
    images: Vec<ImageEntry>,
    blobs: HashMap<Digest, Arc<Vec<u8>>>,
}

/// A provider backed by in-memory maps instead of an archive file.
///
/// Clones share state, so a clone taken before mounting observes the
/// committed image afterwards the way reopening a real archive would.
#[derive(Debug, Clone)]
pub struct InMemoryArchive {
    label: PathBuf,
    state: Arc<Mutex<ArchiveState>>,
}

impl InMemoryArchive {
    /// Creates an empty archive. `label` stands in for the archive path.
    pub fn new(label: impl Into<PathBuf>) -> InMemoryArchive {
        InMemoryArchive {
            label: label.into(),
            state: Arc::new(Mutex::new(ArchiveState::default())),
        }
    }

    /// Stores a blob payload and returns its digest.
    pub fn insert_blob(&self, bytes: &[u8]) -> Digest {
        let digest = Digest::of_bytes(bytes);
        self.state
            .lock()
            .unwrap()
            .blobs
            .entry(digest)
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        digest
    }

    /// Appends an image built from `root` and returns its 1-based index.
    ///
    /// Every `Archive` source in the tree must name a blob previously
    /// stored with [`insert_blob`](InMemoryArchive::insert_blob); `File`
    /// and `Buffer` sources are ingested as if committed.
    pub fn add_image(&self, root: DentrySpec) -> usize {
        let mut state = self.state.lock().unwrap();
        let root = Self::ingest(&mut state, &root);
        state.images.push(ImageEntry { root, pins: 0 });
        state.images.len()
    }

    /// Drops the cached metadata of an image, as archive maintenance would.
    /// Fails while the image is pinned by a read-write mount.
    pub fn evict_metadata(&self, image: usize) -> Result<(), MountError> {
        let state = self.state.lock().unwrap();
        let entry = image
            .checked_sub(1)
            .and_then(|i| state.images.get(i))
            .ok_or(MountError::MetadataNotFound)?;
        if entry.pins > 0 {
            return Err(MountError::InvalidParam);
        }
        // The reference provider keeps everything resident; the pin check
        // above is the observable contract.
        Ok(())
    }

    fn ingest(state: &mut ArchiveState, spec: &DentrySpec) -> DentrySpec {
        let mut out = spec.clone();
        for stream in &mut out.streams {
            if let Some(source) = &stream.source {
                let normalized = match source {
                    BlobSource::Archive { digest, size } => {
                        assert!(
                            state.blobs.contains_key(digest),
                            "archive source {digest} is not stored"
                        );
                        BlobSource::Archive {
                            digest: *digest,
                            size: *size,
                        }
                    }
                    BlobSource::Buffer { digest, bytes } => {
                        state
                            .blobs
                            .entry(*digest)
                            .or_insert_with(|| Arc::new(bytes.clone()));
                        BlobSource::Archive {
                            digest: *digest,
                            size: bytes.len() as u64,
                        }
                    }
                    BlobSource::File { digest, path, size } => {
                        let bytes = std::fs::read(path).unwrap_or_default();
                        assert_eq!(bytes.len() as u64, *size, "staging file changed size");
                        state
                            .blobs
                            .entry(*digest)
                            .or_insert_with(|| Arc::new(bytes));
                        BlobSource::Archive {
                            digest: *digest,
                            size: *size,
                        }
                    }
                };
                stream.source = Some(normalized);
            }
        }
        out.children = out
            .children
            .iter()
            .map(|child| Self::ingest(state, child))
            .collect();
        out
    }
}

impl ArchiveProvider for InMemoryArchive {
    fn path(&self) -> &Path {
        &self.label
    }

    fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    fn pin_metadata(&mut self, image: usize) -> Result<(), MountError> {
        let mut state = self.state.lock().unwrap();
        let entry = image
            .checked_sub(1)
            .and_then(|i| state.images.get_mut(i))
            .ok_or(MountError::MetadataNotFound)?;
        entry.pins += 1;
        Ok(())
    }

    fn load_metadata(&mut self, image: usize) -> Result<DentrySpec, MountError> {
        let state = self.state.lock().unwrap();
        image
            .checked_sub(1)
            .and_then(|i| state.images.get(i))
            .map(|entry| entry.root.clone())
            .ok_or(MountError::MetadataNotFound)
    }

    fn read_blob(&self, digest: &Digest, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state.lock().unwrap();
        let bytes = state
            .blobs
            .get(digest)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no blob {digest}")))?;
        if offset >= bytes.len() as u64 {
            return Ok(0);
        }
        let avail = &bytes[offset as usize..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }

    fn commit(
        &mut self,
        image: usize,
        root: &DentrySpec,
        flags: WriteFlags,
    ) -> Result<(), MountError> {
        debug!("committing image {image} with flags {flags:?}");
        let mut state = self.state.lock().unwrap();
        if image == 0 || image > state.images.len() {
            return Err(MountError::MetadataNotFound);
        }
        let root = Self::ingest(&mut state, root);
        let entry = &mut state.images[image - 1];
        entry.root = root;
        entry.pins = entry.pins.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trip() {
        let archive = InMemoryArchive::new("test.wim");
        let digest = archive.insert_blob(b"Hello, World!");
        let mut root = DentrySpec::directory(b"");
        root.children.push(DentrySpec::file(
            b"hello.txt",
            Some(BlobSource::Archive { digest, size: 13 }),
        ));
        let image = archive.add_image(root.clone());
        assert_eq!(image, 1);

        let mut provider = archive.clone();
        let loaded = provider.load_metadata(1).unwrap();
        assert_eq!(loaded, root);

        let mut buf = [0u8; 5];
        assert_eq!(provider.read_blob(&digest, 7, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"World");
    }

    #[test]
    fn pinned_metadata_is_not_evictable() {
        let archive = InMemoryArchive::new("test.wim");
        archive.add_image(DentrySpec::directory(b""));
        let mut provider = archive.clone();
        provider.pin_metadata(1).unwrap();
        assert!(matches!(
            archive.evict_metadata(1),
            Err(MountError::InvalidParam)
        ));
    }

    #[test]
    fn commit_replaces_the_image() {
        let archive = InMemoryArchive::new("test.wim");
        archive.add_image(DentrySpec::directory(b""));

        let mut provider = archive.clone();
        let mut root = provider.load_metadata(1).unwrap();
        root.children.push(DentrySpec::file(
            b"new",
            Some(BlobSource::Buffer {
                digest: Digest::of_bytes(b"abc"),
                bytes: b"abc".to_vec(),
            }),
        ));
        provider.commit(1, &root, WriteFlags::empty()).unwrap();

        let reopened = archive.clone().load_metadata(1).unwrap();
        assert_eq!(reopened.children.len(), 1);
        let source = reopened.children[0].streams[0].source.as_ref().unwrap();
        assert_eq!(source.size(), 3);
        let mut buf = [0u8; 3];
        archive.read_blob(&source.digest(), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
