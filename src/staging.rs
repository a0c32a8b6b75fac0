//! The copy-on-write staging layer.
//!
//! The first writable open (or size-changing truncate) of a stream whose
//! blob still lives in the archive extracts the payload into a scratch
//! file under the mount's staging directory and swaps the stream over to a
//! staged blob descriptor. Every mutation on the way is paired with an
//! undo action on a local stack, so a failure midway (scratch creation,
//! extraction, handle rebinding) unwinds to the exact prior state.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::warn;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::blob::Blob;
use crate::blob::BlobId;
use crate::blob::BlobKey;
use crate::blob::BlobLocation;
use crate::fs::MountContext;

/// Appended to the archive name, before the random suffix.
const STAGING_SUFFIX: &str = ".staging";
/// Random alphanumeric characters in the staging directory name.
const DIR_RANDOM_LEN: usize = 10;
/// Random alphanumeric characters in a staging file name.
const FILE_RANDOM_LEN: usize = 20;

const EXTRACT_CHUNK: usize = 64 * 1024;

fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// The per-mount scratch directory.
#[derive(Debug)]
pub(crate) struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Creates `<prefix>/<archive_name>.staging<random>` with mode 0700,
    /// retrying on the unlikely name collision.
    pub(crate) fn create(prefix: &Path, archive_name: &std::ffi::OsStr) -> io::Result<StagingDir> {
        loop {
            let mut name = archive_name.to_os_string();
            name.push(STAGING_SUFFIX);
            name.push(random_alnum(DIR_RANDOM_LEN));
            let path = prefix.join(&name);
            match fs::DirBuilder::new().mode(0o700).create(&path) {
                Ok(()) => {
                    debug!("created staging directory {path:?}");
                    return Ok(StagingDir { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a fresh scratch file (mode 0600, random name), retrying on
    /// collision. Returns the path and a write handle.
    pub(crate) fn create_staging_file(&self) -> io::Result<(PathBuf, File)> {
        loop {
            let path = self.path.join(random_alnum(FILE_RANDOM_LEN));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => {
                    debug!("created staging file {path:?}");
                    return Ok((path, file));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes the staging directory and everything in it, depth-first.
    pub(crate) fn delete(&self) -> io::Result<()> {
        fs::remove_dir_all(&self.path)
    }
}

/// One reversible mutation of the mount state.
enum UndoOp {
    RemoveFile(PathBuf),
    FreeBlob(BlobId),
    RekeyBlob { id: BlobId, key: BlobKey },
    Unstage(BlobId),
    RestoreLocation {
        id: BlobId,
        location: BlobLocation,
        owner_ino: Option<u64>,
    },
    RevertFd {
        ino: u64,
        idx: u16,
        old_blob: Option<BlobId>,
        was_counted: bool,
    },
}

/// Undo stack for a staging transaction. Mutations push their inverse as
/// they happen; success disarms the stack, failure drains it in reverse.
struct Unwind {
    ops: Vec<UndoOp>,
}

impl Unwind {
    fn new() -> Unwind {
        Unwind { ops: Vec::new() }
    }

    fn push(&mut self, op: UndoOp) {
        self.ops.push(op);
    }

    fn disarm(mut self) {
        self.ops.clear();
    }
}

impl MountContext {
    fn run_unwind(&mut self, mut unwind: Unwind) {
        while let Some(op) = unwind.ops.pop() {
            match op {
                UndoOp::RemoveFile(path) => {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("rollback: failed to remove {path:?}: {e}");
                    }
                }
                UndoOp::FreeBlob(id) => self.blobs.free(id),
                UndoOp::RekeyBlob { id, key } => {
                    self.blobs.unlink(id);
                    self.blobs.relink(id, key);
                }
                UndoOp::Unstage(id) => self.blobs.unstage(id),
                UndoOp::RestoreLocation {
                    id,
                    location,
                    owner_ino,
                } => {
                    let blob = self.blobs.get_mut(id);
                    blob.location = location;
                    blob.owner_ino = owner_ino;
                }
                UndoOp::RevertFd {
                    ino,
                    idx,
                    old_blob,
                    was_counted,
                } => {
                    if let Some(fd) = self.tree.inode_mut(ino).and_then(|i| i.fd_mut(idx)) {
                        fd.blob = old_blob;
                        fd.staging_file = None;
                        fd.counted = was_counted;
                    }
                }
            }
        }
    }

    /// Copies the first `size` bytes of the blob into `file`, zero-filling
    /// up to `size` if the blob is shorter.
    fn extract_payload(
        &self,
        old_blob: Option<BlobId>,
        size: u64,
        file: &mut File,
    ) -> io::Result<()> {
        let mut extracted = 0u64;
        if let Some(id) = old_blob {
            let blob_size = self.blobs.get(id).resource_size()?;
            let extract_size = blob_size.min(size);
            let mut buf = vec![0u8; EXTRACT_CHUNK];
            while extracted < extract_size {
                let want = ((extract_size - extracted) as usize).min(EXTRACT_CHUNK);
                let n = self
                    .read_blob_range(id, extracted, &mut buf[..want])
                    .map_err(io::Error::from_raw_os_error)?;
                if n == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                file.write_all(&buf[..n])?;
                extracted += n as u64;
            }
        }
        if size > extracted {
            file.set_len(size)?;
        }
        Ok(())
    }

    /// Moves a stream's payload into the staging directory and rebinds the
    /// stream (and every open handle on it) to the staged descriptor.
    ///
    /// If the stream was the blob's only user (`refcnt == link_count`) the
    /// descriptor itself is converted in place; otherwise the blob is
    /// split: other links keep reading the archive copy and the stream
    /// gets a fresh descriptor. Either way the staged descriptor gets a
    /// placeholder key; the real digest is restored by the commit rehash.
    pub(crate) fn extract_stream_to_staging(
        &mut self,
        ino: u64,
        stream_id: u32,
        size: u64,
    ) -> Result<BlobId, libc::c_int> {
        let (old_blob, link_count) = {
            let inode = self.tree.inode(ino).ok_or(libc::ENOENT)?;
            let stream = inode.stream(stream_id).ok_or(libc::ENOENT)?;
            (stream.blob, inode.link_count)
        };
        debug_assert!(
            old_blob.map_or(true, |id| !self.blobs.get(id).is_staged()),
            "stream is already staged"
        );
        debug!("staging inode {ino} stream {stream_id} ({size} bytes)");

        let (path, mut file) = self
            .staging
            .as_ref()
            .ok_or(libc::EROFS)?
            .create_staging_file()
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;

        let mut unwind = Unwind::new();
        unwind.push(UndoOp::RemoveFile(path.clone()));

        if let Err(e) = self.extract_payload(old_blob, size, &mut file) {
            warn!("failed to extract stream to {path:?}: {e}");
            self.run_unwind(unwind);
            return Err(e.raw_os_error().unwrap_or(libc::EIO));
        }
        drop(file);

        let reuse = match old_blob {
            Some(id) => {
                let blob = self.blobs.get(id);
                debug_assert!(blob.refcnt >= link_count);
                blob.refcnt == link_count
            }
            None => false,
        };

        let new_blob = if reuse {
            // All references to the old descriptor belong to this stream;
            // convert it in place.
            let id = old_blob.expect("reuse implies an old blob");
            let old_key = self.blobs.get(id).key;
            self.blobs.unlink(id);
            let staging_key = self.blobs.next_staging_key();
            self.blobs.relink(id, staging_key);
            unwind.push(UndoOp::RekeyBlob { id, key: old_key });

            let blob = self.blobs.get_mut(id);
            let location = std::mem::replace(
                &mut blob.location,
                BlobLocation::InStagingFile { path: path.clone() },
            );
            let owner_ino = std::mem::replace(&mut blob.owner_ino, Some(ino));
            unwind.push(UndoOp::RestoreLocation {
                id,
                location,
                owner_ino,
            });

            self.blobs.note_staged(id);
            unwind.push(UndoOp::Unstage(id));
            id
        } else {
            let staging_key = self.blobs.next_staging_key();
            let id = self.blobs.insert(Blob {
                key: staging_key,
                location: BlobLocation::InStagingFile { path: path.clone() },
                refcnt: 0,
                pending_refcnt: 0,
                open_fds: 0,
                owner_ino: Some(ino),
            });
            unwind.push(UndoOp::FreeBlob(id));
            id
        };

        // Rebind every open handle on this stream to the staged blob; each
        // gets its own read descriptor on the scratch file.
        let handle_idxs: Vec<u16> = {
            let inode = self.tree.inode(ino).expect("checked above");
            inode
                .open_fd_indices()
                .into_iter()
                .filter(|&idx| inode.fd(idx).map(|fd| fd.stream_id) == Some(stream_id))
                .collect()
        };
        let mut rebound: u16 = 0;
        let mut moved_counted: u16 = 0;
        for idx in handle_idxs {
            let scratch = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!("failed to rebind handle {idx} to {path:?}: {e}");
                    self.run_unwind(unwind);
                    return Err(e.raw_os_error().unwrap_or(libc::EIO));
                }
            };
            let fd = self
                .tree
                .inode_mut(ino)
                .and_then(|i| i.fd_mut(idx))
                .expect("handle index collected above");
            let old_fd_blob = fd.blob;
            let was_counted = fd.counted;
            fd.blob = Some(new_blob);
            fd.staging_file = Some(scratch);
            fd.counted = true;
            unwind.push(UndoOp::RevertFd {
                ino,
                idx,
                old_blob: old_fd_blob,
                was_counted,
            });
            rebound += 1;
            if was_counted {
                moved_counted += 1;
            }
        }

        // Reference and handle accounting; nothing below can fail.
        if reuse {
            debug_assert_eq!(moved_counted, rebound, "reused descriptor keeps its handles");
        } else {
            {
                let blob = self.blobs.get_mut(new_blob);
                blob.refcnt = link_count;
                blob.open_fds = rebound;
            }
            if let Some(old_id) = old_blob {
                let old = self.blobs.get_mut(old_id);
                debug_assert!(old.refcnt > link_count, "split requires shared references");
                old.refcnt -= link_count;
                old.open_fds -= moved_counted;
            }
        }
        self.tree
            .inode_mut(ino)
            .expect("checked above")
            .stream_mut(stream_id)
            .expect("checked above")
            .blob = Some(new_blob);

        unwind.disarm();
        Ok(new_blob)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::archive::BlobSource;
    use crate::archive::DentrySpec;
    use crate::archive::InMemoryArchive;
    use crate::fs::testing::rw_context;
    use crate::image::ROOT_INO;

    fn archive_with_file(name: &[u8], content: &[u8]) -> InMemoryArchive {
        let archive = InMemoryArchive::new("test.wim");
        let digest = archive.insert_blob(content);
        let mut root = DentrySpec::directory(b"");
        root.children.push(DentrySpec::file(
            name,
            Some(BlobSource::Archive {
                digest,
                size: content.len() as u64,
            }),
        ));
        archive.add_image(root);
        archive
    }

    #[test]
    fn staging_dir_and_file_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(tmp.path(), OsStr::new("x.wim")).unwrap();
        let meta = fs::metadata(staging.path()).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o700);
        let dir_name = staging.path().file_name().unwrap().to_str().unwrap();
        assert!(dir_name.starts_with("x.wim.staging"));
        assert_eq!(dir_name.len(), "x.wim.staging".len() + DIR_RANDOM_LEN);

        let (path, _file) = staging.create_staging_file().unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(path.file_name().unwrap().len(), FILE_RANDOM_LEN);

        staging.delete().unwrap();
        assert!(!staging.path().exists());
    }

    #[test]
    fn extract_copies_content_and_rekeys() {
        let archive = archive_with_file(b"f", b"hello world");
        let (mut ctx, _tmp) = rw_context(archive);
        let ino = ctx.resolve_ino(b"f");

        let blob = ctx.extract_stream_to_staging(ino, 0, 11).unwrap();
        let staged = ctx.blobs.get(blob);
        assert!(staged.is_staged());
        assert!(matches!(staged.key, BlobKey::Staging(_)));
        assert_eq!(staged.owner_ino, Some(ino));
        assert_eq!(staged.refcnt, 1);
        assert_eq!(
            fs::read(staged.staging_path().unwrap()).unwrap(),
            b"hello world"
        );
        assert_eq!(ctx.blobs.staging_blobs(), vec![blob]);
    }

    #[test]
    fn extract_truncated_with_zero_fill() {
        let archive = archive_with_file(b"f", b"hello world");
        let (mut ctx, _tmp) = rw_context(archive);
        let ino = ctx.resolve_ino(b"f");

        // Longer than the blob: tail is zero-filled.
        let blob = ctx.extract_stream_to_staging(ino, 0, 16).unwrap();
        let content = fs::read(ctx.blobs.get(blob).staging_path().unwrap()).unwrap();
        assert_eq!(&content[..11], b"hello world");
        assert_eq!(&content[11..], &[0u8; 5]);
    }

    #[test]
    fn shared_blob_splits() {
        // Two hard links share one blob; staging one of them must leave
        // the other reading the archive copy.
        let archive = InMemoryArchive::new("test.wim");
        let digest = archive.insert_blob(b"Zebra");
        let mut root = DentrySpec::directory(b"");
        for name in [b"x".as_slice(), b"y".as_slice()] {
            let mut f = DentrySpec::file(name, Some(BlobSource::Archive { digest, size: 5 }));
            f.hard_link_group = 9;
            root.children.push(f);
        }
        // A third, independent file on the same blob.
        root.children.push(DentrySpec::file(
            b"z",
            Some(BlobSource::Archive { digest, size: 5 }),
        ));
        archive.add_image(root);

        let (mut ctx, _tmp) = rw_context(archive);
        let z_ino = ctx.resolve_ino(b"z");
        let old_blob = ctx.blobs.lookup_content(&digest).unwrap();
        assert_eq!(ctx.blobs.get(old_blob).refcnt, 3);

        let new_blob = ctx.extract_stream_to_staging(z_ino, 0, 5).unwrap();
        assert_ne!(new_blob, old_blob);
        assert_eq!(ctx.blobs.get(old_blob).refcnt, 2);
        assert_eq!(ctx.blobs.get(new_blob).refcnt, 1);
        // The hard-linked pair still points at the archive blob.
        let x_ino = ctx.resolve_ino(b"x");
        let x_blob = ctx.tree.inode(x_ino).unwrap().stream(0).unwrap().blob;
        assert_eq!(x_blob, Some(old_blob));
    }

    #[test]
    fn open_handles_are_rebound() {
        let archive = archive_with_file(b"f", b"payload");
        let (mut ctx, _tmp) = rw_context(archive);
        let ino = ctx.resolve_ino(b"f");

        let fh = ctx.do_open(ino, libc::O_RDONLY).unwrap();
        let blob = ctx.extract_stream_to_staging(ino, 0, 7).unwrap();

        let inode = ctx.tree.inode(ino).unwrap();
        let fd = inode.fd(fh as u16).unwrap();
        assert_eq!(fd.blob, Some(blob));
        assert!(fd.staging_file.is_some());
        assert!(fd.counted);
        assert_eq!(ctx.blobs.get(blob).open_fds, 1);
        // The rebound handle reads the staged copy.
        assert_eq!(ctx.do_read(ino, fh, 0, 7).unwrap(), b"payload");
    }

    #[test]
    fn failed_extract_unwinds() {
        let archive = archive_with_file(b"f", b"payload");
        let (mut ctx, _tmp) = rw_context(archive);
        let ino = ctx.resolve_ino(b"f");
        let digest_blob = ctx.tree.inode(ino).unwrap().stream(0).unwrap().blob;

        // Deleting the staging directory makes scratch creation fail.
        let staging_path = ctx.staging.as_ref().unwrap().path().to_path_buf();
        fs::remove_dir_all(&staging_path).unwrap();

        assert!(ctx.extract_stream_to_staging(ino, 0, 7).is_err());
        // Stream still points at the archive blob, nothing staged.
        assert_eq!(
            ctx.tree.inode(ino).unwrap().stream(0).unwrap().blob,
            digest_blob
        );
        assert!(ctx.blobs.staging_blobs().is_empty());
    }
}
