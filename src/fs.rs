//! The mounted filesystem: operation handlers and the host shim.
//!
//! [`MountContext`] owns everything a mount needs (provider, image tree,
//! blob store, staging layer) and implements each filesystem operation as
//! a method returning `Result<_, libc::c_int>`. [`WimFs`] is the thin
//! [`fuser::Filesystem`] implementation that forwards host callbacks into
//! the context and converts errors into negative replies. Keeping the two
//! apart means every operation is testable without a kernel mount.

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use fuser::TimeOrNow;
use log::debug;
use log::error;
use log::warn;

use crate::MountFlags;
use crate::StreamInterface;
use crate::archive::ArchiveLock;
use crate::archive::ArchiveProvider;
use crate::archive::FileAttributes;
use crate::archive::REPARSE_TAG_SYMLINK;
use crate::blob::Blob;
use crate::blob::BlobId;
use crate::blob::BlobKey;
use crate::blob::BlobLocation;
use crate::blob::BlobStore;
use crate::digest::Digest;
use crate::image::ImageTree;
use crate::image::Inode;
use crate::image::OpenFd;
use crate::staging::StagingDir;
use crate::time::now_ticks;
use crate::time::system_time_from_ticks;
use crate::time::ticks_from_system_time;

/// Attribute replies never need revalidation delay; the daemon is the only
/// writer of the tree.
const TTL: Duration = Duration::new(0, 0);

const BLOCK_SIZE: u64 = 512;

/// Alternate data streams are exposed to the kernel as synthetic inode
/// numbers: the owning inode's number with the stream id in the top bits.
const STREAM_INO_SHIFT: u32 = 48;
const BASE_INO_MASK: u64 = (1 << STREAM_INO_SHIFT) - 1;

fn encode_stream_ino(ino: u64, stream_id: u32) -> u64 {
    debug_assert!(stream_id > 0 && stream_id <= crate::image::MAX_ADS);
    ino | (u64::from(stream_id) << STREAM_INO_SHIFT)
}

fn decode_ino(ino: u64) -> (u64, Option<u32>) {
    let stream = (ino >> STREAM_INO_SHIFT) as u32;
    if stream == 0 {
        (ino, None)
    } else {
        (ino & BASE_INO_MASK, Some(stream))
    }
}

/// Splits `name:stream` syntax; only meaningful under the Windows stream
/// interface. An empty stream part is not stream syntax.
fn split_stream_name(name: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = memchr::memchr(b':', name)?;
    let (base, stream) = (&name[..pos], &name[pos + 1..]);
    if base.is_empty() || stream.is_empty() {
        return None;
    }
    Some((base, stream))
}

fn errno_from_io(err: &std::io::Error) -> libc::c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Everything one mounted image owns.
pub(crate) struct MountContext {
    pub(crate) provider: Box<dyn ArchiveProvider>,
    pub(crate) image_index: usize,
    pub(crate) tree: ImageTree,
    pub(crate) blobs: BlobStore,
    pub(crate) staging: Option<StagingDir>,
    pub(crate) readonly: bool,
    pub(crate) stream_interface: StreamInterface,
    pub(crate) mount_flags: MountFlags,
    pub(crate) mount_dir: PathBuf,
    pub(crate) lock: Option<ArchiveLock>,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    /// Set once the daemon side of the unmount protocol has run.
    pub(crate) destroyed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

impl MountContext {
    fn check_writable(&self) -> Result<(), libc::c_int> {
        if self.readonly {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    fn inode(&self, ino: u64) -> Result<&Inode, libc::c_int> {
        self.tree.inode(ino).ok_or(libc::ENOENT)
    }

    fn inode_mut(&mut self, ino: u64) -> Result<&mut Inode, libc::c_int> {
        self.tree.inode_mut(ino).ok_or(libc::ENOENT)
    }

    fn blob_size(&self, id: BlobId) -> Result<u64, libc::c_int> {
        self.blobs.get(id).resource_size().map_err(|e| {
            warn!("failed to size blob: {e}");
            errno_from_io(&e)
        })
    }

    /// Synthesizes a `stat` result for `(inode, stream)`.
    fn attr_for(&self, encoded_ino: u64, ino: u64, stream_id: u32) -> Result<FileAttr, libc::c_int> {
        let inode = self.inode(ino)?;
        let (kind, perm) = if stream_id != 0 {
            (FileType::RegularFile, 0o755)
        } else if inode.is_symlink() {
            (FileType::Symlink, 0o777)
        } else if inode.is_directory() {
            (FileType::Directory, 0o755)
        } else {
            (FileType::RegularFile, 0o755)
        };
        let stream = inode.stream(stream_id).ok_or(libc::ENOENT)?;
        let size = match stream.blob {
            Some(id) => self.blob_size(id)?,
            None => 0,
        };
        Ok(FileAttr {
            ino: encoded_ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE),
            atime: system_time_from_ticks(inode.last_access_ticks),
            mtime: system_time_from_ticks(inode.last_write_ticks),
            ctime: system_time_from_ticks(inode.creation_ticks),
            crtime: system_time_from_ticks(inode.creation_ticks),
            kind,
            perm,
            nlink: inode.link_count,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        })
    }

    fn file_type_of(&self, ino: u64) -> FileType {
        match self.tree.inode(ino) {
            Some(inode) if inode.is_symlink() => FileType::Symlink,
            Some(inode) if inode.is_directory() => FileType::Directory,
            _ => FileType::RegularFile,
        }
    }

    /// Reads a whole blob payload into memory (symlink targets, xattr
    /// values; these are small by construction).
    fn read_blob_all(&self, id: BlobId) -> Result<Vec<u8>, libc::c_int> {
        let size = self.blob_size(id)?;
        let mut buf = vec![0u8; size as usize];
        let n = self.read_blob_range(id, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads part of a blob payload, dispatching on its location.
    pub(crate) fn read_blob_range(
        &self,
        id: BlobId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, libc::c_int> {
        let blob = self.blobs.get(id);
        match &blob.location {
            BlobLocation::InArchive { size } => {
                let digest = match blob.key {
                    BlobKey::Content(digest) => digest,
                    BlobKey::Staging(_) => unreachable!("archive blobs are content-keyed"),
                };
                let avail = size.saturating_sub(offset) as usize;
                let want = buf.len().min(avail);
                let mut done = 0;
                while done < want {
                    let n = self
                        .provider
                        .read_blob(&digest, offset + done as u64, &mut buf[done..want])
                        .map_err(|e| {
                            error!("archive read of {digest} failed: {e}");
                            libc::EIO
                        })?;
                    if n == 0 {
                        return Err(libc::EIO);
                    }
                    done += n;
                }
                Ok(done)
            }
            BlobLocation::InAttachedBuffer(bytes) => {
                if offset >= bytes.len() as u64 {
                    return Ok(0);
                }
                let avail = &bytes[offset as usize..];
                let n = avail.len().min(buf.len());
                buf[..n].copy_from_slice(&avail[..n]);
                Ok(n)
            }
            BlobLocation::InStagingFile { path } | BlobLocation::InFileOnDisk { path, .. } => {
                let file = std::fs::File::open(path).map_err(|e| errno_from_io(&e))?;
                let len = file.metadata().map_err(|e| errno_from_io(&e))?.len();
                let avail = len.saturating_sub(offset) as usize;
                let n = buf.len().min(avail);
                file.read_exact_at(&mut buf[..n], offset)
                    .map_err(|e| errno_from_io(&e))?;
                Ok(n)
            }
        }
    }

    /// Resolves a possibly-`name:stream` lookup under the Windows stream
    /// interface; plain name otherwise.
    pub(crate) fn do_lookup(&self, parent: u64, name: &[u8]) -> Result<FileAttr, libc::c_int> {
        let (parent, parent_stream) = decode_ino(parent);
        if parent_stream.is_some() {
            return Err(libc::ENOTDIR);
        }
        if !self.inode(parent)?.is_directory() {
            return Err(libc::ENOTDIR);
        }
        if self.stream_interface == StreamInterface::Windows {
            if let Some((base, stream_name)) = split_stream_name(name) {
                let dentry = self.tree.lookup_child(parent, base).ok_or(libc::ENOENT)?;
                let ino = self.tree.dentry(dentry).ino;
                let inode = self.inode(ino)?;
                let stream = inode.ads_by_name(stream_name).ok_or(libc::ENOENT)?;
                return self.attr_for(encode_stream_ino(ino, stream.id), ino, stream.id);
            }
        }
        let dentry = self.tree.lookup_child(parent, name).ok_or(libc::ENOENT)?;
        let ino = self.tree.dentry(dentry).ino;
        self.attr_for(ino, ino, 0)
    }

    pub(crate) fn do_getattr(&self, encoded: u64) -> Result<FileAttr, libc::c_int> {
        let (ino, stream) = decode_ino(encoded);
        self.attr_for(encoded, ino, stream.unwrap_or(0))
    }

    pub(crate) fn do_readlink(&self, encoded: u64) -> Result<Vec<u8>, libc::c_int> {
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        if !inode.is_symlink() {
            return Err(libc::EINVAL);
        }
        match inode.stream(0).and_then(|s| s.blob) {
            Some(blob) => self.read_blob_all(blob),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn do_mknod(&mut self, parent: u64, name: &[u8]) -> Result<FileAttr, libc::c_int> {
        self.check_writable()?;
        let (parent, _) = decode_ino(parent);
        if self.stream_interface == StreamInterface::Windows {
            if let Some((base, stream_name)) = split_stream_name(name) {
                // Create an alternate data stream on an existing file.
                let dentry = self.tree.lookup_child(parent, base).ok_or(libc::ENOENT)?;
                let ino = self.tree.dentry(dentry).ino;
                let inode = self.inode(ino)?;
                if inode.is_directory() || inode.is_reparse_point() {
                    return Err(libc::ENOENT);
                }
                if inode.ads_by_name(stream_name).is_some() {
                    return Err(libc::EEXIST);
                }
                let stream_id = self.inode_mut(ino)?.add_ads(stream_name)?;
                return self.attr_for(encode_stream_ino(ino, stream_id), ino, stream_id);
            }
        }
        let ino = self
            .tree
            .create_child(parent, name, FileAttributes::NORMAL)?;
        self.attr_for(ino, ino, 0)
    }

    pub(crate) fn do_mkdir(&mut self, parent: u64, name: &[u8]) -> Result<FileAttr, libc::c_int> {
        self.check_writable()?;
        let (parent, _) = decode_ino(parent);
        let ino = self
            .tree
            .create_child(parent, name, FileAttributes::DIRECTORY)?;
        self.attr_for(ino, ino, 0)
    }

    pub(crate) fn do_unlink(&mut self, parent: u64, name: &[u8]) -> Result<(), libc::c_int> {
        self.check_writable()?;
        let (parent, _) = decode_ino(parent);
        if self.stream_interface == StreamInterface::Windows {
            if let Some((base, stream_name)) = split_stream_name(name) {
                // Remove an alternate data stream.
                let dentry = self.tree.lookup_child(parent, base).ok_or(libc::ENOENT)?;
                let ino = self.tree.dentry(dentry).ino;
                let inode = self.inode(ino)?;
                let stream_id = inode.ads_by_name(stream_name).ok_or(libc::ENOENT)?.id;
                let link_count = inode.link_count;
                let blob = self.inode_mut(ino)?.remove_ads(stream_id);
                if let Some(blob) = blob {
                    self.blobs.release_stream_refs(blob, link_count);
                }
                return Ok(());
            }
        }
        let dentry = self.tree.lookup_child(parent, name).ok_or(libc::ENOENT)?;
        let ino = self.tree.dentry(dentry).ino;
        if self.inode(ino)?.is_directory() {
            return Err(libc::EISDIR);
        }
        self.tree.remove_dentry(dentry, &mut self.blobs);
        Ok(())
    }

    pub(crate) fn do_rmdir(&mut self, parent: u64, name: &[u8]) -> Result<(), libc::c_int> {
        self.check_writable()?;
        let (parent, _) = decode_ino(parent);
        let dentry = self.tree.lookup_child(parent, name).ok_or(libc::ENOENT)?;
        let ino = self.tree.dentry(dentry).ino;
        if !self.inode(ino)?.is_directory() {
            return Err(libc::ENOTDIR);
        }
        if !self.tree.dentry(dentry).children.is_empty() {
            return Err(libc::ENOTEMPTY);
        }
        self.tree.remove_dentry(dentry, &mut self.blobs);
        Ok(())
    }

    pub(crate) fn do_symlink(
        &mut self,
        parent: u64,
        name: &[u8],
        target: &[u8],
    ) -> Result<FileAttr, libc::c_int> {
        self.check_writable()?;
        let (parent, _) = decode_ino(parent);
        let ino = self
            .tree
            .create_child(parent, name, FileAttributes::REPARSE_POINT)?;
        let inode = self.inode_mut(ino)?;
        inode.reparse_tag = REPARSE_TAG_SYMLINK;
        let link_count = inode.link_count;
        let blob = self.attach_buffer_blob(target, link_count);
        self.inode_mut(ino)?
            .stream_mut(0)
            .expect("stream 0 always exists")
            .blob = Some(blob);
        self.attr_for(ino, ino, 0)
    }

    /// Finds or creates an attached-buffer blob for `bytes` and accounts
    /// `refs` new stream references to it.
    fn attach_buffer_blob(&mut self, bytes: &[u8], refs: u32) -> BlobId {
        let digest = Digest::of_bytes(bytes);
        match self.blobs.lookup_content(&digest) {
            Some(id) => {
                self.blobs.get_mut(id).refcnt += refs;
                id
            }
            None => self.blobs.insert(Blob {
                key: BlobKey::Content(digest),
                location: BlobLocation::InAttachedBuffer(bytes.to_vec()),
                refcnt: refs,
                pending_refcnt: 0,
                open_fds: 0,
                owner_ino: None,
            }),
        }
    }

    pub(crate) fn do_rename(
        &mut self,
        parent: u64,
        name: &[u8],
        newparent: u64,
        newname: &[u8],
    ) -> Result<(), libc::c_int> {
        self.check_writable()?;
        let (parent, _) = decode_ino(parent);
        let (newparent, _) = decode_ino(newparent);
        self.tree
            .rename(parent, name, newparent, newname, &mut self.blobs)
    }

    pub(crate) fn do_link(
        &mut self,
        encoded: u64,
        newparent: u64,
        newname: &[u8],
    ) -> Result<FileAttr, libc::c_int> {
        self.check_writable()?;
        let (ino, stream) = decode_ino(encoded);
        if stream.is_some() {
            return Err(libc::EPERM);
        }
        let (newparent, _) = decode_ino(newparent);
        let inode = self.inode(ino)?;
        if inode.is_reparse_point() {
            return Err(libc::EEXIST);
        }
        if inode.is_directory() {
            return Err(libc::EPERM);
        }
        let referenced: Vec<BlobId> = inode.streams.iter().filter_map(|s| s.blob).collect();
        self.tree.add_link(newparent, newname, ino)?;
        for blob in referenced {
            self.blobs.get_mut(blob).refcnt += 1;
        }
        self.attr_for(ino, ino, 0)
    }

    pub(crate) fn do_open(&mut self, encoded: u64, flags: i32) -> Result<u64, libc::c_int> {
        let (ino, stream_sel) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        if inode.is_directory() && stream_sel.is_none() {
            return Err(libc::EISDIR);
        }
        let stream_id = match stream_sel {
            Some(id) => {
                inode.stream(id).ok_or(libc::ENOENT)?;
                id
            }
            None => 0,
        };
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if writable {
            self.check_writable()?;
        }

        // A writable open of a stream not yet in staging materializes the
        // copy-on-write copy now.
        let mut blob = self.inode(ino)?.stream(stream_id).and_then(|s| s.blob);
        let staged = blob.map(|id| self.blobs.get(id).is_staged()).unwrap_or(false);
        if writable && !staged {
            let size = match blob {
                Some(id) => self.blob_size(id)?,
                None => 0,
            };
            self.extract_stream_to_staging(ino, stream_id, size)?;
            blob = self.inode(ino)?.stream(stream_id).and_then(|s| s.blob);
        }

        let staging_file = match blob.map(|id| self.blobs.get(id)) {
            Some(b) if b.is_staged() => {
                let path = b.staging_path().expect("staged blob has a path").clone();
                let file = OpenOptions::new()
                    .read(true)
                    .write(writable)
                    .open(&path)
                    .map_err(|e| {
                        error!("failed to open staging file {path:?}: {e}");
                        errno_from_io(&e)
                    })?;
                Some(file)
            }
            _ => None,
        };

        let counted = blob.is_some() && !self.readonly;
        let idx = self.inode_mut(ino)?.alloc_fd(OpenFd {
            stream_id,
            blob,
            staging_file,
            counted,
        })?;
        if counted {
            self.blobs.fd_opened(blob.expect("counted implies a blob"));
        }
        Ok(u64::from(idx))
    }

    pub(crate) fn do_opendir(&mut self, encoded: u64) -> Result<u64, libc::c_int> {
        let (ino, stream) = decode_ino(encoded);
        if stream.is_some() {
            return Err(libc::ENOTDIR);
        }
        if !self.inode(ino)?.is_directory() {
            return Err(libc::ENOTDIR);
        }
        let idx = self.inode_mut(ino)?.alloc_fd(OpenFd {
            stream_id: 0,
            blob: None,
            staging_file: None,
            counted: false,
        })?;
        Ok(u64::from(idx))
    }

    pub(crate) fn do_read(
        &self,
        encoded: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, libc::c_int> {
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        let fd = inode.fd(fh as u16).ok_or(libc::EBADF)?;
        let blob = match fd.blob {
            Some(blob) => blob,
            // Empty stream.
            None => return Ok(Vec::new()),
        };
        if let Some(file) = &fd.staging_file {
            let len = file.metadata().map_err(|e| errno_from_io(&e))?.len();
            let n = u64::from(size).min(len.saturating_sub(offset)) as usize;
            let mut buf = vec![0u8; n];
            file.read_exact_at(&mut buf, offset)
                .map_err(|e| errno_from_io(&e))?;
            return Ok(buf);
        }
        let res_size = self.blob_size(blob)?;
        if offset > res_size {
            return Err(libc::EOVERFLOW);
        }
        let n = u64::from(size).min(res_size - offset) as usize;
        let mut buf = vec![0u8; n];
        let got = self.read_blob_range(blob, offset, &mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    pub(crate) fn do_write(
        &mut self,
        encoded: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, libc::c_int> {
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        let fd = inode.fd(fh as u16).ok_or(libc::EBADF)?;
        let file = fd.staging_file.as_ref().ok_or(libc::EBADF)?;
        file.write_all_at(data, offset)
            .map_err(|e| errno_from_io(&e))?;
        let now = now_ticks();
        let inode = self.inode_mut(ino)?;
        inode.last_write_ticks = now;
        inode.last_access_ticks = now;
        Ok(data.len() as u32)
    }

    pub(crate) fn do_release(&mut self, encoded: u64, fh: u64) -> Result<(), libc::c_int> {
        let (ino, _) = decode_ino(encoded);
        let fd = self
            .inode_mut(ino)?
            .take_fd(fh as u16)
            .ok_or(libc::EBADF)?;
        // Dropping the handle closes its staging descriptor.
        if fd.counted {
            if let Some(blob) = fd.blob {
                self.blobs.fd_closed(blob);
            }
        }
        drop(fd);
        self.tree.maybe_free_inode(ino);
        Ok(())
    }

    pub(crate) fn do_readdir(
        &self,
        encoded: u64,
        fh: u64,
    ) -> Result<Vec<(u64, FileType, Vec<u8>)>, libc::c_int> {
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        inode.fd(fh as u16).ok_or(libc::EBADF)?;
        let dentry = self.tree.dir_dentry_of(ino).ok_or(libc::ENOTDIR)?;
        let mut entries = vec![
            (ino, FileType::Directory, b".".to_vec()),
            (self.tree.parent_ino(dentry), FileType::Directory, b"..".to_vec()),
        ];
        for (name, child_ino) in self.tree.children_of(ino).ok_or(libc::ENOTDIR)? {
            entries.push((child_ino, self.file_type_of(child_ino), name));
        }
        Ok(entries)
    }

    pub(crate) fn do_setattr(
        &mut self,
        encoded: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr, libc::c_int> {
        let (ino, stream_sel) = decode_ino(encoded);
        let stream_id = stream_sel.unwrap_or(0);

        if let Some(mode) = mode {
            // Modes are synthesized; only a no-op "change" succeeds.
            let current = self.attr_for(encoded, ino, stream_id)?;
            if mode & 0o7777 != u32::from(current.perm) {
                return Err(libc::EPERM);
            }
        }
        if let Some(uid) = uid {
            if uid != self.uid {
                return Err(libc::EPERM);
            }
        }
        if let Some(gid) = gid {
            if gid != self.gid {
                return Err(libc::EPERM);
            }
        }

        if let Some(size) = size {
            self.check_writable()?;
            self.truncate_stream(ino, stream_id, size, fh)?;
        }

        if atime.is_some() || mtime.is_some() {
            let now = now_ticks();
            let inode = self.inode_mut(ino)?;
            if let Some(atime) = atime {
                inode.last_access_ticks = match atime {
                    TimeOrNow::Now => now,
                    TimeOrNow::SpecificTime(t) => ticks_from_system_time(t),
                };
            }
            if let Some(mtime) = mtime {
                inode.last_write_ticks = match mtime {
                    TimeOrNow::Now => now,
                    TimeOrNow::SpecificTime(t) => ticks_from_system_time(t),
                };
            }
        }

        self.attr_for(encoded, ino, stream_id)
    }

    fn truncate_stream(
        &mut self,
        ino: u64,
        stream_id: u32,
        size: u64,
        fh: Option<u64>,
    ) -> Result<(), libc::c_int> {
        if let Some(fh) = fh {
            // ftruncate: the handle is already over a staged blob.
            let inode = self.inode(ino)?;
            let fd = inode.fd(fh as u16).ok_or(libc::EBADF)?;
            let file = fd.staging_file.as_ref().ok_or(libc::EBADF)?;
            return file.set_len(size).map_err(|e| errno_from_io(&e));
        }

        let blob = self
            .inode(ino)?
            .stream(stream_id)
            .ok_or(libc::ENOENT)?
            .blob;
        match blob {
            None if size == 0 => Ok(()),
            None => {
                // Extending an empty stream stages a zero-filled file.
                self.extract_stream_to_staging(ino, stream_id, size)?;
                Ok(())
            }
            Some(id) if self.blobs.get(id).is_staged() => {
                let path = self
                    .blobs
                    .get(id)
                    .staging_path()
                    .expect("staged blob has a path")
                    .clone();
                OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|f| f.set_len(size))
                    .map_err(|e| errno_from_io(&e))
            }
            Some(id) => {
                if self.blob_size(id)? == size {
                    // Truncating to the current size stages nothing.
                    return Ok(());
                }
                self.extract_stream_to_staging(ino, stream_id, size)?;
                Ok(())
            }
        }
    }

    fn xattr_stream_name<'n>(&self, name: &'n [u8]) -> Result<&'n [u8], libc::c_int> {
        if self.stream_interface != StreamInterface::Xattr {
            return Err(libc::ENOTSUP);
        }
        name.strip_prefix(b"user.").ok_or(libc::ENODATA)
    }

    pub(crate) fn do_getxattr(
        &self,
        encoded: u64,
        name: &[u8],
        size: u32,
    ) -> Result<XattrReply, libc::c_int> {
        let stream_name = self.xattr_stream_name(name)?;
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        let stream = inode.ads_by_name(stream_name).ok_or(libc::ENODATA)?;
        let value = match stream.blob {
            Some(blob) => self.read_blob_all(blob)?,
            None => Vec::new(),
        };
        if size == 0 {
            Ok(XattrReply::Size(value.len() as u32))
        } else if value.len() > size as usize {
            Err(libc::ERANGE)
        } else {
            Ok(XattrReply::Data(value))
        }
    }

    pub(crate) fn do_setxattr(
        &mut self,
        encoded: u64,
        name: &[u8],
        value: &[u8],
        flags: i32,
    ) -> Result<(), libc::c_int> {
        let stream_name = self.xattr_stream_name(name)?.to_vec();
        self.check_writable()?;
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        let link_count = inode.link_count;
        let existing = inode.ads_by_name(&stream_name).map(|s| s.id);
        match existing {
            Some(_) if flags & libc::XATTR_CREATE != 0 => return Err(libc::EEXIST),
            None if flags & libc::XATTR_REPLACE != 0 => return Err(libc::ENODATA),
            _ => {}
        }
        if let Some(stream_id) = existing {
            let blob = self.inode_mut(ino)?.remove_ads(stream_id);
            if let Some(blob) = blob {
                self.blobs.release_stream_refs(blob, link_count);
            }
        }
        let stream_id = self.inode_mut(ino)?.add_ads(&stream_name)?;
        if !value.is_empty() {
            let blob = self.attach_buffer_blob(value, link_count);
            self.inode_mut(ino)?
                .stream_mut(stream_id)
                .expect("just added")
                .blob = Some(blob);
        }
        Ok(())
    }

    pub(crate) fn do_listxattr(&self, encoded: u64, size: u32) -> Result<XattrReply, libc::c_int> {
        if self.stream_interface != StreamInterface::Xattr {
            return Err(libc::ENOTSUP);
        }
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        let mut names = Vec::new();
        for stream in &inode.streams {
            if let Some(name) = &stream.name {
                names.extend_from_slice(b"user.");
                names.extend_from_slice(name);
                names.push(0);
            }
        }
        if size == 0 {
            Ok(XattrReply::Size(names.len() as u32))
        } else if names.len() > size as usize {
            Err(libc::ERANGE)
        } else {
            Ok(XattrReply::Data(names))
        }
    }

    pub(crate) fn do_removexattr(&mut self, encoded: u64, name: &[u8]) -> Result<(), libc::c_int> {
        let stream_name = self.xattr_stream_name(name)?.to_vec();
        self.check_writable()?;
        let (ino, _) = decode_ino(encoded);
        let inode = self.inode(ino)?;
        let link_count = inode.link_count;
        let stream_id = inode.ads_by_name(&stream_name).ok_or(libc::ENODATA)?.id;
        let blob = self.inode_mut(ino)?.remove_ads(stream_id);
        if let Some(blob) = blob {
            self.blobs.release_stream_refs(blob, link_count);
        }
        Ok(())
    }
}

/// The [`fuser::Filesystem`] shim over [`MountContext`].
///
/// The context sits behind a mutex so the daemon can reach it again after
/// the session ends (the host hands ownership of the filesystem value to
/// the session). The host dispatches callbacks sequentially, so the lock
/// is never contended.
pub(crate) struct WimFs {
    ctx: Arc<Mutex<MountContext>>,
    status: Arc<AtomicI32>,
}

impl WimFs {
    pub(crate) fn new(ctx: MountContext) -> WimFs {
        WimFs {
            ctx: Arc::new(Mutex::new(ctx)),
            status: Arc::new(AtomicI32::new(0)),
        }
    }

    pub(crate) fn context(&self) -> Arc<Mutex<MountContext>> {
        Arc::clone(&self.ctx)
    }

    pub(crate) fn status_handle(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.status)
    }

    fn ctx(&self) -> std::sync::MutexGuard<'_, MountContext> {
        self.ctx.lock().expect("mount context poisoned")
    }
}

macro_rules! reply_result {
    ($result:expr, $reply:ident, $ok:expr) => {
        match $result {
            Ok(value) => ($ok)($reply, value),
            Err(errno) => $reply.error(errno),
        }
    };
}

impl Filesystem for WimFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> Result<(), libc::c_int> {
        debug!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let mut ctx = self.ctx();
        if ctx.destroyed {
            return;
        }
        let status = crate::mount::run_daemon_destroy(&mut ctx);
        self.status.store(status, Ordering::SeqCst);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.ctx().do_lookup(parent, name.as_bytes());
        reply_result!(result, reply, |r: ReplyEntry, attr| r.entry(&TTL, &attr, 0));
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {}

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let result = self.ctx().do_getattr(ino);
        reply_result!(result, reply, |r: ReplyAttr, attr| r.attr(&TTL, &attr));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self
            .ctx()
            .do_setattr(ino, mode, uid, gid, size, atime, mtime, fh);
        reply_result!(result, reply, |r: ReplyAttr, attr| r.attr(&TTL, &attr));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.ctx().do_readlink(ino);
        reply_result!(result, reply, |r: ReplyData, data: Vec<u8>| r.data(&data));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & libc::S_IFMT != libc::S_IFREG {
            reply.error(libc::EPERM);
            return;
        }
        let result = self.ctx().do_mknod(parent, name.as_bytes());
        reply_result!(result, reply, |r: ReplyEntry, attr| r.entry(&TTL, &attr, 0));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.ctx().do_mkdir(parent, name.as_bytes());
        reply_result!(result, reply, |r: ReplyEntry, attr| r.entry(&TTL, &attr, 0));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.ctx().do_unlink(parent, name.as_bytes());
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.ctx().do_rmdir(parent, name.as_bytes());
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self
            .ctx()
            .do_symlink(parent, link_name.as_bytes(), target.as_os_str().as_bytes());
        reply_result!(result, reply, |r: ReplyEntry, attr| r.entry(&TTL, &attr, 0));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .ctx()
            .do_rename(parent, name.as_bytes(), newparent, newname.as_bytes());
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.ctx().do_link(ino, newparent, newname.as_bytes());
        reply_result!(result, reply, |r: ReplyEntry, attr| r.entry(&TTL, &attr, 0));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self.ctx().do_open(ino, flags);
        reply_result!(result, reply, |r: ReplyOpen, fh| r.opened(fh, 0));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.ctx().do_read(ino, fh, offset.max(0) as u64, size);
        reply_result!(result, reply, |r: ReplyData, data: Vec<u8>| r.data(&data));
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.ctx().do_write(ino, fh, offset.max(0) as u64, data);
        reply_result!(result, reply, |r: ReplyWrite, n| r.written(n));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.ctx().do_release(ino, fh);
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let result = self.ctx().do_opendir(ino);
        reply_result!(result, reply, |r: ReplyOpen, fh| r.opened(fh, 0));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.ctx().do_readdir(ino, fh) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        for (i, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(child_ino, (i + 1) as i64, kind, OsStr::from_bytes(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let result = self.ctx().do_release(ino, fh);
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .ctx()
            .do_setxattr(ino, name.as_bytes(), value, flags);
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match self.ctx().do_getxattr(ino, name.as_bytes(), size) {
            Ok(XattrReply::Size(n)) => reply.size(n),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.ctx().do_listxattr(ino, size) {
            Ok(XattrReply::Size(n)) => reply.size(n),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.ctx().do_removexattr(ino, name.as_bytes());
        reply_result!(result, reply, |r: ReplyEmpty, ()| r.ok());
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permissions are synthesized, not enforced.
        reply.ok();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::archive::ArchiveProvider;
    use crate::archive::InMemoryArchive;
    use crate::image::ROOT_INO;
    use crate::staging::StagingDir;
    use std::ffi::OsStr as StdOsStr;

    impl MountContext {
        /// Inode number of a direct child of the root, for tests.
        pub(crate) fn resolve_ino(&self, name: &[u8]) -> u64 {
            let dentry = self
                .tree
                .lookup_child(ROOT_INO, name)
                .expect("test file exists");
            self.tree.dentry(dentry).ino
        }
    }

    pub(crate) fn context_with(
        archive: InMemoryArchive,
        readonly: bool,
        stream_interface: StreamInterface,
    ) -> (MountContext, tempfile::TempDir) {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = tempfile::tempdir().unwrap();
        let mut provider: Box<dyn ArchiveProvider> = Box::new(archive);
        let root = provider.load_metadata(1).unwrap();
        let mut blobs = BlobStore::new();
        let tree = ImageTree::load(&root, &mut blobs).unwrap();
        let staging = if readonly {
            None
        } else {
            Some(StagingDir::create(tmp.path(), StdOsStr::new("test.wim")).unwrap())
        };
        let ctx = MountContext {
            provider,
            image_index: 1,
            tree,
            blobs,
            staging,
            readonly,
            stream_interface,
            mount_flags: if readonly {
                MountFlags::empty()
            } else {
                MountFlags::READWRITE
            },
            mount_dir: tmp.path().to_path_buf(),
            lock: None,
            uid: 500,
            gid: 500,
            destroyed: false,
        };
        (ctx, tmp)
    }

    pub(crate) fn rw_context(archive: InMemoryArchive) -> (MountContext, tempfile::TempDir) {
        context_with(archive, false, StreamInterface::Xattr)
    }

    pub(crate) fn ro_context(archive: InMemoryArchive) -> (MountContext, tempfile::TempDir) {
        context_with(archive, true, StreamInterface::Xattr)
    }

    /// Checks the universal store invariants: every blob's reference
    /// count equals the summed link counts of the inodes whose streams
    /// point at it, dead blobs are absent, and each staged blob is backed
    /// by exactly one scratch file of the right size.
    pub(crate) fn assert_store_invariants(ctx: &MountContext) {
        let mut expected: std::collections::HashMap<crate::blob::BlobId, u32> =
            std::collections::HashMap::new();
        for inode in ctx.tree.inodes() {
            for stream in &inode.streams {
                if let Some(blob) = stream.blob {
                    *expected.entry(blob).or_insert(0) += inode.link_count;
                }
            }
        }
        ctx.blobs.for_each(|id, blob| {
            assert_eq!(
                blob.refcnt,
                expected.get(&id).copied().unwrap_or(0),
                "refcnt invariant violated for {:?}",
                blob.key
            );
            assert!(
                blob.refcnt > 0 || blob.open_fds > 0,
                "dead blob left in the store: {:?}",
                blob.key
            );
            if let Some(path) = blob.staging_path() {
                let meta = std::fs::metadata(path).expect("staged blob has a scratch file");
                assert_eq!(meta.len(), blob.resource_size().unwrap());
            }
        });
    }
}
