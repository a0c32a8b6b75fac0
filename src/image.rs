//! The in-memory tree of a mounted image: dentries, inodes, streams, and
//! the per-inode open-file table.
//!
//! Dentries and inodes live in arenas and refer to each other through
//! typed ids, never pointers. An inode may be aliased by `link_count`
//! dentries; directories are never aliased, so a directory inode maps back
//! to exactly one dentry.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;

use smallvec::SmallVec;
use smallvec::smallvec;

use crate::archive::BlobSource;
use crate::archive::DentrySpec;
use crate::archive::FileAttributes;
use crate::archive::REPARSE_TAG_SYMLINK;
use crate::blob::Blob;
use crate::blob::BlobId;
use crate::blob::BlobKey;
use crate::blob::BlobLocation;
use crate::blob::BlobStore;
use crate::error::MountError;
use crate::time::now_ticks;

/// Inode number of the image root, as required by the filesystem host.
pub(crate) const ROOT_INO: u64 = 1;

/// Handle slots are grown this many at a time.
const FDS_PER_ALLOC: usize = 8;
/// Hard cap on concurrently open handles per inode.
const MAX_FDS: usize = 0xffff;
/// Hard cap on alternate data streams per inode, which also keeps stream
/// ids encodable in the synthetic-inode scheme.
pub(crate) const MAX_ADS: u32 = 0xffff;

/// Stable handle to a dentry in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DentryId(u32);

/// A (name → inode) edge under a parent directory.
#[derive(Debug)]
pub(crate) struct Dentry {
    pub(crate) name: Vec<u8>,
    pub(crate) parent: Option<DentryId>,
    pub(crate) ino: u64,
    /// Children keyed by case-preserving byte name.
    pub(crate) children: BTreeMap<Vec<u8>, DentryId>,
}

/// One stream of an inode. Stream 0 is the unnamed stream; alternate data
/// streams have stable nonzero ids that survive reordering.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) name: Option<Vec<u8>>,
    pub(crate) blob: Option<BlobId>,
}

/// An open handle on `(inode, stream)`.
#[derive(Debug)]
pub(crate) struct OpenFd {
    pub(crate) stream_id: u32,
    /// Blob observed at open (or rebind) time.
    pub(crate) blob: Option<BlobId>,
    /// Read/write descriptor on the staging file, if the blob is staged.
    pub(crate) staging_file: Option<File>,
    /// Whether this handle is counted in the blob's `open_fds`.
    pub(crate) counted: bool,
}

#[derive(Debug)]
pub(crate) struct Inode {
    pub(crate) ino: u64,
    pub(crate) attributes: FileAttributes,
    pub(crate) reparse_tag: u32,
    pub(crate) creation_ticks: u64,
    pub(crate) last_write_ticks: u64,
    pub(crate) last_access_ticks: u64,
    pub(crate) link_count: u32,
    pub(crate) streams: SmallVec<[Stream; 1]>,
    next_stream_id: u32,
    fds: Vec<Option<OpenFd>>,
    pub(crate) num_open_fds: u16,
}

impl Inode {
    fn new(ino: u64, attributes: FileAttributes, ticks: u64) -> Inode {
        Inode {
            ino,
            attributes,
            reparse_tag: 0,
            creation_ticks: ticks,
            last_write_ticks: ticks,
            last_access_ticks: ticks,
            link_count: 1,
            streams: smallvec![Stream {
                id: 0,
                name: None,
                blob: None,
            }],
            next_stream_id: 1,
            fds: Vec::new(),
            num_open_fds: 0,
        }
    }

    pub(crate) fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    pub(crate) fn is_symlink(&self) -> bool {
        self.attributes.contains(FileAttributes::REPARSE_POINT)
            && self.reparse_tag == REPARSE_TAG_SYMLINK
    }

    pub(crate) fn is_reparse_point(&self) -> bool {
        self.attributes.contains(FileAttributes::REPARSE_POINT)
    }

    pub(crate) fn stream(&self, stream_id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == stream_id)
    }

    pub(crate) fn stream_mut(&mut self, stream_id: u32) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.id == stream_id)
    }

    /// Alternate data stream by name (stream 0 is never returned).
    pub(crate) fn ads_by_name(&self, name: &[u8]) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// Adds an alternate data stream with a fresh stable id.
    pub(crate) fn add_ads(&mut self, name: &[u8]) -> Result<u32, libc::c_int> {
        if self.next_stream_id > MAX_ADS {
            return Err(libc::ENOSPC);
        }
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.push(Stream {
            id,
            name: Some(name.to_vec()),
            blob: None,
        });
        Ok(id)
    }

    /// Removes an alternate data stream, returning its blob reference.
    pub(crate) fn remove_ads(&mut self, stream_id: u32) -> Option<BlobId> {
        debug_assert_ne!(stream_id, 0, "stream 0 cannot be removed");
        let idx = self.streams.iter().position(|s| s.id == stream_id)?;
        self.streams.remove(idx).blob
    }

    pub(crate) fn fd(&self, idx: u16) -> Option<&OpenFd> {
        self.fds.get(idx as usize)?.as_ref()
    }

    pub(crate) fn fd_mut(&mut self, idx: u16) -> Option<&mut OpenFd> {
        self.fds.get_mut(idx as usize)?.as_mut()
    }

    /// Allocates a handle slot, growing the table in chunks up to the cap.
    /// The caller has already decided whether the handle is counted in the
    /// blob's open-handle count.
    pub(crate) fn alloc_fd(&mut self, fd: OpenFd) -> Result<u16, libc::c_int> {
        if self.num_open_fds as usize == self.fds.len() {
            if self.fds.len() == MAX_FDS {
                return Err(libc::EMFILE);
            }
            let grow = FDS_PER_ALLOC.min(MAX_FDS - self.fds.len());
            self.fds.reserve(grow);
            for _ in 0..grow {
                self.fds.push(None);
            }
        }
        for (i, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fd);
                self.num_open_fds += 1;
                return Ok(i as u16);
            }
        }
        unreachable!("a free handle slot must exist after growth");
    }

    /// Releases a handle slot, returning the handle for the caller to
    /// settle its blob accounting.
    pub(crate) fn take_fd(&mut self, idx: u16) -> Option<OpenFd> {
        let fd = self.fds.get_mut(idx as usize)?.take()?;
        debug_assert!(self.num_open_fds > 0);
        self.num_open_fds -= 1;
        Some(fd)
    }

    /// Slot indices of all live handles.
    pub(crate) fn open_fd_indices(&self) -> Vec<u16> {
        self.fds
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| i as u16)
            .collect()
    }
}

/// The mounted image: dentry tree plus inode table.
#[derive(Debug)]
pub(crate) struct ImageTree {
    inodes: HashMap<u64, Inode>,
    dentries: Vec<Option<Dentry>>,
    free_dentries: Vec<DentryId>,
    root: DentryId,
    /// Directory inode → its unique dentry.
    dir_dentry: HashMap<u64, DentryId>,
    next_ino: u64,
}

impl ImageTree {
    /// Builds the tree from provider metadata, creating blob descriptors
    /// in `blobs`. Blob references are added through the pending counter
    /// so a half-built tree can be rolled back on error.
    pub(crate) fn load(spec: &DentrySpec, blobs: &mut BlobStore) -> Result<ImageTree, MountError> {
        let mut tree = ImageTree {
            inodes: HashMap::new(),
            dentries: Vec::new(),
            free_dentries: Vec::new(),
            root: DentryId(0),
            dir_dentry: HashMap::new(),
            next_ino: ROOT_INO,
        };

        let mut root_inode = Inode::new(tree.alloc_ino(), spec.attributes, spec.creation_ticks);
        root_inode.attributes |= FileAttributes::DIRECTORY;
        root_inode.last_write_ticks = spec.last_write_ticks;
        root_inode.last_access_ticks = spec.last_access_ticks;
        let root_ino = root_inode.ino;
        tree.inodes.insert(root_ino, root_inode);
        tree.root = tree.attach_dentry(Vec::new(), None, root_ino);
        tree.dir_dentry.insert(root_ino, tree.root);

        let mut link_groups: HashMap<u64, u64> = HashMap::new();
        let result = (|| {
            for child in &spec.children {
                tree.load_dentry(child, tree.root, blobs, &mut link_groups)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                blobs.commit_pending();
                Ok(tree)
            }
            Err(e) => {
                blobs.rollback_pending();
                Err(e)
            }
        }
    }

    fn load_dentry(
        &mut self,
        spec: &DentrySpec,
        parent: DentryId,
        blobs: &mut BlobStore,
        link_groups: &mut HashMap<u64, u64>,
    ) -> Result<(), MountError> {
        if spec.name.is_empty() || spec.name.contains(&b'/') {
            return Err(MountError::InvalidParam);
        }
        let parent_ino = self.dentry(parent).ino;
        if self.lookup_child(parent_ino, &spec.name).is_some() {
            return Err(MountError::InvalidParam);
        }

        let ino = match link_groups.get(&spec.hard_link_group) {
            Some(&ino) if spec.hard_link_group != 0 => {
                // Another dentry for an inode we already built: one more
                // reference to each of its stream blobs.
                let inode = self
                    .inodes
                    .get_mut(&ino)
                    .expect("hard link group maps to a live inode");
                inode.link_count += 1;
                let referenced: Vec<BlobId> =
                    inode.streams.iter().filter_map(|s| s.blob).collect();
                for blob in referenced {
                    blobs.add_pending_refs(blob, 1);
                }
                ino
            }
            _ => {
                let ino = self.alloc_ino();
                let mut inode = Inode::new(ino, spec.attributes, spec.creation_ticks);
                inode.reparse_tag = spec.reparse_tag;
                inode.last_write_ticks = spec.last_write_ticks;
                inode.last_access_ticks = spec.last_access_ticks;
                for stream_spec in &spec.streams {
                    let blob = match &stream_spec.source {
                        Some(source) => Some(Self::load_blob(source, blobs)),
                        None => None,
                    };
                    match &stream_spec.name {
                        None => {
                            inode.stream_mut(0).expect("stream 0 always exists").blob = blob;
                        }
                        Some(name) => {
                            let id = inode
                                .add_ads(name)
                                .map_err(|_| MountError::InvalidParam)?;
                            inode.stream_mut(id).expect("just added").blob = blob;
                        }
                    }
                }
                if spec.hard_link_group != 0 {
                    link_groups.insert(spec.hard_link_group, ino);
                }
                self.inodes.insert(ino, inode);
                ino
            }
        };

        let dentry = self.attach_dentry(spec.name.clone(), Some(parent), ino);
        if self.inode(ino).expect("just inserted").is_directory() {
            self.dir_dentry.insert(ino, dentry);
            for child in &spec.children {
                self.load_dentry(child, dentry, blobs, link_groups)?;
            }
        } else if !spec.children.is_empty() {
            return Err(MountError::InvalidParam);
        }
        Ok(())
    }

    fn load_blob(source: &BlobSource, blobs: &mut BlobStore) -> BlobId {
        let digest = source.digest();
        let id = match blobs.lookup_content(&digest) {
            Some(id) => id,
            None => {
                let location = match source {
                    BlobSource::Archive { size, .. } => BlobLocation::InArchive { size: *size },
                    BlobSource::File { path, size, .. } => BlobLocation::InFileOnDisk {
                        path: path.clone(),
                        size: *size,
                    },
                    BlobSource::Buffer { bytes, .. } => {
                        BlobLocation::InAttachedBuffer(bytes.clone())
                    }
                };
                blobs.insert(Blob {
                    key: BlobKey::Content(digest),
                    location,
                    refcnt: 0,
                    pending_refcnt: 0,
                    open_fds: 0,
                    owner_ino: None,
                })
            }
        };
        blobs.add_pending_refs(id, 1);
        id
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn attach_dentry(&mut self, name: Vec<u8>, parent: Option<DentryId>, ino: u64) -> DentryId {
        let dentry = Dentry {
            name: name.clone(),
            parent,
            ino,
            children: BTreeMap::new(),
        };
        let id = match self.free_dentries.pop() {
            Some(id) => {
                self.dentries[id.0 as usize] = Some(dentry);
                id
            }
            None => {
                self.dentries.push(Some(dentry));
                DentryId((self.dentries.len() - 1) as u32)
            }
        };
        if let Some(parent) = parent {
            self.dentry_mut(parent).children.insert(name, id);
        }
        id
    }

    pub(crate) fn root(&self) -> DentryId {
        self.root
    }

    pub(crate) fn dentry(&self, id: DentryId) -> &Dentry {
        self.dentries[id.0 as usize]
            .as_ref()
            .expect("dangling DentryId")
    }

    fn dentry_mut(&mut self, id: DentryId) -> &mut Dentry {
        self.dentries[id.0 as usize]
            .as_mut()
            .expect("dangling DentryId")
    }

    pub(crate) fn inode(&self, ino: u64) -> Option<&Inode> {
        self.inodes.get(&ino)
    }

    pub(crate) fn inodes(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.values()
    }

    pub(crate) fn inode_mut(&mut self, ino: u64) -> Option<&mut Inode> {
        self.inodes.get_mut(&ino)
    }

    /// The unique dentry of a directory inode.
    pub(crate) fn dir_dentry_of(&self, ino: u64) -> Option<DentryId> {
        self.dir_dentry.get(&ino).copied()
    }

    /// Resolves one name under a directory inode.
    pub(crate) fn lookup_child(&self, dir_ino: u64, name: &[u8]) -> Option<DentryId> {
        let dir = self.dir_dentry_of(dir_ino)?;
        self.dentry(dir).children.get(name).copied()
    }

    /// Inode number of the parent directory (self for the root).
    pub(crate) fn parent_ino(&self, dentry: DentryId) -> u64 {
        match self.dentry(dentry).parent {
            Some(parent) => self.dentry(parent).ino,
            None => self.dentry(dentry).ino,
        }
    }

    /// Children of a directory inode in stored order.
    pub(crate) fn children_of(&self, dir_ino: u64) -> Option<Vec<(Vec<u8>, u64)>> {
        let dir = self.dir_dentry_of(dir_ino)?;
        Some(
            self.dentry(dir)
                .children
                .values()
                .map(|&child| {
                    let d = self.dentry(child);
                    (d.name.clone(), d.ino)
                })
                .collect(),
        )
    }

    /// Creates a new inode with a single dentry under `dir_ino`.
    pub(crate) fn create_child(
        &mut self,
        dir_ino: u64,
        name: &[u8],
        attributes: FileAttributes,
    ) -> Result<u64, libc::c_int> {
        let parent = match self.inode(dir_ino) {
            Some(inode) if inode.is_directory() => {
                self.dir_dentry_of(dir_ino).ok_or(libc::ENOENT)?
            }
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        };
        if name.is_empty() || name.contains(&b'/') {
            return Err(libc::EINVAL);
        }
        if self.dentry(parent).children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        let ino = self.alloc_ino();
        let inode = Inode::new(ino, attributes, now_ticks());
        let is_dir = inode.is_directory();
        self.inodes.insert(ino, inode);
        let dentry = self.attach_dentry(name.to_vec(), Some(parent), ino);
        if is_dir {
            self.dir_dentry.insert(ino, dentry);
        }
        Ok(ino)
    }

    /// Adds a dentry aliasing an existing inode (hard link). The caller
    /// has already bumped the blob references.
    pub(crate) fn add_link(
        &mut self,
        dir_ino: u64,
        name: &[u8],
        target_ino: u64,
    ) -> Result<(), libc::c_int> {
        let parent = match self.inode(dir_ino) {
            Some(inode) if inode.is_directory() => {
                self.dir_dentry_of(dir_ino).ok_or(libc::ENOENT)?
            }
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        };
        if self.dentry(parent).children.contains_key(name) {
            return Err(libc::EEXIST);
        }
        self.inode_mut(target_ino).ok_or(libc::ENOENT)?.link_count += 1;
        self.attach_dentry(name.to_vec(), Some(parent), target_ino);
        Ok(())
    }

    /// Removes a dentry: drops one reference to each of the inode's stream
    /// blobs, unlinks the dentry, and frees the inode once it has neither
    /// links nor open handles.
    pub(crate) fn remove_dentry(&mut self, id: DentryId, blobs: &mut BlobStore) {
        let ino = self.dentry(id).ino;
        let referenced: Vec<BlobId> = {
            let inode = self.inodes.get(&ino).expect("dentry points at an inode");
            inode.streams.iter().filter_map(|s| s.blob).collect()
        };
        for blob in referenced {
            blobs.release_stream_refs(blob, 1);
        }

        self.detach_dentry(id);
        let dentry = self.dentries[id.0 as usize].take().expect("live dentry");
        debug_assert!(dentry.children.is_empty(), "removing a non-empty dentry");
        self.free_dentries.push(id);

        let inode = self.inodes.get_mut(&ino).expect("live inode");
        inode.link_count -= 1;
        if inode.is_directory() {
            self.dir_dentry.remove(&ino);
        }
        self.maybe_free_inode(ino);
    }

    fn detach_dentry(&mut self, id: DentryId) {
        let (parent, name) = {
            let d = self.dentry(id);
            (d.parent, d.name.clone())
        };
        if let Some(parent) = parent {
            self.dentry_mut(parent).children.remove(&name);
        }
    }

    /// Frees an inode with no remaining dentries or handles (unlink-while-
    /// open semantics: the last `release` finishes the job).
    pub(crate) fn maybe_free_inode(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get(&ino) {
            if inode.link_count == 0 && inode.num_open_fds == 0 {
                self.inodes.remove(&ino);
            }
        }
    }

    /// Moves `name` under `dir_ino` to `newname` under `newdir_ino`,
    /// displacing a permissible existing target.
    pub(crate) fn rename(
        &mut self,
        dir_ino: u64,
        name: &[u8],
        newdir_ino: u64,
        newname: &[u8],
        blobs: &mut BlobStore,
    ) -> Result<(), libc::c_int> {
        let src = self.lookup_child(dir_ino, name).ok_or(libc::ENOENT)?;
        let src_is_dir = self
            .inode(self.dentry(src).ino)
            .ok_or(libc::ENOENT)?
            .is_directory();

        let new_parent = match self.inode(newdir_ino) {
            Some(inode) if inode.is_directory() => {
                self.dir_dentry_of(newdir_ino).ok_or(libc::ENOENT)?
            }
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        };

        if let Some(dst) = self.dentry(new_parent).children.get(newname).copied() {
            if dst == src {
                return Ok(());
            }
            let dst_inode = self.inode(self.dentry(dst).ino).ok_or(libc::ENOENT)?;
            let dst_is_dir = dst_inode.is_directory();
            if !src_is_dir && dst_is_dir {
                return Err(libc::EISDIR);
            }
            if src_is_dir {
                if !dst_is_dir {
                    return Err(libc::ENOTDIR);
                }
                if !self.dentry(dst).children.is_empty() {
                    return Err(libc::ENOTEMPTY);
                }
            }
            self.remove_dentry(dst, blobs);
        }

        self.detach_dentry(src);
        let new_parent = self
            .dir_dentry_of(newdir_ino)
            .expect("directory checked above");
        {
            let d = self.dentry_mut(src);
            d.name = newname.to_vec();
            d.parent = Some(new_parent);
        }
        self.dentry_mut(new_parent)
            .children
            .insert(newname.to_vec(), src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn sample_spec() -> (DentrySpec, Digest) {
        let digest = Digest::of_bytes(b"Hello, World!");
        let mut root = DentrySpec::directory(b"");
        root.children.push(DentrySpec::file(
            b"hello.txt",
            Some(BlobSource::Archive { digest, size: 13 }),
        ));
        let mut subdir = DentrySpec::directory(b"sub");
        subdir
            .children
            .push(DentrySpec::file(b"empty", None));
        root.children.push(subdir);
        (root, digest)
    }

    #[test]
    fn load_assigns_root_ino_first() {
        let (spec, _) = sample_spec();
        let mut blobs = BlobStore::new();
        let tree = ImageTree::load(&spec, &mut blobs).unwrap();
        assert_eq!(tree.dentry(tree.root()).ino, ROOT_INO);
        assert!(tree.inode(ROOT_INO).unwrap().is_directory());
    }

    #[test]
    fn load_resolves_blobs_and_commits_refs() {
        let (spec, digest) = sample_spec();
        let mut blobs = BlobStore::new();
        let tree = ImageTree::load(&spec, &mut blobs).unwrap();

        let file = tree.lookup_child(ROOT_INO, b"hello.txt").unwrap();
        let inode = tree.inode(tree.dentry(file).ino).unwrap();
        let blob = inode.stream(0).unwrap().blob.unwrap();
        assert_eq!(blobs.lookup_content(&digest), Some(blob));
        assert_eq!(blobs.get(blob).refcnt, 1);
        assert_eq!(blobs.get(blob).pending_refcnt, 0);
    }

    #[test]
    fn hard_link_group_shares_inode() {
        let digest = Digest::of_bytes(b"shared");
        let mut root = DentrySpec::directory(b"");
        for name in [b"x".as_slice(), b"y".as_slice()] {
            let mut f = DentrySpec::file(name, Some(BlobSource::Archive { digest, size: 6 }));
            f.hard_link_group = 42;
            root.children.push(f);
        }
        let mut blobs = BlobStore::new();
        let tree = ImageTree::load(&root, &mut blobs).unwrap();

        let x = tree.dentry(tree.lookup_child(ROOT_INO, b"x").unwrap()).ino;
        let y = tree.dentry(tree.lookup_child(ROOT_INO, b"y").unwrap()).ino;
        assert_eq!(x, y);
        let inode = tree.inode(x).unwrap();
        assert_eq!(inode.link_count, 2);
        let blob = inode.stream(0).unwrap().blob.unwrap();
        assert_eq!(blobs.get(blob).refcnt, 2);
    }

    #[test]
    fn duplicate_names_roll_back_blob_refs() {
        let digest = Digest::of_bytes(b"dup");
        let mut root = DentrySpec::directory(b"");
        root.children.push(DentrySpec::file(
            b"a",
            Some(BlobSource::Archive { digest, size: 3 }),
        ));
        root.children.push(DentrySpec::file(
            b"a",
            Some(BlobSource::Archive { digest, size: 3 }),
        ));
        let mut blobs = BlobStore::new();
        assert!(ImageTree::load(&root, &mut blobs).is_err());
        assert_eq!(blobs.lookup_content(&digest), None);
    }

    #[test]
    fn fd_table_grows_in_chunks_and_caps() {
        let mut inode = Inode::new(7, FileAttributes::NORMAL, 0);
        for expected in 0..16u16 {
            let idx = inode
                .alloc_fd(OpenFd {
                    stream_id: 0,
                    blob: None,
                    staging_file: None,
                    counted: false,
                })
                .unwrap();
            assert_eq!(idx, expected);
        }
        assert_eq!(inode.num_open_fds, 16);
        // Free a low slot and observe first-fit reuse.
        inode.take_fd(3).unwrap();
        let idx = inode
            .alloc_fd(OpenFd {
                stream_id: 0,
                blob: None,
                staging_file: None,
                counted: false,
            })
            .unwrap();
        assert_eq!(idx, 3);
    }

    #[test]
    fn rename_rules() {
        let (spec, _) = sample_spec();
        let mut blobs = BlobStore::new();
        let mut tree = ImageTree::load(&spec, &mut blobs).unwrap();
        let sub_ino = tree.dentry(tree.lookup_child(ROOT_INO, b"sub").unwrap()).ino;

        // file onto directory
        assert_eq!(
            tree.rename(ROOT_INO, b"hello.txt", ROOT_INO, b"sub", &mut blobs),
            Err(libc::EISDIR)
        );
        // directory onto file
        assert_eq!(
            tree.rename(ROOT_INO, b"sub", sub_ino, b"empty", &mut blobs),
            Err(libc::ENOTDIR)
        );
        // directory onto itself
        assert_eq!(tree.rename(ROOT_INO, b"sub", ROOT_INO, b"sub", &mut blobs), Ok(()));
        // plain move
        tree.rename(ROOT_INO, b"hello.txt", sub_ino, b"hi", &mut blobs)
            .unwrap();
        assert!(tree.lookup_child(ROOT_INO, b"hello.txt").is_none());
        assert!(tree.lookup_child(sub_ino, b"hi").is_some());
    }

    #[test]
    fn remove_dentry_frees_inode_and_blob() {
        let (spec, digest) = sample_spec();
        let mut blobs = BlobStore::new();
        let mut tree = ImageTree::load(&spec, &mut blobs).unwrap();
        let dentry = tree.lookup_child(ROOT_INO, b"hello.txt").unwrap();
        let ino = tree.dentry(dentry).ino;
        tree.remove_dentry(dentry, &mut blobs);
        assert!(tree.inode(ino).is_none());
        assert_eq!(blobs.lookup_content(&digest), None);
    }

    #[test]
    fn unlinked_inode_survives_until_last_close() {
        let (spec, _) = sample_spec();
        let mut blobs = BlobStore::new();
        let mut tree = ImageTree::load(&spec, &mut blobs).unwrap();
        let dentry = tree.lookup_child(ROOT_INO, b"hello.txt").unwrap();
        let ino = tree.dentry(dentry).ino;

        let idx = tree
            .inode_mut(ino)
            .unwrap()
            .alloc_fd(OpenFd {
                stream_id: 0,
                blob: None,
                staging_file: None,
                counted: false,
            })
            .unwrap();
        tree.remove_dentry(dentry, &mut blobs);
        assert!(tree.inode(ino).is_some(), "open handle keeps the inode");

        tree.inode_mut(ino).unwrap().take_fd(idx).unwrap();
        tree.maybe_free_inode(ino);
        assert!(tree.inode(ino).is_none());
    }
}
