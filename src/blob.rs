//! The content-addressed blob store.
//!
//! Every stream payload in the mounted image is represented by a blob
//! descriptor owned by [`BlobStore`]. Descriptors are reference-counted:
//! each inode-to-blob edge contributes the owning inode's link count, and a
//! descriptor whose reference count and open-handle count both reach zero
//! is dropped (unlinking its staging file if it had one).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::debug;
use log::warn;

use crate::digest::Digest;

/// Stable handle to a blob descriptor in the store's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlobId(u32);

/// Index key of a blob descriptor.
///
/// Content digests and staging placeholders are separate keyspaces, so a
/// freshly staged blob (which has no content digest yet) can never shadow
/// an archive blob during the window before the commit rehash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BlobKey {
    /// SHA-1 of the payload.
    Content(Digest),
    /// Placeholder for a staging file that has not been hashed yet.
    Staging(u64),
}

/// Where a blob's payload currently lives.
#[derive(Debug)]
pub(crate) enum BlobLocation {
    /// Inside the archive; decoded by the provider on demand.
    InArchive { size: u64 },
    /// In a staging file that may still be written through open handles.
    InStagingFile { path: PathBuf },
    /// In memory (symlink targets, xattr values).
    InAttachedBuffer(Vec<u8>),
    /// In a finalized file on disk, hashed and sized by the commit rehash.
    InFileOnDisk { path: PathBuf, size: u64 },
}

#[derive(Debug)]
pub(crate) struct Blob {
    pub(crate) key: BlobKey,
    pub(crate) location: BlobLocation,
    /// Authoritative logical reference count (sum of link counts of the
    /// inodes whose streams point here).
    pub(crate) refcnt: u32,
    /// References added by an in-flight bulk operation, so a failed
    /// half-done operation can be undone by subtraction.
    pub(crate) pending_refcnt: u32,
    /// Live handles observing this blob (excluding read-only archive reads
    /// on a read-only mount).
    pub(crate) open_fds: u16,
    /// Inode owning the staging copy; meaningful only while staged.
    pub(crate) owner_ino: Option<u64>,
}

impl Blob {
    /// Payload size. Staged blobs are sized by their scratch file.
    pub(crate) fn resource_size(&self) -> io::Result<u64> {
        match &self.location {
            BlobLocation::InArchive { size } => Ok(*size),
            BlobLocation::InStagingFile { path } => Ok(fs::metadata(path)?.len()),
            BlobLocation::InAttachedBuffer(bytes) => Ok(bytes.len() as u64),
            BlobLocation::InFileOnDisk { size, .. } => Ok(*size),
        }
    }

    pub(crate) fn is_staged(&self) -> bool {
        matches!(self.location, BlobLocation::InStagingFile { .. })
    }

    pub(crate) fn staging_path(&self) -> Option<&PathBuf> {
        match &self.location {
            BlobLocation::InStagingFile { path } => Some(path),
            _ => None,
        }
    }
}

/// Arena of blob descriptors indexed by [`BlobKey`].
#[derive(Debug, Default)]
pub(crate) struct BlobStore {
    arena: Vec<Option<Blob>>,
    free: Vec<BlobId>,
    index: HashMap<BlobKey, BlobId>,
    /// Blobs with staging files, in creation order.
    staging: Vec<BlobId>,
    next_staging_serial: u64,
}

impl BlobStore {
    pub(crate) fn new() -> BlobStore {
        BlobStore::default()
    }

    /// A fresh placeholder key for a new staging blob.
    pub(crate) fn next_staging_key(&mut self) -> BlobKey {
        let serial = self.next_staging_serial;
        self.next_staging_serial += 1;
        BlobKey::Staging(serial)
    }

    /// Inserts a descriptor, indexing it by its key.
    ///
    /// No two descriptors may share a key, except transiently inside the
    /// commit rehash, which unlinks before re-inserting.
    pub(crate) fn insert(&mut self, blob: Blob) -> BlobId {
        debug_assert!(
            !self.index.contains_key(&blob.key),
            "duplicate blob key {:?}",
            blob.key
        );
        let key = blob.key;
        let staged = blob.is_staged();
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id.0 as usize] = Some(blob);
                id
            }
            None => {
                self.arena.push(Some(blob));
                BlobId((self.arena.len() - 1) as u32)
            }
        };
        self.index.insert(key, id);
        if staged {
            self.staging.push(id);
        }
        id
    }

    pub(crate) fn get(&self, id: BlobId) -> &Blob {
        self.arena[id.0 as usize].as_ref().expect("dangling BlobId")
    }

    pub(crate) fn get_mut(&mut self, id: BlobId) -> &mut Blob {
        self.arena[id.0 as usize].as_mut().expect("dangling BlobId")
    }

    pub(crate) fn lookup(&self, key: &BlobKey) -> Option<BlobId> {
        self.index.get(key).copied()
    }

    /// Looks up a blob by content digest. Staging placeholders live in a
    /// different keyspace and are never returned.
    pub(crate) fn lookup_content(&self, digest: &Digest) -> Option<BlobId> {
        self.lookup(&BlobKey::Content(*digest))
    }

    /// Removes the descriptor from the index without freeing it. Used
    /// while a staging file is re-keyed under its real digest.
    pub(crate) fn unlink(&mut self, id: BlobId) {
        let key = self.get(id).key;
        let removed = self.index.remove(&key);
        debug_assert_eq!(removed, Some(id));
    }

    /// Re-keys an unlinked descriptor and puts it back in the index.
    pub(crate) fn relink(&mut self, id: BlobId, key: BlobKey) {
        debug_assert!(!self.index.contains_key(&key), "duplicate blob key {key:?}");
        self.get_mut(id).key = key;
        self.index.insert(key, id);
    }

    /// Frees a descriptor outright, dropping it from the index and the
    /// staging list. The staging file (if any) is left alone.
    pub(crate) fn free(&mut self, id: BlobId) {
        let blob = self.arena[id.0 as usize].take().expect("dangling BlobId");
        if self.index.get(&blob.key) == Some(&id) {
            self.index.remove(&blob.key);
        }
        self.staging.retain(|sid| *sid != id);
        self.free.push(id);
    }

    /// Ids of all staged blobs, in creation order.
    pub(crate) fn staging_blobs(&self) -> Vec<BlobId> {
        self.staging.clone()
    }

    /// Registers an existing descriptor on the staging list after its
    /// location moved into a staging file.
    pub(crate) fn note_staged(&mut self, id: BlobId) {
        debug_assert!(self.get(id).is_staged());
        if !self.staging.contains(&id) {
            self.staging.push(id);
        }
    }

    /// Takes a descriptor back off the staging list (rollback or rehash).
    pub(crate) fn unstage(&mut self, id: BlobId) {
        self.staging.retain(|sid| *sid != id);
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(BlobId, &Blob)) {
        for (i, slot) in self.arena.iter().enumerate() {
            if let Some(blob) = slot {
                f(BlobId(i as u32), blob);
            }
        }
    }

    /// Adds stream references as part of a bulk operation; the pending
    /// counter remembers how many can be rolled back.
    pub(crate) fn add_pending_refs(&mut self, id: BlobId, n: u32) {
        let blob = self.get_mut(id);
        blob.refcnt += n;
        blob.pending_refcnt += n;
    }

    /// Finalizes a successful bulk operation: pending counters are zeroed.
    pub(crate) fn commit_pending(&mut self) {
        for slot in self.arena.iter_mut().flatten() {
            slot.pending_refcnt = 0;
        }
    }

    /// Undoes a failed bulk operation by subtracting every pending count;
    /// descriptors that drop to zero references are freed.
    pub(crate) fn rollback_pending(&mut self) {
        let mut dead = Vec::new();
        for (i, slot) in self.arena.iter_mut().enumerate() {
            if let Some(blob) = slot {
                blob.refcnt -= blob.pending_refcnt;
                blob.pending_refcnt = 0;
                if blob.refcnt == 0 && blob.open_fds == 0 {
                    dead.push(BlobId(i as u32));
                }
            }
        }
        for id in dead {
            self.release_if_dead(id);
        }
    }

    /// Drops `n` stream references from the blob, deleting it (and its
    /// staging file) once nothing references it and no handle is open.
    /// Returns true if the descriptor was freed.
    pub(crate) fn release_stream_refs(&mut self, id: BlobId, n: u32) -> bool {
        let blob = self.get_mut(id);
        debug_assert!(blob.refcnt >= n, "refcnt underflow");
        blob.refcnt -= n;
        self.release_if_dead(id)
    }

    /// Notes a new open handle observing the blob.
    pub(crate) fn fd_opened(&mut self, id: BlobId) {
        self.get_mut(id).open_fds += 1;
    }

    /// Notes a closed handle; the blob may become dead.
    pub(crate) fn fd_closed(&mut self, id: BlobId) -> bool {
        let blob = self.get_mut(id);
        debug_assert!(blob.open_fds > 0, "open fd count underflow");
        blob.open_fds -= 1;
        self.release_if_dead(id)
    }

    fn release_if_dead(&mut self, id: BlobId) -> bool {
        let blob = self.get(id);
        if blob.refcnt > 0 || blob.open_fds > 0 {
            return false;
        }
        if let Some(path) = blob.staging_path() {
            debug!("unlinking dead staging file {path:?}");
            if let Err(e) = fs::remove_file(path) {
                warn!("failed to unlink staging file {path:?}: {e}");
            }
        }
        self.free(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_blob(digest: Digest, size: u64, refcnt: u32) -> Blob {
        Blob {
            key: BlobKey::Content(digest),
            location: BlobLocation::InArchive { size },
            refcnt,
            pending_refcnt: 0,
            open_fds: 0,
            owner_ino: None,
        }
    }

    #[test]
    fn lookup_by_content_digest() {
        let mut store = BlobStore::new();
        let digest = Digest::of_bytes(b"payload");
        let id = store.insert(archive_blob(digest, 7, 1));
        assert_eq!(store.lookup_content(&digest), Some(id));
        assert_eq!(store.lookup_content(&Digest::of_bytes(b"other")), None);
    }

    #[test]
    fn staging_placeholders_never_shadow_content() {
        let mut store = BlobStore::new();
        let digest = Digest::of_bytes(b"payload");
        store.insert(archive_blob(digest, 7, 1));
        let key = store.next_staging_key();
        let staged = store.insert(Blob {
            key,
            location: BlobLocation::InArchive { size: 0 },
            refcnt: 1,
            pending_refcnt: 0,
            open_fds: 0,
            owner_ino: Some(2),
        });
        // Content lookups see only the content keyspace.
        assert_ne!(store.lookup_content(&digest), Some(staged));
        assert_eq!(store.lookup(&key), Some(staged));
    }

    #[test]
    fn refcnt_zero_with_open_fd_keeps_blob() {
        let mut store = BlobStore::new();
        let id = store.insert(archive_blob(Digest::of_bytes(b"x"), 1, 1));
        store.fd_opened(id);
        assert!(!store.release_stream_refs(id, 1));
        assert_eq!(store.get(id).refcnt, 0);
        // Last close reaps it.
        assert!(store.fd_closed(id));
        assert_eq!(store.lookup_content(&Digest::of_bytes(b"x")), None);
    }

    #[test]
    fn staged_blob_release_unlinks_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        std::fs::write(&path, b"data").unwrap();

        let mut store = BlobStore::new();
        let key = store.next_staging_key();
        let id = store.insert(Blob {
            key,
            location: BlobLocation::InStagingFile { path: path.clone() },
            refcnt: 1,
            pending_refcnt: 0,
            open_fds: 0,
            owner_ino: Some(5),
        });
        assert_eq!(store.staging_blobs(), vec![id]);
        assert!(store.release_stream_refs(id, 1));
        assert!(!path.exists());
        assert!(store.staging_blobs().is_empty());
    }

    #[test]
    fn pending_rollback_undoes_bulk_refs() {
        let mut store = BlobStore::new();
        let id = store.insert(archive_blob(Digest::of_bytes(b"x"), 1, 0));
        store.add_pending_refs(id, 2);
        assert_eq!(store.get(id).refcnt, 2);
        store.rollback_pending();
        // All references were pending, so the blob is gone.
        assert_eq!(store.lookup_content(&Digest::of_bytes(b"x")), None);
    }

    #[test]
    fn pending_commit_keeps_refs() {
        let mut store = BlobStore::new();
        let id = store.insert(archive_blob(Digest::of_bytes(b"x"), 1, 0));
        store.add_pending_refs(id, 2);
        store.commit_pending();
        assert_eq!(store.get(id).refcnt, 2);
        assert_eq!(store.get(id).pending_refcnt, 0);
    }

    #[test]
    fn rekey_window() {
        let mut store = BlobStore::new();
        let key = store.next_staging_key();
        let id = store.insert(Blob {
            key,
            location: BlobLocation::InArchive { size: 3 },
            refcnt: 1,
            pending_refcnt: 0,
            open_fds: 0,
            owner_ino: None,
        });
        store.unlink(id);
        assert_eq!(store.lookup(&key), None);
        let digest = Digest::of_bytes(b"abc");
        store.relink(id, BlobKey::Content(digest));
        assert_eq!(store.lookup_content(&digest), Some(id));
    }
}
