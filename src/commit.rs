//! The commit pipeline: fold staged modifications back into the archive.
//!
//! Runs inside the daemon when a committing unmount is requested. Order
//! matters: every staged blob's handles are closed first (a scratch file
//! must not be mutating while it is hashed), then each staging file is
//! hashed and folded into the content keyspace (merging duplicates,
//! detaching emptied streams), and only then is the archive writer given
//! the final image state.

use log::debug;
use log::warn;

use crate::archive::ArchiveProvider as _;
use crate::archive::BlobSource;
use crate::archive::DentrySpec;
use crate::archive::StreamSpec;
use crate::archive::WriteFlags;
use crate::blob::BlobId;
use crate::blob::BlobKey;
use crate::blob::BlobLocation;
use crate::digest::Digest;
use crate::error::MountError;
use crate::fs::MountContext;
use crate::image::DentryId;

pub(crate) fn commit_changes(
    ctx: &mut MountContext,
    write_flags: WriteFlags,
) -> Result<(), MountError> {
    debug!("closing all staging file descriptors");
    for blob in ctx.blobs.staging_blobs() {
        let owner = ctx.blobs.get(blob).owner_ino;
        if let Some(ino) = owner {
            close_inode_fds(ctx, ino);
        }
    }

    debug!("hashing staging files");
    // Closing handles may already have reaped unlinked blobs, so the list
    // is re-read after the drain.
    for blob in ctx.blobs.staging_blobs() {
        rehash_staged_blob(ctx, blob)?;
    }

    let root = build_image_spec(ctx);
    let image = ctx.image_index;
    ctx.provider
        .commit(image, &root, write_flags)
        .map_err(|e| {
            warn!("failed to commit changes to the mounted image: {e}");
            e
        })
}

/// Closes every open handle of an inode, settling blob accounting. The
/// inode itself may be freed if it was already unlinked.
fn close_inode_fds(ctx: &mut MountContext, ino: u64) {
    let idxs = match ctx.tree.inode(ino) {
        Some(inode) => inode.open_fd_indices(),
        None => return,
    };
    for idx in idxs {
        let fd = ctx
            .tree
            .inode_mut(ino)
            .and_then(|inode| inode.take_fd(idx))
            .expect("handle index is live");
        if fd.counted {
            if let Some(blob) = fd.blob {
                ctx.blobs.fd_closed(blob);
            }
        }
    }
    ctx.tree.maybe_free_inode(ino);
}

/// Gives a staged blob its content identity: merge into an existing blob
/// with the same digest, detach if the scratch file ended up empty, or
/// re-key in place as a finalized file on disk.
fn rehash_staged_blob(ctx: &mut MountContext, blob: BlobId) -> Result<(), MountError> {
    let path = ctx
        .blobs
        .get(blob)
        .staging_path()
        .expect("staging list holds staged blobs")
        .clone();
    let digest = Digest::of_file(&path)?;
    let owner = ctx.blobs.get(blob).owner_ino;

    ctx.blobs.unlink(blob);
    ctx.blobs.unstage(blob);

    if let Some(existing) = ctx.blobs.lookup_content(&digest) {
        // Duplicate content: every reference moves to the existing blob.
        debug!("merging staged blob into existing {digest}");
        let moved = ctx.blobs.get(blob).refcnt;
        ctx.blobs.get_mut(existing).refcnt += moved;
        if let Some(ino) = owner {
            rewrite_stream_pointers(ctx, ino, blob, Some(existing));
        }
        ctx.blobs.free(blob);
        return Ok(());
    }

    let size = std::fs::metadata(&path)
        .map_err(|e| {
            warn!("failed to stat staging file {path:?}: {e}");
            MountError::Stat
        })?
        .len();
    if size == 0 {
        // An emptied stream needs no blob at all.
        debug!("staged blob is empty, detaching stream");
        if let Some(ino) = owner {
            rewrite_stream_pointers(ctx, ino, blob, None);
        }
        ctx.blobs.free(blob);
        return Ok(());
    }

    ctx.blobs.relink(blob, BlobKey::Content(digest));
    let entry = ctx.blobs.get_mut(blob);
    entry.location = BlobLocation::InFileOnDisk { path, size };
    entry.owner_ino = None;
    Ok(())
}

fn rewrite_stream_pointers(ctx: &mut MountContext, ino: u64, from: BlobId, to: Option<BlobId>) {
    if let Some(inode) = ctx.tree.inode_mut(ino) {
        for stream in inode.streams.iter_mut() {
            if stream.blob == Some(from) {
                stream.blob = to;
            }
        }
    }
}

/// Snapshots the live tree into the writer's input format.
pub(crate) fn build_image_spec(ctx: &MountContext) -> DentrySpec {
    spec_for_dentry(ctx, ctx.tree.root())
}

fn spec_for_dentry(ctx: &MountContext, dentry: DentryId) -> DentrySpec {
    let d = ctx.tree.dentry(dentry);
    let inode = ctx
        .tree
        .inode(d.ino)
        .expect("dentries always point at live inodes");
    DentrySpec {
        name: d.name.clone(),
        attributes: inode.attributes,
        reparse_tag: inode.reparse_tag,
        creation_ticks: inode.creation_ticks,
        last_write_ticks: inode.last_write_ticks,
        last_access_ticks: inode.last_access_ticks,
        hard_link_group: if inode.link_count > 1 { inode.ino } else { 0 },
        streams: inode
            .streams
            .iter()
            .map(|s| StreamSpec {
                name: s.name.clone(),
                source: s.blob.map(|id| blob_source(ctx, id)),
            })
            .collect(),
        children: d
            .children
            .values()
            .map(|&child| spec_for_dentry(ctx, child))
            .collect(),
    }
}

fn blob_source(ctx: &MountContext, id: BlobId) -> BlobSource {
    let blob = ctx.blobs.get(id);
    let digest = match blob.key {
        BlobKey::Content(digest) => digest,
        BlobKey::Staging(_) => unreachable!("staged blobs are rehashed before commit"),
    };
    match &blob.location {
        BlobLocation::InArchive { size } => BlobSource::Archive {
            digest,
            size: *size,
        },
        BlobLocation::InFileOnDisk { path, size } => BlobSource::File {
            digest,
            path: path.clone(),
            size: *size,
        },
        BlobLocation::InAttachedBuffer(bytes) => BlobSource::Buffer {
            digest,
            bytes: bytes.clone(),
        },
        BlobLocation::InStagingFile { .. } => {
            unreachable!("staged blobs are rehashed before commit")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveProvider;
    use crate::archive::InMemoryArchive;
    use crate::fs::testing::rw_context;
    use crate::image::ROOT_INO;

    fn empty_archive() -> InMemoryArchive {
        let archive = InMemoryArchive::new("test.wim");
        archive.add_image(DentrySpec::directory(b""));
        archive
    }

    fn write_file(ctx: &mut MountContext, name: &[u8], content: &[u8]) {
        ctx.do_mknod(ROOT_INO, name).unwrap();
        let ino = ctx.resolve_ino(name);
        let fh = ctx.do_open(ino, libc::O_WRONLY).unwrap();
        ctx.do_write(ino, fh, 0, content).unwrap();
        ctx.do_release(ino, fh).unwrap();
    }

    #[test]
    fn commit_then_remount_shows_changes() {
        let archive = empty_archive();
        let (mut ctx, _tmp) = rw_context(archive.clone());
        write_file(&mut ctx, b"a", b"abc");
        commit_changes(&mut ctx, WriteFlags::empty()).unwrap();

        // "Remount": a fresh handle on the same archive state.
        let root = archive.clone().load_metadata(1).unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].name, b"a");
        let source = root.children[0].streams[0].source.as_ref().unwrap();
        assert_eq!(source.size(), 3);
        let mut buf = [0u8; 3];
        archive.read_blob(&source.digest(), 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn no_commit_reverts_changes() {
        let archive = empty_archive();
        let (mut ctx, _tmp) = rw_context(archive.clone());
        write_file(&mut ctx, b"a", b"abc");
        drop(ctx);

        let root = archive.clone().load_metadata(1).unwrap();
        assert!(root.children.is_empty());
    }

    #[test]
    fn duplicate_staged_content_merges() {
        let archive = empty_archive();
        let (mut ctx, _tmp) = rw_context(archive);
        write_file(&mut ctx, b"a", b"same bytes");
        write_file(&mut ctx, b"b", b"same bytes");
        assert_eq!(ctx.blobs.staging_blobs().len(), 2);

        commit_changes(&mut ctx, WriteFlags::empty()).unwrap();

        let digest = Digest::of_bytes(b"same bytes");
        let merged = ctx.blobs.lookup_content(&digest).unwrap();
        assert_eq!(ctx.blobs.get(merged).refcnt, 2);
        // Both streams point at the one descriptor.
        for name in [b"a".as_slice(), b"b".as_slice()] {
            let ino = ctx.resolve_ino(name);
            assert_eq!(
                ctx.tree.inode(ino).unwrap().stream(0).unwrap().blob,
                Some(merged)
            );
        }
    }

    #[test]
    fn empty_staged_stream_detaches() {
        let archive = empty_archive();
        let (mut ctx, _tmp) = rw_context(archive);
        // Open for write but write nothing: stages an empty scratch file.
        ctx.do_mknod(ROOT_INO, b"hollow").unwrap();
        let ino = ctx.resolve_ino(b"hollow");
        let fh = ctx.do_open(ino, libc::O_WRONLY).unwrap();
        ctx.do_release(ino, fh).unwrap();
        assert_eq!(ctx.blobs.staging_blobs().len(), 1);

        commit_changes(&mut ctx, WriteFlags::empty()).unwrap();
        let ino = ctx.resolve_ino(b"hollow");
        assert_eq!(ctx.tree.inode(ino).unwrap().stream(0).unwrap().blob, None);
        assert!(ctx.blobs.staging_blobs().is_empty());
    }

    #[test]
    fn drain_closes_handles_left_open() {
        let archive = empty_archive();
        let (mut ctx, _tmp) = rw_context(archive.clone());
        ctx.do_mknod(ROOT_INO, b"a").unwrap();
        let ino = ctx.resolve_ino(b"a");
        let fh = ctx.do_open(ino, libc::O_WRONLY).unwrap();
        ctx.do_write(ino, fh, 0, b"left open").unwrap();
        // No release before the commit.
        commit_changes(&mut ctx, WriteFlags::empty()).unwrap();

        assert_eq!(ctx.tree.inode(ino).unwrap().num_open_fds, 0);
        let root = archive.clone().load_metadata(1).unwrap();
        assert_eq!(root.children[0].streams[0].source.as_ref().unwrap().size(), 9);
    }

    #[test]
    fn hard_links_round_trip_through_spec() {
        let archive = empty_archive();
        let (mut ctx, _tmp) = rw_context(archive);
        write_file(&mut ctx, b"orig", b"linked");
        let ino = ctx.resolve_ino(b"orig");
        ctx.do_link(ino, ROOT_INO, b"alias").unwrap();

        commit_changes(&mut ctx, WriteFlags::empty()).unwrap();
        let spec = build_image_spec(&ctx);
        let groups: Vec<u64> = spec
            .children
            .iter()
            .map(|c| c.hard_link_group)
            .collect();
        assert_eq!(groups.len(), 2);
        assert_ne!(groups[0], 0);
        assert_eq!(groups[0], groups[1]);
    }
}
