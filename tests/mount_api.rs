//! Validation behavior of the public mount/unmount entry points that does
//! not require a kernel mount.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use wimfs::MountError;
use wimfs::MountFlags;
use wimfs::UnmountFlags;
use wimfs::archive::ArchiveProvider;
use wimfs::archive::DentrySpec;
use wimfs::archive::InMemoryArchive;
use wimfs::archive::WriteFlags;
use wimfs::mount_image;
use wimfs::unmount_image;

fn one_image_archive() -> InMemoryArchive {
    let archive = InMemoryArchive::new("api.wim");
    archive.add_image(DentrySpec::directory(b""));
    archive
}

#[test]
fn mount_rejects_image_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let result = mount_image(
        Box::new(one_image_archive()),
        0,
        tmp.path(),
        MountFlags::empty(),
        None,
    );
    assert!(matches!(result, Err(MountError::InvalidParam)));
}

#[test]
fn mount_rejects_missing_image() {
    let tmp = tempfile::tempdir().unwrap();
    let result = mount_image(
        Box::new(one_image_archive()),
        2,
        tmp.path(),
        MountFlags::empty(),
        None,
    );
    assert!(matches!(result, Err(MountError::MetadataNotFound)));
}

#[test]
fn mount_rejects_non_directory_mount_point() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("plain");
    std::fs::write(&file, b"").unwrap();
    for target in [file, tmp.path().join("missing")] {
        let result = mount_image(
            Box::new(one_image_archive()),
            1,
            &target,
            MountFlags::empty(),
            None,
        );
        assert!(matches!(result, Err(MountError::NotDir)), "{target:?}");
    }
}

#[test]
fn mount_rejects_conflicting_stream_interfaces() {
    let tmp = tempfile::tempdir().unwrap();
    let result = mount_image(
        Box::new(one_image_archive()),
        1,
        tmp.path(),
        MountFlags::STREAM_INTERFACE_XATTR | MountFlags::STREAM_INTERFACE_WINDOWS,
        None,
    );
    assert!(matches!(result, Err(MountError::InvalidParam)));
}

#[test]
fn mount_rejects_bad_staging_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let result = mount_image(
        Box::new(one_image_archive()),
        1,
        tmp.path(),
        MountFlags::READWRITE,
        Some(&tmp.path().join("missing")),
    );
    assert!(matches!(result, Err(MountError::NotDir)));
}

/// A provider describing a split-archive set, to exercise the read-write
/// rejection without a codec.
struct SplitSet {
    first_part: PathBuf,
    inner: InMemoryArchive,
}

impl ArchiveProvider for SplitSet {
    fn path(&self) -> &Path {
        &self.first_part
    }

    fn part_count(&self) -> usize {
        3
    }

    fn image_count(&self) -> usize {
        self.inner.image_count()
    }

    fn pin_metadata(&mut self, image: usize) -> Result<(), MountError> {
        self.inner.pin_metadata(image)
    }

    fn load_metadata(&mut self, image: usize) -> Result<DentrySpec, MountError> {
        self.inner.load_metadata(image)
    }

    fn read_blob(&self, digest: &wimfs::Digest, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_blob(digest, offset, buf)
    }

    fn commit(
        &mut self,
        image: usize,
        root: &DentrySpec,
        flags: WriteFlags,
    ) -> Result<(), MountError> {
        self.inner.commit(image, root, flags)
    }
}

#[test]
fn split_set_cannot_be_mounted_read_write() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = SplitSet {
        first_part: tmp.path().join("split.wim"),
        inner: one_image_archive(),
    };
    let result = mount_image(
        Box::new(provider),
        1,
        tmp.path(),
        MountFlags::READWRITE,
        None,
    );
    assert!(matches!(result, Err(MountError::SplitUnsupported)));
}

#[test]
fn unmount_without_daemon_fails() {
    // No daemon ever served this directory: the unmount command must
    // come back with an error (which one depends on whether an unmount
    // helper binary is available), never hang or succeed.
    let tmp = tempfile::tempdir().unwrap();
    let result = unmount_image(tmp.path(), UnmountFlags::COMMIT);
    assert!(result.is_err());
}
