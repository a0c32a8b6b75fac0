//! Mount images from Windows Imaging (WIM) archives as ordinary
//! read/write filesystems.
//!
//! A WIM archive packs one or more filesystem trees ("images") into a
//! single container whose file contents are deduplicated by SHA-1 digest.
//! [`mount_image`] exposes one image at a mount point through a userspace
//! filesystem daemon: reads are served from the archive, writes go to
//! copy-on-write copies in a per-mount staging directory, and
//! [`unmount_image`] with [`UnmountFlags::COMMIT`] folds the staged
//! changes back into the archive before the daemon exits.
//!
//! The archive container format itself (compression, chunk tables, XML
//! metadata) is pluggable behind [`archive::ArchiveProvider`];
//! [`archive::InMemoryArchive`] is a complete map-backed provider used by
//! the test suite.
//!
//! ```no_run
//! use wimfs::{mount_image, unmount_image, MountFlags, UnmountFlags};
//! use wimfs::archive::InMemoryArchive;
//!
//! # fn main() -> Result<(), wimfs::MountError> {
//! let archive = InMemoryArchive::new("backup.wim");
//! // ... populate the archive, or plug in a real codec ...
//! mount_image(Box::new(archive), 1, "/mnt/image", MountFlags::READWRITE, None)?;
//! // ... the image is now live under /mnt/image ...
//! unmount_image("/mnt/image", UnmountFlags::COMMIT)?;
//! # Ok(())
//! # }
//! ```
//!
//! Mounting spawns a daemon process and returns once it is serving;
//! unmounting talks to that daemon over two named POSIX message queues
//! derived from the mount point, so the two calls may come from different
//! processes. The daemon holds an advisory lock on the archive file for
//! the lifetime of a read-write mount; a second read-write mount of the
//! same archive fails with [`MountError::AlreadyLocked`].

#![warn(missing_docs, rust_2018_idioms)]

use std::path::Path;

use bitflags::bitflags;

pub mod archive;
mod blob;
mod commit;
mod digest;
mod error;
mod fs;
mod image;
mod mount;
mod mq;
mod staging;
mod time;
mod unmount;

pub use crate::digest::DIGEST_SIZE;
pub use crate::digest::Digest;
pub use crate::error::MountError;

bitflags! {
    /// Options for [`mount_image`].
    ///
    /// Exactly one `STREAM_INTERFACE_*` flag may be given; with none,
    /// `STREAM_INTERFACE_XATTR` is assumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Mount the image read-write, with a staging directory and a
        /// committing unmount.
        const READWRITE = 0x0000_0001;
        /// Ask the filesystem host for verbose debugging.
        const DEBUG = 0x0000_0002;
        /// Do not expose alternate data streams at all.
        const STREAM_INTERFACE_NONE = 0x0000_0004;
        /// Expose alternate data streams as `user.*` extended attributes
        /// (the default).
        const STREAM_INTERFACE_XATTR = 0x0000_0008;
        /// Expose alternate data streams with Windows `file:stream`
        /// naming.
        const STREAM_INTERFACE_WINDOWS = 0x0000_0010;
    }
}

bitflags! {
    /// Options for [`unmount_image`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnmountFlags: u32 {
        /// Commit staged modifications back to the archive. Without this
        /// flag all modifications are discarded.
        const COMMIT = 0x0000_0001;
        /// Ask the archive writer to append integrity information.
        const CHECK_INTEGRITY = 0x0000_0002;
        /// Ask the archive writer to rebuild the archive in full.
        const REBUILD = 0x0000_0004;
        /// Ask the archive writer to recompress all blobs.
        const RECOMPRESS = 0x0000_0008;
    }
}

/// How alternate data streams are surfaced through the mount, derived
/// from the `STREAM_INTERFACE_*` mount flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInterface {
    /// Alternate data streams are hidden.
    None,
    /// Alternate data streams are `user.*` extended attributes.
    Xattr,
    /// Alternate data streams are addressed as `file:stream`.
    Windows,
}

/// Mounts image `image` (1-based) of the provider's archive at
/// `mount_dir`.
///
/// Spawns the filesystem daemon and returns once the mount is serving.
/// The daemon lives until [`unmount_image`] is invoked on the same mount
/// point (or the kernel mount is torn down some other way).
///
/// `staging_prefix` overrides where the staging directory of a read-write
/// mount is created; by default it lands next to the archive file.
///
/// # Errors
/// Fails without side effects on invalid arguments, a missing image, a
/// held archive lock, or a staging/host setup failure; the error carries
/// the daemon's setup status.
pub fn mount_image(
    provider: Box<dyn archive::ArchiveProvider>,
    image: usize,
    mount_dir: impl AsRef<Path>,
    flags: MountFlags,
    staging_prefix: Option<&Path>,
) -> Result<(), MountError> {
    mount::mount_image(provider, image, mount_dir.as_ref(), flags, staging_prefix)
}

/// Unmounts the image previously mounted at `mount_dir`, returning the
/// daemon's terminal status.
///
/// With [`UnmountFlags::COMMIT`] the daemon rewrites the archive from the
/// live image before exiting; otherwise all modifications are discarded.
/// Either way the staging directory is removed.
///
/// # Errors
/// Reports [`MountError::DaemonCrashed`] if the daemon disappears before
/// answering, [`MountError::Mqueue`] if the channels cannot be used, and
/// otherwise whatever status the daemon sent in its final message.
pub fn unmount_image(mount_dir: impl AsRef<Path>, flags: UnmountFlags) -> Result<(), MountError> {
    unmount::unmount_image(mount_dir.as_ref(), flags)
}
