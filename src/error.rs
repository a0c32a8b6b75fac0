//! Error type shared by the mount and unmount entry points.

use std::io;

use thiserror::Error;

/// Errors reported by [`mount_image`](crate::mount_image) and
/// [`unmount_image`](crate::unmount_image).
///
/// The unmount protocol carries the daemon's terminal status across the
/// process boundary as a plain integer, so every variant maps to a stable
/// [`code`](MountError::code).
#[derive(Debug, Error)]
pub enum MountError {
    /// An argument was missing or inconsistent.
    #[error("invalid parameter")]
    InvalidParam,
    /// The archive has no image at the requested index.
    #[error("no image metadata at the requested index")]
    MetadataNotFound,
    /// The mount point (or staging prefix) is not a directory.
    #[error("not a directory")]
    NotDir,
    /// A split archive set cannot be mounted read-write.
    #[error("split archives cannot be mounted read-write")]
    SplitUnsupported,
    /// Another process holds the advisory lock on the archive.
    #[error("the archive is locked by another process")]
    AlreadyLocked,
    /// The staging directory could not be created.
    #[error("failed to create the staging directory")]
    Mkdir,
    /// A message queue could not be opened, read, or written.
    #[error("message queue failure")]
    Mqueue,
    /// A message on the unmount channel was malformed.
    #[error("received an invalid unmount message")]
    InvalidUnmountMessage,
    /// Neither `fusermount -u` nor `umount` detached the filesystem.
    #[error("failed to run the unmount helper")]
    Fusermount,
    /// The filesystem daemon could not be forked.
    #[error("failed to fork the filesystem daemon")]
    Fork,
    /// A receive on the unmount channel timed out.
    #[error("timed out waiting for the filesystem daemon")]
    Timeout,
    /// The daemon's PID disappeared while the unmount command was waiting.
    #[error("the filesystem daemon has crashed")]
    DaemonCrashed,
    /// An allocation failed.
    #[error("out of memory")]
    NoMem,
    /// The filesystem host refused the mount or failed while serving it.
    #[error("the filesystem host failed")]
    Fuse,
    /// The staging directory could not be removed after unmount.
    #[error("failed to delete the staging directory")]
    DeleteStagingDir,
    /// A staging file could not be examined during commit.
    #[error("failed to stat a staging file")]
    Stat,
    /// The archive writer rejected the commit.
    #[error("failed to write the archive: {0}")]
    WriteArchive(String),
    /// An I/O error outside the categories above.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The daemon reported a status this build does not recognize.
    #[error("filesystem daemon reported failure status {0}")]
    DaemonStatus(i32),
}

impl MountError {
    /// Stable wire status for this error, carried in `UNMOUNT_FINISHED`.
    pub fn code(&self) -> i32 {
        match self {
            MountError::InvalidParam => 1,
            MountError::MetadataNotFound => 2,
            MountError::NotDir => 3,
            MountError::SplitUnsupported => 4,
            MountError::AlreadyLocked => 5,
            MountError::Mkdir => 6,
            MountError::Mqueue => 7,
            MountError::InvalidUnmountMessage => 8,
            MountError::Fusermount => 9,
            MountError::Fork => 10,
            MountError::Timeout => 11,
            MountError::DaemonCrashed => 12,
            MountError::NoMem => 13,
            MountError::Fuse => 14,
            MountError::DeleteStagingDir => 15,
            MountError::Stat => 16,
            MountError::WriteArchive(_) => 17,
            MountError::Io(_) => 18,
            MountError::DaemonStatus(code) => *code,
        }
    }

    /// Reconstructs an error from a wire status. `0` is not an error and
    /// must be handled by the caller.
    pub(crate) fn from_code(code: i32) -> MountError {
        match code {
            1 => MountError::InvalidParam,
            2 => MountError::MetadataNotFound,
            3 => MountError::NotDir,
            4 => MountError::SplitUnsupported,
            5 => MountError::AlreadyLocked,
            6 => MountError::Mkdir,
            7 => MountError::Mqueue,
            8 => MountError::InvalidUnmountMessage,
            9 => MountError::Fusermount,
            10 => MountError::Fork,
            11 => MountError::Timeout,
            12 => MountError::DaemonCrashed,
            13 => MountError::NoMem,
            14 => MountError::Fuse,
            15 => MountError::DeleteStagingDir,
            16 => MountError::Stat,
            17 => MountError::WriteArchive(String::new()),
            code => MountError::DaemonStatus(code),
        }
    }
}
