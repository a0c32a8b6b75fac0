//! Mounting: validation, daemon spawn, and the daemon side of the
//! unmount protocol.
//!
//! `mount_image` validates cheaply in the calling process, then forks the
//! filesystem daemon. The child acquires the archive lock, loads the
//! image, attaches to the host, and reports readiness (or the first
//! error) through a pipe; the parent returns as soon as the mount is
//! serving. The daemon stays alive until the unmount protocol tells it to
//! commit and exit.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fuser::MountOption;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::MountFlags;
use crate::StreamInterface;
use crate::UnmountFlags;
use crate::archive::ArchiveLock;
use crate::archive::ArchiveProvider;
use crate::archive::WriteFlags;
use crate::blob::BlobStore;
use crate::commit::commit_changes;
use crate::error::MountError;
use crate::fs::MountContext;
use crate::fs::WimFs;
use crate::image::ImageTree;
use crate::mq::Message;
use crate::mq::MessageQueue;
use crate::mq::Received;
use crate::mq::decode_message;
use crate::mq::queue_names;
use crate::staging::StagingDir;

/// The daemon gives a stuck unmount command this long per receive before
/// concluding it has gone away.
const DAEMON_RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn mount_image(
    provider: Box<dyn ArchiveProvider>,
    image: usize,
    mount_dir: &Path,
    mount_flags: MountFlags,
    staging_prefix: Option<&Path>,
) -> Result<(), MountError> {
    let stream_interface = stream_interface_from_flags(mount_flags)?;
    if image == 0 {
        return Err(MountError::InvalidParam);
    }
    match std::fs::metadata(mount_dir) {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(MountError::NotDir),
    }
    provider.verify_split_set()?;
    let readwrite = mount_flags.contains(MountFlags::READWRITE);
    if readwrite && provider.part_count() != 1 {
        error!("cannot mount a split archive read-write");
        return Err(MountError::SplitUnsupported);
    }
    if image > provider.image_count() {
        return Err(MountError::MetadataNotFound);
    }
    if let Some(prefix) = staging_prefix {
        match std::fs::metadata(prefix) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(MountError::NotDir),
        }
    }
    let mount_dir = std::fs::canonicalize(mount_dir).map_err(|_| MountError::NotDir)?;

    // The expensive, state-holding setup (archive lock, metadata load,
    // staging directory) happens after the fork, in the process that will
    // keep that state alive; the child reports the first failure back
    // through the pipe.
    let mut pipe = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(pipe.as_mut_ptr()) } != 0 {
        return Err(MountError::Io(io::Error::last_os_error()));
    }
    match unsafe { libc::fork() } {
        -1 => {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(pipe[0]);
                libc::close(pipe[1]);
            }
            error!("failed to fork the filesystem daemon: {err}");
            Err(MountError::Fork)
        }
        0 => {
            // Daemon child.
            unsafe {
                libc::close(pipe[0]);
                libc::setsid();
            }
            let status_pipe = unsafe { File::from_raw_fd(pipe[1]) };
            let code = daemon_main(
                provider,
                image,
                &mount_dir,
                mount_flags,
                stream_interface,
                staging_prefix,
                status_pipe,
            );
            std::process::exit(code & 0xff);
        }
        _child_pid => {
            unsafe {
                libc::close(pipe[1]);
            }
            let mut status_pipe = unsafe { File::from_raw_fd(pipe[0]) };
            let mut byte = [0u8; 1];
            match status_pipe.read(&mut byte) {
                Ok(1) if byte[0] == 0 => Ok(()),
                Ok(1) => Err(MountError::from_code(i32::from(byte[0]))),
                // The daemon died before reporting: the host never came up.
                _ => Err(MountError::Fuse),
            }
        }
    }
}

fn stream_interface_from_flags(flags: MountFlags) -> Result<StreamInterface, MountError> {
    let chosen = flags
        & (MountFlags::STREAM_INTERFACE_NONE
            | MountFlags::STREAM_INTERFACE_XATTR
            | MountFlags::STREAM_INTERFACE_WINDOWS);
    match chosen.bits().count_ones() {
        // The xattr interface is the default.
        0 => Ok(StreamInterface::Xattr),
        1 if chosen == MountFlags::STREAM_INTERFACE_NONE => Ok(StreamInterface::None),
        1 if chosen == MountFlags::STREAM_INTERFACE_XATTR => Ok(StreamInterface::Xattr),
        1 => Ok(StreamInterface::Windows),
        _ => Err(MountError::InvalidParam),
    }
}

/// Builds the mount context inside the daemon process.
fn build_context(
    mut provider: Box<dyn ArchiveProvider>,
    image: usize,
    mount_dir: &Path,
    mount_flags: MountFlags,
    stream_interface: StreamInterface,
    staging_prefix: Option<&Path>,
) -> Result<MountContext, MountError> {
    let readwrite = mount_flags.contains(MountFlags::READWRITE);

    let lock = if readwrite {
        Some(ArchiveLock::acquire(provider.path())?)
    } else {
        None
    };
    if readwrite {
        // Keep the metadata resident for the whole mount; the commit
        // depends on it still being there.
        provider.pin_metadata(image)?;
    }

    let root = provider.load_metadata(image)?;
    let mut blobs = BlobStore::new();
    let tree = ImageTree::load(&root, &mut blobs)?;
    let mut blob_count = 0usize;
    blobs.for_each(|_, _| blob_count += 1);
    debug!("image {image} loaded with {blob_count} blobs");

    // A previous crashed session may have left its queues behind; they
    // would satisfy the next unmount with stale messages.
    let (u2d_name, d2u_name) = queue_names(mount_dir)?;
    MessageQueue::unlink_name(&u2d_name);
    MessageQueue::unlink_name(&d2u_name);

    let staging = if readwrite {
        let archive_path = provider.path().to_path_buf();
        let archive_name = archive_path
            .file_name()
            .unwrap_or_else(|| OsStr::new("archive"))
            .to_os_string();
        let prefix: PathBuf = match staging_prefix {
            Some(prefix) => std::fs::canonicalize(prefix).map_err(|_| MountError::NotDir)?,
            None => archive_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        Some(StagingDir::create(&prefix, &archive_name).map_err(|e| {
            error!("failed to create staging directory under {prefix:?}: {e}");
            MountError::Mkdir
        })?)
    } else {
        None
    };

    Ok(MountContext {
        provider,
        image_index: image,
        tree,
        blobs,
        staging,
        readonly: !readwrite,
        stream_interface,
        mount_flags,
        mount_dir: mount_dir.to_path_buf(),
        lock,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        destroyed: false,
    })
}

fn report_status(pipe: &mut File, code: i32) {
    let byte = [code.clamp(0, 0xff) as u8];
    if let Err(e) = pipe.write_all(&byte) {
        warn!("failed to report mount status to the parent: {e}");
    }
}

/// Everything the daemon process does, from setup to final exit code.
fn daemon_main(
    provider: Box<dyn ArchiveProvider>,
    image: usize,
    mount_dir: &Path,
    mount_flags: MountFlags,
    stream_interface: StreamInterface,
    staging_prefix: Option<&Path>,
    mut status_pipe: File,
) -> i32 {
    let ctx = match build_context(
        provider,
        image,
        mount_dir,
        mount_flags,
        stream_interface,
        staging_prefix,
    ) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("mount setup failed: {e}");
            report_status(&mut status_pipe, e.code());
            return e.code();
        }
    };

    let fsname = ctx
        .provider
        .path()
        .to_string_lossy()
        .into_owned();
    let readonly = ctx.readonly;
    let fs = WimFs::new(ctx);
    let ctx_handle = fs.context();
    let status_handle = fs.status_handle();

    let mut options = vec![
        MountOption::FSName(fsname),
        MountOption::Subtype("wimfs".to_string()),
    ];
    if readonly {
        options.push(MountOption::RO);
    }

    // Read-write mounts rely on the host's sequential dispatch; the
    // session processes one operation at a time.
    let mut session = match fuser::Session::new(fs, mount_dir, &options) {
        Ok(session) => session,
        Err(e) => {
            error!("failed to attach to the filesystem host: {e}");
            let mut ctx = ctx_handle.lock().expect("mount context poisoned");
            if let Some(staging) = ctx.staging.take() {
                let _ = staging.delete();
            }
            report_status(&mut status_pipe, MountError::Fuse.code());
            return MountError::Fuse.code();
        }
    };
    info!("mounted image {image} on {mount_dir:?}");
    report_status(&mut status_pipe, 0);
    drop(status_pipe);

    if let Err(e) = session.run() {
        error!("filesystem session ended with an error: {e}");
    }
    drop(session);

    // The host calls destroy() on a clean unmount; make sure the
    // protocol has run even if the session ended some other way.
    {
        let mut ctx = ctx_handle.lock().expect("mount context poisoned");
        if !ctx.destroyed {
            let status = run_daemon_destroy(&mut ctx);
            status_handle.store(status, Ordering::SeqCst);
        }
    }
    status_handle.load(Ordering::SeqCst)
}

/// The daemon side of the unmount protocol. Opens the channels, waits for
/// `UNMOUNT_REQUEST`, identifies itself, commits if asked, always removes
/// the staging directory, and reports the terminal status.
pub(crate) fn run_daemon_destroy(ctx: &mut MountContext) -> i32 {
    ctx.destroyed = true;
    let (u2d_name, d2u_name) = match queue_names(&ctx.mount_dir) {
        Ok(names) => names,
        Err(e) => {
            // The mount point may already be gone; there is no channel to
            // report on.
            warn!("cannot derive unmount queue names: {e}");
            return e.code();
        }
    };
    let status = match open_and_serve(ctx, &u2d_name, &d2u_name) {
        Ok(status) => status,
        Err(e) => e.code(),
    };
    MessageQueue::unlink_name(&u2d_name);
    MessageQueue::unlink_name(&d2u_name);
    status
}

fn open_and_serve(
    ctx: &mut MountContext,
    u2d_name: &std::ffi::CStr,
    d2u_name: &std::ffi::CStr,
) -> Result<i32, MountError> {
    let u2d = MessageQueue::open_recv(u2d_name)?;
    let d2u = MessageQueue::open_send(d2u_name)?;
    let mut mailbox = vec![0u8; u2d.mailbox_size()?];

    loop {
        let n = match u2d.recv(&mut mailbox, DAEMON_RECV_TIMEOUT) {
            Ok(n) => n,
            Err(crate::mq::RecvError::TimedOut) => {
                // The unmount command is gone; exit instead of hanging.
                warn!("timed out waiting for an unmount request");
                return Err(MountError::Timeout);
            }
            Err(crate::mq::RecvError::Queue(e)) => {
                error!("failed to receive on the unmount channel: {e}");
                return Err(MountError::Mqueue);
            }
        };
        match decode_message(&mailbox[..n])? {
            Received::VersionTooHigh => {
                warn!("unmount request requires a newer build; ignoring");
                continue;
            }
            Received::Message(Message::UnmountRequest { unmount_flags }) => {
                return Ok(handle_unmount_request(ctx, &d2u, unmount_flags));
            }
            Received::Message(_) => return Err(MountError::InvalidUnmountMessage),
        }
    }
}

fn handle_unmount_request(
    ctx: &mut MountContext,
    d2u: &MessageQueue,
    unmount_flags: UnmountFlags,
) -> i32 {
    debug!("handling unmount request, flags {unmount_flags:?}");
    let mut status: i32 = 0;

    let informed = d2u.send(&Message::DaemonInfo {
        daemon_pid: std::process::id() as i32,
        mount_flags: ctx.mount_flags.bits(),
    });
    match informed {
        Err(e) => status = e.code(),
        Ok(()) => {
            if !ctx.readonly && unmount_flags.contains(UnmountFlags::COMMIT) {
                let mut write_flags = WriteFlags::empty();
                if unmount_flags.contains(UnmountFlags::CHECK_INTEGRITY) {
                    write_flags |= WriteFlags::CHECK_INTEGRITY;
                }
                if unmount_flags.contains(UnmountFlags::REBUILD) {
                    write_flags |= WriteFlags::REBUILD;
                }
                if unmount_flags.contains(UnmountFlags::RECOMPRESS) {
                    write_flags |= WriteFlags::RECOMPRESS;
                }
                if let Err(e) = commit_changes(ctx, write_flags) {
                    status = e.code();
                }
            }
        }
    }

    if let Some(staging) = ctx.staging.take() {
        if let Err(e) = staging.delete() {
            error!("failed to delete the staging directory: {e}");
            if status == 0 {
                status = MountError::DeleteStagingDir.code();
            }
        }
    }
    // The archive lock was held from mount to here; the commit is done
    // (or abandoned), so other mounts may proceed.
    drop(ctx.lock.take());

    if d2u
        .send(&Message::UnmountFinished { status })
        .is_err()
    {
        error!("failed to send the final status to the unmount command");
    }
    status
}
