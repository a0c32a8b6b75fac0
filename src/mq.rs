//! The durable message channels of the unmount protocol.
//!
//! The unmount command and the filesystem daemon are separate processes;
//! they meet on two named POSIX message queues whose names are derived
//! from the canonical mount-point path. Messages are length-prefixed
//! structs with a version-checked header, so mismatched builds detect each
//! other instead of misparsing.

use std::ffi::CStr;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use log::debug;
use log::error;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::UnmountFlags;
use crate::error::MountError;

/// `mq_open` is variadic in C; bind the four-argument form explicitly.
#[allow(clashing_extern_declarations)]
extern "C" {
    fn mq_open(
        name: *const libc::c_char,
        oflag: libc::c_int,
        mode: libc::mode_t,
        attr: *mut libc::mq_attr,
    ) -> libc::mqd_t;
}

const fn version_code(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 20) | (minor << 10) | patch
}

/// Version advertised in every sent message.
pub(crate) const CUR_VERSION: u32 = version_code(0, 3, 0);
/// Oldest version whose build understands these messages.
pub(crate) const MIN_COMPAT_VERSION: u32 = version_code(0, 2, 0);

const U2D_PREFIX: &[u8] = b"/wimlib-unmount-to-daemon-mq";
const D2U_PREFIX: &[u8] = b"/wimlib-daemon-to-unmount-mq";

/// Queue names may not exceed the host's name limit.
const MQ_NAME_MAX: usize = 255;

/// Path separators are flattened with this byte so the queue name has no
/// slashes after the leading one.
const PATH_ESCAPE_BYTE: u8 = 0xff;

/// Messages below this size must be receivable on any queue.
const MIN_MAILBOX_SIZE: usize = 512;

const FALLBACK_MAILBOX_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub(crate) enum MsgType {
    UnmountRequest = 0,
    DaemonInfo = 1,
    UnmountFinished = 2,
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MsgHeader {
    min_version: u32,
    cur_version: u32,
    msg_type: u32,
    msg_size: u32,
}

impl MsgHeader {
    fn new(msg_type: MsgType, msg_size: usize) -> MsgHeader {
        MsgHeader {
            min_version: MIN_COMPAT_VERSION,
            cur_version: CUR_VERSION,
            msg_type: msg_type.into(),
            msg_size: msg_size as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MsgUnmountRequest {
    hdr: MsgHeader,
    unmount_flags: u32,
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MsgDaemonInfo {
    hdr: MsgHeader,
    daemon_pid: i32,
    mount_flags: u32,
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MsgUnmountFinished {
    hdr: MsgHeader,
    status: i32,
}

/// A decoded protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Message {
    /// Unmount command → daemon: begin unmounting with these flags.
    UnmountRequest { unmount_flags: UnmountFlags },
    /// Daemon → unmount command: identify the daemon for liveness probes.
    DaemonInfo { daemon_pid: i32, mount_flags: u32 },
    /// Daemon → unmount command: terminal status; ends the exchange.
    UnmountFinished { status: i32 },
}

impl Message {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match *self {
            Message::UnmountRequest { unmount_flags } => MsgUnmountRequest {
                hdr: MsgHeader::new(
                    MsgType::UnmountRequest,
                    std::mem::size_of::<MsgUnmountRequest>(),
                ),
                unmount_flags: unmount_flags.bits(),
            }
            .as_bytes()
            .to_vec(),
            Message::DaemonInfo {
                daemon_pid,
                mount_flags,
            } => MsgDaemonInfo {
                hdr: MsgHeader::new(MsgType::DaemonInfo, std::mem::size_of::<MsgDaemonInfo>()),
                daemon_pid,
                mount_flags,
            }
            .as_bytes()
            .to_vec(),
            Message::UnmountFinished { status } => MsgUnmountFinished {
                hdr: MsgHeader::new(
                    MsgType::UnmountFinished,
                    std::mem::size_of::<MsgUnmountFinished>(),
                ),
                status,
            }
            .as_bytes()
            .to_vec(),
        }
    }
}

/// Outcome of decoding one received datagram.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Received {
    Message(Message),
    /// The sender requires a newer build; skip and keep receiving.
    VersionTooHigh,
}

pub(crate) fn decode_message(buf: &[u8]) -> Result<Received, MountError> {
    let (hdr, body) =
        MsgHeader::read_from_prefix(buf).map_err(|_| MountError::InvalidUnmountMessage)?;
    if hdr.msg_size as usize != buf.len() {
        return Err(MountError::InvalidUnmountMessage);
    }
    if hdr.min_version > CUR_VERSION {
        return Ok(Received::VersionTooHigh);
    }
    let msg_type =
        MsgType::try_from(hdr.msg_type).map_err(|_| MountError::InvalidUnmountMessage)?;
    let message = match msg_type {
        MsgType::UnmountRequest => {
            let (body, _) = <[u8; 4]>::read_from_prefix(body)
                .map_err(|_| MountError::InvalidUnmountMessage)?;
            Message::UnmountRequest {
                unmount_flags: UnmountFlags::from_bits_truncate(u32::from_ne_bytes(body)),
            }
        }
        MsgType::DaemonInfo => {
            let (body, _) = <[u8; 8]>::read_from_prefix(body)
                .map_err(|_| MountError::InvalidUnmountMessage)?;
            Message::DaemonInfo {
                daemon_pid: i32::from_ne_bytes(body[..4].try_into().unwrap()),
                mount_flags: u32::from_ne_bytes(body[4..].try_into().unwrap()),
            }
        }
        MsgType::UnmountFinished => {
            let (body, _) = <[u8; 4]>::read_from_prefix(body)
                .map_err(|_| MountError::InvalidUnmountMessage)?;
            Message::UnmountFinished {
                status: i32::from_ne_bytes(body),
            }
        }
    };
    Ok(Received::Message(message))
}

/// Derives the two queue names from the canonical mount-point path:
/// slashes become an escape byte so the name stays flat, and the result is
/// clamped to the host's name limit. Returns (unmount→daemon,
/// daemon→unmount).
pub(crate) fn queue_names(mount_dir: &Path) -> Result<(CString, CString), MountError> {
    let canonical = std::fs::canonicalize(mount_dir).map_err(|e| {
        if e.kind() == io::ErrorKind::OutOfMemory {
            MountError::NoMem
        } else {
            MountError::NotDir
        }
    })?;
    let escaped: Vec<u8> = canonical
        .as_os_str()
        .as_bytes()
        .iter()
        .map(|&b| if b == b'/' { PATH_ESCAPE_BYTE } else { b })
        .collect();

    let make = |prefix: &[u8]| {
        let mut name = prefix.to_vec();
        name.extend_from_slice(&escaped);
        name.truncate(MQ_NAME_MAX);
        CString::new(name).expect("queue names contain no NUL")
    };
    Ok((make(U2D_PREFIX), make(D2U_PREFIX)))
}

/// Failure modes of a timed receive.
#[derive(Debug)]
pub(crate) enum RecvError {
    TimedOut,
    Queue(io::Error),
}

/// One endpoint of a named POSIX message queue. Created on first open
/// with permission 0700; closed (not unlinked) on drop.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    mqd: libc::mqd_t,
    name: CString,
}

impl MessageQueue {
    pub(crate) fn open_send(name: &CStr) -> Result<MessageQueue, MountError> {
        Self::open(name, libc::O_WRONLY | libc::O_CREAT)
    }

    pub(crate) fn open_recv(name: &CStr) -> Result<MessageQueue, MountError> {
        Self::open(name, libc::O_RDONLY | libc::O_CREAT)
    }

    fn open(name: &CStr, oflag: libc::c_int) -> Result<MessageQueue, MountError> {
        let mqd = unsafe { mq_open(name.as_ptr(), oflag, 0o700, std::ptr::null_mut()) };
        if mqd == -1 as libc::mqd_t {
            error!(
                "mq_open({:?}) failed: {}",
                name,
                io::Error::last_os_error()
            );
            return Err(MountError::Mqueue);
        }
        debug!("opened message queue {name:?}");
        Ok(MessageQueue {
            mqd,
            name: name.to_owned(),
        })
    }

    /// Removes a queue name, ignoring absence. Used both to clear stale
    /// queues before mounting and to tear down after the exchange.
    pub(crate) fn unlink_name(name: &CStr) {
        unsafe {
            libc::mq_unlink(name.as_ptr());
        }
    }

    pub(crate) fn unlink(&self) {
        Self::unlink_name(&self.name);
    }

    /// Size a receive buffer must have for this queue. Falls back to the
    /// system-wide maximum, then to a fixed guess.
    pub(crate) fn mailbox_size(&self) -> Result<usize, MountError> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        let size = if unsafe { libc::mq_getattr(self.mqd, &mut attr) } == 0 {
            attr.mq_msgsize as usize
        } else {
            std::fs::read_to_string("/proc/sys/fs/mqueue/msgsize_max")
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(FALLBACK_MAILBOX_SIZE)
        };
        if size < MIN_MAILBOX_SIZE {
            error!("message queue max size {size} is too small");
            return Err(MountError::Mqueue);
        }
        Ok(size)
    }

    pub(crate) fn send(&self, message: &Message) -> Result<(), MountError> {
        let bytes = message.encode();
        let rc = unsafe {
            libc::mq_send(
                self.mqd,
                bytes.as_ptr() as *const libc::c_char,
                bytes.len(),
                1,
            )
        };
        if rc != 0 {
            error!(
                "mq_send on {:?} failed: {}",
                self.name,
                io::Error::last_os_error()
            );
            return Err(MountError::Mqueue);
        }
        Ok(())
    }

    /// Receives one datagram, waiting at most `timeout`.
    pub(crate) fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, RecvError> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let mut abs = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
            tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
        };
        if abs.tv_nsec >= 1_000_000_000 {
            abs.tv_sec += 1;
            abs.tv_nsec -= 1_000_000_000;
        }
        let n = unsafe {
            libc::mq_timedreceive(
                self.mqd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                std::ptr::null_mut(),
                &abs,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                return Err(RecvError::TimedOut);
            }
            return Err(RecvError::Queue(err));
        }
        Ok(n as usize)
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}
