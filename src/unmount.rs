//! The unmount command: the foreground half of the unmount protocol.
//!
//! Sends `UNMOUNT_REQUEST`, kicks the kernel mount loose with
//! `fusermount -u` (falling back to `umount`), then waits for the daemon
//! to report the commit result, probing the daemon's PID on every receive
//! timeout so a crash surfaces as an error instead of a hang.

use std::path::Path;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::UnmountFlags;
use crate::error::MountError;
use crate::mq::Message;
use crate::mq::MessageQueue;
use crate::mq::Received;
use crate::mq::RecvError;
use crate::mq::decode_message;
use crate::mq::queue_names;

/// Receive timeout before the daemon has identified itself.
const INITIAL_RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Once the daemon's PID is known, poll its liveness this often.
const INFORMED_RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn unmount_image(mount_dir: &Path, flags: UnmountFlags) -> Result<(), MountError> {
    let (u2d_name, d2u_name) = queue_names(mount_dir)?;
    let u2d = MessageQueue::open_send(&u2d_name)?;
    let d2u = MessageQueue::open_recv(&d2u_name)?;

    let result = run_unmount(mount_dir, flags, &u2d, &d2u);

    u2d.unlink();
    d2u.unlink();
    result
}

fn run_unmount(
    mount_dir: &Path,
    flags: UnmountFlags,
    u2d: &MessageQueue,
    d2u: &MessageQueue,
) -> Result<(), MountError> {
    u2d.send(&Message::UnmountRequest {
        unmount_flags: flags,
    })?;

    // The external unmounter returns before the daemon has finished; the
    // message loop below is what actually waits for the commit.
    execute_unmount_helper(mount_dir)?;
    await_daemon(d2u)
}

/// Waits for the daemon's terminal status, probing its liveness on every
/// receive timeout once it has identified itself.
fn await_daemon(d2u: &MessageQueue) -> Result<(), MountError> {
    let mut mailbox = vec![0u8; d2u.mailbox_size()?];
    let mut timeout = INITIAL_RECV_TIMEOUT;
    let mut daemon_pid: Option<i32> = None;

    loop {
        match d2u.recv(&mut mailbox, timeout) {
            Ok(n) => match decode_message(&mailbox[..n])? {
                Received::VersionTooHigh => {
                    warn!("daemon message requires a newer build; ignoring");
                }
                Received::Message(Message::DaemonInfo {
                    daemon_pid: pid,
                    mount_flags,
                }) => {
                    debug!("daemon pid is {pid}, mount flags {mount_flags:#x}");
                    daemon_pid = Some(pid);
                    timeout = INFORMED_RECV_TIMEOUT;
                }
                Received::Message(Message::UnmountFinished { status }) => {
                    debug!("daemon finished with status {status}");
                    return if status == 0 {
                        Ok(())
                    } else {
                        Err(MountError::from_code(status))
                    };
                }
                Received::Message(Message::UnmountRequest { .. }) => {
                    return Err(MountError::InvalidUnmountMessage);
                }
            },
            Err(RecvError::TimedOut) => match daemon_pid {
                None => {
                    error!("the filesystem daemon never responded");
                    return Err(MountError::DaemonCrashed);
                }
                Some(pid) => match kill(Pid::from_raw(pid), None) {
                    Ok(()) => {
                        debug!("daemon {pid} is still alive, waiting");
                    }
                    Err(nix::errno::Errno::ESRCH) => {
                        error!(
                            "the filesystem daemon has crashed; changes may not have been committed"
                        );
                        return Err(MountError::DaemonCrashed);
                    }
                    Err(e) => {
                        error!("cannot determine the state of daemon {pid}: {e}");
                        return Err(MountError::Mqueue);
                    }
                },
            },
            Err(RecvError::Queue(e)) => {
                error!("failed to receive from the daemon: {e}");
                return Err(MountError::Mqueue);
            }
        }
    }
}

/// Detaches the kernel mount: `fusermount -u`, with a `umount` fallback
/// for hosts without a fusermount binary.
fn execute_unmount_helper(mount_dir: &Path) -> Result<(), MountError> {
    let fusermount = Command::new("fusermount")
        .arg("-u")
        .arg(mount_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match fusermount {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => debug!("fusermount exited with {status}, trying umount"),
        Err(e) => debug!("failed to run fusermount ({e}), trying umount"),
    }
    match Command::new("umount")
        .arg(mount_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            error!("umount exited with {status}");
            Err(MountError::Fusermount)
        }
        Err(e) => {
            error!("failed to run umount: {e}");
            Err(MountError::Fusermount)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    fn test_queue(tag: &str) -> Option<(MessageQueue, MessageQueue, CString)> {
        let name = CString::new(format!("/wimfs-unmount-test-{tag}-{}", std::process::id())).unwrap();
        MessageQueue::unlink_name(&name);
        let rx = MessageQueue::open_recv(&name).ok()?;
        let tx = MessageQueue::open_send(&name).unwrap();
        Some((tx, rx, name))
    }

    #[test]
    fn finished_status_ends_the_wait() {
        let Some((tx, rx, name)) = test_queue("finish") else {
            eprintln!("skipping: POSIX message queues unavailable");
            return;
        };
        tx.send(&Message::DaemonInfo {
            daemon_pid: std::process::id() as i32,
            mount_flags: 0,
        })
        .unwrap();
        tx.send(&Message::UnmountFinished { status: 0 }).unwrap();
        assert!(await_daemon(&rx).is_ok());

        tx.send(&Message::UnmountFinished {
            status: MountError::Mkdir.code(),
        })
        .unwrap();
        assert!(matches!(await_daemon(&rx), Err(MountError::Mkdir)));
        MessageQueue::unlink_name(&name);
    }

    #[test]
    fn dead_daemon_pid_is_detected() {
        let Some((tx, rx, name)) = test_queue("dead") else {
            eprintln!("skipping: POSIX message queues unavailable");
            return;
        };
        // A PID above the kernel's pid_max can never name a live process.
        tx.send(&Message::DaemonInfo {
            daemon_pid: i32::MAX,
            mount_flags: 0,
        })
        .unwrap();
        // After the 1-second probe interval the missing process surfaces.
        assert!(matches!(
            await_daemon(&rx),
            Err(MountError::DaemonCrashed)
        ));
        MessageQueue::unlink_name(&name);
    }
}
