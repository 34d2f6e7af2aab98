// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The virtual UART: a pty whose secondary side is published at a well-known
//! path for the guest's UART backend to open, and whose primary side the
//! mediator reads and writes.

// UNSAFETY: Calling the pty and termios libc functions.
#![expect(unsafe_code)]

use crate::sys::SyscallResult;
use std::ffi::CStr;
use std::ffi::OsStr;
use std::fs::File;
use std::fs::OpenOptions;
use std::fs::Permissions;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::prelude::*;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// The pty multiplexer on Linux.
pub const DEFAULT_PTMX_PATH: &str = "/dev/ptmx";

/// A failure to set up the virtual UART.
#[derive(Debug, Error)]
pub enum PtyError {
    /// The pty multiplexer could not be opened.
    #[error("failed to open pty multiplexer {}", .0.display())]
    Open(PathBuf, #[source] io::Error),
    /// `grantpt` failed.
    #[error("failed to grant pty secondary")]
    Grant(#[source] io::Error),
    /// `unlockpt` failed.
    #[error("failed to unlock pty secondary")]
    Unlock(#[source] io::Error),
    /// `ptsname_r` failed.
    #[error("failed to get pty secondary name")]
    Name(#[source] io::Error),
    /// A stale file at the link path could not be removed.
    #[error("failed to remove stale link")]
    RemoveStale(#[source] io::Error),
    /// The link to the secondary could not be created.
    #[error("failed to link pty secondary")]
    Link(#[source] io::Error),
    /// The secondary's permissions could not be set.
    #[error("failed to set pty secondary permissions")]
    Permissions(#[source] io::Error),
    /// Raw mode could not be applied.
    #[error("failed to set pty raw mode")]
    Termios(#[source] io::Error),
}

/// An open pty primary with its secondary published at a link path.
///
/// Dropping this closes the primary and removes the link.
#[derive(Debug)]
pub struct VirtualUart {
    primary: File,
    secondary: PathBuf,
    link: PathBuf,
}

impl VirtualUart {
    /// The pty primary, in non-blocking mode.
    pub fn primary(&self) -> &File {
        &self.primary
    }

    /// The `/dev/pts/N` path of the secondary.
    pub fn secondary_path(&self) -> &Path {
        &self.secondary
    }

    /// Where the secondary is published.
    pub fn link_path(&self) -> &Path {
        &self.link
    }
}

impl Drop for VirtualUart {
    fn drop(&mut self) {
        // Only remove the link if it still refers to this pty.
        if std::fs::read_link(&self.link).is_ok_and(|target| target == self.secondary) {
            let _ = std::fs::remove_file(&self.link);
        }
    }
}

/// Allocates a pty from `ptmx`, publishes its secondary at `link`, and puts
/// the pty in raw mode.
///
/// Any existing file or link at `link` is replaced.
pub fn open_virtual_uart(link: &Path, ptmx: &Path) -> Result<VirtualUart, PtyError> {
    let primary = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(ptmx)
        .map_err(|err| PtyError::Open(ptmx.to_owned(), err))?;

    // SAFETY: primary is an open fd for the duration of the call.
    unsafe { libc::grantpt(primary.as_raw_fd()) }
        .syscall_result()
        .map_err(PtyError::Grant)?;
    // SAFETY: primary is an open fd for the duration of the call.
    unsafe { libc::unlockpt(primary.as_raw_fd()) }
        .syscall_result()
        .map_err(PtyError::Unlock)?;
    let secondary = secondary_name(&primary).map_err(PtyError::Name)?;

    match std::fs::remove_file(link) {
        Ok(()) => tracing::debug!(link = %link.display(), "removed stale virtual uart link"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(PtyError::RemoveStale(err)),
    }
    std::os::unix::fs::symlink(&secondary, link).map_err(PtyError::Link)?;

    // From here on the link belongs to the returned object, so failures clean
    // it up on drop.
    let vuart = VirtualUart {
        primary,
        secondary,
        link: link.to_owned(),
    };
    std::fs::set_permissions(link, Permissions::from_mode(0o660))
        .map_err(PtyError::Permissions)?;
    set_raw(&vuart.primary).map_err(PtyError::Termios)?;
    Ok(vuart)
}

fn secondary_name(primary: &File) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: buf is writable for buf.len() bytes.
    let r = unsafe { libc::ptsname_r(primary.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if r != 0 {
        return Err(io::Error::from_raw_os_error(r));
    }
    // SAFETY: ptsname_r succeeded, so buf holds a nul-terminated string.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

fn set_raw(file: &File) -> io::Result<()> {
    let mut termios = MaybeUninit::<libc::termios>::uninit();
    // SAFETY: file is open and termios is writable.
    unsafe { libc::tcgetattr(file.as_raw_fd(), termios.as_mut_ptr()) }.syscall_result()?;
    // SAFETY: tcgetattr succeeded, so termios is initialized.
    let mut termios = unsafe { termios.assume_init() };
    // SAFETY: termios is a valid termios struct.
    unsafe { libc::cfmakeraw(&mut termios) };
    termios.c_cflag |= libc::CLOCAL;
    // SAFETY: file is open and termios is a valid termios struct.
    unsafe { libc::tcsetattr(file.as_raw_fd(), libc::TCSANOW, &termios) }.syscall_result()?;
    Ok(())
}
