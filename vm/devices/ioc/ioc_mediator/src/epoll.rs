// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thin wrappers over epoll and eventfd for the dispatch thread.

// UNSAFETY: Calling epoll and eventfd syscalls.
#![expect(unsafe_code)]

use crate::sys::while_eintr;
use crate::sys::SyscallResult;
use std::io;
use std::os::unix::prelude::*;

/// An epoll instance. Closed on drop.
#[derive(Debug)]
pub(crate) struct Epoll(OwnedFd);

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 creates a new, uniquely owned fd.
        let epfd = unsafe {
            OwnedFd::from_raw_fd(libc::epoll_create1(libc::EPOLL_CLOEXEC).syscall_result()?)
        };
        Ok(Self(epfd))
    }

    /// Registers `fd` for level-triggered readability, tagged with `token`.
    pub fn add(&self, fd: BorrowedFd<'_>, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: safe to call with any fd; event is valid for the call.
        unsafe {
            libc::epoll_ctl(
                self.0.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd.as_raw_fd(),
                &mut event,
            )
            .syscall_result()?;
        }
        Ok(())
    }

    pub fn del(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        // SAFETY: safe to call with any fd.
        unsafe {
            libc::epoll_ctl(
                self.0.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd.as_raw_fd(),
                std::ptr::null_mut(),
            )
            .syscall_result()?;
        }
        Ok(())
    }

    /// Waits for events, returning the number written to `events`.
    ///
    /// A negative `timeout_ms` waits indefinitely. EINTR is reported as
    /// zero events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let maxevents = events.len().min(i32::MAX as usize) as i32;
        // SAFETY: maxevents is set appropriately to write to the events slice.
        let r = unsafe {
            libc::epoll_wait(self.0.as_raw_fd(), events.as_mut_ptr(), maxevents, timeout_ms)
        };
        match r.syscall_result() {
            Ok(n) => Ok(n as usize),
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

/// A non-blocking eventfd used to kick the dispatch thread out of its wait.
#[derive(Debug)]
pub(crate) struct WakeEvent(OwnedFd);

impl WakeEvent {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd creates a new, uniquely owned fd.
        let fd = unsafe {
            OwnedFd::from_raw_fd(
                libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC).syscall_result()?,
            )
        };
        Ok(Self(fd))
    }

    pub fn signal(&self) -> io::Result<()> {
        let c: u64 = 1;
        // SAFETY: fd is open and c is readable for its size.
        while_eintr(|| unsafe {
            libc::write(
                self.0.as_raw_fd(),
                std::ptr::from_ref(&c).cast::<libc::c_void>(),
                size_of_val(&c),
            )
            .syscall_result()
        })?;
        Ok(())
    }

    /// Resets the event. Returns whether it was signaled.
    pub fn try_wait(&self) -> bool {
        let mut c: u64 = 0;
        // SAFETY: fd is open and c is writable for its size.
        while_eintr(|| unsafe {
            libc::read(
                self.0.as_raw_fd(),
                std::ptr::from_mut(&mut c).cast::<libc::c_void>(),
                size_of_val(&c),
            )
            .syscall_result()
        })
        .is_ok()
    }
}

impl AsFd for WakeEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_event_is_reported() {
        let epoll = Epoll::new().unwrap();
        let wake = WakeEvent::new().unwrap();
        epoll.add(wake.as_fd(), 7).unwrap();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        wake.signal().unwrap();
        assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 7);

        assert!(wake.try_wait());
        assert!(!wake.try_wait());
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        epoll.del(wake.as_fd()).unwrap();
        wake.signal().unwrap();
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);
    }
}
