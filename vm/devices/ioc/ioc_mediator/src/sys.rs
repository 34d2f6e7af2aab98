// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io;

/// A helper trait to convert from a libc return value to an `io::Result`.
pub(crate) trait SyscallResult: Sized {
    /// Returns `Ok(self)` if `self >= 0`, otherwise the last OS error.
    fn syscall_result(self) -> io::Result<Self>;
}

macro_rules! syscall_result {
    ($($t:ty),*) => {
        $(
            impl SyscallResult for $t {
                fn syscall_result(self) -> io::Result<Self> {
                    if self >= 0 {
                        Ok(self)
                    } else {
                        Err(io::Error::last_os_error())
                    }
                }
            }
        )*
    };
}

// read and write return isize; everything else returns i32.
syscall_result!(i32, isize);

/// Runs `f` until it stops failing with EINTR.
pub(crate) fn while_eintr<F, R>(mut f: F) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
{
    loop {
        match f() {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            r => break r,
        }
    }
}
