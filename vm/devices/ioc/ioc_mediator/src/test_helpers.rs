// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared test scaffolding: FIFOs standing in for CBC devices, timed reads,
//! and tracing output captured by the test harness.

// UNSAFETY: Calling mkfifo and poll.
#![expect(unsafe_code)]

use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::os::unix::prelude::*;
use std::path::Path;
use std::sync::Once;

/// Routes tracing output to the test harness.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Creates a FIFO at `path`.
pub fn mkfifo(path: &Path) {
    let path = CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: path is a valid nul-terminated string.
    let r = unsafe { libc::mkfifo(path.as_ptr(), 0o600) };
    assert_eq!(r, 0, "mkfifo failed: {}", io::Error::last_os_error());
}

/// Whether anything has the FIFO at `path` open for reading.
pub fn fifo_has_reader(path: &Path) -> bool {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(_) => true,
        Err(err) if err.raw_os_error() == Some(libc::ENXIO) => false,
        Err(err) => panic!("failed to probe fifo {}: {err}", path.display()),
    }
}

/// Reads once from `file`, failing if nothing arrives within `secs` seconds.
pub fn read_timeout(file: &File, buf: &mut [u8], secs: i32) -> io::Result<usize> {
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a valid pollfd array of length 1 for the duration of the
    // call.
    let n = unsafe { libc::poll(&mut pfd, 1, secs * 1000) };
    match n {
        0 => Err(io::ErrorKind::TimedOut.into()),
        n if n < 0 => Err(io::Error::last_os_error()),
        _ => (&*file).read(buf),
    }
}

/// Reads from `file` until `len` bytes have arrived or a read times out.
pub fn read_exact_timeout(file: &File, len: usize, secs: i32) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0; 256];
    while data.len() < len {
        let n = read_timeout(file, &mut buf, secs)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}
