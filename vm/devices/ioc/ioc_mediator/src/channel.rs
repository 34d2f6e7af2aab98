// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The IOC channel table: the native CBC character devices and the virtual
//! UART, each opened once at startup and closed once at teardown.

// UNSAFETY: Calling poll to wait for a stalled channel to drain.
#![expect(unsafe_code)]

use crate::pty;
use crate::pty::PtyError;
use crate::pty::VirtualUart;
use crate::sys::SyscallResult;
use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::prelude::*;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// How long a write waits for a full channel to drain before giving up.
const WRITE_STALL_TIMEOUT_MS: i32 = 1000;

macro_rules! channel_ids {
    ($($(#[$attr:meta])* $variant:ident => $name:literal,)*) => {
        /// Identifies a logical IOC channel.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ChannelId {
            $($(#[$attr])* $variant,)*
        }

        impl ChannelId {
            /// Every channel, in table order.
            pub const ALL: &'static [ChannelId] = &[$(ChannelId::$variant,)*];

            /// The short name of the channel.
            pub fn name(self) -> &'static str {
                match self {
                    $(ChannelId::$variant => $name,)*
                }
            }
        }
    };
}

channel_ids! {
    /// Power management.
    Pmt => "pmt",
    /// Lifecycle, the primary native channel.
    Lifecycle => "lifecycle",
    /// Signals.
    Signal => "signals",
    /// Early signals.
    EarlySignal => "early-signals",
    /// Diagnosis.
    Diag => "diagnosis",
    /// Diagnostic log and trace.
    Dlt => "dlt",
    /// Linda.
    Linda => "linda",
    /// Raw channel 0.
    Raw0 => "raw0",
    /// Raw channel 1.
    Raw1 => "raw1",
    /// Raw channel 2.
    Raw2 => "raw2",
    /// Raw channel 3.
    Raw3 => "raw3",
    /// Raw channel 4.
    Raw4 => "raw4",
    /// Raw channel 5.
    Raw5 => "raw5",
    /// Raw channel 6.
    Raw6 => "raw6",
    /// Raw channel 7.
    Raw7 => "raw7",
    /// Raw channel 8.
    Raw8 => "raw8",
    /// Raw channel 9.
    Raw9 => "raw9",
    /// Raw channel 10.
    Raw10 => "raw10",
    /// Raw channel 11.
    Raw11 => "raw11",
    /// The pty shared with the guest's virtual UART.
    VirtualUart => "virtual-uart",
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What sits behind a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// A native CBC character device.
    Native,
    /// The pty master of the virtual UART.
    VirtualUart,
}

/// Static configuration for one channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// The channel identity.
    pub id: ChannelId,
    /// Native device or virtual UART.
    pub kind: ChannelKind,
    /// The device path for native channels; the path to publish the pty
    /// secondary at for the virtual UART.
    pub path: PathBuf,
    /// Disabled channels are never opened.
    pub enabled: bool,
    /// Failing to open a critical channel fails mediator startup.
    pub critical: bool,
}

impl ChannelConfig {
    /// A native channel.
    pub fn native(id: ChannelId, path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            id,
            kind: ChannelKind::Native,
            path: path.into(),
            enabled,
            critical: false,
        }
    }

    /// The virtual UART channel. Always enabled and critical.
    pub fn virtual_uart(link_path: impl Into<PathBuf>) -> Self {
        Self {
            id: ChannelId::VirtualUart,
            kind: ChannelKind::VirtualUart,
            path: link_path.into(),
            enabled: true,
            critical: true,
        }
    }

    /// Marks the channel critical.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// The channel table a CBC-attached platform exposes, with the virtual UART
/// published at `virtual_uart_path`.
pub fn default_channel_table(virtual_uart_path: &Path) -> Vec<ChannelConfig> {
    use ChannelId::*;

    let mut table = vec![
        ChannelConfig::native(Pmt, "/dev/cbc-pmt", false),
        ChannelConfig::native(Lifecycle, "/dev/cbc-lifecycle", true).critical(),
        ChannelConfig::native(Signal, "/dev/cbc-signals", true),
        ChannelConfig::native(EarlySignal, "/dev/cbc-early-signals", false),
        ChannelConfig::native(Diag, "/dev/cbc-diagnosis", false),
        ChannelConfig::native(Dlt, "/dev/cbc-dlt", false),
        ChannelConfig::native(Linda, "/dev/cbc-linda", false),
    ];
    let raw = [
        Raw0, Raw1, Raw2, Raw3, Raw4, Raw5, Raw6, Raw7, Raw8, Raw9, Raw10, Raw11,
    ];
    table.extend(
        raw.iter()
            .enumerate()
            .map(|(i, &id)| ChannelConfig::native(id, format!("/dev/cbc-raw{i}"), true)),
    );
    table.push(ChannelConfig::virtual_uart(virtual_uart_path));
    table
}

/// An error on a channel read or write.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is not in the table or its device is not open.
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),
    /// The underlying read or write failed.
    #[error("i/o failed on channel {id}")]
    Io {
        /// The channel.
        id: ChannelId,
        /// The failure.
        #[source]
        err: io::Error,
    },
    /// The peer stopped draining the channel.
    #[error("write to channel {0} stalled")]
    Stalled(ChannelId),
}

/// A channel-open failure severe enough to abort startup.
#[derive(Debug, Error)]
pub enum OpenError {
    /// A critical native channel could not be opened.
    #[error("failed to open critical channel {} at {}", .id, .path.display())]
    Native {
        /// The channel.
        id: ChannelId,
        /// The device path.
        path: PathBuf,
        /// The failure.
        #[source]
        err: io::Error,
    },
    /// The virtual UART could not be created.
    #[error("failed to create the virtual uart at {}", .path.display())]
    VirtualUart {
        /// The requested link path.
        path: PathBuf,
        /// The failure.
        #[source]
        err: PtyError,
    },
}

enum Endpoint {
    Native(File),
    VirtualUart(VirtualUart),
}

impl Endpoint {
    fn file(&self) -> &File {
        match self {
            Endpoint::Native(file) => file,
            Endpoint::VirtualUart(vuart) => vuart.primary(),
        }
    }
}

/// One entry in the channel table.
pub struct Channel {
    config: ChannelConfig,
    endpoint: Option<Endpoint>,
}

impl Channel {
    /// The channel identity.
    pub fn id(&self) -> ChannelId {
        self.config.id
    }

    /// The channel kind.
    pub fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    /// The configured device or link path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Whether the channel has an open device.
    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    /// The open device's fd.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.endpoint.as_ref().map(|e| e.file().as_fd())
    }

    /// Reads once from the channel.
    ///
    /// Returns `Ok(None)` if there is no data right now, and `Ok(Some(0))` at
    /// end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, ChannelError> {
        let id = self.id();
        let mut file = self.endpoint.as_ref().ok_or(ChannelError::NotOpen(id))?.file();
        loop {
            match file.read(buf) {
                Ok(n) => break Ok(Some(n)),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(None),
                Err(err) => break Err(ChannelError::Io { id, err }),
            }
        }
    }

    /// Writes all of `data` to the channel.
    ///
    /// Short writes and would-block are retried, waiting for the channel to
    /// become writable again, until everything is written or the channel
    /// fails or stalls.
    pub fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let id = self.id();
        let mut file = self.endpoint.as_ref().ok_or(ChannelError::NotOpen(id))?.file();
        let mut written = 0;
        while written < data.len() {
            match file.write(&data[written..]) {
                Ok(0) => return Err(ChannelError::Stalled(id)),
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if !wait_writable(file.as_fd(), WRITE_STALL_TIMEOUT_MS)
                        .map_err(|err| ChannelError::Io { id, err })?
                    {
                        return Err(ChannelError::Stalled(id));
                    }
                }
                Err(err) => return Err(ChannelError::Io { id, err }),
            }
        }
        Ok(written)
    }
}

fn wait_writable(fd: BorrowedFd<'_>, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a valid pollfd array of length 1 for the duration of
        // the call.
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms) }.syscall_result() {
            Ok(n) => break Ok(n > 0),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => break Err(err),
        }
    }
}

/// Opens a native CBC device for non-blocking reads and writes.
pub fn open_native(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
}

/// All the mediator's channels.
///
/// Built once by [`ChannelTable::open`]; read-only after that until
/// [`ChannelTable::close_all`].
pub struct ChannelTable {
    channels: Vec<Channel>,
}

impl ChannelTable {
    /// Opens every enabled channel in `configs`.
    ///
    /// Non-critical channels that fail to open are left closed. If a critical
    /// channel fails, everything opened so far is closed again and the error
    /// is returned.
    pub fn open(configs: Vec<ChannelConfig>, ptmx: &Path) -> Result<Self, OpenError> {
        let mut channels = Vec::with_capacity(configs.len());
        for config in configs {
            let endpoint = if config.enabled {
                Self::open_endpoint(&config, ptmx)?
            } else {
                None
            };
            channels.push(Channel { config, endpoint });
        }
        Ok(Self { channels })
    }

    fn open_endpoint(config: &ChannelConfig, ptmx: &Path) -> Result<Option<Endpoint>, OpenError> {
        match config.kind {
            ChannelKind::Native => match open_native(&config.path) {
                Ok(file) => Ok(Some(Endpoint::Native(file))),
                Err(err) if config.critical => Err(OpenError::Native {
                    id: config.id,
                    path: config.path.clone(),
                    err,
                }),
                Err(err) => {
                    tracing::warn!(
                        channel = %config.id,
                        path = %config.path.display(),
                        error = &err as &dyn std::error::Error,
                        "failed to open native channel, leaving it inert"
                    );
                    Ok(None)
                }
            },
            ChannelKind::VirtualUart => match pty::open_virtual_uart(&config.path, ptmx) {
                Ok(vuart) => {
                    tracing::info!(
                        link = %config.path.display(),
                        secondary = %vuart.secondary_path().display(),
                        "virtual uart ready"
                    );
                    Ok(Some(Endpoint::VirtualUart(vuart)))
                }
                // The virtual UART is always required.
                Err(err) => Err(OpenError::VirtualUart {
                    path: config.path.clone(),
                    err,
                }),
            },
        }
    }

    /// Iterates over every configured channel, open or not.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Looks up a channel by identity.
    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id() == id)
    }

    /// Looks up a channel by table index.
    pub(crate) fn by_index(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Reads once from channel `id`. See [`Channel::read`].
    pub fn read(&self, id: ChannelId, buf: &mut [u8]) -> Result<Option<usize>, ChannelError> {
        self.get(id).ok_or(ChannelError::NotOpen(id))?.read(buf)
    }

    /// Writes all of `data` to channel `id`. See [`Channel::write`].
    pub fn write(&self, id: ChannelId, data: &[u8]) -> Result<usize, ChannelError> {
        self.get(id).ok_or(ChannelError::NotOpen(id))?.write(data)
    }

    /// Closes every open channel. Safe to call more than once.
    pub fn close_all(&mut self) {
        for channel in &mut self.channels {
            if channel.endpoint.take().is_some() {
                tracing::debug!(channel = %channel.id(), "closed channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fifo_has_reader;
    use crate::test_helpers::mkfifo;

    #[test]
    fn default_table_shape() {
        let table = default_channel_table(Path::new("/run/ioc-vuart"));
        let ids: Vec<_> = table.iter().map(|c| c.id).collect();
        assert_eq!(ids, ChannelId::ALL);

        let critical: Vec<_> = table.iter().filter(|c| c.critical).map(|c| c.id).collect();
        assert_eq!(critical, [ChannelId::Lifecycle, ChannelId::VirtualUart]);

        let raw11 = table.iter().find(|c| c.id == ChannelId::Raw11).unwrap();
        assert_eq!(raw11.path, Path::new("/dev/cbc-raw11"));
        assert!(raw11.enabled);
        let esig = table.iter().find(|c| c.id == ChannelId::EarlySignal).unwrap();
        assert!(!esig.enabled);
    }

    #[test]
    fn missing_native_channel_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("cbc-raw0");
        mkfifo(&fifo);

        let table = ChannelTable::open(
            vec![
                ChannelConfig::native(ChannelId::Raw0, &fifo, true),
                ChannelConfig::native(ChannelId::Raw1, dir.path().join("missing"), true),
                ChannelConfig::native(ChannelId::Raw2, &fifo, false),
            ],
            Path::new("/dev/ptmx"),
        )
        .unwrap();

        assert!(table.get(ChannelId::Raw0).unwrap().is_open());
        assert!(!table.get(ChannelId::Raw1).unwrap().is_open());
        assert!(!table.get(ChannelId::Raw2).unwrap().is_open());
        assert!(matches!(
            table.write(ChannelId::Raw1, b"x"),
            Err(ChannelError::NotOpen(ChannelId::Raw1))
        ));
        assert!(matches!(
            table.read(ChannelId::Raw5, &mut [0; 4]),
            Err(ChannelError::NotOpen(ChannelId::Raw5))
        ));
    }

    #[test]
    fn missing_critical_channel_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("cbc-raw0");
        mkfifo(&fifo);

        let err = ChannelTable::open(
            vec![
                ChannelConfig::native(ChannelId::Raw0, &fifo, true),
                ChannelConfig::native(ChannelId::Lifecycle, dir.path().join("missing"), true)
                    .critical(),
            ],
            Path::new("/dev/ptmx"),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            OpenError::Native {
                id: ChannelId::Lifecycle,
                ..
            }
        ));
        // The channel opened before the failure was closed again.
        assert!(!fifo_has_reader(&fifo));
    }

    #[test]
    fn read_write_through_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("cbc-signals");
        mkfifo(&fifo);

        let mut table = ChannelTable::open(
            vec![ChannelConfig::native(ChannelId::Signal, &fifo, true)],
            Path::new("/dev/ptmx"),
        )
        .unwrap();

        let mut buf = [0; 16];
        assert_eq!(table.read(ChannelId::Signal, &mut buf).unwrap(), None);

        assert_eq!(table.write(ChannelId::Signal, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(table.read(ChannelId::Signal, &mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);

        assert!(fifo_has_reader(&fifo));
        table.close_all();
        table.close_all();
        assert!(!fifo_has_reader(&fifo));
        assert!(!table.get(ChannelId::Signal).unwrap().is_open());
    }
}
