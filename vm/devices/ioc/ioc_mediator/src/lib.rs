// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The IOC mediator.
//!
//! Bridges a guest's virtual UART, exposed as a pty, with the native CBC
//! character devices of an automotive I/O controller. Three threads do the
//! work:
//!
//! * `ioc_core` waits for data on every channel. Data from a native device
//!   becomes a tx request; data from the guest is framed into rx requests.
//! * `ioc_tx` runs the tx [`CbcHandler`] on each tx request.
//! * `ioc_rx` runs the rx [`CbcHandler`] on each rx request.
//!
//! Requests come from a fixed pool. When the pool runs dry, incoming data is
//! dropped with a warning rather than blocking the core thread.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]

pub mod channel;
mod dispatch;
mod epoll;
pub mod handler;
pub mod options;
pub mod pty;
pub mod queue;
pub mod request;
pub mod ring;
mod sys;
#[cfg(test)]
mod test_helpers;
mod worker;

pub use channel::default_channel_table;
pub use channel::ChannelConfig;
pub use channel::ChannelError;
pub use channel::ChannelId;
pub use channel::ChannelKind;
pub use channel::OpenError;
pub use handler::CbcConfig;
pub use handler::CbcHandler;
pub use handler::DiscardHandler;
pub use handler::HandlerContext;
pub use handler::PassthroughHandler;
pub use handler::Route;
pub use options::IocOptions;
pub use queue::QueueDepths;
pub use request::Request;

use channel::ChannelTable;
use dispatch::Dispatcher;
use epoll::Epoll;
use epoll::WakeEvent;
use handler::Direction;
use queue::QueueKind;
use queue::RequestQueues;
use request::RequestPool;
use request::IOC_MAX_REQUESTS;
use ring::LinkUnpacker;
use ring::RawUnpacker;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use worker::Worker;

/// The device whose presence indicates a CBC-attached platform.
pub const DEFAULT_PLATFORM_PROBE: &str = "/dev/cbc-early-signals";

/// State shared by the mediator's threads.
pub(crate) struct Shared {
    pub queues: RequestQueues,
    pub channels: ChannelTable,
    pub closing: AtomicBool,
}

/// Everything needed to start a mediator.
pub struct MediatorConfig {
    /// The pty multiplexer to allocate the virtual UART from.
    pub ptmx_path: PathBuf,
    /// Startup fails unless this path exists.
    pub platform_probe: PathBuf,
    /// Forwarded to the handlers for the lifecycle service.
    pub boot_reason: u32,
    /// Number of requests to allocate.
    pub pool_capacity: usize,
    /// The channel table, including the virtual UART.
    pub channels: Vec<ChannelConfig>,
    /// Signal and group tables for the rx handler.
    pub rx_config: CbcConfig,
    /// Signal and group tables for the tx handler.
    pub tx_config: CbcConfig,
    /// Processes guest-to-device requests.
    pub rx_handler: Box<dyn CbcHandler>,
    /// Processes device-to-guest requests.
    pub tx_handler: Box<dyn CbcHandler>,
    /// Finds link frames in bytes from the guest.
    pub unpacker: Box<dyn LinkUnpacker>,
}

impl MediatorConfig {
    /// The default configuration for `opts`: the full CBC channel table,
    /// native data passed through to the guest verbatim, and guest data
    /// discarded.
    pub fn new(opts: &IocOptions) -> Self {
        Self {
            ptmx_path: pty::DEFAULT_PTMX_PATH.into(),
            platform_probe: DEFAULT_PLATFORM_PROBE.into(),
            boot_reason: opts.boot_reason,
            pool_capacity: IOC_MAX_REQUESTS,
            channels: default_channel_table(&opts.virtual_uart_path),
            rx_config: CbcConfig::default(),
            tx_config: CbcConfig::default(),
            rx_handler: Box::new(DiscardHandler),
            tx_handler: Box::new(PassthroughHandler::new(ChannelId::VirtualUart)),
            unpacker: Box::new(RawUnpacker),
        }
    }
}

/// A failure to start the mediator.
#[derive(Debug, Error)]
pub enum InitError {
    /// The platform probe device is missing.
    #[error("platform does not support ioc: {} is unavailable", .0.display())]
    Unsupported(PathBuf, #[source] io::Error),
    /// The configured pool holds no requests.
    #[error("request pool capacity must be nonzero")]
    EmptyPool,
    /// The event multiplexer could not be set up.
    #[error("failed to set up the event multiplexer")]
    Epoll(#[source] io::Error),
    /// A critical channel could not be opened.
    #[error(transparent)]
    Channel(#[from] OpenError),
    /// A mediator thread could not be started.
    #[error("failed to spawn thread {name}")]
    Spawn {
        /// The thread name.
        name: &'static str,
        /// The failure.
        #[source]
        err: io::Error,
    },
}

/// A running IOC mediator.
///
/// Dropping the mediator shuts it down.
pub struct IocMediator {
    shared: Arc<Shared>,
    wake: Arc<WakeEvent>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
    core_thread: Option<JoinHandle<()>>,
    registered: Vec<ChannelId>,
    boot_reason: u32,
}

impl IocMediator {
    /// Opens the channels and starts the mediator threads.
    ///
    /// On failure, anything already opened or started is torn down again
    /// before returning.
    pub fn new(config: MediatorConfig) -> Result<Self, InitError> {
        Self::start(config).inspect_err(|err| {
            tracing::error!(
                error = err as &dyn std::error::Error,
                "ioc mediator startup failed"
            );
        })
    }

    fn start(config: MediatorConfig) -> Result<Self, InitError> {
        // Check before touching anything else, so an unsupported platform is
        // left exactly as it was.
        std::fs::metadata(&config.platform_probe)
            .map_err(|err| InitError::Unsupported(config.platform_probe.clone(), err))?;

        if config.pool_capacity == 0 {
            return Err(InitError::EmptyPool);
        }
        let queues = RequestQueues::new(RequestPool::new(config.pool_capacity));
        let epoll = Epoll::new().map_err(InitError::Epoll)?;
        let wake = Arc::new(WakeEvent::new().map_err(InitError::Epoll)?);
        let channels = ChannelTable::open(config.channels, &config.ptmx_path)?;

        let shared = Arc::new(Shared {
            queues,
            channels,
            closing: AtomicBool::new(false),
        });

        // From here on, dropping `this` stops whatever has been started.
        let mut this = Self {
            shared,
            wake,
            rx_thread: None,
            tx_thread: None,
            core_thread: None,
            registered: Vec::new(),
            boot_reason: config.boot_reason,
        };

        let dispatcher = Dispatcher::new(
            this.shared.clone(),
            epoll,
            this.wake.clone(),
            config.unpacker,
        )
        .map_err(InitError::Epoll)?;
        this.registered = dispatcher.registered();

        let rx = Worker {
            shared: this.shared.clone(),
            direction: Direction::Rx,
            handler: config.rx_handler,
            config: config.rx_config,
            boot_reason: config.boot_reason,
        };
        this.rx_thread = Some(spawn("ioc_rx", move || rx.run())?);

        let tx = Worker {
            shared: this.shared.clone(),
            direction: Direction::Tx,
            handler: config.tx_handler,
            config: config.tx_config,
            boot_reason: config.boot_reason,
        };
        this.tx_thread = Some(spawn("ioc_tx", move || tx.run())?);

        this.core_thread = Some(spawn("ioc_core", move || dispatcher.run())?);

        tracing::info!(
            channels = this.registered.len(),
            requests = this.shared.queues.capacity(),
            boot_reason = this.boot_reason,
            "ioc mediator started"
        );
        Ok(this)
    }

    /// Stops the threads and closes every channel.
    ///
    /// The core thread stops first so no new requests are produced, then the
    /// rx and tx workers. Requests still queued are abandoned. Calling this
    /// more than once is harmless.
    pub fn shutdown(&mut self) {
        self.shared.closing.store(true, Ordering::Release);

        if let Some(thread) = self.core_thread.take() {
            match self.wake.signal() {
                Ok(()) => join("ioc_core", thread),
                Err(err) => {
                    // The core thread cannot be woken; leave it parked.
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to wake ioc core thread"
                    );
                }
            }
        }

        if let Some(thread) = self.rx_thread.take() {
            self.shared.queues.wake_all(QueueKind::Rx);
            join("ioc_rx", thread);
        }
        if let Some(thread) = self.tx_thread.take() {
            self.shared.queues.wake_all(QueueKind::Tx);
            join("ioc_tx", thread);
        }

        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.channels.close_all();
        } else {
            tracing::warn!("ioc core thread still holds the channels");
        }
    }

    /// The channels the core thread listens on.
    pub fn registered_channels(&self) -> &[ChannelId] {
        &self.registered
    }

    /// Whether channel `id` has an open device.
    pub fn channel_is_open(&self, id: ChannelId) -> bool {
        self.shared.channels.get(id).is_some_and(|c| c.is_open())
    }

    /// The current depth of the free, rx and tx queues.
    pub fn queue_depths(&self) -> QueueDepths {
        self.shared.queues.depths()
    }

    /// The number of requests in the pool.
    pub fn pool_capacity(&self) -> usize {
        self.shared.queues.capacity()
    }

    /// The boot reason the mediator was started with.
    pub fn boot_reason(&self) -> u32 {
        self.boot_reason
    }
}

impl Drop for IocMediator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn(
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, InitError> {
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|err| InitError::Spawn { name, err })
}

fn join(name: &str, thread: JoinHandle<()>) {
    if thread.join().is_err() {
        tracing::error!(thread = name, "ioc thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestType;
    use crate::test_helpers::fifo_has_reader;
    use crate::test_helpers::init_tracing;
    use crate::test_helpers::mkfifo;
    use crate::test_helpers::read_exact_timeout;
    use std::fs::File;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Rig {
        dir: TempDir,
        link: PathBuf,
    }

    impl Rig {
        fn new() -> Self {
            init_tracing();
            let dir = tempfile::tempdir().unwrap();
            File::create(dir.path().join("probe")).unwrap();
            let link = dir.path().join("vuart");
            Self { dir, link }
        }

        fn fifo(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            mkfifo(&path);
            path
        }

        fn config(&self, mut channels: Vec<ChannelConfig>) -> MediatorConfig {
            let mut config = MediatorConfig::new(&IocOptions {
                virtual_uart_path: self.link.clone(),
                boot_reason: 0x21,
            });
            config.platform_probe = self.dir.path().join("probe");
            channels.push(ChannelConfig::virtual_uart(&self.link));
            config.channels = channels;
            config
        }

        fn open_guest(&self) -> File {
            OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(&self.link)
                .unwrap()
        }
    }

    fn handler(
        f: impl FnMut(&mut Request, &HandlerContext<'_>) -> Route + Send + 'static,
    ) -> Box<dyn CbcHandler> {
        Box::new(f)
    }

    fn shutdown_within(mut mediator: IocMediator, timeout: Duration) -> IocMediator {
        let (send, recv) = mpsc::channel();
        std::thread::spawn(move || {
            mediator.shutdown();
            send.send(mediator).ok();
        });
        recv.recv_timeout(timeout).expect("shutdown did not finish")
    }

    #[test]
    fn unsupported_platform_has_no_side_effects() {
        let rig = Rig::new();
        let mut config = rig.config(Vec::new());
        config.platform_probe = rig.dir.path().join("missing");
        let err = IocMediator::new(config).err().unwrap();
        assert!(matches!(err, InitError::Unsupported(..)));
        assert!(std::fs::symlink_metadata(&rig.link).is_err());
    }

    #[test]
    fn virtual_uart_failure_aborts_startup() {
        let rig = Rig::new();
        let lifecycle = rig.fifo("cbc-lifecycle");
        let mut config = rig.config(vec![ChannelConfig::native(
            ChannelId::Lifecycle,
            &lifecycle,
            true,
        )
        .critical()]);
        config.ptmx_path = rig.dir.path().join("no-ptmx");

        let err = IocMediator::new(config).err().unwrap();
        assert!(matches!(
            err,
            InitError::Channel(OpenError::VirtualUart { .. })
        ));
        assert!(!fifo_has_reader(&lifecycle));
        assert!(std::fs::symlink_metadata(&rig.link).is_err());
    }

    #[test]
    fn absent_native_channel_is_never_registered() {
        let rig = Rig::new();
        let raw0 = rig.fifo("cbc-raw0");
        let config = rig.config(vec![
            ChannelConfig::native(ChannelId::Raw0, &raw0, true),
            ChannelConfig::native(ChannelId::Raw1, rig.dir.path().join("cbc-raw1"), true),
            ChannelConfig::native(ChannelId::Dlt, rig.dir.path().join("cbc-dlt"), false),
        ]);

        let mediator = IocMediator::new(config).unwrap();
        assert!(mediator.channel_is_open(ChannelId::Raw0));
        assert!(!mediator.channel_is_open(ChannelId::Raw1));
        assert!(!mediator.channel_is_open(ChannelId::Dlt));
        assert!(!mediator.channel_is_open(ChannelId::Signal));
        assert_eq!(
            mediator.registered_channels(),
            [ChannelId::Raw0, ChannelId::VirtualUart]
        );
        assert_eq!(mediator.boot_reason(), 0x21);
        assert_eq!(mediator.pool_capacity(), IOC_MAX_REQUESTS);
    }

    #[test]
    fn native_frame_reaches_guest_verbatim() {
        let rig = Rig::new();
        let raw0 = rig.fifo("cbc-raw0");
        let mediator = IocMediator::new(rig.config(vec![ChannelConfig::native(
            ChannelId::Raw0,
            &raw0,
            true,
        )]))
        .unwrap();
        let guest = rig.open_guest();

        let frame = [0x7e, 0x01, 0x02, 0x7e];
        let mut device = OpenOptions::new().write(true).open(&raw0).unwrap();
        device.write_all(&frame).unwrap();

        assert_eq!(read_exact_timeout(&guest, frame.len(), 5).unwrap(), frame);

        let mediator = shutdown_within(mediator, Duration::from_secs(5));
        assert_eq!(mediator.queue_depths().total(), mediator.pool_capacity());
        assert!(!fifo_has_reader(&raw0));
        assert!(std::fs::symlink_metadata(&rig.link).is_err());
    }

    #[test]
    fn forwarded_guest_frame_is_echoed() {
        let rig = Rig::new();
        let mut config = rig.config(Vec::new());
        config.rx_handler = handler(|req, cx| {
            assert_eq!(cx.direction, Direction::Rx);
            assert_eq!(req.rtype, RequestType::Raw);
            assert_eq!(req.channel, ChannelId::VirtualUart);
            Route::Forward
        });
        let mediator = IocMediator::new(config).unwrap();

        let guest = rig.open_guest();
        (&guest).write_all(b"ping").unwrap();
        assert_eq!(read_exact_timeout(&guest, 4, 5).unwrap(), b"ping");

        drop(mediator);
        assert!(std::fs::symlink_metadata(&rig.link).is_err());
    }

    #[test]
    fn shutdown_with_queued_work() {
        let rig = Rig::new();
        let mut config = rig.config(Vec::new());
        config.pool_capacity = 32;
        config.tx_handler = handler(|_, _| {
            std::thread::sleep(Duration::from_millis(20));
            Route::Release
        });
        let mediator = IocMediator::new(config).unwrap();

        let queues = &mediator.shared.queues;
        for _ in 0..mediator.pool_capacity() {
            let req = queues.dequeue_free().unwrap();
            queues.enqueue(QueueKind::Tx, req, false);
        }

        let mediator = shutdown_within(mediator, Duration::from_secs(5));
        let depths = mediator.queue_depths();
        assert_eq!(depths.total(), 32);
        assert_eq!(depths.rx, 0);
        assert!(!mediator.channel_is_open(ChannelId::VirtualUart));
    }

    #[test]
    fn idle_shutdown_is_prompt_and_repeatable() {
        let rig = Rig::new();
        let mediator = IocMediator::new(rig.config(Vec::new())).unwrap();
        let mut mediator = shutdown_within(mediator, Duration::from_secs(5));
        mediator.shutdown();
        assert_eq!(mediator.queue_depths().free, mediator.pool_capacity());
        assert!(std::fs::symlink_metadata(&rig.link).is_err());
    }
}
