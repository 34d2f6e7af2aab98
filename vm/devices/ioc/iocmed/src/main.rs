// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host process for the IOC mediator.
//!
//! Runs until interrupted, then shuts the mediator down cleanly.

#[cfg(target_os = "linux")]
mod cli_args;
#[cfg(target_os = "linux")]
mod tracing_init;

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    use clap::Parser;

    tracing_init::enable_tracing()?;
    run(cli_args::Options::parse())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("iocmed is only supported on linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn run(opts: cli_args::Options) -> anyhow::Result<()> {
    use anyhow::Context;
    use ioc_mediator::IocMediator;
    use ioc_mediator::MediatorConfig;

    let mut config = MediatorConfig::new(&opts.ioc);
    config.pool_capacity = opts.requests;
    if let Some(ptmx) = opts.ptmx {
        config.ptmx_path = ptmx;
    }
    if let Some(probe) = opts.probe {
        config.platform_probe = probe;
    }

    let mut mediator = IocMediator::new(config).context("failed to start ioc mediator")?;

    let (stop_send, stop_recv) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_send.send(());
    })
    .context("failed to set ctrl-c handler")?;

    // An error here means the handler is gone, which is as good as a signal.
    let _ = stop_recv.recv();
    tracing::info!("shutting down ioc mediator");
    mediator.shutdown();
    Ok(())
}
