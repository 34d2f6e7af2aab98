// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CLI argument parsing.
//!
//! Only turns strings into typed values; nothing here opens a device.

use clap::Parser;
use ioc_mediator::request::IOC_MAX_REQUESTS;
use ioc_mediator::IocOptions;
use std::path::PathBuf;

/// IOC mediator: bridges a guest's virtual UART with the host's CBC devices.
#[derive(Parser, Debug)]
pub struct Options {
    /// where to publish the virtual UART, and an optional boot reason
    #[clap(long, value_name = "PATH[,REASON]")]
    pub ioc: IocOptions,

    /// number of requests in the pool
    #[clap(long, value_name = "COUNT", default_value_t = IOC_MAX_REQUESTS)]
    pub requests: usize,

    /// pty multiplexer to allocate the virtual UART from
    #[clap(long, value_name = "PATH")]
    pub ptmx: Option<PathBuf>,

    /// device whose presence marks a supported platform
    #[clap(long, value_name = "PATH")]
    pub probe: Option<PathBuf>,
}
