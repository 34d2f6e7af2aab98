// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing of the `<path>[,<boot reason>]` startup string.

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// The mediator's startup options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocOptions {
    /// Where to publish the virtual UART's pty secondary.
    pub virtual_uart_path: PathBuf,
    /// The boot reason forwarded to the lifecycle service.
    pub boot_reason: u32,
}

/// An unusable startup string.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// No virtual UART path was given.
    #[error("missing virtual uart path")]
    MissingPath,
}

impl FromStr for IocOptions {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, reason) = match s.split_once(',') {
            Some((path, reason)) => (path, Some(reason)),
            None => (s, None),
        };
        if path.is_empty() {
            return Err(OptionsError::MissingPath);
        }
        Ok(Self {
            virtual_uart_path: path.into(),
            boot_reason: reason.map_or(0, parse_boot_reason),
        })
    }
}

/// Parses a number the way `strtoul(s, NULL, 0)` does, truncated to 32 bits.
///
/// Leading whitespace and a sign are accepted, the base comes from the prefix
/// (`0x` for hex, `0` for octal), and parsing stops at the first character
/// that is not a digit in that base. Text with no digits at all parses as 0.
pub fn parse_boot_reason(s: &str) -> u32 {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let bytes = s.as_bytes();
    let (radix, digits) = match bytes {
        [b'0', b'x' | b'X', next, ..] if next.is_ascii_hexdigit() => (16, &bytes[2..]),
        [b'0', ..] => (8, bytes),
        _ => (10, bytes),
    };

    let mut value: u64 = 0;
    let mut overflow = false;
    for &b in digits {
        let Some(digit) = (b as char).to_digit(radix) else {
            break;
        };
        match value
            .checked_mul(radix.into())
            .and_then(|v| v.checked_add(digit.into()))
        {
            Some(v) => value = v,
            None => overflow = true,
        }
    }

    // Out-of-range input saturates without regard to sign.
    let value = if overflow {
        u64::MAX
    } else if negative {
        value.wrapping_neg()
    } else {
        value
    };
    value as u32
}
