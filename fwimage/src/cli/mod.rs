/*
 * SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{ffi::OsString, path::PathBuf};

use clap::Args;

pub mod args;
pub mod completion;
pub mod image;
pub mod key;
pub mod mfg;
pub mod mmr;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        println!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;

#[derive(Debug, Args)]
pub(crate) struct PassphraseGroup {
    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pub(crate) pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pub(crate) pass_file: Option<PathBuf>,
}

/// Parse an integer in decimal or, with a `0x` prefix, hexadecimal.
pub(crate) fn parse_int<T: TryFrom<u64>>(s: &str) -> Result<T, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("Invalid integer: {s:?}: {e}"))?;

    T::try_from(value).map_err(|_| format!("Integer out of range: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integers() {
        assert_eq!(parse_int::<u8>("0xff"), Ok(0xff));
        assert_eq!(parse_int::<u32>("4096"), Ok(4096));
        assert_eq!(parse_int::<usize>("0X1000"), Ok(0x1000));
        assert!(parse_int::<u8>("0x100").is_err());
        assert!(parse_int::<u8>("-1").is_err());
        assert!(parse_int::<u16>("").is_err());
    }
}
