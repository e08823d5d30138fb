/*
 * SPDX-FileCopyrightText: 2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{self, status},
    flash::{self, FlashArea},
    mfg::{self, Mfg},
};

const BLOB_EXTENSION: &str = "bin";

fn read_areas(path: &Path) -> Result<Vec<FlashArea>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read flash area list: {path:?}"))?;
    let areas = flash::parse_area_list(&text)
        .with_context(|| format!("Failed to parse flash area list: {path:?}"))?;

    Ok(areas)
}

/// Read every `<name>.bin` file in a directory.
fn read_blobs(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut blobs = BTreeMap::new();

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory: {dir:?}"))? {
        let entry = entry.with_context(|| format!("Failed to read directory entry: {dir:?}"))?;
        let path = entry.path();

        if path.extension().is_none_or(|e| e != BLOB_EXTENSION) {
            continue;
        }

        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let data = fs::read(&path).with_context(|| format!("Failed to read blob: {path:?}"))?;
        blobs.insert(name.to_owned(), data);
    }

    Ok(blobs)
}

/// Apply an in-place edit to a binary and optionally recompute the hash of
/// its meta region.
fn patch_binary(
    group: &PatchGroup,
    edit: impl FnOnce(&mut Vec<u8>) -> Result<()>,
) -> Result<()> {
    let mut data = fs::read(&group.input)
        .with_context(|| format!("Failed to read binary: {:?}", group.input))?;

    edit(&mut data)?;

    if let Some(end) = group.end {
        let mut mfg = Mfg::parse(&data, Some(end))
            .with_context(|| format!("Failed to find meta region ending at {end:#x}"))?;
        mfg.recalc_hash(group.erase_val)
            .context("Failed to recompute meta region hash")?;

        status!("New meta region hash: {}", hex::encode(mfg.hash()?));

        data = mfg.to_bytes(group.erase_val)?;
    }

    fs::write(&group.output, data)
        .with_context(|| format!("Failed to write binary: {:?}", group.output))?;

    Ok(())
}

fn split_subcommand(cli: &SplitCli) -> Result<()> {
    let areas = read_areas(&cli.areas)?;
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read binary: {:?}", cli.input))?;

    let blobs = mfg::split(&data, cli.device, &areas, cli.erase_val)
        .context("Failed to split binary")?;

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_dir))?;

    for (name, blob) in &blobs {
        let path = cli.output_dir.join(format!("{name}.{BLOB_EXTENSION}"));
        fs::write(&path, blob).with_context(|| format!("Failed to write blob: {path:?}"))?;

        status!("Wrote {name}: {} bytes", blob.len());
    }

    Ok(())
}

fn join_subcommand(cli: &JoinCli) -> Result<()> {
    let areas = read_areas(&cli.areas)?;
    let blobs = read_blobs(&cli.input_dir)?;

    let data = mfg::join(&blobs, cli.erase_val, &areas).context("Failed to join blobs")?;

    fs::write(&cli.output, &data)
        .with_context(|| format!("Failed to write binary: {:?}", cli.output))?;

    status!("Joined {} blobs into {} bytes", blobs.len(), data.len());

    Ok(())
}

fn replace_isk_subcommand(cli: &ReplaceCli) -> Result<()> {
    let old = fs::read(&cli.old).with_context(|| format!("Failed to read key: {:?}", cli.old))?;
    let new = fs::read(&cli.new).with_context(|| format!("Failed to read key: {:?}", cli.new))?;

    patch_binary(&cli.patch, |data| {
        mfg::replace_isk(data, &old, &new).context("Failed to replace image signing key")
    })
}

fn replace_kek_subcommand(cli: &ReplaceCli) -> Result<()> {
    let old = fs::read(&cli.old).with_context(|| format!("Failed to read KEK: {:?}", cli.old))?;
    let new = fs::read(&cli.new).with_context(|| format!("Failed to read KEK: {:?}", cli.new))?;

    patch_binary(&cli.patch, |data| {
        mfg::replace_kek(data, &old, &new).context("Failed to replace key-encryption key")
    })
}

pub fn mfg_main(cli: &MfgCli) -> Result<()> {
    match &cli.command {
        MfgCommand::Split(c) => split_subcommand(c),
        MfgCommand::Join(c) => join_subcommand(c),
        MfgCommand::ReplaceIsk(c) => replace_isk_subcommand(c),
        MfgCommand::ReplaceKek(c) => replace_kek_subcommand(c),
    }
}

#[derive(Debug, Args)]
struct PatchGroup {
    /// Path to input binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Offset where the meta region ends.
    ///
    /// If specified, the meta region's hash is recomputed after patching.
    #[arg(long, value_name = "OFFSET", value_parser = cli::parse_int::<usize>)]
    end: Option<usize>,

    /// Value of erased flash bytes.
    #[arg(long, value_name = "BYTE", default_value = "0xff", value_parser = cli::parse_int::<u8>)]
    erase_val: u8,
}

/// Split a manufacturing binary into one file per flash area.
///
/// Trailing erased bytes are stripped from each file.
#[derive(Debug, Parser)]
struct SplitCli {
    /// Path to input binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to TOML flash area list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    areas: PathBuf,

    /// Flash device ID.
    #[arg(short, long, value_name = "ID", default_value_t = 0, value_parser = cli::parse_int::<u8>)]
    device: u8,

    /// Directory to write `<area>.bin` files to.
    #[arg(long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,

    /// Value of erased flash bytes.
    #[arg(long, value_name = "BYTE", default_value = "0xff", value_parser = cli::parse_int::<u8>)]
    erase_val: u8,
}

/// Join `<area>.bin` files into a manufacturing binary.
#[derive(Debug, Parser)]
struct JoinCli {
    /// Directory containing `<area>.bin` files.
    #[arg(long, value_name = "DIR", value_parser)]
    input_dir: PathBuf,

    /// Path to TOML flash area list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    areas: PathBuf,

    /// Path to output binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Value of erased flash bytes.
    #[arg(long, value_name = "BYTE", default_value = "0xff", value_parser = cli::parse_int::<u8>)]
    erase_val: u8,
}

/// Replace a key embedded in a manufacturing binary.
#[derive(Debug, Parser)]
struct ReplaceCli {
    #[command(flatten)]
    patch: PatchGroup,

    /// Path to file containing the old raw key bytes.
    #[arg(long, value_name = "FILE", value_parser)]
    old: PathBuf,

    /// Path to file containing the new raw key bytes.
    #[arg(long, value_name = "FILE", value_parser)]
    new: PathBuf,
}

#[derive(Debug, Subcommand)]
enum MfgCommand {
    Split(SplitCli),
    Join(JoinCli),
    /// Replace the image signing key. Both keys must have the same length.
    ReplaceIsk(ReplaceCli),
    /// Replace the length-prefixed key-encryption key.
    ReplaceKek(ReplaceCli),
}

/// Split, join, and patch manufacturing binaries.
#[derive(Debug, Parser)]
pub struct MfgCli {
    #[command(subcommand)]
    command: MfgCommand,
}
