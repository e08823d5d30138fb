/*
 * SPDX-FileCopyrightText: 2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::{
    cli::{self, status, warning},
    format::meta::{self, MetaFlashArea, MetaFooter, MetaMmrRef, meta_tlv_type_name},
    mfg::Mfg,
};

#[derive(Serialize)]
struct MetaTlvInfo {
    index: usize,
    offset: usize,
    name: &'static str,
    tlv_type: u8,
    data: String,
}

#[derive(Serialize)]
struct MmrInfo {
    offset: usize,
    size: usize,
    hash: String,
    hash_valid: bool,
    footer: MetaFooter,
    tlvs: Vec<MetaTlvInfo>,
    flash_areas: Vec<MetaFlashArea>,
    mmr_refs: Vec<MetaMmrRef>,
}

fn read_mfg(path: &Path, end: Option<usize>) -> Result<Mfg> {
    let data = fs::read(path).with_context(|| format!("Failed to read binary: {path:?}"))?;
    let end = end.unwrap_or(data.len());
    let mfg = Mfg::parse(&data, Some(end))
        .with_context(|| format!("Failed to find meta region ending at {end:#x}: {path:?}"))?;

    Ok(mfg)
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let mfg = read_mfg(&cli.input, cli.end)?;
    let meta = mfg.meta.as_ref().context("Binary has no meta region")?;

    // The region lies within the binary, so the erase value is never used.
    let (rehashed, _) = meta::recalc_hash(meta, mfg.meta_off, &mfg.bin, 0xff)
        .context("Failed to compute meta region hash")?;
    let hash = meta.hash().context("Failed to get meta region hash")?;
    let hash_valid = rehashed.hash()? == hash;

    if !hash_valid {
        warning!("Stored hash does not match the binary contents");
    }

    let offsets = meta.offsets();
    let tlvs = meta
        .tlvs
        .iter()
        .zip(&offsets.tlvs)
        .enumerate()
        .map(|(index, (t, o))| MetaTlvInfo {
            index,
            offset: mfg.meta_off + o,
            name: meta_tlv_type_name(t.tlv_type),
            tlv_type: t.tlv_type,
            data: hex::encode(&t.data),
        })
        .collect();

    let info = MmrInfo {
        offset: mfg.meta_off,
        size: offsets.total_size,
        hash: hex::encode(hash),
        hash_valid,
        footer: meta.footer,
        tlvs,
        flash_areas: meta.flash_areas()?,
        mmr_refs: meta.mmr_refs()?,
    };

    let data = toml_edit::ser::to_string_pretty(&info).context("Failed to serialize MMR info")?;
    print!("{data}");

    Ok(())
}

fn rehash_subcommand(cli: &RehashCli) -> Result<()> {
    let mut mfg = read_mfg(&cli.input, cli.end)?;
    mfg.recalc_hash(cli.erase_val)
        .context("Failed to recompute meta region hash")?;

    status!("New hash: {}", hex::encode(mfg.hash()?));

    let data = mfg.to_bytes(cli.erase_val)?;
    fs::write(&cli.output, data)
        .with_context(|| format!("Failed to write binary: {:?}", cli.output))?;

    Ok(())
}

pub fn mmr_main(cli: &MmrCli) -> Result<()> {
    match &cli.command {
        MmrCommand::Info(c) => info_subcommand(c),
        MmrCommand::Rehash(c) => rehash_subcommand(c),
    }
}

/// Show the contents of a manufacturing meta region.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Offset where the meta region ends. Defaults to the end of the file.
    #[arg(long, value_name = "OFFSET", value_parser = cli::parse_int::<usize>)]
    end: Option<usize>,
}

/// Recompute the hash stored in a manufacturing meta region.
#[derive(Debug, Parser)]
struct RehashCli {
    /// Path to input binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Offset where the meta region ends. Defaults to the end of the file.
    #[arg(long, value_name = "OFFSET", value_parser = cli::parse_int::<usize>)]
    end: Option<usize>,

    /// Value of erased flash bytes.
    #[arg(long, value_name = "BYTE", default_value = "0xff", value_parser = cli::parse_int::<u8>)]
    erase_val: u8,
}

#[derive(Debug, Subcommand)]
enum MmrCommand {
    Info(InfoCli),
    Rehash(RehashCli),
}

/// Inspect and update manufacturing meta regions (MMRs).
#[derive(Debug, Parser)]
pub struct MmrCli {
    #[command(subcommand)]
    command: MmrCommand,
}
