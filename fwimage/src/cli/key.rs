/*
 * SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::{
    cli::{PassphraseGroup, status},
    crypto::{self, KeyKind, PassphraseSource, PublicKey},
    format::image::tlv_type_name,
};

pub(crate) fn get_passphrase_source(group: &PassphraseGroup, key_path: &Path) -> PassphraseSource {
    PassphraseSource::new(
        key_path,
        group.pass_file.as_deref(),
        group.pass_env_var.as_deref(),
    )
}

/// Load a public key directly or derive it from a private key.
fn load_public_key(
    input: &PublicKeyInputGroup,
    passphrase: &PassphraseGroup,
) -> Result<PublicKey> {
    if let Some(p) = &input.key {
        let source = get_passphrase_source(passphrase, p);
        let private_key = crypto::read_sign_key_file(p, &source)
            .with_context(|| format!("Failed to load key: {p:?}"))?;

        Ok(private_key.public_key())
    } else if let Some(p) = &input.public_key {
        crypto::read_public_key_file(p).with_context(|| format!("Failed to load public key: {p:?}"))
    } else {
        unreachable!()
    }
}

#[derive(Serialize)]
struct KeyInfo {
    algorithm: &'static str,
    key_hash: String,
    signature_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    legacy_signature_type: Option<String>,
}

impl KeyInfo {
    fn new(key: &PublicKey) -> Result<Self> {
        let key_hash = key.key_hash().context("Failed to compute key hash")?;
        let sig_tlv_type = key
            .sig_tlv_type()
            .context("Key cannot be used for signing images")?;

        Ok(Self {
            algorithm: key.algorithm_name(),
            key_hash: hex::encode(key_hash),
            signature_type: format!("{} ({sig_tlv_type:#04x})", tlv_type_name(sig_tlv_type)),
            legacy_signature_type: key
                .legacy_sig_tlv_type()
                .ok()
                .map(|t| format!("{t:#04x}")),
        })
    }
}

pub fn key_main(cli: &KeyCli) -> Result<()> {
    match &cli.command {
        KeyCommand::Generate(c) => {
            let source = get_passphrase_source(&c.passphrase, &c.output);
            let mut rng = rand::thread_rng();

            let kind = c.key_type.into();
            status!("Generating {kind:?} key");

            let private_key = crypto::generate_sign_key(kind, &mut rng)
                .with_context(|| format!("Failed to generate {kind:?} key"))?;

            crypto::write_pem_key_file(&c.output, &private_key, &source, &mut rng)
                .with_context(|| format!("Failed to write private key: {:?}", c.output))?;
        }
        KeyCommand::Info(c) => {
            let public_key = load_public_key(&c.input, &c.passphrase)?;
            let info = KeyInfo::new(&public_key)?;

            let data =
                toml_edit::ser::to_string_pretty(&info).context("Failed to serialize key info")?;
            print!("{data}");
        }
        KeyCommand::ExtractPublic(c) => {
            let public_key = load_public_key(&c.input, &c.passphrase)?;
            let pem = public_key
                .to_pem()
                .context("Failed to encode public key")?;

            fs::write(&c.output, pem)
                .with_context(|| format!("Failed to write public key: {:?}", c.output))?;
        }
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyType {
    Rsa2048,
    Rsa3072,
    P224,
    P256,
    Ed25519,
}

impl From<KeyType> for KeyKind {
    fn from(value: KeyType) -> Self {
        match value {
            KeyType::Rsa2048 => Self::Rsa2048,
            KeyType::Rsa3072 => Self::Rsa3072,
            KeyType::P224 => Self::EcP224,
            KeyType::P256 => Self::EcP256,
            KeyType::Ed25519 => Self::Ed25519,
        }
    }
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct PublicKeyInputGroup {
    /// Path to private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: Option<PathBuf>,

    /// Path to public key.
    #[arg(short, long, value_name = "FILE", value_parser, conflicts_with_all = ["pass_env_var", "pass_file"])]
    public_key: Option<PathBuf>,
}

/// Generate a signing key.
///
/// The output is saved in the standard PKCS8 format. If a passphrase is
/// given, the key is encrypted.
#[derive(Debug, Parser)]
struct GenerateCli {
    /// Path to output private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Key algorithm.
    #[arg(short = 't', long = "type", value_name = "TYPE", value_enum, default_value = "p256")]
    key_type: KeyType,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

/// Show the key hash and signature type of a key.
#[derive(Debug, Parser)]
struct InfoCli {
    #[command(flatten)]
    input: PublicKeyInputGroup,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

/// Extract the public key from a private key.
#[derive(Debug, Parser)]
struct ExtractPublicCli {
    /// Path to output PEM public key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    input: PublicKeyInputGroup,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    Generate(GenerateCli),
    Info(InfoCli),
    ExtractPublic(ExtractPublicCli),
}

/// Generate and inspect keys.
#[derive(Debug, Parser)]
pub struct KeyCli {
    #[command(subcommand)]
    command: KeyCommand,
}
