/*
 * SPDX-FileCopyrightText: 2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::{
    cli::{self, PassphraseGroup, key::get_passphrase_source, status, warning},
    create::{DEFAULT_HEADER_SIZE, ImageCreator, LegacyCreator},
    crypto::{self, RsaPadding, SignKey},
    format::{
        image::{Image, ImageFlags, ImageHeader, ImageOffsets, ImageVersion, Tlv, tlv_type_name},
        legacy::{IMAGE_V1_MAGIC, LegacyHeader, LegacyImage, legacy_tlv_type_name},
    },
    secret::{self, DecryptKey},
    stream::FromReader,
    verify,
};

/// Whether the data starts with the legacy image magic.
fn is_legacy(data: &[u8]) -> bool {
    data.get(..4)
        .is_some_and(|m| m == IMAGE_V1_MAGIC.to_le_bytes())
}

fn parse_hex_arg(value: Option<&str>) -> Result<Option<Vec<u8>>> {
    value
        .map(|v| hex::decode(v).with_context(|| format!("Invalid hex string: {v:?}")))
        .transpose()
}

fn read_image(path: &Path) -> Result<Image> {
    let reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {path:?}"))?;
    let image =
        Image::from_reader(reader).with_context(|| format!("Failed to read image: {path:?}"))?;

    Ok(image)
}

fn load_sign_keys(paths: &[PathBuf], passphrase: &PassphraseGroup) -> Result<Vec<SignKey>> {
    paths
        .iter()
        .map(|p| {
            let source = get_passphrase_source(passphrase, p);
            crypto::read_sign_key_file(p, &source)
                .with_context(|| format!("Failed to load key: {p:?}"))
        })
        .collect()
}

fn load_decrypt_key(
    group: &DecryptKeyGroup,
    passphrase: &PassphraseGroup,
) -> Result<Option<DecryptKey>> {
    if let Some(p) = &group.decrypt_key {
        let source = get_passphrase_source(passphrase, p);
        let key = crypto::read_sign_key_file(p, &source)
            .with_context(|| format!("Failed to load key: {p:?}"))?;

        match key {
            SignKey::Rsa(k) => Ok(Some(DecryptKey::Rsa(k))),
            k => bail!("Decryption key must be an RSA key, not {}: {p:?}", k.algorithm_name()),
        }
    } else if let Some(p) = &group.kek {
        let data = fs::read(p).with_context(|| format!("Failed to read KEK: {p:?}"))?;
        let key = DecryptKey::from_kek_base64(&data)
            .with_context(|| format!("Failed to parse KEK: {p:?}"))?;

        Ok(Some(key))
    } else {
        Ok(None)
    }
}

#[derive(Serialize)]
struct TlvInfo {
    index: usize,
    offset: usize,
    name: &'static str,
    tlv_type: u8,
    len: usize,
    data: String,
}

impl TlvInfo {
    fn new(index: usize, offset: usize, tlv: &Tlv, name: &'static str) -> Self {
        Self {
            index,
            offset,
            name,
            tlv_type: tlv.tlv_type,
            len: tlv.data.len(),
            data: hex::encode(&tlv.data),
        }
    }
}

#[derive(Serialize)]
struct ImageInfo {
    header: ImageHeader,
    offsets: ImageOffsets,
    tlvs: Vec<TlvInfo>,
}

#[derive(Serialize)]
struct LegacyImageInfo {
    header: LegacyHeader,
    tlvs: Vec<TlvInfo>,
}

fn create_subcommand(cli: &CreateCli) -> Result<()> {
    let body = fs::read(&cli.input)
        .with_context(|| format!("Failed to read image body: {:?}", cli.input))?;
    let sign_keys = load_sign_keys(&cli.keys, &cli.passphrase)?;
    let initial_hash = parse_hex_arg(cli.initial_hash.as_deref())?;
    let mut rng = rand::thread_rng();

    let data = if cli.legacy {
        let mut creator = LegacyCreator::new(body, cli.version);
        creator.sign_keys = sign_keys;
        creator.key_id = cli.key_id;
        creator.initial_hash = initial_hash;
        creator.header_size = cli.header_size;
        creator.rsa_padding = if cli.pkcs1 {
            RsaPadding::Pkcs1v15
        } else {
            RsaPadding::Pss
        };

        let image = creator
            .create(&mut rng)
            .context("Failed to create legacy image")?;
        status!("Legacy image hash: {}", hex::encode(image.hash()?));

        image.to_bytes().context("Failed to serialize legacy image")?
    } else {
        let enc_key = cli
            .enc_key
            .as_ref()
            .map(|p| fs::read(p).with_context(|| format!("Failed to read encryption key: {p:?}")))
            .transpose()?;

        let creator = ImageCreator {
            body,
            version: cli.version,
            sign_keys,
            enc_key,
            initial_hash,
            header_size: cli.header_size,
        };

        let image = creator.create(&mut rng).context("Failed to create image")?;
        status!("Image hash: {}", hex::encode(image.hash()?));

        image.to_bytes().context("Failed to serialize image")?
    };

    fs::write(&cli.output, data)
        .with_context(|| format!("Failed to write image: {:?}", cli.output))?;

    Ok(())
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read image: {:?}", cli.input))?;

    let output = if is_legacy(&data) {
        let image = LegacyImage::parse(&data)
            .with_context(|| format!("Failed to parse legacy image: {:?}", cli.input))?;

        let mut offset = usize::from(image.header.header_size) + image.body.len();
        let mut tlvs = vec![];
        for (index, tlv) in image.tlvs.iter().enumerate() {
            tlvs.push(TlvInfo::new(index, offset, tlv, legacy_tlv_type_name(tlv.tlv_type)));
            offset += tlv.size();
        }

        let info = LegacyImageInfo {
            header: image.header,
            tlvs,
        };

        toml_edit::ser::to_string_pretty(&info)
    } else {
        let image = Image::parse(&data)
            .with_context(|| format!("Failed to parse image: {:?}", cli.input))?;
        let offsets = image.offsets();

        let tlvs = image
            .tlvs
            .iter()
            .zip(&offsets.tlvs)
            .enumerate()
            .map(|(i, (t, o))| TlvInfo::new(i, *o, t, tlv_type_name(t.tlv_type)))
            .collect();

        let info = ImageInfo {
            header: image.header,
            offsets,
            tlvs,
        };

        toml_edit::ser::to_string_pretty(&info)
    }
    .context("Failed to serialize image info")?;

    print!("{output}");

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli) -> Result<()> {
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read image: {:?}", cli.input))?;
    let initial_hash = parse_hex_arg(cli.initial_hash.as_deref())?;
    let keys = cli
        .keys
        .iter()
        .map(|p| {
            crypto::read_public_key_file(p)
                .with_context(|| format!("Failed to load public key: {p:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    if is_legacy(&data) {
        let image = LegacyImage::parse(&data)
            .with_context(|| format!("Failed to parse legacy image: {:?}", cli.input))?;

        let key = match keys.as_slice() {
            [] => None,
            [key] => Some(key),
            _ => bail!("Legacy images have at most one signature"),
        };

        verify::verify_legacy(&image, initial_hash.as_deref(), key)
            .context("Failed to verify legacy image")?;

        status!("Successfully verified legacy image");

        return Ok(());
    }

    let image = Image::parse(&data)
        .with_context(|| format!("Failed to parse image: {:?}", cli.input))?;

    let violations = verify::verify_structure(&image);
    if !violations.is_empty() {
        for v in &violations {
            warning!("{v}");
        }
        bail!("Image has {} structural problems", violations.len());
    }

    let decrypt_key = load_decrypt_key(&cli.decrypt, &cli.passphrase)?;

    if image.header.flags.contains(ImageFlags::ENCRYPTED) && decrypt_key.is_none() {
        warning!("Image is encrypted. Skipping hash check because no decryption key was given");
    } else {
        verify::verify_hash(&image, initial_hash.as_deref(), decrypt_key.as_ref())
            .context("Failed to verify image hash")?;
        status!("Image hash is valid");
    }

    let verified =
        verify::verify_signatures(&image, &keys).context("Failed to verify signatures")?;

    let missing = cli
        .keys
        .iter()
        .enumerate()
        .filter(|(i, _)| !verified.contains(i))
        .map(|(_, p)| format!("{p:?}"))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        bail!("Image is not signed by: {}", missing.join(", "));
    }

    status!("Successfully verified image with {} key(s)", verified.len());

    Ok(())
}

fn decrypt_subcommand(cli: &DecryptCli) -> Result<()> {
    let image = read_image(&cli.input)?;
    let key = load_decrypt_key(&cli.decrypt, &cli.passphrase)?
        .ok_or_else(|| anyhow!("A decryption key is required"))?;

    let decrypted = secret::decrypt_image(&image, &key).context("Failed to decrypt image")?;
    let data = decrypted
        .to_bytes()
        .context("Failed to serialize decrypted image")?;

    fs::write(&cli.output, data)
        .with_context(|| format!("Failed to write image: {:?}", cli.output))?;

    Ok(())
}

pub fn image_main(cli: &ImageCli) -> Result<()> {
    match &cli.command {
        ImageCommand::Create(c) => create_subcommand(c),
        ImageCommand::Info(c) => info_subcommand(c),
        ImageCommand::Verify(c) => verify_subcommand(c),
        ImageCommand::Decrypt(c) => decrypt_subcommand(c),
    }
}

#[derive(Debug, Args)]
#[group(multiple = false)]
struct DecryptKeyGroup {
    /// Path to RSA private key for unwrapping the image secret.
    #[arg(long, value_name = "FILE", value_parser)]
    decrypt_key: Option<PathBuf>,

    /// Path to base64-encoded AES key-encryption key.
    #[arg(long, value_name = "FILE", value_parser)]
    kek: Option<PathBuf>,
}

/// Create a signed and optionally encrypted image.
#[derive(Debug, Parser)]
struct CreateCli {
    /// Path to input image body.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Image version (<major>.<minor>.<revision>.<build>).
    #[arg(long, value_name = "VERSION", default_value = "0.0.0.0")]
    version: ImageVersion,

    /// Path to signing key.
    ///
    /// This option can be specified multiple times to sign with multiple
    /// keys.
    #[arg(short, long = "key", value_name = "FILE", value_parser)]
    keys: Vec<PathBuf>,

    #[command(flatten)]
    passphrase: PassphraseGroup,

    /// Path to PEM RSA public key or base64 AES key for encrypting the body.
    #[arg(long, value_name = "FILE", value_parser, conflicts_with = "legacy")]
    enc_key: Option<PathBuf>,

    /// Hex-encoded hash of the image that this one chains after.
    ///
    /// The image is marked as non-bootable.
    #[arg(long, value_name = "HEX")]
    initial_hash: Option<String>,

    /// Header size, including padding.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_HEADER_SIZE, value_parser = cli::parse_int::<u16>)]
    header_size: u16,

    /// Create a legacy (v1) image.
    #[arg(long)]
    legacy: bool,

    /// Key ID to store in the legacy image header.
    #[arg(long, value_name = "ID", default_value_t = 0, requires = "legacy")]
    key_id: u8,

    /// Use PKCS#1 v1.5 padding for legacy RSA signatures instead of PSS.
    #[arg(long, requires = "legacy")]
    pkcs1: bool,
}

/// Show the contents of an image.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify an image's structure, hash, and signatures.
///
/// Every key passed in with `--key` must have a valid signature. Signatures
/// from other keys are ignored.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to public key.
    #[arg(short, long = "key", value_name = "FILE", value_parser)]
    keys: Vec<PathBuf>,

    /// Hex-encoded hash of the image that this one chains after.
    #[arg(long, value_name = "HEX")]
    initial_hash: Option<String>,

    #[command(flatten)]
    decrypt: DecryptKeyGroup,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

/// Decrypt an encrypted image.
#[derive(Debug, Parser)]
struct DecryptCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    decrypt: DecryptKeyGroup,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

#[derive(Debug, Subcommand)]
enum ImageCommand {
    Create(CreateCli),
    Info(InfoCli),
    Verify(VerifyCli),
    Decrypt(DecryptCli),
}

/// Create, inspect, verify, and decrypt firmware images.
#[derive(Debug, Parser)]
pub struct ImageCli {
    #[command(subcommand)]
    command: ImageCommand,
}
