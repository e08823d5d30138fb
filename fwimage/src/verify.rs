// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    crypto::{self, PublicKey, RsaPadding},
    format::{
        image::{
            self, Image, ImageFlags, TLV_TYPE_KEYHASH, TLV_TYPE_SHA256, is_secret_type,
            is_sig_type, tlv_type_name,
        },
        legacy::{self, LegacyFlags, LegacyImage},
    },
    secret::{self, DecryptKey},
};

/// A structural problem with an image's TLV list.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("Image has no TLVs")]
    NoTlvs,
    #[error("TLV #0 is {}, but must be SHA256", tlv_type_name(*.0))]
    FirstTlvNotHash(u8),
    #[error("TLV #{index}: KEYHASH is not followed by a signature (found {})", tlv_type_name(*.next))]
    KeyHashNotFollowedBySignature { index: usize, next: u8 },
    #[error("TLV #{0}: KEYHASH is the last TLV and has no signature")]
    KeyHashAtEnd(usize),
    #[error("TLV #{index}: {} signature is not preceded by a key hash", tlv_type_name(*.tlv_type))]
    SignatureWithoutKeyHash { index: usize, tlv_type: u8 },
    #[error("Duplicate key hashes: {}", .0.join(", "))]
    DuplicateKeyHashes(Vec<String>),
    #[error("Image has {0} wrapped secret TLVs, but at most one is allowed")]
    MultipleSecrets(usize),
    #[error("TLV #{0}: Wrapped secret must be the last TLV")]
    SecretNotLast(usize),
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image structure is invalid: {}", join_violations(.0))]
    Structure(Vec<Violation>),
    #[error("Hash mismatch: expected {expected}, but have {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("Image is encrypted, but no decryption key was provided")]
    EncryptedNoKey,
    #[error("TLV #{index}: Signature type {} does not match {algorithm} key #{key_index}",
        tlv_type_name(*.tlv_type))]
    SignatureTypeMismatch {
        index: usize,
        tlv_type: u8,
        key_index: usize,
        algorithm: &'static str,
    },
    #[error("TLV #{index}: Signature failed to verify with key #{key_index}")]
    Signature {
        index: usize,
        key_index: usize,
        #[source]
        source: crypto::Error,
    },
    #[error("Legacy image has no signature TLV of type {0:#04x}")]
    MissingLegacySignature(u8),
    #[error("Image format error")]
    Image(#[from] image::Error),
    #[error("Legacy image format error")]
    Legacy(#[from] legacy::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Failed to decrypt image")]
    Secret(#[from] secret::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Check the TLV ordering rules of an image. Every violation is reported
/// instead of just the first one.
pub fn verify_structure(image: &Image) -> Vec<Violation> {
    let tlvs = &image.tlvs;
    let mut violations = vec![];

    match tlvs.first() {
        None => violations.push(Violation::NoTlvs),
        Some(t) if t.tlv_type != TLV_TYPE_SHA256 => {
            violations.push(Violation::FirstTlvNotHash(t.tlv_type));
        }
        Some(_) => {}
    }

    let mut key_hashes = BTreeMap::<&[u8], usize>::new();

    for (index, tlv) in tlvs.iter().enumerate() {
        if tlv.tlv_type == TLV_TYPE_KEYHASH {
            *key_hashes.entry(tlv.data.as_slice()).or_default() += 1;

            match tlvs.get(index + 1) {
                None => violations.push(Violation::KeyHashAtEnd(index)),
                Some(next) if !is_sig_type(next.tlv_type) => {
                    violations.push(Violation::KeyHashNotFollowedBySignature {
                        index,
                        next: next.tlv_type,
                    });
                }
                Some(_) => {}
            }
        } else if is_sig_type(tlv.tlv_type) {
            let preceded = index
                .checked_sub(1)
                .is_some_and(|i| tlvs[i].tlv_type == TLV_TYPE_KEYHASH);

            if !preceded {
                violations.push(Violation::SignatureWithoutKeyHash {
                    index,
                    tlv_type: tlv.tlv_type,
                });
            }
        }
    }

    let duplicates = key_hashes
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(hash, _)| hex::encode(hash))
        .collect::<Vec<_>>();
    if !duplicates.is_empty() {
        violations.push(Violation::DuplicateKeyHashes(duplicates));
    }

    let secrets = tlvs
        .iter()
        .enumerate()
        .filter(|(_, t)| is_secret_type(t.tlv_type))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    if secrets.len() > 1 {
        violations.push(Violation::MultipleSecrets(secrets.len()));
    }
    for index in secrets {
        if index != tlvs.len() - 1 {
            violations.push(Violation::SecretNotLast(index));
        }
    }

    violations
}

/// Like [`verify_structure`], but returns an error containing all violations
/// if there are any.
pub fn check_structure(image: &Image) -> Result<()> {
    let violations = verify_structure(image);
    if !violations.is_empty() {
        return Err(Error::Structure(violations));
    }

    Ok(())
}

/// Recompute the image's content hash and compare it against the SHA256 TLV.
/// Encrypted images are decrypted with `key` first since the hash covers the
/// plaintext body.
pub fn verify_hash(
    image: &Image,
    initial_hash: Option<&[u8]>,
    key: Option<&DecryptKey>,
) -> Result<()> {
    let expected = image.hash()?;

    let actual = if image.header.flags.contains(ImageFlags::ENCRYPTED) {
        let key = key.ok_or(Error::EncryptedNoKey)?;
        let body = secret::decrypt_body_of(image, key)?;

        image::calc_hash(initial_hash, &image.header, &image.pad, &body)
    } else {
        image.calc_hash(initial_hash)
    };

    compare_hash(expected, &actual)?;
    debug!("Image hash verified: {}", hex::encode(actual));

    Ok(())
}

fn compare_hash(expected: &[u8], actual: &[u8]) -> Result<()> {
    if actual != expected {
        return Err(Error::HashMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }

    Ok(())
}

/// Verify every signature that was made by one of `keys`. Signatures from
/// unknown keys are skipped. Returns the indices of the keys with a valid
/// signature.
pub fn verify_signatures(image: &Image, keys: &[PublicKey]) -> Result<Vec<usize>> {
    let hash = image.hash()?;
    let key_hashes = keys
        .iter()
        .map(PublicKey::key_hash)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut verified = vec![];

    for (index, pair) in image.tlvs.windows(2).enumerate() {
        let (key_hash_tlv, sig_tlv) = (&pair[0], &pair[1]);

        if key_hash_tlv.tlv_type != TLV_TYPE_KEYHASH || !is_sig_type(sig_tlv.tlv_type) {
            continue;
        }

        let Some(key_index) = key_hashes
            .iter()
            .position(|h| h.as_slice() == key_hash_tlv.data)
        else {
            trace!(
                "TLV #{index}: No key for key hash {}",
                hex::encode(&key_hash_tlv.data),
            );
            continue;
        };

        let key = &keys[key_index];
        let sig_index = index + 1;

        if key.sig_tlv_type()? != sig_tlv.tlv_type {
            return Err(Error::SignatureTypeMismatch {
                index: sig_index,
                tlv_type: sig_tlv.tlv_type,
                key_index,
                algorithm: key.algorithm_name(),
            });
        }

        key.verify(hash, &sig_tlv.data)
            .map_err(|e| Error::Signature {
                index: sig_index,
                key_index,
                source: e,
            })?;

        debug!("TLV #{sig_index}: Signature verified with key #{key_index}");

        if !verified.contains(&key_index) {
            verified.push(key_index);
        }
    }

    verified.sort_unstable();

    Ok(verified)
}

/// Verify a legacy image's hash and, if `key` is given, its signature. The
/// RSA padding scheme comes from the header flags.
pub fn verify_legacy(
    image: &LegacyImage,
    initial_hash: Option<&[u8]>,
    key: Option<&PublicKey>,
) -> Result<()> {
    let expected = image.hash()?;
    compare_hash(expected, &image.calc_hash(initial_hash))?;

    let Some(key) = key else {
        return Ok(());
    };

    let tlv_type = key.legacy_sig_tlv_type()?;
    let index = image
        .tlvs
        .iter()
        .position(|t| t.tlv_type == tlv_type)
        .ok_or(Error::MissingLegacySignature(tlv_type))?;

    let padding = if image
        .header
        .flags
        .contains(LegacyFlags::PKCS15_RSA2048_SHA256)
    {
        RsaPadding::Pkcs1v15
    } else {
        RsaPadding::Pss
    };

    key.verify_legacy(expected, &image.tlvs[index].data, padding)
        .map_err(|e| Error::Signature {
            index,
            key_index: 0,
            source: e,
        })?;

    debug!("Legacy signature verified with {} key", key.algorithm_name());

    Ok(())
}
