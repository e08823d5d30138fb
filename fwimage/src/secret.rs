// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Per-image secrets for body encryption.
//!
//! Every encrypted image has its own randomly generated 128-bit secret. The
//! body is encrypted with AES-128-CTR using that secret and an all-zero IV,
//! and the secret itself is stored in the image after being wrapped with
//! either an RSA public key (OAEP) or a shared AES key-encryption key
//! (RFC 3394 key wrap).

use std::fmt;

use aes::Aes128;
use aes_kw::KekAes128;
use base64::{Engine, engine::general_purpose::STANDARD};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use rsa::{Oaep, RsaPrivateKey, traits::PublicKeyParts};
use sha2::Sha256;
use thiserror::Error;

use crate::{
    crypto,
    format::image::{
        Image, ImageFlags, TLV_TYPE_ENC_KEK, TLV_TYPE_ENC_RSA, Tlv, is_secret_type,
        tlv_type_name,
    },
};

pub const SECRET_SIZE: usize = 16;
/// Size of an RSA-OAEP wrapped secret. Only RSA-2048 keys are supported.
pub const ENC_RSA_SIZE: usize = 256;
/// Size of an AES key wrapped secret.
pub const ENC_KEK_SIZE: usize = SECRET_SIZE + 8;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Encryption key is neither an RSA public key nor a base64-encoded AES key")]
    InvalidEncryptionKey,
    #[error("Key-encryption key must be {SECRET_SIZE} bytes, but is {0} bytes")]
    InvalidKekSize(usize),
    #[error("RSA key size ({0} bits) not supported for secret wrapping")]
    UnsupportedRsaKeySize(usize),
    #[error("Wrapped secret is {len} bytes, but expected {expected} bytes")]
    InvalidCipherSecretSize { len: usize, expected: usize },
    #[error("Unwrapped secret is {0} bytes, but expected {SECRET_SIZE} bytes")]
    InvalidSecretSize(usize),
    #[error("{} secret cannot be unwrapped with this key", tlv_type_name(*.0))]
    KeyMismatch(u8),
    #[error("TLV type {0:#04x} is not a wrapped secret")]
    NotSecretTlv(u8),
    #[error("Image is not encrypted")]
    NotEncrypted,
    #[error("Expected exactly one wrapped secret TLV, but have {0}")]
    SecretTlvCount(usize),
    #[error("Failed to wrap secret with RSA key")]
    RsaEncrypt(#[source] Box<rsa::Error>),
    #[error("Failed to unwrap secret with RSA key")]
    RsaDecrypt(#[source] Box<rsa::Error>),
    #[error("Failed to wrap secret with AES key: {0:?}")]
    KeyWrap(aes_kw::Error),
    #[error("Failed to unwrap secret with AES key: {0:?}")]
    KeyUnwrap(aes_kw::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Plaintext image secret. This only exists while an image is being built or
/// decrypted and is never written out.
#[derive(Clone, PartialEq, Eq)]
pub struct PlainSecret([u8; SECRET_SIZE]);

impl fmt::Debug for PlainSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlainSecret(<redacted>)")
    }
}

impl PlainSecret {
    pub fn generate(rng: &mut (impl CryptoRng + RngCore)) -> Self {
        let mut data = [0u8; SECRET_SIZE];
        rng.fill_bytes(&mut data);
        Self(data)
    }

    pub fn from_bytes(data: [u8; SECRET_SIZE]) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

/// Wrapped image secret, as stored in an `ENC_RSA` or `ENC_KEK` TLV.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherSecret {
    pub tlv_type: u8,
    pub data: Vec<u8>,
}

impl CipherSecret {
    pub fn to_tlv(&self) -> Tlv {
        Tlv::new(self.tlv_type, self.data.clone())
    }
}

/// Key for unwrapping a [`CipherSecret`].
#[derive(Clone)]
pub enum DecryptKey {
    Rsa(RsaPrivateKey),
    Kek([u8; SECRET_SIZE]),
}

impl fmt::Debug for DecryptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa(_) => f.write_str("DecryptKey::Rsa(<redacted>)"),
            Self::Kek(_) => f.write_str("DecryptKey::Kek(<redacted>)"),
        }
    }
}

impl DecryptKey {
    /// Parse a base64-encoded key-encryption key.
    pub fn from_kek_base64(data: &[u8]) -> Result<Self> {
        parse_kek(data).map(Self::Kek)
    }
}

/// Encrypt (or decrypt) an image body in place with AES-128-CTR.
///
/// The IV is always zero. This is required for compatibility with existing
/// bootloaders, and it means that the keystream is identical for every use of
/// the same secret. A secret must never encrypt more than one image.
pub fn encrypt_body(secret: &PlainSecret, data: &mut [u8]) {
    let iv = [0u8; 16];
    let mut cipher = Aes128Ctr::new(secret.as_bytes().into(), &iv.into());
    cipher.apply_keystream(data);
}

/// Decrypt an image body in place. This is the same transform as
/// [`encrypt_body`].
pub fn decrypt_body(secret: &PlainSecret, data: &mut [u8]) {
    encrypt_body(secret, data);
}

fn parse_kek(data: &[u8]) -> Result<[u8; SECRET_SIZE]> {
    let text = std::str::from_utf8(data).map_err(|_| Error::InvalidEncryptionKey)?;
    let kek = STANDARD
        .decode(text.trim())
        .map_err(|_| Error::InvalidEncryptionKey)?;

    kek.as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKekSize(kek.len()))
}

/// Wrap a secret for storage in an image. If `enc_key` is a PEM RSA public
/// key, the secret is encrypted with RSA-OAEP (SHA-256). Otherwise, `enc_key`
/// must be a base64-encoded 128-bit AES key and the secret is wrapped with the
/// RFC 3394 AES key wrap algorithm.
pub fn wrap_secret(
    enc_key: &[u8],
    secret: &PlainSecret,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<CipherSecret> {
    if let Ok(key) = crypto::parse_rsa_public_key(enc_key) {
        let bits = key.size() * 8;
        if bits != ENC_RSA_SIZE * 8 {
            return Err(Error::UnsupportedRsaKeySize(bits));
        }

        let data = key
            .encrypt(rng, Oaep::new::<Sha256>(), secret.as_bytes())
            .map_err(|e| Error::RsaEncrypt(Box::new(e)))?;

        return Ok(CipherSecret {
            tlv_type: TLV_TYPE_ENC_RSA,
            data,
        });
    }

    let kek = KekAes128::new(&parse_kek(enc_key)?.into());
    let mut data = vec![0u8; ENC_KEK_SIZE];
    kek.wrap(secret.as_bytes(), &mut data)
        .map_err(Error::KeyWrap)?;

    Ok(CipherSecret {
        tlv_type: TLV_TYPE_ENC_KEK,
        data,
    })
}

/// Unwrap a secret from an `ENC_RSA` or `ENC_KEK` TLV.
pub fn unwrap_secret(tlv: &Tlv, key: &DecryptKey) -> Result<PlainSecret> {
    let secret = match (tlv.tlv_type, key) {
        (TLV_TYPE_ENC_RSA, DecryptKey::Rsa(key)) => {
            if tlv.data.len() != key.size() {
                return Err(Error::InvalidCipherSecretSize {
                    len: tlv.data.len(),
                    expected: key.size(),
                });
            }

            key.decrypt(Oaep::new::<Sha256>(), &tlv.data)
                .map_err(|e| Error::RsaDecrypt(Box::new(e)))?
        }
        (TLV_TYPE_ENC_KEK, DecryptKey::Kek(kek)) => {
            if tlv.data.len() != ENC_KEK_SIZE {
                return Err(Error::InvalidCipherSecretSize {
                    len: tlv.data.len(),
                    expected: ENC_KEK_SIZE,
                });
            }

            let kek = KekAes128::new(&(*kek).into());
            let mut data = vec![0u8; SECRET_SIZE];
            kek.unwrap(&tlv.data, &mut data)
                .map_err(Error::KeyUnwrap)?;
            data
        }
        (TLV_TYPE_ENC_RSA | TLV_TYPE_ENC_KEK, _) => return Err(Error::KeyMismatch(tlv.tlv_type)),
        (t, _) => return Err(Error::NotSecretTlv(t)),
    };

    let secret = secret
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidSecretSize(secret.len()))?;

    Ok(PlainSecret(secret))
}

/// Unwrap the image's secret and return the decrypted body. The image is not
/// modified.
pub fn decrypt_body_of(image: &Image, key: &DecryptKey) -> Result<Vec<u8>> {
    if !image.header.flags.contains(ImageFlags::ENCRYPTED) {
        return Err(Error::NotEncrypted);
    }

    let secret_tlvs = image
        .tlvs
        .iter()
        .filter(|t| is_secret_type(t.tlv_type))
        .collect::<Vec<_>>();
    let [tlv] = secret_tlvs.as_slice() else {
        return Err(Error::SecretTlvCount(secret_tlvs.len()));
    };

    let secret = unwrap_secret(tlv, key)?;
    let mut body = image.body.clone();
    decrypt_body(&secret, &mut body);

    Ok(body)
}

/// Return a decrypted copy of an image. The body is decrypted, the
/// `ENCRYPTED` flag is cleared, and the wrapped secret TLV is removed.
///
/// The hash and signature TLVs are kept as-is. They cover the header as it
/// was built, with the `ENCRYPTED` flag set, so they only verify against the
/// original encrypted image.
pub fn decrypt_image(image: &Image, key: &DecryptKey) -> Result<Image> {
    let body = decrypt_body_of(image, key)?;
    let (mut decrypted, _) = image.without_tlvs(|t| is_secret_type(t.tlv_type));

    decrypted.body = body;
    decrypted.header.flags.remove(ImageFlags::ENCRYPTED);

    Ok(decrypted)
}
