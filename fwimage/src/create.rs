// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use rand::{CryptoRng, RngCore};
use thiserror::Error;
use tracing::debug;

use crate::{
    crypto::{self, EcPrivateKey, RsaPadding, SignKey},
    format::{
        image::{
            self, IMAGE_HASH_SIZE, IMAGE_HEADER_SIZE, Image, ImageFlags, ImageHeader,
            ImageVersion, TLV_TYPE_KEYHASH, TLV_TYPE_SHA256, Tlv, tlv_type_name,
        },
        legacy::{
            self, IMAGE_V1_HEADER_SIZE, LegacyFlags, LegacyHeader, LegacyImage,
            TLV_V1_TYPE_SHA256, tlv_size_for,
        },
    },
    secret::{self, PlainSecret},
    verify,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Header size too small: {0} < {min}", min = IMAGE_HEADER_SIZE)]
    HeaderSizeTooSmall(u16),
    #[error("Body too large: {0} bytes")]
    BodyTooLarge(usize),
    #[error("Legacy images support at most one signing key, but have {0}")]
    TooManyLegacyKeys(usize),
    #[error("{} signature is {actual} bytes, but expected {expected} bytes", tlv_type_name(*.tlv_type))]
    SignatureLength {
        tlv_type: u8,
        expected: usize,
        actual: usize,
    },
    #[error("Total TLV size too large for legacy image: {0} bytes")]
    LegacyTlvSizeTooLarge(usize),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Secret error")]
    Secret(#[from] secret::Error),
    #[error("Image format error")]
    Image(#[from] image::Error),
    #[error("Legacy image format error")]
    Legacy(#[from] legacy::Error),
    #[error("Built image failed verification")]
    Verify(#[from] verify::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Default header size, which has no padding.
pub const DEFAULT_HEADER_SIZE: u16 = IMAGE_HEADER_SIZE as u16;

fn header_padding(header_size: u16, min: usize) -> Result<Vec<u8>> {
    let pad_len = usize::from(header_size)
        .checked_sub(min)
        .ok_or(Error::HeaderSizeTooSmall(header_size))?;

    Ok(vec![0u8; pad_len])
}

/// Parameters for building an image in the current format.
#[derive(Clone, Debug)]
pub struct ImageCreator {
    /// Plaintext body.
    pub body: Vec<u8>,
    pub version: ImageVersion,
    /// Signing keys. Each produces a key hash TLV and a signature TLV, in this
    /// order.
    pub sign_keys: Vec<SignKey>,
    /// PEM RSA public key or base64 AES key-encryption key. If set, the body
    /// is encrypted.
    pub enc_key: Option<Vec<u8>>,
    /// Hash of the image that this one chains after. If set, the image is
    /// marked as non-bootable and the hash is prepended to the hashed data.
    pub initial_hash: Option<Vec<u8>>,
    pub header_size: u16,
}

impl ImageCreator {
    pub fn new(body: Vec<u8>, version: ImageVersion) -> Self {
        Self {
            body,
            version,
            sign_keys: vec![],
            enc_key: None,
            initial_hash: None,
            header_size: DEFAULT_HEADER_SIZE,
        }
    }

    /// Build the image. This always hashes the plaintext body before
    /// encrypting it. A fresh secret is generated for every call.
    pub fn create(&self, rng: &mut (impl CryptoRng + RngCore)) -> Result<Image> {
        let pad = header_padding(self.header_size, IMAGE_HEADER_SIZE)?;
        let body_size =
            u32::try_from(self.body.len()).map_err(|_| Error::BodyTooLarge(self.body.len()))?;

        let mut flags = ImageFlags::empty();
        if self.initial_hash.is_some() {
            flags |= ImageFlags::NON_BOOTABLE;
        }
        if self.enc_key.is_some() {
            flags |= ImageFlags::ENCRYPTED;
        }

        let header = ImageHeader {
            header_size: self.header_size,
            body_size,
            flags,
            version: self.version,
            pad1: 0,
            pad2: 0,
            pad3: 0,
        };

        let hash = image::calc_hash(self.initial_hash.as_deref(), &header, &pad, &self.body);
        debug!("Image hash: {}", hex::encode(hash));

        let mut body = self.body.clone();
        let cipher_secret = match &self.enc_key {
            Some(enc_key) => {
                let plain_secret = PlainSecret::generate(rng);
                let cipher_secret = secret::wrap_secret(enc_key, &plain_secret, rng)?;
                secret::encrypt_body(&plain_secret, &mut body);

                debug!(
                    "Encrypted body with {} secret",
                    tlv_type_name(cipher_secret.tlv_type),
                );

                Some(cipher_secret)
            }
            None => None,
        };

        let mut image = Image {
            header,
            pad,
            body,
            tlvs: vec![Tlv::new(TLV_TYPE_SHA256, hash.to_vec())],
        };

        for key in &self.sign_keys {
            let key_hash = key.public_key().key_hash()?;
            let tlv_type = key.sig_tlv_type()?;
            let sig = key.sign(&hash, rng)?;

            if sig.len() != key.sig_len() {
                return Err(Error::SignatureLength {
                    tlv_type,
                    expected: key.sig_len(),
                    actual: sig.len(),
                });
            }

            debug!(
                "Signed with {} key {}",
                key.algorithm_name(),
                hex::encode(key_hash),
            );

            image.add_tlv(Tlv::new(TLV_TYPE_KEYHASH, key_hash.to_vec()));
            image.add_tlv(Tlv::new(tlv_type, sig));
        }

        if let Some(s) = cipher_secret {
            image.add_tlv(s.to_tlv());
        }

        verify::check_structure(&image)?;

        Ok(image)
    }
}

/// Build an image with the default header size.
pub fn build_image(
    body: &[u8],
    version: ImageVersion,
    sign_keys: &[SignKey],
    enc_key: Option<&[u8]>,
    initial_hash: Option<&[u8]>,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<Image> {
    let creator = ImageCreator {
        body: body.to_vec(),
        version,
        sign_keys: sign_keys.to_vec(),
        enc_key: enc_key.map(|k| k.to_vec()),
        initial_hash: initial_hash.map(|h| h.to_vec()),
        header_size: DEFAULT_HEADER_SIZE,
    };

    creator.create(rng)
}

/// Parameters for building a legacy image. Legacy images have at most one
/// signing key, identified by `key_id` instead of a key hash.
#[derive(Clone, Debug)]
pub struct LegacyCreator {
    pub body: Vec<u8>,
    pub version: ImageVersion,
    pub sign_keys: Vec<SignKey>,
    pub key_id: u8,
    pub initial_hash: Option<Vec<u8>>,
    pub header_size: u16,
    pub rsa_padding: RsaPadding,
}

impl LegacyCreator {
    pub fn new(body: Vec<u8>, version: ImageVersion) -> Self {
        Self {
            body,
            version,
            sign_keys: vec![],
            key_id: 0,
            initial_hash: None,
            header_size: IMAGE_V1_HEADER_SIZE as u16,
            rsa_padding: RsaPadding::default(),
        }
    }

    fn key_flag(&self, key: &SignKey) -> LegacyFlags {
        match key {
            SignKey::Rsa(_) => match self.rsa_padding {
                RsaPadding::Pkcs1v15 => LegacyFlags::PKCS15_RSA2048_SHA256,
                RsaPadding::Pss => LegacyFlags::PKCS1_PSS_RSA2048_SHA256,
            },
            SignKey::Ec(EcPrivateKey::P224(_)) => LegacyFlags::ECDSA224_SHA256,
            SignKey::Ec(EcPrivateKey::P256(_)) => LegacyFlags::ECDSA256_SHA256,
            // Rejected by SignKey::legacy_sig_tlv_type().
            SignKey::Ed25519(_) => LegacyFlags::empty(),
        }
    }

    pub fn create(&self, rng: &mut (impl CryptoRng + RngCore)) -> Result<LegacyImage> {
        let key = match self.sign_keys.as_slice() {
            [] => None,
            [key] => Some(key),
            keys => return Err(Error::TooManyLegacyKeys(keys.len())),
        };

        let pad = header_padding(self.header_size, IMAGE_V1_HEADER_SIZE)?;
        let body_size =
            u32::try_from(self.body.len()).map_err(|_| Error::BodyTooLarge(self.body.len()))?;

        let mut flags = LegacyFlags::SHA256;
        if self.initial_hash.is_some() {
            flags |= LegacyFlags::NON_BOOTABLE;
        }

        // The TLV size is part of the hashed header, so it is computed up front.
        let mut tlv_size = tlv_size_for(IMAGE_HASH_SIZE);
        let sig_tlv_type = match key {
            Some(key) => {
                let tlv_type = key.legacy_sig_tlv_type()?;
                flags |= self.key_flag(key);
                tlv_size += tlv_size_for(key.sig_len());
                Some(tlv_type)
            }
            None => None,
        };

        let tlv_size =
            u16::try_from(tlv_size).map_err(|_| Error::LegacyTlvSizeTooLarge(tlv_size))?;

        let mut image = LegacyImage {
            header: LegacyHeader {
                tlv_size,
                key_id: if key.is_some() { self.key_id } else { 0 },
                pad1: 0,
                header_size: self.header_size,
                pad2: 0,
                body_size,
                flags,
                version: self.version,
                pad3: 0,
            },
            pad,
            body: self.body.clone(),
            tlvs: vec![],
        };

        let hash = image.calc_hash(self.initial_hash.as_deref());
        debug!("Legacy image hash: {}", hex::encode(hash));

        image.tlvs.push(Tlv::new(TLV_V1_TYPE_SHA256, hash.to_vec()));

        if let (Some(key), Some(tlv_type)) = (key, sig_tlv_type) {
            let sig = key.sign_legacy(&hash, self.rsa_padding, rng)?;

            if sig.len() != key.sig_len() {
                return Err(Error::SignatureLength {
                    tlv_type,
                    expected: key.sig_len(),
                    actual: sig.len(),
                });
            }

            image.tlvs.push(Tlv::new(tlv_type, sig));
        }

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn header_size_too_small() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut creator = ImageCreator::new(vec![0; 4], ImageVersion::default());
        creator.header_size = 31;

        assert_matches!(creator.create(&mut rng), Err(Error::HeaderSizeTooSmall(31)));
    }

    #[test]
    fn flags() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut creator = ImageCreator::new(vec![0; 4], ImageVersion::default());

        let image = creator.create(&mut rng).unwrap();
        assert_eq!(image.header.flags, ImageFlags::empty());

        creator.initial_hash = Some(vec![0xaa; 32]);
        creator.enc_key = Some(b"AAECAwQFBgcICQoLDA0ODw==".to_vec());

        let image = creator.create(&mut rng).unwrap();
        assert_eq!(
            image.header.flags,
            ImageFlags::NON_BOOTABLE | ImageFlags::ENCRYPTED,
        );
        assert_eq!(image.tlvs.len(), 2);
        assert_eq!(image.tlvs[1].tlv_type, image::TLV_TYPE_ENC_KEK);
    }

    #[test]
    fn legacy_unsigned() {
        let mut rng = StdRng::seed_from_u64(0);
        let image = LegacyCreator::new(b"body".to_vec(), ImageVersion::new(1, 0, 0, 0))
            .create(&mut rng)
            .unwrap();

        assert_eq!(image.header.flags, LegacyFlags::SHA256);
        assert_eq!(image.header.tlv_size, 36);
        assert_eq!(image.hash().unwrap(), image.calc_hash(None));
    }
}
