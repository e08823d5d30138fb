// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env::{self, VarError},
    ffi::{OsStr, OsString},
    fmt,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use const_oid::{
    ObjectIdentifier,
    db::{rfc5912, rfc8410},
};
use ed25519_dalek::{Signer, Verifier};
use p256::ecdsa::signature::hazmat::{PrehashVerifier, RandomizedPrehashSigner};
use passterm::PromptError;
use pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
    EncryptedPrivateKeyInfo, LineEnding, PrivateKeyInfo, SecretDocument,
    der::{
        Decode, SliceReader,
        asn1::{AnyRef, OctetStringRef},
        pem::PemLabel,
    },
    pkcs5::{pbes2, scrypt},
    spki::SubjectPublicKeyInfoRef,
};
use rand::{CryptoRng, RngCore};
use rsa::{
    Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::format::{
    image::{
        IMAGE_KEY_HASH_SIZE, TLV_TYPE_ECDSA224, TLV_TYPE_ECDSA256, TLV_TYPE_ED25519,
        TLV_TYPE_RSA2048, TLV_TYPE_RSA3072,
    },
    legacy::{TLV_V1_TYPE_ECDSA224, TLV_V1_TYPE_ECDSA256, TLV_V1_TYPE_RSA2048},
};

/// Size of a P-224 private scalar.
const P224_SCALAR_SIZE: usize = 28;

/// Fixed signature slot size for ECDSA P-224. DER encoding is variable length,
/// so signatures are right-padded with zeros.
pub const ECDSA224_SIG_LEN: usize = 68;
/// Fixed signature slot size for ECDSA P-256.
pub const ECDSA256_SIG_LEN: usize = 72;
pub const ED25519_SIG_LEN: usize = 64;

/// PSS salt length. This matches the SHA-256 digest length.
const PSS_SALT_LEN: usize = 32;

/// DER prefix for an Ed25519 SubjectPublicKeyInfo. The 32-byte public point
/// follows directly.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const PEM_LABEL_RSA_PRIVATE_KEY: &str = "RSA PRIVATE KEY";
const PEM_LABEL_EC_PRIVATE_KEY: &str = "EC PRIVATE KEY";
const PEM_LABEL_EC_PARAMETERS: &str = "EC PARAMETERS";
const PEM_LABEL_PRIVATE_KEY: &str = "PRIVATE KEY";
const PEM_LABEL_ENCRYPTED_PRIVATE_KEY: &str = "ENCRYPTED PRIVATE KEY";
const PEM_LABEL_PUBLIC_KEY: &str = "PUBLIC KEY";
const PEM_LABEL_RSA_PUBLIC_KEY: &str = "RSA PUBLIC KEY";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Data does not contain a recognized private key")]
    UnrecognizedKey,
    #[error("Data does not contain a recognized public key")]
    UnrecognizedPublicKey,
    #[error("Unsupported PEM block: {0:?}")]
    UnsupportedPemLabel(String),
    #[error("Expected exactly one key, but found {0}")]
    KeyCount(usize),
    #[error("Unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),
    #[error("Unsupported elliptic curve: {0}")]
    UnsupportedCurve(ObjectIdentifier),
    #[error("EC key is not on a supported curve (P-224 or P-256)")]
    UnsupportedEcKey,
    #[error("RSA key size ({0} bits) not supported")]
    UnsupportedRsaKeySize(usize),
    #[error("{0} keys cannot sign legacy images")]
    UnsupportedLegacyKey(&'static str),
    #[error("Invalid Ed25519 key")]
    InvalidEd25519Key,
    #[error("Signature is {len} bytes, but must fit in {max} bytes")]
    SignatureTooLong { len: usize, max: usize },
    #[error("Signature is {len} bytes, but expected {expected} bytes")]
    InvalidSignatureLength { len: usize, expected: usize },
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Passphrase prompt requires an interactive terminal")]
    NotInteractive(#[source] io::Error),
    #[error("Failed to prompt for passphrase")]
    PassphrasePrompt(#[source] PromptError),
    #[error("Passphrases do not match")]
    ConfirmPassphrase,
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to decode PEM block")]
    PemDecode(#[source] pkcs8::der::Error),
    #[error("Failed to load encrypted private key")]
    LoadKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to load PKCS#8 private key")]
    LoadKeyPkcs8(#[source] pkcs8::Error),
    #[error("Failed to load PKCS#1 RSA private key")]
    LoadKeyPkcs1(#[source] rsa::pkcs1::Error),
    #[error("Failed to load public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load PKCS#1 RSA public key")]
    LoadPubKeyPkcs1(#[source] rsa::pkcs1::Error),
    #[error("Failed to save private key")]
    SaveKey(#[source] pkcs8::Error),
    #[error("Failed to save public key")]
    SavePubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to encode RSA public key")]
    SavePubKeyPkcs1(#[source] rsa::pkcs1::Error),
    #[error("Failed to generate RSA key")]
    RsaGenerate(#[source] Box<rsa::Error>),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to ECDSA sign digest")]
    EcSign(#[source] p256::ecdsa::Error),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub enum PassphraseSource {
    Prompt(String),
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn new(key_file: &Path, pass_file: Option<&Path>, env_var: Option<&OsStr>) -> Self {
        #[allow(clippy::option_if_let_else)]
        if let Some(v) = env_var {
            Self::EnvVar(v.to_owned())
        } else if let Some(p) = pass_file {
            Self::File(p.to_owned())
        } else {
            Self::Prompt(format!("Enter passphrase for {key_file:?}: "))
        }
    }

    fn prompt(prompt: &str) -> Result<String> {
        match passterm::prompt_password_tty(Some(prompt)) {
            Ok(p) => Ok(p),
            Err(e) => {
                #[cfg(unix)]
                if let PromptError::IOError(io_e) = e {
                    if let Some(errno) = io_e.raw_os_error() {
                        if errno == libc::ENXIO || errno == libc::ENOTTY {
                            return Err(Error::NotInteractive(io_e));
                        }
                    }

                    return Err(Error::PassphrasePrompt(PromptError::IOError(io_e)));
                }

                Err(Error::PassphrasePrompt(e))
            }
        }
    }

    pub fn acquire(&self, confirm: bool) -> Result<String> {
        let passphrase = match self {
            Self::Prompt(p) => {
                let first = Self::prompt(p)?;

                if confirm {
                    let second = Self::prompt("Confirm: ")?;

                    if first != second {
                        return Err(Error::ConfirmPassphrase);
                    }
                }

                first
            }
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::File(p) => fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        };

        Ok(passphrase)
    }
}

/// RSA padding scheme for legacy images. Current images always use PSS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RsaPadding {
    Pkcs1v15,
    #[default]
    Pss,
}

/// Kinds of keys that can be generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Rsa2048,
    Rsa3072,
    EcP224,
    EcP256,
    Ed25519,
}

#[derive(Clone)]
pub enum EcPrivateKey {
    P224(p224::SecretKey),
    P256(p256::SecretKey),
}

#[derive(Clone)]
pub enum SignKey {
    Rsa(RsaPrivateKey),
    Ec(EcPrivateKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl fmt::Debug for SignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignKey").field(&self.algorithm_name()).finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EcPublicKey {
    P224(p224::PublicKey),
    P256(p256::PublicKey),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    Ec(EcPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

/// Pad a DER-encoded ECDSA signature out to its fixed slot size.
fn pad_ec_signature(der: &[u8], sig_len: usize) -> Result<Vec<u8>> {
    if der.len() > sig_len {
        return Err(Error::SignatureTooLong {
            len: der.len(),
            max: sig_len,
        });
    }

    let mut sig = der.to_vec();
    sig.resize(sig_len, 0);

    Ok(sig)
}

/// Strip the zero padding from an ECDSA signature slot using the length in the
/// outer DER SEQUENCE header. Only the short length form is possible for the
/// supported curves.
fn unpad_ec_signature(sig: &[u8]) -> Result<&[u8]> {
    match sig {
        [0x30, len, ..] if *len < 0x80 && 2 + usize::from(*len) <= sig.len() => {
            Ok(&sig[..2 + usize::from(*len)])
        }
        _ => Err(Error::VerificationFailed),
    }
}

impl SignKey {
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::Ec(EcPrivateKey::P224(_)) => "ECDSA P-224",
            Self::Ec(EcPrivateKey::P256(_)) => "ECDSA P-256",
            Self::Ed25519(_) => "Ed25519",
        }
    }

    /// Size of the signature TLV data produced by this key.
    pub fn sig_len(&self) -> usize {
        match self {
            Self::Rsa(key) => key.size(),
            Self::Ec(EcPrivateKey::P224(_)) => ECDSA224_SIG_LEN,
            Self::Ec(EcPrivateKey::P256(_)) => ECDSA256_SIG_LEN,
            Self::Ed25519(_) => ED25519_SIG_LEN,
        }
    }

    /// TLV type for signatures produced by this key.
    pub fn sig_tlv_type(&self) -> Result<u8> {
        match self {
            Self::Rsa(key) => match key.size() * 8 {
                2048 => Ok(TLV_TYPE_RSA2048),
                3072 => Ok(TLV_TYPE_RSA3072),
                bits => Err(Error::UnsupportedRsaKeySize(bits)),
            },
            Self::Ec(EcPrivateKey::P224(_)) => Ok(TLV_TYPE_ECDSA224),
            Self::Ec(EcPrivateKey::P256(_)) => Ok(TLV_TYPE_ECDSA256),
            Self::Ed25519(_) => Ok(TLV_TYPE_ED25519),
        }
    }

    /// TLV type for signatures in legacy images. Only RSA-2048 and ECDSA keys
    /// are supported.
    pub fn legacy_sig_tlv_type(&self) -> Result<u8> {
        match self {
            Self::Rsa(key) => match key.size() * 8 {
                2048 => Ok(TLV_V1_TYPE_RSA2048),
                bits => Err(Error::UnsupportedRsaKeySize(bits)),
            },
            Self::Ec(EcPrivateKey::P224(_)) => Ok(TLV_V1_TYPE_ECDSA224),
            Self::Ec(EcPrivateKey::P256(_)) => Ok(TLV_V1_TYPE_ECDSA256),
            Self::Ed25519(_) => Err(Error::UnsupportedLegacyKey(self.algorithm_name())),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Rsa(key) => PublicKey::Rsa(key.to_public_key()),
            Self::Ec(EcPrivateKey::P224(key)) => PublicKey::Ec(EcPublicKey::P224(key.public_key())),
            Self::Ec(EcPrivateKey::P256(key)) => PublicKey::Ec(EcPublicKey::P256(key.public_key())),
            Self::Ed25519(key) => PublicKey::Ed25519(key.verifying_key()),
        }
    }

    fn sign_ec(
        key: &EcPrivateKey,
        hash: &[u8],
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<u8>> {
        match key {
            EcPrivateKey::P224(key) => {
                let signer = p224::ecdsa::SigningKey::from(key);
                let sig: p224::ecdsa::Signature = signer
                    .sign_prehash_with_rng(rng, hash)
                    .map_err(Error::EcSign)?;
                pad_ec_signature(sig.to_der().as_bytes(), ECDSA224_SIG_LEN)
            }
            EcPrivateKey::P256(key) => {
                let signer = p256::ecdsa::SigningKey::from(key);
                let sig: p256::ecdsa::Signature = signer
                    .sign_prehash_with_rng(rng, hash)
                    .map_err(Error::EcSign)?;
                pad_ec_signature(sig.to_der().as_bytes(), ECDSA256_SIG_LEN)
            }
        }
    }

    /// Sign an image hash for the current image format. RSA keys use PSS,
    /// ECDSA signatures are DER encoded and zero padded to [`Self::sig_len`],
    /// and Ed25519 signs the hash bytes directly.
    pub fn sign(&self, hash: &[u8], rng: &mut (impl CryptoRng + RngCore)) -> Result<Vec<u8>> {
        match self {
            Self::Rsa(key) => key
                .sign_with_rng(rng, Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), hash)
                .map_err(|e| Error::RsaSign(Box::new(e))),
            Self::Ec(key) => Self::sign_ec(key, hash, rng),
            Self::Ed25519(key) => Ok(key.sign(hash).to_bytes().to_vec()),
        }
    }

    /// Sign an image hash for the legacy image format.
    pub fn sign_legacy(
        &self,
        hash: &[u8],
        padding: RsaPadding,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<u8>> {
        match self {
            Self::Rsa(key) => match padding {
                RsaPadding::Pkcs1v15 => key.sign(Pkcs1v15Sign::new::<Sha256>(), hash),
                RsaPadding::Pss => {
                    key.sign_with_rng(rng, Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), hash)
                }
            }
            .map_err(|e| Error::RsaSign(Box::new(e))),
            Self::Ec(key) => Self::sign_ec(key, hash, rng),
            Self::Ed25519(_) => Err(Error::UnsupportedLegacyKey(self.algorithm_name())),
        }
    }

    fn to_pkcs8_der(&self) -> Result<SecretDocument> {
        match self {
            Self::Rsa(key) => key.to_pkcs8_der(),
            Self::Ec(EcPrivateKey::P224(key)) => key.to_pkcs8_der(),
            Self::Ec(EcPrivateKey::P256(key)) => key.to_pkcs8_der(),
            Self::Ed25519(key) => key.to_pkcs8_der(),
        }
        .map_err(Error::SaveKey)
    }
}

impl PublicKey {
    /// Encoded public key as covered by the key hash. RSA keys use the PKCS#1
    /// `RSAPublicKey` structure and everything else uses a
    /// SubjectPublicKeyInfo structure.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Rsa(key) => key
                .to_pkcs1_der()
                .map(|d| d.as_bytes().to_vec())
                .map_err(Error::SavePubKeyPkcs1),
            Self::Ec(EcPublicKey::P224(key)) => key
                .to_public_key_der()
                .map(|d| d.as_bytes().to_vec())
                .map_err(Error::SavePubKey),
            Self::Ec(EcPublicKey::P256(key)) => key
                .to_public_key_der()
                .map(|d| d.as_bytes().to_vec())
                .map_err(Error::SavePubKey),
            Self::Ed25519(key) => {
                let mut data = ED25519_SPKI_PREFIX.to_vec();
                data.extend_from_slice(key.as_bytes());
                Ok(data)
            }
        }
    }

    /// Truncated SHA-256 digest of [`Self::to_bytes`].
    pub fn key_hash(&self) -> Result<[u8; IMAGE_KEY_HASH_SIZE]> {
        let digest = Sha256::digest(self.to_bytes()?);
        let mut hash = [0u8; IMAGE_KEY_HASH_SIZE];
        hash.copy_from_slice(&digest[..IMAGE_KEY_HASH_SIZE]);

        Ok(hash)
    }

    /// TLV type for signatures made by the corresponding private key.
    pub fn sig_tlv_type(&self) -> Result<u8> {
        match self {
            Self::Rsa(key) => match key.size() * 8 {
                2048 => Ok(TLV_TYPE_RSA2048),
                3072 => Ok(TLV_TYPE_RSA3072),
                bits => Err(Error::UnsupportedRsaKeySize(bits)),
            },
            Self::Ec(EcPublicKey::P224(_)) => Ok(TLV_TYPE_ECDSA224),
            Self::Ec(EcPublicKey::P256(_)) => Ok(TLV_TYPE_ECDSA256),
            Self::Ed25519(_) => Ok(TLV_TYPE_ED25519),
        }
    }

    /// TLV type for legacy signatures made by the corresponding private key.
    pub fn legacy_sig_tlv_type(&self) -> Result<u8> {
        match self {
            Self::Rsa(key) => match key.size() * 8 {
                2048 => Ok(TLV_V1_TYPE_RSA2048),
                bits => Err(Error::UnsupportedRsaKeySize(bits)),
            },
            Self::Ec(EcPublicKey::P224(_)) => Ok(TLV_V1_TYPE_ECDSA224),
            Self::Ec(EcPublicKey::P256(_)) => Ok(TLV_V1_TYPE_ECDSA256),
            Self::Ed25519(_) => Err(Error::UnsupportedLegacyKey(self.algorithm_name())),
        }
    }

    fn verify_ec(key: &EcPublicKey, hash: &[u8], sig: &[u8]) -> Result<()> {
        let der = unpad_ec_signature(sig)?;

        let valid = match key {
            EcPublicKey::P224(key) => {
                let verifier = p224::ecdsa::VerifyingKey::from(key);
                p224::ecdsa::Signature::from_der(der)
                    .and_then(|s| verifier.verify_prehash(hash, &s))
                    .is_ok()
            }
            EcPublicKey::P256(key) => {
                let verifier = p256::ecdsa::VerifyingKey::from(key);
                p256::ecdsa::Signature::from_der(der)
                    .and_then(|s| verifier.verify_prehash(hash, &s))
                    .is_ok()
            }
        };

        if valid {
            Ok(())
        } else {
            Err(Error::VerificationFailed)
        }
    }

    /// Verify a signature made by [`SignKey::sign`].
    pub fn verify(&self, hash: &[u8], sig: &[u8]) -> Result<()> {
        match self {
            Self::Rsa(key) => key
                .verify(Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), hash, sig)
                .map_err(|_| Error::VerificationFailed),
            Self::Ec(key) => Self::verify_ec(key, hash, sig),
            Self::Ed25519(key) => {
                if sig.len() != ED25519_SIG_LEN {
                    return Err(Error::InvalidSignatureLength {
                        len: sig.len(),
                        expected: ED25519_SIG_LEN,
                    });
                }

                let sig = ed25519_dalek::Signature::from_slice(sig)
                    .map_err(|_| Error::VerificationFailed)?;
                key.verify(hash, &sig)
                    .map_err(|_| Error::VerificationFailed)
            }
        }
    }

    /// Verify a signature made by [`SignKey::sign_legacy`].
    pub fn verify_legacy(&self, hash: &[u8], sig: &[u8], padding: RsaPadding) -> Result<()> {
        match (self, padding) {
            (Self::Rsa(key), RsaPadding::Pkcs1v15) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), hash, sig)
                .map_err(|_| Error::VerificationFailed),
            (Self::Ed25519(_), _) => Err(Error::UnsupportedLegacyKey("Ed25519")),
            _ => self.verify(hash, sig),
        }
    }

    /// Encode as a PEM `PUBLIC KEY` (SubjectPublicKeyInfo) block.
    pub fn to_pem(&self) -> Result<String> {
        let der = match self {
            Self::Rsa(key) => key
                .to_public_key_der()
                .map(|d| d.as_bytes().to_vec())
                .map_err(Error::SavePubKey)?,
            _ => self.to_bytes()?,
        };

        pkcs8::der::pem::encode_string(PEM_LABEL_PUBLIC_KEY, LineEnding::LF, &der)
            .map_err(|e| Error::SavePubKey(e.into()))
    }

    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::Ec(EcPublicKey::P224(_)) => "ECDSA P-224",
            Self::Ec(EcPublicKey::P256(_)) => "ECDSA P-256",
            Self::Ed25519(_) => "Ed25519",
        }
    }
}

/// Split PEM data into its blocks. PEM decoding follows RFC 7468 strictly and
/// rejects base64 lines longer than 64 characters, so each block is
/// reformatted to be compliant.
fn split_pem(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut blocks = vec![];
    let mut block = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for line in data.split(|&c| c == b'\n') {
        let line = line.trim_ascii();

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN ") {
            inside_base64 = true;

            block.extend_from_slice(line);
            block.push(b'\n');
        } else if line.starts_with(b"-----END ") {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                block.extend_from_slice(chunk);
                block.push(b'\n');
            }

            base64.clear();

            block.extend_from_slice(line);
            block.push(b'\n');

            blocks.push(std::mem::take(&mut block));
        } else if inside_base64 {
            base64.extend_from_slice(line);
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(blocks)
}

fn is_pem(data: &[u8]) -> bool {
    memchr::memmem::find(data, b"-----BEGIN ").is_some()
}

fn decode_pem_blocks(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    split_pem(data)?
        .iter()
        .map(|b| {
            pkcs8::der::pem::decode_vec(b)
                .map(|(label, der)| (label.to_owned(), der))
                .map_err(|e| Error::PemDecode(e.into()))
        })
        .collect()
}

/// Length of the `privateKey` field of a SEC1 `ECPrivateKey` structure.
fn sec1_scalar_len(der: &[u8]) -> Option<usize> {
    let seq = AnyRef::from_der(der).ok()?;
    let mut reader = SliceReader::new(seq.value()).ok()?;
    let _version = u8::decode(&mut reader).ok()?;
    let scalar = OctetStringRef::decode(&mut reader).ok()?;

    Some(scalar.as_bytes().len())
}

fn parse_sec1_key(der: &[u8]) -> Result<SignKey> {
    // The curve OID is checked when the optional parameters field is present.
    // Without it, the P-256 parser would accept a P-224 scalar by zero
    // extending it, so the scalar length decides which curve to try first.
    let p224_first = sec1_scalar_len(der) == Some(P224_SCALAR_SIZE);

    let p256 = || p256::SecretKey::from_sec1_der(der).map(EcPrivateKey::P256);
    let p224 = || p224::SecretKey::from_sec1_der(der).map(EcPrivateKey::P224);

    let key = if p224_first {
        p224().or_else(|_| p256())
    } else {
        p256().or_else(|_| p224())
    };

    key.map(SignKey::Ec).map_err(|_| Error::UnsupportedEcKey)
}

fn parse_ed25519_private_key(info: &PrivateKeyInfo) -> Result<SignKey> {
    // The private key field is an OCTET STRING wrapping the 32-byte seed.
    let seed = OctetStringRef::from_der(info.private_key)
        .map_err(|_| Error::InvalidEd25519Key)?
        .as_bytes()
        .try_into()
        .map_err(|_| Error::InvalidEd25519Key)?;

    Ok(SignKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed)))
}

fn parse_pkcs8_key(der: &[u8]) -> Result<SignKey> {
    let info = PrivateKeyInfo::try_from(der).map_err(Error::LoadKeyPkcs8)?;
    let oid = info.algorithm.oid;

    if oid == rfc5912::RSA_ENCRYPTION {
        RsaPrivateKey::from_pkcs8_der(der)
            .map(SignKey::Rsa)
            .map_err(Error::LoadKeyPkcs8)
    } else if oid == rfc5912::ID_EC_PUBLIC_KEY {
        let curve = info
            .algorithm
            .parameters_oid()
            .map_err(|e| Error::LoadKeyPkcs8(e.into()))?;

        if curve == rfc5912::SECP_256_R_1 {
            p256::SecretKey::from_pkcs8_der(der)
                .map(|k| SignKey::Ec(EcPrivateKey::P256(k)))
                .map_err(Error::LoadKeyPkcs8)
        } else if curve == rfc5912::SECP_224_R_1 {
            p224::SecretKey::from_pkcs8_der(der)
                .map(|k| SignKey::Ec(EcPrivateKey::P224(k)))
                .map_err(Error::LoadKeyPkcs8)
        } else {
            Err(Error::UnsupportedCurve(curve))
        }
    } else if oid == rfc8410::ID_ED_25519 {
        parse_ed25519_private_key(&info)
    } else {
        Err(Error::UnsupportedAlgorithm(oid))
    }
}

fn parse_encrypted_pkcs8_key(der: &[u8], source: &PassphraseSource) -> Result<SignKey> {
    let info = EncryptedPrivateKeyInfo::try_from(der).map_err(Error::LoadKeyEncrypted)?;
    let passphrase = source.acquire(false)?;
    let doc = info
        .decrypt(passphrase)
        .map_err(Error::LoadKeyEncrypted)?;

    parse_pkcs8_key(doc.as_bytes())
}

/// Parse a raw DER private key of unknown encoding.
fn parse_der_key(der: &[u8]) -> Result<SignKey> {
    if let Ok(key) = parse_pkcs8_key(der) {
        return Ok(key);
    } else if let Ok(key) = RsaPrivateKey::from_pkcs1_der(der) {
        return Ok(SignKey::Rsa(key));
    }

    parse_sec1_key(der).map_err(|_| Error::UnrecognizedKey)
}

/// Parse a signing key. PEM data may contain an `RSA PRIVATE KEY` (PKCS#1),
/// `EC PRIVATE KEY` (SEC1, optionally preceded by `EC PARAMETERS`),
/// `PRIVATE KEY` (PKCS#8), or `ENCRYPTED PRIVATE KEY` (encrypted PKCS#8)
/// block. Data without PEM armor is parsed as raw DER.
pub fn parse_sign_key(data: &[u8], source: &PassphraseSource) -> Result<SignKey> {
    if !is_pem(data) {
        return parse_der_key(data);
    }

    let mut keys = vec![];

    for (label, der) in decode_pem_blocks(data)? {
        let key = match label.as_str() {
            PEM_LABEL_EC_PARAMETERS => continue,
            PEM_LABEL_RSA_PRIVATE_KEY => RsaPrivateKey::from_pkcs1_der(&der)
                .map(SignKey::Rsa)
                .map_err(Error::LoadKeyPkcs1)?,
            PEM_LABEL_EC_PRIVATE_KEY => parse_sec1_key(&der)?,
            PEM_LABEL_PRIVATE_KEY => parse_pkcs8_key(&der)?,
            PEM_LABEL_ENCRYPTED_PRIVATE_KEY => parse_encrypted_pkcs8_key(&der, source)?,
            _ => return Err(Error::UnsupportedPemLabel(label)),
        };

        keys.push(key);
    }

    match keys.len() {
        0 => Err(Error::UnrecognizedKey),
        1 => Ok(keys.swap_remove(0)),
        n => Err(Error::KeyCount(n)),
    }
}

fn parse_spki(der: &[u8]) -> Result<PublicKey> {
    let spki = SubjectPublicKeyInfoRef::try_from(der).map_err(Error::LoadPubKey)?;
    let oid = spki.algorithm.oid;

    if oid == rfc5912::RSA_ENCRYPTION {
        RsaPublicKey::from_public_key_der(der)
            .map(PublicKey::Rsa)
            .map_err(Error::LoadPubKey)
    } else if oid == rfc5912::ID_EC_PUBLIC_KEY {
        let curve = spki.algorithm.parameters_oid().map_err(Error::LoadPubKey)?;

        if curve == rfc5912::SECP_256_R_1 {
            p256::PublicKey::from_public_key_der(der)
                .map(|k| PublicKey::Ec(EcPublicKey::P256(k)))
                .map_err(Error::LoadPubKey)
        } else if curve == rfc5912::SECP_224_R_1 {
            p224::PublicKey::from_public_key_der(der)
                .map(|k| PublicKey::Ec(EcPublicKey::P224(k)))
                .map_err(Error::LoadPubKey)
        } else {
            Err(Error::UnsupportedCurve(curve))
        }
    } else if oid == rfc8410::ID_ED_25519 {
        let point = spki
            .subject_public_key
            .as_bytes()
            .and_then(|b| <&[u8; 32]>::try_from(b).ok())
            .ok_or(Error::InvalidEd25519Key)?;

        ed25519_dalek::VerifyingKey::from_bytes(point)
            .map(PublicKey::Ed25519)
            .map_err(|_| Error::InvalidEd25519Key)
    } else {
        Err(Error::UnsupportedAlgorithm(oid))
    }
}

/// Parse a public key from a PEM `PUBLIC KEY` (SubjectPublicKeyInfo) or
/// `RSA PUBLIC KEY` (PKCS#1) block.
pub fn parse_public_key(data: &[u8]) -> Result<PublicKey> {
    if !is_pem(data) {
        if let Ok(key) = parse_spki(data) {
            return Ok(key);
        }

        return RsaPublicKey::from_pkcs1_der(data)
            .map(PublicKey::Rsa)
            .map_err(|_| Error::UnrecognizedPublicKey);
    }

    let mut keys = vec![];

    for (label, der) in decode_pem_blocks(data)? {
        let key = match label.as_str() {
            PEM_LABEL_PUBLIC_KEY => parse_spki(&der)?,
            PEM_LABEL_RSA_PUBLIC_KEY => RsaPublicKey::from_pkcs1_der(&der)
                .map(PublicKey::Rsa)
                .map_err(Error::LoadPubKeyPkcs1)?,
            _ => return Err(Error::UnsupportedPemLabel(label)),
        };

        keys.push(key);
    }

    match keys.len() {
        0 => Err(Error::UnrecognizedPublicKey),
        1 => Ok(keys.swap_remove(0)),
        n => Err(Error::KeyCount(n)),
    }
}

/// Parse the RSA public key used for wrapping image secrets.
pub fn parse_rsa_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    match parse_public_key(data)? {
        PublicKey::Rsa(key) => Ok(key),
        _ => Err(Error::UnrecognizedPublicKey),
    }
}

/// Generate a new signing key.
pub fn generate_sign_key(kind: KeyKind, rng: &mut (impl CryptoRng + RngCore)) -> Result<SignKey> {
    let key = match kind {
        KeyKind::Rsa2048 => SignKey::Rsa(
            RsaPrivateKey::new(rng, 2048).map_err(|e| Error::RsaGenerate(Box::new(e)))?,
        ),
        KeyKind::Rsa3072 => SignKey::Rsa(
            RsaPrivateKey::new(rng, 3072).map_err(|e| Error::RsaGenerate(Box::new(e)))?,
        ),
        KeyKind::EcP224 => SignKey::Ec(EcPrivateKey::P224(p224::SecretKey::random(rng))),
        KeyKind::EcP256 => SignKey::Ec(EcPrivateKey::P256(p256::SecretKey::random(rng))),
        KeyKind::Ed25519 => SignKey::Ed25519(ed25519_dalek::SigningKey::generate(rng)),
    };

    Ok(key)
}

/// Encode a signing key as a PEM PKCS#8 block. If `passphrase` is not empty,
/// the key is encrypted with scrypt and AES-256-CBC.
pub fn encode_pem_key(
    key: &SignKey,
    passphrase: &str,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<String> {
    let plain_text_der = key.to_pkcs8_der()?;

    if passphrase.is_empty() {
        let data = plain_text_der
            .to_pem(PrivateKeyInfo::PEM_LABEL, LineEnding::LF)
            .map_err(|e| Error::SaveKey(e.into()))?;

        return Ok(data.to_string());
    }

    // Match openssl's default scrypt parameters (N=16384, r=8, p=1) instead of
    // the pkcs8 crate's, which openssl cannot read due to its memory limit.
    let mut salt = [0u8; 16];
    rng.fill_bytes(&mut salt);

    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv);

    // 14 = log_2(16384), 32 bytes = 256 bits
    let scrypt_params =
        scrypt::Params::new(14, 8, 1, 32).map_err(|_| Error::SaveKey(pkcs8::Error::KeyMalformed))?;
    let pbes2_params = pbes2::Parameters::scrypt_aes256cbc(scrypt_params, &salt, &iv)
        .map_err(|e| Error::SaveKey(e.into()))?;

    let private_key_info =
        PrivateKeyInfo::try_from(plain_text_der.as_bytes()).map_err(Error::SaveKey)?;

    let secret_doc = private_key_info
        .encrypt_with_params(pbes2_params, passphrase)
        .map_err(Error::SaveKey)?;

    let data = secret_doc
        .to_pem(EncryptedPrivateKeyInfo::PEM_LABEL, LineEnding::LF)
        .map_err(|e| Error::SaveKey(e.into()))?;

    Ok(data.to_string())
}

/// Read and parse a signing key from a file.
pub fn read_sign_key_file(path: &Path, source: &PassphraseSource) -> Result<SignKey> {
    let data = fs::read(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    parse_sign_key(&data, source)
}

/// Read and parse a public key from a file.
pub fn read_public_key_file(path: &Path) -> Result<PublicKey> {
    let data = fs::read(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    parse_public_key(&data)
}

/// Save a PEM-encoded PKCS#8 private key to a file that only the owner can
/// read.
pub fn write_pem_key_file(
    path: &Path,
    key: &SignKey,
    source: &PassphraseSource,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<()> {
    let passphrase = source.acquire(true)?;
    let data = encode_pem_key(key, &passphrase, rng)?;

    let mut options = OpenOptions::new();
    options.write(true);
    options.create(true);
    options.truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut writer = options
        .open(path)
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    writer
        .write_all(data.as_bytes())
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    Ok(())
}
