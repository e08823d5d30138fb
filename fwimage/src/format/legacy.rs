// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Legacy (v1) image format. This predates the trailer and supports a single
//! signing key whose algorithm is recorded in the header flags.

use std::{
    fmt,
    io::{self, Read, Write},
    mem,
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::image::{self, IMAGE_HASH_SIZE, IMAGE_TLV_HEADER_SIZE, ImageVersion, Tlv},
    stream::{FromReader, ToWriter},
};

pub const IMAGE_V1_MAGIC: u32 = 0x96f3b83c;
pub const IMAGE_V1_HEADER_SIZE: usize = 32;

pub const TLV_V1_TYPE_SHA256: u8 = 1;
pub const TLV_V1_TYPE_RSA2048: u8 = 2;
pub const TLV_V1_TYPE_ECDSA224: u8 = 3;
pub const TLV_V1_TYPE_ECDSA256: u8 = 4;

pub fn legacy_tlv_type_name(tlv_type: u8) -> &'static str {
    match tlv_type {
        TLV_V1_TYPE_SHA256 => "SHA256",
        TLV_V1_TYPE_RSA2048 => "RSA2048",
        TLV_V1_TYPE_ECDSA224 => "ECDSA224",
        TLV_V1_TYPE_ECDSA256 => "ECDSA256",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid legacy image magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Header size too small: {0} < {IMAGE_V1_HEADER_SIZE}")]
    HeaderSizeTooSmall(u16),
    #[error("Header size {header_size} exceeds available {available} bytes")]
    HeaderSizeTooLarge { header_size: u16, available: usize },
    #[error("Body size {body_size} exceeds remaining {available} bytes")]
    BodySizeTooLarge { body_size: u32, available: usize },
    #[error("Header declares {header} body bytes, but body has {actual} bytes")]
    BodySizeMismatch { header: u32, actual: usize },
    #[error("Header padding is {actual} bytes, but header size requires {expected}")]
    PaddingSizeMismatch { expected: usize, actual: usize },
    #[error("Header declares {expected} bytes of TLVs, but have {actual}")]
    TlvSizeMismatch { expected: usize, actual: usize },
    #[error("Total TLV size exceeds limit: {0} > {max}", max = u16::MAX)]
    TlvSizeTooLarge(usize),
    #[error("Invalid SHA256 TLV size: {0}")]
    InvalidHashSize(usize),
    #[error("Failed to read legacy image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write legacy image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
    #[error("TLV error")]
    Tlv(#[from] image::Error),
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct LegacyFlags: u32 {
        const PIC = 0x01;
        const SHA256 = 0x02;
        const PKCS15_RSA2048_SHA256 = 0x04;
        const ECDSA224_SHA256 = 0x08;
        const NON_BOOTABLE = 0x10;
        const ECDSA256_SHA256 = 0x20;
        const PKCS1_PSS_RSA2048_SHA256 = 0x40;

        const _ = !0;
    }
}

/// Raw on-disk layout for the legacy image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawLegacyHeader {
    /// Magic value. This should be equal to [`IMAGE_V1_MAGIC`].
    magic: little_endian::U32,
    /// Total size of all TLVs that follow the body, including their headers.
    tlv_size: little_endian::U16,
    key_id: u8,
    pad1: u8,
    hdr_sz: little_endian::U16,
    pad2: little_endian::U16,
    img_sz: little_endian::U32,
    flags: little_endian::U32,
    vers_major: u8,
    vers_minor: u8,
    vers_revision: little_endian::U16,
    vers_build_num: little_endian::U32,
    pad3: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawLegacyHeader>() == IMAGE_V1_HEADER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LegacyHeader {
    /// Always derived from the TLV list when writing.
    pub tlv_size: u16,
    pub key_id: u8,
    pub pad1: u8,
    pub header_size: u16,
    pub pad2: u16,
    pub body_size: u32,
    pub flags: LegacyFlags,
    pub version: ImageVersion,
    pub pad3: u32,
}

impl LegacyHeader {
    fn from_raw(raw: &RawLegacyHeader) -> Self {
        Self {
            tlv_size: raw.tlv_size.get(),
            key_id: raw.key_id,
            pad1: raw.pad1,
            header_size: raw.hdr_sz.get(),
            pad2: raw.pad2.get(),
            body_size: raw.img_sz.get(),
            flags: LegacyFlags::from_bits_retain(raw.flags.get()),
            version: ImageVersion {
                major: raw.vers_major,
                minor: raw.vers_minor,
                revision: raw.vers_revision.get(),
                build_num: raw.vers_build_num.get(),
            },
            pad3: raw.pad3.get(),
        }
    }

    fn to_raw(self) -> RawLegacyHeader {
        RawLegacyHeader {
            magic: IMAGE_V1_MAGIC.into(),
            tlv_size: self.tlv_size.into(),
            key_id: self.key_id,
            pad1: self.pad1,
            hdr_sz: self.header_size.into(),
            pad2: self.pad2.into(),
            img_sz: self.body_size.into(),
            flags: self.flags.bits().into(),
            vers_major: self.version.major,
            vers_minor: self.version.minor,
            vers_revision: self.version.revision.into(),
            vers_build_num: self.version.build_num.into(),
            pad3: self.pad3.into(),
        }
    }

    pub fn to_bytes(&self) -> [u8; IMAGE_V1_HEADER_SIZE] {
        let mut buf = [0u8; IMAGE_V1_HEADER_SIZE];
        buf.copy_from_slice(self.to_raw().as_bytes());
        buf
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct LegacyImage {
    pub header: LegacyHeader,
    pub pad: Vec<u8>,
    pub body: Vec<u8>,
    pub tlvs: Vec<Tlv>,
}

impl fmt::Debug for LegacyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyImage")
            .field("header", &self.header)
            .field("pad", &self.pad.len())
            .field("body", &self.body.len())
            .field("tlvs", &self.tlvs)
            .finish()
    }
}

impl LegacyImage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, remain) =
            RawLegacyHeader::read_from_prefix(data).map_err(|_| Error::HeaderSizeTooLarge {
                header_size: IMAGE_V1_HEADER_SIZE as u16,
                available: data.len(),
            })?;

        if raw.magic.get() != IMAGE_V1_MAGIC {
            return Err(Error::InvalidMagic(raw.magic.get()));
        }

        let header = LegacyHeader::from_raw(&raw);

        if usize::from(header.header_size) < IMAGE_V1_HEADER_SIZE {
            return Err(Error::HeaderSizeTooSmall(header.header_size));
        } else if usize::from(header.header_size) > data.len() {
            return Err(Error::HeaderSizeTooLarge {
                header_size: header.header_size,
                available: data.len(),
            });
        }

        let (pad, remain) =
            remain.split_at(usize::from(header.header_size) - IMAGE_V1_HEADER_SIZE);

        if header.body_size as usize > remain.len() {
            return Err(Error::BodySizeTooLarge {
                body_size: header.body_size,
                available: remain.len(),
            });
        }

        let (body, remain) = remain.split_at(header.body_size as usize);

        if usize::from(header.tlv_size) != remain.len() {
            return Err(Error::TlvSizeMismatch {
                expected: header.tlv_size.into(),
                actual: remain.len(),
            });
        }

        let tlvs = image::parse_tlvs(remain)?;

        Ok(Self {
            header,
            pad: pad.to_vec(),
            body: body.to_vec(),
            tlvs,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        self.to_writer(&mut buf)?;
        Ok(buf)
    }

    /// Total size of the TLVs following the body.
    pub fn tlv_size(&self) -> usize {
        self.tlvs.iter().map(Tlv::size).sum()
    }

    /// Data of the unique SHA256 TLV.
    pub fn hash(&self) -> Result<&[u8]> {
        let index = image::find_unique_index(&self.tlvs, TLV_V1_TYPE_SHA256)?;
        let data = &self.tlvs[index].data;
        if data.len() != IMAGE_HASH_SIZE {
            return Err(Error::InvalidHashSize(data.len()));
        }

        Ok(data)
    }

    /// Compute the content hash. The header's `tlv_size` field is covered by
    /// the hash, so it must already reflect the final TLV list.
    pub fn calc_hash(&self, initial_hash: Option<&[u8]>) -> [u8; IMAGE_HASH_SIZE] {
        let mut hasher = Sha256::new();

        if let Some(h) = initial_hash {
            hasher.update(h);
        }

        hasher.update(self.header.to_bytes());
        hasher.update(&self.pad);
        hasher.update(&self.body);

        hasher.finalize().into()
    }

    fn validate(&self) -> Result<()> {
        if usize::from(self.header.header_size) < IMAGE_V1_HEADER_SIZE {
            return Err(Error::HeaderSizeTooSmall(self.header.header_size));
        }

        let expected_pad = usize::from(self.header.header_size) - IMAGE_V1_HEADER_SIZE;
        if self.pad.len() != expected_pad {
            return Err(Error::PaddingSizeMismatch {
                expected: expected_pad,
                actual: self.pad.len(),
            });
        }

        if self.header.body_size as usize != self.body.len() {
            return Err(Error::BodySizeMismatch {
                header: self.header.body_size,
                actual: self.body.len(),
            });
        }

        let tlv_size = self.tlv_size();
        if tlv_size > usize::from(u16::MAX) {
            return Err(Error::TlvSizeTooLarge(tlv_size));
        } else if tlv_size != usize::from(self.header.tlv_size) {
            return Err(Error::TlvSizeMismatch {
                expected: self.header.tlv_size.into(),
                actual: tlv_size,
            });
        }

        Ok(())
    }
}

impl<R: Read> FromReader<R> for LegacyImage {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut data = vec![];
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::DataRead("image", e))?;

        Self::parse(&data)
    }
}

impl<W: Write> ToWriter<W> for LegacyImage {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        self.validate()?;

        self.header
            .to_raw()
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("header", e))?;
        writer
            .write_all(&self.pad)
            .map_err(|e| Error::DataWrite("header_padding", e))?;
        writer
            .write_all(&self.body)
            .map_err(|e| Error::DataWrite("body", e))?;

        image::write_tlvs(&mut writer, &self.tlvs)?;

        Ok(())
    }
}

/// Size of a legacy TLV, including its header, that holds `len` bytes.
pub fn tlv_size_for(len: usize) -> usize {
    IMAGE_TLV_HEADER_SIZE + len
}
