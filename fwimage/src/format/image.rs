// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Write},
    mem,
    str::FromStr,
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    stream::{FromReader, ToWriter},
    util::HexBytes,
};

/// Magic value for [`RawHeader::magic`].
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;
/// Magic value for [`RawTrailer::magic`].
pub const IMAGE_TRAILER_MAGIC: u16 = 0x6907;

/// Size of the fixed portion of the header. The header may be padded beyond
/// this with zeros.
pub const IMAGE_HEADER_SIZE: usize = 32;
pub const IMAGE_TRAILER_SIZE: usize = 4;
pub const IMAGE_TLV_HEADER_SIZE: usize = 4;

/// Size of the content hash stored in [`TLV_TYPE_SHA256`].
pub const IMAGE_HASH_SIZE: usize = 32;
/// Size of the truncated public key hash stored in [`TLV_TYPE_KEYHASH`].
pub const IMAGE_KEY_HASH_SIZE: usize = 4;

pub const TLV_TYPE_KEYHASH: u8 = 0x01;
pub const TLV_TYPE_SHA256: u8 = 0x10;
pub const TLV_TYPE_RSA2048: u8 = 0x20;
pub const TLV_TYPE_ECDSA224: u8 = 0x21;
pub const TLV_TYPE_ECDSA256: u8 = 0x22;
pub const TLV_TYPE_RSA3072: u8 = 0x23;
pub const TLV_TYPE_ED25519: u8 = 0x24;
pub const TLV_TYPE_ENC_RSA: u8 = 0x30;
pub const TLV_TYPE_ENC_KEK: u8 = 0x31;

/// Whether the TLV type holds a signature.
pub fn is_sig_type(tlv_type: u8) -> bool {
    (TLV_TYPE_RSA2048..=TLV_TYPE_ED25519).contains(&tlv_type)
}

/// Whether the TLV type holds a wrapped image secret.
pub fn is_secret_type(tlv_type: u8) -> bool {
    tlv_type == TLV_TYPE_ENC_RSA || tlv_type == TLV_TYPE_ENC_KEK
}

/// Human readable name of a TLV type.
pub fn tlv_type_name(tlv_type: u8) -> &'static str {
    match tlv_type {
        TLV_TYPE_KEYHASH => "KEYHASH",
        TLV_TYPE_SHA256 => "SHA256",
        TLV_TYPE_RSA2048 => "RSA2048",
        TLV_TYPE_ECDSA224 => "ECDSA224",
        TLV_TYPE_ECDSA256 => "ECDSA256",
        TLV_TYPE_RSA3072 => "RSA3072",
        TLV_TYPE_ED25519 => "ED25519",
        TLV_TYPE_ENC_RSA => "ENC_RSA",
        TLV_TYPE_ENC_KEK => "ENC_KEK",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid image magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Header size too small: {0} < {IMAGE_HEADER_SIZE}")]
    HeaderSizeTooSmall(u16),
    #[error("Header size {header_size} exceeds available {available} bytes")]
    HeaderSizeTooLarge { header_size: u16, available: usize },
    #[error("Body size {body_size} exceeds remaining {available} bytes")]
    BodySizeTooLarge { body_size: u32, available: usize },
    #[error("Body too large for header: {0} bytes")]
    BodyTooLarge(usize),
    #[error("Header declares {header} body bytes, but body has {actual} bytes")]
    BodySizeMismatch { header: u32, actual: usize },
    #[error("Header padding is {actual} bytes, but header size requires {expected}")]
    PaddingSizeMismatch { expected: usize, actual: usize },
    // Trailer errors.
    #[error("Image is too small to contain trailer")]
    TrailerTruncated,
    #[error("Invalid trailer magic: {0:#06x}")]
    InvalidTrailerMagic(u16),
    #[error("Trailer declares {expected} bytes of TLVs, but have {actual}")]
    TlvTotalLenMismatch { expected: usize, actual: usize },
    #[error("Total TLV size exceeds limit: {0} > {max}", max = u16::MAX)]
    TlvTotalLenTooLarge(usize),
    // TLV errors.
    #[error("TLV #{index}: Header truncated at offset {offset}")]
    TlvHeaderTruncated { index: usize, offset: usize },
    #[error("TLV #{index}: Data length {len} exceeds remaining {available} bytes")]
    TlvDataTruncated {
        index: usize,
        len: u16,
        available: usize,
    },
    #[error("TLV #{index}: Data too large: {len} bytes")]
    TlvDataTooLarge { index: usize, len: usize },
    #[error("Expected exactly one {name} TLV, but have {count}")]
    TlvNotUnique { name: &'static str, count: usize },
    #[error("Invalid {name} TLV size: {len}")]
    TlvInvalidSize { name: &'static str, len: usize },
    // Version errors.
    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),
    // Wrapped errors.
    #[error("Failed to read image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
    pub struct ImageFlags: u32 {
        /// Position independent code.
        const PIC = 1 << 0;
        /// The image is chained after another image and is not directly
        /// bootable.
        const NON_BOOTABLE = 1 << 1;
        /// The body is encrypted with a per-image secret.
        const ENCRYPTED = 1 << 2;
        /// The image is copied to RAM before execution.
        const RAM_LOAD = 1 << 5;

        const _ = !0;
    }
}

/// Image version in `major.minor.revision.build` form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl ImageVersion {
    pub fn new(major: u8, minor: u8, revision: u16, build_num: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            build_num,
        }
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.build_num,
        )
    }
}

impl FromStr for ImageVersion {
    type Err = Error;

    /// Parse a version string. Missing trailing components default to 0.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_owned());

        let pieces = s.split('.').collect::<Vec<_>>();
        if pieces.len() > 4 {
            return Err(invalid());
        }

        let mut values = [0u64; 4];
        for (value, piece) in values.iter_mut().zip(&pieces) {
            if piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *value = piece.parse().map_err(|_| invalid())?;
        }

        Ok(Self {
            major: values[0].try_into().map_err(|_| invalid())?,
            minor: values[1].try_into().map_err(|_| invalid())?,
            revision: values[2].try_into().map_err(|_| invalid())?,
            build_num: values[3].try_into().map_err(|_| invalid())?,
        })
    }
}

/// Raw on-disk layout for the image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`IMAGE_MAGIC`].
    magic: little_endian::U32,
    pad1: little_endian::U32,
    /// Size of the header including padding. Must be at least
    /// [`IMAGE_HEADER_SIZE`].
    hdr_sz: little_endian::U16,
    pad2: little_endian::U16,
    /// Size of the body, excluding the header and trailer.
    img_sz: little_endian::U32,
    flags: little_endian::U32,
    vers_major: u8,
    vers_minor: u8,
    vers_revision: little_endian::U16,
    vers_build_num: little_endian::U32,
    pad3: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawHeader>() == IMAGE_HEADER_SIZE);

/// Raw on-disk layout for the trailer that precedes the TLVs.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawTrailer {
    /// Magic value. This should be equal to [`IMAGE_TRAILER_MAGIC`].
    magic: little_endian::U16,
    /// Size of all TLVs, including their headers, plus the trailer itself.
    tlv_tot_len: little_endian::U16,
}

const _: () = assert!(mem::size_of::<RawTrailer>() == IMAGE_TRAILER_SIZE);

/// Raw on-disk layout for a TLV header. This is shared with the legacy format.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawTlvHeader {
    tlv_type: u8,
    pad: u8,
    len: little_endian::U16,
}

const _: () = assert!(mem::size_of::<RawTlvHeader>() == IMAGE_TLV_HEADER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageHeader {
    pub header_size: u16,
    pub body_size: u32,
    pub flags: ImageFlags,
    pub version: ImageVersion,
    pub pad1: u32,
    pub pad2: u16,
    pub pad3: u32,
}

impl ImageHeader {
    fn from_raw(raw: &RawHeader) -> Self {
        Self {
            header_size: raw.hdr_sz.get(),
            body_size: raw.img_sz.get(),
            flags: ImageFlags::from_bits_retain(raw.flags.get()),
            version: ImageVersion {
                major: raw.vers_major,
                minor: raw.vers_minor,
                revision: raw.vers_revision.get(),
                build_num: raw.vers_build_num.get(),
            },
            pad1: raw.pad1.get(),
            pad2: raw.pad2.get(),
            pad3: raw.pad3.get(),
        }
    }

    fn to_raw(self) -> RawHeader {
        RawHeader {
            magic: IMAGE_MAGIC.into(),
            pad1: self.pad1.into(),
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

    /// Serialize the fixed-size portion of the header.
    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        buf.copy_from_slice(self.to_raw().as_bytes());
        buf
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tlv {
    pub tlv_type: u8,
    pub pad: u8,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
}

impl fmt::Debug for Tlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlv")
            .field("tlv_type", &format_args!("{:#04x}", self.tlv_type))
            .field("pad", &self.pad)
            .field("data", &HexBytes(&self.data))
            .finish()
    }
}

impl Tlv {
    pub fn new(tlv_type: u8, data: Vec<u8>) -> Self {
        Self {
            tlv_type,
            pad: 0,
            data,
        }
    }

    /// Size of the TLV on disk, including its header.
    pub fn size(&self) -> usize {
        IMAGE_TLV_HEADER_SIZE + self.data.len()
    }
}

/// Parse TLVs until the input is exhausted.
pub(crate) fn parse_tlvs(data: &[u8]) -> Result<Vec<Tlv>> {
    let mut tlvs = vec![];
    let mut offset = 0;

    while offset < data.len() {
        let index = tlvs.len();
        let (raw, remain) = RawTlvHeader::read_from_prefix(&data[offset..])
            .map_err(|_| Error::TlvHeaderTruncated { index, offset })?;

        let len = raw.len.get();
        if usize::from(len) > remain.len() {
            return Err(Error::TlvDataTruncated {
                index,
                len,
                available: remain.len(),
            });
        }

        tlvs.push(Tlv {
            tlv_type: raw.tlv_type,
            pad: raw.pad,
            data: remain[..usize::from(len)].to_vec(),
        });

        offset += IMAGE_TLV_HEADER_SIZE + usize::from(len);
    }

    Ok(tlvs)
}

pub(crate) fn write_tlvs(mut writer: impl Write, tlvs: &[Tlv]) -> Result<()> {
    for (index, tlv) in tlvs.iter().enumerate() {
        let len = u16::try_from(tlv.data.len()).map_err(|_| Error::TlvDataTooLarge {
            index,
            len: tlv.data.len(),
        })?;

        let raw = RawTlvHeader {
            tlv_type: tlv.tlv_type,
            pad: tlv.pad,
            len: len.into(),
        };

        raw.write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("tlv_header", e))?;
        writer
            .write_all(&tlv.data)
            .map_err(|e| Error::DataWrite("tlv_data", e))?;
    }

    Ok(())
}

/// Return the index of the only TLV matching `tlv_type`.
pub(crate) fn find_unique_index(tlvs: &[Tlv], tlv_type: u8) -> Result<usize> {
    let indices = tlvs
        .iter()
        .enumerate()
        .filter(|(_, t)| t.tlv_type == tlv_type)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    match indices.as_slice() {
        [i] => Ok(*i),
        _ => Err(Error::TlvNotUnique {
            name: tlv_type_name(tlv_type),
            count: indices.len(),
        }),
    }
}

/// Compute the content hash of an image. This covers the optional initial
/// hash (for images chained after a loader), the header, the header padding,
/// and the plaintext body.
pub fn calc_hash(
    initial_hash: Option<&[u8]>,
    header: &ImageHeader,
    pad: &[u8],
    body: &[u8],
) -> [u8; IMAGE_HASH_SIZE] {
    let mut hasher = Sha256::new();

    if let Some(h) = initial_hash {
        hasher.update(h);
    }

    hasher.update(header.to_bytes());
    hasher.update(pad);
    hasher.update(body);

    hasher.finalize().into()
}

/// Byte offsets of each component within a serialized [`Image`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageOffsets {
    pub header: usize,
    pub body: usize,
    pub trailer: usize,
    pub tlvs: Vec<usize>,
    pub total_size: usize,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    pub header: ImageHeader,
    /// Zero padding between the fixed-size header and the body.
    pub pad: Vec<u8>,
    pub body: Vec<u8>,
    pub tlvs: Vec<Tlv>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("header", &self.header)
            .field("pad", &self.pad.len())
            .field("body", &self.body.len())
            .field("tlvs", &self.tlvs)
            .finish()
    }
}

impl Image {
    /// Parse an image from a complete buffer. Everything after the trailer
    /// must be TLVs.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, remain) =
            RawHeader::read_from_prefix(data).map_err(|_| Error::HeaderSizeTooLarge {
                header_size: IMAGE_HEADER_SIZE as u16,
                available: data.len(),
            })?;

        if raw.magic.get() != IMAGE_MAGIC {
            return Err(Error::InvalidMagic(raw.magic.get()));
        }

        let header = ImageHeader::from_raw(&raw);

        if usize::from(header.header_size) < IMAGE_HEADER_SIZE {
            return Err(Error::HeaderSizeTooSmall(header.header_size));
        } else if usize::from(header.header_size) > data.len() {
            return Err(Error::HeaderSizeTooLarge {
                header_size: header.header_size,
                available: data.len(),
            });
        }

        let (pad, remain) = remain.split_at(usize::from(header.header_size) - IMAGE_HEADER_SIZE);

        if header.body_size as usize > remain.len() {
            return Err(Error::BodySizeTooLarge {
                body_size: header.body_size,
                available: remain.len(),
            });
        }

        let (body, remain) = remain.split_at(header.body_size as usize);

        let (trailer, remain) =
            RawTrailer::read_from_prefix(remain).map_err(|_| Error::TrailerTruncated)?;

        if trailer.magic.get() != IMAGE_TRAILER_MAGIC {
            return Err(Error::InvalidTrailerMagic(trailer.magic.get()));
        }

        let tlvs = parse_tlvs(remain)?;

        let expected = usize::from(trailer.tlv_tot_len.get());
        let actual = IMAGE_TRAILER_SIZE + remain.len();
        if expected != actual {
            return Err(Error::TlvTotalLenMismatch { expected, actual });
        }

        Ok(Self {
            header,
            pad: pad.to_vec(),
            body: body.to_vec(),
            tlvs,
        })
    }

    /// Serialize the image to a new buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.total_size());
        self.to_writer(&mut buf)?;
        Ok(buf)
    }

    /// Value of the trailer's TLV length field. This includes the trailer.
    pub fn tlv_total_len(&self) -> usize {
        IMAGE_TRAILER_SIZE + self.tlvs.iter().map(Tlv::size).sum::<usize>()
    }

    pub fn total_size(&self) -> usize {
        IMAGE_HEADER_SIZE + self.pad.len() + self.body.len() + self.tlv_total_len()
    }

    pub fn offsets(&self) -> ImageOffsets {
        let header = 0;
        let body = header + IMAGE_HEADER_SIZE + self.pad.len();
        let trailer = body + self.body.len();
        let mut tlvs = Vec::with_capacity(self.tlvs.len());
        let mut offset = trailer + IMAGE_TRAILER_SIZE;

        for tlv in &self.tlvs {
            tlvs.push(offset);
            offset += tlv.size();
        }

        ImageOffsets {
            header,
            body,
            trailer,
            tlvs,
            total_size: offset,
        }
    }

    /// Ensure that the header fields agree with the image contents.
    fn validate(&self) -> Result<()> {
        if usize::from(self.header.header_size) < IMAGE_HEADER_SIZE {
            return Err(Error::HeaderSizeTooSmall(self.header.header_size));
        }

        let expected_pad = usize::from(self.header.header_size) - IMAGE_HEADER_SIZE;
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

        let total = self.tlv_total_len();
        if total > usize::from(u16::MAX) {
            return Err(Error::TlvTotalLenTooLarge(total));
        }

        Ok(())
    }

    /// Get the content hash stored in the SHA256 TLV.
    pub fn hash(&self) -> Result<&[u8]> {
        let tlv = self.find_unique_tlv(TLV_TYPE_SHA256)?;
        if tlv.data.len() != IMAGE_HASH_SIZE {
            return Err(Error::TlvInvalidSize {
                name: tlv_type_name(TLV_TYPE_SHA256),
                len: tlv.data.len(),
            });
        }

        Ok(&tlv.data)
    }

    /// Recompute the content hash from the image contents. The body must be
    /// plaintext for the result to be meaningful.
    pub fn calc_hash(&self, initial_hash: Option<&[u8]>) -> [u8; IMAGE_HASH_SIZE] {
        calc_hash(initial_hash, &self.header, &self.pad, &self.body)
    }

    pub fn find_tlv_indices(&self, tlv_type: u8) -> Vec<usize> {
        self.tlvs
            .iter()
            .enumerate()
            .filter(|(_, t)| t.tlv_type == tlv_type)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn find_tlvs(&self, tlv_type: u8) -> impl Iterator<Item = &Tlv> {
        self.tlvs.iter().filter(move |t| t.tlv_type == tlv_type)
    }

    pub fn find_unique_tlv(&self, tlv_type: u8) -> Result<&Tlv> {
        let index = find_unique_index(&self.tlvs, tlv_type)?;
        Ok(&self.tlvs[index])
    }

    pub fn add_tlv(&mut self, tlv: Tlv) {
        self.tlvs.push(tlv);
    }

    /// Return a copy of this image without the TLVs matching `pred`, along
    /// with the removed TLVs in their original order.
    pub fn without_tlvs(&self, mut pred: impl FnMut(&Tlv) -> bool) -> (Self, Vec<Tlv>) {
        let (removed, kept): (Vec<_>, Vec<_>) = self.tlvs.iter().cloned().partition(|t| pred(t));

        let image = Self {
            header: self.header,
            pad: self.pad.clone(),
            body: self.body.clone(),
            tlvs: kept,
        };

        (image, removed)
    }

    pub fn without_tlvs_of_type(&self, tlv_type: u8) -> (Self, Vec<Tlv>) {
        self.without_tlvs(|t| t.tlv_type == tlv_type)
    }
}

impl<R: Read> FromReader<R> for Image {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut data = vec![];
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::DataRead("image", e))?;

        Self::parse(&data)
    }
}

impl<W: Write> ToWriter<W> for Image {
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

        let trailer = RawTrailer {
            magic: IMAGE_TRAILER_MAGIC.into(),
            tlv_tot_len: (self.tlv_total_len() as u16).into(),
        };
        trailer
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("trailer", e))?;

        write_tlvs(&mut writer, &self.tlvs)
    }
}
