// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Manufacturing meta region (MMR). This is a list of TLVs followed by a
//! footer. It is located by reading the footer at the end of a region, so
//! parsing works backwards from a known end offset.

use std::{
    fmt,
    io::{self, Write},
    mem,
};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{trace, warn};
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{stream::CountingWriter, util::HexBytes};

pub const META_MAGIC: u32 = 0x3bb2a269;
pub const META_VERSION: u8 = 2;
pub const META_FOOTER_SIZE: usize = 8;
pub const META_TLV_HEADER_SIZE: usize = 2;
pub const META_HASH_SIZE: usize = 32;

pub const META_TLV_TYPE_HASH: u8 = 0x01;
pub const META_TLV_TYPE_FLASH_AREA: u8 = 0x02;
pub const META_TLV_TYPE_MMR_REF: u8 = 0x04;

pub const META_FLASH_AREA_SIZE: usize = 10;
pub const META_MMR_REF_SIZE: usize = 1;

pub fn meta_tlv_type_name(tlv_type: u8) -> &'static str {
    match tlv_type {
        META_TLV_TYPE_HASH => "HASH",
        META_TLV_TYPE_FLASH_AREA => "FLASH_AREA",
        META_TLV_TYPE_MMR_REF => "MMR_REF",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Data too small to contain meta footer: {0} bytes")]
    FooterTruncated(usize),
    #[error("Invalid meta footer magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Meta region size too small: {0} < {META_FOOTER_SIZE}")]
    RegionSizeTooSmall(u16),
    #[error("Meta region size {size} exceeds available {available} bytes")]
    RegionSizeTooLarge { size: u16, available: usize },
    #[error("Meta region too large: {0} bytes")]
    RegionTooLarge(usize),
    #[error("TLV #{index}: Header truncated at offset {offset}")]
    TlvHeaderTruncated { index: usize, offset: usize },
    #[error("TLV #{index}: Data length {len} exceeds remaining {available} bytes")]
    TlvDataTruncated {
        index: usize,
        len: u8,
        available: usize,
    },
    #[error("TLV #{index}: Data too large: {len} bytes")]
    TlvDataTooLarge { index: usize, len: usize },
    #[error("Expected exactly one {name} TLV, but have {count}")]
    TlvNotUnique { name: &'static str, count: usize },
    #[error("Invalid {name} TLV size: {len}")]
    TlvInvalidSize { name: &'static str, len: usize },
    #[error("Failed to write meta data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the meta footer.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawMetaFooter {
    /// Size of the entire region, including this footer.
    size: little_endian::U16,
    version: u8,
    pad: u8,
    /// Magic value. This should be equal to [`META_MAGIC`].
    magic: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawMetaFooter>() == META_FOOTER_SIZE);

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawMetaTlvHeader {
    tlv_type: u8,
    size: u8,
}

const _: () = assert!(mem::size_of::<RawMetaTlvHeader>() == META_TLV_HEADER_SIZE);

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawMetaFlashArea {
    area: u8,
    device: u8,
    offset: little_endian::U32,
    size: little_endian::U32,
}

const _: () = assert!(mem::size_of::<RawMetaFlashArea>() == META_FLASH_AREA_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MetaFooter {
    pub size: u16,
    pub version: u8,
    pub pad: u8,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct MetaTlv {
    pub tlv_type: u8,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
}

impl fmt::Debug for MetaTlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaTlv")
            .field("tlv_type", &format_args!("{:#04x}", self.tlv_type))
            .field("data", &HexBytes(&self.data))
            .finish()
    }
}

impl MetaTlv {
    pub fn new(tlv_type: u8, data: Vec<u8>) -> Self {
        Self { tlv_type, data }
    }

    /// A hash TLV with an all-zero placeholder digest.
    pub fn hash_placeholder() -> Self {
        Self::new(META_TLV_TYPE_HASH, vec![0; META_HASH_SIZE])
    }

    pub fn size(&self) -> usize {
        META_TLV_HEADER_SIZE + self.data.len()
    }
}

/// Body of a [`META_TLV_TYPE_FLASH_AREA`] TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MetaFlashArea {
    pub area: u8,
    pub device: u8,
    pub offset: u32,
    pub size: u32,
}

impl MetaFlashArea {
    pub fn to_tlv(&self) -> MetaTlv {
        let raw = RawMetaFlashArea {
            area: self.area,
            device: self.device,
            offset: self.offset.into(),
            size: self.size.into(),
        };

        MetaTlv::new(META_TLV_TYPE_FLASH_AREA, raw.as_bytes().to_vec())
    }

    fn from_data(data: &[u8]) -> Result<Self> {
        let raw = RawMetaFlashArea::read_from_bytes(data).map_err(|_| Error::TlvInvalidSize {
            name: meta_tlv_type_name(META_TLV_TYPE_FLASH_AREA),
            len: data.len(),
        })?;

        Ok(Self {
            area: raw.area,
            device: raw.device,
            offset: raw.offset.get(),
            size: raw.size.get(),
        })
    }
}

/// Body of a [`META_TLV_TYPE_MMR_REF`] TLV. This points to another flash area
/// that contains its own MMR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MetaMmrRef {
    pub area: u8,
}

impl MetaMmrRef {
    pub fn to_tlv(&self) -> MetaTlv {
        MetaTlv::new(META_TLV_TYPE_MMR_REF, vec![self.area])
    }

    fn from_data(data: &[u8]) -> Result<Self> {
        match data {
            [area] => Ok(Self { area: *area }),
            _ => Err(Error::TlvInvalidSize {
                name: meta_tlv_type_name(META_TLV_TYPE_MMR_REF),
                len: data.len(),
            }),
        }
    }
}

/// Offsets of each component relative to the start of the region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetaOffsets {
    pub tlvs: Vec<usize>,
    pub footer: usize,
    pub total_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub tlvs: Vec<MetaTlv>,
    pub footer: MetaFooter,
}

impl Meta {
    /// Create a new region with a footer matching the TLVs.
    pub fn new(tlvs: Vec<MetaTlv>) -> Result<Self> {
        let total = tlvs.iter().map(MetaTlv::size).sum::<usize>() + META_FOOTER_SIZE;
        let size = u16::try_from(total).map_err(|_| Error::RegionTooLarge(total))?;

        Ok(Self {
            tlvs,
            footer: MetaFooter {
                size,
                version: META_VERSION,
                pad: 0xff,
            },
        })
    }

    /// Parse the region that ends at the end of `data`. Returns the region and
    /// its starting offset within `data`.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let footer_off = data
            .len()
            .checked_sub(META_FOOTER_SIZE)
            .ok_or(Error::FooterTruncated(data.len()))?;

        // This cannot fail since the slice is exactly the right size.
        let raw = RawMetaFooter::read_from_bytes(&data[footer_off..])
            .map_err(|_| Error::FooterTruncated(data.len()))?;

        if raw.magic.get() != META_MAGIC {
            return Err(Error::InvalidMagic(raw.magic.get()));
        }

        let footer = MetaFooter {
            size: raw.size.get(),
            version: raw.version,
            pad: raw.pad,
        };

        if footer.version != META_VERSION {
            warn!(
                "Unexpected meta version {}, expected {META_VERSION}",
                footer.version,
            );
        }

        if usize::from(footer.size) < META_FOOTER_SIZE {
            return Err(Error::RegionSizeTooSmall(footer.size));
        } else if usize::from(footer.size) > data.len() {
            return Err(Error::RegionSizeTooLarge {
                size: footer.size,
                available: data.len(),
            });
        }

        let start = data.len() - usize::from(footer.size);
        let tlv_data = &data[start..footer_off];
        let mut tlvs = vec![];
        let mut offset = 0;

        while offset < tlv_data.len() {
            let index = tlvs.len();
            let (header, remain) = RawMetaTlvHeader::read_from_prefix(&tlv_data[offset..])
                .map_err(|_| Error::TlvHeaderTruncated { index, offset })?;

            if usize::from(header.size) > remain.len() {
                return Err(Error::TlvDataTruncated {
                    index,
                    len: header.size,
                    available: remain.len(),
                });
            }

            trace!(
                "Meta TLV #{index} at {offset}: type={:#04x}, size={}",
                header.tlv_type, header.size,
            );

            tlvs.push(MetaTlv::new(
                header.tlv_type,
                remain[..usize::from(header.size)].to_vec(),
            ));

            offset += META_TLV_HEADER_SIZE + usize::from(header.size);
        }

        Ok((Self { tlvs, footer }, start))
    }

    /// Write the region and return the offset of each component. The footer's
    /// size field is computed from the TLVs being written, not taken from
    /// [`Self::footer`].
    pub fn write(&self, writer: impl Write) -> Result<MetaOffsets> {
        let region_size = self.size();
        let region_size =
            u16::try_from(region_size).map_err(|_| Error::RegionTooLarge(region_size))?;

        let mut writer = CountingWriter::new(writer);
        let mut offset = 0;
        let mut tlv_offsets = Vec::with_capacity(self.tlvs.len());

        for (index, tlv) in self.tlvs.iter().enumerate() {
            let size = u8::try_from(tlv.data.len()).map_err(|_| Error::TlvDataTooLarge {
                index,
                len: tlv.data.len(),
            })?;

            let header = RawMetaTlvHeader {
                tlv_type: tlv.tlv_type,
                size,
            };

            header
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("tlv_header", e))?;
            writer
                .write_all(&tlv.data)
                .map_err(|e| Error::DataWrite("tlv_data", e))?;

            tlv_offsets.push(offset);
            offset += tlv.size();
        }

        let footer = RawMetaFooter {
            size: region_size.into(),
            version: self.footer.version,
            pad: self.footer.pad,
            magic: META_MAGIC.into(),
        };

        footer
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("footer", e))?;

        let (_, total_size) = writer.finish();

        Ok(MetaOffsets {
            tlvs: tlv_offsets,
            footer: offset,
            total_size: total_size as usize,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size());
        self.write(&mut buf)?;
        Ok(buf)
    }

    /// Actual size of the serialized region. This may differ from the
    /// footer's size field if the TLVs were modified after construction, but
    /// [`Self::write`] always writes this value.
    pub fn size(&self) -> usize {
        self.tlvs.iter().map(MetaTlv::size).sum::<usize>() + META_FOOTER_SIZE
    }

    pub fn offsets(&self) -> MetaOffsets {
        let mut tlvs = Vec::with_capacity(self.tlvs.len());
        let mut offset = 0;

        for tlv in &self.tlvs {
            tlvs.push(offset);
            offset += tlv.size();
        }

        MetaOffsets {
            tlvs,
            footer: offset,
            total_size: offset + META_FOOTER_SIZE,
        }
    }

    pub fn find_tlvs(&self, tlv_type: u8) -> impl Iterator<Item = &MetaTlv> {
        self.tlvs.iter().filter(move |t| t.tlv_type == tlv_type)
    }

    pub fn hash_tlv_index(&self) -> Result<usize> {
        let indices = self
            .tlvs
            .iter()
            .enumerate()
            .filter(|(_, t)| t.tlv_type == META_TLV_TYPE_HASH)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();

        let [index] = indices.as_slice() else {
            return Err(Error::TlvNotUnique {
                name: meta_tlv_type_name(META_TLV_TYPE_HASH),
                count: indices.len(),
            });
        };

        let len = self.tlvs[*index].data.len();
        if len != META_HASH_SIZE {
            return Err(Error::TlvInvalidSize {
                name: meta_tlv_type_name(META_TLV_TYPE_HASH),
                len,
            });
        }

        Ok(*index)
    }

    pub fn hash(&self) -> Result<&[u8]> {
        let index = self.hash_tlv_index()?;
        Ok(&self.tlvs[index].data)
    }

    pub fn flash_areas(&self) -> Result<Vec<MetaFlashArea>> {
        self.find_tlvs(META_TLV_TYPE_FLASH_AREA)
            .map(|t| MetaFlashArea::from_data(&t.data))
            .collect()
    }

    pub fn mmr_refs(&self) -> Result<Vec<MetaMmrRef>> {
        self.find_tlvs(META_TLV_TYPE_MMR_REF)
            .map(|t| MetaMmrRef::from_data(&t.data))
            .collect()
    }

    /// Return a copy with the hash TLV's digest set to all zeros.
    pub fn clear_hash(&self) -> Result<Self> {
        let index = self.hash_tlv_index()?;
        let mut meta = self.clone();
        meta.tlvs[index].data.fill(0);

        Ok(meta)
    }
}

/// Recompute the region's hash. The hash covers the entire carrier binary
/// with the region spliced in at `meta_off` and the digest zeroed. If the
/// region extends past the end of the carrier, the carrier is padded with
/// `erase_val`. Returns the updated region and the new carrier bytes.
///
/// The result does not depend on the digest currently stored in `meta`, so
/// calling this again on the output produces the same digest.
pub fn recalc_hash(
    meta: &Meta,
    meta_off: usize,
    carrier: &[u8],
    erase_val: u8,
) -> Result<(Meta, Vec<u8>)> {
    let mut meta = meta.clear_hash()?;
    let index = meta.hash_tlv_index()?;

    let mut meta_bytes = vec![];
    let offsets = meta.write(&mut meta_bytes)?;
    let meta_end = meta_off + meta_bytes.len();

    let mut out = carrier.to_vec();
    if out.len() < meta_end {
        out.resize(meta_end, erase_val);
    }
    out[meta_off..meta_end].copy_from_slice(&meta_bytes);

    let digest: [u8; META_HASH_SIZE] = Sha256::digest(&out).into();

    let hash_off = meta_off + offsets.tlvs[index] + META_TLV_HEADER_SIZE;
    out[hash_off..hash_off + META_HASH_SIZE].copy_from_slice(&digest);
    meta.tlvs[index].data.copy_from_slice(&digest);

    Ok((meta, out))
}
