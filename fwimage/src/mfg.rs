// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Manufacturing (factory) images. These are raw flash images made up of
//! several flash areas, optionally with an embedded meta region describing
//! the layout.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    flash::{self, FlashArea},
    format::meta::{self, META_HASH_SIZE, Meta},
    util,
};

/// Size of the little-endian length field that precedes a KEK in flash.
pub const KEK_LEN_FIELD_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Pattern to search for is empty")]
    EmptyPattern,
    #[error("Expected exactly one occurrence of pattern, but found {0}")]
    PatternCount(usize),
    #[error("Replacement is {new} bytes, but original is {old} bytes")]
    ReplacementLength { old: usize, new: usize },
    #[error("New KEK ({new} bytes) is longer than the old KEK ({old} bytes)")]
    KekTooLong { old: usize, new: usize },
    #[error("KEK at offset {0:#x} has no preceding length field")]
    KekNoLengthField(usize),
    #[error("KEK length field is {actual}, but old KEK is {expected} bytes")]
    KekLengthMismatch { expected: usize, actual: u32 },
    #[error("Duplicate flash area name: {0:?}")]
    DuplicateAreaName(String),
    #[error("Area {name:?} starts at {offset:#x}, but output is already {len:#x} bytes")]
    AreaOutOfOrder { name: String, offset: u64, len: usize },
    #[error("Area {name:?} is {size:#x} bytes, but blob is {len:#x} bytes")]
    BlobTooLarge { name: String, size: u32, len: usize },
    #[error("Blobs do not match any flash area: {}", .0.join(", "))]
    UnconsumedBlobs(Vec<String>),
    #[error("Meta end offset {end:#x} exceeds binary size {len:#x}")]
    MetaEndOutOfBounds { end: usize, len: usize },
    #[error("Image has no meta region")]
    NoMeta,
    #[error("Flash layout error")]
    Flash(#[from] flash::Error),
    #[error("Meta region error")]
    Meta(#[from] meta::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A factory binary with an optional meta region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mfg {
    /// Full binary contents, including the meta region bytes.
    pub bin: Vec<u8>,
    pub meta: Option<Meta>,
    /// Offset of the meta region within [`Self::bin`].
    pub meta_off: usize,
}

impl Mfg {
    /// Parse a factory binary. If `meta_end_off` is specified, the meta region
    /// that ends at that offset is parsed.
    pub fn parse(data: &[u8], meta_end_off: Option<usize>) -> Result<Self> {
        let (meta, meta_off) = match meta_end_off {
            Some(end) => {
                if end > data.len() {
                    return Err(Error::MetaEndOutOfBounds {
                        end,
                        len: data.len(),
                    });
                }

                let (meta, off) = Meta::parse(&data[..end])?;
                debug!("Found meta region at {off:#x}..{end:#x}");

                (Some(meta), off)
            }
            None => (None, 0),
        };

        Ok(Self {
            bin: data.to_vec(),
            meta,
            meta_off,
        })
    }

    /// Serialize the binary with the current meta region spliced in. The
    /// binary is extended with `erase_val` if the region extends past the end.
    pub fn to_bytes(&self, erase_val: u8) -> Result<Vec<u8>> {
        let mut out = self.bin.clone();

        if let Some(meta) = &self.meta {
            let data = meta.to_bytes()?;
            let end = self.meta_off + data.len();

            if out.len() < end {
                out.resize(end, erase_val);
            }
            out[self.meta_off..end].copy_from_slice(&data);
        }

        Ok(out)
    }

    /// Recompute the meta region's hash and patch it into the binary.
    pub fn recalc_hash(&mut self, erase_val: u8) -> Result<()> {
        let meta = self.meta.as_ref().ok_or(Error::NoMeta)?;
        let (meta, bin) = meta::recalc_hash(meta, self.meta_off, &self.bin, erase_val)?;

        self.meta = Some(meta);
        self.bin = bin;

        Ok(())
    }

    /// Hash that identifies this image. This is the meta region's hash if
    /// there is one. Otherwise, it is the SHA-256 digest of the binary.
    pub fn hash(&self) -> Result<[u8; META_HASH_SIZE]> {
        match &self.meta {
            Some(meta) => {
                let mut hash = [0u8; META_HASH_SIZE];
                hash.copy_from_slice(meta.hash()?);
                Ok(hash)
            }
            None => Ok(Sha256::digest(&self.bin).into()),
        }
    }
}

/// Strip trailing `erase_val` bytes.
pub fn strip_padding(data: &[u8], erase_val: u8) -> &[u8] {
    util::trim_end_fill(data, erase_val)
}

/// Split a factory binary into one blob per flash area on `device`. Trailing
/// erased bytes are stripped from each blob.
pub fn split(
    bin: &[u8],
    device: u8,
    areas: &[FlashArea],
    erase_val: u8,
) -> Result<BTreeMap<String, Vec<u8>>> {
    flash::validate(areas)?;

    let mut result = BTreeMap::new();

    for area in areas.iter().filter(|a| a.device == device) {
        if result.contains_key(&area.name) {
            return Err(Error::DuplicateAreaName(area.name.clone()));
        }

        let (start, end) = util::clip_range(area.offset.into(), area.size.into(), bin.len());
        let data = strip_padding(&bin[start..end], erase_val);

        trace!(
            "Area {:?}: {start:#x}..{end:#x}, {:#x} bytes after stripping",
            area.name,
            data.len(),
        );

        result.insert(area.name.clone(), data.to_vec());
    }

    Ok(result)
}

/// Join per-area blobs into a factory binary. Areas are processed in offset
/// order and gaps are filled with `erase_val`. Every blob must be consumed by
/// an area. Blobs are not padded to their area's size, so the output ends
/// with the last blob's data.
///
/// Empty blobs are skipped without padding up to their area. If the blob for
/// the highest mapped area is empty, the output therefore ends at the
/// previous non-empty blob instead of at that area's offset.
pub fn join(
    blobs: &BTreeMap<String, Vec<u8>>,
    erase_val: u8,
    areas: &[FlashArea],
) -> Result<Vec<u8>> {
    flash::validate(areas)?;

    let mut out = vec![];
    let mut unconsumed = blobs.keys().collect::<Vec<_>>();
    let mut matched = vec![];

    for area in areas {
        if let Some(data) = blobs.get(&area.name) {
            unconsumed.retain(|n| *n != &area.name);
            matched.push((area, data));
        }
    }

    // Stable sort so that equal offsets keep their list order.
    matched.sort_by_key(|(a, _)| a.offset);

    for (area, data) in matched {
        if data.is_empty() {
            continue;
        }

        let offset = u64::from(area.offset);
        if offset < out.len() as u64 {
            return Err(Error::AreaOutOfOrder {
                name: area.name.clone(),
                offset,
                len: out.len(),
            });
        } else if data.len() as u64 > u64::from(area.size) {
            return Err(Error::BlobTooLarge {
                name: area.name.clone(),
                size: area.size,
                len: data.len(),
            });
        }

        out.resize(area.offset as usize, erase_val);
        out.extend_from_slice(data);
    }

    if !unconsumed.is_empty() {
        return Err(Error::UnconsumedBlobs(
            unconsumed.into_iter().cloned().collect(),
        ));
    }

    Ok(out)
}

/// Find the offset of the only occurrence of `needle` in `haystack`.
pub fn find_unique(haystack: &[u8], needle: &[u8]) -> Result<usize> {
    if needle.is_empty() {
        return Err(Error::EmptyPattern);
    }

    let mut iter = memchr::memmem::find_iter(haystack, needle);

    match (iter.next(), iter.next()) {
        (Some(offset), None) => Ok(offset),
        (None, _) => Err(Error::PatternCount(0)),
        (Some(_), Some(_)) => Err(Error::PatternCount(2 + iter.count())),
    }
}

/// Replace the image signing key embedded in a flash binary. The old key must
/// occur exactly once and the new key must have the same length.
pub fn replace_isk(bin: &mut [u8], old: &[u8], new: &[u8]) -> Result<()> {
    if old.len() != new.len() {
        return Err(Error::ReplacementLength {
            old: old.len(),
            new: new.len(),
        });
    }

    let offset = find_unique(bin, old)?;
    bin[offset..offset + new.len()].copy_from_slice(new);

    debug!("Replaced {}-byte image signing key at {offset:#x}", old.len());

    Ok(())
}

/// Replace the key-encryption key embedded in a flash binary. The new KEK
/// cannot be longer than the old one. A same-length KEK is swapped in place.
/// If it is shorter, the 4-byte little-endian length field preceding the old
/// KEK must match the old KEK's length. It is rewritten with the new length
/// and the rest of the old KEK's slot is zeroed.
pub fn replace_kek(bin: &mut [u8], old: &[u8], new: &[u8]) -> Result<()> {
    if new.len() > old.len() {
        return Err(Error::KekTooLong {
            old: old.len(),
            new: new.len(),
        });
    }

    let offset = find_unique(bin, old)?;

    if new.len() != old.len() {
        let len_off = offset
            .checked_sub(KEK_LEN_FIELD_SIZE)
            .ok_or(Error::KekNoLengthField(offset))?;

        let mut len_field = [0u8; KEK_LEN_FIELD_SIZE];
        len_field.copy_from_slice(&bin[len_off..offset]);
        let cur_len = u32::from_le_bytes(len_field);

        if cur_len as usize != old.len() {
            return Err(Error::KekLengthMismatch {
                expected: old.len(),
                actual: cur_len,
            });
        }

        bin[len_off..offset].copy_from_slice(&(new.len() as u32).to_le_bytes());
    }

    let slot = &mut bin[offset..offset + old.len()];
    slot[..new.len()].copy_from_slice(new);
    slot[new.len()..].fill(0);

    debug!("Replaced {}-byte key-encryption key at {offset:#x}", old.len());

    Ok(())
}
