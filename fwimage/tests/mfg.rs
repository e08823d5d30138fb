// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use sha2::{Digest, Sha256};

use fwimage::{
    flash::{self, FlashArea},
    format::meta::{Meta, MetaFlashArea, MetaMmrRef, MetaTlv},
    mfg::{self, Mfg},
};

fn area(name: &str, id: u8, device: u8, offset: u32, size: u32) -> FlashArea {
    FlashArea {
        name: name.to_owned(),
        id,
        device,
        offset,
        size,
    }
}

fn layout() -> Vec<FlashArea> {
    vec![
        area("app", 1, 0, 0x200, 0x100),
        area("boot", 0, 0, 0x0, 0x100),
        area("ext", 0, 1, 0x0, 0x1000),
    ]
}

fn blobs(items: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
    items
        .iter()
        .map(|(n, d)| ((*n).to_owned(), d.to_vec()))
        .collect()
}

#[test]
fn join_and_split() {
    let input = blobs(&[("boot", &[1; 16]), ("app", &[2; 8])]);

    let bin = mfg::join(&input, 0xff, &layout()).unwrap();
    assert_eq!(bin.len(), 0x208);
    assert_eq!(&bin[..16], &[1; 16]);
    assert!(bin[16..0x200].iter().all(|b| *b == 0xff));
    assert_eq!(&bin[0x200..], &[2; 8]);

    // Only areas on the requested device are extracted.
    let output = mfg::split(&bin, 0, &layout(), 0xff).unwrap();
    assert_eq!(output, input);

    // The area is clipped to the binary and the trailing erased bytes are
    // already gone.
    let output = mfg::split(&bin, 1, &layout(), 0xff).unwrap();
    assert_eq!(output, blobs(&[("ext", &bin)]));
}

#[test]
fn split_clips_to_binary() {
    let output = mfg::split(&[0xaa; 0x180], 0, &layout(), 0xff).unwrap();
    assert_eq!(output["boot"], vec![0xaa; 0x100]);
    assert_eq!(output["app"], Vec::<u8>::new());

    // Stripping only removes the erase value.
    let mut bin = vec![3; 8];
    bin.extend_from_slice(&[0x00; 8]);
    let output = mfg::split(&bin, 0, &layout(), 0x00).unwrap();
    assert_eq!(output["boot"], vec![3; 8]);
}

#[test]
fn join_errors() {
    assert_matches!(
        mfg::join(&blobs(&[("boot", &[0; 0x101])]), 0xff, &layout()),
        Err(mfg::Error::BlobTooLarge { size: 0x100, len: 0x101, .. })
    );

    assert_matches!(
        mfg::join(&blobs(&[("boot", &[0; 1]), ("nvram", &[0; 1])]), 0xff, &layout()),
        Err(mfg::Error::UnconsumedBlobs(n)) if n == ["nvram"]
    );

    let mut overlapping = layout();
    overlapping.push(area("scratch", 2, 0, 0x80, 0x100));
    assert_matches!(
        mfg::join(&blobs(&[("boot", &[0; 1])]), 0xff, &overlapping),
        Err(mfg::Error::Flash(flash::Error::Layout(e))) if e.len() == 1
    );
    assert_matches!(
        mfg::split(&[], 0, &overlapping, 0xff),
        Err(mfg::Error::Flash(_))
    );
}

#[test]
fn empty_blobs_are_skipped() {
    let bin = mfg::join(&blobs(&[("boot", &[7; 4]), ("app", &[])]), 0xff, &layout()).unwrap();
    assert_eq!(bin, vec![7; 4]);
}

fn mfg_with_meta() -> Vec<u8> {
    let meta = Meta::new(vec![
        MetaTlv::hash_placeholder(),
        MetaFlashArea {
            area: 1,
            device: 0,
            offset: 0,
            size: 0x40,
        }
        .to_tlv(),
        MetaMmrRef { area: 2 }.to_tlv(),
    ])
    .unwrap();

    let mut data = (0u8..64).collect::<Vec<_>>();
    data.extend_from_slice(&meta.to_bytes().unwrap());
    data
}

#[test]
fn parse_and_rehash() {
    let data = mfg_with_meta();

    let mut image = Mfg::parse(&data, Some(data.len())).unwrap();
    assert_eq!(image.meta_off, 64);
    assert_eq!(image.hash().unwrap(), [0; 32]);
    assert_eq!(image.to_bytes(0xff).unwrap(), data);

    image.recalc_hash(0xff).unwrap();
    assert_eq!(
        hex::encode(image.hash().unwrap()),
        "6c992b3667681cdfbe7a207b430c6ebf3c4468dfb4c9de3e2348b3fc83bcb447",
    );
    assert_eq!(image.to_bytes(0xff).unwrap(), image.bin);

    // Trailing data after the region is not part of it.
    let mut padded = data.clone();
    padded.extend_from_slice(&[0xff; 16]);
    let image = Mfg::parse(&padded, Some(data.len())).unwrap();
    assert_eq!(image.meta_off, 64);
    assert_eq!(image.bin, padded);

    assert_matches!(
        Mfg::parse(&data, Some(data.len() + 1)),
        Err(mfg::Error::MetaEndOutOfBounds { end: 122, len: 121 })
    );
    assert_matches!(
        Mfg::parse(&data, Some(data.len() - 1)),
        Err(mfg::Error::Meta(_))
    );
}

#[test]
fn hash_without_meta() {
    let data = (0u8..64).collect::<Vec<_>>();
    let mut image = Mfg::parse(&data, None).unwrap();

    assert_eq!(image.meta, None);
    assert_eq!(image.hash().unwrap(), <[u8; 32]>::from(Sha256::digest(&data)));
    assert_eq!(image.to_bytes(0xff).unwrap(), data);
    assert_matches!(image.recalc_hash(0xff), Err(mfg::Error::NoMeta));
}

#[test]
fn replace_keys_then_rehash() {
    let old_isk = [0x11; 32];
    let new_isk = [0x22; 32];
    let old_kek = [0x33; 16];
    let new_kek = [0x44; 16];

    let mut data = vec![0xff; 8];
    data.extend_from_slice(&old_isk);
    data.extend_from_slice(&16u32.to_le_bytes());
    data.extend_from_slice(&old_kek);
    let mut data_with_meta = data.clone();
    data_with_meta.extend_from_slice(&mfg_with_meta()[64..]);

    let mut image = Mfg::parse(&data_with_meta, Some(data_with_meta.len())).unwrap();
    let before = image.clone();

    mfg::replace_isk(&mut image.bin, &old_isk, &new_isk).unwrap();
    mfg::replace_kek(&mut image.bin, &old_kek, &new_kek).unwrap();
    assert_eq!(&image.bin[8..40], &new_isk);
    assert_eq!(&image.bin[44..60], &new_kek);

    image.recalc_hash(0xff).unwrap();
    assert_ne!(image.hash().unwrap(), before.hash().unwrap());

    // The old keys are gone, so replacing them again finds nothing.
    assert_matches!(
        mfg::replace_isk(&mut image.bin, &old_isk, &new_isk),
        Err(mfg::Error::PatternCount(0))
    );
    assert_matches!(
        mfg::replace_kek(&mut image.bin, &old_kek, &new_kek),
        Err(mfg::Error::PatternCount(0))
    );

    // Two copies of the key is ambiguous.
    let mut twice = old_isk.to_vec();
    twice.extend_from_slice(&old_isk);
    assert_matches!(
        mfg::replace_isk(&mut twice, &old_isk, &new_isk),
        Err(mfg::Error::PatternCount(2))
    );
}
