// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use assert_matches::assert_matches;
use rand::{SeedableRng, rngs::StdRng};
use sha2::{Digest, Sha256};

use fwimage::{
    create::{self, ImageCreator, LegacyCreator},
    crypto::{self, PassphraseSource, PublicKey, RsaPadding, SignKey},
    format::{
        image::{
            self, Image, ImageFlags, ImageVersion, TLV_TYPE_ECDSA224, TLV_TYPE_ECDSA256,
            TLV_TYPE_ED25519, TLV_TYPE_ENC_KEK, TLV_TYPE_ENC_RSA, TLV_TYPE_KEYHASH,
            TLV_TYPE_RSA2048, TLV_TYPE_RSA3072, TLV_TYPE_SHA256, Tlv,
        },
        legacy::{self, LegacyFlags, LegacyImage, TLV_V1_TYPE_ECDSA256, TLV_V1_TYPE_RSA2048},
    },
    secret::{self, DecryptKey},
    verify::{self, Violation},
};

macro_rules! test_data {
    ($name:literal) => {
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/", $name))
    };
}

fn no_passphrase() -> PassphraseSource {
    PassphraseSource::new(Path::new("unused"), None, None)
}

fn sign_key(data: &[u8]) -> SignKey {
    crypto::parse_sign_key(data, &no_passphrase()).unwrap()
}

fn public_key(data: &[u8]) -> PublicKey {
    crypto::parse_public_key(data).unwrap()
}

fn sequential_body() -> Vec<u8> {
    (0..=255).collect()
}

fn version() -> ImageVersion {
    ImageVersion::new(1, 5, 0, 0)
}

#[test]
fn unsigned_image_known_hash() {
    let mut rng = StdRng::seed_from_u64(0);
    let image = ImageCreator::new(sequential_body(), version())
        .create(&mut rng)
        .unwrap();

    assert_eq!(image.tlvs.len(), 1);
    assert_eq!(image.tlvs[0].tlv_type, TLV_TYPE_SHA256);
    assert_eq!(
        hex::encode(image.hash().unwrap()),
        "8a66b6418781e550be623c495d8a6cc35b966da60b8e539c4f826e73b66ee00f",
    );

    let data = image.to_bytes().unwrap();
    assert_eq!(data.len(), 328);
    assert_eq!(data.len(), image.total_size());
    assert_eq!(
        hex::encode(Sha256::digest(&data)),
        "6d3ea094201221d10c4ff2d9cc4437841d1efa2201fcc99af7962751b2ac82ae",
    );

    assert_eq!(Image::parse(&data).unwrap(), image);
}

#[test]
fn chained_image_with_header_padding() {
    let mut rng = StdRng::seed_from_u64(0);
    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.header_size = 64;
    creator.initial_hash = Some(vec![0xaa; 32]);

    let image = creator.create(&mut rng).unwrap();

    assert_eq!(image.header.flags, ImageFlags::NON_BOOTABLE);
    assert_eq!(image.pad, vec![0u8; 32]);
    assert_eq!(
        hex::encode(image.hash().unwrap()),
        "91323ff4b7ee6ea3dab833d057a771b74a8c1489a9a5f8a5f585bae4de66f342",
    );

    let offsets = image.offsets();
    assert_eq!(offsets.body, 64);
    assert_eq!(offsets.trailer, 64 + 256);
    assert_eq!(offsets.tlvs, vec![64 + 256 + 4]);

    verify::verify_hash(&image, Some(&[0xaa; 32]), None).unwrap();
    assert_matches!(
        verify::verify_hash(&image, None, None),
        Err(verify::Error::HashMismatch { .. })
    );

    let data = image.to_bytes().unwrap();
    assert_eq!(Image::parse(&data).unwrap(), image);
}

#[test]
fn signed_with_every_key_type() {
    let mut rng = StdRng::seed_from_u64(1);
    let keys = [
        sign_key(test_data!("TEST_KEY_DO_NOT_USE_rsa2048.pem")),
        sign_key(test_data!("TEST_KEY_DO_NOT_USE_rsa3072.pem")),
        sign_key(test_data!("TEST_KEY_DO_NOT_USE_p224.pem")),
        sign_key(test_data!("TEST_KEY_DO_NOT_USE_p256.pem")),
        sign_key(test_data!("TEST_KEY_DO_NOT_USE_ed25519.pem")),
    ];

    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.sign_keys = keys.to_vec();

    let image = creator.create(&mut rng).unwrap();

    let types = image.tlvs.iter().map(|t| t.tlv_type).collect::<Vec<_>>();
    assert_eq!(
        types,
        [
            TLV_TYPE_SHA256,
            TLV_TYPE_KEYHASH,
            TLV_TYPE_RSA2048,
            TLV_TYPE_KEYHASH,
            TLV_TYPE_RSA3072,
            TLV_TYPE_KEYHASH,
            TLV_TYPE_ECDSA224,
            TLV_TYPE_KEYHASH,
            TLV_TYPE_ECDSA256,
            TLV_TYPE_KEYHASH,
            TLV_TYPE_ED25519,
        ],
    );

    let sig_lens = image.tlvs[2..]
        .iter()
        .step_by(2)
        .map(|t| t.data.len())
        .collect::<Vec<_>>();
    assert_eq!(sig_lens, [256, 384, 68, 72, 64]);

    let key_hashes = image
        .find_tlvs(TLV_TYPE_KEYHASH)
        .map(|t| hex::encode(&t.data))
        .collect::<Vec<_>>();
    assert_eq!(
        key_hashes,
        ["490ae498", "bae2f7d1", "da6eaf10", "92df4b82", "234eeb44"],
    );

    assert_eq!(verify::verify_structure(&image), vec![]);

    let public_keys = [
        public_key(test_data!("TEST_KEY_DO_NOT_USE_ed25519.pub.pem")),
        public_key(test_data!("TEST_KEY_DO_NOT_USE_p224.pub.pem")),
        public_key(test_data!("TEST_KEY_DO_NOT_USE_p256.pub.pem")),
        public_key(test_data!("TEST_KEY_DO_NOT_USE_rsa2048.pub.pem")),
        public_key(test_data!("TEST_KEY_DO_NOT_USE_rsa3072.pub.pem")),
    ];
    assert_eq!(
        verify::verify_signatures(&image, &public_keys).unwrap(),
        vec![0, 1, 2, 3, 4],
    );

    // Keys that did not sign the image are not reported.
    let enc_key = public_key(test_data!("TEST_KEY_DO_NOT_USE_enc_rsa.pub.pem"));
    assert_eq!(
        verify::verify_signatures(&image, &[enc_key]).unwrap(),
        Vec::<usize>::new(),
    );

    let parsed = Image::parse(&image.to_bytes().unwrap()).unwrap();
    assert_eq!(parsed, image);
}

#[test]
fn tampered_signature() {
    let mut rng = StdRng::seed_from_u64(2);
    let key = sign_key(test_data!("TEST_KEY_DO_NOT_USE_p256.pem"));

    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.sign_keys = vec![key.clone()];

    let mut image = creator.create(&mut rng).unwrap();
    image.tlvs[0].data[0] ^= 0xff;

    assert_matches!(
        verify::verify_signatures(&image, &[key.public_key()]),
        Err(verify::Error::Signature {
            index: 2,
            key_index: 0,
            ..
        })
    );
}

#[test]
fn one_rsa_key_adds_two_tlvs() {
    let mut rng = StdRng::seed_from_u64(3);
    let key = sign_key(test_data!("TEST_KEY_DO_NOT_USE_rsa2048.pem"));

    let image = create::build_image(&sequential_body(), version(), &[key], None, None, &mut rng)
        .unwrap();

    assert_eq!(image.tlvs.len(), 3);
    assert_eq!(image.tlvs[1].data.len(), 4);
    assert_eq!(image.tlvs[2].data.len(), 256);
}

#[test]
fn encrypted_with_kek() {
    let mut rng = StdRng::seed_from_u64(4);
    let kek = test_data!("TEST_KEY_DO_NOT_USE_kek.b64");
    let key = sign_key(test_data!("TEST_KEY_DO_NOT_USE_ed25519.pem"));

    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.sign_keys = vec![key.clone()];
    creator.enc_key = Some(kek.to_vec());

    let image = creator.create(&mut rng).unwrap();

    assert!(image.header.flags.contains(ImageFlags::ENCRYPTED));
    assert_ne!(image.body, sequential_body());
    assert_eq!(image.tlvs.len(), 4);
    assert_eq!(image.tlvs[3].tlv_type, TLV_TYPE_ENC_KEK);
    assert_eq!(image.tlvs[3].data.len(), secret::ENC_KEK_SIZE);

    // Every build uses a fresh secret since the IV is always zero.
    let other = creator.create(&mut rng).unwrap();
    assert_ne!(other.body, image.body);
    assert_ne!(other.tlvs[3], image.tlvs[3]);

    let decrypt_key = DecryptKey::from_kek_base64(kek).unwrap();

    // The hash covers the plaintext.
    verify::verify_hash(&image, None, Some(&decrypt_key)).unwrap();
    assert_matches!(
        verify::verify_hash(&image, None, None),
        Err(verify::Error::EncryptedNoKey)
    );
    assert_eq!(
        verify::verify_signatures(&image, &[key.public_key()]).unwrap(),
        vec![0],
    );

    let decrypted = secret::decrypt_image(&image, &decrypt_key).unwrap();
    assert_eq!(decrypted.body, sequential_body());
    assert!(!decrypted.header.flags.contains(ImageFlags::ENCRYPTED));
    assert_eq!(decrypted.tlvs, image.tlvs[..3]);

    let wrong_key = DecryptKey::Kek([0u8; 16]);
    assert_matches!(
        secret::decrypt_image(&image, &wrong_key),
        Err(secret::Error::KeyUnwrap(_))
    );
}

#[test]
fn encrypted_with_rsa() {
    let mut rng = StdRng::seed_from_u64(5);

    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.enc_key = Some(test_data!("TEST_KEY_DO_NOT_USE_enc_rsa.pub.pem").to_vec());

    let image = creator.create(&mut rng).unwrap();
    assert_eq!(image.tlvs.len(), 2);
    assert_eq!(image.tlvs[1].tlv_type, TLV_TYPE_ENC_RSA);
    assert_eq!(image.tlvs[1].data.len(), secret::ENC_RSA_SIZE);

    let SignKey::Rsa(private_key) = sign_key(test_data!("TEST_KEY_DO_NOT_USE_enc_rsa.pem")) else {
        panic!("Expected RSA key");
    };
    let decrypt_key = DecryptKey::Rsa(private_key);

    verify::verify_hash(&image, None, Some(&decrypt_key)).unwrap();

    let decrypted = secret::decrypt_image(&image, &decrypt_key).unwrap();
    assert_eq!(decrypted.body, sequential_body());

    // RSA-wrapped secrets cannot be unwrapped with a KEK.
    assert_matches!(
        secret::decrypt_image(&image, &DecryptKey::Kek([0u8; 16])),
        Err(secret::Error::KeyMismatch(TLV_TYPE_ENC_RSA))
    );
}

#[test]
fn invalid_encryption_keys() {
    let mut rng = StdRng::seed_from_u64(6);
    let mut creator = ImageCreator::new(sequential_body(), version());

    creator.enc_key = Some(b"not base64!".to_vec());
    assert_matches!(
        creator.create(&mut rng),
        Err(create::Error::Secret(secret::Error::InvalidEncryptionKey))
    );

    creator.enc_key = Some(b"AAECAwQFBgcICQoLDA0ODxAREhM=".to_vec());
    assert_matches!(
        creator.create(&mut rng),
        Err(create::Error::Secret(secret::Error::InvalidKekSize(20)))
    );

    // Only RSA-2048 can wrap secrets.
    creator.enc_key = Some(test_data!("TEST_KEY_DO_NOT_USE_rsa3072.pub.pem").to_vec());
    assert_matches!(
        creator.create(&mut rng),
        Err(create::Error::Secret(secret::Error::UnsupportedRsaKeySize(3072)))
    );
}

#[test]
fn duplicate_signer() {
    let mut rng = StdRng::seed_from_u64(7);
    let key = sign_key(test_data!("TEST_KEY_DO_NOT_USE_p224.pem"));

    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.sign_keys = vec![key.clone(), key];

    assert_matches!(
        creator.create(&mut rng),
        Err(create::Error::Verify(verify::Error::Structure(v)))
            if v == [Violation::DuplicateKeyHashes(vec!["da6eaf10".into()])]
    );
}

#[test]
fn signature_without_key_hash() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut image = ImageCreator::new(sequential_body(), version())
        .create(&mut rng)
        .unwrap();
    image.add_tlv(Tlv::new(TLV_TYPE_RSA2048, vec![0; 256]));

    assert_eq!(
        verify::verify_structure(&image),
        vec![Violation::SignatureWithoutKeyHash {
            index: 1,
            tlv_type: TLV_TYPE_RSA2048,
        }],
    );
}

#[test]
fn remove_tlvs() {
    let mut rng = StdRng::seed_from_u64(9);
    let key = sign_key(test_data!("TEST_KEY_DO_NOT_USE_p256.pem"));

    let mut creator = ImageCreator::new(sequential_body(), version());
    creator.sign_keys = vec![key];

    let image = creator.create(&mut rng).unwrap();
    let (stripped, removed) = image.without_tlvs(|t| t.tlv_type != TLV_TYPE_SHA256);

    assert_eq!(image.tlvs.len(), 3);
    assert_eq!(stripped.tlvs.len(), 1);
    assert_eq!(removed.len(), 2);
    assert_eq!(stripped.tlv_total_len(), 4 + 36);
}

#[test]
fn parse_errors() {
    let mut rng = StdRng::seed_from_u64(10);
    let data = ImageCreator::new(sequential_body(), version())
        .create(&mut rng)
        .unwrap()
        .to_bytes()
        .unwrap();

    let mut bad = data.clone();
    bad[0] ^= 1;
    assert_matches!(Image::parse(&bad), Err(image::Error::InvalidMagic(_)));

    // Declared header size beyond the end of the data.
    let mut bad = data.clone();
    bad[8..10].copy_from_slice(&0x1000u16.to_le_bytes());
    assert_matches!(
        Image::parse(&bad),
        Err(image::Error::HeaderSizeTooLarge { .. })
    );

    // Declared body size beyond the end of the data.
    let mut bad = data.clone();
    bad[12..16].copy_from_slice(&0x1000u32.to_le_bytes());
    assert_matches!(
        Image::parse(&bad),
        Err(image::Error::BodySizeTooLarge { .. })
    );

    // Trailer length that disagrees with the TLVs.
    let mut bad = data.clone();
    bad[32 + 256 + 2..32 + 256 + 4].copy_from_slice(&36u16.to_le_bytes());
    assert_matches!(
        Image::parse(&bad),
        Err(image::Error::TlvTotalLenMismatch {
            expected: 36,
            actual: 40,
        })
    );

    assert_matches!(
        Image::parse(&data[..data.len() - 1]),
        Err(image::Error::TlvDataTruncated { .. })
    );
}

#[test]
fn legacy_known_hash() {
    let mut rng = StdRng::seed_from_u64(11);
    let image = LegacyCreator::new(sequential_body(), version())
        .create(&mut rng)
        .unwrap();

    assert_eq!(
        hex::encode(image.hash().unwrap()),
        "20c006df4204db3d186b8554ab78a8c9ce15dcaed98657f311f50f04fa4b7c2d",
    );

    let data = image.to_bytes().unwrap();
    assert_eq!(data.len(), 324);
    assert_eq!(
        hex::encode(Sha256::digest(&data)),
        "ed7596ada4291fa1d998737d92321c5882c26121b9fa67548f41abb4c7431b8c",
    );

    assert_eq!(LegacyImage::parse(&data).unwrap(), image);
    verify::verify_legacy(&image, None, None).unwrap();
}

#[test]
fn legacy_signed() {
    let mut rng = StdRng::seed_from_u64(12);
    let rsa = sign_key(test_data!("TEST_KEY_DO_NOT_USE_rsa2048.pem"));
    let p256 = sign_key(test_data!("TEST_KEY_DO_NOT_USE_p256.pem"));

    for (padding, flag) in [
        (RsaPadding::Pkcs1v15, LegacyFlags::PKCS15_RSA2048_SHA256),
        (RsaPadding::Pss, LegacyFlags::PKCS1_PSS_RSA2048_SHA256),
    ] {
        let mut creator = LegacyCreator::new(sequential_body(), version());
        creator.sign_keys = vec![rsa.clone()];
        creator.key_id = 3;
        creator.rsa_padding = padding;

        let image = creator.create(&mut rng).unwrap();
        assert_eq!(image.header.flags, LegacyFlags::SHA256 | flag);
        assert_eq!(image.header.key_id, 3);
        assert_eq!(image.tlvs[1].tlv_type, TLV_V1_TYPE_RSA2048);

        let parsed = LegacyImage::parse(&image.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, image);

        verify::verify_legacy(&parsed, None, Some(&rsa.public_key())).unwrap();
    }

    let mut creator = LegacyCreator::new(sequential_body(), version());
    creator.sign_keys = vec![p256.clone()];
    creator.initial_hash = Some(vec![0x55; 32]);

    let image = creator.create(&mut rng).unwrap();
    assert_eq!(
        image.header.flags,
        LegacyFlags::SHA256 | LegacyFlags::ECDSA256_SHA256 | LegacyFlags::NON_BOOTABLE,
    );
    assert_eq!(image.tlvs[1].tlv_type, TLV_V1_TYPE_ECDSA256);
    assert_eq!(usize::from(image.header.tlv_size), image.tlv_size());

    verify::verify_legacy(&image, Some(&[0x55; 32]), Some(&p256.public_key())).unwrap();
    assert_matches!(
        verify::verify_legacy(&image, Some(&[0x55; 32]), Some(&rsa.public_key())),
        Err(verify::Error::MissingLegacySignature(TLV_V1_TYPE_RSA2048))
    );
}

#[test]
fn legacy_rejects() {
    let mut rng = StdRng::seed_from_u64(13);
    let ed25519 = sign_key(test_data!("TEST_KEY_DO_NOT_USE_ed25519.pem"));
    let p224 = sign_key(test_data!("TEST_KEY_DO_NOT_USE_p224.pem"));

    let mut creator = LegacyCreator::new(sequential_body(), version());
    creator.sign_keys = vec![ed25519];
    assert_matches!(
        creator.create(&mut rng),
        Err(create::Error::Crypto(crypto::Error::UnsupportedLegacyKey(_)))
    );

    creator.sign_keys = vec![p224.clone(), p224];
    assert_matches!(
        creator.create(&mut rng),
        Err(create::Error::TooManyLegacyKeys(2))
    );

    let data = LegacyCreator::new(sequential_body(), version())
        .create(&mut rng)
        .unwrap()
        .to_bytes()
        .unwrap();
    assert_matches!(
        LegacyImage::parse(&data[..data.len() - 4]),
        Err(legacy::Error::TlvSizeMismatch {
            expected: 36,
            actual: 32,
        })
    );
}
