use mtlink_crypto::{CryptoError, CryptoProvider, DefaultCryptoProvider};

fn h(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap()
}

fn arr<const N: usize>(s: &str) -> [u8; N] {
    h(s).try_into().unwrap()
}

#[test]
fn sha1_and_sha256() {
    let c = DefaultCryptoProvider;
    assert_eq!(hex::encode(c.sha1(&[&b""[..]])), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    assert_eq!(hex::encode(c.sha1(&[&b"hel"[..], &b"lo"[..]])), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    assert_eq!(
        hex::encode(c.sha256(&[h("aebb1f").as_slice()])),
        "2d29658aba48f2b286fe8bbddb931b7ad297e5adb5b9a6fc3aab67ef7fbf4e80"
    );
    assert_eq!(
        hex::encode(c.sha256(&[&b"hello"[..]])),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
}

#[test]
fn hmac_sha256() {
    let c = DefaultCryptoProvider;
    let key = h("aaeeff");
    assert_eq!(
        hex::encode(c.hmac_sha256(&key, b"").unwrap()),
        "642711307c9e4437df09d6ebaa6bdc1b3a810c7f15c50fd1d0f8d7d5490f44dd"
    );
    assert_eq!(
        hex::encode(c.hmac_sha256(&key, b"hello").unwrap()),
        "39b00bab151f9868e6501655c580b5542954711181243474d46b894703b1c1c2"
    );
    assert_eq!(
        hex::encode(c.hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap()),
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
    );
}

#[test]
fn pbkdf2_sha512() {
    let c = DefaultCryptoProvider;
    assert_eq!(
        hex::encode(c.pbkdf2_sha512(b"pbkdf2 test", b"some salt", 10)),
        "e43276cfa27f135f261cec8ddcf593fd74ec251038e459c165461f2308f3a7235e0744ee1aed9710b00db28d1a2112e20fea3601c60e770ac57ffe6b33ca8be1"
    );
}

#[test]
fn aes_ctr_is_a_continuous_stream() {
    let c = DefaultCryptoProvider;
    let key = arr::<32>("d450aae0bf0060a4af1044886b42a13f7c506b35255d134a7e87ab3f23a9493b");
    let iv = arr::<16>("0182de2bd789c295c3c6c875c5e9e190");
    let plain = h("7baae571e4c2f4cfadb1931d5923aca7");
    let expected = [
        "df5647dbb70bc393f2fb05b72f42286f",
        "3917147082672516b3177150129bc579",
        "2a7a9089270a5de45d5e3dd399cac725",
        "56d085217771398ac13583de4d677dd8",
        "cc639b488126cf36e79c4515e8012b92",
        "01384d100646cd562cc5586ec3f8f8c4",
    ];

    let mut enc = c.create_aes_ctr(&key, &iv);
    for want in expected {
        let mut block = plain.clone();
        enc.apply(&mut block);
        assert_eq!(hex::encode(&block), want);
    }

    let mut dec = c.create_aes_ctr(&key, &iv);
    for cipher in expected {
        let mut block = h(cipher);
        dec.apply(&mut block);
        assert_eq!(block, plain);
    }
}

#[test]
fn aes_ige_known_vector() {
    let c = DefaultCryptoProvider;
    let key = arr::<32>("5468697320697320616E20696D706C655468697320697320616E20696D706C65");
    let iv = arr::<32>("6D656E746174696F6E206F6620494745206D6F646520666F72204F70656E5353");
    let plain = h("99706487a1cde613bc6de0b6f24b1c7aa448c8b9c3403e3467a8cad89340f53b");
    let cipher = "792ea8ae577b1a66cb3bd92679b8030ca54ee631976bd3a04547fdcb4639fa69";

    let mut data = plain.clone();
    c.aes_ige_encrypt(&mut data, &key, &iv).unwrap();
    assert_eq!(hex::encode(&data), cipher);
    c.aes_ige_decrypt(&mut data, &key, &iv).unwrap();
    assert_eq!(data, plain);
}

#[test]
fn aes_ige_block_primitive_path_matches() {
    // The trait's default IGE goes through the single-block methods.
    struct BlockOnly;
    impl CryptoProvider for BlockOnly {
        fn sha1(&self, p: &[&[u8]]) -> [u8; 20] { DefaultCryptoProvider.sha1(p) }
        fn sha256(&self, p: &[&[u8]]) -> [u8; 32] { DefaultCryptoProvider.sha256(p) }
        fn hmac_sha256(&self, k: &[u8], d: &[u8]) -> Result<[u8; 32], CryptoError> {
            DefaultCryptoProvider.hmac_sha256(k, d)
        }
        fn pbkdf2_sha512(&self, p: &[u8], s: &[u8], r: u32) -> [u8; 64] {
            DefaultCryptoProvider.pbkdf2_sha512(p, s, r)
        }
        fn aes_encrypt_block(&self, k: &[u8; 32], b: &mut [u8; 16]) {
            DefaultCryptoProvider.aes_encrypt_block(k, b)
        }
        fn aes_decrypt_block(&self, k: &[u8; 32], b: &mut [u8; 16]) {
            DefaultCryptoProvider.aes_decrypt_block(k, b)
        }
        fn create_aes_ctr(&self, k: &[u8; 32], iv: &[u8; 16]) -> Box<dyn mtlink_crypto::AesCtr> {
            DefaultCryptoProvider.create_aes_ctr(k, iv)
        }
        fn random_bytes(&self, buf: &mut [u8]) { DefaultCryptoProvider.random_bytes(buf) }
    }

    let key = [3u8; 32];
    let iv = [9u8; 32];
    let mut a = (0u8..64).collect::<Vec<_>>();
    let mut b = a.clone();
    DefaultCryptoProvider.aes_ige_encrypt(&mut a, &key, &iv).unwrap();
    BlockOnly.aes_ige_encrypt(&mut b, &key, &iv).unwrap();
    assert_eq!(a, b);
    BlockOnly.aes_ige_decrypt(&mut b, &key, &iv).unwrap();
    assert_eq!(b, (0u8..64).collect::<Vec<_>>());
}

#[test]
fn aes_ige_round_trip_for_all_aligned_lengths() {
    let c = DefaultCryptoProvider;
    let mut key = [0u8; 32];
    let mut iv = [0u8; 32];
    c.random_bytes(&mut key);
    c.random_bytes(&mut iv);
    for blocks in 0..=8 {
        let mut plain = vec![0u8; blocks * 16];
        c.random_bytes(&mut plain);
        let mut data = plain.clone();
        c.aes_ige_encrypt(&mut data, &key, &iv).unwrap();
        c.aes_ige_decrypt(&mut data, &key, &iv).unwrap();
        assert_eq!(data, plain, "{blocks} blocks");
    }
}

#[test]
fn aes_ige_rejects_partial_blocks() {
    let c = DefaultCryptoProvider;
    let mut data = vec![0u8; 33];
    assert_eq!(
        c.aes_ige_encrypt(&mut data, &[0; 32], &[0; 32]),
        Err(CryptoError::InvalidBlockLength(33))
    );
}
