//! AES-256 in Infinite Garble Extension mode.
//!
//! IGE is built on top of a single-block primitive, so any provider that can
//! encrypt one 16-byte block can reuse these loops.
//!
//! The 32-byte IV is split as `y₀ ‖ x₀`: the first half stands in for the
//! previous ciphertext block, the second for the previous plaintext block.

use crate::CryptoError;

/// One AES block.
pub type Block = [u8; 16];

fn check_len(data: &[u8]) -> Result<(), CryptoError> {
    if data.len() % 16 != 0 {
        return Err(CryptoError::InvalidBlockLength(data.len()));
    }
    Ok(())
}

fn split_iv(iv: &[u8; 32]) -> (Block, Block) {
    let mut first = [0u8; 16];
    let mut second = [0u8; 16];
    first.copy_from_slice(&iv[..16]);
    second.copy_from_slice(&iv[16..]);
    (first, second)
}

fn xor_in_place(dst: &mut Block, src: &Block) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Encrypt `data` in place: `cᵢ = E(pᵢ ⊕ cᵢ₋₁) ⊕ pᵢ₋₁`.
pub fn ige_encrypt(
    data: &mut [u8],
    iv: &[u8; 32],
    mut encrypt_block: impl FnMut(&mut Block),
) -> Result<(), CryptoError> {
    check_len(data)?;
    let (mut prev_cipher, mut prev_plain) = split_iv(iv);

    for chunk in data.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        let mut block = plain;
        xor_in_place(&mut block, &prev_cipher);
        encrypt_block(&mut block);
        xor_in_place(&mut block, &prev_plain);

        chunk.copy_from_slice(&block);
        prev_cipher = block;
        prev_plain = plain;
    }
    Ok(())
}

/// Decrypt `data` in place: `pᵢ = D(cᵢ ⊕ pᵢ₋₁) ⊕ cᵢ₋₁`.
pub fn ige_decrypt(
    data: &mut [u8],
    iv: &[u8; 32],
    mut decrypt_block: impl FnMut(&mut Block),
) -> Result<(), CryptoError> {
    check_len(data)?;
    let (mut prev_cipher, mut prev_plain) = split_iv(iv);

    for chunk in data.chunks_exact_mut(16) {
        let mut cipher = [0u8; 16];
        cipher.copy_from_slice(chunk);

        let mut block = cipher;
        xor_in_place(&mut block, &prev_plain);
        decrypt_block(&mut block);
        xor_in_place(&mut block, &prev_cipher);

        chunk.copy_from_slice(&block);
        prev_cipher = cipher;
        prev_plain = block;
    }
    Ok(())
}
