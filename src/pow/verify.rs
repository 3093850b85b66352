//! PoW target math: masking, candidate hashing, prefix matching and
//! per-delegate difficulty derivation.

use sha2::{Digest, Sha256};

/// Bits kept by the mask. The complement (0x88) is cleared in each of the
/// first `leading` bytes, which restricts the leading hex nibbles to 0..=7.
const MASK_KEEP: u8 = 0x77;

/// Clear the forbidden bits in the first `leading` bytes of a digest.
pub fn mask_bytes(hash: &[u8; 32], leading: u8) -> [u8; 32] {
    let mut out = *hash;
    for byte in out.iter_mut().take(leading as usize) {
        *byte &= MASK_KEEP;
    }
    out
}

/// Masked PoW candidate for `(src, nonce)`:
/// `mask(SHA256(src ‖ asciiDecimal(nonce)))`.
pub fn pow_hash(src: &str, nonce: u64, leading: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(src.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    mask_bytes(&digest, leading)
}

/// A usable difficulty: non-empty '0'/'1' string no longer than the hex
/// width of a digest.
pub fn is_bit_string(difficulty: &str) -> bool {
    !difficulty.is_empty()
        && difficulty.len() <= 64
        && difficulty.bytes().all(|b| b == b'0' || b == b'1')
}

/// Whether the hex encoding of `hash` starts with `difficulty` (a string of
/// '0'/'1' characters).
pub fn hex_prefix_matches(hash: &[u8; 32], difficulty: &str) -> bool {
    for (i, ch) in difficulty.bytes().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if nibble != (ch - b'0') {
            return false;
        }
    }
    true
}

/// Verify a submitted PoW solution.
///
/// The candidate is recomputed from `(src, nonce)` and the submitted hash is
/// re-masked before comparison, so setting forbidden bits cannot smuggle a
/// different hash past verification.
pub fn verify_pow(src: &str, nonce: u64, submitted: &[u8; 32], difficulty: &str) -> bool {
    if !is_bit_string(difficulty) {
        return false;
    }
    let leading = difficulty.len() as u8;
    let candidate = pow_hash(src, nonce, leading);
    let resubmitted = mask_bytes(submitted, leading);
    candidate == resubmitted && hex_prefix_matches(&candidate, difficulty)
}

/// Difficulty bit-string for a delegate ring position:
/// `binary(index mod (2^leading − 1), width = leading)`. The non-zero
/// modulus spreads targets across delegates without ever producing the
/// all-ones pattern.
pub fn difficulty_for_index(index: u32, leading: u8) -> String {
    let space = (1u32 << leading) - 1;
    let raw = index % space;
    format!("{:0width$b}", raw, width = leading as usize)
}
