//! Thin SHA-256 wrapper for byte and word inputs.

use sha2::{Digest, Sha256};

/// Size of a derived key in bytes.
pub const KEY_SIZE: usize = 32;

/// SHA-256 over a byte slice.
pub fn sha256(data: &[u8]) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over a slice of 32-bit words, hashed as their little-endian
/// byte representation (the wire encoding of a packet payload).
pub fn sha256_words(words: &[u32]) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    for word in words {
        hasher.update(word.to_le_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(digest: &[u8; KEY_SIZE]) -> String {
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn empty_input_vector() {
        assert_eq!(
            hex(&sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn abc_vector() {
        assert_eq!(
            hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn words_match_their_byte_encoding() {
        let words = [0x0403_0201u32, 0x0807_0605];
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(sha256_words(&words), sha256(&bytes));
    }

    #[test]
    fn deterministic() {
        let data = [0x11u8; 64];
        assert_eq!(sha256(&data), sha256(&data));
    }
}
