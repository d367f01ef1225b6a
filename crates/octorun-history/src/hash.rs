//! Revision fingerprints.
//!
//! A fingerprint is the 32-bit FNV-1 hash of a revision payload, salted
//! with the decimal form of an optional collision probe, rendered in
//! decimal and then mapped onto an alphabet without vowels so that it can
//! never spell a word inside an object name.

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Characters a fingerprint is encoded into.
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Incremental FNV-1 (multiply, then xor) over 32 bits.
#[derive(Debug, Clone, Copy)]
struct Fnv1(u32);

impl Fnv1 {
    fn new() -> Self {
        Self(FNV32_OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.wrapping_mul(FNV32_PRIME);
            self.0 ^= u32::from(b);
        }
    }

    fn finish(self) -> u32 {
        self.0
    }
}

/// Map every character onto [`SAFE_ALPHABET`].
pub fn safe_encode(s: &str) -> String {
    s.chars()
        .map(|c| SAFE_ALPHABET[c as usize % SAFE_ALPHABET.len()] as char)
        .collect()
}

/// Deterministic fingerprint of `payload`, salted by `probe` when present.
pub fn fingerprint(payload: &[u8], probe: Option<i32>) -> String {
    let mut hasher = Fnv1::new();
    hasher.write(payload);
    if let Some(probe) = probe {
        hasher.write(probe.to_string().as_bytes());
    }
    safe_encode(&hasher.finish().to_string())
}

/// Name of the revision object for `owner` with the given fingerprint.
pub fn revision_name(owner: &str, fingerprint: &str) -> String {
    format!("{owner}-{fingerprint}")
}
