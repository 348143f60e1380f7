//! Signed feature hashing shared by the categorical and text hashers.

use std::collections::BTreeMap;

/// MurmurHash3 x86 32-bit, read as a signed integer.
pub fn murmur3_32(key: &[u8], seed: u32) -> i32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, b) in tail.iter().enumerate() {
            k |= (*b as u32) << (8 * i);
        }
        h ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    h ^= key.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h as i32
}

/// Column index and sign of a token in a space of `n_features` bins.
pub fn bucket(token: &str, n_features: usize) -> (usize, f64) {
    let h = murmur3_32(token.as_bytes(), 0);
    let index = ((h as i64).unsigned_abs() % n_features as u64) as usize;
    let sign = if h >= 0 { 1.0 } else { -1.0 };
    (index, sign)
}

/// Sum signed token counts into sparse row entries, sorted by column.
/// Entries that cancel out are dropped.
pub fn hash_tokens<'a>(tokens: impl IntoIterator<Item = &'a str>, n_features: usize) -> Vec<(usize, f64)> {
    let mut acc: BTreeMap<usize, f64> = BTreeMap::new();
    for token in tokens {
        let (index, sign) = bucket(token, n_features);
        *acc.entry(index).or_insert(0.0) += sign;
    }
    acc.into_iter().filter(|(_, v)| *v != 0.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_values() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"foo", 0), -156908512);
        assert_eq!(murmur3_32(b"hello", 0), 613153351);
        assert_eq!(murmur3_32(b"Paris", 0), -820467955);
    }

    #[test]
    fn test_bucket_sign() {
        assert_eq!(bucket("foo", 1 << 20), ((156908512 % (1 << 20)) as usize, -1.0));
        assert_eq!(bucket("hello", 10), (1, 1.0));
    }

    #[test]
    fn test_hash_tokens_accumulates() {
        let row = hash_tokens(["hello", "hello", "foo"], 1 << 20);
        assert_eq!(row.len(), 2);
        assert!(row.iter().any(|&(_, v)| v == 2.0));
        assert!(row.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
