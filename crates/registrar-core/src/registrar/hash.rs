//! Address-of-record hashing
//!
//! Word-at-a-time string hash; the low bits select the slot, so table sizes
//! are powers of two and `slot = hash & (size - 1)`.

/// Hash an address-of-record
pub fn aor_hash(aor: &str) -> u32 {
    let bytes = aor.as_bytes();
    let mut h: u32 = 0;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let v = (chunk[0] as u32) << 24 | (chunk[1] as u32) << 16 | (chunk[2] as u32) << 8 | chunk[3] as u32;
        h = h.wrapping_add(v ^ (v >> 3));
    }
    let mut v: u32 = 0;
    for &b in chunks.remainder() {
        v = (v << 8).wrapping_add(b as u32);
    }
    h = h.wrapping_add(v ^ (v >> 3));
    h.wrapping_add(h >> 11)
        .wrapping_add((h >> 13).wrapping_add(h >> 23))
}

/// Slot index of `hash` in a table of `size` slots
#[inline]
pub fn slot_index(hash: u32, size: usize) -> usize {
    (hash as usize) & (size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(aor_hash("alice@example.com"), aor_hash("alice@example.com"));
        assert_ne!(aor_hash("alice@example.com"), aor_hash("bob@example.com"));
        assert_eq!(aor_hash(""), 0);
    }

    #[test]
    fn test_slot_in_range() {
        for aor in ["a", "alice@example.com", "sip:carol@10.0.0.7:5060;transport=tcp"] {
            assert!(slot_index(aor_hash(aor), 512) < 512);
        }
    }

    #[test]
    fn test_spread_over_slots() {
        let mut used = std::collections::HashSet::new();
        for i in 0..1000 {
            used.insert(slot_index(aor_hash(&format!("user{}@example.com", i)), 64));
        }
        assert!(used.len() > 16);
    }
}
