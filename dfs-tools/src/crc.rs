//! CRC-32 helpers. Callers always pass a whole-block extent and a starting
//! accumulator rather than handing this module a mutable buffer to checksum
//! in place — the original's "manual CRC-32 over mutable byte buffers"
//! pattern is replaced by a pure `(start, bytes) -> crc` function.

/// CRC-32 (IEEE) of `data`, continuing from `start` (pass `0` for a fresh
/// checksum). `(chunk, block)` pairs are CRC-32 protected per the data
/// model; every block written carries exactly one such checksum.
pub fn crc32(start: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(start);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(crc32(0, b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn continuation_matches_whole_buffer() {
        let whole = crc32(0, b"hello world");
        let half = crc32(0, b"hello ");
        let continued = crc32(half, b"world");
        assert_eq!(whole, continued);
    }
}
