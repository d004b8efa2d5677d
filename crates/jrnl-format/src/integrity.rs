//! CRC32 and alignment primitives.
//!
//! Every variable-length region of the on-disk format is padded with zeros
//! to an 8-byte boundary. Checkpoint files carry a whole-file CRC32;
//! operation records each carry their own.

/// Alignment of every on-disk region, in bytes.
pub const ALIGNMENT: u64 = 8;

const ZERO_PAD: [u8; ALIGNMENT as usize] = [0; ALIGNMENT as usize];

/// Round `size` up to the next multiple of [`ALIGNMENT`].
pub const fn aligned_size(size: u64) -> u64 {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Whether `size` is a multiple of [`ALIGNMENT`].
pub const fn is_aligned(size: u64) -> bool {
    size % ALIGNMENT == 0
}

/// The zero bytes that pad a region of `size` bytes up to alignment.
///
/// Empty when `size` is already aligned.
pub fn padding_for(size: u64) -> &'static [u8] {
    &ZERO_PAD[..(aligned_size(size) - size) as usize]
}

/// Extend a CRC32 over `bytes`, continuing from `seed`.
///
/// `crc32_update(0, data)` is the plain CRC32 of `data`, and
/// `crc32_update(crc32_update(0, a), b)` equals `crc32_update(0, a ++ b)`.
pub fn crc32_update(seed: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(bytes);
    hasher.finalize()
}

/// Extend a CRC32 over a sequence of buffers in order.
pub fn crc32_update_vectored(seed: u32, bufs: &[&[u8]]) -> u32 {
    let mut crc = seed;
    for buf in bufs {
        crc = crc32_update(crc, buf);
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), 8);
        assert_eq!(aligned_size(7), 8);
        assert_eq!(aligned_size(8), 8);
        assert_eq!(aligned_size(9), 16);
    }

    #[test]
    fn padding_reaches_alignment() {
        for size in 0..64u64 {
            let pad = padding_for(size);
            assert!(is_aligned(size + pad.len() as u64));
            assert!(pad.iter().all(|&b| b == 0));
            assert!(pad.len() < ALIGNMENT as usize);
        }
    }

    #[test]
    fn crc32_continuation_matches_concatenation() {
        let a = b"hello ";
        let b = b"world";
        let whole = crc32_update(0, b"hello world");
        let chained = crc32_update(crc32_update(0, a), b);
        assert_eq!(whole, chained);
        assert_eq!(crc32_update_vectored(0, &[a, b]), whole);
    }

    #[test]
    fn crc32_matches_known_value() {
        // CRC32 of "123456789" is the standard check value.
        assert_eq!(crc32_update(0, b"123456789"), 0xcbf4_3926);
    }
}
