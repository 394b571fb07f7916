//! Property-based tests for bitstream operations.
//!
//! Uses proptest to verify round-trip correctness of BitReader/BitWriter and
//! the invariants of the variable-length draws.

use proptest::prelude::*;
use overture_core::bitstream::{BitReader, BitWriter};

proptest! {
    /// Writing and reading a fixed-width value round-trips.
    #[test]
    fn roundtrip_bits_variable_width(value in 0u32..=0xFFFF, width in 1u32..=16) {
        let masked = value & ((1u32 << width) - 1);

        let mut writer = BitWriter::new();
        writer.write_bits(masked as u64, width);
        writer.align_to_byte();

        let mut reader = BitReader::new(writer.data());
        prop_assert_eq!(reader.get(width), masked);
        prop_assert!(!reader.has_error());
    }

    /// Signed values round-trip through the n+1-bit two's-complement form.
    #[test]
    fn roundtrip_signed(value in -128i32..=127, extra in 0u32..4) {
        let width = 7 + extra;
        let mut writer = BitWriter::new();
        writer.write_bits((value as u64) & ((1u64 << (width + 1)) - 1), width + 1);
        writer.align_to_byte();

        let mut reader = BitReader::new(writer.data());
        prop_assert_eq!(reader.get_signed(width), value);
    }

    /// A uniform draw never reaches its range bound.
    #[test]
    fn uniform_is_in_range(bytes in proptest::collection::vec(any::<u8>(), 1..8), range in 1u32..1000) {
        let mut reader = BitReader::new(&bytes);
        let v = reader.get_uniform(range);
        prop_assert!(v < range);
    }

    /// A sub-exponential draw stays within its signalled bound.
    #[test]
    fn subexp_is_bounded(bytes in proptest::collection::vec(any::<u8>(), 1..16),
                         reference in -8i32..8, n in 3u32..6) {
        let mut reader = BitReader::new(&bytes);
        let v = reader.get_subexp(reference, n);
        prop_assert!(v >= -(1 << n) && v < (1 << n));
    }

    /// Reads past the end return zero and latch the error flag.
    #[test]
    fn sticky_error_always_zero(bytes in proptest::collection::vec(any::<u8>(), 0..4)) {
        let mut reader = BitReader::new(&bytes);
        for _ in 0..bytes.len() {
            reader.get(8);
        }
        prop_assert_eq!(reader.get(16), 0);
        prop_assert!(reader.has_error());
        prop_assert_eq!(reader.get(32), 0);
    }
}
