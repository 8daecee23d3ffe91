use linalg_rs::lowering::quant::{shift_unsigned_value, sign_shift_constant};
use proptest::prelude::*;
use test_case::test_case;

#[test_case(1, -1)]
#[test_case(8, -128)]
#[test_case(16, -32_768)]
#[test_case(32, -2_147_483_648)]
#[test_case(64, i64::MIN)]
fn sign_shift_is_minus_half_the_range(bits: usize, expected: i64) {
    assert_eq!(sign_shift_constant(bits), expected);
}

fn unsigned_with_bits() -> impl Strategy<Value = (usize, i64, i64)> {
    prop_oneof![Just(8usize), Just(16usize)].prop_flat_map(|bits| {
        let range = 0..(1i64 << bits);
        (Just(bits), range.clone(), range)
    })
}

proptest! {
    #[test]
    fn shift_preserves_offset_from_zero_point((bits, value, zero_point) in unsigned_with_bits()) {
        let shifted = shift_unsigned_value(value, bits);
        let shifted_zp = shift_unsigned_value(zero_point, bits);
        prop_assert_eq!(shifted - shifted_zp, value - zero_point);

        let half = 1i64 << (bits - 1);
        prop_assert!((-half..half).contains(&shifted));
    }
}
