use cashd_pow::difficulty::{block_proof, compact_to_u256, hash_to_u256, u256_to_compact};
use primitive_types::U256;

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_u256(bits).expect("target");
    assert_eq!(u256_to_compact(target), bits);
}

#[test]
fn regtest_limit_layout() {
    let target = compact_to_u256(0x207fffff).expect("target");
    assert_eq!(target, U256::from(0x7fffffu64) << 232);
    let mut hash = [0u8; 32];
    hash[31] = 0x7f;
    assert!(hash_to_u256(&hash) <= target);
    hash[31] = 0x80;
    assert!(hash_to_u256(&hash) > target);
}

#[test]
fn harder_bits_carry_more_work() {
    let easy = block_proof(0x207fffff).expect("easy");
    let hard = block_proof(0x2000ffff).expect("hard");
    assert_eq!(easy, U256::from(2u64));
    assert!(hard > easy.saturating_mul(U256::from(100u64)));
}
