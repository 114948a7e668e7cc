#![allow(clippy::new_without_default)]
#![allow(clippy::needless_range_loop)]

mod bitmap;

pub use bitmap::BitMap;

/// Computes `base ^ exp` over the full 64-bit ring (wrapping on overflow).
///
/// Square-and-multiply; constant evaluation of exponent gates must match the
/// wrapping semantics of the target's integer exponentiation.
pub const fn pow_u64(base: u64, exp: u64) -> u64 {
    let mut result = 1u64;
    let mut power = base;
    let mut e = exp;
    while e != 0 {
        if e & 1 != 0 {
            result = result.wrapping_mul(power);
        }
        power = power.wrapping_mul(power);
        e >>= 1;
    }
    result
}

/// Computes `ceil(a / b)`.
pub const fn ceil_div_usize(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn pow_matches_checked_pow_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let base = rng.gen_range(0u64..32);
            let exp = rng.gen_range(0u64..12);
            assert_eq!(pow_u64(base, exp), base.pow(exp as u32));
        }
    }

    #[test]
    fn pow_wraps() {
        assert_eq!(pow_u64(2, 64), 0);
        assert_eq!(pow_u64(3, 0), 1);
        assert_eq!(pow_u64(0, 0), 1);
        assert_eq!(pow_u64(u64::MAX, 2), 1);
    }

    #[test]
    fn ceil_div() {
        assert_eq!(ceil_div_usize(0, 8), 0);
        assert_eq!(ceil_div_usize(1, 8), 1);
        assert_eq!(ceil_div_usize(8, 8), 1);
        assert_eq!(ceil_div_usize(9, 8), 2);
    }
}
