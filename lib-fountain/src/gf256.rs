//! GF(256) arithmetic
//!
//! The field GF(2^8) with reduction polynomial 0x11D and generator 2,
//! via log/exp tables built once at first use.

use std::sync::OnceLock;

const POLY: u16 = 0x11D;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        // Doubled table spares the modulo in mul
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    })
}

/// Addition is XOR
#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

/// Multiplicative inverse; zero has none
pub fn inv(a: u8) -> Option<u8> {
    if a == 0 {
        return None;
    }
    let t = tables();
    Some(t.exp[255 - t.log[a as usize] as usize])
}

pub fn div(a: u8, b: u8) -> Option<u8> {
    Some(mul(a, inv(b)?))
}

/// target ^= coefficient * source, element-wise
pub fn mul_add_assign(target: &mut [u8], source: &[u8], coefficient: u8) {
    debug_assert_eq!(target.len(), source.len());
    if coefficient == 0 {
        return;
    }
    if coefficient == 1 {
        for (t, s) in target.iter_mut().zip(source) {
            *t ^= s;
        }
        return;
    }
    for (t, s) in target.iter_mut().zip(source) {
        *t ^= mul(coefficient, *s);
    }
}

/// target *= coefficient, element-wise
pub fn scale_assign(target: &mut [u8], coefficient: u8) {
    if coefficient == 1 {
        return;
    }
    for t in target.iter_mut() {
        *t = mul(*t, coefficient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_identity_and_zero() {
        for a in 0..=255u8 {
            assert_eq!(mul(a, 1), a);
            assert_eq!(mul(a, 0), 0);
            assert_eq!(mul(0, a), 0);
        }
    }

    #[test]
    fn test_mul_commutative() {
        for a in (0..=255u8).step_by(7) {
            for b in (0..=255u8).step_by(11) {
                assert_eq!(mul(a, b), mul(b, a));
            }
        }
    }

    #[test]
    fn test_inverse_law() {
        for a in 1..=255u8 {
            let i = inv(a).unwrap();
            assert_eq!(mul(a, i), 1, "a={a} inv={i}");
        }
        assert!(inv(0).is_none());
    }

    #[test]
    fn test_distributive() {
        for a in (1..=255u8).step_by(13) {
            for b in (0..=255u8).step_by(17) {
                for c in (0..=255u8).step_by(19) {
                    assert_eq!(mul(a, add(b, c)), add(mul(a, b), mul(a, c)));
                }
            }
        }
    }

    #[test]
    fn test_mul_add_assign() {
        let mut target = vec![1u8, 2, 3];
        gf_check(&mut target);
    }

    fn gf_check(target: &mut [u8]) {
        let source = [4u8, 5, 6];
        let before = target.to_vec();
        mul_add_assign(target, &source, 3);
        for i in 0..3 {
            assert_eq!(target[i], add(before[i], mul(3, source[i])));
        }
    }
}
