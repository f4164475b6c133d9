//! 17.14 fixed-point arithmetic for the MLFQS scheduler.
//!
//! The scheduler's `recent_cpu`/`load_avg` bookkeeping (§4.5) is specified in
//! fixed point to avoid floating point in kernel context. This mirrors the
//! `17.14` format used by the original scheduler: the low 14 bits are the
//! fractional part, the remaining bits (including sign) are the integer part.

const FRACTION_BITS: i64 = 14;
const FRACTION: i64 = 1 << FRACTION_BITS;

/// A 17.14 fixed-point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i64);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    /// Convert an integer to fixed point.
    pub const fn from_int(n: i32) -> Self {
        Fixed((n as i64) * FRACTION)
    }

    /// Reconstruct a `Fixed` from its raw 17.14 representation, truncated
    /// to 32 bits so it can be round-tripped through an `AtomicI32`.
    pub const fn from_raw(bits: i32) -> Self {
        Fixed(bits as i64)
    }

    /// The raw 17.14 representation, truncated to 32 bits.
    pub const fn to_raw(self) -> i32 {
        self.0 as i32
    }

    /// Round toward zero to the nearest integer.
    pub fn to_int_truncate(self) -> i32 {
        (self.0 / FRACTION) as i32
    }

    /// Round to the nearest integer, ties away from zero.
    pub fn to_int_round(self) -> i32 {
        let half = FRACTION / 2;
        let rounded = if self.0 >= 0 {
            self.0 + half
        } else {
            self.0 - half
        };
        (rounded / FRACTION) as i32
    }

    pub fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }

    pub fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }

    pub fn add_int(self, n: i32) -> Fixed {
        self.add(Fixed::from_int(n))
    }

    pub fn sub_int(self, n: i32) -> Fixed {
        self.sub(Fixed::from_int(n))
    }

    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * other.0 as i128) / FRACTION as i128) as i64)
    }

    pub fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n as i64)
    }

    pub fn div(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * FRACTION as i128) / other.0 as i128) as i64)
    }

    pub fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        assert_eq!(Fixed::from_int(59).to_int_truncate(), 59);
        assert_eq!(Fixed::from_int(-59).to_int_truncate(), -59);
    }

    #[test]
    fn truncate_vs_round() {
        // 2.4 truncates to 2, rounds to 2; 2.6 truncates to 2, rounds to 3.
        let v = Fixed::from_int(2).add(Fixed(FRACTION * 2 / 5));
        assert_eq!(v.to_int_truncate(), 2);
        assert_eq!(v.to_int_round(), 2);

        let v2 = Fixed::from_int(2).add(Fixed(FRACTION * 3 / 5));
        assert_eq!(v2.to_int_truncate(), 2);
        assert_eq!(v2.to_int_round(), 3);
    }

    #[test]
    fn load_avg_decay_formula() {
        // load_avg = (59/60) * load_avg + (1/60) * ready_threads
        let fifty_nine_sixtieths = Fixed::from_int(59).div(Fixed::from_int(60));
        let one_sixtieth = Fixed::from_int(1).div(Fixed::from_int(60));
        let load_avg = Fixed::ZERO;
        let ready_threads = 1;
        let next = fifty_nine_sixtieths
            .mul(load_avg)
            .add(one_sixtieth.mul_int(ready_threads));
        // Starting from 0 with one ready thread, load_avg should tick up slightly.
        assert!(next.to_int_truncate() == 0);
        assert!(next.0 > 0);
    }

    #[test]
    fn recent_cpu_decay_formula() {
        let load_avg = Fixed::from_int(1);
        let two_load_avg = load_avg.mul_int(2);
        let decay = two_load_avg.div(two_load_avg.add_int(1));
        let recent_cpu = Fixed::from_int(10);
        let next = decay.mul(recent_cpu).add_int(0);
        // decay < 1, so recent_cpu should decrease.
        assert!(next.0 < recent_cpu.0);
    }

    #[test]
    fn priority_formula_clamped() {
        use crate::task::thread::{PRI_MAX, PRI_MIN};
        let recent_cpu = Fixed::from_int(0);
        let nice = 0;
        let pri = Fixed::from_int(PRI_MAX as i32)
            .sub(recent_cpu.div_int(4))
            .sub(Fixed::from_int(2 * nice));
        let clamped = pri.to_int_truncate().clamp(PRI_MIN as i32, PRI_MAX as i32);
        assert_eq!(clamped, PRI_MAX as i32);
    }
}
