//! Extended-range floating point scalar.
//!
//! Likelihood products over large trees underflow `f64` long before they stop
//! being meaningful. `ExtFloat` stores a value as `mantissa × 10^exponent`.
//! Values whose magnitude lies in `[LOWER_LIMIT, UPPER_LIMIT]` stay in a plain
//! form (`exponent == 0`) so the common case costs one float operation; anything
//! outside that window is renormalised so that `|mantissa| ∈ [1, 10)`.
//! Zero, infinities and NaN always carry exponent 0.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Upper bound of the plain (exponent 0) window.
pub const UPPER_LIMIT: f64 = 1e100;
/// Lower bound of the plain (exponent 0) window.
pub const LOWER_LIMIT: f64 = 1e-100;

const LIMIT_EXPONENT: i64 = 100;

/// Scalar with a decimal exponent that never under- or overflows in practice.
#[derive(Clone, Copy, Debug)]
pub struct ExtFloat {
    mantissa: f64,
    exponent: i64,
}

/// Multiply `m` by `10^n` in two steps so the power itself never overflows.
fn scale10(m: f64, n: i64) -> f64 {
    let n = n.clamp(-1000, 1000) as i32;
    let half = n / 2;
    m * 10f64.powi(half) * 10f64.powi(n - half)
}

#[inline]
fn in_plain_window(m: f64) -> bool {
    let a = m.abs();
    (LOWER_LIMIT..=UPPER_LIMIT).contains(&a)
}

impl ExtFloat {
    pub const ZERO: ExtFloat = ExtFloat {
        mantissa: 0.0,
        exponent: 0,
    };
    pub const ONE: ExtFloat = ExtFloat {
        mantissa: 1.0,
        exponent: 0,
    };

    /// Build from raw parts, renormalising when needed.
    pub fn from_parts(mantissa: f64, exponent: i64) -> Self {
        if mantissa == 0.0 || !mantissa.is_finite() {
            return ExtFloat {
                mantissa,
                exponent: 0,
            };
        }
        if exponent == 0 && in_plain_window(mantissa) {
            return ExtFloat { mantissa, exponent };
        }
        let (m, e) = normalize(mantissa, exponent);
        if (-LIMIT_EXPONENT..LIMIT_EXPONENT).contains(&e) {
            // Back inside the window: keep the plain form.
            let plain = scale10(m, e);
            if in_plain_window(plain) {
                return ExtFloat {
                    mantissa: plain,
                    exponent: 0,
                };
            }
        }
        ExtFloat {
            mantissa: m,
            exponent: e,
        }
    }

    /// Build the value `exp(log_value)`.
    pub fn from_ln(log_value: f64) -> Self {
        if !log_value.is_finite() {
            return if log_value == f64::NEG_INFINITY {
                Self::ZERO
            } else {
                Self::from(log_value.exp())
            };
        }
        let log10 = log_value / std::f64::consts::LN_10;
        let e = log10.floor();
        let m = 10f64.powf(log10 - e);
        Self::from_parts(m, e as i64)
    }

    pub fn mantissa(&self) -> f64 {
        self.mantissa
    }

    pub fn exponent(&self) -> i64 {
        self.exponent
    }

    /// True when the value is stored without a decimal exponent.
    pub fn is_plain(&self) -> bool {
        self.exponent == 0
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.mantissa.is_finite()
    }

    pub fn is_nan(&self) -> bool {
        self.mantissa.is_nan()
    }

    /// Natural logarithm: `ln(m) + e·ln(10)`.
    pub fn ln(&self) -> f64 {
        if self.exponent == 0 {
            self.mantissa.ln()
        } else {
            self.mantissa.ln() + self.exponent as f64 * std::f64::consts::LN_10
        }
    }

    pub fn abs(&self) -> Self {
        ExtFloat {
            mantissa: self.mantissa.abs(),
            exponent: self.exponent,
        }
    }

    /// Nearest `f64`; saturates to 0 or ±inf outside the native range.
    pub fn to_f64(&self) -> f64 {
        if self.exponent == 0 {
            self.mantissa
        } else {
            scale10(self.mantissa, self.exponent)
        }
    }

    /// Add one in place.
    pub fn increment(&mut self) {
        *self += 1.0;
    }

    /// Subtract one in place.
    pub fn decrement(&mut self) {
        *self -= 1.0;
    }

    /// Mantissa in `[1, 10)` with its exponent, regardless of storage form.
    fn normalized(&self) -> (f64, i64) {
        if self.mantissa == 0.0 || !self.mantissa.is_finite() {
            (self.mantissa, 0)
        } else {
            normalize(self.mantissa, self.exponent)
        }
    }
}

/// Shift `m × 10^e` so that `|m| ∈ [1, 10)`.
fn normalize(mantissa: f64, exponent: i64) -> (f64, i64) {
    let shift = mantissa.abs().log10().floor() as i64;
    let mut m = scale10(mantissa, -shift);
    let mut e = exponent + shift;
    // log10 can be off by one ulp near powers of ten
    while m.abs() >= 10.0 {
        m /= 10.0;
        e += 1;
    }
    while m.abs() < 1.0 {
        m *= 10.0;
        e -= 1;
    }
    (m, e)
}

impl Default for ExtFloat {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<f64> for ExtFloat {
    fn from(value: f64) -> Self {
        Self::from_parts(value, 0)
    }
}

impl From<ExtFloat> for f64 {
    fn from(value: ExtFloat) -> Self {
        value.to_f64()
    }
}

impl fmt::Display for ExtFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exponent == 0 {
            write!(f, "{}", self.mantissa)
        } else {
            write!(f, "{}e{}", self.mantissa, self.exponent)
        }
    }
}

impl Neg for ExtFloat {
    type Output = ExtFloat;

    fn neg(self) -> ExtFloat {
        ExtFloat {
            mantissa: -self.mantissa,
            exponent: self.exponent,
        }
    }
}

impl Add for ExtFloat {
    type Output = ExtFloat;

    fn add(self, rhs: ExtFloat) -> ExtFloat {
        if self.exponent == 0 && rhs.exponent == 0 {
            return ExtFloat::from_parts(self.mantissa + rhs.mantissa, 0);
        }
        if self.mantissa == 0.0 {
            return rhs;
        }
        if rhs.mantissa == 0.0 {
            return self;
        }
        let (big, small) = if self.exponent >= rhs.exponent {
            (self, rhs)
        } else {
            (rhs, self)
        };
        let aligned = scale10(small.mantissa, small.exponent - big.exponent);
        ExtFloat::from_parts(big.mantissa + aligned, big.exponent)
    }
}

impl Sub for ExtFloat {
    type Output = ExtFloat;

    fn sub(self, rhs: ExtFloat) -> ExtFloat {
        self + (-rhs)
    }
}

impl Mul for ExtFloat {
    type Output = ExtFloat;

    fn mul(self, rhs: ExtFloat) -> ExtFloat {
        ExtFloat::from_parts(self.mantissa * rhs.mantissa, self.exponent + rhs.exponent)
    }
}

impl Div for ExtFloat {
    type Output = ExtFloat;

    fn div(self, rhs: ExtFloat) -> ExtFloat {
        ExtFloat::from_parts(self.mantissa / rhs.mantissa, self.exponent - rhs.exponent)
    }
}

impl Add<f64> for ExtFloat {
    type Output = ExtFloat;

    fn add(self, rhs: f64) -> ExtFloat {
        self + ExtFloat::from(rhs)
    }
}

impl Sub<f64> for ExtFloat {
    type Output = ExtFloat;

    fn sub(self, rhs: f64) -> ExtFloat {
        self - ExtFloat::from(rhs)
    }
}

impl Mul<f64> for ExtFloat {
    type Output = ExtFloat;

    fn mul(self, rhs: f64) -> ExtFloat {
        self * ExtFloat::from(rhs)
    }
}

impl Div<f64> for ExtFloat {
    type Output = ExtFloat;

    fn div(self, rhs: f64) -> ExtFloat {
        self / ExtFloat::from(rhs)
    }
}

macro_rules! assign_ops {
    ($($trait:ident, $method:ident, $op:tt);* $(;)?) => {
        $(
            impl $trait for ExtFloat {
                fn $method(&mut self, rhs: ExtFloat) {
                    *self = *self $op rhs;
                }
            }

            impl $trait<f64> for ExtFloat {
                fn $method(&mut self, rhs: f64) {
                    *self = *self $op rhs;
                }
            }
        )*
    };
}

assign_ops! {
    AddAssign, add_assign, +;
    SubAssign, sub_assign, -;
    MulAssign, mul_assign, *;
    DivAssign, div_assign, /;
}

impl PartialEq for ExtFloat {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for ExtFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.is_nan() || other.is_nan() {
            return None;
        }
        if self.exponent == 0 && other.exponent == 0 {
            return self.mantissa.partial_cmp(&other.mantissa);
        }
        let sa = sign(self.mantissa);
        let sb = sign(other.mantissa);
        if sa != sb {
            return sa.partial_cmp(&sb);
        }
        if sa == 0 {
            return Some(Ordering::Equal);
        }
        let (ma, ea) = self.normalized();
        let (mb, eb) = other.normalized();
        if !ma.is_finite() || !mb.is_finite() {
            return ma.partial_cmp(&mb);
        }
        let magnitude = ea.cmp(&eb).then(
            ma.abs()
                .partial_cmp(&mb.abs())
                .unwrap_or(Ordering::Equal),
        );
        Some(if sa > 0 { magnitude } else { magnitude.reverse() })
    }
}

fn sign(m: f64) -> i8 {
    if m > 0.0 {
        1
    } else if m < 0.0 {
        -1
    } else {
        0
    }
}

impl Sum for ExtFloat {
    fn sum<I: Iterator<Item = ExtFloat>>(iter: I) -> Self {
        iter.fold(ExtFloat::ZERO, |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a ExtFloat> for ExtFloat {
    fn sum<I: Iterator<Item = &'a ExtFloat>>(iter: I) -> Self {
        iter.fold(ExtFloat::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-10 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn test_plain_values_stay_plain() {
        let x = ExtFloat::from(0.25);
        assert!(x.is_plain());
        assert_eq!(x.mantissa(), 0.25);

        let y = x * 4.0;
        assert!(y.is_plain());
        assert!((y.to_f64() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_and_non_finite_have_zero_exponent() {
        assert_eq!(ExtFloat::from_parts(0.0, 57).exponent(), 0);
        assert_eq!(ExtFloat::from_parts(f64::INFINITY, -12).exponent(), 0);
        assert!(ExtFloat::from_parts(f64::NAN, 3).is_nan());
    }

    #[test]
    fn test_underflowing_product_is_renormalised() {
        let mut acc = ExtFloat::ONE;
        for _ in 0..50 {
            acc *= 1e-30;
        }
        assert!(!acc.is_plain());
        assert!(acc.mantissa().abs() >= 1.0 && acc.mantissa().abs() < 10.0);
        assert!((acc.exponent() + 1500).abs() <= 1);
        assert!(close(acc.ln(), 50.0 * (1e-30f64).ln()));
        assert!(acc > ExtFloat::ZERO);
        assert_eq!(acc.to_f64(), 0.0);
    }

    #[test]
    fn test_ln_decomposition() {
        let x = ExtFloat::from_parts(3.5, -420);
        let expected = 3.5f64.ln() - 420.0 * std::f64::consts::LN_10;
        assert!((x.ln() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_from_ln_round_trip() {
        let x = ExtFloat::from_ln(-5000.0);
        assert!((x.ln() + 5000.0).abs() < 1e-8);
        let y = ExtFloat::from_ln(2.0);
        assert!((y.to_f64() - 2f64.exp()).abs() < 1e-10);
    }

    #[test]
    fn test_add_aligns_exponents() {
        let a = ExtFloat::from_parts(2.0, -300);
        let b = ExtFloat::from_parts(5.0, -301);
        let sum = a + b;
        assert_eq!(sum.exponent(), -300);
        assert!((sum.mantissa() - 2.5).abs() < 1e-12);

        // Tiny term next to a plain one vanishes without disturbing it
        let c = ExtFloat::from(0.5) + ExtFloat::from_parts(1.0, -500);
        assert!(c.is_plain());
        assert!((c.to_f64() - 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_subtraction_to_zero() {
        let a = ExtFloat::from_parts(7.25, 250);
        let d = a - a;
        assert!(d.is_zero());
        assert_eq!(d.exponent(), 0);
    }

    #[test]
    fn test_division_recovers_plain_range() {
        let a = ExtFloat::from_parts(6.0, -200);
        let b = ExtFloat::from_parts(3.0, -200);
        let q = a / b;
        assert!(q.is_plain());
        assert!((q.to_f64() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_comparisons_across_forms() {
        let tiny = ExtFloat::from_parts(9.0, -400);
        let tinier = ExtFloat::from_parts(1.0, -401);
        let plain = ExtFloat::from(1e-50);
        assert!(tiny > tinier);
        assert!(plain > tiny);
        assert!(-tiny < -tinier);
        assert!(-plain < tinier);
        assert_eq!(ExtFloat::from_parts(2.0, -300), ExtFloat::from_parts(20.0, -301));
    }

    #[test]
    fn test_increment_decrement() {
        let mut x = ExtFloat::from(1.5);
        x.increment();
        assert!((x.to_f64() - 2.5).abs() < 1e-12);
        x.decrement();
        x.decrement();
        assert!((x.to_f64() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sum_and_display() {
        let values = vec![ExtFloat::from(0.1), ExtFloat::from(0.2), ExtFloat::from(0.3)];
        let total: ExtFloat = values.iter().sum();
        assert!((total.to_f64() - 0.6).abs() < 1e-12);
        assert_eq!(format!("{}", ExtFloat::from_parts(2.5, -150)), "2.5e-150");
    }

    proptest! {
        #[test]
        fn prop_add_matches_f64(x in -1e50f64..1e50, y in -1e50f64..1e50) {
            let s = (ExtFloat::from(x) + ExtFloat::from(y)).to_f64();
            prop_assert!(close(s, x + y));
        }

        #[test]
        fn prop_mul_matches_f64(x in -1e60f64..1e60, y in -1e60f64..1e60) {
            let p = (ExtFloat::from(x) * ExtFloat::from(y)).to_f64();
            prop_assert!(close(p, x * y));
        }

        #[test]
        fn prop_ln_of_scaled_value(m in 1.0f64..10.0, e in -2000i64..2000) {
            let v = ExtFloat::from_parts(m, e);
            let expected = m.ln() + e as f64 * std::f64::consts::LN_10;
            prop_assert!((v.ln() - expected).abs() < 1e-8 * expected.abs().max(1.0));
        }

        #[test]
        fn prop_ordering_matches_f64(x in -1e80f64..1e80, y in -1e80f64..1e80) {
            let a = ExtFloat::from(x) * ExtFloat::from_parts(1.0, -300);
            let b = ExtFloat::from(y) * ExtFloat::from_parts(1.0, -300);
            prop_assert_eq!(a.partial_cmp(&b), x.partial_cmp(&y));
        }
    }
}
