//! Decimal quantities.
//!
//! Every quantity in the engine is a [`Decimal`]: parsed from strings, rendered
//! back to strings, and never routed through `f64`. The representation is a
//! 96-bit mantissa with up to 28 fractional digits; inputs that do not fit are
//! rejected rather than rounded.

use std::{fmt, str::FromStr};

use rust_decimal::Decimal as Inner;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal(Inner);

impl Decimal {
    pub const ZERO: Decimal = Decimal(Inner::ZERO);
    pub const ONE: Decimal = Decimal(Inner::ONE);

    /// Parse a plain decimal string such as `"1500"`, `"-0.25"` or `"12.000"`.
    ///
    /// Only an optional sign, ASCII digits and at most one `.` are accepted;
    /// surrounding whitespace, digit separators and exponents are rejected.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidDecimal {
            input: input.to_string(),
            reason,
        };
        if input.is_empty() {
            return Err(invalid("empty string".to_string()));
        }
        if !is_plain_decimal(input) {
            return Err(invalid("not a plain decimal number".to_string()));
        }

        Inner::from_str_exact(input)
            .map(Decimal)
            .map_err(|e| invalid(e.to_string()))
    }

    /// Whole number `v`, if it fits the 96-bit mantissa.
    pub fn from_i128(v: i128) -> Option<Self> {
        Inner::try_from_i128_with_scale(v, 0).ok().map(Decimal)
    }

    pub fn checked_add(self, other: Decimal) -> Option<Decimal> {
        self.0.checked_add(other.0).map(Decimal)
    }

    pub fn checked_mul(self, other: Decimal) -> Option<Decimal> {
        self.0.checked_mul(other.0).map(Decimal)
    }

    /// `None` on division by zero or overflow.
    pub fn checked_div(self, other: Decimal) -> Option<Decimal> {
        self.0.checked_div(other.0).map(Decimal)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_sign_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Same value with trailing fractional zeros removed (`"2.500"` -> `"2.5"`).
    pub fn normalize(self) -> Decimal {
        Decimal(self.0.normalize())
    }

    /// Banker's rounding to `dp` fractional digits.
    pub fn round_dp(self, dp: u32) -> Decimal {
        Decimal(self.0.round_dp(dp))
    }
}

/// `[+-]?(digits[.digits?] | .digits)`
fn is_plain_decimal(s: &str) -> bool {
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (int, frac) = match unsigned.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (unsigned, None),
    };
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());

    let has_digits = !int.is_empty() || frac.is_some_and(|f| !f.is_empty());
    all_digits(int) && frac.map_or(true, all_digits) && has_digits
}

impl From<i64> for Decimal {
    fn from(v: i64) -> Self {
        Decimal(Inner::from(v))
    }
}

impl From<u64> for Decimal {
    fn from(v: u64) -> Self {
        Decimal(Inner::from(v))
    }
}

impl From<Inner> for Decimal {
    fn from(v: Inner) -> Self {
        Decimal(v)
    }
}

impl FromStr for Decimal {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::parse(s)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DecimalVisitor;

        impl de::Visitor<'_> for DecimalVisitor {
            type Value = Decimal;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal quantity encoded as a string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Decimal, E> {
                Decimal::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(DecimalVisitor)
    }
}
