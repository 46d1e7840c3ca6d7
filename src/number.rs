//! Arbitrary-precision numbers for policy values.
//!
//! Numbers are stored as exact rationals so that integer arithmetic never
//! overflows and decimal literals compare exactly. Floats are converted to
//! their exact binary rational on construction.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An arbitrary-precision number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Number(BigRational);

impl Number {
    /// Zero.
    pub fn zero() -> Self {
        Number(BigRational::zero())
    }

    /// Construct from a big rational.
    pub fn from_rational(r: BigRational) -> Self {
        Number(r)
    }

    /// Construct from an f64. Non-finite values map to zero.
    pub fn from_f64(f: f64) -> Self {
        BigRational::from_float(f).map_or_else(Self::zero, Number)
    }

    /// Check whether the number is a whole integer.
    pub fn is_integer(&self) -> bool {
        self.0.is_integer()
    }

    /// Get the value as i64 if it is an integer in range.
    pub fn as_i64(&self) -> Option<i64> {
        if self.0.is_integer() {
            self.0.to_integer().to_i64()
        } else {
            None
        }
    }

    /// Get the value as usize if it is a non-negative integer in range.
    pub fn as_usize(&self) -> Option<usize> {
        if self.0.is_integer() && !self.0.is_negative() {
            self.0.to_integer().to_usize()
        } else {
            None
        }
    }

    /// Approximate the value as f64 (lossy for large magnitudes).
    pub fn as_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    /// Borrow the underlying rational.
    pub fn rational(&self) -> &BigRational {
        &self.0
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number(BigRational::from_integer(BigInt::from(v)))
    }
}

impl From<u64> for Number {
    fn from(v: u64) -> Self {
        Number(BigRational::from_integer(BigInt::from(v)))
    }
}

impl From<usize> for Number {
    fn from(v: usize) -> Self {
        Number(BigRational::from_integer(BigInt::from(v)))
    }
}

/// Error produced when parsing a numeric literal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid number literal: {0}")]
pub struct ParseNumberError(String);

impl FromStr for Number {
    type Err = ParseNumberError;

    /// Parse a JSON-style numeric literal: optional sign, integer part,
    /// optional fraction, optional exponent. The result is exact.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseNumberError(s.to_string());

        let (mantissa, exponent) = match s.find(['e', 'E']) {
            Some(idx) => {
                let exp: i64 = s[idx + 1..].parse().map_err(|_| err())?;
                (&s[..idx], exp)
            }
            None => (s, 0),
        };

        let (int_part, frac_part) = match mantissa.find('.') {
            Some(idx) => (&mantissa[..idx], &mantissa[idx + 1..]),
            None => (mantissa, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }

        let digits = format!("{int_part}{frac_part}");
        let numer = BigInt::from_str(&digits).map_err(|_| err())?;

        // Scale: 10^(exponent - len(frac_part))
        let scale = exponent - frac_part.len() as i64;
        let magnitude = usize::try_from(scale.unsigned_abs()).map_err(|_| err())?;
        let factor = num_traits::pow(BigInt::from(10u32), magnitude);
        let rational = if scale >= 0 {
            BigRational::from_integer(numer * factor)
        } else {
            BigRational::new(numer, factor)
        };

        Ok(Number(rational))
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_integer() {
            write!(f, "{}", self.0.to_integer())
        } else {
            write!(f, "{}", self.as_f64())
        }
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(i) = self.as_i64() {
            serializer.serialize_i64(i)
        } else {
            serializer.serialize_f64(self.as_f64())
        }
    }
}

impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = serde_json::Number::deserialize(deserializer)?;
        if let Some(i) = n.as_i64() {
            Ok(Number::from(i))
        } else if let Some(u) = n.as_u64() {
            Ok(Number::from(u))
        } else if let Some(f) = n.as_f64() {
            Ok(Number::from_f64(f))
        } else {
            Err(D::Error::custom("unrepresentable number"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        let n: Number = "42".parse().unwrap();
        assert_eq!(n.as_i64(), Some(42));
        assert!(n.is_integer());
    }

    #[test]
    fn test_parse_negative() {
        let n: Number = "-7".parse().unwrap();
        assert_eq!(n.as_i64(), Some(-7));
    }

    #[test]
    fn test_parse_decimal_is_exact() {
        let a: Number = "0.1".parse().unwrap();
        let b: Number = "0.10".parse().unwrap();
        assert_eq!(a, b);
        assert!(!a.is_integer());
    }

    #[test]
    fn test_parse_exponent() {
        let n: Number = "5e3".parse().unwrap();
        assert_eq!(n.as_i64(), Some(5000));

        let n: Number = "25e-1".parse().unwrap();
        assert_eq!(n, "2.5".parse().unwrap());
    }

    #[test]
    fn test_parse_huge_integer() {
        let n: Number = "123456789012345678901234567890".parse().unwrap();
        assert!(n.is_integer());
        assert_eq!(n.as_i64(), None); // out of i64 range but representable
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("abc".parse::<Number>().is_err());
        assert!("".parse::<Number>().is_err());
        assert!("1.2.3".parse::<Number>().is_err());
    }

    #[test]
    fn test_ordering() {
        let a: Number = "1.5".parse().unwrap();
        let b = Number::from(2i64);
        assert!(a < b);
    }

    #[test]
    fn test_display_integer() {
        assert_eq!(Number::from(10i64).to_string(), "10");
    }

    #[test]
    fn test_serialize_integer_as_json_int() {
        let n = Number::from(3i64);
        assert_eq!(serde_json::to_string(&n).unwrap(), "3");
    }
}
