//! Exact rational numbers and the strict answer parser
//!
//! Participants type answers as integers (`3`), decimals (`1.5`, `1,5`) or
//! fractions (`3/2`). All forms reduce to the same normalized [`Rational`], so
//! comparison is exact and never goes through floating point.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when free text is not a rational number
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Empty answer")]
    Empty,

    #[error("Not a number: {0:?}")]
    Malformed(String),

    #[error("Zero denominator in {0:?}")]
    ZeroDenominator(String),

    #[error("Number too large: {0:?}")]
    Overflow(String),
}

/// A reduced fraction with a strictly positive denominator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RationalRepr", into = "String")]
pub struct Rational {
    numerator: i64,
    denominator: i64,
}

impl Rational {
    /// Build a rational from a numerator and denominator, reducing it.
    pub fn new(numerator: i64, denominator: i64) -> Option<Self> {
        if denominator == 0 {
            return None;
        }
        let negative = (numerator < 0) != (denominator < 0);
        let divisor = gcd(numerator.unsigned_abs(), denominator.unsigned_abs());
        let magnitude = i64::try_from(numerator.unsigned_abs() / divisor).ok()?;
        let denominator = i64::try_from(denominator.unsigned_abs() / divisor).ok()?;
        let numerator = if negative { -magnitude } else { magnitude };
        Some(Self {
            numerator,
            denominator,
        })
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            numerator: value,
            denominator: 1,
        }
    }

    pub fn numerator(&self) -> i64 {
        self.numerator
    }

    pub fn denominator(&self) -> i64 {
        self.denominator
    }

    pub fn is_positive(&self) -> bool {
        self.numerator > 0
    }

    /// Parse free text strictly.
    ///
    /// Accepts an optional sign, integers, decimals with `.` or `,` and a
    /// single `/` between two such numbers. Surrounding whitespace is ignored.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        match trimmed.split_once('/') {
            Some((top, bottom)) => {
                let top = parse_decimal(top.trim(), trimmed)?;
                let bottom = parse_decimal(bottom.trim(), trimmed)?;
                if bottom.numerator == 0 {
                    return Err(ParseError::ZeroDenominator(trimmed.to_string()));
                }
                top.checked_div(&bottom)
                    .ok_or_else(|| ParseError::Overflow(trimmed.to_string()))
            }
            None => parse_decimal(trimmed, trimmed),
        }
    }

    fn checked_div(&self, other: &Rational) -> Option<Rational> {
        let numerator = self.numerator.checked_mul(other.denominator)?;
        let denominator = self.denominator.checked_mul(other.numerator)?;
        Rational::new(numerator, denominator)
    }
}

/// Parse `[+-]digits[(.|,)digits]` into an exact rational.
fn parse_decimal(text: &str, original: &str) -> Result<Rational, ParseError> {
    let malformed = || ParseError::Malformed(original.to_string());
    let overflow = || ParseError::Overflow(original.to_string());

    let (negative, body) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let (whole, fraction) = match body.find(['.', ',']) {
        Some(pos) => (&body[..pos], &body[pos + 1..]),
        None => (body, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(malformed());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed());
    }

    let mut numerator: i64 = 0;
    let mut denominator: i64 = 1;
    for digit in whole.bytes().chain(fraction.bytes()) {
        numerator = numerator
            .checked_mul(10)
            .and_then(|n| n.checked_add(i64::from(digit - b'0')))
            .ok_or_else(overflow)?;
    }
    for _ in 0..fraction.len() {
        denominator = denominator.checked_mul(10).ok_or_else(overflow)?;
    }
    if negative {
        numerator = -numerator;
    }

    Rational::new(numerator, denominator).ok_or_else(overflow)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

impl FromStr for Rational {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rational::parse(s)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = i128::from(self.numerator) * i128::from(other.denominator);
        let rhs = i128::from(other.numerator) * i128::from(self.denominator);
        lhs.cmp(&rhs)
    }
}

impl From<Rational> for String {
    fn from(value: Rational) -> Self {
        value.to_string()
    }
}

/// On-disk representation: either a bare JSON integer or a rational string
#[derive(Deserialize)]
#[serde(untagged)]
enum RationalRepr {
    Integer(i64),
    Text(String),
}

impl TryFrom<RationalRepr> for Rational {
    type Error = ParseError;

    fn try_from(repr: RationalRepr) -> Result<Self, Self::Error> {
        match repr {
            RationalRepr::Integer(value) => Ok(Rational::from_integer(value)),
            RationalRepr::Text(text) => Rational::parse(&text),
        }
    }
}
