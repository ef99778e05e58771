use std::fmt;

use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{ser::SerializeStruct, Serialize, Serializer};
use thiserror::Error;

/// Fractional digits kept on USD values.
pub const USD_VALUE_SCALE: u32 = 8;

const MAX_DECIMAL_SCALE: u32 = 28;
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitsError {
    #[error("amount is empty")]
    Empty,
    #[error("amount {0:?} is not a decimal number")]
    Malformed(String),
    #[error("amount has {found} fractional digits, token allows {allowed}")]
    TooPrecise { found: usize, allowed: u8 },
    #[error("amount does not fit in 256 bits")]
    Overflow,
}

/// A raw on-chain integer read through the token's `decimals`.
///
/// Holds the integer and the exponent rather than a lossy float, so the textual
/// form is exact at any precision and converting back recovers the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormattedBalance {
    raw: U256,
    decimals: u8,
}

impl FormattedBalance {
    pub fn new(raw: U256, decimals: u8) -> Self {
        Self { raw, decimals }
    }

    pub fn raw(&self) -> U256 {
        self.raw
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn is_zero(&self) -> bool {
        self.raw.is_zero()
    }

    /// Exact decimal text with trailing fractional zeros removed ("1.5", "0", "12").
    pub fn amount(&self) -> String {
        let digits = self.raw.to_string();
        let scale = self.decimals as usize;
        let (integer, fraction) = if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            (int.to_string(), frac.to_string())
        } else {
            ("0".to_string(), format!("{digits:0>scale$}"))
        };
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            integer
        } else {
            format!("{integer}.{fraction}")
        }
    }

    /// Best decimal approximation for arithmetic.
    ///
    /// Exact whenever the value fits 96 bits of mantissa with at most 28
    /// fractional digits; otherwise the least significant digits are truncated.
    pub fn to_decimal(&self) -> Option<Decimal> {
        let ten = U256::from(10u8);
        let mut mantissa = self.raw;
        let mut scale = self.decimals as u32;
        while scale > MAX_DECIMAL_SCALE || mantissa > U256::from(MAX_DECIMAL_MANTISSA) {
            if scale == 0 {
                return None;
            }
            mantissa /= ten;
            scale -= 1;
        }
        Decimal::try_from_i128_with_scale(mantissa.low_u128() as i128, scale).ok()
    }

    /// `amount * unit_price`, rounded to [`USD_VALUE_SCALE`] places.
    pub fn value_at(&self, unit_price: Decimal) -> Option<Decimal> {
        self.to_decimal()?
            .checked_mul(unit_price)
            .map(|value| value.round_dp(USD_VALUE_SCALE))
    }

    /// Inverse of [`FormattedBalance::amount`]: scales decimal text by `10^decimals`.
    pub fn parse(text: &str, decimals: u8) -> Result<U256, UnitsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(UnitsError::Empty);
        }
        let (integer, fraction) = text.split_once('.').unwrap_or((text, ""));
        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (integer.is_empty() && fraction.is_empty()) || !all_digits(integer) || !all_digits(fraction)
        {
            return Err(UnitsError::Malformed(text.to_string()));
        }
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > decimals as usize {
            return Err(UnitsError::TooPrecise {
                found: fraction.len(),
                allowed: decimals,
            });
        }
        let scale = decimals as usize;
        let digits = format!("{integer}{fraction:0<scale$}");
        let digits = digits.trim_start_matches('0');
        if digits.is_empty() {
            return Ok(U256::zero());
        }
        U256::from_dec_str(digits).map_err(|_| UnitsError::Overflow)
    }
}

impl fmt::Display for FormattedBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.amount())
    }
}

impl Serialize for FormattedBalance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FormattedBalance", 3)?;
        state.serialize_field("raw", &self.raw.to_string())?;
        state.serialize_field("decimals", &self.decimals)?;
        state.serialize_field("amount", &self.amount())?;
        state.end()
    }
}
