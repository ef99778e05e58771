pub mod allowance;
pub mod balance;
pub mod health;
pub mod portfolio;

use domain::Address;

use crate::error::{ApiError, ApiResult};

/// Query parameters carry raw strings; a missing or malformed address is a 400.
pub(crate) fn require_address(field: &str, raw: Option<&str>) -> ApiResult<Address> {
    let raw = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {field}")))?;
    Address::parse(raw).map_err(|err| ApiError::BadRequest(format!("invalid {field} {raw:?}: {err}")))
}
