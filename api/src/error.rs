use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use indexer::{PortfolioError, TokenError};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unsupported chain: {0}")]
    UnknownChain(String),
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
    #[error("{message}")]
    Upstream {
        message: &'static str,
        #[source]
        source: TokenError,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::UnknownChain(_) | ApiError::Portfolio(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Upstream { source, .. } => {
                tracing::warn!(error = %source, "upstream read failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
