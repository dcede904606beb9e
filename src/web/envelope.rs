//! Uniform `{code, message, data}` response envelope.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::Value;

use crate::db::DbError;
use crate::error::Error;

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Wrap `data` in a success envelope.
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        code: 0,
        message: "ok".to_string(),
        data,
    }))
}

/// A failed request. The envelope code and HTTP status are the same number.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    data: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }

    /// Attach context, such as the current record, to the error envelope.
    pub fn with_data<T: Serialize>(mut self, data: T) -> Self {
        self.data = serde_json::to_value(data).unwrap_or(Value::Null);
        self
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            Error::Unavailable(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Storage(e) => {
                tracing::error!("API: storage failure: {}", e);
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error");
            }
            Error::Internal(msg) => {
                tracing::error!("API: internal failure: {}", msg);
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        Error::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope {
            code: self.status.as_u16(),
            message: self.message,
            data: self.data,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_codes() {
        let cases = [
            (Error::Validation("bad".into()), 400),
            (Error::NotFound("node 'x'".into()), 404),
            (Error::Conflict("dup".into()), 409),
            (Error::Precondition("running".into()), 412),
            (Error::Unavailable("node performance".into()), 501),
            (Error::Timeout(Duration::from_secs(3)), 504),
            (Error::Internal("boom".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).status.as_u16(), code);
        }
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = ApiError::from(Error::Storage(DbError::Poisoned));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal storage error");
    }
}
