// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use nils_session::{ErrorKind, NamedError};

/// Wrapper turning taxonomy errors into the HTTP envelope.
#[derive(Debug)]
pub struct ApiError(pub NamedError);

impl From<NamedError> for ApiError {
    fn from(e: NamedError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn not_found(what: &str, id: &str) -> Self {
        Self(NamedError::not_found(what, id))
    }

    fn status(&self) -> StatusCode {
        match self.0.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Busy => StatusCode::CONFLICT,
            ErrorKind::OverflowError => StatusCode::BAD_REQUEST,
            ErrorKind::PermissionDenied | ErrorKind::ToolBlocked => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind.as_str();
        let body = json!({
            "type": kind,
            "error": { "type": kind, "message": self.0.message },
        });
        (self.status(), Json(body)).into_response()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
