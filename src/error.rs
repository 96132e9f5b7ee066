//! # HTTP Error Handling
//!
//! Errors returned by the query endpoints and how they become JSON responses:
//!
//! ```json
//! { "error": { "type": "not_found", "message": "...", "timestamp": "..." } }
//! ```
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### `thiserror`
//! - **`#[derive(Error)]`**: generates `std::error::Error` for the enum
//! - **`#[error("...")]`**: generates `Display`, with `{0}` standing for the variant's field
//!
//! ### Traits for Error Conversion
//! - **`From<MailboxError>`**: lets handlers write `bridge.send(msg).await?` and
//!   get an [`AppError`] when the actor is gone
//! - **`ResponseError`**: actix-web calls it to turn an `Err` returned by a
//!   handler into an HTTP response

use actix::MailboxError;                      // Failure of `Addr::send` (actor stopped or mailbox closed)
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError}; // Web framework error handling
use serde_json::json;                         // For building the JSON error body
use thiserror::Error;

/// Errors returned by the HTTP endpoints.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: the request body makes no sense, e.g. an empty config update (400)
/// - **NotFound**: unknown or offline device (404)
/// - **Unavailable**: the bridge actor stopped, normally during shutdown (503)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::NotFound(format!("Device {} not found", device_id)));
/// ```
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The bridge actor is gone (shutting down)
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    /// Status code, machine-readable `type`, and message of the JSON body.
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<MailboxError> for AppError {
    fn from(err: MailboxError) -> Self {
        AppError::Unavailable(format!("bridge not reachable: {}", err))
    }
}

/// Return type of every HTTP handler: `Ok` is the response, `Err` becomes a JSON error.
pub type AppResult<T> = Result<T, AppError>;
