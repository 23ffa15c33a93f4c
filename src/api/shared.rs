use actix_web::error::InternalError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Serialize)]
pub struct APIError {
    pub cause: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseType<T = String> {
    pub data: Option<T>,
    pub error: Option<APIError>,
}

fn error_body(status: StatusCode, cause: &str, message: String) -> HttpResponse {
    HttpResponse::build(status).json(ResponseType::<String> {
        data: None,
        error: Some(APIError {
            cause: cause.to_string(),
            message,
        }),
    })
}

/// Handler-level rejection (bad input, limits) in the common error envelope.
pub fn parse_error(status: StatusCode, cause: &str, message: impl Into<String>) -> actix_web::Error {
    let message = message.into();
    let response = error_body(status, cause, message.clone());
    InternalError::from_response(message, response).into()
}

impl Error {
    fn code(&self) -> &'static str {
        match self {
            Error::StorageWrite(_) => "storage_write",
            Error::StorageRead(_) => "storage_read",
            Error::MetadataStore(_) => "metadata_store",
            Error::NotFound(_) => "not_found",
            Error::Probe(_) => "probe",
            Error::Extraction(_) => "extraction",
            Error::Cancelled => "cancelled",
            Error::QueueClosed => "queue_closed",
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            log::error!("Request failed: {}", self);
        }
        error_body(self.status_code(), self.code(), self.to_string())
    }
}
