use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("station API error: {0}")]
    ApiError(String),
    #[error("station API responded {0}: {1}")]
    HttpStatus(u16, String),
    #[error("station API rate limit exceeded: {0}")]
    RateExceeded(String),
    #[error("invalid response ({1}): {0}")]
    InvalidResponse(String, String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("state store error: {0}")]
    Store(String),
    #[error("delivery to {instance} failed: {reason}")]
    Delivery { instance: String, reason: String },
    #[error("unknown station: {0}")]
    UnknownStation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("format error")]
    FormatError,
    #[error("internal error")]
    InternalError,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidResponse(e.to_string(), String::from("JSON (de)serialization failed"))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

fn html(status: Status, title: &str, body: String) -> response::Result<'static> {
    let error = format!(
        "<html><body><h3>{}</h3><code>{}</code></body></html>",
        title, body
    );
    Response::build()
        .status(status)
        .sized_body(error.len(), Cursor::new(error))
        .header(ContentType::new("text", "html"))
        .ok()
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        match self {
            Error::RateExceeded(s) => html(Status::TooManyRequests, "429 Too Many Requests", s),
            Error::UnknownStation(s) => html(Status::NotFound, "404 Unknown station", s),
            Error::ApiError(_) | Error::HttpStatus(_, _) | Error::Timeout(_) => html(
                Status::ServiceUnavailable,
                "503 Station API unavailable",
                self.to_string(),
            ),
            _ => html(
                Status::InternalServerError,
                "Unknown exception",
                format!("{:?}", self),
            ),
        }
    }
}
