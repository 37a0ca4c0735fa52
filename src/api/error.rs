use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::fmt;
use std::io::Cursor;

#[derive(Debug, Clone)]
pub enum AuthError {
    InvalidCredentials(String),
    InsufficientPermission,
    Unreachable(String),
    UnexpectedResponse(String),
}

#[derive(Debug, Clone)]
pub enum ApiError {
    Unauthorized,
    Unreachable(String),
    Malformed(String),
    InsufficientPermission,
    UnexpectedStatus(u16),
    Auth(AuthError),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidCredentials(s) => write!(f, "invalid credentials: {}", s),
            AuthError::InsufficientPermission => write!(
                f,
                "account lacks installer permission required to control production"
            ),
            AuthError::Unreachable(s) => write!(f, "authentication service unreachable: {}", s),
            AuthError::UnexpectedResponse(s) => {
                write!(f, "unexpected authentication response: {}", s)
            }
        }
    }
}

impl std::error::Error for AuthError {}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "token rejected by Envoy"),
            ApiError::Unreachable(s) => write!(f, "Envoy unreachable: {}", s),
            ApiError::Malformed(s) => write!(f, "malformed Envoy response: {}", s),
            ApiError::InsufficientPermission => write!(
                f,
                "account lacks installer permission required to control production"
            ),
            ApiError::UnexpectedStatus(code) => write!(f, "Envoy responded {}", code),
            ApiError::Auth(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InsufficientPermission => ApiError::InsufficientPermission,
            e => ApiError::Auth(e),
        }
    }
}

pub(crate) fn html_error(status: Status, title: &str, detail: &str) -> response::Result<'static> {
    let error = format!(
        "<html><body><h3>{} {}</h3><code>{}</code></body></html>",
        status.code, title, detail
    );
    Response::build()
        .status(status)
        .sized_body(error.len(), Cursor::new(error))
        .header(ContentType::new("text", "html"))
        .ok()
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        match self {
            ApiError::InsufficientPermission => {
                html_error(Status::Forbidden, "Forbidden", &self.to_string())
            }
            ApiError::Unauthorized | ApiError::Auth(AuthError::InvalidCredentials(_)) => {
                html_error(Status::Unauthorized, "Unauthorized", &self.to_string())
            }
            ApiError::Unreachable(_)
            | ApiError::Malformed(_)
            | ApiError::UnexpectedStatus(_)
            | ApiError::Auth(_) => html_error(Status::BadGateway, "Bad Gateway", &self.to_string()),
        }
    }
}
