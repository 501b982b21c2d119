use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub type AppResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("authentication required")]
    Authentication,

    #[error("conversation not found")]
    NotFound,

    // the losing side of a first-create race normally reads the winner's
    // row instead; this only surfaces if that row vanished in between
    #[error("conversation create conflicted")]
    Conflict,

    #[error("storage failure")]
    Persistence(#[from] sqlx::Error),

    #[error("session failure")]
    Session(#[from] tower_sessions::session::Error),
}

impl ChatError {
    fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Authentication => StatusCode::UNAUTHORIZED,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::Conflict => StatusCode::CONFLICT,
            ChatError::Persistence(_) | ChatError::Session(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
