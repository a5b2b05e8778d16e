use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};

use crate::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<ChatError>() {
            return (status_for(err), Json(err.body())).into_response();
        }

        tracing::error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub(crate) fn status_for(err: &ChatError) -> StatusCode {
    use ChatError::*;
    match err {
        MissingIdentity | InvalidIdentity(_) | InvalidRoomName | EmptyMessage => StatusCode::BAD_REQUEST,
        NotInRoom(_) | NotAuthorized(_) => StatusCode::FORBIDDEN,
        NotFound(_) => StatusCode::NOT_FOUND,
        AlreadyExists(_) => StatusCode::CONFLICT,
        StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
