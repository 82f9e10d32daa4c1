use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use collab_core::CollabError;
use tracing::error;

/// A `CollabError` rendered as an HTTP response with a JSON body.
#[derive(Debug)]
pub struct ApiError(pub CollabError);

impl From<CollabError> for ApiError {
    fn from(err: CollabError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CollabError::VersionNotFound(_) => StatusCode::NOT_FOUND,
            CollabError::Authorization(_) => StatusCode::UNAUTHORIZED,
            CollabError::EmptyDocument { .. }
            | CollabError::MalformedOperation(_)
            | CollabError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        (status, Json(self.0.to_serializable())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(CollabError::VersionNotFound(3)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(CollabError::Authorization("no".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(CollabError::EmptyDocument {
                since_version: None
            })
            .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError(CollabError::Storage("disk".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
