use axum::http::StatusCode;

/// Failures a diary submission or lookup can end in.
#[derive(Debug, thiserror::Error)]
pub enum DiaryError {
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DiaryError {
    pub fn status(&self) -> StatusCode {
        match self {
            DiaryError::Transcription(_) | DiaryError::Extraction(_) => StatusCode::BAD_GATEWAY,
            DiaryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DiaryError::NotFound(_) => StatusCode::NOT_FOUND,
            DiaryError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<sqlx::Error> for DiaryError {
    fn from(e: sqlx::Error) -> Self {
        DiaryError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_failure_kind() {
        assert_eq!(
            DiaryError::Transcription("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            DiaryError::Storage("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DiaryError::NotFound("entry 4".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn messages_are_human_readable() {
        let e = DiaryError::NotFound("entry 4".into());
        assert_eq!(e.to_string(), "entry 4 not found");
        let e: DiaryError = sqlx::Error::RowNotFound.into();
        assert!(e.to_string().starts_with("storage failure"));
    }
}
