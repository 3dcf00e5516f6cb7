//! Errors raised while checking the input model itself: duplicate record
//! ids, malformed schemas.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
}
