use crate::scene::{MAX_BLAS_COUNT, MAX_TLAS_COUNT};

/// Errors surfaced by scene mutation, build and query operations.
///
/// No error is retryable. A failed [`Context::update`](crate::Context::update)
/// leaves pre-existing structures valid, except for backend upload failures,
/// where the affected BLAS stays marked unbuilt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot create more than {MAX_BLAS_COUNT} BLAS")]
    BlasCapacity,
    #[error("cannot create more than {MAX_TLAS_COUNT} TLAS")]
    TlasCapacity,
    #[error("invalid ADS handle")]
    InvalidAdsHandle,
    #[error("invalid BLAS handle")]
    InvalidBlasHandle,
    #[error("invalid TLAS handle")]
    InvalidTlasHandle,
    #[error("invalid position buffer")]
    InvalidPositionBuffer,
    #[error("invalid index buffer")]
    InvalidIndexBuffer,
    #[error("invalid attribute buffer")]
    InvalidAttributeBuffer,
    #[error("invalid transformation matrix")]
    InvalidTransform,
    #[error("invalid instance id {0}")]
    InvalidInstanceId(u32),
    #[error("invalid buffer dimensions")]
    InvalidDimensions,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("build precondition violated: {0}")]
    BuildPrecondition(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
