//! Error types for the region store.
//!
//! Region reads are the only fallible boundary the store crosses: a backend
//! may fail with an I/O error or reject a request it cannot serve. Worker
//! failures are logged and reduced to an absent tile rather than propagated
//! (a missing tile is repaired by the next repaint, not by the caller).

use thiserror::Error;

/// Errors produced when reading a region from an image server.
#[derive(Debug, Error)]
pub enum RegionStoreError {
    /// Underlying I/O failure while reading image data.
    #[error("region read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The image server rejected or could not fulfil the request.
    #[error("image server error: {0}")]
    Server(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err: RegionStoreError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "slide.svs").into();
        let msg = err.to_string();
        assert!(msg.contains("region read failed"));
        assert!(msg.contains("slide.svs"));
    }

    #[test]
    fn server_error_display() {
        let err = RegionStoreError::Server("unsupported plane".to_string());
        assert_eq!(err.to_string(), "image server error: unsupported plane");
    }

    #[test]
    fn error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<RegionStoreError>();
    }
}
