//! Offload primitive for blocking work.
//!
//! All filesystem persistence goes through this helper so the async reactor
//! never issues blocking syscalls directly.

use crate::error::{GatewayError, GatewayResult};

pub async fn offload<T, F>(f: F) -> GatewayResult<T>
where
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GatewayError::Persistence(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offload_returns_value() {
        let out = offload(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_offload_propagates_error() {
        let out: GatewayResult<()> =
            offload(|| Err(GatewayError::Persistence("boom".into()))).await;
        assert!(out.is_err());
    }
}
