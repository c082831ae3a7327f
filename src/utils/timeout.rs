//! Timeout helpers and default durations.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for connect and discovery steps.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a job may wait for its reply before timing out.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the job-expiry sweep.
pub const JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Heartbeat interval used until the server negotiates one.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(9);

/// Time allowed for a graceful disconnect to flush.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `future` with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Like [`with_timeout`] for fallible futures, flattening the result.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(future, duration).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires() {
        let result = with_timeout(tokio::time::sleep(Duration::from_secs(10)), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_is_kept() {
        let result: Result<()> = with_timeout_error(
            async { Err(ProtocolError::ConnectionClosed) },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
