//! Cancellation plumbing for backend calls.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::error::StorageError;

/// Runs `fut` unless `cancel` fires first.
///
/// Dropping `fut` on cancellation aborts the in-flight backend call.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, async { Ok::<_, StorageError>(7) }).await;
        assert_eq!(value.expect("completes"), 7);
    }

    #[tokio::test]
    async fn test_cancelled_token_wins_over_ready_future() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok::<_, StorageError>(7) }).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, StorageError>(())
        })
        .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }
}
