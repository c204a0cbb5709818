use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::types::DeliveryFault;

/// Runs one delivery attempt on its own task and waits for it or for `cancel`.
///
/// On cancellation the task is aborted and left behind rather than awaited, so a stuck
/// network call cannot hold up the caller. A panicking attempt surfaces as
/// `DeliveryFault::Unrecognized`.
pub async fn run_attempt<T, F>(attempt: F, cancel: &CancellationToken) -> Result<T, DeliveryFault>
where
    T: Send + 'static,
    F: Future<Output = Result<T, DeliveryFault>> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(DeliveryFault::Cancelled);
    }

    let mut handle = tokio::spawn(attempt);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            handle.abort();
            tracing::debug!(event = "delivery_attempt_abandoned", "abandoned delivery attempt after cancellation");
            Err(DeliveryFault::Cancelled)
        }
        joined = &mut handle => match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(DeliveryFault::Cancelled),
            Err(err) => Err(DeliveryFault::Unrecognized {
                message: format!("delivery attempt task failed: {err}"),
            }),
        },
    }
}
