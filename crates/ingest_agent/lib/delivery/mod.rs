//! Delivery attempts and their classification into retry policy.

mod attempt;
mod classifier;
mod types;

pub use attempt::run_attempt;
pub use classifier::classify;
pub use types::{
    DeliveryFault, DeliveryOutcome, ExhaustionAction, FaultCause, RetryWindow, TransportFault,
    LONG_RETRY_WINDOW_MS, RETRY_INTERVAL_MS, SHORT_RETRY_ATTEMPTS, TIMEOUT_RETRY_WINDOW_MS,
};
