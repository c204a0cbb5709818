use std::io;

use super::types::{
    DeliveryFault, DeliveryOutcome, ExhaustionAction, FaultCause, RetryWindow, TransportFault,
    LONG_RETRY_WINDOW_MS, RETRY_INTERVAL_MS, SHORT_RETRY_ATTEMPTS, TIMEOUT_RETRY_WINDOW_MS,
};

/// Server-error messages carrying this text mean the destination's content extractor choked
/// on the payload, so resending it can never succeed.
const CONTENT_PARSE_SIGNATURES: &[&str] = &["TikaException"];

/// Descriptions of dropped connections for transports that expose no structured kind.
const DROPPED_CONNECTION_SIGNATURES: &[&str] = &[
    "broken pipe",
    "connection reset",
    "target server failed to respond",
];

const EMBEDDED_STATUS_PREFIX: &str = "non ok status:";

/// Maps the raw result of one attempt to a retry policy. Pure: the only input besides the
/// result is `now_ms`.
pub fn classify(result: &Result<(), DeliveryFault>, now_ms: i64) -> DeliveryOutcome {
    let fault = match result {
        Ok(()) => return DeliveryOutcome::Success,
        Err(fault) => fault,
    };

    match fault {
        DeliveryFault::Cancelled | DeliveryFault::Transport(TransportFault::Interrupted(_)) => {
            DeliveryOutcome::Interrupted
        }
        DeliveryFault::Status {
            code,
            message,
            cause,
        } => {
            let code = if *code == 0 {
                match embedded_status_code(message) {
                    Some(code) => code,
                    None => {
                        return DeliveryOutcome::Fatal {
                            reason: format!("status-less destination failure: {message}"),
                        }
                    }
                }
            } else {
                *code
            };
            classify_status(code, message, *cause, now_ms)
        }
        DeliveryFault::Internal { message, cause } => match cause {
            Some(FaultCause::ContentParse) => DeliveryOutcome::PermanentReject {
                reason: format!("destination could not parse the document: {message}"),
            },
            Some(FaultCause::Timeout) => DeliveryOutcome::Retry(window(
                now_ms,
                Some(LONG_RETRY_WINDOW_MS),
                None,
                ExhaustionAction::AbortJob,
                format!("destination client timed out: {message}"),
            )),
            _ => DeliveryOutcome::Fatal {
                reason: format!("destination client failure: {message}"),
            },
        },
        DeliveryFault::Transport(transport) => classify_transport(transport, now_ms),
        DeliveryFault::Unrecognized { message } => DeliveryOutcome::Fatal {
            reason: format!("unrecognized delivery failure: {message}"),
        },
    }
}

fn classify_status(
    code: u16,
    message: &str,
    cause: Option<FaultCause>,
    now_ms: i64,
) -> DeliveryOutcome {
    match code {
        400..=499 => DeliveryOutcome::PermanentReject {
            reason: format!("destination rejected the document with status {code}: {message}"),
        },
        _ if cause == Some(FaultCause::ContentParse) || has_content_parse_signature(message) => {
            DeliveryOutcome::PermanentReject {
                reason: format!("destination could not parse the document (status {code}): {message}"),
            }
        }
        500..=599 => DeliveryOutcome::Retry(window(
            now_ms,
            Some(LONG_RETRY_WINDOW_MS),
            None,
            ExhaustionAction::AbortJob,
            format!("destination server error {code}: {message}"),
        )),
        _ => DeliveryOutcome::Fatal {
            reason: format!("unexpected destination status {code}: {message}"),
        },
    }
}

fn classify_transport(fault: &TransportFault, now_ms: i64) -> DeliveryOutcome {
    match fault {
        TransportFault::Interrupted(_) => DeliveryOutcome::Interrupted,
        TransportFault::ConnectionRefused(message) => DeliveryOutcome::Retry(window(
            now_ms,
            None,
            Some(SHORT_RETRY_ATTEMPTS),
            ExhaustionAction::AbortJob,
            format!("destination refused connection: {message}"),
        )),
        TransportFault::TimedOut(message) => DeliveryOutcome::Retry(window(
            now_ms,
            Some(TIMEOUT_RETRY_WINDOW_MS),
            None,
            ExhaustionAction::SkipDocument,
            format!("destination timed out: {message}"),
        )),
        TransportFault::Io { kind, message } if is_dropped_connection(*kind, message) => {
            DeliveryOutcome::Retry(window(
                now_ms,
                None,
                Some(SHORT_RETRY_ATTEMPTS),
                ExhaustionAction::SkipDocument,
                format!("destination dropped the connection: {message}"),
            ))
        }
        TransportFault::Io { message, .. } => DeliveryOutcome::Retry(window(
            now_ms,
            Some(LONG_RETRY_WINDOW_MS),
            None,
            ExhaustionAction::AbortJob,
            format!("transport failure: {message}"),
        )),
    }
}

fn window(
    now_ms: i64,
    give_up_after_ms: Option<i64>,
    max_attempts: Option<u32>,
    on_exhausted: ExhaustionAction,
    reason: String,
) -> RetryWindow {
    RetryWindow {
        next_attempt_at: now_ms + RETRY_INTERVAL_MS,
        give_up_at: give_up_after_ms.map(|window_ms| now_ms + window_ms),
        max_attempts,
        on_exhausted,
        reason,
    }
}

fn has_content_parse_signature(message: &str) -> bool {
    CONTENT_PARSE_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

// Structured kinds win; the text match covers transports that only give a description.
fn is_dropped_connection(kind: Option<io::ErrorKind>, message: &str) -> bool {
    if matches!(
        kind,
        Some(io::ErrorKind::ConnectionReset)
            | Some(io::ErrorKind::BrokenPipe)
            | Some(io::ErrorKind::ConnectionAborted)
    ) {
        return true;
    }
    let lowered = message.to_ascii_lowercase();
    DROPPED_CONNECTION_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

/// Recovers a status code that a client embedded in its message as `non ok status:NNN,`.
fn embedded_status_code(message: &str) -> Option<u16> {
    let start = message.find(EMBEDDED_STATUS_PREFIX)? + EMBEDDED_STATUS_PREFIX.len();
    let digits: String = message[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if !message[start + digits.len()..].starts_with(',') {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{classify, embedded_status_code};
    use crate::delivery::types::{
        DeliveryFault, DeliveryOutcome, ExhaustionAction, FaultCause, TransportFault,
    };

    const NOW: i64 = 1_700_000_000_000;

    fn retry(fault: DeliveryFault) -> crate::delivery::types::RetryWindow {
        match classify(&Err(fault), NOW) {
            DeliveryOutcome::Retry(window) => window,
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn success_and_cancellation() {
        assert_eq!(classify(&Ok(()), NOW), DeliveryOutcome::Success);
        assert_eq!(
            classify(&Err(DeliveryFault::Cancelled), NOW),
            DeliveryOutcome::Interrupted
        );
        assert_eq!(
            classify(
                &Err(TransportFault::Interrupted("interrupted read".into()).into()),
                NOW
            ),
            DeliveryOutcome::Interrupted
        );
    }

    #[test]
    fn not_found_is_a_permanent_reject() {
        assert!(matches!(
            classify(&Err(DeliveryFault::status(404, "Not Found")), NOW),
            DeliveryOutcome::PermanentReject { .. }
        ));
    }

    #[test]
    fn service_unavailable_retries_for_two_hours() {
        let window = retry(DeliveryFault::status(503, "Service Unavailable"));
        assert_eq!(window.next_attempt_at, NOW + 60_000);
        assert_eq!(window.give_up_at, Some(NOW + 7_200_000));
        assert_eq!(window.max_attempts, None);
        assert_eq!(window.on_exhausted, ExhaustionAction::AbortJob);
        assert!(window.next_attempt_at > NOW && window.next_attempt_at <= NOW + 60_000);
    }

    #[test]
    fn server_error_with_parse_failure_is_rejected() {
        let by_message = DeliveryFault::status(
            500,
            "org.apache.tika.exception.TikaException: Unexpected RuntimeException",
        );
        assert!(matches!(
            classify(&Err(by_message), NOW),
            DeliveryOutcome::PermanentReject { .. }
        ));

        let by_cause = DeliveryFault::Status {
            code: 500,
            message: "extract failed".into(),
            cause: Some(FaultCause::ContentParse),
        };
        assert!(matches!(
            classify(&Err(by_cause), NOW),
            DeliveryOutcome::PermanentReject { .. }
        ));
    }

    #[test]
    fn unexpected_status_is_fatal() {
        assert!(matches!(
            classify(&Err(DeliveryFault::status(302, "Found")), NOW),
            DeliveryOutcome::Fatal { .. }
        ));
    }

    #[test]
    fn parse_failure_with_unexpected_status_is_rejected() {
        let by_cause = DeliveryFault::Status {
            code: 302,
            message: "Found".into(),
            cause: Some(FaultCause::ContentParse),
        };
        assert!(matches!(
            classify(&Err(by_cause), NOW),
            DeliveryOutcome::PermanentReject { .. }
        ));
        assert!(matches!(
            classify(
                &Err(DeliveryFault::status(302, "org.apache.tika.exception.TikaException: bad")),
                NOW
            ),
            DeliveryOutcome::PermanentReject { .. }
        ));
    }

    #[test]
    fn zero_status_is_recovered_from_message() {
        assert_eq!(
            embedded_status_code("Server at http://x returned non ok status:404, message:Not Found"),
            Some(404)
        );
        assert_eq!(embedded_status_code("non ok status:abc,"), None);
        assert!(matches!(
            classify(
                &Err(DeliveryFault::status(0, "non ok status:404, message:Not Found")),
                NOW
            ),
            DeliveryOutcome::PermanentReject { .. }
        ));
        assert!(matches!(
            classify(&Err(DeliveryFault::status(0, "no code here")), NOW),
            DeliveryOutcome::Fatal { .. }
        ));
    }

    #[test]
    fn internal_faults_follow_their_cause() {
        let parse = DeliveryFault::Internal {
            message: "bad payload".into(),
            cause: Some(FaultCause::ContentParse),
        };
        assert!(matches!(
            classify(&Err(parse), NOW),
            DeliveryOutcome::PermanentReject { .. }
        ));

        let window = retry(DeliveryFault::Internal {
            message: "request timed out".into(),
            cause: Some(FaultCause::Timeout),
        });
        assert_eq!(window.give_up_at, Some(NOW + 7_200_000));

        let other = DeliveryFault::Internal {
            message: "null pointer".into(),
            cause: None,
        };
        assert!(matches!(
            classify(&Err(other), NOW),
            DeliveryOutcome::Fatal { .. }
        ));
    }

    #[test]
    fn refused_connection_gets_three_attempts() {
        let window = retry(TransportFault::ConnectionRefused("refused".into()).into());
        assert_eq!(window.next_attempt_at, NOW + 60_000);
        assert_eq!(window.give_up_at, None);
        assert_eq!(window.max_attempts, Some(3));
        assert_eq!(window.on_exhausted, ExhaustionAction::AbortJob);
    }

    #[test]
    fn timeout_retries_for_twenty_minutes() {
        let window = retry(TransportFault::TimedOut("read timed out".into()).into());
        assert_eq!(window.give_up_at, Some(NOW + 1_200_000));
        assert_eq!(window.max_attempts, None);
        assert_eq!(window.on_exhausted, ExhaustionAction::SkipDocument);
    }

    #[test]
    fn dropped_connection_matches_kind_or_text() {
        let by_kind = retry(
            TransportFault::Io {
                kind: Some(io::ErrorKind::BrokenPipe),
                message: "write failed".into(),
            }
            .into(),
        );
        assert_eq!(by_kind.max_attempts, Some(3));
        assert_eq!(by_kind.give_up_at, None);

        let by_text = retry(
            TransportFault::Io {
                kind: None,
                message: "The target server failed to respond".into(),
            }
            .into(),
        );
        assert_eq!(by_text.max_attempts, Some(3));
        assert_eq!(by_text.on_exhausted, ExhaustionAction::SkipDocument);
    }

    #[test]
    fn other_transport_faults_retry_for_two_hours() {
        let window = retry(
            TransportFault::Io {
                kind: Some(io::ErrorKind::Other),
                message: "dns lookup failed".into(),
            }
            .into(),
        );
        assert_eq!(window.give_up_at, Some(NOW + 7_200_000));
        assert_eq!(window.max_attempts, None);
        assert_eq!(window.on_exhausted, ExhaustionAction::AbortJob);
    }

    #[test]
    fn unrecognized_is_fatal_and_classification_is_deterministic() {
        let fault = Err(DeliveryFault::Unrecognized {
            message: "panic".into(),
        });
        assert!(matches!(classify(&fault, NOW), DeliveryOutcome::Fatal { .. }));
        assert_eq!(classify(&fault, NOW), classify(&fault, NOW));
    }
}
