// Failure Classification
// Decides whether a failed execution is worth retrying

use crate::execution::models::ErrorKind;

use std::time::Duration;

/// Log marker a step prints to flag a deterministic failure
pub const DEFAULT_BUSINESS_MARKER: &str = "BUSINESS_ERROR";

/// What is known about a failed execution
#[derive(Debug, Clone)]
pub struct FailureContext<'a> {
    /// "Process" or "Container", used in messages
    pub subject: &'a str,
    pub exit_code: Option<i32>,
    /// Terminating signal, when the process did not exit on its own
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub timeout: Option<Duration>,
    pub logs: &'a str,
}

/// Kind and human readable message for a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub message: String,
}

/// Pluggable failure classification
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, failure: &FailureContext<'_>) -> Classification;
}

/// Classifies by scanning the logs for a marker string.
///
/// Timeouts and signals are always retryable. A non-zero exit is
/// non-retryable when the marker shows up in the logs.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    marker: String,
}

impl MarkerClassifier {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_BUSINESS_MARKER)
    }
}

impl ErrorClassifier for MarkerClassifier {
    fn classify(&self, failure: &FailureContext<'_>) -> Classification {
        if failure.timed_out {
            let message = match failure.timeout {
                Some(limit) => format!("Execution timed out after {} seconds", limit.as_secs()),
                None => "Execution timed out".to_string(),
            };
            return Classification {
                kind: ErrorKind::Retryable,
                message,
            };
        }

        if let Some(signal) = failure.signal {
            let message = if signal == 9 {
                format!(
                    "{} was killed (timeout or resource limit exceeded)",
                    failure.subject
                )
            } else {
                format!("{} terminated by signal {}", failure.subject, signal)
            };
            return Classification {
                kind: ErrorKind::Retryable,
                message,
            };
        }

        let code = failure
            .exit_code
            .map_or_else(|| "unknown".to_string(), |c| c.to_string());

        if !self.marker.is_empty() && failure.logs.contains(&self.marker) {
            Classification {
                kind: ErrorKind::NonRetryable,
                message: format!(
                    "{} failed with exit code {} (business error)",
                    failure.subject, code
                ),
            }
        } else {
            Classification {
                kind: ErrorKind::Retryable,
                message: format!("{} failed with exit code {}", failure.subject, code),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(logs: &str) -> FailureContext<'_> {
        FailureContext {
            subject: "Process",
            exit_code: Some(1),
            signal: None,
            timed_out: false,
            timeout: Some(Duration::from_secs(60)),
            logs,
        }
    }

    #[test]
    fn test_plain_exit_is_retryable() {
        let c = MarkerClassifier::default().classify(&failure("Traceback: connection reset"));
        assert_eq!(c.kind, ErrorKind::Retryable);
        assert_eq!(c.message, "Process failed with exit code 1");
    }

    #[test]
    fn test_marker_is_non_retryable() {
        let c = MarkerClassifier::default().classify(&failure("BUSINESS_ERROR: bad schema"));
        assert_eq!(c.kind, ErrorKind::NonRetryable);
        assert!(c.message.contains("exit code 1"));
    }

    #[test]
    fn test_custom_marker() {
        let classifier = MarkerClassifier::new("FATAL_INPUT");
        assert_eq!(
            classifier.classify(&failure("BUSINESS_ERROR")).kind,
            ErrorKind::Retryable
        );
        assert_eq!(
            classifier.classify(&failure("FATAL_INPUT row 3")).kind,
            ErrorKind::NonRetryable
        );
    }

    #[test]
    fn test_timeout_wins_over_marker() {
        let mut ctx = failure("BUSINESS_ERROR");
        ctx.timed_out = true;
        ctx.signal = Some(15);

        let c = MarkerClassifier::default().classify(&ctx);
        assert_eq!(c.kind, ErrorKind::Retryable);
        assert_eq!(c.message, "Execution timed out after 60 seconds");
    }

    #[test]
    fn test_signals() {
        let mut ctx = failure("");
        ctx.exit_code = None;
        ctx.signal = Some(9);
        assert!(MarkerClassifier::default()
            .classify(&ctx)
            .message
            .contains("was killed"));

        ctx.signal = Some(15);
        ctx.subject = "Container";
        assert_eq!(
            MarkerClassifier::default().classify(&ctx).message,
            "Container terminated by signal 15"
        );
    }
}
