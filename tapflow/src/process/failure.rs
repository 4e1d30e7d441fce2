use serde::{Deserialize, Serialize};

use crate::process::supervisor::ConnectorRole;

/// Prefix of a stderr line carrying a structured fault reported by a connector.
pub const FAULT_MARKER: &str = "TAPFLOW_FAULT";

/// First line of a traceback printed by Python based connectors.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// Fault as reported by a connector on its stderr.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportedFault {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// Parses a `TAPFLOW_FAULT {...}` line. Returns `None` for any other line.
pub fn parse_fault_line(line: &str) -> Option<ReportedFault> {
    let payload = line.trim().strip_prefix(FAULT_MARKER)?;

    serde_json::from_str(payload.trim()).ok()
}

/// Description of why a connector process failed, carried across the process boundary as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub role: ConnectorRole,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Whether the connector reported the fault itself instead of it being synthesized.
    pub reported: bool,
}

impl FailureSummary {
    pub fn from_reported(
        role: ConnectorRole,
        fault: ReportedFault,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) -> Self {
        Self {
            role,
            kind: fault.kind,
            message: fault.message,
            traceback: fault.traceback,
            exit_code,
            signal,
            reported: true,
        }
    }

    /// Builds a summary from the exit status and the last stderr lines of the process.
    ///
    /// The traceback starts at the last [`TRACEBACK_MARKER`] of the tail. The last non blank
    /// line is used as the message, and its `Kind: message` prefix as the kind when it has one.
    pub fn synthesize(
        role: ConnectorRole,
        stderr_tail: &[String],
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) -> Self {
        let traceback = stderr_tail
            .iter()
            .rposition(|line| line.trim_start().starts_with(TRACEBACK_MARKER))
            .map(|start| stderr_tail[start..].join("\n"));

        let last_line = stderr_tail
            .iter()
            .rev()
            .map(|line| line.trim())
            .find(|line| !line.is_empty());

        let (kind, message) = match last_line.and_then(split_exception_line) {
            Some((kind, message)) => (kind.to_string(), message.to_string()),
            None => {
                let kind = if signal.is_some() { "Signal" } else { "NonZeroExit" };
                let message = match (last_line, exit_code, signal) {
                    (Some(line), _, _) => line.to_string(),
                    (None, _, Some(signal)) => format!("terminated by signal {signal}"),
                    (None, Some(code), None) => format!("exited with code {code}"),
                    (None, None, None) => "exited without status".to_string(),
                };
                (kind.to_string(), message)
            }
        };

        Self {
            role,
            kind,
            message,
            traceback,
            exit_code,
            signal,
            reported: false,
        }
    }
}

/// Splits `ValueError: bad input` into its kind and message.
///
/// The kind must look like a dotted identifier, so ordinary sentences containing a colon are
/// not mistaken for exceptions.
fn split_exception_line(line: &str) -> Option<(&str, &str)> {
    let (kind, message) = line.split_once(':')?;
    let is_identifier = !kind.is_empty()
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    is_identifier.then(|| (kind, message.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn parses_reported_fault() {
        let fault = parse_fault_line(
            r#"TAPFLOW_FAULT {"kind": "ConnectionError", "message": "refused", "traceback": "tb"}"#,
        )
        .unwrap();

        assert_eq!(fault.kind, "ConnectionError");
        assert_eq!(fault.message, "refused");
        assert_eq!(fault.traceback.as_deref(), Some("tb"));
        assert!(parse_fault_line("INFO starting sync").is_none());
        assert!(parse_fault_line("TAPFLOW_FAULT not json").is_none());
    }

    #[test]
    fn synthesizes_from_the_last_traceback() {
        let tail = lines(
            "Traceback (most recent call last):\n  old frame\nKeyError: 'a'\nretrying\n\
             Traceback (most recent call last):\n  File \"tap.py\", line 3\nValueError: bad row\n",
        );

        let summary = FailureSummary::synthesize(ConnectorRole::Extractor, &tail, Some(1), None);

        assert_eq!(summary.kind, "ValueError");
        assert_eq!(summary.message, "bad row");
        assert_eq!(
            summary.traceback.as_deref(),
            Some("Traceback (most recent call last):\n  File \"tap.py\", line 3\nValueError: bad row")
        );
        assert!(!summary.reported);
    }

    #[test]
    fn synthesizes_from_exit_status_without_output() {
        let summary = FailureSummary::synthesize(ConnectorRole::Loader, &[], None, Some(9));

        assert_eq!(summary.kind, "Signal");
        assert_eq!(summary.message, "terminated by signal 9");
        assert_eq!(summary.traceback, None);
    }

    #[test]
    fn plain_sentences_are_not_exception_kinds() {
        let tail = lines("could not connect: timeout");

        let summary = FailureSummary::synthesize(ConnectorRole::Loader, &tail, Some(2), None);

        assert_eq!(summary.kind, "NonZeroExit");
        assert_eq!(summary.message, "could not connect: timeout");
    }
}
