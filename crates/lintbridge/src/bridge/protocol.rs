//! Wire protocol types for parent-worker communication.
//!
//! Every payload travels inside a frame (see [`super::codec`]):
//! - Handshake: parent sends `"ready?"`, worker answers `"ready"`. The worker
//!   also announces `"booting"` on its own when it starts reading input.
//! - Lint: parent sends a [`LintInput`], worker answers with a [`LintResponse`]
//!   carrying the same `sequenceNumber`.

use serde::{Deserialize, Serialize};

/// Handshake probe sent by the parent.
pub const READY_PROBE: &str = "ready?";
/// Worker's answer to the probe.
pub const READY: &str = "ready";
/// Worker's unsolicited start-up announcement.
pub const BOOTING: &str = "booting";

pub const DEFAULT_FILE_NAME: &str = "target.css";

/// True for either handshake reply.
pub fn is_handshake_reply(msg: &serde_json::Value) -> bool {
    matches!(msg.as_str(), Some(READY) | Some(BOOTING))
}

/// Sequence number of a decoded message, if it carries one.
pub fn response_sequence(msg: &serde_json::Value) -> Option<u64> {
    msg.get("sequenceNumber")?.as_u64()
}

/// What the UI asks to lint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintRequest {
    pub code: String,
    pub config: String,
}

impl LintRequest {
    pub fn new(code: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            config: config.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Json,
}

/// Lint request as sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintInput {
    pub sequence_number: u64,
    pub code: String,
    pub file_name: String,
    pub config: String,
    pub config_format: ConfigFormat,
}

impl LintInput {
    pub fn new(sequence_number: u64, request: &LintRequest, file_name: impl Into<String>) -> Self {
        Self {
            sequence_number,
            code: request.code.clone(),
            file_name: file_name.into(),
            config: request.config.clone(),
            config_format: ConfigFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One diagnostic reported by the lint engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub column: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<i64>,
    #[serde(default)]
    pub rule: String,
    pub severity: Severity,
    pub text: String,
}

/// 1-based source range of a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

fn positive_or(value: Option<i64>, fallback: u32) -> u32 {
    value
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(fallback)
}

impl Warning {
    /// Range suitable for editor markers. Missing or non-positive starts become
    /// 1; missing ends collapse onto the start.
    pub fn span(&self) -> Span {
        let start_line = positive_or(Some(self.line), 1);
        let start_column = positive_or(Some(self.column), 1);
        Span {
            start_line,
            start_column,
            end_line: positive_or(self.end_line, start_line),
            end_column: positive_or(self.end_column, start_column),
        }
    }

    pub fn doc_url(&self) -> Option<String> {
        if self.rule.is_empty() {
            None
        } else {
            Some(format!("https://stylelint.io/user-guide/rules/{}", self.rule))
        }
    }
}

/// Engine report for one file. Fields the bridge does not use are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LintReport {
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of one lint run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum LintResult {
    Success {
        result: LintReport,
        fix_result: LintReport,
        /// Source text after auto-fix.
        output: String,
    },
    /// Reported by the worker (bad config, engine exception). Not a channel error.
    Failure { message: String },
}

impl LintResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Lint response as sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLintResponse", into = "RawLintResponse")]
pub struct LintResponse {
    pub sequence_number: u64,
    pub result: LintResult,
}

/// `exit` is an integer tag, which serde's enum representations cannot express.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLintResponse {
    sequence_number: u64,
    exit: u8,
    result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fix_result: Option<LintReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("unknown exit code {0}")]
    UnknownExit(u8),
    #[error("success response missing {0}")]
    MissingField(&'static str),
    #[error("invalid lint report: {0}")]
    Report(#[from] serde_json::Error),
    #[error("failure response must carry a string message")]
    FailureMessage,
}

impl TryFrom<RawLintResponse> for LintResponse {
    type Error = ResponseError;

    fn try_from(raw: RawLintResponse) -> Result<Self, Self::Error> {
        let result = match raw.exit {
            0 => LintResult::Success {
                result: serde_json::from_value(raw.result)?,
                fix_result: raw.fix_result.ok_or(ResponseError::MissingField("fixResult"))?,
                output: raw.output.ok_or(ResponseError::MissingField("output"))?,
            },
            1 => match raw.result {
                serde_json::Value::String(message) => LintResult::Failure { message },
                _ => return Err(ResponseError::FailureMessage),
            },
            other => return Err(ResponseError::UnknownExit(other)),
        };
        Ok(Self {
            sequence_number: raw.sequence_number,
            result,
        })
    }
}

impl From<LintResponse> for RawLintResponse {
    fn from(response: LintResponse) -> Self {
        match response.result {
            LintResult::Success {
                result,
                fix_result,
                output,
            } => Self {
                sequence_number: response.sequence_number,
                exit: 0,
                result: serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
                fix_result: Some(fix_result),
                output: Some(output),
            },
            LintResult::Failure { message } => Self {
                sequence_number: response.sequence_number,
                exit: 1,
                result: serde_json::Value::String(message),
                fix_result: None,
                output: None,
            },
        }
    }
}
