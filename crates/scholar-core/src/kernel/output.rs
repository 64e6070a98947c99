//! Client-facing execution results.
//!
//! These shapes are the JSON contract consumed by the notebook frontend:
//!
//! - success: `{"success": true, "outputs": [...]}`
//! - failure: `{"success": false, "error": "..."}`

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// MIME type to payload mapping, e.g. `{"text/plain": "42"}`.
pub type MimeBundle = serde_json::Map<String, serde_json::Value>;

/// One output produced by a cell, in the order the kernel emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellOutput {
    /// Text written to stdout or stderr.
    Stream { name: String, text: String },

    /// Value of the cell's trailing expression.
    ExecuteResult {
        data: MimeBundle,
        execution_count: Option<i64>,
    },

    /// Rich output published with `display()`.
    DisplayData { data: MimeBundle },

    /// Exception raised by user code. Still a successful round-trip.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl CellOutput {
    /// Convenience constructor for a stdout stream chunk.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream {
            name: "stdout".to_string(),
            text: text.into(),
        }
    }

    /// Whether this output reports an exception.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// The kernel reported idle. May contain in-band `error` outputs.
    Completed { outputs: Vec<CellOutput> },

    /// The execution timeout elapsed before idle; carries what arrived so far.
    TimedOut { outputs: Vec<CellOutput> },

    /// The round-trip itself failed (kernel unavailable, channel broke).
    Failed { error: String },
}

impl ExecutionResult {
    /// Whether the result serializes with `success: true`.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Outputs collected, empty for failures.
    pub fn outputs(&self) -> &[CellOutput] {
        match self {
            Self::Completed { outputs } | Self::TimedOut { outputs } => outputs,
            Self::Failed { .. } => &[],
        }
    }

    /// Wrapper-level error message, if the round-trip failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Whether collection was cut short by the execution timeout.
    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Concatenated text of all stdout stream outputs.
    pub fn stdout_text(&self) -> String {
        self.outputs()
            .iter()
            .filter_map(|o| match o {
                CellOutput::Stream { name, text } if name == "stdout" => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

// A timeout serializes exactly like a completion: callers render partial output.
impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        match self {
            Self::Completed { outputs } | Self::TimedOut { outputs } => {
                map.serialize_entry("success", &true)?;
                map.serialize_entry("outputs", outputs)?;
            }
            Self::Failed { error } => {
                map.serialize_entry("success", &false)?;
                map.serialize_entry("error", error)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completed_shape() {
        let result = ExecutionResult::Completed {
            outputs: vec![CellOutput::stdout("hi\n")],
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": true, "outputs": [{"type": "stream", "name": "stdout", "text": "hi\n"}]})
        );
    }

    #[test]
    fn test_timed_out_looks_like_success() {
        let result = ExecutionResult::TimedOut {
            outputs: vec![CellOutput::stdout("partial")],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["outputs"][0]["text"], "partial");
        assert!(result.timed_out());
    }

    #[test]
    fn test_failed_shape() {
        let result = ExecutionResult::Failed {
            error: "kernel channel error: broken pipe".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"success": false, "error": "kernel channel error: broken pipe"})
        );
        assert!(result.outputs().is_empty());
    }

    #[test]
    fn test_error_output_shape() {
        let output = CellOutput::Error {
            ename: "NameError".to_string(),
            evalue: "name 'y' is not defined".to_string(),
            traceback: vec!["NameError: name 'y' is not defined".to_string()],
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["ename"], "NameError");
        assert_eq!(value["traceback"][0], "NameError: name 'y' is not defined");
        assert!(output.is_error());
    }

    #[test]
    fn test_display_data_shape() {
        let mut data = MimeBundle::new();
        data.insert("text/html".to_string(), json!("<b>hi</b>"));
        let value = serde_json::to_value(CellOutput::DisplayData { data }).unwrap();
        assert_eq!(value, json!({"type": "display_data", "data": {"text/html": "<b>hi</b>"}}));
    }

    #[test]
    fn test_stdout_text_ignores_stderr() {
        let result = ExecutionResult::Completed {
            outputs: vec![
                CellOutput::stdout("a"),
                CellOutput::Stream {
                    name: "stderr".to_string(),
                    text: "warn".to_string(),
                },
                CellOutput::stdout("b"),
            ],
        };
        assert_eq!(result.stdout_text(), "ab");
    }
}
