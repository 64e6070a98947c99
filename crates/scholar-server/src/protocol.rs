//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};

/// Body of `POST /api/execute/cell`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteCellRequest {
    /// Source code to run. Missing or empty is rejected.
    #[serde(default)]
    pub code: Option<String>,
}

/// Result of `POST /api/execute/restart`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RestartResponse {
    Restarted { success: bool, message: String },
    Failed { success: bool, error: String },
}

impl RestartResponse {
    pub fn restarted() -> Self {
        Self::Restarted {
            success: true,
            message: "Kernel restarted successfully".to_string(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            success: false,
            error: error.into(),
        }
    }
}

/// Result of `POST /api/execute/cleanup`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    /// Whether a kernel existed and was torn down.
    pub cleaned: bool,
}

/// Body of `GET /`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub message: &'static str,
    pub status: &'static str,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Body of client errors such as a missing `code`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_restart_shapes() {
        assert_eq!(
            serde_json::to_value(RestartResponse::restarted()).unwrap(),
            json!({"success": true, "message": "Kernel restarted successfully"})
        );
        assert_eq!(
            serde_json::to_value(RestartResponse::failed("boom")).unwrap(),
            json!({"success": false, "error": "boom"})
        );
    }

    #[test]
    fn test_execute_request_code_is_optional() {
        let req: ExecuteCellRequest = serde_json::from_str("{}").unwrap();
        assert!(req.code.is_none());
        let req: ExecuteCellRequest = serde_json::from_str(r#"{"code": "1 + 1"}"#).unwrap();
        assert_eq!(req.code.as_deref(), Some("1 + 1"));
    }
}
