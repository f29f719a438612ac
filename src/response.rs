use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// JSON envelope returned by every tool, double-encoded as MCP text content.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Default, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub duration_seconds: f64,
}

/// Serialize f64, clamping non-finite values (NaN, Inf) to 0.0.
fn serialize_finite_f64<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(if v.is_finite() { *v } else { 0.0 })
}

impl ToolMetadata {
    pub fn named(tool_name: &str) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            ..Self::default()
        }
    }
}

impl ToolResponse {
    pub fn success(content: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata,
        }
    }

    /// Structured payload, serialized into `content`.
    pub fn json<T: Serialize>(value: &T, metadata: ToolMetadata) -> Self {
        match serde_json::to_string(value) {
            Ok(content) => Self {
                status: "success",
                content,
                content_type: "json",
                metadata,
            },
            Err(e) => Self::error(format!("serialization failed: {e}"), metadata),
        }
    }

    pub fn error(message: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "error",
            content: message,
            content_type: "text",
            metadata,
        }
    }

    /// Convert to an MCP result. Always a transport-level success; failures
    /// are reported through `"status": "error"` in the payload.
    pub fn into_call_tool_result(self) -> CallToolResult {
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => {
                let escaped = e.to_string().replace('\\', "\\\\").replace('"', "\\\"");
                CallToolResult::success(vec![Content::text(format!(
                    r#"{{"status":"error","content":"serialization failed: {escaped}","content_type":"text","metadata":{{}}}}"#
                ))])
            }
        }
    }
}
