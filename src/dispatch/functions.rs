//! Function-tool declarations offered to tool-capable backends.

use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDeclaration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl FunctionTool {
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionDeclaration {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Built-in tools the assistant may ask the user to approve.
pub fn builtin_tools() -> Vec<FunctionTool> {
    vec![
        FunctionTool::new(
            "read_file",
            "Read the contents of a file in the workspace",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Workspace-relative file path"}
                },
                "required": ["path"]
            }),
        ),
        FunctionTool::new(
            "write_file",
            "Create or overwrite a file in the workspace",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Workspace-relative file path"},
                    "content": {"type": "string", "description": "Full file content"}
                },
                "required": ["path", "content"]
            }),
        ),
        FunctionTool::new(
            "run_command",
            "Run a shell command in the workspace root",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command line to execute"}
                },
                "required": ["command"]
            }),
        ),
    ]
}
