use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Mention that pulls workspace retrieval into a chat turn.
pub const WORKSPACE_MENTION: &str = "@workspace";

/// Mention that pulls editor diagnostics into a chat turn.
pub const PROBLEMS_MENTION: &str = "@problems";

/// A file attached to a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileItem {
    /// Display name shown in the prompt.
    pub name: String,
    /// Absolute path, or relative to the server's working directory.
    pub path: String,
}

impl FileItem {
    /// Mention pseudo-files the UI attaches alongside real files.
    fn is_mention(&self) -> bool {
        self.name == "workspace" || self.name == "problems"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

/// One editor diagnostic, serialized as a JSON line in the problems context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Source text covered by the diagnostic range.
    #[serde(default)]
    pub code: String,
    /// Full text of the first line of the range.
    #[serde(default)]
    pub line: String,
    /// 1-based.
    pub line_number: u32,
    /// 1-based.
    pub character: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_code: Option<String>,
}

/// Read a file for prompt augmentation.
///
/// Returns `None` when the file is missing, unreadable, or larger than
/// `max_bytes`; oversized files are excluded, never truncated. An empty file
/// yields `Some("")`.
pub async fn read_file_content(path: &Path, max_bytes: usize) -> Option<String> {
    // Size check before reading; a huge file is never pulled into memory.
    let size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot stat file: {e}");
            return None;
        }
    };
    if size > max_bytes as u64 {
        tracing::debug!(path = %path.display(), size, max_bytes, "file exceeds context ceiling");
        return None;
    }
    if size == 0 {
        return Some(String::new());
    }
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(content),
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot read file: {e}");
            None
        }
    }
}

/// Render attached files as `File: {name}\n\n{content}` blocks.
///
/// Mention pseudo-files are dropped. Files that cannot be read or exceed the
/// ceiling are skipped individually. Returns an empty string when nothing
/// survives.
pub async fn load_file_contents(files: &[FileItem], max_bytes: usize) -> String {
    let mut output = String::new();
    for file in files.iter().filter(|f| !f.is_mention()) {
        if let Some(content) = read_file_content(Path::new(&file.path), max_bytes).await {
            output.push_str(&format!("File: {}\n\n{}\n\n", file.name, content));
        }
    }
    output.trim().to_string()
}

/// One JSON object per diagnostic, newline separated.
pub fn problems_context(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .filter_map(|d| serde_json::to_string(d).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn mentions_problems(text: &str) -> bool {
    text.contains(PROBLEMS_MENTION)
}

/// Remove `@workspace` / `@problems` mentions and surrounding whitespace.
pub fn strip_mentions(text: &str) -> String {
    text.replace(WORKSPACE_MENTION, "")
        .replace(PROBLEMS_MENTION, "")
        .trim()
        .to_string()
}

/// `add-tests` → `Add tests`.
pub fn kebab_to_sentence(name: &str) -> String {
    let spaced = name.replace('-', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
