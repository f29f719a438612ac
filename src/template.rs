//! Named prompt templates.
//!
//! Templates are plain text with `{{code}}` and `{{language}}` placeholders.
//! A directory can override any built-in by providing `{name}.hbs`.

use std::path::PathBuf;

/// Values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateData {
    pub code: String,
    pub language: String,
}

impl TemplateData {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: String::new(),
        }
    }
}

pub trait TemplateResolver: Send + Sync {
    /// Render `name` against `data`. `None` when no such template exists.
    fn render(&self, name: &str, data: &TemplateData) -> Option<String>;

    /// System prompt for conversations driven by template `name`.
    fn system_message(&self, name: &str) -> Option<String>;
}

const SYSTEM: &str = "You are a helpful, respectful and honest coding assistant. \
Always reply using markdown. Be clear and concise, prioritizing brevity in your \
responses. For code refactoring, use markdown with appropriate code formatting.";

const BUILTINS: &[(&str, &str)] = &[
    ("system", SYSTEM),
    (
        "explain",
        "Explain the following {{language}} code step by step:\n\n```{{language}}\n{{code}}\n```",
    ),
    (
        "refactor",
        "Refactor the following {{language}} code. Keep the behaviour identical, \
improve readability, and reply with the full refactored code:\n\n```{{language}}\n{{code}}\n```",
    ),
    (
        "add-tests",
        "Write unit tests for the following {{language}} code using the idiomatic \
test framework for the language:\n\n```{{language}}\n{{code}}\n```",
    ),
    (
        "fix-code",
        "Fix the following {{language}} code. Explain each problem briefly, then \
give the corrected code:\n\n```{{language}}\n{{code}}\n```",
    ),
    (
        "generate-docs",
        "Write documentation comments for the following {{language}} code in the \
style conventional for the language:\n\n```{{language}}\n{{code}}\n```",
    ),
    (
        "relevant-files",
        "Files in the workspace that may be relevant: {{code}}",
    ),
    (
        "relevant-code",
        "Code from the workspace that may be relevant:\n\n{{code}}",
    ),
];

fn builtin(name: &str) -> Option<&'static str> {
    BUILTINS.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
}

/// Replace `{{key}}` (whitespace inside the braces allowed) with values.
fn substitute(template: &str, data: &TemplateData) -> String {
    let mut out = String::with_capacity(template.len() + data.code.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + len].trim();
        let value = match key {
            "code" => Some(data.code.as_str()),
            "language" => Some(data.language.as_str()),
            _ => None,
        };
        out.push_str(&rest[..start]);
        match value {
            Some(v) => out.push_str(v),
            None => out.push_str(&rest[start..start + 4 + len]),
        }
        rest = &rest[start + 4 + len..];
    }
    out.push_str(rest);
    out
}

/// Templates from an optional override directory, falling back to built-ins.
#[derive(Debug, Clone, Default)]
pub struct DirTemplates {
    dir: Option<PathBuf>,
}

impl DirTemplates {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn raw(&self, name: &str) -> Option<String> {
        // Names index files; anything path-like is refused.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{name}.hbs"));
            match std::fs::read_to_string(&path) {
                Ok(text) => return Some(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), "cannot read template: {e}"),
            }
        }
        builtin(name).map(str::to_string)
    }
}

impl TemplateResolver for DirTemplates {
    fn render(&self, name: &str, data: &TemplateData) -> Option<String> {
        self.raw(name).map(|t| substitute(&t, data))
    }

    fn system_message(&self, name: &str) -> Option<String> {
        self.raw(&format!("{name}-system"))
            .or_else(|| self.raw("system"))
            .map(|t| substitute(&t, &TemplateData::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> TemplateData {
        TemplateData {
            code: "fn main() {}".to_string(),
            language: "rust".to_string(),
        }
    }

    #[test]
    fn builtin_explain() {
        let out = DirTemplates::default().render("explain", &data()).unwrap();
        assert!(out.contains("```rust\nfn main() {}\n```"));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn unknown_template_is_none() {
        assert!(DirTemplates::default().render("nonexistent", &data()).is_none());
        assert!(DirTemplates::default().render("../system", &data()).is_none());
    }

    #[test]
    fn directory_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("explain.hbs"), "Why: {{ code }} ({{language}}) {{other}}").unwrap();
        let templates = DirTemplates::new(Some(dir.path().to_path_buf()));
        assert_eq!(
            templates.render("explain", &data()).unwrap(),
            "Why: fn main() {} (rust) {{other}}"
        );
        // Built-ins remain reachable for names the directory lacks.
        assert!(templates.render("refactor", &data()).is_some());
    }

    #[test]
    fn system_message_prefers_named_override() {
        let dir = tempfile::tempdir().unwrap();
        let templates = DirTemplates::new(Some(dir.path().to_path_buf()));
        assert_eq!(templates.system_message("chat").as_deref(), Some(SYSTEM));

        std::fs::write(dir.path().join("chat-system.hbs"), "Be terse.").unwrap();
        assert_eq!(templates.system_message("chat").as_deref(), Some("Be terse."));
    }

    #[test]
    fn unterminated_placeholder_kept() {
        assert_eq!(substitute("a {{code", &data()), "a {{code");
    }
}
