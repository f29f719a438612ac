use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TemplateRequest {
    /// Template name: explain, refactor, add-tests, fix-code, generate-docs,
    /// or any `{name}.hbs` in the configured template directory.
    pub template: String,
    /// Code to run the template against.
    pub context: Option<String>,
    /// Suppress the title message normally echoed into the conversation.
    #[serde(default)]
    pub skip_message: bool,
}
