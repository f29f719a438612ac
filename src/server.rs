use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::chat::{ChatService, Completion};
use crate::dispatch::stream::CallState;
use crate::error::GustError;
use crate::message::ToolCall;
use crate::provider::{ProviderConfig, ProviderRole};
use crate::response::{ToolMetadata, ToolResponse};
use crate::tools::chat::ChatRequest;
use crate::tools::providers::{ProviderIdRequest, ProviderRequest, SetActiveRequest};
use crate::tools::template::TemplateRequest;

/// Reply to a completion that ended in a tool request.
#[derive(Serialize)]
struct ToolApproval<'a> {
    content: &'a str,
    tools: &'a [ToolCall],
}

#[derive(Clone)]
pub struct GustServer {
    chat: Arc<ChatService>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GustServer {
    pub fn new(chat: Arc<ChatService>) -> Self {
        Self {
            chat,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "chat",
        description = "Stream a chat reply from the active chat provider. Pass the whole conversation; the last message is the new user turn. Mention @problems to include editor diagnostics."
    )]
    async fn chat(
        &self,
        Parameters(req): Parameters<ChatRequest>,
    ) -> Result<CallToolResult, McpError> {
        req.validate()
            .map_err(|msg| McpError::invalid_params(msg, None))?;

        let start = Instant::now();
        let provider = self.chat.registry().get_active(ProviderRole::Chat);
        let files = req.files.unwrap_or_default();
        let completion = self.chat.stream_chat_completion(req.messages, &files).await;

        Ok(completion_response("chat", provider, completion, ProviderRole::Chat, start)
            .into_call_tool_result())
    }

    #[tool(
        name = "template",
        description = "Run a named prompt template (explain, refactor, add-tests, fix-code, generate-docs) against a code snippet using the active chat provider."
    )]
    async fn template(
        &self,
        Parameters(req): Parameters<TemplateRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.template.trim().is_empty() {
            return Err(McpError::invalid_params("template must not be empty", None));
        }

        let start = Instant::now();
        let provider = self.chat.registry().get_active(ProviderRole::Chat);
        let completion = self
            .chat
            .stream_template_completion(&req.template, req.context.as_deref(), req.skip_message)
            .await;

        // With a provider present, no completion means the template is unknown.
        let response = match completion {
            None if provider.is_some() => ToolResponse::error(
                GustError::TemplateNotFound(req.template).user_message(),
                metadata("template", provider.as_ref(), start),
            ),
            completion => {
                completion_response("template", provider, completion, ProviderRole::Chat, start)
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "stop",
        description = "Stop the in-flight chat or template stream. Its partial text is delivered as the final completion."
    )]
    async fn stop(&self) -> Result<CallToolResult, McpError> {
        self.chat.destroy_stream();
        Ok(
            ToolResponse::success("stopped".to_string(), ToolMetadata::named("stop"))
                .into_call_tool_result(),
        )
    }

    #[tool(
        name = "providers",
        description = "List configured providers with the roles (chat, fim) each is active for.",
        annotations(read_only_hint = true)
    )]
    async fn providers(&self) -> Result<CallToolResult, McpError> {
        let list = self.chat.registry().list();
        Ok(ToolResponse::json(&list, ToolMetadata::named("providers")).into_call_tool_result())
    }

    #[tool(name = "add_provider", description = "Add a provider. A fresh id is assigned.")]
    async fn add_provider(
        &self,
        Parameters(req): Parameters<ProviderRequest>,
    ) -> Result<CallToolResult, McpError> {
        validate_provider(&req.provider)?;
        let stored = self.chat.registry().add(req.provider);
        Ok(ToolResponse::json(&stored, ToolMetadata::named("add_provider")).into_call_tool_result())
    }

    #[tool(
        name = "update_provider",
        description = "Replace a provider record, matched by id."
    )]
    async fn update_provider(
        &self,
        Parameters(req): Parameters<ProviderRequest>,
    ) -> Result<CallToolResult, McpError> {
        validate_provider(&req.provider)?;
        let meta = ToolMetadata::named("update_provider");
        let response = match self.chat.registry().update(req.provider) {
            Ok(stored) => ToolResponse::json(&stored, meta),
            Err(e) => ToolResponse::error(e.user_message(), meta),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "remove_provider",
        description = "Remove a provider. Roles it was active for are left without a provider."
    )]
    async fn remove_provider(
        &self,
        Parameters(req): Parameters<ProviderIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let meta = ToolMetadata::named("remove_provider");
        let response = match self.chat.registry().remove(&req.id) {
            Some(removed) => ToolResponse::json(&removed, meta),
            None => ToolResponse::error(GustError::ProviderNotFound(req.id).user_message(), meta),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "copy_provider",
        description = "Duplicate a provider under a new id with a -copy label suffix."
    )]
    async fn copy_provider(
        &self,
        Parameters(req): Parameters<ProviderIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let meta = ToolMetadata::named("copy_provider");
        let response = match self.chat.registry().copy(&req.id) {
            Some(copy) => ToolResponse::json(&copy, meta),
            None => ToolResponse::error(GustError::ProviderNotFound(req.id).user_message(), meta),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "set_active_provider",
        description = "Make a provider the active one for the chat or fim role."
    )]
    async fn set_active_provider(
        &self,
        Parameters(req): Parameters<SetActiveRequest>,
    ) -> Result<CallToolResult, McpError> {
        let registry = self.chat.registry();
        registry.set_active(req.role, &req.id);
        let meta = ToolMetadata::named("set_active_provider");
        let response = match registry.get_active(req.role) {
            Some(active) if active.id == req.id => ToolResponse::json(&active, meta),
            _ => ToolResponse::error(GustError::ProviderNotFound(req.id).user_message(), meta),
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "reset_providers",
        description = "Delete every provider and restore the two defaults built from configuration."
    )]
    async fn reset_providers(&self) -> Result<CallToolResult, McpError> {
        let registry = self.chat.registry();
        registry.reset_to_defaults();
        Ok(
            ToolResponse::json(&registry.list(), ToolMetadata::named("reset_providers"))
                .into_call_tool_result(),
        )
    }
}

fn validate_provider(provider: &ProviderConfig) -> Result<(), McpError> {
    if provider.hostname.trim().is_empty() {
        return Err(McpError::invalid_params("hostname must not be empty", None));
    }
    if let Some(t) = provider.temperature
        && !(0.0..=2.0).contains(&t)
    {
        return Err(McpError::invalid_params(
            format!("temperature must be between 0 and 2, got {t}"),
            None,
        ));
    }
    Ok(())
}

fn metadata(tool: &str, provider: Option<&ProviderConfig>, start: Instant) -> ToolMetadata {
    ToolMetadata {
        model_used: provider.map(|p| p.model.clone()),
        provider_used: provider.map(|p| p.label.clone()),
        duration_seconds: start.elapsed().as_secs_f64(),
        ..ToolMetadata::named(tool)
    }
}

fn completion_response(
    tool: &str,
    provider: Option<ProviderConfig>,
    completion: Option<Completion>,
    role: ProviderRole,
    start: Instant,
) -> ToolResponse {
    let mut meta = metadata(tool, provider.as_ref(), start);
    let Some(completion) = completion else {
        return ToolResponse::error(
            GustError::NoActiveProvider {
                role: role.as_str(),
            }
            .user_message(),
            meta,
        );
    };
    meta.session_id = Some(completion.session_id.clone());

    if let Some(error) = completion.error {
        tracing::warn!(tool, "completion failed: {error}");
        return ToolResponse::error(error, meta);
    }
    if !completion.tools.is_empty() {
        return ToolResponse::json(
            &ToolApproval {
                content: crate::chat::TOOL_REQUEST_TEXT,
                tools: &completion.tools,
            },
            meta,
        );
    }
    if completion.state == CallState::Cancelled {
        tracing::info!(tool, "completion stopped early");
    }
    ToolResponse::success(completion.content, meta)
}

#[tool_handler]
impl ServerHandler for GustServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "gust".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Gust: streaming chat and code templates against a configurable LLM backend.\n\n\
                 Workflow:\n\
                 1. Call `providers` to see configured backends and which is active for chat/fim.\n\
                 2. Use `set_active_provider`, `add_provider` or `update_provider` to point at a backend.\n\
                 3. Call `chat` with the conversation, or `template` with a template name and code.\n\
                 4. Call `stop` to end a long stream early; the partial text is kept.\n\n\
                 A reply requesting tool use lists the pending calls; they are never executed."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
