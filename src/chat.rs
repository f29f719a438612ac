//! Conversation orchestration.
//!
//! `ChatService` turns a chat history or a template invocation into one
//! streaming call against the active provider and relays the call's
//! lifecycle to an `EventSink`. At most one UI-visible session is open at a
//! time; starting a new one supersedes (and cancels) the previous one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ConfigReader;
use crate::context::{
    self, Diagnostic, FileItem, kebab_to_sentence, load_file_contents, mentions_problems,
    strip_mentions,
};
use crate::dispatch::body::build_request_body;
use crate::dispatch::functions::{FunctionTool, builtin_tools};
use crate::dispatch::stream::{CallState, CancelHandle, StreamExecutor, StreamHandler, StreamStats};
use crate::dispatch::{PartialResult, RequestInput, RequestParams, ToolCallDelta};
use crate::error::GustError;
use crate::events::{EventSink, UiCommand, UiEvent};
use crate::fim::{FimTemplate, strip_stop_words};
use crate::message::{Conversation, Message, Role, ToolCall, ToolStatus};
use crate::provider::registry::ProviderRegistry;
use crate::provider::{ProviderConfig, ProviderRole};
use crate::telemetry::TelemetryContext;
use crate::template::{DirTemplates, TemplateData, TemplateResolver};

pub const LOADING_MESSAGE: &str = "Thinking";

/// Content of the assistant turn that carries pending tool calls.
pub const TOOL_REQUEST_TEXT: &str = "The assistant would like to use the following tools:";

/// Templates that pull retrieval context for the selection.
const RETRIEVAL_TEMPLATES: &[&str] = &["explain"];

/// Read-only view of the host editor.
pub trait EditorContext: Send + Sync {
    fn selection(&self) -> Option<String> {
        None
    }

    fn language(&self) -> Option<String> {
        None
    }

    fn workspace_name(&self) -> Option<String> {
        None
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        Vec::new()
    }

    /// A peer-connection session is active; retrieval context is suppressed.
    fn symmetry_connected(&self) -> bool {
        false
    }
}

/// Editor with nothing selected and no diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEditor;

impl EditorContext for NullEditor {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievedContext {
    pub files: Vec<String>,
    pub code: Option<String>,
}

/// Workspace retrieval. Ranking is the implementor's business.
pub trait Retriever: Send + Sync {
    fn relevant(&self, text: &str) -> RetrievedContext;
}

/// Result of one orchestrated call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub session_id: String,
    pub state: CallState,
    /// Accumulated assistant text, leading whitespace trimmed.
    pub content: String,
    /// Pending tool calls, empty when the model answered in text.
    pub tools: Vec<ToolCall>,
    /// Sanitized error text when the call failed.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionState {
    id: String,
    text: String,
    fragments: BTreeMap<usize, ToolCallDelta>,
    tools: Vec<ToolCall>,
    error: Option<String>,
    handle: Option<CancelHandle>,
    finished: bool,
    superseded: bool,
}

impl SessionState {
    fn silenced(&self) -> bool {
        self.finished || self.superseded
    }

    fn merge_fragments(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            let entry = self.fragments.entry(delta.index).or_insert_with(|| ToolCallDelta {
                index: delta.index,
                ..ToolCallDelta::default()
            });
            if delta.id.is_some() {
                entry.id = delta.id;
            }
            if let Some(name) = delta.name {
                entry.name.get_or_insert_with(String::new).push_str(&name);
            }
            entry.arguments.push_str(&delta.arguments);
        }
    }

    /// Assembled tool calls, all pending. Fragments without a name are dropped.
    fn tool_calls(&self) -> Vec<ToolCall> {
        self.fragments
            .values()
            .filter_map(|f| {
                let name = f.name.clone().filter(|n| !n.is_empty())?;
                let arguments = if f.arguments.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(&f.arguments)
                        .unwrap_or_else(|_| serde_json::Value::String(f.arguments.clone()))
                };
                Some(ToolCall {
                    id: f
                        .id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    name,
                    arguments,
                    status: ToolStatus::Pending,
                })
            })
            .collect()
    }

    fn completion(&self, state: CallState) -> Completion {
        Completion {
            session_id: self.id.clone(),
            state,
            content: self.text.trim_start().to_string(),
            tools: self.tools.clone(),
            error: self.error.clone(),
        }
    }
}

type SharedSession = Arc<Mutex<SessionState>>;

fn lock(session: &SharedSession) -> MutexGuard<'_, SessionState> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_session() -> SharedSession {
    Arc::new(Mutex::new(SessionState {
        id: uuid::Uuid::new_v4().to_string(),
        ..SessionState::default()
    }))
}

/// Bridges executor callbacks to the session state and, for UI-visible
/// sessions, to the event sink.
///
/// Events are emitted while the session lock is held, so a stop or a
/// supersede can never interleave between the silenced check and the emit.
struct SessionHandler {
    session: SharedSession,
    sink: Option<Arc<dyn EventSink>>,
}

impl SessionHandler {
    fn emit(&self, event: UiEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }
}

impl StreamHandler for SessionHandler {
    fn on_start(&mut self, handle: CancelHandle) {
        let mut state = lock(&self.session);
        state.handle = Some(handle.clone());
        if state.silenced() {
            // Stopped or superseded before the call got going.
            handle.cancel();
            return;
        }
        self.emit(UiEvent::Generating { active: true });
    }

    fn on_data(&mut self, partial: PartialResult) {
        let mut state = lock(&self.session);
        if state.silenced() {
            return;
        }
        state.text.push_str(&partial.content);
        state.merge_fragments(partial.tool_calls);
        self.emit(UiEvent::CompletionChunk {
            content: state.text.trim_start().to_string(),
            role: Role::Assistant,
        });
    }

    fn on_end(&mut self, final_result: Option<PartialResult>, stats: &StreamStats) {
        let mut state = lock(&self.session);
        if state.silenced() {
            return;
        }
        state.finished = true;
        if let Some(result) = final_result {
            state.text.push_str(&result.content);
            state.merge_fragments(result.tool_calls);
        }
        state.tools = state.tool_calls();
        tracing::debug!(chunks = stats.chunks, tools = state.tools.len(), "session finished");

        self.emit(UiEvent::Generating { active: false });
        if state.tools.is_empty() {
            self.emit(UiEvent::CompletionEnd {
                content: state.text.trim_start().to_string(),
                role: Role::Assistant,
                tools: None,
                id: None,
            });
        } else {
            let mut message = Message::assistant(TOOL_REQUEST_TEXT);
            message.id = Some(uuid::Uuid::new_v4().to_string());
            message.tools = Some(state.tools.clone());
            self.emit(UiEvent::AwaitingToolApproval { message });
        }
    }

    fn on_error(&mut self, error: GustError) {
        let mut state = lock(&self.session);
        if state.silenced() {
            return;
        }
        state.finished = true;
        state.error = Some(error.user_message());
        self.emit(UiEvent::Generating { active: false });
        self.emit(UiEvent::CompletionEnd {
            content: error.to_completion_text(),
            role: Role::Assistant,
            tools: None,
            id: None,
        });
    }
}

/// What a call is for: drives telemetry and event emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Chat,
    Template,
    Fim,
}

impl CallKind {
    fn action(&self) -> &'static str {
        match self {
            Self::Chat | Self::Template => "ask",
            Self::Fim => "fim",
        }
    }

    fn visible(&self) -> bool {
        !matches!(self, Self::Fim)
    }
}

pub struct ChatService {
    registry: Arc<ProviderRegistry>,
    executor: StreamExecutor,
    config: Arc<dyn ConfigReader>,
    /// `None` resolves `DirTemplates` from the current config on each call.
    templates: Option<Arc<dyn TemplateResolver>>,
    editor: Arc<dyn EditorContext>,
    retriever: Option<Arc<dyn Retriever>>,
    sink: Arc<dyn EventSink>,
    active: Mutex<Option<SharedSession>>,
    conversation: Mutex<Conversation>,
}

impl ChatService {
    /// Service with directory templates from config, no editor and no
    /// retriever. Stall timeout and template directory follow config
    /// reloads.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: Arc<dyn ConfigReader>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            executor: StreamExecutor::new(),
            config,
            templates: None,
            editor: Arc::new(NullEditor),
            retriever: None,
            sink,
            active: Mutex::new(None),
            conversation: Mutex::new(Conversation::default()),
        }
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateResolver>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_editor(mut self, editor: Arc<dyn EditorContext>) -> Self {
        self.editor = editor;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The last outbound turn sequence plus the assistant reply, if any.
    pub fn conversation(&self) -> Conversation {
        self.conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stream a reply to `messages`, whose last entry is the new user turn.
    ///
    /// Returns `None` without emitting anything when there is no active
    /// chat provider or the history is empty.
    pub async fn stream_chat_completion(
        &self,
        messages: Vec<Message>,
        files: &[FileItem],
    ) -> Option<Completion> {
        let Some(provider) = self.registry.get_active(ProviderRole::Chat) else {
            tracing::debug!("chat ignored: {}", GustError::NoActiveProvider { role: "chat" });
            return None;
        };
        let (last, history) = messages.split_last()?;
        let config = self.config.current();

        self.send_language();

        let text = last.content.as_str();
        let mut additional = String::new();
        if let Some(selection) = self.selection() {
            additional.push_str(&format!("Selected Code:\n{selection}\n\n"));
        }
        if let Some(rag) = self.rag_context(text) {
            additional.push_str(&format!("Additional Context:\n{rag}\n\n"));
        }
        let file_contents = load_file_contents(files, config.max_file_context_bytes).await;
        if !file_contents.is_empty() {
            additional.push_str(&format!("File Contents:\n{file_contents}\n\n"));
        }

        let cleaned = strip_mentions(text);
        let user = if additional.is_empty() {
            Message {
                content: cleaned,
                ..last.clone()
            }
        } else {
            Message::user(format!("{cleaned}\n\n{}", additional.trim()))
        };

        let mut outbound = history.to_vec();
        outbound.push(user);
        *self.conversation.lock().unwrap_or_else(PoisonError::into_inner) =
            Conversation::new(outbound.clone());

        let outbound = self.with_system_message(outbound, &config.prompt_template);
        let tools = config.tools_enabled.then(builtin_tools);

        self.emit(UiEvent::Loading {
            message: LOADING_MESSAGE.to_string(),
        });
        let completion = self
            .run(provider, RequestInput::Messages(outbound), None, tools.as_deref(), CallKind::Chat)
            .await;

        if completion.state == CallState::Completed && !completion.content.is_empty() {
            self.conversation
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Message::assistant(completion.content.clone()));
        }
        Some(completion)
    }

    /// Run the named template against the editor selection (or `context`
    /// when nothing is selected).
    ///
    /// Unknown templates and a missing chat provider are silent no-ops.
    pub async fn stream_template_completion(
        &self,
        template: &str,
        context: Option<&str>,
        skip_message: bool,
    ) -> Option<Completion> {
        let Some(provider) = self.registry.get_active(ProviderRole::Chat) else {
            tracing::debug!(template, "template ignored: no active chat provider");
            return None;
        };
        let selection = self
            .selection()
            .or_else(|| context.map(str::to_string))
            .unwrap_or_default();
        let data = TemplateData {
            code: selection.clone(),
            language: self.language(),
        };
        let templates = self.templates();
        let Some(prompt) = templates.render(template, &data) else {
            tracing::debug!("template ignored: {}", GustError::TemplateNotFound(template.to_string()));
            return None;
        };

        self.send_language();
        if !skip_message {
            self.emit(UiEvent::Loading {
                message: LOADING_MESSAGE.to_string(),
            });
            self.emit(UiEvent::AddMessage {
                content: format!("{}\n\n```\n{selection}", kebab_to_sentence(template)),
            });
        }

        let rag = if RETRIEVAL_TEMPLATES.contains(&template) {
            self.rag_context(&selection)
        } else {
            None
        };
        let content = match rag {
            Some(rag) => format!("{prompt}\n\nAdditional Context:\n{rag}"),
            None => prompt,
        };

        let messages = self.with_system_message(vec![Message::user(content)], template);
        Some(
            self.run(provider, RequestInput::Messages(messages), None, None, CallKind::Template)
                .await,
        )
    }

    /// Fill-in-the-middle completion with the active FIM provider. Emits no
    /// UI events and does not touch the chat session.
    pub async fn stream_fim_completion(&self, prefix: &str, suffix: &str) -> Option<String> {
        let provider = self.registry.get_active(ProviderRole::Fim)?;
        let template: FimTemplate = provider
            .fim_template
            .unwrap_or(self.config.current().fim_template);
        let prompt = template.format(prefix, suffix);
        let stop = template.stop_words().iter().map(|s| s.to_string()).collect();

        let completion = self
            .run(provider, RequestInput::Prompt(prompt), Some(stop), None, CallKind::Fim)
            .await;
        if completion.state != CallState::Completed {
            return None;
        }
        Some(strip_stop_words(template, &completion.content).to_string())
    }

    /// Abort the open session. The UI gets `Generating { active: false }` and
    /// one final `CompletionEnd` with whatever text had arrived.
    pub fn destroy_stream(&self) {
        let Some(session) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let mut state = lock(&session);
        if state.silenced() {
            return;
        }
        state.finished = true;
        if let Some(handle) = &state.handle {
            handle.cancel();
        }
        let content = state.text.trim_start().to_string();
        tracing::info!(len = content.len(), "stream stopped");
        // Under the session lock: no chunk of this session can follow.
        self.emit(UiEvent::Generating { active: false });
        self.emit(UiEvent::CompletionEnd {
            content,
            role: Role::Assistant,
            tools: None,
            id: None,
        });
    }

    pub async fn handle_command(&self, command: UiCommand) {
        match command {
            UiCommand::ChatMessage { messages, mentions } => {
                self.stream_chat_completion(messages, &mentions).await;
            }
            UiCommand::StopGeneration => self.destroy_stream(),
            UiCommand::NewConversation => {
                self.destroy_stream();
                self.conversation
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
            }
            UiCommand::GetAllProviders => self.send_providers(),
            UiCommand::GetActiveProvider { role } => self.send_active(role),
            UiCommand::SetActiveProvider { role, id } => {
                self.registry.set_active(role, &id);
                self.send_active(role);
            }
            UiCommand::AddProvider { provider } => {
                self.registry.add(provider);
                self.send_providers();
            }
            UiCommand::UpdateProvider { provider } => {
                if let Err(e) = self.registry.update(provider) {
                    tracing::warn!("update ignored: {e}");
                }
                self.send_providers();
            }
            UiCommand::RemoveProvider { id } => {
                self.registry.remove(&id);
                self.send_providers();
            }
            UiCommand::CopyProvider { id } => {
                self.registry.copy(&id);
                self.send_providers();
            }
            UiCommand::ResetProviders => {
                self.registry.reset_to_defaults();
                self.send_providers();
            }
        }
    }

    async fn run(
        &self,
        provider: ProviderConfig,
        input: RequestInput,
        stop: Option<Vec<String>>,
        tools: Option<&[FunctionTool]>,
        kind: CallKind,
    ) -> Completion {
        let config = self.config.current();
        let params = RequestParams {
            model: provider.model.clone(),
            temperature: provider.temperature,
            max_tokens: provider.max_tokens,
            keep_alive: config.keep_alive.clone(),
            stop,
            input,
        };
        let body = build_request_body(provider.kind, &params, tools);
        let executor = self
            .executor
            .clone()
            .with_stall_timeout(Duration::from_secs(config.stall_timeout_secs));
        let options = provider.request_options();

        let session = new_session();
        if kind.visible() {
            let previous = self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(Arc::clone(&session));
            if let Some(previous) = previous {
                supersede(&previous);
            }
        }

        let telemetry = config.telemetry_url.as_ref().map(|url| TelemetryContext {
            url: url.clone(),
            username: config.username().to_string(),
            project: self.editor.workspace_name(),
            uuid: lock(&session).id.clone(),
            source: config.telemetry_source.clone(),
            model: provider.model.clone(),
            action: kind.action().to_string(),
        });

        let mut handler = SessionHandler {
            session: Arc::clone(&session),
            sink: kind.visible().then(|| Arc::clone(&self.sink)),
        };
        tracing::info!(
            provider = %provider.label,
            kind = %provider.kind,
            model = %provider.model,
            session = %lock(&session).id,
            "starting call"
        );
        let state = executor
            .execute(&options, &body, &mut handler, telemetry)
            .await;

        if kind.visible() {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &session)) {
                *active = None;
            }
        }

        lock(&session).completion(state)
    }

    fn rag_context(&self, text: &str) -> Option<String> {
        if self.editor.symmetry_connected() {
            return None;
        }

        let mut combined = String::new();
        if mentions_problems(text) {
            let problems = context::problems_context(&self.editor.diagnostics());
            if !problems.is_empty() {
                combined.push_str(&problems);
                combined.push_str("\n\n");
            }
        }

        if let Some(retriever) = &self.retriever {
            let templates = self.templates();
            let found = retriever.relevant(&strip_mentions(text));
            if !found.files.is_empty()
                && let Some(files) =
                    templates.render("relevant-files", &TemplateData::code(found.files.join(", ")))
            {
                combined.push_str(&files);
                combined.push_str("\n\n");
            }
            if let Some(code) = found.code.filter(|c| !c.is_empty())
                && let Some(code) = templates.render("relevant-code", &TemplateData::code(code))
            {
                combined.push_str(&code);
            }
        }

        let combined = combined.trim();
        (!combined.is_empty()).then(|| combined.to_string())
    }

    fn with_system_message(&self, mut messages: Vec<Message>, template: &str) -> Vec<Message> {
        if messages.first().is_some_and(|m| m.role == Role::System) {
            return messages;
        }
        if let Some(system) = self.templates().system_message(template) {
            messages.insert(0, Message::system(system));
        }
        messages
    }

    fn templates(&self) -> Arc<dyn TemplateResolver> {
        match &self.templates {
            Some(templates) => Arc::clone(templates),
            None => Arc::new(DirTemplates::new(self.config.current().template_dir.clone())),
        }
    }

    fn selection(&self) -> Option<String> {
        self.editor.selection().filter(|s| !s.is_empty())
    }

    fn language(&self) -> String {
        self.editor
            .language()
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn send_language(&self) {
        self.emit(UiEvent::LanguageInfo {
            language: self.language(),
        });
    }

    fn send_providers(&self) {
        self.emit(UiEvent::Providers {
            providers: self.registry.list(),
        });
    }

    fn send_active(&self, role: ProviderRole) {
        self.emit(UiEvent::ActiveProvider {
            role,
            provider: self.registry.get_active(role),
        });
    }

    fn emit(&self, event: UiEvent) {
        self.sink.emit(event);
    }
}

fn supersede(session: &SharedSession) {
    let mut state = lock(session);
    if state.silenced() {
        return;
    }
    state.superseded = true;
    if let Some(handle) = &state.handle {
        handle.cancel();
    }
    tracing::debug!(session = %state.id, "session superseded");
}
