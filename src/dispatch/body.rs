//! Provider-kind specific request payloads.
//!
//! `build_request_body` is pure and total: every kind, including `Generic`,
//! maps to a defined shape.

use crate::dispatch::functions::FunctionTool;
use crate::dispatch::{ModelOptions, RequestBody, RequestInput, RequestParams, WireMessage};
use crate::message::Role;
use crate::provider::{ProviderKind, RequestMode, TokenLimitField};

pub fn build_request_body(
    kind: ProviderKind,
    params: &RequestParams,
    tools: Option<&[FunctionTool]>,
) -> RequestBody {
    let mode = match params.input {
        RequestInput::Messages(_) => RequestMode::Chat,
        RequestInput::Prompt(_) => RequestMode::Fim,
    };

    let mut body = RequestBody {
        model: kind.sends_model().then(|| params.model.clone()),
        stream: true,
        stop: params.stop.clone(),
        ..RequestBody::default()
    };

    match &params.input {
        RequestInput::Messages(messages) => {
            body.messages = Some(messages.iter().map(WireMessage::from).collect());
        }
        RequestInput::Prompt(prompt) if kind.wraps_prompt_in_messages() => {
            body.messages = Some(vec![WireMessage {
                role: Role::User,
                content: prompt.clone(),
            }]);
        }
        RequestInput::Prompt(prompt) => body.prompt = Some(prompt.clone()),
    }

    match kind.token_limit_field(mode) {
        TokenLimitField::OptionsNumPredict => {
            body.options = Some(ModelOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            });
        }
        TokenLimitField::NPredict => {
            body.temperature = params.temperature;
            body.n_predict = params.max_tokens;
        }
        TokenLimitField::MaxTokens => {
            body.temperature = params.temperature;
            body.max_tokens = params.max_tokens;
        }
    }

    if kind.sends_keep_alive() {
        body.keep_alive = params.keep_alive.clone();
    }

    // Tools only make sense for chat turns.
    if mode == RequestMode::Chat
        && kind.supports_tools()
        && let Some(tools) = tools.filter(|t| !t.is_empty())
    {
        body.tools = Some(tools.to_vec());
        if !kind.streams_with_tools() {
            body.stream = false;
        }
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::functions::builtin_tools;
    use crate::message::Message;

    fn chat_params() -> RequestParams {
        RequestParams {
            model: "m".to_string(),
            temperature: Some(0.3),
            max_tokens: Some(256),
            keep_alive: Some("5m".to_string()),
            stop: None,
            input: RequestInput::Messages(vec![Message::user("hi")]),
        }
    }

    fn fim_params() -> RequestParams {
        RequestParams {
            input: RequestInput::Prompt("<PRE> a <SUF>b <MID>".to_string()),
            ..chat_params()
        }
    }

    fn to_json(body: &RequestBody) -> serde_json::Value {
        serde_json::to_value(body).unwrap()
    }

    #[test]
    fn every_kind_has_stream_field() {
        for kind in ProviderKind::ALL {
            for params in [chat_params(), fim_params()] {
                let json = to_json(&build_request_body(kind, &params, None));
                assert_eq!(json["stream"], true, "{kind} must stream without tools");
            }
        }
    }

    #[test]
    fn stream_disabled_only_for_tools_without_streaming_support() {
        let tools = builtin_tools();
        for kind in ProviderKind::ALL {
            let body = build_request_body(kind, &chat_params(), Some(&tools));
            let expected = !(kind.supports_tools() && !kind.streams_with_tools());
            assert_eq!(body.stream, expected, "{kind}");
            assert_eq!(body.tools.is_some(), kind.supports_tools(), "{kind}");
        }
    }

    #[test]
    fn empty_tools_keep_streaming() {
        for kind in ProviderKind::ALL {
            let body = build_request_body(kind, &chat_params(), Some(&[]));
            assert!(body.stream, "{kind}");
            assert!(body.tools.is_none(), "{kind}");
        }
    }

    #[test]
    fn exactly_one_of_messages_or_prompt() {
        for kind in ProviderKind::ALL {
            let chat = to_json(&build_request_body(kind, &chat_params(), None));
            assert!(chat.get("messages").is_some() && chat.get("prompt").is_none(), "{kind}");

            let fim = to_json(&build_request_body(kind, &fim_params(), None));
            let has_messages = fim.get("messages").is_some();
            let has_prompt = fim.get("prompt").is_some();
            assert!(has_messages ^ has_prompt, "{kind}");
            assert_eq!(has_messages, kind.wraps_prompt_in_messages(), "{kind}");
        }
    }

    #[test]
    fn token_limit_field_names() {
        let llama = to_json(&build_request_body(ProviderKind::LlamaCpp, &fim_params(), None));
        assert_eq!(llama["n_predict"], 256);
        assert!(llama.get("max_tokens").is_none());
        assert!(llama.get("model").is_none());

        let openai = to_json(&build_request_body(ProviderKind::OpenAi, &chat_params(), None));
        assert_eq!(openai["max_tokens"], 256);
        assert!(openai.get("n_predict").is_none());

        let ollama = to_json(&build_request_body(ProviderKind::Ollama, &chat_params(), None));
        assert_eq!(ollama["options"]["num_predict"], 256);
        assert_eq!(ollama["keep_alive"], "5m");
        assert!(ollama.get("max_tokens").is_none());

        let generic_fim = to_json(&build_request_body(ProviderKind::Generic, &fim_params(), None));
        assert_eq!(generic_fim["n_predict"], 256);
        let generic_chat = to_json(&build_request_body(ProviderKind::Generic, &chat_params(), None));
        assert_eq!(generic_chat["max_tokens"], 256);
    }

    #[test]
    fn wire_messages_drop_tool_metadata() {
        let mut msg = Message::assistant("done");
        msg.id = Some("x".to_string());
        let params = RequestParams {
            input: RequestInput::Messages(vec![msg]),
            ..chat_params()
        };
        let json = to_json(&build_request_body(ProviderKind::OpenAi, &params, None));
        assert_eq!(json["messages"][0], serde_json::json!({"role": "assistant", "content": "done"}));
    }
}
