//! Fill-in-the-middle prompt framing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Prompt framing a FIM model was trained with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FimTemplate {
    #[default]
    CodeLlama,
    CodeQwen,
    DeepSeek,
    StarCoder,
}

impl FimTemplate {
    /// Frame `prefix` and `suffix` around the hole the model should fill.
    pub fn format(&self, prefix: &str, suffix: &str) -> String {
        match self {
            Self::CodeLlama => format!("<PRE> {prefix} <SUF>{suffix} <MID>"),
            Self::CodeQwen => {
                format!("<|fim_prefix|>{prefix}<|fim_suffix|>{suffix}<|fim_middle|>")
            }
            Self::DeepSeek => {
                format!("<｜fim▁begin｜>{prefix}<｜fim▁hole｜>{suffix}<｜fim▁end｜>")
            }
            Self::StarCoder => format!("<fim_prefix>{prefix}<fim_suffix>{suffix}<fim_middle>"),
        }
    }

    /// Tokens that mark the end of a completion for this framing.
    pub fn stop_words(&self) -> &'static [&'static str] {
        match self {
            Self::CodeLlama => &["<EOT>", "<PRE>", "<SUF>", "<MID>"],
            Self::CodeQwen => &["<|endoftext|>", "<|fim_prefix|>", "<|fim_suffix|>"],
            Self::DeepSeek => &["<｜fim▁begin｜>", "<｜fim▁hole｜>", "<｜fim▁end｜>", "<|eot_id|>"],
            Self::StarCoder => &["<|endoftext|>", "<fim_prefix>", "<fim_suffix>"],
        }
    }
}

/// Cut a completion at the first stop word, if any.
pub fn strip_stop_words(template: FimTemplate, completion: &str) -> &str {
    template
        .stop_words()
        .iter()
        .filter_map(|w| completion.find(w))
        .min()
        .map_or(completion, |pos| &completion[..pos])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codeqwen_framing() {
        let p = FimTemplate::CodeQwen.format("fn main() {", "}");
        assert_eq!(p, "<|fim_prefix|>fn main() {<|fim_suffix|>}<|fim_middle|>");
    }

    #[test]
    fn stop_word_truncates() {
        let out = strip_stop_words(FimTemplate::CodeLlama, "let x = 1;<EOT> trailing");
        assert_eq!(out, "let x = 1;");
        assert_eq!(strip_stop_words(FimTemplate::StarCoder, "clean"), "clean");
    }
}
