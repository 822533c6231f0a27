//! Prompt construction for CV / job description matching and chat-template rendering.

use std::{fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

pub const SYSTEM_PROMPT: &str = r#"You are an advanced AI model designed to analyze the compatibility between a CV and a job description. You will receive a CV and a job description. Your task is to output a structured JSON format that includes the following:
1. matching_analysis: Analyze the CV against the job description to identify key strengths and gaps.
2. description: Summarize the relevance of the CV to the job description in a few concise sentences.
3. score: Provide a numerical compatibility score (0-100) based on qualifications, skills, and experience.
4. recommendation: Suggest actions for the candidate to improve their match or readiness for the role.
Your output must be in JSON format as follows:
{
  "matching_analysis": "Your detailed analysis here.",
  "description": "A brief summary here.",
  "score": 85,
  "recommendation": "Your suggestions here."
}
"#;

/// Llama 3 header format, used when the tokenizer ships no template of its own.
pub const LLAMA3_CHAT_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}<|start_header_id|>{{ message.role }}<|end_header_id|>\n\n{{ message.content | trim }}<|eot_id|>{% endfor %}{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}";

const LLAMA3_BOS: &str = "<|begin_of_text|>";
const LLAMA3_EOS: &str = "<|eot_id|>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// The fixed two-turn conversation sent to the model.
pub fn build_messages(cv: &str, job_description: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "<CV> {cv} </CV>\n<job_description> {job_description} </job_description>"
        )),
    ]
}

/// A jinja chat template plus the special tokens it refers to.
pub struct ChatTemplate {
    env: minijinja::Environment<'static>,
    source: Arc<str>,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(source: &str, bos_token: impl Into<String>, eos_token: impl Into<String>) -> Self {
        // Same whitespace handling as transformers' `apply_chat_template`.
        let mut env = minijinja::Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        // HF templates lean on python string methods (`.strip()`, `.startswith()`).
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function(
            "raise_exception",
            |message: String| -> Result<minijinja::Value, minijinja::Error> {
                Err(minijinja::Error::new(
                    minijinja::ErrorKind::InvalidOperation,
                    message,
                ))
            },
        );

        Self {
            env,
            source: Arc::from(source),
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        }
    }

    pub fn llama3() -> Self {
        Self::new(LLAMA3_CHAT_TEMPLATE, LLAMA3_BOS, LLAMA3_EOS)
    }

    /// Reads `chat_template`, `bos_token` and `eos_token` from a HuggingFace
    /// `tokenizer_config.json`. Missing entries fall back to the Llama 3 values.
    pub fn from_tokenizer_config(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)?;

        let source = template_source(&value).unwrap_or_else(|| LLAMA3_CHAT_TEMPLATE.to_string());
        let bos = special_token(&value, "bos_token").unwrap_or_else(|| LLAMA3_BOS.to_string());
        let eos = special_token(&value, "eos_token").unwrap_or_else(|| LLAMA3_EOS.to_string());

        Ok(Self::new(&source, bos, eos))
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn render(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, ServiceError> {
        let ctx = minijinja::context! {
            messages => messages,
            bos_token => self.bos_token.as_str(),
            eos_token => self.eos_token.as_str(),
            add_generation_prompt => add_generation_prompt,
        };
        Ok(self.env.render_str(&self.source, ctx)?)
    }
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

/// `chat_template` is either a plain string or a list of named templates.
fn template_source(config: &Value) -> Option<String> {
    match config.get("chat_template")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let named = |name: &str| {
                items.iter().find_map(|item| {
                    (item.get("name")?.as_str()? == name)
                        .then(|| item.get("template")?.as_str().map(str::to_string))
                        .flatten()
                })
            };
            named("default").or_else(|| {
                items
                    .first()
                    .and_then(|item| item.get("template")?.as_str().map(str::to_string))
            })
        }
        _ => None,
    }
}

/// Special tokens appear either as strings or as `{"content": ...}` objects.
fn special_token(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}
