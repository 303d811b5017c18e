//! Language-model verdicts: prompt assembly, the chat-completions client and
//! lenient parsing of the model's JSON reply.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ClassifierConfig;
use crate::report::{AiAnalysis, EXPLANATION_TERMS};

const PROMPT_EML: &str = include_str!("../prompts/prompt_eml.txt");
const PROMPT_NO_EML: &str = include_str!("../prompts/prompt_no_eml.txt");

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{(\w+)\}\}").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("no classifier API key configured")]
    MissingKey,
    #[error("classifier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("classifier returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("classifier reply had no content")]
    EmptyReply,
    #[error("no JSON object in classifier reply")]
    NoJson,
    #[error("classifier reply is not a valid verdict: {0}")]
    Json(#[from] serde_json::Error),
}

/// A text-completion backend.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

/// OpenAI-compatible `/chat/completions` client (OpenRouter by default).
pub struct ChatCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl ChatCompletionClient {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("mailcheck/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ChatCompletionClient {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Classifier for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, ClassifierError> {
        let api_key = self.api_key.as_deref().ok_or(ClassifierError::MissingKey)?;
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "response_format": { "type": "json_object" },
            "temperature": self.temperature,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status { status, body });
        }

        let parsed: ChatResponse = response.json().await?;
        let usage = parsed.usage.unwrap_or_default();
        log::info!(
            "Model: {}, Input Tokens: {}, Output Tokens: {}, Duration: {}ms",
            self.model,
            usage.prompt_tokens,
            usage.completion_tokens,
            started.elapsed().as_millis()
        );

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ClassifierError::EmptyReply)
    }
}

/// Which prompt to use: full original message, or only a forwarded body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    FullHeaders,
    ForwardedBody,
}

impl PromptKind {
    pub fn file_stem(self) -> &'static str {
        match self {
            PromptKind::FullHeaders => "prompt_eml",
            PromptKind::ForwardedBody => "prompt_no_eml",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            PromptKind::FullHeaders => PROMPT_EML,
            PromptKind::ForwardedBody => PROMPT_NO_EML,
        }
    }

    fn asks_for_sender(self) -> bool {
        self == PromptKind::ForwardedBody
    }
}

/// Prompt template with `{{key}}` placeholders. Values are substituted in
/// one pass over the template, so text inside a value is never expanded.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    content: String,
    values: HashMap<String, String>,
}

impl PromptBuilder {
    pub fn new(content: impl Into<String>) -> Self {
        PromptBuilder {
            content: content.into(),
            values: HashMap::new(),
        }
    }

    /// `<dir>/<stem>.txt` when present, else the built-in template.
    pub async fn load(kind: PromptKind, dir: Option<&Path>) -> Self {
        if let Some(dir) = dir {
            let path = dir.join(format!("{}.txt", kind.file_stem()));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => return PromptBuilder::new(content),
                Err(e) => log::warn!("Using built-in prompt, cannot read {}: {e}", path.display()),
            }
        }
        PromptBuilder::new(kind.builtin())
    }

    /// Fill the first `{{key}}` with `value` when the prompt is built.
    pub fn replace(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> String {
        let mut filled = HashSet::new();
        PLACEHOLDER
            .replace_all(&self.content, |caps: &Captures| {
                let key = &caps[1];
                match self.values.get(key) {
                    Some(value) if filled.insert(key.to_string()) => value.clone(),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

pub fn json_schema(kind: PromptKind) -> Value {
    let mut properties = json!({
        "title": {
            "type": "string",
            "description": "A few keywords describing the report, e.g. \"Suspicious sender\""
        },
        "trustworthiness": {
            "type": "string",
            "enum": ["suspicious", "neutral", "trustworthy"],
            "description": "Overall assessment of the email"
        },
        "trustPoints": {
            "type": "number",
            "description": "Points reached by the email (0-10). 0 = very suspicious, 10 = trustworthy"
        },
        "threats": {
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "e.g. \"Sender name\"" },
                    "severity": { "type": "string", "enum": ["low", "medium", "high"] },
                    "description": {
                        "type": "string",
                        "description": "e.g. \"The sender name does not match the domain\""
                    }
                },
                "required": ["title", "severity", "description"]
            }
        },
        "explanation": {
            "type": "string",
            "description": "Summary of the threats with an explanation (max. 350 words)"
        }
    });
    let mut required = vec!["title", "trustworthiness", "trustPoints", "threats", "explanation"];

    if kind.asks_for_sender() {
        properties["senderName"] = json!({ "type": "string", "description": "Name of the sender" });
        properties["senderAddress"] = json!({
            "type": "string",
            "format": "email",
            "description": "Email address of the sender"
        });
        required.extend(["senderName", "senderAddress"]);
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

pub fn json_example(kind: PromptKind) -> Value {
    let mut example = json!({
        "title": "...",
        "trustworthiness": "neutral",
        "trustPoints": 2.5,
        "threats": [{ "title": "...", "severity": "low", "description": "..." }],
        "explanation": "..."
    });
    if kind.asks_for_sender() {
        example["senderName"] = json!("...");
        example["senderAddress"] = json!("...");
    }
    example
}

/// Parse a verdict out of a reply that may wrap the JSON object in prose or
/// code fences. Trust points are clamped to 0..=10.
pub fn parse_reply(raw: &str) -> Result<AiAnalysis, ClassifierError> {
    let trimmed = raw.trim();
    let start = trimmed.find('{').ok_or(ClassifierError::NoJson)?;
    let end = trimmed.rfind('}').ok_or(ClassifierError::NoJson)?;
    if end < start {
        return Err(ClassifierError::NoJson);
    }
    let mut verdict: AiAnalysis = serde_json::from_str(&trimmed[start..=end])?;
    verdict.trust_points = if verdict.trust_points.is_finite() {
        verdict.trust_points.clamp(0.0, 10.0)
    } else {
        0.0
    };
    Ok(verdict)
}

/// The texts a verdict is based on.
#[derive(Debug, Clone, Default)]
pub struct ClassifierInput {
    /// Header summary, or the subject when headers were not analyzed.
    pub header_analysis: String,
    pub email_body: String,
    pub link_analysis: String,
}

/// Builds prompts, queries the backend and never fails: any error becomes
/// [`AiAnalysis::unavailable`].
pub struct Analyst {
    classifier: Arc<dyn Classifier>,
    prompts_dir: Option<PathBuf>,
}

impl Analyst {
    pub fn new(classifier: Arc<dyn Classifier>, prompts_dir: Option<PathBuf>) -> Self {
        Analyst {
            classifier,
            prompts_dir,
        }
    }

    pub async fn prompt(&self, kind: PromptKind, input: &ClassifierInput) -> String {
        let terms = EXPLANATION_TERMS
            .iter()
            .map(|(term, _)| *term)
            .collect::<Vec<_>>()
            .join(", ");
        PromptBuilder::load(kind, self.prompts_dir.as_deref())
            .await
            .replace("header_analysis", &input.header_analysis)
            .replace("email_body", &input.email_body)
            .replace("link_analysis", &input.link_analysis)
            .replace("json_schema", &json_schema(kind).to_string())
            .replace("json_example", &json_example(kind).to_string())
            .replace("explanation_terms", &terms)
            .build()
    }

    pub async fn analyze(&self, kind: PromptKind, input: &ClassifierInput) -> AiAnalysis {
        let prompt = self.prompt(kind, input).await;
        let verdict = match self.classifier.complete(&prompt).await {
            Ok(reply) => parse_reply(&reply),
            Err(e) => Err(e),
        };
        match verdict {
            Ok(verdict) => {
                log::debug!("Classifier verdict: {} ({})", verdict.title, verdict.trust_points);
                verdict
            }
            Err(e) => {
                log::error!("Classifier failed: {e}");
                AiAnalysis::unavailable("The email could not be analyzed automatically.")
            }
        }
    }
}
