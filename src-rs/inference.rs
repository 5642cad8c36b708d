//! Coverage extraction through a multimodal model.
//!
//! [`analyze`] checks preconditions, sends the fixed instruction plus the
//! diagram through an [`InferenceBackend`], and validates the answer with
//! [`parse_response`]. [`GeminiClient`] is the production backend.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::acquire::UploadedImage;
use crate::config::InferenceConfig;
use crate::error::{AppError, Result};

/// One labelled share of the plotted area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageItem {
    #[serde(rename = "name")]
    pub label: String,
    pub percentage: u32,
}

impl CoverageItem {
    pub fn new(label: impl Into<String>, percentage: u32) -> Self {
        Self {
            label: label.into(),
            percentage,
        }
    }
}

/// The ordered items returned by one analysis call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub items: Vec<CoverageItem>,
}

impl CoverageReport {
    pub fn total(&self) -> u32 {
        self.items.iter().map(|item| item.percentage).sum()
    }
}

pub fn build_prompt() -> String {
    let mut out = String::new();
    out.push_str("You are an urban forest surveyor.\n");
    out.push_str(
        "The attached image is a hand-drawn urban forest plot sketch: a circular plot divided into labelled areas.\n",
    );
    out.push_str(
        "Identify the text labels inside the circle and visually estimate the share (%) of the plot each area covers.\n\n",
    );
    out.push_str("Rules:\n");
    out.push_str(
        "1) Only identify ground cover (e.g. lawn/잔디, clover/토끼풀, bare ground/나대지, paving/포장).\n",
    );
    out.push_str(
        "2) Ignore tree names (e.g. pine/소나무, cherry/벚나무, boxwood/회양목, azalea/영산홍). Do not count them as items; treat their area as the ground cover underneath.\n",
    );
    out.push_str("3) Round every percentage to the nearest multiple of 5.\n");
    out.push_str("4) The percentages must add up to exactly 100.\n");
    out.push_str("5) Write each label exactly as it appears on the sketch.\n");
    out.push_str("6) Reply with this JSON format only, nothing else:\n");
    out.push_str(
        "[\n  {\"name\": \"label1\", \"percentage\": 50},\n  {\"name\": \"label2\", \"percentage\": 30},\n  {\"name\": \"label3\", \"percentage\": 20}\n]\n",
    );
    out
}

/// Remove markdown code fences the model likes to wrap JSON in.
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "").trim().to_string()
}

/// Strictly validate model output into a [`CoverageReport`].
///
/// # Errors
///
/// [`AppError::ResponseFormat`] unless the (unfenced) text is a JSON array of
/// objects each carrying a string `name` and a non-negative integer `percentage`.
pub fn parse_response(text: &str) -> Result<CoverageReport> {
    let body = strip_code_fences(text);
    let value: Value = serde_json::from_str(&body)
        .map_err(|e| AppError::ResponseFormat(format!("invalid JSON: {e}")))?;
    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            return Err(AppError::ResponseFormat(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut items = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return Err(AppError::ResponseFormat(format!(
                "item {index} is {}, expected an object",
                json_kind(entry)
            )));
        };
        let label = match obj.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(AppError::ResponseFormat(format!(
                    "item {index}: `name` is {}, expected a string",
                    json_kind(other)
                )))
            }
            None => {
                return Err(AppError::ResponseFormat(format!(
                    "item {index}: missing `name`"
                )))
            }
        };
        let percentage = match obj.get("percentage") {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    AppError::ResponseFormat(format!(
                        "item {index}: `percentage` must be a non-negative integer, got {n}"
                    ))
                })?,
            Some(other) => {
                return Err(AppError::ResponseFormat(format!(
                    "item {index}: `percentage` is {}, expected an integer",
                    json_kind(other)
                )))
            }
            None => {
                return Err(AppError::ResponseFormat(format!(
                    "item {index}: missing `percentage`"
                )))
            }
        };
        items.push(CoverageItem { label, percentage });
    }

    Ok(CoverageReport { items })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Something that can answer one multimodal prompt with text.
pub trait InferenceBackend {
    fn generate(
        &self,
        api_key: &str,
        prompt: &str,
        image: &UploadedImage,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Run one analysis.
///
/// The credential is checked before anything else so a missing key never
/// reaches the network.
pub async fn analyze<B: InferenceBackend>(
    backend: &B,
    image: Option<&UploadedImage>,
    credential: Option<&str>,
) -> Result<CoverageReport> {
    let api_key = credential
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(AppError::MissingCredential)?;
    let image = image.ok_or(AppError::NoImage)?;

    let prompt = build_prompt();
    let text = backend.generate(api_key, &prompt, image).await?;
    tracing::debug!(chars = text.chars().count(), "model answered");

    let report = parse_response(&text)?;
    if report.total() != 100 {
        tracing::warn!(total = report.total(), "coverage does not add up to 100%");
    }
    Ok(report)
}

// --- Gemini wire types ---

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text {
        text: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Inline { inline_data: InlineData<'a> },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn response_text(response: GenerateResponse) -> Result<String> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(AppError::Request(format!("prompt blocked by the model: {reason}")));
    }
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AppError::Request("model returned no text".to_string()));
    }
    Ok(text)
}

fn api_error_message(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    }
}

/// `error` followed by each underlying cause, joined with ": ".
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// `generateContent` client for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs.max(1)));
        }
        let http = builder
            .build()
            .map_err(|e| AppError::Request(format!("failed to build HTTP client: {}", error_chain(&e))))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

impl InferenceBackend for GeminiClient {
    async fn generate(&self, api_key: &str, prompt: &str, image: &UploadedImage) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![
                    RequestPart::Text { text: prompt },
                    RequestPart::Inline {
                        inline_data: InlineData {
                            mime_type: image.mime_type(),
                            data: image.base64_data(),
                        },
                    },
                ],
            }],
        };

        tracing::info!(model = %self.model, mime = image.mime_type(), "sending analysis request");
        let resp = self
            .http
            .post(self.url())
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Request(error_chain(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Request(api_error_message(status, &body)));
        }

        let parsed = resp
            .json::<GenerateResponse>()
            .await
            .map_err(|e| AppError::Request(format!("unreadable API response: {}", error_chain(&e))))?;
        response_text(parsed)
    }
}
