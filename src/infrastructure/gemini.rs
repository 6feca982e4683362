//! Gemini `generateContent` client.

use crate::config::ModelSettings;
use crate::error::ModelError;
use crate::infrastructure::model::{ModelReply, ModelRequest, ModelTurn, OutputField};
use crate::infrastructure::traits::LanguageModel;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

pub struct GeminiModel {
    client: Client,
    settings: ModelSettings,
}

impl GeminiModel {
    pub fn new(settings: ModelSettings) -> GeminiModel {
        GeminiModel {
            client: Client::new(),
            settings,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, ModelError> {
        let body = request_body(request);
        debug!(
            "Gemini request: model={} turns={} tools={}",
            self.settings.model,
            request.turns.len(),
            request.tools.len()
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            return Err(ModelError::Api { status, body });
        }

        parse_reply(response.json().await?)
    }
}

/// Builds the `generateContent` payload.
///
/// Gemini rejects a JSON response schema together with function declarations, so with tools
/// the output shape is spelled out in an extra prompt part instead.
pub fn request_body(request: &ModelRequest) -> Value {
    let mut contents: Vec<Value> = request.turns.iter().map(content).collect();
    let mut body = json!({});

    if request.tools.is_empty() {
        if let Some(output) = &request.output {
            body["generationConfig"] = json!({
                "responseMimeType": "application/json",
                "responseSchema": response_schema(output),
            });
        }
    } else {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": {
                        "type": "OBJECT",
                        "properties": {
                            tool.argument: { "type": "STRING", "description": tool.argument_description }
                        },
                        "required": [tool.argument],
                    },
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);

        if let (Some(output), Some(first)) = (&request.output, contents.first_mut()) {
            if let Some(parts) = first["parts"].as_array_mut() {
                parts.push(json!({ "text": shape_instruction(output) }));
            }
        }
    }

    body["contents"] = Value::Array(contents);
    body
}

fn response_schema(output: &OutputField) -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            output.name: { "type": "STRING", "description": output.description }
        },
        "required": [output.name],
    })
}

fn shape_instruction(output: &OutputField) -> String {
    format!(
        "When you are ready to answer, reply with only a JSON object of the form {{\"{}\": \"...\"}} where the value is {}",
        output.name,
        output.description.to_lowercase()
    )
}

fn content(turn: &ModelTurn) -> Value {
    match turn {
        ModelTurn::Prompt(text) => json!({ "role": "user", "parts": [{ "text": text }] }),
        ModelTurn::ToolCall { name, args } => json!({
            "role": "model",
            "parts": [{ "functionCall": { "name": name, "args": args } }],
        }),
        ModelTurn::ToolResult { name, result } => json!({
            "role": "user",
            "parts": [{ "functionResponse": { "name": name, "response": result } }],
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// First function call wins; otherwise the text parts of the first candidate are joined.
pub fn parse_reply(raw: Value) -> Result<ModelReply, ModelError> {
    let response: GenerateContentResponse =
        serde_json::from_value(raw).map_err(|e| ModelError::Empty(Some(e.to_string())))?;

    let block_reason = response.prompt_feedback.and_then(|f| f.block_reason);
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(ModelError::Empty(block_reason));
    };

    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    let mut text = String::new();
    for part in parts {
        if let Some(call) = part.function_call {
            return Ok(ModelReply::ToolCall {
                name: call.name,
                args: call.args,
            });
        }
        if let Some(t) = part.text {
            text.push_str(&t);
        }
    }

    if text.is_empty() {
        return Err(ModelError::Empty(candidate.finish_reason.or(block_reason)));
    }

    Ok(ModelReply::Text(text))
}
