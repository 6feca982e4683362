//! LLM Assistant service.
//!
//! Renders the persona prompt, asks the hosted model for a one-field JSON answer and serves
//! knowledge lookups the model requests on the way.

use crate::core::persona::PersonaProfile;
use crate::core::prompt::{PromptInput, PromptTemplates};
use crate::core::traits::ResponseGenerator;
use crate::error::GenerationError;
use crate::infrastructure::model::{ModelReply, ModelRequest, ModelTurn, OutputField, ToolSpec};
use crate::infrastructure::traits::LanguageModel;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::time::Instant;

const MAX_LOOKUPS: usize = 4;

pub const WELCOME_OUTPUT: OutputField = OutputField {
    name: "initialResponse",
    description: "The brief, personalized initial message.",
};

pub const REPLY_OUTPUT: OutputField = OutputField {
    name: "response",
    description: "The generated response to the user message.",
};

pub const LOOKUP_TOOL: ToolSpec = ToolSpec {
    name: "lookup_persona_fact",
    description: "Looks up a remembered fact about the person you are talking to.",
    argument: "query",
    argument_description: "What you want to remember, e.g. \"birthday\" or \"favourite food\".",
};

#[injectable(ResponseGenerator)]
pub struct PersonaAssistant {
    model: Ref<dyn LanguageModel>,
    templates: Ref<PromptTemplates>,
    persona: Ref<PersonaProfile>,
}

impl PersonaAssistant {
    pub fn new(
        model: Ref<dyn LanguageModel>,
        templates: Ref<PromptTemplates>,
        persona: Ref<PersonaProfile>,
    ) -> PersonaAssistant {
        PersonaAssistant {
            model,
            templates,
            persona,
        }
    }

    async fn run(&self, prompt: String, output: OutputField) -> Result<String, GenerationError> {
        let tools = if self.templates.lookup_enabled() {
            vec![LOOKUP_TOOL]
        } else {
            Vec::new()
        };
        let mut request = ModelRequest::new(prompt, output.clone(), tools);
        let started = Instant::now();
        let mut lookups = 0;

        loop {
            match self.model.generate(&request).await? {
                ModelReply::Text(text) => {
                    info!(
                        "generated `{}` in {:.2} seconds",
                        output.name,
                        started.elapsed().as_secs_f32()
                    );
                    return extract_field(&text, output.name);
                }
                ModelReply::ToolCall { .. } if lookups == MAX_LOOKUPS => {
                    return Err(GenerationError::TooManyToolCalls(MAX_LOOKUPS));
                }
                ModelReply::ToolCall { name, args } => {
                    lookups += 1;
                    let result = self.call_tool(&name, &args);
                    request.turns.push(ModelTurn::ToolCall {
                        name: name.clone(),
                        args,
                    });
                    request.turns.push(ModelTurn::ToolResult { name, result });
                }
            }
        }
    }

    fn call_tool(&self, name: &str, args: &Value) -> Value {
        if name != LOOKUP_TOOL.name {
            warn!("model called unknown tool `{name}`");
            return json!({ "error": format!("unknown tool `{name}`") });
        }

        let query = args
            .get(LOOKUP_TOOL.argument)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let fact = self.persona.knowledge.lookup(query);
        debug!("lookup `{query}` -> `{fact}`");

        json!({ "fact": fact })
    }
}

#[async_trait]
impl ResponseGenerator for PersonaAssistant {
    async fn generate_welcome(&self, input: &PromptInput) -> Result<String, GenerationError> {
        let prompt = self.templates.render_welcome(input)?;
        self.run(prompt, WELCOME_OUTPUT).await
    }

    async fn generate_reply(&self, input: &PromptInput) -> Result<String, GenerationError> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        if !present(&input.message) {
            return Err(GenerationError::MissingInput("message"));
        }
        if !present(&input.chat_history) {
            return Err(GenerationError::MissingInput("chat_history"));
        }

        let prompt = self.templates.render_reply(input)?;
        self.run(prompt, REPLY_OUTPUT).await
    }
}

/// Reads the declared string field out of the model's JSON answer.
pub fn extract_field(text: &str, field: &str) -> Result<String, GenerationError> {
    let body = strip_code_fence(text.trim());
    let value: Value = serde_json::from_str(body)
        .map_err(|e| GenerationError::MalformedOutput(format!("{e} in `{text}`")))?;

    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| GenerationError::MalformedOutput(format!("missing string field `{field}`")))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
