//! Provider-neutral shapes exchanged with the hosted model.

use serde_json::Value;

/// The single string field the model is asked to fill.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub name: &'static str,
    pub description: &'static str,
}

/// A function the model may call mid-generation. Every tool takes one string argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub argument: &'static str,
    pub argument_description: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    Prompt(String),
    ToolCall { name: String, args: Value },
    ToolResult { name: String, result: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub turns: Vec<ModelTurn>,
    pub output: Option<OutputField>,
    pub tools: Vec<ToolSpec>,
}

impl ModelRequest {
    pub fn new(prompt: String, output: OutputField, tools: Vec<ToolSpec>) -> ModelRequest {
        ModelRequest {
            turns: vec![ModelTurn::Prompt(prompt)],
            output: Some(output),
            tools,
        }
    }

    /// The instantiated prompt text, i.e. the first turn.
    pub fn prompt(&self) -> Option<&str> {
        self.turns.iter().find_map(|turn| match turn {
            ModelTurn::Prompt(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Text(String),
    ToolCall { name: String, args: Value },
}
