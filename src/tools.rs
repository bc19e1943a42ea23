use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::brain::FunctionCall;
use crate::types::LiveIdentifierSet;

pub const CLICK_LINK: &str = "click_link";
pub const ANSWER_USER: &str = "answer_user";
pub const REPORT_ERROR: &str = "report_error";

/// Name of the identifier parameter of `click_link`.
pub const ID_KEY: &str = "id";

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    /// Wire form expected by the assistants API.
    pub fn to_function_tool(&self) -> Value {
        json!({ "type": "function", "function": self })
    }

    /// Allowed values of the identifier parameter, if constrained.
    pub fn allowed_identifiers(&self) -> Option<Vec<String>> {
        let values = self
            .parameters
            .pointer(&format!("/properties/{ID_KEY}/enum"))?
            .as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }
}

/// The static set of tools offered during navigation.
#[derive(Debug, Clone)]
pub struct ToolCatalogue {
    pub click_link: ToolDefinition,
    pub answer_user: ToolDefinition,
    pub report_error: ToolDefinition,
}

impl Default for ToolCatalogue {
    fn default() -> Self {
        Self {
            click_link: ToolDefinition {
                name: CLICK_LINK.into(),
                description: "Clicks a link element given it's id".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "text": {
                            "type": "string",
                            "description": "The text on the link you want to click",
                        },
                        ID_KEY: {
                            "type": "string",
                            "description":
                                "The id of link that should be clicked (from the page content)",
                        },
                    },
                    "required": ["text", ID_KEY],
                }),
            },
            answer_user: ToolDefinition {
                name: ANSWER_USER.into(),
                description: "Give an answer to the user and end the navigation. \
                    Use when the given task has been completed. \
                    Summarize the relevant parts of the page content first \
                    and give an answer to the user based on that."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "summary": {
                            "type": "string",
                            "description": "A summary of the relevant parts of the page \
                                content that you base the answer on",
                        },
                        "answer": {
                            "type": "string",
                            "description": "The response to the user",
                        },
                    },
                    "required": ["summary", "answer"],
                }),
            },
            report_error: ToolDefinition {
                name: REPORT_ERROR.into(),
                description: "Report an error encountered during navigation".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "error": {
                            "type": "string",
                            "description": "The error being reported",
                        },
                    },
                    "required": ["error"],
                }),
            },
        }
    }
}

impl ToolCatalogue {
    /// Tools for one step. `click_link` only accepts identifiers from `live`
    /// and is left out when nothing on the page is clickable.
    pub fn build(&self, live: &LiveIdentifierSet, allow_answer: bool) -> Vec<ToolDefinition> {
        let mut tools = Vec::with_capacity(3);
        if !live.is_empty() {
            let mut click = self.click_link.clone();
            if let Some(id) = click
                .parameters
                .pointer_mut(&format!("/properties/{ID_KEY}"))
            {
                id["enum"] = json!(live.as_slice());
            }
            tools.push(click);
        }
        if allow_answer {
            tools.push(self.answer_user.clone());
        }
        tools.push(self.report_error.clone());
        tools
    }
}

/// A validated function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Click { identifier: String, text: String },
    Answer { summary: String, answer: String },
    ReportError { error: String },
}

/// Why a function call was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("tool {0} was not offered")]
    NotOffered(String),

    #[error("arguments for {tool} do not match its schema: {reason}")]
    Malformed { tool: String, reason: String },

    #[error("identifier {0} is not live on this page")]
    Stale(String),
}

#[derive(Deserialize)]
struct ClickArgs {
    id: String,
    text: String,
}

#[derive(Deserialize)]
struct AnswerArgs {
    summary: String,
    answer: String,
}

#[derive(Deserialize)]
struct ReportArgs {
    error: String,
}

fn args<'a, T: Deserialize<'a>>(call: &'a FunctionCall) -> Result<T, Rejection> {
    serde_json::from_str(&call.arguments).map_err(|e| Rejection::Malformed {
        tool: call.name.clone(),
        reason: e.to_string(),
    })
}

/// Check a model's call against the tools offered this step.
///
/// Arguments come from the remote model and are parsed strictly; identifiers
/// are compared as strings against `live`.
pub fn validate_call(
    call: &FunctionCall,
    offered: &[ToolDefinition],
    live: &LiveIdentifierSet,
) -> Result<Action, Rejection> {
    if !offered.iter().any(|t| t.name == call.name) {
        return Err(Rejection::NotOffered(call.name.clone()));
    }
    match call.name.as_str() {
        CLICK_LINK => {
            let ClickArgs { id, text } = args(call)?;
            if !live.contains(&id) {
                return Err(Rejection::Stale(id));
            }
            Ok(Action::Click {
                identifier: id,
                text,
            })
        }
        ANSWER_USER => {
            let AnswerArgs { summary, answer } = args(call)?;
            Ok(Action::Answer { summary, answer })
        }
        REPORT_ERROR => {
            let ReportArgs { error } = args(call)?;
            Ok(Action::ReportError { error })
        }
        other => Err(Rejection::NotOffered(other.to_string())),
    }
}
