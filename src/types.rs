use serde::{Deserialize, Serialize};

use crate::errors::NavigationError;

/// Hard cap on candidates inspected per extraction pass.
pub const MAX_CANDIDATES: usize = 400;
/// Longest href/placeholder/title kept in a descriptor before truncation.
pub const ATTRIBUTE_MAX_CHARS: usize = 32;
/// Longest label text kept in a descriptor before truncation.
pub const TEXT_MAX_CHARS: usize = 200;
pub const ELLIPSIS: &str = "[..]";

/// DOM attribute stamped on every tagged element; also echoed in the outline.
pub const ID_ATTRIBUTE: &str = "nav-id";
/// Per-step CSS class prefix, suffixed with the candidate sequence number.
pub const ELEMENT_CLASS_PREFIX: &str = "nav-element";

pub const POLL_INTERVAL_MS: u64 = 1000;
pub const RUN_TIMEOUT_SECS: u64 = 300;
pub const NAVIGATION_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Cut `value` down to `max` characters, marking the cut with [`ELLIPSIS`].
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let mut cut: String = value.chars().take(max).collect();
        cut.push_str(ELLIPSIS);
        cut
    } else {
        value.to_string()
    }
}

/// Attributes worth showing the model. All optional; free text is truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementAttributes {
    pub role: Option<String>,
    pub placeholder: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub input_type: Option<String>,
    pub href: Option<String>,
    pub value: Option<String>,
}

impl ElementAttributes {
    /// Apply the prompt-size bounds. Empty strings are dropped.
    pub fn bounded(self) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.is_empty());
        let cut = |v: Option<String>| keep(v).map(|s| truncate(&s, ATTRIBUTE_MAX_CHARS));
        Self {
            role: keep(self.role),
            placeholder: cut(self.placeholder),
            title: cut(self.title),
            input_type: keep(self.input_type),
            href: cut(self.href),
            value: cut(self.value),
        }
    }
}

/// A tagged interactive element, as shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub identifier: String,
    pub tag: String,
    pub attributes: ElementAttributes,
    pub text: Option<String>,
}

impl ElementDescriptor {
    pub fn new(
        identifier: impl Into<String>,
        tag: &str,
        attributes: ElementAttributes,
        text: &str,
    ) -> Self {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Self {
            identifier: identifier.into(),
            tag: tag.to_ascii_lowercase(),
            attributes: attributes.bounded(),
            text: (!text.is_empty()).then(|| truncate(&text, TEXT_MAX_CHARS)),
        }
    }

    /// Compact tag form, e.g. `<a href="/cart" nav-id="2">Cart</a>`.
    pub fn render(&self) -> String {
        let a = &self.attributes;
        let mut tag = format!("<{}", self.tag);
        for (name, value) in [
            ("href", &a.href),
            ("type", &a.input_type),
            ("placeholder", &a.placeholder),
            ("title", &a.title),
            ("role", &a.role),
            ("value", &a.value),
        ] {
            if let Some(value) = value {
                tag.push_str(&format!(" {name}=\"{value}\""));
            }
        }
        tag.push_str(&format!(" {ID_ATTRIBUTE}=\"{}\">", self.identifier));
        if let Some(ref text) = self.text {
            tag.push_str(&format!("{text}</{}>", self.tag));
        }
        tag
    }
}

/// Identifiers stamped during one extraction pass, in document order.
///
/// Valid for a single step only: any navigation invalidates every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiveIdentifierSet(Vec<String>);

impl LiveIdentifierSet {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.iter().any(|id| id == identifier)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the agent saw at the start of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Base64-encoded PNG.
    pub screenshot: String,
    pub url: String,
}

/// How a navigation task ended.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Answered { summary: String, answer: String },
    ReportedError { error: String },
    DepthExhausted,
    NoAction { reason: String },
    Failed { error: NavigationError },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Answered { .. } | Self::DepthExhausted)
    }
}

/// One invocation of the navigation loop and its trace.
#[derive(Debug, Serialize)]
pub struct NavigationTask {
    pub goal: String,
    pub max_depth: usize,
    pub remaining_depth: usize,
    pub steps: Vec<Step>,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}
