//! The model side of a step: chat-thread contract and the run orchestrator.
//!
//! Every step gets a fresh thread. The orchestrator posts the task, starts a
//! run carrying the page content and the step's tools, then polls until the
//! run either asks for a function call or settles without one.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::errors::{NavigationError, ThreadError};
use crate::tools::ToolDefinition;
use crate::types::{POLL_INTERVAL_MS, RUN_TIMEOUT_SECS};

/// Lifecycle of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Still working; poll again.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress | Self::Cancelling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, untrusted.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredAction {
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

impl Run {
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.required_action
            .as_ref()
            .map(|a| a.submit_tool_outputs.tool_calls.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextValue {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFile {
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextValue },
    ImageFile { image_file: ImageFile },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<MessageContent>,
}

impl Message {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.value.as_str()),
                MessageContent::ImageFile { image_file } => Some(image_file.file_id.as_str()),
                MessageContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parameters for starting a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub instructions: String,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Remote chat-thread service with function-calling runs.
#[async_trait]
pub trait ThreadService: Send + Sync {
    async fn create_thread(&self) -> Result<String, ThreadError>;

    async fn post_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), ThreadError>;

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<Run, ThreadError>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ThreadError>;

    /// Messages in chronological order.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>, ThreadError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, ThreadError>;
}

/// Result of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Action(FunctionCall),
    /// The run settled without asking for a call.
    NoAction { status: RunStatus, reply: Option<String> },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    /// Wall-clock ceiling per run; `None` waits as long as the run does.
    pub run_timeout: Option<Duration>,
    /// Answer requested tool calls so the run closes cleanly.
    pub acknowledge_calls: bool,
    /// Log the thread transcript at debug level after each run.
    pub transcript: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            run_timeout: Some(Duration::from_secs(RUN_TIMEOUT_SECS)),
            acknowledge_calls: false,
            transcript: false,
        }
    }
}

/// Role framing for every run; the page content is appended below it.
const INSTRUCTIONS: &str = "## OBJECTIVE ##
You have been tasked with navigating a website based on a task given by the user. \
You are connected to a web browser which you control via function calls. \
You will behave as a human browsing the web.
Pick exactly one action per turn: click one of the elements listed in the page content by its id, \
answer the user when the task is done (if that tool is available), or report an error.

## NOTES ##
Only use ids that appear in the page content below. \
If you find any errors while navigating the website, \
report the error with the report_error function.";

pub fn instructions(page_content: &str) -> String {
    format!("{INSTRUCTIONS}\n\n{page_content}")
}

pub struct Orchestrator<'a> {
    threads: &'a dyn ThreadService,
    config: OrchestratorConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(threads: &'a dyn ThreadService, config: OrchestratorConfig) -> Self {
        Self { threads, config }
    }

    /// Ask the model for the next action on a fresh thread.
    pub async fn decide(
        &self,
        task: &str,
        page_content: &str,
        tools: &[ToolDefinition],
    ) -> Result<RunOutcome, NavigationError> {
        let thread_id = self.threads.create_thread().await?;
        self.threads
            .post_message(&thread_id, Role::User, &format!("Task: {task}"))
            .await?;

        let request = RunRequest {
            instructions: instructions(page_content),
            tools: tools.to_vec(),
        };
        let run = self.threads.create_run(&thread_id, &request).await?;
        info!(target: "brain", thread_id = %thread_id, run_id = %run.id, "run started");

        let run = self.poll(&thread_id, run).await?;
        let outcome = self.settle(&thread_id, &run).await;

        if self.config.transcript {
            self.log_transcript(&thread_id).await;
        }
        outcome
    }

    async fn poll(&self, thread_id: &str, mut run: Run) -> Result<Run, NavigationError> {
        let started = Instant::now();
        while run.status.is_pending() {
            if let Some(limit) = self.config.run_timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    warn!(
                        target: "brain",
                        run_id = %run.id,
                        ?elapsed,
                        "run did not settle in time"
                    );
                    return Err(NavigationError::RunTimedOut {
                        run_id: run.id,
                        elapsed,
                    });
                }
            }
            sleep(self.config.poll_interval).await;
            run = self.threads.get_run(thread_id, &run.id).await?;
            debug!(target: "brain", run_id = %run.id, status = %run.status, "polled run");
        }
        Ok(run)
    }

    async fn settle(&self, thread_id: &str, run: &Run) -> Result<RunOutcome, NavigationError> {
        match run.status {
            RunStatus::RequiresAction => {
                let calls = run.tool_calls();
                let Some(first) = calls.first() else {
                    warn!(target: "brain", run_id = %run.id, "requires_action without tool calls");
                    return Ok(RunOutcome::NoAction {
                        status: run.status,
                        reply: None,
                    });
                };
                if calls.len() > 1 {
                    warn!(
                        target: "brain",
                        run_id = %run.id,
                        count = calls.len(),
                        "model asked for several calls, using the first"
                    );
                }
                info!(
                    target: "brain",
                    run_id = %run.id,
                    tool = %first.function.name,
                    arguments = %first.function.arguments,
                    "model picked an action"
                );
                if self.config.acknowledge_calls {
                    self.acknowledge(thread_id, run).await;
                }
                Ok(RunOutcome::Action(first.function.clone()))
            }
            RunStatus::Completed => {
                let reply = self.last_reply(thread_id).await;
                info!(target: "brain", run_id = %run.id, "run completed without an action");
                Ok(RunOutcome::NoAction {
                    status: run.status,
                    reply,
                })
            }
            status => {
                let message = run
                    .last_error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_else(|| "no error details".to_string());
                Err(NavigationError::RemoteService {
                    run_id: run.id.clone(),
                    status: status.to_string(),
                    message,
                })
            }
        }
    }

    async fn acknowledge(&self, thread_id: &str, run: &Run) {
        let outputs: Vec<ToolOutput> = run
            .tool_calls()
            .iter()
            .map(|call| ToolOutput {
                tool_call_id: call.id.clone(),
                output: "dispatched".to_string(),
            })
            .collect();
        if let Err(err) = self
            .threads
            .submit_tool_outputs(thread_id, &run.id, &outputs)
            .await
        {
            warn!(
                target: "brain",
                run_id = %run.id,
                error = %err,
                "could not acknowledge tool calls"
            );
        }
    }

    async fn last_reply(&self, thread_id: &str) -> Option<String> {
        match self.threads.list_messages(thread_id).await {
            Ok(messages) => messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(Message::text),
            Err(err) => {
                warn!(target: "brain", error = %err, "could not read thread messages");
                None
            }
        }
    }

    async fn log_transcript(&self, thread_id: &str) {
        let Ok(messages) = self.threads.list_messages(thread_id).await else {
            return;
        };
        for message in messages {
            let role = match message.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
            };
            debug!(target: "brain", thread_id = %thread_id, "[{role}] {}", message.text());
        }
    }
}
