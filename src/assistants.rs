//! HTTP client for the OpenAI Assistants v2 API.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::brain::{Message, Role, Run, RunRequest, ThreadService, ToolOutput};
use crate::config::AssistantConfig;
use crate::errors::ThreadError;

const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Assistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

pub struct AssistantClient {
    http: Client,
    config: AssistantConfig,
    assistant_id: OnceCell<String>,
}

impl AssistantClient {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            assistant_id: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn read<T: DeserializeOwned>(response: Response) -> Result<T, ThreadError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| "Unknown API error".to_string());
            return Err(ThreadError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ThreadError> {
        Self::read(self.request(Method::GET, path).send().await?).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ThreadError> {
        Self::read(self.request(Method::POST, path).json(body).send().await?).await
    }

    fn assistant_params(&self) -> Value {
        json!({
            "name": self.config.assistant_name,
            "model": self.config.model,
            "tools": [],
        })
    }

    async fn find_assistant(&self) -> Result<Option<Assistant>, ThreadError> {
        let mut after: Option<String> = None;
        loop {
            let mut path = format!("/assistants?limit={PAGE_SIZE}&order=desc");
            if let Some(cursor) = &after {
                path.push_str(&format!("&after={cursor}"));
            }
            let page: Page<Assistant> = self.get(&path).await?;
            if let Some(found) = page
                .data
                .iter()
                .find(|a| a.name.as_deref() == Some(self.config.assistant_name.as_str()))
            {
                return Ok(Some(found.clone()));
            }
            match page.last_id {
                Some(last) if page.has_more => after = Some(last),
                _ => return Ok(None),
            }
        }
    }

    /// Look up the configured assistant by name, bringing it up to date, or
    /// create it. Returns its id.
    pub async fn get_or_create_assistant(&self) -> Result<String, ThreadError> {
        let params = self.assistant_params();
        match self.find_assistant().await? {
            Some(existing) => {
                let _: Created = self
                    .post(&format!("/assistants/{}", existing.id), &params)
                    .await?;
                info!(target: "brain", assistant_id = %existing.id, "updated assistant");
                Ok(existing.id)
            }
            None => {
                let created: Created = self.post("/assistants", &params).await?;
                info!(target: "brain", assistant_id = %created.id, "created assistant");
                Ok(created.id)
            }
        }
    }

    /// Memoized [`Self::get_or_create_assistant`].
    pub async fn assistant_id(&self) -> Result<&str, ThreadError> {
        self.assistant_id
            .get_or_try_init(|| self.get_or_create_assistant())
            .await
            .map(String::as_str)
    }
}

#[async_trait]
impl ThreadService for AssistantClient {
    async fn create_thread(&self) -> Result<String, ThreadError> {
        let created: Created = self.post("/threads", &json!({})).await?;
        debug!(target: "brain", thread_id = %created.id, "created thread");
        Ok(created.id)
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), ThreadError> {
        let _: Value = self
            .post(
                &format!("/threads/{thread_id}/messages"),
                &json!({ "role": role, "content": content }),
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<Run, ThreadError> {
        let assistant_id = self.assistant_id().await?;
        let tools: Vec<Value> = request.tools.iter().map(|t| t.to_function_tool()).collect();
        self.post(
            &format!("/threads/{thread_id}/runs"),
            &json!({
                "assistant_id": assistant_id,
                "model": self.config.model,
                "instructions": request.instructions,
                "tools": tools,
            }),
        )
        .await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ThreadError> {
        self.get(&format!("/threads/{thread_id}/runs/{run_id}")).await
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>, ThreadError> {
        let page: Page<Message> = self
            .get(&format!(
                "/threads/{thread_id}/messages?order=asc&limit={PAGE_SIZE}"
            ))
            .await?;
        Ok(page.data)
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, ThreadError> {
        self.post(
            &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            &json!({ "tool_outputs": outputs }),
        )
        .await
    }
}
