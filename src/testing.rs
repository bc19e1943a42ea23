//! In-memory stand-ins for the browser and the thread service.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};

use crate::brain::{
    FunctionCall, Message, MessageContent, RequiredAction, Role, Run, RunError, RunRequest,
    RunStatus, SubmitToolOutputs, TextValue, ThreadService, ToolCall, ToolOutput,
};
use crate::dom::{BODY_HTML_JS, PROBE_MARKER, STAMP_MARKER, TITLE_JS};
use crate::errors::{BrowserError, ThreadError};
use crate::hands::{BrowserHandle, BrowserProvider, PageHandle};

#[derive(Debug, Clone, Default)]
pub(crate) struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the fake model does with a run.
#[derive(Debug, Clone)]
pub(crate) enum ModelReply {
    Call(FunctionCall),
    Text(String),
    Status(RunStatus),
}

impl ModelReply {
    pub fn call(name: &str, arguments: &str) -> Self {
        Self::Call(FunctionCall {
            name: name.into(),
            arguments: arguments.into(),
        })
    }
}

struct PendingRun {
    settled: Run,
    pending_polls: usize,
}

#[derive(Default)]
struct ThreadsState {
    threads: usize,
    runs: HashMap<String, PendingRun>,
    messages: HashMap<String, Vec<Message>>,
    requests: Vec<RunRequest>,
    posted: Vec<String>,
    get_run_calls: usize,
    acknowledged: usize,
}

type Responder = Box<dyn Fn(&RunRequest) -> ModelReply + Send + Sync>;

pub(crate) struct FakeThreads {
    responder: Responder,
    pending_polls: usize,
    state: Mutex<ThreadsState>,
}

fn text_message(role: Role, text: &str) -> Message {
    Message {
        role,
        content: vec![MessageContent::Text {
            text: TextValue {
                value: text.to_string(),
            },
        }],
    }
}

impl FakeThreads {
    pub fn new(responder: impl Fn(&RunRequest) -> ModelReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            pending_polls: 0,
            state: Mutex::new(ThreadsState::default()),
        }
    }

    /// Number of `in_progress` answers before a run settles.
    pub fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThreadsState> {
        self.state.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.lock().requests.clone()
    }

    pub fn posted(&self) -> Vec<String> {
        self.lock().posted.clone()
    }

    pub fn threads_created(&self) -> usize {
        self.lock().threads
    }

    pub fn get_run_calls(&self) -> usize {
        self.lock().get_run_calls
    }

    pub fn acknowledged(&self) -> usize {
        self.lock().acknowledged
    }
}

#[async_trait]
impl ThreadService for FakeThreads {
    async fn create_thread(&self) -> Result<String, ThreadError> {
        let mut state = self.lock();
        state.threads += 1;
        let id = format!("thread_{}", state.threads);
        state.messages.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), ThreadError> {
        let mut state = self.lock();
        state.posted.push(content.to_string());
        state
            .messages
            .entry(thread_id.to_string())
            .or_default()
            .push(text_message(role, content));
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, request: &RunRequest) -> Result<Run, ThreadError> {
        let reply = (self.responder)(request);
        let mut state = self.lock();
        state.requests.push(request.clone());
        let id = format!("run_{}", state.requests.len());

        let mut settled = Run {
            id: id.clone(),
            status: RunStatus::Completed,
            required_action: None,
            last_error: None,
        };
        match reply {
            ModelReply::Call(function) => {
                settled.status = RunStatus::RequiresAction;
                settled.required_action = Some(RequiredAction {
                    submit_tool_outputs: SubmitToolOutputs {
                        tool_calls: vec![ToolCall {
                            id: "call_1".into(),
                            function,
                        }],
                    },
                });
            }
            ModelReply::Text(text) => {
                state
                    .messages
                    .entry(thread_id.to_string())
                    .or_default()
                    .push(text_message(Role::Assistant, &text));
            }
            ModelReply::Status(status) => {
                settled.status = status;
                settled.last_error = Some(RunError {
                    code: "server_error".into(),
                    message: "the model gave up".into(),
                });
            }
        }

        state.runs.insert(
            id.clone(),
            PendingRun {
                settled,
                pending_polls: self.pending_polls,
            },
        );
        Ok(Run {
            id,
            status: RunStatus::Queued,
            required_action: None,
            last_error: None,
        })
    }

    async fn get_run(&self, _thread_id: &str, run_id: &str) -> Result<Run, ThreadError> {
        let mut state = self.lock();
        state.get_run_calls += 1;
        let Some(run) = state.runs.get_mut(run_id) else {
            return Err(ThreadError::Api {
                status: 404,
                message: format!("No run found with id '{run_id}'."),
            });
        };
        if run.pending_polls > 0 {
            run.pending_polls -= 1;
            return Ok(Run {
                id: run_id.to_string(),
                status: RunStatus::InProgress,
                required_action: None,
                last_error: None,
            });
        }
        Ok(run.settled.clone())
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>, ThreadError> {
        Ok(self
            .lock()
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run, ThreadError> {
        let mut state = self.lock();
        state.acknowledged += outputs.len();
        Ok(Run {
            id: run_id.to_string(),
            status: RunStatus::Queued,
            required_action: None,
            last_error: None,
        })
    }
}

#[derive(Debug, Clone)]
struct FakeLink {
    text: &'static str,
    href: &'static str,
    visible: bool,
    navigates: bool,
}

impl FakeLink {
    fn to(text: &'static str, href: &'static str) -> Self {
        Self {
            text,
            href,
            visible: true,
            navigates: true,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeDocument {
    title: &'static str,
    heading: &'static str,
    links: Vec<FakeLink>,
}

#[derive(Default)]
struct SiteState {
    pages: HashMap<String, FakeDocument>,
    broken: HashSet<String>,
    vanishing: HashSet<(String, String)>,
    disconnect_at: Option<String>,
    open_pages: usize,
}

/// A tiny multi-page site. Shared between pages so tests can mutate it.
#[derive(Clone, Default)]
pub(crate) struct FakeSite {
    state: Arc<Mutex<SiteState>>,
}

const ORIGIN: &str = "https://shop.test";

impl FakeSite {
    /// Home (Home, Cart, in-page toggle), Cart (with a hidden promo) and
    /// Checkout.
    pub fn shop() -> Self {
        let site = Self::default();
        {
            let mut state = site.state.lock().unwrap();
            state.pages.insert(
                format!("{ORIGIN}/"),
                FakeDocument {
                    title: "Shop",
                    heading: "T-shirts",
                    links: vec![
                        FakeLink::to("Home", "/"),
                        FakeLink::to("Cart", "/cart"),
                        FakeLink {
                            navigates: false,
                            ..FakeLink::to("Show details", "#details")
                        },
                    ],
                },
            );
            state.pages.insert(
                format!("{ORIGIN}/cart"),
                FakeDocument {
                    title: "Cart",
                    heading: "Your cart",
                    links: vec![
                        FakeLink::to("Home", "/"),
                        FakeLink::to("Checkout", "/checkout"),
                        FakeLink {
                            visible: false,
                            ..FakeLink::to("Secret promo", "/promo")
                        },
                        FakeLink::to("Keep shopping", "/cart"),
                    ],
                },
            );
            state.pages.insert(
                format!("{ORIGIN}/checkout"),
                FakeDocument {
                    title: "Checkout",
                    heading: "Checkout",
                    links: vec![FakeLink::to("Home", "/"), FakeLink::to("Cart", "/cart")],
                },
            );
        }
        site
    }

    /// Make element `id` on `url` disappear between stamping and clicking.
    pub fn vanish_on_click(&self, url: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.vanishing.insert((url.to_string(), id.to_string()));
    }

    /// Make every script evaluation on `url` fail.
    pub fn break_document(&self, url: &str) {
        self.state.lock().unwrap().broken.insert(url.to_string());
    }

    /// Drop the browser connection the first time a script runs on `url`.
    pub fn disconnect_once(&self, url: &str) {
        self.state.lock().unwrap().disconnect_at = Some(url.to_string());
    }

    /// Pages opened and not closed yet.
    pub fn open_pages(&self) -> usize {
        self.state.lock().unwrap().open_pages
    }

    fn take_disconnect(&self, url: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.disconnect_at.as_deref() == Some(url) {
            state.disconnect_at = None;
            return true;
        }
        false
    }

    fn page_opened(&self) {
        self.state.lock().unwrap().open_pages += 1;
    }

    fn page_closed(&self) {
        let mut state = self.state.lock().unwrap();
        state.open_pages = state.open_pages.saturating_sub(1);
    }

    fn document(&self, url: &str) -> Option<FakeDocument> {
        self.state.lock().unwrap().pages.get(url).cloned()
    }

    fn is_broken(&self, url: &str) -> bool {
        self.state.lock().unwrap().broken.contains(url)
    }

    fn vanishes(&self, url: &str, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .vanishing
            .contains(&(url.to_string(), id.to_string()))
    }
}

/// Pull the JSON array of identifiers out of a stamp script.
fn requested_ids(script: &str) -> Vec<String> {
    let Some(start) = script.find("const IDS = ").map(|i| i + "const IDS = ".len()) else {
        return Vec::new();
    };
    let end = script[start..].find(';').map_or(script.len(), |i| start + i);
    serde_json::from_str(&script[start..end]).unwrap_or_default()
}

pub(crate) struct FakePage {
    site: FakeSite,
    url: Mutex<String>,
    stamped: Mutex<Vec<String>>,
    pending: Mutex<Option<String>>,
    dead: AtomicBool,
}

impl FakePage {
    fn new(site: FakeSite, url: &str) -> Self {
        Self {
            site,
            url: Mutex::new(url.to_string()),
            stamped: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            dead: AtomicBool::new(false),
        }
    }

    /// Once the connection drops, every call on the page fails.
    fn alive(&self) -> Result<(), BrowserError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(BrowserError::Disconnected("websocket closed".into()));
        }
        Ok(())
    }

    fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    fn document(&self) -> Result<FakeDocument, BrowserError> {
        self.site
            .document(&self.url())
            .ok_or_else(|| BrowserError::Evaluation("document is gone".into()))
    }

    fn probe(&self, document: &FakeDocument) -> String {
        let entries: Vec<Value> = document
            .links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                json!({
                    "seq": i + 1,
                    "tag": "a",
                    "text": link.text,
                    "form_control": false,
                    "role": null, "placeholder": null, "title": null, "type": null,
                    "href": format!("{ORIGIN}{}", link.href),
                    "value": null,
                    "display": if link.visible { "inline" } else { "none" },
                    "visibility": "visible",
                    "clip": "auto",
                    "width": if link.visible { 64.0 } else { 0.0 },
                    "height": if link.visible { 18.0 } else { 0.0 },
                })
            })
            .collect();
        Value::from(entries).to_string()
    }

    fn body_html(&self, document: &FakeDocument) -> String {
        let stamped = self.stamped.lock().unwrap();
        let links: String = document
            .links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                let id = (i + 1).to_string();
                let style = if link.visible { "" } else { r#" style="display:none""# };
                let stamp = if stamped.contains(&id) {
                    format!(r#" nav-id="{id}""#)
                } else {
                    String::new()
                };
                format!(r#"<a href="{}"{style}{stamp}>{}</a>"#, link.href, link.text)
            })
            .collect();
        format!(
            concat!(
                "<header><h1>{}</h1></header>",
                "<div class=\"links\">{}</div><script>track()</script>",
            ),
            document.heading,
            links
        )
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError> {
        self.alive()?;
        if self.site.take_disconnect(&self.url()) {
            self.dead.store(true, Ordering::SeqCst);
            return Err(BrowserError::Disconnected("websocket closed".into()));
        }
        if self.site.is_broken(&self.url()) {
            return Err(BrowserError::Evaluation(
                "Execution context was destroyed".into(),
            ));
        }
        let document = self.document()?;
        if script.starts_with(PROBE_MARKER) {
            self.stamped.lock().unwrap().clear();
            return Ok(Value::String(self.probe(&document)));
        }
        if script.starts_with(STAMP_MARKER) {
            let ids = requested_ids(script);
            *self.stamped.lock().unwrap() = ids.clone();
            return Ok(Value::String(Value::from(ids).to_string()));
        }
        match script {
            BODY_HTML_JS => Ok(Value::String(self.body_html(&document))),
            TITLE_JS => Ok(Value::String(document.title.to_string())),
            other => Err(BrowserError::Evaluation(format!("unexpected script {other}"))),
        }
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.alive()?;
        let id = selector
            .trim_start_matches("[nav-id=\"")
            .trim_end_matches("\"]")
            .to_string();
        let url = self.url();
        let live = self.stamped.lock().unwrap().contains(&id);
        if !live || self.site.vanishes(&url, &id) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        let document = self.document()?;
        let index: usize = id
            .parse()
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        let link = &document.links[index - 1];
        if link.navigates {
            *self.pending.lock().unwrap() = Some(format!("{ORIGIN}{}", link.href));
        }
        Ok(())
    }

    async fn wait_for_navigation(&self) -> Result<(), BrowserError> {
        self.alive()?;
        match self.pending.lock().unwrap().take() {
            Some(next) => {
                *self.url.lock().unwrap() = next;
                self.stamped.lock().unwrap().clear();
                Ok(())
            }
            None => Err(BrowserError::Timeout("no navigation followed the click".into())),
        }
    }

    async fn screenshot(&self) -> Result<String, BrowserError> {
        self.alive()?;
        Ok(base64::engine::general_purpose::STANDARD.encode(format!("png of {}", self.url())))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.alive()?;
        Ok(self.url())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.alive()?;
        self.site.page_closed();
        Ok(())
    }
}

struct FakeBrowser {
    site: FakeSite,
    drop_next: Arc<AtomicBool>,
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn new_page(&self, url: &str) -> Result<Arc<dyn PageHandle>, BrowserError> {
        if self.drop_next.swap(false, Ordering::SeqCst) {
            return Err(BrowserError::Disconnected("websocket closed".into()));
        }
        if self.site.document(url).is_none() {
            return Err(BrowserError::Timeout(format!("could not load {url}")));
        }
        self.site.page_opened();
        Ok(Arc::new(FakePage::new(self.site.clone(), url)))
    }
}

pub(crate) struct FakeProvider {
    site: FakeSite,
    connects: Counter,
    drop_next: Arc<AtomicBool>,
}

impl FakeProvider {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site,
            connects: Counter::default(),
            drop_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connects(&self) -> Counter {
        self.connects.clone()
    }

    /// Flag that makes the next `new_page` fail with a disconnect.
    pub fn drop_next_page(&self) -> Arc<AtomicBool> {
        self.drop_next.clone()
    }
}

#[async_trait]
impl BrowserProvider for FakeProvider {
    async fn connect(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        self.connects.bump();
        Ok(Arc::new(FakeBrowser {
            site: self.site.clone(),
            drop_next: self.drop_next.clone(),
        }))
    }
}
