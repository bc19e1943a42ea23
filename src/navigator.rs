//! The navigation loop: observe, ask, act, until the task ends or the depth
//! budget runs out.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::brain::{Orchestrator, OrchestratorConfig, RunOutcome, ThreadService};
use crate::dom::{self, BODY_HTML_JS, ExtractOptions, TITLE_JS};
use crate::errors::{BrowserError, NavigationError};
use crate::hands::{NavigationSession, PageHandle};
use crate::outline;
use crate::tools::{Action, Rejection, ToolCatalogue, validate_call};
use crate::types::{NavigationTask, Step, TaskOutcome};

#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub extract: ExtractOptions,
    pub orchestrator: OrchestratorConfig,
    /// Offer `answer_user` so the model can end the task itself.
    pub allow_answer: bool,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            extract: ExtractOptions::default(),
            orchestrator: OrchestratorConfig::default(),
            allow_answer: true,
        }
    }
}

impl NavigatorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.orchestrator.poll_interval = interval;
        self
    }
}

/// What one iteration decided.
enum Iteration {
    Continue,
    Finished(TaskOutcome),
}

pub struct Navigator<'a> {
    session: &'a NavigationSession,
    threads: &'a dyn ThreadService,
    catalogue: ToolCatalogue,
    config: NavigatorConfig,
}

impl<'a> Navigator<'a> {
    pub fn new(
        session: &'a NavigationSession,
        threads: &'a dyn ThreadService,
        config: NavigatorConfig,
    ) -> Self {
        Self {
            session,
            threads,
            catalogue: ToolCatalogue::default(),
            config,
        }
    }

    /// Drive the page from `entry_url` towards `goal`, spending at most
    /// `max_depth` model calls. The trace is returned whatever the outcome.
    pub async fn run(&self, entry_url: &str, goal: &str, max_depth: usize) -> NavigationTask {
        let mut steps = Vec::new();
        let mut remaining_depth = max_depth;
        let outcome = self
            .drive(entry_url, goal, &mut steps, &mut remaining_depth)
            .await;
        NavigationTask {
            goal: goal.to_string(),
            max_depth,
            remaining_depth,
            steps,
            outcome,
        }
    }

    async fn drive(
        &self,
        entry_url: &str,
        goal: &str,
        steps: &mut Vec<Step>,
        remaining_depth: &mut usize,
    ) -> TaskOutcome {
        if *remaining_depth == 0 {
            return TaskOutcome::DepthExhausted;
        }

        let page = match self.session.new_page(entry_url).await {
            Ok(page) => page,
            Err(err) => {
                error!(
                    target: "navigator",
                    url = entry_url,
                    error = %err,
                    "could not open entry page"
                );
                return TaskOutcome::Failed {
                    error: NavigationError::Session(err),
                };
            }
        };

        let outcome = loop {
            if *remaining_depth == 0 {
                info!(target: "navigator", steps = steps.len(), "depth budget exhausted");
                break TaskOutcome::DepthExhausted;
            }
            *remaining_depth -= 1;

            match self.iterate(page.as_ref(), goal, *remaining_depth, steps).await {
                Ok(Iteration::Continue) => continue,
                Ok(Iteration::Finished(outcome)) => break outcome,
                Err(err) => {
                    error!(
                        target: "navigator",
                        kind = err.kind(),
                        error = %err,
                        steps = steps.len(),
                        "navigation failed"
                    );
                    break TaskOutcome::Failed { error: err };
                }
            }
        };

        if let Err(err) = self.page_op(page.close()).await {
            warn!(target: "navigator", error = %err, "could not close page");
        }
        outcome
    }

    async fn iterate(
        &self,
        page: &dyn PageHandle,
        goal: &str,
        depth: usize,
        steps: &mut Vec<Step>,
    ) -> Result<Iteration, NavigationError> {
        let step = steps.len() + 1;

        let url = self.page_op(page.current_url()).await.map_err(extraction)?;
        let screenshot = self.page_op(page.screenshot()).await.map_err(extraction)?;
        steps.push(Step {
            screenshot,
            url: url.clone(),
        });
        info!(target: "navigator", step, depth, url = %url, "observing page");

        let (_, live) = self
            .page_op(dom::extract_elements(page, &self.config.extract))
            .await
            .map_err(extraction)?;
        let body = self
            .page_op(dom::evaluate_string(page, BODY_HTML_JS))
            .await
            .map_err(extraction)?;
        let title = self
            .page_op(dom::evaluate_string(page, TITLE_JS))
            .await
            .map_err(extraction)?;
        let content = outline::page_content(&title, &body, &live);

        let tools = self.catalogue.build(&live, self.config.allow_answer);
        let orchestrator = Orchestrator::new(self.threads, self.config.orchestrator.clone());
        let call = match orchestrator.decide(goal, &content, &tools).await? {
            RunOutcome::Action(call) => call,
            RunOutcome::NoAction { status, reply } => {
                let reason =
                    reply.unwrap_or_else(|| format!("run ended {status} without an action"));
                warn!(target: "navigator", step, reason = %reason, "model took no action");
                return Ok(Iteration::Finished(TaskOutcome::NoAction { reason }));
            }
        };

        let action = match validate_call(&call, &tools, &live) {
            Ok(action) => action,
            Err(Rejection::Stale(identifier)) => {
                return Err(NavigationError::StaleIdentifier { identifier });
            }
            Err(rejection) => {
                warn!(target: "navigator", step, %rejection, "refusing model call");
                return Ok(Iteration::Finished(TaskOutcome::NoAction {
                    reason: rejection.to_string(),
                }));
            }
        };

        match action {
            Action::Click { identifier, text } => {
                info!(
                    target: "navigator",
                    step,
                    identifier = %identifier,
                    text = %text,
                    "clicking"
                );
                self.click(page, &identifier).await?;
                Ok(Iteration::Continue)
            }
            Action::Answer { summary, answer } => {
                info!(target: "navigator", step, answer = %answer, "model answered");
                Ok(Iteration::Finished(TaskOutcome::Answered { summary, answer }))
            }
            Action::ReportError { error } => {
                warn!(target: "navigator", step, error = %error, "model reported an error");
                Ok(Iteration::Finished(TaskOutcome::ReportedError { error }))
            }
        }
    }

    async fn click(&self, page: &dyn PageHandle, identifier: &str) -> Result<(), NavigationError> {
        let selector = dom::selector_for(identifier);
        match self.page_op(page.click(&selector)).await {
            Ok(()) => {}
            Err(BrowserError::ElementNotFound(_)) => {
                return Err(NavigationError::StaleIdentifier {
                    identifier: identifier.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        match self.page_op(page.wait_for_navigation()).await {
            Ok(()) => Ok(()),
            Err(err @ BrowserError::Timeout(_)) => Err(NavigationError::NavigationTimeout {
                identifier: identifier.to_string(),
                source: err,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Await a page operation, letting the session see disconnects.
    async fn page_op<T>(
        &self,
        op: impl Future<Output = Result<T, BrowserError>>,
    ) -> Result<T, BrowserError> {
        self.session.observe(op.await).await
    }
}

/// A lost browser is not a page problem; keep it apart from extraction.
fn extraction(err: BrowserError) -> NavigationError {
    if err.is_disconnect() {
        NavigationError::Browser(err)
    } else {
        NavigationError::Extraction(err)
    }
}

/// Run one navigation task with default settings.
pub async fn run_navigation_task(
    session: &NavigationSession,
    threads: &dyn ThreadService,
    entry_url: &str,
    goal: &str,
    max_depth: usize,
) -> NavigationTask {
    Navigator::new(session, threads, NavigatorConfig::default())
        .run(entry_url, goal, max_depth)
        .await
}
