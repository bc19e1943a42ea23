use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use page_navigator::types::{
    DEFAULT_MAX_DEPTH, NAVIGATION_TIMEOUT_MS, POLL_INTERVAL_MS, RUN_TIMEOUT_SECS,
};
use page_navigator::{
    AssistantClient, AssistantConfig, ChromeProvider, NavigationSession, Navigator,
    NavigatorConfig, NavigationTask, TaskOutcome,
};

/// Let a model browse a site until it can answer your question.
#[derive(Debug, Parser)]
#[command(name = "navigator", version)]
struct Cli {
    /// Page to start from.
    url: String,

    /// What the model should find or do.
    goal: String,

    /// Maximum number of model decisions.
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Show the browser window instead of running headless.
    #[arg(long)]
    headed: bool,

    /// Attach to a running Chrome through its DevTools websocket URL.
    #[arg(long, env = "NAVIGATOR_ATTACH")]
    attach: Option<String>,

    /// Chrome executable to launch.
    #[arg(long, env = "CHROME_PATH")]
    chrome: Option<PathBuf>,

    /// Do not offer the model the answer_user tool.
    #[arg(long)]
    no_answer: bool,

    #[arg(long, default_value_t = POLL_INTERVAL_MS)]
    poll_ms: u64,

    /// Give up on a run after this many seconds; 0 waits forever.
    #[arg(long, default_value_t = RUN_TIMEOUT_SECS)]
    run_timeout_secs: u64,

    /// Wait this long for a click to load a new document.
    #[arg(long, default_value_t = NAVIGATION_TIMEOUT_MS)]
    navigation_timeout_ms: u64,

    /// Write the finished task (steps and outcome) as JSON.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// -v for info, -vv for debug (including thread transcripts).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn provider(&self) -> ChromeProvider {
        ChromeProvider {
            headless: !self.headed,
            chrome_path: self.chrome.clone(),
            attach: self.attach.clone(),
            navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
        }
    }

    fn navigator_config(&self) -> NavigatorConfig {
        let mut config =
            NavigatorConfig::default().with_poll_interval(Duration::from_millis(self.poll_ms));
        config.allow_answer = !self.no_answer;
        config.orchestrator.run_timeout =
            (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs));
        config.orchestrator.transcript = self.verbose >= 2;
        config
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print the outcome; true when it counts as success.
fn report(task: &NavigationTask) -> bool {
    match &task.outcome {
        TaskOutcome::Answered { summary, answer } => {
            println!("{answer}");
            eprintln!("Summary: {summary}");
        }
        TaskOutcome::ReportedError { error } => eprintln!("Model reported an error: {error}"),
        TaskOutcome::DepthExhausted => {
            eprintln!("Stopped after {} steps without an answer.", task.steps.len())
        }
        TaskOutcome::NoAction { reason } => eprintln!("Model stopped: {reason}"),
        TaskOutcome::Failed { error } => {
            eprintln!("Navigation failed ({}): {error}", error.kind())
        }
    }
    task.outcome.is_success()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let assistant = AssistantConfig::from_env()?;
    info!(model = %assistant.model, assistant = %assistant.assistant_name, "using assistant");
    let threads = AssistantClient::new(assistant);

    // Dropped before the process ends, which shuts down a launched Chrome.
    let session = NavigationSession::new(cli.provider());
    let task = Navigator::new(&session, &threads, cli.navigator_config())
        .run(&cli.url, &cli.goal, cli.max_depth)
        .await;

    if let Some(path) = &cli.trace_out {
        let json = serde_json::to_string_pretty(&task)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing trace to {}", path.display()))?;
        info!(path = %path.display(), steps = task.steps.len(), "trace written");
    }

    Ok(if report(&task) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use page_navigator::NavigationError;
    use page_navigator::types::Step;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["navigator", "https://shop.test/", "find the cart"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn task(outcome: TaskOutcome) -> NavigationTask {
        NavigationTask {
            goal: "find the cart".into(),
            max_depth: 3,
            remaining_depth: 2,
            steps: vec![Step {
                screenshot: String::new(),
                url: "https://shop.test/".into(),
            }],
            outcome,
        }
    }

    #[test]
    fn browser_is_headless_unless_asked() {
        assert!(cli(&[]).provider().headless);
        assert!(!cli(&["--headed"]).provider().headless);
        assert_eq!(
            cli(&[]).provider().navigation_timeout,
            ChromeProvider::default().navigation_timeout
        );
    }

    #[test]
    fn zero_run_timeout_waits_forever() {
        let config = cli(&["--run-timeout-secs", "0"]).navigator_config();
        assert!(config.orchestrator.run_timeout.is_none());
        assert!(!cli(&["--no-answer"]).navigator_config().allow_answer);
    }

    #[test]
    fn failures_exit_nonzero() {
        let failed = task(TaskOutcome::Failed {
            error: NavigationError::StaleIdentifier {
                identifier: "2".into(),
            },
        });
        assert!(!report(&failed));
        let reported = task(TaskOutcome::ReportedError {
            error: "404".into(),
        });
        assert!(!report(&reported));
        assert!(report(&task(TaskOutcome::DepthExhausted)));
    }
}
