//! `attestor-worker` -- runs one validation request and prints the result.
//!
//! The request is read from the file named by the first argument, else from
//! `ATTESTOR_REQUEST`, else from stdin. The run result is written to stdout
//! as JSON; logs go to stderr.
//!
//! # Environment variables
//!
//! | Variable                | Required | Default      | Description                                 |
//! |-------------------------|----------|--------------|---------------------------------------------|
//! | `ATTESTOR_REQUEST`      | no       | --           | Path of the request JSON                    |
//! | `ATTESTOR_FIXTURES_DIR` | no       | `./fixtures` | Root for `file` tools without a connection  |
//! | `ATTESTOR_JUDGE_URL`    | no       | --           | Semantic judgment endpoint                  |
//! | `LOG_FORMAT`            | no       | `text`       | `json` for structured logs                  |
//!
//! Runtime overrides (`ATTESTOR_RULE_TIMEOUT_MS`, `ATTESTOR_RETRIES`, ...)
//! are documented on `RuntimeConfig::apply_env`.
//!
//! Exit status: `0` for PASS or WARN, `1` for FAIL, `3` for INCOMPLETE and
//! `2` when the request could not be run at all.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use attestor_core::outcome::CheckStatus;
use attestor_engine::{Engine, HttpJudgmentService, ValidationRequest};
use attestor_events::{EventBus, EventLogger};
use attestor_tools::file::FileDriver;
use attestor_tools::http::HttpDriver;
use attestor_tools::{DriverRegistry, ToolKind};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default root for `file` tool fixtures.
const DEFAULT_FIXTURES_DIR: &str = "./fixtures";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    match run().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::error!(error = ?e, "Run aborted");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "attestor_worker=info,attestor_engine=info,attestor_tools=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run() -> anyhow::Result<CheckStatus> {
    let mut request = load_request().await?;
    request
        .runtime
        .apply_env()
        .context("invalid runtime override")?;

    let fixtures =
        std::env::var("ATTESTOR_FIXTURES_DIR").unwrap_or_else(|_| DEFAULT_FIXTURES_DIR.into());
    let mut drivers = DriverRegistry::new();
    drivers.register_kind(ToolKind::Http, Arc::new(HttpDriver::new()));
    drivers.register_kind(ToolKind::File, Arc::new(FileDriver::new(&fixtures)));

    let events = Arc::new(EventBus::default());
    let logger = tokio::spawn(EventLogger::run(events.subscribe()));

    let mut engine = Engine::new(drivers).with_events(Arc::clone(&events));
    if let Ok(url) = std::env::var("ATTESTOR_JUDGE_URL") {
        tracing::info!(url = %url, "Semantic judgment enabled");
        let judge = HttpJudgmentService::new(url).context("judgment client")?;
        engine = engine.with_judgment(Arc::new(judge));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    tracing::info!(
        records = request.data.len(),
        rules = request.rules.rules.len(),
        tools = request.tools.len(),
        fixtures = %fixtures,
        "Starting run",
    );
    let result = engine.execute(request, cancel).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    // Closing the bus ends the logger once it has drained.
    drop(engine);
    drop(events);
    if let Ok(logged) = logger.await {
        tracing::debug!(events = logged, "Event logger finished");
    }
    Ok(result.status)
}

async fn load_request() -> anyhow::Result<ValidationRequest> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ATTESTOR_REQUEST").ok());
    let raw = match &path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading request from {path}"))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("reading request from stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("parsing request")
}

fn exit_code(status: CheckStatus) -> ExitCode {
    match status {
        CheckStatus::Pass | CheckStatus::Warn => ExitCode::SUCCESS,
        CheckStatus::Fail => ExitCode::from(1),
        CheckStatus::Incomplete => ExitCode::from(3),
    }
}
