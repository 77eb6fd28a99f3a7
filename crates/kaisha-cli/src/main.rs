//! Kaisha demo binary.
//!
//! Runs a session against an in-memory company server and plays a script of
//! steps, printing the reconciled view as it goes.
//!
//! Usage:
//!   # Rename, then watch the echo get dropped and the rename confirm
//!   cargo run -p kaisha-cli -- "rename 1 Acme Corp" wait show
//!
//!   # Rejected delete rolls back
//!   cargo run -p kaisha-cli -- "fail reject locked" "delete 2" show wait show
//!
//!   # Other clients' deletes only show after a refetch
//!   cargo run -p kaisha-cli -- "external-delete 1" show refresh show
//!
//! Logging is controlled with RUST_LOG and goes to stderr.

mod step;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kaisha_cache::ConflictPolicy;
use kaisha_client::{MemoryServer, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use kaisha_types::{Company, OperationId};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt};

use step::Step;

const DEFAULT_LOG_FILTER: &str = "kaisha_cli=info,kaisha_client=info,kaisha_cache=info,warn";

/// How long `wait` gives in-flight mutations to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Queue,
    Reject,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Queue => ConflictPolicy::Queue,
            PolicyArg::Reject => ConflictPolicy::Reject,
        }
    }
}

/// Optimistic company cache, driven against an in-memory server.
#[derive(Parser, Debug)]
#[command(name = "kaisha")]
#[command(about = "Play mutation scripts against an optimistic company cache")]
struct Args {
    /// Company names the server starts with (ids from 1)
    #[arg(long = "seed", default_values_t = ["Acme".to_string(), "Globex".to_string(), "Initech".to_string()])]
    seeds: Vec<String>,

    /// Server response latency in milliseconds
    #[arg(long, default_value_t = 100)]
    latency_ms: u64,

    /// What to do with a second mutation on a busy company
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Fail round trips slower than this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Session config file (defaults to ~/.config/kaisha/session.ron)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print views as JSON
    #[arg(long)]
    json: bool,

    /// Steps to run in order, e.g. "rename 1 Acme Corp"
    #[arg(value_parser = clap::value_parser!(Step))]
    steps: Vec<Step>,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_or_default(path),
            None => SessionConfig::load(),
        };
        if let Some(policy) = self.policy {
            config = config.with_conflict_policy(policy.into());
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_round_trip_timeout(Duration::from_millis(ms));
        }
        config.with_fetch_on_start(true)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let server = Arc::new(MemoryServer::with_companies(args.seeds.clone()));
    server.set_latency(Duration::from_millis(args.latency_ms));

    let session = spawn_session(server.clone(), args.session_config());
    spawn_event_logger(&session);

    let count = session.refresh().await.context("initial fetch")?;
    tracing::info!(companies = count, "session live");

    for step in &args.steps {
        run_step(&session, &server, step, args.json).await?;
    }

    wait_settled(&session).await?;
    println!("final:");
    print_view(&session.companies().await?, args.json)?;

    session.close().await?;
    Ok(())
}

async fn run_step(
    session: &SessionHandle,
    server: &MemoryServer,
    step: &Step,
    json: bool,
) -> Result<()> {
    tracing::debug!(?step, "step");
    match step {
        Step::Add(name) => report(session.request_add(name).await, "add"),
        Step::Rename(id, name) => report(session.request_rename(*id, name).await, "rename"),
        Step::Delete(id) => report(session.request_delete(*id).await, "delete"),
        Step::ExternalAdd(name) => {
            let company = server.external_add(name);
            println!("server: another client added {} {:?}", company.id, company.name);
        }
        Step::ExternalRename(id, name) => match server.external_rename(*id, name) {
            Some(company) => println!("server: another client renamed {} to {:?}", id, company.name),
            None => println!("server: no company {id}"),
        },
        Step::ExternalDelete(id) => {
            if server.external_delete(*id) {
                println!("server: another client deleted {id} (not pushed)");
            } else {
                println!("server: no company {id}");
            }
        }
        Step::Fail(fault) => {
            server.fail_next(fault.clone());
            println!("server: next mutation fails with {fault:?}");
        }
        Step::Refresh => {
            let count = session.refresh().await?;
            println!("refetched {count} companies");
        }
        Step::Wait => wait_settled(session).await?,
        Step::Show => print_view(&session.companies().await?, json)?,
    }
    Ok(())
}

fn report(result: Result<OperationId, kaisha_client::SessionError>, what: &str) {
    match result {
        Ok(op) => println!("{what}: {op} applied optimistically"),
        Err(e) => println!("{what}: refused: {e}"),
    }
}

/// Block until no mutation is open or queued.
async fn wait_settled(session: &SessionHandle) -> Result<()> {
    let mut rx = session.subscribe();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        loop {
            if session.status().await?.is_settled() {
                return Ok::<(), anyhow::Error>(());
            }
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => anyhow::bail!("session closed while waiting"),
            }
        }
    })
    .await
    .context("mutations did not settle")?
}

fn print_view(companies: &[Company], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(companies)?);
        return Ok(());
    }
    for company in companies {
        println!("  {:>4}  {}", company.id.get(), company.name);
    }
    if companies.is_empty() {
        println!("  (empty)");
    }
    Ok(())
}

fn spawn_event_logger(session: &SessionHandle) {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::MutationConfirmed { operation_id, kind }) => {
                    tracing::info!(%operation_id, %kind, "confirmed");
                }
                Ok(SessionEvent::MutationFailed { operation_id, reason }) => {
                    tracing::warn!(%operation_id, %reason, "failed, rolled back");
                }
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => break,
                Ok(event) => tracing::debug!(?event, "session event"),
                Err(RecvError::Lagged(missed)) => tracing::debug!(missed, "event logger lagged"),
            }
        }
    });
}
