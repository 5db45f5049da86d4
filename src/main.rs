use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use secscan_rs::commands::CommandTable;
use secscan_rs::hub::{BroadcastHub, RunEvent, SUBSCRIBER_BUFFER};
use secscan_rs::orchestrator::{Orchestrator, RunSettings};
use secscan_rs::server::{self, AppState};
use secscan_rs::store::FsReportStore;
use secscan_rs::types::{new_run_id, Report, RunKind, RunRequest};

const DEFAULT_LOG_FILTER: &str = "secscan_rs=info,tower_http=info";

/// secscan-rs: runs security scan tools and streams their output to a web dashboard.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "secscan-rs",
    version,
    about = "Runs security scan tools, streams live output over WebSockets and keeps a JSON report per run.",
    long_about = None
)]
struct Cli {
    /// Address the HTTP server listens on.
    #[arg(long, env = "SECSCAN_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Working directory scan scripts are resolved against and run in.
    #[arg(long = "app-home", env = "APP_HOME", default_value = "/app")]
    app_home: PathBuf,

    /// Directory holding one `<run_id>.json` report per finished run.
    #[arg(long = "reports-dir", env = "REPORTS_DIR", default_value = "reports")]
    reports_dir: PathBuf,

    /// Directory with the built dashboard UI.
    #[arg(long = "static-dir", env = "STATIC_DIR", default_value = "ui")]
    static_dir: PathBuf,

    /// JSON file mapping each scan kind to its command. Defaults to the bundled scripts.
    #[arg(long, env = "SECSCAN_COMMANDS")]
    commands: Option<PathBuf>,

    /// Milliseconds an observer gets to accept one event before it is dropped.
    #[arg(long = "send-timeout-ms", default_value_t = 2000)]
    send_timeout_ms: u64,

    /// Run one scan kind (or `all`) in the foreground, print its output, and exit.
    #[arg(long)]
    run: Option<RunKind>,

    /// Target handed to the scan (e.g. an image reference), used with `--run`.
    #[arg(long)]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let commands = match &cli.commands {
        Some(path) => CommandTable::load_from_path(path)?,
        None => CommandTable::default_scripts(),
    };

    info!(
        bind = %cli.bind,
        app_home = %cli.app_home.display(),
        reports_dir = %cli.reports_dir.display(),
        static_dir = %cli.static_dir.display(),
        commands = %cli
            .commands
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<bundled scripts>".to_string()),
        "secscan-rs configuration"
    );

    let hub = BroadcastHub::with_send_timeout(Duration::from_millis(cli.send_timeout_ms));
    let store = Arc::new(FsReportStore::new(&cli.reports_dir));
    let orchestrator = Orchestrator::new(
        hub,
        store,
        commands,
        RunSettings::new(&cli.app_home),
    );

    if let Some(kind) = cli.run {
        let report = run_foreground(&orchestrator, kind, cli.target.clone()).await?;
        print_report_table(&report);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        on_ctrl_c.cancel();
    });

    let app = server::router(AppState::new(orchestrator), &cli.static_dir);
    server::serve(&cli.bind, app, shutdown).await
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Start a run, echo its live output to stdout, and wait for the end-of-stream marker.
async fn run_foreground(
    orchestrator: &Orchestrator,
    kind: RunKind,
    target: Option<String>,
) -> Result<Report> {
    let run_id = new_run_id();
    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    let observer = tx.downgrade();
    orchestrator.hub().subscribe(&run_id, tx).await;

    let mut request = RunRequest::new(kind).with_run_id(run_id.clone());
    request.target = target;
    orchestrator.start(request).await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Output { text } => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            RunEvent::StepStarted { kind, index, total } => {
                println!("--- Starting {kind} scan ({index}/{total}) ---");
            }
            RunEvent::StepFinished { kind, status, .. } => {
                println!("--- {kind} scan finished with status: {status} ---");
            }
            RunEvent::ReportSaved { location } => println!("Report saved to {location}"),
            RunEvent::RunError { message } => eprintln!("Error: {message}"),
            RunEvent::RunComplete { .. } => break,
        }
    }
    if let Some(tx) = observer.upgrade() {
        orchestrator.hub().unsubscribe(&run_id, &tx).await;
    }

    orchestrator
        .store()
        .read(&run_id)
        .await?
        .with_context(|| format!("report {run_id} was not stored"))
}

fn print_report_table(report: &Report) {
    let kind_w = "scan".len().max(
        report
            .results
            .iter()
            .map(|r| r.kind.as_str().len())
            .max()
            .unwrap_or(0),
    );
    let status_w = "failed".len().max("status".len());
    let code_w = "exit".len();

    println!("\nRun {} ({}): {}", report.id, report.request.run_kind, report.status());
    println!(
        "{:<kind_w$}  {:<status_w$}  {:>code_w$}  {:<20}  {:<20}",
        "scan", "status", "exit", "started_at", "finished_at",
    );
    println!(
        "{:-<kind_w$}  {:-<status_w$}  {:-<code_w$}  {:-<20}  {:-<20}",
        "", "", "", "", "",
    );
    for r in &report.results {
        println!(
            "{:<kind_w$}  {:<status_w$}  {:>code_w$}  {:<20}  {:<20}",
            r.kind.as_str(),
            r.status.as_str(),
            r.exit_code,
            r.started_at,
            r.finished_at,
        );
    }
}
