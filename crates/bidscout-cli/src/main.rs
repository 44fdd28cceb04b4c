use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bidscout_core::{CutoffMode, FailedPage};
use bidscout_drivers::profile_for;
use bidscout_sync::{
    enrichment_from_workspace, InterventionGate, InterventionRequest, NaturalKeyDedup, PortalRegistry,
    RetryDecision, RetryGate, RetryMode, RunConfig, RunOutput, SyncPipeline,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bidscout")]
#[command(about = "Government bid portal sync")]
struct Cli {
    /// Debug logging and full error chains.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape enabled portals, retry failed pages, upload and write the run report.
    Run(RunArgs),
    /// Resubmit the failed pages of an earlier run.
    Retry {
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// List configured portals.
    Portals,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Keep bids posted in the last N days.
    #[arg(long, conflicts_with = "since")]
    days: Option<u32>,
    /// Keep bids posted on or after this date (YYYY-MM-DD).
    #[arg(long)]
    since: Option<NaiveDate>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// auto, interactive or none
    #[arg(long)]
    retry: Option<RetryMode>,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tfmt()
        .with_env_filter(filter)
        .with_target(debug)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}

/// One line reader shared by every operator prompt. Prompts take turns, so a line typed
/// for one is never swallowed by another reader's buffer.
struct Prompter<R> {
    lines: Mutex<Lines<R>>,
}

type StdinPrompter = Prompter<BufReader<Stdin>>;

impl StdinPrompter {
    fn stdin() -> Arc<Self> {
        Arc::new(Prompter::new(BufReader::new(tokio::io::stdin())))
    }
}

impl<R: AsyncBufRead + Unpin> Prompter<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }

    /// `None` once input is closed or unreadable.
    async fn ask(&self, prompt: &str) -> Option<String> {
        let mut lines = self.lines.lock().await;
        let mut stdout = tokio::io::stdout();
        if let Err(err) = stdout.write_all(prompt.as_bytes()).await {
            warn!(error = %err, "could not write prompt");
        }
        let _ = stdout.flush().await;
        match lines.next_line().await {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "could not read answer");
                None
            }
        }
    }
}

fn parse_decision(answer: &str) -> RetryDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => RetryDecision::Yes,
        "a" | "all" => RetryDecision::All,
        _ => RetryDecision::No,
    }
}

struct PromptRetryGate<R> {
    prompter: Arc<Prompter<R>>,
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> RetryGate for PromptRetryGate<R> {
    async fn confirm(&self, scope: &str, pages: &[FailedPage]) -> RetryDecision {
        let prompt = format!("{} failed page(s) for {scope}. Retry? [y/n/all] ", pages.len());
        match self.prompter.ask(&prompt).await {
            Some(answer) => parse_decision(&answer),
            None => {
                warn!(scope, "no answer; skipping group");
                RetryDecision::No
            }
        }
    }
}

fn spawn_intervention_listener(
    gate: Arc<InterventionGate>,
    prompter: Arc<StdinPrompter>,
    mut requests: mpsc::UnboundedReceiver<InterventionRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let prompt = format!(
                "\n[{}] manual check required at {}\nClear it in a browser, then press Enter to resume... ",
                request.portal_id, request.url
            );
            if prompter.ask(&prompt).await.is_some() && !gate.resume(&request.portal_id) {
                warn!(portal_id = %request.portal_id, "portal stopped waiting before resume");
            }
        }
    })
}

fn apply_run_args(config: &mut RunConfig, args: &RunArgs) -> Result<()> {
    if args.days.is_some() || args.since.is_some() {
        config.cutoff_mode = CutoffMode::from_options(args.since, args.days)?;
    }
    if let Some(batch_size) = args.batch_size.filter(|n| *n > 0) {
        config.batch_size = batch_size;
    }
    if let Some(mode) = args.retry {
        config.retry_mode = mode;
    }
    Ok(())
}

fn print_output(output: &RunOutput) {
    let summary = &output.summary;
    for line in summary.failure_lines() {
        eprintln!("{line}");
    }
    for portal in &summary.portals {
        println!(
            "{:<28} {:<20} {:>4} records",
            portal.display_name,
            portal.status.to_string(),
            portal.records
        );
        for (city, n) in &portal.cities {
            println!("    {city:<24} {n:>4}");
        }
    }
    let totals = &summary.totals;
    println!(
        "run complete: run_id={} cutoff={} records={} uploaded={} upload_failed={} still_failed={} recovered={} excluded={}",
        summary.run_id,
        summary.cutoff,
        totals.records,
        totals.uploaded,
        totals.upload_failed,
        totals.failed_pages,
        totals.recovered_pages,
        totals.excluded_by_cutoff
    );
    if summary.upload.skipped {
        println!("upload skipped (no record store configured); snapshots in {}", output.run_dir.display());
    }
}

fn build_pipeline(config: RunConfig) -> Result<(SyncPipeline, tokio::task::JoinHandle<()>)> {
    let enrichment = enrichment_from_workspace(&config.workspace_root)?;
    let interactive = config.retry_mode == RetryMode::Interactive;
    let (tx, rx) = mpsc::unbounded_channel();
    let prompter = StdinPrompter::stdin();
    let mut pipeline = SyncPipeline::new(config)?
        .with_hooks(Box::new(NaturalKeyDedup), enrichment)
        .with_intervention_notifier(tx);
    if interactive {
        pipeline = pipeline.with_retry_gate(Arc::new(PromptRetryGate {
            prompter: prompter.clone(),
        }));
    }
    let listener = spawn_intervention_listener(pipeline.gate(), prompter, rx);

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing portals already running");
            cancel.cancel();
        }
    });
    Ok((pipeline, listener))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = RunConfig::from_env()?;
    config.debug |= cli.debug;
    init_tracing(config.debug);

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            apply_run_args(&mut config, &args)?;
            let (pipeline, listener) = build_pipeline(config)?;
            let output = pipeline.run_once().await?;
            listener.abort();
            print_output(&output);
        }
        Commands::Retry { from } => {
            let path = from.unwrap_or_else(|| config.output_dir.join(bidscout_sync::FAILED_PAGES_FILE));
            info!(path = %path.display(), "resubmitting failed pages");
            let (pipeline, listener) = build_pipeline(config)?;
            let output = pipeline.retry_from_file(&path).await?;
            listener.abort();
            print_output(&output);
        }
        Commands::Portals => {
            let path = config.portals_path();
            let registry = PortalRegistry::load(&path)
                .await
                .with_context(|| format!("loading {}", path.display()))?;
            for portal in &registry.portals {
                let driver = match profile_for(&portal.portal_id) {
                    Some(profile) if profile.is_multi_agency() => "multi-agency",
                    Some(_) => "single-agency",
                    None => "no driver",
                };
                println!(
                    "{:<14} {:<8} {:<8} {:<14} {} target(s)",
                    portal.portal_id,
                    if portal.enabled { "enabled" } else { "disabled" },
                    format!("{:?}", portal.mode).to_ascii_lowercase(),
                    driver,
                    portal.targets.len()
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let debug = cli.debug;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if debug {
                eprintln!("error: {err:?}");
            } else {
                eprintln!("error: {err}");
            }
            ExitCode::FAILURE
        }
    }
}
