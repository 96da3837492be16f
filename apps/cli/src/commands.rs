//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use linkflow_core::{Engine, ItemDetail, StatusReport, Sweeper};
use linkflow_shared::{
    AppConfig, Classification, ItemRef, PipelineConfig, Provenance, Stage, Status, init_config,
    load_config, load_config_from, resolve_db_path,
};
use linkflow_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// linkflow: crash-safe stage pipeline for external links.
#[derive(Parser)]
#[command(
    name = "linkflow",
    version,
    about = "Move links through classification, acquisition, normalization and extraction.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.linkflow/linkflow.toml).
    #[arg(long, env = "LINKFLOW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database path, overriding the config file.
    #[arg(long, env = "LINKFLOW_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit links (idempotent: resubmitting merges provenance).
    Submit {
        /// Links to submit.
        links: Vec<String>,

        /// Read additional links from a file, one per line.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Source connector name (e.g. `sheet:August`).
        #[arg(long)]
        source: Option<String>,

        /// Position within the source (row, tab, page id).
        #[arg(long)]
        locator: Option<String>,

        /// Category hint from the source (jobs, posts).
        #[arg(long)]
        category: Option<String>,

        /// Date as written in the source.
        #[arg(long)]
        date: Option<String>,
    },

    /// Classify new items and route them to acquisition queues.
    Advance {
        /// Maximum items per pass.
        #[arg(long, default_value = "500")]
        limit: u32,
    },

    /// Run one sweep pass (retry due items, reclaim stuck items).
    Sweep,

    /// Advance and sweep continuously until Ctrl-C.
    Run {
        /// Maximum items per advance pass.
        #[arg(long, default_value = "500")]
        limit: u32,
    },

    /// Show item counts per status and back-pressure gates.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show one item with its transition history and outputs.
    Inspect {
        /// Item id or link.
        item: ItemRef,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Make an item eligible now.
    Requeue {
        /// Item id or link.
        item: ItemRef,
    },

    /// Return a dead item to the stage that failed it.
    Revive {
        /// Item id or link.
        item: ItemRef,

        /// Note appended to the item's error for the audit trail.
        #[arg(long)]
        note: Option<String>,
    },

    /// Assign job or post to an item parked as unknown.
    Reclassify {
        /// Item id or link.
        item: ItemRef,

        /// New classification: job or post.
        classification: Classification,
    },

    /// Delete old stage outputs of finished or dead items.
    Prune {
        /// Stage whose outputs to prune.
        stage: Stage,

        /// Keep outputs younger than this many days.
        #[arg(long, default_value = "30")]
        older_than_days: u64,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "linkflow=info",
        1 => "linkflow=debug",
        _ => "linkflow=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = Context::load(cli.config.as_deref(), cli.db.as_deref())?;
    match cli.command {
        Command::Submit {
            links,
            file,
            source,
            locator,
            category,
            date,
        } => {
            let provenance = Provenance {
                source,
                locator,
                category,
                date_in_source: date,
            };
            cmd_submit(&ctx, links, file.as_deref(), &provenance).await
        }
        Command::Advance { limit } => cmd_advance(&ctx, limit).await,
        Command::Sweep => cmd_sweep(&ctx).await,
        Command::Run { limit } => cmd_run(&ctx, limit).await,
        Command::Status { json } => cmd_status(&ctx, json).await,
        Command::Inspect { item, json } => cmd_inspect(&ctx, &item, json).await,
        Command::Requeue { item } => cmd_requeue(&ctx, &item).await,
        Command::Revive { item, note } => cmd_revive(&ctx, &item, note.as_deref()).await,
        Command::Reclassify {
            item,
            classification,
        } => cmd_reclassify(&ctx, &item, classification).await,
        Command::Prune {
            stage,
            older_than_days,
        } => cmd_prune(&ctx, stage, older_than_days).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&ctx),
        },
    }
}

/// Resolved config and database location shared by every command.
struct Context {
    config: AppConfig,
    db_path: PathBuf,
}

impl Context {
    fn load(config_path: Option<&Path>, db_override: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let db_path = match db_override {
            Some(path) => path.to_path_buf(),
            None => resolve_db_path(&config)?,
        };
        Ok(Self { config, db_path })
    }

    async fn engine(&self) -> Result<Arc<Engine>> {
        let storage = Storage::open(&self.db_path).await?;
        self.build(storage)
    }

    /// Engine over a read-only connection, for commands that only look.
    async fn reader(&self) -> Result<Arc<Engine>> {
        if !self.db_path.exists() {
            return Err(eyre!(
                "no database at '{}'; submit some links first",
                self.db_path.display()
            ));
        }
        let storage = Storage::open_readonly(&self.db_path).await?;
        self.build(storage)
    }

    fn build(&self, storage: Storage) -> Result<Arc<Engine>> {
        let engine = Engine::new(Arc::new(storage), PipelineConfig::from(&self.config))?;
        Ok(Arc::new(engine))
    }
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn cmd_submit(
    ctx: &Context,
    mut links: Vec<String>,
    file: Option<&Path>,
    provenance: &Provenance,
) -> Result<()> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
        links.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    if links.is_empty() {
        return Err(eyre!("no links given"));
    }

    let engine = ctx.engine().await?;
    let (mut inserted, mut merged, mut rejected) = (0, 0, 0);
    for link in &links {
        match engine.submit(link, provenance).await {
            Ok(result) if result.inserted => inserted += 1,
            Ok(_) => merged += 1,
            Err(e) => {
                error!(link = %link, error = %e, "rejected link");
                rejected += 1;
            }
        }
    }

    println!("  Submitted: {}", links.len());
    println!("  New:       {inserted}");
    println!("  Merged:    {merged}");
    println!("  Rejected:  {rejected}");
    Ok(())
}

async fn cmd_advance(ctx: &Context, limit: u32) -> Result<()> {
    let engine = ctx.engine().await?;
    let report = engine.advance(limit).await?;

    println!(
        "  Classified: {} (job {}, post {}, unknown {})",
        report.classify.classified(),
        report.classify.job,
        report.classify.post,
        report.classify.unknown
    );
    println!("  Routed:     {}", report.route.routed);
    if report.route.deferred {
        println!("  Acquisition backlog is full; remaining items wait for the next pass.");
    }
    Ok(())
}

async fn cmd_sweep(ctx: &Context) -> Result<()> {
    let engine = ctx.engine().await?;
    let report = Sweeper::new(engine).sweep_once().await?;

    println!("  Retried:       {}", report.retried);
    println!("  Reclaimed:     {}", report.reclaimed);
    println!("  Dead-lettered: {}", report.dead_lettered);
    Ok(())
}

async fn cmd_run(ctx: &Context, limit: u32) -> Result<()> {
    let engine = ctx.engine().await?;
    let shutdown = CancellationToken::new();

    let sweeper = Sweeper::new(engine.clone());
    let sweep_shutdown = shutdown.clone();
    let sweep_task = tokio::spawn(async move { sweeper.run(sweep_shutdown).await });

    let period = engine.config().sweep_interval;
    info!(
        db = %ctx.db_path.display(),
        interval_secs = period.as_secs(),
        "pipeline running, Ctrl-C to stop"
    );

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = engine.advance(limit).await {
                    error!(error = %e, "advance pass failed");
                }
            }
        }
    }

    shutdown.cancel();
    sweep_task
        .await
        .map_err(|e| eyre!("sweeper task failed: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

async fn cmd_status(ctx: &Context, json: bool) -> Result<()> {
    let engine = ctx.reader().await?;
    let report = engine.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!();
    for status in Status::all() {
        let count = report.count(status);
        if count > 0 {
            println!("  {:<22} {count:>8}", status.to_string());
        }
    }
    println!();
    for gate in &report.gates {
        let threshold = gate
            .threshold
            .map_or_else(|| "-".to_string(), |t| t.to_string());
        let state = if gate.is_open() { "open" } else { "CLOSED" };
        println!(
            "  gate {:<15} backlog {:>6} / {:>6}  {state}",
            gate.stage.as_str(),
            gate.backlog,
            threshold
        );
    }
    println!();
}

async fn cmd_inspect(ctx: &Context, item: &ItemRef, json: bool) -> Result<()> {
    let engine = ctx.reader().await?;
    let detail = engine.inspect(item).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail_json(&detail))?);
        return Ok(());
    }

    let item = &detail.item;
    println!();
    println!("  ID:             {}", item.id);
    println!("  Link:           {}", item.link);
    println!("  Key:            {}", item.identity_key);
    println!("  Classification: {}", item.classification);
    println!("  Status:         {}", item.status);
    println!(
        "  Attempts:       {} (pipeline total {})",
        item.attempt_count, item.total_attempts
    );
    println!("  Eligible at:    {}", item.next_eligible_at.to_rfc3339());
    if let Some(err) = &item.last_error {
        println!("  Last error:     {err}");
    }
    println!();
    println!("  Transitions:");
    for t in &detail.transitions {
        println!(
            "    {}  {:<18} -> {:<18} {:<14} {}",
            t.at.to_rfc3339(),
            t.from.to_string(),
            t.to.to_string(),
            t.outcome.as_str(),
            t.detail.as_deref().unwrap_or("")
        );
    }
    println!();
    println!("  Outputs:");
    for output in &detail.outputs {
        println!(
            "    {:<14} produced {}",
            output.stage.as_str(),
            output.produced_at.to_rfc3339()
        );
    }
    println!("  Sightings:      {}", detail.sightings.len());
    println!();
    Ok(())
}

fn detail_json(detail: &ItemDetail) -> serde_json::Value {
    let sightings: Vec<serde_json::Value> = detail
        .sightings
        .iter()
        .map(|s| {
            serde_json::json!({
                "provenance": s.provenance,
                "seen_at": s.seen_at,
            })
        })
        .collect();
    serde_json::json!({
        "item": detail.item,
        "transitions": detail.transitions,
        "outputs": detail.outputs,
        "sightings": sightings,
    })
}

// ---------------------------------------------------------------------------
// Operator commands
// ---------------------------------------------------------------------------

async fn cmd_requeue(ctx: &Context, item: &ItemRef) -> Result<()> {
    let engine = ctx.engine().await?;
    let item = engine.requeue(item).await?;
    println!("  Requeued {} ({})", item.id, item.status);
    Ok(())
}

async fn cmd_revive(ctx: &Context, item: &ItemRef, note: Option<&str>) -> Result<()> {
    let engine = ctx.engine().await?;
    let item = engine.revive(item, note).await?;
    println!("  Revived {} -> {}", item.id, item.status);
    Ok(())
}

async fn cmd_reclassify(
    ctx: &Context,
    item: &ItemRef,
    classification: Classification,
) -> Result<()> {
    let engine = ctx.engine().await?;
    let item = engine.reclassify(item, classification).await?;
    println!("  Reclassified {} as {}", item.id, item.classification);
    Ok(())
}

async fn cmd_prune(ctx: &Context, stage: Stage, older_than_days: u64) -> Result<()> {
    let engine = ctx.engine().await?;
    let age = Duration::from_secs(older_than_days.saturating_mul(24 * 3600));
    let removed = engine.prune(stage, age).await?;
    println!("  Pruned {removed} {stage} output(s) older than {older_than_days} days");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(ctx: &Context) -> Result<()> {
    let toml_str = toml::to_string_pretty(&ctx.config)?;
    println!("{toml_str}");
    println!("# database resolved to {}", ctx.db_path.display());
    Ok(())
}
