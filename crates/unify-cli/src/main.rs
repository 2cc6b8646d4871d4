use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use unify_core::Source;
use unify_sync::{summarize_run, SourceRegistry, SyncRuntime};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "unify-cli")]
#[command(about = "Customer data sync and revenue recovery command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one source sync to a terminal state (ctrl-c cancels between pages).
    Sync {
        source: Source,
        #[arg(long)]
        dry_run: bool,
    },
    /// Sync every source enabled in sources.yaml, one after another.
    SyncAll {
        #[arg(long)]
        dry_run: bool,
    },
    /// Process the next page of an existing run.
    Continue { run_id: Uuid },
    /// Cancel an active run; its checkpoint is kept for audit.
    Cancel { run_id: Uuid },
    /// Fail runs idle past the threshold, freeing their source slots.
    Sweep {
        source: Option<Source>,
        #[arg(long)]
        idle_minutes: Option<u64>,
    },
    /// Retry failed invoices from the lookback window (resumable).
    Recover {
        #[arg(long, default_value_t = 72)]
        hours: u32,
    },
    /// Serve the admin API.
    Serve,
}

fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.store(true, Ordering::Relaxed);
            eprintln!("stopping after the current batch...");
        }
    });
    flag
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { source, dry_run } => {
            let runtime = SyncRuntime::from_env().await?;
            let cancel = cancel_on_ctrl_c();
            let run = runtime.controller.drive(source, dry_run, &cancel).await?;
            println!("{}", summarize_run(&run));
        }
        Commands::SyncAll { dry_run } => {
            let runtime = SyncRuntime::from_env().await?;
            let registry = SourceRegistry::load(&runtime.config.workspace_root).await?;
            let cancel = cancel_on_ctrl_c();
            for source in registry.enabled_sources() {
                match runtime.controller.drive(source, dry_run, &cancel).await {
                    Ok(run) => println!("{}", summarize_run(&run)),
                    Err(err) => eprintln!("{source}: {err}"),
                }
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
        Commands::Continue { run_id } => {
            let runtime = SyncRuntime::from_env().await?;
            let outcome = runtime.controller.process_next_page(run_id).await?;
            println!(
                "run {} status={} has_more={} checkpoint={}",
                outcome.run_id,
                outcome.status,
                outcome.has_more,
                outcome.checkpoint.as_deref().unwrap_or("-")
            );
        }
        Commands::Cancel { run_id } => {
            let runtime = SyncRuntime::from_env().await?;
            let run = runtime.controller.cancel(run_id).await?;
            println!("{}", summarize_run(&run));
        }
        Commands::Sweep {
            source,
            idle_minutes,
        } => {
            let runtime = SyncRuntime::from_env().await?;
            let threshold = idle_minutes.map(|mins| std::time::Duration::from_secs(mins * 60));
            let targets = match source {
                Some(source) => vec![source],
                None => Source::ALL.to_vec(),
            };
            for source in targets {
                let swept = runtime.controller.sweep_stale(source, threshold).await?;
                println!("{source}: swept {swept}");
            }
        }
        Commands::Recover { hours } => {
            let runtime = SyncRuntime::from_env().await?;
            let cancel = cancel_on_ctrl_c();
            let outcome = runtime.recovery.run_recovery(hours, &cancel).await?;
            println!(
                "recovery run {} status={} batches={} succeeded={} failed={} skipped={} recovered={:.2} has_more={}",
                outcome.sync_run_id,
                outcome.status,
                outcome.batches_done,
                outcome.succeeded,
                outcome.failed,
                outcome.skipped,
                outcome.recovered_amount,
                outcome.has_more
            );
        }
        Commands::Serve => {
            let runtime = SyncRuntime::from_env().await?;
            if let Some(scheduler) = runtime.maybe_build_scheduler().await? {
                scheduler.start().await?;
            }
            unify_web::serve(runtime).await?;
        }
    }

    Ok(())
}
