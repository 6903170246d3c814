use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use muxpress::filesystem::{BasePathFs, OsFs};
use muxpress::options::{self, Configure};
use muxpress::{Options, ScriptHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunnerKind {
    /// Script work takes turns behind a lock
    Sync,
    /// Script work is queued onto one ordered task
    Loop,
}

#[derive(Debug, Parser)]
#[command(name = "muxpress", version, about = "Run a script that serves HTTP with an Express-style API")]
struct Args {
    /// Script to execute
    script: PathBuf,

    /// Directory that static mounts are resolved against
    #[arg(long, env = "MUXPRESS_ROOT")]
    root: Option<PathBuf>,

    /// How request handling is serialized with the script
    #[arg(long, value_enum, default_value_t = RunnerKind::Sync)]
    runner: RunnerKind,
}

fn main() -> muxpress::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,muxpress=debug")),
        )
        .init();

    let args = Args::parse();
    let source = std::fs::read_to_string(&args.script)?;
    let name = args.script.to_string_lossy().to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let interrupted = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
                interrupted.cancel();
            }
        });

        let mut configure: Vec<Configure> = vec![options::with_context(move || shutdown.child_token())];
        if let Some(root) = args.root {
            debug!(root = %root.display(), "serving files from");
            configure.push(options::with_fs(Arc::new(BasePathFs::new(Arc::new(OsFs), root))));
        }
        if args.runner == RunnerKind::Loop {
            configure.push(options::with_run_on_loop());
        }

        let mut host = ScriptHost::new(Options::resolve(configure)?)?;
        host.execute(&name, source)?;
        host.run().await
    })
}
