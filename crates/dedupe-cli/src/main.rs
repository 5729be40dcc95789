use std::future::Future;
use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use dedupe_engine::{run_dedupe, DedupeConfig, RunId, StopHandle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dedupe-cli")]
#[command(about = "Remove duplicate harvested datasets from a CKAN catalog, keeping the oldest")]
struct Cli {
    /// Organizations to dedupe; every organization when omitted.
    organizations: Vec<String>,

    #[arg(long)]
    api_url: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    /// Apply updates and removals. Without this the catalog is only read.
    #[arg(long)]
    commit: bool,

    #[arg(long)]
    run_id: Option<String>,

    #[arg(long)]
    batch_rows: Option<usize>,

    #[arg(long)]
    removed_package_log: Option<PathBuf>,

    #[arg(long)]
    duplicate_package_log: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,

    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn apply_to(self, config: &mut DedupeConfig) -> Vec<String> {
        if let Some(api_url) = self.api_url {
            config.api_url = api_url;
        }
        if self.api_key.is_some() {
            config.api_key = self.api_key;
        }
        config.commit |= self.commit;
        if let Some(run_id) = self.run_id {
            config.run_id = RunId::new(run_id);
        }
        if let Some(rows) = self.batch_rows {
            config.batch_rows = rows;
        }
        if self.removed_package_log.is_some() {
            config.removed_package_log = self.removed_package_log;
        }
        if self.duplicate_package_log.is_some() {
            config.duplicate_package_log = self.duplicate_package_log;
        }
        self.organizations
    }
}

fn init_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// The first interrupt asks the run to stop after the current dataset; a second
/// one returns the exit code the process should terminate with.
async fn handle_interrupts<S, Fut>(mut next_signal: S, stop: StopHandle) -> Option<i32>
where
    S: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    next_signal().await.ok()?;
    warn!("Interrupt received, stopping after the current dataset; interrupt again to abort");
    stop.stop();

    next_signal().await.ok()?;
    warn!("Second interrupt received, aborting");
    Some(130)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);

    let mut config = DedupeConfig::from_env();
    let organizations = cli.apply_to(&mut config);

    let stop = StopHandle::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if let Some(code) = handle_interrupts(tokio::signal::ctrl_c, signal_stop).await {
            std::process::exit(code);
        }
    });

    let summary = run_dedupe(&config, organizations, stop).await?;
    println!(
        "dedupe complete: run_id={} organizations={} failed={} duplicates={} commit={} stopped={}",
        summary.run_id,
        summary.organizations,
        summary.failed_organizations,
        summary.duplicates_removed,
        summary.commit,
        summary.stopped,
    );
    println!(
        "audit logs: removed={} duplicates={}",
        summary.removed_package_log, summary.duplicate_package_log
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::{ready, Ready};

    fn scripted(signals: Vec<io::Result<()>>) -> impl FnMut() -> Ready<io::Result<()>> {
        let mut signals = VecDeque::from(signals);
        move || {
            ready(
                signals
                    .pop_front()
                    .unwrap_or_else(|| Err(io::Error::other("no more signals"))),
            )
        }
    }

    #[tokio::test]
    async fn second_interrupt_aborts_with_130() {
        let stop = StopHandle::new();
        let code = handle_interrupts(scripted(vec![Ok(()), Ok(())]), stop.clone()).await;
        assert_eq!(code, Some(130));
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn single_interrupt_only_requests_a_stop() {
        let stop = StopHandle::new();
        let signals = vec![Ok(()), Err(io::Error::other("listener closed"))];
        let code = handle_interrupts(scripted(signals), stop.clone()).await;
        assert_eq!(code, None);
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn failed_listener_leaves_run_untouched() {
        let stop = StopHandle::new();
        let signals = vec![Err(io::Error::other("no handler"))];
        let code = handle_interrupts(scripted(signals), stop.clone()).await;
        assert_eq!(code, None);
        assert!(!stop.is_stopped());
    }
}
