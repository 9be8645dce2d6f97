use crate::config::Config;
use crate::logging::LogWriter;
use crate::state::Engine;
use std::sync::Arc;
use tokio::{signal, task::JoinSet};
use tokio_util::sync::CancellationToken;

pub struct ServerArgs {
    pub logs: Arc<LogWriter>,
    pub config: Config,
}

/// Daemon loop: build the engine, bring the network up, run an initial scan,
/// then wait for a shutdown signal.
pub async fn run_until_done(args: ServerArgs) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::init(args.config).await?);
    if let Err(err) = engine.start_network().await {
        return Err(anyhow::format_err!("Failed to start network: {err}"));
    }

    let mut join_set = JoinSet::new();
    let shutdown_signal = CancellationToken::new();

    // initial index pass
    {
        let engine = engine.clone();
        let cancel = shutdown_signal.clone();
        join_set.spawn(async move {
            match engine.scanner.scan_all(cancel.child_token()).await {
                Ok(outcomes) => {
                    let processed: u64 = outcomes.iter().map(|it| it.processed).sum();
                    tracing::info!("startup scan finished, {processed} files");
                }
                Err(err) => tracing::warn!(reason = %err, "startup scan failed"),
            }
            if let Err(err) = engine
                .scanner
                .compute_missing_checksums(cancel.child_token())
                .await
            {
                tracing::warn!(reason = %err, "checksum backfill failed");
            }
            Ok::<(), std::io::Error>(())
        });
    }
    // ctrl+c
    {
        let shutdown_signal = shutdown_signal.clone();
        join_set.spawn(async move {
            let _ = signal::ctrl_c().await;
            shutdown_signal.cancel();
            Ok::<(), std::io::Error>(())
        });
    }
    // SIGTERM terminates, USR1 reopens log files
    #[cfg(target_os = "linux")]
    {
        let shutdown_signal = shutdown_signal.clone();
        let logs = args.logs.clone();
        join_set.spawn(async move {
            let mut usr1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())?;
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::debug!("Received SIGTERM signal, start terminating");
                        shutdown_signal.cancel();
                    }
                    _ = usr1.recv() => {
                        tracing::debug!("Received USR1 signal, start reopening log files");
                        match logs.reopen() {
                            Ok(_) => tracing::info!("Log files reopen successful."),
                            Err(err) => eprintln!("Failed to reopen log files: {err:?}")
                        }
                    }
                }
            }
        });
    }

    shutdown_signal.cancelled().await;
    join_set.shutdown().await;
    engine.shutdown().await;
    args.logs.terminal();
    Ok(())
}
