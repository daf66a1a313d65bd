#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod state;

use anyhow::Context as _;

use state::State;

/// Exclusive flock under the data dir, so a second monitor refuses to start.
/// Records our pid for the operator.
struct InstanceLock {
    path: std::path::PathBuf,
    file: fs_err::File,
}

impl InstanceLock {
    fn acquire(path: std::path::PathBuf) -> std::io::Result<Self> {
        use std::io::Write as _;

        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        file.try_lock()?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path, file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs_err::remove_file(&self.path);
    }
}

fn spawn_config_reloader(
    state: std::sync::Arc<State>,
    current_config: config::App,
    filepath: &str,
) -> tokio::task::AbortHandle {
    let filepath = filepath.to_owned();
    let task = tokio::spawn(async move {
        loop {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(mut s) => {
                    let _ = s.recv().await;
                    tracing::info!("Reloading...");
                    config::reload(&current_config, &filepath, &state);
                }
                Err(e) => {
                    tracing::error!("Failed to create signal listener for SIGHUP: {e}");
                    break;
                }
            }
        }
    });
    task.abort_handle()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _tracing_guard = farm_tracing::init()?;

    #[cfg(debug_assertions)]
    {
        // Crash on panics in debug builds so the debug_asserts in the step
        // graph actually stop the process instead of killing one task.
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            std::process::exit(1);
        }));
    }

    let state = State::new().await?;

    let _lock = InstanceLock::acquire(state.config.get_lockfile())
        .context("Another instance is already running.")?;

    tracing::info!("QueueMonitor starting, watching the queue");
    let monitor = state.clone().start_queue_monitor_loop();
    let reloader =
        spawn_config_reloader(state.clone(), state.config.clone(), &state.cli.config_path);

    let _notify = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Status("Running"),
            sd_notify::NotifyState::Ready,
        ],
    );

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("Received sigint - shutting down gracefully");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received sigterm - shutting down gracefully");
        }
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    monitor.abort();
    reloader.abort();
    match state.metrics.dump() {
        Ok(dump) => tracing::info!("final counters:\n{dump}"),
        Err(e) => tracing::warn!("Failed to dump metrics: {e:#}"),
    }
    Ok(())
}
