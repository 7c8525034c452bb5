//! Background maintenance: the eviction sweep and the tool self-update.
//!
//! Both loops share one [`CancellationToken`]; cancelling it stops them at
//! their next await point, and [`Maintenance::shutdown`] waits for that.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::SessionManager;
use crate::ytdlp::{MediaTool, UpdateOutcome};

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    pub sweep_interval: Duration,
    /// `None` disables self-update.
    pub update_interval: Option<Duration>,
}

pub struct Maintenance {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Maintenance {
    pub fn start(
        sessions: Arc<SessionManager>,
        tool: Arc<dyn MediaTool>,
        config: MaintenanceConfig,
    ) -> Self {
        let token = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(eviction_loop(
            sessions,
            config.sweep_interval,
            token.clone(),
        ))];
        if let Some(interval) = config.update_interval {
            tasks.push(tokio::spawn(update_loop(tool, interval, token.clone())));
        } else {
            info!("tool self-update disabled");
        }
        Self { token, tasks }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "maintenance task ended abnormally");
            }
        }
        debug!("maintenance stopped");
    }
}

async fn eviction_loop(sessions: Arc<SessionManager>, interval: Duration, token: CancellationToken) {
    info!(interval_secs = interval.as_secs(), "eviction sweep scheduled");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let sessions = Arc::clone(&sessions);
        match tokio::task::spawn_blocking(move || sessions.sweep(SystemTime::now())).await {
            Ok(report) => debug!(
                removed = report.removed.len(),
                retained = report.retained,
                failed = report.failed,
                "sweep pass done"
            ),
            Err(err) => warn!(error = %err, "sweep pass panicked"),
        }
    }
}

async fn update_loop(tool: Arc<dyn MediaTool>, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = run_update(tool.as_ref()) => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn run_update(tool: &dyn MediaTool) {
    match tool.update().await {
        Ok(UpdateOutcome::Updated) => info!("extraction tool updated"),
        Ok(UpdateOutcome::AlreadyCurrent) => info!("extraction tool already current"),
        Err(err) => warn!(error = %err, "extraction tool update failed"),
    }
}
