//! Connector liveness loop.
//!
//! Each tick pings the control plane with the local state and adopts the
//! remote copy when the two diverge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::runtime::ConnectorContext;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(40),
        }
    }
}

pub struct HeartbeatMonitor {
    ctx: Arc<ConnectorContext>,
    cfg: HeartbeatConfig,
    in_error: AtomicBool,
}

impl HeartbeatMonitor {
    pub fn new(ctx: Arc<ConnectorContext>, cfg: HeartbeatConfig) -> Self {
        Self {
            ctx,
            cfg,
            in_error: AtomicBool::new(false),
        }
    }

    /// Whether the last ping failed.
    pub fn in_error(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
    }

    /// Pings immediately, then every interval, until `cancel` fires.
    ///
    /// Cancellation is observed between pings; a ping in flight completes.
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %self.ctx.connector_id()))]
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("starting ping alive loop");
        let mut interval = tokio::time::interval(self.cfg.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("ping alive loop stopped");
                    return;
                }
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn tick(&self) {
        match self.reconcile().await {
            Ok(()) => {
                if self.in_error.swap(false, Ordering::SeqCst) {
                    tracing::info!("API ping back to normal");
                }
            }
            Err(e) => {
                if self.in_error.swap(true, Ordering::SeqCst) {
                    tracing::debug!(%e, "API ping still failing");
                } else {
                    tracing::error!(%e, "error pinging the API");
                }
            }
        }
    }

    /// One ping; the control plane wins on divergence.
    async fn reconcile(&self) -> Result<()> {
        let state = self.ctx.state();
        let local = state.get().await;
        let resp = self
            .ctx
            .control_plane()
            .ping(self.ctx.connector_id(), local.as_ref())
            .await?;
        let remote = parse_remote(resp.connector_state.as_deref())?;
        if remote != local {
            state.replace_raw(resp.connector_state).await;
            let raw = state.raw().await;
            tracing::info!(state = ?raw, "connector state has been remotely reset");
        }
        Ok(())
    }

    /// One ping outside the loop; local state wins on divergence and is
    /// pushed again.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn force_ping(&self) -> Result<()> {
        let local = self.ctx.state().get().await;
        let control = self.ctx.control_plane();
        let resp = control.ping(self.ctx.connector_id(), local.as_ref()).await?;
        if parse_remote(resp.connector_state.as_deref())? != local {
            control.ping(self.ctx.connector_id(), local.as_ref()).await?;
        }
        Ok(())
    }
}

/// Remote state as the local store would expose it; malformed JSON is an error.
fn parse_remote(raw: Option<&str>) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::decode(format!("remote connector state is not JSON: {e}")))?;
    Ok(match value {
        Value::Object(map) if !map.is_empty() => Some(map),
        _ => None,
    })
}
