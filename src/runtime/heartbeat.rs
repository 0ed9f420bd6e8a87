//! Heartbeat driver: periodically sends `Heartbeat` and updates
//! `StationRuntime::last_heartbeat` from the reply's `currentTime`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::interval;
use tracing::warn;

use crate::runtime::station_manager::StationHandle;
use crate::support::ShutdownSignal;

pub struct HeartbeatDriver {
    handle: Arc<StationHandle>,
}

impl HeartbeatDriver {
    pub fn new(handle: Arc<StationHandle>) -> Self {
        Self { handle }
    }

    async fn send_heartbeat(&self) -> Result<(), ()> {
        match self.handle.ctx.send_call("Heartbeat", json!({})).await {
            Ok(result) => {
                let current_time = result
                    .get("currentTime")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(chrono::Utc::now);
                self.handle.runtime.write().await.last_heartbeat = Some(current_time);
                Ok(())
            }
            Err(e) => {
                warn!(station_id = %self.handle.ctx.config.id, error = %e, "heartbeat reply failed");
                Err(())
            }
        }
    }

    pub async fn run(self: Arc<Self>, interval_secs: u32, shutdown: ShutdownSignal) {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1) as u64));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.send_heartbeat().await;
                }
                _ = shutdown.notified().wait() => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::auth_cache::AuthCache;
    use crate::domain::certificate::CertificateStore;
    use crate::domain::connector::Connector;
    use crate::domain::device_model::DeviceModel;
    use crate::domain::ocpp::OcppVersion;
    use crate::domain::pending::PendingRequestTable;
    use crate::domain::station::StationConfig;
    use crate::runtime::dispatcher::{dispatcher_for, StationContext};
    use crate::runtime::logger::MessageLogger;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn heartbeat_resolves_and_records_current_time() {
        let ctx = Arc::new(StationContext {
            config: StationConfig::new("CP001", "ws://localhost", OcppVersion::V16),
            connectors: RwLock::new(vec![Connector::new(1)]),
            transactions: RwLock::new(Vec::new()),
            pending: Arc::new(PendingRequestTable::new()),
            auth_cache: AuthCache::new(Duration::from_secs(60)),
            device_model: DeviceModel::new(),
            certificates: CertificateStore::new(),
            outbound: RwLock::new(None),
            logger: Arc::new(MessageLogger::new(None)),
            shutdown: crate::support::ShutdownSignal::new(),
        });

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        *ctx.outbound.write().await = Some(tx);

        let handle = Arc::new(StationHandle::new(ctx.clone(), dispatcher_for(OcppVersion::V16)));
        let driver = HeartbeatDriver::new(handle.clone());

        let pending = ctx.pending.clone();
        let responder = tokio::spawn(async move {
            let raw = rx.recv().await.unwrap();
            let frame = crate::domain::frame::OcppFrame::parse(&raw).unwrap();
            pending.resolve_result(frame.unique_id(), json!({ "currentTime": "2024-01-01T00:00:00Z" }));
        });

        assert!(driver.send_heartbeat().await.is_ok());
        responder.await.unwrap();
        assert!(handle.runtime.read().await.last_heartbeat.is_some());
    }
}
