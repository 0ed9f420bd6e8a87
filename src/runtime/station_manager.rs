//! Station registry and top-level run loop.
//!
//! Owns the `DashMap` of running stations, each entry holding an
//! outbound connection task that dials the CSMS, reconnects with
//! backoff, and wires the dispatcher/session/heartbeat/logger together.
//! Also drives restoration from, and periodic sync back to, the
//! configuration repository.
//!
//! Lock ordering: never hold the registry's `DashMap` shard lock while
//! acquiring a station's own `RwLock` guards. Every method below looks
//! up (and clones/drops) the `Arc<StationHandle>` before touching
//! anything inside it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{GlobalConfig, ReconnectConfig};
use crate::domain::auth_cache::AuthCache;
use crate::domain::certificate::CertificateStore;
use crate::domain::connector::{Connector, ConnectorSnapshot};
use crate::domain::device_model::DeviceModel;
use crate::domain::frame::OcppFrame;
use crate::domain::message::MessageType;
use crate::domain::pending::PendingRequestTable;
use crate::domain::station::{
    ConnectionStatus, StationConfig, StationConfigRepository, StationRuntime, StationSnapshot, StationState,
};
use crate::domain::transaction::Transaction;
use crate::runtime::connection::{self, reconnect_delay};
use crate::runtime::dispatcher::{dispatcher_for, InboundDispatcher, StationContext};
use crate::runtime::events::{SharedEventBus, StationEvent};
use crate::runtime::logger::{new_inbound_record, new_outbound_record, MessageLogger};
use crate::runtime::session::SessionManager;
use crate::support::{ProtocolError, ShutdownSignal};

/// A single station's handle: its immutable context plus mutable
/// runtime status and the shutdown switch for its connection task.
pub struct StationHandle {
    pub ctx: Arc<StationContext>,
    pub runtime: RwLock<StationRuntime>,
    pub shutdown: ShutdownSignal,
    dispatcher: Arc<dyn InboundDispatcher>,
}

impl StationHandle {
    /// Build a handle sharing `ctx`'s own shutdown switch, so background
    /// work `ctx` spawns on its own (e.g. a dispatcher-initiated meter
    /// ticker) winds down together with the connection loop.
    pub(crate) fn new(ctx: Arc<StationContext>, dispatcher: Arc<dyn InboundDispatcher>) -> Self {
        let shutdown = ctx.shutdown.clone();
        Self {
            ctx,
            runtime: RwLock::new(StationRuntime::default()),
            shutdown,
            dispatcher,
        }
    }
}

pub struct StationManager {
    stations: DashMap<String, Arc<StationHandle>>,
    logger: Arc<MessageLogger>,
    events: SharedEventBus,
    reconnect: ReconnectConfig,
    repository: Arc<dyn StationConfigRepository>,
    global: GlobalConfig,
}

impl StationManager {
    pub fn new(
        logger: Arc<MessageLogger>,
        events: SharedEventBus,
        reconnect: ReconnectConfig,
        repository: Arc<dyn StationConfigRepository>,
        global: GlobalConfig,
    ) -> Self {
        Self {
            stations: DashMap::new(),
            logger,
            events,
            reconnect,
            repository,
            global,
        }
    }

    /// Register a station without starting it. Returns `false` if a
    /// station with this ID is already registered.
    pub fn register(&self, config: StationConfig) -> bool {
        if self.stations.contains_key(&config.id) {
            return false;
        }
        let connectors = config.connectors.iter().map(|c| Connector::new(c.id)).collect();
        let dispatcher = dispatcher_for(config.protocol_version);
        let shutdown = ShutdownSignal::new();
        let ctx = Arc::new(StationContext {
            device_model: DeviceModel::new(),
            certificates: CertificateStore::new(),
            auth_cache: AuthCache::new(Duration::from_secs(self.global.auth_rejection_ttl_secs)),
            connectors: RwLock::new(connectors),
            transactions: RwLock::new(Vec::new()),
            pending: Arc::new(PendingRequestTable::with_timeout(Duration::from_secs(
                self.global.pending_request_timeout_secs,
            ))),
            config,
            outbound: RwLock::new(None),
            logger: self.logger.clone(),
            shutdown: shutdown.clone(),
        });
        let handle = Arc::new(StationHandle {
            ctx,
            runtime: RwLock::new(StationRuntime::default()),
            shutdown,
            dispatcher,
        });
        self.stations.insert(handle.ctx.config.id.clone(), handle);
        true
    }

    /// Start (or restart) a registered station's connection loop.
    pub fn start(self: &Arc<Self>, station_id: &str) -> bool {
        let Some(handle) = self.stations.get(station_id).map(|e| e.clone()) else {
            return false;
        };
        let manager = self.clone();
        tokio::spawn(async move { manager.run_station(handle).await });
        true
    }

    pub fn stop(&self, station_id: &str) -> bool {
        let Some(handle) = self.stations.get(station_id).map(|e| e.clone()) else {
            return false;
        };
        handle.shutdown.trigger();
        true
    }

    pub fn get(&self, station_id: &str) -> Option<Arc<StationHandle>> {
        self.stations.get(station_id).map(|e| e.clone())
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.stations.iter().map(|e| e.key().clone()).collect()
    }

    /// Start every registered station flagged `auto_start`.
    pub fn auto_start_all(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .stations
            .iter()
            .filter(|e| e.ctx.config.auto_start)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.start(&id);
        }
    }

    /// Restore every station snapshot from the configuration repository:
    /// register stations not yet known, and replay each connector's
    /// persisted state (including any in-flight transaction) into the
    /// freshly built in-memory context. Called once at startup, before
    /// `auto_start_all`, so a restart resumes rather than forgets.
    pub async fn reconcile_all(&self) {
        let snapshots = match self.repository.list().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "failed to list station snapshots from repository");
                return;
            }
        };
        for snapshot in snapshots {
            self.reconcile_station(snapshot).await;
        }
    }

    async fn reconcile_station(&self, snapshot: StationSnapshot) {
        let station_id = snapshot.config.id.clone();
        if !self.stations.contains_key(&station_id) {
            self.register(snapshot.config.clone());
        }
        let Some(handle) = self.stations.get(&station_id).map(|e| e.clone()) else {
            return;
        };

        {
            let mut connectors = handle.ctx.connectors.write().await;
            for restored in &snapshot.connectors {
                if let Some(connector) = connectors.iter_mut().find(|c| c.id == restored.id) {
                    connector.restore(restored.state, restored.active_transaction.clone());
                }
            }
        }

        {
            let mut transactions = handle.ctx.transactions.write().await;
            for restored in &snapshot.connectors {
                if let Some(tx_id) = &restored.active_transaction {
                    if !transactions.iter().any(|t| &t.id == tx_id) {
                        transactions.push(Transaction::start(
                            tx_id.clone(),
                            restored.id,
                            "restored".to_string(),
                            0.0,
                        ));
                    }
                }
            }
        }

        {
            let mut runtime = handle.runtime.write().await;
            runtime.last_heartbeat = snapshot.runtime.last_heartbeat;
        }

        info!(station_id = %station_id, "restored station state from repository");
    }

    /// Periodically persist every running station's current connector/
    /// runtime state back to the repository, so a restart has something
    /// recent to restore from.
    pub async fn run_sync_loop(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut ticker = interval(Duration::from_secs(self.global.sync_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync_once().await,
                _ = shutdown.notified().wait() => break,
            }
        }
    }

    async fn sync_once(&self) {
        for entry in self.stations.iter() {
            let handle = entry.value().clone();
            let connectors = handle.ctx.connectors.read().await;
            let snapshot = StationSnapshot {
                config: handle.ctx.config.clone(),
                runtime: handle.runtime.read().await.clone(),
                connectors: connectors.iter().map(ConnectorSnapshot::from).collect(),
            };
            drop(connectors);
            if let Err(e) = self.repository.upsert(snapshot).await {
                warn!(station_id = %handle.ctx.config.id, error = %e, "periodic sync upsert failed");
            }
        }
    }

    async fn run_station(self: Arc<Self>, handle: Arc<StationHandle>) {
        let station_id = handle.ctx.config.id.clone();
        let mut attempt: u32 = 0;

        loop {
            if handle.shutdown.is_triggered() {
                break;
            }

            {
                let mut runtime = handle.runtime.write().await;
                runtime.state = StationState::Connecting;
                runtime.connection_status = ConnectionStatus::Connecting;
            }

            match connection::connect(&handle.ctx.config).await {
                Ok(stream) => {
                    attempt = 0;
                    {
                        let mut runtime = handle.runtime.write().await;
                        runtime.state = StationState::Connected;
                        runtime.connection_status = ConnectionStatus::Connected;
                        runtime.connected_at = Some(chrono::Utc::now());
                    }
                    self.events.publish(StationEvent::Connected {
                        station_id: station_id.clone(),
                        timestamp: chrono::Utc::now(),
                    });

                    let (outbound, inbound) = connection::spawn_io_pumps(stream, station_id.clone());
                    self.run_session(&handle, outbound, inbound).await;

                    self.events.publish(StationEvent::Disconnected {
                        station_id: station_id.clone(),
                        reason: "connection closed".to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                }
                Err(e) => {
                    error!(station_id = %station_id, error = %e, "connect failed");
                }
            }

            if handle.shutdown.is_triggered() {
                break;
            }

            attempt += 1;
            if self.reconnect.max_attempts != 0 && attempt > self.reconnect.max_attempts {
                let mut runtime = handle.runtime.write().await;
                runtime.state = StationState::Error;
                runtime.connection_status = ConnectionStatus::PermanentError;
                runtime.last_error = Some(format!(
                    "exceeded {} reconnect attempts",
                    self.reconnect.max_attempts
                ));
                error!(station_id = %station_id, attempts = attempt - 1, "giving up, reconnect attempts exhausted");
                break;
            }

            let delay = reconnect_delay(
                attempt,
                Duration::from_secs(self.reconnect.base_delay_secs),
                Duration::from_secs(self.reconnect.max_delay_secs),
            );
            {
                let mut runtime = handle.runtime.write().await;
                runtime.connection_status = ConnectionStatus::Reconnecting;
            }
            warn!(station_id = %station_id, attempt, delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = handle.shutdown.notified().wait() => break,
            }
        }

        if handle.runtime.read().await.state != StationState::Error {
            let mut runtime = handle.runtime.write().await;
            runtime.state = StationState::Stopped;
            runtime.connection_status = ConnectionStatus::Disconnected;
        }
    }

    /// Drive one connected session: boot, start the heartbeat/meter
    /// tickers (only once `BootNotification` is accepted), reconcile
    /// connector state, and dispatch inbound `Call`s until the socket
    /// closes or shutdown fires.
    async fn run_session(
        &self,
        handle: &Arc<StationHandle>,
        outbound: mpsc::Sender<String>,
        mut inbound: mpsc::Receiver<String>,
    ) {
        *handle.ctx.outbound.write().await = Some(outbound);

        let session = Arc::new(SessionManager::new(handle.ctx.clone(), handle.shutdown.clone()));
        let (accepted, heartbeat_interval) = self.send_boot_notification(handle).await;

        let heartbeat_task = if accepted {
            session.reconcile().await;
            let interval_secs = heartbeat_interval.unwrap_or(handle.ctx.config.sim.heartbeat_interval_default_secs);
            {
                let mut runtime = handle.runtime.write().await;
                runtime.heartbeat_interval_secs = Some(interval_secs);
            }
            let heartbeat = Arc::new(crate::runtime::heartbeat::HeartbeatDriver::new(handle.clone()));
            let heartbeat_shutdown = handle.shutdown.clone();
            Some(tokio::spawn(heartbeat.run(interval_secs, heartbeat_shutdown)))
        } else {
            warn!(station_id = %handle.ctx.config.id, "BootNotification not accepted, heartbeat and connector announce withheld");
            None
        };

        loop {
            tokio::select! {
                maybe_text = inbound.recv() => {
                    match maybe_text {
                        Some(text) => self.handle_inbound_text(handle, &text).await,
                        None => break,
                    }
                }
                _ = handle.shutdown.notified().wait() => break,
            }
        }

        if let Some(task) = heartbeat_task {
            task.abort();
        }
        session.abort_all_tickers().await;
        *handle.ctx.outbound.write().await = None;
        handle
            .ctx
            .pending
            .fail_all(ProtocolError::InternalError("connection closed".to_string()));
    }

    /// Send `BootNotification` and return `(accepted, heartbeat_interval)`
    /// from the reply — the heartbeat driver and the initial connector
    /// announce are gated on `accepted`, per the CSMS's right to refuse
    /// service to an unrecognized station.
    async fn send_boot_notification(&self, handle: &Arc<StationHandle>) -> (bool, Option<u32>) {
        let result = handle
            .ctx
            .send_call(
                "BootNotification",
                serde_json::json!({
                    "chargePointVendor": handle.ctx.config.vendor,
                    "chargePointModel": handle.ctx.config.model,
                }),
            )
            .await;
        match result {
            Ok(payload) => {
                let status = payload.get("status").and_then(|v| v.as_str()).unwrap_or("Rejected");
                let accepted = status == "Accepted";
                let interval_secs = payload.get("interval").and_then(|v| v.as_u64()).map(|v| v as u32);
                if !accepted {
                    let mut runtime = handle.runtime.write().await;
                    runtime.last_error = Some(format!("BootNotification {status}"));
                }
                (accepted, interval_secs)
            }
            Err(e) => {
                warn!(station_id = %handle.ctx.config.id, error = %e, "BootNotification failed");
                (false, None)
            }
        }
    }

    async fn handle_inbound_text(&self, handle: &Arc<StationHandle>, text: &str) {
        let frame = match OcppFrame::parse(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(station_id = %handle.ctx.config.id, error = %e, "malformed inbound frame");
                return;
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                self.logger
                    .record(new_inbound_record(
                        &handle.ctx.config.id,
                        &unique_id,
                        Some(action.clone()),
                        MessageType::Call,
                        text,
                    ))
                    .await;

                let reply = match handle.dispatcher.dispatch(&handle.ctx, &action, payload).await {
                    Ok(result) => OcppFrame::CallResult {
                        unique_id,
                        payload: result,
                    },
                    Err(e) => OcppFrame::error_response(unique_id, e.error_code(), e.to_string()),
                };
                let raw = reply.serialize();
                self.logger
                    .record(new_outbound_record(
                        &handle.ctx.config.id,
                        reply.unique_id(),
                        Some(action),
                        if reply.is_call_result() {
                            MessageType::CallResult
                        } else {
                            MessageType::CallError
                        },
                        &raw,
                    ))
                    .await;
                let sender = handle.ctx.outbound.read().await.clone();
                if let Some(sender) = sender {
                    let _ = sender.send(raw).await;
                }
            }
            OcppFrame::CallResult { unique_id, payload } => {
                self.logger
                    .record(new_inbound_record(
                        &handle.ctx.config.id,
                        &unique_id,
                        None,
                        MessageType::CallResult,
                        text,
                    ))
                    .await;
                handle.ctx.pending.resolve_result(&unique_id, payload);
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                self.logger
                    .record(new_inbound_record(
                        &handle.ctx.config.id,
                        &unique_id,
                        None,
                        MessageType::CallError,
                        text,
                    ))
                    .await;
                warn!(station_id = %handle.ctx.config.id, %error_code, %error_description, "received CallError");
                handle
                    .ctx
                    .pending
                    .resolve_error(&unique_id, ProtocolError::InternalError(error_description));
            }
        }
    }
}

/// Minimal validation for an admin-injected raw OCPP-J frame: a JSON array
/// of length 3 or 4 whose first element is an integer message type id in
/// `{2, 3, 4}`. The admin HTTP layer (out of scope here) calls this before
/// handing the frame to a station's write queue.
pub fn validate_custom_frame(raw: &str) -> Result<(), crate::support::FramingError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| crate::support::FramingError::TypeConstraintViolation(e.to_string()))?;
    let arr = value.as_array().ok_or_else(|| {
        crate::support::FramingError::TypeConstraintViolation("frame must be a JSON array".to_string())
    })?;
    if arr.len() != 3 && arr.len() != 4 {
        return Err(crate::support::FramingError::PropertyConstraintViolation(
            "frame must have length 3 or 4".to_string(),
        ));
    }
    let message_type = arr[0].as_i64().ok_or_else(|| {
        crate::support::FramingError::TypeConstraintViolation("first element must be an integer".to_string())
    })?;
    match message_type {
        2 | 3 | 4 => Ok(()),
        other => Err(crate::support::FramingError::PropertyConstraintViolation(format!(
            "unknown message type id {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ocpp::OcppVersion;
    use crate::infrastructure::memory::InMemoryStationConfigRepository;
    use crate::runtime::events::create_event_bus;

    fn test_manager() -> StationManager {
        StationManager::new(
            Arc::new(MessageLogger::new(None)),
            create_event_bus(),
            ReconnectConfig::default(),
            Arc::new(InMemoryStationConfigRepository::new()),
            GlobalConfig::default(),
        )
    }

    #[test]
    fn register_rejects_duplicate_ids() {
        let manager = test_manager();
        let cfg = StationConfig::new("CP001", "ws://localhost:9000", OcppVersion::V16);
        assert!(manager.register(cfg.clone()));
        assert!(!manager.register(cfg));
    }

    #[test]
    fn list_ids_reflects_registrations() {
        let manager = test_manager();
        manager.register(StationConfig::new("CP001", "ws://localhost:9000", OcppVersion::V16));
        manager.register(StationConfig::new("CP002", "ws://localhost:9000", OcppVersion::V201));
        let mut ids = manager.list_ids();
        ids.sort();
        assert_eq!(ids, vec!["CP001".to_string(), "CP002".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_station_restores_active_transaction() {
        let manager = test_manager();
        let config = StationConfig::new("CP001", "ws://localhost:9000", OcppVersion::V16);
        let snapshot = StationSnapshot {
            config: config.clone(),
            runtime: StationRuntime::default(),
            connectors: vec![ConnectorSnapshot {
                id: 1,
                state: crate::domain::connector::ConnectorState::Charging,
                active_transaction: Some(crate::domain::transaction::TransactionId::Numeric(7)),
            }],
        };
        manager.reconcile_station(snapshot).await;
        let handle = manager.get("CP001").unwrap();
        assert_eq!(handle.ctx.connectors.read().await[0].state, crate::domain::connector::ConnectorState::Charging);
        assert_eq!(handle.ctx.transactions.read().await.len(), 1);
    }

    #[test]
    fn validate_custom_frame_accepts_well_formed_call() {
        assert!(validate_custom_frame(r#"[2,"abc","Heartbeat",{}]"#).is_ok());
    }

    #[test]
    fn validate_custom_frame_rejects_wrong_length() {
        assert!(validate_custom_frame(r#"[2,"abc"]"#).is_err());
    }

    #[test]
    fn validate_custom_frame_rejects_unknown_message_type() {
        assert!(validate_custom_frame(r#"[9,"abc","Heartbeat",{}]"#).is_err());
    }
}
