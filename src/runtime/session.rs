//! Connector/session orchestration: authorization, transaction
//! lifecycle, and the meter-value ticker.
//!
//! Sends `Call`s through `StationContext::send_call`, which registers
//! with the pending table, logs, and pushes onto the current connection's
//! outbound channel — these are the station's own outbound
//! `Authorize`/`StartTransaction`/`StopTransaction`/`MeterValues` (or
//! their 2.0.1/2.1 `TransactionEvent` equivalents), not commands sent
//! down to a charge point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::domain::auth_cache::CachedOutcome;
use crate::domain::connector::ConnectorState;
use crate::domain::ocpp::OcppVersion;
use crate::domain::station::Measurand;
use crate::domain::transaction::{MeterSample, StopReason, Transaction, TransactionId};
use crate::runtime::dispatcher::StationContext;
use crate::support::{AuthError, EmulatorError, ProtocolError, ShutdownSignal, StateError};

/// Bound on how many times `start_charging` polls for the transaction
/// object after a `StartTransaction`/`TransactionEvent` reply arrives,
/// guarding against the reply racing the in-memory insert.
const TRANSACTION_LOOKUP_RETRIES: u32 = 10;
const TRANSACTION_LOOKUP_POLL_MS: u64 = 10;

fn transaction_id_value(id: &TransactionId) -> Value {
    match id {
        TransactionId::Numeric(n) => json!(n),
        TransactionId::Text(s) => json!(s),
    }
}

fn measurand_value(measurand: Measurand, sample: &MeterSample) -> f64 {
    match measurand {
        Measurand::EnergyActiveImportRegister => sample.energy_wh,
        Measurand::PowerActiveImport => sample.power_w,
        Measurand::CurrentImport => sample.power_w / 230.0,
        Measurand::Voltage => 230.0,
        Measurand::Soc => sample.soc_percent.unwrap_or(0.0),
        Measurand::Temperature => 25.0,
        Measurand::Frequency => 50.0,
        Measurand::PowerFactor => 1.0,
    }
}

fn sampled_values(measurands: &[Measurand], sample: &MeterSample) -> Vec<Value> {
    measurands
        .iter()
        .map(|m| {
            json!({
                "value": measurand_value(*m, sample).to_string(),
                "measurand": m.ocpp_name(),
                "unit": m.unit(),
            })
        })
        .collect()
}

/// Everything needed to drive one connector's charging session: shared
/// station context and the per-connector meter-value ticker handles.
pub struct SessionManager {
    ctx: Arc<StationContext>,
    shutdown: ShutdownSignal,
    meter_tickers: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(ctx: Arc<StationContext>, shutdown: ShutdownSignal) -> Self {
        Self {
            ctx,
            shutdown,
            meter_tickers: Mutex::new(HashMap::new()),
        }
    }

    pub fn ctx(&self) -> &Arc<StationContext> {
        &self.ctx
    }

    /// Authorize an idTag, consulting the local cache first before
    /// round-tripping to the CSMS. A cached entry of any outcome (not
    /// just rejection) short-circuits the round trip, since the CSMS's
    /// most recent answer for this tag is still within its TTL.
    pub async fn authorize(&self, id_tag: &str) -> Result<(), EmulatorError> {
        if let Some(cached) = self.ctx.auth_cache.lookup(id_tag) {
            return match cached {
                CachedOutcome::Accepted => Ok(()),
                _ => Err(AuthError::AuthorizationCachedReject.into()),
            };
        }

        let result = match self.ctx.send_call("Authorize", json!({ "idTag": id_tag })).await {
            Ok(v) => v,
            Err(ProtocolError::InternalError(msg)) if msg == "response timeout" => {
                return Err(AuthError::AuthorizationTimeout.into());
            }
            Err(e) => return Err(e.into()),
        };
        let status = result
            .get("idTagInfo")
            .and_then(|v| v.get("status"))
            .and_then(|v| v.as_str())
            .unwrap_or("Invalid");

        match status {
            "Accepted" => {
                self.ctx.auth_cache.record(id_tag, CachedOutcome::Accepted);
                Ok(())
            }
            "Blocked" => {
                self.ctx.auth_cache.record(id_tag, CachedOutcome::Blocked);
                Err(AuthError::AuthorizationRejected.into())
            }
            "Expired" => {
                self.ctx.auth_cache.record(id_tag, CachedOutcome::Expired);
                Err(AuthError::AuthorizationRejected.into())
            }
            _ => {
                self.ctx.auth_cache.record(id_tag, CachedOutcome::Rejected);
                Err(AuthError::AuthorizationRejected.into())
            }
        }
    }

    /// Start a charging session on `connector_id`: authorize, transition
    /// the connector, assign a locally generated placeholder transaction
    /// ID, notify the CSMS, and start the meter-value ticker. The
    /// placeholder is replaced by the CSMS-assigned ID once the reply
    /// arrives.
    pub async fn start_charging(
        self: &Arc<Self>,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<TransactionId, EmulatorError> {
        self.authorize(id_tag).await?;

        {
            let mut connectors = self.ctx.connectors.write().await;
            let connector = connectors
                .iter_mut()
                .find(|c| c.id == connector_id)
                .ok_or(StateError::UnknownConnector(connector_id))?;
            if !connector.is_available() {
                return Err(StateError::ConnectorBusy(connector_id).into());
            }
            connector.transition(ConnectorState::Preparing)?;
        }

        let meter_start = 0.0;
        let placeholder_id = TransactionId::Text(format!("local-{}", self.ctx.pending.next_sequence()));

        let transaction = Transaction::start(placeholder_id.clone(), connector_id, id_tag.to_string(), meter_start);
        self.ctx.transactions.write().await.push(transaction);

        {
            let mut connectors = self.ctx.connectors.write().await;
            if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
                connector.transition(ConnectorState::Charging)?;
                connector.active_transaction = Some(placeholder_id.clone());
                connector.current_id_tag = Some(id_tag.to_string());
            }
        }

        let start_result = send_start_transaction(&self.ctx, connector_id, id_tag, meter_start, &placeholder_id).await;

        let final_id = match start_result {
            Ok((assigned_id, id_tag_status)) => {
                if id_tag_status != "Accepted" {
                    drop(self.stop_charging(connector_id, StopReason::DeAuthorized).await);
                    return Err(AuthError::AuthorizationRejected.into());
                }
                self.adopt_transaction_id(connector_id, &placeholder_id, &assigned_id)
                    .await;
                assigned_id
            }
            Err(e) => {
                warn!(connector_id, error = %e, "StartTransaction/TransactionEvent failed, keeping placeholder id");
                placeholder_id.clone()
            }
        };

        let interval_secs = self.ctx.config.meter.interval_secs;
        let delivery_rate_w = self.ctx.config.sim.energy_delivery_rate_w;
        let randomize = self.ctx.config.sim.randomize;
        let variance = self.ctx.config.sim.variance;
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            run_meter_ticker(ctx, connector_id, interval_secs, delivery_rate_w, randomize, variance, shutdown).await;
        });
        self.meter_tickers.lock().await.insert(connector_id, handle);

        info!(connector_id, transaction_id = %final_id, "charging session started");
        Ok(final_id)
    }

    /// Replace the placeholder transaction ID with the CSMS-assigned one,
    /// polling briefly since the reply can race the in-memory insert.
    async fn adopt_transaction_id(&self, connector_id: u32, placeholder: &TransactionId, assigned: &TransactionId) {
        if placeholder == assigned {
            return;
        }
        for attempt in 0..TRANSACTION_LOOKUP_RETRIES {
            {
                let mut transactions = self.ctx.transactions.write().await;
                if let Some(t) = transactions.iter_mut().find(|t| &t.id == placeholder) {
                    t.id = assigned.clone();
                    let mut connectors = self.ctx.connectors.write().await;
                    if let Some(c) = connectors.iter_mut().find(|c| c.id == connector_id) {
                        c.active_transaction = Some(assigned.clone());
                    }
                    return;
                }
            }
            if attempt + 1 < TRANSACTION_LOOKUP_RETRIES {
                tokio::time::sleep(Duration::from_millis(TRANSACTION_LOOKUP_POLL_MS)).await;
            }
        }
        warn!(connector_id, "placeholder transaction vanished before CSMS id could be adopted");
    }

    /// Stop the active transaction on `connector_id`.
    pub async fn stop_charging(self: &Arc<Self>, connector_id: u32, reason: StopReason) -> Result<(), EmulatorError> {
        if let Some(handle) = self.meter_tickers.lock().await.remove(&connector_id) {
            handle.abort();
        }

        {
            let mut connectors = self.ctx.connectors.write().await;
            if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
                connector.transition(ConnectorState::Finishing)?;
            }
        }

        let (transaction_id, meter_stop) = {
            let mut transactions = self.ctx.transactions.write().await;
            let transaction = transactions
                .iter_mut()
                .find(|t| t.connector_id == connector_id && t.is_active())
                .ok_or(StateError::NoActiveTransaction(connector_id))?;
            let meter_stop = transaction.energy_delivered_wh() + transaction.meter_start_wh;
            transaction.stop(meter_stop, reason);
            (transaction.id.clone(), meter_stop)
        };

        send_stop_transaction(&self.ctx, connector_id, &transaction_id, meter_stop, reason).await?;

        let mut connectors = self.ctx.connectors.write().await;
        if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
            connector.transition(ConnectorState::Available)?;
            connector.active_transaction = None;
            connector.current_id_tag = None;
        }

        info!(connector_id, %transaction_id, "charging session stopped");
        Ok(())
    }

    /// Abort every running meter-value ticker, e.g. when the station
    /// disconnects. Tickers spawned on a reused outbound channel would
    /// otherwise keep firing against a dead connection.
    pub async fn abort_all_tickers(&self) {
        for (_, handle) in self.meter_tickers.lock().await.drain() {
            handle.abort();
        }
    }

    /// Reconcile connector state after a (re)connect: re-announce every
    /// connector's current status so the CSMS's view converges with
    /// ours, and resume the meter-value ticker for any connector that
    /// already owns an active transaction but has no ticker running —
    /// the case after a reconnect, or after the station manager restored
    /// an in-flight transaction from the configuration repository at
    /// startup.
    pub async fn reconcile(self: &Arc<Self>) {
        let connectors = self.ctx.connectors.read().await;
        let snapshot: Vec<(u32, ConnectorState, Option<TransactionId>)> = connectors
            .iter()
            .map(|c| (c.id, c.state, c.active_transaction.clone()))
            .collect();
        drop(connectors);

        for (connector_id, state, active_transaction) in &snapshot {
            if self.ctx.config.notify_on_change {
                if let Err(e) = self
                    .ctx
                    .send_status_notification(*connector_id, state.ocpp_status(), "NoError")
                    .await
                {
                    warn!(connector_id, error = %e, "reconcile StatusNotification failed");
                }
            }

            if active_transaction.is_some() {
                let mut tickers = self.meter_tickers.lock().await;
                if !tickers.contains_key(connector_id) {
                    let interval_secs = self.ctx.config.meter.interval_secs;
                    let delivery_rate_w = self.ctx.config.sim.energy_delivery_rate_w;
                    let randomize = self.ctx.config.sim.randomize;
                    let variance = self.ctx.config.sim.variance;
                    let ctx = self.ctx.clone();
                    let shutdown = self.shutdown.clone();
                    let connector_id = *connector_id;
                    let handle = tokio::spawn(async move {
                        run_meter_ticker(ctx, connector_id, interval_secs, delivery_rate_w, randomize, variance, shutdown).await;
                    });
                    tickers.insert(connector_id, handle);
                    info!(connector_id, "resumed meter ticker for restored transaction");
                }
            }
        }
    }
}

/// Send the version-appropriate transaction-start wire message and parse
/// out `(assigned_transaction_id, id_tag_status)`.
async fn send_start_transaction(
    ctx: &StationContext,
    connector_id: u32,
    id_tag: &str,
    meter_start: f64,
    placeholder_id: &TransactionId,
) -> Result<(TransactionId, String), EmulatorError> {
    match ctx.config.protocol_version {
        OcppVersion::V16 => {
            let result = ctx
                .send_call(
                    "StartTransaction",
                    json!({
                        "connectorId": connector_id,
                        "idTag": id_tag,
                        "meterStart": meter_start as i64,
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    }),
                )
                .await?;
            let assigned = result
                .get("transactionId")
                .and_then(|v| v.as_i64())
                .map(TransactionId::Numeric)
                .unwrap_or_else(|| placeholder_id.clone());
            let status = result
                .get("idTagInfo")
                .and_then(|v| v.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or("Accepted")
                .to_string();
            Ok((assigned, status))
        }
        OcppVersion::V201 | OcppVersion::V21 => {
            let result = ctx
                .send_call(
                    "TransactionEvent",
                    json!({
                        "eventType": "Started",
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                        "triggerReason": "Authorized",
                        "seqNo": 0,
                        "transactionInfo": { "transactionId": placeholder_id.to_string() },
                        "idToken": { "idToken": id_tag, "type": "Central" },
                        "evse": { "id": connector_id, "connectorId": connector_id },
                    }),
                )
                .await?;
            // 2.0.1/2.1 transaction IDs are station-assigned, not
            // reassigned by the CSMS reply, so the placeholder stands.
            let assigned = placeholder_id.clone();
            let status = result
                .get("idTokenInfo")
                .and_then(|v| v.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or("Accepted")
                .to_string();
            Ok((assigned, status))
        }
    }
}

async fn send_stop_transaction(
    ctx: &StationContext,
    connector_id: u32,
    transaction_id: &TransactionId,
    meter_stop: f64,
    reason: StopReason,
) -> Result<(), EmulatorError> {
    match ctx.config.protocol_version {
        OcppVersion::V16 => {
            ctx.send_call(
                "StopTransaction",
                json!({
                    "transactionId": transaction_id_value(transaction_id),
                    "meterStop": meter_stop as i64,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "reason": reason.ocpp_reason(),
                }),
            )
            .await?;
        }
        OcppVersion::V201 | OcppVersion::V21 => {
            let _ = connector_id;
            ctx.send_call(
                "TransactionEvent",
                json!({
                    "eventType": "Ended",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "triggerReason": "StopAuthorized",
                    "seqNo": 0,
                    "transactionInfo": {
                        "transactionId": transaction_id.to_string(),
                        "stoppedReason": reason.ocpp_reason(),
                    },
                }),
            )
            .await?;
        }
    }
    Ok(())
}

/// Record a meter sample against a connector's active transaction and
/// send the corresponding `MeterValues`/`TransactionEvent{Updated}` call,
/// carrying the station's configured measurand set.
pub async fn record_meter_sample(ctx: &StationContext, connector_id: u32, sample: MeterSample) -> Result<(), EmulatorError> {
    let transaction_id = {
        let mut transactions = ctx.transactions.write().await;
        let transaction = transactions
            .iter_mut()
            .find(|t| t.connector_id == connector_id && t.is_active())
            .ok_or(StateError::NoActiveTransaction(connector_id))?;
        transaction.record_sample(sample.clone());
        transaction.id.clone()
    };

    let sampled = sampled_values(&ctx.config.meter.measurands, &sample);

    match ctx.config.protocol_version {
        OcppVersion::V16 => {
            ctx.send_call(
                "MeterValues",
                json!({
                    "connectorId": connector_id,
                    "transactionId": transaction_id_value(&transaction_id),
                    "meterValue": [{
                        "timestamp": sample.timestamp.to_rfc3339(),
                        "sampledValue": sampled,
                    }],
                }),
            )
            .await?;
        }
        OcppVersion::V201 | OcppVersion::V21 => {
            ctx.send_call(
                "TransactionEvent",
                json!({
                    "eventType": "Updated",
                    "timestamp": sample.timestamp.to_rfc3339(),
                    "triggerReason": "MeterValuePeriodic",
                    "seqNo": 0,
                    "transactionInfo": { "transactionId": transaction_id.to_string() },
                    "meterValue": [{
                        "timestamp": sample.timestamp.to_rfc3339(),
                        "sampledValue": sampled,
                    }],
                }),
            )
            .await?;
        }
    }
    Ok(())
}

/// Drive a per-transaction meter-value ticker, against `ctx` directly
/// rather than through `SessionManager`, so dispatcher handlers (e.g.
/// 1.6 `RemoteStartTransaction`) can start one without holding a
/// `SessionManager` reference. Exits once a send fails — transaction
/// stopped or the station disconnected — or on `shutdown`.
pub async fn run_meter_ticker(
    ctx: Arc<StationContext>,
    connector_id: u32,
    interval_secs: u64,
    delivery_rate_w: f64,
    randomize: bool,
    variance: f64,
    shutdown: ShutdownSignal,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    let mut cumulative_wh = 0.0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut delta_wh = delivery_rate_w * interval_secs as f64 / 3600.0;
                if randomize && variance > 0.0 {
                    let perturbation = rand::thread_rng().gen_range(-variance..=variance);
                    delta_wh *= 1.0 + perturbation;
                }
                cumulative_wh += delta_wh.max(0.0);
                let sample = MeterSample {
                    timestamp: chrono::Utc::now(),
                    energy_wh: cumulative_wh,
                    power_w: delivery_rate_w,
                    soc_percent: None,
                };
                if record_meter_sample(&ctx, connector_id, sample).await.is_err() {
                    break;
                }
            }
            _ = shutdown.notified().wait() => {
                break;
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
    use crate::domain::ocpp::OcppVersion as Ver;
    use crate::domain::pending::PendingRequestTable;
    use crate::domain::station::StationConfig;
    use crate::runtime::logger::MessageLogger;
    use crate::support::ShutdownSignal;
    use tokio::sync::RwLock;

    fn test_ctx() -> Arc<StationContext> {
        Arc::new(StationContext {
            config: StationConfig::new("CP001", "ws://localhost", Ver::V16),
            connectors: RwLock::new(vec![Connector::new(1)]),
            transactions: RwLock::new(Vec::new()),
            pending: Arc::new(PendingRequestTable::new()),
            auth_cache: AuthCache::new(Duration::from_secs(60)),
            device_model: DeviceModel::new(),
            certificates: CertificateStore::new(),
            outbound: RwLock::new(None),
            logger: Arc::new(MessageLogger::new(None)),
            shutdown: ShutdownSignal::new(),
        })
    }

    #[tokio::test]
    async fn authorize_uses_cache_on_second_call() {
        let ctx = test_ctx();
        ctx.auth_cache.record("TAG1", CachedOutcome::Rejected);
        let session = Arc::new(SessionManager::new(ctx, ShutdownSignal::new()));
        let err = session.authorize("TAG1").await.unwrap_err();
        assert!(matches!(err, EmulatorError::Auth(AuthError::AuthorizationCachedReject)));
    }

    #[tokio::test]
    async fn start_charging_on_busy_connector_is_rejected() {
        let ctx = test_ctx();
        {
            let mut connectors = ctx.connectors.write().await;
            connectors[0].transition(ConnectorState::Preparing).unwrap();
            connectors[0].transition(ConnectorState::Charging).unwrap();
        }
        let session = Arc::new(SessionManager::new(ctx, ShutdownSignal::new()));
        // Pre-seed the cache so authorize() doesn't block on a reply.
        session.ctx().auth_cache.record("TAG1", CachedOutcome::Accepted);
        let err = session.start_charging(1, "TAG1").await.unwrap_err();
        assert!(matches!(err, EmulatorError::State(StateError::ConnectorBusy(1))));
    }

    #[tokio::test]
    async fn start_charging_without_connection_keeps_placeholder_id() {
        let ctx = test_ctx();
        let session = Arc::new(SessionManager::new(ctx, ShutdownSignal::new()));
        session.ctx().auth_cache.record("TAG1", CachedOutcome::Accepted);
        // No outbound sender installed, so StartTransaction can't be sent;
        // the session should still record a (placeholder) transaction
        // rather than fail the whole start.
        let id = session.start_charging(1, "TAG1").await.unwrap();
        assert!(matches!(id, TransactionId::Text(_)));
        session.abort_all_tickers().await;
    }
}
