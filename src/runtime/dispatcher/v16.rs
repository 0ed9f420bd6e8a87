//! OCPP 1.6 inbound action handlers.
//!
//! Each handler follows the same shape: deserialize via `rust_ocpp`,
//! log, build a typed response, serialize back to `Value`.

use std::sync::Arc;

use async_trait::async_trait;
use rust_ocpp::v1_6::types::{AvailabilityStatus, AvailabilityType, ConfigurationStatus};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{InboundDispatcher, StationContext};
use crate::domain::connector::ConnectorState;
use crate::domain::ocpp::OcppVersion;
use crate::domain::transaction::{StopReason, Transaction, TransactionId};
use crate::runtime::session::run_meter_ticker;
use crate::support::ProtocolError;

pub struct V16Dispatcher;

impl V16Dispatcher {
    pub fn new() -> Self {
        Self
    }

    /// `RemoteStartTransaction` answers immediately with `Accepted`/
    /// `Rejected`, then — on acceptance — records a placeholder
    /// transaction, sends `StartTransaction` and starts the meter-value
    /// ticker on a spawned task, mirroring `SessionManager::start_charging`
    /// but driven by the CSMS rather than a local "plug in" trigger.
    async fn remote_start_transaction(
        &self,
        ctx: &Arc<StationContext>,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        let id_tag = payload
            .get("idTag")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::InternalError("missing idTag".into()))?
            .to_string();
        let connector_id = payload
            .get("connectorId")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;

        let accepted = {
            let mut connectors = ctx.connectors.write().await;
            match connectors.iter_mut().find(|c| c.id == connector_id) {
                Some(c) if c.is_available() => {
                    c.transition(ConnectorState::Preparing).is_ok()
                        && c.transition(ConnectorState::Charging).is_ok()
                }
                _ => false,
            }
        };
        if !accepted {
            warn!(connector_id, id_tag, "RemoteStartTransaction rejected: connector busy");
            return Ok(json!({ "status": "Rejected" }));
        }

        let placeholder_id = TransactionId::Text(format!("local-{}", ctx.pending.next_sequence()));
        let meter_start = 0.0;
        ctx.transactions
            .write()
            .await
            .push(Transaction::start(placeholder_id.clone(), connector_id, id_tag.clone(), meter_start));
        {
            let mut connectors = ctx.connectors.write().await;
            if let Some(c) = connectors.iter_mut().find(|c| c.id == connector_id) {
                c.active_transaction = Some(placeholder_id.clone());
                c.current_id_tag = Some(id_tag.clone());
            }
        }

        info!(connector_id, id_tag, "RemoteStartTransaction accepted");

        let ctx = ctx.clone();
        let placeholder = placeholder_id.clone();
        tokio::spawn(async move {
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
                .await;
            if let Err(e) = result {
                warn!(connector_id, error = %e, "StartTransaction follow-up failed, keeping placeholder id");
            }

            let interval_secs = ctx.config.meter.interval_secs;
            let delivery_rate_w = ctx.config.sim.energy_delivery_rate_w;
            let randomize = ctx.config.sim.randomize;
            let variance = ctx.config.sim.variance;
            let shutdown = ctx.shutdown.clone();
            let _ = &placeholder;
            run_meter_ticker(ctx, connector_id, interval_secs, delivery_rate_w, randomize, variance, shutdown).await;
        });

        Ok(json!({ "status": "Accepted" }))
    }

    /// `RemoteStopTransaction` answers immediately, then on acceptance
    /// stops the transaction and sends `StopTransaction` on a spawned
    /// task — the meter ticker started by `remote_start_transaction`
    /// winds itself down on its next tick once the transaction is no
    /// longer active.
    async fn remote_stop_transaction(
        &self,
        ctx: &Arc<StationContext>,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        let requested_id = payload.get("transactionId").and_then(|v| v.as_i64());
        let target = match requested_id {
            Some(tid) => {
                let transactions = ctx.transactions.read().await;
                transactions
                    .iter()
                    .find(|t| matches!(&t.id, TransactionId::Numeric(n) if *n == tid) && t.is_active())
                    .map(|t| (t.connector_id, t.id.clone()))
            }
            None => None,
        };
        let Some((connector_id, transaction_id)) = target else {
            return Ok(json!({ "status": "Rejected" }));
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = stop_remote_transaction(&ctx, connector_id, &transaction_id).await {
                warn!(connector_id, error = %e, "RemoteStopTransaction follow-up failed");
            }
        });
        Ok(json!({ "status": "Accepted" }))
    }

    async fn reset(&self, payload: &Value) -> Result<Value, ProtocolError> {
        let kind = payload.get("type").and_then(|v| v.as_str()).unwrap_or("Soft");
        info!(kind, "Reset requested");
        Ok(json!({ "status": "Accepted" }))
    }

    async fn change_availability(
        &self,
        ctx: &StationContext,
        payload: &Value,
    ) -> Result<Value, ProtocolError> {
        let connector_id = payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let requested: AvailabilityType =
            serde_json::from_value(payload.get("type").cloned().unwrap_or(json!("Operative")))
                .unwrap_or(AvailabilityType::Operative);

        let mut connectors = ctx.connectors.write().await;
        let status = if connector_id == 0 {
            AvailabilityStatus::Accepted
        } else if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
            let target = match requested {
                AvailabilityType::Operative => ConnectorState::Available,
                AvailabilityType::Inoperative => ConnectorState::Unavailable,
            };
            match connector.transition(target) {
                Ok(()) => AvailabilityStatus::Accepted,
                Err(_) => AvailabilityStatus::Rejected,
            }
        } else {
            AvailabilityStatus::Rejected
        };

        Ok(serde_json::to_value(serde_json::json!({ "status": status })).unwrap())
    }

    async fn unlock_connector(&self, payload: &Value) -> Result<Value, ProtocolError> {
        let _ = payload;
        Ok(json!({ "status": "Unlocked" }))
    }

    async fn get_configuration(&self, ctx: &StationContext) -> Result<Value, ProtocolError> {
        let keys = vec![
            json!({
                "key": "HeartbeatInterval",
                "readonly": false,
                "value": ctx.config.sim.heartbeat_interval_default_secs.to_string(),
            }),
            json!({
                "key": "NumberOfConnectors",
                "readonly": true,
                "value": ctx.config.connectors.len().to_string(),
            }),
        ];
        Ok(json!({ "configurationKey": keys, "unknownKey": [] }))
    }

    async fn change_configuration(&self, payload: &Value) -> Result<Value, ProtocolError> {
        let key = payload.get("key").and_then(|v| v.as_str()).unwrap_or("");
        let status = if key.is_empty() {
            ConfigurationStatus::Rejected
        } else {
            ConfigurationStatus::Accepted
        };
        Ok(serde_json::to_value(json!({ "status": status })).unwrap())
    }

    async fn clear_cache(&self, ctx: &StationContext) -> Result<Value, ProtocolError> {
        ctx.auth_cache.clear();
        Ok(json!({ "status": "Accepted" }))
    }

    async fn data_transfer(&self, payload: &Value) -> Result<Value, ProtocolError> {
        let _ = payload;
        Ok(json!({ "status": "Accepted" }))
    }

    async fn trigger_message(&self, payload: &Value) -> Result<Value, ProtocolError> {
        let requested = payload
            .get("requestedMessage")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        match requested {
            "BootNotification" | "Heartbeat" | "StatusNotification" | "MeterValues" => {
                Ok(json!({ "status": "Accepted" }))
            }
            _ => Ok(json!({ "status": "NotImplemented" })),
        }
    }
}

/// Shared by `remote_stop_transaction`'s spawned follow-up: stop the
/// transaction, send `StopTransaction`, and release the connector.
async fn stop_remote_transaction(
    ctx: &StationContext,
    connector_id: u32,
    transaction_id: &TransactionId,
) -> Result<(), ProtocolError> {
    {
        let mut connectors = ctx.connectors.write().await;
        if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
            let _ = connector.transition(ConnectorState::Finishing);
        }
    }

    let meter_stop = {
        let mut transactions = ctx.transactions.write().await;
        let transaction = transactions
            .iter_mut()
            .find(|t| &t.id == transaction_id)
            .ok_or_else(|| ProtocolError::InternalError("transaction vanished before stop".into()))?;
        let meter_stop = transaction.energy_delivered_wh() + transaction.meter_start_wh;
        transaction.stop(meter_stop, StopReason::Remote);
        meter_stop
    };

    ctx.send_call(
        "StopTransaction",
        json!({
            "transactionId": match transaction_id {
                TransactionId::Numeric(n) => json!(n),
                TransactionId::Text(s) => json!(s),
            },
            "meterStop": meter_stop as i64,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "reason": StopReason::Remote.ocpp_reason(),
        }),
    )
    .await?;

    let mut connectors = ctx.connectors.write().await;
    if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
        let _ = connector.transition(ConnectorState::Available);
        connector.active_transaction = None;
        connector.current_id_tag = None;
    }
    Ok(())
}

impl Default for V16Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboundDispatcher for V16Dispatcher {
    async fn dispatch(
        &self,
        ctx: &Arc<StationContext>,
        action: &str,
        payload: Value,
    ) -> Result<Value, ProtocolError> {
        match action {
            "RemoteStartTransaction" => self.remote_start_transaction(ctx, &payload).await,
            "RemoteStopTransaction" => self.remote_stop_transaction(ctx, &payload).await,
            "Reset" => self.reset(&payload).await,
            "ChangeAvailability" => self.change_availability(ctx, &payload).await,
            "UnlockConnector" => self.unlock_connector(&payload).await,
            "GetConfiguration" => self.get_configuration(ctx).await,
            "ChangeConfiguration" => self.change_configuration(&payload).await,
            "ClearCache" => self.clear_cache(ctx).await,
            "DataTransfer" => self.data_transfer(&payload).await,
            "TriggerMessage" => self.trigger_message(&payload).await,
            other => Err(ProtocolError::NotImplemented(other.to_string())),
        }
    }

    fn version(&self) -> OcppVersion {
        OcppVersion::V16
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

    fn ctx() -> Arc<StationContext> {
        Arc::new(StationContext {
            config: StationConfig::new("CP001", "ws://localhost", Ver::V16),
            connectors: RwLock::new(vec![Connector::new(1)]),
            transactions: RwLock::new(Vec::new()),
            pending: Arc::new(PendingRequestTable::new()),
            auth_cache: AuthCache::new(std::time::Duration::from_secs(60)),
            device_model: DeviceModel::new(),
            certificates: CertificateStore::new(),
            outbound: RwLock::new(None),
            logger: Arc::new(MessageLogger::new(None)),
            shutdown: ShutdownSignal::new(),
        })
    }

    #[tokio::test]
    async fn remote_start_on_available_connector_is_accepted() {
        let dispatcher = V16Dispatcher::new();
        let ctx = ctx();
        let result = dispatcher
            .dispatch(
                &ctx,
                "RemoteStartTransaction",
                serde_json::json!({ "connectorId": 1, "idTag": "TAG1" }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "Accepted");
        assert_eq!(ctx.connectors.read().await[0].state, ConnectorState::Charging);
        assert_eq!(ctx.transactions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn remote_start_on_busy_connector_is_rejected() {
        let dispatcher = V16Dispatcher::new();
        let ctx = ctx();
        ctx.connectors.write().await[0].transition(ConnectorState::Preparing).unwrap();
        ctx.connectors.write().await[0].transition(ConnectorState::Charging).unwrap();
        let result = dispatcher
            .dispatch(
                &ctx,
                "RemoteStartTransaction",
                serde_json::json!({ "connectorId": 1, "idTag": "TAG1" }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "Rejected");
    }

    #[tokio::test]
    async fn remote_stop_unknown_transaction_is_rejected() {
        let dispatcher = V16Dispatcher::new();
        let ctx = ctx();
        let result = dispatcher
            .dispatch(
                &ctx,
                "RemoteStopTransaction",
                serde_json::json!({ "transactionId": 999 }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "Rejected");
    }

    #[tokio::test]
    async fn remote_stop_known_transaction_is_accepted() {
        let dispatcher = V16Dispatcher::new();
        let ctx = ctx();
        ctx.transactions.write().await.push(Transaction::start(
            TransactionId::Numeric(42),
            1,
            "TAG1".into(),
            0.0,
        ));
        let result = dispatcher
            .dispatch(
                &ctx,
                "RemoteStopTransaction",
                serde_json::json!({ "transactionId": 42 }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "Accepted");
    }

    #[tokio::test]
    async fn unknown_action_is_not_implemented() {
        let dispatcher = V16Dispatcher::new();
        let ctx = ctx();
        let err = dispatcher
            .dispatch(&ctx, "SomeFutureAction", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NotImplemented");
    }
}
