//! OCPP 2.1 inbound action handlers.
//!
//! OCPP 2.1 is a superset of 2.0.1: rather than reimplement the shared
//! actions, this dispatcher wraps a `V201Dispatcher` by composition and
//! only adds the 2.1-only actions (certificate management, reservations,
//! charging profiles, display messages, firmware/log transfer, the local
//! list, and network profiles).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::v201::V201Dispatcher;
use super::{InboundDispatcher, StationContext};
use crate::domain::certificate::{CertHashData, CertificateEntry, CertificateType};
use crate::domain::connector::ConnectorState;
use crate::domain::ocpp::OcppVersion;
use crate::support::ProtocolError;

/// Spacing between legs of an emulated async status sequence
/// (`UpdateFirmware`'s `FirmwareStatusNotification`s, `GetLog`'s
/// `LogStatusNotification`s).
const ASYNC_SEQUENCE_STEP: Duration = Duration::from_millis(200);

pub struct V21Dispatcher {
    inner: V201Dispatcher,
}

impl V21Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: V201Dispatcher::new(),
        }
    }

    async fn certificate_signed(&self, ctx: &StationContext, payload: &Value) -> Result<Value, ProtocolError> {
        let csr_id = payload.get("certificateChain").and_then(|v| v.as_str()).unwrap_or("");
        if !ctx.certificates.is_csr_pending(csr_id) && !csr_id.is_empty() {
            return Ok(json!({ "status": "Rejected" }));
        }
        let hash = CertHashData::from_der(csr_id.as_bytes(), "1");
        ctx.certificates.install(
            uuid::Uuid::new_v4().to_string(),
            CertificateEntry {
                certificate_type: CertificateType::ChargingStation,
                hash_data: hash,
                installed_at: chrono::Utc::now(),
            },
        );
        Ok(json!({ "status": "Accepted" }))
    }

    async fn install_certificate(&self, ctx: &StationContext, payload: &Value) -> Result<Value, ProtocolError> {
        let cert_type = payload
            .get("certificateType")
            .and_then(|v| v.as_str())
            .unwrap_or("ChargingStationRootCertificate");
        let der = payload
            .get("certificate")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .as_bytes();
        let hash = CertHashData::from_der(der, "1");
        ctx.certificates.install(
            uuid::Uuid::new_v4().to_string(),
            CertificateEntry {
                certificate_type: CertificateType::ChargingStation,
                hash_data: hash,
                installed_at: chrono::Utc::now(),
            },
        );
        info!(cert_type, "InstallCertificate");
        Ok(json!({ "status": "Accepted" }))
    }

    async fn delete_certificate(&self, ctx: &StationContext, payload: &Value) -> Result<Value, ProtocolError> {
        let fingerprint = payload
            .get("certificateHashData")
            .and_then(|v| v.get("serialNumber"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let found = ctx.certificates.delete(fingerprint);
        Ok(json!({ "status": if found { "Accepted" } else { "NotFound" } }))
    }

    async fn get_installed_certificate_ids(&self, ctx: &StationContext) -> Result<Value, ProtocolError> {
        let certs = ctx.certificates.list(None);
        Ok(json!({
            "status": "Accepted",
            "certificateHashDataChain": certs.iter().map(|c| json!({
                "certificateType": format!("{:?}", c.certificate_type),
                "certificateHashData": {
                    "hashAlgorithm": c.hash_data.hash_algorithm,
                    "issuerNameHash": c.hash_data.issuer_name_hash,
                    "issuerKeyHash": c.hash_data.issuer_key_hash,
                    "serialNumber": c.hash_data.serial_number,
                }
            })).collect::<Vec<_>>(),
        }))
    }

    async fn reserve_now(&self, ctx: &StationContext, payload: &Value) -> Result<Value, ProtocolError> {
        let connector_id = payload.get("evseId").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let mut connectors = ctx.connectors.write().await;
        let status = match connectors.iter_mut().find(|c| c.id == connector_id) {
            Some(c) if c.is_available() && c.transition(ConnectorState::Reserved).is_ok() => "Accepted",
            Some(_) => "Occupied",
            None => "Rejected",
        };
        Ok(json!({ "status": status }))
    }

    async fn cancel_reservation(&self, ctx: &StationContext, payload: &Value) -> Result<Value, ProtocolError> {
        let reservation_id = payload.get("reservationId").and_then(|v| v.as_i64());
        let mut connectors = ctx.connectors.write().await;
        let found = connectors
            .iter_mut()
            .find(|c| c.state == ConnectorState::Reserved);
        let status = match found {
            Some(c) if c.transition(ConnectorState::Available).is_ok() => "Accepted",
            _ => "Rejected",
        };
        let _ = reservation_id;
        Ok(json!({ "status": status }))
    }

    /// `GetDisplayMessages` answers immediately and delivers results
    /// asynchronously via `NotifyDisplayMessages`, same shape as
    /// `GetChargingProfiles`/`ReportChargingProfiles`.
    async fn get_display_messages(&self, ctx: &Arc<StationContext>, payload: &Value) -> Result<Value, ProtocolError> {
        let request_id = payload.get("requestId").and_then(|v| v.as_i64()).unwrap_or(0);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = ctx
                .send_call(
                    "NotifyDisplayMessages",
                    json!({ "requestId": request_id, "messageInfo": [], "tbc": false }),
                )
                .await;
            if let Err(e) = result {
                warn!(station_id = %ctx.config.id, error = %e, "NotifyDisplayMessages failed");
            }
        });
        Ok(json!({ "status": "Accepted" }))
    }

    async fn get_charging_profiles(&self, ctx: &Arc<StationContext>, payload: &Value) -> Result<Value, ProtocolError> {
        let request_id = payload.get("requestId").and_then(|v| v.as_i64()).unwrap_or(0);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = ctx
                .send_call(
                    "ReportChargingProfiles",
                    json!({ "requestId": request_id, "chargingLimitSource": "CSO", "chargingProfile": [], "tbc": false }),
                )
                .await;
            if let Err(e) = result {
                warn!(station_id = %ctx.config.id, error = %e, "ReportChargingProfiles failed");
            }
        });
        Ok(json!({ "status": "Accepted" }))
    }

    /// `UpdateFirmware` answers immediately and reports progress through
    /// a `FirmwareStatusNotification` sequence, spaced out rather than
    /// sent all at once, matching what a real download/install would
    /// look like to the CSMS.
    async fn update_firmware(&self, ctx: &Arc<StationContext>, payload: &Value) -> Result<Value, ProtocolError> {
        let request_id = payload.get("requestId").and_then(|v| v.as_i64()).unwrap_or(0);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for status in ["Downloading", "Downloaded", "Installing", "Installed"] {
                tokio::time::sleep(ASYNC_SEQUENCE_STEP).await;
                let result = ctx
                    .send_call("FirmwareStatusNotification", json!({ "status": status, "requestId": request_id }))
                    .await;
                if let Err(e) = result {
                    warn!(station_id = %ctx.config.id, status, error = %e, "FirmwareStatusNotification failed");
                    break;
                }
            }
        });
        Ok(json!({ "status": "Accepted" }))
    }

    async fn get_log(&self, ctx: &Arc<StationContext>, payload: &Value) -> Result<Value, ProtocolError> {
        let request_id = payload.get("requestId").and_then(|v| v.as_i64()).unwrap_or(0);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for status in ["Uploading", "Uploaded"] {
                tokio::time::sleep(ASYNC_SEQUENCE_STEP).await;
                let result = ctx
                    .send_call("LogStatusNotification", json!({ "status": status, "requestId": request_id }))
                    .await;
                if let Err(e) = result {
                    warn!(station_id = %ctx.config.id, status, error = %e, "LogStatusNotification failed");
                    break;
                }
            }
        });
        Ok(json!({ "status": "Accepted" }))
    }

    async fn customer_information(&self, ctx: &Arc<StationContext>, payload: &Value) -> Result<Value, ProtocolError> {
        let request_id = payload.get("requestId").and_then(|v| v.as_i64()).unwrap_or(0);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = ctx
                .send_call("NotifyCustomerInformation", json!({ "requestId": request_id, "data": "", "tbc": false, "seqNo": 0 }))
                .await;
            if let Err(e) = result {
                warn!(station_id = %ctx.config.id, error = %e, "NotifyCustomerInformation failed");
            }
        });
        Ok(json!({ "status": "Accepted" }))
    }
}

impl Default for V21Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboundDispatcher for V21Dispatcher {
    async fn dispatch(
        &self,
        ctx: &Arc<StationContext>,
        action: &str,
        payload: Value,
    ) -> Result<Value, ProtocolError> {
        match action {
            "CertificateSigned" => self.certificate_signed(ctx, &payload).await,
            "InstallCertificate" => self.install_certificate(ctx, &payload).await,
            "DeleteCertificate" => self.delete_certificate(ctx, &payload).await,
            "GetInstalledCertificateIds" => self.get_installed_certificate_ids(ctx).await,
            "CostUpdated" => Ok(json!({})),
            "SetDisplayMessage" => Ok(json!({ "status": "Accepted" })),
            "GetDisplayMessages" => self.get_display_messages(ctx, &payload).await,
            "ClearDisplayMessage" => Ok(json!({ "status": "Accepted" })),
            "ReserveNow" => self.reserve_now(ctx, &payload).await,
            "CancelReservation" => self.cancel_reservation(ctx, &payload).await,
            "SetChargingProfile" => Ok(json!({ "status": "Accepted" })),
            "GetChargingProfiles" => self.get_charging_profiles(ctx, &payload).await,
            "ClearChargingProfile" => Ok(json!({ "status": "Accepted" })),
            "GetCompositeSchedule" => Ok(json!({ "status": "Accepted" })),
            "GetLocalListVersion" => Ok(json!({ "listVersion": 0 })),
            "SendLocalList" => Ok(json!({ "status": "Accepted" })),
            "UpdateFirmware" => self.update_firmware(ctx, &payload).await,
            "GetLog" => self.get_log(ctx, &payload).await,
            "SetNetworkProfile" => Ok(json!({ "status": "Accepted" })),
            "CustomerInformation" => self.customer_information(ctx, &payload).await,
            _ => self.inner.dispatch(ctx, action, payload).await,
        }
    }

    fn version(&self) -> OcppVersion {
        OcppVersion::V21
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
    use tokio::sync::RwLock;

    fn ctx() -> Arc<StationContext> {
        Arc::new(StationContext {
            config: StationConfig::new("CP001", "ws://localhost", Ver::V21),
            connectors: RwLock::new(vec![Connector::new(1)]),
            transactions: RwLock::new(Vec::new()),
            pending: Arc::new(PendingRequestTable::new()),
            auth_cache: AuthCache::new(std::time::Duration::from_secs(60)),
            device_model: DeviceModel::new(),
            certificates: CertificateStore::new(),
            outbound: RwLock::new(None),
            logger: Arc::new(MessageLogger::new(None)),
            shutdown: crate::support::ShutdownSignal::new(),
        })
    }

    #[tokio::test]
    async fn install_certificate_then_list() {
        let dispatcher = V21Dispatcher::new();
        let ctx = ctx();
        dispatcher
            .dispatch(
                &ctx,
                "InstallCertificate",
                serde_json::json!({ "certificateType": "CSMSRootCertificate", "certificate": "fake-pem" }),
            )
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(&ctx, "GetInstalledCertificateIds", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["certificateHashDataChain"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unhandled_2_1_action_falls_back_to_2_0_1() {
        let dispatcher = V21Dispatcher::new();
        let ctx = ctx();
        let result = dispatcher
            .dispatch(&ctx, "Reset", serde_json::json!({ "type": "Immediate" }))
            .await
            .unwrap();
        assert_eq!(result["status"], "Accepted");
    }

    #[tokio::test]
    async fn reserve_now_on_available_connector_is_accepted() {
        let dispatcher = V21Dispatcher::new();
        let ctx = ctx();
        let result = dispatcher
            .dispatch(&ctx, "ReserveNow", serde_json::json!({ "evseId": 1, "reservationId": 7 }))
            .await
            .unwrap();
        assert_eq!(result["status"], "Accepted");
        assert_eq!(ctx.connectors.read().await[0].state, ConnectorState::Reserved);
    }

    #[tokio::test]
    async fn cancel_reservation_restores_availability() {
        let dispatcher = V21Dispatcher::new();
        let ctx = ctx();
        dispatcher
            .dispatch(&ctx, "ReserveNow", serde_json::json!({ "evseId": 1, "reservationId": 7 }))
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(&ctx, "CancelReservation", serde_json::json!({ "reservationId": 7 }))
            .await
            .unwrap();
        assert_eq!(result["status"], "Accepted");
        assert_eq!(ctx.connectors.read().await[0].state, ConnectorState::Available);
    }

    #[tokio::test]
    async fn get_local_list_version_defaults_to_zero() {
        let dispatcher = V21Dispatcher::new();
        let ctx = ctx();
        let result = dispatcher
            .dispatch(&ctx, "GetLocalListVersion", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["listVersion"], 0);
    }
}
