//! Protocol dispatcher: routes a received `Call` from the CSMS to the
//! right version-specific handler and produces the `CallResult`/`CallError`
//! payload to send back.
//!
//! A ports-and-adapters split, one handler trait implementation per OCPP
//! version, dispatching central-system → charge-point calls arriving at
//! a station.

pub mod v16;
pub mod v201;
pub mod v21;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

use crate::domain::auth_cache::AuthCache;
use crate::domain::certificate::CertificateStore;
use crate::domain::connector::Connector;
use crate::domain::device_model::DeviceModel;
use crate::domain::message::MessageType;
use crate::domain::ocpp::OcppVersion;
use crate::domain::pending::PendingRequestTable;
use crate::domain::station::StationConfig;
use crate::domain::transaction::Transaction;
use crate::runtime::logger::{new_outbound_record, MessageLogger};
use crate::support::{ProtocolError, ShutdownSignal};

pub use v16::V16Dispatcher;
pub use v201::V201Dispatcher;
pub use v21::V21Dispatcher;

/// Shared state a dispatcher needs to answer an incoming `Call` —
/// essentially everything about "this station" except the socket itself.
pub struct StationContext {
    pub config: StationConfig,
    pub connectors: RwLock<Vec<Connector>>,
    pub transactions: RwLock<Vec<Transaction>>,
    pub pending: Arc<PendingRequestTable>,
    pub auth_cache: AuthCache,
    pub device_model: DeviceModel,
    pub certificates: CertificateStore,
    /// Frame sink for the current connection, if any. `None` while
    /// disconnected or reconnecting; handlers that need to send a `Call`
    /// from inside the dispatch loop go through this rather than holding
    /// their own channel end.
    pub outbound: RwLock<Option<mpsc::Sender<String>>>,
    pub logger: Arc<MessageLogger>,
    /// Shared with `SessionManager` and the heartbeat driver, so a
    /// dispatcher handler that spawns its own background work (e.g. a
    /// 1.6 `RemoteStartTransaction` meter ticker) winds down with the
    /// rest of the station on shutdown.
    pub shutdown: ShutdownSignal,
}

impl StationContext {
    /// Send a `Call` on the current connection and await its reply,
    /// registering with the pending table and logging the outbound frame
    /// the same way `SessionManager` and the heartbeat driver do.
    pub async fn send_call(&self, action: &str, payload: Value) -> Result<Value, ProtocolError> {
        let (frame, wait) = self.pending.register(action, payload);
        let raw = frame.serialize();
        self.logger
            .record(new_outbound_record(
                &self.config.id,
                frame.unique_id(),
                Some(action.to_string()),
                MessageType::Call,
                &raw,
            ))
            .await;
        let sender = self.outbound.read().await.clone();
        let Some(sender) = sender else {
            return Err(ProtocolError::InternalError("station is not connected".into()));
        };
        if sender.send(raw).await.is_err() {
            return Err(ProtocolError::InternalError("outbound channel closed".into()));
        }
        wait.await
    }

    /// Send a `StatusNotification` for `connector_id` reporting `status`,
    /// ignoring the reply body (a `CallResult` with an empty payload).
    pub async fn send_status_notification(
        &self,
        connector_id: u32,
        status: &'static str,
        error_code: &'static str,
    ) -> Result<(), ProtocolError> {
        self.send_call(
            "StatusNotification",
            json!({
                "connectorId": connector_id,
                "status": status,
                "errorCode": error_code,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await?;
        Ok(())
    }
}

/// Handles inbound `Call`s addressed to a station and produces the reply
/// payload. One implementation per OCPP version; `V21Dispatcher` composes
/// `V201Dispatcher` rather than reimplementing its actions.
#[async_trait]
pub trait InboundDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &Arc<StationContext>,
        action: &str,
        payload: Value,
    ) -> Result<Value, ProtocolError>;

    fn version(&self) -> OcppVersion;
}

pub fn dispatcher_for(version: OcppVersion) -> Arc<dyn InboundDispatcher> {
    match version {
        OcppVersion::V16 => Arc::new(V16Dispatcher::new()),
        OcppVersion::V201 => Arc::new(V201Dispatcher::new()),
        OcppVersion::V21 => Arc::new(V21Dispatcher::new()),
    }
}
