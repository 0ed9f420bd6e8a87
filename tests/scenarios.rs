//! Cross-module integration scenarios: a simulated CSMS on the other end
//! of the outbound channel drives `SessionManager`/`StationContext`
//! through full charging sessions, authorization caching, device-model
//! round trips, certificate signing, and concurrent station registration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use ocpp_emulator::domain::auth_cache::{AuthCache, CachedOutcome};
use ocpp_emulator::domain::certificate::CertificateStore;
use ocpp_emulator::domain::connector::{Connector, ConnectorState};
use ocpp_emulator::domain::device_model::{AttributeType, DeviceModel, Mutability, VariableKey, VariableValue};
use ocpp_emulator::domain::frame::OcppFrame;
use ocpp_emulator::domain::ocpp::OcppVersion;
use ocpp_emulator::domain::pending::PendingRequestTable;
use ocpp_emulator::domain::station::StationConfig;
use ocpp_emulator::domain::transaction::{StopReason, TransactionId};
use ocpp_emulator::infrastructure::memory::InMemoryStationConfigRepository;
use ocpp_emulator::runtime::dispatcher::{dispatcher_for, v21::V21Dispatcher, InboundDispatcher, StationContext};
use ocpp_emulator::runtime::{create_event_bus, MessageLogger, SessionManager, StationManager};
use ocpp_emulator::support::ShutdownSignal;

fn test_ctx(connector_count: u32, version: OcppVersion) -> Arc<StationContext> {
    let connectors = (1..=connector_count).map(Connector::new).collect();
    Arc::new(StationContext {
        config: StationConfig::new("CP001", "ws://localhost:9000", version),
        connectors: RwLock::new(connectors),
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

/// Resolve the next outgoing `Call` on `rx` against `pending`, as if a CSMS
/// had replied. Returns the action name so callers can assert on ordering.
async fn reply_next(
    rx: &mut mpsc::Receiver<String>,
    pending: &PendingRequestTable,
    payload: serde_json::Value,
) -> String {
    let raw = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("CSMS reply timed out")
        .expect("outbound channel closed");
    let frame = OcppFrame::parse(&raw).unwrap();
    match frame {
        OcppFrame::Call { unique_id, action, .. } => {
            pending.resolve_result(&unique_id, payload);
            action
        }
        other => panic!("expected an outgoing Call, got {other:?}"),
    }
}

#[tokio::test]
async fn happy_path_charging_flow() {
    let ctx = test_ctx(1, OcppVersion::V16);
    let (tx, mut rx) = mpsc::channel(16);
    *ctx.outbound.write().await = Some(tx);
    let session = Arc::new(SessionManager::new(ctx.clone(), ShutdownSignal::new()));

    let pending = ctx.pending.clone();
    let csms = tokio::spawn(async move {
        let action = reply_next(&mut rx, &pending, json!({ "idTagInfo": { "status": "Accepted" } })).await;
        assert_eq!(action, "Authorize");
        let action = reply_next(
            &mut rx,
            &pending,
            json!({ "transactionId": 7001, "idTagInfo": { "status": "Accepted" } }),
        )
        .await;
        assert_eq!(action, "StartTransaction");
        rx
    });

    let transaction_id = session.start_charging(1, "USER001").await.unwrap();
    assert_eq!(transaction_id, TransactionId::Numeric(7001));

    {
        let connectors = ctx.connectors.read().await;
        assert_eq!(connectors[0].state, ConnectorState::Charging);
        assert_eq!(connectors[0].active_transaction, Some(TransactionId::Numeric(7001)));
    }

    let mut rx = csms.await.unwrap();
    let pending = ctx.pending.clone();
    let stop = tokio::spawn(async move {
        let action = reply_next(&mut rx, &pending, json!({})).await;
        assert_eq!(action, "StopTransaction");
        rx
    });

    session
        .stop_charging(1, StopReason::Local)
        .await
        .unwrap();
    let _rx = stop.await.unwrap();

    let connectors = ctx.connectors.read().await;
    assert_eq!(connectors[0].state, ConnectorState::Available);
    assert!(connectors[0].active_transaction.is_none());

    let transactions = ctx.transactions.read().await;
    let tx = transactions.iter().find(|t| t.id == TransactionId::Numeric(7001)).unwrap();
    assert!(!tx.is_active());
    assert!(tx.meter_stop_wh.is_some());
}

#[tokio::test]
async fn stopping_an_idle_connector_is_a_noop_error() {
    let ctx = test_ctx(1, OcppVersion::V16);
    let (tx, _rx) = mpsc::channel(16);
    *ctx.outbound.write().await = Some(tx);
    let session = Arc::new(SessionManager::new(ctx, ShutdownSignal::new()));

    let err = session.stop_charging(1, StopReason::Local).await.unwrap_err();
    assert!(matches!(
        err,
        ocpp_emulator::support::EmulatorError::State(
            ocpp_emulator::support::StateError::NoActiveTransaction(1)
        )
    ));
}

#[tokio::test]
async fn cached_rejection_skips_second_authorize_call() {
    let ctx = test_ctx(1, OcppVersion::V16);
    let (tx, mut rx) = mpsc::channel(16);
    *ctx.outbound.write().await = Some(tx);
    let session = Arc::new(SessionManager::new(ctx.clone(), ShutdownSignal::new()));

    let pending = ctx.pending.clone();
    let csms = tokio::spawn(async move {
        reply_next(&mut rx, &pending, json!({ "idTagInfo": { "status": "Invalid" } })).await;
        rx
    });

    let err = session.authorize("BADTAG").await.unwrap_err();
    assert!(matches!(
        err,
        ocpp_emulator::support::EmulatorError::Auth(ocpp_emulator::support::AuthError::AuthorizationRejected)
    ));
    let mut rx = csms.await.unwrap();

    // Second call within the TTL must not round-trip to the CSMS again.
    let err = session.authorize("BADTAG").await.unwrap_err();
    assert!(matches!(
        err,
        ocpp_emulator::support::EmulatorError::Auth(ocpp_emulator::support::AuthError::AuthorizationCachedReject)
    ));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn get_variables_round_trip_for_declared_and_unknown() {
    let dispatcher = dispatcher_for(OcppVersion::V201);
    let ctx = test_ctx(1, OcppVersion::V201);
    ctx.device_model.declare(
        VariableKey::new("ChargingStation", "Model"),
        VariableValue::String("Emulator-X1".to_string()),
        Mutability::ReadOnly,
    );

    let result = dispatcher
        .dispatch(
            &ctx,
            "GetVariables",
            json!({
                "getVariableData": [{
                    "component": { "name": "ChargingStation" },
                    "variable": { "name": "Model" },
                }]
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["getVariableResult"][0]["attributeStatus"], "Accepted");
    assert_eq!(result["getVariableResult"][0]["attributeValue"], "Emulator-X1");

    let result = dispatcher
        .dispatch(
            &ctx,
            "GetVariables",
            json!({
                "getVariableData": [{
                    "component": { "name": "ChargingStation" },
                    "variable": { "name": "SerialNumber" },
                }]
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["getVariableResult"][0]["attributeStatus"], "UnknownComponent");
    assert!(result["getVariableResult"][0].get("attributeValue").is_none());
}

#[tokio::test]
async fn certificate_signed_accepts_only_matching_pending_csr() {
    let dispatcher = V21Dispatcher::new();
    let ctx = test_ctx(1, OcppVersion::V21);
    let csr_id = ctx.certificates.begin_csr("ChargingStationCertificate");
    assert!(ctx.certificates.is_csr_pending(&csr_id));

    let result = dispatcher
        .dispatch(
            &ctx,
            "CertificateSigned",
            json!({ "certificateChain": csr_id, "certificateType": "ChargingStationCertificate" }),
        )
        .await
        .unwrap();
    assert_eq!(result["status"], "Accepted");
    assert_eq!(ctx.certificates.count(), 1);

    let result = dispatcher
        .dispatch(
            &ctx,
            "CertificateSigned",
            json!({ "certificateChain": "unknown-csr-id", "certificateType": "ChargingStationCertificate" }),
        )
        .await
        .unwrap();
    assert_eq!(result["status"], "Rejected");
    assert_eq!(ctx.certificates.count(), 1);
}

#[tokio::test]
async fn concurrent_station_registration_and_lookup_does_not_deadlock() {
    let defaults = ocpp_emulator::config::EmulatorConfig::default();
    let manager = Arc::new(StationManager::new(
        Arc::new(MessageLogger::new(None)),
        create_event_bus(),
        defaults.reconnect,
        Arc::new(InMemoryStationConfigRepository::new()),
        defaults.global,
    ));

    let mut handles = Vec::new();
    for i in 0..10 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("CP{:03}", i);
            manager.register(StationConfig::new(&id, "ws://localhost:9000", OcppVersion::V16));
            // Interleave registry lookups with further registrations, the
            // way concurrent admin calls would.
            let _ = manager.get(&id);
            let _ = manager.list_ids();
        }));
    }

    let result = timeout(Duration::from_secs(5), async {
        for h in handles {
            h.await.unwrap();
        }
    })
    .await;
    assert!(result.is_ok(), "registry operations deadlocked");
    assert_eq!(manager.list_ids().len(), 10);

    for i in 0..10 {
        let id = format!("CP{:03}", i);
        assert!(manager.get(&id).is_some());
        assert!(manager.stop(&id));
    }
    assert!(!manager.stop("does-not-exist"));
}

#[tokio::test]
async fn frame_codec_roundtrip_corpus() {
    let corpus = vec![
        OcppFrame::new_call("BootNotification", json!({ "chargePointVendor": "Acme", "chargePointModel": "X1" })),
        OcppFrame::new_call("Heartbeat", json!({})),
        OcppFrame::new_call(
            "MeterValues",
            json!({ "connectorId": 1, "meterValue": [{ "timestamp": "2026-01-01T00:00:00Z", "sampledValue": [] }] }),
        ),
        OcppFrame::CallResult {
            unique_id: "rt-1".to_string(),
            payload: json!({ "status": "Accepted", "interval": 300 }),
        },
        OcppFrame::error_response("rt-2", "NotSupported", "unsupported action"),
    ];

    for frame in corpus {
        let encoded = frame.serialize();
        let decoded = OcppFrame::parse(&encoded).unwrap();
        assert_eq!(decoded.unique_id(), frame.unique_id());
        assert_eq!(decoded.serialize(), encoded);
    }
}
