//! WebSocket client connection to the CSMS, with reconnect backoff.
//!
//! Dials out (`connect_async`) rather than accepting (`accept_hdr_async`),
//! since a station is the client side of OCPP-J. Subprotocol negotiation
//! is the mirror image of negotiating on the accept side: we advertise a
//! single `Sec-WebSocket-Protocol` value instead of picking among several.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::domain::station::{AuthMode, StationConfig};
use crate::support::TransportError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Interval between keepalive `Ping`s sent while the outbound queue is
/// otherwise idle.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long without any inbound traffic (a `Pong` or anything else) before
/// the connection is declared dead and torn down.
const PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Exponential backoff per spec: `min(base * 2^(n-1), cap)`, `n` starting at 1.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let scaled = base.saturating_mul(factor as u32);
    scaled.min(cap)
}

/// Open a single WebSocket connection to the CSMS, negotiating the
/// station's OCPP subprotocol and applying the configured auth mode.
pub async fn connect(config: &StationConfig) -> Result<WsStream, TransportError> {
    let mut request = config
        .csms_url
        .clone()
        .into_client_request()
        .map_err(|e| TransportError::ConnectFailure(e.to_string()))?;

    let subprotocol = HeaderValue::from_str(config.protocol_version.subprotocol())
        .map_err(|e| TransportError::ConnectFailure(e.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", subprotocol);

    match &config.auth {
        AuthMode::None => {}
        AuthMode::Basic { username, password } => {
            let token = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("{}:{}", username, password),
            );
            let value = HeaderValue::from_str(&format!("Basic {}", token))
                .map_err(|e| TransportError::ConnectFailure(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
        AuthMode::Bearer { token } => {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::ConnectFailure(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
    }

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::ConnectFailure(e.to_string()))?;

    info!(
        station_id = config.id.as_str(),
        status = response.status().as_u16(),
        "connected to CSMS"
    );

    Ok(stream)
}

/// Split a connected stream into a raw outbound sender and inbound text
/// receiver, spawning pump tasks for each direction. The caller drives
/// business logic by reading from `inbound` and pushing frames onto the
/// returned `mpsc::Sender`.
pub fn spawn_io_pumps(
    stream: WsStream,
    station_id: String,
) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    let (mut write, mut read) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(256);

    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let write_station_id = station_id.clone();
    let writer_activity = last_activity.clone();
    tokio::spawn(async move {
        let mut ticker = interval(PING_INTERVAL);
        ticker.tick().await; // first tick fires immediately, skip it
        loop {
            tokio::select! {
                maybe_text = outbound_rx.recv() => {
                    match maybe_text {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(station_id = write_station_id.as_str(), error = %e, "write failed, closing");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let idle = writer_activity.lock().unwrap().elapsed();
                    if idle > PONG_TIMEOUT {
                        warn!(station_id = write_station_id.as_str(), idle_secs = idle.as_secs(), "no inbound traffic, closing");
                        break;
                    }
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        warn!(station_id = write_station_id.as_str(), error = %e, "ping failed, closing");
                        break;
                    }
                }
            }
        }
    });

    let reader_activity = last_activity;
    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    *reader_activity.lock().unwrap() = Instant::now();
                    if inbound_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    *reader_activity.lock().unwrap() = Instant::now();
                }
                Ok(Message::Close(frame)) => {
                    info!(station_id = station_id.as_str(), ?frame, "CSMS closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(station_id = station_id.as_str(), error = %e, "read failed, closing");
                    break;
                }
            }
        }
    });

    (outbound_tx, inbound_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(reconnect_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3, base, cap), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4, base, cap), Duration::from_secs(8));
    }

    #[test]
    fn backoff_respects_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        assert_eq!(reconnect_delay(10, base, cap), cap);
    }
}
