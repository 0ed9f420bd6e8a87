//! In-memory repository implementations.
//!
//! A `DashMap`-backed implementation of a domain repository trait, used
//! for local runs and tests in place of a durable document store.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::message::MessageRecord;
use crate::domain::station::{StationConfigRepository, StationSnapshot};
use crate::runtime::logger::MessageSink;
use crate::support::RepositoryError;

/// In-memory station configuration store.
pub struct InMemoryStationConfigRepository {
    stations: DashMap<String, StationSnapshot>,
}

impl InMemoryStationConfigRepository {
    pub fn new() -> Self {
        Self {
            stations: DashMap::new(),
        }
    }
}

impl Default for InMemoryStationConfigRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StationConfigRepository for InMemoryStationConfigRepository {
    async fn list(&self) -> Result<Vec<StationSnapshot>, RepositoryError> {
        Ok(self.stations.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert(&self, snapshot: StationSnapshot) -> Result<(), RepositoryError> {
        self.stations.insert(snapshot.config.id.clone(), snapshot);
        Ok(())
    }

    async fn delete(&self, station_id: &str) -> Result<(), RepositoryError> {
        self.stations
            .remove(station_id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::Conflict(format!("unknown station {}", station_id)))
    }
}

/// In-memory message sink, bounded to the most recent `capacity` records
/// per station so a long-running emulator doesn't grow without bound.
pub struct InMemoryMessageRepository {
    capacity_per_station: usize,
    records: DashMap<String, Vec<MessageRecord>>,
}

impl InMemoryMessageRepository {
    pub fn new(capacity_per_station: usize) -> Self {
        Self {
            capacity_per_station,
            records: DashMap::new(),
        }
    }

    pub fn for_station(&self, station_id: &str) -> Vec<MessageRecord> {
        self.records
            .get(station_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryMessageRepository {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MessageSink for InMemoryMessageRepository {
    async fn store_batch(&self, batch: Vec<MessageRecord>) {
        for record in batch {
            let mut entry = self.records.entry(record.station_id.clone()).or_default();
            entry.push(record);
            if entry.len() > self.capacity_per_station {
                let overflow = entry.len() - self.capacity_per_station;
                entry.drain(0..overflow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connector::ConnectorSnapshot;
    use crate::domain::message::{Direction, MessageType};
    use crate::domain::ocpp::OcppVersion;
    use crate::domain::station::{StationConfig, StationRuntime};

    fn snapshot(id: &str) -> StationSnapshot {
        StationSnapshot {
            config: StationConfig::new(id, "ws://localhost:9000", OcppVersion::V16),
            runtime: StationRuntime::default(),
            connectors: vec![ConnectorSnapshot {
                id: 1,
                state: crate::domain::connector::ConnectorState::Available,
                active_transaction: None,
            }],
        }
    }

    #[tokio::test]
    async fn upsert_then_list_round_trips() {
        let repo = InMemoryStationConfigRepository::new();
        repo.upsert(snapshot("CP001")).await.unwrap();
        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].config.id, "CP001");
    }

    #[tokio::test]
    async fn delete_unknown_station_errors() {
        let repo = InMemoryStationConfigRepository::new();
        assert!(repo.delete("nope").await.is_err());
    }

    #[tokio::test]
    async fn message_repository_caps_per_station() {
        let repo = InMemoryMessageRepository::new(2);
        let batch = vec![
            MessageRecord::new("CP001", Direction::Outbound, MessageType::Call, "1", None, "a"),
            MessageRecord::new("CP001", Direction::Outbound, MessageType::Call, "2", None, "b"),
            MessageRecord::new("CP001", Direction::Outbound, MessageType::Call, "3", None, "c"),
        ];
        repo.store_batch(batch).await;
        let stored = repo.for_station("CP001");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].unique_id, "2");
    }
}
