//! Compares a fresh reading against the last persisted one and classifies the change.

use crate::api::Error;
use crate::model::{Status, TransitionRecord};
use crate::store::{meta_key, StateStore};
use serde_json::{json, Value};
use std::sync::Arc;

const LAST_FREE_PORTS: &str = "lastFreePorts";
const LAST_STATUS: &str = "lastStatus";

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub prev_free_ports: Option<u32>,
    pub prev_status: Option<Status>,
    /// Previous free-port count was known and zero.
    pub was_zero: bool,
    /// Free ports went from exactly zero to more than zero.
    pub became_free: bool,
    /// Derived status moved from a known non-available status to `available`.
    pub became_available: bool,
}

impl TransitionEvent {
    /// Whether this event counts as "the station became available". The status trigger is an
    /// optional secondary signal next to the free-port edge.
    pub fn fired(&self, status_trigger: bool) -> bool {
        self.became_free || (status_trigger && self.became_available)
    }
}

/// Pure classification of a new reading against the previous record. A missing record never
/// fires.
pub fn classify(
    prev: Option<&TransitionRecord>,
    free_ports: u32,
    status: &Status,
) -> TransitionEvent {
    let prev_free_ports = prev.map(|r| r.free_ports);
    let prev_status = prev.and_then(|r| r.status.clone());
    let was_zero = prev_free_ports == Some(0);

    TransitionEvent {
        became_free: was_zero && free_ports > 0,
        became_available: matches!(&prev_status, Some(s) if *s != Status::Available)
            && *status == Status::Available,
        was_zero,
        prev_free_ports,
        prev_status,
    }
}

/// Reads and commits `TransitionRecord`s through the state store, so a restarted process picks
/// up where the previous one left off.
#[derive(Clone)]
pub struct TransitionDetector {
    store: Arc<dyn StateStore>,
}

impl TransitionDetector {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        TransitionDetector { store }
    }

    pub async fn previous(&self, station: &str) -> Result<Option<TransitionRecord>, Error> {
        let free_ports = self
            .store
            .value(&meta_key(station, LAST_FREE_PORTS))
            .await?
            .as_ref()
            .and_then(Value::as_u64);

        let status = self
            .store
            .value(&meta_key(station, LAST_STATUS))
            .await?
            .as_ref()
            .and_then(Value::as_str)
            .map(Status::parse);

        Ok(free_ports.map(|n| TransitionRecord {
            free_ports: n as u32,
            status,
        }))
    }

    pub async fn detect(
        &self,
        station: &str,
        free_ports: u32,
        status: &Status,
    ) -> Result<TransitionEvent, Error> {
        let prev = self.previous(station).await?;
        Ok(classify(prev.as_ref(), free_ports, status))
    }

    /// Overwrite the persisted record with this cycle's values.
    pub async fn commit(
        &self,
        station: &str,
        free_ports: u32,
        status: &Status,
    ) -> Result<(), Error> {
        self.store
            .set(&meta_key(station, LAST_FREE_PORTS), json!(free_ports))
            .await?;
        self.store
            .set(&meta_key(station, LAST_STATUS), json!(status.as_str()))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn first_observation_never_fires() {
        let event = classify(None, 3, &Status::Available);
        assert!(!event.became_free);
        assert!(!event.became_available);
        assert!(!event.was_zero);
        assert_eq!(None, event.prev_free_ports);
        assert!(!event.fired(true));
    }

    #[test]
    fn status_trigger_is_secondary() {
        let prev = TransitionRecord {
            free_ports: 1,
            status: Some(Status::Unavailable),
        };
        let event = classify(Some(&prev), 1, &Status::Available);
        assert!(!event.became_free);
        assert!(event.became_available);
        assert!(!event.fired(false));
        assert!(event.fired(true));
    }

    #[test]
    fn unavailable_to_in_use_with_free_port_fires_on_edge_only() {
        let prev = TransitionRecord {
            free_ports: 0,
            status: Some(Status::Unavailable),
        };
        let event = classify(Some(&prev), 1, &Status::InUse);
        assert!(event.became_free);
        assert!(!event.became_available);
        assert_eq!(Some(Status::Unavailable), event.prev_status);
        assert_eq!(Some(0), event.prev_free_ports);
    }

    #[tokio::test]
    async fn became_free_fires_only_on_zero_to_positive_edges() {
        let detector = TransitionDetector::new(Arc::new(MemoryStore::new()));
        let readings = [2, 0, 0, 3, 3, 0, 1];
        let mut fired = Vec::new();

        for (i, free) in readings.iter().enumerate() {
            let event = detector.detect("alpha", *free, &Status::Unknown).await.unwrap();
            if event.became_free {
                fired.push(i);
            }
            detector.commit("alpha", *free, &Status::Unknown).await.unwrap();
        }

        assert_eq!(vec![3, 6], fired);
    }

    #[tokio::test]
    async fn records_are_kept_per_station() {
        let detector = TransitionDetector::new(Arc::new(MemoryStore::new()));
        detector.commit("alpha", 0, &Status::InUse).await.unwrap();

        assert!(detector.detect("alpha", 1, &Status::Available).await.unwrap().became_free);
        assert!(!detector.detect("beta", 1, &Status::Available).await.unwrap().became_free);
        assert_eq!(
            Some(TransitionRecord {
                free_ports: 0,
                status: Some(Status::InUse)
            }),
            detector.previous("alpha").await.unwrap()
        );
    }
}
