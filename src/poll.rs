//! Periodic fetch → normalize → detect → decide → notify → persist cycle.

use crate::api::response::{parse_number, StationInfo};
use crate::api::{self, Error};
use crate::channel::{DispatchReport, Dispatcher, Messenger, Notification};
use crate::eligibility::{Candidate, EligibilityEngine, NotifyLedger, Recipients};
use crate::metrics;
use crate::model::{
    self, CarState, Coordinates, DeviceLayout, Reading, Station, Status, UNKNOWN_CITY,
};
use crate::normalize::{normalize, Fetched};
use crate::settings::{CarSettings, Settings, Validated};
use crate::shutdown::ShutdownSignal;
use crate::store::{is_below, meta_key, station_root, StateStore};
use crate::transition::TransitionDetector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

const CITY: &str = "city";
const LAST_TEST_RESULT: &str = "info.lastTestResult";

/// Where station info comes from; one call per upstream device.
#[async_trait]
pub trait StationSource: Send + Sync {
    async fn station_info(&self, device_id: &str) -> Result<StationInfo, Error>;
}

#[async_trait]
impl StationSource for model::Api {
    async fn station_info(&self, device_id: &str) -> Result<StationInfo, Error> {
        api::station_info(self, device_id).await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationReport {
    pub station: String,
    pub name: String,
    pub city: String,
    pub status: Status,
    pub free_ports: u32,
    pub port_count: u32,
    /// Every device of the station answered this cycle.
    pub complete: bool,
    pub became_free: bool,
    pub reasons: Vec<String>,
    pub delivery: Option<DispatchReport>,
    pub error: Option<String>,
}

impl StationReport {
    fn new(station: &Station, city: String, status: Status) -> Self {
        StationReport {
            station: station.key.clone(),
            name: station.name.clone(),
            city,
            status,
            free_ports: 0,
            port_count: 0,
            complete: false,
            became_free: false,
            reasons: Vec::new(),
            delivery: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub stations: Vec<StationReport>,
    pub failed: usize,
    pub notifications: usize,
}

pub struct Poller {
    source: Arc<dyn StationSource>,
    store: Arc<dyn StateStore>,
    detector: TransitionDetector,
    ledger: NotifyLedger,
    engine: EligibilityEngine,
    dispatcher: Dispatcher,
    stations: Vec<Station>,
    car: CarSettings,
    concurrency: usize,
    /// Upper bound for fetching all devices of one station.
    fetch_budget: Duration,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    last_cycle: Mutex<Option<CycleReport>>,
}

impl Poller {
    pub fn new(
        settings: &Settings,
        validated: Validated,
        source: Arc<dyn StationSource>,
        store: Arc<dyn StateStore>,
        messenger: Arc<dyn Messenger>,
    ) -> Poller {
        Poller {
            source,
            detector: TransitionDetector::new(store.clone()),
            ledger: NotifyLedger::new(store.clone()),
            store,
            engine: EligibilityEngine::new(settings.notify.clone(), validated.subscriptions),
            dispatcher: Dispatcher::new(validated.channels, messenger),
            stations: validated.stations,
            car: settings.car.clone(),
            concurrency: settings.concurrency.max(1),
            fetch_budget: settings.fetch_timeout() * 3,
            locks: DashMap::new(),
            last_cycle: Mutex::new(None),
        }
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle.lock().ok().and_then(|c| c.clone())
    }

    /// Delete persisted state of stations that are no longer configured.
    pub async fn purge_removed(&self) -> Result<usize, Error> {
        let configured: HashSet<&str> = self.stations.iter().map(|s| s.key.as_str()).collect();
        let mut stale: Vec<String> = Vec::new();

        for key in self.store.keys("meta").await? {
            if let Some(station) = key.split('.').nth(1) {
                let root = format!("meta.{}", station);
                if !configured.contains(station) && !stale.contains(&root) {
                    stale.push(root);
                }
            }
        }
        for key in self.store.keys("cities").await? {
            let parts: Vec<&str> = key.splitn(4, '.').collect();
            if parts.len() >= 3 && !configured.contains(parts[2]) {
                let root = parts[..3].join(".");
                if !stale.contains(&root) {
                    stale.push(root);
                }
            }
        }

        for root in &stale {
            log::info!("Removing state of unconfigured station: {}", root);
            self.store.delete(root).await?;
        }
        Ok(stale.len())
    }

    async fn number(&self, key: Option<&String>) -> Option<f64> {
        let key = key?;
        match self.store.value(key).await {
            Ok(value) => value.as_ref().and_then(parse_number),
            Err(e) => {
                log::warn!("Unable to read {}: {}", key, e);
                None
            }
        }
    }

    /// Car telemetry for the optional SoC and distance filters.
    pub async fn read_car(&self) -> CarState {
        let soc = self
            .number(self.car.soc_key.as_ref())
            .await
            .filter(|soc| (0.0..=100.0).contains(soc));
        let lat = self.number(self.car.latitude_key.as_ref()).await;
        let lon = self.number(self.car.longitude_key.as_ref()).await;

        let position = match (lat, lon) {
            (Some(lat), Some(lon)) if lat.abs() <= 90.0 && lon.abs() <= 180.0 => {
                Some(Coordinates { lat, lon })
            }
            _ => None,
        };

        CarState { soc, position }
    }

    async fn fetch_device(&self, station: &Station, device_id: &str) -> Option<StationInfo> {
        match self.source.station_info(device_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("{}: fetching device {} failed: {}", station.name, device_id, e);
                metrics::fetch_failed(&station.key, device_id);
                None
            }
        }
    }

    pub async fn fetch(&self, station: &Station) -> Fetched {
        match &station.layout {
            DeviceLayout::Single { device_id } => {
                Fetched::Single(self.fetch_device(station, device_id).await)
            }
            DeviceLayout::Dual {
                device_id,
                device_id2,
            } => Fetched::Dual(
                self.fetch_device(station, device_id).await,
                self.fetch_device(station, device_id2).await,
            ),
        }
    }

    /// `fetch` within the fetch budget; devices still pending when it runs out count as failed.
    async fn fetch_bounded(&self, station: &Station) -> Fetched {
        match tokio::time::timeout(self.fetch_budget, self.fetch(station)).await {
            Ok(fetched) => fetched,
            Err(_) => {
                log::warn!("{}: no answer within {}s", station.name, self.fetch_budget.as_secs());
                for device_id in station.layout.device_ids() {
                    metrics::fetch_failed(&station.key, device_id);
                }
                Fetched::unanswered(&station.layout)
            }
        }
    }

    /// Upsert `values` below `root` and delete whatever else lives there.
    async fn replace_subtree(
        &self,
        root: &str,
        values: BTreeMap<String, Value>,
    ) -> Result<(), Error> {
        for key in self.store.keys(root).await? {
            let relative = key
                .strip_prefix(root)
                .unwrap_or(key.as_str())
                .trim_start_matches('.');
            let kept = values
                .keys()
                .any(|k| k == relative || is_below(k, relative));
            if !kept {
                self.store.delete(&key).await?;
            }
        }
        for (key, value) in values {
            self.store.set(&format!("{}.{}", root, key), value).await?;
        }
        Ok(())
    }

    /// Move the station's subtree when its city changed; returns the subtree root.
    async fn station_root_for(&self, station: &Station, city: &str) -> Result<String, Error> {
        let city_key = meta_key(&station.key, CITY);
        let previous = self
            .store
            .value(&city_key)
            .await?
            .and_then(|v| v.as_str().map(String::from));

        if let Some(previous) = previous.filter(|p| p != city) {
            log::info!("{}: moved from {} to {}", station.name, previous, city);
            self.store.delete(&station_root(&previous, &station.key)).await?;
        }
        self.store.set(&city_key, json!(city)).await?;
        Ok(station_root(city, &station.key))
    }

    async fn write_reading(
        &self,
        station: &Station,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let root = self.station_root_for(station, &reading.city).await?;

        let mut values = BTreeMap::new();
        values.insert(String::from("name"), json!(station.name));
        values.insert(String::from("enabled"), json!(true));
        values.insert(String::from("status"), json!(reading.derived_status.as_str()));
        values.insert(String::from("freePorts"), json!(reading.free_ports));
        values.insert(String::from("portCount"), json!(reading.port_count));
        values.insert(String::from("dataAvailable"), json!(reading.has_data));
        values.insert(String::from("lastUpdate"), json!(now.to_rfc3339()));
        if let Some(c) = reading.coordinates {
            values.insert(String::from("latitude"), json!(c.lat));
            values.insert(String::from("longitude"), json!(c.lon));
        }

        for port in &reading.ports {
            let prefix = format!("ports.{}", port.outlet_number);
            values.insert(format!("{}.status", prefix), json!(port.status));
            if let Some(v) = &port.status_v2 {
                values.insert(format!("{}.statusV2", prefix), json!(v));
            }
            if let Some(v) = &port.evse_id {
                values.insert(format!("{}.evseId", prefix), json!(v));
            }
            if let Some(v) = port.max_power_kw {
                values.insert(format!("{}.maxPowerKw", prefix), json!(v));
            }
            if !port.plugs.is_empty() {
                values.insert(format!("{}.plugs", prefix), json!(port.plugs.join(", ")));
            }
        }

        self.replace_subtree(&root, values).await
    }

    async fn write_disabled(&self, station: &Station, now: DateTime<Utc>) -> Result<String, Error> {
        let city = self
            .store
            .value(&meta_key(&station.key, CITY))
            .await?
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| UNKNOWN_CITY.to_string());
        let root = self.station_root_for(station, &city).await?;

        let values = BTreeMap::from([
            (String::from("name"), json!(station.name)),
            (String::from("enabled"), json!(false)),
            (String::from("status"), json!(Status::Disabled.as_str())),
            (String::from("freePorts"), json!(0)),
            (String::from("portCount"), json!(0)),
            (String::from("lastUpdate"), json!(now.to_rfc3339())),
        ]);
        self.replace_subtree(&root, values).await?;
        Ok(city)
    }

    /// One station's full cycle. Never fails: store errors end up in the report's `error`, next
    /// to whatever was observed before them, and fetch failures degrade the reading.
    pub async fn process_station(&self, station: &Station, car: &CarState) -> StationReport {
        let mut report = StationReport::new(station, UNKNOWN_CITY.to_string(), Status::Unknown);
        if let Err(e) = self.advance(station, car, &mut report).await {
            log::warn!("{}: cycle failed: {}", station.name, e);
            report.error = Some(e.to_string());
        }
        report
    }

    async fn advance(
        &self,
        station: &Station,
        car: &CarState,
        report: &mut StationReport,
    ) -> Result<(), Error> {
        let now = Utc::now();

        if !station.enabled {
            report.status = Status::Disabled;
            report.city = self.write_disabled(station, now).await?;
            metrics::observe_disabled(&station.key);
            return Ok(());
        }

        let fetched = self.fetch_bounded(station).await;
        let mut reading = normalize(&fetched);
        if reading.coordinates.is_none() {
            reading.coordinates = station.coordinates;
        }

        report.city = reading.city.clone();
        report.status = reading.derived_status.clone();
        report.free_ports = reading.free_ports;
        report.port_count = reading.port_count;
        report.complete = fetched.is_complete();

        self.write_reading(station, &reading, now).await?;
        metrics::observe_reading(&station.key, &reading);

        /* Keep the previous record on degraded data so the next full reading still sees the edge */
        if !report.complete {
            log::warn!("{}: incomplete data, skipping transition detection", station.name);
            return Ok(());
        }

        let event = self
            .detector
            .detect(&station.key, reading.free_ports, &reading.derived_status)
            .await?;
        self.detector
            .commit(&station.key, reading.free_ports, &reading.derived_status)
            .await?;
        report.became_free = event.became_free;

        let mut meta = self.ledger.load(&station.key).await?;
        if reading.free_ports == 0 && meta.notified {
            self.ledger.reset(&station.key).await?;
            meta.notified = false;
        }

        let candidate = Candidate {
            station,
            coordinates: reading.coordinates,
            event: &event,
            meta: &meta,
            car,
            now,
        };

        let in_range = self.engine.in_range(&candidate);
        if in_range != meta.in_range {
            self.ledger.set_in_range(&station.key, in_range).await?;
        }

        if !event.fired(self.engine.settings().status_trigger) {
            return Ok(());
        }

        log::info!(
            "{}: became available ({} of {} ports free)",
            station.name,
            reading.free_ports,
            reading.port_count
        );

        let result = self.engine.decide(&self.ledger, &candidate).await?;
        report.reasons = result.reasons.iter().map(|r| r.to_string()).collect();

        /* Only the per-channel send timeout bounds the fan-out once the station is marked sent */
        if let Some(recipients) = &result.recipients {
            let notification = Notification::render(
                &self.engine.settings().message_template,
                &station.name,
                &reading,
            );
            report.delivery = Some(self.dispatcher.dispatch(&notification, recipients).await);
        }

        Ok(())
    }

    /// `process_station` holding the station's lock, so a manual refresh and the poll loop never
    /// interleave on one station's records.
    async fn process_locked(&self, station: &Station, car: &CarState) -> StationReport {
        let lock = self
            .locks
            .entry(station.key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        self.process_station(station, car).await
    }

    /// Process a single station right away, outside the poll schedule.
    pub async fn refresh(&self, key: &str) -> Result<StationReport, Error> {
        let station = self
            .stations
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| Error::UnknownStation(key.to_string()))?;
        let car = self.read_car().await;

        Ok(self.process_locked(station, &car).await)
    }

    /// Process every configured station once. Stations are independent; one failing does not
    /// stop the others. When `shutdown` fires, stations not yet started are skipped.
    pub async fn run_cycle(&self, shutdown: Option<&ShutdownSignal>) -> CycleReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let car = self.read_car().await;

        let car = &car;
        let stations: Vec<StationReport> = stream::iter(0..self.stations.len())
            .map(|i| async move {
                if shutdown.map_or(false, ShutdownSignal::is_triggered) {
                    None
                } else {
                    Some(self.process_locked(&self.stations[i], car).await)
                }
            })
            .buffered(self.concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        let failed = stations.iter().filter(|s| s.error.is_some()).count();
        let notifications = stations
            .iter()
            .filter_map(|s| s.delivery)
            .map(|d| d.ok)
            .sum();

        metrics::cycle_finished(started.elapsed().as_secs_f64(), failed);
        log::info!(
            "Poll cycle done: {} stations, {} failed, {} notifications sent in {:.1}s",
            stations.len(),
            failed,
            notifications,
            started.elapsed().as_secs_f64()
        );

        let report = CycleReport {
            started_at,
            stations,
            failed,
            notifications,
        };
        if let Ok(mut last) = self.last_cycle.lock() {
            *last = Some(report.clone());
        } else {
            log::trace!("Unable to lock last cycle mutex, will refresh next cycle")
        }
        report
    }

    /// Run `run_cycle` every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            self.run_cycle(Some(&shutdown)).await;
        }
        log::info!("Poll loop stopped");
    }

    /// Send a test message to every active channel and record the outcome.
    pub async fn send_test(&self) -> Result<DispatchReport, Error> {
        let notification = Notification {
            text: String::from("Test notification from chargespot"),
            station: String::from("test"),
            city: UNKNOWN_CITY.to_string(),
            free_ports: 0,
            port_count: 0,
            status: Status::Unknown,
        };
        let report = self
            .dispatcher
            .dispatch(&notification, &Recipients::AllActive)
            .await;

        self.store
            .set(
                LAST_TEST_RESULT,
                json!({"ok": report.ok, "failed": report.failed, "at": Utc::now().to_rfc3339()}),
            )
            .await?;
        Ok(report)
    }
}
