//! Decides whether a detected transition is owed a notification.

use crate::api::Error;
use crate::model::{CarState, Coordinates, NotifyMeta, Station, Subscription};
use crate::settings::NotifySettings;
use crate::store::{meta_key, StateStore};
use crate::transition::TransitionEvent;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

const NOTIFIED: &str = "notified";
const LAST_SENT_AT: &str = "lastSentAt";
const IN_RANGE: &str = "inRange";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoTransition,
    NoSubscribers,
    AlreadyNotified,
    Cooldown,
    SocUnknown,
    SocAboveThreshold,
    DistanceUnknown,
    OutOfRange,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NoTransition => "no_transition",
            Reason::NoSubscribers => "no_subscribers",
            Reason::AlreadyNotified => "already_notified",
            Reason::Cooldown => "cooldown",
            Reason::SocUnknown => "soc_unknown",
            Reason::SocAboveThreshold => "soc_above_threshold",
            Reason::DistanceUnknown => "distance_unknown",
            Reason::OutOfRange => "out_of_range",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who gets a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Recipient labels of the subscriptions matching the station.
    Labels(Vec<String>),
    /// Every active channel; used when only the station toggle asked for notifications.
    AllActive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityResult {
    pub eligible: bool,
    pub reasons: Vec<Reason>,
    pub recipients: Option<Recipients>,
    pub distance_m: Option<f64>,
}

impl EligibilityResult {
    pub fn reason_list(&self) -> String {
        self.reasons
            .iter()
            .map(Reason::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Everything `evaluate` looks at for one station in one cycle.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub station: &'a Station,
    /// Reported by the API, falling back to configured coordinates.
    pub coordinates: Option<Coordinates>,
    pub event: &'a TransitionEvent,
    pub meta: &'a NotifyMeta,
    pub car: &'a CarState,
    pub now: DateTime<Utc>,
}

/// Great-circle distance in metres.
pub fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    let r = 6_371_000.0_f64;
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * r * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn distance_m(candidate: &Candidate<'_>) -> Option<f64> {
    Some(haversine_m(candidate.car.position?, candidate.coordinates?))
}

pub struct EligibilityEngine {
    settings: NotifySettings,
    subscriptions: Vec<Subscription>,
}

impl EligibilityEngine {
    pub fn new(settings: NotifySettings, subscriptions: Vec<Subscription>) -> Self {
        EligibilityEngine {
            settings,
            subscriptions: subscriptions.into_iter().filter(|s| s.enabled).collect(),
        }
    }

    pub fn settings(&self) -> &NotifySettings {
        &self.settings
    }

    /// Recipient labels of enabled subscriptions selecting `station`, without duplicates.
    pub fn subscribed_labels(&self, station: &Station) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for subscription in self.subscriptions.iter().filter(|s| s.station.matches(station)) {
            if !labels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&subscription.recipient))
            {
                labels.push(subscription.recipient.clone());
            }
        }
        labels
    }

    /// Whether the geo-fence holds for this candidate; `None` when no fence is configured or
    /// the distance cannot be computed.
    pub fn in_range(&self, candidate: &Candidate<'_>) -> Option<bool> {
        let max = self.settings.max_distance_m?;
        distance_m(candidate).map(|d| d <= max)
    }

    /// Pure decision; `decide` applies its side effects.
    pub fn evaluate(&self, candidate: &Candidate<'_>) -> EligibilityResult {
        let mut reasons = Vec::new();

        if !candidate.event.fired(self.settings.status_trigger) {
            reasons.push(Reason::NoTransition);
        }

        let labels = self.subscribed_labels(candidate.station);
        let recipients = if !labels.is_empty() {
            Some(Recipients::Labels(labels))
        } else if candidate.station.notify_on_available {
            Some(Recipients::AllActive)
        } else {
            reasons.push(Reason::NoSubscribers);
            None
        };

        if candidate.meta.notified {
            reasons.push(Reason::AlreadyNotified);
        }

        if self.settings.cooldown_min > 0 {
            let cooldown = Duration::minutes(self.settings.cooldown_min as i64);
            if let Some(last) = candidate.meta.last_sent_at {
                if candidate.now - last < cooldown {
                    reasons.push(Reason::Cooldown);
                }
            }
        }

        if let Some(threshold) = self.settings.soc_threshold {
            match candidate.car.soc {
                None => reasons.push(Reason::SocUnknown),
                Some(soc) if soc >= threshold => reasons.push(Reason::SocAboveThreshold),
                Some(_) => {}
            }
        }

        let distance = distance_m(candidate);
        if let Some(max) = self.settings.max_distance_m {
            match distance {
                None => reasons.push(Reason::DistanceUnknown),
                Some(d) if d > max => reasons.push(Reason::OutOfRange),
                Some(_) => {}
            }
        }

        EligibilityResult {
            eligible: reasons.is_empty(),
            recipients: if reasons.is_empty() { recipients } else { None },
            reasons,
            distance_m: distance,
        }
    }

    /// Evaluate and, when eligible, mark the station notified for its current free phase.
    pub async fn decide(
        &self,
        ledger: &NotifyLedger,
        candidate: &Candidate<'_>,
    ) -> Result<EligibilityResult, Error> {
        let result = self.evaluate(candidate);
        if result.eligible {
            ledger.mark_sent(&candidate.station.key, candidate.now).await?;
        } else {
            log::debug!(
                "{}: not eligible ({}; previously free: {:?}, distance: {:?} m)",
                candidate.station.name,
                result.reason_list(),
                candidate.event.prev_free_ports,
                result.distance_m.map(f64::round)
            );
        }
        Ok(result)
    }
}

/// Persisted `NotifyMeta` per station.
#[derive(Clone)]
pub struct NotifyLedger {
    store: Arc<dyn StateStore>,
}

impl NotifyLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        NotifyLedger { store }
    }

    pub async fn load(&self, station: &str) -> Result<NotifyMeta, Error> {
        let notified = self
            .store
            .value(&meta_key(station, NOTIFIED))
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let last_sent_at = self
            .store
            .value(&meta_key(station, LAST_SENT_AT))
            .await?
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        let in_range = self
            .store
            .value(&meta_key(station, IN_RANGE))
            .await?
            .and_then(|v| v.as_bool());

        Ok(NotifyMeta {
            notified,
            last_sent_at,
            in_range,
        })
    }

    pub async fn mark_sent(&self, station: &str, now: DateTime<Utc>) -> Result<(), Error> {
        self.store.set(&meta_key(station, NOTIFIED), json!(true)).await?;
        self.store
            .set(&meta_key(station, LAST_SENT_AT), json!(now.to_rfc3339()))
            .await
    }

    /// End of a free phase.
    pub async fn reset(&self, station: &str) -> Result<(), Error> {
        self.store.set(&meta_key(station, NOTIFIED), json!(false)).await
    }

    pub async fn set_in_range(&self, station: &str, in_range: Option<bool>) -> Result<(), Error> {
        match in_range {
            Some(v) => self.store.set(&meta_key(station, IN_RANGE), json!(v)).await,
            None => self.store.delete(&meta_key(station, IN_RANGE)).await,
        }
    }
}
