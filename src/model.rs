use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

type Kw = f64;

pub const UNKNOWN_CITY: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct Api {
    pub api_url: String,
    pub client: reqwest::Client,
}

/// Station-level availability derived from its ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    InUse,
    Available,
    Unavailable,
    Unknown,
    Disabled,
    /// Raw (lowercased) status of the first port when no precedence rule matched.
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::InUse => "in_use",
            Status::Available => "available",
            Status::Unavailable => "unavailable",
            Status::Unknown => "unknown",
            Status::Disabled => "disabled",
            Status::Other(s) => s,
        }
    }

    /// Inverse of `as_str`, used when reading a persisted status back.
    pub fn parse(s: &str) -> Status {
        match s {
            "in_use" => Status::InUse,
            "available" => Status::Available,
            "unavailable" => Status::Unavailable,
            "unknown" | "" => Status::Unknown,
            "disabled" => Status::Disabled,
            other => Status::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Upstream device records backing one logical station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLayout {
    Single { device_id: String },
    /// Two single-outlet devices merged into one two-port station.
    Dual { device_id: String, device_id2: String },
}

impl DeviceLayout {
    pub fn device_ids(&self) -> Vec<&str> {
        match self {
            DeviceLayout::Single { device_id } => vec![device_id.as_str()],
            DeviceLayout::Dual {
                device_id,
                device_id2,
            } => vec![device_id.as_str(), device_id2.as_str()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Station {
    pub key: String,
    pub name: String,
    pub layout: DeviceLayout,
    pub enabled: bool,
    pub notify_on_available: bool,
    /// Used only when the API reports no coordinates.
    pub coordinates: Option<Coordinates>,
}

/// Derive the object-tree key of a station from its display name.
pub fn station_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            key.push(c);
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub outlet_number: u32,
    pub status: String,
    pub status_v2: Option<String>,
    pub evse_id: Option<String>,
    pub max_power_kw: Option<Kw>,
    pub plugs: Vec<String>,
}

impl Port {
    /// Empty outlet used when a device of a dual station returned nothing.
    pub fn stub(outlet_number: u32) -> Port {
        Port {
            outlet_number,
            status: Status::Unknown.to_string(),
            status_v2: None,
            evse_id: None,
            max_power_kw: None,
            plugs: Vec::new(),
        }
    }

    /// `statusV2` when present, `status` otherwise.
    pub fn effective_status(&self) -> &str {
        self.status_v2.as_deref().unwrap_or(&self.status)
    }
}

/// Normalized result of one fetch for one station.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub ports: Vec<Port>,
    pub port_count: u32,
    pub free_ports: u32,
    pub derived_status: Status,
    pub city: String,
    pub coordinates: Option<Coordinates>,
    /// False when none of the station's devices returned data.
    pub has_data: bool,
}

/// Last observation of a station, persisted across cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub free_ports: u32,
    pub status: Option<Status>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyMeta {
    /// A notification was already sent for the current free phase.
    pub notified: bool,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub in_range: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarState {
    pub soc: Option<f64>,
    pub position: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationSelector {
    All,
    /// Matches a station key exactly or a station name case-insensitively.
    Named(String),
}

impl StationSelector {
    pub fn parse(s: &str) -> Option<StationSelector> {
        match s.trim() {
            "" => None,
            "*" => Some(StationSelector::All),
            s if s.eq_ignore_ascii_case("all") => Some(StationSelector::All),
            s => Some(StationSelector::Named(s.to_string())),
        }
    }

    pub fn matches(&self, station: &Station) -> bool {
        match self {
            StationSelector::All => true,
            StationSelector::Named(s) => {
                *s == station.key
                    || s.eq_ignore_ascii_case(&station.name)
                    || station_key(s) == station.key
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub station: StationSelector,
    pub recipient: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub instance: String,
    pub user: Option<String>,
    pub label: Option<String>,
    pub enabled: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn station_key_collapses_separators() {
        assert_eq!("city_hall_north", station_key("  City Hall -- North "));
        assert_eq!("alpha", station_key("Alpha"));
    }

    #[test]
    fn status_parse_is_inverse_of_as_str() {
        for s in [
            Status::InUse,
            Status::Available,
            Status::Unavailable,
            Status::Unknown,
            Status::Disabled,
            Status::Other("reserved".to_string()),
        ] {
            assert_eq!(s, Status::parse(s.as_str()));
        }
    }

    #[test]
    fn selector_matches_key_name_and_wildcard() {
        let station = Station {
            key: "city_hall".to_string(),
            name: "City Hall".to_string(),
            layout: DeviceLayout::Single {
                device_id: "1".to_string(),
            },
            enabled: true,
            notify_on_available: false,
            coordinates: None,
        };
        assert!(StationSelector::parse("city_hall").unwrap().matches(&station));
        assert!(StationSelector::parse("city hall").unwrap().matches(&station));
        assert!(StationSelector::parse("*").unwrap().matches(&station));
        assert!(StationSelector::parse("ALL").unwrap().matches(&station));
        assert!(!StationSelector::parse("Harbour").unwrap().matches(&station));
        assert_eq!(None, StationSelector::parse("  "));
    }
}
