//! Settings read from `chargespot.toml` and `CS_*` environment variables.

use crate::api::Error;
use crate::model::{
    station_key, Channel, Coordinates, DeviceLayout, Station, StationSelector, Subscription,
};
use config::Config;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

pub const API_URL: &str = "https://api.chargespot.example/v1";
pub const CONFIG_FILE: &str = "chargespot";
pub const CONFIG_PATH_ENV: &str = "CHARGESPOT_CONFIG";
pub const DEFAULT_TEMPLATE: &str = "{station} ({city}): {free} of {total} ports free";

const DEFAULT_POLL_INTERVAL_MIN: u64 = 5;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NotifySettings {
    /// Minimum minutes between two notifications for one station; 0 disables the cooldown.
    #[serde(default)]
    pub cooldown_min: u64,
    /// Only notify while the car's state of charge is below this percentage.
    #[serde(default)]
    pub soc_threshold: Option<f64>,
    /// Only notify for stations within this many metres of the car.
    #[serde(default)]
    pub max_distance_m: Option<f64>,
    /// Also treat a status change to `available` as "became available".
    #[serde(default)]
    pub status_trigger: bool,
    #[serde(default = "default_template")]
    pub message_template: String,
}

impl Default for NotifySettings {
    fn default() -> Self {
        NotifySettings {
            cooldown_min: 0,
            soc_threshold: None,
            max_distance_m: None,
            status_trigger: false,
            message_template: default_template(),
        }
    }
}

/// State-store keys the car's telemetry is read from.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CarSettings {
    pub soc_key: Option<String>,
    pub latitude_key: Option<String>,
    pub longitude_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub device_id: String,
    pub device_id2: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notify_on_available: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub instance: String,
    pub user: Option<String>,
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionSettings {
    #[serde(default)]
    pub station: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_url: String,
    pub poll_interval_min: u64,
    pub fetch_timeout_secs: u64,
    pub concurrency: usize,
    pub state_file: Option<String>,
    pub messaging_url: Option<String>,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub car: CarSettings,
    #[serde(default)]
    pub stations: Vec<StationSettings>,
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSettings>,
}

/// Configuration after dropping entries that cannot be used.
#[derive(Debug, Clone)]
pub struct Validated {
    pub stations: Vec<Station>,
    pub channels: Vec<Channel>,
    pub subscriptions: Vec<Subscription>,
}

fn non_blank(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn defaults() -> Result<Config, Error> {
    let mut settings = Config::default();
    settings
        .set_default("api_url", API_URL)?
        .set_default("poll_interval_min", DEFAULT_POLL_INTERVAL_MIN as i64)?
        .set_default("fetch_timeout_secs", DEFAULT_FETCH_TIMEOUT_SECS as i64)?
        .set_default("concurrency", 1_i64)?;
    Ok(settings)
}

pub fn read_settings() -> Result<Settings, Error> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| CONFIG_FILE.to_string());

    let mut settings = defaults()?;
    settings
        .merge(config::File::with_name(&path).required(false))?
        .merge(config::Environment::with_prefix("CS").separator("__"))?;

    settings.try_into().map_err(Error::from)
}

/// Parse settings from a TOML document on top of the defaults.
pub fn from_toml(text: &str) -> Result<Settings, Error> {
    let mut settings = defaults()?;
    settings.merge(config::File::from_str(text, config::FileFormat::Toml))?;
    settings.try_into().map_err(Error::from)
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_min.max(1) * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    /// Skip malformed entries with a warning. Fails only when no usable station is left.
    pub fn validate(&self) -> Result<Validated, Error> {
        let mut keys = HashSet::new();
        let mut stations = Vec::new();

        for (i, s) in self.stations.iter().enumerate() {
            let name = s.name.trim();
            let key = station_key(name);
            let device_id = s.device_id.trim();

            if key.is_empty() || device_id.is_empty() {
                log::warn!("Skipping station #{}: name and device_id are required", i + 1);
                continue;
            }
            if !keys.insert(key.clone()) {
                log::warn!("Skipping station '{}': duplicate of an earlier station", name);
                continue;
            }

            let layout = match non_blank(s.device_id2.as_ref()) {
                Some(device_id2) => DeviceLayout::Dual {
                    device_id: device_id.to_string(),
                    device_id2,
                },
                None => DeviceLayout::Single {
                    device_id: device_id.to_string(),
                },
            };
            let coordinates = match (s.latitude, s.longitude) {
                (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
                _ => None,
            };

            stations.push(Station {
                key,
                name: name.to_string(),
                layout,
                enabled: s.enabled,
                notify_on_available: s.notify_on_available,
                coordinates,
            });
        }

        if stations.is_empty() {
            return Err(Error::Config(String::from("no stations configured")));
        }

        let channels = self
            .channels
            .iter()
            .filter_map(|c| match non_blank(Some(&c.instance)) {
                Some(instance) => Some(Channel {
                    instance,
                    user: non_blank(c.user.as_ref()),
                    label: non_blank(c.label.as_ref()),
                    enabled: c.enabled,
                }),
                None => {
                    log::warn!("Skipping channel without instance");
                    None
                }
            })
            .collect();

        let subscriptions = self
            .subscriptions
            .iter()
            .filter_map(|s| {
                let selector = StationSelector::parse(&s.station);
                let recipient = non_blank(Some(&s.recipient));
                match (selector, recipient) {
                    (Some(station), Some(recipient)) => Some(Subscription {
                        station,
                        recipient,
                        enabled: s.enabled,
                    }),
                    _ => {
                        log::warn!(
                            "Skipping malformed subscription (station: '{}', recipient: '{}')",
                            s.station,
                            s.recipient
                        );
                        None
                    }
                }
            })
            .collect();

        Ok(Validated {
            stations,
            channels,
            subscriptions,
        })
    }
}
