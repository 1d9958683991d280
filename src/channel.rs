//! Fans a notification out to the configured messaging channels.

use crate::api::Error;
use crate::eligibility::Recipients;
use crate::metrics;
use crate::model::{Channel, Reading, Status};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Messaging adapter families a channel instance may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Addressed by user alias.
    Telegram,
    /// Addressed by phone number.
    WhatsApp,
    /// The adapter owns its recipient list.
    Pushover,
}

const SUPPORTED: &[(&str, Family)] = &[
    ("telegram", Family::Telegram),
    ("whatsapp-cmb", Family::WhatsApp),
    ("pushover", Family::Pushover),
];

impl Family {
    /// Family of an instance id such as `telegram.0`; `None` for anything not allow-listed.
    pub fn of_instance(instance: &str) -> Option<Family> {
        let prefix = instance.split('.').next()?.trim().to_ascii_lowercase();
        SUPPORTED
            .iter()
            .find(|(name, _)| *name == prefix)
            .map(|(_, family)| *family)
    }

    pub fn payload(self, notification: &Notification, channel: &Channel) -> Value {
        let payload = match self {
            Family::Telegram => json!({
                "text": notification.text,
                "user": channel.user,
                "station": notification.station,
                "city": notification.city,
                "freePorts": notification.free_ports,
                "portCount": notification.port_count,
                "status": notification.status,
            }),
            Family::WhatsApp => json!({
                "text": notification.text,
                "phone": channel.user,
            }),
            Family::Pushover => json!({
                "message": notification.text,
                "title": format!("{} ({})", notification.station, notification.city),
            }),
        };
        prune_nulls(payload)
    }
}

/// Drop null members from objects, recursively.
pub fn prune_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, prune_nulls(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(prune_nulls).collect()),
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub text: String,
    pub station: String,
    pub city: String,
    pub free_ports: u32,
    pub port_count: u32,
    pub status: Status,
}

impl Notification {
    /// Fill `{station}`, `{city}`, `{free}`, `{total}` and `{status}` in `template`.
    pub fn render(template: &str, station: &str, reading: &Reading) -> Notification {
        let text = template
            .replace("{station}", station)
            .replace("{city}", &reading.city)
            .replace("{free}", &reading.free_ports.to_string())
            .replace("{total}", &reading.port_count.to_string())
            .replace("{status}", reading.derived_status.as_str());

        Notification {
            text,
            station: station.to_string(),
            city: reading.city.clone(),
            free_ports: reading.free_ports,
            port_count: reading.port_count,
            status: reading.derived_status.clone(),
        }
    }
}

/// Sends a payload to a named messaging adapter instance.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, instance: &str, payload: &Value) -> Result<(), Error>;
}

/// Posts payloads to `{url}/{instance}` of the host's messaging bridge.
pub struct HttpMessenger {
    url: String,
    client: reqwest::Client,
}

impl HttpMessenger {
    pub fn new(url: &str) -> Result<HttpMessenger, Error> {
        let client = reqwest::ClientBuilder::new()
            .timeout(SEND_TIMEOUT)
            .build()
            .or(Err(Error::InternalError))?;
        Ok(HttpMessenger {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    async fn send(&self, instance: &str, payload: &Value) -> Result<(), Error> {
        self.client
            .post(format!("{}/{}", self.url, instance))
            .json(payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|e| Error::Delivery {
                instance: instance.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Only logs; used when no messaging bridge is configured.
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send(&self, instance: &str, payload: &Value) -> Result<(), Error> {
        log::info!("[{}] {}", instance, payload);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ActiveChannel {
    pub channel: Channel,
    pub family: Family,
}

impl ActiveChannel {
    fn answers_to(&self, label: &str) -> bool {
        let matches =
            |s: &Option<String>| s.as_deref().map_or(false, |s| s.eq_ignore_ascii_case(label));
        matches(&self.channel.label) || matches(&self.channel.user)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub ok: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    channels: Vec<ActiveChannel>,
    messenger: Arc<dyn Messenger>,
}

impl Dispatcher {
    /// Keep enabled channels of a supported family; warn about the rest.
    pub fn new(channels: Vec<Channel>, messenger: Arc<dyn Messenger>) -> Dispatcher {
        let channels = channels
            .into_iter()
            .filter(|c| c.enabled)
            .filter_map(|channel| match Family::of_instance(&channel.instance) {
                Some(family) => Some(ActiveChannel { channel, family }),
                None => {
                    log::warn!(
                        "Ignoring channel {}: unsupported messaging adapter",
                        channel.instance
                    );
                    None
                }
            })
            .collect();

        Dispatcher {
            channels,
            messenger,
        }
    }

    pub fn active(&self) -> &[ActiveChannel] {
        &self.channels
    }

    pub fn resolve(&self, recipients: &Recipients) -> Vec<&ActiveChannel> {
        match recipients {
            Recipients::AllActive => self.channels.iter().collect(),
            Recipients::Labels(labels) => self
                .channels
                .iter()
                .filter(|c| labels.iter().any(|l| c.answers_to(l)))
                .collect(),
        }
    }

    /// Deliver to each resolved channel independently; failures are counted, not returned.
    pub async fn dispatch(
        &self,
        notification: &Notification,
        recipients: &Recipients,
    ) -> DispatchReport {
        let targets = self.resolve(recipients);
        if targets.is_empty() {
            log::warn!(
                "{}: no active channel matches {:?}",
                notification.station,
                recipients
            );
        }

        let mut report = DispatchReport::default();
        for target in targets {
            let instance = &target.channel.instance;
            let payload = target.family.payload(notification, &target.channel);

            let send = self.messenger.send(instance, &payload);
            let result = match tokio::time::timeout(SEND_TIMEOUT, send).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("sending to {}", instance))),
            };

            match result {
                Ok(()) => {
                    report.ok += 1;
                    metrics::delivery(instance, true);
                    log::info!("{}: notification sent via {}", notification.station, instance);
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::delivery(instance, false);
                    log::warn!("{}: {}", notification.station, e);
                }
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::Mutex;

    /// Records every payload; fails for instances listed in `failing`. Each send takes `delay`.
    #[derive(Default)]
    pub struct RecordingMessenger {
        pub sent: Mutex<Vec<(String, Value)>>,
        pub failing: Vec<String>,
        pub delay: Duration,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(&self, instance: &str, payload: &Value) -> Result<(), Error> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.iter().any(|f| f == instance) {
                return Err(Error::Delivery {
                    instance: instance.to_string(),
                    reason: String::from("rejected"),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((instance.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn channel(instance: &str, user: Option<&str>, label: Option<&str>) -> Channel {
        Channel {
            instance: instance.to_string(),
            user: user.map(String::from),
            label: label.map(String::from),
            enabled: true,
        }
    }

    fn notification() -> Notification {
        Notification {
            text: String::from("Alpha (Musterstadt): 1 of 2 ports free"),
            station: String::from("Alpha"),
            city: String::from("Musterstadt"),
            free_ports: 1,
            port_count: 2,
            status: Status::InUse,
        }
    }

    #[test]
    fn family_allow_list() {
        assert_eq!(Some(Family::Telegram), Family::of_instance("telegram.0"));
        assert_eq!(Some(Family::WhatsApp), Family::of_instance("whatsapp-cmb.1"));
        assert_eq!(Some(Family::Pushover), Family::of_instance("Pushover.0"));
        assert_eq!(None, Family::of_instance("email.0"));
        assert_eq!(None, Family::of_instance("telegramx.0"));
        assert_eq!(None, Family::of_instance(""));
    }

    #[test]
    fn payload_shapes() {
        let n = notification();

        let telegram = Family::Telegram.payload(&n, &channel("telegram.0", Some("max"), None));
        assert_eq!(
            json!({
                "text": n.text,
                "user": "max",
                "station": "Alpha",
                "city": "Musterstadt",
                "freePorts": 1,
                "portCount": 2,
                "status": "in_use"
            }),
            telegram
        );

        let telegram = Family::Telegram.payload(&n, &channel("telegram.0", None, None));
        assert!(telegram.get("user").is_none());

        let whatsapp =
            Family::WhatsApp.payload(&n, &channel("whatsapp-cmb.0", Some("+4912345"), None));
        assert_eq!(json!({"text": n.text, "phone": "+4912345"}), whatsapp);

        let pushover = Family::Pushover.payload(&n, &channel("pushover.0", Some("ignored"), None));
        assert_eq!(
            json!({"message": n.text, "title": "Alpha (Musterstadt)"}),
            pushover
        );
    }

    #[test]
    fn prune_nulls_recurses() {
        assert_eq!(
            json!({"a": 1, "b": {"d": [null, 2]}}),
            prune_nulls(json!({"a": 1, "n": null, "b": {"c": null, "d": [null, 2]}}))
        );
    }

    #[test]
    fn render_template() {
        let reading = Reading {
            ports: Vec::new(),
            port_count: 4,
            free_ports: 3,
            derived_status: Status::Available,
            city: String::from("Musterstadt"),
            coordinates: None,
            has_data: true,
        };
        let n = Notification::render("{station}/{city}: {free}/{total} {status}", "Beta", &reading);
        assert_eq!("Beta/Musterstadt: 3/4 available", n.text);
        assert_eq!(3, n.free_ports);
    }

    #[test]
    fn unsupported_and_disabled_channels_are_dropped() {
        let mut disabled = channel("telegram.1", None, None);
        disabled.enabled = false;
        let dispatcher = Dispatcher::new(
            vec![
                channel("telegram.0", None, None),
                channel("email.0", None, None),
                disabled,
            ],
            Arc::new(LogMessenger),
        );
        assert_eq!(1, dispatcher.active().len());
        assert_eq!("telegram.0", dispatcher.active()[0].channel.instance);
    }

    #[test]
    fn labels_resolve_by_label_or_user() {
        let dispatcher = Dispatcher::new(
            vec![
                channel("telegram.0", Some("max"), Some("family")),
                channel("whatsapp-cmb.0", Some("+49123"), Some("work")),
                channel("pushover.0", None, Some("Family")),
            ],
            Arc::new(LogMessenger),
        );

        let instances = |r: &Recipients| -> Vec<String> {
            dispatcher
                .resolve(r)
                .iter()
                .map(|c| c.channel.instance.clone())
                .collect()
        };

        assert_eq!(
            vec!["telegram.0", "pushover.0"],
            instances(&Recipients::Labels(vec!["family".to_string()]))
        );
        assert_eq!(
            vec!["whatsapp-cmb.0"],
            instances(&Recipients::Labels(vec!["+49123".to_string()]))
        );
        assert_eq!(3, instances(&Recipients::AllActive).len());
        assert!(instances(&Recipients::Labels(vec!["nobody".to_string()])).is_empty());
    }

    #[tokio::test]
    async fn one_failing_channel_does_not_stop_the_others() {
        let messenger = Arc::new(RecordingMessenger {
            failing: vec!["whatsapp-cmb.0".to_string()],
            ..RecordingMessenger::default()
        });
        let dispatcher = Dispatcher::new(
            vec![
                channel("telegram.0", Some("max"), None),
                channel("whatsapp-cmb.0", Some("+49123"), None),
                channel("pushover.0", None, None),
            ],
            messenger.clone(),
        );

        let report = dispatcher
            .dispatch(&notification(), &Recipients::AllActive)
            .await;

        assert_eq!(DispatchReport { ok: 2, failed: 1 }, report);
        let sent: Vec<String> = messenger
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(i, _)| i.clone())
            .collect();
        assert_eq!(vec!["telegram.0", "pushover.0"], sent);
    }
}
