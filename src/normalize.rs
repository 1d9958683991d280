//! Maps raw station info responses to a canonical port list and a station-level status.

use crate::api::response::{RawPort, StationInfo};
use crate::model::{DeviceLayout, Port, Reading, Status, UNKNOWN_CITY};
use std::collections::HashSet;

const IN_USE: &[&str] = &["in_use", "charging", "occupied"];
const AVAILABLE: &str = "available";
const UNAVAILABLE: &[&str] = &["unavailable", "out_of_service", "faulted", "offline"];

/// Responses fetched for one station, shaped after its `DeviceLayout`. `None` marks a device
/// whose fetch failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Single(Option<StationInfo>),
    Dual(Option<StationInfo>, Option<StationInfo>),
}

impl Fetched {
    /// No device of `layout` answered.
    pub fn unanswered(layout: &DeviceLayout) -> Fetched {
        match layout {
            DeviceLayout::Single { .. } => Fetched::Single(None),
            DeviceLayout::Dual { .. } => Fetched::Dual(None, None),
        }
    }

    /// Every device of the station answered.
    pub fn is_complete(&self) -> bool {
        match self {
            Fetched::Single(info) => info.is_some(),
            Fetched::Dual(first, second) => first.is_some() && second.is_some(),
        }
    }

    fn responses(&self) -> Vec<&StationInfo> {
        match self {
            Fetched::Single(info) => info.iter().collect(),
            Fetched::Dual(first, second) => first.iter().chain(second.iter()).collect(),
        }
    }
}

/// Lowercase and trim a raw status, mapping missing or blank values to `unknown`.
pub fn normalize_status(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") => Status::Unknown.to_string(),
        Some(s) => s
            .chars()
            .flat_map(char::to_lowercase)
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect(),
    }
}

fn port(raw: &RawPort, outlet_number: u32) -> Port {
    Port {
        outlet_number,
        status: normalize_status(raw.status.as_deref()),
        status_v2: raw
            .status_v2
            .as_deref()
            .map(|s| normalize_status(Some(s))),
        evse_id: raw.evse_id.clone(),
        max_power_kw: raw.max_power_kw,
        plugs: raw.plugs.clone(),
    }
}

/// Use the reported outlet numbers when every port has a distinct one, positions otherwise.
fn single_device_ports(raw: &[RawPort]) -> Vec<Port> {
    let mut seen = HashSet::new();
    let reported_usable = raw
        .iter()
        .all(|p| p.outlet_number.map_or(false, |n| seen.insert(n)));

    raw.iter()
        .enumerate()
        .map(|(i, p)| {
            let outlet_number = match (reported_usable, p.outlet_number) {
                (true, Some(n)) => n,
                _ => i as u32 + 1,
            };
            port(p, outlet_number)
        })
        .collect()
}

fn dual_device_port(info: Option<&StationInfo>, outlet_number: u32) -> Port {
    info.and_then(|i| i.ports.first())
        .map(|p| port(p, outlet_number))
        .unwrap_or_else(|| Port::stub(outlet_number))
}

/// Station-level status by fixed precedence: in use, then available, then unavailable, then the
/// first port's own status.
pub fn derive_status(ports: &[Port]) -> Status {
    let statuses: Vec<&str> = ports.iter().map(Port::effective_status).collect();

    if statuses.iter().any(|s| IN_USE.contains(s)) {
        Status::InUse
    } else if statuses.iter().any(|s| *s == AVAILABLE) {
        Status::Available
    } else if statuses.iter().any(|s| UNAVAILABLE.contains(s)) {
        Status::Unavailable
    } else {
        statuses
            .first()
            .map_or(Status::Unknown, |s| Status::parse(s))
    }
}

pub fn count_free(ports: &[Port]) -> u32 {
    ports
        .iter()
        .filter(|p| p.effective_status() == AVAILABLE)
        .count() as u32
}

pub fn normalize(fetched: &Fetched) -> Reading {
    let ports = match fetched {
        Fetched::Single(info) => info
            .as_ref()
            .map(|i| single_device_ports(&i.ports))
            .unwrap_or_default(),
        Fetched::Dual(first, second) => vec![
            dual_device_port(first.as_ref(), 1),
            dual_device_port(second.as_ref(), 2),
        ],
    };

    let responses = fetched.responses();
    let city = responses
        .iter()
        .find_map(|i| i.city.clone())
        .unwrap_or_else(|| UNKNOWN_CITY.to_string());
    let coordinates = responses.iter().find_map(|i| i.coordinates);

    Reading {
        port_count: ports.len() as u32,
        free_ports: count_free(&ports),
        derived_status: derive_status(&ports),
        ports,
        city,
        coordinates,
        has_data: !responses.is_empty(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Coordinates;

    fn raw(outlet: Option<u32>, status: &str) -> RawPort {
        RawPort {
            outlet_number: outlet,
            status: Some(status.to_string()),
            ..RawPort::default()
        }
    }

    fn info(city: Option<&str>, ports: Vec<RawPort>) -> StationInfo {
        StationInfo {
            city: city.map(String::from),
            coordinates: None,
            ports,
        }
    }

    fn ports_with(statuses: &[&str]) -> Vec<Port> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| port(&raw(None, s), i as u32 + 1))
            .collect()
    }

    #[test]
    fn status_is_case_normalized() {
        assert_eq!("available", normalize_status(Some(" AVAILABLE ")));
        assert_eq!("out_of_service", normalize_status(Some("Out Of-Service")));
        assert_eq!("unknown", normalize_status(Some("")));
        assert_eq!("unknown", normalize_status(None));
    }

    #[test]
    fn derive_status_precedence() {
        assert_eq!(Status::InUse, derive_status(&ports_with(&["charging", "available"])));
        assert_eq!(Status::InUse, derive_status(&ports_with(&["available", "OCCUPIED"])));
        assert_eq!(
            Status::Available,
            derive_status(&ports_with(&["faulted", "Available"]))
        );
        assert_eq!(
            Status::Unavailable,
            derive_status(&ports_with(&["reserved", "offline"]))
        );
        assert_eq!(
            Status::Other("reserved".to_string()),
            derive_status(&ports_with(&["reserved", "planned"]))
        );
        assert_eq!(Status::Unknown, derive_status(&[]));
    }

    #[test]
    fn status_v2_is_preferred() {
        let mut p = raw(Some(1), "available");
        p.status_v2 = Some("CHARGING".to_string());
        let ports = vec![port(&p, 1)];
        assert_eq!(0, count_free(&ports));
        assert_eq!(Status::InUse, derive_status(&ports));
    }

    #[test]
    fn dual_device_station_merges_first_ports() {
        let fetched = Fetched::Dual(
            Some(info(
                Some("Alphaville"),
                vec![raw(Some(7), "available"), raw(Some(8), "available")],
            )),
            Some(info(None, vec![raw(Some(1), "charging")])),
        );
        let reading = normalize(&fetched);

        assert_eq!(2, reading.port_count);
        assert_eq!(1, reading.free_ports);
        assert_eq!(Status::InUse, reading.derived_status);
        assert_eq!(1, reading.ports[0].outlet_number);
        assert_eq!("available", reading.ports[0].status);
        assert_eq!(2, reading.ports[1].outlet_number);
        assert_eq!("charging", reading.ports[1].status);
        assert_eq!("Alphaville", reading.city);
    }

    #[test]
    fn dual_device_station_with_missing_device() {
        let fetched = Fetched::Dual(None, Some(info(Some("Beta"), vec![raw(None, "available")])));
        let reading = normalize(&fetched);

        assert_eq!(2, reading.port_count);
        assert_eq!(Port::stub(1), reading.ports[0]);
        assert_eq!(1, reading.free_ports);
        assert_eq!(Status::Available, reading.derived_status);
        assert_eq!("Beta", reading.city);
        assert!(reading.has_data);
        assert!(!fetched.is_complete());
    }

    #[test]
    fn single_device_station_keeps_all_ports() {
        let mut station = info(
            None,
            vec![
                raw(Some(1), "available"),
                raw(Some(2), "available"),
                raw(Some(3), "faulted"),
            ],
        );
        station.coordinates = Some(Coordinates { lat: 1.0, lon: 2.0 });
        let reading = normalize(&Fetched::Single(Some(station)));

        assert_eq!(3, reading.port_count);
        assert_eq!(2, reading.free_ports);
        assert_eq!(Status::Available, reading.derived_status);
        assert_eq!(UNKNOWN_CITY, reading.city);
        assert_eq!(Some(Coordinates { lat: 1.0, lon: 2.0 }), reading.coordinates);
    }

    #[test]
    fn duplicate_outlet_numbers_are_renumbered() {
        let station = info(None, vec![raw(Some(1), "available"), raw(Some(1), "faulted")]);
        let reading = normalize(&Fetched::Single(Some(station)));
        let outlets: Vec<u32> = reading.ports.iter().map(|p| p.outlet_number).collect();
        assert_eq!(vec![1, 2], outlets);
    }

    #[test]
    fn no_data_yields_unknown() {
        let reading = normalize(&Fetched::Single(None));
        assert_eq!(0, reading.port_count);
        assert_eq!(0, reading.free_ports);
        assert_eq!(Status::Unknown, reading.derived_status);
        assert!(!reading.has_data);

        let layout = DeviceLayout::Dual {
            device_id: String::from("1"),
            device_id2: String::from("2"),
        };
        let reading = normalize(&Fetched::unanswered(&layout));
        assert_eq!(2, reading.port_count);
        assert_eq!(0, reading.free_ports);
        assert_eq!(Status::Unknown, reading.derived_status);
        assert!(!reading.has_data);
    }

    #[test]
    fn normalize_is_idempotent_and_bounded() {
        let fetched = Fetched::Single(Some(info(
            Some("Gamma"),
            vec![raw(Some(2), "Available"), raw(Some(1), "in_use")],
        )));
        let first = normalize(&fetched);
        assert_eq!(first, normalize(&fetched));
        assert!(first.free_ports <= first.port_count);
    }
}
