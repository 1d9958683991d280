use crate::model::Coordinates;
use serde::Deserialize;
use serde_json::Value;

/// Port record as reported by the station API, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPort {
    pub outlet_number: Option<u32>,
    pub status: Option<String>,
    pub status_v2: Option<String>,
    pub evse_id: Option<String>,
    pub max_power_kw: Option<f64>,
    pub plugs: Vec<String>,
}

/// One device's station info response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationInfo {
    pub city: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub ports: Vec<RawPort>,
}

/// Parse a number that may arrive as JSON number or as text such as `"22,0 kW"`.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .skip_while(|c| !(c.is_ascii_digit() || *c == '-' || *c == '.' || *c == ','))
                .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '.' | ','))
                .collect();
            /* with both separators present the last one is the decimal separator */
            let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
                (Some(comma), Some(dot)) if comma > dot => {
                    cleaned.replace('.', "").replace(',', ".")
                }
                (Some(_), Some(_)) => cleaned.replace(',', ""),
                _ => cleaned.replace(',', "."),
            };
            normalized.parse::<f64>().ok()
        }
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn first<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null())
}

fn coordinates(value: &Value) -> Option<Coordinates> {
    let source = first(value, &["coordinates", "geo", "location"]).unwrap_or(value);
    let lat = first(source, &["lat", "latitude"]).and_then(parse_number)?;
    let lon = first(source, &["lng", "lon", "longitude"]).and_then(parse_number)?;

    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Some(Coordinates { lat, lon })
    } else {
        None
    }
}

fn raw_port(value: &Value) -> RawPort {
    let max_power_kw = first(value, &["maxPowerKw", "maxPowerInKw", "maxPower"])
        .and_then(parse_number)
        .or_else(|| {
            value
                .get("powerRange")
                .and_then(|r| r.get("max"))
                .and_then(parse_number)
        });

    let plugs = value
        .get("connectors")
        .and_then(Value::as_array)
        .map(|connectors| {
            connectors
                .iter()
                .filter_map(|c| text(first(c, &["plugType", "standard", "type"]).or(Some(c))))
                .collect()
        })
        .unwrap_or_default();

    RawPort {
        outlet_number: first(value, &["outletNumber", "outlet"])
            .and_then(parse_number)
            .filter(|n| *n >= 1.0)
            .map(|n| n as u32),
        status: text(value.get("status")),
        status_v2: text(value.get("statusV2")),
        evse_id: text(first(value, &["evseId", "evse"])),
        max_power_kw,
        plugs,
    }
}

impl StationInfo {
    fn from_value(data: &Value) -> StationInfo {
        let city = data
            .get("address")
            .and_then(|a| text(first(a, &["city", "locality"])))
            .or_else(|| text(data.get("city")));

        let ports = data
            .get("ports")
            .and_then(Value::as_array)
            .map(|ports| ports.iter().map(raw_port).collect())
            .unwrap_or_default();

        StationInfo {
            city,
            coordinates: coordinates(data),
            ports,
        }
    }
}

impl<'de> Deserialize<'de> for StationInfo {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(d)?;

        /* Some deployments wrap the station in `{"data": {...}}` */
        let data = match value.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => &value,
        };

        if data.is_object() {
            Ok(StationInfo::from_value(data))
        } else {
            Err(serde::de::Error::custom(format!(
                "expected station object, got: {}",
                data
            )))
        }
    }
}
