use crate::api::Error;
use crate::model::{Reading, Status};
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, TextEncoder};

lazy_static! {
    static ref FREE_PORTS_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        opts!("station_free_ports", "number of ports reporting `available`"),
        &["station"],
    )
    .unwrap();
    static ref PORT_COUNT_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        opts!("station_port_count", "number of ports of the station"),
        &["station"],
    )
    .unwrap();
    static ref STATION_IN_USE_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        opts!("station_in_use", "1 while the derived station status is `in_use`"),
        &["station"],
    )
    .unwrap();
    static ref FETCH_FAILURES_COUNTER: IntCounterVec = register_int_counter_vec!(
        opts!(
            "station_fetch_failures_total",
            "failed station API requests, per device",
        ),
        &["station", "device_id"],
    )
    .unwrap();
    static ref NOTIFICATIONS_SENT_COUNTER: IntCounterVec = register_int_counter_vec!(
        opts!("notifications_sent_total", "notifications accepted by a channel"),
        &["instance"],
    )
    .unwrap();
    static ref NOTIFICATIONS_FAILED_COUNTER: IntCounterVec = register_int_counter_vec!(
        opts!("notifications_failed_total", "notifications a channel failed to deliver"),
        &["instance"],
    )
    .unwrap();
    static ref CYCLE_DURATION_GAUGE: GaugeVec = register_gauge_vec!(
        opts!("poll_cycle_seconds", "duration of the last poll cycle"),
        &["outcome"],
    )
    .unwrap();
}

/// Feed a station's normalized reading to the gauges.
pub fn observe_reading(station: &str, reading: &Reading) {
    FREE_PORTS_GAUGE
        .with_label_values(&[station])
        .set(reading.free_ports as i64);
    PORT_COUNT_GAUGE
        .with_label_values(&[station])
        .set(reading.port_count as i64);
    STATION_IN_USE_GAUGE
        .with_label_values(&[station])
        .set((reading.derived_status == Status::InUse) as i64);
}

pub fn observe_disabled(station: &str) {
    FREE_PORTS_GAUGE.with_label_values(&[station]).set(0);
    PORT_COUNT_GAUGE.with_label_values(&[station]).set(0);
    STATION_IN_USE_GAUGE.with_label_values(&[station]).set(0);
}

pub fn fetch_failed(station: &str, device_id: &str) {
    FETCH_FAILURES_COUNTER
        .with_label_values(&[station, device_id])
        .inc();
}

pub fn delivery(instance: &str, delivered: bool) {
    if delivered {
        NOTIFICATIONS_SENT_COUNTER.with_label_values(&[instance]).inc();
    } else {
        NOTIFICATIONS_FAILED_COUNTER.with_label_values(&[instance]).inc();
    }
}

pub fn cycle_finished(seconds: f64, failed_stations: usize) {
    let outcome = if failed_stations == 0 { "ok" } else { "partial" };
    CYCLE_DURATION_GAUGE.with_label_values(&[outcome]).set(seconds);
}

/// Read metrics from Prometheus exporter registry.
pub fn read() -> Result<String, Error> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    encoder
        .encode(&metric_families, &mut buffer)
        .or(Err(Error::FormatError))?;
    String::from_utf8(buffer).or(Err(Error::FormatError))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exported_text_contains_station_gauges() {
        let reading = Reading {
            ports: Vec::new(),
            port_count: 2,
            free_ports: 1,
            derived_status: Status::InUse,
            city: String::from("Musterstadt"),
            coordinates: None,
            has_data: true,
        };
        observe_reading("metrics_test_station", &reading);
        delivery("telegram.0", true);

        let text = read().unwrap();
        assert!(text.contains("station_free_ports{station=\"metrics_test_station\"} 1"));
        assert!(text.contains("station_port_count{station=\"metrics_test_station\"} 2"));
        assert!(text.contains("notifications_sent_total"));
    }
}
