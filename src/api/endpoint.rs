pub type Endpoint = str;

pub const STATION_INFO: &Endpoint = "/station/info";

/// Query parameter carrying the upstream device id.
pub const DEVICE_ID: &str = "deviceId";
