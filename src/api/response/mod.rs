pub mod station_info;

pub use station_info::{parse_number, RawPort, StationInfo};
