pub mod endpoint;
pub mod error;
pub mod response;

use crate::model;
pub use error::Error;
use response::StationInfo;
use serde_json::Value;
use std::time::Duration;

pub fn api(api_url: String, timeout: Duration) -> Result<model::Api, Error> {
    let client = reqwest::ClientBuilder::new()
        .timeout(timeout)
        .build()
        .or(Err(Error::InternalError))?;

    Ok(model::Api {
        api_url: api_url.trim_end_matches('/').to_string(),
        client,
    })
}

/// Map transport errors and non-2xx API responses to Error
fn map_api_err(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        return Error::Timeout(error.to_string());
    }
    match error.status() {
        Some(http::StatusCode::TOO_MANY_REQUESTS) => Error::RateExceeded(error.to_string()),
        Some(status) => Error::HttpStatus(status.as_u16(), error.to_string()),
        None => Error::ApiError(error.to_string()),
    }
}

/// Process value of valid HTTP response (2xx) to identify an API-level error reported in the
/// body (`{"error": ...}` or `{"success": false}`). Carry the `value` forward otherwise.
fn map_response_status(value: Value) -> Result<Value, Error> {
    let failed = value.get("success").and_then(Value::as_bool) == Some(false)
        || value.get("error").map_or(false, |e| !e.is_null());

    if failed {
        Err(Error::ApiError(value.to_string()))
    } else {
        Ok(value)
    }
}

/// Read station info reported by a single upstream device.
pub async fn station_info(api: &model::Api, device_id: &str) -> Result<StationInfo, Error> {
    let url = format!("{}{}", api.api_url, endpoint::STATION_INFO);

    let text = api
        .client
        .get(url)
        .query(&[(endpoint::DEVICE_ID, device_id)])
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(map_api_err)?
        .text()
        .await
        .map_err(|e| Error::ApiError(format!("Error reading API response: {}", e)))?;

    log::trace!("device: {}, response_text: {}", device_id, text);

    let value = serde_json::from_str::<Value>(&text)
        .map_err(|e| Error::InvalidResponse(text.clone(), e.to_string()))
        .and_then(map_response_status)?;

    serde_json::from_value::<StationInfo>(value).map_err(Error::from)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_status_success() {
        let value = json!({"ports": []});
        assert_eq!(value, map_response_status(value.clone()).unwrap());
        assert!(map_response_status(json!({"success": true, "error": null})).is_ok());
    }

    #[test]
    fn response_status_failure() {
        assert!(matches!(
            map_response_status(json!({"success": false})),
            Err(Error::ApiError(_))
        ));
        assert!(matches!(
            map_response_status(json!({"error": "unknown device"})),
            Err(Error::ApiError(_))
        ));
    }

    #[test]
    fn api_url_trailing_slash() {
        let api = api(
            String::from("https://example.invalid/v1/"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!("https://example.invalid/v1", api.api_url);
    }
}
