//! Module for authenticating the adapter's device identity against the platform REST api.
//!
//! The returned device token is the MQTT user name of the session opened in [`crate::mqtt`].
use serde::{Deserialize, Serialize};

use crate::config::PlatformParameters;
use crate::error::PlatformError;

#[derive(Serialize, Debug)]
struct DeviceAuthRequest<'a> {
    #[serde(rename = "deviceName")]
    device_name: &'a str,
    #[serde(rename = "activeKey")]
    active_key: &'a str,
}

#[derive(Deserialize, Debug)]
struct DeviceAuthResponse {
    #[serde(rename = "deviceToken", default)]
    device_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Token identifying an authenticated device session.
pub struct DeviceToken(pub String);

/// Url of the device authentication endpoint.
pub fn device_auth_url(params: &PlatformParameters) -> String {
    format!("{}/api/v/2/devices/{}/auth", params.platform_url.trim_end_matches('/'), params.system_key)
}

/// Authenticates the configured device.
///
/// # Returns
///
/// * `Ok(token)` - The platform accepted the device credentials.
///
/// * `Err(...)` - The platform could not be reached, rejected the credentials or answered
///     without a token.
///
pub async fn authenticate_device(params: &PlatformParameters) -> Result<DeviceToken, PlatformError> {
    let url = device_auth_url(params);
    log::info!(target: "monnit_adapter::platform", "Authenticating to platform with device: \'{}\'", params.device_name);

    let response = reqwest::Client::new()
        .post(url.as_str())
        .header("ClearBlade-SystemKey", params.system_key.as_str())
        .header("ClearBlade-SystemSecret", params.system_secret.as_str())
        .json(&DeviceAuthRequest {
            device_name: params.device_name.as_str(),
            active_key: params.active_key.as_str(),
        })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PlatformError::Rejected { status: status.as_u16(), body });
    }

    let auth = response.json::<DeviceAuthResponse>().await?;
    match auth.device_token.filter(|token| !token.is_empty()) {
        Some(token) => {
            log::debug!(target: "monnit_adapter::platform", "Device \'{}\' authenticated", params.device_name);
            Ok(DeviceToken(token))
        }
        None => Err(PlatformError::MissingToken),
    }
}
