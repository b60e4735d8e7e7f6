use serde::{Deserialize, Serialize};

use crate::version::DEFAULT_VERSION;

const RELEASE_API_URL: &str =
    "https://api.github.com/repos/ibnusina339/NALYTHA-Project/releases/latest";
const RELEASE_DOWNLOAD_BASE: &str =
    "https://github.com/ibnusina339/NALYTHA-Project/releases/download";

/// Placement of the version string inside the reserved persistent block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLayout {
    pub block_size: usize,
    pub offset: usize,
    pub width: usize,
}

impl Default for VersionLayout {
    fn default() -> Self {
        Self {
            block_size: 64,
            offset: 0,
            width: 20,
        }
    }
}

impl VersionLayout {
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self
                .offset
                .checked_add(self.width)
                .is_some_and(|end| end <= self.block_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub release_api_url: String,
    pub release_download_base: String,
    pub asset_marker: String,
    pub asset_suffix: String,
    pub default_version: String,
    pub fallback_version: String,
    pub fallback_url: String,
    pub user_agent: String,
    pub accept: String,
    /// Skips server certificate validation on every OTA connection.
    pub insecure_transport: bool,
    pub max_attempts: u32,
    pub reconnect_wait_ms: u64,
    pub stall_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub chunk_size: usize,
    pub max_release_body_bytes: usize,
    pub recheck_interval_secs: Option<u64>,
    pub layout: VersionLayout,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            release_api_url: RELEASE_API_URL.to_string(),
            release_download_base: RELEASE_DOWNLOAD_BASE.to_string(),
            asset_marker: "NAT-A-fw".to_string(),
            asset_suffix: ".bin".to_string(),
            default_version: DEFAULT_VERSION.to_string(),
            fallback_version: "1.0.10".to_string(),
            fallback_url: format!("{RELEASE_DOWNLOAD_BASE}/v1.0.10/NAT-A-fw-v1.0.10.bin"),
            user_agent: "ESP32".to_string(),
            accept: "application/vnd.github.v3+json".to_string(),
            insecure_transport: true,
            max_attempts: 3,
            reconnect_wait_ms: 5_000,
            stall_timeout_ms: 10_000,
            io_timeout_ms: 10_000,
            restart_delay_ms: 1_000,
            chunk_size: 512,
            max_release_body_bytes: 8_192,
            recheck_interval_secs: None,
            layout: VersionLayout::default(),
        }
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        if self.chunk_size == 0 {
            self.chunk_size = defaults.chunk_size;
        }
        if self.max_release_body_bytes == 0 {
            self.max_release_body_bytes = defaults.max_release_body_bytes;
        }
        if self.stall_timeout_ms == 0 {
            self.stall_timeout_ms = defaults.stall_timeout_ms;
        }
        if !self.layout.is_valid() {
            self.layout = defaults.layout;
        }
        if self.default_version.trim().is_empty() {
            self.default_version = defaults.default_version;
        }
        if self.recheck_interval_secs == Some(0) {
            self.recheck_interval_secs = None;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub bme280_enabled: bool,
    pub gps_enabled: bool,
    pub lock_wait_ms: u64,
    pub sea_level_hpa: f32,
    pub gps_baud: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            bme280_enabled: true,
            gps_enabled: true,
            lock_wait_ms: 100,
            sea_level_hpa: 1013.25,
            gps_baud: 9_600,
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        if !(300.0..=1100.0).contains(&self.sea_level_hpa) {
            self.sea_level_hpa = 1013.25;
        }
        if self.gps_baud == 0 {
            self.gps_baud = 9_600;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl NetworkConfig {
    /// Fills empty fields from build-time credentials. Stored values win.
    pub fn fill_missing_credentials(&mut self, ssid: Option<&str>, pass: Option<&str>) {
        if self.wifi_ssid.trim().is_empty() {
            self.wifi_ssid = ssid.unwrap_or_default().to_string();
        }
        if self.wifi_pass.is_empty() {
            self.wifi_pass = pass.unwrap_or_default().to_string();
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub ota: OtaConfig,
    pub sensors: SensorConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.ota.sanitize();
        self.sensors.sanitize();
    }
}
