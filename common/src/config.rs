use serde::{Deserialize, Serialize};

/// Reporting interval used when no configuration overrides it.
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 30_000;
/// Post-tick delay of the cooperative loop. Also the button sampling resolution.
pub const DEFAULT_TICK_PERIOD_MS: u64 = 100;
/// How often the sensor is polled between reports.
pub const DEFAULT_SAMPLE_PERIOD_MS: u64 = 2_000;

pub const TEXT_LOG_PATH: &str = "/temperature_log.txt";
pub const CSV_LOG_PATH: &str = "/temperature_log.csv";
pub const CSV_HEADER: &str = "Timestamp,Temperature";

/// Hold durations classified on button release. Bands are half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    pub service_toggle_min_ms: u64,
    pub service_toggle_max_ms: u64,
    pub factory_reset_ms: u64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            service_toggle_min_ms: 5_000,
            service_toggle_max_ms: 6_000,
            factory_reset_ms: 10_000,
        }
    }
}

impl GestureConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.service_toggle_min_ms == 0
            || self.service_toggle_max_ms <= self.service_toggle_min_ms
        {
            self.service_toggle_min_ms = defaults.service_toggle_min_ms;
            self.service_toggle_max_ms = defaults.service_toggle_max_ms;
        }
        if self.factory_reset_ms < self.service_toggle_max_ms {
            self.factory_reset_ms = self.service_toggle_max_ms.max(defaults.factory_reset_ms);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub tick_period_ms: u64,
    pub sample_period_ms: u64,
    pub report_interval_ms: u64,
    pub gesture: GestureConfig,
    pub button_pin: i32,
    pub indicator_pin: i32,
    pub sensor_pin: i32,
    pub text_log_path: String,
    pub csv_log_path: String,
    pub portal_timeout_s: u64,
    pub time_sync_timeout_s: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: DEFAULT_TICK_PERIOD_MS,
            sample_period_ms: DEFAULT_SAMPLE_PERIOD_MS,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            gesture: GestureConfig::default(),
            button_pin: 0,
            indicator_pin: 2,
            sensor_pin: 4,
            text_log_path: TEXT_LOG_PATH.to_string(),
            csv_log_path: CSV_LOG_PATH.to_string(),
            portal_timeout_s: 180,
            time_sync_timeout_s: 30,
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.tick_period_ms = self.tick_period_ms.clamp(10, 1_000);
        self.sample_period_ms = self.sample_period_ms.clamp(self.tick_period_ms, 60_000);
        self.report_interval_ms = self.report_interval_ms.clamp(1_000, 3_600_000);
        self.gesture.sanitize();

        if self.text_log_path.trim().is_empty() {
            self.text_log_path = TEXT_LOG_PATH.to_string();
        }
        if self.csv_log_path.trim().is_empty() || self.csv_log_path == self.text_log_path {
            self.csv_log_path = CSV_LOG_PATH.to_string();
        }

        self.portal_timeout_s = self.portal_timeout_s.clamp(30, 3_600);
        self.time_sync_timeout_s = self.time_sync_timeout_s.clamp(1, 300);
    }
}

/// Stored station credentials. Empty SSID means "not provisioned".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl NetworkConfig {
    pub fn has_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }

    pub fn clear(&mut self) {
        self.wifi_ssid.clear();
        self.wifi_pass.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            timezone: "UTC".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.node.sanitize();
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.timezone = "UTC".to_string();
        }
    }
}
