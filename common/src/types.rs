use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceModePayload {
    #[serde(rename = "serviceMode")]
    pub service_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    #[serde(rename = "serviceMode")]
    pub service_mode: bool,
    #[serde(rename = "reportIntervalMs")]
    pub report_interval_ms: u64,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "logAvailable")]
    pub log_available: bool,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}
