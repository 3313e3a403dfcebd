//! Transport-neutral handlers for the HTTP surface. Both the host server and the
//! device server map these responses onto their own request types.

use std::fmt::Display;

use serde::Serialize;

use crate::{
    datalog::DataLog,
    mode::ServiceMode,
    storage::Storage,
    types::{NodeStatus, ServiceModePayload},
};

pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_CSV: &str = "text/csv";

pub const ROUTE_CLEAR_WIFI: &str = "/clear_wifi";
pub const ROUTE_CLEAR_DATA: &str = "/clear_data";
pub const ROUTE_IS_SERVICE_MODE: &str = "/is_service_mode";
pub const ROUTE_DOWNLOAD_LOGS: &str = "/download_logs";
pub const ROUTE_GENERATE_CSV: &str = "/generate_csv";
pub const ROUTE_ACTIVATE_SERVICE_MODE: &str = "/activate_service_mode";
pub const ROUTE_TOGGLE_SERVICE_MODE: &str = "/toggle_service_mode";
pub const ROUTE_STATUS: &str = "/api/status";
pub const ROUTE_WS: &str = "/ws";

pub const DEFAULT_DOCUMENT: &str = "index.html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn json<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self {
                status: 200,
                content_type: CONTENT_TYPE_JSON,
                body,
            },
            Err(_) => Self::text(500, "Failed to encode response."),
        }
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default()
    }
}

/// Credentials are already cleared (or failed to clear) by the caller, which also
/// schedules the restart on success.
pub fn clear_wifi<E: Display>(reset: Result<(), E>) -> ApiResponse {
    match reset {
        Ok(()) => ApiResponse::text(200, "WiFi credentials cleared. Restarting..."),
        Err(err) => ApiResponse::text(500, &format!("Failed to clear WiFi credentials: {err}")),
    }
}

pub fn clear_data<S: Storage>(log: &DataLog<S>) -> ApiResponse {
    let cleared = log.clear();
    match (cleared.removed, cleared.failures.first()) {
        (0, None) => ApiResponse::text(404, "No temperature data to clear."),
        (_, None) => ApiResponse::text(200, "Temperature data cleared."),
        (0, Some(err)) => {
            ApiResponse::text(500, &format!("Failed to clear temperature data: {err}"))
        }
        (removed, Some(err)) => ApiResponse::text(
            500,
            &format!("Temperature data partially cleared ({removed} file removed): {err}"),
        ),
    }
}

pub fn is_service_mode(mode: &ServiceMode) -> ApiResponse {
    ApiResponse::json(&ServiceModePayload {
        service_mode: mode.get(),
    })
}

pub fn download_logs<S: Storage>(log: &DataLog<S>) -> ApiResponse {
    match log.read_csv() {
        Ok(Some(body)) => ApiResponse {
            status: 200,
            content_type: CONTENT_TYPE_CSV,
            body,
        },
        Ok(None) => ApiResponse::text(404, "Log file not found."),
        Err(err) => ApiResponse::text(500, &format!("Failed to read log file: {err}")),
    }
}

pub fn generate_csv<S: Storage>(log: &DataLog<S>) -> ApiResponse {
    match log.regenerate_csv() {
        Ok(_) => ApiResponse::text(200, "CSV file generated successfully."),
        Err(err) => ApiResponse::text(500, &format!("Failed to generate CSV file: {err}")),
    }
}

pub fn activate_service_mode(mode: &ServiceMode) -> ApiResponse {
    mode.set(true);
    ApiResponse::text(200, "Service mode activated.")
}

pub fn toggle_service_mode(mode: &ServiceMode) -> ApiResponse {
    let active = mode.toggle();
    ApiResponse::text(200, &format!("Service mode {}.", ServiceMode::label(active)))
}

pub fn status<S: Storage>(
    mode: &ServiceMode,
    log: &DataLog<S>,
    report_interval_ms: u64,
    time_synced: bool,
    timezone: &str,
    uptime_ms: u64,
) -> ApiResponse {
    let log_available = matches!(log.read_text(), Ok(Some(_)));
    ApiResponse::json(&NodeStatus {
        service_mode: mode.get(),
        report_interval_ms,
        time_synced,
        timezone: timezone.to_string(),
        log_available,
        uptime_ms,
    })
}

/// Maps a request path onto a file under the static root. `None` for paths that try to
/// leave the root.
pub fn static_file_path(uri_path: &str) -> Option<String> {
    let path = uri_path
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let trimmed = path.trim_start_matches('/');

    if trimmed.split('/').any(|segment| segment == "..") {
        return None;
    }

    if trimmed.is_empty() || trimmed.ends_with('/') {
        Some(format!("/{trimmed}{DEFAULT_DOCUMENT}"))
    } else {
        Some(format!("/{trimmed}"))
    }
}

pub fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or_default() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => CONTENT_TYPE_JSON,
        "csv" => CONTENT_TYPE_CSV,
        "png" => "image/png",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        _ => CONTENT_TYPE_TEXT,
    }
}
