use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{broadcast, Mutex},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use templog_common::{
    api::{self, ApiResponse},
    clock::{system_time_looks_synced, wait_for_sync},
    monotonic_ms, Board, Broadcaster, DataLog, FsStorage, GestureAction, ReportOutcome,
    RuntimeConfig, Scheduler, ServiceMode, SyncOutcome, TemperatureReading, TemperatureSensor,
    Tick, TickOutcome, ZonedClock,
};

const WS_CHANNEL_CAPACITY: usize = 16;
const RESTART_DELAY_MS: u64 = 500;

#[derive(Clone)]
struct AppState {
    mode: ServiceMode,
    log: Arc<DataLog<FsStorage>>,
    network: HostNetwork,
    hub: WsHub,
    time_synced: Arc<AtomicBool>,
    timezone: Arc<String>,
    report_interval_ms: u64,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Stands in for the station interface; credentials live in `runtime.json`.
#[derive(Clone)]
struct HostNetwork {
    store: AppStore,
}

/// Real-time fan-out to every connected WebSocket client.
#[derive(Clone)]
struct WsHub {
    tx: broadcast::Sender<String>,
}

struct HostBoard {
    button: Arc<AtomicBool>,
    indicator: bool,
}

/// Hardware integration point: the ESP32 build reads a DS18B20 instead.
struct SimulatedSensor {
    samples: u64,
    disconnected: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("TEMPLOG_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.templog"));
    let store = AppStore::new(&data_dir);

    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if let Some(interval) = std::env::var("TEMPLOG_REPORT_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        runtime.node.report_interval_ms = interval;
    }
    runtime.sanitize();

    info!(
        "runtime config loaded: tick={}ms, sample period={}ms, report interval={}ms, timezone=`{}`",
        runtime.node.tick_period_ms,
        runtime.node.sample_period_ms,
        runtime.node.report_interval_ms,
        runtime.timezone
    );

    let network = HostNetwork { store };
    network.connect().await.context("network startup failed")?;

    let sync_timeout = Duration::from_secs(runtime.node.time_sync_timeout_s);
    let sync = tokio::task::spawn_blocking(move || {
        wait_for_sync(
            sync_timeout,
            Duration::from_secs(1),
            system_time_looks_synced,
            std::thread::sleep,
        )
    })
    .await
    .context("time sync task failed")?;
    let time_synced = Arc::new(AtomicBool::new(false));
    match sync {
        SyncOutcome::Synchronized { waited } => {
            time_synced.store(true, Ordering::Relaxed);
            info!("time synchronized after {}ms", waited.as_millis());
        }
        SyncOutcome::TimedOut => warn!(
            "time sync timed out after {}s; log timestamps will be wrong",
            runtime.node.time_sync_timeout_s
        ),
    }

    let storage = FsStorage::new(data_dir.join("fs"));
    let log = Arc::new(DataLog::from_config(storage, &runtime.node));
    let mode = ServiceMode::new();
    let hub = WsHub::new();
    let button = Arc::new(AtomicBool::new(false));

    spawn_button_console(button.clone());

    let scheduler = Scheduler::new(
        &runtime.node,
        HostBoard {
            button,
            indicator: false,
        },
        SimulatedSensor {
            samples: 0,
            disconnected: std::env::var("TEMPLOG_SIM_DISCONNECTED").is_ok(),
        },
        hub.clone(),
        ZonedClock::new(&runtime.timezone),
        log.clone(),
        mode.clone(),
    );
    spawn_control_loop(scheduler, network.clone(), runtime.node.tick_period_ms);

    let app_state = AppState {
        mode,
        log,
        network,
        hub,
        time_synced,
        timezone: Arc::new(runtime.timezone.clone()),
        report_interval_ms: runtime.node.report_interval_ms,
    };

    let web_root = std::env::var("TEMPLOG_WEB_ROOT")
        .unwrap_or_else(|_| format!("{}/web", env!("CARGO_MANIFEST_DIR")));
    let app = Router::new()
        .route(api::ROUTE_CLEAR_WIFI, get(handle_clear_wifi))
        .route(api::ROUTE_CLEAR_DATA, get(handle_clear_data))
        .route(api::ROUTE_IS_SERVICE_MODE, get(handle_is_service_mode))
        .route(api::ROUTE_DOWNLOAD_LOGS, get(handle_download_logs))
        .route(api::ROUTE_GENERATE_CSV, get(handle_generate_csv))
        .route(
            api::ROUTE_ACTIVATE_SERVICE_MODE,
            get(handle_activate_service_mode),
        )
        .route(api::ROUTE_TOGGLE_SERVICE_MODE, get(handle_toggle_service_mode))
        .route(api::ROUTE_STATUS, get(handle_get_status))
        .route(api::ROUTE_WS, get(handle_ws))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("TEMPLOG_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http server at {addr}"))?;

    info!("sensor node listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(
    mut scheduler: Scheduler<HostBoard, SimulatedSensor, WsHub, ZonedClock, FsStorage>,
    network: HostNetwork,
    tick_period_ms: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_period_ms));
        loop {
            interval.tick().await;
            let tick = scheduler.tick(monotonic_ms());
            log_tick(&tick);

            if let TickOutcome::FactoryReset = tick.outcome {
                if let Err(err) = network.reset_credentials().await {
                    warn!("failed to clear wifi credentials: {err:#}");
                }
                restart_now();
            }
        }
    });
}

fn log_tick(tick: &Tick) {
    for action in &tick.gestures {
        match action {
            GestureAction::Indicator(_) => debug!("{action}"),
            _ => info!("{action}"),
        }
    }

    if let Some(active) = tick.service_mode_changed {
        info!("Service mode {}", ServiceMode::label(active));
    }

    match &tick.outcome {
        TickOutcome::Held | TickOutcome::Idle => {}
        TickOutcome::FactoryReset => warn!("factory reset requested from button"),
        TickOutcome::Ran(outcome) => log_report(outcome),
    }
}

fn log_report(outcome: &ReportOutcome) {
    match outcome {
        ReportOutcome::Paused => debug!("{outcome}"),
        ReportOutcome::SensorDisconnected => warn!("{outcome}"),
        ReportOutcome::NotDue { .. } => debug!("{outcome}"),
        ReportOutcome::Reported {
            append, regenerate, ..
        } => {
            info!("{outcome}");
            if let Err(err) = append {
                warn!("failed to append temperature log: {err}");
            }
            if let Err(err) = regenerate {
                warn!("failed to regenerate csv report: {err}");
            }
        }
    }
}

/// Reads `press`, `release` and `hold <ms>` from stdin to drive the simulated button.
fn spawn_button_console(button: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!("button console unavailable: {err}");
                    break;
                }
            };
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("press"), _) => button.store(true, Ordering::Relaxed),
                (Some("release"), _) => button.store(false, Ordering::Relaxed),
                (Some("hold"), Some(ms)) => match ms.parse::<u64>() {
                    Ok(ms) => {
                        button.store(true, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        button.store(false, Ordering::Relaxed);
                    }
                    Err(_) => warn!("usage: hold <milliseconds>"),
                },
                (None, _) => {}
                _ => warn!("unknown command `{line}` (press | release | hold <ms>)"),
            }
        }
    });
}

async fn handle_clear_wifi(State(state): State<AppState>) -> Response {
    let reset = state
        .network
        .reset_credentials()
        .await
        .map_err(|err| format!("{err:#}"));
    let restart = reset.is_ok();
    let response = api::clear_wifi(reset);

    if restart {
        schedule_restart();
    }
    into_response(response)
}

async fn handle_clear_data(State(state): State<AppState>) -> Response {
    into_response(api::clear_data(&state.log))
}

async fn handle_is_service_mode(State(state): State<AppState>) -> Response {
    into_response(api::is_service_mode(&state.mode))
}

async fn handle_download_logs(State(state): State<AppState>) -> Response {
    into_response(api::download_logs(&state.log))
}

async fn handle_generate_csv(State(state): State<AppState>) -> Response {
    into_response(api::generate_csv(&state.log))
}

async fn handle_activate_service_mode(State(state): State<AppState>) -> Response {
    info!("service mode activated over http");
    into_response(api::activate_service_mode(&state.mode))
}

async fn handle_toggle_service_mode(State(state): State<AppState>) -> Response {
    let response = api::toggle_service_mode(&state.mode);
    info!("service mode toggled over http: {}", response.body_str());
    into_response(response)
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    into_response(api::status(
        &state.mode,
        &state.log,
        state.report_interval_ms,
        state.time_synced.load(Ordering::Relaxed),
        &state.timezone,
        monotonic_ms(),
    ))
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.hub.tx.subscribe();
    ws.on_upgrade(move |socket| serve_ws_client(socket, rx))
}

async fn serve_ws_client(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    info!("websocket client connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("websocket client lagged; dropped {skipped} readings");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => info!("websocket message: {}", text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("websocket receive error: {err}");
                    break;
                }
            },
        }
    }

    info!("websocket client disconnected");
}

fn into_response(response: ApiResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

fn schedule_restart() {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
        restart_now();
    });
}

/// The simulator has no reset line; exiting lets a supervisor start it fresh.
fn restart_now() -> ! {
    warn!("restarting sensor node");
    std::process::exit(0)
}

impl AppStore {
    fn new(data_dir: &std::path::Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

impl HostNetwork {
    async fn connect(&self) -> anyhow::Result<()> {
        let runtime = self.store.load_runtime_config().await?;
        if runtime.network.has_credentials() {
            info!(
                "using stored wifi credentials for `{}` (simulated)",
                runtime.network.wifi_ssid
            );
        } else {
            warn!("no wifi credentials stored; simulator runs on the host network");
        }
        Ok(())
    }

    async fn reset_credentials(&self) -> anyhow::Result<()> {
        let mut runtime = self.store.load_runtime_config().await?;
        runtime.network.clear();
        self.store.save_runtime_config(&runtime).await?;
        info!("wifi credentials cleared");
        Ok(())
    }
}

impl WsHub {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(WS_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Broadcaster for WsHub {
    fn broadcast(&self, text: &str) {
        // Send only fails when no client is connected.
        let _ = self.tx.send(text.to_string());
    }
}

impl Board for HostBoard {
    fn button_pressed(&mut self) -> bool {
        self.button.load(Ordering::Relaxed)
    }

    fn set_indicator(&mut self, on: bool) {
        if on != self.indicator {
            self.indicator = on;
            debug!("indicator {}", if on { "on" } else { "off" });
        }
    }
}

impl TemperatureSensor for SimulatedSensor {
    fn request_reading(&mut self) {
        self.samples = self.samples.saturating_add(1);
    }

    fn read_celsius(&mut self) -> TemperatureReading {
        if self.disconnected {
            return TemperatureReading::from_raw(templog_common::reporter::DISCONNECTED_CELSIUS);
        }
        TemperatureReading::from_raw(21.0 + (self.samples % 8) as f32 * 0.25)
    }
}
