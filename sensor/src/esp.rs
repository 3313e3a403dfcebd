use std::{
    ffi::CString,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, Input, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{
        ws::EspHttpWsDetachedSender, Configuration as HttpConfiguration, EspHttpConnection,
        EspHttpServer, Request,
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Deserialize;

use templog_common::{
    api::{self, ApiResponse},
    clock::wait_for_sync,
    config::NetworkConfig,
    monotonic_ms, Board, Broadcaster, DataLog, FsStorage, GestureAction, NetworkProvisioner,
    PortalDecision, PortalTimer, ReportOutcome, RuntimeConfig, Scheduler, ServiceMode,
    SyncOutcome, TemperatureReading, TemperatureSensor, Tick, TickOutcome, ZonedClock,
};

const NVS_NAMESPACE: &str = "templog";
const NVS_CONFIG_KEY: &str = "node_config";
const NVS_CONFIG_MAX_LEN: usize = 2048;

const SPIFFS_BASE_PATH: &str = "/spiffs";
const SPIFFS_MAX_FILES: usize = 5;

const PROVISIONING_AP_SSID: &str = "TempLogger-AP";
const PROVISIONING_AP_PASSWORD: &str = "TempLogSetup";
const MAX_HTTP_BODY: usize = 1024;
const MAX_WS_FRAME: usize = 256;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const LINK_DOWN_RESTART_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const RESTART_DELAY_MS: u64 = 500;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Temperature Logger Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:520px;margin:2rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:10px;padding:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
  </style>
</head>
<body>
  <h1>Temperature Logger Setup</h1>
  <p class="muted">Enter the WiFi network this logger should join. It restarts once saved.</p>
  <div class="card">
    <label>WiFi SSID</label><input id="wifiSsid" type="text">
    <label>WiFi Password</label><input id="wifiPass" type="password">
    <button id="save">Save</button>
  </div>
  <p id="status" class="muted"></p>
  <script>
    const q=(id)=>document.getElementById(id);
    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const r=await fetch('/api/network',{method:'PUT',headers:{'content-type':'application/json'},
          body:JSON.stringify({wifiSsid:q('wifiSsid').value.trim(),wifiPass:q('wifiPass').value})});
        if(!r.ok)throw new Error('Request failed: '+r.status);
        q('status').className='ok'; q('status').textContent='Saved. Restarting...';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });
  </script>
</body>
</html>
"#;

/// `RuntimeConfig` persisted as one JSON string in the `templog` NVS namespace.
#[derive(Clone)]
struct ConfigStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct EspNetwork {
    store: ConfigStore,
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
}

#[derive(Debug, Deserialize)]
struct CredentialsUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: String,
}

/// Detached senders for every open `/ws` session.
#[derive(Clone, Default)]
struct WsHub {
    sessions: Arc<Mutex<Vec<EspHttpWsDetachedSender>>>,
}

/// Restarts the node once the station link has been down for `LINK_DOWN_RESTART_MS`.
#[derive(Default)]
struct LinkWatch {
    down_since: Option<Instant>,
}

struct EspBoard {
    button: PinDriver<'static, AnyIOPin, Input>,
    indicator: PinDriver<'static, AnyIOPin, Output>,
}

struct Ds18b20Probe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
    pin: i32,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let config_store = ConfigStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = config_store.load().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals { modem, .. } = Peripherals::take()?;

    let board = EspBoard::new(runtime.node.button_pin, runtime.node.indicator_pin)
        .context("failed to initialize button and indicator")?;
    let probe =
        Ds18b20Probe::new(runtime.node.sensor_pin).context("failed to initialize DS18B20")?;

    let mut network = EspNetwork::new(modem, sys_loop, nvs_partition, config_store.clone())?;
    if let Err(err) = network.connect() {
        warn!("wifi station connection unavailable ({err:#}); starting configuration portal");
        network.run_portal(runtime.node.portal_timeout_s)?;
    }
    disable_wifi_power_save();

    mount_spiffs().context("An error has occurred while mounting SPIFFS")?;

    let sntp = EspSntp::new_default()?;
    let sync_timeout = Duration::from_secs(runtime.node.time_sync_timeout_s);
    let time_synced = Arc::new(AtomicBool::new(false));
    match wait_for_sync(
        sync_timeout,
        Duration::from_secs(1),
        || sntp.get_sync_status() == SyncStatus::Completed,
        thread::sleep,
    ) {
        SyncOutcome::Synchronized { waited } => {
            time_synced.store(true, Ordering::Relaxed);
            info!("time synchronized after {}ms", waited.as_millis());
        }
        SyncOutcome::TimedOut => warn!(
            "time sync timed out after {}s; log timestamps will be wrong",
            runtime.node.time_sync_timeout_s
        ),
    }

    arm_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let storage = FsStorage::new(SPIFFS_BASE_PATH);
    let log = Arc::new(DataLog::from_config(storage, &runtime.node));
    let mode = ServiceMode::new();
    let hub = WsHub::default();

    let server = create_http_server(
        config_store.clone(),
        log.clone(),
        mode.clone(),
        hub.clone(),
        time_synced,
        &runtime,
    )?;

    let mut scheduler = Scheduler::new(
        &runtime.node,
        board,
        probe,
        hub,
        ZonedClock::new(&runtime.timezone),
        log,
        mode,
    );

    // Keep services alive for the program lifetime.
    let _server = server;
    let _sntp = sntp;
    let tick_period = Duration::from_millis(runtime.node.tick_period_ms);
    let mut link_watch = LinkWatch::default();

    loop {
        feed_watchdog();
        link_watch.observe(network.is_connected());

        let tick = scheduler.tick(monotonic_ms());
        log_tick(&tick);

        if let TickOutcome::FactoryReset = tick.outcome {
            if let Err(err) = network.reset_credentials() {
                warn!("failed to clear wifi credentials: {err:#}");
            }
            restart_device();
        }

        thread::sleep(tick_period);
    }
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
        ReportOutcome::SensorDisconnected => warn!("{outcome}"),
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
        ReportOutcome::Paused | ReportOutcome::NotDue { .. } => debug!("{outcome}"),
    }
}

fn create_http_server(
    config_store: ConfigStore,
    log: Arc<DataLog<FsStorage>>,
    mode: ServiceMode,
    hub: WsHub,
    time_synced: Arc<AtomicBool>,
    runtime: &RuntimeConfig,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>(api::ROUTE_CLEAR_WIFI, Method::Get, move |req| {
        let reset = config_store.clear_credentials().map_err(|err| format!("{err:#}"));
        let restart = reset.is_ok();
        write_api(req, api::clear_wifi(reset))?;
        if restart {
            schedule_restart();
        }
        Ok(())
    })?;

    {
        let log = log.clone();
        server.fn_handler(api::ROUTE_CLEAR_DATA, Method::Get, move |req| {
            write_api(req, api::clear_data(&log))
        })?;
    }

    {
        let mode = mode.clone();
        server.fn_handler(api::ROUTE_IS_SERVICE_MODE, Method::Get, move |req| {
            write_api(req, api::is_service_mode(&mode))
        })?;
    }

    {
        let log = log.clone();
        server.fn_handler(api::ROUTE_DOWNLOAD_LOGS, Method::Get, move |req| {
            write_api(req, api::download_logs(&log))
        })?;
    }

    {
        let log = log.clone();
        server.fn_handler(api::ROUTE_GENERATE_CSV, Method::Get, move |req| {
            write_api(req, api::generate_csv(&log))
        })?;
    }

    {
        let mode = mode.clone();
        server.fn_handler(api::ROUTE_ACTIVATE_SERVICE_MODE, Method::Get, move |req| {
            info!("service mode activated over http");
            write_api(req, api::activate_service_mode(&mode))
        })?;
    }

    {
        let mode = mode.clone();
        server.fn_handler(api::ROUTE_TOGGLE_SERVICE_MODE, Method::Get, move |req| {
            let response = api::toggle_service_mode(&mode);
            info!("service mode toggled over http: {}", response.body_str());
            write_api(req, response)
        })?;
    }

    {
        let interval_ms = runtime.node.report_interval_ms;
        let timezone = runtime.timezone.clone();
        server.fn_handler(api::ROUTE_STATUS, Method::Get, move |req| {
            let response = api::status(
                &mode,
                &log,
                interval_ms,
                time_synced.load(Ordering::Relaxed),
                &timezone,
                monotonic_ms(),
            );
            write_api(req, response)
        })?;
    }

    server.ws_handler(api::ROUTE_WS, move |ws| {
        if ws.is_new() {
            let sender = ws.create_detached_sender()?;
            hub.sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(sender);
            info!("websocket client #{} connected", ws.session());
            return Ok::<(), anyhow::Error>(());
        }

        if ws.is_closed() {
            info!("websocket client #{} disconnected", ws.session());
            return Ok(());
        }

        let (_frame_type, len) = ws.recv(&mut [])?;
        if len > MAX_WS_FRAME {
            warn!("websocket frame of {len} bytes dropped");
            return Ok(());
        }

        let mut frame = [0_u8; MAX_WS_FRAME];
        ws.recv(&mut frame[..len])?;
        match std::str::from_utf8(&frame[..len]) {
            Ok(text) => info!("websocket message: {}", text.trim_end_matches('\0')),
            Err(_) => debug!("websocket binary frame of {len} bytes"),
        }
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        let Some(path) = api::static_file_path(req.uri()) else {
            return write_api(req, ApiResponse::text(400, "Bad path."));
        };

        if let Some(asset) = embedded_asset(&path) {
            return write_api(
                req,
                ApiResponse {
                    status: 200,
                    content_type: api::content_type_for(&path),
                    body: asset.as_bytes().to_vec(),
                },
            );
        }

        match std::fs::read(format!("{SPIFFS_BASE_PATH}{path}")) {
            Ok(body) => write_api(
                req,
                ApiResponse {
                    status: 200,
                    content_type: api::content_type_for(&path),
                    body,
                },
            ),
            Err(_) => write_api(req, ApiResponse::text(404, "Not found.")),
        }
    })?;

    Ok(server)
}

/// Dashboard files compiled into the firmware. Anything else comes from SPIFFS.
fn embedded_asset(path: &str) -> Option<&'static str> {
    match path {
        "/index.html" => Some(INDEX_HTML),
        "/app.js" => Some(APP_JS),
        _ => None,
    }
}

fn create_provisioning_http_server(
    config_store: ConfigStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: CredentialsUpdate =
            serde_json::from_slice(&body).context("invalid network payload")?;

        if update.wifi_ssid.trim().is_empty() {
            return write_api(req, ApiResponse::text(400, "wifiSsid cannot be empty"));
        }

        let mut runtime = config_store.load().unwrap_or_default();
        runtime.network.wifi_ssid = update.wifi_ssid.trim().to_string();
        runtime.network.wifi_pass = update.wifi_pass;
        config_store.save(&runtime)?;
        info!("wifi credentials saved for `{}`", runtime.network.wifi_ssid);

        write_api(req, ApiResponse::text(200, "Saved."))
    })?;

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_api(
    req: Request<&mut EspHttpConnection<'_>>,
    response: ApiResponse,
) -> anyhow::Result<()> {
    req.into_response(
        response.status,
        None,
        &[("Content-Type", response.content_type)],
    )?
    .write_all(&response.body)?;
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
            runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
        }
    }
}

impl EspNetwork {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        store: ConfigStore,
    ) -> anyhow::Result<Self> {
        let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        Ok(Self {
            store,
            wifi,
            sys_loop,
        })
    }

    /// Serves the provisioning AP until credentials are saved or the portal times out,
    /// then restarts. Only returns on setup failure.
    fn run_portal(&mut self, timeout_s: u64) -> anyhow::Result<()> {
        let initial = self.store.load()?.network;

        {
            let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
        }
        let _server = create_provisioning_http_server(self.store.clone())?;

        let timer = PortalTimer::new(monotonic_ms(), timeout_s);
        loop {
            thread::sleep(Duration::from_secs(1));

            let current = self
                .store
                .load()
                .map(|runtime| runtime.network)
                .unwrap_or_default();
            let saved = if current != initial {
                current
            } else {
                NetworkConfig::default()
            };

            match timer.poll(monotonic_ms(), &saved) {
                PortalDecision::Wait => {}
                PortalDecision::Restart if saved.has_credentials() => {
                    info!("credentials saved; restarting to join `{}`", saved.wifi_ssid);
                    thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
                    restart_device();
                }
                PortalDecision::Restart => {
                    warn!("configuration portal timed out after {timeout_s}s; restarting");
                    restart_device();
                }
            }
        }
    }
}

impl NetworkProvisioner for EspNetwork {
    type Error = anyhow::Error;

    fn connect(&mut self) -> anyhow::Result<()> {
        let network = self.store.load()?.network;
        if !network.has_credentials() {
            return Err(anyhow!("no wifi credentials stored"));
        }

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started, connecting to `{}`", network.wifi_ssid);

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
            match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            }

            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }

        match last_err {
            Some(err) => Err(anyhow::Error::from(err)
                .context(format!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"))),
            None => Err(anyhow!("wifi connect was never attempted")),
        }
    }

    fn reset_credentials(&mut self) -> anyhow::Result<()> {
        self.store.clear_credentials()
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

impl ConfigStore {
    fn namespace(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .with_context(|| format!("cannot open NVS namespace `{NVS_NAMESPACE}`"))
    }

    fn load(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buffer = vec![0_u8; NVS_CONFIG_MAX_LEN];
        let stored = self
            .namespace()?
            .get_str(NVS_CONFIG_KEY, &mut buffer)
            .context("cannot read stored node config")?;
        match stored {
            Some(json) => {
                serde_json::from_str(json).context("stored node config is not valid JSON")
            }
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let json = serde_json::to_string(runtime)?;
        self.namespace()?
            .set_str(NVS_CONFIG_KEY, &json)
            .context("cannot persist node config")?;
        Ok(())
    }

    fn clear_credentials(&self) -> anyhow::Result<()> {
        let mut runtime = self.load()?;
        runtime.network.clear();
        self.save(&runtime)?;
        info!("wifi credentials cleared");
        Ok(())
    }
}

impl Broadcaster for WsHub {
    fn broadcast(&self, text: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain_mut(|sender| {
            !sender.is_closed()
                && sender
                    .send(FrameType::Text(false), text.as_bytes())
                    .is_ok()
        });
    }
}

impl EspBoard {
    fn new(button_pin: i32, indicator_pin: i32) -> anyhow::Result<Self> {
        // SAFETY: the pin numbers come from the node config and no other driver in this
        // firmware claims them.
        let (button_pin, indicator_pin) = unsafe {
            (
                AnyIOPin::new(button_pin.try_into()?),
                AnyIOPin::new(indicator_pin.try_into()?),
            )
        };

        let mut button = PinDriver::input(button_pin)?;
        button.set_pull(Pull::Up)?;

        let mut indicator = PinDriver::output(indicator_pin)?;
        indicator.set_low()?;

        Ok(Self { button, indicator })
    }
}

impl Board for EspBoard {
    fn button_pressed(&mut self) -> bool {
        // Active low.
        self.button.is_low()
    }

    fn set_indicator(&mut self, on: bool) {
        let result = if on {
            self.indicator.set_high()
        } else {
            self.indicator.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive indicator: {err:?}");
        }
    }
}

impl Ds18b20Probe {
    fn new(pin: i32) -> anyhow::Result<Self> {
        // SAFETY: see `EspBoard::new`.
        let bus_pin = unsafe { AnyIOPin::new(pin.try_into()?) };
        let mut one_wire_pin = PinDriver::input_output_od(bus_pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
            pin,
        };
        probe.scan_bus();
        Ok(probe)
    }

    fn scan_bus(&mut self) {
        let mut first_ds18: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first_ds18.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first_ds18 = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        info!("Number of devices found on the OneWire bus: {device_count}");
        if device_count == 0 {
            warn!("No devices found. Check wiring.");
        }

        self.address = first_ds18;
        match self.address {
            Some(address) => info!("DS18B20 ready on GPIO{} using {:?}", self.pin, address),
            None if device_count > 0 => warn!("no DS18B20 among the one-wire devices"),
            None => {}
        }
    }
}

impl TemperatureSensor for Ds18b20Probe {
    fn request_reading(&mut self) {
        if self.address.is_none() {
            self.scan_bus();
        }

        match ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay) {
            Ok(()) => Resolution::Bits12.delay_for_measurement_time(&mut self.delay),
            Err(err) => warn!("failed to start DS18B20 conversion: {err:?}"),
        }
    }

    fn read_celsius(&mut self) -> TemperatureReading {
        let Some(address) = self.address else {
            return TemperatureReading::Disconnected;
        };

        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return TemperatureReading::Disconnected;
            }
        };

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => TemperatureReading::from_raw(data.temperature),
            Err(err) => {
                debug!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                TemperatureReading::Disconnected
            }
        }
    }
}

fn mount_spiffs() -> anyhow::Result<()> {
    let base_path = CString::new(SPIFFS_BASE_PATH)?;
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };

    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("SPIFFS mounted at {SPIFFS_BASE_PATH}");
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            restart_device();
        });

    if let Err(err) = spawned {
        warn!("failed to spawn restart thread ({err}); restarting now");
        restart_device();
    }
}

fn restart_device() {
    warn!("restarting device");
    unsafe { esp_idf_svc::sys::esp_restart() };
}

/// `ESP_ERR_INVALID_STATE` means the watchdog (or this task's subscription) already exists.
fn esp_result(rc: esp_idf_svc::sys::esp_err_t, what: &str) -> anyhow::Result<()> {
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("{what} returned esp_err_t={rc}"))
}

/// Starts the task watchdog and subscribes the control loop to it.
fn arm_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    esp_result(
        unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) },
        "task watchdog init",
    )?;
    esp_result(
        unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) },
        "task watchdog subscribe",
    )
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

impl LinkWatch {
    fn observe(&mut self, connected: bool) {
        if connected {
            self.down_since = None;
            return;
        }
        let down_for = self.down_since.get_or_insert_with(Instant::now).elapsed();
        if down_for >= Duration::from_millis(LINK_DOWN_RESTART_MS) {
            warn!(
                "station link down for {}s; restarting node to reconnect",
                down_for.as_secs()
            );
            restart_device();
        }
    }
}
