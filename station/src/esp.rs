use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_10X20, FONT_6X10},
        MonoTextStyle, MonoTextStyleBuilder,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{Gpio21, Gpio22},
        i2c::{I2cConfig, I2cDriver, I2C0},
        modem::Modem,
        prelude::Peripherals,
        units::FromValueType,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{
        ws::{EspHttpWsConnection, EspHttpWsDetachedSender},
        Configuration as HttpConfiguration, EspHttpServer,
    },
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sys::{EspError, ESP_ERR_INVALID_SIZE},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;
use ssd1306::{
    mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306,
};

use weather_common::{
    config::NetworkConfig, static_files, telemetry, weather, Broadcaster, ControlCommand,
    DisplayFrame, DisplaySink, ModeArbiter, Observation, RuntimeConfig, Station, StationError,
    StationStatus, TelemetryConfig, TelemetrySink, UpdateForm, WeatherApiConfig, WeatherSample,
    WeatherSource, ROUTE_PUSH, ROUTE_STATUS, ROUTE_UPDATE,
};

const MAX_HTTP_BODY: usize = 1024;
const MAX_RESPONSE_BYTES: usize = 4096;
const MAX_PUSH_FRAME_BYTES: usize = 256;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);
const TICK_PERIOD: Duration = Duration::from_millis(200);
const WIFI_CHECK_PERIOD: Duration = Duration::from_secs(10);
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const STATION_LOOP_STACK: usize = 12 * 1024;
const PUSH_CTRL_PORT: u16 = 32_769;
const LINE_HEIGHT: i32 = 14;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

type Panel = Ssd1306<
    I2CInterface<I2cDriver<'static>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;
type Subscribers = Arc<Mutex<Vec<EspHttpWsDetachedSender>>>;
type EspStation = Station<WeatherClient, ThingSpeakClient, OledDisplay, WsBroadcaster>;
type HttpRequest<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

enum StationRequest {
    Command {
        command: ControlCommand,
        done: Option<mpsc::Sender<()>>,
    },
    Status {
        reply: mpsc::Sender<StationStatus>,
    },
}

struct WeatherClient {
    config: WeatherApiConfig,
}

struct ThingSpeakClient {
    config: TelemetryConfig,
}

/// SSD1306 panel on I2C0. Keeps logging frames when the panel is absent.
struct OledDisplay {
    panel: Option<Panel>,
}

struct WsBroadcaster {
    subscribers: Subscribers,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = RuntimeConfig::default();
    apply_build_env(&mut runtime);
    runtime.sanitize();

    let Peripherals {
        modem, i2c0, pins, ..
    } = Peripherals::take()?;

    let panel = match init_display(i2c0, pins.gpio21, pins.gpio22) {
        Ok(panel) => Some(panel),
        Err(err) => {
            warn!("failed to initialize display, logging frames only: {err:#}");
            None
        }
    };

    let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
    let mut station = Station::new(
        ModeArbiter::new(runtime.station.clone()),
        WeatherClient {
            config: runtime.weather.clone(),
        },
        ThingSpeakClient {
            config: runtime.telemetry.clone(),
        },
        OledDisplay { panel },
        WsBroadcaster {
            subscribers: subscribers.clone(),
        },
    );
    station.show_boot_screen();

    let mut wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let (requests, request_rx) = mpsc::channel();
    spawn_station_loop(station, request_rx)?;

    let http_server = create_http_server(requests.clone(), runtime.network.http_port)?;
    let push_server = create_push_server(requests, subscribers, runtime.network.push_port)?;
    info!(
        "station serving http on port {}, push channel on port {}",
        runtime.network.http_port, runtime.network.push_port
    );

    // Keep services alive for the program lifetime.
    let _http_server = http_server;
    let _push_server = push_server;

    loop {
        thread::sleep(WIFI_CHECK_PERIOD);
        if !is_wifi_station_connected() {
            warn!("wifi station disconnected, reconnecting");
            if let Err(err) = wifi.connect() {
                warn!("wifi reconnect request failed: {err:?}");
            }
        }
    }
}

fn apply_build_env(runtime: &mut RuntimeConfig) {
    if let Some(ssid) = option_env!("WIFI_SSID") {
        runtime.network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        runtime.network.wifi_pass = pass.to_string();
    }
    if let Some(key) = option_env!("OPENWEATHER_API_KEY") {
        runtime.weather.api_key = key.to_string();
    }
    if let Some(key) = option_env!("THINGSPEAK_WRITE_KEY") {
        runtime.telemetry.write_api_key = key.to_string();
    }
    if let Some(channel_id) = option_env!("THINGSPEAK_CHANNEL_ID").and_then(|id| id.parse().ok()) {
        runtime.telemetry.channel_id = channel_id;
    }
}

fn spawn_station_loop(
    mut station: EspStation,
    requests: mpsc::Receiver<StationRequest>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("station-loop".into())
        .stack_size(STATION_LOOP_STACK)
        .spawn(move || loop {
            match requests.recv_timeout(TICK_PERIOD) {
                Ok(StationRequest::Command { command, done }) => {
                    station.handle_command(command, monotonic_ms());
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Ok(StationRequest::Status { reply }) => {
                    let _ = reply.send(station.status(monotonic_ms()));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("ingress closed, stopping station loop");
                    return;
                }
            }
            station.tick(monotonic_ms());
        })
        .context("failed to spawn station loop thread")?;
    Ok(())
}

fn create_http_server(
    requests: mpsc::Sender<StationRequest>,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>(ROUTE_UPDATE, Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => {
                    warn!("rejected /update body: {err:#}");
                    return write_text(req, 400, "Bad Request");
                }
            };

            let form = UpdateForm::from_urlencoded(&String::from_utf8_lossy(&body));
            let command = match form.into_command() {
                Ok(command) => command,
                Err(err) => {
                    warn!("rejected /update: {err}");
                    return write_text(req, 400, "Bad Request");
                }
            };

            let ack = command.ack_message();
            let (done, wait) = mpsc::channel();
            let delivered = requests
                .send(StationRequest::Command {
                    command,
                    done: Some(done),
                })
                .is_ok()
                && wait.recv_timeout(REPLY_TIMEOUT).is_ok();
            if !delivered {
                return write_text(req, 503, "Service Unavailable");
            }
            write_text(req, 200, ack)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(ROUTE_STATUS, Method::Get, move |req| {
        let (reply, wait) = mpsc::channel();
        if requests.send(StationRequest::Status { reply }).is_err() {
            return write_text(req, 503, "Service Unavailable");
        }
        match wait.recv_timeout(REPLY_TIMEOUT) {
            Ok(status) => write_json(req, &status),
            Err(_) => write_text(req, 503, "Service Unavailable"),
        }
    })?;

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        let asset = static_files::resolve(req.uri());
        let Some((asset, body)) =
            asset.and_then(|asset| embedded_asset(&asset.path).map(|body| (asset, body)))
        else {
            return write_text(req, 404, "Not Found");
        };

        req.into_response(200, Some("OK"), &[("Content-Type", asset.content_type)])?
            .write_all(body.as_bytes())?;
        Ok(())
    })?;

    Ok(server)
}

fn create_push_server(
    requests: mpsc::Sender<StationRequest>,
    subscribers: Subscribers,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        ctrl_port: PUSH_CTRL_PORT,
        stack_size: 8 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    server.ws_handler(ROUTE_PUSH, move |ws: &mut EspHttpWsConnection| -> Result<(), EspError> {
        if ws.is_new() {
            let sender = ws.create_detached_sender()?;
            lock(&subscribers).push(sender);
            info!("push subscriber {} connected", ws.session());
            return Ok(());
        }
        if ws.is_closed() {
            info!("push subscriber {} disconnected", ws.session());
            return Ok(());
        }

        let (frame_type, len) = ws.recv(&mut [])?;
        if len > MAX_PUSH_FRAME_BYTES {
            warn!("dropping oversized push frame ({len} bytes)");
            return Err(EspError::from_infallible::<ESP_ERR_INVALID_SIZE>());
        }

        let mut buf = [0_u8; MAX_PUSH_FRAME_BYTES];
        ws.recv(&mut buf)?;
        if !matches!(frame_type, FrameType::Text(_)) {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&buf[..len]);
        let text = text.trim_end_matches('\0');
        let Some(command) = ControlCommand::from_push_text(text) else {
            warn!("ignoring blank push frame");
            return Ok(());
        };

        info!("city received over push channel: {text}");
        if requests
            .send(StationRequest::Command {
                command,
                done: None,
            })
            .is_err()
        {
            warn!("station loop is not running; push command dropped");
        }
        Ok(())
    })?;

    Ok(server)
}

fn embedded_asset(path: &str) -> Option<&'static str> {
    match path {
        "index.html" => Some(INDEX_HTML),
        "app.js" => Some(APP_JS),
        "style.css" => Some(STYLE_CSS),
        _ => None,
    }
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
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

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_text(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    req.into_response(status_code, None, &[("Content-Type", "text/plain")])?
        .write_all(message.as_bytes())?;
    Ok(())
}

impl WeatherSource for WeatherClient {
    fn fetch(&mut self, city: &str) -> Result<Observation, StationError> {
        if !is_wifi_station_connected() {
            return Err(StationError::NetworkUnavailable);
        }

        let (status, body) = http_get(&weather::request_url(&self.config, city))?;
        weather::check_status(status)?;
        weather::parse_observation(&body)
    }
}

impl TelemetrySink for ThingSpeakClient {
    fn publish(&mut self, sample: &WeatherSample) -> Result<u16, StationError> {
        if !self.config.is_configured() {
            return Err(StationError::PublishFailed(
                "no write API key configured".to_string(),
            ));
        }
        if !is_wifi_station_connected() {
            return Err(StationError::NetworkUnavailable);
        }

        let (status, body) = http_get(&telemetry::update_url(&self.config, sample))?;
        telemetry::interpret_response(status, &String::from_utf8_lossy(&body))
    }
}

impl DisplaySink for OledDisplay {
    fn render(&mut self, frame: &DisplayFrame) {
        let lines = frame.lines();
        info!("display: {} | {} | {}", lines[0], lines[1], lines[2]);

        let Some(panel) = self.panel.as_mut() else {
            return;
        };
        if let Err(err) = draw_lines(panel, &lines) {
            warn!("display update failed: {err:#}");
        }
    }
}

impl Broadcaster for WsBroadcaster {
    fn broadcast(&mut self, sample: &WeatherSample) {
        let frame = match serde_json::to_vec(sample) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("push frame serialization failed: {err}");
                return;
            }
        };

        lock(&self.subscribers).retain_mut(|sender| {
            if sender.is_closed() {
                return false;
            }
            match sender.send(FrameType::Text(false), &frame) {
                Ok(()) => true,
                Err(err) => {
                    warn!("dropping push subscriber: {err:?}");
                    false
                }
            }
        });
    }
}

fn http_get(url: &str) -> Result<(u16, Vec<u8>), StationError> {
    let conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&conf).map_err(transport_error)?;
    let mut client = HttpClient::wrap(connection);
    let request = client
        .request(Method::Get, url, &[])
        .map_err(transport_error)?;
    let mut response = request.submit().map_err(transport_error)?;

    let status = response.status();
    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response.read(&mut chunk).map_err(transport_error)?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_RESPONSE_BYTES {
            return Err(StationError::MalformedResponse(
                "response body too large".to_string(),
            ));
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Ok((status, body))
}

fn transport_error(err: impl core::fmt::Debug) -> StationError {
    StationError::Transport(format!("{err:?}"))
}

fn init_display(i2c: I2C0, sda: Gpio21, scl: Gpio22) -> anyhow::Result<Panel> {
    let config = I2cConfig::new().baudrate(400.kHz().into());
    let driver = I2cDriver::new(i2c, sda, scl, &config)?;

    let mut panel = Ssd1306::new(
        I2CDisplayInterface::new(driver),
        DisplaySize128x64,
        DisplayRotation::Rotate0,
    )
    .into_buffered_graphics_mode();
    panel
        .init()
        .map_err(|err| anyhow!("failed to init display: {err:?}"))?;
    Ok(panel)
}

fn draw_lines(panel: &mut Panel, lines: &[String; 3]) -> anyhow::Result<()> {
    let small = MonoTextStyleBuilder::new()
        .font(&FONT_6X10)
        .text_color(BinaryColor::On)
        .build();
    let large = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);

    panel
        .clear(BinaryColor::Off)
        .map_err(|err| anyhow!("{err:?}"))?;
    for (row, line) in lines[..2].iter().enumerate() {
        Text::with_baseline(line, Point::new(0, row as i32 * LINE_HEIGHT), small, Baseline::Top)
            .draw(panel)
            .map_err(|err| anyhow!("{err:?}"))?;
    }
    Text::with_baseline(&lines[2], Point::new(0, 2 * LINE_HEIGHT + 4), large, Baseline::Top)
        .draw(panel)
        .map_err(|err| anyhow!("{err:?}"))?;
    panel.flush().map_err(|err| anyhow!("{err:?}"))?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if network.wifi_ssid.is_empty() {
        warn!("wifi credentials missing; station will run offline");
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    {
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
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

        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
            match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    return Ok(esp_wifi);
                }
                Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
            }

            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; retrying in background");
    Ok(esp_wifi)
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
