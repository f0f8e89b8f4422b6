use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot},
    time::MissedTickBehavior,
};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use weather_common::{
    telemetry, weather, Broadcaster, ControlCommand, DisplayFrame, DisplaySink, ModeArbiter,
    Observation, RuntimeConfig, Station, StationError, StationStatus, TelemetryConfig,
    TelemetrySink, UpdateForm, WeatherApiConfig, WeatherSample, WeatherSource, ROUTE_PUSH,
    ROUTE_STATUS, ROUTE_UPDATE,
};

const TICK_PERIOD: Duration = Duration::from_millis(200);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BROADCAST_CAPACITY: usize = 16;
const REQUEST_QUEUE: usize = 32;
const MAX_PUSH_FRAME_BYTES: usize = 256;

type HostStation = Station<OpenWeatherClient, ThingSpeakClient, LogDisplay, PushBroadcaster>;

enum StationRequest {
    Command {
        command: ControlCommand,
        done: Option<oneshot::Sender<()>>,
    },
    Status {
        reply: oneshot::Sender<StationStatus>,
    },
}

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<StationRequest>,
    updates: broadcast::Sender<WeatherSample>,
}

struct ConfigStore {
    runtime_path: PathBuf,
}

struct OpenWeatherClient {
    http: reqwest::blocking::Client,
    config: WeatherApiConfig,
}

struct ThingSpeakClient {
    http: reqwest::blocking::Client,
    config: TelemetryConfig,
}

struct LogDisplay;

struct PushBroadcaster {
    updates: broadcast::Sender<WeatherSample>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    if runtime.weather.api_key.is_empty() {
        warn!("OPENWEATHER_API_KEY is not set; weather requests will be rejected");
    }
    if !runtime.telemetry.is_configured() {
        warn!("THINGSPEAK_WRITE_KEY is not set; telemetry uploads will fail");
    }
    info!(
        "polling {} cities every {}ms, override lasts {}ms",
        runtime.station.cities.len(),
        runtime.station.poll_interval_ms,
        runtime.station.override_duration_ms
    );

    let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
    let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);

    let station = {
        let updates = updates.clone();
        tokio::task::spawn_blocking(move || build_station(runtime, updates))
            .await
            .context("station setup task failed")??
    };
    tokio::spawn(run_station_loop(station, request_rx));

    let app_state = AppState { requests, updates };

    let web_root = std::env::var("STATION_WEB_ROOT")
        .unwrap_or_else(|_| format!("{}/web", env!("CARGO_MANIFEST_DIR")));
    let app = control_router(app_state.clone(), web_root);
    let push = Router::new()
        .route(ROUTE_PUSH, get(handle_push_upgrade))
        .with_state(app_state);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], env_parse("STATION_HTTP_PORT").unwrap_or(8080)));
    let push_addr = SocketAddr::from(([0, 0, 0, 0], env_parse("STATION_WS_PORT").unwrap_or(8081)));

    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind http server at {http_addr}"))?;
    let push_listener = TcpListener::bind(push_addr)
        .await
        .with_context(|| format!("failed to bind push channel at {push_addr}"))?;

    info!("station listening on http://{http_addr}, push channel on ws://{push_addr}");
    tokio::try_join!(
        async {
            axum::serve(http_listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("http server stopped")
        },
        async {
            axum::serve(push_listener, push)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("push channel server stopped")
        },
    )?;
    info!("station stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

fn control_router(state: AppState, web_root: impl AsRef<Path>) -> Router {
    Router::new()
        .route(ROUTE_UPDATE, post(handle_update))
        .route(ROUTE_STATUS, get(handle_get_status))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

// The blocking client owns a runtime of its own, so this runs off the async workers.
fn build_station(
    runtime: RuntimeConfig,
    updates: broadcast::Sender<WeatherSample>,
) -> anyhow::Result<HostStation> {
    let http = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")?;

    let mut station = Station::new(
        ModeArbiter::new(runtime.station),
        OpenWeatherClient {
            http: http.clone(),
            config: runtime.weather,
        },
        ThingSpeakClient {
            http,
            config: runtime.telemetry,
        },
        LogDisplay,
        PushBroadcaster { updates },
    );
    station.show_boot_screen();
    Ok(station)
}

/// Sole owner of the station. Each request or tick runs to completion on the
/// blocking pool before the next one is picked up.
async fn run_station_loop<W, T, D, B>(
    mut station: Station<W, T, D, B>,
    mut requests: mpsc::Receiver<StationRequest>,
) where
    W: WeatherSource + Send + 'static,
    T: TelemetrySink + Send + 'static,
    D: DisplaySink + Send + 'static,
    B: Broadcaster + Send + 'static,
{
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => Some(request),
                None => {
                    info!("ingress closed, stopping station loop");
                    return;
                }
            },
            _ = ticker.tick() => None,
        };

        let step = tokio::task::spawn_blocking(move || {
            match request {
                Some(request) => handle_station_request(&mut station, request),
                None => station.tick(monotonic_ms()),
            }
            station
        });
        station = match step.await {
            Ok(station) => station,
            Err(err) => {
                warn!("station step failed, stopping station loop: {err}");
                return;
            }
        };
    }
}

fn handle_station_request<W, T, D, B>(station: &mut Station<W, T, D, B>, request: StationRequest)
where
    W: WeatherSource,
    T: TelemetrySink,
    D: DisplaySink,
    B: Broadcaster,
{
    let now_ms = monotonic_ms();
    match request {
        StationRequest::Command { command, done } => {
            station.handle_command(command, now_ms);
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        StationRequest::Status { reply } => {
            let _ = reply.send(station.status(now_ms));
        }
    }
}

// Parsed from the raw body so every malformed form maps to the same 400.
async fn handle_update(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let command = match UpdateForm::from_urlencoded(&body).into_command() {
        Ok(command) => command,
        Err(err) => {
            warn!("rejected /update: {err}");
            return (StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let ack = command.ack_message();
    match submit_command(&state, command).await {
        Ok(()) => (StatusCode::OK, ack),
        Err(err) => {
            warn!("failed to apply /update: {err:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> axum::response::Response {
    let (reply, wait) = oneshot::channel();
    if state
        .requests
        .send(StationRequest::Status { reply })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response();
    }

    match wait.await {
        Ok(status) => Json(status).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response(),
    }
}

async fn handle_push_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_push_subscriber(socket, state))
}

async fn serve_push_subscriber(mut socket: WebSocket, state: AppState) {
    let mut updates = state.updates.subscribe();
    info!("push subscriber connected");

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => handle_push_text(&state, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("push channel receive error: {err}");
                    break;
                }
            },
            update = updates.recv() => match update {
                Ok(sample) => {
                    let frame = match serde_json::to_string(&sample) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!("push frame serialization failed: {err}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push subscriber lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("push subscriber disconnected");
}

async fn handle_push_text(state: &AppState, text: &str) {
    if text.len() > MAX_PUSH_FRAME_BYTES {
        warn!("dropping oversized push frame ({} bytes)", text.len());
        return;
    }

    let Some(command) = ControlCommand::from_push_text(text) else {
        warn!("ignoring blank push frame");
        return;
    };
    info!("city received over push channel: {text}");

    if state
        .requests
        .send(StationRequest::Command {
            command,
            done: None,
        })
        .await
        .is_err()
    {
        warn!("station loop is not running; push command dropped");
    }
}

async fn submit_command(state: &AppState, command: ControlCommand) -> anyhow::Result<()> {
    let (done, wait) = oneshot::channel();
    state
        .requests
        .send(StationRequest::Command {
            command,
            done: Some(done),
        })
        .await
        .map_err(|_| anyhow!("station loop is not running"))?;
    wait.await.context("station loop dropped the command")
}

impl WeatherSource for OpenWeatherClient {
    fn fetch(&mut self, city: &str) -> Result<Observation, StationError> {
        let response = self
            .http
            .get(weather::endpoint(&self.config))
            .query(&weather::request_query(&self.config, city))
            .send()
            .map_err(transport_error)?;

        weather::check_status(response.status().as_u16())?;
        let body = response.bytes().map_err(transport_error)?;
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

        let response = self
            .http
            .get(telemetry::endpoint(&self.config))
            .query(&telemetry::update_query(&self.config, sample))
            .send()
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().map_err(transport_error)?;
        telemetry::interpret_response(status, &body)
    }
}

impl DisplaySink for LogDisplay {
    fn render(&mut self, frame: &DisplayFrame) {
        // Hardware integration point: the ESP32 build drives an SSD1306 here.
        let [title, status, value] = frame.lines();
        info!(target: "display", "| {title} | {status} | {value} |");
    }
}

impl Broadcaster for PushBroadcaster {
    fn broadcast(&mut self, sample: &WeatherSample) {
        // Fails only when nobody is subscribed.
        let _ = self.updates.send(sample.clone());
    }
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("WEATHER_STATION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.weather-station"));
        Self::at(&data_dir)
    }

    fn at(data_dir: &Path) -> Self {
        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid config at {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(key) = std::env::var("OPENWEATHER_API_KEY") {
        runtime.weather.api_key = key;
    }
    if let Ok(url) = std::env::var("OPENWEATHER_BASE_URL") {
        runtime.weather.base_url = url;
    }
    if let Ok(key) = std::env::var("THINGSPEAK_WRITE_KEY") {
        runtime.telemetry.write_api_key = key;
    }
    if let Some(channel_id) = env_parse("THINGSPEAK_CHANNEL_ID") {
        runtime.telemetry.channel_id = channel_id;
    }
    if let Ok(url) = std::env::var("THINGSPEAK_BASE_URL") {
        runtime.telemetry.base_url = url;
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}

fn transport_error(err: reqwest::Error) -> StationError {
    if err.is_connect() {
        StationError::NetworkUnavailable
    } else {
        StationError::Transport(err.to_string())
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    struct Offline;

    impl WeatherSource for Offline {
        fn fetch(&mut self, _city: &str) -> Result<Observation, StationError> {
            Err(StationError::NetworkUnavailable)
        }
    }

    impl TelemetrySink for Offline {
        fn publish(&mut self, _sample: &WeatherSample) -> Result<u16, StationError> {
            Ok(200)
        }
    }

    fn offline_station(
        updates: broadcast::Sender<WeatherSample>,
    ) -> Station<Offline, Offline, LogDisplay, PushBroadcaster> {
        Station::new(
            ModeArbiter::new(Default::default()),
            Offline,
            Offline,
            LogDisplay,
            PushBroadcaster { updates },
        )
    }

    fn test_app() -> (Router, mpsc::Receiver<StationRequest>) {
        let (requests, request_rx) = mpsc::channel(4);
        let (updates, _) = broadcast::channel(4);
        let app = control_router(AppState { requests, updates }, std::env::temp_dir());
        (app, request_rx)
    }

    fn post_update(content_type: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(ROUTE_UPDATE);
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn update_without_temp_is_rejected_before_the_loop() {
        let (app, mut request_rx) = test_app();

        let response = app
            .oneshot(post_update(
                Some("application/x-www-form-urlencoded"),
                "city=Cali&weather=MANUAL",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Bad Request");
        assert!(request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_without_content_type_is_a_bad_request() {
        let (app, mut request_rx) = test_app();

        let response = app.oneshot(post_update(None, "")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_with_repeated_fields_and_no_token_is_a_bad_request() {
        let (app, mut request_rx) = test_app();

        let response = app
            .oneshot(post_update(
                Some("application/x-www-form-urlencoded"),
                "city=Cali&temp=1&temp=2&a=b",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn accepted_update_waits_for_the_loop_and_acks() {
        let (app, mut request_rx) = test_app();
        let loop_side = tokio::spawn(async move {
            match request_rx.recv().await {
                Some(StationRequest::Command { command, done }) => {
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    Some(command)
                }
                _ => None,
            }
        });

        let response = app
            .oneshot(post_update(
                Some("application/x-www-form-urlencoded"),
                "city=Cali&weather=STOP&temp=0",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Execution stopped");
        assert_eq!(loop_side.await.unwrap(), Some(ControlCommand::Stop));
    }

    #[tokio::test]
    async fn update_without_a_running_loop_is_unavailable() {
        let (app, request_rx) = test_app();
        drop(request_rx);

        let response = app
            .oneshot(post_update(
                Some("application/x-www-form-urlencoded"),
                "city=Cali&weather=RESUME&temp=0",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn station_loop_serves_commands_and_status_in_order() {
        let (updates, mut pushed) = broadcast::channel(8);
        let (requests, request_rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_station_loop(offline_station(updates), request_rx));

        let (done, done_rx) = oneshot::channel();
        requests
            .send(StationRequest::Command {
                command: ControlCommand::Stop,
                done: Some(done),
            })
            .await
            .unwrap();
        done_rx.await.unwrap();

        let (reply, reply_rx) = oneshot::channel();
        requests
            .send(StationRequest::Status { reply })
            .await
            .unwrap();
        let status = reply_rx.await.unwrap();

        assert_eq!(status.mode, "STOPPED");
        assert_eq!(pushed.recv().await.unwrap().description, "STOPPED");

        drop(requests);
        handle.await.unwrap();
    }

    #[test]
    fn broadcaster_reaches_every_subscriber() {
        let (updates, _) = broadcast::channel(4);
        let mut first = updates.subscribe();
        let mut second = updates.subscribe();
        let mut broadcaster = PushBroadcaster { updates };

        let sample = WeatherSample::new("Cali", "MANUAL", 30.0);
        broadcaster.broadcast(&sample);

        assert_eq!(first.try_recv().unwrap(), sample);
        assert_eq!(second.try_recv().unwrap(), sample);
    }

    #[test]
    fn broadcaster_without_subscribers_does_not_fail() {
        let (updates, _) = broadcast::channel(4);
        let mut broadcaster = PushBroadcaster { updates };
        broadcaster.broadcast(&WeatherSample::new("Cali", "STOPPED", 0.0));
    }

    #[tokio::test]
    async fn missing_config_file_yields_defaults() {
        let dir = std::env::temp_dir().join(format!("weather-station-test-{}", std::process::id()));
        let store = ConfigStore::at(&dir);

        let runtime = store.load_runtime_config().await.unwrap();

        assert_eq!(runtime.station.default_city, "Bogota");
        assert_eq!(runtime.station.cities.len(), 5);
    }

    #[tokio::test]
    async fn invalid_config_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!(
            "weather-station-invalid-{}",
            std::process::id()
        ));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("runtime.json"), b"{ not json")
            .await
            .unwrap();

        let result = ConfigStore::at(&dir).load_runtime_config().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;

        assert!(result.is_err());
    }

    #[test]
    fn status_request_is_answered_by_the_loop_handler() {
        let (updates, mut rx) = broadcast::channel(4);
        let mut station = offline_station(updates);

        let (done, mut done_rx) = oneshot::channel();
        handle_station_request(
            &mut station,
            StationRequest::Command {
                command: ControlCommand::Stop,
                done: Some(done),
            },
        );
        assert!(done_rx.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap().description, "STOPPED");

        let (reply, mut reply_rx) = oneshot::channel();
        handle_station_request(&mut station, StationRequest::Status { reply });
        assert_eq!(reply_rx.try_recv().unwrap().mode, "STOPPED");
    }
}
