use std::{
    collections::HashMap,
    convert::Infallible,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, OnceLock, PoisonError, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{oneshot, Mutex},
};
use tracing::{info, warn};

use garden_common::{
    clock::is_plausible_epoch, parse_switch, AnalogReader, Command, CommandError, Divider,
    FileTaskStore, GardenConfig, GardenController, LastStateFile, LoadSlot, PinInput, PinOutput,
    RelayName, Relays, RemoteDatabase, RemoteTaskStore, Reply, Request, RetainedReads,
    RuntimeConfig, StorageBackend, StoreError, TaskDraft, TaskStore, ValveCommand,
    TOPIC_CMD_RELAY_FILTER, TOPIC_CMD_VALVE, TOPIC_GARDEN_SCHEDULE_STATE, TOPIC_GARDEN_STATE,
};

const CONTROL_TICK: Duration = Duration::from_millis(50);
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const RETAINED_WAIT: Duration = Duration::from_secs(3);
const SIMULATED_SUPPLY_MV: u32 = 12_000;

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<Request>,
    timezone: Arc<RwLock<String>>,
    leak: Arc<AtomicBool>,
    supply_mv: Arc<AtomicU32>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct AddedBody {
    id: u8,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("garden-controller-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let retained = RetainedReads::new();

    let (requests, request_rx) = mpsc::channel();
    let app_state = AppState {
        requests,
        timezone: Arc::new(RwLock::new(runtime.timezone.clone())),
        leak: Arc::new(AtomicBool::new(false)),
        supply_mv: Arc::new(AtomicU32::new(SIMULATED_SUPPLY_MV)),
        store,
    };

    let data_dir = app_state.store.data_dir.as_ref().clone();
    let schedule_store = match runtime.storage.backend {
        StorageBackend::File => {
            ScheduleStore::File(under_data_dir(&data_dir, &runtime.storage.schedule_path))
        }
        StorageBackend::Remote => ScheduleStore::Remote(MqttDatabase {
            client: mqtt.clone(),
            retained: retained.clone(),
            runtime: Handle::current(),
        }),
    };

    for topic in [TOPIC_CMD_VALVE, TOPIC_CMD_RELAY_FILTER] {
        retained.queue_subscribe(topic);
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    spawn_mqtt_loop(app_state.clone(), eventloop, retained);
    spawn_control_loop(
        ControlSetup {
            last_state_dir: under_data_dir(&data_dir, &runtime.storage.last_state_dir),
            runtime: runtime.clone(),
            schedule_store,
            leak: app_state.leak.clone(),
            supply_mv: app_state.supply_mv.clone(),
            timezone: app_state.timezone.clone(),
            mqtt,
        },
        request_rx,
    )?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/valve", post(handle_post_valve))
        .route("/api/relay", post(handle_post_relay))
        .route(
            "/api/schedules",
            get(handle_get_schedules)
                .post(handle_post_schedule)
                .put(handle_put_schedule)
                .delete(handle_delete_schedule),
        )
        .route("/api/schedules/reload", post(handle_reload_schedules))
        .route("/api/leak", post(handle_post_leak))
        .route("/api/supply", post(handle_post_supply))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .with_state(app_state);

    let port = std::env::var("GARDEN_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

struct MqttDatabase {
    client: AsyncClient,
    retained: RetainedReads,
    runtime: Handle,
}

impl RemoteDatabase for MqttDatabase {
    fn get(&mut self, path: &str, slot: LoadSlot) -> Result<(), StoreError> {
        self.retained.register(path, slot);
        self.retained.queue_subscribe(path);
        if let Err(err) = self.client.try_subscribe(path, QoS::AtLeastOnce) {
            self.retained.cancel(path);
            return Err(remote_error(err));
        }

        let retained = self.retained.clone();
        let client = self.client.clone();
        let topic = path.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep(RETAINED_WAIT).await;
            if retained.expire(&topic, RETAINED_WAIT.as_millis() as u32) {
                let _ = client.unsubscribe(topic).await;
            }
        });
        Ok(())
    }

    fn set(&mut self, path: &str, value: String) -> Result<(), StoreError> {
        self.client
            .try_publish(path, QoS::AtLeastOnce, true, value)
            .map_err(remote_error)
    }

    fn remove(&mut self, path: &str) -> Result<(), StoreError> {
        // An empty retained payload clears the topic.
        self.client
            .try_publish(path, QoS::AtLeastOnce, true, Vec::new())
            .map_err(remote_error)
    }
}

fn remote_error(err: rumqttc::ClientError) -> StoreError {
    StoreError::Remote {
        code: -1,
        message: err.to_string(),
    }
}

enum ScheduleStore {
    File(PathBuf),
    Remote(MqttDatabase),
}

impl ScheduleStore {
    fn into_task_store(self, remote_path: &str) -> Box<dyn TaskStore> {
        match self {
            Self::File(path) => Box::new(FileTaskStore::new(path)),
            Self::Remote(db) => Box::new(RemoteTaskStore::new(db, remote_path)),
        }
    }
}

struct ControlSetup {
    runtime: RuntimeConfig,
    schedule_store: ScheduleStore,
    last_state_dir: PathBuf,
    leak: Arc<AtomicBool>,
    supply_mv: Arc<AtomicU32>,
    timezone: Arc<RwLock<String>>,
    mqtt: AsyncClient,
}

struct LoggingPin {
    name: &'static str,
}

impl ErrorType for LoggingPin {
    type Error = Infallible;
}

impl OutputPin for LoggingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        info!(relay = self.name, level = "low");
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        info!(relay = self.name, level = "high");
        Ok(())
    }
}

struct SimulatedLeakPin {
    leaking: Arc<AtomicBool>,
    active_high: bool,
}

impl ErrorType for SimulatedLeakPin {
    type Error = Infallible;
}

impl InputPin for SimulatedLeakPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.leaking.load(Ordering::Relaxed) == self.active_high)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}

struct SimulatedSupply {
    millivolts: Arc<AtomicU32>,
    divider: Divider,
}

impl AnalogReader for SimulatedSupply {
    fn read_raw(&mut self) -> Option<u16> {
        Some(self.divider.to_raw(self.millivolts.load(Ordering::Relaxed)))
    }
}

fn relay(name: &'static str, config: &GardenConfig) -> Box<PinOutput<LoggingPin>> {
    Box::new(PinOutput::new(LoggingPin { name }, config.relay_active_high))
}

fn spawn_control_loop(setup: ControlSetup, requests: mpsc::Receiver<Request>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || run_control_loop(setup, requests))
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn run_control_loop(setup: ControlSetup, requests: mpsc::Receiver<Request>) {
    let ControlSetup {
        runtime,
        schedule_store,
        last_state_dir,
        leak,
        supply_mv,
        timezone,
        mqtt,
    } = setup;
    let config = runtime.garden;

    let relays = Relays {
        valve_power: relay("valve_power", &config),
        valve_direction: relay("valve_direction", &config),
        pump: relay("pump", &config),
        ac_power: relay("ac_power", &config),
    };
    let leak_pin = PinInput::new(SimulatedLeakPin {
        leaking: leak,
        active_high: config.leak_active_high,
    });
    let store = schedule_store.into_task_store(&runtime.storage.remote_path);
    let last_state = LastStateFile::in_dir(&last_state_dir, "valve");
    let supply = config.supply;

    let now_ms = monotonic_ms();
    let mut garden = GardenController::new(
        config,
        relays,
        Box::new(leak_pin),
        store,
        Some(last_state),
        now_ms,
    );
    if supply.enabled {
        garden.attach_supply_monitor(Box::new(SimulatedSupply {
            millivolts: supply_mv,
            divider: supply.divider(),
        }));
    }
    garden.start(now_ms);

    let mut last_publish: Option<Instant> = None;
    loop {
        let mut tasks_changed = false;
        let mut changed = match requests.recv_timeout(CONTROL_TICK) {
            Ok(request) => {
                tasks_changed = !matches!(
                    request.command,
                    Command::Status | Command::Valve(_) | Command::Relay(..) | Command::ListTasks
                );
                let reply = garden.handle(request.command, monotonic_ms(), local_now(&timezone));
                (request.respond)(reply);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                info!("request channel closed, stopping control loop");
                return;
            }
        };

        changed |= garden.tick(monotonic_ms(), local_now(&timezone));

        let periodic = last_publish.map_or(true, |at| at.elapsed() >= STATE_PUBLISH_INTERVAL);
        if changed || periodic {
            last_publish = Some(Instant::now());
            let status = garden.status(monotonic_ms(), local_now(&timezone));
            publish_retained(&mqtt, TOPIC_GARDEN_STATE, &status);
        }
        if tasks_changed || periodic {
            publish_retained(&mqtt, TOPIC_GARDEN_SCHEDULE_STATE, garden.tasks());
        }
    }
}

fn publish_retained<T: Serialize + ?Sized>(mqtt: &AsyncClient, topic: &str, payload: &T) {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            if let Err(err) = mqtt.try_publish(topic, QoS::AtLeastOnce, true, body) {
                warn!("{topic} publish failed: {err}");
            }
        }
        Err(err) => warn!("{topic} serialization failed: {err}"),
    }
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mut eventloop: rumqttc::EventLoop,
    retained: RetainedReads,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if retained.is_pending(&message.topic) {
                        let payload = String::from_utf8(message.payload.to_vec()).map_err(|err| {
                            StoreError::Remote {
                                code: -1,
                                message: err.to_string(),
                            }
                        });
                        retained.deliver(&message.topic, payload);
                        continue;
                    }

                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    retained.subscribe_sent(u32::from(pkid));
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    retained.subscribe_acked(u32::from(ack.pkid));
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
    let Some(command) = Command::from_mqtt(topic, message) else {
        return Ok(());
    };
    if let Reply::Failed(err) = dispatch(app_state, command?).await? {
        warn!("{topic} command `{message}` rejected: {err}");
    }

    Ok(())
}

async fn dispatch(state: &AppState, command: Command) -> Result<Reply, CommandError> {
    let (tx, rx) = oneshot::channel();
    let request = Request::new(command, move |reply| {
        let _ = tx.send(reply);
    });
    state
        .requests
        .send(request)
        .map_err(|_| CommandError::Unavailable)?;
    rx.await.map_err(|_| CommandError::Unavailable)
}

async fn respond(state: &AppState, command: Command) -> Response {
    match dispatch(state, command).await {
        Ok(Reply::Status(status)) => Json(*status).into_response(),
        Ok(Reply::Tasks(tasks)) => Json(tasks).into_response(),
        Ok(Reply::Added(id)) => (StatusCode::CREATED, Json(AddedBody { id })).into_response(),
        Ok(Reply::Failed(err)) | Err(err) => command_error_response(&err),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    respond(&state, Command::Status).await
}

async fn handle_post_valve(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let command = match ValveCommand::from_query(
        params.get("action").map(String::as_str),
        params.get("percent").map(String::as_str),
        params.get("seconds").map(String::as_str),
    ) {
        Ok(command) => command,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Use action=on|off|toggle, percent=1-100 or seconds=N",
            )
        }
    };

    respond(&state, Command::Valve(command)).await
}

async fn handle_post_relay(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let name = params.get("name").map(|name| name.parse::<RelayName>());
    let on = params.get("state").map(|value| parse_switch(value));
    let (Some(Ok(name)), Some(Ok(on))) = (name, on) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Use name=valve_power|valve_direction|pump|ac_power and state=on|off",
        );
    };

    respond(&state, Command::Relay(name, on)).await
}

async fn handle_get_schedules(State(state): State<AppState>) -> impl IntoResponse {
    respond(&state, Command::ListTasks).await
}

async fn handle_post_schedule(
    State(state): State<AppState>,
    Json(draft): Json<TaskDraft>,
) -> impl IntoResponse {
    respond(&state, Command::AddTask(draft)).await
}

async fn handle_put_schedule(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(draft): Json<TaskDraft>,
) -> impl IntoResponse {
    let Some(id) = schedule_id(&params) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'id' parameter");
    };
    respond(&state, Command::UpdateTask(id, draft)).await
}

async fn handle_delete_schedule(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(id) = schedule_id(&params) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'id' parameter");
    };
    respond(&state, Command::RemoveTask(id)).await
}

async fn handle_reload_schedules(State(state): State<AppState>) -> impl IntoResponse {
    respond(&state, Command::ReloadTasks).await
}

async fn handle_post_leak(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let leaking = match params.get("state").map(|value| value.to_ascii_lowercase()) {
        Some(value) if value == "on" => true,
        Some(value) if value == "off" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Use state=on or state=off"),
    };

    state.leak.store(leaking, Ordering::Relaxed);
    info!("simulated leak sensor set to {leaking}");
    respond(&state, Command::Status).await
}

async fn handle_post_supply(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(millivolts) = params.get("mv").and_then(|value| value.parse::<u32>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Use mv=<millivolts>");
    };

    state.supply_mv.store(millivolts, Ordering::Relaxed);
    info!("simulated pump supply set to {millivolts} mV");
    respond(&state, Command::Status).await
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = timezone_name(&state.timezone);
    Json(TimeStatus {
        time_synced: local_now(&state.timezone).is_some(),
        timezone,
        now_epoch: Utc::now().timestamp(),
    })
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> impl IntoResponse {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    *state
        .timezone
        .write()
        .unwrap_or_else(PoisonError::into_inner) = update.timezone;

    if let Err(err) = persist_timezone(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_time(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("GARDEN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.garden"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
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
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_timezone(state: &AppState) -> anyhow::Result<()> {
    let mut runtime = state.store.load_runtime_config().await?;
    runtime.timezone = timezone_name(&state.timezone);
    state.store.save_runtime_config(&runtime).await
}

/// The data dir stands in for the flash filesystem root, so `/spiffs/x`
/// resolves to `<data_dir>/spiffs/x`.
fn under_data_dir(data_dir: &Path, path: &str) -> PathBuf {
    data_dir.join(path.trim_start_matches('/'))
}

fn schedule_id(params: &HashMap<String, String>) -> Option<u8> {
    params
        .get("id")
        .and_then(|value| value.parse::<u8>().ok())
        .filter(|id| *id != 0)
}

fn timezone_name(timezone: &RwLock<String>) -> String {
    timezone
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn local_now(timezone: &RwLock<String>) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone_name(timezone).parse().ok()?;
    let utc = Utc::now();
    if !is_plausible_epoch(utc.timestamp()) {
        return None;
    }
    let local = utc.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn command_error_response(err: &CommandError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Wraps after ~49 days, like the firmware tick counter.
fn monotonic_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u32
}
