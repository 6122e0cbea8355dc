use core::convert::TryInto;
use std::{
    path::Path,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, PoisonError, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{AnyInputPin, AnyOutputPin, Gpio32, Input, Output, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use garden_common::{
    clock::is_plausible_epoch, config::NetworkConfig, parse_switch, AnalogReader, Command,
    CommandError, FileTaskStore, GardenController, LastStateFile, LoadSlot, PinConfig, PinInput,
    PinOutput, RelayName, Relays, RemoteDatabase, RemoteTaskStore, Reply, Request, RetainedReads,
    RuntimeConfig, StorageBackend, StoreError, TaskDraft, TaskStore, ValveCommand,
    TOPIC_CMD_RELAY_FILTER, TOPIC_CMD_VALVE, TOPIC_GARDEN_SCHEDULE_STATE, TOPIC_GARDEN_STATE,
};

const NVS_NAMESPACE: &str = "garden";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const SPIFFS_BASE_PATH: &core::ffi::CStr = c"/spiffs";
const MAX_HTTP_BODY: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u32 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const CONTROL_TICK: Duration = Duration::from_millis(50);
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const RETAINED_WAIT: Duration = Duration::from_secs(3);
const SUPPLY_SENSE_GPIO: i32 = 32;

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;
type HttpRequest<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

#[derive(Clone)]
struct SharedState {
    requests: mpsc::Sender<Request>,
    timezone: Arc<RwLock<String>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct AddedBody {
    id: u8,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, storage={:?}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.storage.backend,
    );

    if let Err(err) = mount_spiffs() {
        warn!("SPIFFS unavailable, schedules and valve state will not persist: {err:#}");
    }

    let Peripherals {
        modem, adc1, pins, ..
    } = Peripherals::take()?;
    let supply_sense = (adc1, pins.gpio32);
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt: SharedMqtt = Arc::new(Mutex::new(mqtt_client));
    let retained = RetainedReads::new();

    let (requests, request_rx) = mpsc::channel();
    let shared_state = SharedState {
        requests,
        timezone: Arc::new(RwLock::new(runtime.timezone.clone())),
    };

    subscribe_topics(&mqtt)?;
    spawn_mqtt_receiver(shared_state.clone(), mqtt_conn, mqtt.clone(), retained.clone());
    spawn_control_loop(
        ControlSetup {
            runtime,
            timezone: shared_state.timezone.clone(),
            mqtt,
            retained,
            supply_sense,
        },
        request_rx,
    )?;

    let server = create_http_server(shared_state, nvs_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn mount_spiffs() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: SPIFFS_BASE_PATH.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("SPIFFS mounted at {SPIFFS_BASE_PATH:?}");
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let reply = dispatch(&state, Command::Status);
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/valve", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let command = match ValveCommand::from_query(
                query_param(&uri, "action").as_deref(),
                query_param(&uri, "percent").as_deref(),
                query_param(&uri, "seconds").as_deref(),
            ) {
                Ok(command) => command,
                Err(_) => {
                    return write_error(
                        req,
                        400,
                        "Use action=on|off|toggle, percent=1-100 or seconds=N",
                    )
                }
            };

            let reply = dispatch(&state, Command::Valve(command));
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/relay", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let name = query_param(&uri, "name").and_then(|name| name.parse::<RelayName>().ok());
            let on = query_param(&uri, "state").and_then(|value| parse_switch(&value).ok());
            let (Some(name), Some(on)) = (name, on) else {
                return write_error(
                    req,
                    400,
                    "Use name=valve_power|valve_direction|pump|ac_power and state=on|off",
                );
            };

            let reply = dispatch(&state, Command::Relay(name, on));
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/schedules", Method::Get, move |req| {
            let reply = dispatch(&state, Command::ListTasks);
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/schedules", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(draft) = serde_json::from_slice::<TaskDraft>(&body) else {
                return write_error(req, 400, "Invalid schedule payload");
            };

            let reply = dispatch(&state, Command::AddTask(draft));
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/schedules", Method::Put, move |mut req| {
            let uri = req.uri().to_string();
            let Some(id) = schedule_id(&uri) else {
                return write_error(req, 400, "Missing or invalid 'id' parameter");
            };
            let body = read_request_body(&mut req)?;
            let Ok(draft) = serde_json::from_slice::<TaskDraft>(&body) else {
                return write_error(req, 400, "Invalid schedule payload");
            };

            let reply = dispatch(&state, Command::UpdateTask(id, draft));
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/schedules", Method::Delete, move |req| {
            let uri = req.uri().to_string();
            let Some(id) = schedule_id(&uri) else {
                return write_error(req, 400, "Missing or invalid 'id' parameter");
            };

            let reply = dispatch(&state, Command::RemoveTask(id));
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/schedules/reload", Method::Post, move |req| {
            let reply = dispatch(&state, Command::ReloadTasks);
            write_reply(req, reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Get, move |req| {
            write_json(req, &time_status(&state.timezone))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/timezone", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: TimezoneUpdate =
                serde_json::from_slice(&body).context("invalid timezone payload")?;

            if update.timezone.parse::<Tz>().is_err() {
                return write_error(req, 400, "Invalid timezone value");
            }

            *state
                .timezone
                .write()
                .unwrap_or_else(PoisonError::into_inner) = update.timezone.clone();

            let mut runtime = nvs_store.load_runtime_config()?;
            runtime.timezone = update.timezone;
            nvs_store.save_runtime_config(&runtime)?;

            write_json(req, &time_status(&state.timezone))
        })?;
    }

    server.fn_handler("/api/restart", Method::Post, move |req| {
        thread::Builder::new()
            .name("restart-request".into())
            .spawn(|| {
                thread::sleep(Duration::from_millis(500));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })?;

        let payload = serde_json::json!({ "restarting": true });
        write_json(req, &payload)
    })?;

    Ok(server)
}

fn dispatch(state: &SharedState, command: Command) -> Result<Reply, CommandError> {
    let (tx, rx) = mpsc::channel();
    let request = Request::new(command, move |reply| {
        let _ = tx.send(reply);
    });
    state
        .requests
        .send(request)
        .map_err(|_| CommandError::Unavailable)?;
    rx.recv_timeout(REPLY_TIMEOUT)
        .map_err(|_| CommandError::Unavailable)
}

fn write_reply(req: HttpRequest<'_, '_>, reply: Result<Reply, CommandError>) -> anyhow::Result<()> {
    match reply {
        Ok(Reply::Status(status)) => write_json(req, &*status),
        Ok(Reply::Tasks(tasks)) => write_json(req, &tasks),
        Ok(Reply::Added(id)) => write_json(req, &AddedBody { id }),
        Ok(Reply::Failed(err)) | Err(err) => write_error(req, err.status_code(), &err.to_string()),
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

fn write_json<T: Serialize + ?Sized>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

fn schedule_id(uri: &str) -> Option<u8> {
    query_param(uri, "id")
        .and_then(|value| value.parse::<u8>().ok())
        .filter(|id| *id != 0)
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

/// Joins the configured network. Without it the valve and leak protection
/// still run; only time sync and remote access are lost.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; running offline");
        return Ok(esp_wifi);
    }

    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

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
                disable_wifi_power_save();
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; running offline");
    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("garden-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    mqtt.subscribe(TOPIC_CMD_VALVE, QoS::AtMostOnce)?;
    mqtt.subscribe(TOPIC_CMD_RELAY_FILTER, QoS::AtMostOnce)?;
    Ok(())
}

struct MqttDatabase {
    client: SharedMqtt,
    retained: RetainedReads,
}

impl MqttDatabase {
    fn client(&self) -> std::sync::MutexGuard<'_, EspMqttClient<'static>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteDatabase for MqttDatabase {
    fn get(&mut self, path: &str, slot: LoadSlot) -> Result<(), StoreError> {
        self.retained.register(path, slot);
        let packet_id = match self.client().subscribe(path, QoS::AtLeastOnce) {
            Ok(packet_id) => packet_id,
            Err(err) => {
                self.retained.cancel(path);
                return Err(remote_error(err));
            }
        };
        self.retained.track_packet(packet_id, path);

        let retained = self.retained.clone();
        let client = self.client.clone();
        let topic = path.to_string();
        thread::Builder::new()
            .name("retained-wait".into())
            .stack_size(4 * 1024)
            .spawn(move || {
                thread::sleep(RETAINED_WAIT);
                if retained.expire(&topic, RETAINED_WAIT.as_millis() as u32) {
                    let mut client = client.lock().unwrap_or_else(PoisonError::into_inner);
                    let _ = client.unsubscribe(&topic);
                }
            })
            .map_err(StoreError::Io)?;
        Ok(())
    }

    fn set(&mut self, path: &str, value: String) -> Result<(), StoreError> {
        self.client()
            .publish(path, QoS::AtLeastOnce, true, value.as_bytes())
            .map(|_| ())
            .map_err(remote_error)
    }

    fn remove(&mut self, path: &str) -> Result<(), StoreError> {
        // An empty retained payload clears the topic.
        self.client()
            .publish(path, QoS::AtLeastOnce, true, &[])
            .map(|_| ())
            .map_err(remote_error)
    }
}

fn remote_error(err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Remote {
        code: err.code(),
        message: err.to_string(),
    }
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: SharedMqtt,
    retained: RetainedReads,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    if let EventPayload::Subscribed(packet_id) = event.payload() {
                        retained.subscribe_acked(packet_id);
                        continue;
                    }
                    let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    else {
                        continue;
                    };

                    // We only process full MQTT payloads.
                    if !matches!(details, Details::Complete) {
                        continue;
                    }

                    if retained.is_pending(topic) {
                        let payload = core::str::from_utf8(data)
                            .map(str::to_string)
                            .map_err(|err| StoreError::Remote {
                                code: -1,
                                message: err.to_string(),
                            });
                        retained.deliver(topic, payload);
                        continue;
                    }

                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }

                    if let Ok(message) = core::str::from_utf8(data) {
                        handle_mqtt_message(&state, topic, message);
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    let command = match Command::from_mqtt(topic, message) {
        Some(Ok(command)) => command,
        Some(Err(err)) => {
            warn!("ignoring {topic} command: {err}");
            return;
        }
        None => return,
    };

    let owned = format!("{topic} `{message}`");
    let request = Request::new(command, move |reply| {
        if let Reply::Failed(err) = reply {
            warn!("{owned} rejected: {err}");
        }
    });
    if state.requests.send(request).is_err() {
        warn!("control loop unavailable, dropping {topic} command");
    }
}

type SupplySensePins = (ADC1, Gpio32);

struct ControlSetup {
    runtime: RuntimeConfig,
    timezone: Arc<RwLock<String>>,
    mqtt: SharedMqtt,
    retained: RetainedReads,
    supply_sense: SupplySensePins,
}

struct SupplySense {
    channel: AdcChannelDriver<'static, Gpio32, AdcDriver<'static, ADC1>>,
}

impl SupplySense {
    fn new((adc1, pin): SupplySensePins) -> anyhow::Result<Self> {
        let adc = AdcDriver::new(adc1).context("ADC1 unavailable")?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)
            .with_context(|| format!("supply sense GPIO{SUPPLY_SENSE_GPIO} unavailable"))?;
        Ok(Self { channel })
    }
}

impl AnalogReader for SupplySense {
    fn read_raw(&mut self) -> Option<u16> {
        self.channel.read_raw().ok()
    }
}

fn spawn_control_loop(
    setup: ControlSetup,
    requests: mpsc::Receiver<Request>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }
            if let Err(err) = run_control_loop(setup, requests) {
                warn!("control loop stopped: {err:#}");
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn run_control_loop(setup: ControlSetup, requests: mpsc::Receiver<Request>) -> anyhow::Result<()> {
    let ControlSetup {
        runtime,
        timezone,
        mqtt,
        retained,
        supply_sense,
    } = setup;
    let config = runtime.garden;
    let supply = config.supply;
    let (relays, leak_pin) = init_pins(&runtime.pins, config.relay_active_high)?;

    let store: Box<dyn TaskStore> = match runtime.storage.backend {
        StorageBackend::File => Box::new(FileTaskStore::new(&runtime.storage.schedule_path)),
        StorageBackend::Remote => Box::new(RemoteTaskStore::new(
            MqttDatabase {
                client: mqtt.clone(),
                retained,
            },
            runtime.storage.remote_path.as_str(),
        )),
    };
    let last_state = LastStateFile::in_dir(Path::new(&runtime.storage.last_state_dir), "valve");

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
        if runtime.pins.supply_sense != SUPPLY_SENSE_GPIO {
            warn!(
                "supply sense is wired to GPIO{SUPPLY_SENSE_GPIO}, ignoring GPIO{}",
                runtime.pins.supply_sense
            );
        }
        garden.attach_supply_monitor(Box::new(SupplySense::new(supply_sense)?));
    }
    garden.start(now_ms);

    let mut last_publish: Option<Instant> = None;
    let mut wifi_disconnected_since_ms: Option<u32> = None;

    loop {
        feed_watchdog();

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
            Err(RecvTimeoutError::Disconnected) => return Err(anyhow!("request channel closed")),
        };

        let now_ms = monotonic_ms();
        changed |= garden.tick(now_ms, local_now(&timezone));

        if is_wifi_station_connected() {
            wifi_disconnected_since_ms = None;
        } else if let Some(since_ms) = wifi_disconnected_since_ms {
            // Never restart with the valve open.
            if now_ms.wrapping_sub(since_ms) >= WIFI_RESTART_GRACE_MS && !garden.is_valve_open() {
                warn!(
                    "wifi disconnected for {}s; restarting device for recovery",
                    WIFI_RESTART_GRACE_MS / 1000
                );
                thread::sleep(Duration::from_millis(100));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        } else {
            wifi_disconnected_since_ms = Some(now_ms);
        }

        let periodic = last_publish.map_or(true, |at| at.elapsed() >= STATE_PUBLISH_INTERVAL);
        if changed || periodic {
            last_publish = Some(Instant::now());
            let status = garden.status(now_ms, local_now(&timezone));
            publish_retained(&mqtt, TOPIC_GARDEN_STATE, &status);
        }
        if tasks_changed || periodic {
            publish_retained(&mqtt, TOPIC_GARDEN_SCHEDULE_STATE, garden.tasks());
        }
    }
}

fn init_pins(
    pins: &PinConfig,
    relay_active_high: bool,
) -> anyhow::Result<(Relays, PinInput<PinDriver<'static, AnyInputPin, Input>>)> {
    let relay = |gpio: i32| -> anyhow::Result<Box<PinOutput<PinDriver<'static, AnyOutputPin, Output>>>> {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }
            .with_context(|| format!("relay GPIO{gpio} unavailable"))?;
        Ok(Box::new(PinOutput::new(driver, relay_active_high)))
    };

    let relays = Relays {
        valve_power: relay(pins.valve_power)?,
        valve_direction: relay(pins.valve_direction)?,
        pump: relay(pins.pump)?,
        ac_power: relay(pins.ac_power)?,
    };

    // The sensor board carries its own pull-up.
    let leak = unsafe { PinDriver::input(AnyInputPin::new(pins.water_leak)) }
        .with_context(|| format!("leak sensor GPIO{} unavailable", pins.water_leak))?;
    info!(
        "relays on GPIO{}/{}/{}/{}, leak sensor on GPIO{}",
        pins.valve_power, pins.valve_direction, pins.pump, pins.ac_power, pins.water_leak
    );

    Ok((relays, PinInput::new(leak)))
}

fn publish_retained<T: Serialize + ?Sized>(mqtt: &SharedMqtt, topic: &str, payload: &T) {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(err) => {
            warn!("{topic} serialization failed: {err}");
            return;
        }
    };

    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = client.publish(topic, QoS::AtLeastOnce, true, &body) {
        warn!("{topic} publish failed: {err}");
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
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

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn time_status(timezone: &RwLock<String>) -> TimeStatus {
    TimeStatus {
        time_synced: local_now(timezone).is_some(),
        timezone: timezone
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone(),
        now_epoch: Utc::now().timestamp(),
    }
}

fn local_now(timezone: &RwLock<String>) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .parse()
        .ok()?;
    let utc = Utc::now();
    if !is_plausible_epoch(utc.timestamp()) {
        return None;
    }
    let local = utc.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn monotonic_ms() -> u32 {
    (unsafe { esp_idf_svc::sys::esp_timer_get_time() } / 1_000) as u32
}
