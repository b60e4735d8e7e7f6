use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280::i2c::BME280;
use embedded_svc::{
    http::{Headers, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, NON_BLOCK},
    gpio::AnyIOPin,
    i2c::{I2cConfig, I2cDriver},
    prelude::*,
    task::thread::ThreadSpawnConfiguration,
    uart::{config::Config as UartConfig, UartDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use nalytha_common::{
    config::NetworkConfig,
    sensors::{self, run_gps_ingest},
    trigger_channel, Clock, Connection, EnvironmentSensor, FirmwareFlash, FlashError,
    FlashTransaction, ImageInstaller, Measurements, Network, OtaConfig, OtaUpdater,
    PersistentBlock, ReadOutcome, ReleaseResolver, Restart, RuntimeConfig, SensorError,
    SensorHub, SerialSource, SystemClock, Transport, TransportError, Version, VersionStore,
};

const NVS_NAMESPACE: &str = "nalytha";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_VERSION_BLOCK_KEY: &str = "ota_block";

const BME280_SDA_PIN: i32 = 3;
const BME280_SCL_PIN: i32 = 4;
const GPS_RX_PIN: i32 = 17;
const GPS_TX_PIN: i32 = 18;

const OTA_TASK_STACK: usize = 8 * 1024;
const OTA_TASK_PRIORITY: u8 = 3;
const GPS_TASK_STACK: usize = 4 * 1024;
const GPS_TASK_PRIORITY: u8 = 1;

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SENSOR_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Both keys live in one namespace. The runtime document is read once at
/// boot; the version block keeps its own handle for later commits.
#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open nvs namespace `{NVS_NAMESPACE}`"))
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 4096];
        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn version_block(&self, size: usize) -> anyhow::Result<NvsBlock> {
        let nvs = self.open()?;
        let mut image = vec![0xFF_u8; size];
        let mut raw = vec![0_u8; size];
        if let Some(stored) = nvs.get_blob(NVS_VERSION_BLOCK_KEY, &mut raw)? {
            let len = stored.len().min(size);
            image[..len].copy_from_slice(&stored[..len]);
        }
        Ok(NvsBlock { nvs, image })
    }
}

/// Fixed-size byte image persisted as a single NVS blob on commit.
struct NvsBlock {
    nvs: EspNvs<NvsDefault>,
    image: Vec<u8>,
}

impl NvsBlock {
    fn range(&self, offset: usize, len: usize) -> anyhow::Result<std::ops::Range<usize>> {
        let end = offset + len;
        if end > self.image.len() {
            return Err(anyhow!(
                "range {offset}+{len} exceeds {} byte block",
                self.image.len()
            ));
        }
        Ok(offset..end)
    }
}

impl PersistentBlock for NvsBlock {
    type Error = anyhow::Error;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> anyhow::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.image[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let range = self.range(offset, data.len())?;
        self.image[range].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        self.nvs.set_blob(NVS_VERSION_BLOCK_KEY, &self.image)?;
        Ok(())
    }
}

struct EspNetwork;

impl Network for EspNetwork {
    fn is_connected(&mut self) -> bool {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        rc == esp_idf_svc::sys::ESP_OK
    }

    fn reconnect(&mut self) {
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("wifi reconnect request failed: esp_err_t={rc}");
        }
    }
}

#[derive(Clone)]
struct EspTransport {
    insecure: bool,
    timeout: Duration,
    buffer_size: usize,
}

impl EspTransport {
    fn new(config: &OtaConfig) -> Self {
        if config.insecure_transport {
            warn!("certificate validation disabled for OTA transport");
        }
        Self {
            insecure: config.insecure_transport,
            timeout: Duration::from_millis(config.io_timeout_ms),
            buffer_size: config.chunk_size.max(512),
        }
    }
}

struct EspConnection {
    inner: EspHttpConnection,
    status: u16,
    content_length: Option<u64>,
    open: bool,
}

impl Transport for EspTransport {
    type Connection = EspConnection;

    fn open(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<EspConnection, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            buffer_size: Some(self.buffer_size),
            crt_bundle_attach: if self.insecure {
                None
            } else {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            },
            ..Default::default()
        };

        let mut inner = EspHttpConnection::new(&conf)
            .map_err(|err| TransportError::Open(format!("{err}")))?;
        inner
            .initiate_request(Method::Get, url, headers)
            .map_err(|err| TransportError::Open(format!("{err}")))?;
        inner
            .initiate_response()
            .map_err(|err| TransportError::Open(format!("{err}")))?;

        let status = inner.status();
        let content_length = inner
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());

        Ok(EspConnection {
            inner,
            status,
            content_length,
            open: true,
        })
    }
}

impl Connection for EspConnection {
    fn status(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        match self.inner.read(buf) {
            Ok(0) => {
                self.open = false;
                Ok(ReadOutcome::Eof)
            }
            Ok(read) => Ok(ReadOutcome::Data(read)),
            Err(err) if err.0.code() == esp_idf_svc::sys::ESP_ERR_HTTP_EAGAIN as i32 => {
                Ok(ReadOutcome::Idle)
            }
            Err(err) => {
                self.open = false;
                Err(TransportError::Read(format!("{err:?}")))
            }
        }
    }
}

struct EspFirmwareFlash {
    ota: EspOta,
}

struct EspFlashTransaction<'a> {
    update: EspOtaUpdate<'a>,
}

impl FirmwareFlash for EspFirmwareFlash {
    type Transaction<'a> = EspFlashTransaction<'a>;

    fn begin(&mut self, size: u64) -> Result<EspFlashTransaction<'_>, FlashError> {
        let capacity = update_partition_size()
            .ok_or_else(|| FlashError::Begin("no OTA update partition".to_string()))?;
        if size > capacity {
            return Err(FlashError::TooLarge { size, capacity });
        }

        let update = self
            .ota
            .initiate_update()
            .map_err(|err| FlashError::Begin(format!("{err}")))?;
        Ok(EspFlashTransaction { update })
    }
}

impl FlashTransaction for EspFlashTransaction<'_> {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        self.update
            .write(data)
            .map_err(|err| FlashError::Write(format!("{err:?}")))?;
        Ok(data.len())
    }

    fn finalize(self) -> Result<(), FlashError> {
        self.update
            .complete()
            .map_err(|err| FlashError::Finalize(format!("{err}")))
    }

    fn abort(self) {
        if let Err(err) = self.update.abort() {
            warn!("failed to abort OTA update: {err}");
        }
    }
}

fn update_partition_size() -> Option<u64> {
    let partition =
        unsafe { esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null()) };
    if partition.is_null() {
        return None;
    }
    Some(unsafe { (*partition).size } as u64)
}

struct EspRestart;

impl Restart for EspRestart {
    #[allow(unreachable_code)]
    fn restart(&self) -> ! {
        info!("restarting into new firmware");
        unsafe { esp_idf_svc::sys::esp_restart() };
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }
}

struct Bme280Sensor {
    device: BME280<I2cDriver<'static>>,
    delay: Ets,
}

impl Bme280Sensor {
    fn new(i2c: I2cDriver<'static>) -> anyhow::Result<Self> {
        let mut delay = Ets;
        let mut device = BME280::new_primary(i2c);
        device
            .init(&mut delay)
            .map_err(|err| anyhow!("BME280 init failed: {err:?}"))?;
        info!("BME280 ready on SDA GPIO{BME280_SDA_PIN} / SCL GPIO{BME280_SCL_PIN}");
        Ok(Self { device, delay })
    }
}

impl EnvironmentSensor for Bme280Sensor {
    fn measure(&mut self) -> Result<Measurements, SensorError> {
        let reading = self
            .device
            .measure(&mut self.delay)
            .map_err(|err| SensorError::Read(format!("{err:?}")))?;
        Ok(Measurements {
            temperature_c: reading.temperature,
            humidity_pct: reading.humidity,
            pressure_pa: reading.pressure,
        })
    }
}

struct UartGps {
    uart: UartDriver<'static>,
}

impl SerialSource for UartGps {
    fn available(&mut self) -> usize {
        self.uart.remaining_read().unwrap_or(0)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.uart.read(buf, NON_BLOCK) {
            Ok(read) => read,
            Err(err) => {
                warn!("gps uart read failed: {err}");
                0
            }
        }
    }
}

type EspUpdater =
    OtaUpdater<EspNetwork, EspTransport, SystemClock, EspFirmwareFlash, EspRestart, NvsBlock>;

fn build_updater(nvs_store: &NvsStore, config: OtaConfig) -> anyhow::Result<EspUpdater> {
    let clock = SystemClock::new();
    let transport = EspTransport::new(&config);
    let block = nvs_store
        .version_block(config.layout.block_size)
        .context("failed to open version block")?;
    let store = VersionStore::new(
        block,
        config.layout,
        Version::new(config.default_version.clone()),
    );
    let flash = EspFirmwareFlash {
        ota: EspOta::new().context("failed to acquire OTA")?,
    };

    let resolver = ReleaseResolver::new(config.clone(), EspNetwork, transport.clone(), clock);
    let installer = ImageInstaller::new(config, transport, flash, clock, EspRestart);
    Ok(OtaUpdater::new(resolver, installer, store))
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime
        .network
        .fill_missing_credentials(option_env!("WIFI_SSID"), option_env!("WIFI_PASS"));
    runtime.sanitize();

    let peripherals = Peripherals::take()?;

    let environment = if runtime.sensors.bme280_enabled {
        let i2c = I2cDriver::new(
            peripherals.i2c0,
            peripherals.pins.gpio3,
            peripherals.pins.gpio4,
            &I2cConfig::new().baudrate(100.kHz().into()),
        )?;
        match Bme280Sensor::new(i2c) {
            Ok(sensor) => Some(sensor),
            Err(err) => {
                warn!("environment readings unavailable: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let clock = SystemClock::new();
    let hub = SensorHub::new(environment, runtime.sensors.clone(), clock);

    if runtime.sensors.gps_enabled {
        let uart = UartDriver::new(
            peripherals.uart1,
            peripherals.pins.gpio18,
            peripherals.pins.gpio17,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &UartConfig::default().baudrate(Hertz(runtime.sensors.gps_baud)),
        )?;
        info!(
            "GPS on UART1 at {} baud (RX GPIO{GPS_RX_PIN}, TX GPIO{GPS_TX_PIN})",
            runtime.sensors.gps_baud
        );

        let gps_hub = hub.clone();
        spawn_task("gps-ingest\0", GPS_TASK_STACK, GPS_TASK_PRIORITY, move || {
            run_gps_ingest(gps_hub, UartGps { uart });
        })?;
    }

    let _wifi = connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let (update_handle, triggers) = trigger_channel();
    let ota_config = runtime.ota.clone();
    let ota_store = nvs_store.clone();
    spawn_task("ota-update\0", OTA_TASK_STACK, OTA_TASK_PRIORITY, move || {
        match build_updater(&ota_store, ota_config) {
            Ok(updater) => updater.run_background(triggers),
            Err(err) => warn!("OTA updater unavailable: {err:#}"),
        }
    })?;

    let recheck_every = runtime.ota.recheck_interval_secs.map(Duration::from_secs);
    let mut last_recheck = Instant::now();

    loop {
        log_readings(&hub);

        if let Some(every) = recheck_every {
            if last_recheck.elapsed() >= every {
                last_recheck = Instant::now();
                if !update_handle.resume() {
                    warn!("OTA updater has stopped; recheck skipped");
                }
            }
        }

        thread::sleep(SENSOR_LOG_INTERVAL);
    }
}

/// Spawns a std thread with FreeRTOS task settings applied, then restores the
/// defaults for later spawns.
fn spawn_task<F>(name: &'static str, stack_size: usize, priority: u8, body: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    ThreadSpawnConfiguration {
        name: Some(name.as_bytes()),
        stack_size,
        priority,
        ..Default::default()
    }
    .set()?;

    let spawned = thread::Builder::new()
        .name(name.trim_end_matches('\0').to_string())
        .stack_size(stack_size)
        .spawn(body);

    ThreadSpawnConfiguration::default().set()?;
    spawned.with_context(|| format!("failed to spawn {}", name.trim_end_matches('\0')))?;
    Ok(())
}

fn log_readings<E: EnvironmentSensor, C: Clock>(hub: &SensorHub<E, C>) {
    info!(
        "env temp={:?} humidity={:?} pressure={:?} altitude={:?}",
        hub.temperature().ok(),
        hub.humidity().ok(),
        hub.pressure().ok(),
        hub.altitude().ok()
    );
    info!(
        "gps lat={:?} lon={:?} sats={:?} time={} date={}",
        hub.latitude().ok(),
        hub.longitude().ok(),
        hub.satellite_count().ok(),
        sensors::format_time(hub.time().ok()),
        sensors::format_date(hub.date().ok())
    );
}

/// Station-only bring-up. A failed join is not fatal: the updater reports the
/// cycle as unresolvable and the driver keeps retrying in the background.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !network.has_credentials() {
        warn!("wifi credentials missing; running offline");
        drop(wifi);
        return Ok(esp_wifi);
    }

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
                break;
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        } else {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; continuing offline");
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}
