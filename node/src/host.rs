use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::Context;
use nalytha_common::{
    sensors::{self, run_gps_ingest},
    trigger_channel, Clock, Connection, EnvironmentSensor, FirmwareFlash, FlashError,
    FlashTransaction, ImageInstaller, Measurements, Network, OtaConfig, OtaUpdater,
    PersistentBlock, ReadOutcome, ReleaseResolver, Restart, RuntimeConfig, SensorError,
    SensorHub, SerialSource, SystemClock, Transport, TransportError, Version, VersionStore,
};
use tracing::{info, warn};

/// Mirrors a typical two-slot 4 MB partition table.
const UPDATE_SLOT_CAPACITY: u64 = 1_920 * 1024;
const SIMULATED_FIX: &[u8] = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n\
$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

#[derive(Clone)]
struct HostStore {
    data_dir: PathBuf,
}

impl HostStore {
    fn new() -> Self {
        let data_dir = std::env::var("NALYTHA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.nalytha"));
        Self { data_dir }
    }

    fn runtime_path(&self) -> PathBuf {
        self.data_dir.join("runtime.json")
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Version block kept in a small file, EEPROM style.
struct FileBlock {
    path: PathBuf,
    size: usize,
}

impl FileBlock {
    fn open(path: PathBuf, size: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }
        Ok(Self { path, size })
    }

    fn check_range(&self, offset: usize, len: usize) -> std::io::Result<()> {
        if offset + len > self.size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("range {offset}+{len} exceeds {} byte block", self.size),
            ));
        }
        Ok(())
    }
}

impl PersistentBlock for FileBlock {
    type Error = std::io::Error;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> std::io::Result<()> {
        self.check_range(offset, data.len())?;
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)
    }

    fn commit(&mut self) -> std::io::Result<()> {
        File::open(&self.path)?.sync_all()
    }
}

struct HostNetwork;

impl Network for HostNetwork {
    fn is_connected(&mut self) -> bool {
        true
    }

    fn reconnect(&mut self) {}
}

#[derive(Clone)]
struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    fn new(config: &OtaConfig) -> anyhow::Result<Self> {
        if config.insecure_transport {
            warn!("certificate validation disabled for OTA transport");
        }
        // The blocking client applies `timeout` to each body read, so a quiet
        // server surfaces as an idle read instead of a hung thread.
        let io_timeout = Duration::from_millis(config.io_timeout_ms);
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(config.insecure_transport)
            .connect_timeout(io_timeout)
            .timeout(io_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

struct HttpConnection {
    response: reqwest::blocking::Response,
    open: bool,
}

impl Transport for HttpTransport {
    type Connection = HttpConnection;

    fn open(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpConnection, TransportError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .map_err(|err| TransportError::Open(err.to_string()))?;
        Ok(HttpConnection {
            response,
            open: true,
        })
    }
}

impl Connection for HttpConnection {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        match self.response.read(buf) {
            Ok(0) => {
                self.open = false;
                Ok(ReadOutcome::Eof)
            }
            Ok(read) => Ok(ReadOutcome::Data(read)),
            Err(err) if is_read_timeout(&err) => Ok(ReadOutcome::Idle),
            Err(err) => {
                self.open = false;
                Err(TransportError::Read(err.to_string()))
            }
        }
    }
}

fn is_read_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}

/// Writes the image next to the data dir; finalize swaps it into place.
struct FileFlash {
    image_path: PathBuf,
    capacity: u64,
}

struct FileTransaction {
    staging_path: PathBuf,
    image_path: PathBuf,
    file: File,
    expected: u64,
    written: u64,
}

impl FirmwareFlash for FileFlash {
    type Transaction<'a> = FileTransaction;

    fn begin(&mut self, size: u64) -> Result<FileTransaction, FlashError> {
        if size > self.capacity {
            return Err(FlashError::TooLarge {
                size,
                capacity: self.capacity,
            });
        }
        let staging_path = self.image_path.with_extension("bin.part");
        let file =
            File::create(&staging_path).map_err(|err| FlashError::Begin(err.to_string()))?;
        Ok(FileTransaction {
            staging_path,
            image_path: self.image_path.clone(),
            file,
            expected: size,
            written: 0,
        })
    }
}

impl FlashTransaction for FileTransaction {
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        self.file
            .write_all(data)
            .map_err(|err| FlashError::Write(err.to_string()))?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn finalize(self) -> Result<(), FlashError> {
        if self.written != self.expected {
            let _ = fs::remove_file(&self.staging_path);
            return Err(FlashError::Finalize(format!(
                "image incomplete ({} of {} bytes)",
                self.written, self.expected
            )));
        }
        self.file
            .sync_all()
            .map_err(|err| FlashError::Finalize(err.to_string()))?;
        fs::rename(&self.staging_path, &self.image_path)
            .map_err(|err| FlashError::Finalize(err.to_string()))
    }

    fn abort(self) {
        drop(self.file);
        if let Err(err) = fs::remove_file(&self.staging_path) {
            warn!("failed to discard staged image: {err}");
        }
    }
}

struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&self) -> ! {
        info!("host build has no bootloader; exiting so a supervisor can relaunch");
        std::process::exit(0)
    }
}

/// Stand-in for the BME280 with slowly drifting values.
struct SimulatedEnvironment {
    tick: u64,
}

impl EnvironmentSensor for SimulatedEnvironment {
    fn measure(&mut self) -> Result<Measurements, SensorError> {
        self.tick = self.tick.saturating_add(1);
        Ok(Measurements {
            temperature_c: 24.0 + (self.tick % 8) as f32 * 0.1,
            humidity_pct: 55.0 + (self.tick % 6) as f32 * 0.5,
            pressure_pa: 100_900.0 + (self.tick % 5) as f32 * 10.0,
        })
    }
}

/// Replays a canned fix once per second.
struct SimulatedGps {
    clock: SystemClock,
    pending: Vec<u8>,
    last_burst_ms: Option<u64>,
}

impl SimulatedGps {
    fn refill(&mut self) {
        let now = self.clock.now_ms();
        let due = self
            .last_burst_ms
            .map_or(true, |last| now.saturating_sub(last) >= 1_000);
        if due && self.pending.is_empty() {
            self.pending.extend_from_slice(SIMULATED_FIX);
            self.last_burst_ms = Some(now);
        }
    }
}

impl SerialSource for SimulatedGps {
    fn available(&mut self) -> usize {
        self.refill();
        self.pending.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

type HostUpdater =
    OtaUpdater<HostNetwork, HttpTransport, SystemClock, FileFlash, ProcessRestart, FileBlock>;

fn build_updater(data_dir: &Path, config: OtaConfig) -> anyhow::Result<HostUpdater> {
    let clock = SystemClock::new();
    let transport = HttpTransport::new(&config)?;
    let block = FileBlock::open(data_dir.join("ota_block.bin"), config.layout.block_size)
        .context("failed to open version block")?;
    let store = VersionStore::new(
        block,
        config.layout,
        Version::new(config.default_version.clone()),
    );
    let flash = FileFlash {
        image_path: data_dir.join("firmware.bin"),
        capacity: UPDATE_SLOT_CAPACITY,
    };

    let resolver = ReleaseResolver::new(config.clone(), HostNetwork, transport.clone(), clock);
    let installer = ImageInstaller::new(config, transport, flash, clock, ProcessRestart);
    Ok(OtaUpdater::new(resolver, installer, store))
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = HostStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });

    if let Ok(url) = std::env::var("NALYTHA_RELEASE_URL") {
        runtime.ota.release_api_url = url;
    }
    if let Some(secs) = std::env::var("NALYTHA_RECHECK_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        runtime.ota.recheck_interval_secs = Some(secs);
    }
    runtime.sanitize();

    let clock = SystemClock::new();
    let environment = runtime
        .sensors
        .bme280_enabled
        .then_some(SimulatedEnvironment { tick: 0 });
    let hub = SensorHub::new(environment, runtime.sensors.clone(), clock);

    if runtime.sensors.gps_enabled {
        let gps_hub = hub.clone();
        let source = SimulatedGps {
            clock,
            pending: Vec::new(),
            last_burst_ms: None,
        };
        thread::Builder::new()
            .name("gps-ingest".into())
            .spawn(move || {
                run_gps_ingest(gps_hub, source);
            })
            .context("failed to spawn gps ingest thread")?;
    }

    let (update_handle, triggers) = trigger_channel();
    let data_dir = store.data_dir.clone();
    let ota_config = runtime.ota.clone();
    thread::Builder::new()
        .name("ota-update".into())
        .spawn(move || match build_updater(&data_dir, ota_config) {
            Ok(updater) => updater.run_background(triggers),
            Err(err) => warn!("OTA updater unavailable: {err:#}"),
        })
        .context("failed to spawn ota thread")?;

    info!("node started (data dir {})", store.data_dir.display());

    let mut interval = tokio::time::interval(Duration::from_secs(30));
    let recheck_every = runtime.ota.recheck_interval_secs.map(Duration::from_secs);
    let mut last_recheck = tokio::time::Instant::now();

    loop {
        interval.tick().await;
        log_readings(&hub);

        if let Some(every) = recheck_every {
            if last_recheck.elapsed() >= every {
                last_recheck = tokio::time::Instant::now();
                if !update_handle.resume() {
                    warn!("OTA updater has stopped; recheck skipped");
                }
            }
        }
    }
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
