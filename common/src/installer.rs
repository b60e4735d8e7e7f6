use std::convert::Infallible;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::{
    config::OtaConfig,
    error::{FetchFailure, FlashError, InstallFailure, OtaError},
    platform::{
        Clock, Connection, FirmwareFlash, FlashTransaction, PersistentBlock, ReadOutcome,
        Restart, Transport,
    },
    release::{status_backoff_ms, ReleaseDescriptor},
    version::VersionStore,
};

const OPEN_RETRY_DELAY_MS: u64 = 1_000;
const STALL_COOLDOWN_MS: u64 = 1_000;
const DATA_YIELD_MS: u64 = 1;
const IDLE_YIELD_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedImage {
    pub bytes: u64,
    pub sha256: String,
}

/// Why one attempt ended, and how long to wait before the next one.
struct AttemptFailure {
    error: OtaError,
    delay_ms: Option<u64>,
}

impl AttemptFailure {
    fn new(error: impl Into<OtaError>, delay_ms: Option<u64>) -> Self {
        Self {
            error: error.into(),
            delay_ms,
        }
    }
}

pub struct ImageInstaller<T, F, C, R> {
    config: OtaConfig,
    transport: T,
    flash: F,
    clock: C,
    restart: R,
}

impl<T, F, C, R> ImageInstaller<T, F, C, R>
where
    T: Transport,
    F: FirmwareFlash,
    C: Clock,
    R: Restart,
{
    pub fn new(config: OtaConfig, transport: T, flash: F, clock: C, restart: R) -> Self {
        Self {
            config,
            transport,
            flash,
            clock,
            restart,
        }
    }

    /// Downloads and flashes `release`. On success the version is persisted
    /// and the device restarts, so this only ever returns a failure.
    pub fn install<B: PersistentBlock>(
        &mut self,
        release: &ReleaseDescriptor,
        store: &mut VersionStore<B>,
    ) -> Result<Infallible, InstallFailure> {
        let max_attempts = self.config.max_attempts;
        let mut last_error = OtaError::TransientFetchFailure(FetchFailure::MissingContentLength);

        for attempt in 0..max_attempts {
            info!(
                "installing firmware {} from {} (attempt {}/{max_attempts})",
                release.version,
                release.firmware_url,
                attempt + 1
            );

            match self.attempt(release, attempt) {
                Ok(image) => {
                    info!(
                        "firmware {} written ({} bytes, sha256 {})",
                        release.version, image.bytes, image.sha256
                    );
                    store.write(&release.version);
                    self.clock.delay_ms(self.config.restart_delay_ms);
                    info!("restarting into firmware {}", release.version);
                    self.restart.restart();
                }
                Err(failure) => {
                    warn!("firmware install attempt {} failed: {}", attempt + 1, failure.error);
                    if let Some(delay) = failure.delay_ms {
                        self.clock.delay_ms(delay);
                    }
                    last_error = failure.error;
                }
            }
        }

        warn!("giving up on firmware {}; keeping current image", release.version);
        Err(InstallFailure {
            attempts: max_attempts,
            last_error,
        })
    }

    fn attempt(
        &mut self,
        release: &ReleaseDescriptor,
        attempt: u32,
    ) -> Result<StreamedImage, AttemptFailure> {
        let backoff = status_backoff_ms(attempt, self.config.max_attempts);

        let mut conn = self
            .transport
            .open(&release.firmware_url, &[])
            .map_err(|err| AttemptFailure::new(err, Some(OPEN_RETRY_DELAY_MS)))?;

        let status = conn.status();
        if status != 200 {
            return Err(AttemptFailure::new(FetchFailure::Status(status), backoff));
        }

        let content_length = match conn.content_length() {
            Some(len) if len > 0 => len,
            _ => {
                return Err(AttemptFailure::new(
                    FetchFailure::MissingContentLength,
                    Some(OPEN_RETRY_DELAY_MS),
                ))
            }
        };

        let mut transaction = self
            .flash
            .begin(content_length)
            .map_err(|err| AttemptFailure::new(err, backoff))?;

        match stream_image(
            &mut conn,
            &mut transaction,
            &self.clock,
            content_length,
            self.config.chunk_size,
            self.config.stall_timeout_ms,
        ) {
            Ok(image) => transaction
                .finalize()
                .map(|()| image)
                .map_err(|err| AttemptFailure::new(err, backoff)),
            Err(error) => {
                transaction.abort();
                let delay_ms = match error {
                    OtaError::StallTimeout { .. } => Some(STALL_COOLDOWN_MS),
                    _ => backoff,
                };
                Err(AttemptFailure { error, delay_ms })
            }
        }
    }
}

/// Copies exactly `content_length` bytes from `conn` into `transaction`.
fn stream_image<N, X, C>(
    conn: &mut N,
    transaction: &mut X,
    clock: &C,
    content_length: u64,
    chunk_size: usize,
    stall_timeout_ms: u64,
) -> Result<StreamedImage, OtaError>
where
    N: Connection,
    X: FlashTransaction,
    C: Clock,
{
    let mut buf = vec![0_u8; chunk_size];
    let mut hasher = Sha256::new();
    let mut written = 0_u64;
    let mut last_data_ms = clock.now_ms();
    let mut last_logged_pct = 0_u64;

    while conn.is_open() && written < content_length {
        let remaining = usize::try_from(content_length - written).unwrap_or(usize::MAX);
        let want = remaining.min(chunk_size);

        match conn.read(&mut buf[..want])? {
            ReadOutcome::Data(read) => {
                let wrote = transaction.write(&buf[..read])?;
                if wrote != read {
                    return Err(FlashError::ShortWrite {
                        written: wrote,
                        requested: read,
                    }
                    .into());
                }
                hasher.update(&buf[..read]);
                written += read as u64;
                last_data_ms = clock.now_ms();

                let pct = written * 100 / content_length;
                if pct >= last_logged_pct + 10 {
                    debug!("firmware download {pct}% ({written}/{content_length} bytes)");
                    last_logged_pct = pct;
                }
                clock.delay_ms(DATA_YIELD_MS);
            }
            ReadOutcome::Idle => {
                let idle_ms = clock.now_ms().saturating_sub(last_data_ms);
                if idle_ms > stall_timeout_ms {
                    return Err(OtaError::StallTimeout { idle_ms });
                }
                clock.delay_ms(IDLE_YIELD_MS);
            }
            ReadOutcome::Eof => break,
        }
    }

    if written != content_length {
        return Err(FetchFailure::Truncated {
            received: written,
            expected: content_length,
        }
        .into());
    }

    let sha256 = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();

    Ok(StreamedImage {
        bytes: written,
        sha256,
    })
}
