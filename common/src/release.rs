use log::{debug, info, warn};
use serde::Deserialize;

use crate::{
    config::OtaConfig,
    error::{FetchFailure, OtaError, Unresolvable},
    platform::{Clock, Connection, Network, ReadOutcome, Transport},
    version::{extract_version_from_file_name, Version},
};

const OPEN_RETRY_DELAY_MS: u64 = 1_000;
const PARSE_RETRY_DELAY_MS: u64 = 1_000;
const BODY_POLL_DELAY_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseSource {
    Feed,
    Fallback,
}

/// Outcome of one release lookup. Lives for a single update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub version: Version,
    pub firmware_url: String,
    pub source: ReleaseSource,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseMetadata {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseAsset {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub browser_download_url: Option<String>,
}

pub fn parse_release_metadata(body: &[u8]) -> Result<ReleaseMetadata, FetchFailure> {
    serde_json::from_slice(body).map_err(|err| FetchFailure::Malformed(err.to_string()))
}

pub fn descriptor_from_metadata(
    metadata: &ReleaseMetadata,
    config: &OtaConfig,
) -> Result<ReleaseDescriptor, FetchFailure> {
    let tag = metadata
        .tag_name
        .as_deref()
        .ok_or(FetchFailure::MissingTag)?;
    let mut version = Version::from_tag(tag);

    let asset = metadata.assets.iter().find_map(|asset| {
        let name = asset.name.as_deref()?;
        let url = asset.browser_download_url.as_deref()?;
        (name.ends_with(&config.asset_suffix) && name.contains(&config.asset_marker))
            .then_some((name, url))
    });

    let firmware_url = match asset {
        Some((name, url)) => {
            let file_version = extract_version_from_file_name(name);
            if !file_version.is_empty() {
                if file_version != version.as_str() {
                    debug!("asset `{name}` overrides tag version {version} with {file_version}");
                }
                version = Version::new(file_version);
            }
            url.to_string()
        }
        None => format!(
            "{}/{}/{}-{}{}",
            config.release_download_base.trim_end_matches('/'),
            tag,
            config.asset_marker,
            version,
            config.asset_suffix
        ),
    };

    Ok(ReleaseDescriptor {
        version,
        firmware_url,
        source: ReleaseSource::Feed,
    })
}

pub fn fallback_release(config: &OtaConfig) -> ReleaseDescriptor {
    ReleaseDescriptor {
        version: Version::new(config.fallback_version.clone()),
        firmware_url: config.fallback_url.clone(),
        source: ReleaseSource::Fallback,
    }
}

/// Linear backoff used after a bad status: 2 s, 4 s, ... and none after the
/// final attempt.
pub(crate) fn status_backoff_ms(attempt: u32, max_attempts: u32) -> Option<u64> {
    (attempt + 1 < max_attempts).then(|| u64::from(attempt + 1) * 2_000)
}

/// Reads the whole body, failing once it grows past `limit` or goes silent
/// for longer than `stall_timeout_ms`.
pub(crate) fn read_body_capped<C: Connection, K: Clock>(
    conn: &mut C,
    clock: &K,
    limit: usize,
    stall_timeout_ms: u64,
) -> Result<Vec<u8>, FetchFailure> {
    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];
    let mut last_data_ms = clock.now_ms();

    loop {
        match conn.read(&mut chunk)? {
            ReadOutcome::Data(read) => {
                if body.len() + read > limit {
                    return Err(FetchFailure::BodyTooLarge { limit });
                }
                body.extend_from_slice(&chunk[..read]);
                last_data_ms = clock.now_ms();
            }
            ReadOutcome::Eof => return Ok(body),
            ReadOutcome::Idle => {
                if !conn.is_open() {
                    return Ok(body);
                }
                if clock.now_ms().saturating_sub(last_data_ms) > stall_timeout_ms {
                    return Err(FetchFailure::Truncated {
                        received: body.len() as u64,
                        expected: conn.content_length().unwrap_or(0),
                    });
                }
                clock.delay_ms(BODY_POLL_DELAY_MS);
            }
        }
    }
}

pub struct ReleaseResolver<N, T, C> {
    config: OtaConfig,
    network: N,
    transport: T,
    clock: C,
}

impl<N: Network, T: Transport, C: Clock> ReleaseResolver<N, T, C> {
    pub fn new(config: OtaConfig, network: N, transport: T, clock: C) -> Self {
        Self {
            config,
            network,
            transport,
            clock,
        }
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Resolves the latest release. Fetch problems fall back to the built-in
    /// release; only a missing network makes this fail.
    pub fn resolve(&mut self) -> Result<ReleaseDescriptor, Unresolvable> {
        self.ensure_connected()?;

        let max_attempts = self.config.max_attempts;
        for attempt in 0..max_attempts {
            info!(
                "checking release feed (attempt {}/{max_attempts})",
                attempt + 1
            );

            match self.fetch_once() {
                Ok(release) => {
                    info!(
                        "latest release {} at {}",
                        release.version, release.firmware_url
                    );
                    return Ok(release);
                }
                Err(FetchFailure::Status(status)) => {
                    warn!("release feed returned HTTP {status}");
                    if let Some(delay) = status_backoff_ms(attempt, max_attempts) {
                        self.clock.delay_ms(delay);
                    }
                }
                Err(err @ FetchFailure::Transport(_)) => {
                    warn!("release feed unreachable: {err}");
                    self.clock.delay_ms(OPEN_RETRY_DELAY_MS);
                }
                Err(err) => {
                    warn!("release feed response rejected: {err}");
                    self.clock.delay_ms(PARSE_RETRY_DELAY_MS);
                }
            }
        }

        let fallback = fallback_release(&self.config);
        warn!(
            "release feed exhausted after {max_attempts} attempt(s); using fallback {} at {}",
            fallback.version, fallback.firmware_url
        );
        Ok(fallback)
    }

    fn ensure_connected(&mut self) -> Result<(), Unresolvable> {
        if self.network.is_connected() {
            return Ok(());
        }

        warn!(
            "network down; reconnecting and waiting {} ms",
            self.config.reconnect_wait_ms
        );
        self.network.reconnect();
        self.clock.delay_ms(self.config.reconnect_wait_ms);

        if self.network.is_connected() {
            Ok(())
        } else {
            warn!("network still down; skipping update check");
            Err(Unresolvable {
                cause: OtaError::ConnectivityUnavailable,
            })
        }
    }

    fn fetch_once(&mut self) -> Result<ReleaseDescriptor, FetchFailure> {
        let headers = [
            ("User-Agent", self.config.user_agent.as_str()),
            ("Accept", self.config.accept.as_str()),
        ];
        let mut conn = self.transport.open(&self.config.release_api_url, &headers)?;

        let status = conn.status();
        if status != 200 {
            return Err(FetchFailure::Status(status));
        }

        let body = read_body_capped(
            &mut conn,
            &self.clock,
            self.config.max_release_body_bytes,
            self.config.stall_timeout_ms,
        )?;
        let metadata = parse_release_metadata(&body)?;
        descriptor_from_metadata(&metadata, &self.config)
    }
}
