use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use chrono::{NaiveDate, NaiveTime};
use log::warn;

use crate::{
    config::SensorConfig,
    error::SensorError,
    gps::{GpsFix, NmeaParser},
    platform::Clock,
};

const LOCK_POLL_MS: u64 = 1;
const GPS_IDLE_YIELD_MS: u64 = 10;

/// A sensor value, or the fact that none could be obtained in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> {
    Ready(T),
    Unavailable,
}

impl<T> Reading<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Unavailable => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl<T> From<Option<T>> for Reading<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Unavailable, Self::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_pa: f32,
}

pub trait EnvironmentSensor {
    fn measure(&mut self) -> Result<Measurements, SensorError>;
}

/// Byte stream from the GPS receiver. `read` must not block when nothing is
/// pending.
pub trait SerialSource {
    fn available(&mut self) -> usize;
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// International barometric formula, altitude in metres.
pub fn pressure_altitude_m(pressure_hpa: f32, sea_level_hpa: f32) -> f32 {
    44_330.0 * (1.0 - (pressure_hpa / sea_level_hpa).powf(0.1903))
}

pub fn format_time(time: Option<NaiveTime>) -> String {
    time.map_or_else(
        || "00:00:00".to_string(),
        |time| time.format("%H:%M:%S").to_string(),
    )
}

pub fn format_date(date: Option<NaiveDate>) -> String {
    date.map_or_else(
        || "00/00/0000".to_string(),
        |date| date.format("%d/%m/%Y").to_string(),
    )
}

struct HubState<E> {
    environment: Option<E>,
    gps: NmeaParser,
}

pub struct SensorHub<E, C> {
    state: Arc<Mutex<HubState<E>>>,
    config: SensorConfig,
    clock: C,
}

impl<E, C: Clone> Clone for SensorHub<E, C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<E: EnvironmentSensor, C: Clock> SensorHub<E, C> {
    /// `environment` is `None` when the BME280 is disabled or did not answer
    /// during bring-up.
    pub fn new(environment: Option<E>, config: SensorConfig, clock: C) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                environment,
                gps: NmeaParser::new(),
            })),
            config,
            clock,
        }
    }

    pub fn temperature(&self) -> Reading<f32> {
        self.measure(|m| m.temperature_c)
    }

    pub fn humidity(&self) -> Reading<f32> {
        self.measure(|m| m.humidity_pct)
    }

    /// Pressure in hPa.
    pub fn pressure(&self) -> Reading<f32> {
        self.measure(|m| m.pressure_pa / 100.0)
    }

    pub fn altitude(&self) -> Reading<f32> {
        let sea_level = self.config.sea_level_hpa;
        self.measure(|m| pressure_altitude_m(m.pressure_pa / 100.0, sea_level))
    }

    pub fn latitude(&self) -> Reading<f64> {
        self.with_fix(|fix| fix.location.map(|location| location.latitude))
    }

    pub fn longitude(&self) -> Reading<f64> {
        self.with_fix(|fix| fix.location.map(|location| location.longitude))
    }

    pub fn satellite_count(&self) -> Reading<u32> {
        self.with_fix(|fix| fix.satellites)
    }

    pub fn time(&self) -> Reading<NaiveTime> {
        self.with_fix(|fix| fix.time)
    }

    pub fn date(&self) -> Reading<NaiveDate> {
        self.with_fix(|fix| fix.date)
    }

    /// Moves whatever the receiver has buffered into the NMEA parser. Returns
    /// the number of bytes consumed.
    pub fn ingest_gps<S: SerialSource>(&self, source: &mut S) -> usize {
        if source.available() == 0 {
            return 0;
        }
        let Some(mut state) = self.lock() else {
            return 0;
        };

        let mut buf = [0_u8; 64];
        let mut consumed = 0;
        while source.available() > 0 {
            let read = source.read(&mut buf);
            if read == 0 {
                break;
            }
            state.gps.feed_all(&buf[..read]);
            consumed += read;
        }
        consumed
    }

    fn measure<T>(&self, pick: impl FnOnce(&Measurements) -> T) -> Reading<T> {
        let Some(mut state) = self.lock() else {
            return Reading::Unavailable;
        };
        let Some(sensor) = state.environment.as_mut() else {
            return Reading::Unavailable;
        };

        match sensor.measure() {
            Ok(measurements) => Reading::Ready(pick(&measurements)),
            Err(err) => {
                warn!("environment sensor read failed: {err}");
                Reading::Unavailable
            }
        }
    }

    fn with_fix<T>(&self, pick: impl FnOnce(&GpsFix) -> Option<T>) -> Reading<T> {
        self.lock()
            .and_then(|state| pick(state.gps.fix()))
            .into()
    }

    /// Takes the hub lock, giving up after `lock_wait_ms`.
    fn lock(&self) -> Option<MutexGuard<'_, HubState<E>>> {
        let deadline = self.clock.now_ms() + self.config.lock_wait_ms;
        loop {
            match self.state.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if self.clock.now_ms() >= deadline {
                        return None;
                    }
                    self.clock.delay_ms(LOCK_POLL_MS);
                }
            }
        }
    }
}

/// Body of the GPS background task.
pub fn run_gps_ingest<E, C, S>(hub: SensorHub<E, C>, mut source: S) -> !
where
    E: EnvironmentSensor,
    C: Clock,
    S: SerialSource,
{
    loop {
        hub.ingest_gps(&mut source);
        hub.clock.delay_ms(GPS_IDLE_YIELD_MS);
    }
}
