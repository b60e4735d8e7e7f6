pub mod config;
pub mod error;
pub mod gps;
pub mod installer;
pub mod platform;
pub mod release;
pub mod sensors;
pub mod updater;
pub mod version;

#[cfg(test)]
mod testing;

pub use config::{NetworkConfig, OtaConfig, RuntimeConfig, SensorConfig, VersionLayout};
pub use error::{
    FetchFailure, FlashError, InstallFailure, OtaError, SensorError, TransportError, Unresolvable,
};
pub use gps::{GpsFix, Location, NmeaParser};
pub use installer::ImageInstaller;
pub use platform::{
    Clock, Connection, FirmwareFlash, FlashTransaction, Network, PersistentBlock, ReadOutcome,
    Restart, SystemClock, Transport,
};
pub use release::{ReleaseDescriptor, ReleaseResolver, ReleaseSource};
pub use sensors::{EnvironmentSensor, Measurements, Reading, SensorHub, SerialSource};
pub use updater::{
    check_for_update, is_update_available, trigger_channel, CycleOutcome, OtaUpdater, UpdateCheck,
    UpdateHandle, UpdaterState,
};
pub use version::{Version, VersionStore};
