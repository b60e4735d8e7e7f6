use std::sync::mpsc::{self, Receiver, Sender};

use log::{info, warn};

use crate::{
    error::InstallFailure,
    installer::ImageInstaller,
    platform::{Clock, FirmwareFlash, Network, PersistentBlock, Restart, Transport},
    release::{ReleaseDescriptor, ReleaseResolver},
    version::{Version, VersionStore},
};

/// Plain string inequality: any difference, a downgrade included, is an
/// update.
pub fn is_update_available(stored: &Version, release: &ReleaseDescriptor) -> bool {
    stored.as_str() != release.version.as_str()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    Unresolvable,
    UpToDate { version: Version },
    Available {
        current: Version,
        release: ReleaseDescriptor,
    },
}

impl UpdateCheck {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

pub fn check_for_update<N, T, C, B>(
    resolver: &mut ReleaseResolver<N, T, C>,
    store: &mut VersionStore<B>,
) -> UpdateCheck
where
    N: Network,
    T: Transport,
    C: Clock,
    B: PersistentBlock,
{
    let release = match resolver.resolve() {
        Ok(release) => release,
        Err(err) => {
            warn!("update check skipped: {err}");
            return UpdateCheck::Unresolvable;
        }
    };

    let current = store.read();
    if is_update_available(&current, &release) {
        info!("update available: {current} -> {}", release.version);
        UpdateCheck::Available { current, release }
    } else {
        info!("firmware {current} is current");
        UpdateCheck::UpToDate { version: current }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    Idle,
    Checking,
    Installing,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Unresolvable,
    UpToDate(Version),
    InstallFailed(InstallFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTrigger;

/// Wakes a suspended background updater.
#[derive(Debug, Clone)]
pub struct UpdateHandle {
    sender: Sender<UpdateTrigger>,
}

impl UpdateHandle {
    /// Returns `false` once the background loop has gone away.
    pub fn resume(&self) -> bool {
        self.sender.send(UpdateTrigger).is_ok()
    }
}

pub fn trigger_channel() -> (UpdateHandle, Receiver<UpdateTrigger>) {
    let (sender, receiver) = mpsc::channel();
    (UpdateHandle { sender }, receiver)
}

pub struct OtaUpdater<N, T, C, F, R, B> {
    resolver: ReleaseResolver<N, T, C>,
    installer: ImageInstaller<T, F, C, R>,
    store: VersionStore<B>,
    state: UpdaterState,
}

impl<N, T, C, F, R, B> OtaUpdater<N, T, C, F, R, B>
where
    N: Network,
    T: Transport,
    C: Clock,
    F: FirmwareFlash,
    R: Restart,
    B: PersistentBlock,
{
    pub fn new(
        resolver: ReleaseResolver<N, T, C>,
        installer: ImageInstaller<T, F, C, R>,
        store: VersionStore<B>,
    ) -> Self {
        Self {
            resolver,
            installer,
            store,
            state: UpdaterState::Idle,
        }
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    pub fn current_version(&mut self) -> Version {
        self.store.read()
    }

    /// One check-and-install pass. A successful install restarts the device
    /// and never returns.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.state = UpdaterState::Checking;
        let outcome = match check_for_update(&mut self.resolver, &mut self.store) {
            UpdateCheck::Unresolvable => CycleOutcome::Unresolvable,
            UpdateCheck::UpToDate { version } => CycleOutcome::UpToDate(version),
            UpdateCheck::Available { release, .. } => {
                self.state = UpdaterState::Installing;
                match self.installer.install(&release, &mut self.store) {
                    Ok(never) => match never {},
                    Err(failure) => {
                        warn!("{failure}");
                        CycleOutcome::InstallFailed(failure)
                    }
                }
            }
        };
        self.state = UpdaterState::Suspended;
        outcome
    }

    /// Entry point for callers that schedule checks themselves.
    pub fn check_and_install(&mut self) -> CycleOutcome {
        self.run_cycle()
    }

    /// Checks once right away, then sleeps until triggered. Returns when every
    /// [`UpdateHandle`] has been dropped.
    pub fn run_background(mut self, triggers: Receiver<UpdateTrigger>) {
        loop {
            let outcome = self.run_cycle();
            info!("update cycle finished ({outcome:?}); suspended until resumed");

            if triggers.recv().is_err() {
                info!("update trigger channel closed; background updater stopping");
                return;
            }
            // Coalesce triggers that piled up while the cycle ran.
            while triggers.try_recv().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{OtaConfig, VersionLayout},
        error::OtaError,
        release::ReleaseSource,
        testing::{
            catch_restart, FakeClock, FakeNetwork, MemoryBlock, PanicRestart, RecordingFlash,
            ScriptedConnection, ScriptedTransport, Step,
        },
    };
    use pretty_assertions::assert_eq;

    type TestUpdater = OtaUpdater<
        FakeNetwork,
        ScriptedTransport,
        FakeClock,
        RecordingFlash,
        PanicRestart,
        MemoryBlock,
    >;

    fn release(version: &str) -> ReleaseDescriptor {
        ReleaseDescriptor {
            version: Version::new(version),
            firmware_url: "https://example.com/fw.bin".to_string(),
            source: ReleaseSource::Feed,
        }
    }

    fn updater(
        network: FakeNetwork,
        transport: ScriptedTransport,
        stored: Option<&str>,
    ) -> (TestUpdater, RecordingFlash, PanicRestart) {
        let config = OtaConfig::default();
        let clock = FakeClock::new();
        let flash = RecordingFlash::new();
        let restart = PanicRestart::new();
        let mut store = VersionStore::new(
            MemoryBlock::new(64),
            VersionLayout::default(),
            Version::new("1.0.0"),
        );
        if let Some(stored) = stored {
            store.write(&Version::new(stored));
        }

        let resolver =
            ReleaseResolver::new(config.clone(), network, transport.clone(), clock.clone());
        let installer =
            ImageInstaller::new(config, transport, flash.clone(), clock, restart.clone());
        (
            OtaUpdater::new(resolver, installer, store),
            flash,
            restart,
        )
    }

    fn feed(tag: &str) -> Result<ScriptedConnection, crate::error::TransportError> {
        Ok(ScriptedConnection::ok(
            format!(r#"{{"tag_name":"{tag}","assets":[]}}"#).into_bytes(),
        ))
    }

    #[test]
    fn equal_versions_are_current() {
        assert!(!is_update_available(&Version::new("1.0.10"), &release("1.0.10")));
    }

    #[test]
    fn any_textual_difference_is_an_update() {
        assert!(is_update_available(&Version::new("1.0.10"), &release("1.0.11")));
        assert!(is_update_available(&Version::new("1.0"), &release("1.0.0")));
    }

    #[test]
    fn lower_remote_version_still_counts_as_update() {
        // Comparison is textual, not semantic: a downgrade is offered too.
        assert!(is_update_available(&Version::new("2.0.0"), &release("1.9.0")));
    }

    #[test]
    fn check_reports_downgrade_as_available() {
        let transport = ScriptedTransport::new(vec![feed("v1.9.0")]);
        let clock = FakeClock::new();
        let mut resolver =
            ReleaseResolver::new(OtaConfig::default(), FakeNetwork::up(), transport, clock);
        let mut store = VersionStore::new(
            MemoryBlock::new(64),
            VersionLayout::default(),
            Version::new("1.0.0"),
        );
        store.write(&Version::new("2.0.0"));

        let check = check_for_update(&mut resolver, &mut store);

        assert!(check.is_available());
        assert_eq!(
            check,
            UpdateCheck::Available {
                current: Version::new("2.0.0"),
                release: ReleaseDescriptor {
                    version: Version::new("1.9.0"),
                    firmware_url: "https://github.com/ibnusina339/NALYTHA-Project/releases/download/v1.9.0/NAT-A-fw-1.9.0.bin".to_string(),
                    source: ReleaseSource::Feed,
                },
            }
        );
    }

    #[test]
    fn no_connectivity_means_no_update() {
        let (mut updater, flash, restart) =
            updater(FakeNetwork::down(), ScriptedTransport::new(Vec::new()), None);

        assert_eq!(updater.run_cycle(), CycleOutcome::Unresolvable);
        assert_eq!(updater.state(), UpdaterState::Suspended);
        assert!(flash.log().begun.is_empty());
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn up_to_date_skips_install() {
        let (mut updater, flash, _) =
            updater(FakeNetwork::up(), ScriptedTransport::new(vec![feed("v1.4.0")]), Some("1.4.0"));

        assert_eq!(
            updater.check_and_install(),
            CycleOutcome::UpToDate(Version::new("1.4.0"))
        );
        assert!(flash.log().begun.is_empty());
    }

    #[test]
    fn failed_install_suspends_with_old_version() {
        let transport = ScriptedTransport::new(vec![
            feed("v1.5.0"),
            Ok(ScriptedConnection::status(500)),
            Ok(ScriptedConnection::status(500)),
            Ok(ScriptedConnection::status(500)),
        ]);
        let (mut updater, _, restart) = updater(FakeNetwork::up(), transport, None);

        let outcome = updater.run_cycle();

        assert!(matches!(
            outcome,
            CycleOutcome::InstallFailed(InstallFailure { attempts: 3, last_error: OtaError::TransientFetchFailure(_) })
        ));
        assert_eq!(updater.state(), UpdaterState::Suspended);
        assert_eq!(updater.current_version().as_str(), "1.0.0");
        assert_eq!(restart.count(), 0);
    }

    #[test]
    fn available_update_installs_and_restarts() {
        let image = vec![0xA5_u8; 900];
        let transport = ScriptedTransport::new(vec![
            feed("v1.6.0"),
            Ok(ScriptedConnection::new(200, Some(900), vec![Step::Data(image.clone()), Step::Eof])),
        ]);
        let (mut updater, flash, restart) = updater(FakeNetwork::up(), transport.clone(), None);

        let outcome = catch_restart(|| updater.run_cycle());

        assert!(outcome.is_err());
        assert_eq!(restart.count(), 1);
        assert_eq!(transport.opened(), 2);
        assert_eq!(updater.state(), UpdaterState::Installing);
        assert_eq!(updater.current_version().as_str(), "1.6.0");
        assert_eq!(flash.log().written, image);
    }

    #[test]
    fn background_loop_waits_for_trigger() {
        let transport = ScriptedTransport::new(vec![feed("v1.0.0"), feed("v1.0.0")]);
        let (updater, _, _) = updater(FakeNetwork::up(), transport.clone(), None);
        let (handle, triggers) = trigger_channel();

        assert!(handle.resume());
        assert!(handle.resume());
        drop(handle);
        updater.run_background(triggers);

        // Initial cycle plus one for the coalesced pair of triggers.
        assert_eq!(transport.opened(), 2);
    }

    #[test]
    fn background_loop_stops_without_handles() {
        let transport = ScriptedTransport::new(vec![feed("v1.0.0")]);
        let (updater, _, _) = updater(FakeNetwork::up(), transport.clone(), None);
        let (handle, triggers) = trigger_channel();
        drop(handle);

        updater.run_background(triggers);

        assert_eq!(transport.opened(), 1);
    }
}
