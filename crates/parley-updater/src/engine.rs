//! The update engine event loop.
//!
//! One task owns the [`UpdateMachine`]. It reacts to application requests,
//! the periodic check timer, and completions reported by the work it spawns,
//! one at a time. Manifest fetches and downloads run as tokio tasks; hashing,
//! staging and mounting run on the blocking pool. Nothing is cancelled once
//! started.
//!
//! A staged [`ExitInstaller`] is kept until a newer verified release replaces
//! it; a failed re-check does not drop it. Timer checks pause while one is
//! staged. When the loop ends it hands back a [`Shutdown`] carrying the staged
//! installer, if any. That is the only way an update gets installed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use semver::Version;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::cache::ArtifactCache;
use crate::config::UpdaterSettings;
use crate::error::UpdateError;
use crate::install::{
    ArtifactInstaller, DiskImageMounter, ExitInstaller, HostCommands, HostLayout, InstallStrategy,
    SystemCommands,
};
use crate::machine::{Effect, Event, StateSink, UpdateMachine, UpdateState};
use crate::manifest::{ManifestVerifier, VerifiedRelease};
use crate::source::{PublisherIdentity, ProcessEnv, SourceConfig, SourceResolver};
use crate::transport::{HttpTransport, ReleaseTransport};

/// What the application can ask of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Start a check now
    CheckNow,
    /// Download the available update
    DownloadUpdate,
    /// Quit so the staged update installs, then relaunch
    RestartToUpdate,
    /// Stop the engine; a staged update still installs at exit
    Shutdown,
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The user asked to restart into the update
    Restart,
    /// The application is quitting or dropped its request channel
    Quit,
}

/// Handed back when the engine stops.
#[derive(Debug)]
#[must_use = "a staged update is only installed by Shutdown::finish"]
pub struct Shutdown {
    pub reason: ShutdownReason,
    pub installer: Option<ExitInstaller>,
}

impl Shutdown {
    /// Install the staged update, if any. Call right before the process exits.
    pub fn finish(self) -> Result<(), UpdateError> {
        match self.installer {
            Some(installer) => installer.run(self.reason == ShutdownReason::Restart),
            None => Ok(()),
        }
    }
}

/// Values compiled into the application.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Version of the running build
    pub current_version: Version,
    /// Pinned manifest signing key
    pub public_key: VerifyingKey,
    /// Where production releases are published
    pub publisher: PublisherIdentity,
}

/// Completion reports from spawned work.
enum Outcome {
    Event(Event),
    Staged(ExitInstaller),
}

type Outcomes = mpsc::UnboundedSender<Outcome>;

/// Drives update checks, downloads and installs.
pub struct UpdateEngine {
    machine: UpdateMachine,
    resolver: SourceResolver,
    verifier: ManifestVerifier,
    transport: Arc<dyn ReleaseTransport>,
    installer: Arc<ArtifactInstaller>,
    sink: Arc<dyn StateSink>,
    current_version: Version,
    auto_update: bool,
    check_interval: Duration,
    staged: Option<ExitInstaller>,
}

impl UpdateEngine {
    /// Assemble an engine from its parts. The build mode, and with it error
    /// sanitizing, follows `source`.
    pub fn new(
        config: EngineConfig,
        settings: &UpdaterSettings,
        source: SourceConfig,
        transport: Arc<dyn ReleaseTransport>,
        installer: ArtifactInstaller,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        let verifier = ManifestVerifier::new(config.public_key, installer.platform(), installer.package())
            .with_prerelease(source.allow_prerelease());

        tracing::info!(
            version = %config.current_version,
            mode = ?source.mode(),
            strategy = ?installer.strategy(),
            package = %installer.package(),
            "Update engine initialized"
        );

        Self {
            machine: UpdateMachine::new(source.mode(), settings.auto_update),
            resolver: SourceResolver::new(config.publisher, source),
            verifier,
            transport,
            installer: Arc::new(installer),
            sink,
            current_version: config.current_version,
            auto_update: settings.auto_update,
            check_interval: settings.check_interval(),
            staged: None,
        }
    }

    /// Build an engine for the running process with the real network,
    /// filesystem and system tools.
    pub fn for_host(
        config: EngineConfig,
        settings: &UpdaterSettings,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self, UpdateError> {
        let env = ProcessEnv;
        let source = SourceConfig::resolve(settings, &env);
        let transport = Arc::new(HttpTransport::new(&settings.network)?);

        let commands: Arc<dyn SystemCommands> = Arc::new(HostCommands);
        let layout = HostLayout::detect(&env)?;
        let strategy = InstallStrategy::detect(&layout, commands.as_ref());
        let installer = ArtifactInstaller::new(
            strategy,
            layout,
            ArtifactCache::new(settings.cache_dir()),
            DiskImageMounter::new(DiskImageMounter::default_root(), commands.clone()),
            commands,
        );

        Ok(Self::new(config, settings, source, transport, installer, sink))
    }

    pub fn state(&self) -> &UpdateState {
        self.machine.state()
    }

    /// Run until a shutdown or restart request, or until `requests` closes.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) -> Shutdown {
        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();

        let installer = self.installer.clone();
        match tokio::task::spawn_blocking(move || installer.startup_cleanup()).await {
            Ok(report) => tracing::info!(purged = report.purged, detached = report.detached, "Startup cleanup done"),
            Err(e) => tracing::warn!(error = %e, "Startup cleanup panicked"),
        }

        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.auto_update {
            self.dispatch(Event::CheckRequested, &outcomes_tx);
        }

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::CheckNow) => self.dispatch(Event::CheckRequested, &outcomes_tx),
                    Some(Request::DownloadUpdate) => self.dispatch(Event::DownloadRequested, &outcomes_tx),
                    Some(Request::RestartToUpdate) => {
                        if self.staged.is_some() {
                            tracing::info!("Restarting to install update");
                            return self.shutdown(ShutdownReason::Restart);
                        }
                        tracing::debug!(phase = %self.machine.state().phase, "Restart requested with nothing staged");
                    }
                    Some(Request::Shutdown) | None => return self.shutdown(ShutdownReason::Quit),
                },
                Some(outcome) = outcomes.recv() => match outcome {
                    Outcome::Event(event) => self.dispatch(event, &outcomes_tx),
                    Outcome::Staged(installer) => {
                        self.staged = Some(installer);
                        self.dispatch(Event::Verified, &outcomes_tx);
                    }
                },
                _ = ticker.tick(), if self.auto_update => {
                    if self.staged.is_some() {
                        tracing::debug!("Update already staged, skipping periodic check");
                    } else {
                        tracing::debug!("Periodic update check");
                        self.dispatch(Event::CheckRequested, &outcomes_tx);
                    }
                }
            }
        }
    }

    fn shutdown(&mut self, reason: ShutdownReason) -> Shutdown {
        Shutdown {
            reason,
            installer: self.staged.take(),
        }
    }

    /// Apply `event` and every follow-up event it produces.
    fn dispatch(&mut self, event: Event, outcomes: &Outcomes) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let effects = match self.machine.apply(event, self.sink.as_ref()) {
                Ok(effects) => effects,
                Err(rejected) => {
                    tracing::debug!(%rejected, "Ignoring event");
                    continue;
                }
            };
            for effect in effects {
                match effect {
                    Effect::Dispatch(follow_up) => queue.push_back(follow_up),
                    other => self.execute(other, outcomes),
                }
            }
        }
    }

    fn execute(&mut self, effect: Effect, outcomes: &Outcomes) {
        match effect {
            Effect::FetchManifest => self.fetch_manifest(outcomes),
            Effect::Download(release) => self.download(release, outcomes),
            Effect::Stage { path, release } => {
                let installer = self.installer.clone();
                let tx = outcomes.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || installer.stage(&path, &release))
                        .await
                        .map_err(join_error)
                        .and_then(|r| r);
                    let _ = tx.send(match result {
                        Ok(staged) => Outcome::Staged(staged),
                        Err(e) => Outcome::Event(Event::Failed(e)),
                    });
                });
            }
            Effect::Mount { path, release } => {
                let installer = self.installer.clone();
                let tx = outcomes.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || installer.mount(&path, &release))
                        .await
                        .map_err(join_error)
                        .and_then(|r| r);
                    let _ = tx.send(Outcome::Event(match result {
                        Ok(mount_point) => Event::Mounted { mount_point },
                        Err(e) => Event::Failed(e),
                    }));
                });
            }
            Effect::Dispatch(event) => self.dispatch(event, outcomes),
        }
    }

    fn fetch_manifest(&self, outcomes: &Outcomes) {
        let location = match self.resolver.manifest_location() {
            Ok(url) => url,
            Err(e) => {
                let _ = outcomes.send(Outcome::Event(Event::Failed(e)));
                return;
            }
        };

        // Only a release newer than the staged one is worth downloading
        let staged = self.staged.as_ref().map(|s| s.version().clone());
        let baseline = staged.clone().unwrap_or_else(|| self.current_version.clone());

        let transport = self.transport.clone();
        let verifier = self.verifier.clone();
        let tx = outcomes.clone();
        tokio::spawn(async move {
            tracing::info!(url = %location, "Checking for updates");
            let result = match transport.fetch(&location).await {
                Ok(bytes) => verifier.verify(&bytes, &baseline),
                Err(e) => Err(e),
            };
            let _ = tx.send(Outcome::Event(match (result, staged) {
                (Ok(release), _) => Event::ManifestAccepted(release),
                (Err(e), Some(version)) if e.is_no_update() => Event::AlreadyStaged { version },
                (Err(e), _) => Event::Failed(e),
            }));
        });
    }

    fn download(&self, release: VerifiedRelease, outcomes: &Outcomes) {
        let location = match self.resolver.artifact_location(&release.version, &release.artifact) {
            Ok(url) => url,
            Err(e) => {
                let _ = outcomes.send(Outcome::Event(Event::Failed(e)));
                return;
            }
        };

        let transport = self.transport.clone();
        let installer = self.installer.clone();
        let tx = outcomes.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let downloaded = installer
                .download(transport.as_ref(), &location, &release, move |p| {
                    let _ = progress_tx.send(Outcome::Event(Event::Progress(p)));
                })
                .await;

            let path = match downloaded {
                Ok(path) => path,
                Err(e) => {
                    let _ = tx.send(Outcome::Event(Event::Failed(e)));
                    return;
                }
            };

            let event = match installer.strategy() {
                InstallStrategy::Native => Event::DownloadFinished { path },
                InstallStrategy::ManualDiskImage => {
                    // Hash before the image goes anywhere near hdiutil
                    let verifier = installer.clone();
                    let image = path.clone();
                    let checked = tokio::task::spawn_blocking(move || verifier.verify(&image, &release))
                        .await
                        .map_err(join_error)
                        .and_then(|r| r);
                    match checked {
                        Ok(()) => Event::ImageVerified { path },
                        Err(e) => Event::Failed(e),
                    }
                }
            };
            let _ = tx.send(Outcome::Event(event));
        });
    }
}

fn join_error(err: JoinError) -> UpdateError {
    UpdateError::IoError(std::io::Error::other(format!("background task failed: {err}")))
}
