//! Update lifecycle state machine.
//!
//! [`UpdateMachine::transition`] is a pure function of the current state and
//! one [`Event`]; it returns the next state plus the [`Effect`]s the engine
//! should run. [`UpdateMachine::apply`] commits an accepted transition and
//! publishes the new state exactly once. Rejected events change nothing and
//! publish nothing.
//!
//! ```text
//! idle ─┬─> checking ─┬─> available ─> downloading ─┬─> downloaded ─> verifying ─> ready
//!       │             ├─> idle (no update)          └─> mounting ─> mounted
//!       │             └─> ready (nothing newer than the staged update)
//!       └── any error ──> failed
//! ```

use std::path::PathBuf;

use semver::Version;
use serde::Serialize;
use thiserror::Error;

use crate::error::UpdateError;
use crate::manifest::VerifiedRelease;
use crate::progress::Progress;
use crate::sanitize;
use crate::source::BuildMode;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Checking,
    Available,
    Downloading,
    Downloaded,
    Verifying,
    Ready,
    Mounting,
    Mounted,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Verifying => "verifying",
            Self::Ready => "ready",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::Failed => "failed",
        }
    }

    /// No event leaves this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Mounted)
    }

    /// Whether a new check may start from this phase.
    pub fn accepts_check(&self) -> bool {
        matches!(self, Self::Idle | Self::Available | Self::Ready | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to the application on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    pub phase: Phase,
    /// Target version once known
    pub version: Option<Version>,
    /// Sanitized message, set in `failed`
    pub detail: Option<String>,
    /// Present only while a transfer is running
    pub progress: Option<Progress>,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            version: None,
            detail: None,
            progress: None,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum Event {
    /// User or timer asked for a check
    CheckRequested,
    /// Manifest verified and applicable
    ManifestAccepted(VerifiedRelease),
    /// User (or auto-update) asked for the download
    DownloadRequested,
    /// Transfer advanced
    Progress(Progress),
    /// Native artifact fully written to the cache
    DownloadFinished { path: PathBuf },
    /// Hash and precondition checks began
    VerificationStarted { path: PathBuf },
    /// Native artifact verified and staged for exit
    Verified,
    /// Disk image fully written and its hash matched
    ImageVerified { path: PathBuf },
    /// Disk image attached
    Mounted { mount_point: PathBuf },
    /// Nothing newer than the update already staged for exit
    AlreadyStaged { version: Version },
    /// A step failed. `NotNewer` while checking means "no update".
    Failed(UpdateError),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckRequested => "check-requested",
            Self::ManifestAccepted(_) => "manifest-accepted",
            Self::DownloadRequested => "download-requested",
            Self::Progress(_) => "progress",
            Self::DownloadFinished { .. } => "download-finished",
            Self::VerificationStarted { .. } => "verification-started",
            Self::Verified => "verified",
            Self::ImageVerified { .. } => "image-verified",
            Self::Mounted { .. } => "mounted",
            Self::AlreadyStaged { .. } => "already-staged",
            Self::Failed(_) => "failed",
        }
    }
}

/// Work the engine performs after a transition.
#[derive(Debug)]
pub enum Effect {
    /// Resolve, fetch and verify the manifest
    FetchManifest,
    /// Download the selected artifact
    Download(VerifiedRelease),
    /// Verify a native artifact and stage its exit installer
    Stage { path: PathBuf, release: VerifiedRelease },
    /// Mount a verified disk image
    Mount { path: PathBuf, release: VerifiedRelease },
    /// Feed a follow-up event straight back into the machine
    Dispatch(Event),
}

/// An event that is not valid in the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} is not accepted while {phase}")]
pub struct Rejected {
    pub phase: Phase,
    pub event: &'static str,
}

/// Receives every committed state.
pub trait StateSink: Send + Sync {
    fn publish(&self, state: &UpdateState);
}

impl StateSink for tokio::sync::broadcast::Sender<UpdateState> {
    fn publish(&self, state: &UpdateState) {
        // No subscribers is fine
        let _ = self.send(state.clone());
    }
}

impl StateSink for tokio::sync::mpsc::UnboundedSender<UpdateState> {
    fn publish(&self, state: &UpdateState) {
        let _ = self.send(state.clone());
    }
}

impl StateSink for tokio::sync::watch::Sender<UpdateState> {
    fn publish(&self, state: &UpdateState) {
        self.send_replace(state.clone());
    }
}

/// Result of an accepted transition.
#[derive(Debug)]
pub struct Step {
    pub state: UpdateState,
    pub release: Option<VerifiedRelease>,
    pub effects: Vec<Effect>,
}

/// Owns the [`UpdateState`]; the only writer of it.
#[derive(Debug, Clone)]
pub struct UpdateMachine {
    state: UpdateState,
    release: Option<VerifiedRelease>,
    mode: BuildMode,
    auto_download: bool,
}

impl UpdateMachine {
    pub fn new(mode: BuildMode, auto_download: bool) -> Self {
        Self {
            state: UpdateState::default(),
            release: None,
            mode,
            auto_download,
        }
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    /// Release being worked on, once a manifest was accepted.
    pub fn release(&self) -> Option<&VerifiedRelease> {
        self.release.as_ref()
    }

    /// Commit `event` and publish the new state to `sink`.
    pub fn apply(&mut self, event: Event, sink: &dyn StateSink) -> Result<Vec<Effect>, Rejected> {
        let from = self.state.phase;
        let step = self.transition(event)?;
        self.state = step.state;
        self.release = step.release;

        if from != self.state.phase {
            tracing::debug!(from = %from, to = %self.state.phase, "Update phase changed");
        }
        sink.publish(&self.state);
        Ok(step.effects)
    }

    /// Compute the outcome of `event` without changing anything.
    pub fn transition(&self, event: Event) -> Result<Step, Rejected> {
        use Phase::*;

        let phase = self.state.phase;
        let rejected = |event: &Event| Rejected {
            phase,
            event: event.name(),
        };
        let mut next = self.state.clone();
        let mut release = self.release.clone();
        let mut effects = Vec::new();

        match event {
            Event::CheckRequested if phase.accepts_check() => {
                next = UpdateState {
                    phase: Checking,
                    ..UpdateState::default()
                };
                release = None;
                effects.push(Effect::FetchManifest);
            }
            Event::ManifestAccepted(verified) if phase == Checking => {
                next.phase = Available;
                next.version = Some(verified.version.clone());
                next.detail = None;
                release = Some(verified);
                if self.auto_download {
                    effects.push(Effect::Dispatch(Event::DownloadRequested));
                }
            }
            Event::DownloadRequested if phase == Available => match &release {
                Some(r) => {
                    next.phase = Downloading;
                    next.progress = None;
                    effects.push(Effect::Download(r.clone()));
                }
                None => return Err(rejected(&Event::DownloadRequested)),
            },
            Event::Progress(progress) if phase == Downloading => {
                next.progress = Some(progress.monotonic_after(self.state.progress.as_ref()));
            }
            Event::DownloadFinished { path } if phase == Downloading => {
                next.phase = Downloaded;
                next.progress = None;
                effects.push(Effect::Dispatch(Event::VerificationStarted { path }));
            }
            Event::VerificationStarted { path } if phase == Downloaded => match &release {
                Some(r) => {
                    next.phase = Verifying;
                    effects.push(Effect::Stage {
                        path,
                        release: r.clone(),
                    });
                }
                None => return Err(rejected(&Event::VerificationStarted { path })),
            },
            Event::Verified if phase == Verifying => {
                next.phase = Ready;
            }
            Event::ImageVerified { path } if phase == Downloading => match &release {
                Some(r) => {
                    next.phase = Mounting;
                    next.progress = None;
                    effects.push(Effect::Mount {
                        path,
                        release: r.clone(),
                    });
                }
                None => return Err(rejected(&Event::ImageVerified { path })),
            },
            Event::Mounted { .. } if phase == Mounting => {
                next.phase = Mounted;
            }
            Event::AlreadyStaged { version } if phase == Checking => {
                next = UpdateState {
                    phase: Ready,
                    version: Some(version),
                    ..UpdateState::default()
                };
                release = None;
            }
            Event::Failed(error) if phase == Checking && error.is_no_update() => {
                tracing::info!(reason = %error, "No update available");
                next = UpdateState::default();
                release = None;
            }
            Event::Failed(error) if !phase.is_terminal() => {
                tracing::error!(phase = %phase, error = %error, "Update cycle failed");
                next.phase = Failed;
                next.progress = None;
                next.detail = Some(sanitize::sanitize(&error, self.mode));
                release = None;
            }
            other => return Err(rejected(&other)),
        }

        Ok(Step {
            state: next,
            release,
            effects,
        })
    }
}
