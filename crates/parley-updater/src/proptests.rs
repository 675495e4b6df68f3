//! Property-based tests for parley-updater.
//!
//! These tests use proptest to check the engine's safety properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - No downgrade: a manifest never applies unless strictly newer
//! - Signature sensitivity: any change to signed bytes is rejected
//! - Hash determinism
//! - No stuck checking: every error leaves the `checking` phase
//! - Exactly-once publishing: one state per accepted event, none otherwise
//! - Production isolation: overrides never reach a production resolver

#![cfg(test)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::prelude::*;
use chrono::{TimeZone, Utc};
use ed25519_dalek::SigningKey;
use proptest::prelude::*;
use semver::Version;

use crate::config::UpdaterSettings;
use crate::error::UpdateError;
use crate::hash;
use crate::machine::{Event, Phase, StateSink, UpdateMachine, UpdateState};
use crate::manifest::{Artifact, ManifestVerifier, PackageType, Platform, ReleaseManifest, VerifiedRelease};
use crate::progress::Progress;
use crate::source::{
    BuildMode, PublisherIdentity, SourceConfig, SourceResolver, ENV_ALLOW_PRERELEASE, ENV_UPDATE_SOURCE,
};

const PUBLISHER: PublisherIdentity = PublisherIdentity::new("github.com", "parley-chat", "parley");
const PRODUCTION_MANIFEST: &str =
    "https://github.com/parley-chat/parley/releases/latest/download/manifest.json";

// =============================================================================
// Generators
// =============================================================================

/// Generate a random Ed25519 signing key from 32 random bytes.
fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

/// Generate a random release version.
fn arb_version() -> impl Strategy<Value = Version> {
    (0u64..50, 0u64..50, 0u64..50).prop_map(|(major, minor, patch)| Version::new(major, minor, patch))
}

/// Generate random artifact content (1 byte to 4KB).
fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

fn arb_artifact() -> impl Strategy<Value = Artifact> {
    ("[A-Za-z0-9_-]{1,24}", arb_content()).prop_map(|(stem, content)| Artifact {
        url: format!("{stem}.dmg"),
        sha256: hash::digest(&content),
        platform: Platform::Darwin,
        package: PackageType::DiskImage,
    })
}

/// Generate an arbitrary engine error.
fn arb_error() -> impl Strategy<Value = UpdateError> {
    prop_oneof![
        (".*", ".*").prop_map(|(url, reason)| UpdateError::TransportFailure { url, reason }),
        (".*", any::<u16>()).prop_map(|(url, status)| UpdateError::HttpStatus { url, status }),
        (".*", any::<usize>()).prop_map(|(url, hops)| UpdateError::TooManyRedirects { url, hops }),
        ".*".prop_map(|m| UpdateError::syntax(m)),
        ".*".prop_map(|m| UpdateError::structure(m)),
        ".*".prop_map(UpdateError::SignatureInvalid),
        (arb_version(), arb_version())
            .prop_map(|(current, candidate)| UpdateError::NotNewer { current, candidate }),
        (".*", ".*").prop_map(|(platform, package)| UpdateError::NoMatchingArtifact { platform, package }),
        (".*", ".*").prop_map(|(expected, actual)| UpdateError::HashMismatch { expected, actual }),
        ".*".prop_map(UpdateError::InstallerPrecondition),
        ".*".prop_map(UpdateError::InstallationFailed),
        ".*".prop_map(UpdateError::ConfigError),
        ".*".prop_map(|m| UpdateError::IoError(std::io::Error::other(m))),
    ]
}

/// Event kinds, instantiated fresh for each application.
#[derive(Debug, Clone, Copy)]
enum EventKind {
    Check,
    Accept,
    Download,
    Progress(u64),
    Finished,
    Started,
    Verified,
    ImageVerified,
    Mounted,
    AlreadyStaged,
    Fail,
    NoUpdate,
}

fn arb_event_kind() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        Just(EventKind::Check),
        Just(EventKind::Accept),
        Just(EventKind::Download),
        (0u64..1000).prop_map(EventKind::Progress),
        Just(EventKind::Finished),
        Just(EventKind::Started),
        Just(EventKind::Verified),
        Just(EventKind::ImageVerified),
        Just(EventKind::Mounted),
        Just(EventKind::AlreadyStaged),
        Just(EventKind::Fail),
        Just(EventKind::NoUpdate),
    ]
}

fn release() -> VerifiedRelease {
    VerifiedRelease {
        version: Version::new(9, 0, 0),
        artifact: Artifact {
            url: "Parley.dmg".to_string(),
            sha256: hash::digest(b"image"),
            platform: Platform::Darwin,
            package: PackageType::DiskImage,
        },
    }
}

fn event(kind: EventKind) -> Event {
    match kind {
        EventKind::Check => Event::CheckRequested,
        EventKind::Accept => Event::ManifestAccepted(release()),
        EventKind::Download => Event::DownloadRequested,
        EventKind::Progress(n) => Event::Progress(Progress {
            percent: n as f64 / 10.0,
            transferred: n,
            total: Some(1000),
            bytes_per_second: 0,
        }),
        EventKind::Finished => Event::DownloadFinished { path: "/cache/a".into() },
        EventKind::Started => Event::VerificationStarted { path: "/cache/a".into() },
        EventKind::Verified => Event::Verified,
        EventKind::ImageVerified => Event::ImageVerified { path: "/cache/a".into() },
        EventKind::Mounted => Event::Mounted { mount_point: "/mnt/a".into() },
        EventKind::AlreadyStaged => Event::AlreadyStaged { version: Version::new(9, 0, 0) },
        EventKind::Fail => Event::Failed(UpdateError::transport("u", "reset")),
        EventKind::NoUpdate => Event::Failed(UpdateError::NotNewer {
            current: Version::new(9, 0, 0),
            candidate: Version::new(9, 0, 0),
        }),
    }
}

fn signed(key: &SigningKey, version: &Version, artifacts: Vec<Artifact>) -> ReleaseManifest {
    let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    ReleaseManifest::sign(key, version, artifacts, created_at).unwrap()
}

fn verifier(key: &SigningKey) -> ManifestVerifier {
    ManifestVerifier::new(key.verifying_key(), Platform::Darwin, PackageType::DiskImage)
}

#[derive(Default)]
struct CountingSink(AtomicUsize);

impl StateSink for CountingSink {
    fn publish(&self, _state: &UpdateState) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// No downgrade
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A manifest whose version is not strictly greater is never applicable.
    #[test]
    fn prop_no_downgrade(
        key in arb_signing_key(),
        candidate in arb_version(),
        current in arb_version(),
        artifact in arb_artifact(),
    ) {
        let manifest = signed(&key, &candidate, vec![artifact]);
        let data = serde_json::to_vec(&manifest).unwrap();

        let result = verifier(&key).verify(&data, &current);
        if candidate > current {
            prop_assert_eq!(result.unwrap().version, candidate);
        } else {
            let is_not_newer = matches!(result, Err(UpdateError::NotNewer { .. }));
            prop_assert!(is_not_newer);
        }
    }
}

// =============================================================================
// Signature sensitivity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Flipping any bit of the signature is detected.
    #[test]
    fn prop_signature_bit_flip_rejected(
        key in arb_signing_key(),
        artifact in arb_artifact(),
        index in 0usize..64,
        bit in 0u8..8,
    ) {
        let mut manifest = signed(&key, &Version::new(2, 0, 0), vec![artifact]);
        let mut sig = BASE64_STANDARD.decode(&manifest.signature).unwrap();
        sig[index] ^= 1 << bit;
        manifest.signature = BASE64_STANDARD.encode(sig);
        let data = serde_json::to_vec(&manifest).unwrap();

        let result = verifier(&key).verify(&data, &Version::new(1, 0, 0));
        let rejected = matches!(result, Err(UpdateError::SignatureInvalid(_)));
        prop_assert!(rejected);
    }

    /// Changing any single character of a signed field is detected.
    #[test]
    fn prop_signed_field_change_rejected(
        key in arb_signing_key(),
        artifact in arb_artifact(),
        field in 0usize..4,
        position in any::<prop::sample::Index>(),
        replacement in "[0-9a-z.:-]",
    ) {
        let mut manifest = signed(&key, &Version::new(2, 0, 0), vec![artifact]);
        let target = match field {
            0 => &mut manifest.version,
            1 => &mut manifest.created_at,
            2 => &mut manifest.artifacts[0].sha256,
            _ => &mut manifest.artifacts[0].url,
        };
        let i = position.index(target.len());
        let original = &target[i..i + 1];
        let replacement = if replacement == original {
            if original == "0" { "1".to_string() } else { "0".to_string() }
        } else {
            replacement
        };
        target.replace_range(i..i + 1, &replacement);
        let data = serde_json::to_vec(&manifest).unwrap();

        let result = verifier(&key).verify(&data, &Version::new(1, 0, 0));
        let rejected = matches!(result, Err(UpdateError::SignatureInvalid(_)));
        prop_assert!(rejected, "got {:?}", result);
    }

    /// A manifest signed by any other key is rejected.
    #[test]
    fn prop_foreign_key_rejected(
        key in arb_signing_key(),
        other in arb_signing_key(),
        artifact in arb_artifact(),
    ) {
        prop_assume!(key.to_bytes() != other.to_bytes());
        let manifest = signed(&other, &Version::new(2, 0, 0), vec![artifact]);
        let data = serde_json::to_vec(&manifest).unwrap();

        let result = verifier(&key).verify(&data, &Version::new(1, 0, 0));
        let rejected = matches!(result, Err(UpdateError::SignatureInvalid(_)));
        prop_assert!(rejected);
    }
}

// =============================================================================
// Hash determinism
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_digest_deterministic(content in arb_content()) {
        let a = hash::digest(&content);
        let b = hash::digest_reader(std::io::Cursor::new(&content)).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert!(hash::is_digest_hex(&a));
        prop_assert!(hash::matches(&a, &a.to_uppercase()));
    }

    #[test]
    fn prop_digest_detects_change(content in arb_content(), index in any::<prop::sample::Index>()) {
        let mut changed = content.clone();
        let i = index.index(changed.len());
        changed[i] = changed[i].wrapping_add(1);
        prop_assert!(!hash::matches(&hash::digest(&content), &hash::digest(&changed)));
    }
}

// =============================================================================
// State machine
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The machine never stays in `checking` after an error.
    #[test]
    fn prop_no_stuck_checking(error in arb_error(), mode in prop_oneof![Just(BuildMode::Development), Just(BuildMode::Production)]) {
        let sink = CountingSink::default();
        let mut machine = UpdateMachine::new(mode, true);
        machine.apply(Event::CheckRequested, &sink).unwrap();

        let no_update = error.is_no_update();
        machine.apply(Event::Failed(error), &sink).unwrap();

        let phase = machine.state().phase;
        prop_assert_ne!(phase, Phase::Checking);
        if no_update {
            prop_assert_eq!(phase, Phase::Idle);
        } else {
            prop_assert_eq!(phase, Phase::Failed);
            prop_assert!(machine.state().detail.is_some());
        }
    }

    /// Exactly one publish per accepted event; rejected events change nothing.
    #[test]
    fn prop_exactly_once_publish(kinds in prop::collection::vec(arb_event_kind(), 0..40)) {
        let sink = CountingSink::default();
        let mut machine = UpdateMachine::new(BuildMode::Production, false);
        let mut accepted = 0usize;

        for kind in kinds {
            let before = machine.state().clone();
            match machine.apply(event(kind), &sink) {
                Ok(_) => accepted += 1,
                Err(_) => prop_assert_eq!(machine.state(), &before),
            }
            prop_assert_eq!(sink.0.load(Ordering::SeqCst), accepted);
        }
    }

    /// Progress snapshots never go backwards within one transfer.
    #[test]
    fn prop_progress_monotonic(steps in prop::collection::vec(0u64..1000, 1..30)) {
        let sink = CountingSink::default();
        let mut machine = UpdateMachine::new(BuildMode::Production, true);
        machine.apply(Event::CheckRequested, &sink).unwrap();
        machine.apply(Event::ManifestAccepted(release()), &sink).unwrap();
        machine.apply(Event::DownloadRequested, &sink).unwrap();

        let mut last = 0u64;
        for n in steps {
            machine.apply(event(EventKind::Progress(n)), &sink).unwrap();
            let transferred = machine.state().progress.unwrap().transferred;
            prop_assert!(transferred >= last);
            last = transferred;
        }
    }
}

// =============================================================================
// Production isolation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// No settings value or environment variable moves a production build
    /// off the publisher's location.
    #[test]
    fn prop_production_isolation(
        settings_override in proptest::option::of(".*"),
        env_override in proptest::option::of(".*"),
        env_prerelease in proptest::option::of(".*"),
        allow_prerelease in any::<bool>(),
    ) {
        let settings = UpdaterSettings {
            dev_override_source: settings_override,
            allow_prerelease,
            ..UpdaterSettings::default()
        };
        let mut env = HashMap::new();
        if let Some(v) = env_override {
            env.insert(ENV_UPDATE_SOURCE.to_string(), v);
        }
        if let Some(v) = env_prerelease {
            env.insert(ENV_ALLOW_PRERELEASE.to_string(), v);
        }

        let config = SourceConfig::resolve_as(BuildMode::Production, &settings, &env);
        prop_assert!(config.dev_override_source().is_none());
        prop_assert!(!config.allow_prerelease());

        let resolver = SourceResolver::new(PUBLISHER, config);
        let location = resolver.manifest_location().unwrap();
        prop_assert_eq!(location.as_str(), PRODUCTION_MANIFEST);
    }

    /// Plausible URLs are honored in development builds.
    #[test]
    fn prop_development_accepts_urls(host in "[a-z]{1,12}", port in 1024u16..65535) {
        let source = format!("http://{host}.test:{port}/releases");
        let mut env = HashMap::new();
        env.insert(ENV_UPDATE_SOURCE.to_string(), source.clone());

        let config = SourceConfig::resolve_as(BuildMode::Development, &UpdaterSettings::default(), &env);
        let resolver = SourceResolver::new(PUBLISHER, config);
        let location = resolver.manifest_location().unwrap();
        prop_assert_eq!(location.as_str(), format!("{source}/manifest.json"));
    }
}
