//! User-facing error text.
//!
//! Production builds never show raw failure detail: status codes, field
//! names and parser output are replaced with one fixed phrase per error
//! category. Development builds show everything.

use crate::error::{ErrorCategory, UpdateError};
use crate::source::BuildMode;

const NETWORK_MESSAGE: &str = "Failed to fetch update information";
const PARSE_MESSAGE: &str = "Invalid update information";
const VALIDATION_MESSAGE: &str = "Update information is invalid";
const INTEGRITY_MESSAGE: &str = "The downloaded update could not be verified";
const INSTALLER_MESSAGE: &str = "The update could not be installed";
const FALLBACK_MESSAGE: &str = "Update failed";

/// Message to show for `error` in a build of the given mode.
pub fn sanitize(error: &UpdateError, mode: BuildMode) -> String {
    match mode {
        BuildMode::Development => error.to_string(),
        BuildMode::Production => message_for(error.category()).to_string(),
    }
}

/// Message to show for raw failure text from outside the engine.
///
/// Classifies by keyword using the same categories as [`sanitize`].
pub fn sanitize_message(raw: &str, mode: BuildMode) -> String {
    match mode {
        BuildMode::Development => raw.to_string(),
        BuildMode::Production => message_for(classify(raw)).to_string(),
    }
}

/// Production phrase for a category.
pub fn message_for(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Network => NETWORK_MESSAGE,
        ErrorCategory::Parse => PARSE_MESSAGE,
        ErrorCategory::Validation => VALIDATION_MESSAGE,
        ErrorCategory::Integrity => INTEGRITY_MESSAGE,
        ErrorCategory::Installer => INSTALLER_MESSAGE,
        ErrorCategory::Other => FALLBACK_MESSAGE,
    }
}

// Checked in order; first hit wins.
const KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (ErrorCategory::Integrity, &["sha256", "hash", "checksum", "digest"]),
    (
        ErrorCategory::Validation,
        &["signature", "validation", "invalid", "no artifact", "missing field", "unknown field"],
    ),
    (ErrorCategory::Parse, &["parse", "json", "syntax", "unexpected", "eof"]),
    (
        ErrorCategory::Installer,
        &["install", "mount", "hdiutil", "codesign", "permission denied"],
    ),
    (
        ErrorCategory::Network,
        &[
            "network", "fetch", "timed out", "timeout", "status", "connect", "dns", "redirect",
            "http", "tls", "econnrefused", "enotfound", "404", "403", "500", "502", "503",
        ],
    ),
];

fn classify(raw: &str) -> ErrorCategory {
    let lower = raw.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Other)
}
