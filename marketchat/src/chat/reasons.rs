//! Human-readable failure reasons for the UI.
//!
//! The backend reports some failures as free-form text; known phrases are
//! mapped to friendlier wording, everything else gets a generic fallback.

use marketchat_proto::message::ValidationError;

use crate::api::ApiError;

/// Known backend phrases (lowercase) and what to show instead.
const KNOWN_REASONS: &[(&str, &str)] = &[
    (
        "conversation could not be started",
        "This conversation could not be started. Please try again later.",
    ),
    (
        "seller no longer available",
        "This seller is no longer available.",
    ),
    ("receiver not found", "This user could not be found."),
    (
        "cannot send a message to yourself",
        "You cannot send a message to yourself.",
    ),
    ("blocked", "You can no longer message this user."),
    ("listing removed", "This listing has been removed."),
];

const FALLBACK: &str = "Message could not be sent. Please retry.";

const LOAD_FALLBACK: &str = "Messages could not be loaded. Please refresh.";

/// Describe a failed send.
#[must_use]
pub fn describe(error: &ApiError) -> String {
    describe_with(error, FALLBACK)
}

/// Describe a failed conversation list or history fetch.
#[must_use]
pub fn describe_load(error: &ApiError) -> String {
    describe_with(error, LOAD_FALLBACK)
}

fn describe_with(error: &ApiError, fallback: &str) -> String {
    if let Some(known) = error.server_message().and_then(lookup) {
        return known.to_string();
    }
    match error {
        ApiError::Timeout => "The server did not answer in time. Please retry.".into(),
        ApiError::Network(_) => "No connection. Check your network and retry.".into(),
        ApiError::NoCredential => "You are signed out.".into(),
        ApiError::Status { status: 401, .. } => {
            "Your session has expired. Please sign in again.".into()
        }
        ApiError::Status { status, .. } if *status >= 500 => {
            "The server is having trouble. Please retry shortly.".into()
        }
        ApiError::Status { .. } | ApiError::Decode(_) | ApiError::Config(_) => fallback.into(),
    }
}

/// Describe free-form backend error text.
#[must_use]
pub fn describe_message(message: &str) -> String {
    lookup(message).unwrap_or(FALLBACK).to_string()
}

/// Describe a draft that failed local validation.
#[must_use]
pub fn describe_validation(error: &ValidationError) -> String {
    match error {
        ValidationError::Empty => "Type a message or attach a file.".into(),
        ValidationError::TooLarge { max, .. } => {
            format!("Message is too long (max {} KB).", max / 1024)
        }
        ValidationError::AttachmentUrlTooLong { .. } => "Attachment link is too long.".into(),
        ValidationError::SelfMessage => "You cannot send a message to yourself.".into(),
    }
}

fn lookup(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    KNOWN_REASONS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, text)| *text)
}
