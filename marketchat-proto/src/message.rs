//! Outgoing message drafts and their validation rules.
//!
//! Validation runs before any optimistic entry is created or any request is
//! issued, so a rejected draft never reaches the network.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Maximum allowed content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Maximum allowed attachment URL length in bytes.
pub const MAX_ATTACHMENT_URL_LEN: usize = 2048;

/// Text and/or attachment the user wants to send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    /// Message text, if any.
    pub content: Option<String>,
    /// URL produced by the image hosting service, if any.
    pub attachment_url: Option<String>,
}

impl Draft {
    /// A text-only draft.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            attachment_url: None,
        }
    }

    /// An attachment-only draft.
    pub fn attachment(url: impl Into<String>) -> Self {
        Self {
            content: None,
            attachment_url: Some(url.into()),
        }
    }

    /// Adds an attachment URL to this draft.
    #[must_use]
    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachment_url = Some(url.into());
        self
    }

    /// Trims surrounding whitespace and turns blank fields into `None`.
    #[must_use]
    pub fn normalized(self) -> Self {
        fn clean(field: Option<String>) -> Option<String> {
            field
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        }
        Self {
            content: clean(self.content),
            attachment_url: clean(self.attachment_url),
        }
    }

    /// Validates this draft for sending from `sender` to `receiver`.
    ///
    /// Expects a [`normalized`](Self::normalized) draft; blank fields are
    /// otherwise counted as present.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SelfMessage`] when `receiver == sender`,
    /// [`ValidationError::Empty`] when neither content nor attachment is
    /// present, and [`ValidationError::TooLarge`] /
    /// [`ValidationError::AttachmentUrlTooLong`] on size violations.
    pub fn validate(&self, sender: &UserId, receiver: &UserId) -> Result<(), ValidationError> {
        if sender == receiver {
            return Err(ValidationError::SelfMessage);
        }
        if self.content.is_none() && self.attachment_url.is_none() {
            return Err(ValidationError::Empty);
        }
        if let Some(content) = &self.content
            && content.len() > MAX_CONTENT_SIZE
        {
            return Err(ValidationError::TooLarge {
                size: content.len(),
                max: MAX_CONTENT_SIZE,
            });
        }
        if let Some(url) = &self.attachment_url
            && url.len() > MAX_ATTACHMENT_URL_LEN
        {
            return Err(ValidationError::AttachmentUrlTooLong {
                size: url.len(),
                max: MAX_ATTACHMENT_URL_LEN,
            });
        }
        Ok(())
    }
}

/// Error returned when a draft fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither content nor attachment is present.
    #[error("message has neither content nor attachment")]
    Empty,
    /// Content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Attachment URL exceeds the maximum allowed length.
    #[error("attachment url too long ({size} bytes, max {max} bytes)")]
    AttachmentUrlTooLong {
        /// Actual URL length in bytes.
        size: usize,
        /// Maximum allowed length in bytes.
        max: usize,
    },
    /// The receiver is the current user.
    #[error("cannot send a message to yourself")]
    SelfMessage,
}
