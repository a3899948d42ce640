//! User-facing notices for errors nobody handled.

use switchboard_protocol::{ApiError, ErrorCode};

pub const DEFAULT_ACCESS_DENIED: &str =
    "Unable to complete the requested action due to insufficient access";

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// `authn` failure on a session that should be valid; the user must log in again.
    SessionInvalid,
    /// No non-idle request within the logout window.
    SessionExpired,
    AccessDenied { message: String },
    RemoteException { code: String, message: String },
    BootstrapFailed { reason: String },
}

/// Sink for notices. The client never blocks on it.
pub trait ErrorSurface: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Default surface: log through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSurface;

impl ErrorSurface for TracingSurface {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::SessionInvalid => tracing::warn!("session is no longer valid, login required"),
            Notice::SessionExpired => tracing::warn!("session expired after inactivity"),
            Notice::AccessDenied { message } => tracing::warn!("access denied: {message}"),
            Notice::RemoteException { code, message } => {
                tracing::error!(code = %code, "remote exception: {message}")
            }
            Notice::BootstrapFailed { reason } => {
                tracing::error!("failed to load bootstrap zone: {reason}")
            }
        }
    }
}

/// Map an unhandled error to the notice shown for it.
pub fn classify(err: &ApiError, authenticated: bool) -> Notice {
    match err.code {
        ErrorCode::Authn if authenticated => Notice::SessionInvalid,
        ErrorCode::Authn | ErrorCode::Authz => {
            let message = strip_access_denied(&err.message);
            Notice::AccessDenied {
                message: if message.is_empty() {
                    DEFAULT_ACCESS_DENIED.to_string()
                } else {
                    message
                },
            }
        }
        _ => Notice::RemoteException {
            code: err.code.to_string(),
            message: err.message.clone(),
        },
    }
}

/// Remove the first "access denied", an optional dash and surrounding
/// whitespace, case-insensitively.
fn strip_access_denied(message: &str) -> String {
    const NEEDLE: &[u8] = b"access denied";
    let bytes = message.as_bytes();
    let Some(start) = bytes
        .windows(NEEDLE.len())
        .position(|w| w.eq_ignore_ascii_case(NEEDLE))
    else {
        return message.to_string();
    };

    let mut end = start + NEEDLE.len();
    while end < bytes.len() && bytes[end].is_ascii_whitespace() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'-' {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_whitespace() {
        end += 1;
    }

    // Needle and skipped bytes are ASCII, so both cut points are char boundaries.
    format!("{}{}", &message[..start], &message[end..])
}
