// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The operation-level error surface.
//!
//! Every user-facing method returns failures as a [`CoreError`] carrying a
//! kind, a message and optional context. Transient network failures inside
//! the long-running loops never surface here; they are absorbed by the
//! loops' own recovery paths.

use thiserror::Error;

use acpapiclient::{
    auth_api::AuthApiError, group_api::GroupApiError, heartbeat::HeartbeatStartError,
    signalling::{SignallingConnectError, SignallingSendError},
};
use acpcommon::{
    codec,
    crypto::seal::{KeyOpenError, KeySealError},
    messages::signalling::EnvelopeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Config,
    Auth,
    Network,
    Protocol,
    State,
    Crypto,
    NotFound,
    RateLimited,
    Conflict,
    Internal,
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    /// Operation-specific context, e.g. the id that was not found.
    pub context: Option<String>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::State, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<AuthApiError> for CoreError {
    fn from(error: AuthApiError) -> Self {
        let code = match &error {
            AuthApiError::AuthenticationFailed => ErrorCode::Auth,
            AuthApiError::RequestRejected { .. } | AuthApiError::MalformedResponse(_) => {
                ErrorCode::Protocol
            }
            AuthApiError::Url(_) => ErrorCode::Config,
            AuthApiError::RetriesExhausted { .. } | AuthApiError::Network(_) => {
                ErrorCode::Network
            }
            AuthApiError::MalformedCertificate(_) | AuthApiError::CertificateMismatch => {
                ErrorCode::Crypto
            }
        };
        Self::new(code, error.to_string())
    }
}

impl From<GroupApiError> for CoreError {
    fn from(error: GroupApiError) -> Self {
        let code = match &error {
            GroupApiError::NotFound => ErrorCode::NotFound,
            GroupApiError::Forbidden => ErrorCode::State,
            GroupApiError::Conflict { .. } => ErrorCode::Conflict,
            GroupApiError::RateLimited => ErrorCode::RateLimited,
            GroupApiError::Expired => ErrorCode::State,
            GroupApiError::Server { .. }
            | GroupApiError::RequestRejected { .. }
            | GroupApiError::MalformedResponse(_) => ErrorCode::Protocol,
            GroupApiError::Url(_) => ErrorCode::Config,
            GroupApiError::Network(_) => ErrorCode::Network,
        };
        Self::new(code, error.to_string())
    }
}

impl From<SignallingSendError> for CoreError {
    fn from(error: SignallingSendError) -> Self {
        let code = match &error {
            SignallingSendError::NotConnected { .. } => ErrorCode::State,
            SignallingSendError::Encode(_) => ErrorCode::Protocol,
            SignallingSendError::TaskGone => ErrorCode::Internal,
        };
        Self::new(code, error.to_string())
    }
}

impl From<SignallingConnectError> for CoreError {
    fn from(error: SignallingConnectError) -> Self {
        Self::new(ErrorCode::Config, error.to_string())
    }
}

impl From<HeartbeatStartError> for CoreError {
    fn from(error: HeartbeatStartError) -> Self {
        Self::new(ErrorCode::Network, error.to_string())
    }
}

impl From<EnvelopeError> for CoreError {
    fn from(error: EnvelopeError) -> Self {
        Self::new(ErrorCode::Protocol, error.to_string())
    }
}

impl From<KeySealError> for CoreError {
    fn from(error: KeySealError) -> Self {
        Self::new(ErrorCode::Crypto, error.to_string())
    }
}

impl From<KeyOpenError> for CoreError {
    fn from(error: KeyOpenError) -> Self {
        Self::new(ErrorCode::Crypto, error.to_string())
    }
}

impl From<codec::Error> for CoreError {
    fn from(error: codec::Error) -> Self {
        Self::new(ErrorCode::Internal, error.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        };
        Self::new(code, error.to_string())
    }
}
