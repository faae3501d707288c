//! The numeric error taxonomy the wire protocol, the journal's fatal-write
//! discipline, and every gateway adapter report through.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PayprocError>;

/// One kind per wire error code. `Upstream` carries the offending
/// gateway's own error shape so handlers can surface `failure`/
/// `failure-mesg` lines.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("unknown command")]
    UnknownCommand,
    #[error("missing required value")]
    MissingValue,
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid name")]
    InvalidName,
    #[error("invalid length")]
    InvalidLength,
    #[error("no such session or alias or session timed out")]
    NotFound,
    #[error("resource limit reached")]
    LimitReached,
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("line too long")]
    Truncated,
    #[error("unexpected eof")]
    Eof,
    #[error("permission denied")]
    Permission,
    #[error("error from {gateway}: {status}")]
    Upstream {
        gateway: &'static str,
        status: u16,
        code: Option<String>,
        r#type: Option<String>,
        message: Option<String>,
    },
    #[error("secret key unusable for this role")]
    UnusableSecretKey,
    #[error("public key unusable for this role")]
    UnusablePublicKey,
    #[error("gateway returned an unexpected shape")]
    InvalidObject,
    #[error("retry budget exhausted")]
    Timeout,
    #[error("general error")]
    General,
}

impl ErrorKind {
    /// The default wire code for this kind. Individual call sites may
    /// override this with a more specific code via
    /// [`PayprocError::with_code`] -- e.g. `CARDTOKEN`'s expiration-month
    /// validation returns the specific code `55`, not the generic
    /// `InvalidValue` code.
    ///
    /// These numbers are payproc's own and are not guaranteed to line up
    /// with `libgpg-error`'s codes of the same name; `libgpg-error` itself
    /// is an out-of-scope external collaborator.
    pub fn default_code(&self) -> u16 {
        match self {
            ErrorKind::UnknownCommand => 1,
            ErrorKind::MissingValue => 16,
            ErrorKind::InvalidValue => 39,
            ErrorKind::InvalidName => 40,
            ErrorKind::InvalidLength => 41,
            ErrorKind::NotFound => 11,
            ErrorKind::LimitReached => 98,
            ErrorKind::ProtocolViolation => 76,
            ErrorKind::Truncated => 45,
            ErrorKind::Eof => 43,
            ErrorKind::Permission => 13,
            ErrorKind::Upstream { .. } => 147,
            ErrorKind::UnusableSecretKey => 184,
            ErrorKind::UnusablePublicKey => 185,
            ErrorKind::InvalidObject => 161,
            ErrorKind::Timeout => 10,
            ErrorKind::General => 1024,
        }
    }
}

/// An error on its way to becoming an `ERR <code> (<description>)` response
/// line, optionally followed by `failure:`/`failure-mesg:` data lines.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PayprocError {
    pub kind: ErrorKind,
    pub code: u16,
    pub message: String,
    /// Populated from a gateway's own error `code` field (e.g. Stripe's
    /// `card_error.code`), emitted on the wire as `failure:`.
    pub failure: Option<String>,
    /// Populated from a gateway's own human-readable message, emitted on the
    /// wire as `failure-mesg:`.
    pub failure_mesg: Option<String>,
}

impl PayprocError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let code = kind.default_code();
        Self {
            kind,
            code,
            message: message.into(),
            failure: None,
            failure_mesg: None,
        }
    }

    /// Override the default wire code for `kind`. Used where the protocol
    /// contract requires a specific numeric code for a specific validation
    /// failure rather than the kind's generic default.
    pub fn with_code(kind: ErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            failure: None,
            failure_mesg: None,
        }
    }

    pub fn with_failure(mut self, failure: Option<String>, failure_mesg: Option<String>) -> Self {
        self.failure = failure;
        self.failure_mesg = failure_mesg;
        self
    }

    pub fn missing_value(name: &str) -> Self {
        Self::new(ErrorKind::MissingValue, format!("Missing value for '{name}'"))
    }

    pub fn invalid_value(name: &str) -> Self {
        Self::new(ErrorKind::InvalidValue, format!("Invalid value for '{name}'"))
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, ErrorKind::NotFound.to_string())
    }
}
