use crate::{rule::PortAddr, store::StoreError};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, net::IpAddr};
use thiserror::Error;

/// Field name to human-readable problems. Empty means valid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

/// Errors returned to callers of controller operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-correctable problems with the request payload.
    #[error("invalid request: {0}")]
    Validation(FieldErrors),

    /// A duplicate id or a stale version.
    #[error("{0}")]
    Conflict(String),

    #[error("the ip {} port({}) already exists", .0.ip, .0.port)]
    PortConflict(PortAddr),

    #[error("port {port} is outside of the allowed range ({min}, {max}]")]
    PortOutOfRange { port: u16, min: u16, max: u16 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("no available port on {0}")]
    CapacityExhausted(IpAddr),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("request timed out")]
    Timeout,
}

// === impl FieldErrors ===

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the problems for `field`, replacing any already recorded.
    pub fn set(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), vec![message.into()]);
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.set(field, message);
        errors
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Converts a non-empty set into a validation error.
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, problems) in &self.0 {
            for problem in problems {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {problem}")?;
                first = false;
            }
        }
        Ok(())
    }
}

// === impl Error ===

impl Error {
    /// Converts a store error, naming the record in `NotFound` errors.
    pub fn store(error: StoreError, what: impl fmt::Display) -> Self {
        match error {
            StoreError::NotFound => Self::NotFound(what.to_string()),
            StoreError::Conflict(reason) => Self::Conflict(format!("{what}: {reason}")),
            StoreError::AddrConflict(addr) => Self::PortConflict(addr),
            StoreError::Unavailable(reason) => Self::Persistence(reason),
        }
    }

    /// Returns true for errors the caller can fix by changing the request.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Self::Persistence(_) | Self::Timeout)
    }
}
