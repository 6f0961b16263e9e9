// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Error type shared by every fleet_emu module.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors from catalog loading, sampling and core planning.
#[derive(Debug)]
pub enum FleetError {
    /// A catalog document, archetype, profile, connection type or
    /// container name does not exist.
    NotFound(String),
    /// Connection types under one profile disagree on their parameter keys.
    InconsistentSchema(String),
    /// An operation was called in the wrong lifecycle phase.
    InvalidState(String),
    /// A numeric argument or config value is out of range.
    InvalidParameter(String),
    /// Reading a document failed for a reason other than absence.
    Io { path: PathBuf, source: io::Error },
    /// A document is not valid JSON or does not have the expected shape.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, FleetError::InvalidState(_))
    }

    pub fn is_inconsistent_schema(&self) -> bool {
        matches!(self, FleetError::InconsistentSchema(_))
    }

    pub fn is_invalid_parameter(&self) -> bool {
        matches!(self, FleetError::InvalidParameter(_))
    }
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::NotFound(what) => write!(f, "not found: {what}"),
            FleetError::InconsistentSchema(msg) => write!(f, "inconsistent schema: {msg}"),
            FleetError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            FleetError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            FleetError::Io { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            FleetError::Json { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FleetError::Io { source, .. } => Some(source),
            FleetError::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}
