/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Failure classes of a single outbound HTTP call.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("host validation failed: {0}")]
    HostValidation(String),
    #[error("response exceeds {limit} bytes")]
    LengthValidation { limit: usize },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RequestError {
    /// Validation errors are fatal for the operation and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_) | Self::HostValidation(_) | Self::LengthValidation { .. } | Self::Signing(_)
        )
    }

    /// Network-level failures that count against the remote domain and may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Another worker currently holds the lease for the same key.
#[derive(Debug, Error)]
#[error("race condition: lock {key} is held by another worker")]
pub struct RaceConditionError {
    pub key: String,
}

impl RaceConditionError {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// True when an `anyhow` chain carries a [`RaceConditionError`]; workers use it to reschedule.
pub fn is_race_condition(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<RaceConditionError>())
}
