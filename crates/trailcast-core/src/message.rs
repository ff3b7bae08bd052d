//! Position update messages.
//!
//! Publishers put JSON position updates on the broker. The router only needs
//! a handful of fields to route a message; everything else in the payload is
//! forwarded to viewers untouched.

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Errors produced while validating an inbound payload.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Payload is not valid JSON or is missing a required field.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required string field is present but empty.
    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    /// Coordinates are not finite or fall outside WGS84 bounds.
    #[error("Invalid location: latitude={latitude}, longitude={longitude}")]
    InvalidLocation {
        /// Offending latitude.
        latitude: f64,
        /// Offending longitude.
        longitude: f64,
    },
}

/// Runner gender tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    /// Male category.
    Male,
    /// Female category.
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => f.write_str("male"),
            Self::Female => f.write_str("female"),
        }
    }
}

/// A GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Location {
    fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// The routed fields of a position update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PositionUpdate {
    /// Trail the runner is on. Older publishers call this `queue`.
    #[serde(alias = "queue")]
    pub trail: String,
    /// Runner identifier.
    pub athlete: String,
    /// Current position.
    pub location: Location,
    /// Gender category.
    pub gender: Gender,
}

/// A validated inbound message together with its raw payload.
#[derive(Debug, Clone)]
pub struct Message {
    position: PositionUpdate,
    payload: Bytes,
}

impl Message {
    /// Parse and validate a raw broker payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not JSON, a required field is
    /// missing or mistyped, or a field fails validation.
    pub fn parse(payload: impl Into<Bytes>) -> Result<Self, MessageError> {
        let payload = payload.into();
        let position: PositionUpdate = serde_json::from_slice(&payload)?;

        if position.trail.trim().is_empty() {
            return Err(MessageError::EmptyField("trail"));
        }
        if position.athlete.trim().is_empty() {
            return Err(MessageError::EmptyField("athlete"));
        }
        if !position.location.is_valid() {
            return Err(MessageError::InvalidLocation {
                latitude: position.location.latitude,
                longitude: position.location.longitude,
            });
        }

        Ok(Self { position, payload })
    }

    /// Trail this message is routed on.
    #[must_use]
    pub fn trail(&self) -> &str {
        &self.position.trail
    }

    /// Athlete this message is about.
    #[must_use]
    pub fn athlete(&self) -> &str {
        &self.position.athlete
    }

    /// The parsed routing fields.
    #[must_use]
    pub fn position(&self) -> &PositionUpdate {
        &self.position
    }

    /// The payload exactly as received.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}
