//! Lot configuration records.
//!
//! `LotConfigRequest` is the untrusted payload received from the backend.
//! `LotConfig` is the validated form the registry accepts.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::detect::ProcessingParams;
use crate::{LotId, Region, SpotId};

/// Lot configuration as posted by the backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LotConfigRequest {
    pub lot_id: LotId,
    pub name: String,
    #[serde(default)]
    pub location: String,
    pub video_feed_url: String,
    pub parking_spots: Vec<SpotRequest>,
}

/// One spot origin as posted by the backend. Width and height are deployment-wide.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SpotRequest {
    pub id: SpotId,
    pub x: i64,
    pub y: i64,
}

/// Validated spot origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SpotPosition {
    pub id: SpotId,
    pub x: u32,
    pub y: u32,
}

/// Validated lot configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LotConfig {
    pub lot_id: LotId,
    pub name: String,
    pub location: String,
    pub video_feed_url: String,
    pub spots: Vec<SpotPosition>,
}

/// Configuration-time validation failure. These are the only errors surfaced
/// synchronously to the caller of configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingName,
    MissingVideoFeed,
    NoSpots,
    DuplicateSpot(SpotId),
    NegativeOrigin(SpotId),
    OriginTooLarge(SpotId),
    UnknownLot(LotId),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingName => write!(f, "lot name must not be empty"),
            ConfigError::MissingVideoFeed => write!(f, "video_feed_url must not be empty"),
            ConfigError::NoSpots => write!(f, "parking_spots must contain at least one spot"),
            ConfigError::DuplicateSpot(id) => write!(f, "parking spot {} is listed twice", id),
            ConfigError::NegativeOrigin(id) => {
                write!(f, "parking spot {} has a negative x or y", id)
            }
            ConfigError::OriginTooLarge(id) => {
                write!(f, "parking spot {} has an x or y beyond the pixel range", id)
            }
            ConfigError::UnknownLot(id) => write!(f, "no configuration for lot ID {}", id),
        }
    }
}

impl std::error::Error for ConfigError {}

impl LotConfigRequest {
    pub fn validate(self) -> Result<LotConfig, ConfigError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        let video_feed_url = self.video_feed_url.trim().to_string();
        if video_feed_url.is_empty() {
            return Err(ConfigError::MissingVideoFeed);
        }
        if self.parking_spots.is_empty() {
            return Err(ConfigError::NoSpots);
        }

        let mut seen = HashSet::new();
        let mut spots = Vec::with_capacity(self.parking_spots.len());
        for spot in self.parking_spots {
            if !seen.insert(spot.id) {
                return Err(ConfigError::DuplicateSpot(spot.id));
            }
            if spot.x < 0 || spot.y < 0 {
                return Err(ConfigError::NegativeOrigin(spot.id));
            }
            let x = u32::try_from(spot.x).map_err(|_| ConfigError::OriginTooLarge(spot.id))?;
            let y = u32::try_from(spot.y).map_err(|_| ConfigError::OriginTooLarge(spot.id))?;
            spots.push(SpotPosition { id: spot.id, x, y });
        }

        Ok(LotConfig {
            lot_id: self.lot_id,
            name,
            location: self.location.trim().to_string(),
            video_feed_url,
            spots,
        })
    }
}

impl LotConfig {
    /// Region list in configuration order, using the deployment-wide spot size.
    pub fn regions(&self, params: &ProcessingParams) -> Vec<Region> {
        self.spots
            .iter()
            .map(|spot| Region::new(spot.id, spot.x, spot.y, params.spot_width, params.spot_height))
            .collect()
    }
}
