//! Synthetic jet stream data.
//!
//! [`SyntheticJetReader`] generates an idealised ensemble of westerly jets
//! on demand. Every member holds one jet whose core meanders around
//! `centre_lat` at `centre_hpa`; members are shifted north by
//! `member_offset_deg` each. Wind speed drops off as a Gaussian across the
//! jet and in the vertical, so the jet core is the curve the default
//! pipeline extracts.
//!
//! | Variable | Content |
//! |----------|---------|
//! | `u` | eastward wind, m/s |
//! | `v` | northward wind, m/s (along the meander) |
//! | `wind_speed` | `sqrt(u² + v²)` |
//! | `geopotential_height` | scale-height atmosphere, m |

use std::collections::BTreeSet;
use std::f32::consts::PI;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jet_common::{
    FieldInfo, JetError, JetResult, LevelType, StructuredGrid, VerticalCoordinate,
};
use serde::{Deserialize, Serialize};
use task_graph::FileAccessToken;

use crate::reader::GridReader;

const VARIABLES: [&str; 4] = ["u", "v", "wind_speed", "geopotential_height"];

/// Scale height used for geopotential height.
const SCALE_HEIGHT_M: f32 = 7000.0;

/// Shape and extent of the synthetic ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticJet {
    pub members: u32,
    pub nlon: usize,
    pub nlat: usize,
    /// South-west corner of the grid.
    pub west: f32,
    pub south: f32,
    /// Grid spacing in degrees.
    pub spacing_deg: f32,
    /// Pressure levels, from the surface upwards.
    pub levels_hpa: Vec<f32>,
    pub centre_lat: f32,
    pub centre_hpa: f32,
    pub max_speed: f32,
    /// Gaussian half-widths across the jet and in the vertical.
    pub width_deg: f32,
    pub depth_hpa: f32,
    pub meander_amplitude_deg: f32,
    pub meander_wavelength_deg: f32,
    pub member_offset_deg: f32,
    pub init_time: DateTime<Utc>,
    /// Forecast lead times in hours.
    pub lead_hours: Vec<i64>,
}

impl Default for SyntheticJet {
    fn default() -> Self {
        Self {
            members: 3,
            nlon: 61,
            nlat: 41,
            west: -30.0,
            south: 25.0,
            spacing_deg: 1.0,
            levels_hpa: (0..17).map(|k| 1000.0 - 50.0 * k as f32).collect(),
            centre_lat: 45.3,
            centre_hpa: 265.0,
            max_speed: 60.0,
            width_deg: 5.0,
            depth_hpa: 150.0,
            meander_amplitude_deg: 3.0,
            meander_wavelength_deg: 40.0,
            member_offset_deg: 0.7,
            init_time: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).single().unwrap_or_default(),
            lead_hours: vec![12],
        }
    }
}

impl SyntheticJet {
    pub fn lons(&self) -> Vec<f32> {
        (0..self.nlon)
            .map(|i| self.west + self.spacing_deg * i as f32)
            .collect()
    }

    pub fn lats(&self) -> Vec<f32> {
        (0..self.nlat)
            .map(|j| self.south + self.spacing_deg * j as f32)
            .collect()
    }

    pub fn valid_times(&self) -> Vec<DateTime<Utc>> {
        self.lead_hours
            .iter()
            .map(|h| self.init_time + Duration::hours(*h))
            .collect()
    }

    /// Latitude of the jet core of `member` at `lon`.
    pub fn core_lat(&self, member: u32, lon: f32) -> f32 {
        let phase = 2.0 * PI * (lon - self.west) / self.meander_wavelength_deg;
        self.centre_lat + self.member_offset_deg * member as f32
            + self.meander_amplitude_deg * phase.sin()
    }

    /// Slope of the core line, in degrees latitude per degree longitude.
    fn core_slope(&self, lon: f32) -> f32 {
        let k = 2.0 * PI / self.meander_wavelength_deg;
        self.meander_amplitude_deg * k * (k * (lon - self.west)).cos()
    }

    fn speed(&self, member: u32, lon: f32, lat: f32, p_hpa: f32) -> f32 {
        let across = (lat - self.core_lat(member, lon)) / self.width_deg;
        let vertical = (p_hpa - self.centre_hpa) / self.depth_hpa;
        self.max_speed * (-(across * across) - vertical * vertical).exp()
    }

    /// Value of `variable` for `member` at one point.
    pub fn value(&self, variable: &str, member: u32, lon: f32, lat: f32, p_hpa: f32) -> JetResult<f32> {
        let speed = self.speed(member, lon, lat, p_hpa);
        // Wind blows along the core line.
        let slope = self.core_slope(lon);
        let norm = (1.0 + slope * slope).sqrt();
        match variable {
            "u" => Ok(speed / norm),
            "v" => Ok(speed * slope / norm),
            "wind_speed" => Ok(speed),
            "geopotential_height" => Ok(SCALE_HEIGHT_M * (1000.0 / p_hpa).ln()),
            other => Err(JetError::unavailable(format!("synthetic variable '{}'", other))),
        }
    }

    /// Generate the full grid of `variable` for `member`.
    pub fn grid(
        &self,
        variable: &str,
        valid_time: DateTime<Utc>,
        member: u32,
    ) -> JetResult<StructuredGrid> {
        let info = FieldInfo {
            variable: variable.to_string(),
            init_time: self.init_time,
            valid_time,
            member,
        };
        let vertical = VerticalCoordinate::Pressure {
            levels_hpa: self.levels_hpa.clone(),
        };
        let mut grid = StructuredGrid::new(info, self.lons(), self.lats(), vertical)?;
        let (lons, lats) = (self.lons(), self.lats());
        for (k, &p) in self.levels_hpa.iter().enumerate() {
            for (j, &lat) in lats.iter().enumerate() {
                for (i, &lon) in lons.iter().enumerate() {
                    grid.set_value(k, j, i, self.value(variable, member, lon, lat, p)?);
                }
            }
        }
        Ok(grid)
    }
}

/// [`GridReader`] serving a [`SyntheticJet`] ensemble on pressure levels.
#[derive(Debug, Clone, Default)]
pub struct SyntheticJetReader {
    jet: SyntheticJet,
}

impl SyntheticJetReader {
    pub fn new(jet: SyntheticJet) -> Self {
        Self { jet }
    }

    pub fn jet(&self) -> &SyntheticJet {
        &self.jet
    }

    fn serves(&self, level_type: LevelType, variable: &str) -> bool {
        level_type == LevelType::PressureLevels && VARIABLES.contains(&variable)
    }
}

impl GridReader for SyntheticJetReader {
    fn available_level_types(&self) -> Vec<LevelType> {
        vec![LevelType::PressureLevels]
    }

    fn available_variables(&self, level_type: LevelType) -> Vec<String> {
        if level_type != LevelType::PressureLevels {
            return Vec::new();
        }
        VARIABLES.iter().map(|v| v.to_string()).collect()
    }

    fn available_ensemble_members(&self, level_type: LevelType, variable: &str) -> BTreeSet<u32> {
        if !self.serves(level_type, variable) {
            return BTreeSet::new();
        }
        (0..self.jet.members).collect()
    }

    fn available_init_times(&self, level_type: LevelType, variable: &str) -> Vec<DateTime<Utc>> {
        if !self.serves(level_type, variable) {
            return Vec::new();
        }
        vec![self.jet.init_time]
    }

    fn available_valid_times(
        &self,
        level_type: LevelType,
        variable: &str,
        init_time: &DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        if !self.serves(level_type, variable) || *init_time != self.jet.init_time {
            return Vec::new();
        }
        self.jet.valid_times()
    }

    fn read_grid(
        &self,
        _token: &mut FileAccessToken,
        _level_type: LevelType,
        variable: &str,
        _init_time: &DateTime<Utc>,
        valid_time: &DateTime<Utc>,
        member: u32,
    ) -> JetResult<StructuredGrid> {
        self.jet.grid(variable, *valid_time, member)
    }
}
