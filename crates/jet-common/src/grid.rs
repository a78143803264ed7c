//! Structured lon/lat/level grids holding one scalar field.
//!
//! Data is stored as a flat `Vec<f32>` in level-major order:
//! `index = k * nlat * nlon + j * nlon + i`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JetError, JetResult};
use crate::item::DataItem;

/// Vertical level type of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelType {
    /// Single 2D level.
    Surface,
    /// Constant pressure levels.
    PressureLevels,
    /// Hybrid sigma-pressure model levels.
    HybridSigmaPressure,
}

impl LevelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelType::Surface => "surface",
            LevelType::PressureLevels => "pressure_levels",
            LevelType::HybridSigmaPressure => "hybrid_sigma_pressure",
        }
    }
}

impl fmt::Display for LevelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LevelType {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "surface" | "0" => Ok(LevelType::Surface),
            "pressure_levels" | "pl" | "1" => Ok(LevelType::PressureLevels),
            "hybrid_sigma_pressure" | "ml" | "2" => Ok(LevelType::HybridSigmaPressure),
            _ => Err(JetError::invalid_value("LEVELTYPE", s, "unknown level type")),
        }
    }
}

/// Vertical coordinate of a grid, in hPa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VerticalCoordinate {
    Surface,
    /// One pressure per level.
    Pressure { levels_hpa: Vec<f32> },
    /// `p(k, j, i) = ak[k] + bk[k] * psfc[j, i]`.
    HybridSigma {
        ak_hpa: Vec<f32>,
        bk: Vec<f32>,
        surface_pressure_hpa: Vec<f32>,
    },
}

impl VerticalCoordinate {
    pub fn level_type(&self) -> LevelType {
        match self {
            VerticalCoordinate::Surface => LevelType::Surface,
            VerticalCoordinate::Pressure { .. } => LevelType::PressureLevels,
            VerticalCoordinate::HybridSigma { .. } => LevelType::HybridSigmaPressure,
        }
    }

    pub fn num_levels(&self) -> usize {
        match self {
            VerticalCoordinate::Surface => 1,
            VerticalCoordinate::Pressure { levels_hpa } => levels_hpa.len(),
            VerticalCoordinate::HybridSigma { ak_hpa, .. } => ak_hpa.len(),
        }
    }
}

/// Identification of the field a grid holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub variable: String,
    pub init_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub member: u32,
}

/// A 3D (or 2D) scalar field on a regular lon/lat grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredGrid {
    info: FieldInfo,
    lons: Vec<f32>,
    lats: Vec<f32>,
    vertical: VerticalCoordinate,
    data: Vec<f32>,
    /// One bit per contributing ensemble member for each grid point.
    contribution_flags: Option<Vec<u64>>,
}

impl StructuredGrid {
    /// Create a grid filled with zeros.
    pub fn new(
        info: FieldInfo,
        lons: Vec<f32>,
        lats: Vec<f32>,
        vertical: VerticalCoordinate,
    ) -> JetResult<Self> {
        if lons.is_empty() || lats.is_empty() || vertical.num_levels() == 0 {
            return Err(JetError::InvalidGrid(format!(
                "empty axis: {} lons, {} lats, {} levels",
                lons.len(),
                lats.len(),
                vertical.num_levels()
            )));
        }
        if let VerticalCoordinate::HybridSigma {
            ak_hpa,
            bk,
            surface_pressure_hpa,
        } = &vertical
        {
            if ak_hpa.len() != bk.len() || surface_pressure_hpa.len() != lons.len() * lats.len() {
                return Err(JetError::InvalidGrid(
                    "hybrid coefficients do not match grid dimensions".to_string(),
                ));
            }
        }
        let n = lons.len() * lats.len() * vertical.num_levels();
        Ok(Self {
            info,
            lons,
            lats,
            vertical,
            data: vec![0.0; n],
            contribution_flags: None,
        })
    }

    /// Create a grid with the given data.
    pub fn with_data(
        info: FieldInfo,
        lons: Vec<f32>,
        lats: Vec<f32>,
        vertical: VerticalCoordinate,
        data: Vec<f32>,
    ) -> JetResult<Self> {
        let mut grid = Self::new(info, lons, lats, vertical)?;
        if data.len() != grid.data.len() {
            return Err(JetError::InvalidGrid(format!(
                "expected {} values, got {}",
                grid.data.len(),
                data.len()
            )));
        }
        grid.data = data;
        Ok(grid)
    }

    /// A zero-filled grid with the same topology, holding `variable`.
    pub fn zeroed_like(&self, variable: impl Into<String>) -> Self {
        Self {
            info: FieldInfo {
                variable: variable.into(),
                ..self.info.clone()
            },
            lons: self.lons.clone(),
            lats: self.lats.clone(),
            vertical: self.vertical.clone(),
            data: vec![0.0; self.data.len()],
            contribution_flags: None,
        }
    }

    pub fn info(&self) -> &FieldInfo {
        &self.info
    }

    pub fn variable(&self) -> &str {
        &self.info.variable
    }

    pub fn member(&self) -> u32 {
        self.info.member
    }

    pub fn level_type(&self) -> LevelType {
        self.vertical.level_type()
    }

    pub fn vertical(&self) -> &VerticalCoordinate {
        &self.vertical
    }

    pub fn nlons(&self) -> usize {
        self.lons.len()
    }

    pub fn nlats(&self) -> usize {
        self.lats.len()
    }

    pub fn nlevels(&self) -> usize {
        self.vertical.num_levels()
    }

    pub fn num_values(&self) -> usize {
        self.data.len()
    }

    pub fn lons(&self) -> &[f32] {
        &self.lons
    }

    pub fn lats(&self) -> &[f32] {
        &self.lats
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn index(&self, k: usize, j: usize, i: usize) -> usize {
        (k * self.lats.len() + j) * self.lons.len() + i
    }

    #[inline]
    pub fn value(&self, k: usize, j: usize, i: usize) -> f32 {
        self.data[self.index(k, j, i)]
    }

    #[inline]
    pub fn set_value(&mut self, k: usize, j: usize, i: usize, v: f32) {
        let idx = self.index(k, j, i);
        self.data[idx] = v;
    }

    /// Pressure in hPa at grid point (k, j, i). NaN for surface grids.
    pub fn pressure(&self, k: usize, j: usize, i: usize) -> f32 {
        match &self.vertical {
            VerticalCoordinate::Surface => f32::NAN,
            VerticalCoordinate::Pressure { levels_hpa } => levels_hpa[k],
            VerticalCoordinate::HybridSigma {
                ak_hpa,
                bk,
                surface_pressure_hpa,
            } => ak_hpa[k] + bk[k] * surface_pressure_hpa[j * self.lons.len() + i],
        }
    }

    /// True if the longitude axis wraps around the globe.
    pub fn is_cyclic_in_longitude(&self) -> bool {
        if self.lons.len() < 2 {
            return false;
        }
        let dlon = (self.lons[1] - self.lons[0]).abs();
        let span = (self.lons[self.lons.len() - 1] - self.lons[0]).abs() + dlon;
        (span - 360.0).abs() < dlon * 0.5
    }

    /// True if `other` has the same axes and vertical coordinate.
    pub fn same_topology(&self, other: &StructuredGrid) -> bool {
        self.lons == other.lons && self.lats == other.lats && self.vertical == other.vertical
    }

    pub fn contribution_flags(&self) -> Option<&[u64]> {
        self.contribution_flags.as_deref()
    }

    /// Mark `member` as contributing to every grid point.
    pub fn set_contributing_member(&mut self, member: u32) {
        if member >= 64 {
            return;
        }
        let n = self.data.len();
        let flags = self.contribution_flags.get_or_insert_with(|| vec![0; n]);
        for f in flags.iter_mut() {
            *f |= 1u64 << member;
        }
    }

    /// Fractional horizontal index of `lon` / `lat`, if inside the domain.
    fn horizontal_position(&self, lon: f32, lat: f32) -> Option<(f32, f32)> {
        let mix_i = fractional_index(&self.lons, lon, self.is_cyclic_in_longitude())?;
        let mix_j = fractional_index(&self.lats, lat, false)?;
        Some((mix_i, mix_j))
    }

    /// Linear-in-ln(p) interpolation within column (j, i).
    fn column_value(&self, j: usize, i: usize, p_hpa: f32) -> Option<f32> {
        let nlev = self.nlevels();
        if nlev == 1 {
            return Some(self.value(0, j, i));
        }
        let ascending = self.pressure(nlev - 1, j, i) > self.pressure(0, j, i);
        let p_first = self.pressure(0, j, i);
        let p_last = self.pressure(nlev - 1, j, i);
        let (p_min, p_max) = if ascending {
            (p_first, p_last)
        } else {
            (p_last, p_first)
        };
        if !(p_min..=p_max).contains(&p_hpa) {
            return None;
        }

        // Binary search for the level pair bracketing p.
        let (mut lo, mut hi) = (0usize, nlev - 1);
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            let above = self.pressure(mid, j, i) > p_hpa;
            if above == ascending {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let (p0, p1) = (self.pressure(lo, j, i), self.pressure(hi, j, i));
        let t = if (p1 - p0).abs() < f32::EPSILON {
            0.0
        } else {
            (p_hpa.ln() - p0.ln()) / (p1.ln() - p0.ln())
        };
        let (v0, v1) = (self.value(lo, j, i), self.value(hi, j, i));
        Some(v0 + t * (v1 - v0))
    }

    /// Interpolate the field at (lon, lat, pressure in hPa).
    ///
    /// Bilinear in the horizontal, linear in ln(p) in the vertical. Returns
    /// None outside the grid domain or where any contributing sample is NaN.
    pub fn interpolate_value(&self, lon: f32, lat: f32, p_hpa: f32) -> Option<f32> {
        let (mix_i, mix_j) = self.horizontal_position(lon, lat)?;
        let nlon = self.nlons();

        let i0 = mix_i.floor() as usize % nlon;
        let j0 = mix_j.floor() as usize;
        let i1 = if self.is_cyclic_in_longitude() {
            (i0 + 1) % nlon
        } else {
            (i0 + 1).min(nlon - 1)
        };
        let j1 = (j0 + 1).min(self.nlats() - 1);
        let fi = mix_i - mix_i.floor();
        let fj = mix_j - mix_j.floor();

        let v00 = self.column_value(j0, i0, p_hpa)?;
        let v01 = self.column_value(j0, i1, p_hpa)?;
        let v10 = self.column_value(j1, i0, p_hpa)?;
        let v11 = self.column_value(j1, i1, p_hpa)?;

        let v0 = v00 + fi * (v01 - v00);
        let v1 = v10 + fi * (v11 - v10);
        let value = v0 + fj * (v1 - v0);
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }
}

impl DataItem for StructuredGrid {
    fn memory_size_kb(&self) -> usize {
        let floats = self.data.len() + self.lons.len() + self.lats.len();
        let flags = self.contribution_flags.as_ref().map_or(0, |f| f.len() * 8);
        (floats * std::mem::size_of::<f32>() + flags) / 1024 + 1
    }
}

/// Fractional index of `x` on a regular, monotonic axis.
fn fractional_index(axis: &[f32], x: f32, cyclic: bool) -> Option<f32> {
    let n = axis.len();
    if n == 1 {
        return ((x - axis[0]).abs() < f32::EPSILON).then_some(0.0);
    }
    let delta = axis[1] - axis[0];
    let mut mix = (x - axis[0]) / delta;
    if cyclic {
        mix = mix.rem_euclid(n as f32);
        return Some(mix);
    }
    let max = (n - 1) as f32;
    // Tolerate rounding at the domain edges.
    if mix < -1e-4 || mix > max + 1e-4 {
        return None;
    }
    Some(mix.clamp(0.0, max))
}
