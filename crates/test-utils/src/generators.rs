//! Synthetic grid generators.
//!
//! Grids produced here sit on a 1° lon/lat raster starting at (0°, 0°),
//! so the grid index of a point equals its coordinate. This keeps expected
//! positions in tests easy to derive by hand.

use jet_common::{FieldInfo, StructuredGrid, VerticalCoordinate};

use crate::fixtures::{test_init_time, test_valid_time};

/// Pressure-level vertical coordinate from levels in hPa.
pub fn pressure_axis(levels_hpa: &[f32]) -> VerticalCoordinate {
    VerticalCoordinate::Pressure {
        levels_hpa: levels_hpa.to_vec(),
    }
}

/// `n` evenly spaced pressure levels from 1000 hPa upwards in steps of
/// `step_hpa`.
pub fn regular_pressure_axis(n: usize, step_hpa: f32) -> VerticalCoordinate {
    let levels: Vec<f32> = (0..n).map(|k| 1000.0 - step_hpa * k as f32).collect();
    pressure_axis(&levels)
}

/// Field identification at the fixed test times.
pub fn test_field_info(variable: &str, member: u32) -> FieldInfo {
    FieldInfo {
        variable: variable.to_string(),
        init_time: test_init_time(),
        valid_time: test_valid_time(),
        member,
    }
}

/// Creates a grid on explicit axes with values `f(lon, lat, p_hpa)`.
///
/// # Panics
///
/// Panics if the axes are empty or inconsistent with `vertical`.
pub fn grid_on_axes(
    info: FieldInfo,
    lons: Vec<f32>,
    lats: Vec<f32>,
    vertical: VerticalCoordinate,
    f: impl Fn(f32, f32, f32) -> f32,
) -> StructuredGrid {
    let mut grid =
        StructuredGrid::new(info, lons, lats, vertical).expect("invalid test grid axes");
    for k in 0..grid.nlevels() {
        for j in 0..grid.nlats() {
            for i in 0..grid.nlons() {
                let value = f(grid.lons()[i], grid.lats()[j], grid.pressure(k, j, i));
                grid.set_value(k, j, i, value);
            }
        }
    }
    grid
}

/// Creates an `nlon` x `nlat` grid on the 1° raster with values
/// `f(lon, lat, p_hpa)`, member 0.
///
/// # Example
///
/// ```
/// use test_utils::generators::{grid_from_fn, pressure_axis};
///
/// let grid = grid_from_fn("t", 4, 3, pressure_axis(&[1000.0, 500.0]), |lon, lat, _| lon + lat);
/// assert_eq!(grid.value(1, 2, 3), 5.0);
/// ```
pub fn grid_from_fn(
    variable: &str,
    nlon: usize,
    nlat: usize,
    vertical: VerticalCoordinate,
    f: impl Fn(f32, f32, f32) -> f32,
) -> StructuredGrid {
    let lons = (0..nlon).map(|i| i as f32).collect();
    let lats = (0..nlat).map(|j| j as f32).collect();
    grid_on_axes(test_field_info(variable, 0), lons, lats, vertical, f)
}

/// Creates a grid with the same value everywhere.
pub fn constant_grid(
    variable: &str,
    nlon: usize,
    nlat: usize,
    vertical: VerticalCoordinate,
    value: f32,
) -> StructuredGrid {
    grid_from_fn(variable, nlon, nlat, vertical, |_, _, _| value)
}
