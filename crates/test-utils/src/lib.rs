//! Shared test utilities for the jet-core workspace.
//!
//! Grids come from [`generators`], hand-built line selections and the
//! fixed forecast times from [`fixtures`]. Float comparisons go through
//! [`assert_approx_eq!`] and [`assert_vertex_approx_eq!`].

pub mod fixtures;
pub mod generators;

pub use fixtures::*;
pub use generators::*;

/// Assert that two numbers differ by at most `tolerance`.
///
/// Both sides are compared as `f64`, so `f32` vertex coordinates can be
/// checked against literals directly.
///
/// ```
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(250.02_f32, 250.0, 0.05);
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($actual:expr, $expected:expr, $tolerance:expr) => {{
        let actual = $actual as f64;
        let expected = $expected as f64;
        let tolerance = $tolerance as f64;
        assert!(
            (actual - expected).abs() <= tolerance,
            "assertion failed: {} = {} is not within {} of {}",
            stringify!($actual),
            actual,
            tolerance,
            expected
        );
    }};
}

/// Macro for approximate equality of a line vertex.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_vertex_approx_eq;
///
/// assert_vertex_approx_eq!(vertex, (10.0, 45.0, 250.0), 1e-4);
/// ```
#[macro_export]
macro_rules! assert_vertex_approx_eq {
    ($vertex:expr, ($lon:expr, $lat:expr, $p:expr), $epsilon:expr) => {{
        let v = $vertex;
        $crate::assert_approx_eq!(v.x, $lon, $epsilon);
        $crate::assert_approx_eq!(v.y, $lat, $epsilon);
        $crate::assert_approx_eq!(v.z, $p, $epsilon);
    }};
}
