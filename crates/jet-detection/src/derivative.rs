//! Partial derivatives of wind speed along the wind-normal direction and
//! in the vertical.
//!
//! The stage reads the two horizontal wind components, forms the wind
//! speed `Vs = |V|` and the horizontal unit normal `n = (-v, u) / |V|`, and
//! evaluates one derivative of `Vs` with centred finite differences. At the
//! domain edges neighbour indices are clamped to the grid.
//!
//! Vertical derivatives are taken with respect to geometric height when a
//! geopotential field is configured, otherwise with respect to pressure.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jet_common::keys::{
    MULTI_DERIVATIVE_OPS, MULTI_GEOPOTENTIAL, MULTI_GEOPOTENTIAL_TYPE, MULTI_VARIABLES, VARIABLE,
};
use jet_common::{JetError, JetResult, Request, StructuredGrid};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use task_graph::{
    get_task_graph, key_set, CacheHandle, MemoryManager, ScheduledDataSource, SharedSource,
    SourceCore, Task,
};
use tracing::debug;

use crate::geometry::METRES_PER_DEGREE;

/// Standard gravity, converting geopotential to geopotential height.
pub const GRAVITY: f32 = 9.81;

const LOCAL_KEYS: &[&str] = &[MULTI_VARIABLES, MULTI_DERIVATIVE_OPS];
const OPTIONAL_KEYS: &[&str] = &[MULTI_GEOPOTENTIAL, MULTI_GEOPOTENTIAL_TYPE];

/// A derivative of wind speed.
///
/// `n` is the horizontal wind-normal direction, `z` geometric height and
/// `p` pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeOp {
    Ddn,
    D2dn2,
    D2dndz,
    D2dndp,
    Ddz,
    D2dz2,
    Ddp,
    D2dp2,
}

impl DerivativeOp {
    pub const ALL: [DerivativeOp; 8] = [
        DerivativeOp::Ddn,
        DerivativeOp::D2dn2,
        DerivativeOp::D2dndz,
        DerivativeOp::D2dndp,
        DerivativeOp::Ddz,
        DerivativeOp::D2dz2,
        DerivativeOp::Ddp,
        DerivativeOp::D2dp2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivativeOp::Ddn => "ddn",
            DerivativeOp::D2dn2 => "d2dn2",
            DerivativeOp::D2dndz => "d2dndz",
            DerivativeOp::D2dndp => "d2dndp",
            DerivativeOp::Ddz => "ddz",
            DerivativeOp::D2dz2 => "d2dz2",
            DerivativeOp::Ddp => "ddp",
            DerivativeOp::D2dp2 => "d2dp2",
        }
    }

    /// True if the operator differentiates in height.
    pub fn uses_height(&self) -> bool {
        matches!(
            self,
            DerivativeOp::D2dndz | DerivativeOp::Ddz | DerivativeOp::D2dz2
        )
    }

    /// True if the operator cannot fall back to pressure.
    pub fn requires_geopotential(&self) -> bool {
        matches!(self, DerivativeOp::Ddz | DerivativeOp::D2dz2)
    }
}

impl fmt::Display for DerivativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DerivativeOp {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DerivativeOp::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| JetError::UnknownOperator(s.to_string()))
    }
}

/// Unit of the configured geopotential variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeopotentialType {
    /// Geopotential height in metres.
    #[default]
    Height,
    /// Geopotential in m²/s²; divided by [`GRAVITY`].
    Geopotential,
}

impl GeopotentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeopotentialType::Height => "height",
            GeopotentialType::Geopotential => "geopotential",
        }
    }

    fn metres_per_unit(&self) -> f32 {
        match self {
            GeopotentialType::Height => 1.0,
            GeopotentialType::Geopotential => 1.0 / GRAVITY,
        }
    }
}

impl FromStr for GeopotentialType {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "height" | "0" => Ok(GeopotentialType::Height),
            "geopotential" | "1" => Ok(GeopotentialType::Geopotential),
            _ => Err(JetError::invalid_value(
                MULTI_GEOPOTENTIAL_TYPE,
                s,
                "expected 'height' or 'geopotential'",
            )),
        }
    }
}

/// Computes one [`DerivativeOp`] field from the wind components.
///
/// Forwards requests without `MULTI_DERIVATIVE_OPS` unchanged to its input,
/// so the same stage serves raw and derived fields.
pub struct PartialDerivativeSource {
    core: SourceCore,
    input: SharedSource<StructuredGrid>,
}

impl PartialDerivativeSource {
    pub fn new(input: SharedSource<StructuredGrid>, memory: Arc<MemoryManager>) -> Self {
        Self {
            core: SourceCore::new("partial-derivative", memory),
            input,
        }
    }

    /// Request for raw field `variable` from the input.
    fn input_request(request: &Request, variable: &str) -> Request {
        let mut upstream = request.without(LOCAL_KEYS);
        upstream.remove_all(OPTIONAL_KEYS);
        upstream.insert(VARIABLE, variable);
        upstream
    }

    fn parse(request: &Request) -> JetResult<DerivativeParams> {
        let variables = request.str_list_value(MULTI_VARIABLES)?;
        let [u, v] = <[String; 2]>::try_from(variables).map_err(|vars| {
            JetError::invalid_value(
                MULTI_VARIABLES,
                vars.join("/"),
                "expected the two horizontal wind components",
            )
        })?;
        let op: DerivativeOp = request.required(MULTI_DERIVATIVE_OPS)?.parse()?;
        let geopotential = match request.value(MULTI_GEOPOTENTIAL) {
            Some(var) if !var.is_empty() => {
                let kind = request
                    .value(MULTI_GEOPOTENTIAL_TYPE)
                    .map(str::parse::<GeopotentialType>)
                    .transpose()?
                    .unwrap_or_default();
                Some((var.to_string(), kind))
            }
            _ => None,
        };
        if op.requires_geopotential() && geopotential.is_none() {
            return Err(JetError::invalid_value(
                MULTI_DERIVATIVE_OPS,
                op.as_str(),
                "height derivatives need MULTI_GEOPOTENTIAL",
            ));
        }
        Ok(DerivativeParams {
            u,
            v,
            op,
            geopotential,
        })
    }
}

struct DerivativeParams {
    u: String,
    v: String,
    op: DerivativeOp,
    geopotential: Option<(String, GeopotentialType)>,
}

impl DerivativeParams {
    /// The geopotential field if the operator differentiates in height.
    fn height_field(&self) -> Option<&(String, GeopotentialType)> {
        self.geopotential.as_ref().filter(|_| self.op.uses_height())
    }
}

impl ScheduledDataSource for PartialDerivativeSource {
    type Output = StructuredGrid;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        LOCAL_KEYS
    }

    fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = key_set(LOCAL_KEYS);
        keys.extend(key_set(OPTIONAL_KEYS));
        keys.extend(self.input.required_keys());
        keys
    }

    fn pass_through(&self) -> Option<&SharedSource<StructuredGrid>> {
        Some(&self.input)
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        let params = Self::parse(request)?;
        for variable in [&params.u, &params.v] {
            task.add_parent(get_task_graph(
                &self.input,
                &Self::input_request(request, variable),
            )?);
        }
        if let Some((variable, _)) = params.height_field() {
            task.add_parent(get_task_graph(
                &self.input,
                &Self::input_request(request, variable),
            )?);
        }
        Ok(())
    }

    fn produce_data(&self, request: &Request) -> JetResult<StructuredGrid> {
        let params = Self::parse(request)?;
        let u = self.input.get_data(&Self::input_request(request, &params.u))?;
        let v = self.input.get_data(&Self::input_request(request, &params.v))?;
        if !u.same_topology(&v) {
            return Err(JetError::InvalidGrid(format!(
                "wind components '{}' and '{}' are on different grids",
                params.u, params.v
            )));
        }

        let height: Option<(CacheHandle<StructuredGrid>, GeopotentialType)> = params
            .height_field()
            .map(|(variable, kind)| {
                self.input
                    .get_data(&Self::input_request(request, variable))
                    .map(|grid| (grid, *kind))
            })
            .transpose()?;
        if let Some((grid, _)) = &height {
            if !grid.same_topology(&u) {
                return Err(JetError::InvalidGrid(format!(
                    "geopotential '{}' is on a different grid than the wind",
                    grid.variable()
                )));
            }
        }

        let stencil = Stencil::new(&u, &v, height.as_ref().map(|(g, kind)| (&**g, *kind)));
        let mut result = u.zeroed_like(params.op.as_str());
        let slab = u.nlats() * u.nlons();
        result
            .data_mut()
            .par_chunks_mut(slab)
            .enumerate()
            .for_each(|(k, level)| stencil.fill_level(params.op, k, level));

        debug!(
            op = %params.op,
            u = %params.u,
            v = %params.v,
            member = u.member(),
            "Computed wind speed derivative"
        );
        Ok(result)
    }
}

/// Finite-difference stencil over wind speed.
pub struct Stencil<'a> {
    u: &'a StructuredGrid,
    v: &'a StructuredGrid,
    speed: Vec<f32>,
    height: Option<(&'a StructuredGrid, f32)>,
}

impl<'a> Stencil<'a> {
    pub fn new(
        u: &'a StructuredGrid,
        v: &'a StructuredGrid,
        height: Option<(&'a StructuredGrid, GeopotentialType)>,
    ) -> Self {
        let speed = u
            .data()
            .par_iter()
            .zip(v.data().par_iter())
            .map(|(a, b)| a.hypot(*b))
            .collect();
        Self {
            u,
            v,
            speed,
            height: height.map(|(grid, kind)| (grid, kind.metres_per_unit())),
        }
    }

    /// Fill level `k` of the result with `op`.
    pub fn fill_level(&self, op: DerivativeOp, k: usize, level: &mut [f32]) {
        let nlon = self.u.nlons();
        for (n, out) in level.iter_mut().enumerate() {
            *out = self.evaluate(op, k, n / nlon, n % nlon);
        }
    }

    fn speed(&self, k: usize, j: usize, i: usize) -> f32 {
        self.speed[self.u.index(k, j, i)]
    }

    /// Wind-normal unit vector at (k, j, i); None in calm air.
    fn normal(&self, k: usize, j: usize, i: usize) -> Option<(f32, f32)> {
        let u = self.u.value(k, j, i);
        let v = self.v.value(k, j, i);
        let speed = u.hypot(v);
        (speed > f32::EPSILON).then(|| (-v / speed, u / speed))
    }

    /// Neighbour indices and spacing in metres along longitude.
    fn x_step(&self, j: usize, i: usize) -> (usize, usize, f32) {
        let lons = self.u.lons();
        let (prev, next) = clamp_neighbours(i, lons.len());
        let dx = (lons[next] - lons[prev]) * self.u.lats()[j].to_radians().cos() * METRES_PER_DEGREE;
        (prev, next, dx)
    }

    fn y_step(&self, j: usize) -> (usize, usize, f32) {
        let lats = self.u.lats();
        let (prev, next) = clamp_neighbours(j, lats.len());
        (prev, next, (lats[next] - lats[prev]) * METRES_PER_DEGREE)
    }

    /// Vertical coordinate at a grid point: height in metres or pressure in Pa.
    fn vertical(&self, use_height: bool, k: usize, j: usize, i: usize) -> f32 {
        match self.height {
            Some((grid, scale)) if use_height => grid.value(k, j, i) * scale,
            _ => self.u.pressure(k, j, i) * 100.0,
        }
    }

    fn ddx(&self, k: usize, j: usize, i: usize) -> f32 {
        let (prev, next, dx) = self.x_step(j, i);
        ratio(self.speed(k, j, next) - self.speed(k, j, prev), dx)
    }

    fn ddy(&self, k: usize, j: usize, i: usize) -> f32 {
        let (prev, next, dy) = self.y_step(j);
        ratio(self.speed(k, next, i) - self.speed(k, prev, i), dy)
    }

    fn ddn(&self, k: usize, j: usize, i: usize, normal: (f32, f32)) -> f32 {
        normal.0 * self.ddx(k, j, i) + normal.1 * self.ddy(k, j, i)
    }

    fn d2dn2(&self, k: usize, j: usize, i: usize, (nx, ny): (f32, f32)) -> f32 {
        let (ip, inx, dx) = self.x_step(j, i);
        let (jp, jn, dy) = self.y_step(j);
        let d2x = three_point(i, self.u.nlons(), |x| {
            let lons = self.u.lons();
            let metres = lons[x] * self.u.lats()[j].to_radians().cos() * METRES_PER_DEGREE;
            (self.speed(k, j, x), metres)
        });
        let d2y = three_point(j, self.u.nlats(), |y| {
            (self.speed(k, y, i), self.u.lats()[y] * METRES_PER_DEGREE)
        });
        let dxy = ratio(
            self.speed(k, jn, inx) - self.speed(k, jn, ip) - self.speed(k, jp, inx)
                + self.speed(k, jp, ip),
            dx * dy,
        );
        nx * nx * d2x + 2.0 * nx * ny * dxy + ny * ny * d2y
    }

    fn vertical_first(&self, use_height: bool, k: usize, j: usize, i: usize) -> f32 {
        let (kp, kn) = clamp_neighbours(k, self.u.nlevels());
        let dz = self.vertical(use_height, kn, j, i) - self.vertical(use_height, kp, j, i);
        ratio(self.speed(kn, j, i) - self.speed(kp, j, i), dz)
    }

    fn vertical_second(&self, use_height: bool, k: usize, j: usize, i: usize) -> f32 {
        three_point(k, self.u.nlevels(), |z| {
            (self.speed(z, j, i), self.vertical(use_height, z, j, i))
        })
    }

    fn mixed(&self, use_height: bool, k: usize, j: usize, i: usize, normal: (f32, f32)) -> f32 {
        let (kp, kn) = clamp_neighbours(k, self.u.nlevels());
        let dz = self.vertical(use_height, kn, j, i) - self.vertical(use_height, kp, j, i);
        ratio(self.ddn(kn, j, i, normal) - self.ddn(kp, j, i, normal), dz)
    }

    pub fn evaluate(&self, op: DerivativeOp, k: usize, j: usize, i: usize) -> f32 {
        let height = self.height.is_some();
        match op {
            DerivativeOp::Ddn => self.normal(k, j, i).map_or(0.0, |n| self.ddn(k, j, i, n)),
            DerivativeOp::D2dn2 => self.normal(k, j, i).map_or(0.0, |n| self.d2dn2(k, j, i, n)),
            DerivativeOp::D2dndz => self
                .normal(k, j, i)
                .map_or(0.0, |n| self.mixed(height, k, j, i, n)),
            DerivativeOp::D2dndp => self
                .normal(k, j, i)
                .map_or(0.0, |n| self.mixed(false, k, j, i, n)),
            DerivativeOp::Ddz => self.vertical_first(true, k, j, i),
            DerivativeOp::D2dz2 => self.vertical_second(true, k, j, i),
            DerivativeOp::Ddp => self.vertical_first(false, k, j, i),
            DerivativeOp::D2dp2 => self.vertical_second(false, k, j, i),
        }
    }
}

/// Second derivative from the three samples around `x`, given as
/// (value, coordinate). At the boundary the stencil moves inwards.
fn three_point(x: usize, n: usize, sample: impl Fn(usize) -> (f32, f32)) -> f32 {
    if n < 3 {
        return 0.0;
    }
    let c = x.clamp(1, n - 2);
    let (s0, z0) = sample(c - 1);
    let (s1, z1) = sample(c);
    let (s2, z2) = sample(c + 1);
    let (ha, hb) = (z1 - z0, z2 - z1);
    if ha == 0.0 || hb == 0.0 || ha + hb == 0.0 {
        return 0.0;
    }
    2.0 * ((s2 - s1) / hb - (s1 - s0) / ha) / (ha + hb)
}

fn clamp_neighbours(x: usize, n: usize) -> (usize, usize) {
    (x.saturating_sub(1), (x + 1).min(n.saturating_sub(1)))
}

/// Finite difference quotient; zero across a degenerate interval.
fn ratio(diff: f32, delta: f32) -> f32 {
    if delta == 0.0 {
        0.0
    } else {
        diff / delta
    }
}
