//! Typed configuration for the jet-core stages.
//!
//! Every stage config can be written into a [`Request`] and read back from
//! one, so the request keys are produced and consumed in one place.

use std::fmt;
use std::str::FromStr;

use jet_common::keys::*;
use jet_common::{JetError, JetResult, LevelType, LineVertex, Request};
use serde::{Deserialize, Serialize};
use task_graph::PipelineConfig;

use crate::derivative::{DerivativeOp, GeopotentialType};

/// A stage configuration carried in request keys.
pub trait RequestParameters: Sized {
    /// Keys written by [`RequestParameters::write_to`].
    fn keys(&self) -> Vec<&'static str>;

    fn write_to(&self, request: &mut Request);

    fn read_from(request: &Request) -> JetResult<Self>;

    fn validate(&self) -> Result<(), String>;
}

fn list_of<const N: usize>(key: &str, values: Vec<String>) -> JetResult<[String; N]> {
    <[String; N]>::try_from(values).map_err(|values| {
        JetError::invalid_value(key, values.join("/"), format!("expected {} entries", N))
    })
}

// ============================================================================
// Isosurface Intersection
// ============================================================================

/// Region the traced lines are cropped to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox3D {
    pub west: f32,
    pub south: f32,
    /// Bottom pressure in hPa (the larger value).
    pub bottom_hpa: f32,
    pub east: f32,
    pub north: f32,
    /// Top pressure in hPa (the smaller value).
    pub top_hpa: f32,
}

impl BoundingBox3D {
    pub const GLOBAL: BoundingBox3D = BoundingBox3D {
        west: -180.0,
        south: -90.0,
        bottom_hpa: 1100.0,
        east: 360.0,
        north: 90.0,
        top_hpa: 1.0,
    };

    pub fn contains(&self, v: &LineVertex) -> bool {
        (self.west..=self.east).contains(&v.x)
            && (self.south..=self.north).contains(&v.y)
            && (self.top_hpa..=self.bottom_hpa).contains(&v.z)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.west > self.east || self.south > self.north {
            return Err(format!("bounding box {} is empty", self));
        }
        if self.top_hpa > self.bottom_hpa {
            return Err(format!(
                "bounding box top ({} hPa) lies below its bottom ({} hPa)",
                self.top_hpa, self.bottom_hpa
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BoundingBox3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.west, self.south, self.bottom_hpa, self.east, self.north, self.top_hpa
        )
    }
}

impl FromStr for BoundingBox3D {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values: Vec<f32> = s
            .split('/')
            .map(|v| v.trim().parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|e| JetError::invalid_value(ISOX_BOUNDING_BOX, s, e.to_string()))?;
        let [west, south, bottom_hpa, east, north, top_hpa] = <[f32; 6]>::try_from(values)
            .map_err(|_| {
                JetError::invalid_value(
                    ISOX_BOUNDING_BOX,
                    s,
                    "expected lon0/lat0/pbot/lon1/lat1/ptop",
                )
            })?;
        Ok(Self {
            west,
            south,
            bottom_hpa,
            east,
            north,
            top_hpa,
        })
    }
}

/// Parameters of the isosurface intersection source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsosurfaceConfig {
    /// Names of the two intersected fields.
    pub variables: [String; 2],
    /// Isovalue of each field.
    pub isovalues: [f32; 2],
    pub bounding_box: BoundingBox3D,
    /// Derivative computed for each field; None intersects the raw field.
    #[serde(default)]
    pub derivative_ops: [Option<DerivativeOp>; 2],
}

impl Default for IsosurfaceConfig {
    fn default() -> Self {
        Self {
            variables: ["ddn".to_string(), "ddp".to_string()],
            isovalues: [0.0, 0.0],
            bounding_box: BoundingBox3D::GLOBAL,
            derivative_ops: [Some(DerivativeOp::Ddn), Some(DerivativeOp::Ddp)],
        }
    }
}

impl IsosurfaceConfig {
    fn ops_value(&self) -> String {
        self.derivative_ops
            .iter()
            .map(|op| op.map_or("none", |op| op.as_str()))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn parse_ops(raw: &str) -> JetResult<[Option<DerivativeOp>; 2]> {
        let ops = raw
            .split('/')
            .map(|op| match op {
                "none" | "" => Ok(None),
                op => op.parse().map(Some),
            })
            .collect::<JetResult<Vec<_>>>()?;
        <[Option<DerivativeOp>; 2]>::try_from(ops)
            .map_err(|_| JetError::invalid_value(ISOX_DERIVATIVE_OPS, raw, "expected opA/opB"))
    }

    pub fn uses_derivatives(&self) -> bool {
        self.derivative_ops.iter().any(Option::is_some)
    }
}

impl RequestParameters for IsosurfaceConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![
            ISOX_VARIABLES,
            ISOX_VALUES,
            ISOX_BOUNDING_BOX,
            ISOX_DERIVATIVE_OPS,
        ]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_str_list(ISOX_VARIABLES, &self.variables);
        request.insert_float_list(ISOX_VALUES, &self.isovalues);
        request.insert(ISOX_BOUNDING_BOX, self.bounding_box.to_string());
        if self.uses_derivatives() {
            request.insert(ISOX_DERIVATIVE_OPS, self.ops_value());
        }
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        let variables = list_of(ISOX_VARIABLES, request.str_list_value(ISOX_VARIABLES)?)?;
        let values = request.float_list_value(ISOX_VALUES)?;
        let isovalues = <[f32; 2]>::try_from(values.as_slice()).map_err(|_| {
            JetError::invalid_value(
                ISOX_VALUES,
                request.value(ISOX_VALUES).unwrap_or_default(),
                "expected two isovalues",
            )
        })?;
        let bounding_box = request.required(ISOX_BOUNDING_BOX)?.parse()?;
        let derivative_ops = match request.value(ISOX_DERIVATIVE_OPS) {
            Some(raw) => Self::parse_ops(raw)?,
            None => [None, None],
        };
        Ok(Self {
            variables,
            isovalues,
            bounding_box,
            derivative_ops,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.variables.iter().any(String::is_empty) {
            return Err("isosurface variables must not be empty".to_string());
        }
        if self.isovalues.iter().any(|v| !v.is_finite()) {
            return Err("isovalues must be finite".to_string());
        }
        self.bounding_box.validate()
    }
}

// ============================================================================
// Field Stages
// ============================================================================

/// Wind components and vertical coordinate used by derivative stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeConfig {
    /// Eastward and northward wind component variables.
    pub wind_variables: [String; 2],
    /// Geopotential variable for height derivatives.
    #[serde(default)]
    pub geopotential: Option<String>,
    #[serde(default)]
    pub geopotential_type: GeopotentialType,
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            wind_variables: ["u".to_string(), "v".to_string()],
            geopotential: None,
            geopotential_type: GeopotentialType::Height,
        }
    }
}

impl RequestParameters for DerivativeConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![MULTI_VARIABLES, MULTI_GEOPOTENTIAL, MULTI_GEOPOTENTIAL_TYPE]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_str_list(MULTI_VARIABLES, &self.wind_variables);
        if let Some(geopotential) = &self.geopotential {
            request.insert(MULTI_GEOPOTENTIAL, geopotential.as_str());
            request.insert(MULTI_GEOPOTENTIAL_TYPE, self.geopotential_type.as_str());
        }
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            wind_variables: list_of(MULTI_VARIABLES, request.str_list_value(MULTI_VARIABLES)?)?,
            geopotential: request.value(MULTI_GEOPOTENTIAL).map(str::to_string),
            geopotential_type: request
                .value(MULTI_GEOPOTENTIAL_TYPE)
                .map(str::parse::<GeopotentialType>)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.wind_variables.iter().any(String::is_empty) {
            return Err("wind variables must not be empty".to_string());
        }
        Ok(())
    }
}

/// Horizontal Gaussian smoothing of input fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlurConfig {
    /// Kernel width in grid points (odd).
    pub kernel_size: usize,
    /// Standard deviation in grid points.
    pub sigma: f32,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            kernel_size: 5,
            sigma: 1.0,
        }
    }
}

impl RequestParameters for BlurConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![BLUR_KERNEL_SIZE, BLUR_SIGMA]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_int(BLUR_KERNEL_SIZE, self.kernel_size as i64);
        request.insert_float(BLUR_SIGMA, self.sigma);
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        let size = request.int_value(BLUR_KERNEL_SIZE)?;
        let kernel_size = usize::try_from(size).map_err(|_| {
            JetError::invalid_value(BLUR_KERNEL_SIZE, size.to_string(), "must not be negative")
        })?;
        let config = Self {
            kernel_size,
            sigma: request.float_value(BLUR_SIGMA)?,
        };
        config
            .validate()
            .map_err(|msg| JetError::invalid_value(BLUR_KERNEL_SIZE, size.to_string(), msg))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(format!(
                "kernel_size must be odd and >= 1, got {}",
                self.kernel_size
            ));
        }
        if !(self.sigma > 0.0) {
            return Err(format!("sigma must be > 0, got {}", self.sigma));
        }
        Ok(())
    }
}

// ============================================================================
// Line Filters
// ============================================================================

/// Keep vertices where a field reaches a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableFilterConfig {
    pub variable: String,
    pub threshold: f32,
}

impl RequestParameters for VariableFilterConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![VARFILTER_VARIABLE, VARFILTER_VALUE]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert(VARFILTER_VARIABLE, self.variable.as_str());
        request.insert_float(VARFILTER_VALUE, self.threshold);
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            variable: request.required(VARFILTER_VARIABLE)?.to_string(),
            threshold: request.float_value(VARFILTER_VALUE)?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.variable.is_empty() {
            return Err("variable filter needs a variable".to_string());
        }
        Ok(())
    }
}

/// Drop lines shorter than a horizontal length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeometricLengthFilterConfig {
    pub min_length_km: f32,
}

impl RequestParameters for GeometricLengthFilterConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![GEOLENFILTER_VALUE]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_float(GEOLENFILTER_VALUE, self.min_length_km);
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            min_length_km: request.float_value(GEOLENFILTER_VALUE)?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.min_length_km < 0.0 {
            return Err("min_length_km must be >= 0".to_string());
        }
        Ok(())
    }
}

/// Split lines at sharp turns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleFilterConfig {
    pub max_angle_deg: f32,
}

impl RequestParameters for AngleFilterConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![ANGLEFILTER_VALUE]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_float(ANGLEFILTER_VALUE, self.max_angle_deg);
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            max_angle_deg: request.float_value(ANGLEFILTER_VALUE)?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if !(0.0..=180.0).contains(&self.max_angle_deg) {
            return Err("max_angle_deg must be within [0, 180]".to_string());
        }
        Ok(())
    }
}

/// Trim line ends that bend or climb steeply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndPressureDifferenceFilterConfig {
    pub max_pressure_difference_hpa: f32,
    pub max_angle_deg: f32,
}

impl RequestParameters for EndPressureDifferenceFilterConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![ENDPRESSUREDIFFFILTER_VALUE, ENDPRESSUREDIFFFILTER_ANGLE]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_float(ENDPRESSUREDIFFFILTER_VALUE, self.max_pressure_difference_hpa);
        request.insert_float(ENDPRESSUREDIFFFILTER_ANGLE, self.max_angle_deg);
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            max_pressure_difference_hpa: request.float_value(ENDPRESSUREDIFFFILTER_VALUE)?,
            max_angle_deg: request.float_value(ENDPRESSUREDIFFFILTER_ANGLE)?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_pressure_difference_hpa < 0.0 {
            return Err("max_pressure_difference_hpa must be >= 0".to_string());
        }
        if !(0.0..=180.0).contains(&self.max_angle_deg) {
            return Err("max_angle_deg must be within [0, 180]".to_string());
        }
        Ok(())
    }
}

/// Keep vertices where wind speed has a maximum across and along the
/// vertical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HessianFilterConfig {
    /// Eigenvalue threshold λ.
    pub lambda_threshold: f32,
    pub wind_variables: [String; 2],
    /// Operators for the normal, vertical and mixed second derivatives.
    pub derivative_ops: [DerivativeOp; 3],
    #[serde(default)]
    pub geopotential: Option<String>,
    #[serde(default)]
    pub geopotential_type: GeopotentialType,
}

impl Default for HessianFilterConfig {
    fn default() -> Self {
        Self {
            lambda_threshold: 0.0,
            wind_variables: ["u".to_string(), "v".to_string()],
            derivative_ops: [DerivativeOp::D2dn2, DerivativeOp::D2dp2, DerivativeOp::D2dndp],
            geopotential: None,
            geopotential_type: GeopotentialType::Height,
        }
    }
}

impl RequestParameters for HessianFilterConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![
            HESSIANFILTER_VALUE,
            HESSIANFILTER_VARIABLES,
            HESSIANFILTER_DERIVOPS,
            HESSIANFILTER_GEOPOTENTIAL,
            HESSIANFILTER_GEOPOTENTIAL_TYPE,
        ]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_float(HESSIANFILTER_VALUE, self.lambda_threshold);
        request.insert_str_list(HESSIANFILTER_VARIABLES, &self.wind_variables);
        let ops: Vec<&str> = self.derivative_ops.iter().map(DerivativeOp::as_str).collect();
        request.insert_str_list(HESSIANFILTER_DERIVOPS, &ops);
        if let Some(geopotential) = &self.geopotential {
            request.insert(HESSIANFILTER_GEOPOTENTIAL, geopotential.as_str());
            request.insert(HESSIANFILTER_GEOPOTENTIAL_TYPE, self.geopotential_type.as_str());
        }
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        let ops = request
            .str_list_value(HESSIANFILTER_DERIVOPS)?
            .iter()
            .map(|op| op.parse::<DerivativeOp>())
            .collect::<JetResult<Vec<_>>>()?;
        let derivative_ops = <[DerivativeOp; 3]>::try_from(ops).map_err(|_| {
            JetError::invalid_value(
                HESSIANFILTER_DERIVOPS,
                request.value(HESSIANFILTER_DERIVOPS).unwrap_or_default(),
                "expected three operators",
            )
        })?;
        Ok(Self {
            lambda_threshold: request.float_value(HESSIANFILTER_VALUE)?,
            wind_variables: list_of(
                HESSIANFILTER_VARIABLES,
                request.str_list_value(HESSIANFILTER_VARIABLES)?,
            )?,
            derivative_ops,
            geopotential: request.value(HESSIANFILTER_GEOPOTENTIAL).map(str::to_string),
            geopotential_type: request
                .value(HESSIANFILTER_GEOPOTENTIAL_TYPE)
                .map(str::parse::<GeopotentialType>)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.wind_variables.iter().any(String::is_empty) {
            return Err("hessian filter wind variables must not be empty".to_string());
        }
        if self.geopotential.is_none()
            && self.derivative_ops.iter().any(DerivativeOp::requires_geopotential)
        {
            return Err("height derivatives need a geopotential variable".to_string());
        }
        Ok(())
    }
}

/// One link of the filter chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    Variable(VariableFilterConfig),
    GeometricLength(GeometricLengthFilterConfig),
    Angle(AngleFilterConfig),
    EndPressureDifference(EndPressureDifferenceFilterConfig),
    Hessian(HessianFilterConfig),
}

impl FilterConfig {
    pub fn name(&self) -> &'static str {
        match self {
            FilterConfig::Variable(_) => "variable",
            FilterConfig::GeometricLength(_) => "geometric_length",
            FilterConfig::Angle(_) => "angle",
            FilterConfig::EndPressureDifference(_) => "end_pressure_difference",
            FilterConfig::Hessian(_) => "hessian",
        }
    }

    pub fn write_to(&self, request: &mut Request) {
        match self {
            FilterConfig::Variable(c) => c.write_to(request),
            FilterConfig::GeometricLength(c) => c.write_to(request),
            FilterConfig::Angle(c) => c.write_to(request),
            FilterConfig::EndPressureDifference(c) => c.write_to(request),
            FilterConfig::Hessian(c) => c.write_to(request),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let result = match self {
            FilterConfig::Variable(c) => c.validate(),
            FilterConfig::GeometricLength(c) => c.validate(),
            FilterConfig::Angle(c) => c.validate(),
            FilterConfig::EndPressureDifference(c) => c.validate(),
            FilterConfig::Hessian(c) => c.validate(),
        };
        result.map_err(|msg| format!("{} filter: {}", self.name(), msg))
    }
}

// ============================================================================
// Line Output
// ============================================================================

const NO_VARIABLE: &str = "none";

fn optional_variable(request: &Request, key: &str) -> JetResult<Option<String>> {
    let value = request.required(key)?;
    Ok((value != NO_VARIABLE && !value.is_empty()).then(|| value.to_string()))
}

fn check_optional(name: &str, variable: &Option<String>) -> Result<(), String> {
    match variable.as_deref() {
        Some("") | Some(NO_VARIABLE) => Err(format!("{} must name a variable", name)),
        _ => Ok(()),
    }
}

/// Fields sampled at every vertex of the selected lines. Unset variables
/// sample as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryValuesConfig {
    /// Colour variable.
    #[serde(default)]
    pub variable: Option<String>,
    /// Variable mapped to tube thickness.
    #[serde(default)]
    pub thickness_variable: Option<String>,
}

impl Default for TrajectoryValuesConfig {
    fn default() -> Self {
        Self {
            variable: Some("wind_speed".to_string()),
            thickness_variable: None,
        }
    }
}

impl RequestParameters for TrajectoryValuesConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![TRAJECTORYVALUES_VARIABLE, TRAJECTORYVALUES_THICKNESSVAR]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert(
            TRAJECTORYVALUES_VARIABLE,
            self.variable.as_deref().unwrap_or(NO_VARIABLE),
        );
        request.insert(
            TRAJECTORYVALUES_THICKNESSVAR,
            self.thickness_variable.as_deref().unwrap_or(NO_VARIABLE),
        );
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            variable: optional_variable(request, TRAJECTORYVALUES_VARIABLE)?,
            thickness_variable: optional_variable(request, TRAJECTORYVALUES_THICKNESSVAR)?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        check_optional("trajectory value variable", &self.variable)?;
        check_optional("trajectory thickness variable", &self.thickness_variable)
    }
}

/// Arrow heads placed at the downstream end of every selected line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrowHeadsConfig {
    /// Eastward and northward wind component variables.
    pub wind_variables: [String; 2],
    /// Colour variable sampled at the arrow; unset samples as zero.
    #[serde(default)]
    pub variable: Option<String>,
}

impl Default for ArrowHeadsConfig {
    fn default() -> Self {
        Self {
            wind_variables: ["u".to_string(), "v".to_string()],
            variable: None,
        }
    }
}

impl RequestParameters for ArrowHeadsConfig {
    fn keys(&self) -> Vec<&'static str> {
        vec![ARROWHEADS_UV_VARIABLES, ARROWHEADS_SOURCEVAR]
    }

    fn write_to(&self, request: &mut Request) {
        request.insert_str_list(ARROWHEADS_UV_VARIABLES, &self.wind_variables);
        request.insert(
            ARROWHEADS_SOURCEVAR,
            self.variable.as_deref().unwrap_or(NO_VARIABLE),
        );
    }

    fn read_from(request: &Request) -> JetResult<Self> {
        Ok(Self {
            wind_variables: list_of(
                ARROWHEADS_UV_VARIABLES,
                request.str_list_value(ARROWHEADS_UV_VARIABLES)?,
            )?,
            variable: optional_variable(request, ARROWHEADS_SOURCEVAR)?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.wind_variables.iter().any(String::is_empty) {
            return Err("arrow head wind variables must not be empty".to_string());
        }
        check_optional("arrow head variable", &self.variable)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Full configuration of a jet-core pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetCoreConfig {
    #[serde(default = "default_level_type")]
    pub level_type: LevelType,

    #[serde(default)]
    pub isosurface: IsosurfaceConfig,

    #[serde(default)]
    pub derivatives: DerivativeConfig,

    /// Smooth input fields before differentiation.
    #[serde(default)]
    pub blur: Option<BlurConfig>,

    /// Filter chain, applied in order.
    #[serde(default = "default_filters")]
    pub filters: Vec<FilterConfig>,

    /// Per-vertex sampling of the filtered lines.
    #[serde(default)]
    pub values: TrajectoryValuesConfig,

    #[serde(default)]
    pub arrow_heads: ArrowHeadsConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_level_type() -> LevelType {
    LevelType::PressureLevels
}

fn default_filters() -> Vec<FilterConfig> {
    vec![
        FilterConfig::Variable(VariableFilterConfig {
            variable: "wind_speed".to_string(),
            threshold: 40.0,
        }),
        FilterConfig::Hessian(HessianFilterConfig::default()),
        FilterConfig::Angle(AngleFilterConfig {
            max_angle_deg: 45.0,
        }),
        FilterConfig::EndPressureDifference(EndPressureDifferenceFilterConfig {
            max_pressure_difference_hpa: 50.0,
            max_angle_deg: 30.0,
        }),
        FilterConfig::GeometricLength(GeometricLengthFilterConfig {
            min_length_km: 500.0,
        }),
    ]
}

impl Default for JetCoreConfig {
    fn default() -> Self {
        Self {
            level_type: default_level_type(),
            isosurface: IsosurfaceConfig::default(),
            derivatives: DerivativeConfig::default(),
            blur: None,
            filters: default_filters(),
            values: TrajectoryValuesConfig::default(),
            arrow_heads: ArrowHeadsConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl JetCoreConfig {
    /// Validate every stage configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.isosurface.validate()?;
        self.derivatives.validate()?;
        if let Some(blur) = &self.blur {
            blur.validate()?;
        }
        if self.isosurface.derivative_ops.iter().flatten().any(|op| op.requires_geopotential())
            && self.derivatives.geopotential.is_none()
        {
            return Err("isosurface height derivatives need a geopotential variable".to_string());
        }
        for (n, filter) in self.filters.iter().enumerate() {
            filter.validate()?;
            if self.filters[..n].iter().any(|f| f.name() == filter.name()) {
                return Err(format!("{} filter configured twice", filter.name()));
            }
        }
        self.values.validate()?;
        self.arrow_heads.validate()?;
        self.pipeline.validate()
    }

    /// Write all stage parameters into `request`.
    pub fn write_to(&self, request: &mut Request) {
        request.insert(LEVELTYPE, self.level_type.as_str());
        self.isosurface.write_to(request);
        if self.isosurface.uses_derivatives() {
            self.derivatives.write_to(request);
        }
        if let Some(blur) = &self.blur {
            blur.write_to(request);
        }
        for filter in &self.filters {
            filter.write_to(request);
        }
        self.values.write_to(request);
        self.arrow_heads.write_to(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_parse() {
        let bbox: BoundingBox3D = "-60/20/1000/40/70/100".parse().unwrap();
        assert_eq!(bbox.west, -60.0);
        assert_eq!(bbox.top_hpa, 100.0);
        assert_eq!(bbox.to_string().parse::<BoundingBox3D>().unwrap(), bbox);
        assert!(bbox.contains(&LineVertex::new(0.0, 45.0, 250.0)));
        assert!(!bbox.contains(&LineVertex::new(0.0, 45.0, 50.0)));
        assert!("1/2/3".parse::<BoundingBox3D>().is_err());
        assert!("a/2/3/4/5/6".parse::<BoundingBox3D>().is_err());
    }

    #[test]
    fn test_isosurface_request_parameters() {
        let config = IsosurfaceConfig {
            derivative_ops: [Some(DerivativeOp::Ddn), None],
            ..IsosurfaceConfig::default()
        };
        let mut request = Request::new();
        config.write_to(&mut request);
        assert_eq!(request.value(ISOX_DERIVATIVE_OPS), Some("ddn/none"));
        assert_eq!(IsosurfaceConfig::read_from(&request).unwrap(), config);

        let raw = IsosurfaceConfig {
            derivative_ops: [None, None],
            ..IsosurfaceConfig::default()
        };
        let mut request = Request::new();
        raw.write_to(&mut request);
        assert!(!request.contains(ISOX_DERIVATIVE_OPS));
    }

    #[test]
    fn test_blur_validation() {
        assert!(BlurConfig::default().validate().is_ok());
        let even = BlurConfig {
            kernel_size: 4,
            sigma: 1.0,
        };
        assert!(even.validate().is_err());
        let request = Request::parse("BLUR_KERNEL_SIZE=4;BLUR_SIGMA=1;").unwrap();
        assert!(BlurConfig::read_from(&request).is_err());
    }

    #[test]
    fn test_hessian_request_parameters() {
        let config = HessianFilterConfig {
            geopotential: Some("z".to_string()),
            geopotential_type: GeopotentialType::Geopotential,
            derivative_ops: [DerivativeOp::D2dn2, DerivativeOp::D2dz2, DerivativeOp::D2dndz],
            ..HessianFilterConfig::default()
        };
        let mut request = Request::new();
        config.write_to(&mut request);
        assert_eq!(request.value(HESSIANFILTER_DERIVOPS), Some("d2dn2/d2dz2/d2dndz"));
        assert_eq!(HessianFilterConfig::read_from(&request).unwrap(), config);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = JetCoreConfig::default();
        assert!(config.validate().is_ok());

        let mut request = Request::new();
        config.write_to(&mut request);
        assert_eq!(request.value(LEVELTYPE), Some("pressure_levels"));
        assert_eq!(request.value(VARFILTER_VARIABLE), Some("wind_speed"));
        assert!(request.contains(MULTI_VARIABLES));
        assert!(!request.contains(BLUR_KERNEL_SIZE));
    }

    #[test]
    fn test_line_output_request_parameters() {
        let values = TrajectoryValuesConfig {
            variable: Some("wind_speed".to_string()),
            thickness_variable: None,
        };
        let arrows = ArrowHeadsConfig::default();
        let mut request = Request::new();
        values.write_to(&mut request);
        arrows.write_to(&mut request);

        assert_eq!(request.value(TRAJECTORYVALUES_THICKNESSVAR), Some("none"));
        assert_eq!(request.value(ARROWHEADS_UV_VARIABLES), Some("u/v"));
        assert_eq!(TrajectoryValuesConfig::read_from(&request).unwrap(), values);
        assert_eq!(ArrowHeadsConfig::read_from(&request).unwrap(), arrows);

        let bad = TrajectoryValuesConfig {
            variable: Some("none".to_string()),
            thickness_variable: None,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_duplicate_filters_rejected() {
        let mut config = JetCoreConfig::default();
        config.filters.push(FilterConfig::Angle(AngleFilterConfig {
            max_angle_deg: 10.0,
        }));
        let err = config.validate().unwrap_err();
        assert!(err.contains("angle"));
    }

    #[test]
    fn test_height_ops_need_geopotential() {
        let mut config = JetCoreConfig::default();
        config.isosurface.derivative_ops = [Some(DerivativeOp::Ddn), Some(DerivativeOp::Ddz)];
        assert!(config.validate().is_err());
        config.derivatives.geopotential = Some("z".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_config_yaml() {
        let yaml = r#"
- type: angle
  max_angle_deg: 30
- type: geometric_length
  min_length_km: 800
"#;
        let filters: Vec<FilterConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].name(), "angle");
        assert_eq!(
            filters[1],
            FilterConfig::GeometricLength(GeometricLengthFilterConfig {
                min_length_km: 800.0
            })
        );
    }
}
