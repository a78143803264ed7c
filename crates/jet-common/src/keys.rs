//! Request keys understood by the pipeline stages.

// Reader keys
pub const LEVELTYPE: &str = "LEVELTYPE";
pub const VARIABLE: &str = "VARIABLE";
pub const INIT_TIME: &str = "INIT_TIME";
pub const VALID_TIME: &str = "VALID_TIME";
pub const MEMBER: &str = "MEMBER";
pub const MEMBERS: &str = "MEMBERS";

// Isosurface intersection
pub const ISOX_VARIABLES: &str = "ISOX_VARIABLES";
pub const ISOX_VALUES: &str = "ISOX_VALUES";
pub const ISOX_BOUNDING_BOX: &str = "ISOX_BOUNDING_BOX";
pub const ISOX_DERIVATIVE_OPS: &str = "ISOX_DERIVATIVE_OPS";

// Partial derivatives
pub const MULTI_VARIABLES: &str = "MULTI_VARIABLES";
pub const MULTI_DERIVATIVE_OPS: &str = "MULTI_DERIVATIVE_OPS";
pub const MULTI_GEOPOTENTIAL: &str = "MULTI_GEOPOTENTIAL";
pub const MULTI_GEOPOTENTIAL_TYPE: &str = "MULTI_GEOPOTENTIAL_TYPE";

// Gaussian blur
pub const BLUR_KERNEL_SIZE: &str = "BLUR_KERNEL_SIZE";
pub const BLUR_SIGMA: &str = "BLUR_SIGMA";

// Line filters
pub const VARFILTER_VARIABLE: &str = "VARFILTER_VARIABLE";
pub const VARFILTER_VALUE: &str = "VARFILTER_VALUE";
pub const GEOLENFILTER_VALUE: &str = "GEOLENFILTER_VALUE";
pub const ANGLEFILTER_VALUE: &str = "ANGLEFILTER_VALUE";
pub const ENDPRESSUREDIFFFILTER_VALUE: &str = "ENDPRESSUREDIFFFILTER_VALUE";
pub const ENDPRESSUREDIFFFILTER_ANGLE: &str = "ENDPRESSUREDIFFFILTER_ANGLE";
pub const HESSIANFILTER_VALUE: &str = "HESSIANFILTER_VALUE";
pub const HESSIANFILTER_VARIABLES: &str = "HESSIANFILTER_VARIABLES";
pub const HESSIANFILTER_DERIVOPS: &str = "HESSIANFILTER_DERIVOPS";
pub const HESSIANFILTER_GEOPOTENTIAL: &str = "HESSIANFILTER_GEOPOTENTIAL";
pub const HESSIANFILTER_GEOPOTENTIAL_TYPE: &str = "HESSIANFILTER_GEOPOTENTIAL_TYPE";

// Line output
pub const TRAJECTORYVALUES_VARIABLE: &str = "TRAJECTORYVALUES_VARIABLE";
pub const TRAJECTORYVALUES_THICKNESSVAR: &str = "TRAJECTORYVALUES_THICKNESSVAR";
pub const TRAJECTORYVALUES_MEMBERS: &str = "TRAJECTORYVALUES_MEMBERS";
pub const ARROWHEADS_UV_VARIABLES: &str = "ARROWHEADS_UV_VARIABLES";
pub const ARROWHEADS_SOURCEVAR: &str = "ARROWHEADS_SOURCEVAR";
pub const ARROWHEADS_MEMBERS: &str = "ARROWHEADS_MEMBERS";
