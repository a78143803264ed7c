//! Horizontal Gaussian smoothing of input fields.

use std::collections::BTreeSet;
use std::sync::Arc;

use jet_common::keys::{BLUR_KERNEL_SIZE, BLUR_SIGMA};
use jet_common::{JetResult, Request, StructuredGrid};
use rayon::prelude::*;
use task_graph::{
    get_task_graph, key_set, MemoryManager, ScheduledDataSource, SharedSource, SourceCore, Task,
};
use tracing::debug;

use crate::config::{BlurConfig, RequestParameters};

const LOCAL_KEYS: &[&str] = &[BLUR_KERNEL_SIZE, BLUR_SIGMA];

/// Separable Gaussian blur applied level by level.
///
/// Requests without blur keys are forwarded to the input unchanged.
pub struct GaussianBlurSource {
    core: SourceCore,
    input: SharedSource<StructuredGrid>,
}

impl GaussianBlurSource {
    pub fn new(input: SharedSource<StructuredGrid>, memory: Arc<MemoryManager>) -> Self {
        Self {
            core: SourceCore::new("gaussian-blur", memory),
            input,
        }
    }
}

impl ScheduledDataSource for GaussianBlurSource {
    type Output = StructuredGrid;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        LOCAL_KEYS
    }

    fn required_keys(&self) -> BTreeSet<String> {
        let mut keys = key_set(LOCAL_KEYS);
        keys.extend(self.input.required_keys());
        keys
    }

    fn pass_through(&self) -> Option<&SharedSource<StructuredGrid>> {
        Some(&self.input)
    }

    fn create_task_graph(&self, request: &Request, task: &mut Task) -> JetResult<()> {
        task.add_parent(get_task_graph(&self.input, &request.without(LOCAL_KEYS))?);
        Ok(())
    }

    fn produce_data(&self, request: &Request) -> JetResult<StructuredGrid> {
        let config = BlurConfig::read_from(request)?;
        let input = self.input.get_data(&request.without(LOCAL_KEYS))?;

        let kernel = gaussian_kernel(&config);
        let mut result = (*input).clone();
        let (nlon, nlat) = (input.nlons(), input.nlats());
        result
            .data_mut()
            .par_chunks_mut(nlon * nlat)
            .for_each(|level| blur_level(level, nlon, nlat, &kernel));

        debug!(
            variable = input.variable(),
            kernel_size = config.kernel_size,
            sigma = config.sigma,
            "Blurred field"
        );
        Ok(result)
    }
}

/// Unnormalized weights for offsets `-r..=r`.
fn gaussian_kernel(config: &BlurConfig) -> Vec<f32> {
    let radius = (config.kernel_size / 2) as i64;
    let two_sigma_sq = 2.0 * config.sigma * config.sigma;
    (-radius..=radius)
        .map(|d| (-((d * d) as f32) / two_sigma_sq).exp())
        .collect()
}

/// Blur one `nlat` x `nlon` level in place: first along rows, then along
/// columns.
fn blur_level(level: &mut [f32], nlon: usize, nlat: usize, kernel: &[f32]) {
    let mut rows = vec![0.0f32; level.len()];
    for j in 0..nlat {
        for i in 0..nlon {
            rows[j * nlon + i] = convolve(kernel, i, nlon, |x| level[j * nlon + x]);
        }
    }
    for j in 0..nlat {
        for i in 0..nlon {
            level[j * nlon + i] = convolve(kernel, j, nlat, |y| rows[y * nlon + i]);
        }
    }
}

/// Weighted mean around `centre`, renormalized over in-range, non-NaN
/// samples. NaN if no sample contributes.
fn convolve(kernel: &[f32], centre: usize, n: usize, sample: impl Fn(usize) -> f32) -> f32 {
    let radius = kernel.len() / 2;
    let mut sum = 0.0;
    let mut weight = 0.0;
    for (offset, w) in kernel.iter().enumerate() {
        let Some(x) = (centre + offset).checked_sub(radius) else {
            continue;
        };
        if x >= n {
            continue;
        }
        let v = sample(x);
        if !v.is_nan() {
            sum += w * v;
            weight += w;
        }
    }
    if weight > 0.0 {
        sum / weight
    } else {
        f32::NAN
    }
}
