//! Assembly of the jet-core pipeline.
//!
//! ```text
//! data source ─► [blur] ─► partial derivatives ─► isosurface intersection
//!      │            │              │                        │
//!      │            │              │                        ▼
//!      │            └──────────────┼──────────────► filter 1 ─► ... ─► filter n
//!      │                           └──────────────────────▲ (hessian)
//! ```
//!
//! The variable filter samples the (optionally blurred) input fields, the
//! Hessian filter the derivative stage. Filters run in configured order.
//! Per-vertex values and arrow heads are sampled from the input fields
//! along the last filter's output.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jet_common::keys::{
    ARROWHEADS_MEMBERS, INIT_TIME, MEMBERS, TRAJECTORYVALUES_MEMBERS, VALID_TIME,
};
use jet_common::{
    JetError, JetResult, Request, StructuredGrid, TrajectoryArrowHeads,
    TrajectoryEnsembleSelection, TrajectoryValues,
};
use task_graph::{
    request_data, CacheHandle, DataRequestCompleted, MemoryManager, MultiThreadScheduler,
    RequestOutcome, Scheduler, SharedSource,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::blur::GaussianBlurSource;
use crate::config::{FilterConfig, JetCoreConfig};
use crate::derivative::PartialDerivativeSource;
use crate::filters::{
    AngleFilter, EndPressureDifferenceFilter, FilterStage, GeometricLengthFilter, HessianFilter,
    SelectionSource, VariableFilter,
};
use crate::isosurface::IsosurfaceIntersectionSource;
use crate::output::{TrajectoryArrowHeadsSource, TrajectoryValueSource};

/// Builder for [`JetCorePipeline`].
#[derive(Default)]
pub struct JetCorePipelineBuilder {
    data_source: Option<SharedSource<StructuredGrid>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    memory: Option<Arc<MemoryManager>>,
    config: JetCoreConfig,
}

impl JetCorePipelineBuilder {
    /// Source of the raw forecast fields.
    pub fn data_source(mut self, source: SharedSource<StructuredGrid>) -> Self {
        self.data_source = Some(source);
        self
    }

    /// Defaults to a [`MultiThreadScheduler`] sized by the pipeline config.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Defaults to a new manager with the configured memory limit.
    ///
    /// The data source must cache in the same manager to share its limit.
    pub fn memory_manager(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(mut self, config: JetCoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> JetResult<JetCorePipeline> {
        self.config.validate().map_err(JetError::Config)?;
        let data_source = self
            .data_source
            .ok_or_else(|| JetError::Wiring("no data source set".to_string()))?;
        let memory = self.memory.unwrap_or_else(|| {
            MemoryManager::new("jet-core", self.config.pipeline.memory_limit_kb())
        });
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(MultiThreadScheduler::from_config(&self.config.pipeline)?),
        };

        let grids: SharedSource<StructuredGrid> = match self.config.blur {
            Some(_) => Arc::new(GaussianBlurSource::new(data_source, Arc::clone(&memory))),
            None => data_source,
        };
        let derivatives: SharedSource<StructuredGrid> = Arc::new(PartialDerivativeSource::new(
            Arc::clone(&grids),
            Arc::clone(&memory),
        ));
        let intersection: SelectionSource = Arc::new(IsosurfaceIntersectionSource::new(
            Arc::clone(&derivatives),
            Arc::clone(&derivatives),
            Arc::clone(&memory),
        ));

        let mut output = Arc::clone(&intersection);
        for filter in &self.config.filters {
            output = filter_stage(filter, output, &grids, &derivatives, &memory);
        }
        let values: SharedSource<TrajectoryValues> = Arc::new(TrajectoryValueSource::new(
            Arc::clone(&output),
            Arc::clone(&grids),
            Arc::clone(&memory),
        ));
        let arrow_heads: SharedSource<TrajectoryArrowHeads> =
            Arc::new(TrajectoryArrowHeadsSource::new(
                Arc::clone(&output),
                grids,
                Arc::clone(&memory),
            ));

        info!(
            filters = ?self.config.filters.iter().map(FilterConfig::name).collect::<Vec<_>>(),
            blur = self.config.blur.is_some(),
            memory_limit_kb = memory.limit_kb(),
            "Built jet-core pipeline"
        );

        Ok(JetCorePipeline {
            config: self.config,
            memory,
            scheduler,
            intersection,
            output,
            values,
            arrow_heads,
        })
    }
}

fn filter_stage(
    config: &FilterConfig,
    input: SelectionSource,
    grids: &SharedSource<StructuredGrid>,
    derivatives: &SharedSource<StructuredGrid>,
    memory: &Arc<MemoryManager>,
) -> SelectionSource {
    let memory = Arc::clone(memory);
    match config {
        FilterConfig::Variable(_) => Arc::new(FilterStage::new(
            VariableFilter::new(Arc::clone(grids)),
            input,
            memory,
        )),
        FilterConfig::GeometricLength(_) => {
            Arc::new(FilterStage::new(GeometricLengthFilter::new(), input, memory))
        }
        FilterConfig::Angle(_) => Arc::new(FilterStage::new(AngleFilter::new(), input, memory)),
        FilterConfig::EndPressureDifference(_) => Arc::new(FilterStage::new(
            EndPressureDifferenceFilter::new(),
            input,
            memory,
        )),
        FilterConfig::Hessian(_) => Arc::new(FilterStage::new(
            HessianFilter::new(Arc::clone(derivatives)),
            input,
            memory,
        )),
    }
}

/// A wired jet-core pipeline: isosurface intersection lines refined by a
/// filter chain.
pub struct JetCorePipeline {
    config: JetCoreConfig,
    memory: Arc<MemoryManager>,
    scheduler: Arc<dyn Scheduler>,
    intersection: SelectionSource,
    output: SelectionSource,
    values: SharedSource<TrajectoryValues>,
    arrow_heads: SharedSource<TrajectoryArrowHeads>,
}

impl JetCorePipeline {
    pub fn builder() -> JetCorePipelineBuilder {
        JetCorePipelineBuilder::default()
    }

    pub fn config(&self) -> &JetCoreConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The last stage of the chain.
    pub fn output(&self) -> &SelectionSource {
        &self.output
    }

    /// Request for the jet cores of `members` at one forecast time.
    pub fn compose_request(
        &self,
        init_time: &DateTime<Utc>,
        valid_time: &DateTime<Utc>,
        members: &BTreeSet<u32>,
    ) -> Request {
        let mut request = Request::new();
        self.config.write_to(&mut request);
        request.insert_time(INIT_TIME, init_time);
        request.insert_time(VALID_TIME, valid_time);
        request.insert_uint_set(MEMBERS, members);
        request.insert_uint_set(TRAJECTORYVALUES_MEMBERS, members);
        request.insert_uint_set(ARROWHEADS_MEMBERS, members);
        request
    }

    /// Schedule `request`; completion is announced to subscribers under
    /// its canonical form.
    pub fn request_data(&self, request: &Request) -> JetResult<()> {
        request_data(&self.output, self.scheduler.as_ref(), request)
    }

    /// Filtered lines for `request`, computed on the calling thread if not
    /// cached.
    pub fn get_data(&self, request: &Request) -> JetResult<CacheHandle<TrajectoryEnsembleSelection>> {
        self.output.get_data(request)
    }

    /// Unfiltered intersection lines for `request`.
    pub fn get_intersection_lines(
        &self,
        request: &Request,
    ) -> JetResult<CacheHandle<TrajectoryEnsembleSelection>> {
        self.intersection.get_data(request)
    }

    /// Values sampled along the filtered lines for `request`.
    pub fn get_values(&self, request: &Request) -> JetResult<CacheHandle<TrajectoryValues>> {
        self.values.get_data(request)
    }

    pub fn get_arrow_heads(
        &self,
        request: &Request,
    ) -> JetResult<CacheHandle<TrajectoryArrowHeads>> {
        self.arrow_heads.get_data(request)
    }

    pub fn release_data(&self, handle: CacheHandle<TrajectoryEnsembleSelection>) {
        self.output.release_data(handle);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataRequestCompleted> {
        self.scheduler.subscribe()
    }

    /// Schedule `request` and wait for its completion event.
    pub async fn compute(
        &self,
        request: &Request,
    ) -> JetResult<CacheHandle<TrajectoryEnsembleSelection>> {
        let mut completions = self.subscribe();
        self.request_data(request)?;
        let key = request.canonical();
        loop {
            match completions.recv().await {
                Ok(event) if event.request == key => match event.outcome {
                    RequestOutcome::Completed => return self.get_data(request),
                    RequestOutcome::Failed(reason) => return Err(JetError::Scheduler(reason)),
                },
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Completion events lagged");
                    if !self.scheduler.is_busy() {
                        return self.get_data(request);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(JetError::Scheduler("scheduler shut down".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, GeometricLengthFilterConfig};
    use crate::reader::WeatherPredictionSource;
    use crate::testdata::SyntheticJetReader;
    use task_graph::{FileAccess, SingleThreadScheduler};

    fn data_source(memory: &Arc<MemoryManager>) -> SharedSource<StructuredGrid> {
        Arc::new(WeatherPredictionSource::new(
            SyntheticJetReader::default(),
            Arc::new(FileAccess::new("synthetic")),
            Arc::clone(memory),
        ))
    }

    #[test]
    fn test_build_requires_data_source() {
        let result = JetCorePipeline::builder()
            .scheduler(Arc::new(SingleThreadScheduler::new()))
            .build();
        assert!(matches!(result, Err(JetError::Wiring(_))));
    }

    #[test]
    fn test_build_rejects_duplicate_filters() {
        let memory = MemoryManager::with_limit_mb("test", 64);
        let length = FilterConfig::GeometricLength(GeometricLengthFilterConfig {
            min_length_km: 100.0,
        });
        let config = JetCoreConfig {
            filters: vec![length.clone(), length],
            ..JetCoreConfig::default()
        };
        let result = JetCorePipeline::builder()
            .data_source(data_source(&memory))
            .memory_manager(memory)
            .scheduler(Arc::new(SingleThreadScheduler::new()))
            .config(config)
            .build();
        assert!(matches!(result, Err(JetError::Config(_))));
    }

    #[test]
    fn test_compose_request_carries_all_stages() {
        let memory = MemoryManager::with_limit_mb("test", 64);
        let reader = SyntheticJetReader::default();
        let jet = reader.jet().clone();
        let pipeline = JetCorePipeline::builder()
            .data_source(data_source(&memory))
            .memory_manager(memory)
            .scheduler(Arc::new(SingleThreadScheduler::new()))
            .build()
            .unwrap();

        let request = pipeline.compose_request(
            &jet.init_time,
            &jet.valid_times()[0],
            &BTreeSet::from([0, 2]),
        );
        assert_eq!(request.value(MEMBERS), Some("0/2"));
        // Only optional keys may be absent.
        let required: Vec<String> = pipeline.output().required_keys().into_iter().collect();
        for key in request.missing_keys(&required) {
            assert!(
                key.starts_with("MULTI_GEOPOTENTIAL")
                    || key.starts_with("HESSIANFILTER_GEOPOTENTIAL")
                    || key.starts_with("BLUR_"),
                "missing {}",
                key
            );
        }
    }
}
