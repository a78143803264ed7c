//! Grid readers and the disk-reader source feeding the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jet_common::keys::{INIT_TIME, LEVELTYPE, MEMBER, VALID_TIME, VARIABLE};
use jet_common::{JetError, JetResult, LevelType, Request, StructuredGrid};
use task_graph::{
    key_set, FileAccess, FileAccessToken, MemoryManager, ScheduledDataSource, SourceCore, Task,
};
use tracing::{debug, info};

const READER_KEYS: &[&str] = &[LEVELTYPE, VARIABLE, INIT_TIME, VALID_TIME, MEMBER];

/// Access to gridded forecast fields.
///
/// Reading takes the file-access token of the underlying format library, so
/// concurrent reads through one library are impossible.
pub trait GridReader: Send + Sync + 'static {
    fn available_level_types(&self) -> Vec<LevelType>;

    fn available_variables(&self, level_type: LevelType) -> Vec<String>;

    fn available_ensemble_members(&self, level_type: LevelType, variable: &str) -> BTreeSet<u32>;

    fn available_init_times(&self, level_type: LevelType, variable: &str) -> Vec<DateTime<Utc>>;

    fn available_valid_times(
        &self,
        level_type: LevelType,
        variable: &str,
        init_time: &DateTime<Utc>,
    ) -> Vec<DateTime<Utc>>;

    fn read_grid(
        &self,
        token: &mut FileAccessToken,
        level_type: LevelType,
        variable: &str,
        init_time: &DateTime<Utc>,
        valid_time: &DateTime<Utc>,
        member: u32,
    ) -> JetResult<StructuredGrid>;
}

/// One field a reader can return.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRequest {
    pub level_type: LevelType,
    pub variable: String,
    pub init_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub member: u32,
}

impl FieldRequest {
    pub fn from_request(request: &Request) -> JetResult<Self> {
        let member = request.int_value(MEMBER)?;
        Ok(Self {
            level_type: request.required(LEVELTYPE)?.parse()?,
            variable: request.required(VARIABLE)?.to_string(),
            init_time: request.time_value(INIT_TIME)?,
            valid_time: request.time_value(VALID_TIME)?,
            member: u32::try_from(member).map_err(|_| {
                JetError::invalid_value(MEMBER, member.to_string(), "must be a member index")
            })?,
        })
    }

    /// Check the field against the reader's metadata.
    fn check_available<R: GridReader + ?Sized>(&self, reader: &R) -> JetResult<()> {
        if !reader.available_level_types().contains(&self.level_type) {
            return Err(JetError::bad_request(format!(
                "level type {} not available",
                self.level_type
            )));
        }
        if !reader
            .available_variables(self.level_type)
            .contains(&self.variable)
        {
            return Err(JetError::bad_request(format!(
                "variable '{}' not available on {}",
                self.variable, self.level_type
            )));
        }
        if !reader
            .available_ensemble_members(self.level_type, &self.variable)
            .contains(&self.member)
        {
            return Err(JetError::bad_request(format!(
                "member {} of '{}' not available",
                self.member, self.variable
            )));
        }
        if !reader
            .available_init_times(self.level_type, &self.variable)
            .contains(&self.init_time)
        {
            return Err(JetError::bad_request(format!(
                "init time {} of '{}' not available",
                self.init_time, self.variable
            )));
        }
        if !reader
            .available_valid_times(self.level_type, &self.variable, &self.init_time)
            .contains(&self.valid_time)
        {
            return Err(JetError::bad_request(format!(
                "valid time {} of '{}' (init {}) not available",
                self.valid_time, self.variable, self.init_time
            )));
        }
        Ok(())
    }
}

/// Disk-reader stage serving fields from a [`GridReader`].
pub struct WeatherPredictionSource<R: GridReader> {
    core: SourceCore,
    reader: R,
    access: Arc<FileAccess>,
}

impl<R: GridReader> WeatherPredictionSource<R> {
    pub fn new(reader: R, access: Arc<FileAccess>, memory: Arc<MemoryManager>) -> Self {
        Self {
            core: SourceCore::new("weather-prediction-reader", memory),
            reader,
            access,
        }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }
}

impl<R: GridReader> ScheduledDataSource for WeatherPredictionSource<R> {
    type Output = StructuredGrid;

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn locally_required_keys(&self) -> &[&'static str] {
        READER_KEYS
    }

    fn required_keys(&self) -> BTreeSet<String> {
        key_set(READER_KEYS)
    }

    fn is_disk_reader(&self) -> bool {
        true
    }

    fn create_task_graph(&self, _request: &Request, _task: &mut Task) -> JetResult<()> {
        Ok(())
    }

    fn produce_data(&self, request: &Request) -> JetResult<StructuredGrid> {
        let field = FieldRequest::from_request(request)?;
        field.check_available(&self.reader)?;

        let mut token = self.access.acquire();
        debug!(
            library = token.library(),
            variable = %field.variable,
            member = field.member,
            valid_time = %field.valid_time,
            "Reading field"
        );
        let grid = self.reader.read_grid(
            &mut token,
            field.level_type,
            &field.variable,
            &field.init_time,
            &field.valid_time,
            field.member,
        )?;
        info!(
            variable = %field.variable,
            member = field.member,
            points = grid.num_values(),
            "Read field"
        );
        Ok(grid)
    }
}

type FieldKey = (LevelType, String, DateTime<Utc>, DateTime<Utc>, u32);

/// Reader over fields held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryReader {
    fields: BTreeMap<FieldKey, StructuredGrid>,
}

impl InMemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field under the identity stored in the grid.
    pub fn insert(&mut self, grid: StructuredGrid) {
        let info = grid.info();
        let key = (
            grid.level_type(),
            info.variable.clone(),
            info.init_time,
            info.valid_time,
            info.member,
        );
        self.fields.insert(key, grid);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn keys_matching<'a>(
        &'a self,
        level_type: LevelType,
        variable: &'a str,
    ) -> impl Iterator<Item = &'a FieldKey> + 'a {
        self.fields
            .keys()
            .filter(move |k| k.0 == level_type && k.1 == variable)
    }
}

impl GridReader for InMemoryReader {
    fn available_level_types(&self) -> Vec<LevelType> {
        let mut types: Vec<LevelType> = self.fields.keys().map(|k| k.0).collect();
        types.dedup();
        types
    }

    fn available_variables(&self, level_type: LevelType) -> Vec<String> {
        let variables: BTreeSet<&String> = self
            .fields
            .keys()
            .filter(|k| k.0 == level_type)
            .map(|k| &k.1)
            .collect();
        variables.into_iter().cloned().collect()
    }

    fn available_ensemble_members(&self, level_type: LevelType, variable: &str) -> BTreeSet<u32> {
        self.keys_matching(level_type, variable).map(|k| k.4).collect()
    }

    fn available_init_times(&self, level_type: LevelType, variable: &str) -> Vec<DateTime<Utc>> {
        let times: BTreeSet<DateTime<Utc>> =
            self.keys_matching(level_type, variable).map(|k| k.2).collect();
        times.into_iter().collect()
    }

    fn available_valid_times(
        &self,
        level_type: LevelType,
        variable: &str,
        init_time: &DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let times: BTreeSet<DateTime<Utc>> = self
            .keys_matching(level_type, variable)
            .filter(|k| &k.2 == init_time)
            .map(|k| k.3)
            .collect();
        times.into_iter().collect()
    }

    fn read_grid(
        &self,
        _token: &mut FileAccessToken,
        level_type: LevelType,
        variable: &str,
        init_time: &DateTime<Utc>,
        valid_time: &DateTime<Utc>,
        member: u32,
    ) -> JetResult<StructuredGrid> {
        let key = (
            level_type,
            variable.to_string(),
            *init_time,
            *valid_time,
            member,
        );
        self.fields.get(&key).cloned().ok_or_else(|| {
            JetError::unavailable(format!(
                "{} '{}' member {} at {}",
                level_type, variable, member, valid_time
            ))
        })
    }
}
