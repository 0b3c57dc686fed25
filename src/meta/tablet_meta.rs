use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::meta::delete_bitmap::{DeleteBitmap, DeleteBitmapEntry, INVALID_SEGMENT_ID};
use crate::meta::file_header::{read_envelope, write_envelope};
use crate::meta::rowset::{RowsetId, RowsetMeta, Version};
use crate::meta::schema::{
    AggregationKind, ColumnType, CompressionKind, IndexKind, KeysType, SchemaCache, SortType,
    TabletColumn, TabletIndex, TabletSchema,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    NotReady,
    Running,
    Tombstoned,
    Stopped,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinlogConfig {
    pub enable: bool,
    pub ttl_seconds: i64,
    pub max_bytes: i64,
    pub max_history_nums: i64,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        BinlogConfig {
            enable: false,
            ttl_seconds: 86400,
            max_bytes: i64::MAX,
            max_history_nums: i64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesCompactionConfig {
    pub goal_size_mbytes: i64,
    pub file_count_threshold: i64,
    pub time_threshold_seconds: i64,
    pub empty_rowsets_threshold: i64,
    pub level_threshold: i64,
}

impl Default for TimeSeriesCompactionConfig {
    fn default() -> Self {
        TimeSeriesCompactionConfig {
            goal_size_mbytes: 1024,
            file_count_threshold: 2000,
            time_threshold_seconds: 3600,
            empty_rowsets_threshold: 5,
            level_threshold: 1,
        }
    }
}

pub const COMPACTION_POLICY_SIZE_BASED: &str = "size_based";
pub const COMPACTION_POLICY_TIME_SERIES: &str = "time_series";

/// Column description as it arrives in a create-tablet request. Lengths and
/// unique ids may be unset; tablet creation fills them in.
#[derive(Debug, Clone)]
pub struct CreateColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub length: Option<u32>,
    pub index_length: Option<u32>,
    pub precision: i32,
    pub frac: i32,
    pub is_key: bool,
    pub is_nullable: bool,
    pub aggregation: Option<AggregationKind>,
    pub default_value: Option<String>,
    pub col_unique_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CreateIndex {
    pub index_id: i64,
    pub index_name: String,
    pub kind: IndexKind,
    pub columns: Vec<String>,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateTabletRequest {
    pub table_id: i64,
    pub index_id: i64,
    pub partition_id: i64,
    pub tablet_id: i64,
    pub replica_id: i64,
    pub schema_hash: i32,
    pub shard_id: u32,
    pub keys_type: KeysType,
    pub short_key_column_count: u32,
    pub columns: Vec<CreateColumn>,
    pub indexes: Vec<CreateIndex>,
    pub sort_type: SortType,
    pub sort_col_num: u32,
    pub cluster_key_uids: Vec<u32>,
    pub compression: Option<CompressionKind>,
    pub bloom_filter_fpp: Option<f64>,
    pub sequence_col_idx: i32,
    pub delete_sign_idx: i32,
    pub enable_merge_on_write: bool,
    pub binlog_config: Option<BinlogConfig>,
    pub compaction_policy: String,
    pub time_series_compaction: TimeSeriesCompactionConfig,
    pub next_unique_id: u32,
}

/// Serialized form of a tablet meta. In cloud mode the rowset lists stay in
/// the metadata service and are left empty here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMetaDescriptor {
    pub table_id: i64,
    pub index_id: i64,
    pub partition_id: i64,
    pub tablet_id: i64,
    pub replica_id: i64,
    pub schema_hash: i32,
    pub shard_id: u32,
    pub tablet_uid: Uuid,
    pub creation_time: DateTime<Utc>,
    pub cumulative_layer_point: i64,
    pub tablet_state: TabletState,
    pub schema: TabletSchema,
    pub rs_metas: Vec<RowsetMeta>,
    pub stale_rs_metas: Vec<RowsetMeta>,
    pub enable_merge_on_write: bool,
    pub delete_bitmap: Vec<DeleteBitmapEntry>,
    pub binlog_config: BinlogConfig,
    pub compaction_policy: String,
    pub time_series_compaction: TimeSeriesCompactionConfig,
}

/// Per-tablet metadata: identity, schema handle, live/stale rowset lists and
/// the delete bitmap. The owning `Tablet` guards it with a reader/writer
/// lock; getters are readers, rowset mutations are writers.
#[derive(Debug)]
pub struct TabletMeta {
    pub table_id: i64,
    pub index_id: i64,
    pub partition_id: i64,
    pub tablet_id: i64,
    pub replica_id: i64,
    pub schema_hash: i32,
    pub shard_id: u32,
    pub tablet_uid: Uuid,
    pub creation_time: DateTime<Utc>,
    pub cumulative_layer_point: i64,
    pub tablet_state: TabletState,
    pub schema: Arc<TabletSchema>,
    pub binlog_config: BinlogConfig,
    pub compaction_policy: String,
    pub time_series_compaction: TimeSeriesCompactionConfig,
    enable_merge_on_write: bool,
    rs_metas: Vec<Arc<RowsetMeta>>,
    stale_rs_metas: Vec<Arc<RowsetMeta>>,
    delete_bitmap: DeleteBitmap,
}

impl TabletMeta {
    /// Build a tablet meta from a frontend create-tablet request: fill column
    /// and index metadata into a descriptor, then hydrate from it.
    pub fn create_from_request(request: &CreateTabletRequest) -> Self {
        let mut has_bf_columns = false;
        let mut columns = Vec::with_capacity(request.columns.len());
        for (ordinal, col) in request.columns.iter().enumerate() {
            let unique_id = col.col_unique_id.unwrap_or(ordinal as u32);
            let length = col.column_type.field_length(col.length);
            let mut index_length = length;
            if col.column_type.is_variable_width() {
                index_length = col.index_length.unwrap_or(10);
            }
            let aggregation = if col.is_key {
                AggregationKind::None
            } else {
                col.aggregation.unwrap_or(AggregationKind::None)
            };
            let mut has_bitmap_index = false;
            let mut is_bf_column = false;
            for index in &request.indexes {
                if !index.columns.iter().any(|c| c.eq_ignore_ascii_case(&col.name)) {
                    continue;
                }
                match index.kind {
                    IndexKind::Bitmap => has_bitmap_index = true,
                    IndexKind::BloomFilter | IndexKind::NgramBloomFilter => is_bf_column = true,
                    IndexKind::Inverted => {}
                }
            }
            has_bf_columns |= is_bf_column;
            columns.push(TabletColumn {
                unique_id,
                name: col.name.clone(),
                column_type: col.column_type,
                length,
                index_length,
                precision: col.precision,
                frac: col.frac,
                is_key: col.is_key,
                is_nullable: col.is_nullable,
                aggregation,
                has_bitmap_index,
                is_bf_column,
                default_value: col.default_value.clone(),
            });
        }

        let indexes = request
            .indexes
            .iter()
            .map(|index| {
                // Resolve column names to unique ids; the frontend may not
                // know them yet.
                let col_unique_ids = index
                    .columns
                    .iter()
                    .filter_map(|name| {
                        columns
                            .iter()
                            .find(|c| c.name.eq_ignore_ascii_case(name))
                            .map(|c| c.unique_id)
                    })
                    .collect();
                TabletIndex {
                    index_id: index.index_id,
                    index_name: index.index_name.clone(),
                    kind: index.kind,
                    col_unique_ids,
                    properties: index.properties.clone(),
                }
            })
            .collect();

        let schema = TabletSchema {
            keys_type: request.keys_type,
            num_short_key_columns: request.short_key_column_count,
            num_rows_per_row_block: 1024,
            compression_kind: request.compression.unwrap_or(CompressionKind::Lz4Frame),
            sort_type: request.sort_type,
            sort_col_num: request.sort_col_num,
            cluster_key_uids: request.cluster_key_uids.clone(),
            columns,
            indexes,
            next_column_unique_id: request.next_unique_id,
            bloom_filter_fpp: if has_bf_columns { request.bloom_filter_fpp } else { None },
            sequence_col_idx: request.sequence_col_idx,
            delete_sign_idx: request.delete_sign_idx,
            disable_auto_compaction: false,
        };

        let descriptor = TabletMetaDescriptor {
            table_id: request.table_id,
            index_id: request.index_id,
            partition_id: request.partition_id,
            tablet_id: request.tablet_id,
            replica_id: request.replica_id,
            schema_hash: request.schema_hash,
            shard_id: request.shard_id,
            tablet_uid: Uuid::new_v4(),
            creation_time: Utc::now(),
            cumulative_layer_point: -1,
            tablet_state: TabletState::Running,
            schema,
            rs_metas: Vec::new(),
            stale_rs_metas: Vec::new(),
            enable_merge_on_write: request.enable_merge_on_write,
            delete_bitmap: Vec::new(),
            binlog_config: request.binlog_config.clone().unwrap_or_default(),
            compaction_policy: request.compaction_policy.clone(),
            time_series_compaction: request.time_series_compaction.clone(),
        };
        // Fresh descriptors carry no bitmap entries, so hydration cannot fail.
        Self::init_from_descriptor(descriptor).unwrap_or_else(|e| {
            panic!("hydrate freshly built tablet meta: {e}");
        })
    }

    fn init_from_descriptor(descriptor: TabletMetaDescriptor) -> Result<Self> {
        let schema = SchemaCache::instance().insert(descriptor.schema);
        let delete_bitmap = DeleteBitmap::new(descriptor.tablet_id);
        delete_bitmap.load_entries(&descriptor.delete_bitmap)?;

        // Delete bitmaps of stale rowsets are never persisted for
        // merge-on-write tablets; reading a stale rowset after restart would
        // surface dead keys. Drop the stale list entirely.
        let stale_rs_metas = if descriptor.enable_merge_on_write {
            Vec::new()
        } else {
            descriptor.stale_rs_metas.into_iter().map(Arc::new).collect()
        };

        Ok(TabletMeta {
            table_id: descriptor.table_id,
            index_id: descriptor.index_id,
            partition_id: descriptor.partition_id,
            tablet_id: descriptor.tablet_id,
            replica_id: descriptor.replica_id,
            schema_hash: descriptor.schema_hash,
            shard_id: descriptor.shard_id,
            tablet_uid: descriptor.tablet_uid,
            creation_time: descriptor.creation_time,
            cumulative_layer_point: descriptor.cumulative_layer_point,
            tablet_state: descriptor.tablet_state,
            schema,
            binlog_config: descriptor.binlog_config,
            compaction_policy: descriptor.compaction_policy,
            time_series_compaction: descriptor.time_series_compaction,
            enable_merge_on_write: descriptor.enable_merge_on_write,
            rs_metas: descriptor.rs_metas.into_iter().map(Arc::new).collect(),
            stale_rs_metas,
            delete_bitmap,
        })
    }

    pub fn enable_merge_on_write(&self) -> bool {
        self.enable_merge_on_write
    }

    pub fn delete_bitmap(&self) -> &DeleteBitmap {
        &self.delete_bitmap
    }

    pub fn rs_metas(&self) -> &[Arc<RowsetMeta>] {
        &self.rs_metas
    }

    pub fn stale_rs_metas(&self) -> &[Arc<RowsetMeta>] {
        &self.stale_rs_metas
    }

    pub fn tablet_state(&self) -> TabletState {
        self.tablet_state
    }

    pub fn set_tablet_state(&mut self, state: TabletState) {
        self.tablet_state = state;
    }

    pub fn set_cumulative_layer_point(&mut self, point: i64) {
        self.cumulative_layer_point = point;
    }

    pub fn set_partition_id(&mut self, partition_id: i64) {
        if (self.partition_id > 0 && self.partition_id != partition_id) || partition_id < 1 {
            warn!(
                tablet_id = self.tablet_id,
                cur = self.partition_id,
                new = partition_id,
                "partition id changed to a conflicting value"
            );
        }
        self.partition_id = partition_id;
    }

    /// Append a rowset. A rowset with equal version and equal id is a
    /// duplicate request and succeeds as a no-op; equal version with a
    /// different id is rejected.
    pub fn add_rowset(&mut self, rs_meta: Arc<RowsetMeta>) -> Result<()> {
        for rs in &self.rs_metas {
            if rs.version == rs_meta.version {
                if rs.rowset_id != rs_meta.rowset_id {
                    return Err(Error::version_already_exists(format!(
                        "version already exists. rowset_id={}, version={}, tablet={}",
                        rs.rowset_id, rs.version, self.tablet_id
                    )));
                }
                return Ok(());
            }
        }
        self.rs_metas.push(rs_meta);
        Ok(())
    }

    pub fn add_rowsets_unchecked(&mut self, to_add: Vec<Arc<RowsetMeta>>) {
        self.rs_metas.extend(to_add);
    }

    /// Remove the first live rowset at `version`, appending it to `out`.
    pub fn delete_rowset_by_version(
        &mut self,
        version: Version,
        out: Option<&mut Vec<Arc<RowsetMeta>>>,
    ) {
        let Some(pos) = self.rs_metas.iter().position(|rs| rs.version == version) else {
            return;
        };
        let removed = self.rs_metas.remove(pos);
        if self.enable_merge_on_write {
            self.delete_bitmap.remove_rowset_cache_version(&removed.rowset_id);
        }
        if let Some(out) = out {
            out.push(removed);
        }
    }

    /// Remove each `to_delete` match from the live list (moving them to stale
    /// unless `same_version`), then append `to_add`.
    pub fn modify_rowsets(
        &mut self,
        to_add: Vec<Arc<RowsetMeta>>,
        to_delete: &[Arc<RowsetMeta>],
        same_version: bool,
    ) {
        for rs_to_del in to_delete {
            if let Some(pos) = self.rs_metas.iter().position(|rs| rs.version == rs_to_del.version)
            {
                let removed = self.rs_metas.remove(pos);
                if self.enable_merge_on_write {
                    self.delete_bitmap.remove_rowset_cache_version(&removed.rowset_id);
                }
            }
        }
        if !same_version {
            self.stale_rs_metas.extend(to_delete.iter().cloned());
        }
        self.rs_metas.extend(to_add);
    }

    /// Replace the live list and clear stale.
    pub fn revise_rowsets(&mut self, rs_metas: Vec<Arc<RowsetMeta>>) {
        self.rs_metas = rs_metas;
        self.stale_rs_metas.clear();
        if self.enable_merge_on_write {
            self.delete_bitmap.clear_rowset_cache_version();
        }
    }

    /// Rebuild the bitmap from `bitmap`, keeping only the sub-bitmaps of
    /// current live and stale rowsets. The caller must hold the tablet lock;
    /// the delete bitmap's own locks make the swap itself safe.
    pub fn revise_delete_bitmap(&self, bitmap: &DeleteBitmap) {
        let revised = DeleteBitmap::new(self.tablet_id);
        for rs in self.rs_metas.iter().chain(self.stale_rs_metas.iter()) {
            let sub = DeleteBitmap::new(self.tablet_id);
            bitmap.subset(
                &(rs.rowset_id, 0, 0),
                &(rs.rowset_id, INVALID_SEGMENT_ID, i64::MAX),
                &sub,
            );
            revised.merge(&sub);
        }
        self.delete_bitmap.assign_from(&revised);
    }

    /// Drop a rowset's bitmaps wholesale (merge-on-write only).
    pub fn remove_rowset_delete_bitmap(&self, rowset_id: &RowsetId) {
        if !self.enable_merge_on_write {
            return;
        }
        self.delete_bitmap
            .remove_range(&(*rowset_id, 0, 0), &(*rowset_id, INVALID_SEGMENT_ID, 0));
        self.delete_bitmap.remove_rowset_cache_version(rowset_id);
    }

    pub fn delete_stale_rowset_by_version(&mut self, version: Version) {
        self.stale_rs_metas.retain(|rs| rs.version != version);
    }

    pub fn clear_stale_rowsets(&mut self) {
        self.stale_rs_metas.clear();
        if self.enable_merge_on_write {
            self.delete_bitmap.clear_rowset_cache_version();
        }
    }

    pub fn clear_rowsets(&mut self) {
        self.rs_metas.clear();
        if self.enable_merge_on_write {
            self.delete_bitmap.clear_rowset_cache_version();
        }
    }

    pub fn acquire_rowset_by_version(&self, version: Version) -> Option<Arc<RowsetMeta>> {
        self.rs_metas.iter().find(|rs| rs.version == version).cloned()
    }

    pub fn acquire_stale_rowset_by_version(&self, version: Version) -> Option<Arc<RowsetMeta>> {
        self.stale_rs_metas.iter().find(|rs| rs.version == version).cloned()
    }

    pub fn version_exists(&self, version: Version) -> bool {
        self.rs_metas.iter().any(|rs| rs.version == version)
    }

    pub fn max_version(&self) -> Version {
        let mut max = Version::new(-1, 0);
        for rs in &self.rs_metas {
            if rs.end_version() > max.end {
                max = rs.version;
            }
        }
        max
    }

    /// End of the contiguous version prefix starting at 0.
    pub fn max_continuous_version_from_beginning(&self) -> Version {
        let mut versions: Vec<Version> = self.rs_metas.iter().map(|rs| rs.version).collect();
        versions.sort();
        let mut max = Version::new(-1, -1);
        for v in versions {
            if v.start != max.end + 1 {
                break;
            }
            max = v;
        }
        max
    }

    pub fn version_count_cross_with_range(&self, range: Version) -> usize {
        self.rs_metas.iter().filter(|rs| range.overlaps(&rs.version)).count()
    }

    pub fn version_count(&self) -> usize {
        self.rs_metas.len()
    }

    fn to_descriptor(&self, config: &Config) -> TabletMetaDescriptor {
        // In cloud mode rowset metas live in the metadata service; the local
        // descriptor only keeps identity, schema and compaction parameters.
        let (rs_metas, stale_rs_metas) = if config.cloud_mode {
            (Vec::new(), Vec::new())
        } else {
            (
                self.rs_metas.iter().map(|rs| (**rs).clone()).collect(),
                self.stale_rs_metas.iter().map(|rs| (**rs).clone()).collect(),
            )
        };
        let delete_bitmap = if self.enable_merge_on_write {
            let stale_ids: HashSet<RowsetId> =
                self.stale_rs_metas.iter().map(|rs| rs.rowset_id).collect();
            self.delete_bitmap.to_entries(&stale_ids).unwrap_or_default()
        } else {
            Vec::new()
        };
        TabletMetaDescriptor {
            table_id: self.table_id,
            index_id: self.index_id,
            partition_id: self.partition_id,
            tablet_id: self.tablet_id,
            replica_id: self.replica_id,
            schema_hash: self.schema_hash,
            shard_id: self.shard_id,
            tablet_uid: self.tablet_uid,
            creation_time: self.creation_time,
            cumulative_layer_point: self.cumulative_layer_point,
            tablet_state: self.tablet_state,
            schema: (*self.schema).clone(),
            rs_metas,
            stale_rs_metas,
            enable_merge_on_write: self.enable_merge_on_write,
            delete_bitmap,
            binlog_config: self.binlog_config.clone(),
            compaction_policy: self.compaction_policy.clone(),
            time_series_compaction: self.time_series_compaction.clone(),
        }
    }

    /// Serialize the descriptor. When the result exceeds the configured size
    /// limit (or serialization fails outright), stale rowsets are dropped and
    /// serialization retried once; a still-failing serialization panics.
    pub fn serialize(&self, config: &Config) -> Vec<u8> {
        let mut descriptor = self.to_descriptor(config);
        if descriptor.partition_id <= 0 {
            warn!(
                tablet_id = self.tablet_id,
                partition_id = descriptor.partition_id,
                "serializing tablet meta with invalid partition id"
            );
        }
        let first = bincode::serialize(&descriptor);
        let needs_retry = match &first {
            Ok(data) => {
                data.len() > config.tablet_meta_serialize_size_limit
                    && !descriptor.stale_rs_metas.is_empty()
            }
            Err(_) => true,
        };
        if !needs_retry {
            return first.unwrap_or_else(|e| {
                panic!("failed to serialize meta for tablet {}: {e}", self.tablet_id)
            });
        }

        let stale_num = descriptor.stale_rs_metas.len();
        descriptor.stale_rs_metas.clear();
        let stale_ids: HashSet<RowsetId> =
            self.stale_rs_metas.iter().map(|rs| rs.rowset_id).collect();
        if self.enable_merge_on_write {
            descriptor.delete_bitmap = self.delete_bitmap.to_entries(&stale_ids).unwrap_or_default();
        }
        match bincode::serialize(&descriptor) {
            Ok(data) => {
                warn!(
                    tablet_id = self.tablet_id,
                    limit = config.tablet_meta_serialize_size_limit,
                    stale_rowset_num = stale_num,
                    size_after_clean = data.len(),
                    "tablet meta serialization exceeded limit, dropped stale rowsets"
                );
                data
            }
            Err(e) => panic!("failed to serialize meta for tablet {}: {e}", self.tablet_id),
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<TabletMeta> {
        let descriptor: TabletMetaDescriptor = bincode::deserialize(data)
            .map_err(|e| Error::new(ErrorKind::InitFailed, format!("parse tablet meta: {e}")))?;
        Self::init_from_descriptor(descriptor)
    }

    /// Persist to `path` in the checksummed envelope.
    pub fn save(&self, path: &Path, config: &Config) -> Result<()> {
        if self.tablet_uid.is_nil() {
            warn!(tablet_id = self.tablet_id, "saving tablet meta with nil uid");
        }
        let start = Instant::now();
        let data = self.serialize(config);
        let serialized = start.elapsed();
        write_envelope(path, &data)?;
        let total = start.elapsed();
        if total.as_secs() >= 1 {
            info!(
                tablet_id = self.tablet_id,
                serialize_us = serialized.as_micros() as u64,
                write_us = (total - serialized).as_micros() as u64,
                bytes = data.len(),
                "saving tablet meta was slow"
            );
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<TabletMeta> {
        let body = read_envelope(path)?;
        Self::deserialize(&body)
    }

    /// Pretty JSON rendering of the descriptor, with bitmap bytes as base64.
    pub fn to_json(&self, config: &Config) -> Result<String> {
        let descriptor = self.to_descriptor(config);
        let mut value = serde_json::to_value(&descriptor)
            .map_err(|e| Error::internal(format!("tablet meta to json: {e}")))?;
        if let Some(entries) = value
            .get_mut("delete_bitmap")
            .and_then(|v| v.as_array_mut())
        {
            for (entry, raw) in entries.iter_mut().zip(descriptor.delete_bitmap.iter()) {
                entry["bitmap"] = serde_json::Value::String(base64::encode(&raw.bitmap));
            }
        }
        serde_json::to_string_pretty(&value)
            .map_err(|e| Error::internal(format!("tablet meta to json: {e}")))
    }
}

/// Equality covers identity, state, schema contents, the ordered live rowset
/// list and the compaction parameters. Stale rowsets and the delete bitmap
/// are excluded.
impl PartialEq for TabletMeta {
    fn eq(&self, other: &Self) -> bool {
        self.table_id == other.table_id
            && self.index_id == other.index_id
            && self.partition_id == other.partition_id
            && self.tablet_id == other.tablet_id
            && self.replica_id == other.replica_id
            && self.schema_hash == other.schema_hash
            && self.shard_id == other.shard_id
            && self.tablet_uid == other.tablet_uid
            && self.creation_time == other.creation_time
            && self.cumulative_layer_point == other.cumulative_layer_point
            && self.tablet_state == other.tablet_state
            && *self.schema == *other.schema
            && self.rs_metas.len() == other.rs_metas.len()
            && self
                .rs_metas
                .iter()
                .zip(other.rs_metas.iter())
                .all(|(a, b)| **a == **b)
            && self.enable_merge_on_write == other.enable_merge_on_write
            && self.compaction_policy == other.compaction_policy
            && self.time_series_compaction == other.time_series_compaction
    }
}
