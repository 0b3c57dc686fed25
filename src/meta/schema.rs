use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    LargeInt,
    Float,
    Double,
    Decimal,
    Date,
    DateTime,
    Char,
    Varchar,
    String,
}

impl ColumnType {
    pub fn is_variable_width(&self) -> bool {
        matches!(self, ColumnType::Varchar | ColumnType::String)
    }

    /// Storage width in bytes; variable-width types report their declared
    /// length (or a default) rather than a fixed size.
    pub fn field_length(&self, declared_len: Option<u32>) -> u32 {
        match self {
            ColumnType::Bool | ColumnType::TinyInt => 1,
            ColumnType::SmallInt => 2,
            ColumnType::Int | ColumnType::Float | ColumnType::Date => 4,
            ColumnType::BigInt | ColumnType::Double | ColumnType::DateTime => 8,
            ColumnType::LargeInt | ColumnType::Decimal => 16,
            ColumnType::Char | ColumnType::Varchar | ColumnType::String => {
                declared_len.unwrap_or(65533)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationKind {
    None,
    Sum,
    Min,
    Max,
    Replace,
    ReplaceIfNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeysType {
    DupKeys,
    UniqueKeys,
    AggKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortType {
    Lexical,
    ZOrder,
}

/// Codec for segment pages. Segment layout itself is out of scope; the kind
/// is carried so compaction output inherits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    None,
    Snappy,
    Lz4,
    Lz4Frame,
    Zlib,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Bitmap,
    Inverted,
    BloomFilter,
    NgramBloomFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletIndex {
    pub index_id: i64,
    pub index_name: String,
    pub kind: IndexKind,
    pub col_unique_ids: Vec<u32>,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletColumn {
    pub unique_id: u32,
    pub name: String,
    pub column_type: ColumnType,
    pub length: u32,
    pub index_length: u32,
    pub precision: i32,
    pub frac: i32,
    pub is_key: bool,
    pub is_nullable: bool,
    pub aggregation: AggregationKind,
    pub has_bitmap_index: bool,
    pub is_bf_column: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletSchema {
    pub keys_type: KeysType,
    pub num_short_key_columns: u32,
    pub num_rows_per_row_block: u32,
    pub compression_kind: CompressionKind,
    pub sort_type: SortType,
    pub sort_col_num: u32,
    pub cluster_key_uids: Vec<u32>,
    pub columns: Vec<TabletColumn>,
    pub indexes: Vec<TabletIndex>,
    pub next_column_unique_id: u32,
    pub bloom_filter_fpp: Option<f64>,
    pub sequence_col_idx: i32,
    pub delete_sign_idx: i32,
    pub disable_auto_compaction: bool,
}

impl TabletSchema {
    /// Cache key: the serialized schema itself. Equivalent schemas produce
    /// identical bytes because serialization is field-ordered.
    pub fn to_key(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn has_bf_columns(&self) -> bool {
        self.columns.iter().any(|c| c.is_bf_column)
    }
}

/// Process-wide interning cache for tablet schemas. Many tablets share one
/// schema; interning keeps a single allocation per distinct schema.
pub struct SchemaCache {
    schemas: Mutex<HashMap<Vec<u8>, Arc<TabletSchema>>>,
}

static SCHEMA_CACHE: OnceLock<SchemaCache> = OnceLock::new();

impl SchemaCache {
    pub fn instance() -> &'static SchemaCache {
        SCHEMA_CACHE.get_or_init(|| SchemaCache { schemas: Mutex::new(HashMap::new()) })
    }

    pub fn insert(&self, schema: TabletSchema) -> Arc<TabletSchema> {
        let key = schema.to_key();
        let mut schemas = self.schemas.lock();
        schemas.entry(key).or_insert_with(|| Arc::new(schema)).clone()
    }

    /// Drop entries nothing references anymore. Called opportunistically by
    /// the tablet manager's vacuum loop.
    pub fn prune(&self) -> usize {
        let mut schemas = self.schemas.lock();
        let before = schemas.len();
        schemas.retain(|_, v| Arc::strong_count(v) > 1);
        before - schemas.len()
    }

    pub fn len(&self) -> usize {
        self.schemas.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_column(unique_id: u32, name: &str, is_key: bool) -> TabletColumn {
        TabletColumn {
            unique_id,
            name: name.to_string(),
            column_type: ColumnType::Int,
            length: 4,
            index_length: 4,
            precision: 0,
            frac: 0,
            is_key,
            is_nullable: !is_key,
            aggregation: AggregationKind::None,
            has_bitmap_index: false,
            is_bf_column: false,
            default_value: None,
        }
    }

    fn simple_schema() -> TabletSchema {
        TabletSchema {
            keys_type: KeysType::UniqueKeys,
            num_short_key_columns: 1,
            num_rows_per_row_block: 1024,
            compression_kind: CompressionKind::Lz4Frame,
            sort_type: SortType::Lexical,
            sort_col_num: 1,
            cluster_key_uids: Vec::new(),
            columns: vec![int_column(0, "k", true), int_column(1, "v", false)],
            indexes: Vec::new(),
            next_column_unique_id: 2,
            bloom_filter_fpp: None,
            sequence_col_idx: -1,
            delete_sign_idx: -1,
            disable_auto_compaction: false,
        }
    }

    #[test]
    fn test_schema_interning() {
        let a = SchemaCache::instance().insert(simple_schema());
        let b = SchemaCache::instance().insert(simple_schema());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_field_length() {
        assert_eq!(ColumnType::BigInt.field_length(None), 8);
        assert_eq!(ColumnType::Varchar.field_length(Some(32)), 32);
        assert!(ColumnType::String.is_variable_width());
    }
}
