// Secondary index engine for the object storage node
//
// Node-local, in-memory indexes over metadata fields. Each index maps a
// stringified field value to the set of keys carrying it. Queries pick the
// best-scoring index for their conditions, post-filter candidates against
// authoritative metadata, and paginate.

use crate::error::{Result, StorageNodeError};
use crate::metadata::{MetadataCache, MetadataStore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Index layout family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Ordered value map
    BTree,

    /// Point-lookup map
    Hash,

    /// Substring-searchable values
    Text,
}

/// Comparison operator in a query condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

/// How a condition combines with the running result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    #[default]
    And,
    Or,
    Not,
}

/// One predicate over a metadata field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCondition {
    /// Metadata field (`key`, `size`, `content_type`, `hash`, `version`,
    /// `created_at`, `updated_at`, `accessed_at`, or `attributes.<name>`)
    pub field: String,

    /// Comparison operator
    pub operator: QueryOperator,

    /// Comparison value; an array for `in`
    pub value: Value,

    /// Combinator with the preceding conditions
    #[serde(default)]
    pub logical_op: LogicalOp,
}

/// Sort clause
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySort {
    /// Field to sort by
    pub field: String,

    /// Reverse the order
    #[serde(default)]
    pub descending: bool,
}

/// Constrained metadata query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataQuery {
    /// Predicates, combined left to right
    #[serde(default)]
    pub conditions: Vec<QueryCondition>,

    /// Optional sort clause
    #[serde(default)]
    pub sort: Option<QuerySort>,

    /// Page size; 0 means unlimited
    #[serde(default)]
    pub limit: usize,

    /// Entries to skip before the page
    #[serde(default)]
    pub offset: usize,

    /// Case-insensitive substring match over key and content type
    #[serde(default)]
    pub full_text: Option<String>,
}

/// Query execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching metadata, paginated
    pub objects: Vec<ObjectMetadata>,

    /// Matches before pagination
    pub total: usize,

    /// Execution time in milliseconds
    pub elapsed_ms: u64,

    /// Name of the index used; empty for a full scan
    pub index_used: String,

    /// Human-readable execution summary
    pub explanation: String,
}

use crate::types::ObjectMetadata;

/// Statistics for one index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    /// Index name
    pub name: String,

    /// Indexed fields
    pub fields: Vec<String>,

    /// Distinct values tracked
    pub distinct_values: usize,

    /// Total key entries across buckets
    pub entries: usize,

    /// Lookups served
    pub lookups: u64,

    /// Whether the background build completed
    pub ready: bool,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

struct IndexInner {
    name: String,
    #[allow(dead_code)]
    index_type: IndexType,
    fields: Vec<String>,
    values: BTreeMap<String, BTreeSet<String>>,
    ready: bool,
    lookups: u64,
    updated_at: DateTime<Utc>,
}

impl IndexInner {
    fn insert(&mut self, value: String, key: &str) {
        self.values.entry(value).or_default().insert(key.to_string());
        self.updated_at = Utc::now();
    }

    fn remove_key(&mut self, key: &str) {
        let mut empty = Vec::new();
        for (value, keys) in self.values.iter_mut() {
            if keys.remove(key) && keys.is_empty() {
                empty.push(value.clone());
            }
        }
        for value in empty {
            self.values.remove(&value);
        }
        self.updated_at = Utc::now();
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            name: self.name.clone(),
            fields: self.fields.clone(),
            distinct_values: self.values.len(),
            entries: self.values.values().map(|s| s.len()).sum(),
            lookups: self.lookups,
            ready: self.ready,
            updated_at: self.updated_at,
        }
    }
}

type SharedIndex = Arc<RwLock<IndexInner>>;

/// Derive the string value of a metadata field, if present and non-empty.
pub fn extract_field(metadata: &ObjectMetadata, field: &str) -> Option<String> {
    let value = match field {
        "key" => metadata.key.clone(),
        "size" => metadata.size.to_string(),
        "content_type" => metadata.content_type.clone(),
        "hash" => metadata.hash.clone(),
        "version" => metadata.version.clone(),
        "created_at" => metadata.created_at.to_rfc3339(),
        "updated_at" => metadata.updated_at.to_rfc3339(),
        "accessed_at" => metadata.accessed_at.to_rfc3339(),
        _ => {
            let attr = field.strip_prefix("attributes.")?;
            json_value_to_string(metadata.attributes.get(attr)?)?
        }
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn json_value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Secondary index engine over the metadata store
pub struct IndexEngine {
    indexes: RwLock<HashMap<String, SharedIndex>>,
    store: Arc<MetadataStore>,
    cache: Arc<MetadataCache>,
}

impl IndexEngine {
    pub fn new(store: Arc<MetadataStore>, cache: Arc<MetadataCache>) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            store,
            cache,
        }
    }

    /// Register an index and build it in the background.
    ///
    /// Registration is O(1); a spawned task scans the metadata store and
    /// populates the value map, after which the index is marked ready.
    pub fn create_index(
        self: &Arc<Self>,
        name: &str,
        fields: Vec<String>,
        index_type: IndexType,
    ) -> Result<()> {
        let shared = self.register(name, fields, index_type)?;
        // Without a runtime the build happens inline on first use instead.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let engine = Arc::clone(self);
            let index_name = name.to_string();
            handle.spawn(async move {
                if let Err(e) = engine.build_index(&shared).await {
                    warn!("background build of index {} failed: {}", index_name, e);
                }
            });
        }
        Ok(())
    }

    /// Register an index without building it; it is built inline the first
    /// time a query selects it.
    pub fn register_index(
        &self,
        name: &str,
        fields: Vec<String>,
        index_type: IndexType,
    ) -> Result<()> {
        self.register(name, fields, index_type)?;
        Ok(())
    }

    fn register(
        &self,
        name: &str,
        fields: Vec<String>,
        index_type: IndexType,
    ) -> Result<SharedIndex> {
        if name.is_empty() || fields.is_empty() {
            return Err(StorageNodeError::InvalidArgument(
                "index name and fields must be non-empty".to_string(),
            ));
        }
        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            return Err(StorageNodeError::AlreadyExists(format!("index {name}")));
        }
        let shared = Arc::new(RwLock::new(IndexInner {
            name: name.to_string(),
            index_type,
            fields,
            values: BTreeMap::new(),
            ready: false,
            lookups: 0,
            updated_at: Utc::now(),
        }));
        indexes.insert(name.to_string(), Arc::clone(&shared));
        info!("registered index {}", name);
        Ok(shared)
    }

    /// Remove an index.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indexes
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageNodeError::NotFound(format!("index {name}")))
    }

    /// Register the default indexes used by fresh deployments.
    pub fn create_default_indexes(self: &Arc<Self>, build_now: bool) -> Result<()> {
        for (name, field) in [
            ("size_index", "size"),
            ("content_type_index", "content_type"),
            ("created_at_index", "created_at"),
            ("hash_index", "hash"),
        ] {
            let result = if build_now {
                self.create_index(name, vec![field.to_string()], IndexType::BTree)
            } else {
                self.register_index(name, vec![field.to_string()], IndexType::BTree)
            };
            if let Err(StorageNodeError::AlreadyExists(_)) = result {
                continue;
            }
            result?;
        }
        Ok(())
    }

    /// Statistics for all registered indexes.
    pub fn list_indexes(&self) -> Vec<IndexStats> {
        let mut stats: Vec<IndexStats> = self
            .indexes
            .read()
            .values()
            .map(|shared| shared.read().stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    async fn build_index(&self, shared: &SharedIndex) -> Result<()> {
        let records = self.store.scan("", 0).await?;
        let mut index = shared.write();
        for metadata in &records {
            for field in index.fields.clone() {
                if let Some(value) = extract_field(metadata, &field) {
                    index.insert(value, &metadata.key);
                }
            }
        }
        index.ready = true;
        debug!(
            "index {} built over {} records ({} distinct values)",
            index.name,
            records.len(),
            index.values.len()
        );
        Ok(())
    }

    /// Apply a stored (or overwritten) record to every index.
    pub fn note_store(&self, metadata: &ObjectMetadata) {
        let indexes: Vec<SharedIndex> = self.indexes.read().values().cloned().collect();
        for shared in indexes {
            let mut index = shared.write();
            for field in index.fields.clone() {
                if let Some(value) = extract_field(metadata, &field) {
                    index.insert(value, &metadata.key);
                }
            }
        }
    }

    /// Replace a record's index entries when its field values change.
    pub fn note_update(&self, old: Option<&ObjectMetadata>, new: &ObjectMetadata) {
        if let Some(old) = old {
            self.note_delete(&old.key);
        }
        self.note_store(new);
    }

    /// Remove a deleted key from every index.
    pub fn note_delete(&self, key: &str) {
        let indexes: Vec<SharedIndex> = self.indexes.read().values().cloned().collect();
        for shared in indexes {
            shared.write().remove_key(key);
        }
    }

    /// Execute a constrained query.
    pub async fn query(&self, query: &MetadataQuery) -> Result<QueryResult> {
        let started = Instant::now();

        let selected = self.select_index(query);
        let (candidates, index_used, mut explanation) = match selected {
            Some((shared, score)) => {
                self.ensure_built(&shared).await?;
                match Self::candidate_keys(&shared, query) {
                    Some(keys) => {
                        let name = shared.read().name.clone();
                        let explanation = format!(
                            "index {name} (score {score}) yielded {} candidates",
                            keys.len()
                        );
                        (keys, name, explanation)
                    }
                    None => {
                        let name = shared.read().name.clone();
                        let keys = self.store.scan_keys("", 0).await?;
                        let explanation = format!(
                            "index {name} cannot cover this condition mix; full scan over {} records",
                            keys.len()
                        );
                        (keys, String::new(), explanation)
                    }
                }
            }
            None => {
                let keys = self.store.scan_keys("", 0).await?;
                let explanation = format!("full scan over {} records", keys.len());
                (keys, String::new(), explanation)
            }
        };

        let mut matches = Vec::new();
        for key in candidates {
            let metadata = match self.fetch(&key).await {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(e) => return Err(e),
            };
            if !evaluate_conditions(&metadata, &query.conditions) {
                continue;
            }
            if let Some(needle) = &query.full_text {
                let needle = needle.to_lowercase();
                if !metadata.key.to_lowercase().contains(&needle)
                    && !metadata.content_type.to_lowercase().contains(&needle)
                {
                    continue;
                }
            }
            matches.push(metadata);
        }

        if let Some(sort) = &query.sort {
            matches.sort_by(|a, b| {
                let va = extract_field(a, &sort.field).unwrap_or_default();
                let vb = extract_field(b, &sort.field).unwrap_or_default();
                va.cmp(&vb).then_with(|| a.key.cmp(&b.key))
            });
            if sort.descending {
                matches.reverse();
            }
        }

        let total = matches.len();
        let offset = query.offset.min(total);
        let mut page: Vec<ObjectMetadata> = matches.split_off(offset);
        if query.limit > 0 && page.len() > query.limit {
            page.truncate(query.limit);
        }
        explanation.push_str(&format!("; {total} matched after filtering"));

        Ok(QueryResult {
            objects: page,
            total,
            elapsed_ms: started.elapsed().as_millis() as u64,
            index_used,
            explanation,
        })
    }

    async fn fetch(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        if let Some(metadata) = self.cache.get(key) {
            return Ok(Some(metadata));
        }
        match self.store.get(key).await {
            Ok(metadata) => {
                self.cache.put(&metadata);
                Ok(Some(metadata))
            }
            // Stale index entries refer to keys that no longer exist.
            Err(StorageNodeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Score every index against the query and pick the best positive one.
    ///
    /// +10 per condition on an indexed field, +5 extra when that condition
    /// is an equality, +3 when the sort field is indexed. Ties break on
    /// index name so selection is deterministic.
    fn select_index(&self, query: &MetadataQuery) -> Option<(SharedIndex, i32)> {
        let indexes = self.indexes.read();
        let mut best: Option<(&String, &SharedIndex, i32)> = None;
        for (name, shared) in indexes.iter() {
            let fields = shared.read().fields.clone();
            let mut score = 0;
            for condition in &query.conditions {
                if fields.iter().any(|f| f == &condition.field) {
                    score += 10;
                    if condition.operator == QueryOperator::Eq {
                        score += 5;
                    }
                }
            }
            if let Some(sort) = &query.sort {
                if fields.iter().any(|f| f == &sort.field) {
                    score += 3;
                }
            }
            if score > 0 {
                let better = match &best {
                    None => true,
                    Some((best_name, _, best_score)) => {
                        score > *best_score || (score == *best_score && name < *best_name)
                    }
                };
                if better {
                    best = Some((name, shared, score));
                }
            }
        }
        best.map(|(_, shared, score)| (Arc::clone(shared), score))
    }

    async fn ensure_built(&self, shared: &SharedIndex) -> Result<()> {
        if shared.read().ready {
            return Ok(());
        }
        self.build_index(shared).await
    }

    /// Fetch candidate keys from the chosen index, or `None` when the
    /// index cannot produce a superset of the matches (the caller then
    /// falls back to a full scan).
    ///
    /// The candidate set must always be a superset of the result set; the
    /// post-filter in `evaluate_conditions` only ever narrows it.
    ///
    /// AND-combined chains narrow monotonically, so any one positive
    /// condition's bucket covers the result: equality reads one bucket,
    /// inequality unions the rest, every other operator conservatively
    /// takes all indexed keys. Once an OR appears every condition can
    /// contribute matches, so the candidates are the union over all of
    /// them — which only covers the result while every condition stays
    /// inside the index.
    fn candidate_keys(shared: &SharedIndex, query: &MetadataQuery) -> Option<Vec<String>> {
        let mut index = shared.write();
        index.lookups += 1;
        let fields = index.fields.clone();
        let indexed = |field: &str| fields.iter().any(|f| f == field);

        let has_or = query
            .conditions
            .iter()
            .skip(1)
            .any(|c| c.logical_op == LogicalOp::Or);

        let keys: BTreeSet<String> = if has_or {
            // A branch on a non-indexed field, a `ne` (which matches keys
            // carrying no value for the field at all), or a negated first
            // condition can each match keys no bucket holds.
            let coverable = query.conditions.iter().all(|c| {
                indexed(&c.field) && c.operator != QueryOperator::Ne
            }) && query
                .conditions
                .first()
                .map(|c| c.logical_op != LogicalOp::Not)
                .unwrap_or(true);
            if !coverable {
                return None;
            }
            if query
                .conditions
                .iter()
                .all(|c| c.operator == QueryOperator::Eq)
            {
                let mut union = BTreeSet::new();
                for condition in &query.conditions {
                    let wanted = json_value_to_string(&condition.value).unwrap_or_default();
                    if let Some(bucket) = index.values.get(&wanted) {
                        union.extend(bucket.iter().cloned());
                    }
                }
                union
            } else {
                index
                    .values
                    .values()
                    .flat_map(|keys| keys.iter().cloned())
                    .collect()
            }
        } else {
            // A negated condition selects the complement of its bucket,
            // so it cannot drive the lookup.
            let driving = query.conditions.iter().enumerate().find(|(i, c)| {
                indexed(&c.field) && (*i > 0 || c.logical_op != LogicalOp::Not)
            });
            match driving {
                Some((_, condition)) => {
                    let wanted = json_value_to_string(&condition.value).unwrap_or_default();
                    match condition.operator {
                        QueryOperator::Eq => index
                            .values
                            .get(&wanted)
                            .cloned()
                            .unwrap_or_default(),
                        QueryOperator::Ne => index
                            .values
                            .iter()
                            .filter(|(value, _)| *value != &wanted)
                            .flat_map(|(_, keys)| keys.iter().cloned())
                            .collect(),
                        _ => index
                            .values
                            .values()
                            .flat_map(|keys| keys.iter().cloned())
                            .collect(),
                    }
                }
                None => return None,
            }
        };
        Some(keys.into_iter().collect())
    }
}

/// Evaluate the condition chain left to right.
fn evaluate_conditions(metadata: &ObjectMetadata, conditions: &[QueryCondition]) -> bool {
    let mut acc = true;
    for (i, condition) in conditions.iter().enumerate() {
        let result = evaluate_condition(metadata, condition);
        acc = if i == 0 {
            match condition.logical_op {
                LogicalOp::Not => !result,
                _ => result,
            }
        } else {
            match condition.logical_op {
                LogicalOp::And => acc && result,
                LogicalOp::Or => acc || result,
                LogicalOp::Not => acc && !result,
            }
        };
    }
    acc
}

fn evaluate_condition(metadata: &ObjectMetadata, condition: &QueryCondition) -> bool {
    let actual = extract_field(metadata, &condition.field);

    if condition.operator == QueryOperator::In {
        let Some(actual) = actual else { return false };
        return match &condition.value {
            Value::Array(options) => options
                .iter()
                .filter_map(json_value_to_string)
                .any(|v| v == actual),
            other => json_value_to_string(other).map(|v| v == actual).unwrap_or(false),
        };
    }

    let expected = json_value_to_string(&condition.value).unwrap_or_default();
    match condition.operator {
        QueryOperator::Eq => actual.as_deref() == Some(expected.as_str()),
        QueryOperator::Ne => actual.as_deref() != Some(expected.as_str()),
        QueryOperator::Like => actual
            .map(|a| a.to_lowercase().contains(&expected.to_lowercase()))
            .unwrap_or(false),
        QueryOperator::Gt | QueryOperator::Gte | QueryOperator::Lt | QueryOperator::Lte => {
            let Some(actual) = actual else { return false };
            let ordering = compare_values(&actual, &expected);
            match condition.operator {
                QueryOperator::Gt => ordering == std::cmp::Ordering::Greater,
                QueryOperator::Gte => ordering != std::cmp::Ordering::Less,
                QueryOperator::Lt => ordering == std::cmp::Ordering::Less,
                QueryOperator::Lte => ordering != std::cmp::Ordering::Greater,
                _ => unreachable!(),
            }
        }
        // `in` is handled before this match.
        QueryOperator::In => unreachable!(),
    }
}

/// Numeric comparison when both sides parse as numbers, else lexicographic.
fn compare_values(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(na), Ok(nb)) => na.partial_cmp(&nb).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryBackend;
    use serde_json::json;

    async fn engine_with(records: Vec<ObjectMetadata>) -> Arc<IndexEngine> {
        let store = Arc::new(MetadataStore::new(Arc::new(MemoryBackend::new())));
        for record in &records {
            store.put(record).await.unwrap();
        }
        let cache = Arc::new(MetadataCache::new(64));
        Arc::new(IndexEngine::new(store, cache))
    }

    fn meta(key: &str, content_type: &str, size: u64) -> ObjectMetadata {
        let mut m = ObjectMetadata::new(key);
        m.content_type = content_type.to_string();
        m.size = size;
        m
    }

    fn eq_condition(field: &str, value: Value) -> QueryCondition {
        QueryCondition {
            field: field.to_string(),
            operator: QueryOperator::Eq,
            value,
            logical_op: LogicalOp::And,
        }
    }

    #[tokio::test]
    async fn eq_query_uses_index_and_returns_matches() {
        let engine = engine_with(vec![
            meta("a", "text/plain", 1),
            meta("b", "text/plain", 2),
            meta("c", "application/json", 3),
        ])
        .await;
        engine
            .register_index("ct_index", vec!["content_type".to_string()], IndexType::Hash)
            .unwrap();

        let result = engine
            .query(&MetadataQuery {
                conditions: vec![eq_condition("content_type", json!("text/plain"))],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.index_used, "ct_index");
        assert_eq!(result.total, 2);
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unindexed_query_falls_back_to_full_scan() {
        let engine = engine_with(vec![meta("a", "text/plain", 1), meta("b", "x", 9)]).await;
        let result = engine
            .query(&MetadataQuery {
                conditions: vec![eq_condition("content_type", json!("x"))],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.index_used, "");
        assert_eq!(result.total, 1);
        assert_eq!(result.objects[0].key, "b");
    }

    #[tokio::test]
    async fn numeric_range_conditions_post_filter() {
        let engine = engine_with(vec![
            meta("small", "t", 5),
            meta("medium", "t", 50),
            meta("large", "t", 500),
        ])
        .await;
        engine
            .register_index("size_index", vec!["size".to_string()], IndexType::BTree)
            .unwrap();

        let result = engine
            .query(&MetadataQuery {
                conditions: vec![QueryCondition {
                    field: "size".to_string(),
                    operator: QueryOperator::Gte,
                    value: json!(50),
                    logical_op: LogicalOp::And,
                }],
                sort: Some(QuerySort {
                    field: "size".to_string(),
                    descending: false,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.index_used, "size_index");
        assert_eq!(result.total, 2);
        // Lexicographic sort on the stringified size: "50" < "500".
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["medium", "large"]);
    }

    #[tokio::test]
    async fn delete_removes_key_and_empty_buckets() {
        let engine = engine_with(vec![meta("a", "text/plain", 1)]).await;
        engine
            .register_index("ct_index", vec!["content_type".to_string()], IndexType::Hash)
            .unwrap();
        engine.note_store(&meta("b", "text/html", 2));
        engine.note_delete("b");

        let result = engine
            .query(&MetadataQuery {
                conditions: vec![eq_condition("content_type", json!("text/html"))],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 0);
    }

    #[tokio::test]
    async fn full_text_matches_key_and_content_type() {
        let engine = engine_with(vec![
            meta("reports/2024", "application/pdf", 1),
            meta("notes", "text/plain", 2),
        ])
        .await;

        let result = engine
            .query(&MetadataQuery {
                full_text: Some("PDF".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.objects[0].key, "reports/2024");
    }

    #[tokio::test]
    async fn pagination_clamps_offset_and_limit() {
        let engine = engine_with(vec![
            meta("a", "t", 1),
            meta("b", "t", 2),
            meta("c", "t", 3),
        ])
        .await;

        let result = engine
            .query(&MetadataQuery {
                sort: Some(QuerySort {
                    field: "key".to_string(),
                    descending: false,
                }),
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].key, "c");

        let past_end = engine
            .query(&MetadataQuery {
                offset: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(past_end.objects.is_empty());
        assert_eq!(past_end.total, 3);
    }

    #[tokio::test]
    async fn create_index_twice_is_already_exists() {
        let engine = engine_with(vec![]).await;
        engine
            .register_index("dup", vec!["size".to_string()], IndexType::BTree)
            .unwrap();
        let err = engine
            .register_index("dup", vec!["size".to_string()], IndexType::BTree)
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");

        engine.drop_index("dup").unwrap();
        let err = engine.drop_index("dup").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn attribute_fields_are_indexable() {
        let mut record = meta("tagged", "t", 1);
        record
            .attributes
            .insert("team".to_string(), json!("storage"));
        let engine = engine_with(vec![record]).await;
        engine
            .register_index("team_index", vec!["attributes.team".to_string()], IndexType::Hash)
            .unwrap();

        let result = engine
            .query(&MetadataQuery {
                conditions: vec![eq_condition("attributes.team", json!("storage"))],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.index_used, "team_index");
        assert_eq!(result.total, 1);
    }

    fn or_query() -> MetadataQuery {
        let mut second = eq_condition("content_type", json!("application/json"));
        second.logical_op = LogicalOp::Or;
        MetadataQuery {
            conditions: vec![
                eq_condition("content_type", json!("text/plain")),
                second,
            ],
            sort: Some(QuerySort {
                field: "key".to_string(),
                descending: false,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn or_conditions_widen_the_match() {
        let engine = engine_with(vec![
            meta("a", "text/plain", 1),
            meta("b", "application/json", 2),
            meta("c", "image/png", 3),
        ])
        .await;

        let result = engine.query(&or_query()).await.unwrap();
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn or_conditions_union_index_buckets() {
        let engine = engine_with(vec![
            meta("a", "text/plain", 1),
            meta("b", "application/json", 2),
            meta("c", "image/png", 3),
        ])
        .await;
        engine
            .register_index("ct_index", vec!["content_type".to_string()], IndexType::Hash)
            .unwrap();

        // Both OR'd buckets must land in the candidate set, not just the
        // first condition's.
        let result = engine.query(&or_query()).await.unwrap();
        assert_eq!(result.index_used, "ct_index");
        assert_eq!(result.total, 2);
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn or_branch_outside_index_falls_back_to_full_scan() {
        let mut unversioned = meta("b", "", 2);
        unversioned.version = "9".to_string();
        let engine = engine_with(vec![meta("a", "text/plain", 1), unversioned]).await;
        engine
            .register_index("ct_index", vec!["content_type".to_string()], IndexType::Hash)
            .unwrap();

        // "b" has no content type, so it is in no bucket; only a full
        // scan can satisfy the version branch of the OR.
        let mut second = eq_condition("version", json!("9"));
        second.logical_op = LogicalOp::Or;
        let result = engine
            .query(&MetadataQuery {
                conditions: vec![
                    eq_condition("content_type", json!("text/plain")),
                    second,
                ],
                sort: Some(QuerySort {
                    field: "key".to_string(),
                    descending: false,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.index_used, "");
        assert_eq!(result.total, 2);
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn or_with_range_branch_widens_to_all_indexed_keys() {
        let engine = engine_with(vec![
            meta("small", "text/plain", 5),
            meta("large", "text/plain", 500),
            meta("other", "application/json", 50),
        ])
        .await;
        engine
            .register_index("size_index", vec!["size".to_string()], IndexType::BTree)
            .unwrap();

        let second = QueryCondition {
            field: "size".to_string(),
            operator: QueryOperator::Gte,
            value: json!(400),
            logical_op: LogicalOp::Or,
        };
        let result = engine
            .query(&MetadataQuery {
                conditions: vec![eq_condition("size", json!(5)), second],
                sort: Some(QuerySort {
                    field: "key".to_string(),
                    descending: false,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.index_used, "size_index");
        assert_eq!(result.total, 2);
        let keys: Vec<&str> = result.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["large", "small"]);
    }
}
