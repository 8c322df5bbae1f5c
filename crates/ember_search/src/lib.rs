//! Per-field search indices and a query engine over them.
//!
//! A [`Schema`] describes the indexed fields of a document collection; a
//! [`FieldIndices`](search::FieldIndices) instance materializes one index per
//! field (numeric, text, tag or vector) plus sort indices for sortable
//! fields. [`SearchAlgorithm`](search::SearchAlgorithm) parses a query into
//! an AST and executes it bottom-up over sorted document-id lists.

pub mod hnsw;
pub mod indices;
pub mod postings;
pub mod query;
pub mod search;
pub mod sort_indices;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use query::{QueryParams, SortOption};
pub use search::{FieldIndices, SearchAlgorithm, SearchResult};

/// Identifier of a document inside one index set.
pub type DocId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorSimilarity {
    L2,
    Ip,
}

/// Field kinds supported by the schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Tag,
    Text,
    Numeric,
    Vector,
}

/// Field is stored but not indexed.
pub const FLAG_NOINDEX: u8 = 1 << 0;
/// Field participates in sorting.
pub const FLAG_SORTABLE: u8 = 1 << 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorParams {
    pub use_hnsw: bool,
    /// Dimension of the indexed vectors.
    pub dim: usize,
    pub sim: VectorSimilarity,
    /// Initial capacity of the vector store.
    pub capacity: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
}

impl Default for VectorParams {
    fn default() -> Self {
        Self {
            use_hnsw: false,
            dim: 0,
            sim: VectorSimilarity::L2,
            capacity: 1000,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
        }
    }
}

/// Describes a specific index field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaField {
    pub ftype: FieldType,
    pub flags: u8,
    /// Short alias; equals the identifier if none was provided.
    pub short_name: String,
    #[serde(default)]
    pub vector_params: Option<VectorParams>,
    #[serde(default = "default_tag_separator")]
    pub tag_separator: char,
    #[serde(default)]
    pub tag_case_sensitive: bool,
}

fn default_tag_separator() -> char {
    ','
}

impl SchemaField {
    pub fn new(ftype: FieldType, short_name: impl Into<String>) -> Self {
        Self {
            ftype,
            flags: 0,
            short_name: short_name.into(),
            vector_params: None,
            tag_separator: ',',
            tag_case_sensitive: false,
        }
    }

    pub fn sortable(mut self) -> Self {
        self.flags |= FLAG_SORTABLE;
        self
    }

    pub fn noindex(mut self) -> Self {
        self.flags |= FLAG_NOINDEX;
        self
    }

    pub fn with_vector_params(mut self, params: VectorParams) -> Self {
        self.vector_params = Some(params);
        self
    }
}

/// Describes the fields of an index. Immutable after index creation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Fields by identifier.
    pub fields: HashMap<String, SchemaField>,
    /// Short-name aliases to identifiers.
    pub field_names: HashMap<String, String>,
}

impl Schema {
    pub fn build(fields: Vec<(String, SchemaField)>) -> Self {
        let mut schema = Schema::default();
        for (ident, field) in fields {
            schema
                .field_names
                .insert(field.short_name.clone(), ident.clone());
            schema.fields.insert(ident, field);
        }
        schema
    }

    /// Resolve a query-side name (identifier or alias) to the identifier.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((ident, _)) = self.fields.get_key_value(name) {
            return Some(ident.as_str());
        }
        self.field_names.get(name).map(String::as_str)
    }
}

/// Access to one document's field values during indexing and search.
pub trait DocumentAccessor {
    /// String values of a field; None when the field is absent.
    fn get_strings(&self, field: &str) -> Option<Vec<String>>;

    fn get_numbers(&self, field: &str) -> Option<Vec<f64>> {
        self.get_strings(field)
            .map(|strings| strings.iter().filter_map(|s| s.parse().ok()).collect())
    }

    /// Dense vector value of a field.
    fn get_vector(&self, field: &str) -> Option<Vec<f32>>;
}

/// A sortable score attached to results.
#[derive(Clone, Debug, PartialEq)]
pub enum SortableValue {
    Num(f64),
    Str(String),
}

impl Default for SortableValue {
    fn default() -> Self {
        SortableValue::Num(0.0)
    }
}
