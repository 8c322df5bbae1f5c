//! Bridge between the prime table and the search crate: hash-typed values
//! are exposed as documents, with a per-shard key-to-DocId registry.

use std::collections::HashMap;

use bytes::Bytes;
use ember_search::{
    DocId, DocumentAccessor, FieldIndices, QueryParams, Schema, SearchAlgorithm, SearchResult,
    SortOption,
};

use crate::value::{PrimeValue, ValueKind};

/// View of a hash value as a search document. Field values are utf-8
/// strings; vector fields carry little-endian f32 blobs.
pub struct HashDocAccessor<'a> {
    fields: &'a HashMap<Bytes, Bytes>,
}

impl<'a> HashDocAccessor<'a> {
    pub fn new(pv: &'a PrimeValue) -> Option<Self> {
        match pv.kind() {
            ValueKind::Hash(fields) => Some(Self { fields }),
            _ => None,
        }
    }
}

impl DocumentAccessor for HashDocAccessor<'_> {
    fn get_strings(&self, field: &str) -> Option<Vec<String>> {
        let value = self.fields.get(field.as_bytes())?;
        Some(vec![String::from_utf8_lossy(value).into_owned()])
    }

    fn get_vector(&self, field: &str) -> Option<Vec<f32>> {
        let raw = self.fields.get(field.as_bytes())?;
        if raw.len() % 4 != 0 {
            return None;
        }
        Some(
            raw.chunks_exact(4)
                .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4 byte chunk")))
                .collect(),
        )
    }
}

/// Per-shard document index over hash values. The last indexed image of each
/// document is retained so postings can be unwound on update and delete.
pub struct ShardDocIndex {
    indices: FieldIndices,
    key_to_doc: HashMap<Bytes, DocId>,
    indexed: HashMap<DocId, PrimeValue>,
    next_doc: DocId,
}

impl ShardDocIndex {
    pub fn new(schema: Schema) -> Self {
        Self {
            indices: FieldIndices::new(schema),
            key_to_doc: HashMap::new(),
            indexed: HashMap::new(),
            next_doc: 0,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.key_to_doc.len()
    }

    /// Index (or re-index) the document stored under `key`.
    pub fn add_document(&mut self, key: &Bytes, pv: &PrimeValue) {
        if HashDocAccessor::new(pv).is_none() {
            return;
        }
        let doc = match self.key_to_doc.get(key) {
            Some(&doc) => {
                if let Some(old) = self.indexed.remove(&doc) {
                    let accessor = HashDocAccessor::new(&old).expect("indexed image is a hash");
                    self.indices.remove(doc, &accessor);
                }
                doc
            }
            None => {
                let doc = self.next_doc;
                self.next_doc += 1;
                self.key_to_doc.insert(key.clone(), doc);
                doc
            }
        };
        let accessor = HashDocAccessor::new(pv).expect("checked above");
        self.indices.add(doc, &accessor);
        self.indexed.insert(doc, pv.clone());
    }

    /// Drop the document stored under `key`.
    pub fn remove_document(&mut self, key: &Bytes) {
        let Some(doc) = self.key_to_doc.remove(key) else {
            return;
        };
        if let Some(old) = self.indexed.remove(&doc) {
            let accessor = HashDocAccessor::new(&old).expect("indexed image is a hash");
            self.indices.remove(doc, &accessor);
        }
    }

    pub fn search(
        &self,
        query: &str,
        params: &QueryParams,
        sort: Option<SortOption>,
        limit: usize,
    ) -> SearchResult {
        let mut algo = SearchAlgorithm::new();
        if !algo.init(query, params, sort) {
            return SearchResult {
                error: Some("malformed query".to_string()),
                ..SearchResult::default()
            };
        }
        algo.search(&self.indices, limit)
    }

    /// Resolve result doc ids back to keys.
    pub fn resolve_keys(&self, ids: &[DocId]) -> Vec<Bytes> {
        let doc_to_key: HashMap<DocId, &Bytes> =
            self.key_to_doc.iter().map(|(k, &d)| (d, k)).collect();
        ids.iter()
            .filter_map(|id| doc_to_key.get(id).map(|&k| k.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_search::{FieldType, SchemaField};

    fn schema() -> Schema {
        Schema::build(vec![
            ("name".to_string(), SchemaField::new(FieldType::Text, "n")),
            ("kind".to_string(), SchemaField::new(FieldType::Tag, "k")),
        ])
    }

    fn hash_value(pairs: &[(&str, &str)]) -> PrimeValue {
        let map = pairs
            .iter()
            .map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect();
        PrimeValue::new(ValueKind::Hash(map))
    }

    #[test]
    fn documents_are_searchable_and_removable() {
        let mut index = ShardDocIndex::new(schema());
        let red = Bytes::from_static(b"doc:red");
        let blue = Bytes::from_static(b"doc:blue");

        index.add_document(&red, &hash_value(&[("name", "red bicycle"), ("kind", "bike")]));
        index.add_document(&blue, &hash_value(&[("name", "blue car"), ("kind", "car")]));
        assert_eq!(index.doc_count(), 2);

        let result = index.search("bicycle", &QueryParams::new(), None, 10);
        assert_eq!(result.ids.len(), 1);
        assert_eq!(index.resolve_keys(&result.ids), vec![red]);

        index.remove_document(&blue);
        let result = index.search("@kind:{car}", &QueryParams::new(), None, 10);
        assert!(result.ids.is_empty());
    }

    #[test]
    fn reindexing_replaces_old_postings() {
        let mut index = ShardDocIndex::new(schema());
        let key = Bytes::from_static(b"doc:1");
        index.add_document(&key, &hash_value(&[("name", "first title")]));
        index.add_document(&key, &hash_value(&[("name", "second title")]));

        assert!(index
            .search("first", &QueryParams::new(), None, 10)
            .ids
            .is_empty());
        assert_eq!(
            index.search("second", &QueryParams::new(), None, 10).ids.len(),
            1
        );
        assert_eq!(index.doc_count(), 1);
    }

    #[test]
    fn non_hash_values_are_ignored() {
        let mut index = ShardDocIndex::new(schema());
        let key = Bytes::from_static(b"plain");
        index.add_document(&key, &PrimeValue::new_string(b"not a document"));
        assert_eq!(index.doc_count(), 0);
    }
}
