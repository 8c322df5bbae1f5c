//! The query engine: per-schema index collection and bottom-up execution
//! over sorted document-id lists.

use std::collections::HashMap;

use crate::indices::{
    to_lower, FlatVectorIndex, HnswVectorIndex, NumericIndex, TagIndex, TextIndex,
};
use crate::postings::PostingContainer;
use crate::query::{parse_query, AstNode, QueryParams, SortOption};
use crate::sort_indices::{NumericSortIndex, StringSortIndex};
use crate::{
    DocId, DocumentAccessor, FieldType, Schema, SortableValue, FLAG_NOINDEX, FLAG_SORTABLE,
};

enum FieldIndex {
    Numeric(NumericIndex),
    Text(TextIndex),
    Tag(TagIndex),
    FlatVector(FlatVectorIndex),
    HnswVector(HnswVectorIndex),
}

enum SortIndex {
    Numeric(NumericSortIndex),
    Str(StringSortIndex),
}

/// Collection of indices for all fields in a schema.
pub struct FieldIndices {
    schema: Schema,
    all_ids: Vec<DocId>,
    indices: HashMap<String, FieldIndex>,
    sort_indices: HashMap<String, SortIndex>,
}

impl FieldIndices {
    pub fn new(schema: Schema) -> Self {
        let mut indices = HashMap::new();
        let mut sort_indices = HashMap::new();

        for (ident, field) in &schema.fields {
            if field.flags & FLAG_NOINDEX == 0 {
                let index = match field.ftype {
                    FieldType::Numeric => FieldIndex::Numeric(NumericIndex::new()),
                    FieldType::Text => FieldIndex::Text(TextIndex::new()),
                    FieldType::Tag => FieldIndex::Tag(TagIndex::new(
                        field.tag_separator,
                        field.tag_case_sensitive,
                    )),
                    FieldType::Vector => {
                        let params = field.vector_params.clone().unwrap_or_default();
                        if params.use_hnsw {
                            FieldIndex::HnswVector(HnswVectorIndex::new(&params))
                        } else {
                            FieldIndex::FlatVector(FlatVectorIndex::new(&params))
                        }
                    }
                };
                indices.insert(ident.clone(), index);
            }

            if field.flags & FLAG_SORTABLE != 0 {
                let index = match field.ftype {
                    FieldType::Numeric => SortIndex::Numeric(NumericSortIndex::new()),
                    _ => SortIndex::Str(StringSortIndex::new()),
                };
                sort_indices.insert(ident.clone(), index);
            }
        }

        Self {
            schema,
            all_ids: Vec::new(),
            indices,
            sort_indices,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn all_docs(&self) -> &[DocId] {
        &self.all_ids
    }

    pub fn add(&mut self, doc: DocId, access: &dyn DocumentAccessor) {
        for (ident, index) in self.indices.iter_mut() {
            match index {
                FieldIndex::Numeric(i) => i.add(doc, access, ident),
                FieldIndex::Text(i) => i.add(doc, access, ident),
                FieldIndex::Tag(i) => i.add(doc, access, ident),
                FieldIndex::FlatVector(i) => i.add(doc, access, ident),
                FieldIndex::HnswVector(i) => i.add(doc, access, ident),
            }
        }
        for (ident, index) in self.sort_indices.iter_mut() {
            match index {
                SortIndex::Numeric(i) => {
                    i.add(doc, access, ident);
                }
                SortIndex::Str(i) => {
                    i.add(doc, access, ident);
                }
            }
        }
        if let Err(pos) = self.all_ids.binary_search(&doc) {
            self.all_ids.insert(pos, doc);
        }
    }

    pub fn remove(&mut self, doc: DocId, access: &dyn DocumentAccessor) {
        for (ident, index) in self.indices.iter_mut() {
            match index {
                FieldIndex::Numeric(i) => i.remove(doc, access, ident),
                FieldIndex::Text(i) => i.remove(doc, access, ident),
                FieldIndex::Tag(i) => i.remove(doc, access, ident),
                FieldIndex::FlatVector(i) => i.remove(doc, access, ident),
                FieldIndex::HnswVector(i) => i.remove(doc, access, ident),
            }
        }
        for index in self.sort_indices.values_mut() {
            match index {
                SortIndex::Numeric(i) => i.remove(doc),
                SortIndex::Str(i) => i.remove(doc),
            }
        }
        if let Ok(pos) = self.all_ids.binary_search(&doc) {
            self.all_ids.remove(pos);
        }
    }
}

/// Result of a search.
#[derive(Clone, Debug, Default)]
pub struct SearchResult {
    /// Total matches before the limit was applied.
    pub total: usize,
    /// Matches before any aggregation (the knn candidate set), used by
    /// multi-shard merging.
    pub pre_aggregation_total: usize,
    pub ids: Vec<DocId>,
    /// Final scores when an ordering (sort or knn) was applied.
    pub scores: Vec<SortableValue>,
    pub error: Option<String>,
}

impl SearchResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Parses a query once and executes it over field indices.
#[derive(Default)]
pub struct SearchAlgorithm {
    query: Option<AstNode>,
    params: QueryParams,
    sort: Option<SortOption>,
}

impl SearchAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `query`; false when it is malformed.
    pub fn init(&mut self, query: &str, params: &QueryParams, sort: Option<SortOption>) -> bool {
        match parse_query(query) {
            Ok(node) => {
                self.query = Some(node);
                self.params = params.clone();
                self.sort = sort;
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, query, "query parse failed");
                self.query = None;
                false
            }
        }
    }

    pub fn search(&self, indices: &FieldIndices, limit: usize) -> SearchResult {
        let Some(query) = &self.query else {
            return SearchResult::failed("query was not initialized");
        };

        let (mut ids, mut scores) = match self.eval(query, indices) {
            Ok(eval) => eval,
            Err(err) => return SearchResult::failed(err.to_string()),
        };
        let total = ids.len();
        let pre_aggregation_total = if let AstNode::Knn { base, .. } = query {
            match base.as_ref() {
                AstNode::Star => indices.all_ids.len(),
                other => match self.eval(other, indices) {
                    Ok((candidates, _)) => candidates.len(),
                    Err(err) => return SearchResult::failed(err.to_string()),
                },
            }
        } else {
            total
        };

        if let Some(sort) = &self.sort {
            let Some(ident) = indices.schema.resolve(&sort.field) else {
                return SearchResult::failed(format!("unknown sort field {}", sort.field));
            };
            let Some(index) = indices.sort_indices.get(ident) else {
                return SearchResult::failed(format!("field {} is not sortable", sort.field));
            };
            scores = match index {
                SortIndex::Numeric(i) => i.sort(&mut ids, limit, sort.descending),
                SortIndex::Str(i) => i.sort(&mut ids, limit, sort.descending),
            };
        }

        ids.truncate(limit);
        scores.truncate(limit);
        SearchResult {
            total,
            pre_aggregation_total,
            ids,
            scores,
            error: None,
        }
    }

    /// Evaluate a node to (ids, scores). All non-KNN nodes return ids in
    /// ascending order with empty scores; a KNN root orders by distance.
    fn eval(
        &self,
        node: &AstNode,
        indices: &FieldIndices,
    ) -> anyhow::Result<(Vec<DocId>, Vec<SortableValue>)> {
        match node {
            AstNode::Star => Ok((indices.all_ids.clone(), Vec::new())),

            AstNode::Term { field, term } => Ok((self.eval_term(field.as_deref(), term, indices)?, Vec::new())),

            AstNode::Range { field, lo, hi } => {
                let ident = indices
                    .schema
                    .resolve(field)
                    .ok_or_else(|| anyhow::anyhow!("unknown field {field}"))?;
                match indices.indices.get(ident) {
                    Some(FieldIndex::Numeric(index)) => {
                        Ok((index.range_inclusive(*lo, *hi), Vec::new()))
                    }
                    _ => anyhow::bail!("field {field} is not numeric"),
                }
            }

            AstNode::Tags { field, tags } => {
                let ident = indices
                    .schema
                    .resolve(field)
                    .ok_or_else(|| anyhow::anyhow!("unknown field {field}"))?;
                match indices.indices.get(ident) {
                    Some(FieldIndex::Tag(index)) => {
                        let lists = tags
                            .iter()
                            .filter_map(|tag| index.matching(tag))
                            .map(|c| c.to_vec())
                            .collect::<Vec<_>>();
                        Ok((union_many(lists), Vec::new()))
                    }
                    _ => anyhow::bail!("field {field} is not a tag field"),
                }
            }

            AstNode::Not(inner) => {
                let (matched, _) = self.eval(inner, indices)?;
                Ok((difference(&indices.all_ids, &matched), Vec::new()))
            }

            AstNode::And(children) => {
                let mut result: Option<Vec<DocId>> = None;
                for child in children {
                    let (ids, _) = self.eval(child, indices)?;
                    result = Some(match result {
                        None => ids,
                        Some(acc) => intersect(&acc, &ids),
                    });
                    if result.as_ref().is_some_and(Vec::is_empty) {
                        break;
                    }
                }
                Ok((result.unwrap_or_default(), Vec::new()))
            }

            AstNode::Or(children) => {
                let mut lists = Vec::with_capacity(children.len());
                for child in children {
                    lists.push(self.eval(child, indices)?.0);
                }
                Ok((union_many(lists), Vec::new()))
            }

            AstNode::Knn {
                base,
                field,
                k,
                ef,
                param,
            } => {
                let ident = indices
                    .schema
                    .resolve(field)
                    .ok_or_else(|| anyhow::anyhow!("unknown field {field}"))?;
                let target = self
                    .params
                    .get_vector(param)
                    .ok_or_else(|| anyhow::anyhow!("missing vector param ${param}"))?;

                // The sub-query narrows the candidate set; a star means no
                // filtering at all.
                let allowed = match base.as_ref() {
                    AstNode::Star => None,
                    other => Some(self.eval(other, indices)?.0),
                };

                let hits = match indices.indices.get(ident) {
                    Some(FieldIndex::HnswVector(index)) => {
                        index.knn(&target, *k, *ef, allowed.as_deref())
                    }
                    Some(FieldIndex::FlatVector(index)) => {
                        index.knn(&target, *k, allowed.as_deref())
                    }
                    _ => anyhow::bail!("field {field} is not a vector field"),
                };

                let ids = hits.iter().map(|&(_, id)| id).collect();
                let scores = hits
                    .iter()
                    .map(|&(dist, _)| SortableValue::Num(f64::from(dist)))
                    .collect();
                Ok((ids, scores))
            }
        }
    }

    fn eval_term(
        &self,
        field: Option<&str>,
        term: &str,
        indices: &FieldIndices,
    ) -> anyhow::Result<Vec<DocId>> {
        let token = to_lower(term);
        match field {
            Some(field) => {
                let ident = indices
                    .schema
                    .resolve(field)
                    .ok_or_else(|| anyhow::anyhow!("unknown field {field}"))?;
                match indices.indices.get(ident) {
                    Some(FieldIndex::Text(index)) => {
                        Ok(index.matching(&token).map(|c| c.to_vec()).unwrap_or_default())
                    }
                    Some(FieldIndex::Tag(index)) => {
                        Ok(index.matching(term).map(|c| c.to_vec()).unwrap_or_default())
                    }
                    _ => anyhow::bail!("field {field} does not support term queries"),
                }
            }
            None => {
                // Field-less terms search every text index.
                let mut lists = Vec::new();
                for index in indices.indices.values() {
                    if let FieldIndex::Text(text) = index {
                        if let Some(container) = text.matching(&token) {
                            lists.push(container.to_vec());
                        }
                    }
                }
                Ok(union_many(lists))
            }
        }
    }
}

fn intersect(a: &[DocId], b: &[DocId]) -> Vec<DocId> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union_many(lists: Vec<Vec<DocId>>) -> Vec<DocId> {
    let mut out: Vec<DocId> = lists.into_iter().flatten().collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn difference(all: &[DocId], subtract: &[DocId]) -> Vec<DocId> {
    let mut out = Vec::with_capacity(all.len().saturating_sub(subtract.len()));
    let mut j = 0;
    for &id in all {
        while j < subtract.len() && subtract[j] < id {
            j += 1;
        }
        if j >= subtract.len() || subtract[j] != id {
            out.push(id);
        }
    }
    out
}
