//! Per-field indices: numeric tree, inverted text/tag postings, and the two
//! vector stores.

use std::collections::{BTreeSet, HashMap, HashSet};

use unicode_segmentation::UnicodeSegmentation;

use crate::hnsw::{distance, HnswGraph};
use crate::postings::{CompressedSortedSet, PostingContainer, SortedVector};
use crate::{DocId, DocumentAccessor, VectorParams, VectorSimilarity};

fn is_all_ascii(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii())
}

/// Lowercase with an ASCII fast path.
pub fn to_lower(word: &str) -> String {
    if is_all_ascii(word) {
        word.to_ascii_lowercase()
    } else {
        word.to_lowercase()
    }
}

/// Unicode-aware word segmentation, lowercased.
pub fn tokenize_words(text: &str) -> HashSet<String> {
    text.unicode_words().map(to_lower).collect()
}

/// Split a tag list on `separator`, strip ASCII whitespace, deduplicate and
/// lowercase unless case-sensitive.
pub fn normalize_tags(taglist: &str, case_sensitive: bool, separator: char) -> HashSet<String> {
    if !is_all_ascii(taglist) {
        tracing::warn!("non ascii tag usage");
    }
    taglist
        .split(separator)
        .map(|tag| tag.trim_matches(|c: char| c.is_ascii_whitespace()))
        .filter(|tag| !tag.is_empty())
        .map(|tag| {
            if case_sensitive {
                tag.to_string()
            } else {
                tag.to_ascii_lowercase()
            }
        })
        .collect()
}

/// Ordered f64 wrapper keyed by total order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Ordered multiset of (value, doc) pairs.
#[derive(Default)]
pub struct NumericIndex {
    entries: BTreeSet<(OrderedF64, DocId)>,
}

impl NumericIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        for num in doc.get_numbers(field).unwrap_or_default() {
            self.entries.insert((OrderedF64(num), id));
        }
    }

    pub fn remove(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        for num in doc.get_numbers(field).unwrap_or_default() {
            self.entries.remove(&(OrderedF64(num), id));
        }
    }

    /// Sorted, de-duplicated ids with value in `[l, r)`.
    pub fn range(&self, l: f64, r: f64) -> Vec<DocId> {
        self.collect_range((OrderedF64(l), 0), std::ops::Bound::Excluded((OrderedF64(r), 0)))
    }

    /// Sorted, de-duplicated ids with value in `[l, r]`, the query-dialect
    /// interval.
    pub fn range_inclusive(&self, l: f64, r: f64) -> Vec<DocId> {
        self.collect_range(
            (OrderedF64(l), 0),
            std::ops::Bound::Included((OrderedF64(r), DocId::MAX)),
        )
    }

    fn collect_range(
        &self,
        lo: (OrderedF64, DocId),
        hi: std::ops::Bound<(OrderedF64, DocId)>,
    ) -> Vec<DocId> {
        let mut out: Vec<DocId> = self
            .entries
            .range((std::ops::Bound::Included(lo), hi))
            .map(|&(_, id)| id)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Map from token to posting container.
pub struct BaseStringIndex<C: PostingContainer> {
    case_sensitive: bool,
    entries: HashMap<String, C>,
}

impl<C: PostingContainer> BaseStringIndex<C> {
    fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            entries: HashMap::new(),
        }
    }

    /// Posting container for a (normalized) query token.
    pub fn matching(&self, token: &str) -> Option<&C> {
        let token = token.trim_matches(|c: char| c.is_ascii_whitespace());
        if self.case_sensitive {
            self.entries.get(token)
        } else {
            self.entries.get(&to_lower(token))
        }
    }

    fn add_tokens(&mut self, id: DocId, tokens: HashSet<String>) {
        for token in tokens {
            self.entries.entry(token).or_default().insert(id);
        }
    }

    fn remove_tokens(&mut self, id: DocId, tokens: HashSet<String>) {
        for token in tokens {
            if let Some(container) = self.entries.get_mut(&token) {
                container.remove(id);
                if container.is_empty() {
                    self.entries.remove(&token);
                }
            }
        }
    }

    pub fn token_count(&self) -> usize {
        self.entries.len()
    }
}

/// Inverted index over word tokens, compressed postings.
pub struct TextIndex {
    inner: BaseStringIndex<CompressedSortedSet>,
}

impl Default for TextIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TextIndex {
    pub fn new() -> Self {
        Self {
            inner: BaseStringIndex::new(false),
        }
    }

    fn tokenize(&self, doc: &dyn DocumentAccessor, field: &str) -> HashSet<String> {
        let mut tokens = HashSet::new();
        for text in doc.get_strings(field).unwrap_or_default() {
            tokens.extend(tokenize_words(&text));
        }
        tokens
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        let tokens = self.tokenize(doc, field);
        self.inner.add_tokens(id, tokens);
    }

    pub fn remove(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        let tokens = self.tokenize(doc, field);
        self.inner.remove_tokens(id, tokens);
    }

    pub fn matching(&self, token: &str) -> Option<&CompressedSortedSet> {
        self.inner.matching(token)
    }

    pub fn token_count(&self) -> usize {
        self.inner.token_count()
    }
}

/// Inverted index over separator-split tags, flat sorted postings.
pub struct TagIndex {
    separator: char,
    case_sensitive: bool,
    inner: BaseStringIndex<SortedVector>,
}

impl TagIndex {
    pub fn new(separator: char, case_sensitive: bool) -> Self {
        Self {
            separator,
            case_sensitive,
            inner: BaseStringIndex::new(case_sensitive),
        }
    }

    fn tokenize(&self, doc: &dyn DocumentAccessor, field: &str) -> HashSet<String> {
        let mut tokens = HashSet::new();
        for text in doc.get_strings(field).unwrap_or_default() {
            tokens.extend(normalize_tags(&text, self.case_sensitive, self.separator));
        }
        tokens
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        let tokens = self.tokenize(doc, field);
        self.inner.add_tokens(id, tokens);
    }

    pub fn remove(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        let tokens = self.tokenize(doc, field);
        self.inner.remove_tokens(id, tokens);
    }

    pub fn matching(&self, tag: &str) -> Option<&SortedVector> {
        self.inner.matching(tag)
    }

    pub fn token_count(&self) -> usize {
        self.inner.token_count()
    }
}

/// Dense vector store addressed by doc id.
pub struct FlatVectorIndex {
    dim: usize,
    sim: VectorSimilarity,
    entries: Vec<f32>,
}

impl FlatVectorIndex {
    pub fn new(params: &VectorParams) -> Self {
        debug_assert!(!params.use_hnsw);
        Self {
            dim: params.dim,
            sim: params.sim,
            entries: Vec::with_capacity(params.capacity * params.dim),
        }
    }

    pub fn info(&self) -> (usize, VectorSimilarity) {
        (self.dim, self.sim)
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        let want = (id as usize + 1) * self.dim;
        if self.entries.len() < want {
            self.entries.resize(want, 0.0);
        }
        if let Some(vector) = doc.get_vector(field) {
            if vector.len() == self.dim {
                let start = id as usize * self.dim;
                self.entries[start..start + self.dim].copy_from_slice(&vector);
            }
        }
    }

    pub fn remove(&mut self, _id: DocId, _doc: &dyn DocumentAccessor, _field: &str) {}

    pub fn get(&self, doc: DocId) -> &[f32] {
        let start = doc as usize * self.dim;
        &self.entries[start..start + self.dim]
    }

    /// Exact k nearest neighbors over `allowed` (or every stored vector).
    pub fn knn(&self, target: &[f32], k: usize, allowed: Option<&[DocId]>) -> Vec<(f32, DocId)> {
        let stored = (self.entries.len() / self.dim.max(1)) as u32;
        let mut scored: Vec<(f32, DocId)> = match allowed {
            Some(ids) => ids
                .iter()
                .filter(|&&id| id < stored)
                .map(|&id| (distance(self.sim, target, self.get(id)), id))
                .collect(),
            None => (0..stored)
                .map(|id| (distance(self.sim, target, self.get(id)), id))
                .collect(),
        };
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(k);
        scored
    }
}

/// Approximate vector index over an HNSW graph.
pub struct HnswVectorIndex {
    dim: usize,
    sim: VectorSimilarity,
    graph: HnswGraph,
}

impl HnswVectorIndex {
    pub fn new(params: &VectorParams) -> Self {
        debug_assert!(params.use_hnsw);
        Self {
            dim: params.dim,
            sim: params.sim,
            graph: HnswGraph::new(
                params.dim,
                params.sim,
                params.hnsw_m,
                params.hnsw_ef_construction,
                params.capacity,
            ),
        }
    }

    pub fn info(&self) -> (usize, VectorSimilarity) {
        (self.dim, self.sim)
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) {
        if let Some(vector) = doc.get_vector(field) {
            if vector.len() == self.dim {
                self.graph.add(id, &vector);
            }
        }
    }

    pub fn remove(&mut self, id: DocId, _doc: &dyn DocumentAccessor, _field: &str) {
        self.graph.remove(id);
    }

    pub fn knn(
        &self,
        target: &[f32],
        k: usize,
        ef: Option<usize>,
        allowed: Option<&[DocId]>,
    ) -> Vec<(f32, DocId)> {
        self.graph.knn(target, k, ef, allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doc(HashMap<&'static str, Vec<String>>);

    impl Doc {
        fn new(pairs: &[(&'static str, &str)]) -> Self {
            let mut map: HashMap<&'static str, Vec<String>> = HashMap::new();
            for (field, value) in pairs {
                map.entry(field).or_default().push(value.to_string());
            }
            Self(map)
        }
    }

    impl DocumentAccessor for Doc {
        fn get_strings(&self, field: &str) -> Option<Vec<String>> {
            self.0.get(field).cloned()
        }

        fn get_vector(&self, _field: &str) -> Option<Vec<f32>> {
            None
        }
    }

    #[test]
    fn lowercase_is_idempotent() {
        for word in ["HeLLo", "ÅNGSTRÖM", "already"] {
            assert_eq!(to_lower(&to_lower(word)), to_lower(word));
        }
    }

    #[test]
    fn word_tokenizer_segments_and_lowercases() {
        let tokens = tokenize_words("The quick, QUICK fox-trot!");
        assert!(tokens.contains("the"));
        assert!(tokens.contains("quick"));
        assert!(tokens.contains("fox"));
        assert!(tokens.contains("trot"));
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn tag_normalization_strips_and_splits() {
        let tags = normalize_tags(" red , Green,, blue ", false, ',');
        assert_eq!(
            tags,
            HashSet::from(["red".to_string(), "green".to_string(), "blue".to_string()])
        );

        let exact = normalize_tags("Red,red", true, ',');
        assert_eq!(exact.len(), 2);
    }

    #[test]
    fn numeric_range_bounds() {
        let mut index = NumericIndex::new();
        for (id, value) in [(1u32, "10"), (2, "20"), (3, "20"), (4, "30")] {
            index.add(id, &Doc::new(&[("price", value)]), "price");
        }
        assert_eq!(index.range(10.0, 30.0), vec![1, 2, 3]);
        assert_eq!(index.range_inclusive(10.0, 30.0), vec![1, 2, 3, 4]);
        assert_eq!(index.range(20.0, 20.0), Vec::<DocId>::new());

        index.remove(2, &Doc::new(&[("price", "20")]), "price");
        assert_eq!(index.range(10.0, 30.0), vec![1, 3]);
    }

    #[test]
    fn text_index_add_then_remove_restores_state() {
        let mut index = TextIndex::new();
        let doc = Doc::new(&[("body", "Ember stores tiered values")]);
        index.add(7, &doc, "body");
        assert_eq!(index.matching("tiered").unwrap().to_vec(), vec![7]);
        assert_eq!(index.matching("Tiered").unwrap().to_vec(), vec![7]);

        index.remove(7, &doc, "body");
        assert!(index.matching("tiered").is_none(), "emptied lists are dropped");
        assert_eq!(index.token_count(), 0);
    }

    #[test]
    fn tag_index_splits_on_separator() {
        let mut index = TagIndex::new(',', false);
        index.add(1, &Doc::new(&[("colors", "red, blue")]), "colors");
        index.add(2, &Doc::new(&[("colors", "BLUE")]), "colors");
        assert_eq!(index.matching("blue").unwrap().to_vec(), vec![1, 2]);
        assert_eq!(index.matching("red").unwrap().to_vec(), vec![1]);
        assert!(index.matching("green").is_none());
    }

    struct VecDoc(Vec<f32>);

    impl DocumentAccessor for VecDoc {
        fn get_strings(&self, _field: &str) -> Option<Vec<String>> {
            None
        }

        fn get_vector(&self, _field: &str) -> Option<Vec<f32>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn flat_vector_index_grows_and_searches() {
        let params = VectorParams {
            dim: 2,
            capacity: 2,
            ..VectorParams::default()
        };
        let mut index = FlatVectorIndex::new(&params);
        for id in 0..10u32 {
            index.add(id, &VecDoc(vec![id as f32, 0.0]), "vec");
        }
        assert_eq!(index.get(4), &[4.0, 0.0]);

        let hits = index.knn(&[3.1, 0.0], 2, None);
        assert_eq!(hits[0].1, 3);
        assert_eq!(hits[1].1, 4);

        let allowed = vec![0, 8, 9];
        let hits = index.knn(&[3.1, 0.0], 2, Some(&allowed));
        assert_eq!(hits[0].1, 0);
        assert_eq!(hits[1].1, 8);
    }
}
