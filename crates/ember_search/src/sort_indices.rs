//! Dense per-document sort indices.

use crate::{DocId, DocumentAccessor, SortableValue};

fn partial_sort_by<T, F: FnMut(&T, &T) -> std::cmp::Ordering>(
    items: &mut [T],
    limit: usize,
    mut cmp: F,
) {
    if items.is_empty() || limit == 0 {
        return;
    }
    if limit >= items.len() {
        items.sort_by(cmp);
        return;
    }
    items.select_nth_unstable_by(limit - 1, &mut cmp);
    items[..limit].sort_by(cmp);
}

/// Dense array of per-doc values with partial-sort support.
pub struct SimpleValueSortIndex<T> {
    values: Vec<T>,
}

impl<T: Clone + Default + PartialOrd> SimpleValueSortIndex<T> {
    fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn set(&mut self, id: DocId, value: T) {
        if self.values.len() <= id as usize {
            self.values.resize(id as usize + 1, T::default());
        }
        self.values[id as usize] = value;
    }

    fn clear(&mut self, id: DocId) {
        if (id as usize) < self.values.len() {
            self.values[id as usize] = T::default();
        }
    }

    pub fn lookup(&self, id: DocId) -> T {
        self.values
            .get(id as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Partially sort `ids` by the indexed value and return the scores of the
    /// first `min(len, limit)` entries.
    pub fn sort(&self, ids: &mut Vec<DocId>, limit: usize, desc: bool) -> Vec<T> {
        let cmp = |lhs: &DocId, rhs: &DocId| {
            let (a, b) = (self.lookup(*lhs), self.lookup(*rhs));
            let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
            if desc {
                ord.reverse()
            } else {
                ord
            }
        };
        partial_sort_by(ids, limit, cmp);
        ids.iter()
            .take(limit)
            .map(|&id| self.lookup(id))
            .collect()
    }
}

pub struct NumericSortIndex {
    inner: SimpleValueSortIndex<f64>,
}

impl Default for NumericSortIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl NumericSortIndex {
    pub fn new() -> Self {
        Self {
            inner: SimpleValueSortIndex::new(),
        }
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) -> bool {
        let Some(numbers) = doc.get_numbers(field) else {
            return false;
        };
        self.inner.set(id, numbers.first().copied().unwrap_or(0.0));
        true
    }

    pub fn remove(&mut self, id: DocId) {
        self.inner.clear(id);
    }

    pub fn lookup(&self, id: DocId) -> SortableValue {
        SortableValue::Num(self.inner.lookup(id))
    }

    pub fn sort(&self, ids: &mut Vec<DocId>, limit: usize, desc: bool) -> Vec<SortableValue> {
        self.inner
            .sort(ids, limit, desc)
            .into_iter()
            .map(SortableValue::Num)
            .collect()
    }
}

pub struct StringSortIndex {
    inner: SimpleValueSortIndex<String>,
}

impl Default for StringSortIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl StringSortIndex {
    pub fn new() -> Self {
        Self {
            inner: SimpleValueSortIndex::new(),
        }
    }

    pub fn add(&mut self, id: DocId, doc: &dyn DocumentAccessor, field: &str) -> bool {
        let Some(strings) = doc.get_strings(field) else {
            return false;
        };
        self.inner
            .set(id, strings.first().cloned().unwrap_or_default());
        true
    }

    pub fn remove(&mut self, id: DocId) {
        self.inner.clear(id);
    }

    pub fn lookup(&self, id: DocId) -> SortableValue {
        SortableValue::Str(self.inner.lookup(id))
    }

    pub fn sort(&self, ids: &mut Vec<DocId>, limit: usize, desc: bool) -> Vec<SortableValue> {
        self.inner
            .sort(ids, limit, desc)
            .into_iter()
            .map(SortableValue::Str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Doc(HashMap<&'static str, String>);

    impl DocumentAccessor for Doc {
        fn get_strings(&self, field: &str) -> Option<Vec<String>> {
            self.0.get(field).map(|v| vec![v.clone()])
        }

        fn get_vector(&self, _field: &str) -> Option<Vec<f32>> {
            None
        }
    }

    fn doc(field: &'static str, value: &str) -> Doc {
        Doc(HashMap::from([(field, value.to_string())]))
    }

    #[test]
    fn numeric_sort_ascending_and_descending() {
        let mut index = NumericSortIndex::new();
        for (id, v) in [(0u32, "5"), (1, "1"), (2, "9"), (3, "3")] {
            assert!(index.add(id, &doc("score", v), "score"));
        }

        let mut ids = vec![0, 1, 2, 3];
        let scores = index.sort(&mut ids, 2, false);
        assert_eq!(&ids[..2], &[1, 3]);
        assert_eq!(
            scores,
            vec![SortableValue::Num(1.0), SortableValue::Num(3.0)]
        );

        let mut ids = vec![0, 1, 2, 3];
        let scores = index.sort(&mut ids, 10, true);
        assert_eq!(ids, vec![2, 0, 3, 1]);
        assert_eq!(scores.len(), 4);
    }

    #[test]
    fn string_sort_uses_lexicographic_order() {
        let mut index = StringSortIndex::new();
        for (id, v) in [(0u32, "pear"), (1, "apple"), (2, "mango")] {
            index.add(id, &doc("name", v), "name");
        }
        let mut ids = vec![0, 1, 2];
        index.sort(&mut ids, 3, false);
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn missing_field_is_not_added() {
        let mut index = NumericSortIndex::new();
        assert!(!index.add(0, &doc("other", "1"), "score"));
    }
}
