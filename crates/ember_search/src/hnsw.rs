//! Hierarchical navigable small-world graph for approximate nearest
//! neighbors. Layered greedy descent with a beam search on the bottom layer;
//! capacity doubles when the store fills up.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{DocId, VectorSimilarity};

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

pub fn ip_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()
}

pub fn distance(sim: VectorSimilarity, a: &[f32], b: &[f32]) -> f32 {
    match sim {
        VectorSimilarity::L2 => l2_distance(a, b),
        VectorSimilarity::Ip => ip_distance(a, b),
    }
}

/// Max-heap entry ordered by distance; `Reverse` flips it for min-heaps.
#[derive(PartialEq)]
struct HeapItem {
    dist: f32,
    id: DocId,
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

struct Node {
    vector: Vec<f32>,
    /// Neighbor lists, one per layer the node participates in.
    neighbors: Vec<Vec<DocId>>,
    deleted: bool,
}

pub struct HnswGraph {
    dim: usize,
    sim: VectorSimilarity,
    m: usize,
    ef_construction: usize,
    capacity: usize,
    nodes: HashMap<DocId, Node>,
    entry: Option<DocId>,
    max_level: usize,
    level_mult: f64,
    rng: StdRng,
}

impl HnswGraph {
    pub fn new(
        dim: usize,
        sim: VectorSimilarity,
        m: usize,
        ef_construction: usize,
        capacity: usize,
    ) -> Self {
        let m = m.max(2);
        Self {
            dim,
            sim,
            m,
            ef_construction: ef_construction.max(m),
            capacity: capacity.max(16),
            nodes: HashMap::with_capacity(capacity.max(16)),
            entry: None,
            max_level: 0,
            level_mult: 1.0 / (m as f64).ln(),
            rng: StdRng::seed_from_u64(100),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        (-uniform.ln() * self.level_mult) as usize
    }

    fn dist(&self, a: &[f32], id: DocId) -> f32 {
        distance(self.sim, a, &self.nodes[&id].vector)
    }

    /// Greedy descent on one layer towards `target`.
    fn greedy_closest(&self, target: &[f32], start: DocId, level: usize) -> DocId {
        let mut current = start;
        let mut current_dist = self.dist(target, current);
        loop {
            let mut improved = false;
            let neighbors = self.nodes[&current].neighbors.get(level);
            for &candidate in neighbors.into_iter().flatten() {
                let d = self.dist(target, candidate);
                if d < current_dist {
                    current = candidate;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer; returns up to `ef` candidates by distance.
    fn search_layer(&self, target: &[f32], start: DocId, level: usize, ef: usize) -> Vec<(f32, DocId)> {
        let mut visited = HashSet::from([start]);
        let start_dist = self.dist(target, start);
        // Min-heap of candidates to expand, max-heap of current results.
        let mut candidates = BinaryHeap::from([std::cmp::Reverse(HeapItem {
            dist: start_dist,
            id: start,
        })]);
        let mut results = BinaryHeap::from([HeapItem {
            dist: start_dist,
            id: start,
        }]);

        while let Some(std::cmp::Reverse(candidate)) = candidates.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |item| item.dist);
            if candidate.dist > worst && results.len() >= ef {
                break;
            }
            let neighbors = self.nodes[&candidate.id].neighbors.get(level);
            for &next in neighbors.into_iter().flatten() {
                if !visited.insert(next) {
                    continue;
                }
                let d = self.dist(target, next);
                let worst = results.peek().map_or(f32::INFINITY, |item| item.dist);
                if results.len() < ef || d < worst {
                    candidates.push(std::cmp::Reverse(HeapItem { dist: d, id: next }));
                    results.push(HeapItem { dist: d, id: next });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(f32, DocId)> = results
            .into_iter()
            .map(|item| (item.dist, item.id))
            .collect();
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }

    pub fn add(&mut self, id: DocId, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        if self.nodes.len() + 1 >= self.capacity {
            self.capacity *= 2;
            self.nodes.reserve(self.capacity - self.nodes.len());
        }

        let level = self.random_level();
        let node = Node {
            vector: vector.to_vec(),
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        };
        // Re-adding an id replaces its vector and links.
        self.nodes.insert(id, node);

        let Some(entry) = self.entry.filter(|&e| e != id) else {
            self.entry = Some(id);
            self.max_level = level;
            return;
        };

        // Descend through the upper layers to a good entry point.
        let mut current = entry;
        let mut layer = self.max_level;
        while layer > level {
            current = self.greedy_closest(vector, current, layer);
            layer -= 1;
        }

        // Connect on each shared layer.
        for l in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(vector, current, l, self.ef_construction);
            let max_links = if l == 0 { self.m * 2 } else { self.m };
            let chosen: Vec<DocId> = found
                .iter()
                .filter(|(_, other)| *other != id)
                .take(max_links)
                .map(|&(_, other)| other)
                .collect();

            for &other in &chosen {
                self.link(id, other, l, max_links);
                self.link(other, id, l, max_links);
            }
            if let Some(&(_, closest)) = found.first() {
                current = closest;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(id);
        }
    }

    /// Append a link, pruning back to the closest `max_links` neighbors.
    fn link(&mut self, from: DocId, to: DocId, level: usize, max_links: usize) {
        let from_vec = self.nodes[&from].vector.clone();
        let node = self.nodes.get_mut(&from).expect("linked node exists");
        if node.neighbors.len() <= level {
            return;
        }
        if node.neighbors[level].contains(&to) {
            return;
        }
        node.neighbors[level].push(to);
        if node.neighbors[level].len() <= max_links {
            return;
        }

        let mut scored: Vec<(f32, DocId)> = {
            let neighbors = std::mem::take(&mut self.nodes.get_mut(&from).expect("node").neighbors[level]);
            neighbors
                .into_iter()
                .map(|n| (distance(self.sim, &from_vec, &self.nodes[&n].vector), n))
                .collect()
        };
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(max_links);
        self.nodes.get_mut(&from).expect("node").neighbors[level] =
            scored.into_iter().map(|(_, n)| n).collect();
    }

    pub fn remove(&mut self, id: DocId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.deleted = true;
        }
    }

    /// K nearest neighbors by distance. `allowed` (sorted ascending) filters
    /// candidates via binary search.
    pub fn knn(
        &self,
        target: &[f32],
        k: usize,
        ef: Option<usize>,
        allowed: Option<&[DocId]>,
    ) -> Vec<(f32, DocId)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let ef = ef.unwrap_or(10).max(k);

        let mut current = entry;
        for layer in (1..=self.max_level).rev() {
            current = self.greedy_closest(target, current, layer);
        }

        // Widen the beam so filtered and deleted hits do not starve k.
        let beam = ef.max(k * 4).min(self.nodes.len().max(1));
        let mut out: Vec<(f32, DocId)> = self
            .search_layer(target, current, 0, beam)
            .into_iter()
            .filter(|(_, id)| !self.nodes[id].deleted)
            .filter(|(_, id)| allowed.map_or(true, |ids| ids.binary_search(id).is_ok()))
            .take(k)
            .collect();

        // A tiny world may still be under-served by graph connectivity;
        // fall back to a scan before returning fewer than k points.
        if out.len() < k && self.nodes.len() <= beam {
            out = self
                .nodes
                .iter()
                .filter(|(_, node)| !node.deleted)
                .filter(|(id, _)| allowed.map_or(true, |ids| ids.binary_search(id).is_ok()))
                .map(|(&id, node)| (distance(self.sim, target, &node.vector), id))
                .collect();
            out.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            out.truncate(k);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_graph(sim: VectorSimilarity) -> HnswGraph {
        let mut graph = HnswGraph::new(2, sim, 8, 100, 16);
        for i in 0..50u32 {
            graph.add(i, &[i as f32, 0.0]);
        }
        graph
    }

    #[test]
    fn knn_finds_true_neighbors_on_a_line() {
        let graph = grid_graph(VectorSimilarity::L2);
        let hits = graph.knn(&[20.2, 0.0], 3, Some(50), None);
        let ids: Vec<DocId> = hits.iter().map(|&(_, id)| id).collect();
        assert_eq!(ids[0], 20);
        assert!(ids.contains(&21) && ids.contains(&19));
        assert!(hits.windows(2).all(|w| w[0].0 <= w[1].0), "sorted by score");
    }

    #[test]
    fn small_world_returns_everything() {
        let mut graph = HnswGraph::new(2, VectorSimilarity::L2, 4, 50, 16);
        for i in 0..3u32 {
            graph.add(i, &[i as f32, 1.0]);
        }
        let hits = graph.knn(&[0.0, 0.0], 10, None, None);
        assert_eq!(hits.len(), 3, "world smaller than k returns all points");
        assert!(hits.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn allowed_filter_restricts_results() {
        let graph = grid_graph(VectorSimilarity::L2);
        let allowed: Vec<DocId> = vec![5, 30, 40];
        let hits = graph.knn(&[0.0, 0.0], 2, Some(50), Some(&allowed));
        let ids: Vec<DocId> = hits.iter().map(|&(_, id)| id).collect();
        assert_eq!(ids, vec![5, 30]);
    }

    #[test]
    fn removed_points_are_skipped() {
        let mut graph = grid_graph(VectorSimilarity::L2);
        graph.remove(20);
        let hits = graph.knn(&[20.0, 0.0], 2, Some(50), None);
        assert!(hits.iter().all(|&(_, id)| id != 20));
    }

    #[test]
    fn inner_product_prefers_aligned_vectors() {
        let mut graph = HnswGraph::new(2, VectorSimilarity::Ip, 8, 100, 16);
        graph.add(1, &[1.0, 0.0]);
        graph.add(2, &[0.0, 1.0]);
        graph.add(3, &[0.5, 0.5]);
        let hits = graph.knn(&[1.0, 0.0], 1, Some(10), None);
        assert_eq!(hits[0].1, 1);
    }
}
