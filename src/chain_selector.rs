use crate::models::{BatchRow, PointRecord, Relation, StatehashResult};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};

/// Per-hash observer bookkeeping built once per batch and shared across
/// the filter/weight/BFS steps.
struct BatchStats {
    /// Distinct submitters observed for each `state_hash`.
    observers_by_hash: HashMap<String, HashSet<String>>,
    total_submitters: usize,
    /// First-seen `blockchain_height` for each `state_hash`, used by the
    /// height-monotonicity weight term.
    height_by_hash: HashMap<String, i64>,
}

impl BatchStats {
    fn build(rows: &[BatchRow]) -> Self {
        let mut observers_by_hash: HashMap<String, HashSet<String>> = HashMap::new();
        let mut height_by_hash = HashMap::new();
        let mut all_submitters = HashSet::new();

        for row in rows {
            observers_by_hash
                .entry(row.state_hash.clone())
                .or_default()
                .insert(row.block_producer_key.clone());
            height_by_hash.entry(row.state_hash.clone()).or_insert(row.blockchain_height);
            all_submitters.insert(row.block_producer_key.clone());
        }

        BatchStats { observers_by_hash, total_submitters: all_submitters.len(), height_by_hash }
    }

    fn observer_count(&self, hash: &str) -> usize {
        self.observers_by_hash.get(hash).map(|s| s.len()).unwrap_or(0)
    }

    fn coverage(&self, hash: &str) -> f64 {
        if self.total_submitters == 0 {
            return 0.0;
        }
        self.observer_count(hash) as f64 / self.total_submitters as f64
    }
}

/// Selects the canonical state-hash fragment for a batch: the
/// weighted-BFS chain selector, the algorithmic heart of the coordinator.
pub struct ChainSelector {
    /// Submitter-coverage threshold, see `DESIGN.md`.
    pub threshold: f64,
}

/// Everything the coordinator needs to persist after running the
/// selector for one batch.
pub struct SelectionOutcome {
    pub statehash_results: Vec<StatehashResult>,
    pub point_records: Vec<PointRecord>,
    /// The new canonical set, fed back in as `prev_selected` next batch.
    pub selected_state_hashes: Vec<String>,
    /// The new canonical relations, fed back in as `prev_relations` next
    /// batch.
    pub relations: Vec<Relation>,
}

impl ChainSelector {
    pub fn new(threshold: f64) -> Self {
        ChainSelector { threshold }
    }

    /// Retains state hashes whose submitter coverage meets the
    /// configured threshold.
    fn filter_by_submitter_percentage(&self, rows: &[BatchRow], stats: &BatchStats) -> Vec<String> {
        let unique_hashes: HashSet<&String> = rows.iter().map(|r| &r.state_hash).collect();
        let mut selected: Vec<String> = unique_hashes
            .into_iter()
            .filter(|h| stats.coverage(h) >= self.threshold)
            .cloned()
            .collect();
        selected.sort();
        selected
    }

    /// The raw (unweighted) parent-to-child edge list: batch submissions
    /// plus the prior batch's canonical relations.
    fn raw_edges(rows: &[BatchRow], prev_relations: &[Relation]) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.parent_state_hash.clone(), r.state_hash.clone()))
            .collect();
        edges.extend(
            prev_relations
                .iter()
                .map(|r| (r.parent_state_hash.clone(), r.state_hash.clone())),
        );
        edges
    }

    /// Weights every edge whose child is in `c_selected` or
    /// `prev_selected`. Edges into a hash nobody vouched for this batch
    /// never enter the weighted graph, which keeps a below-threshold
    /// fork out of the shortlist.
    fn apply_weights(
        edges: &[(String, String)],
        c_selected: &HashSet<String>,
        prev_selected: &HashSet<String>,
        stats: &BatchStats,
    ) -> HashMap<String, Vec<(String, i64)>> {
        const HEIGHT_VIOLATION_PENALTY: i64 = 500;
        let mut graph: HashMap<String, Vec<(String, i64)>> = HashMap::new();

        for (parent, child) in edges {
            if !c_selected.contains(child) && !prev_selected.contains(child) {
                continue;
            }
            let observers = stats.observer_count(child) as i64;
            let mut weight = 1000 * observers.max(1);

            if let (Some(&parent_height), Some(&child_height)) =
                (stats.height_by_hash.get(parent), stats.height_by_hash.get(child))
            {
                if child_height != parent_height + 1 {
                    weight -= HEIGHT_VIOLATION_PENALTY;
                }
            }

            graph.entry(parent.clone()).or_default().push((child.clone(), weight));
        }

        for neighbors in graph.values_mut() {
            neighbors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            neighbors.dedup_by(|a, b| a.0 == b.0);
        }
        graph
    }

    /// Multi-source BFS over the weighted graph, seeded with
    /// `prev_selected ++ c_selected`, visiting neighbors in decreasing
    /// weight order with a deterministic hash-string tie-break.
    fn bfs(
        graph: &HashMap<String, Vec<(String, i64)>>,
        seeds: &[String],
    ) -> HashSet<String> {
        let mut visited: HashSet<String> = seeds.iter().cloned().collect();
        let mut queue: VecDeque<String> = seeds.iter().cloned().collect();

        while let Some(node) = queue.pop_front() {
            if let Some(neighbors) = graph.get(&node) {
                for (child, _weight) in neighbors {
                    if visited.insert(child.clone()) {
                        queue.push_back(child.clone());
                    }
                }
            }
        }
        visited
    }

    /// Runs the full selection pipeline for one batch.
    pub fn select(
        &self,
        rows: &[BatchRow],
        prev_selected: &[String],
        prev_relations: &[Relation],
        bot_log_id: i64,
    ) -> SelectionOutcome {
        if rows.is_empty() {
            // No verified submissions: no shortlist, no point records.
            return SelectionOutcome {
                statehash_results: Vec::new(),
                point_records: Vec::new(),
                selected_state_hashes: Vec::new(),
                relations: Vec::new(),
            };
        }

        let stats = BatchStats::build(rows);
        let c_selected_vec = self.filter_by_submitter_percentage(rows, &stats);
        let c_selected: HashSet<String> = c_selected_vec.iter().cloned().collect();
        let prev_selected_set: HashSet<String> = prev_selected.iter().cloned().collect();

        let edges = Self::raw_edges(rows, prev_relations);
        let graph = Self::apply_weights(&edges, &c_selected, &prev_selected_set, &stats);

        let mut seeds: Vec<String> = prev_selected.to_vec();
        seeds.extend(c_selected_vec.iter().cloned());
        let reachable = Self::bfs(&graph, &seeds);

        // Prune to hashes actually observed as a `state_hash` in this
        // batch.
        let batch_state_hashes: HashSet<&str> = rows.iter().map(|r| r.state_hash.as_str()).collect();
        let mut pruned: Vec<String> = reachable
            .into_iter()
            .filter(|h| batch_state_hashes.contains(h.as_str()))
            .collect();
        pruned.sort();

        let parent_of: HashMap<&str, &str> = rows
            .iter()
            .map(|r| (r.state_hash.as_str(), r.parent_state_hash.as_str()))
            .collect();

        let statehash_results = pruned
            .iter()
            .map(|h| StatehashResult {
                bot_log_id,
                state_hash: h.clone(),
                parent_state_hash: parent_of.get(h.as_str()).map(|p| p.to_string()).unwrap_or_default(),
            })
            .collect::<Vec<_>>();

        let pruned_set: HashSet<&str> = pruned.iter().map(|s| s.as_str()).collect();
        let point_records = rows
            .iter()
            .filter(|r| pruned_set.contains(r.state_hash.as_str()))
            .map(|r| PointRecord {
                file_name: r.file_name.clone(),
                file_timestamps: r.file_timestamps,
                blockchain_epoch: r.blockchain_epoch,
                block_producer_key: r.block_producer_key.clone(),
                blockchain_height: r.blockchain_height,
                amount: 1,
                created_at: Utc::now(),
                bot_log_id,
                state_hash: r.state_hash.clone(),
            })
            .collect();

        let relations = statehash_results
            .iter()
            .map(|s| Relation {
                parent_state_hash: s.parent_state_hash.clone(),
                state_hash: s.state_hash.clone(),
            })
            .collect();

        SelectionOutcome {
            selected_state_hashes: pruned,
            statehash_results,
            point_records,
            relations,
        }
    }
}
