//! Leiden community detection over the session's entity/relationship graph.
//!
//! The local-moving loop maximizes modularity with a resolution parameter;
//! a refinement pass then splits each community into its connected
//! components so no community spans disconnected parts of the graph.
//! Hierarchical detection re-runs the algorithm on each community's induced
//! subgraph with a geometrically decaying resolution.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::graph::{GraphAccess, GraphSnapshot};
use rhizome_core::config::LeidenConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeidenParams {
    pub resolution: f64,
    pub iterations: usize,
    pub min_delta: f64,
    pub random_seed: u64,
    pub max_levels: usize,
    pub min_community_size: usize,
    pub level_resolution: f64,
}

impl Default for LeidenParams {
    fn default() -> Self {
        Self::from(&LeidenConfig::default())
    }
}

impl From<&LeidenConfig> for LeidenParams {
    fn from(config: &LeidenConfig) -> Self {
        Self {
            resolution: config.resolution,
            iterations: config.iterations,
            min_delta: config.min_delta,
            random_seed: config.random_seed,
            max_levels: config.max_levels,
            min_community_size: config.min_community_size,
            level_resolution: config.level_resolution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Member entity ids, ascending.
    pub entity_ids: Vec<u64>,
    /// Index of the parent cluster in the previous level; None at level 0.
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeidenLevel {
    pub level: u32,
    pub clusters: Vec<Cluster>,
}

/// Flat detection: one partition of the whole graph at `params.resolution`.
pub fn detect_communities(graph: &impl GraphAccess, params: &LeidenParams) -> Vec<Cluster> {
    partition(graph, params, params.resolution)
        .into_iter()
        .map(|entity_ids| Cluster {
            entity_ids,
            parent: None,
        })
        .collect()
}

/// Hierarchical detection. Level 0 partitions the full graph; each community
/// of at least `min_community_size` members is re-partitioned on its induced
/// subgraph with resolution `resolution * level_resolution^level`. A
/// degenerate split (a single sub-community) does not extend that branch.
pub fn detect_hierarchy(graph: &GraphSnapshot, params: &LeidenParams) -> Vec<LeidenLevel> {
    let mut levels = vec![LeidenLevel {
        level: 0,
        clusters: detect_communities(graph, params),
    }];

    for level in 1..params.max_levels as u32 {
        let gamma = params.resolution * params.level_resolution.powi(level as i32);
        let previous = &levels[levels.len() - 1];
        let mut clusters = Vec::new();

        for (parent_idx, parent) in previous.clusters.iter().enumerate() {
            if parent.entity_ids.len() < params.min_community_size {
                continue;
            }

            let keep: HashSet<u64> = parent.entity_ids.iter().copied().collect();
            let sub = graph.induced(&keep);
            let split = partition(&sub, params, gamma);
            if split.len() <= 1 {
                continue;
            }

            for entity_ids in split {
                clusters.push(Cluster {
                    entity_ids,
                    parent: Some(parent_idx),
                });
            }
        }

        if clusters.is_empty() {
            break;
        }
        levels.push(LeidenLevel { level, clusters });
    }

    levels
}

// ---------------------------------------------------------------------------
// Core partition
// ---------------------------------------------------------------------------

fn partition(graph: &impl GraphAccess, params: &LeidenParams, gamma: f64) -> Vec<Vec<u64>> {
    let mut nodes = graph.node_ids();
    nodes.sort_unstable();
    if nodes.is_empty() {
        return Vec::new();
    }

    let adj = build_adjacency(graph);
    let total_weight: f64 = adj
        .values()
        .map(|neighbors| neighbors.values().sum::<f64>())
        .sum::<f64>()
        / 2.0;

    // A graph with no edges stays a partition of singletons.
    if total_weight <= f64::EPSILON {
        return nodes.into_iter().map(|node| vec![node]).collect();
    }

    let strength: HashMap<u64, f64> = nodes
        .iter()
        .map(|node| (*node, adj[node].values().sum::<f64>()))
        .collect();

    let mut assignment: HashMap<u64, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (*node, idx))
        .collect();
    let mut community_strength: HashMap<usize, f64> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (idx, strength[node]))
        .collect();

    let two_m = 2.0 * total_weight;
    let mut rng = StdRng::seed_from_u64(params.random_seed);
    let mut order = nodes.clone();

    for _ in 0..params.iterations.max(1) {
        order.shuffle(&mut rng);
        let mut moved = false;

        for node in &order {
            let k_i = strength[node];
            if k_i <= f64::EPSILON {
                continue;
            }
            let current = assignment[node];

            // Weight from this node into each adjacent community; self-loops
            // are excluded from both sides of the gain.
            let mut weight_to: HashMap<usize, f64> = HashMap::new();
            for (neighbor, weight) in &adj[node] {
                if neighbor == node {
                    continue;
                }
                *weight_to.entry(assignment[neighbor]).or_insert(0.0) += *weight;
            }

            let k_i_out = *weight_to.get(&current).unwrap_or(&0.0);
            let sigma_out = community_strength[&current] - k_i;

            let mut candidates: Vec<usize> = weight_to.keys().copied().collect();
            candidates.sort_unstable();

            let mut best_comm = current;
            let mut best_gain = 0.0;
            for candidate in candidates {
                if candidate == current {
                    continue;
                }
                let k_i_in = weight_to[&candidate];
                let sigma_in = community_strength[&candidate];
                let gain = (k_i_in - k_i_out) / two_m
                    - gamma * k_i * (sigma_in - sigma_out) / (two_m * two_m);
                if gain > best_gain + f64::EPSILON {
                    best_gain = gain;
                    best_comm = candidate;
                }
            }

            if best_comm != current && best_gain > params.min_delta {
                *community_strength.get_mut(&current).unwrap() -= k_i;
                *community_strength.get_mut(&best_comm).unwrap() += k_i;
                assignment.insert(*node, best_comm);
                moved = true;
            }
        }

        if !moved {
            break;
        }
    }

    let refined = refine_connected(&adj, &assignment);
    group_by_community(&nodes, &refined)
}

fn build_adjacency(graph: &impl GraphAccess) -> HashMap<u64, HashMap<u64, f64>> {
    let mut adj: HashMap<u64, HashMap<u64, f64>> = HashMap::new();
    for node in graph.node_ids() {
        adj.entry(node).or_default();
    }
    for node in graph.node_ids() {
        for edge in graph.outgoing(node) {
            // Unweighted relationships participate with weight 1.
            let weight = if edge.weight <= 0.0 { 1.0 } else { edge.weight };
            *adj.entry(edge.source)
                .or_default()
                .entry(edge.target)
                .or_insert(0.0) += weight;
            *adj.entry(edge.target)
                .or_default()
                .entry(edge.source)
                .or_insert(0.0) += weight;
        }
    }
    adj
}

/// Split each community into its connected components.
fn refine_connected(
    adj: &HashMap<u64, HashMap<u64, f64>>,
    assignment: &HashMap<u64, usize>,
) -> HashMap<u64, usize> {
    let mut by_community: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for (node, community) in assignment {
        by_community.entry(*community).or_default().push(*node);
    }

    let mut refined = HashMap::new();
    let mut next_id = 0usize;

    for mut members in by_community.into_values() {
        members.sort_unstable();
        let member_set: HashSet<u64> = members.iter().copied().collect();
        let mut visited = HashSet::new();

        for start in members {
            if !visited.insert(start) {
                continue;
            }
            let mut queue = VecDeque::new();
            queue.push_back(start);
            refined.insert(start, next_id);

            while let Some(node) = queue.pop_front() {
                let mut neighbors: Vec<u64> = adj
                    .get(&node)
                    .map(|edges| {
                        edges
                            .keys()
                            .copied()
                            .filter(|n| member_set.contains(n))
                            .collect()
                    })
                    .unwrap_or_default();
                neighbors.sort_unstable();

                for neighbor in neighbors {
                    if visited.insert(neighbor) {
                        refined.insert(neighbor, next_id);
                        queue.push_back(neighbor);
                    }
                }
            }
            next_id += 1;
        }
    }

    refined
}

fn group_by_community(nodes: &[u64], assignment: &HashMap<u64, usize>) -> Vec<Vec<u64>> {
    let mut grouped: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    for node in nodes {
        grouped.entry(assignment[node]).or_default().push(*node);
    }

    let mut ordered: Vec<Vec<u64>> = grouped
        .into_values()
        .map(|mut members| {
            members.sort_unstable();
            members
        })
        .collect();
    ordered.sort_by(|a, b| a[0].cmp(&b[0]));
    ordered
}
