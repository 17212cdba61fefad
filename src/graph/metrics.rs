//! Graph metrics recomputed during sleep: weighted PageRank and community
//! detection by modularity maximization.
//!
//! Pure graph math over the in-memory cache — no I/O except the final
//! write-back. Results are normalized and persisted on the node rows.

use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};

use crate::error::StoreError;
use crate::graph::cache::GraphCache;

pub const PAGERANK_DAMPING: f64 = 0.85;
pub const PAGERANK_MAX_ITER: usize = 100;
pub const PAGERANK_TOL: f64 = 1e-8;

/// Weighted PageRank over the directed edge rows, normalized to [0, 1] by the
/// maximum score. An edgeless graph gets a uniform score.
pub fn compute_pagerank(node_ids: &[i64], cache: &GraphCache) -> HashMap<i64, f64> {
    let n = node_ids.len();
    if n == 0 {
        return HashMap::new();
    }
    if cache.edge_count() == 0 {
        let uniform = 1.0 / n as f64;
        return node_ids.iter().map(|&id| (id, uniform)).collect();
    }

    let mut pr: HashMap<i64, f64> = node_ids.iter().map(|&id| (id, 1.0 / n as f64)).collect();
    let out_weight: HashMap<i64, f64> = node_ids
        .iter()
        .map(|&id| (id, cache.out_weight(id)))
        .collect();

    for _ in 0..PAGERANK_MAX_ITER {
        // Dangling nodes redistribute their mass uniformly
        let dangling: f64 = node_ids
            .iter()
            .filter(|id| out_weight.get(id).copied().unwrap_or(0.0) == 0.0)
            .map(|id| pr.get(id).copied().unwrap_or(0.0))
            .sum();

        let base = (1.0 - PAGERANK_DAMPING) / n as f64
            + PAGERANK_DAMPING * dangling / n as f64;

        let mut next: HashMap<i64, f64> = HashMap::with_capacity(n);
        for &id in node_ids {
            let mut incoming = 0.0;
            for &(source, weight) in cache.incoming(id) {
                let w_out = out_weight.get(&source).copied().unwrap_or(0.0);
                if w_out > 0.0 {
                    incoming += pr.get(&source).copied().unwrap_or(0.0) * weight / w_out;
                }
            }
            next.insert(id, base + PAGERANK_DAMPING * incoming);
        }

        let delta: f64 = node_ids
            .iter()
            .map(|id| (next.get(id).unwrap_or(&0.0) - pr.get(id).unwrap_or(&0.0)).abs())
            .sum();
        pr = next;
        if delta < PAGERANK_TOL {
            break;
        }
    }

    // Normalize to [0, 1]
    let max = pr.values().cloned().fold(0.0f64, f64::max);
    if max > 0.0 {
        for v in pr.values_mut() {
            *v /= max;
        }
    }
    pr
}

/// Community assignment by greedy modularity maximization over the undirected
/// weighted graph.
///
/// Detection runs on the largest connected component when it has more than 4
/// nodes; everything else — small components and isolated nodes — gets `None`.
/// Community ids are assigned by descending size.
pub fn detect_communities(node_ids: &[i64], cache: &GraphCache) -> HashMap<i64, Option<i64>> {
    let mut assignment: HashMap<i64, Option<i64>> =
        node_ids.iter().map(|&id| (id, None)).collect();

    // Undirected pairwise weights (paired kinds contribute both rows, which
    // scales every pair consistently)
    let mut pair_weights: HashMap<(i64, i64), f64> = HashMap::new();
    for &u in node_ids {
        for &(v, w, _) in cache.neighbors(u) {
            if u == v {
                continue;
            }
            let key = (u.min(v), u.max(v));
            *pair_weights.entry(key).or_insert(0.0) += w;
        }
    }
    if pair_weights.is_empty() {
        return assignment;
    }

    // Connected components
    let components = connected_components(node_ids, &pair_weights);
    let largest = components.iter().max_by_key(|c| c.len());
    let Some(largest) = largest else {
        return assignment;
    };
    if largest.len() <= 4 {
        return assignment;
    }

    let communities = greedy_modularity(largest, &pair_weights);

    // Label communities by descending size
    let mut sized: Vec<Vec<i64>> = communities;
    sized.sort_by_key(|c| std::cmp::Reverse(c.len()));
    for (label, members) in sized.iter().enumerate() {
        for &id in members {
            assignment.insert(id, Some(label as i64));
        }
    }
    assignment
}

fn connected_components(
    node_ids: &[i64],
    pair_weights: &HashMap<(i64, i64), f64>,
) -> Vec<Vec<i64>> {
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    for &(a, b) in pair_weights.keys() {
        adjacency.entry(a).or_default().push(b);
        adjacency.entry(b).or_default().push(a);
    }

    let mut seen: HashSet<i64> = HashSet::new();
    let mut components = Vec::new();
    for &start in node_ids {
        if seen.contains(&start) || !adjacency.contains_key(&start) {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            component.push(id);
            if let Some(neighbors) = adjacency.get(&id) {
                stack.extend(neighbors.iter().copied());
            }
        }
        components.push(component);
    }
    components
}

/// Greedy agglomerative modularity (CNM): start from singleton communities and
/// repeatedly merge the connected pair with the highest positive modularity
/// gain `ΔQ = 2 (e_cd − a_c a_d)`.
fn greedy_modularity(
    members: &[i64],
    pair_weights: &HashMap<(i64, i64), f64>,
) -> Vec<Vec<i64>> {
    let member_set: HashSet<i64> = members.iter().copied().collect();

    let two_m: f64 = pair_weights
        .iter()
        .filter(|((a, b), _)| member_set.contains(a) && member_set.contains(b))
        .map(|(_, w)| 2.0 * w)
        .sum();
    if two_m == 0.0 {
        return vec![members.to_vec()];
    }

    // community index per node
    let mut comm_of: HashMap<i64, usize> = members
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    let mut communities: Vec<Vec<i64>> = members.iter().map(|&id| vec![id]).collect();

    // a[c]: fraction of edge endpoints in community c
    let mut a: Vec<f64> = vec![0.0; communities.len()];
    // e[(c,d)]: fraction of edge weight between communities c and d
    let mut e: HashMap<(usize, usize), f64> = HashMap::new();
    for ((u, v), w) in pair_weights {
        if !member_set.contains(u) || !member_set.contains(v) {
            continue;
        }
        let (cu, cv) = (comm_of[u], comm_of[v]);
        let frac = w / two_m;
        a[cu] += frac;
        a[cv] += frac;
        let key = (cu.min(cv), cu.max(cv));
        *e.entry(key).or_insert(0.0) += frac;
    }

    loop {
        // Best positive-gain merge among connected community pairs
        let mut best: Option<((usize, usize), f64)> = None;
        for (&(c, d), &e_cd) in &e {
            if c == d || communities[c].is_empty() || communities[d].is_empty() {
                continue;
            }
            let gain = 2.0 * (e_cd - a[c] * a[d]);
            if gain > 1e-12 && best.map(|(_, g)| gain > g).unwrap_or(true) {
                best = Some(((c, d), gain));
            }
        }
        let Some(((c, d), _)) = best else {
            break;
        };

        // Merge d into c
        let moved = std::mem::take(&mut communities[d]);
        for &id in &moved {
            comm_of.insert(id, c);
        }
        communities[c].extend(moved);
        a[c] += a[d];
        a[d] = 0.0;

        // Rewire e: edges touching d now touch c
        let touching: Vec<((usize, usize), f64)> = e
            .iter()
            .filter(|(&(x, y), _)| x == d || y == d)
            .map(|(&k, &v)| (k, v))
            .collect();
        for (key, w) in touching {
            e.remove(&key);
            let other = if key.0 == d { key.1 } else { key.0 };
            if other == d || other == c {
                continue; // internal weight no longer drives merges
            }
            let new_key = (c.min(other), c.max(other));
            *e.entry(new_key).or_insert(0.0) += w;
        }
    }

    communities.into_iter().filter(|c| !c.is_empty()).collect()
}

/// Persist PageRank (and optionally community) values onto the node rows.
pub fn write_back(
    conn: &Connection,
    pagerank: &HashMap<i64, f64>,
    communities: Option<&HashMap<i64, Option<i64>>>,
) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare("UPDATE nodes SET pagerank = ?1 WHERE id = ?2")?;
    let mut updated = 0;
    for (&id, &pr) in pagerank {
        updated += stmt.execute(params![pr, id])?;
    }
    if let Some(communities) = communities {
        let mut stmt = conn.prepare("UPDATE nodes SET community_id = ?1 WHERE id = ?2")?;
        for (&id, community) in communities {
            stmt.execute(params![community, id])?;
        }
    }
    Ok(updated)
}
