//! Bipartite matching via Edmonds-Karp maximum flow.
//!
//! The bipartite instance becomes a unit-capacity flow network: a
//! source feeding every requirement, a predicate-satisfying edge from
//! requirement to satisfier, and every satisfier draining into a sink.
//! BFS augmenting paths saturate a maximum flow; the matching is read
//! off the saturated middle edges.

use std::collections::VecDeque;

/// Matches nontrivial requirements to satisfiers.
///
/// `satisfied(j, i)` answers whether requirement j accepts satisfier i.
/// Infeasible instances saturate what they can and return a partial
/// matching.
pub(crate) fn matching<F>(n_req: usize, n_sat: usize, satisfied: F) -> Vec<(usize, usize)>
where
    F: Fn(usize, usize) -> bool,
{
    // Vertices: requirements, then satisfiers, then source and sink.
    let source = n_req + n_sat;
    let sink = source + 1;
    let vertices = sink + 1;

    let mut cap = vec![vec![0u8; vertices]; vertices];
    for j in 0..n_req {
        cap[source][j] = 1;
        for i in 0..n_sat {
            if satisfied(j, i) {
                cap[j][n_req + i] = 1;
            }
        }
    }
    for i in 0..n_sat {
        cap[n_req + i][sink] = 1;
    }

    // BFS augmenting paths over the residual network. Unit capacities
    // bound the flow by min(n_req, n_sat), so this terminates quickly.
    loop {
        let mut parent: Vec<Option<usize>> = vec![None; vertices];
        parent[source] = Some(source);
        let mut queue = VecDeque::from([source]);
        while let Some(u) = queue.pop_front() {
            for v in 0..vertices {
                if parent[v].is_none() && cap[u][v] > 0 {
                    parent[v] = Some(u);
                    queue.push_back(v);
                }
            }
        }
        if parent[sink].is_none() {
            break;
        }
        let mut v = sink;
        while v != source {
            let u = parent[v].expect("path reaches the source");
            cap[u][v] -= 1;
            cap[v][u] += 1;
            v = u;
        }
    }

    // A saturated middle edge shows up as residual capacity on its
    // reverse.
    let mut result = Vec::new();
    for j in 0..n_req {
        for i in 0..n_sat {
            if satisfied(j, i) && cap[n_req + i][j] > 0 {
                result.push((j, i));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturates_when_feasible() {
        let pairs = matching(2, 2, |j, i| j != 0 || i == 1);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&(0, 1)));
        assert!(pairs.contains(&(1, 0)));
    }

    #[test]
    fn partial_on_contention() {
        // Three requirements all want the single satisfier.
        let pairs = matching(3, 1, |_, _| true);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn respects_the_predicate() {
        let pairs = matching(2, 2, |j, i| j == i);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&(0, 0)));
        assert!(pairs.contains(&(1, 1)));
    }

    #[test]
    fn empty_graphs() {
        assert!(matching(0, 3, |_, _| true).is_empty());
        assert!(matching(3, 0, |_, _| true).is_empty());
    }
}
