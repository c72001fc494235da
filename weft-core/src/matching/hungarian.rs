//! Maximum-weight perfect matching on a complete bipartite graph.
//!
//! The Hungarian algorithm of Kuhn (1955), as improved and presented by
//! E. L. Lawler in *Combinatorial Optimization: Networks and Matroids*
//! (1976, p. 205-206). Runs in O(n³) on an n×n weight matrix. Weights
//! may be any finite reals; a constant is added to make them positive
//! when necessary, which shifts every perfect matching's weight equally
//! and so changes nothing.

/// Tolerance for comparisons to zero. A positive number strictly below
/// this is treated as zero to absorb floating-point imprecision.
const TOL: f64 = 1e-10;

const NO_LABEL: isize = -1;
const EMPTY_LABEL: isize = -2;

/// The matching engine. Weights default to zero; call
/// [`set_weight`](BipartiteMatcher::set_weight) then
/// [`matching`](BipartiteMatcher::matching).
pub struct BipartiteMatcher {
    n: usize,
    weights: Vec<Vec<f64>>,
    min_weight: f64,
    max_weight: f64,
    // If (i, j) is matched, s_matches[i] = j and t_matches[j] = i;
    // unmatched entries hold -1.
    s_matches: Vec<isize>,
    t_matches: Vec<isize>,
    s_labels: Vec<isize>,
    t_labels: Vec<isize>,
    u: Vec<f64>,
    v: Vec<f64>,
    pi: Vec<f64>,
    eligible_s: Vec<usize>,
    eligible_t: Vec<usize>,
}

impl BipartiteMatcher {
    /// Prepares a matcher for an n×n graph with all weights zero.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            weights: vec![vec![0.0; n]; n],
            min_weight: 0.0,
            max_weight: f64::NEG_INFINITY,
            s_matches: vec![-1; n],
            t_matches: vec![-1; n],
            s_labels: vec![NO_LABEL; n],
            t_labels: vec![NO_LABEL; n],
            u: vec![0.0; n],
            v: vec![0.0; n],
            pi: vec![0.0; n],
            eligible_s: Vec::new(),
            eligible_t: Vec::new(),
        }
    }

    /// Sets the weight of the (i, j) pair.
    pub fn set_weight(&mut self, i: usize, j: usize, w: f64) {
        debug_assert!(!w.is_nan(), "weights must not be NaN");
        self.weights[i][j] = w;
        if w > f64::NEG_INFINITY && w < self.min_weight {
            self.min_weight = w;
        }
        if w > self.max_weight {
            self.max_weight = w;
        }
    }

    /// Computes a maximum-weight perfect matching.
    ///
    /// Entry `i` of the result holds the j matched to i.
    pub fn matching(&mut self) -> Vec<isize> {
        if self.n == 0 {
            return Vec::new();
        }
        self.ensure_positive_weights();

        // Step 0: initialization. Dual u starts at the maximum weight
        // (ambiguous on p. 205 of Lawler, but see p. 202).
        self.eligible_s.clear();
        self.eligible_t.clear();
        for i in 0..self.n {
            self.s_matches[i] = -1;
            self.t_matches[i] = -1;
            self.u[i] = self.max_weight;
            self.v[i] = 0.0;
            self.pi[i] = f64::INFINITY;
            // The first run of step 1.0.
            self.s_labels[i] = EMPTY_LABEL;
            self.eligible_s.push(i);
            self.t_labels[i] = NO_LABEL;
        }

        loop {
            // Augment until no augmenting path exists under the current
            // dual variables.
            loop {
                let last_node = match self.find_augmenting_path() {
                    Some(j) => j,
                    None => break,
                };

                // Step 2: augmentation.
                self.flip_path(last_node);
                for i in 0..self.n {
                    self.pi[i] = f64::INFINITY;
                    self.s_labels[i] = NO_LABEL;
                    self.t_labels[i] = NO_LABEL;
                }

                // Step 1.0.
                self.eligible_s.clear();
                for i in 0..self.n {
                    if self.s_matches[i] == -1 {
                        self.s_labels[i] = EMPTY_LABEL;
                        self.eligible_s.push(i);
                    }
                }
                self.eligible_t.clear();
            }

            // Step 3: change the dual variables.
            let delta1 = self.u.iter().copied().fold(f64::INFINITY, f64::min);
            let delta2 = self
                .pi
                .iter()
                .copied()
                .filter(|&p| p >= TOL)
                .fold(f64::INFINITY, f64::min);

            if delta1 < delta2 {
                // Making another pi[j] zero would drive some u[i]
                // negative; the matching is maximum.
                break;
            }
            self.change_dual_vars(delta2);
        }

        self.s_matches.clone()
    }

    /// Looks for an augmenting path over tight edges, those with
    /// u[i] + v[j] = w[i][j]. Returns the last node of a path if one
    /// exists; always updates the labels and pi values.
    fn find_augmenting_path(&mut self) -> Option<usize> {
        while !self.eligible_s.is_empty() || !self.eligible_t.is_empty() {
            if let Some(i) = self.eligible_s.pop() {
                for j in 0..self.n {
                    // A pi[j] already driven essentially to zero means
                    // j is labeled; decreasing further would only
                    // relabel it spuriously through floating-point
                    // noise.
                    if self.t_matches[j] != i as isize && self.pi[j] >= TOL {
                        let diff = self.u[i] + self.v[j] - self.weights[i][j];
                        if diff < self.pi[j] {
                            self.t_labels[j] = i as isize;
                            self.pi[j] = diff;
                            if self.pi[j] < TOL {
                                self.eligible_t.push(j);
                            }
                        }
                    }
                }
            } else if let Some(j) = self.eligible_t.pop() {
                if self.t_matches[j] == -1 {
                    return Some(j);
                }
                let i = self.t_matches[j] as usize;
                self.s_labels[i] = j as isize;
                // Adding i twice is harmless.
                self.eligible_s.push(i);
            }
        }
        None
    }

    /// Flips the augmenting path ending at `last_node`: edges on the
    /// path toggle matching membership. The path joins two unmatched
    /// nodes, so the result is again a matching.
    fn flip_path(&mut self, last_node: usize) {
        let mut last = last_node as isize;
        while last != EMPTY_LABEL {
            let parent = self.t_labels[last as usize] as usize;
            // No edge needs explicit removal: nothing currently matches
            // last, and any j matched to parent is s_labels[parent] and
            // gets rewritten on the next iteration.
            self.s_matches[parent] = last;
            self.t_matches[last as usize] = parent as isize;
            last = self.s_labels[parent];
        }
    }

    fn change_dual_vars(&mut self, delta: f64) {
        for i in 0..self.n {
            if self.s_labels[i] != NO_LABEL {
                self.u[i] -= delta;
            }
        }
        for j in 0..self.n {
            if self.pi[j] < TOL {
                self.v[j] += delta;
            } else if self.t_labels[j] != NO_LABEL {
                self.pi[j] -= delta;
                if self.pi[j] < TOL {
                    self.eligible_t.push(j);
                }
            }
        }
    }

    /// Shifts the weights so every finite one is strictly positive.
    fn ensure_positive_weights(&mut self) {
        if self.min_weight < TOL {
            for row in &mut self.weights {
                for w in row.iter_mut() {
                    *w = *w - self.min_weight + 1.0;
                }
            }
            self.max_weight = self.max_weight - self.min_weight + 1.0;
            self.min_weight = 1.0;
        }
    }
}

/// Matches nontrivial requirements to satisfiers.
///
/// `satisfied(j, i)` answers whether requirement j accepts satisfier i.
/// The matrix is padded square; pairs matched to padding or against
/// their predicate are dropped, which is what makes an infeasible
/// instance a partial result instead of an error.
pub(crate) fn matching<F>(n_req: usize, n_sat: usize, satisfied: F) -> Vec<(usize, usize)>
where
    F: Fn(usize, usize) -> bool,
{
    let n = n_req.max(n_sat);
    let mut matcher = BipartiteMatcher::new(n);
    for i in 0..n_sat {
        for j in 0..n_req {
            // Unit weight exactly when satisfied.
            if satisfied(j, i) {
                matcher.set_weight(i, j, 1.0);
            }
        }
    }

    let assignment = matcher.matching();
    let mut result = Vec::new();
    for (i, &j) in assignment.iter().enumerate().take(n_sat) {
        let j = j as usize;
        if j < n_req && satisfied(j, i) {
            result.push((j, i));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_the_heavier_matching() {
        let mut m = BipartiteMatcher::new(2);
        // Diagonal worth 2 + 2, anti-diagonal worth 3 + 0.
        m.set_weight(0, 0, 2.0);
        m.set_weight(1, 1, 2.0);
        m.set_weight(0, 1, 3.0);
        assert_eq!(m.matching(), vec![0, 1]);
    }

    #[test]
    fn negative_weights_are_shifted_not_dropped() {
        let mut m = BipartiteMatcher::new(2);
        m.set_weight(0, 0, -5.0);
        m.set_weight(0, 1, -1.0);
        m.set_weight(1, 0, -1.0);
        m.set_weight(1, 1, -5.0);
        assert_eq!(m.matching(), vec![1, 0]);
    }

    #[test]
    fn zero_size_graphs() {
        assert!(BipartiteMatcher::new(0).matching().is_empty());
    }

    #[test]
    fn saturates_when_feasible() {
        // Requirement 0 accepts only satisfier 1; requirement 1 accepts
        // both. Both must be placed.
        let pairs = matching(2, 2, |j, i| j != 0 || i == 1);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&(0, 1)));
        assert!(pairs.contains(&(1, 0)));
    }
}
