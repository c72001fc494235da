//! Requirement-to-satisfier matching.
//!
//! The scheduler asks one question of this module: given the nodes of
//! an execute-eligible class and the idle workers, which worker should
//! run which node? Requirements carry a predicate over satisfiers; the
//! answer is a maximum bipartite matching that respects every
//! predicate.
//!
//! Two interchangeable algorithms are provided. Both honor the same
//! contract: the matching is injective, no pair violates its
//! predicate, and an infeasible instance yields a partial matching
//! rather than an error. Requirements with no predicate at all are
//! kept out of the optimization and matched arbitrarily to leftover
//! satisfiers afterwards.

pub mod hungarian;
pub mod maxflow;

use crate::flow::FlowNode;
use rand::seq::SliceRandom;
use std::str::FromStr;

/// A constraint over satisfiers.
pub trait Requirement<S> {
    /// Whether this requirement accepts any satisfier whatsoever.
    fn is_trivial(&self) -> bool;

    /// Whether the given satisfier meets this requirement.
    fn is_satisfied(&self, satisfier: &S) -> bool;
}

impl<R, S> Requirement<S> for &R
where
    R: Requirement<S>,
{
    fn is_trivial(&self) -> bool {
        (**self).is_trivial()
    }

    fn is_satisfied(&self, satisfier: &S) -> bool {
        (**self).is_satisfied(satisfier)
    }
}

impl Requirement<String> for FlowNode {
    fn is_trivial(&self) -> bool {
        FlowNode::is_trivial(self)
    }

    fn is_satisfied(&self, domain: &String) -> bool {
        self.is_satisfied_by(domain)
    }
}

/// Which matching algorithm the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatcherKind {
    /// Primal-dual augmenting paths on a weight matrix, O(n³).
    #[default]
    Hungarian,
    /// Edmonds-Karp maximum flow on the unit-capacity bipartite graph.
    MaxFlow,
}

impl FromStr for MatcherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hungarian" => Ok(MatcherKind::Hungarian),
            "maxflow" => Ok(MatcherKind::MaxFlow),
            other => Err(format!("unknown matcher '{other}'")),
        }
    }
}

/// Matches requirements to satisfiers.
///
/// Returns `(requirement_index, satisfier_index)` pairs. Nontrivial
/// requirements are shuffled before optimization so that ties break
/// differently across scheduling passes; trivial ones take whatever
/// satisfiers remain, in order, until either side runs out.
pub fn match_requirements<R, S>(
    kind: MatcherKind,
    requirements: &[R],
    satisfiers: &[S],
) -> Vec<(usize, usize)>
where
    R: Requirement<S>,
{
    let mut rng = rand::thread_rng();

    let mut nontrivial: Vec<usize> = Vec::new();
    let mut trivial: Vec<usize> = Vec::new();
    for (i, requirement) in requirements.iter().enumerate() {
        if requirement.is_trivial() {
            trivial.push(i);
        } else {
            nontrivial.push(i);
        }
    }
    nontrivial.shuffle(&mut rng);
    trivial.shuffle(&mut rng);

    let satisfied =
        |jr: usize, is: usize| requirements[nontrivial[jr]].is_satisfied(&satisfiers[is]);

    let local = match kind {
        MatcherKind::Hungarian => hungarian::matching(nontrivial.len(), satisfiers.len(), satisfied),
        MatcherKind::MaxFlow => maxflow::matching(nontrivial.len(), satisfiers.len(), satisfied),
    };

    let mut used = vec![false; satisfiers.len()];
    let mut result = Vec::with_capacity(local.len() + trivial.len());
    for (jr, is) in local {
        used[is] = true;
        result.push((nontrivial[jr], is));
    }

    let mut leftovers = (0..satisfiers.len()).filter(|&is| !used[is]);
    for requirement in trivial {
        match leftovers.next() {
            Some(is) => result.push((requirement, is)),
            None => break,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Wants(Option<&'static str>);

    impl Requirement<&'static str> for Wants {
        fn is_trivial(&self) -> bool {
            self.0.is_none()
        }

        fn is_satisfied(&self, satisfier: &&'static str) -> bool {
            self.0.map(|want| want == *satisfier).unwrap_or(true)
        }
    }

    const KINDS: [MatcherKind; 2] = [MatcherKind::Hungarian, MatcherKind::MaxFlow];

    fn check(pairs: &[(usize, usize)], requirements: &[Wants], satisfiers: &[&'static str]) {
        let mut seen_r = HashSet::new();
        let mut seen_s = HashSet::new();
        for &(r, s) in pairs {
            assert!(seen_r.insert(r), "requirement matched twice");
            assert!(seen_s.insert(s), "satisfier matched twice");
            assert!(requirements[r].is_satisfied(&satisfiers[s]));
        }
    }

    #[test]
    fn maximum_matchings_avoid_greedy_traps() {
        // A greedy pass could hand s2 to the flexible requirement and
        // strand the strict one.
        let requirements = [Wants(Some("s2")), Wants(None)];
        let satisfiers = ["s1", "s2"];
        for kind in KINDS {
            for _ in 0..8 {
                let pairs = match_requirements(kind, &requirements, &satisfiers);
                check(&pairs, &requirements, &satisfiers);
                assert_eq!(pairs.len(), 2);
            }
        }
    }

    #[test]
    fn infeasible_instances_yield_partial_matchings() {
        let requirements = [Wants(Some("gpu")), Wants(Some("gpu")), Wants(Some("cpu"))];
        let satisfiers = ["gpu", "cpu"];
        for kind in KINDS {
            let pairs = match_requirements(kind, &requirements, &satisfiers);
            check(&pairs, &requirements, &satisfiers);
            assert_eq!(pairs.len(), 2);
        }
    }

    #[test]
    fn trivial_requirements_take_leftovers() {
        let requirements = [Wants(None), Wants(Some("special"))];
        let satisfiers = ["plain", "special"];
        for kind in KINDS {
            let pairs = match_requirements(kind, &requirements, &satisfiers);
            check(&pairs, &requirements, &satisfiers);
            assert_eq!(pairs.len(), 2);
            // The strict requirement must get its only candidate.
            assert!(pairs.contains(&(1, 1)));
        }
    }

    #[test]
    fn empty_sides_are_fine() {
        for kind in KINDS {
            assert!(match_requirements::<Wants, &str>(kind, &[], &["s"]).is_empty());
            let pairs = match_requirements(kind, &[Wants(Some("s"))], &[]);
            assert!(pairs.is_empty());
        }
    }

    #[test]
    fn matcher_kind_parses() {
        assert_eq!("hungarian".parse(), Ok(MatcherKind::Hungarian));
        assert_eq!("maxflow".parse(), Ok(MatcherKind::MaxFlow));
        assert!("simplex".parse::<MatcherKind>().is_err());
    }
}
