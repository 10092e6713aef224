use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

use crate::core::stage::{Parallelism, Stage};
use crate::error::GraphMisuse;

/// A stage as it appears in the graph topology.
#[derive(Clone, Debug)]
pub(crate) struct StageNode {
    pub name: String,
    pub num_workers: usize,
    pub parallelism: Parallelism,
    pub max_backlog: Option<usize>,
}

/// The stage graph, collected from the root handle before build.
///
/// Keyed by stage identity rather than name, so duplicate names are
/// harmless. Edges are the tubes between stages.
#[derive(Clone, Debug)]
pub(crate) struct Topology {
    pub(crate) graph: StableDiGraph<StageNode, (), u32>,
}

impl Topology {
    /// Walk the graph reachable from `root` and record every stage and link.
    /// The walk itself is cycle-safe; whether the result is a DAG is checked
    /// separately by [`Topology::ensure_acyclic`].
    pub(crate) fn from_root<T: Clone + Debug + Send + 'static>(root: &Stage<T>) -> Self {
        let mut graph = StableDiGraph::new();
        let mut index_of: HashMap<usize, NodeIndex<u32>> = HashMap::new();
        let mut processed: HashSet<usize> = HashSet::new();
        let mut stack = vec![root.clone()];

        while let Some(stage) = stack.pop() {
            let snapshot = stage.snapshot();
            if !processed.insert(snapshot.key) {
                continue;
            }
            let from = ensure_node(&mut graph, &mut index_of, snapshot.key, || StageNode {
                name: snapshot.name.clone(),
                num_workers: snapshot.num_workers,
                parallelism: snapshot.parallelism,
                max_backlog: snapshot.max_backlog,
            });
            for next in snapshot.next {
                let next_snapshot = next.snapshot();
                let to = ensure_node(&mut graph, &mut index_of, next_snapshot.key, || StageNode {
                    name: next_snapshot.name.clone(),
                    num_workers: next_snapshot.num_workers,
                    parallelism: next_snapshot.parallelism,
                    max_backlog: next_snapshot.max_backlog,
                });
                graph.add_edge(from, to, ());
                stack.push(next);
            }
        }

        Topology { graph }
    }

    /// Reject non-DAG graphs, naming a stage on the cycle.
    pub(crate) fn ensure_acyclic(&self) -> Result<(), GraphMisuse> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| GraphMisuse::Cycle(self.graph[cycle.node_id()].name.clone()))
    }

    /// Number of stages in the graph.
    pub(crate) fn stage_count(&self) -> usize {
        self.graph.node_count()
    }
}

fn ensure_node(
    graph: &mut StableDiGraph<StageNode, (), u32>,
    index_of: &mut HashMap<usize, NodeIndex<u32>>,
    key: usize,
    node: impl FnOnce() -> StageNode,
) -> NodeIndex<u32> {
    *index_of.entry(key).or_insert_with(|| graph.add_node(node()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::Direction;

    fn identity(name: &str) -> Stage<i64> {
        Stage::from_fn(name, |v| v)
    }

    #[test]
    fn collects_a_chain() {
        let a = identity("a");
        let b = identity("b");
        let c = identity("c");
        a.link(&b).unwrap();
        b.link(&c).unwrap();

        let topology = Topology::from_root(&a);
        assert_eq!(topology.stage_count(), 3);
        assert!(topology.ensure_acyclic().is_ok());

        let leaves: Vec<&str> = topology
            .graph
            .externals(Direction::Outgoing)
            .map(|idx| topology.graph[idx].name.as_str())
            .collect();
        assert_eq!(leaves, vec!["c"]);
    }

    #[test]
    fn fan_out_has_two_leaves() {
        let root = identity("root");
        let left = identity("left");
        let right = identity("right");
        root.link(&left).unwrap().link(&right).unwrap();

        let topology = Topology::from_root(&root);
        assert_eq!(topology.stage_count(), 3);
        let leaves = topology
            .graph
            .externals(Direction::Outgoing)
            .count();
        assert_eq!(leaves, 2);
    }

    #[test]
    fn cycles_are_detected() {
        let a = identity("a");
        let b = identity("b");
        a.link(&b).unwrap();
        // `a` has no parent yet, so this closes a two-stage loop.
        b.link(&a).unwrap();

        let topology = Topology::from_root(&a);
        let err = topology.ensure_acyclic().unwrap_err();
        assert!(matches!(err, GraphMisuse::Cycle(_)));
    }
}
