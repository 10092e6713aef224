use petgraph::stable_graph::NodeIndex;
use petgraph::Direction;

use crate::graph::topology::{StageNode, Topology};

/// Renders the stage graph as an indented text tree, one line per stage.
pub(crate) struct FlowGraph<'a> {
    topology: &'a Topology,
}

impl<'a> FlowGraph<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        FlowGraph { topology }
    }

    pub fn print(&self) {
        for line in self.render() {
            println!("{line}");
        }
    }

    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let roots: Vec<NodeIndex<u32>> = self
            .topology
            .graph
            .externals(Direction::Incoming)
            .collect();
        for root in roots {
            lines.push(format!("* {}", label(&self.topology.graph[root])));
            self.walk(root, "", &mut lines);
        }
        lines
    }

    fn walk(&self, idx: NodeIndex<u32>, prefix: &str, lines: &mut Vec<String>) {
        let mut children: Vec<NodeIndex<u32>> = self
            .topology
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        // petgraph yields the most recently linked stage first; show them in
        // link order instead.
        children.reverse();
        for (i, child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let connector = if last { "└─> " } else { "├─> " };
            lines.push(format!(
                "{prefix}{connector}{}",
                label(&self.topology.graph[*child])
            ));
            let descend = format!("{prefix}{}", if last { "    " } else { "│   " });
            self.walk(*child, &descend, lines);
        }
    }
}

fn label(node: &StageNode) -> String {
    let workers = if node.num_workers == 1 {
        "1 worker".to_owned()
    } else {
        format!("{} workers", node.num_workers)
    };
    let mut label = format!("{} [{workers}, {}", node.name, node.parallelism);
    if let Some(backlog) = node.max_backlog {
        label.push_str(&format!(", backlog {backlog}"));
    }
    label.push(']');
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::Stage;

    #[test]
    fn renders_a_chain_as_a_tree() {
        let a: Stage<i64> = Stage::from_fn("a", |v| v);
        let b = Stage::from_fn("b", |v| v).with_workers(4);
        let c = Stage::from_fn("c", |v| v).with_max_backlog(2);
        a.link(&b).unwrap();
        b.link(&c).unwrap();

        let topology = Topology::from_root(&a);
        let lines = FlowGraph::new(&topology).render();
        assert_eq!(
            lines,
            vec![
                "* a [1 worker, dedicated-thread]",
                "└─> b [4 workers, dedicated-thread]",
                "    └─> c [1 worker, dedicated-thread, backlog 2]",
            ]
        );
    }

    #[test]
    fn fan_out_branches_are_listed_in_link_order() {
        let root: Stage<i64> = Stage::from_fn("root", |v| v);
        let left = Stage::from_fn("left", |v| v);
        let right = Stage::from_fn("right", |v| v);
        root.link(&left).unwrap().link(&right).unwrap();

        let topology = Topology::from_root(&root);
        let lines = FlowGraph::new(&topology).render();
        assert_eq!(
            lines,
            vec![
                "* root [1 worker, dedicated-thread]",
                "├─> left [1 worker, dedicated-thread]",
                "└─> right [1 worker, dedicated-thread]",
            ]
        );
    }
}
