//! Releasing computed buffers of a subgraph back to the pool

use std::collections::HashSet;
use tracing::debug;

use super::node::{Node, NodeRef};
use super::operator::Operator;

fn address(op: &Operator) -> usize {
    op as *const Operator as usize
}

/// Release every operator reachable from `roots`, each exactly once.
/// Leaves are left untouched. Returns the number of operators released.
pub(crate) fn release_graph(roots: &[NodeRef]) -> usize {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut stack: Vec<NodeRef> = roots.to_vec();
    let mut released = 0;

    while let Some(node) = stack.pop() {
        let op = match node.as_operator() {
            Some(op) => op,
            None => continue,
        };
        if !visited.insert(address(op)) {
            continue;
        }
        stack.extend(op.release());
        released += 1;
    }

    debug!(roots = roots.len(), released, "graph released");
    released
}
