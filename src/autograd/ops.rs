//! Operator-producing functions
//!
//! Each takes its operands and the graph that should own the new operator.

use std::sync::Arc;

use crate::error::KilnResult;
use super::function::{Add, Dropout, Identity, Prod, ReduceSum, Sub};
use super::graph::Graph;
use super::node::NodeRef;
use super::wrapper::StopGrad;

pub fn add(graph: &Graph, x1: &NodeRef, x2: &NodeRef) -> NodeRef {
    graph.new_operator(Add::new(x1.clone(), x2.clone()))
}

pub fn sub(graph: &Graph, x1: &NodeRef, x2: &NodeRef) -> NodeRef {
    graph.new_operator(Sub::new(x1.clone(), x2.clone()))
}

/// Element-wise product.
pub fn prod(graph: &Graph, x1: &NodeRef, x2: &NodeRef) -> NodeRef {
    graph.new_operator(Prod::new(x1.clone(), x2.clone()))
}

pub fn identity(graph: &Graph, x: &NodeRef) -> NodeRef {
    graph.new_operator(Identity::new(x.clone()))
}

pub fn reduce_sum(graph: &Graph, x: &NodeRef) -> NodeRef {
    graph.new_operator(ReduceSum::new(x.clone()))
}

/// Dropout with drop probability `p`, sampling masks from the graph generator.
pub fn dropout(graph: &Graph, x: &NodeRef, p: f32, training: bool) -> KilnResult<NodeRef> {
    let function = Dropout::new(x.clone(), p, training, graph.rng())?;
    Ok(graph.new_operator(function))
}

/// Read `x` without letting gradients flow back into it. The returned node
/// is not added to `x`'s graph and carries `x`'s id.
pub fn stop_grad(x: &NodeRef) -> NodeRef {
    Arc::new(StopGrad::new(x.clone()))
}
