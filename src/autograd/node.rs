//! The operand contract shared by every graph node

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::KilnResult;
use crate::tensor::Matrix;
use super::operator::Operator;

/// Position of a node in its graph. Also its topological rank.
pub type NodeId = usize;

/// Shared handle to any node.
pub type NodeRef = Arc<dyn Node>;

/// Whether a node owns a function to execute.
#[derive(Debug, Clone, Copy)]
pub enum NodeKind<'a> {
    Leaf,
    Operator(&'a Operator),
}

/// A value in the graph that can receive gradients.
///
/// Leaves return their value immediately; operators may block until their
/// forward computation finished, and `grad` may block until every pending
/// gradient contribution has been delivered.
pub trait Node: Send + Sync + Debug {
    fn id(&self) -> NodeId;

    /// Creation timestamp from the graph clock, used for time-step resolution.
    fn timestamp(&self) -> u64;

    fn value(&self) -> KilnResult<Matrix>;

    fn requires_grad(&self) -> bool;

    fn grad(&self) -> Option<Matrix>;

    fn has_grad(&self) -> bool;

    /// Add `grad` into the stored gradient. No-op when the node does not require gradients.
    fn acc_grad(&self, grad: &Matrix) -> KilnResult<()>;

    fn zero_grad(&self);

    fn name(&self) -> Option<&str> {
        None
    }

    fn kind(&self) -> NodeKind<'_>;

    fn as_operator(&self) -> Option<&Operator> {
        match self.kind() {
            NodeKind::Operator(op) => Some(op),
            NodeKind::Leaf => None,
        }
    }
}

/// Owned copy of a node's value, `None` if it can no longer be read.
pub fn copy_value(node: &NodeRef) -> Option<Matrix> {
    node.value().ok()
}

/// Owned copy of a node's gradient.
pub fn copy_grad(node: &NodeRef) -> Option<Matrix> {
    node.grad()
}
