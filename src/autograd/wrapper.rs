//! Gradient-blocking decorator

use crate::error::KilnResult;
use crate::tensor::Matrix;
use super::node::{Node, NodeId, NodeKind, NodeRef};

/// Reads through to the wrapped node but hides all gradient machinery.
/// The wrapped node is never mutated through a `StopGrad`.
///
/// A `StopGrad` is not registered in any graph. It reports the wrapped
/// node's id and timestamp, so it sorts and truncates exactly like that
/// node, and `Graph::node(id)` resolves to the wrapped node, not the wrapper.
#[derive(Debug, Clone)]
pub struct StopGrad {
    inner: NodeRef,
}

impl StopGrad {
    pub fn new(inner: NodeRef) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &NodeRef {
        &self.inner
    }
}

impl Node for StopGrad {
    fn id(&self) -> NodeId {
        self.inner.id()
    }

    fn timestamp(&self) -> u64 {
        self.inner.timestamp()
    }

    fn value(&self) -> KilnResult<Matrix> {
        self.inner.value()
    }

    fn requires_grad(&self) -> bool {
        false
    }

    fn grad(&self) -> Option<Matrix> {
        None
    }

    fn has_grad(&self) -> bool {
        false
    }

    fn acc_grad(&self, _grad: &Matrix) -> KilnResult<()> {
        Ok(())
    }

    fn zero_grad(&self) {}

    fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    // Traversals must not descend into the wrapped subgraph.
    fn kind(&self) -> NodeKind<'_> {
        NodeKind::Leaf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::variable::Variable;
    use crate::memory::BufferPool;
    use std::sync::Arc;

    #[test]
    fn test_wrapper_hides_gradients() {
        let inner: NodeRef = Arc::new(Variable::new(Matrix::scalar(4.0), true).with_name("x"));
        inner.acc_grad(&Matrix::scalar(1.0)).unwrap();

        let blocked = StopGrad::new(inner.clone());
        assert!(!blocked.requires_grad());
        assert!(!blocked.has_grad());
        assert!(blocked.grad().is_none());
        assert_eq!(blocked.value().unwrap().scalar_value().unwrap(), 4.0);
        assert_eq!(blocked.name(), Some("x"));
        assert!(blocked.as_operator().is_none());

        blocked.acc_grad(&Matrix::scalar(5.0)).unwrap();
        blocked.zero_grad();
        assert_eq!(inner.grad().unwrap().scalar_value().unwrap(), 1.0);
        assert!(Arc::ptr_eq(blocked.inner(), &inner));
    }

    #[test]
    fn test_wrapper_shares_identity_with_inner() {
        let pool = Arc::new(BufferPool::new(1));
        let inner: NodeRef = Arc::new(Variable::new(Matrix::scalar(1.0), true).register(7, 42, pool));
        let blocked = StopGrad::new(inner.clone());
        assert_eq!(blocked.id(), 7);
        assert_eq!(blocked.timestamp(), 42);
        assert_eq!(blocked.id(), inner.id());
    }
}
