//! Leaf nodes: trainable variables and constants

use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{KilnError, KilnResult},
    memory::{default_pool, MemoryPool},
    tensor::Matrix,
};
use super::node::{Node, NodeId, NodeKind};

/// Leaf holding a value and, when `requires_grad` is set, an accumulated gradient.
pub struct Variable {
    id: NodeId,
    timestamp: u64,
    value: Matrix,
    name: Option<String>,
    requires_grad: bool,
    grad: Mutex<Option<Matrix>>,
    pool: Arc<dyn MemoryPool>,
}

impl Variable {
    /// An unregistered variable. `Graph::add_variable` assigns its id and timestamp.
    pub fn new(value: Matrix, requires_grad: bool) -> Self {
        Self {
            id: 0,
            timestamp: 0,
            value,
            name: None,
            requires_grad,
            grad: Mutex::new(None),
            pool: default_pool(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn register(mut self, id: NodeId, timestamp: u64, pool: Arc<dyn MemoryPool>) -> Self {
        self.id = id;
        self.timestamp = timestamp;
        self.pool = pool;
        self
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.value.shape())
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.has_grad())
            .finish()
    }
}

impl Node for Variable {
    fn id(&self) -> NodeId {
        self.id
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn value(&self) -> KilnResult<Matrix> {
        Ok(self.value.clone())
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    fn grad(&self) -> Option<Matrix> {
        self.grad.lock().clone()
    }

    fn has_grad(&self) -> bool {
        self.grad.lock().is_some()
    }

    fn acc_grad(&self, grad: &Matrix) -> KilnResult<()> {
        if !self.requires_grad {
            return Ok(());
        }
        if !self.value.same_shape(grad) {
            return Err(KilnError::shape_error(
                &self.value.shape().to_string(),
                &grad.shape().to_string(),
                Some("gradients must match the shape of the variable"),
            ));
        }

        let mut slot = self.grad.lock();
        match slot.as_mut() {
            Some(existing) => existing.add_in_place(grad)?,
            None => {
                let mut buffer = self.pool.acquire(grad.shape());
                buffer.add_in_place(grad)?;
                *slot = Some(buffer);
            }
        }
        Ok(())
    }

    fn zero_grad(&self) {
        if let Some(grad) = self.grad.lock().take() {
            self.pool.release(grad);
        }
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn kind(&self) -> NodeKind<'_> {
        NodeKind::Leaf
    }
}

/// Leaf without gradient machinery.
#[derive(Debug, Clone)]
pub struct Constant {
    id: NodeId,
    timestamp: u64,
    value: Matrix,
    name: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ConstantRecord {
    value: Matrix,
    name: Option<String>,
}

impl Constant {
    /// An unregistered constant. `Graph::add_constant` assigns its id and timestamp.
    pub fn new(value: Matrix) -> Self {
        Self {
            id: 0,
            timestamp: 0,
            value,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn register(mut self, id: NodeId, timestamp: u64) -> Self {
        self.id = id;
        self.timestamp = timestamp;
        self
    }

    /// Binary encoding of value and name.
    pub fn to_bytes(&self) -> KilnResult<Vec<u8>> {
        let record = ConstantRecord {
            value: self.value.clone(),
            name: self.name.clone(),
        };
        Ok(bincode::serialize(&record)?)
    }

    /// Decode a constant written by `to_bytes`. The result is unregistered.
    pub fn from_bytes(bytes: &[u8]) -> KilnResult<Self> {
        let record: ConstantRecord = bincode::deserialize(bytes)?;
        let constant = Constant::new(record.value);
        Ok(match record.name {
            Some(name) => constant.with_name(name),
            None => constant,
        })
    }
}

impl Node for Constant {
    fn id(&self) -> NodeId {
        self.id
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn value(&self) -> KilnResult<Matrix> {
        Ok(self.value.clone())
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
        self.name.as_deref()
    }

    fn kind(&self) -> NodeKind<'_> {
        NodeKind::Leaf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferPool;

    #[test]
    fn test_variable_accumulates() {
        let var = Variable::new(Matrix::vector(vec![1.0, 2.0]), true);
        assert!(!var.has_grad());

        var.acc_grad(&Matrix::vector(vec![0.5, 0.5])).unwrap();
        var.acc_grad(&Matrix::vector(vec![1.0, -1.0])).unwrap();
        assert_eq!(var.grad().unwrap().as_slice(), &[1.5, -0.5]);

        let err = var.acc_grad(&Matrix::scalar(1.0));
        assert!(matches!(err, Err(KilnError::ShapeError(_))));
    }

    #[test]
    fn test_frozen_variable_ignores_gradients() {
        let var = Variable::new(Matrix::scalar(3.0), false);
        var.acc_grad(&Matrix::scalar(1.0)).unwrap();
        assert!(!var.has_grad());
        assert!(var.grad().is_none());
    }

    #[test]
    fn test_zero_grad_returns_buffer() {
        let pool = Arc::new(BufferPool::new(8));
        let var = Variable::new(Matrix::vector(vec![1.0, 2.0]), true).register(0, 0, pool.clone());
        var.acc_grad(&Matrix::vector(vec![1.0, 1.0])).unwrap();
        var.zero_grad();

        assert!(!var.has_grad());
        assert_eq!(pool.stats().released, 1);
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn test_constant_has_no_gradient() {
        let c = Constant::new(Matrix::scalar(2.0)).with_name("two");
        c.acc_grad(&Matrix::scalar(1.0)).unwrap();
        assert!(!c.requires_grad());
        assert!(c.grad().is_none());
        assert_eq!(c.name(), Some("two"));
    }

    #[test]
    fn test_constant_binary_round_trip() {
        let c = Constant::new(Matrix::vector(vec![1.0, 2.5])).with_name("bias");
        let decoded = Constant::from_bytes(&c.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.value().unwrap(), c.value().unwrap());
        assert_eq!(decoded.name(), Some("bias"));

        assert!(Constant::from_bytes(&[1, 2]).is_err());
    }
}
