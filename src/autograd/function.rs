//! The Function contract and the built-in differentiable operations

use std::fmt::Debug;
use std::sync::Arc;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng};

use crate::{
    error::{KilnError, KilnResult},
    memory::MemoryPool,
    tensor::{Matrix, Shape},
};
use super::node::{Node, NodeRef};

/// One differentiable operation over a fixed set of operands.
///
/// `forward` runs at most once per operator and must not mutate its operands.
/// Its output is written into a buffer acquired from `pool`, which is where
/// the owning operator returns it on release.
/// `backward` receives the final gradient of the output and accumulates the
/// resulting gradients onto every operand that requires them.
pub trait Function: Send + Sync + Debug {
    fn operands(&self) -> Vec<NodeRef>;

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix>;

    fn backward(&self, gy: &Matrix) -> KilnResult<()>;

    fn name(&self) -> &'static str;
}

/// Output shape of an element-wise binary op. A scalar operand broadcasts
/// against the other; any other mismatch is an error.
fn broadcast_shape(operation: &str, a: Shape, b: Shape) -> KilnResult<Shape> {
    if a == b || b.is_scalar() {
        Ok(a)
    } else if a.is_scalar() {
        Ok(b)
    } else {
        Err(KilnError::shape_error(
            &a.to_string(),
            &b.to_string(),
            Some(&format!("{} only broadcasts scalar operands", operation)),
        ))
    }
}

fn expand(x: &Matrix, shape: Shape) -> Matrix {
    if x.shape() == shape {
        x.clone()
    } else {
        Matrix::full(shape, x.as_slice()[0])
    }
}

/// Reduce an output-shaped gradient onto an operand of shape `target`.
fn reduce_to(grad: Matrix, target: Shape) -> Matrix {
    if grad.shape() == target {
        grad
    } else {
        Matrix::scalar(grad.sum())
    }
}

fn check_output_grad(operation: &str, gy: &Matrix, expected: Shape) -> KilnResult<()> {
    if gy.shape() != expected {
        return Err(KilnError::shape_error(
            &expected.to_string(),
            &gy.shape().to_string(),
            Some(&format!("output gradient of {} has the wrong shape", operation)),
        ));
    }
    Ok(())
}

/// Element-wise combination of two equally shaped matrices into a pooled buffer.
fn zip_into<F>(pool: &dyn MemoryPool, x1: &Matrix, x2: &Matrix, f: F) -> Matrix
where
    F: Fn(f32, f32) -> f32,
{
    let mut out = pool.acquire(x1.shape());
    for ((o, a), b) in out.as_slice_mut().iter_mut().zip(x1.as_slice()).zip(x2.as_slice()) {
        *o = f(*a, *b);
    }
    out
}

fn copy_into(pool: &dyn MemoryPool, x: &Matrix) -> Matrix {
    let mut out = pool.acquire(x.shape());
    out.as_slice_mut().copy_from_slice(x.as_slice());
    out
}

fn binary_inputs(operation: &str, a: &NodeRef, b: &NodeRef) -> KilnResult<(Matrix, Matrix, Shape)> {
    let x = a.value()?;
    let y = b.value()?;
    let shape = broadcast_shape(operation, x.shape(), y.shape())?;
    Ok((expand(&x, shape), expand(&y, shape), shape))
}

#[derive(Debug, Clone)]
pub struct Add {
    x1: NodeRef,
    x2: NodeRef,
}

impl Add {
    pub fn new(x1: NodeRef, x2: NodeRef) -> Self {
        Self { x1, x2 }
    }
}

impl Function for Add {
    fn operands(&self) -> Vec<NodeRef> {
        vec![self.x1.clone(), self.x2.clone()]
    }

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix> {
        let (x1, x2, _) = binary_inputs(self.name(), &self.x1, &self.x2)?;
        Ok(zip_into(pool, &x1, &x2, |a, b| a + b))
    }

    fn backward(&self, gy: &Matrix) -> KilnResult<()> {
        let s1 = self.x1.value()?.shape();
        let s2 = self.x2.value()?.shape();
        check_output_grad(self.name(), gy, broadcast_shape(self.name(), s1, s2)?)?;
        if self.x1.requires_grad() {
            self.x1.acc_grad(&reduce_to(gy.clone(), s1))?;
        }
        if self.x2.requires_grad() {
            self.x2.acc_grad(&reduce_to(gy.clone(), s2))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Add"
    }
}

#[derive(Debug, Clone)]
pub struct Sub {
    x1: NodeRef,
    x2: NodeRef,
}

impl Sub {
    pub fn new(x1: NodeRef, x2: NodeRef) -> Self {
        Self { x1, x2 }
    }
}

impl Function for Sub {
    fn operands(&self) -> Vec<NodeRef> {
        vec![self.x1.clone(), self.x2.clone()]
    }

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix> {
        let (x1, x2, _) = binary_inputs(self.name(), &self.x1, &self.x2)?;
        Ok(zip_into(pool, &x1, &x2, |a, b| a - b))
    }

    fn backward(&self, gy: &Matrix) -> KilnResult<()> {
        let s1 = self.x1.value()?.shape();
        let s2 = self.x2.value()?.shape();
        check_output_grad(self.name(), gy, broadcast_shape(self.name(), s1, s2)?)?;
        if self.x1.requires_grad() {
            self.x1.acc_grad(&reduce_to(gy.clone(), s1))?;
        }
        if self.x2.requires_grad() {
            self.x2.acc_grad(&reduce_to(gy.neg(), s2))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Sub"
    }
}

/// Element-wise product.
#[derive(Debug, Clone)]
pub struct Prod {
    x1: NodeRef,
    x2: NodeRef,
}

impl Prod {
    pub fn new(x1: NodeRef, x2: NodeRef) -> Self {
        Self { x1, x2 }
    }
}

impl Function for Prod {
    fn operands(&self) -> Vec<NodeRef> {
        vec![self.x1.clone(), self.x2.clone()]
    }

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix> {
        let (x1, x2, _) = binary_inputs(self.name(), &self.x1, &self.x2)?;
        Ok(zip_into(pool, &x1, &x2, |a, b| a * b))
    }

    fn backward(&self, gy: &Matrix) -> KilnResult<()> {
        let s1 = self.x1.value()?.shape();
        let s2 = self.x2.value()?.shape();
        let (x1, x2, shape) = binary_inputs(self.name(), &self.x1, &self.x2)?;
        check_output_grad(self.name(), gy, shape)?;
        if self.x1.requires_grad() {
            self.x1.acc_grad(&reduce_to(gy.prod(&x2)?, s1))?;
        }
        if self.x2.requires_grad() {
            self.x2.acc_grad(&reduce_to(gy.prod(&x1)?, s2))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Prod"
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    x: NodeRef,
}

impl Identity {
    pub fn new(x: NodeRef) -> Self {
        Self { x }
    }
}

impl Function for Identity {
    fn operands(&self) -> Vec<NodeRef> {
        vec![self.x.clone()]
    }

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix> {
        Ok(copy_into(pool, &self.x.value()?))
    }

    fn backward(&self, gy: &Matrix) -> KilnResult<()> {
        if self.x.requires_grad() {
            self.x.acc_grad(gy)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Identity"
    }
}

/// Sum of all elements, producing a scalar.
#[derive(Debug, Clone)]
pub struct ReduceSum {
    x: NodeRef,
}

impl ReduceSum {
    pub fn new(x: NodeRef) -> Self {
        Self { x }
    }
}

impl Function for ReduceSum {
    fn operands(&self) -> Vec<NodeRef> {
        vec![self.x.clone()]
    }

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix> {
        let mut out = pool.acquire(Shape::scalar());
        out.as_slice_mut()[0] = self.x.value()?.sum();
        Ok(out)
    }

    fn backward(&self, gy: &Matrix) -> KilnResult<()> {
        check_output_grad(self.name(), gy, Shape::scalar())?;
        if self.x.requires_grad() {
            let shape = self.x.value()?.shape();
            self.x.acc_grad(&Matrix::full(shape, gy.scalar_value()?))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReduceSum"
    }
}

/// Inverted dropout: kept elements are scaled by `1 / (1 - p)` so the
/// expected output equals the input. Identity when not training or `p == 0`.
#[derive(Debug)]
pub struct Dropout {
    x: NodeRef,
    p: f32,
    training: bool,
    rng: Arc<Mutex<StdRng>>,
    mask: Mutex<Option<Matrix>>,
}

impl Dropout {
    pub fn new(x: NodeRef, p: f32, training: bool, rng: Arc<Mutex<StdRng>>) -> KilnResult<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(KilnError::InvalidInput(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self {
            x,
            p,
            training,
            rng,
            mask: Mutex::new(None),
        })
    }

    fn is_active(&self) -> bool {
        self.training && self.p > 0.0
    }
}

impl Function for Dropout {
    fn operands(&self) -> Vec<NodeRef> {
        vec![self.x.clone()]
    }

    fn forward(&self, pool: &dyn MemoryPool) -> KilnResult<Matrix> {
        let x = self.x.value()?;
        if !self.is_active() {
            return Ok(copy_into(pool, &x));
        }

        let scale = 1.0 / (1.0 - self.p);
        let mut mask = Matrix::zeros(x.shape());
        {
            let mut rng = self.rng.lock();
            for m in mask.as_slice_mut() {
                if rng.gen::<f32>() >= self.p {
                    *m = scale;
                }
            }
        }
        let y = zip_into(pool, &x, &mask, |a, m| a * m);
        *self.mask.lock() = Some(mask);
        Ok(y)
    }

    fn backward(&self, gy: &Matrix) -> KilnResult<()> {
        if !self.x.requires_grad() {
            return Ok(());
        }
        if !self.is_active() {
            return self.x.acc_grad(gy);
        }
        let mask = self.mask.lock().clone().ok_or_else(|| {
            KilnError::InvalidState("dropout backward ran before forward".to_string())
        })?;
        check_output_grad(self.name(), gy, mask.shape())?;
        self.x.acc_grad(&gy.prod(&mask)?)
    }

    fn name(&self) -> &'static str {
        "Dropout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::variable::{Constant, Variable};
    use crate::memory::BufferPool;
    use rand::SeedableRng;

    fn var(value: Matrix) -> Arc<Variable> {
        Arc::new(Variable::new(value, true))
    }

    #[test]
    fn test_add_and_sub() {
        let pool = BufferPool::new(4);
        let a = var(Matrix::vector(vec![1.0, 2.0]));
        let b = var(Matrix::vector(vec![3.0, 5.0]));

        let add = Add::new(a.clone(), b.clone());
        assert_eq!(add.forward(&pool).unwrap().as_slice(), &[4.0, 7.0]);
        add.backward(&Matrix::vector(vec![1.0, 2.0])).unwrap();

        let sub = Sub::new(a.clone(), b.clone());
        assert_eq!(sub.forward(&pool).unwrap().as_slice(), &[-2.0, -3.0]);
        sub.backward(&Matrix::vector(vec![1.0, 1.0])).unwrap();

        assert_eq!(a.grad().unwrap().as_slice(), &[2.0, 3.0]);
        assert_eq!(b.grad().unwrap().as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn test_scalar_broadcast() {
        let pool = BufferPool::new(4);
        let v = var(Matrix::vector(vec![1.0, 2.0, 3.0]));
        let k = var(Matrix::scalar(2.0));

        let prod = Prod::new(v.clone(), k.clone());
        assert_eq!(prod.forward(&pool).unwrap().as_slice(), &[2.0, 4.0, 6.0]);
        prod.backward(&Matrix::vector(vec![1.0, 1.0, 1.0])).unwrap();

        assert_eq!(v.grad().unwrap().as_slice(), &[2.0, 2.0, 2.0]);
        assert_eq!(k.grad().unwrap().scalar_value().unwrap(), 6.0);
    }

    #[test]
    fn test_incompatible_shapes_fail() {
        let pool = BufferPool::new(4);
        let a = var(Matrix::vector(vec![1.0, 2.0]));
        let b = var(Matrix::vector(vec![1.0, 2.0, 3.0]));
        let add = Add::new(a.clone(), b);
        assert!(matches!(add.forward(&pool), Err(KilnError::ShapeError(_))));

        let id = Add::new(a.clone(), a.clone());
        let err = id.backward(&Matrix::scalar(1.0));
        assert!(matches!(err, Err(KilnError::ShapeError(_))));
        assert!(!a.has_grad());
    }

    #[test]
    fn test_reduce_sum() {
        let pool = BufferPool::new(4);
        let x = var(Matrix::vector(vec![1.0, 2.0, 3.0]));
        let sum = ReduceSum::new(x.clone());
        assert_eq!(sum.forward(&pool).unwrap().scalar_value().unwrap(), 6.0);

        sum.backward(&Matrix::scalar(1.0)).unwrap();
        assert_eq!(x.grad().unwrap().as_slice(), &[1.0, 1.0, 1.0]);

        assert!(sum.backward(&Matrix::vector(vec![1.0, 1.0])).is_err());
    }

    #[test]
    fn test_constant_operands_receive_nothing() {
        let c: NodeRef = Arc::new(Constant::new(Matrix::scalar(4.0)));
        let x = var(Matrix::scalar(1.0));
        let add = Add::new(c.clone(), x.clone());
        add.backward(&Matrix::scalar(1.0)).unwrap();
        assert!(c.grad().is_none());
        assert_eq!(x.grad().unwrap().scalar_value().unwrap(), 1.0);
    }

    #[test]
    fn test_dropout_masks_consistently() {
        let pool = BufferPool::new(4);
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(7)));
        let x = var(Matrix::ones(Shape::new(1, 64)));
        let dropout = Dropout::new(x.clone(), 0.5, true, rng).unwrap();

        let y = dropout.forward(&pool).unwrap();
        assert!(y.as_slice().iter().all(|&v| v == 0.0 || v == 2.0));

        dropout.backward(&Matrix::ones(Shape::new(1, 64))).unwrap();
        assert_eq!(x.grad().unwrap(), y);
    }

    #[test]
    fn test_dropout_inactive_is_identity() {
        let pool = BufferPool::new(4);
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(7)));
        let x = var(Matrix::vector(vec![1.0, 2.0]));
        let dropout = Dropout::new(x.clone(), 0.5, false, rng.clone()).unwrap();
        assert_eq!(dropout.forward(&pool).unwrap().as_slice(), &[1.0, 2.0]);

        assert!(Dropout::new(x, 1.0, true, rng).is_err());
    }

    #[test]
    fn test_dropout_backward_needs_a_mask() {
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(3)));
        let x = var(Matrix::vector(vec![1.0, 2.0]));
        let dropout = Dropout::new(x.clone(), 0.5, true, rng).unwrap();
        let err = dropout.backward(&Matrix::vector(vec![1.0, 1.0]));
        assert!(matches!(err, Err(KilnError::InvalidState(_))));
        assert!(!x.has_grad());
    }

    #[test]
    fn test_outputs_are_drawn_from_pool() {
        let pool = BufferPool::new(4);
        pool.release(Matrix::full(Shape::new(1, 2), 9.0));
        pool.release(Matrix::full(Shape::scalar(), 9.0));

        let a = var(Matrix::vector(vec![1.0, 2.0]));
        let b = var(Matrix::vector(vec![3.0, 5.0]));
        let y = Prod::new(a.clone(), b).forward(&pool).unwrap();
        assert_eq!(y.as_slice(), &[3.0, 10.0]);
        let total = ReduceSum::new(a).forward(&pool).unwrap();
        assert_eq!(total.scalar_value().unwrap(), 3.0);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.reused, 2);
        assert_eq!(stats.pooled, 0);
    }
}
