//! Interior graph nodes and their forward/backward state machine

use std::fmt;
use std::sync::Arc;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::{
    error::{KilnError, KilnResult},
    memory::MemoryPool,
    tensor::Matrix,
};
use super::function::Function;
use super::node::{Node, NodeId, NodeKind, NodeRef};

/// Where an operator stands with respect to the current backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardState {
    /// No backward obligations.
    Idle,
    /// Registered as a backward target; its fan-in is being delivered.
    Pending,
    /// Its own function backward has been dispatched.
    Ongoing,
}

#[derive(Debug)]
enum ValueSlot {
    Unset,
    Computing,
    Ready(Matrix),
    Failed(KilnError),
    Released,
}

#[derive(Debug)]
struct GradSlot {
    grad: Option<Matrix>,
    pending: i64,
    state: BackwardState,
}

/// A function together with its memoized output and accumulated gradient.
pub struct Operator {
    id: NodeId,
    timestamp: u64,
    requires_grad: bool,
    function: RwLock<Option<Box<dyn Function>>>,
    value: Mutex<ValueSlot>,
    value_ready: Condvar,
    grad: Mutex<GradSlot>,
    grad_ready: Condvar,
    pool: Arc<dyn MemoryPool>,
}

impl Operator {
    pub(crate) fn new(
        id: NodeId,
        timestamp: u64,
        function: Box<dyn Function>,
        pool: Arc<dyn MemoryPool>,
    ) -> Self {
        let requires_grad = function.operands().iter().any(|x| x.requires_grad());
        Self {
            id,
            timestamp,
            requires_grad,
            function: RwLock::new(Some(function)),
            value: Mutex::new(ValueSlot::Unset),
            value_ready: Condvar::new(),
            grad: Mutex::new(GradSlot {
                grad: None,
                pending: 0,
                state: BackwardState::Idle,
            }),
            grad_ready: Condvar::new(),
            pool,
        }
    }

    /// Name of the wrapped function, `None` once released.
    pub fn function_name(&self) -> Option<&'static str> {
        self.function.read().as_ref().map(|f| f.name())
    }

    /// Operands of the wrapped function. Empty once released.
    pub fn operands(&self) -> Vec<NodeRef> {
        self.function
            .read()
            .as_ref()
            .map(|f| f.operands())
            .unwrap_or_default()
    }

    pub fn is_computed(&self) -> bool {
        matches!(*self.value.lock(), ValueSlot::Ready(_) | ValueSlot::Failed(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(*self.value.lock(), ValueSlot::Released)
    }

    /// Outstanding gradient contributions before the gradient is final.
    pub fn pending_grads(&self) -> i64 {
        self.grad.lock().pending
    }

    pub fn backward_state(&self) -> BackwardState {
        self.grad.lock().state
    }

    /// Run forward unless another caller already claimed it.
    pub(crate) fn compute(&self) {
        {
            let mut slot = self.value.lock();
            if !matches!(*slot, ValueSlot::Unset) {
                return;
            }
            *slot = ValueSlot::Computing;
        }
        let result = self.run_forward();
        self.store_value(result);
    }

    fn run_forward(&self) -> KilnResult<Matrix> {
        let function = self.function.read();
        match function.as_ref() {
            Some(f) => f.forward(self.pool.as_ref()),
            None => Err(KilnError::NodeReleased { node: self.id }),
        }
    }

    fn store_value(&self, result: KilnResult<Matrix>) {
        let mut slot = self.value.lock();
        *slot = match result {
            Ok(value) => ValueSlot::Ready(value),
            Err(err) => {
                debug!(node = self.id, error = %err, "forward failed");
                ValueSlot::Failed(err)
            }
        };
        self.value_ready.notify_all();
    }

    fn output_shape_mismatch(&self, grad: &Matrix) -> Option<KilnError> {
        match &*self.value.lock() {
            ValueSlot::Ready(value) if !value.same_shape(grad) => Some(KilnError::shape_error(
                &value.shape().to_string(),
                &grad.shape().to_string(),
                Some("gradients must match the shape of the operator output"),
            )),
            _ => None,
        }
    }

    /// Count one more expected contribution. Returns true on the first
    /// registration of the current pass.
    pub(crate) fn register_pending(&self) -> bool {
        let mut slot = self.grad.lock();
        slot.pending += 1;
        if slot.state == BackwardState::Idle {
            slot.state = BackwardState::Pending;
            true
        } else {
            false
        }
    }

    /// Consume the root seed contribution without touching the existing gradient.
    pub(crate) fn resolve_seed(&self) {
        let mut slot = self.grad.lock();
        if slot.pending > 0 {
            slot.pending -= 1;
            if slot.pending == 0 {
                self.grad_ready.notify_all();
            }
        }
    }

    /// Pending -> Ongoing once every contribution arrived. Exactly one caller wins.
    pub(crate) fn try_begin_backward(&self) -> bool {
        let mut slot = self.grad.lock();
        if slot.state == BackwardState::Pending && slot.pending == 0 {
            slot.state = BackwardState::Ongoing;
            true
        } else {
            false
        }
    }

    /// Propagate the final gradient through the function.
    pub(crate) fn run_backward(&self) -> KilnResult<()> {
        let grad = self.grad.lock().grad.clone();
        let grad = match grad {
            Some(grad) => grad,
            None => return Ok(()),
        };
        let function = self.function.read();
        match function.as_ref() {
            Some(f) => f.backward(&grad),
            None => Err(KilnError::NodeReleased { node: self.id }),
        }
    }

    pub(crate) fn finish_backward(&self) {
        self.grad.lock().state = BackwardState::Idle;
    }

    /// Drop any backward bookkeeping. Returns true if something was left over.
    pub(crate) fn reset_backward(&self) -> bool {
        let mut slot = self.grad.lock();
        let dirty = slot.pending != 0 || slot.state != BackwardState::Idle;
        slot.pending = 0;
        slot.state = BackwardState::Idle;
        self.grad_ready.notify_all();
        dirty
    }

    /// Return value and gradient buffers to the pool and drop the function.
    /// Returns the operands the function referenced.
    pub(crate) fn release(&self) -> Vec<NodeRef> {
        {
            let mut slot = self.value.lock();
            while matches!(*slot, ValueSlot::Computing) {
                self.value_ready.wait(&mut slot);
            }
            if let ValueSlot::Ready(value) = std::mem::replace(&mut *slot, ValueSlot::Released) {
                self.pool.release(value);
            }
            self.value_ready.notify_all();
        }
        {
            let mut slot = self.grad.lock();
            if let Some(grad) = slot.grad.take() {
                self.pool.release(grad);
            }
            slot.pending = 0;
            slot.state = BackwardState::Idle;
            self.grad_ready.notify_all();
        }
        match self.function.write().take() {
            Some(function) => function.operands(),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.id)
            .field("function", &self.function_name())
            .field("requires_grad", &self.requires_grad)
            .field("computed", &self.is_computed())
            .field("backward_state", &self.backward_state())
            .finish()
    }
}

impl Node for Operator {
    fn id(&self) -> NodeId {
        self.id
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Blocks until the output is available. Computes it on the calling
    /// thread if nobody has started yet.
    fn value(&self) -> KilnResult<Matrix> {
        let mut slot = self.value.lock();
        loop {
            let claim = match &*slot {
                ValueSlot::Ready(value) => return Ok(value.clone()),
                ValueSlot::Failed(err) => return Err(err.clone()),
                ValueSlot::Released => return Err(KilnError::NodeReleased { node: self.id }),
                ValueSlot::Computing => false,
                ValueSlot::Unset => true,
            };
            if claim {
                *slot = ValueSlot::Computing;
                drop(slot);
                let result = self.run_forward();
                self.store_value(result);
                slot = self.value.lock();
            } else {
                self.value_ready.wait(&mut slot);
            }
        }
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Blocks while gradient contributions are still pending.
    fn grad(&self) -> Option<Matrix> {
        let mut slot = self.grad.lock();
        while slot.pending > 0 {
            self.grad_ready.wait(&mut slot);
        }
        slot.grad.clone()
    }

    fn has_grad(&self) -> bool {
        self.grad.lock().grad.is_some()
    }

    fn acc_grad(&self, grad: &Matrix) -> KilnResult<()> {
        if !self.requires_grad {
            return Ok(());
        }
        if let Some(err) = self.output_shape_mismatch(grad) {
            return Err(err);
        }

        let mut slot = self.grad.lock();
        match slot.grad.as_mut() {
            Some(existing) => existing.add_in_place(grad)?,
            None => {
                let mut buffer = self.pool.acquire(grad.shape());
                buffer.add_in_place(grad)?;
                slot.grad = Some(buffer);
            }
        }
        if slot.pending > 0 {
            slot.pending -= 1;
            if slot.pending == 0 {
                self.grad_ready.notify_all();
            }
        }
        Ok(())
    }

    fn zero_grad(&self) {
        if let Some(grad) = self.grad.lock().grad.take() {
            self.pool.release(grad);
        }
    }

    fn kind(&self) -> NodeKind<'_> {
        NodeKind::Operator(self)
    }
}
