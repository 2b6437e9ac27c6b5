//! Graph ownership of nodes, execution resources and time steps

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use crate::{
    config::{get_config, ForwardMode, KilnConfig},
    error::KilnResult,
    memory::{default_pool, MemoryPool},
    tensor::Matrix,
};
use super::backward::{self, Truncation};
use super::forward::Executor;
use super::function::Function;
use super::node::{Node, NodeId, NodeRef};
use super::operator::Operator;
use super::release;
use super::timestep::{Clock, TimeStepHandler};
use super::variable::{Constant, Variable};

/// Owns every node created through it, in creation order.
///
/// Node ids are positions in that order, so an operator's operands always
/// have smaller ids than the operator itself.
pub struct Graph {
    nodes: RwLock<Vec<NodeRef>>,
    constants: Mutex<HashMap<u32, NodeRef>>,
    time_steps: TimeStepHandler,
    clock: Arc<Clock>,
    pool: Arc<dyn MemoryPool>,
    rng: Arc<Mutex<StdRng>>,
    executor: Executor,
    forward_mode: ForwardMode,
    config: KilnConfig,
}

impl Graph {
    /// A graph configured from the global configuration.
    pub fn new() -> KilnResult<Self> {
        Self::with_config(get_config())
    }

    pub fn with_config(config: KilnConfig) -> KilnResult<Self> {
        Self::with_resources(config, default_pool(), Arc::new(Clock::new()))
    }

    /// A graph using an explicit buffer pool and creation clock.
    pub fn with_resources(config: KilnConfig, pool: Arc<dyn MemoryPool>, clock: Arc<Clock>) -> KilnResult<Self> {
        config.validate()?;
        let executor = Executor::from_concurrency(config.execution.concurrency)?;
        info!(
            concurrency = ?config.execution.concurrency,
            forward_mode = ?config.execution.forward_mode,
            threads = executor.num_threads(),
            "graph created"
        );

        Ok(Self {
            nodes: RwLock::new(Vec::new()),
            constants: Mutex::new(HashMap::new()),
            time_steps: TimeStepHandler::new(),
            clock,
            pool,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(config.graph.seed))),
            executor,
            forward_mode: config.execution.forward_mode,
            config,
        })
    }

    fn register<N, F>(&self, build: F) -> Arc<N>
    where
        N: Node + 'static,
        F: FnOnce(NodeId, u64) -> N,
    {
        let mut nodes = self.nodes.write();
        let node = Arc::new(build(nodes.len(), self.clock.tick()));
        nodes.push(node.clone());
        node
    }

    pub fn new_variable(&self, value: Matrix, requires_grad: bool) -> NodeRef {
        self.add_variable(Variable::new(value, requires_grad))
    }

    pub fn new_variable_with_name(&self, value: Matrix, requires_grad: bool, name: &str) -> NodeRef {
        self.add_variable(Variable::new(value, requires_grad).with_name(name))
    }

    /// Register a variable built by the caller.
    pub fn add_variable(&self, variable: Variable) -> NodeRef {
        let pool = self.pool.clone();
        self.register::<Variable, _>(move |id, ts| variable.register(id, ts, pool))
    }

    pub fn new_scalar(&self, value: f32, requires_grad: bool) -> NodeRef {
        self.new_variable(Matrix::scalar(value), requires_grad)
    }

    pub fn new_constant(&self, value: Matrix) -> NodeRef {
        self.add_constant(Constant::new(value))
    }

    pub fn add_constant(&self, constant: Constant) -> NodeRef {
        self.register::<Constant, _>(move |id, ts| constant.register(id, ts))
    }

    /// Scalar constant, shared per value when caching is enabled.
    pub fn constant(&self, value: f32) -> NodeRef {
        if !self.config.graph.cache_scalar_constants {
            return self.new_constant(Matrix::scalar(value));
        }
        let mut cache = self.constants.lock();
        cache
            .entry(value.to_bits())
            .or_insert_with(|| self.new_constant(Matrix::scalar(value)))
            .clone()
    }

    /// Wrap `function` in an operator. In eager mode its forward computation
    /// is started immediately.
    pub fn new_operator<F>(&self, function: F) -> NodeRef
    where
        F: Function + 'static,
    {
        let pool = self.pool.clone();
        let op = self.register(move |id, ts| Operator::new(id, ts, Box::new(function), pool));
        if self.forward_mode == ForwardMode::Eager {
            self.executor.schedule(op.clone());
        }
        op
    }

    /// Compute every operator that has not been computed yet.
    pub fn forward(&self) {
        let nodes = self.nodes();
        self.executor.forward_all(&nodes);
    }

    /// Backpropagate from `node`, seeded with `grad` or with ones.
    pub fn backward(&self, node: &NodeRef, grad: Option<Matrix>) -> KilnResult<()> {
        backward::run_single(&self.executor, node, grad, None)
    }

    /// Backpropagate from several roots at once, each seeded with ones
    /// unless it already carries a gradient.
    pub fn backward_many(&self, nodes: &[NodeRef]) -> KilnResult<()> {
        let roots: Vec<_> = nodes.iter().map(|n| (n.clone(), None)).collect();
        backward::run(&self.executor, &roots, None)
    }

    /// Like `backward`, skipping nodes whose step is at or before
    /// `handler.current_time_step() - back_steps`.
    pub fn backward_truncated(
        &self,
        node: &NodeRef,
        grad: Option<Matrix>,
        handler: &TimeStepHandler,
        back_steps: usize,
    ) -> KilnResult<()> {
        backward::run_single(&self.executor, node, grad, Some(Truncation::new(handler, back_steps)))
    }

    pub fn backward_many_truncated(
        &self,
        nodes: &[NodeRef],
        handler: &TimeStepHandler,
        back_steps: usize,
    ) -> KilnResult<()> {
        let roots: Vec<_> = nodes.iter().map(|n| (n.clone(), None)).collect();
        backward::run(&self.executor, &roots, Some(Truncation::new(handler, back_steps)))
    }

    /// Release the values and gradients of every operator reachable from
    /// `roots`. Released operators must not be read again.
    pub fn release_graph(&self, roots: &[NodeRef]) -> usize {
        release::release_graph(roots)
    }

    /// Release every operator and forget all nodes, constants and time steps.
    pub fn clear(&self) {
        let nodes = std::mem::take(&mut *self.nodes.write());
        let released = release::release_graph(&nodes);
        self.constants.lock().clear();
        self.time_steps.reset();
        debug!(nodes = nodes.len(), released, "graph cleared");
    }

    /// Drop the gradients of every node.
    pub fn zero_grad(&self) {
        for node in self.nodes.read().iter() {
            node.zero_grad();
        }
    }

    pub fn node(&self, id: NodeId) -> Option<NodeRef> {
        self.nodes.read().get(id).cloned()
    }

    /// Snapshot of all nodes in creation order.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Start a new time step. Nodes created from now on belong to it.
    pub fn inc_time_step(&self) {
        self.time_steps.increment(self.clock.now());
    }

    /// Steps started so far minus one, so -1 before the first `inc_time_step`.
    pub fn current_time_step(&self) -> isize {
        self.time_steps.current_time_step()
    }

    pub fn time_step_of(&self, node: &NodeRef) -> usize {
        self.time_steps.node_time_step(node.as_ref())
    }

    pub fn time_step_handler(&self) -> &TimeStepHandler {
        &self.time_steps
    }

    /// Generator shared with stochastic functions.
    pub fn rng(&self) -> Arc<Mutex<StdRng>> {
        self.rng.clone()
    }

    pub fn pool(&self) -> Arc<dyn MemoryPool> {
        self.pool.clone()
    }

    pub fn clock(&self) -> Arc<Clock> {
        self.clock.clone()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.len())
            .field("time_step", &self.current_time_step())
            .field("executor", &self.executor)
            .field("forward_mode", &self.forward_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ops::{add, dropout, identity, prod, reduce_sum, stop_grad, sub};
    use crate::config::ConfigBuilder;
    use crate::error::KilnError;
    use crate::memory::BufferPool;
    use crate::tensor::Shape;

    fn serial() -> Graph {
        Graph::with_config(ConfigBuilder::new().serial().build()).unwrap()
    }

    fn parallel() -> Graph {
        Graph::with_config(ConfigBuilder::new().parallel(4).build()).unwrap()
    }

    fn scalar(node: &NodeRef) -> f32 {
        node.grad().unwrap().scalar_value().unwrap()
    }

    #[test]
    fn test_add_with_seed() {
        for g in [serial(), parallel()] {
            let a = g.new_scalar(2.0, true);
            let b = g.new_scalar(5.0, true);
            let c = add(&g, &a, &b);
            assert_eq!(c.value().unwrap().scalar_value().unwrap(), 7.0);

            g.backward(&c, Some(Matrix::scalar(0.5))).unwrap();
            assert_eq!(scalar(&a), 0.5);
            assert_eq!(scalar(&b), 0.5);
        }
    }

    #[test]
    fn test_reduce_sum_default_seed() {
        let g = serial();
        let x = g.new_variable(Matrix::vector(vec![1.0, 2.0, 3.0]), true);
        let y = reduce_sum(&g, &x);
        g.backward(&y, None).unwrap();
        assert_eq!(x.grad().unwrap().as_slice(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_diamond() {
        for g in [serial(), parallel()] {
            let a = g.new_scalar(1.0, true);
            let b = identity(&g, &a);
            let c = identity(&g, &a);
            let d = add(&g, &b, &c);
            g.backward(&d, Some(Matrix::scalar(3.0))).unwrap();
            assert_eq!(scalar(&a), 6.0);
        }
    }

    #[test]
    fn test_accumulation_law() {
        let grad_of = |paths: &[bool; 2]| {
            let g = serial();
            let x = g.new_variable(Matrix::vector(vec![1.0, -2.0]), true);
            let k = g.constant(3.0);
            let mut terms = Vec::new();
            if paths[0] {
                terms.push(prod(&g, &x, &k));
            }
            if paths[1] {
                terms.push(sub(&g, &x, &k));
            }
            let mut total = terms[0].clone();
            for term in &terms[1..] {
                total = add(&g, &total, term);
            }
            let y = reduce_sum(&g, &total);
            g.backward(&y, None).unwrap();
            x.grad().unwrap()
        };

        let both = grad_of(&[true, true]);
        let separate = grad_of(&[true, false]).add(&grad_of(&[false, true])).unwrap();
        assert!(both.approx_eq(&separate, 1e-6));
        assert_eq!(both.as_slice(), &[4.0, 4.0]);
    }

    #[test]
    fn test_default_seed_equals_ones() {
        let run = |seed: Option<Matrix>| {
            let g = serial();
            let x = g.new_variable(Matrix::vector(vec![1.0, 2.0]), true);
            let y = prod(&g, &x, &x);
            g.backward(&y, seed).unwrap();
            x.grad().unwrap()
        };
        assert_eq!(run(None), run(Some(Matrix::vector(vec![1.0, 1.0]))));
    }

    #[test]
    fn test_counters_are_zero_after_pass() {
        let g = parallel();
        let x = g.new_scalar(2.0, true);
        let mut h = x.clone();
        for _ in 0..16 {
            let left = identity(&g, &h);
            h = add(&g, &left, &h);
        }
        g.backward(&h, None).unwrap();
        assert_eq!(scalar(&x), 65536.0);

        for node in g.nodes() {
            if let Some(op) = node.as_operator() {
                assert_eq!(op.pending_grads(), 0);
            }
        }
    }

    #[test]
    fn test_truncation_is_monotonic() {
        let g = serial();
        let x = g.new_scalar(0.0, true);
        let w = g.new_scalar(1.0, true);
        let mut h = x.clone();
        for _ in 0..5 {
            g.inc_time_step();
            h = add(&g, &h, &w);
        }
        assert_eq!(g.current_time_step(), 4);
        assert_eq!(g.time_step_of(&x), 0);
        assert_eq!(g.time_step_of(&h), 4);

        // the first sum shares step 0 with the leaves
        let mut previous = 0.0;
        for k in 1..=5 {
            g.zero_grad();
            g.backward_truncated(&h, None, g.time_step_handler(), k).unwrap();
            let received = scalar(&w);
            assert_eq!(received, k as f32);
            assert!(received > previous);
            previous = received;
            assert_eq!(x.has_grad(), k == 5);
        }

        g.zero_grad();
        g.backward(&h, None).unwrap();
        assert_eq!(scalar(&w), 5.0);
    }

    #[test]
    fn test_operators_before_first_step_share_step_zero() {
        let g = serial();
        let x = g.new_scalar(2.0, true);
        assert_eq!(g.current_time_step(), -1);
        let y1 = identity(&g, &x);
        g.inc_time_step();
        let y2 = identity(&g, &y1);

        assert_eq!(g.current_time_step(), 0);
        assert_eq!(g.time_step_of(&y1), 0);
        assert_eq!(g.time_step_of(&y2), 0);

        g.backward_truncated(&y2, None, g.time_step_handler(), 1).unwrap();
        assert_eq!(scalar(&x), 1.0);
        assert_eq!(scalar(&y1), 1.0);
    }

    #[test]
    fn test_unbounded_look_back_reaches_leaves() {
        let g = serial();
        let x = g.new_scalar(2.0, true);
        g.inc_time_step();
        let y = identity(&g, &x);
        g.inc_time_step();
        let z = identity(&g, &y);

        g.backward_truncated(&z, None, g.time_step_handler(), usize::MAX).unwrap();
        assert_eq!(scalar(&x), 1.0);

        g.zero_grad();
        g.backward_truncated(&z, None, g.time_step_handler(), 1).unwrap();
        assert!(z.has_grad());
        assert!(y.has_grad());
        assert!(!x.has_grad());
    }

    #[test]
    fn test_stop_grad_blocks_flow() {
        let g = parallel();
        let x = g.new_scalar(3.0, true);
        let blocked = stop_grad(&x);
        assert!(!blocked.requires_grad());

        let y = prod(&g, &blocked, &x);
        g.backward(&y, None).unwrap();
        assert_eq!(scalar(&x), 3.0);
        assert!(blocked.grad().is_none());

        let detached = identity(&g, &blocked);
        assert!(!detached.requires_grad());
        assert_eq!(detached.value().unwrap().scalar_value().unwrap(), 3.0);
    }

    #[test]
    fn test_release_finality() {
        let pool = Arc::new(BufferPool::new(16));
        let g = Graph::with_resources(ConfigBuilder::new().serial().build(), pool.clone(), Arc::new(Clock::new())).unwrap();
        let a = g.new_scalar(2.0, true);
        let b = g.new_scalar(5.0, true);
        let c = add(&g, &a, &b);
        let d = identity(&g, &c);
        g.backward(&d, None).unwrap();

        let kept = crate::autograd::node::copy_grad(&a).unwrap();
        assert_eq!(g.release_graph(&[d.clone()]), 2);
        for node in [&c, &d] {
            assert_eq!(node.value(), Err(KilnError::NodeReleased { node: node.id() }));
            assert!(node.grad().is_none());
        }
        assert_eq!(kept.scalar_value().unwrap(), 1.0);
        assert!(pool.stats().released >= 4);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let build = |g: &Graph| {
            let inputs: Vec<NodeRef> = (0..8)
                .map(|i| g.new_variable(Matrix::vector(vec![i as f32, 1.0 - i as f32, 0.5]), true))
                .collect();
            let mut layer = inputs.clone();
            while layer.len() > 1 {
                layer = layer
                    .chunks(2)
                    .map(|pair| {
                        let p = prod(g, &pair[0], &pair[1]);
                        add(g, &p, &pair[0])
                    })
                    .collect();
            }
            let y = reduce_sum(g, &layer[0]);
            g.backward(&y, None).unwrap();
            inputs.iter().map(|x| x.grad().unwrap()).collect::<Vec<_>>()
        };

        let expected = build(&serial());
        let actual = build(&parallel());
        for (e, a) in expected.iter().zip(&actual) {
            assert!(e.approx_eq(a, 1e-4), "{:?} != {:?}", e, a);
        }
    }

    #[test]
    fn test_conflicting_seed() {
        let g = serial();
        let x = g.new_scalar(1.0, true);
        let y = identity(&g, &x);
        y.acc_grad(&Matrix::scalar(1.0)).unwrap();

        let err = g.backward(&y, Some(Matrix::scalar(2.0)));
        assert_eq!(err, Err(KilnError::ConflictingGradientSeed { node: y.id() }));
        assert!(x.grad().is_none());
    }

    #[test]
    fn test_backward_many_sums_roots() {
        let g = parallel();
        let x = g.new_scalar(2.0, true);
        let y1 = prod(&g, &x, &x);
        let y2 = identity(&g, &x);
        g.backward_many(&[y1, y2]).unwrap();
        assert_eq!(scalar(&x), 5.0);
    }

    #[test]
    fn test_forward_error_surfaces_in_backward() {
        let g = parallel();
        let a = g.new_variable(Matrix::vector(vec![1.0, 2.0]), true);
        let b = g.new_variable(Matrix::vector(vec![1.0, 2.0, 3.0]), true);
        let c = add(&g, &a, &b);
        assert!(matches!(c.value(), Err(KilnError::ShapeError(_))));
        assert!(matches!(g.backward(&c, None), Err(KilnError::ShapeError(_))));
    }

    #[test]
    fn test_lazy_forward() {
        let config = ConfigBuilder::new()
            .parallel(2)
            .execution(|e| e.forward_mode = ForwardMode::Lazy)
            .build();
        let g = Graph::with_config(config).unwrap();
        let x = g.new_scalar(2.0, true);
        let y = add(&g, &x, &x);
        let z = prod(&g, &y, &x);
        assert!(!z.as_operator().unwrap().is_computed());

        g.forward();
        assert!(y.as_operator().unwrap().is_computed());
        assert!(z.as_operator().unwrap().is_computed());
        assert_eq!(z.value().unwrap().scalar_value().unwrap(), 8.0);
    }

    #[test]
    fn test_constant_cache_and_bookkeeping() {
        let g = serial();
        assert!(g.is_empty());
        let two = g.constant(2.0);
        assert_eq!(g.constant(2.0).id(), two.id());
        assert_ne!(g.constant(3.0).id(), two.id());
        assert_eq!(g.len(), 2);

        let named = g.new_variable_with_name(Matrix::zeros(Shape::new(2, 2)), true, "w");
        assert_eq!(g.node(named.id()).unwrap().name(), Some("w"));

        let y = add(&g, &named, &two);
        g.backward(&y, None).unwrap();
        g.zero_grad();
        assert!(!named.has_grad());

        g.clear();
        assert!(g.is_empty());
        assert!(y.value().is_err());
        assert_eq!(g.current_time_step(), -1);
    }

    #[test]
    fn test_dropout_uses_graph_generator() {
        let g = serial();
        let x = g.new_variable(Matrix::ones(Shape::new(1, 32)), true);
        let y = dropout(&g, &x, 0.25, true).unwrap();
        let kept = y.value().unwrap().as_slice().iter().filter(|&&v| v > 0.0).count();
        assert!(kept > 0 && kept < 32);

        let eval = dropout(&g, &x, 0.25, false).unwrap();
        assert_eq!(eval.value().unwrap(), x.value().unwrap());
        assert!(dropout(&g, &x, 1.5, true).is_err());
    }
}
