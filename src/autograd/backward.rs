//! Backward scheduling: fan-in counting, seeding and dispatch
//!
//! A pass runs in three phases. Counting walks every operator reachable from
//! the roots and records how many gradient contributions each one must receive.
//! Seeding delivers the root gradients. Dispatch then runs an operator's
//! function backward as soon as its counter drops to zero, so independent
//! branches proceed concurrently on a parallel executor. The call returns once
//! every dispatched unit of work has finished.

use std::sync::Arc;
use parking_lot::Mutex;
use rayon::Scope;
use tracing::{debug, trace, warn};

use crate::error::{KilnError, KilnResult};
use crate::tensor::Matrix;
use super::forward::Executor;
use super::node::{Node, NodeRef};
use super::timestep::TimeStepHandler;

/// Look-back window for truncated backpropagation.
#[derive(Debug, Clone, Copy)]
pub struct Truncation<'a> {
    pub handler: &'a TimeStepHandler,
    pub back_steps: usize,
}

impl<'a> Truncation<'a> {
    pub fn new(handler: &'a TimeStepHandler, back_steps: usize) -> Self {
        Self { handler, back_steps }
    }

    fn excludes(&self, node: &dyn Node) -> bool {
        self.handler.is_truncated(node.timestamp(), self.back_steps)
    }
}

fn is_excluded(truncation: Option<Truncation<'_>>, node: &dyn Node) -> bool {
    truncation.map_or(false, |t| t.excludes(node))
}

enum Seed {
    Supplied(Matrix),
    Existing,
    Ones(Matrix),
}

/// Check every root before any counter is touched.
fn plan_seeds(roots: &[(NodeRef, Option<Matrix>)]) -> KilnResult<Vec<Option<Seed>>> {
    roots
        .iter()
        .map(|(root, seed)| -> KilnResult<Option<Seed>> {
            if !root.requires_grad() {
                return Ok(None);
            }
            let value = root.value()?;
            let plan = match seed {
                Some(_) if root.has_grad() => {
                    return Err(KilnError::ConflictingGradientSeed { node: root.id() })
                }
                Some(seed) if !seed.same_shape(&value) => {
                    return Err(KilnError::shape_error(
                        &value.shape().to_string(),
                        &seed.shape().to_string(),
                        Some("the output gradient must match the shape of the root"),
                    ))
                }
                Some(seed) => Seed::Supplied(seed.clone()),
                None if root.has_grad() => Seed::Existing,
                None => Seed::Ones(value.ones_like()),
            };
            Ok(Some(plan))
        })
        .collect()
}

/// Register one pending contribution per root and per gradient-carrying edge
/// of the reachable subgraph. Returns every operator visited, in visit order.
pub(crate) fn count_fan_in(roots: &[NodeRef], truncation: Option<Truncation<'_>>) -> Vec<NodeRef> {
    let mut visited = Vec::new();
    let mut stack = Vec::new();

    for root in roots {
        if let Some(op) = root.as_operator() {
            if op.requires_grad() && !is_excluded(truncation, root.as_ref()) && op.register_pending() {
                visited.push(root.clone());
                stack.push(root.clone());
            }
        }
    }

    while let Some(node) = stack.pop() {
        let op = match node.as_operator() {
            Some(op) => op,
            None => continue,
        };
        for operand in op.operands() {
            let child = match operand.as_operator() {
                Some(child) => child,
                None => continue,
            };
            if !child.requires_grad() || is_excluded(truncation, operand.as_ref()) {
                continue;
            }
            if child.register_pending() {
                visited.push(operand.clone());
                stack.push(operand.clone());
            }
        }
    }
    visited
}

fn seed_roots(roots: &[(NodeRef, Option<Matrix>)], seeds: Vec<Option<Seed>>) -> KilnResult<()> {
    for ((root, _), seed) in roots.iter().zip(seeds) {
        match seed {
            None => {}
            Some(Seed::Supplied(grad)) | Some(Seed::Ones(grad)) => root.acc_grad(&grad)?,
            Some(Seed::Existing) => {
                if let Some(op) = root.as_operator() {
                    op.resolve_seed();
                }
            }
        }
    }
    Ok(())
}

/// Run one operator's backward and return the operands it made dispatchable.
fn process(node: &NodeRef, errors: &Mutex<Vec<KilnError>>) -> Vec<NodeRef> {
    let op = match node.as_operator() {
        Some(op) => op,
        None => return Vec::new(),
    };
    trace!(node = node.id(), function = ?op.function_name(), "backward");

    let result = op.run_backward();
    let operands = op.operands();
    op.finish_backward();

    if let Err(err) = result {
        debug!(node = node.id(), error = %err, "backward failed");
        errors.lock().push(err);
        return Vec::new();
    }

    operands
        .into_iter()
        .filter(|x| x.as_operator().map_or(false, |child| child.try_begin_backward()))
        .collect()
}

fn spawn_backward<'s>(scope: &Scope<'s>, node: NodeRef, errors: &'s Mutex<Vec<KilnError>>) {
    scope.spawn(move |s| {
        for next in process(&node, errors) {
            spawn_backward(s, next, errors);
        }
    });
}

fn dispatch(executor: &Executor, ready: Vec<NodeRef>, errors: &Mutex<Vec<KilnError>>) {
    match executor {
        Executor::Serial => {
            let mut stack = ready;
            while let Some(node) = stack.pop() {
                stack.extend(process(&node, errors));
            }
        }
        Executor::Parallel(pool) => pool.scope(|s| {
            for node in ready {
                spawn_backward(s, node, errors);
            }
        }),
    }
}

/// Run a backward pass from `roots`, each with an optional output gradient.
/// Blocks until every reachable gradient is final.
pub(crate) fn run(
    executor: &Executor,
    roots: &[(NodeRef, Option<Matrix>)],
    truncation: Option<Truncation<'_>>,
) -> KilnResult<()> {
    let seeds = plan_seeds(roots)?;
    let root_nodes: Vec<NodeRef> = roots.iter().map(|(root, _)| root.clone()).collect();

    let visited = count_fan_in(&root_nodes, truncation);
    debug!(roots = roots.len(), visited = visited.len(), "fan-in counted");

    let errors = Mutex::new(Vec::new());
    match seed_roots(roots, seeds) {
        Ok(()) => {
            let ready: Vec<NodeRef> = visited
                .iter()
                .filter(|n| n.as_operator().map_or(false, |op| op.try_begin_backward()))
                .cloned()
                .collect();
            dispatch(executor, ready, &errors);
        }
        Err(err) => errors.lock().push(err),
    }

    let errors = errors.into_inner();
    let stranded = visited
        .iter()
        .filter_map(|n| n.as_operator())
        .filter(|op| op.reset_backward())
        .count();
    if stranded > 0 && errors.is_empty() {
        warn!(stranded, "backward pass left operators with undelivered gradients");
    }
    debug!(visited = visited.len(), errors = errors.len(), "backward pass finished");

    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Shared-handle convenience for a single root.
pub(crate) fn run_single(
    executor: &Executor,
    root: &NodeRef,
    seed: Option<Matrix>,
    truncation: Option<Truncation<'_>>,
) -> KilnResult<()> {
    run(executor, &[(Arc::clone(root), seed)], truncation)
}
