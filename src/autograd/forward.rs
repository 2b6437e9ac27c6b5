//! Forward scheduling: eager dispatch at construction and batched passes

use std::collections::HashMap;
use std::sync::Arc;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace};

use crate::config::Concurrency;
use crate::error::{KilnError, KilnResult};
use super::node::{Node, NodeId, NodeRef};
use super::operator::Operator;

/// Where forward and backward units of work run.
#[derive(Debug, Clone)]
pub enum Executor {
    Serial,
    Parallel(Arc<ThreadPool>),
}

impl Executor {
    pub fn from_concurrency(concurrency: Concurrency) -> KilnResult<Self> {
        match concurrency {
            Concurrency::Serial => Ok(Executor::Serial),
            Concurrency::Parallel { num_threads } => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .thread_name(|i| format!("kiln-worker-{}", i))
                    .build()
                    .map_err(|e| KilnError::operation_error("executor", &format!("failed to build worker pool: {}", e)))?;
                Ok(Executor::Parallel(Arc::new(pool)))
            }
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Executor::Parallel(_))
    }

    pub fn num_threads(&self) -> usize {
        match self {
            Executor::Serial => 1,
            Executor::Parallel(pool) => pool.current_num_threads(),
        }
    }

    /// Start computing `op` without waiting for it. Serial executors compute inline.
    pub(crate) fn schedule(&self, op: Arc<Operator>) {
        match self {
            Executor::Serial => op.compute(),
            Executor::Parallel(pool) => pool.spawn(move || op.compute()),
        }
    }

    /// Compute every operator in `nodes` that has not been computed yet.
    pub(crate) fn forward_all(&self, nodes: &[NodeRef]) {
        match self {
            Executor::Serial => {
                let mut computed = 0;
                for op in nodes.iter().filter_map(|n| n.as_operator()) {
                    op.compute();
                    computed += 1;
                }
                debug!(operators = computed, "serial forward pass finished");
            }
            Executor::Parallel(pool) => {
                let groups = height_groups(nodes);
                for (height, group) in groups.iter().enumerate() {
                    trace!(height, operators = group.len(), "forward group");
                    pool.install(|| group.par_iter().for_each(|op| op.compute()));
                }
                debug!(groups = groups.len(), "parallel forward pass finished");
            }
        }
    }
}

/// Group the operators of a node list by dependency height. Leaves have
/// height 0 and every operator sits one above its highest operand, so
/// members of a group only depend on strictly earlier groups.
fn height_groups(nodes: &[NodeRef]) -> Vec<Vec<&Operator>> {
    let mut heights: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    let mut groups: Vec<Vec<&Operator>> = Vec::new();

    for node in nodes {
        let op = match node.as_operator() {
            Some(op) => op,
            None => continue,
        };
        let height = 1 + op
            .operands()
            .iter()
            .filter(|x| x.id() < node.id())
            .map(|x| heights.get(&x.id()).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);
        heights.insert(node.id(), height);

        if groups.len() < height {
            groups.resize_with(height, Vec::new);
        }
        groups[height - 1].push(op);
    }
    groups
}
