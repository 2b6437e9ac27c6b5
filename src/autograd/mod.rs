//! Automatic differentiation over a concurrent computation graph
//!
//! Leaves (`Variable`, `Constant`) hold values directly. Operators pair a
//! `Function` with its memoized output and accumulated gradient. A `Graph`
//! owns both kinds of node in creation order, computes operators eagerly or
//! on demand, and runs backward passes that dispatch each operator as soon as
//! all of its gradient contributions have arrived.

pub mod node;
pub mod function;
pub mod variable;
pub mod wrapper;
pub mod operator;
pub mod timestep;
pub mod forward;
pub mod backward;
pub mod release;
pub mod graph;
pub mod ops;

pub use node::{copy_grad, copy_value, Node, NodeId, NodeKind, NodeRef};
pub use function::{Add, Dropout, Function, Identity, Prod, ReduceSum, Sub};
pub use variable::{Constant, Variable};
pub use wrapper::StopGrad;
pub use operator::{BackwardState, Operator};
pub use timestep::{Clock, TimeStepHandler};
pub use forward::Executor;
pub use backward::Truncation;
pub use graph::Graph;
pub use ops::*;
