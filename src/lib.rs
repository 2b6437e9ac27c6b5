//! Kiln - concurrent reverse-mode automatic differentiation
//!
//! Features:
//! - Dynamic computation graphs with eager or lazy forward evaluation
//! - Backward passes that run independent branches on a worker pool
//! - Truncated backpropagation through time for sequence models
//! - Buffer recycling for computed values and gradients

pub mod autograd;
pub mod config;
pub mod error;
pub mod memory;
pub mod tensor;

pub use autograd::{
    copy_grad, copy_value, Clock, Constant, Function, Graph, Node, NodeId, NodeKind, NodeRef,
    Operator, StopGrad, TimeStepHandler, Variable,
};
pub use config::{ConfigBuilder, Concurrency, ForwardMode, KilnConfig};
pub use error::{KilnError, KilnResult};
pub use memory::{BufferPool, MemoryPool, PoolStats};
pub use tensor::{Matrix, Shape};

/// Install a `tracing` subscriber and log the active configuration.
/// Calling it more than once is harmless.
pub fn init() -> KilnResult<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let config = config::get_config();
    tracing::info!(
        version = version(),
        concurrency = ?config.execution.concurrency,
        "Kiln initialized"
    );
    Ok(())
}

/// Get the current framework version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init().unwrap();
        init().unwrap();
        assert!(!version().is_empty());
    }

    #[test]
    fn test_end_to_end() {
        let graph = Graph::with_config(ConfigBuilder::new().parallel(2).build()).unwrap();
        let w = graph.new_variable_with_name(Matrix::vector(vec![0.5, -1.0]), true, "w");
        let x = graph.new_constant(Matrix::vector(vec![2.0, 3.0]));
        let y = autograd::reduce_sum(&graph, &autograd::prod(&graph, &w, &x));

        assert_eq!(y.value().unwrap().scalar_value().unwrap(), -2.0);
        graph.backward(&y, None).unwrap();
        let grad = copy_grad(&w).unwrap();
        assert_eq!(grad.as_slice(), &[2.0, 3.0]);

        graph.release_graph(&[y.clone()]);
        assert!(copy_value(&y).is_none());
        assert_eq!(copy_value(&w).unwrap().as_slice(), &[0.5, -1.0]);
    }
}
