//! Host kernels invoked by graph nodes.
//!
//! A kernel receives the node attributes and its input values and returns one
//! value per node output.
pub mod elementwise;
pub mod topk;
pub mod zero_point;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::graph::{OpAttrs, OpKind};
use crate::tensor::TensorValue;

pub type HostKernel =
    Arc<dyn Fn(&OpAttrs, &[&TensorValue]) -> Result<Vec<TensorValue>> + Send + Sync>;

static BUILTINS: Lazy<Vec<(OpKind, HostKernel)>> = Lazy::new(|| {
    let mut entries: Vec<(OpKind, HostKernel)> = Vec::new();
    entries.extend(elementwise::entries());
    entries.extend(topk::entries());
    entries.extend(zero_point::entries());
    entries
});

/// Kernel table keyed by op kind.
#[derive(Clone)]
pub struct KernelRegistry {
    kernels: HashMap<OpKind, HostKernel>,
}

impl KernelRegistry {
    /// Registry without any kernel.
    pub fn empty() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// Registry holding every built-in kernel.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for (op, kernel) in BUILTINS.iter() {
            registry.kernels.insert(op.clone(), kernel.clone());
        }
        registry
    }

    /// Add or replace the kernel for `op`.
    pub fn register<F>(&mut self, op: OpKind, kernel: F)
    where
        F: Fn(&OpAttrs, &[&TensorValue]) -> Result<Vec<TensorValue>> + Send + Sync + 'static,
    {
        self.kernels.insert(op, Arc::new(kernel));
    }

    pub fn lookup(&self, op: &OpKind) -> Option<&HostKernel> {
        self.kernels.get(op)
    }

    pub fn contains(&self, op: &OpKind) -> bool {
        self.kernels.contains_key(op)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops = self
            .kernels
            .keys()
            .map(|op| op.to_string())
            .collect::<Vec<_>>();
        ops.sort();
        f.debug_struct("KernelRegistry").field("ops", &ops).finish()
    }
}

pub(crate) fn host_kernel<F>(kernel: F) -> HostKernel
where
    F: Fn(&OpAttrs, &[&TensorValue]) -> Result<Vec<TensorValue>> + Send + Sync + 'static,
{
    Arc::new(kernel)
}

/// Wrap a typed invalid-argument status so it survives the kernel boundary.
pub(crate) fn invalid(msg: impl Into<String>) -> anyhow::Error {
    crate::Error::InvalidArgument(msg.into()).into()
}

pub(crate) fn expect_inputs(op: &str, inputs: &[&TensorValue], count: usize) -> Result<()> {
    if inputs.len() != count {
        return Err(invalid(format!(
            "{} expects {} inputs, got {}",
            op,
            count,
            inputs.len()
        )));
    }
    Ok(())
}
