//! Single-threaded graph evaluation.
//!
//! The executor evaluates the nodes a caller asks for, plus everything they
//! depend on, in topological order. For each node it allocates the output
//! from the node's inferred shape (host zeros on the CPU, `alloc` on an
//! accelerator), calls `compute`, and finally synchronizes every accelerator
//! stream it submitted to, so returned values are complete.
//!
//! The capability table is fixed for the lifetime of an executor, so a node
//! dispatches to the same tier for the whole run.

use super::{NodeId, NodeRef, topo_order};
use crate::backend::{Capabilities, DeviceContext, Stream};
use crate::error::{OpError, Result};
use crate::operators::OpKind;
use crate::ops::accel::DeviceArray;
use crate::tensors::Tensor;
use crate::value::Value;
use std::collections::{HashMap, HashSet};

/// When dropout nodes draw a new pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Keep each node's pattern until someone calls `reset_mask()`.
    #[default]
    Persistent,
    /// Reset every dropout node at the start of each training-mode run.
    RefreshEachRun,
}

/// Executor configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// Native routines dispatch may use on the CPU.
    pub capabilities: Capabilities,
    /// Pattern refresh policy for dropout nodes.
    pub mask_policy: MaskPolicy,
}

impl ExecConfig {
    /// A config with the given capabilities and persistent masks.
    #[must_use]
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            mask_policy: MaskPolicy::Persistent,
        }
    }

    /// Returns the config with `policy` as its mask policy.
    #[must_use]
    pub const fn with_mask_policy(mut self, policy: MaskPolicy) -> Self {
        self.mask_policy = policy;
        self
    }
}

/// Evaluates a fixed set of nodes.
#[derive(Debug)]
pub struct Executor {
    fetches: Vec<NodeRef>,
    order: Vec<NodeRef>,
    config: ExecConfig,
}

impl Executor {
    /// Prepares to evaluate `fetches` and their dependencies.
    #[must_use]
    pub fn new(fetches: Vec<NodeRef>, config: ExecConfig) -> Self {
        let order = topo_order(&fetches);
        Self {
            fetches,
            order,
            config,
        }
    }

    /// The nodes in evaluation order.
    #[must_use]
    pub fn order(&self) -> &[NodeRef] {
        &self.order
    }

    /// The configuration this executor runs with.
    #[must_use]
    pub const fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Runs the graph once and returns the value of each fetched node.
    ///
    /// `feeds` supplies a value for every placeholder in the evaluation
    /// order. With `inference` set, dropout nodes pass their input through.
    ///
    /// Accelerator arrays the executor allocated for intermediate nodes are
    /// freed before returning; fetched arrays belong to the caller. A failed
    /// run frees every array it allocated.
    ///
    /// # Errors
    /// - [`OpError::MissingFeed`] if a placeholder has no feed
    /// - [`OpError::ShapeMismatch`] if a feed has the wrong shape
    /// - [`OpError::MissingValue`] if a node is looked up before it was evaluated
    /// - any error from a node's `compute` or from stream synchronization
    pub fn run(&self, feeds: &[(NodeId, Value)], inference: bool) -> Result<Vec<Value>> {
        if !inference && self.config.mask_policy == MaskPolicy::RefreshEachRun {
            for op in self.order.iter().filter_map(|n| n.as_dropout()) {
                op.reset_mask();
            }
        }

        let mut ledger = Allocations::default();
        let outcome = self
            .evaluate(feeds, inference, &mut ledger)
            .and_then(|results| ledger.synchronize().map(|()| results));

        match outcome {
            Ok(results) => {
                let fetched: HashSet<NodeId> = self.fetches.iter().map(|n| n.id()).collect();
                ledger.release(&fetched)?;
                Ok(results)
            }
            Err(e) => {
                // queued kernels may still target the arrays
                if let Err(sync) = ledger.synchronize() {
                    tracing::warn!(%sync, "synchronization failed while unwinding a run");
                }
                if let Err(free) = ledger.release(&HashSet::new()) {
                    tracing::warn!(%free, "failed to free arrays of a failed run");
                }
                Err(e)
            }
        }
    }

    fn evaluate(
        &self,
        feeds: &[(NodeId, Value)],
        inference: bool,
        ledger: &mut Allocations,
    ) -> Result<Vec<Value>> {
        let feeds: HashMap<NodeId, &Value> = feeds.iter().map(|(id, v)| (*id, v)).collect();
        let mut values: HashMap<NodeId, Value> = HashMap::with_capacity(self.order.len());

        for node in &self.order {
            if let OpKind::Placeholder(_) = node.op() {
                let value = feeds
                    .get(&node.id())
                    .ok_or(OpError::MissingFeed(node.id()))?;
                if value.shape() != node.shape() {
                    return Err(OpError::ShapeMismatch {
                        op: node.op_name(),
                        expected: node.shape().to_vec(),
                        actual: value.shape().to_vec(),
                    });
                }
                values.insert(node.id(), (*value).clone());
                continue;
            }

            let mut output = match node.context() {
                DeviceContext::Cpu => Value::Host(Tensor::zeros(node.shape().to_vec())),
                DeviceContext::Accelerator(stream) => {
                    Value::Device(ledger.alloc(node.id(), stream, node.shape())?)
                }
            };

            let inputs = node
                .inputs()
                .iter()
                .map(|i| values.get(&i.id()).ok_or(OpError::MissingValue(i.id())))
                .collect::<Result<Vec<_>>>()?;

            tracing::trace!(node = %node.id(), op = node.op_name(), ctx = %node.context(), "computing");
            node.compute(
                &inputs,
                &mut output,
                node.context(),
                &self.config.capabilities,
                inference,
            )?;
            values.insert(node.id(), output);
        }

        self.fetches
            .iter()
            .map(|n| {
                values
                    .get(&n.id())
                    .cloned()
                    .ok_or(OpError::MissingValue(n.id()))
            })
            .collect()
    }
}

/// Device arrays allocated during one run, and the streams they were used on.
#[derive(Default)]
struct Allocations {
    arrays: Vec<(NodeId, Stream, DeviceArray)>,
    streams: Vec<Stream>,
}

impl Allocations {
    fn alloc(&mut self, node: NodeId, stream: &Stream, shape: &[usize]) -> Result<DeviceArray> {
        if !self.streams.iter().any(|s| s.same_stream(stream)) {
            self.streams.push(stream.clone());
        }
        let array = stream.device().alloc(shape)?;
        self.arrays.push((node, stream.clone(), array.clone()));
        Ok(array)
    }

    fn synchronize(&self) -> Result<()> {
        for stream in &self.streams {
            stream.synchronize()?;
        }
        Ok(())
    }

    /// Frees every array not owned by a node in `keep`; keeps going past
    /// failures and reports the first one.
    fn release(self, keep: &HashSet<NodeId>) -> Result<()> {
        let mut first = Ok(());
        for (node, stream, array) in self.arrays {
            if keep.contains(&node) {
                continue;
            }
            if let Err(e) = stream.device().free(array) {
                first = first.and(Err(e));
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{DropoutConfig, dropout, placeholder};

    #[test]
    fn missing_feed_is_reported() {
        let x = placeholder(vec![2], DeviceContext::Cpu);
        let y = dropout(&x, DropoutConfig::new(0.5), DeviceContext::Cpu).unwrap();
        let exec = Executor::new(vec![y], ExecConfig::default());
        assert!(matches!(
            exec.run(&[], false),
            Err(OpError::MissingFeed(id)) if id == x.id()
        ));
    }

    #[test]
    fn feed_shape_is_checked() {
        let x = placeholder(vec![2], DeviceContext::Cpu);
        let exec = Executor::new(vec![x.clone()], ExecConfig::default());
        let feed = Value::Host(Tensor::ones(vec![3]));
        assert!(matches!(
            exec.run(&[(x.id(), feed)], false),
            Err(OpError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn default_policy_is_persistent() {
        assert_eq!(ExecConfig::default().mask_policy, MaskPolicy::Persistent);
        let cfg = ExecConfig::new(Capabilities::none()).with_mask_policy(MaskPolicy::RefreshEachRun);
        assert_eq!(cfg.mask_policy, MaskPolicy::RefreshEachRun);
    }
}
