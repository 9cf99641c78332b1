//! Reverse-mode gradient wiring.
//!
//! Builds backward-graph nodes only; nothing here touches tensor data.

use super::{NodeId, NodeRef};
use crate::error::Result;
use crate::operators::{ones_like, sum};
use std::collections::{HashMap, HashSet};

/// Every node reachable from `roots` through inputs and control
/// dependencies, each listed after everything it depends on.
#[must_use]
pub fn topo_order(roots: &[NodeRef]) -> Vec<NodeRef> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // (node, dependencies already pushed)
    let mut stack: Vec<(NodeRef, bool)> = roots.iter().rev().map(|n| (n.clone(), false)).collect();

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        stack.push((node.clone(), true));
        let deps = node.inputs().iter().chain(node.control_deps());
        for dep in deps.rev() {
            if !visited.contains(&dep.id()) {
                stack.push((dep.clone(), false));
            }
        }
    }
    order
}

/// Builds the gradient of `output` with respect to each node in `wrt`.
///
/// Seeds with `ones_like(output)`, visits the forward graph in reverse
/// topological order and asks every node that received a gradient for the
/// gradients of its inputs. A node reached along several edges gets the
/// `sum` of its contributions. Entries are `None` for nodes `output` does not
/// depend on.
///
/// # Errors
/// Propagates [`OpError::UnsupportedOperation`](crate::error::OpError::UnsupportedOperation)
/// from nodes that cannot be differentiated, and shape errors from node
/// construction.
pub fn gradients(output: &NodeRef, wrt: &[NodeRef]) -> Result<Vec<Option<NodeRef>>> {
    let mut pending: HashMap<NodeId, Vec<NodeRef>> = HashMap::new();
    let mut done: HashMap<NodeId, NodeRef> = HashMap::new();

    pending.insert(
        output.id(),
        vec![ones_like(output, output.context().clone())?],
    );

    for node in topo_order(std::slice::from_ref(output)).iter().rev() {
        let Some(mut contributions) = pending.remove(&node.id()) else {
            continue;
        };
        let total = if contributions.len() == 1 {
            contributions.swap_remove(0)
        } else {
            tracing::debug!(node = %node.id(), fan_out = contributions.len(), "accumulating gradients");
            sum(&contributions, node.context().clone())?
        };

        if !node.inputs().is_empty() {
            let input_grads = node.gradient(&total)?;
            for (input, grad) in node.inputs().iter().zip(input_grads) {
                pending.entry(input.id()).or_default().push(grad);
            }
        }
        done.insert(node.id(), total);
    }

    Ok(wrt.iter().map(|n| done.get(&n.id()).cloned()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceContext;
    use crate::operators::{DropoutConfig, dropout, placeholder};
    use std::sync::Arc;

    #[test]
    fn topo_order_lists_dependencies_first() {
        let x = placeholder(vec![2], DeviceContext::Cpu);
        let y = dropout(&x, DropoutConfig::new(0.5), DeviceContext::Cpu).unwrap();
        let z = sum(&[y.clone(), x.clone()], DeviceContext::Cpu).unwrap();

        let ids: Vec<_> = topo_order(&[z.clone()]).iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec![x.id(), y.id(), z.id()]);
    }

    #[test]
    fn unrelated_nodes_get_no_gradient() {
        let x = placeholder(vec![2], DeviceContext::Cpu);
        let other = placeholder(vec![2], DeviceContext::Cpu);
        let y = dropout(&x, DropoutConfig::new(0.5), DeviceContext::Cpu).unwrap();

        let grads = gradients(&y, &[x, other]).unwrap();
        assert!(grads[0].is_some());
        assert!(grads[1].is_none());
    }

    #[test]
    fn gradient_of_output_itself_is_the_seed() {
        let x = placeholder(vec![3], DeviceContext::Cpu);
        let grads = gradients(&x, &[x.clone()]).unwrap();
        let seed = grads[0].clone().unwrap();
        assert_eq!(seed.op_name(), "OnesLike");
        assert!(Arc::ptr_eq(&seed.inputs()[0], &x));
    }
}
