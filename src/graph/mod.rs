//! # Computation Graph
//!
//! Nodes, reverse-mode wiring and a minimal executor.
//!
//! ## Modules
//!
//! - `node`: [`Node`], [`NodeRef`] and [`NodeId`]
//! - `autodiff`: [`gradients`] and [`topo_order`]
//! - `executor`: [`Executor`], evaluating nodes in topological order
//!
//! ## Example
//!
//! ```rust
//! use briny_graph::backend::{Capabilities, DeviceContext};
//! use briny_graph::graph::{gradients, ExecConfig, Executor};
//! use briny_graph::operators::{dropout, placeholder, DropoutConfig};
//! use briny_graph::tensors::Tensor;
//! use briny_graph::value::Value;
//!
//! let x = placeholder(vec![4], DeviceContext::Cpu);
//! let y = dropout(&x, DropoutConfig::new(0.5).with_seed(42), DeviceContext::Cpu).unwrap();
//! let dx = gradients(&y, &[x.clone()]).unwrap()[0].clone().unwrap();
//!
//! let exec = Executor::new(vec![y, dx], ExecConfig::new(Capabilities::none()));
//! let out = exec
//!     .run(&[(x.id(), Value::Host(Tensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0])))], false)
//!     .unwrap();
//! assert_eq!(out.len(), 2);
//! ```

mod autodiff;
mod executor;
mod node;

pub use autodiff::{gradients, topo_order};
pub use executor::{ExecConfig, Executor, MaskPolicy};
pub use node::{Node, NodeId, NodeRef};
