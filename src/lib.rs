//! # `briny_graph`
//!
//! The operator-execution core of a dataflow graph with reverse-mode
//! automatic differentiation. Every node follows one contract (shape
//! inference, forward compute into a caller-owned buffer, gradient-node
//! construction), and every compute call is routed to an accelerator kernel,
//! a specialized native CPU routine, or a generic reference implementation.
//!
//! ## Features
//!
//! - **Operators**: a closed set of kinds behind the [`operators::Operator`] contract
//! - **Dropout**: inverted dropout whose seeded pattern is cached on the node
//!   and shared with its gradient node by identity
//! - **Dispatch**: per-call tier selection from the node's device context and
//!   an explicitly passed [`backend::Capabilities`] table
//! - **Accelerators**: asynchronous streams, an in-process emulated device and
//!   an optional `wgpu` compute-shader backend
//! - **Autodiff**: [`graph::gradients`] wires backward graphs, [`graph::Executor`] runs them
//!
//! ## Cargo Features
//!
//! - `simd`: AVX2 paths for the native routines; `Capabilities::detect()` reports them
//! - `wgpu`: the GPU accelerator in [`ops::wgpu`]
//!
//! ## Example
//!
//! ```rust
//! use briny_graph::backend::{Capabilities, DeviceContext};
//! use briny_graph::graph::{ExecConfig, Executor};
//! use briny_graph::{dropout, placeholder, DropoutConfig};
//! use briny_graph::tensor;
//! use briny_graph::value::Value;
//!
//! let x = placeholder(vec![2, 2], DeviceContext::Cpu);
//! let y = dropout(&x, DropoutConfig::new(1.0), DeviceContext::Cpu).unwrap();
//!
//! let exec = Executor::new(vec![y], ExecConfig::new(Capabilities::detect()));
//! let out = exec.run(&[(x.id(), Value::Host(tensor!([[1.0, 2.0], [3.0, 4.0]])))], false).unwrap();
//! assert_eq!(out[0].as_host().unwrap().data, vec![1.0, 2.0, 3.0, 4.0]);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod graph;
pub mod mask;
pub mod operators;
pub mod ops;
pub mod tensors;
pub mod value;

pub use error::{OpError, Result};
pub use operators::{DropoutConfig, dropout, dropout_gradient, ones_like, placeholder, sum};
