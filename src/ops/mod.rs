//! # Kernel Tiers
//!
//! This module holds every implementation of the operator kernels and the
//! layer that chooses between them.
//!
//! ## Submodules
//!
//! - [`cpu`]: Generic reference kernels; the definition every tier must match
//! - [`native`]: Parallel (and with `simd`, vectorized) CPU routines
//! - [`accel`]: The [`accel::Accelerator`] trait and shared kernel randomness
//! - [`emulated`]: A host-memory accelerator with real stream semantics
//! - [`wgpu`] *(opt-in)*: GPU compute shader pipelines using `wgpu`
//! - [`dispatch`]: Per-call tier selection and the drop-rate conversion
//!
//! ## Tier Selection
//!
//! Operators never call a tier directly. They go through [`dispatch`], which
//! looks at the node's device context and the capability table passed to
//! `compute()`:
//!
//! ```rust
//! use briny_graph::backend::{Capabilities, DeviceContext, NATIVE_DROPOUT};
//! use briny_graph::ops::dispatch::{select, Tier};
//!
//! let caps = Capabilities::none().with(NATIVE_DROPOUT, true);
//! assert_eq!(select(&DeviceContext::Cpu, &caps, NATIVE_DROPOUT).tier(), Tier::Native);
//! assert_eq!(select(&DeviceContext::Cpu, &Capabilities::none(), NATIVE_DROPOUT).tier(), Tier::Reference);
//! ```
//!
//! ## Notes
//!
//! - SIMD and GPU acceleration are only used when their feature flags are enabled
//! - Accelerator kernels are asynchronous; results are valid after the stream synchronizes

pub mod accel;
pub mod cpu;
pub mod dispatch;
pub mod emulated;
pub mod native;

#[cfg(feature = "wgpu")]
pub mod wgpu;
