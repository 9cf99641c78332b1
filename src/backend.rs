//! Device contexts and the capability table.
//!
//! This module defines where a node runs and which optional CPU routines
//! the process may use.
//!
//! # Device Contexts
//!
//! - `Cpu`: host memory; dispatch picks the native routine or the reference
//!   implementation depending on the [`Capabilities`] passed in.
//! - `Accelerator`: an execution [`Stream`] on an [`Accelerator`] device;
//!   work is queued and completes asynchronously.
//!
//! # Capabilities
//!
//! Availability of specialized native routines is resolved once by a
//! bootstrap step ([`Capabilities::detect`]) and then handed to every
//! `compute()` call explicitly. Nothing here is global, so two graphs in one
//! process can run with different tables and tests can force either tier.

use crate::error::Result;
use crate::ops::accel::Accelerator;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Capability name of the specialized dropout forward routine.
pub const NATIVE_DROPOUT: &str = "cpu_dropout";

/// Capability name of the specialized dropout gradient routine.
pub const NATIVE_DROPOUT_GRADIENT: &str = "cpu_dropout_gradient";

/// Identifies one execution stream of an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// An ordered submission queue on an accelerator device.
///
/// Work submitted to the same stream completes in submission order. The
/// caller never observes completion directly; it calls [`Stream::synchronize`]
/// before reading any output written on the stream.
#[derive(Clone)]
pub struct Stream {
    id: StreamId,
    device: Arc<dyn Accelerator>,
}

impl Stream {
    /// Creates a handle for stream `id` on `device`.
    pub fn new(device: Arc<dyn Accelerator>, id: u32) -> Self {
        Self {
            id: StreamId(id),
            device,
        }
    }

    /// This stream's id.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// The device this stream submits to.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Accelerator> {
        &self.device
    }

    /// Blocks until all work queued on this stream has completed.
    ///
    /// # Errors
    /// Propagates any failure reported by the device while draining the queue.
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize(self)
    }

    /// Whether two handles name the same stream on the same device.
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        self.id == other.id
            && Arc::as_ptr(&self.device).cast::<()>() == Arc::as_ptr(&other.device).cast::<()>()
    }
}

impl core::fmt::Debug for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .finish()
    }
}

/// The execution environment a node is evaluated under.
#[derive(Debug, Clone, Default)]
pub enum DeviceContext {
    /// Host CPU (default).
    #[default]
    Cpu,
    /// An accelerator, reached through one of its streams.
    Accelerator(Stream),
}

impl DeviceContext {
    /// Whether this is the host context.
    #[must_use]
    pub const fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// The accelerator stream, if any.
    #[must_use]
    pub const fn stream(&self) -> Option<&Stream> {
        match self {
            Self::Cpu => None,
            Self::Accelerator(stream) => Some(stream),
        }
    }
}

impl core::fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator(stream) => write!(f, "{}:{}", stream.device.name(), stream.id),
        }
    }
}

/// Read-only table of optional native routines available to this process.
///
/// Names absent from the table are reported as unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    libs: BTreeMap<String, bool>,
}

impl Capabilities {
    /// A table where nothing is available; every CPU call uses the reference path.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Bootstrap: probes what this build can use.
    ///
    /// The specialized dropout routines are reported available when the
    /// crate is compiled with the `simd` feature.
    #[must_use]
    pub fn detect() -> Self {
        let native = cfg!(feature = "simd");
        tracing::info!(native, "capability table initialised");
        Self::none()
            .with(NATIVE_DROPOUT, native)
            .with(NATIVE_DROPOUT_GRADIENT, native)
    }

    /// Returns the table with `name` set to `available`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, available: bool) -> Self {
        self.libs.insert(name.into(), available);
        self
    }

    /// Whether the routine `name` may be used.
    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        self.libs.get(name).copied().unwrap_or(false)
    }

    /// Iterates `(name, available)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.libs.iter().map(|(name, &available)| (name.as_str(), available))
    }
}
