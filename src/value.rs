//! Arrays flowing between nodes.

use crate::error::{OpError, Result};
use crate::ops::accel::DeviceArray;
use crate::tensors::{Tensor, TensorFloat};

/// A node's input or output buffer, resident on the host or on an accelerator.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Host tensor.
    Host(Tensor<TensorFloat>),
    /// Accelerator-owned array.
    Device(DeviceArray),
}

impl Value {
    /// Logical shape, wherever the data lives.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Host(t) => t.shape(),
            Self::Device(a) => a.shape(),
        }
    }

    /// The host tensor, if resident on the host.
    #[must_use]
    pub const fn as_host(&self) -> Option<&Tensor<TensorFloat>> {
        match self {
            Self::Host(t) => Some(t),
            Self::Device(_) => None,
        }
    }

    /// The device array, if resident on an accelerator.
    #[must_use]
    pub const fn as_device(&self) -> Option<&DeviceArray> {
        match self {
            Self::Host(_) => None,
            Self::Device(a) => Some(a),
        }
    }

    /// The host tensor, or a [`OpError::DeviceMismatch`] naming `op`.
    ///
    /// # Errors
    /// Fails when the value is device-resident.
    pub fn host(&self, op: &'static str) -> Result<&Tensor<TensorFloat>> {
        self.as_host().ok_or(OpError::DeviceMismatch {
            op,
            expected: "cpu",
        })
    }

    /// Mutable host tensor, or a [`OpError::DeviceMismatch`] naming `op`.
    ///
    /// # Errors
    /// Fails when the value is device-resident.
    pub fn host_mut(&mut self, op: &'static str) -> Result<&mut Tensor<TensorFloat>> {
        match self {
            Self::Host(t) => Ok(t),
            Self::Device(_) => Err(OpError::DeviceMismatch {
                op,
                expected: "cpu",
            }),
        }
    }

    /// The device array, or a [`OpError::DeviceMismatch`] naming `op`.
    ///
    /// # Errors
    /// Fails when the value is host-resident.
    pub fn device(&self, op: &'static str) -> Result<&DeviceArray> {
        self.as_device().ok_or(OpError::DeviceMismatch {
            op,
            expected: "accelerator",
        })
    }
}

impl From<Tensor<TensorFloat>> for Value {
    fn from(t: Tensor<TensorFloat>) -> Self {
        Self::Host(t)
    }
}

impl From<DeviceArray> for Value {
    fn from(a: DeviceArray) -> Self {
        Self::Device(a)
    }
}
