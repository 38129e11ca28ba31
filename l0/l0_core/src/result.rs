// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Level Zero result codes.

use std::fmt;
use thiserror::Error;

/// A Level Zero result code as returned across the API boundary.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ZeResult(pub u32);

impl ZeResult {
    pub const SUCCESS: Self = Self(0);
    pub const NOT_READY: Self = Self(1);
    pub const ERROR_DEVICE_LOST: Self = Self(0x7000_0001);
    pub const ERROR_OUT_OF_HOST_MEMORY: Self = Self(0x7000_0002);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: Self = Self(0x7000_0003);
    pub const ERROR_UNSUPPORTED_FEATURE: Self = Self(0x7800_0003);
    pub const ERROR_INVALID_ARGUMENT: Self = Self(0x7800_0004);
    pub const ERROR_UNKNOWN: Self = Self(0x7fff_fffe);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Debug for ZeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::NOT_READY => "NOT_READY",
            Self::ERROR_DEVICE_LOST => "ERROR_DEVICE_LOST",
            Self::ERROR_OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            Self::ERROR_OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            Self::ERROR_UNSUPPORTED_FEATURE => "ERROR_UNSUPPORTED_FEATURE",
            Self::ERROR_INVALID_ARGUMENT => "ERROR_INVALID_ARGUMENT",
            Self::ERROR_UNKNOWN => "ERROR_UNKNOWN",
            _ => return write!(f, "ZeResult({:#x})", self.0),
        };
        f.pad(name)
    }
}

/// Failures of Level Zero operations.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ZeError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("feature not supported for this object")]
    UnsupportedFeature,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of resources")]
    OutOfResources,
    #[error("device lost")]
    DeviceLost,
    #[error("not ready")]
    NotReady,
}

impl ZeError {
    /// The wire code for the error.
    pub fn code(self) -> ZeResult {
        match self {
            ZeError::InvalidArgument => ZeResult::ERROR_INVALID_ARGUMENT,
            ZeError::UnsupportedFeature => ZeResult::ERROR_UNSUPPORTED_FEATURE,
            ZeError::OutOfDeviceMemory => ZeResult::ERROR_OUT_OF_DEVICE_MEMORY,
            ZeError::OutOfHostMemory => ZeResult::ERROR_OUT_OF_HOST_MEMORY,
            ZeError::OutOfResources => ZeResult::ERROR_UNKNOWN,
            ZeError::DeviceLost => ZeResult::ERROR_DEVICE_LOST,
            ZeError::NotReady => ZeResult::NOT_READY,
        }
    }
}

impl From<ZeError> for ZeResult {
    fn from(err: ZeError) -> Self {
        err.code()
    }
}

impl From<Result<(), ZeError>> for ZeResult {
    fn from(result: Result<(), ZeError>) -> Self {
        match result {
            Ok(()) => ZeResult::SUCCESS,
            Err(err) => err.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(ZeResult::from(Ok(())), ZeResult::SUCCESS);
        assert_eq!(
            ZeResult::from(Err(ZeError::UnsupportedFeature)),
            ZeResult::ERROR_UNSUPPORTED_FEATURE
        );
        assert_eq!(ZeError::NotReady.code(), ZeResult::NOT_READY);
        assert_eq!(format!("{:?}", ZeResult::ERROR_INVALID_ARGUMENT), "ERROR_INVALID_ARGUMENT");
        assert_eq!(format!("{:?}", ZeResult(0x1234)), "ZeResult(0x1234)");
    }
}
