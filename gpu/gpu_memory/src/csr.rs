// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the command stream receiver that submits work to an engine.

use crate::GraphicsAllocation;
use crate::OsContext;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    NotReady,
    GpuHang,
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("gpu hang detected")]
    GpuHang,
    #[error("submission rejected by the kernel")]
    Rejected(#[source] drm_sys::Errno),
}

/// A batch of encoded commands and the allocations it references.
pub struct BatchBuffer<'a> {
    pub commands: &'a [u8],
    pub residency: &'a [Arc<GraphicsAllocation>],
}

/// A host callback registered for execution from a command stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostFunctionTicket {
    /// Identifies the callback. The command stream stores it to
    /// `dispatch_address` to request execution.
    pub id: u64,
    pub dispatch_address: u64,
}

/// Runs host callbacks requested by a command stream.
///
/// The engine writes a ticket id to the dispatch address, then waits until
/// the streamer clears it back to zero after running the callback.
pub trait HostFunctionStreamer: Send + Sync {
    fn register(&self, callback: Box<dyn FnOnce() + Send>) -> HostFunctionTicket;
}

pub trait CommandStreamReceiver: Send + Sync {
    fn os_context(&self) -> &Arc<OsContext>;

    /// Whether host-visible signals must be preceded by a data-cache flush.
    fn dc_flush_support(&self) -> bool;

    fn host_function_streamer(&self) -> Option<&dyn HostFunctionStreamer>;

    /// Waits until `task_count` completes, the timeout passes, or the engine
    /// hangs.
    fn wait_for_completion_with_timeout(&self, task_count: u64, timeout: Duration)
        -> WaitStatus;

    /// The task count of the most recent submission.
    fn latest_flushed_task_count(&self) -> u64;

    /// The task count the engine has completed.
    fn completed_task_count(&self) -> u64;

    /// True for trace-based (TBX) simulation without a real GPU.
    fn is_tbx_mode(&self) -> bool;

    /// Submits a batch, returning its task count.
    fn flush(&self, batch: &BatchBuffer<'_>) -> Result<u64, SubmissionError>;
}
