// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Versioned entry point tables.
//!
//! A [`DriverDispatch`] is built once for the API version an application
//! requested and passed to whatever forwards API calls. Entry points newer
//! than the requested version are left empty.

use crate::command_list::CommandList;
use crate::event::CounterBasedEventDesc;
use crate::event::Event;
use crate::ipc::IpcEventCounterBasedHandle;
use crate::L0Device;
use crate::ZeError;
use crate::ZeResult;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A Level Zero API version, encoded as `major << 16 | minor`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion(pub u32);

impl ApiVersion {
    /// The first release.
    pub const V1_0: Self = Self::new(1, 0);
    /// Adds counter-based events and their IPC handles.
    pub const V1_15: Self = Self::new(1, 15);
    /// The newest version this driver implements.
    pub const CURRENT: Self = Self::V1_15;

    pub const fn new(major: u16, minor: u16) -> Self {
        Self((major as u32) << 16 | minor as u32)
    }

    pub fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Returns `value` if an application requesting `requested` may use an
/// entry point introduced in `minimum`.
pub fn select_if_version_satisfies<T>(
    requested: ApiVersion,
    minimum: ApiVersion,
    value: T,
) -> Option<T> {
    (requested >= minimum).then_some(value)
}

/// `zeEventQueryStatus`
pub type EventQueryStatusFn = fn(Option<&Event>) -> ZeResult;
/// `zeEventHostSynchronize`, with the timeout in nanoseconds.
pub type EventHostSynchronizeFn = fn(Option<&Event>, u64) -> ZeResult;
/// `zeEventHostSignal`
pub type EventHostSignalFn = fn(Option<&Event>) -> ZeResult;
/// `zeEventHostReset`
pub type EventHostResetFn = fn(Option<&Event>) -> ZeResult;
/// `zexCounterBasedEventCreate2`
pub type EventCounterBasedCreateFn = fn(
    Option<&Arc<L0Device>>,
    Option<&CounterBasedEventDesc>,
    Option<&mut Option<Arc<Event>>>,
) -> ZeResult;
/// `zexCounterBasedEventGetIpcHandle`
pub type EventCounterBasedGetIpcHandleFn =
    fn(Option<&Event>, Option<&mut IpcEventCounterBasedHandle>) -> ZeResult;
/// `zexCounterBasedEventOpenIpcHandle`
pub type EventCounterBasedOpenIpcHandleFn = fn(
    Option<&Arc<L0Device>>,
    Option<&IpcEventCounterBasedHandle>,
    Option<&mut Option<Arc<Event>>>,
) -> ZeResult;
/// `zexCounterBasedEventCloseIpcHandle`
pub type EventCounterBasedCloseIpcHandleFn = fn(Option<&Event>) -> ZeResult;
/// `zeCommandListHostSynchronize`, with the timeout in nanoseconds.
pub type CommandListHostSynchronizeFn = fn(Option<&CommandList>, u64) -> ZeResult;

/// Event entry points. Empty slots are not available at the table's
/// version.
#[derive(Debug, Default, Copy, Clone)]
pub struct EventDispatch {
    pub query_status: Option<EventQueryStatusFn>,
    pub host_synchronize: Option<EventHostSynchronizeFn>,
    pub host_signal: Option<EventHostSignalFn>,
    pub host_reset: Option<EventHostResetFn>,
    pub counter_based_create: Option<EventCounterBasedCreateFn>,
    pub counter_based_get_ipc_handle: Option<EventCounterBasedGetIpcHandleFn>,
    pub counter_based_open_ipc_handle: Option<EventCounterBasedOpenIpcHandleFn>,
    pub counter_based_close_ipc_handle: Option<EventCounterBasedCloseIpcHandleFn>,
}

/// Command list entry points.
#[derive(Debug, Default, Copy, Clone)]
pub struct CommandListDispatch {
    pub host_synchronize: Option<CommandListHostSynchronizeFn>,
}

/// Every entry point table for one API version.
#[derive(Debug, Copy, Clone)]
pub struct DriverDispatch {
    pub version: ApiVersion,
    pub event: EventDispatch,
    pub command_list: CommandListDispatch,
}

impl DriverDispatch {
    /// Fills the tables with the entry points available at `version`.
    pub fn new(version: ApiVersion) -> Self {
        let event = EventDispatch {
            query_status: select_if_version_satisfies(
                version,
                ApiVersion::V1_0,
                event_query_status as EventQueryStatusFn,
            ),
            host_synchronize: select_if_version_satisfies(
                version,
                ApiVersion::V1_0,
                event_host_synchronize as EventHostSynchronizeFn,
            ),
            host_signal: select_if_version_satisfies(
                version,
                ApiVersion::V1_0,
                event_host_signal as EventHostSignalFn,
            ),
            host_reset: select_if_version_satisfies(
                version,
                ApiVersion::V1_0,
                event_host_reset as EventHostResetFn,
            ),
            counter_based_create: select_if_version_satisfies(
                version,
                ApiVersion::V1_15,
                event_counter_based_create as EventCounterBasedCreateFn,
            ),
            counter_based_get_ipc_handle: select_if_version_satisfies(
                version,
                ApiVersion::V1_15,
                event_counter_based_get_ipc_handle as EventCounterBasedGetIpcHandleFn,
            ),
            counter_based_open_ipc_handle: select_if_version_satisfies(
                version,
                ApiVersion::V1_15,
                event_counter_based_open_ipc_handle as EventCounterBasedOpenIpcHandleFn,
            ),
            counter_based_close_ipc_handle: select_if_version_satisfies(
                version,
                ApiVersion::V1_15,
                event_counter_based_close_ipc_handle as EventCounterBasedCloseIpcHandleFn,
            ),
        };
        let command_list = CommandListDispatch {
            host_synchronize: select_if_version_satisfies(
                version,
                ApiVersion::V1_0,
                command_list_host_synchronize as CommandListHostSynchronizeFn,
            ),
        };
        tracing::debug!(?version, "built driver dispatch table");
        Self {
            version,
            event,
            command_list,
        }
    }
}

fn timeout_from_nanos(timeout: u64) -> Duration {
    Duration::from_nanos(timeout)
}

fn event_query_status(event: Option<&Event>) -> ZeResult {
    let Some(event) = event else {
        return ZeError::InvalidArgument.into();
    };
    event.query_status().into()
}

fn event_host_synchronize(event: Option<&Event>, timeout: u64) -> ZeResult {
    let Some(event) = event else {
        return ZeError::InvalidArgument.into();
    };
    event.host_synchronize(timeout_from_nanos(timeout)).into()
}

fn event_host_signal(event: Option<&Event>) -> ZeResult {
    let Some(event) = event else {
        return ZeError::InvalidArgument.into();
    };
    event.host_signal().into()
}

fn event_host_reset(event: Option<&Event>) -> ZeResult {
    let Some(event) = event else {
        return ZeError::InvalidArgument.into();
    };
    event.host_reset().into()
}

fn event_counter_based_create(
    device: Option<&Arc<L0Device>>,
    desc: Option<&CounterBasedEventDesc>,
    out: Option<&mut Option<Arc<Event>>>,
) -> ZeResult {
    let (Some(device), Some(desc), Some(out)) = (device, desc, out) else {
        return ZeError::InvalidArgument.into();
    };
    Event::create_counter_based(device, desc)
        .map(|event| *out = Some(event))
        .into()
}

fn event_counter_based_get_ipc_handle(
    event: Option<&Event>,
    out: Option<&mut IpcEventCounterBasedHandle>,
) -> ZeResult {
    let (Some(event), Some(out)) = (event, out) else {
        return ZeError::InvalidArgument.into();
    };
    event.get_ipc_handle().map(|handle| *out = handle).into()
}

fn event_counter_based_open_ipc_handle(
    device: Option<&Arc<L0Device>>,
    handle: Option<&IpcEventCounterBasedHandle>,
    out: Option<&mut Option<Arc<Event>>>,
) -> ZeResult {
    let (Some(device), Some(handle), Some(out)) = (device, handle, out) else {
        return ZeError::InvalidArgument.into();
    };
    Event::open_ipc_handle(device, handle)
        .map(|event| *out = Some(event))
        .into()
}

fn event_counter_based_close_ipc_handle(event: Option<&Event>) -> ZeResult {
    let Some(event) = event else {
        return ZeError::InvalidArgument.into();
    };
    event.close_ipc_handle().into()
}

fn command_list_host_synchronize(list: Option<&CommandList>, timeout: u64) -> ZeResult {
    let Some(list) = list else {
        return ZeError::InvalidArgument.into();
    };
    list.host_synchronize(timeout_from_nanos(timeout)).into()
}
