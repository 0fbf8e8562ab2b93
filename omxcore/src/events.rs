//! Host-facing events and the callback contract.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use omxil::{BufferFlags, Command, ComponentId, EventKind, HeaderRef, IlError, Index, State};

/// An event delivered through the host's `EventHandler` callback.
///
/// The IL `(event, data1, data2, event_data)` quadruplet, spelled out per
/// event kind so hosts match on payloads instead of decoding untyped words.
#[derive(Clone)]
pub enum IlEvent {
    /// `CmdComplete` for a state transition.
    StateSetComplete {
        state: State,
        error: Option<IlError>,
    },
    /// `CmdComplete` for every other command, one per affected port.
    CmdComplete {
        command: Command,
        pid: u32,
        error: Option<IlError>,
    },
    Error {
        error: IlError,
    },
    PortSettingsChanged {
        pid: u32,
        index: Index,
    },
    BufferFlag {
        pid: u32,
        flags: BufferFlags,
    },
    Mark {
        data: Arc<dyn Any + Send + Sync>,
    },
    ResourcesAcquired,
    ComponentResumed,
    DynamicResourcesAvailable,
    IndexSettingChanged {
        pid: u32,
        index: Index,
    },
}

impl IlEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            IlEvent::StateSetComplete { .. } | IlEvent::CmdComplete { .. } => {
                EventKind::CmdComplete
            }
            IlEvent::Error { .. } => EventKind::Error,
            IlEvent::PortSettingsChanged { .. } => EventKind::PortSettingsChanged,
            IlEvent::BufferFlag { .. } => EventKind::BufferFlag,
            IlEvent::Mark { .. } => EventKind::Mark,
            IlEvent::ResourcesAcquired => EventKind::ResourcesAcquired,
            IlEvent::ComponentResumed => EventKind::ComponentResumed,
            IlEvent::DynamicResourcesAvailable => EventKind::DynamicResourcesAvailable,
            IlEvent::IndexSettingChanged { .. } => EventKind::IndexSettingChanged,
        }
    }
}

impl fmt::Debug for IlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IlEvent::StateSetComplete { state, error } => f
                .debug_struct("StateSetComplete")
                .field("state", state)
                .field("error", error)
                .finish(),
            IlEvent::CmdComplete {
                command,
                pid,
                error,
            } => f
                .debug_struct("CmdComplete")
                .field("command", command)
                .field("pid", pid)
                .field("error", error)
                .finish(),
            IlEvent::Error { error } => f.debug_struct("Error").field("error", error).finish(),
            IlEvent::PortSettingsChanged { pid, index } => f
                .debug_struct("PortSettingsChanged")
                .field("pid", pid)
                .field("index", index)
                .finish(),
            IlEvent::BufferFlag { pid, flags } => f
                .debug_struct("BufferFlag")
                .field("pid", pid)
                .field("flags", flags)
                .finish(),
            IlEvent::Mark { .. } => f.debug_struct("Mark").finish_non_exhaustive(),
            IlEvent::ResourcesAcquired => f.write_str("ResourcesAcquired"),
            IlEvent::ComponentResumed => f.write_str("ComponentResumed"),
            IlEvent::DynamicResourcesAvailable => f.write_str("DynamicResourcesAvailable"),
            IlEvent::IndexSettingChanged { pid, index } => f
                .debug_struct("IndexSettingChanged")
                .field("pid", pid)
                .field("index", index)
                .finish(),
        }
    }
}

/// Callbacks a host registers on a component.
///
/// Invoked from the component task after the component lock has been
/// released, so a callback is free to call back into the component API
/// (e.g. refill a buffer from `fill_buffer_done`).
#[async_trait]
pub trait HostCallbacks: Send + Sync {
    async fn event_handler(&self, source: ComponentId, event: IlEvent);
    async fn empty_buffer_done(&self, source: ComponentId, hdr: HeaderRef);
    async fn fill_buffer_done(&self, source: ComponentId, hdr: HeaderRef);
}
