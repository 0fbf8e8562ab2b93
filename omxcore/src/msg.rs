//! Messages exchanged through a component mailbox.

use std::fmt;

use omxil::{Command, Dir, HeaderRef, Mark, PortSelector, State};

use crate::watchers::{IoEvents, WatcherKey};

/// Commands and their per-class urgency. Lower value dispatches first.
pub const PRIO_COMMAND: u32 = 0;
/// Buffers-ready notifications, watcher events and pluggable events.
pub const PRIO_NOTIFY: u32 = 1;
/// Buffer traffic: `EmptyThisBuffer`/`FillThisBuffer` and processor
/// callbacks.
pub const PRIO_BUFFER: u32 = 2;

/// A `SendCommand` request with its payload.
#[derive(Debug, Clone)]
pub enum CommandReq {
    StateSet(State),
    Flush(PortSelector),
    PortDisable(PortSelector),
    PortEnable(PortSelector),
    MarkBuffer(u32, Mark),
}

impl CommandReq {
    pub fn kind(&self) -> Command {
        match self {
            CommandReq::StateSet(_) => Command::StateSet,
            CommandReq::Flush(_) => Command::Flush,
            CommandReq::PortDisable(_) => Command::PortDisable,
            CommandReq::PortEnable(_) => Command::PortEnable,
            CommandReq::MarkBuffer(..) => Command::MarkBuffer,
        }
    }
}

/// A host-injected event scheduled on the component task.
///
/// The closure form of the original `tiz_event_pluggable_t`: whatever the
/// event captures, `run` executes under the component's servant, never
/// concurrently with message dispatch.
pub trait PluggableEvent: Send {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send> PluggableEvent for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// One mailbox entry. Buffer headers travel by reference; every message
/// holds only cheap handles.
pub enum Msg {
    SendCommand(CommandReq),
    EmptyThisBuffer { hdr: HeaderRef },
    FillThisBuffer { hdr: HeaderRef },
    Callback { hdr: HeaderRef, pid: u32, dir: Dir },
    Pluggable { event: Box<dyn PluggableEvent> },
    BuffersReady { pid: u32 },
    IoReady { watcher: WatcherKey, id: u64, readiness: IoEvents },
    TimerReady { watcher: WatcherKey, id: u64 },
    StatReady { watcher: WatcherKey, id: u64, events: u32 },
}

impl Msg {
    pub fn priority(&self) -> u32 {
        match self {
            Msg::SendCommand(_) => PRIO_COMMAND,
            Msg::BuffersReady { .. }
            | Msg::Pluggable { .. }
            | Msg::IoReady { .. }
            | Msg::TimerReady { .. }
            | Msg::StatReady { .. } => PRIO_NOTIFY,
            Msg::EmptyThisBuffer { .. } | Msg::FillThisBuffer { .. } | Msg::Callback { .. } => {
                PRIO_BUFFER
            }
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Msg::SendCommand(_) => "SendCommand",
            Msg::EmptyThisBuffer { .. } => "EmptyThisBuffer",
            Msg::FillThisBuffer { .. } => "FillThisBuffer",
            Msg::Callback { .. } => "Callback",
            Msg::Pluggable { .. } => "PluggableEvent",
            Msg::BuffersReady { .. } => "BuffersReady",
            Msg::IoReady { .. } => "IoReady",
            Msg::TimerReady { .. } => "TimerReady",
            Msg::StatReady { .. } => "StatReady",
        }
    }

    /// The port a queued buffer message addresses, if it is one.
    pub fn buffer_port(&self) -> Option<u32> {
        match self {
            Msg::EmptyThisBuffer { hdr } => hdr.lock().ok()?.input_port_index,
            Msg::FillThisBuffer { hdr } => hdr.lock().ok()?.output_port_index,
            Msg::Callback { pid, .. } => Some(*pid),
            _ => None,
        }
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_str())
    }
}
