//! Core IL enumerations: states, commands, events, directions and domains.

use std::fmt;

/// Identifier of a component instance within a runtime.
///
/// Components never hold pointers to each other; a tunnel peer is always
/// addressed as a `(ComponentId, port index)` pair resolved through the
/// runtime registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comp-{}", self.0)
    }
}

/// Component states as defined by the IL specification.
///
/// The discriminants match the IL numbering so the state-set transition
/// table can be indexed directly (row/column 0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum State {
    Loaded = 1,
    Idle = 2,
    Executing = 3,
    Pause = 4,
    WaitForResources = 5,
}

impl State {
    /// Index of this state in the 6x6 transition table.
    pub fn table_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Loaded => "Loaded",
            State::Idle => "Idle",
            State::Executing => "Executing",
            State::Pause => "Pause",
            State::WaitForResources => "WaitForResources",
        };
        f.write_str(name)
    }
}

/// Commands accepted by `SendCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    StateSet,
    Flush,
    PortDisable,
    PortEnable,
    MarkBuffer,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::StateSet => "StateSet",
            Command::Flush => "Flush",
            Command::PortDisable => "PortDisable",
            Command::PortEnable => "PortEnable",
            Command::MarkBuffer => "MarkBuffer",
        };
        f.write_str(name)
    }
}

/// Events delivered to the host through the `EventHandler` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CmdComplete,
    Error,
    Mark,
    PortSettingsChanged,
    BufferFlag,
    ResourcesAcquired,
    ComponentResumed,
    DynamicResourcesAvailable,
    IndexSettingChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CmdComplete => "CmdComplete",
            EventKind::Error => "Error",
            EventKind::Mark => "Mark",
            EventKind::PortSettingsChanged => "PortSettingsChanged",
            EventKind::BufferFlag => "BufferFlag",
            EventKind::ResourcesAcquired => "ResourcesAcquired",
            EventKind::ComponentResumed => "ComponentResumed",
            EventKind::DynamicResourcesAvailable => "DynamicResourcesAvailable",
            EventKind::IndexSettingChanged => "IndexSettingChanged",
        };
        f.write_str(name)
    }
}

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dir {
    Input,
    Output,
}

impl Dir {
    pub fn opposite(self) -> Dir {
        match self {
            Dir::Input => Dir::Output,
            Dir::Output => Dir::Input,
        }
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dir::Input => "input",
            Dir::Output => "output",
        })
    }
}

/// Port domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Audio,
    Video,
    Image,
    Other,
}

/// Selects either one port or every regular port of a component.
///
/// Replaces the `OMX_ALL` sentinel value of the C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelector {
    All,
    Port(u32),
}

impl PortSelector {
    pub fn contains(self, pid: u32) -> bool {
        match self {
            PortSelector::All => true,
            PortSelector::Port(p) => p == pid,
        }
    }

    /// Iterates over the selected port indices, given the number of
    /// registered regular ports.
    pub fn iter(self, nports: u32) -> impl Iterator<Item = u32> {
        let (start, end) = match self {
            PortSelector::All => (0, nports),
            PortSelector::Port(p) => (p, p.saturating_add(1)),
        };
        start..end
    }
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::All => f.write_str("ALL"),
            PortSelector::Port(p) => write!(f, "{}", p),
        }
    }
}

impl From<u32> for PortSelector {
    fn from(pid: u32) -> Self {
        PortSelector::Port(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_table_index_matches_il_numbering() {
        assert_eq!(State::Loaded.table_index(), 1);
        assert_eq!(State::Idle.table_index(), 2);
        assert_eq!(State::Executing.table_index(), 3);
        assert_eq!(State::Pause.table_index(), 4);
        assert_eq!(State::WaitForResources.table_index(), 5);
    }

    #[test]
    fn test_port_selector_iteration() {
        let all: Vec<u32> = PortSelector::All.iter(3).collect();
        assert_eq!(all, vec![0, 1, 2]);

        let one: Vec<u32> = PortSelector::Port(1).iter(3).collect();
        assert_eq!(one, vec![1]);

        assert!(PortSelector::All.contains(7));
        assert!(!PortSelector::Port(2).contains(7));
    }
}
