//! Buffer headers, the unit of data flow between ports.
//!
//! A header describes one buffer's memory, fill state and flags. Ownership
//! of a header at any instant resides with exactly one party (host, a
//! port's ingress or egress queue, the processor, or the tunneled peer);
//! that bookkeeping is done by the runtime, the header itself only carries
//! the data. Across a tunnel the two components share the same header by
//! reference, it is never copied.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::types::ComponentId;

bitflags! {
    /// Per-buffer flags, numbered as in the IL specification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        const EOS          = 0x0000_0001;
        const STARTTIME    = 0x0000_0002;
        const DECODEONLY   = 0x0000_0004;
        const DATACORRUPT  = 0x0000_0008;
        const ENDOFFRAME   = 0x0000_0010;
        const SYNCFRAME    = 0x0000_0020;
        const EXTRADATA    = 0x0000_0040;
        const CODECCONFIG  = 0x0000_0080;
    }
}

/// Opaque GPU-image payload carried by headerless EGL buffers.
pub type EglImage = Arc<dyn Any + Send + Sync>;

/// A mark travelling with a buffer.
///
/// Attached to an input header by the `MarkBuffer` command (or inherited
/// from an upstream component); echoed back as an `EventKind::Mark` when a
/// component consumes a buffer marked with its own id.
#[derive(Clone)]
pub struct Mark {
    pub target_component: ComponentId,
    pub data: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mark")
            .field("target_component", &self.target_component)
            .finish_non_exhaustive()
    }
}

/// Backing memory of a buffer header.
#[derive(Debug)]
pub enum BufferData {
    /// No backing memory yet. Allocator output ports with pre-announcements
    /// disabled stay in this state until the first claim.
    Unallocated,
    /// Memory owned by this header (host-supplied or port-allocated).
    Owned(Vec<u8>),
    /// EGL image; there is no CPU-addressable memory.
    Egl(EglImage),
}

/// Descriptor of one buffer.
#[derive(Debug)]
pub struct BufferHeader {
    pub data: BufferData,
    pub alloc_len: usize,
    pub filled_len: usize,
    pub offset: usize,
    pub flags: BufferFlags,
    pub input_port_index: Option<u32>,
    pub output_port_index: Option<u32>,
    pub app_private: Option<Arc<dyn Any + Send + Sync>>,
    pub tick_count: u32,
    pub timestamp: i64,
    pub mark: Option<Mark>,
}

impl BufferHeader {
    pub fn new(data: BufferData, alloc_len: usize) -> Self {
        Self {
            data,
            alloc_len,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            input_port_index: None,
            output_port_index: None,
            app_private: None,
            tick_count: 0,
            timestamp: 0,
            mark: None,
        }
    }

    /// Resets the transient fields, leaving the backing memory and the port
    /// bindings in place. Used before handing an output buffer to the
    /// processor so no data leaks from a previous run.
    pub fn clear(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.flags = BufferFlags::empty();
        self.tick_count = 0;
        self.timestamp = 0;
    }

    /// Lazily allocates the backing memory up to `alloc_len`.
    ///
    /// No-op when memory is already present. Headers bound to EGL images
    /// never gain CPU memory.
    pub fn ensure_allocated(&mut self) {
        if matches!(self.data, BufferData::Unallocated) {
            self.data = BufferData::Owned(vec![0; self.alloc_len]);
        }
    }

    /// The filled region of the buffer, if CPU-addressable.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.data {
            BufferData::Owned(mem) => mem.get(self.offset..self.offset + self.filled_len),
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            BufferData::Owned(mem) => Some(mem.as_mut_slice()),
            _ => None,
        }
    }

    /// Checks the fill-state arithmetic of the header.
    pub fn is_consistent(&self) -> bool {
        match &self.data {
            BufferData::Egl(_) => true,
            _ => self.offset + self.filled_len <= self.alloc_len,
        }
    }
}

/// Shared reference to one buffer header.
///
/// Identity (`Arc::ptr_eq`) is what relates a header handed out by
/// `UseBuffer`/`AllocateBuffer` to the one later seen in `FreeBuffer` or a
/// buffer-done callback.
pub type HeaderRef = Arc<Mutex<BufferHeader>>;

pub fn new_header(data: BufferData, alloc_len: usize) -> HeaderRef {
    Arc::new(Mutex::new(BufferHeader::new(data, alloc_len)))
}
