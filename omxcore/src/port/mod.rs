//! Ports: buffer pools, flags, tunnel bookkeeping and parameter blocks.

mod config_port;
mod model;
mod pcm;

pub use config_port::ConfigPort;
pub use model::{BasePortModel, PortModel};
pub use pcm::PcmPortModel;

use std::collections::VecDeque;

use tracing::trace;

use omxil::{
    downcast, downcast_mut, new_header, BufferData, BufferSupplier, CompBufferSupplier,
    ComponentId, Dir, Domain, EglImage, HeaderRef, IlError, IlResult, IlStruct, Index, Mark,
    PortDefinition, PortFormat, TunneledPortStatus, TunneledPortStatusConfig,
};

/// Where one pooled header currently lives.
///
/// `AtHome` is the providing side at rest: the host for a non-tunneled
/// port, the port itself when it is the tunnel supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSlot {
    AtHome,
    Ingress,
    Egress,
    Claimed,
    AtPeer,
}

struct HeaderEntry {
    hdr: HeaderRef,
    slot: HeaderSlot,
    egl: Option<EglImage>,
}

/// Tunnel binding of a port: the peer is addressed by id, never by
/// reference.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub peer_component: ComponentId,
    pub peer_port: u32,
    /// This side allocates the buffers.
    pub supplier: bool,
    /// Readiness bits last advertised by the peer.
    pub peer_status: TunneledPortStatus,
}

/// Build-time description of a regular port.
///
/// Component kinds assemble their ports with this builder; the kernel
/// assigns the index at registration.
pub struct PortConfig {
    pub(crate) dir: Dir,
    pub(crate) format: PortFormat,
    pub(crate) buffer_count: u32,
    pub(crate) min_buffer_count: u32,
    pub(crate) buffer_size: usize,
    pub(crate) buffer_alignment: u32,
    pub(crate) supplier_preference: BufferSupplier,
    pub(crate) pre_announcements: bool,
    pub(crate) paired_port: Option<u32>,
    pub(crate) model: Box<dyn PortModel>,
}

impl PortConfig {
    pub fn new(dir: Dir, format: PortFormat) -> Self {
        Self {
            dir,
            format,
            buffer_count: 2,
            min_buffer_count: 1,
            buffer_size: 8192,
            buffer_alignment: 0,
            supplier_preference: BufferSupplier::Unspecified,
            pre_announcements: true,
            paired_port: None,
            model: Box::new(BasePortModel),
        }
    }

    pub fn buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self.min_buffer_count = count.min(self.min_buffer_count.max(1));
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn buffer_alignment(mut self, alignment: u32) -> Self {
        self.buffer_alignment = alignment;
        self
    }

    pub fn supplier_preference(mut self, pref: BufferSupplier) -> Self {
        self.supplier_preference = pref;
        self
    }

    /// Disable buffer pre-announcements: supplier-allocated headers get
    /// their backing memory lazily, on first claim.
    pub fn without_pre_announcements(mut self) -> Self {
        self.pre_announcements = false;
        self
    }

    /// Pair this port with `pid` for parameter slaving.
    pub fn paired_with(mut self, pid: u32) -> Self {
        self.paired_port = Some(pid);
        self
    }

    pub fn model(mut self, model: Box<dyn PortModel>) -> Self {
        self.model = model;
        self
    }
}

/// A regular (non-config) port.
pub struct Port {
    def: PortDefinition,
    being_enabled: bool,
    being_disabled: bool,
    allocator: bool,
    pre_announcements: bool,
    supplier_preference: BufferSupplier,
    paired_port: Option<u32>,
    tunnel: Option<Tunnel>,
    pool: Vec<HeaderEntry>,
    claimed: u32,
    marks: VecDeque<Mark>,
    model: Box<dyn PortModel>,
}

impl Port {
    pub fn new(cfg: PortConfig) -> Self {
        let def = PortDefinition {
            port_index: 0,
            dir: cfg.dir,
            buffer_count_actual: cfg.buffer_count,
            buffer_count_min: cfg.min_buffer_count,
            buffer_size: cfg.buffer_size,
            enabled: true,
            populated: false,
            buffers_contiguous: false,
            buffer_alignment: cfg.buffer_alignment,
            format: cfg.format,
        };
        Self {
            def,
            being_enabled: false,
            being_disabled: false,
            allocator: false,
            pre_announcements: cfg.pre_announcements,
            supplier_preference: cfg.supplier_preference,
            paired_port: cfg.paired_port,
            tunnel: None,
            pool: Vec::new(),
            claimed: 0,
            marks: VecDeque::new(),
            model: cfg.model,
        }
    }

    pub(crate) fn set_index(&mut self, pid: u32) {
        self.def.port_index = pid;
    }

    pub fn index(&self) -> u32 {
        self.def.port_index
    }

    pub fn dir(&self) -> Dir {
        self.def.dir
    }

    pub fn domain(&self) -> Domain {
        self.def.format.domain()
    }

    pub fn definition(&self) -> &PortDefinition {
        &self.def
    }

    pub fn buffer_count(&self) -> u32 {
        self.pool.len() as u32
    }

    pub fn expected_buffer_count(&self) -> u32 {
        self.def.buffer_count_actual
    }

    pub fn claimed_count(&self) -> u32 {
        self.claimed
    }

    pub fn is_enabled(&self) -> bool {
        self.def.enabled
    }

    pub fn is_populated(&self) -> bool {
        self.def.populated
    }

    pub fn is_being_enabled(&self) -> bool {
        self.being_enabled
    }

    pub fn is_being_disabled(&self) -> bool {
        self.being_disabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.def.enabled = enabled;
    }

    pub(crate) fn set_being_enabled(&mut self, v: bool) {
        self.being_enabled = v;
    }

    pub(crate) fn set_being_disabled(&mut self, v: bool) {
        self.being_disabled = v;
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn is_supplier(&self) -> bool {
        self.tunnel.as_ref().is_some_and(|t| t.supplier)
    }

    pub fn is_tunneled_supplier(&self) -> bool {
        self.is_supplier()
    }

    pub fn tunnel(&self) -> Option<&Tunnel> {
        self.tunnel.as_ref()
    }

    pub(crate) fn set_tunnel(&mut self, tunnel: Option<Tunnel>) {
        self.tunnel = tunnel;
    }

    pub(crate) fn set_supplier(&mut self, supplier: bool) {
        if let Some(t) = self.tunnel.as_mut() {
            t.supplier = supplier;
        }
    }

    pub fn supplier_preference(&self) -> BufferSupplier {
        self.supplier_preference
    }

    pub fn paired_port(&self) -> Option<u32> {
        self.paired_port
    }

    // Peer readiness, as advertised through ConfigTunneledPortStatus.

    pub fn may_call_use_buffer(&self) -> bool {
        self.tunnel
            .as_ref()
            .is_some_and(|t| t.peer_status.contains(TunneledPortStatus::ACCEPT_USE_BUFFER))
    }

    pub fn may_exchange_buffers(&self) -> bool {
        self.tunnel.as_ref().is_some_and(|t| {
            t.peer_status
                .contains(TunneledPortStatus::ACCEPT_BUFFER_EXCHANGE)
        })
    }

    pub fn may_initiate_exe_to_idle(&self) -> bool {
        self.tunnel.as_ref().is_some_and(|t| {
            t.peer_status
                .contains(TunneledPortStatus::AWAIT_BUFFERS_RETURN)
        })
    }

    pub(crate) fn merge_peer_status(&mut self, bits: TunneledPortStatus) {
        if let Some(t) = self.tunnel.as_mut() {
            t.peer_status |= bits;
        }
    }

    pub(crate) fn reset_peer_status_flag(&mut self, flag: TunneledPortStatus) {
        if let Some(t) = self.tunnel.as_mut() {
            t.peer_status.remove(flag);
        }
    }

    // Buffer pool management.

    fn refresh_populated(&mut self) {
        self.def.populated = self.pool.len() as u32 == self.def.buffer_count_actual
            && self.def.buffer_count_actual > 0;
    }

    fn bind_header_dir(&self, hdr: &HeaderRef) {
        let mut h = hdr.lock().expect("header poisoned");
        match self.def.dir {
            Dir::Input => h.input_port_index = Some(self.def.port_index),
            Dir::Output => h.output_port_index = Some(self.def.port_index),
        }
    }

    /// Attaches a host-allocated buffer. The memory moves into the header;
    /// it comes back to the host through `FreeBuffer`.
    pub fn use_buffer(&mut self, buffer: Vec<u8>) -> IlResult<HeaderRef> {
        if self.pool.len() as u32 >= self.def.buffer_count_actual {
            return Err(IlError::InsufficientResources);
        }
        if buffer.len() < self.def.buffer_size {
            return Err(IlError::BadParameter);
        }
        let alloc_len = buffer.len();
        let hdr = new_header(BufferData::Owned(buffer), alloc_len);
        self.bind_header_dir(&hdr);
        self.pool.push(HeaderEntry {
            hdr: hdr.clone(),
            slot: HeaderSlot::AtHome,
            egl: None,
        });
        self.refresh_populated();
        Ok(hdr)
    }

    /// Allocates a buffer inside the port (allocator semantics).
    pub fn allocate_buffer(&mut self, size: usize) -> IlResult<HeaderRef> {
        if self.pool.len() as u32 >= self.def.buffer_count_actual {
            return Err(IlError::InsufficientResources);
        }
        if size < self.def.buffer_size {
            return Err(IlError::BadParameter);
        }
        let hdr = new_header(BufferData::Owned(vec![0; size]), size);
        self.bind_header_dir(&hdr);
        self.allocator = true;
        self.pool.push(HeaderEntry {
            hdr: hdr.clone(),
            slot: HeaderSlot::AtHome,
            egl: None,
        });
        self.refresh_populated();
        Ok(hdr)
    }

    /// Attaches a headerless EGL image.
    pub fn use_egl_image(&mut self, egl: EglImage) -> IlResult<HeaderRef> {
        if self.pool.len() as u32 >= self.def.buffer_count_actual {
            return Err(IlError::InsufficientResources);
        }
        let hdr = new_header(BufferData::Egl(egl.clone()), 0);
        self.bind_header_dir(&hdr);
        self.pool.push(HeaderEntry {
            hdr: hdr.clone(),
            slot: HeaderSlot::AtHome,
            egl: Some(egl),
        });
        self.refresh_populated();
        Ok(hdr)
    }

    /// Registers a header allocated by the supplying tunnel peer.
    pub fn attach_tunnel_buffer(&mut self, hdr: HeaderRef) -> IlResult<()> {
        if self.pool.len() as u32 >= self.def.buffer_count_actual {
            return Err(IlError::InsufficientResources);
        }
        self.bind_header_dir(&hdr);
        self.pool.push(HeaderEntry {
            hdr,
            slot: HeaderSlot::AtPeer,
            egl: None,
        });
        self.refresh_populated();
        Ok(())
    }

    pub fn free_buffer(&mut self, hdr: &HeaderRef) -> IlResult<()> {
        let pos = self
            .pool
            .iter()
            .position(|e| std::sync::Arc::ptr_eq(&e.hdr, hdr))
            .ok_or(IlError::BadParameter)?;
        let entry = self.pool.remove(pos);
        if entry.slot == HeaderSlot::Claimed {
            self.claimed = self.claimed.saturating_sub(1);
        }
        self.refresh_populated();
        Ok(())
    }

    /// Creates the whole pool on a supplier port. Returns the new headers
    /// so the kernel can register them with the peer.
    pub fn populate(&mut self) -> IlResult<Vec<HeaderRef>> {
        if self.def.populated {
            return Ok(Vec::new());
        }
        let mut created = Vec::new();
        while (self.pool.len() as u32) < self.def.buffer_count_actual {
            let data = if self.pre_announcements {
                BufferData::Owned(vec![0; self.def.buffer_size])
            } else {
                BufferData::Unallocated
            };
            let hdr = new_header(data, self.def.buffer_size);
            self.bind_header_dir(&hdr);
            self.pool.push(HeaderEntry {
                hdr: hdr.clone(),
                slot: HeaderSlot::AtHome,
                egl: None,
            });
            created.push(hdr);
        }
        self.allocator = true;
        self.refresh_populated();
        trace!(pid = self.def.port_index, count = created.len(), "port populated");
        Ok(created)
    }

    /// Drops the whole pool on a supplier port. Returns the detached
    /// headers so the kernel can withdraw them from the peer.
    pub fn depopulate(&mut self) -> Vec<HeaderRef> {
        let detached: Vec<HeaderRef> = self.pool.drain(..).map(|e| e.hdr).collect();
        self.claimed = 0;
        self.refresh_populated();
        detached
    }

    /// Lazy backing allocation for allocator output ports with
    /// pre-announcements disabled. No effect otherwise.
    pub fn populate_header(&self, hdr: &HeaderRef) {
        if self.allocator {
            hdr.lock().expect("header poisoned").ensure_allocated();
        }
    }

    pub fn is_allocator(&self) -> bool {
        self.allocator
    }

    pub fn headers(&self) -> Vec<HeaderRef> {
        self.pool.iter().map(|e| e.hdr.clone()).collect()
    }

    pub fn owns(&self, hdr: &HeaderRef) -> bool {
        self.pool
            .iter()
            .any(|e| std::sync::Arc::ptr_eq(&e.hdr, hdr))
    }

    pub fn slot_of(&self, hdr: &HeaderRef) -> Option<HeaderSlot> {
        self.pool
            .iter()
            .find(|e| std::sync::Arc::ptr_eq(&e.hdr, hdr))
            .map(|e| e.slot)
    }

    pub(crate) fn set_slot(&mut self, hdr: &HeaderRef, slot: HeaderSlot) {
        let Some(entry) = self
            .pool
            .iter_mut()
            .find(|e| std::sync::Arc::ptr_eq(&e.hdr, hdr))
        else {
            return;
        };
        if entry.slot == HeaderSlot::Claimed && slot != HeaderSlot::Claimed {
            self.claimed = self.claimed.saturating_sub(1);
        } else if entry.slot != HeaderSlot::Claimed && slot == HeaderSlot::Claimed {
            self.claimed += 1;
        }
        entry.slot = slot;
    }

    /// True when any pooled header is still out at the tunnel peer.
    pub fn has_headers_at_peer(&self) -> bool {
        self.pool.iter().any(|e| e.slot == HeaderSlot::AtPeer)
    }

    /// Applies the pool geometry negotiated during tunnel setup. Unlike
    /// `SetParameter`, this may also grow the buffer size.
    pub(crate) fn set_negotiated_geometry(&mut self, count: u32, size: usize) {
        self.def.buffer_count_actual = count.max(self.def.buffer_count_min);
        self.def.buffer_size = size;
        self.refresh_populated();
    }

    pub fn eglimage_of(&self, hdr: &HeaderRef) -> Option<EglImage> {
        self.pool
            .iter()
            .find(|e| std::sync::Arc::ptr_eq(&e.hdr, hdr))
            .and_then(|e| e.egl.clone())
    }

    /// Conservation invariant: every pooled header is in exactly one slot
    /// and the claimed counter agrees with the slot tags.
    pub fn conservation_holds(&self) -> bool {
        let claimed_slots = self
            .pool
            .iter()
            .filter(|e| e.slot == HeaderSlot::Claimed)
            .count() as u32;
        claimed_slots == self.claimed
    }

    // Marks.

    pub fn store_mark(&mut self, mark: Mark) {
        self.marks.push_back(mark);
    }

    pub fn pending_marks(&self) -> usize {
        self.marks.len()
    }

    pub fn take_marks(&mut self) -> Vec<Mark> {
        self.marks.drain(..).collect()
    }

    /// Attaches the oldest pending mark to an input header; `NotReady`
    /// when the queue is empty (benign).
    pub fn mark_buffer(&mut self, hdr: &HeaderRef) -> IlResult<()> {
        let mark = self.marks.pop_front().ok_or(IlError::NotReady)?;
        hdr.lock().expect("header poisoned").mark = Some(mark);
        Ok(())
    }

    // Parameter / config routing.

    pub fn find_index(&self, index: Index) -> bool {
        matches!(
            index,
            Index::ParamPortDefinition
                | Index::ParamCompBufferSupplier
                | Index::ConfigTunneledPortStatus
        ) || self.model.find_index(index)
    }

    pub fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ParamPortDefinition => {
                *downcast_mut::<PortDefinition>(value)? = self.def.clone();
                Ok(())
            }
            Index::ParamCompBufferSupplier => {
                let out = downcast_mut::<CompBufferSupplier>(value)?;
                out.supplier = self.current_supplier();
                Ok(())
            }
            _ => self.model.get_parameter(value),
        }
    }

    pub fn set_parameter(&mut self, value: &dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ParamPortDefinition => {
                let new_def = downcast::<PortDefinition>(value)?;
                if new_def.buffer_count_actual < self.def.buffer_count_min {
                    return Err(IlError::BadParameter);
                }
                // Only the client-writable fields move; flags and direction
                // belong to the component.
                self.def.buffer_count_actual = new_def.buffer_count_actual;
                self.def.format = new_def.format.clone();
                Ok(())
            }
            Index::ParamCompBufferSupplier => {
                let req = downcast::<CompBufferSupplier>(value)?;
                if self.tunnel.is_none() {
                    return Err(IlError::IncorrectStateOperation);
                }
                let supplier = match req.supplier {
                    BufferSupplier::Input => self.def.dir == Dir::Input,
                    BufferSupplier::Output => self.def.dir == Dir::Output,
                    BufferSupplier::Unspecified => return Err(IlError::BadParameter),
                };
                self.set_supplier(supplier);
                Ok(())
            }
            _ => self.model.set_parameter(value),
        }
    }

    pub fn get_config(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ConfigTunneledPortStatus => {
                let out = downcast_mut::<TunneledPortStatusConfig>(value)?;
                out.status = self
                    .tunnel
                    .as_ref()
                    .map(|t| t.peer_status)
                    .unwrap_or_default();
                Ok(())
            }
            _ => self.model.get_config(value),
        }
    }

    pub fn set_config(&mut self, value: &dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ConfigTunneledPortStatus => {
                let cfg = downcast::<TunneledPortStatusConfig>(value)?;
                self.merge_peer_status(cfg.status);
                Ok(())
            }
            _ => self.model.set_config(value),
        }
    }

    pub fn apply_slaving(
        &mut self,
        triggering: Index,
        value: &dyn IlStruct,
    ) -> IlResult<Vec<Index>> {
        self.model.apply_slaving(triggering, value)
    }

    pub fn extension_index(&self, name: &str) -> Option<Index> {
        self.model.extension_index(name)
    }

    fn current_supplier(&self) -> BufferSupplier {
        match self.tunnel.as_ref() {
            Some(t) => {
                let supplying_dir = if t.supplier {
                    self.def.dir
                } else {
                    self.def.dir.opposite()
                };
                match supplying_dir {
                    Dir::Input => BufferSupplier::Input,
                    Dir::Output => BufferSupplier::Output,
                }
            }
            None => self.supplier_preference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omxil::{AudioEncoding, AudioPortDefinition};
    use std::sync::Arc;

    fn audio_port(count: u32, size: usize) -> Port {
        let format = PortFormat::Audio(AudioPortDefinition {
            mime_type: "audio/x-raw".into(),
            encoding: AudioEncoding::Pcm,
        });
        Port::new(
            PortConfig::new(Dir::Input, format)
                .buffer_count(count)
                .buffer_size(size),
        )
    }

    #[test]
    fn test_use_buffer_populates() {
        let mut port = audio_port(2, 16);
        assert!(!port.is_populated());

        let h1 = port.use_buffer(vec![0; 16]).unwrap();
        assert!(!port.is_populated());
        let _h2 = port.use_buffer(vec![0; 16]).unwrap();
        assert!(port.is_populated());

        assert_eq!(h1.lock().unwrap().input_port_index, Some(0));
        assert!(matches!(
            port.use_buffer(vec![0; 16]),
            Err(IlError::InsufficientResources)
        ));
    }

    #[test]
    fn test_undersized_buffer_rejected() {
        let mut port = audio_port(1, 64);
        assert!(matches!(
            port.use_buffer(vec![0; 32]),
            Err(IlError::BadParameter)
        ));
    }

    #[test]
    fn test_free_unknown_header() {
        let mut port = audio_port(2, 16);
        let _known = port.use_buffer(vec![0; 16]).unwrap();
        let foreign = omxil::new_header(BufferData::Unallocated, 0);
        assert_eq!(port.free_buffer(&foreign), Err(IlError::BadParameter));
    }

    #[test]
    fn test_free_depopulates() {
        let mut port = audio_port(1, 16);
        let hdr = port.use_buffer(vec![0; 16]).unwrap();
        assert!(port.is_populated());
        port.free_buffer(&hdr).unwrap();
        assert!(!port.is_populated());
        assert_eq!(port.buffer_count(), 0);
    }

    #[test]
    fn test_claimed_counter_follows_slots() {
        let mut port = audio_port(2, 16);
        let h1 = port.use_buffer(vec![0; 16]).unwrap();
        let h2 = port.use_buffer(vec![0; 16]).unwrap();

        port.set_slot(&h1, HeaderSlot::Claimed);
        port.set_slot(&h2, HeaderSlot::Claimed);
        assert_eq!(port.claimed_count(), 2);

        port.set_slot(&h1, HeaderSlot::Egress);
        assert_eq!(port.claimed_count(), 1);
        assert!(port.conservation_holds());
    }

    #[test]
    fn test_mark_queue_fifo() {
        let mut port = audio_port(1, 16);
        let hdr = port.use_buffer(vec![0; 16]).unwrap();

        assert_eq!(port.mark_buffer(&hdr), Err(IlError::NotReady));

        port.store_mark(Mark {
            target_component: ComponentId(7),
            data: Arc::new(1u32),
        });
        port.mark_buffer(&hdr).unwrap();
        assert_eq!(
            hdr.lock().unwrap().mark.as_ref().unwrap().target_component,
            ComponentId(7)
        );
        assert_eq!(port.mark_buffer(&hdr), Err(IlError::NotReady));
    }

    #[test]
    fn test_populate_without_pre_announcements_is_lazy() {
        let format = PortFormat::Audio(AudioPortDefinition {
            mime_type: "audio/x-raw".into(),
            encoding: AudioEncoding::Pcm,
        });
        let mut port = Port::new(
            PortConfig::new(Dir::Output, format)
                .buffer_count(2)
                .buffer_size(32)
                .without_pre_announcements(),
        );
        port.set_tunnel(Some(Tunnel {
            peer_component: ComponentId(9),
            peer_port: 0,
            supplier: true,
            peer_status: TunneledPortStatus::empty(),
        }));

        let created = port.populate().unwrap();
        assert_eq!(created.len(), 2);
        assert!(port.is_populated());
        assert!(matches!(
            created[0].lock().unwrap().data,
            BufferData::Unallocated
        ));

        port.populate_header(&created[0]);
        assert!(matches!(
            created[0].lock().unwrap().data,
            BufferData::Owned(_)
        ));
    }

    #[test]
    fn test_port_definition_set_parameter_limits() {
        let mut port = audio_port(2, 16);
        let mut def = port.definition().clone();
        def.buffer_count_actual = 4;
        def.enabled = false; // must be ignored
        port.set_parameter(&def).unwrap();
        assert_eq!(port.definition().buffer_count_actual, 4);
        assert!(port.is_enabled());

        def.buffer_count_actual = 0;
        assert_eq!(port.set_parameter(&def), Err(IlError::BadParameter));
    }
}
