//! The kernel servant: port registry, buffer-exchange engine and
//! transition bookkeeping.
//!
//! The kernel owns every port and the per-port ingress/egress queues. It
//! routes parameter and configuration traffic to the managing port,
//! performs the resource micro-steps the FSM asks for, and decides when an
//! in-flight transition, port enable or port disable is complete. It never
//! calls the processor or the FSM directly; the component glue sequences
//! those.

mod exchange;

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use omxil::{
    downcast_mut, Domain, EglImage, HeaderRef, IlError, IlResult, IlStruct, Index, PortCountParam,
    PortSelector, TunneledPortStatus, TunneledPortStatusConfig,
};

use crate::port::{ConfigPort, HeaderSlot, Port, PortConfig, Tunnel};
use crate::servant::{Effect, Servant};

/// Where a parameter/config structure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    ConfigPort,
    Port(u32),
    KernelInit(Domain),
}

/// What the component glue must do after a successful `SetConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetConfigAction {
    /// Plain config change: tell the processor.
    ForwardToProcessor,
    /// A tunneled-port status phase predicate just turned true; run the
    /// FSM status update.
    StatusUpdate,
    Nothing,
}

/// Population summary used by the FSM glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationStatus {
    FullyPopulated,
    Unpopulated {
        may_be_fully_unpopulated: bool,
    },
    FullyUnpopulated,
}

pub struct Kernel {
    ports: Vec<Port>,
    ingress: Vec<VecDeque<HeaderRef>>,
    egress: Vec<VecDeque<HeaderRef>>,
    cport: ConfigPort,
    eos: bool,
    audio_init: omxil::PortParam,
    video_init: omxil::PortParam,
    image_init: omxil::PortParam,
    other_init: omxil::PortParam,
    /// Outstanding per-port completions of the command in flight, so an
    /// `All` command emits one CmdComplete per port.
    cmd_completion_count: u32,
    accept_use_buffer_notified: bool,
    accept_buffer_exchange_notified: bool,
    may_transition_exe2idle_notified: bool,
}

impl Kernel {
    pub fn new(cport: ConfigPort) -> Self {
        Self {
            ports: Vec::new(),
            ingress: Vec::new(),
            egress: Vec::new(),
            cport,
            eos: false,
            audio_init: Default::default(),
            video_init: Default::default(),
            image_init: Default::default(),
            other_init: Default::default(),
            cmd_completion_count: 0,
            accept_use_buffer_notified: false,
            accept_buffer_exchange_notified: false,
            may_transition_exe2idle_notified: false,
        }
    }

    // ---------------------------------------------------------------------
    // Port registry
    // ---------------------------------------------------------------------

    /// Registers a regular port; indices are assigned in registration
    /// order. The matching ingress/egress queues are created alongside.
    pub fn register_port(&mut self, cfg: PortConfig) -> u32 {
        let pid = self.ports.len() as u32;
        let mut port = Port::new(cfg);
        port.set_index(pid);

        let init = match port.domain() {
            Domain::Audio => &mut self.audio_init,
            Domain::Video => &mut self.video_init,
            Domain::Image => &mut self.image_init,
            Domain::Other => &mut self.other_init,
        };
        if init.ports == 0 {
            init.start_port_number = pid;
        }
        init.ports += 1;

        self.ports.push(port);
        self.ingress.push(VecDeque::new());
        self.egress.push(VecDeque::new());
        pid
    }

    pub fn deregister_all_ports(&mut self) {
        self.ports.clear();
        self.ingress.clear();
        self.egress.clear();
        self.audio_init = Default::default();
        self.video_init = Default::default();
        self.image_init = Default::default();
        self.other_init = Default::default();
    }

    pub fn nports(&self) -> u32 {
        self.ports.len() as u32
    }

    pub fn check_pid(&self, pid: u32) -> IlResult<()> {
        if (pid as usize) < self.ports.len() {
            Ok(())
        } else {
            Err(IlError::BadPortIndex)
        }
    }

    pub fn port(&self, pid: u32) -> &Port {
        &self.ports[pid as usize]
    }

    pub fn port_mut(&mut self, pid: u32) -> &mut Port {
        &mut self.ports[pid as usize]
    }

    pub fn config_port(&self) -> &ConfigPort {
        &self.cport
    }

    pub fn config_port_mut(&mut self) -> &mut ConfigPort {
        &mut self.cport
    }

    pub fn eos(&self) -> bool {
        self.eos
    }

    pub fn clear_eos(&mut self) {
        self.eos = false;
    }

    pub(crate) fn mark_eos(&mut self) {
        self.eos = true;
    }

    pub(crate) fn ingress_mut(&mut self, pid: u32) -> &mut VecDeque<HeaderRef> {
        &mut self.ingress[pid as usize]
    }

    pub(crate) fn egress_mut(&mut self, pid: u32) -> &mut VecDeque<HeaderRef> {
        &mut self.egress[pid as usize]
    }

    pub(crate) fn push_egress(&mut self, pid: u32, hdr: HeaderRef) {
        self.egress[pid as usize].push_back(hdr);
    }

    // ---------------------------------------------------------------------
    // Parameter / config routing
    // ---------------------------------------------------------------------

    fn find_managing_port(&self, value: &dyn IlStruct) -> IlResult<Route> {
        let index = value.index();
        if self.cport.find_index(index) {
            return Ok(Route::ConfigPort);
        }
        if self.ports.iter().any(|p| p.find_index(index)) {
            let pid = value.port_index().ok_or(IlError::BadParameter)?;
            self.check_pid(pid)?;
            return Ok(Route::Port(pid));
        }
        match index {
            Index::ParamAudioInit => Ok(Route::KernelInit(Domain::Audio)),
            Index::ParamVideoInit => Ok(Route::KernelInit(Domain::Video)),
            Index::ParamImageInit => Ok(Route::KernelInit(Domain::Image)),
            Index::ParamOtherInit => Ok(Route::KernelInit(Domain::Other)),
            _ => {
                trace!(%index, "no managing port");
                Err(IlError::UnsupportedIndex)
            }
        }
    }

    pub fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        match self.find_managing_port(value)? {
            Route::ConfigPort => self.cport.get_parameter(value),
            Route::Port(pid) => self.port(pid).get_parameter(value),
            Route::KernelInit(domain) => {
                let out = downcast_mut::<PortCountParam>(value)?;
                out.param = match domain {
                    Domain::Audio => self.audio_init,
                    Domain::Video => self.video_init,
                    Domain::Image => self.image_init,
                    Domain::Other => self.other_init,
                };
                Ok(())
            }
        }
    }

    /// Delegates to the managing port, then applies master/slave pairing:
    /// each index the paired port changed raises one `PortSettingsChanged`.
    pub fn set_parameter(&mut self, value: &dyn IlStruct, srv: &mut Servant) -> IlResult<()> {
        match self.find_managing_port(value)? {
            Route::ConfigPort => self.cport.set_parameter(value),
            Route::Port(pid) => {
                self.port_mut(pid).set_parameter(value)?;
                if let Some(mos_pid) = self.port(pid).paired_port() {
                    self.check_pid(mos_pid)?;
                    let changed = self
                        .port_mut(mos_pid)
                        .apply_slaving(value.index(), value)?;
                    for index in changed {
                        srv.issue_event(crate::events::IlEvent::PortSettingsChanged {
                            pid: mos_pid,
                            index,
                        });
                    }
                }
                Ok(())
            }
            // The aggregate port counts are read only.
            Route::KernelInit(_) => Err(IlError::UnsupportedIndex),
        }
    }

    pub fn get_config(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        match self.find_managing_port(value)? {
            Route::ConfigPort => self.cport.get_parameter(value),
            Route::Port(pid) => self.port(pid).get_config(value),
            Route::KernelInit(_) => Err(IlError::UnsupportedIndex),
        }
    }

    /// Delegates to the managing port and classifies the aftermath: a
    /// tunneled-port status update may unlatch one of the three transition
    /// phases, anything else is forwarded to the processor.
    pub fn set_config(&mut self, value: &dyn IlStruct) -> IlResult<SetConfigAction> {
        let route = self.find_managing_port(value)?;
        match route {
            Route::ConfigPort => {
                self.cport.set_parameter(value)?;
                return Ok(SetConfigAction::ForwardToProcessor);
            }
            Route::Port(pid) => self.port_mut(pid).set_config(value)?,
            Route::KernelInit(_) => return Err(IlError::UnsupportedIndex),
        }

        if value.index() != Index::ConfigTunneledPortStatus {
            return Ok(SetConfigAction::ForwardToProcessor);
        }

        let status = value
            .as_any()
            .downcast_ref::<TunneledPortStatusConfig>()
            .ok_or(IlError::BadParameter)?
            .status;

        if !self.accept_use_buffer_notified
            && status.contains(TunneledPortStatus::ACCEPT_USE_BUFFER)
            && self.may_initiate_alloc_phase()
        {
            self.accept_use_buffer_notified = true;
            return Ok(SetConfigAction::StatusUpdate);
        }
        if !self.accept_buffer_exchange_notified
            && status.contains(TunneledPortStatus::ACCEPT_BUFFER_EXCHANGE)
            && self.may_exchange_buffers()
        {
            self.accept_buffer_exchange_notified = true;
            return Ok(SetConfigAction::StatusUpdate);
        }
        if !self.may_transition_exe2idle_notified
            && status.contains(TunneledPortStatus::AWAIT_BUFFERS_RETURN)
            && self.may_initiate_exe_to_idle()
        {
            self.may_transition_exe2idle_notified = true;
            return Ok(SetConfigAction::StatusUpdate);
        }
        trace!(
            use_buffer = self.accept_use_buffer_notified,
            exchange = self.accept_buffer_exchange_notified,
            exe2idle = self.may_transition_exe2idle_notified,
            "tunneled port status: no phase change"
        );
        Ok(SetConfigAction::Nothing)
    }

    pub fn get_extension_index(&self, name: &str) -> IlResult<Index> {
        for port in &self.ports {
            if let Some(index) = port.extension_index(name) {
                return Ok(index);
            }
        }
        self.cport
            .extension_index(name)
            .ok_or(IlError::UnsupportedIndex)
    }

    // ---------------------------------------------------------------------
    // Buffer allocation phase
    // ---------------------------------------------------------------------

    /// Attaches a host buffer; returns whether this completed an in-flight
    /// port enable.
    pub fn use_buffer(
        &mut self,
        pid: u32,
        buffer: Vec<u8>,
        srv: &mut Servant,
    ) -> IlResult<(HeaderRef, bool)> {
        self.check_pid(pid)?;
        if self.port(pid).is_tunneled() {
            // Tunneled pools are exchanged between the peers, never with
            // the host.
            warn!(pid, "UseBuffer on a tunneled port");
            return Err(IlError::BadPortIndex);
        }
        let was_being_enabled = self.port(pid).is_being_enabled();
        let hdr = self.port_mut(pid).use_buffer(buffer)?;
        let enable_completed = was_being_enabled && self.port(pid).is_populated();
        if enable_completed {
            self.complete_port_enable(pid, srv, None);
        }
        Ok((hdr, enable_completed))
    }

    pub fn allocate_buffer(
        &mut self,
        pid: u32,
        size: usize,
        srv: &mut Servant,
    ) -> IlResult<(HeaderRef, bool)> {
        self.check_pid(pid)?;
        if self.port(pid).is_tunneled() {
            return Err(IlError::BadPortIndex);
        }
        let was_being_enabled = self.port(pid).is_being_enabled();
        let hdr = self.port_mut(pid).allocate_buffer(size)?;
        let enable_completed = was_being_enabled && self.port(pid).is_populated();
        if enable_completed {
            self.complete_port_enable(pid, srv, None);
        }
        Ok((hdr, enable_completed))
    }

    pub fn use_egl_image(
        &mut self,
        pid: u32,
        egl: EglImage,
        srv: &mut Servant,
    ) -> IlResult<(HeaderRef, bool)> {
        self.check_pid(pid)?;
        if self.port(pid).is_tunneled() {
            return Err(IlError::BadPortIndex);
        }
        let was_being_enabled = self.port(pid).is_being_enabled();
        let hdr = self.port_mut(pid).use_egl_image(egl)?;
        let enable_completed = was_being_enabled && self.port(pid).is_populated();
        if enable_completed {
            self.complete_port_enable(pid, srv, None);
        }
        Ok((hdr, enable_completed))
    }

    /// Frees one header. Outside of an Idle-to-Loaded transition, freeing
    /// from an enabled populated port additionally raises
    /// `PortUnpopulated` as an asynchronous error; the free still happens.
    pub fn free_buffer(
        &mut self,
        pid: u32,
        hdr: &HeaderRef,
        in_idle_to_loaded: bool,
        srv: &mut Servant,
    ) -> IlResult<bool> {
        self.check_pid(pid)?;
        if self.port(pid).is_tunneled() {
            return Err(IlError::BadPortIndex);
        }
        let issue_unpop = !in_idle_to_loaded
            && self.port(pid).is_enabled()
            && self.port(pid).is_populated();
        let was_being_disabled = self.port(pid).is_being_disabled();

        // Purge the queues of the header being freed.
        self.ingress[pid as usize].retain(|h| !std::sync::Arc::ptr_eq(h, hdr));
        self.egress[pid as usize].retain(|h| !std::sync::Arc::ptr_eq(h, hdr));

        self.port_mut(pid).free_buffer(hdr)?;

        if issue_unpop {
            srv.issue_err_event(IlError::PortUnpopulated);
        }

        let disable_completed = was_being_disabled && self.port(pid).buffer_count() == 0;
        if disable_completed {
            self.complete_port_disable(pid, srv, None);
        }
        Ok(disable_completed)
    }

    /// Registers a header the supplying peer allocated for a tunneled,
    /// non-supplier port.
    pub fn attach_tunnel_buffer(
        &mut self,
        pid: u32,
        hdr: HeaderRef,
        srv: &mut Servant,
    ) -> IlResult<bool> {
        self.check_pid(pid)?;
        let was_being_enabled = self.port(pid).is_being_enabled();
        self.port_mut(pid).attach_tunnel_buffer(hdr)?;
        let enable_completed = was_being_enabled && self.port(pid).is_populated();
        if enable_completed {
            self.complete_port_enable(pid, srv, None);
        }
        Ok(enable_completed)
    }

    /// Withdraws a supplier-allocated header (peer side of depopulate).
    pub fn detach_tunnel_buffer(
        &mut self,
        pid: u32,
        hdr: &HeaderRef,
        srv: &mut Servant,
    ) -> IlResult<bool> {
        self.check_pid(pid)?;
        let was_being_disabled = self.port(pid).is_being_disabled();
        self.ingress[pid as usize].retain(|h| !std::sync::Arc::ptr_eq(h, hdr));
        self.egress[pid as usize].retain(|h| !std::sync::Arc::ptr_eq(h, hdr));
        self.port_mut(pid).free_buffer(hdr)?;
        let disable_completed = was_being_disabled && self.port(pid).buffer_count() == 0;
        if disable_completed {
            self.complete_port_disable(pid, srv, None);
        }
        Ok(disable_completed)
    }

    // ---------------------------------------------------------------------
    // Processor-facing buffer API
    // ---------------------------------------------------------------------

    /// Takes `ingress[pos]` out for the processor. Output allocator ports
    /// get their backing memory populated lazily here; input claims ride
    /// any pending mark and complete the `MarkBuffer` command.
    pub fn claim_buffer(
        &mut self,
        pid: u32,
        pos: usize,
        srv: &mut Servant,
    ) -> IlResult<Option<HeaderRef>> {
        self.check_pid(pid)?;
        if !self.port(pid).is_enabled() {
            return Err(IlError::IncorrectStateOperation);
        }
        let Some(hdr) = self.ingress[pid as usize].get(pos).cloned() else {
            return Ok(None);
        };

        let dir = self.port(pid).dir();
        if dir == omxil::Dir::Output {
            self.port(pid).populate_header(&hdr);
            hdr.lock().expect("header poisoned").clear();
        }

        self.ingress[pid as usize].remove(pos);
        self.port_mut(pid).set_slot(&hdr, HeaderSlot::Claimed);

        if dir == omxil::Dir::Input {
            match self.port_mut(pid).mark_buffer(&hdr) {
                Ok(()) => self.complete_mark_buffer(pid, srv, None),
                Err(e) if e.is_benign() => {}
                Err(e) => return Err(e),
            }
        }
        trace!(pid, pos, "buffer claimed");
        Ok(Some(hdr))
    }

    pub fn claim_eglimage(&self, pid: u32, hdr: &HeaderRef) -> IlResult<EglImage> {
        self.check_pid(pid)?;
        self.port(pid)
            .eglimage_of(hdr)
            .ok_or(IlError::InsufficientResources)
    }

    pub fn ingress_len(&self, pid: u32) -> usize {
        self.ingress
            .get(pid as usize)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn egress_len(&self, pid: u32) -> usize {
        self.egress.get(pid as usize).map(|q| q.len()).unwrap_or(0)
    }

    /// Readiness snapshot over the ingress queues, for processors that
    /// poll several ports.
    pub fn ports_with_ingress(&self) -> Vec<u32> {
        self.ingress
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.is_empty())
            .map(|(i, _)| i as u32)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Transition predicates
    // ---------------------------------------------------------------------

    pub fn all_populated(&self) -> bool {
        self.ports
            .iter()
            .filter(|p| p.is_enabled())
            .all(|p| p.is_populated())
    }

    pub fn all_depopulated(&self) -> bool {
        self.ports.iter().all(|p| p.buffer_count() == 0)
    }

    pub fn all_buffers_returned(&self) -> bool {
        self.ports.iter().all(|p| p.claimed_count() == 0)
    }

    /// True when no enabled tunneled-supplier port still has headers out
    /// at its peer.
    pub fn all_tunnel_buffers_home(&self) -> bool {
        self.ports
            .iter()
            .filter(|p| p.is_enabled() && p.is_tunneled_supplier())
            .all(|p| !p.has_headers_at_peer())
    }

    pub fn population_status(&self, sel: PortSelector) -> PopulationStatus {
        match sel {
            PortSelector::All => {
                if self.all_populated() {
                    PopulationStatus::FullyPopulated
                } else if self.all_depopulated() {
                    PopulationStatus::FullyUnpopulated
                } else {
                    let stuck = self.ports.iter().any(|p| {
                        p.buffer_count() > 0 && p.is_tunneled() && !p.is_supplier()
                    });
                    PopulationStatus::Unpopulated {
                        may_be_fully_unpopulated: !stuck,
                    }
                }
            }
            PortSelector::Port(pid) => {
                let port = self.port(pid);
                if port.is_populated() {
                    PopulationStatus::FullyPopulated
                } else if port.buffer_count() == 0 {
                    PopulationStatus::FullyUnpopulated
                } else {
                    PopulationStatus::Unpopulated {
                        may_be_fully_unpopulated: port.is_supplier() || !port.is_tunneled(),
                    }
                }
            }
        }
    }

    // Tunneled-port phase restrictions.

    pub fn may_initiate_alloc_phase(&self) -> bool {
        self.ports
            .iter()
            .filter(|p| p.is_enabled() && p.is_tunneled_supplier())
            .all(|p| p.may_call_use_buffer())
    }

    pub fn may_exchange_buffers(&self) -> bool {
        self.ports
            .iter()
            .filter(|p| p.is_enabled() && p.is_tunneled_supplier())
            .all(|p| p.may_exchange_buffers())
    }

    pub fn may_initiate_exe_to_idle(&self) -> bool {
        self.ports
            .iter()
            .filter(|p| p.is_enabled() && p.is_tunneled())
            .all(|p| p.may_initiate_exe_to_idle())
    }

    /// Clears one phase latch and the matching received bit on every port,
    /// arming the phase for the next transition.
    pub fn reset_tunneled_ports_status(&mut self, flag: TunneledPortStatus) {
        match flag {
            TunneledPortStatus::ACCEPT_USE_BUFFER => self.accept_use_buffer_notified = false,
            TunneledPortStatus::ACCEPT_BUFFER_EXCHANGE => {
                self.accept_buffer_exchange_notified = false
            }
            TunneledPortStatus::AWAIT_BUFFERS_RETURN => {
                self.may_transition_exe2idle_notified = false
            }
            _ => {}
        }
        for port in &mut self.ports {
            port.reset_peer_status_flag(flag);
        }
    }

    /// Advertises one readiness bit of `pid` to its tunnel peer. Does
    /// nothing for untunneled or disabled ports, or when the bit does not
    /// apply to the port's supplier role.
    pub fn update_tunneled_status(
        &mut self,
        pid: u32,
        flag: TunneledPortStatus,
        srv: &mut Servant,
    ) {
        let port = self.port(pid);
        if !port.is_enabled() {
            return;
        }
        let Some(tunnel) = port.tunnel() else { return };
        let applies = match flag {
            // Only a non-supplier accepts UseBuffer; only a supplier waits
            // for its buffers back.
            TunneledPortStatus::ACCEPT_USE_BUFFER => !tunnel.supplier,
            TunneledPortStatus::AWAIT_BUFFERS_RETURN => tunnel.supplier,
            _ => true,
        };
        if !applies {
            return;
        }
        srv.push_effect(Effect::PeerSetConfig {
            peer: tunnel.peer_component,
            config: TunneledPortStatusConfig {
                port_index: tunnel.peer_port,
                status: flag,
            },
        });
    }

    // ---------------------------------------------------------------------
    // Resource lifecycle micro-steps
    // ---------------------------------------------------------------------

    /// Loaded-to-Idle step: advertise the allocation phase and populate
    /// every enabled tunneled-supplier port whose peer is ready.
    pub fn allocate_resources(&mut self, sel: PortSelector, srv: &mut Servant) -> IlResult<()> {
        if let PortSelector::Port(pid) = sel {
            self.check_pid(pid)?;
        }
        for pid in sel.iter(self.nports()) {
            self.update_tunneled_status(pid, TunneledPortStatus::ACCEPT_USE_BUFFER, srv);

            let port = self.port(pid);
            trace!(
                pid,
                enabled = port.is_enabled(),
                tunneled = port.is_tunneled(),
                supplier = port.is_supplier(),
                populated = port.is_populated(),
                "allocate resources"
            );
            if port.is_enabled()
                && port.is_tunneled_supplier()
                && !port.is_populated()
                && port.may_call_use_buffer()
            {
                let was_being_enabled = port.is_being_enabled();
                let peer = port.tunnel().map(|t| (t.peer_component, t.peer_port));
                let created = self.port_mut(pid).populate()?;
                if let Some((peer, peer_port)) = peer {
                    for hdr in &created {
                        // The headers live on this side; the peer registers
                        // them in its own pool.
                        self.port_mut(pid).set_slot(hdr, HeaderSlot::AtHome);
                        srv.push_effect(Effect::PeerAttachBuffer {
                            peer,
                            pid: peer_port,
                            hdr: hdr.clone(),
                        });
                    }
                }
                if was_being_enabled && self.port(pid).is_populated() {
                    self.complete_port_enable(pid, srv, None);
                }
            }
        }
        Ok(())
    }

    /// Idle-to-Loaded step: depopulate every enabled tunneled-supplier
    /// port and withdraw the headers from the peers.
    pub fn deallocate_resources(&mut self, srv: &mut Servant) -> IlResult<()> {
        for pid in 0..self.nports() {
            if self.port(pid).is_enabled() && self.port(pid).is_tunneled_supplier() {
                self.depopulate_and_detach(pid, srv);
            }
        }
        debug!(all_depopulated = self.all_depopulated(), "deallocate resources");
        Ok(())
    }

    /// Drops a supplier port's pool and queues the peer withdrawals.
    pub fn depopulate_and_detach(&mut self, pid: u32, srv: &mut Servant) {
        let peer = self
            .port(pid)
            .tunnel()
            .map(|t| (t.peer_component, t.peer_port));
        self.ingress[pid as usize].clear();
        self.egress[pid as usize].clear();
        let detached = self.port_mut(pid).depopulate();
        if let Some((peer, peer_port)) = peer {
            for hdr in detached {
                srv.push_effect(Effect::PeerDetachBuffer {
                    peer,
                    pid: peer_port,
                    hdr,
                });
            }
        }
    }

    /// Idle-to-Executing step: reset the header queues and stage the
    /// initial exchange of every enabled tunneled-supplier port. Input
    /// supplier headers go to egress (they leave first, asking the
    /// upstream peer for data); output supplier headers go to ingress (the
    /// processor fills them).
    pub fn prepare_to_transfer(&mut self, sel: PortSelector) -> IlResult<()> {
        if let PortSelector::Port(pid) = sel {
            self.check_pid(pid)?;
        }
        self.clear_hdr_queues(sel);
        for pid in sel.iter(self.nports()) {
            let port = self.port(pid);
            if !(port.is_enabled() && port.is_tunneled_supplier()) {
                continue;
            }
            let dir = port.dir();
            let headers = port.headers();
            for hdr in headers {
                match dir {
                    omxil::Dir::Input => {
                        self.port_mut(pid).set_slot(&hdr, HeaderSlot::Egress);
                        self.egress[pid as usize].push_back(hdr);
                    }
                    omxil::Dir::Output => {
                        self.port_mut(pid).set_slot(&hdr, HeaderSlot::Ingress);
                        self.ingress[pid as usize].push_back(hdr);
                    }
                }
            }
        }
        Ok(())
    }

    fn clear_hdr_queues(&mut self, sel: PortSelector) {
        for pid in sel.iter(self.nports()) {
            let drained: Vec<HeaderRef> = self.ingress[pid as usize]
                .drain(..)
                .chain(self.egress[pid as usize].drain(..))
                .collect();
            for hdr in drained {
                self.port_mut(pid).set_slot(&hdr, HeaderSlot::AtHome);
            }
        }
    }

    // Completion helpers.

    pub(crate) fn set_pending_completions(&mut self, count: u32) {
        self.cmd_completion_count = count;
    }

    pub fn pending_completions(&self) -> u32 {
        self.cmd_completion_count
    }

    pub fn complete_port_enable(&mut self, pid: u32, srv: &mut Servant, error: Option<IlError>) {
        let port = self.port_mut(pid);
        port.set_being_enabled(false);
        debug!(pid, ?error, "port enable complete");
        self.cmd_completion_count = self.cmd_completion_count.saturating_sub(1);
        srv.issue_cmd_event(omxil::Command::PortEnable, pid, error);
    }

    pub fn complete_port_disable(&mut self, pid: u32, srv: &mut Servant, error: Option<IlError>) {
        let port = self.port_mut(pid);
        port.set_being_disabled(false);
        debug!(pid, ?error, "port disable complete");
        self.cmd_completion_count = self.cmd_completion_count.saturating_sub(1);
        srv.issue_cmd_event(omxil::Command::PortDisable, pid, error);
    }

    pub fn complete_mark_buffer(&mut self, pid: u32, srv: &mut Servant, error: Option<IlError>) {
        srv.issue_cmd_event(omxil::Command::MarkBuffer, pid, error);
    }

    // Tunnel setup (negotiation happens at the component API level).

    pub(crate) fn set_tunnel(&mut self, pid: u32, tunnel: Option<Tunnel>) -> IlResult<()> {
        self.check_pid(pid)?;
        self.port_mut(pid).set_tunnel(tunnel);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::servant::Mailbox;
    use omxil::{
        AudioEncoding, AudioPortDefinition, ComponentId, ComponentVersion, Dir, PcmModeType,
        PortFormat, SPEC_VERSION,
    };

    use crate::port::PcmPortModel;

    /// A two-port audio kernel (input 0, output 1, two 16-byte buffers
    /// each) with a fresh servant and mailbox.
    pub(crate) fn kernel_fixture() -> (Kernel, Servant, Mailbox) {
        let audio = || {
            PortFormat::Audio(AudioPortDefinition {
                mime_type: "audio/x-raw".into(),
                encoding: AudioEncoding::Pcm,
            })
        };
        let cport = ConfigPort::new(
            ComponentVersion {
                name: "test.component".into(),
                component_version: SPEC_VERSION,
                spec_version: SPEC_VERSION,
                uuid: [0; 16],
            },
            "audio_processor.test",
        );
        let mut krn = Kernel::new(cport);
        krn.register_port(
            PortConfig::new(Dir::Input, audio())
                .buffer_count(2)
                .buffer_size(16)
                .model(Box::new(PcmPortModel::new(PcmModeType::stereo_48k(0)))),
        );
        krn.register_port(
            PortConfig::new(Dir::Output, audio())
                .buffer_count(2)
                .buffer_size(16)
                .model(Box::new(PcmPortModel::new(PcmModeType::stereo_48k(1)))),
        );
        let srv = Servant::new(ComponentId(1), "krn-test".into());
        let mailbox = Mailbox::new(64);
        (krn, srv, mailbox)
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::kernel_fixture;
    use super::*;
    use omxil::{ComponentId, PcmModeType};

    #[test]
    fn test_register_port_maintains_init_aggregates() {
        let (krn, _srv, _mb) = kernel_fixture();
        let mut init = PortCountParam::new(Domain::Audio);
        krn.get_parameter(&mut init).unwrap();
        assert_eq!(init.param.ports, 2);
        assert_eq!(init.param.start_port_number, 0);

        let mut video = PortCountParam::new(Domain::Video);
        krn.get_parameter(&mut video).unwrap();
        assert_eq!(video.param.ports, 0);
    }

    #[test]
    fn test_parameter_routing_by_struct_port() {
        let (mut krn, mut srv, _mb) = kernel_fixture();

        let mut pcm = PcmModeType::stereo_48k(1);
        pcm.sampling_rate = 44_100;
        krn.set_parameter(&pcm, &mut srv).unwrap();

        let mut out = PcmModeType::stereo_48k(1);
        krn.get_parameter(&mut out).unwrap();
        assert_eq!(out.sampling_rate, 44_100);

        // Port 0 untouched.
        let mut out0 = PcmModeType::stereo_48k(0);
        krn.get_parameter(&mut out0).unwrap();
        assert_eq!(out0.sampling_rate, 48_000);

        let mut bad = PcmModeType::stereo_48k(7);
        assert_eq!(krn.get_parameter(&mut bad), Err(IlError::BadPortIndex));
    }

    #[test]
    fn test_all_populated_ignores_disabled_ports() {
        let (mut krn, mut srv, _mb) = kernel_fixture();
        assert!(!krn.all_populated());

        for _ in 0..2 {
            krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();
        }
        assert!(!krn.all_populated());

        krn.port_mut(1).set_enabled(false);
        assert!(krn.all_populated());
    }

    #[test]
    fn test_claim_marks_input_buffer() {
        let (mut krn, mut srv, _mb) = kernel_fixture();
        let (hdr, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        krn.ingress[0].push_back(hdr.clone());
        krn.port_mut(0).set_slot(&hdr, HeaderSlot::Ingress);
        krn.port_mut(0).store_mark(omxil::Mark {
            target_component: ComponentId(99),
            data: std::sync::Arc::new(0u8),
        });

        let claimed = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        assert!(std::sync::Arc::ptr_eq(&claimed, &hdr));
        assert!(claimed.lock().unwrap().mark.is_some());
        assert_eq!(krn.port(0).claimed_count(), 1);

        // MarkBuffer completion was issued.
        let effects = srv.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Event(crate::events::IlEvent::CmdComplete {
                command: omxil::Command::MarkBuffer,
                ..
            })
        )));
    }

    #[test]
    fn test_claim_out_of_range_returns_none() {
        let (mut krn, mut srv, _mb) = kernel_fixture();
        assert!(krn.claim_buffer(0, 3, &mut srv).unwrap().is_none());
    }

    #[test]
    fn test_population_status_reports_partial_pools() {
        let (mut krn, mut srv, _mb) = kernel_fixture();
        assert_eq!(
            krn.population_status(PortSelector::All),
            PopulationStatus::FullyUnpopulated
        );

        krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();
        assert_eq!(
            krn.population_status(PortSelector::Port(0)),
            PopulationStatus::Unpopulated {
                may_be_fully_unpopulated: true
            }
        );

        krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();
        assert_eq!(
            krn.population_status(PortSelector::Port(0)),
            PopulationStatus::FullyPopulated
        );
    }

    #[test]
    fn test_eglimage_attach_and_claim() {
        let (mut krn, mut srv, _mb) = kernel_fixture();
        let image: omxil::EglImage = std::sync::Arc::new(0x1234u64);
        let (hdr, _) = krn.use_egl_image(0, image, &mut srv).unwrap();

        let back = krn.claim_eglimage(0, &hdr).unwrap();
        assert_eq!(back.downcast_ref::<u64>(), Some(&0x1234));

        let foreign = omxil::new_header(omxil::BufferData::Unallocated, 0);
        assert!(matches!(
            krn.claim_eglimage(0, &foreign),
            Err(IlError::InsufficientResources)
        ));
    }
}
