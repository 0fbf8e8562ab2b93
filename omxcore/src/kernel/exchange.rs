//! Buffer-exchange engine: ingress/egress movement, egress flushing and
//! the stop/flush drains.

use tracing::{trace, warn};

use omxil::{BufferFlags, Dir, HeaderRef, IlError, IlResult, PortSelector, TunneledPortStatus};

use crate::events::IlEvent;
use crate::msg::Msg;
use crate::port::HeaderSlot;
use crate::servant::{Mailbox, Servant};

use super::Kernel;

impl Kernel {
    /// `EmptyThisBuffer`/`FillThisBuffer` dispatch: the header joins the
    /// port's ingress queue and the processor is signalled. A buffer
    /// arriving while its port is disabled or being disabled bounces
    /// straight back to its provider.
    pub fn buffer_arrived(
        &mut self,
        hdr: HeaderRef,
        dir: Dir,
        srv: &mut Servant,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        let pid = {
            let h = hdr.lock().expect("header poisoned");
            match dir {
                Dir::Input => h.input_port_index,
                Dir::Output => h.output_port_index,
            }
        }
        .ok_or(IlError::BadPortIndex)?;
        self.check_pid(pid)?;

        if !self.port(pid).owns(&hdr) {
            warn!(pid, "buffer does not belong to this port");
            return Err(IlError::BadParameter);
        }

        if !self.port(pid).is_enabled() || self.port(pid).is_being_disabled() {
            trace!(pid, "port not accepting buffers, bouncing");
            self.port_mut(pid).set_slot(&hdr, HeaderSlot::Egress);
            self.push_egress(pid, hdr);
            self.flush_egress(pid, srv);
            return Ok(());
        }

        self.port_mut(pid).set_slot(&hdr, HeaderSlot::Ingress);
        self.ingress_mut(pid).push_back(hdr);
        self.propagate_ingress(pid, mailbox);
        Ok(())
    }

    /// `Callback` dispatch: the processor released the header; it moves to
    /// egress and the queue is flushed.
    pub fn buffer_released(
        &mut self,
        hdr: HeaderRef,
        pid: u32,
        srv: &mut Servant,
    ) -> IlResult<()> {
        self.check_pid(pid)?;
        {
            let h = hdr.lock().expect("header poisoned");
            if !h.is_consistent() {
                warn!(pid, "released header has inconsistent fill state");
                return Err(IlError::Undefined);
            }
        }
        self.port_mut(pid).set_slot(&hdr, HeaderSlot::Egress);
        self.push_egress(pid, hdr);
        self.flush_egress(pid, srv);
        Ok(())
    }

    /// Signals the processor that a port has claimable buffers.
    pub fn propagate_ingress(&mut self, pid: u32, mailbox: &Mailbox) {
        if self.ingress_len(pid) == 0 {
            return;
        }
        if mailbox.post(Msg::BuffersReady { pid }).is_err() {
            warn!(pid, "buffers-ready lost, mailbox full");
        }
    }

    /// Dispatches every queued egress header to its consumer: the tunnel
    /// peer when present, the host callbacks otherwise. End-of-stream on a
    /// consumed input buffer raises `BufferFlag`; a mark addressed to this
    /// component is echoed as a `Mark` event instead of travelling on.
    pub fn flush_egress(&mut self, pid: u32, srv: &mut Servant) {
        let dir = self.port(pid).dir();
        let peer = self.port(pid).tunnel().map(|t| t.peer_component);
        while let Some(hdr) = self.egress_mut(pid).pop_front() {
            let (flags, mark_data) = {
                let mut h = hdr.lock().expect("header poisoned");
                let mark_data = match h.mark.take() {
                    Some(mark) if mark.target_component == srv.id() => Some(mark.data),
                    Some(mark) => {
                        h.mark = Some(mark);
                        None
                    }
                    None => None,
                };
                (h.flags, mark_data)
            };

            if let Some(data) = mark_data {
                srv.issue_event(IlEvent::Mark { data });
            }
            if dir == Dir::Input && flags.contains(BufferFlags::EOS) {
                self.mark_eos();
                srv.issue_event(IlEvent::BufferFlag {
                    pid,
                    flags: BufferFlags::EOS,
                });
            }

            let slot = if peer.is_some() {
                HeaderSlot::AtPeer
            } else {
                HeaderSlot::AtHome
            };
            self.port_mut(pid).set_slot(&hdr, slot);
            srv.issue_buf_callback(hdr, pid, dir, peer);
        }
    }

    /// Executing step: advertise the exchange phase, flush staged egress
    /// headers and signal pending ingress.
    pub fn transfer_and_process(
        &mut self,
        sel: PortSelector,
        srv: &mut Servant,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        if let PortSelector::Port(pid) = sel {
            self.check_pid(pid)?;
        }
        for pid in sel.iter(self.nports()) {
            self.update_tunneled_status(pid, TunneledPortStatus::ACCEPT_BUFFER_EXCHANGE, srv);
            self.flush_egress(pid, srv);
            self.propagate_ingress(pid, mailbox);
        }
        Ok(())
    }

    /// Executing/Pause-to-Idle step. Queued buffer messages are purged
    /// back onto the port queues so every buffer the component holds is
    /// accounted for; tunneled-supplier buffers come home to ingress,
    /// everything else drains to egress and out to its provider.
    pub fn stop_and_return(&mut self, srv: &mut Servant, mailbox: &Mailbox) -> IlResult<()> {
        self.clear_eos();
        self.harvest_queued_buffers(PortSelector::All, mailbox);

        for pid in 0..self.nports() {
            if !self.port(pid).is_enabled() || self.port(pid).buffer_count() == 0 {
                continue;
            }

            if self.port(pid).is_tunneled_supplier() {
                let moved = self.move_to_ingress(pid);
                trace!(pid, moved, "tunnel buffers moved to ingress");
                self.update_tunneled_status(pid, TunneledPortStatus::AWAIT_BUFFERS_RETURN, srv);
                continue;
            }

            let moved = self.move_to_egress(pid, false);
            trace!(pid, moved, "buffers moved to egress");
            self.flush_egress(pid, srv);
            self.flush_marks(pid, srv);
        }
        Ok(())
    }

    /// Per-port half of the `Flush` command: drain everything this
    /// component holds for `pid` back to its provider (clearing the
    /// payloads), or back home for a supplier port.
    pub fn flush_port(&mut self, pid: u32, srv: &mut Servant, mailbox: &Mailbox) -> IlResult<()> {
        self.check_pid(pid)?;
        self.clear_eos();
        self.harvest_queued_buffers(PortSelector::Port(pid), mailbox);

        if self.port(pid).is_tunneled_supplier() {
            self.move_to_ingress(pid);
        } else {
            self.move_to_egress(pid, true);
            self.flush_egress(pid, srv);
        }
        self.flush_marks(pid, srv);
        Ok(())
    }

    /// Pulls queued `EmptyThisBuffer`/`FillThisBuffer` messages back onto
    /// the ingress queues and queued `Callback` messages onto the egress
    /// queues, so a drain sees every header the component was sent.
    pub fn harvest_queued_buffers(&mut self, sel: PortSelector, mailbox: &Mailbox) {
        let removed = mailbox.remove_if(|msg| match msg {
            Msg::EmptyThisBuffer { .. } | Msg::FillThisBuffer { .. } | Msg::Callback { .. } => {
                msg.buffer_port().is_some_and(|pid| sel.contains(pid))
            }
            _ => false,
        });
        for msg in removed {
            match msg {
                Msg::EmptyThisBuffer { hdr } | Msg::FillThisBuffer { hdr } => {
                    let pid = {
                        let h = hdr.lock().expect("header poisoned");
                        h.input_port_index.or(h.output_port_index)
                    };
                    if let Some(pid) = pid {
                        if self.check_pid(pid).is_ok() && self.port(pid).owns(&hdr) {
                            self.port_mut(pid).set_slot(&hdr, HeaderSlot::Ingress);
                            self.ingress_mut(pid).push_back(hdr);
                        }
                    }
                }
                Msg::Callback { hdr, pid, .. } => {
                    if self.check_pid(pid).is_ok() && self.port(pid).owns(&hdr) {
                        self.port_mut(pid).set_slot(&hdr, HeaderSlot::Egress);
                        self.push_egress(pid, hdr);
                    }
                }
                _ => {}
            }
        }
    }

    /// Moves every ingress header of `pid` to egress. Returns how many
    /// moved.
    pub fn move_to_egress(&mut self, pid: u32, clear: bool) -> usize {
        let headers: Vec<HeaderRef> = self.ingress_mut(pid).drain(..).collect();
        let moved = headers.len();
        for hdr in headers {
            if clear {
                hdr.lock().expect("header poisoned").clear();
            }
            self.port_mut(pid).set_slot(&hdr, HeaderSlot::Egress);
            self.push_egress(pid, hdr);
        }
        moved
    }

    /// Moves every egress header of `pid` back to ingress (supplier ports
    /// keep their buffers on a stop or flush).
    pub fn move_to_ingress(&mut self, pid: u32) -> usize {
        let headers: Vec<HeaderRef> = self.egress_mut(pid).drain(..).collect();
        let moved = headers.len();
        for hdr in headers {
            self.port_mut(pid).set_slot(&hdr, HeaderSlot::Ingress);
            self.ingress_mut(pid).push_back(hdr);
        }
        moved
    }

    /// Fails every pending mark of `pid`: each one completes its
    /// `MarkBuffer` command with `NotReady`.
    pub fn flush_marks(&mut self, pid: u32, srv: &mut Servant) {
        for _mark in self.port_mut(pid).take_marks() {
            self.complete_mark_buffer(pid, srv, Some(IlError::NotReady));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests_support::kernel_fixture;
    use crate::servant::Effect;
    use omxil::ComponentId;
    use std::sync::Arc;

    #[test]
    fn test_buffer_arrival_keeps_fifo_per_port() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (h1, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();
        let (h2, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        krn.buffer_arrived(h1.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();
        krn.buffer_arrived(h2.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();

        let first = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        let second = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &h1));
        assert!(Arc::ptr_eq(&second, &h2));
    }

    #[test]
    fn test_release_emits_eos_flag_event() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (hdr, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        hdr.lock().unwrap().flags = BufferFlags::EOS;
        krn.buffer_arrived(hdr.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();
        let claimed = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        srv.take_effects();

        krn.buffer_released(claimed, 0, &mut srv).unwrap();
        assert!(krn.eos());

        let effects = srv.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Event(IlEvent::BufferFlag { pid: 0, flags }) if flags.contains(BufferFlags::EOS)
        )));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmptyBufferDone(_))));
    }

    #[test]
    fn test_own_mark_is_consumed_not_forwarded() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (hdr, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        hdr.lock().unwrap().mark = Some(omxil::Mark {
            target_component: srv.id(),
            data: Arc::new(42u32),
        });
        krn.buffer_arrived(hdr.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();
        let claimed = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        srv.take_effects();

        krn.buffer_released(claimed, 0, &mut srv).unwrap();
        let effects = srv.take_effects();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Event(IlEvent::Mark { .. }))));
        assert!(hdr.lock().unwrap().mark.is_none());
    }

    #[test]
    fn test_foreign_mark_travels_on() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (hdr, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        hdr.lock().unwrap().mark = Some(omxil::Mark {
            target_component: ComponentId(0xdead),
            data: Arc::new(0u8),
        });
        krn.buffer_arrived(hdr.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();
        let claimed = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        srv.take_effects();

        krn.buffer_released(claimed, 0, &mut srv).unwrap();
        let effects = srv.take_effects();
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::Event(IlEvent::Mark { .. }))));
        assert!(hdr.lock().unwrap().mark.is_some());
    }

    #[test]
    fn test_disabled_port_bounces_buffers() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (hdr, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();
        krn.port_mut(0).set_enabled(false);

        krn.buffer_arrived(hdr, Dir::Input, &mut srv, &mailbox)
            .unwrap();
        assert_eq!(krn.ingress_len(0), 0);

        let effects = srv.take_effects();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmptyBufferDone(_))));
    }

    #[test]
    fn test_harvest_returns_queued_traffic_to_port_queues() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (h1, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();
        let (h2, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        // One undelivered ETB and one undelivered processor callback.
        mailbox.post(Msg::EmptyThisBuffer { hdr: h1.clone() }).unwrap();
        krn.buffer_arrived(h2.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();
        let claimed = krn.claim_buffer(0, 0, &mut srv).unwrap().unwrap();
        mailbox
            .post(Msg::Callback {
                hdr: claimed,
                pid: 0,
                dir: Dir::Input,
            })
            .unwrap();

        krn.harvest_queued_buffers(PortSelector::All, &mailbox);
        assert_eq!(krn.ingress_len(0), 1);
        assert_eq!(krn.egress_len(0), 1);
        assert_eq!(krn.port(0).claimed_count(), 0);
        assert!(krn.port(0).conservation_holds());
    }

    #[test]
    fn test_flush_clears_payloads() {
        let (mut krn, mut srv, mailbox) = kernel_fixture();
        let (hdr, _) = krn.use_buffer(0, vec![0; 16], &mut srv).unwrap();

        hdr.lock().unwrap().filled_len = 12;
        krn.buffer_arrived(hdr.clone(), Dir::Input, &mut srv, &mailbox)
            .unwrap();

        krn.flush_port(0, &mut srv, &mailbox).unwrap();
        assert_eq!(hdr.lock().unwrap().filled_len, 0);
        let effects = srv.take_effects();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmptyBufferDone(_))));
    }
}
