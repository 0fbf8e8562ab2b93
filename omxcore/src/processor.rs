//! The processor contract: the user-supplied half of a component.
//!
//! A processor implements the media logic and nothing else. It observes
//! buffers through [`ProcessorContext::claim_buffer`] and returns them
//! through [`ProcessorContext::release_buffer`]; it never sees the
//! ingress/egress queues themselves. Every hook runs on the component task
//! and must not block: long-running work is chunked across `buffers_ready`
//! invocations, timers and I/O watchers.

use std::time::Duration;

use async_trait::async_trait;

use omxil::{
    ComponentId, EglImage, HeaderRef, IlError, IlResult, IlStruct, Index, PortSelector,
};

use crate::events::IlEvent;
use crate::kernel::Kernel;
use crate::msg::{Msg, PluggableEvent};
use crate::port::Port;
use crate::servant::{Mailbox, Servant};
use crate::watchers::{IoEvents, WatcherKey, Watchers};

/// Kernel-facing capabilities handed to every processor hook.
pub struct ProcessorContext<'a> {
    pub(crate) kernel: &'a mut Kernel,
    pub(crate) servant: &'a mut Servant,
    pub(crate) watchers: &'a mut Watchers,
    pub(crate) mailbox: &'a Mailbox,
}

impl ProcessorContext<'_> {
    pub fn component_id(&self) -> ComponentId {
        self.servant.id()
    }

    pub fn component_name(&self) -> &str {
        self.servant.name()
    }

    /// Takes `ingress[pos]` of `pid` out of the kernel; `None` when the
    /// position is empty. Increments the port's claimed count.
    pub fn claim_buffer(&mut self, pid: u32, pos: usize) -> IlResult<Option<HeaderRef>> {
        self.kernel.claim_buffer(pid, pos, self.servant)
    }

    /// Hands a buffer back. The header moves to egress asynchronously,
    /// through a `Callback` message on the component mailbox.
    pub fn release_buffer(&mut self, pid: u32, hdr: HeaderRef) -> IlResult<()> {
        self.kernel.check_pid(pid)?;
        let dir = self.kernel.port(pid).dir();
        self.mailbox
            .post(Msg::Callback { hdr, pid, dir })
            .map_err(|_| IlError::InsufficientResources)
    }

    pub fn claim_eglimage(&self, pid: u32, hdr: &HeaderRef) -> IlResult<EglImage> {
        self.kernel.claim_eglimage(pid, hdr)
    }

    pub fn port(&self, pid: u32) -> IlResult<&Port> {
        self.kernel.check_pid(pid)?;
        Ok(self.kernel.port(pid))
    }

    pub fn nports(&self) -> u32 {
        self.kernel.nports()
    }

    pub fn ingress_len(&self, pid: u32) -> usize {
        self.kernel.ingress_len(pid)
    }

    /// Ports that currently have claimable buffers.
    pub fn ports_with_input(&self) -> Vec<u32> {
        self.kernel.ports_with_ingress()
    }

    pub fn eos_seen(&self) -> bool {
        self.kernel.eos()
    }

    pub fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        self.kernel.get_parameter(value)
    }

    pub fn issue_event(&mut self, event: IlEvent) {
        self.servant.issue_event(event);
    }

    pub fn issue_err_event(&mut self, error: IlError) {
        self.servant.issue_err_event(error);
    }

    // Event sources. Ids are managed by the watcher registry; a stopped or
    // restarted watcher silently swallows late deliveries.

    pub fn timer_init(&mut self) -> WatcherKey {
        self.watchers.timer_watcher_init()
    }

    pub fn timer_start(
        &mut self,
        key: WatcherKey,
        after: Duration,
        repeat: Option<Duration>,
    ) -> IlResult<()> {
        self.watchers.timer_watcher_start(key, after, repeat)
    }

    pub fn timer_restart(&mut self, key: WatcherKey) -> IlResult<()> {
        self.watchers.timer_watcher_restart(key)
    }

    pub fn timer_stop(&mut self, key: WatcherKey) -> IlResult<()> {
        self.watchers.timer_watcher_stop(key)
    }

    pub fn timer_destroy(&mut self, key: WatcherKey) {
        self.watchers.timer_watcher_destroy(key)
    }

    pub fn io_init(&mut self, fd: std::os::fd::RawFd, events: IoEvents, only_once: bool) -> WatcherKey {
        self.watchers.io_watcher_init(fd, events, only_once)
    }

    pub fn io_start(&mut self, key: WatcherKey) -> IlResult<()> {
        self.watchers.io_watcher_start(key)
    }

    pub fn io_stop(&mut self, key: WatcherKey) -> IlResult<()> {
        self.watchers.io_watcher_stop(key)
    }

    pub fn io_destroy(&mut self, key: WatcherKey) {
        self.watchers.io_watcher_destroy(key)
    }
}

/// User-supplied component logic.
///
/// Every hook defaults to a no-op success so a processor only implements
/// what its media path needs. Hooks are called by the component glue in
/// the order the state-set protocol prescribes; `buffers_ready` is never
/// called in Pause, during a transition to Idle, or for a disabled port.
#[allow(unused_variables)]
#[async_trait]
pub trait Processor: Send {
    async fn allocate_resources(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        sel: PortSelector,
    ) -> IlResult<()> {
        Ok(())
    }

    async fn deallocate_resources(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        Ok(())
    }

    async fn prepare_to_transfer(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        sel: PortSelector,
    ) -> IlResult<()> {
        Ok(())
    }

    async fn transfer_and_process(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        sel: PortSelector,
    ) -> IlResult<()> {
        Ok(())
    }

    /// Return every claimed buffer through
    /// [`ProcessorContext::release_buffer`] before coming back.
    async fn stop_and_return(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        Ok(())
    }

    /// There is at least one claimable buffer on some port.
    async fn buffers_ready(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        Ok(())
    }

    async fn pause(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        Ok(())
    }

    async fn resume(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        Ok(())
    }

    /// Release any claimed buffers of `pid`; the kernel drains the rest.
    async fn port_flush(&mut self, ctx: &mut ProcessorContext<'_>, pid: u32) -> IlResult<()> {
        Ok(())
    }

    async fn port_disable(&mut self, ctx: &mut ProcessorContext<'_>, pid: u32) -> IlResult<()> {
        Ok(())
    }

    async fn port_enable(&mut self, ctx: &mut ProcessorContext<'_>, pid: u32) -> IlResult<()> {
        Ok(())
    }

    /// A `SetConfig` the kernel accepted, for the processor to react to.
    async fn config_change(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        pid: Option<u32>,
        index: Index,
    ) -> IlResult<()> {
        Ok(())
    }

    async fn io_ready(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        key: WatcherKey,
        fd: std::os::fd::RawFd,
        readiness: IoEvents,
    ) -> IlResult<()> {
        Ok(())
    }

    async fn timer_ready(&mut self, ctx: &mut ProcessorContext<'_>, key: WatcherKey) -> IlResult<()> {
        Ok(())
    }

    async fn stat_ready(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        key: WatcherKey,
        events: u32,
    ) -> IlResult<()> {
        Ok(())
    }

    async fn receive_pluggable_event(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        event: Box<dyn PluggableEvent>,
    ) -> IlResult<()> {
        event.run();
        Ok(())
    }
}

/// Processor that does nothing; stands in where a component kind has no
/// media logic of its own.
pub struct NullProcessor;

#[async_trait]
impl Processor for NullProcessor {}
