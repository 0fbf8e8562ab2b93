//! Component assembly: the host-facing handle, the message dispatch glue
//! and the per-component task.
//!
//! A [`Component`] is a cheap-clone handle over the single cooperative
//! task that owns the kernel, the FSM, the processor and the watcher
//! registry. Host API calls validate synchronously, then either act under
//! the component lock or post a message; the task dispatches queued
//! messages one at a time. Side effects (host callbacks, peer traffic)
//! run strictly after the lock is released.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use omxil::{
    BufferSupplier, CompBufferSupplier, ComponentId, ComponentVersion, Dir, EglImage, HeaderRef,
    IlError, IlResult, IlStruct, Index, Mark, PortDefinition, PortSelector, State, TunnelSetup,
    TunneledPortStatus,
};

use crate::events::HostCallbacks;
use crate::fsm::{Fsm, FsmState, TransitionKind};
use crate::kernel::{Kernel, SetConfigAction};
use crate::msg::{CommandReq, Msg, PluggableEvent};
use crate::port::Tunnel;
use crate::processor::{Processor, ProcessorContext};
use crate::runtime::{ComponentInfo, RuntimeShared};
use crate::servant::{Effect, Mailbox, Servant};
use crate::watchers::Watchers;

/// Mutable heart of a component; only ever touched under the component
/// lock.
pub(crate) struct Core {
    pub(crate) kernel: Kernel,
    pub(crate) fsm: Fsm,
    pub(crate) servant: Servant,
    pub(crate) watchers: Watchers,
    pub(crate) processor: Box<dyn Processor>,
    /// False between a state-set entering its substate and its queued
    /// micro-step running; a transition never completes before its
    /// micro-step has been given to the kernel and the processor.
    pub(crate) transition_steps_done: bool,
}

impl Core {
    fn prc_split<'a>(
        &'a mut self,
        mailbox: &'a Mailbox,
    ) -> (&'a mut Box<dyn Processor>, ProcessorContext<'a>) {
        let Core {
            kernel,
            servant,
            watchers,
            processor,
            ..
        } = self;
        (
            processor,
            ProcessorContext {
                kernel,
                servant,
                watchers,
                mailbox,
            },
        )
    }

    // -----------------------------------------------------------------
    // Message dispatch
    // -----------------------------------------------------------------

    pub(crate) async fn dispatch(&mut self, msg: Msg, mailbox: &Mailbox) {
        trace!(component = %self.servant.name(), ?msg, "dispatch");
        let result = match msg {
            Msg::SendCommand(req) => self.dispatch_command(req, mailbox).await,
            Msg::EmptyThisBuffer { hdr } => self.dispatch_buffer(hdr, Dir::Input, mailbox).await,
            Msg::FillThisBuffer { hdr } => self.dispatch_buffer(hdr, Dir::Output, mailbox).await,
            Msg::Callback { hdr, pid, .. } => self.dispatch_callback(hdr, pid, mailbox).await,
            Msg::Pluggable { event } => self.dispatch_pluggable(event, mailbox).await,
            Msg::BuffersReady { pid } => self.dispatch_buffers_ready(pid, mailbox).await,
            Msg::IoReady {
                watcher,
                id,
                readiness,
            } => self.dispatch_io_ready(watcher, id, readiness, mailbox).await,
            Msg::TimerReady { watcher, id } => self.dispatch_timer_ready(watcher, id, mailbox).await,
            Msg::StatReady { watcher, id, events } => {
                self.dispatch_stat_ready(watcher, id, events, mailbox).await
            }
        };
        if let Err(error) = result {
            if !error.is_benign() {
                self.servant.issue_err_event(error);
            }
        }
    }

    async fn dispatch_command(&mut self, req: CommandReq, mailbox: &Mailbox) -> IlResult<()> {
        debug!(component = %self.servant.name(), command = %req.kind(), "command");
        match req {
            CommandReq::StateSet(state) => self.dispatch_state_set(state, mailbox).await,
            CommandReq::Flush(sel) => self.dispatch_flush(sel, mailbox).await,
            CommandReq::PortDisable(sel) => self.dispatch_port_disable(sel, mailbox).await,
            CommandReq::PortEnable(sel) => self.dispatch_port_enable(sel, mailbox).await,
            CommandReq::MarkBuffer(pid, mark) => self.dispatch_mark_buffer(pid, mark),
        }
    }

    /// Runs the kernel/processor micro-steps of a state transition the
    /// FSM already entered (the substate is set synchronously by
    /// `SendCommand`, the heavy lifting happens here on the component
    /// task).
    async fn dispatch_state_set(&mut self, requested: State, mailbox: &Mailbox) -> IlResult<()> {
        let kind = match (self.fsm.state(), requested) {
            (FsmState::LoadedToIdle, State::Idle) => TransitionKind::LoadedToIdle,
            (FsmState::IdleToLoaded, State::Loaded) => TransitionKind::IdleToLoaded,
            (FsmState::IdleToExecuting, State::Executing) => TransitionKind::IdleToExe,
            (FsmState::PauseToExecuting, State::Executing) => TransitionKind::PauseToExe,
            (FsmState::ExecutingToIdle | FsmState::PauseToIdle, State::Idle) => {
                TransitionKind::ExeOrPauseToIdle
            }
            (FsmState::ExecutingToPause | FsmState::IdleToPause, State::Pause) => {
                TransitionKind::ExeOrIdleToPause
            }
            (FsmState::Executing, State::Executing) => TransitionKind::ExeToExe,
            (state, _) => {
                // The transition was already completed or superseded by
                // the time the micro-step message surfaced.
                warn!(?state, %requested, "state-set micro-step without a matching substate");
                return Ok(());
            }
        };
        self.transition_steps_done = true;
        match kind {
            TransitionKind::Immediate => Ok(()),
            TransitionKind::LoadedToIdle => {
                self.kernel
                    .allocate_resources(PortSelector::All, &mut self.servant)?;
                {
                    let (prc, mut ctx) = self.prc_split(mailbox);
                    prc.allocate_resources(&mut ctx, PortSelector::All).await?;
                }
                self.complete_ongoing_transitions(mailbox).await
            }
            TransitionKind::IdleToLoaded => {
                self.kernel.deallocate_resources(&mut self.servant)?;
                {
                    let (prc, mut ctx) = self.prc_split(mailbox);
                    prc.deallocate_resources(&mut ctx).await?;
                }
                self.complete_ongoing_transitions(mailbox).await
            }
            TransitionKind::IdleToExe => {
                self.kernel.prepare_to_transfer(PortSelector::All)?;
                {
                    let (prc, mut ctx) = self.prc_split(mailbox);
                    prc.prepare_to_transfer(&mut ctx, PortSelector::All).await?;
                }
                self.complete_state_transition(State::Executing, mailbox).await
            }
            TransitionKind::PauseToExe => {
                {
                    let (prc, mut ctx) = self.prc_split(mailbox);
                    prc.resume(&mut ctx).await?;
                }
                self.complete_state_transition(State::Executing, mailbox).await
            }
            TransitionKind::ExeToExe => {
                // Same-state Executing re-runs the transfer machinery; no
                // completion event.
                self.kernel
                    .transfer_and_process(PortSelector::All, &mut self.servant, mailbox)?;
                let (prc, mut ctx) = self.prc_split(mailbox);
                prc.transfer_and_process(&mut ctx, PortSelector::All).await
            }
            TransitionKind::ExeOrPauseToIdle => {
                {
                    let (prc, mut ctx) = self.prc_split(mailbox);
                    prc.stop_and_return(&mut ctx).await?;
                }
                self.kernel.stop_and_return(&mut self.servant, mailbox)?;
                self.complete_ongoing_transitions(mailbox).await
            }
            TransitionKind::ExeOrIdleToPause => {
                {
                    let (prc, mut ctx) = self.prc_split(mailbox);
                    prc.pause(&mut ctx).await?;
                }
                self.complete_state_transition(State::Pause, mailbox).await
            }
            TransitionKind::Invalid => Ok(()),
        }
    }

    /// Leaves the pending substate, emits the completion event and runs
    /// the per-state epilogue.
    async fn complete_state_transition(&mut self, to: State, mailbox: &Mailbox) -> IlResult<()> {
        let from = self.fsm.state();
        self.fsm.complete_transition(to)?;
        self.servant.issue_trans_event(to, None);

        match (from, to) {
            (FsmState::LoadedToIdle, State::Idle) => {
                // Allocation phase over.
                self.kernel
                    .reset_tunneled_ports_status(TunneledPortStatus::ACCEPT_USE_BUFFER);
            }
            (FsmState::ExecutingToIdle | FsmState::PauseToIdle, State::Idle) => {
                self.kernel
                    .reset_tunneled_ports_status(TunneledPortStatus::AWAIT_BUFFERS_RETURN);
                self.kernel
                    .reset_tunneled_ports_status(TunneledPortStatus::ACCEPT_BUFFER_EXCHANGE);
            }
            (_, State::Executing) => {
                self.kernel
                    .transfer_and_process(PortSelector::All, &mut self.servant, mailbox)?;
                let (prc, mut ctx) = self.prc_split(mailbox);
                prc.transfer_and_process(&mut ctx, PortSelector::All).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Checks the completion predicate of whatever transition is in
    /// flight; called after every operation that can clear a dependency.
    pub(crate) async fn complete_ongoing_transitions(&mut self, mailbox: &Mailbox) -> IlResult<()> {
        if !self.transition_steps_done {
            return Ok(());
        }
        match self.fsm.state() {
            FsmState::LoadedToIdle if self.kernel.all_populated() => {
                self.complete_state_transition(State::Idle, mailbox).await
            }
            FsmState::IdleToLoaded if self.kernel.all_depopulated() => {
                self.complete_state_transition(State::Loaded, mailbox).await
            }
            FsmState::ExecutingToIdle | FsmState::PauseToIdle
                if self.kernel.all_buffers_returned()
                    && self.kernel.all_tunnel_buffers_home() =>
            {
                self.complete_state_transition(State::Idle, mailbox).await
            }
            _ => Ok(()),
        }
    }

    async fn dispatch_flush(&mut self, sel: PortSelector, mailbox: &Mailbox) -> IlResult<()> {
        if let PortSelector::Port(pid) = sel {
            self.kernel.check_pid(pid)?;
        }
        self.kernel
            .set_pending_completions(sel.iter(self.kernel.nports()).count() as u32);
        for pid in sel.iter(self.kernel.nports()) {
            {
                let (prc, mut ctx) = self.prc_split(mailbox);
                prc.port_flush(&mut ctx, pid).await?;
            }
            self.kernel.flush_port(pid, &mut self.servant, mailbox)?;
            self.servant
                .issue_cmd_event(omxil::Command::Flush, pid, None);
        }
        Ok(())
    }

    async fn dispatch_port_disable(&mut self, sel: PortSelector, mailbox: &Mailbox) -> IlResult<()> {
        if let PortSelector::Port(pid) = sel {
            self.kernel.check_pid(pid)?;
        }
        self.kernel
            .set_pending_completions(sel.iter(self.kernel.nports()).count() as u32);
        for pid in sel.iter(self.kernel.nports()) {
            if !self.kernel.port(pid).is_enabled() {
                // Already disabled; complete right away.
                self.servant
                    .issue_cmd_event(omxil::Command::PortDisable, pid, None);
                continue;
            }
            self.kernel.port_mut(pid).set_enabled(false);
            self.kernel.port_mut(pid).set_being_disabled(true);

            {
                let (prc, mut ctx) = self.prc_split(mailbox);
                prc.port_disable(&mut ctx, pid).await?;
            }
            self.kernel
                .harvest_queued_buffers(PortSelector::Port(pid), mailbox);

            if self.kernel.port(pid).is_tunneled_supplier() {
                self.kernel.depopulate_and_detach(pid, &mut self.servant);
            } else {
                self.kernel.move_to_egress(pid, false);
                self.kernel.flush_egress(pid, &mut self.servant);
            }
            self.kernel.flush_marks(pid, &mut self.servant);

            if self.kernel.port(pid).buffer_count() == 0 {
                self.kernel
                    .complete_port_disable(pid, &mut self.servant, None);
            }
            // Otherwise the disable completes when the last FreeBuffer or
            // peer detach lands.
        }
        self.complete_ongoing_transitions(mailbox).await
    }

    async fn dispatch_port_enable(&mut self, sel: PortSelector, mailbox: &Mailbox) -> IlResult<()> {
        if let PortSelector::Port(pid) = sel {
            self.kernel.check_pid(pid)?;
        }
        self.kernel
            .set_pending_completions(sel.iter(self.kernel.nports()).count() as u32);
        for pid in sel.iter(self.kernel.nports()) {
            if self.kernel.port(pid).is_enabled() {
                self.servant
                    .issue_cmd_event(omxil::Command::PortEnable, pid, None);
                continue;
            }
            self.kernel.port_mut(pid).set_enabled(true);
            self.kernel.port_mut(pid).set_being_enabled(true);

            {
                let (prc, mut ctx) = self.prc_split(mailbox);
                prc.port_enable(&mut ctx, pid).await?;
            }

            match self.fsm.current_state() {
                // No population needed before the Loaded-to-Idle phase.
                State::Loaded | State::WaitForResources => {
                    self.kernel.complete_port_enable(pid, &mut self.servant, None);
                }
                _ => {
                    self.kernel
                        .allocate_resources(PortSelector::Port(pid), &mut self.servant)?;
                    self.after_buffer_population(pid, mailbox).await?;
                }
            }
        }
        Ok(())
    }

    /// Followup after a port gained buffers: a re-enabled port that
    /// finished populating while the component is executing joins the
    /// transfer phase immediately.
    pub(crate) async fn after_buffer_population(
        &mut self,
        pid: u32,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        if self.kernel.port(pid).is_being_enabled() || !self.kernel.port(pid).is_populated() {
            return Ok(());
        }
        if self.fsm.state() == FsmState::Executing {
            self.kernel
                .transfer_and_process(PortSelector::Port(pid), &mut self.servant, mailbox)?;
            let (prc, mut ctx) = self.prc_split(mailbox);
            prc.transfer_and_process(&mut ctx, PortSelector::Port(pid))
                .await?;
        }
        Ok(())
    }

    fn dispatch_mark_buffer(&mut self, pid: u32, mark: Mark) -> IlResult<()> {
        self.kernel.check_pid(pid)?;
        self.kernel.port_mut(pid).store_mark(mark);
        Ok(())
    }

    async fn dispatch_buffer(&mut self, hdr: HeaderRef, dir: Dir, mailbox: &Mailbox) -> IlResult<()> {
        self.kernel
            .buffer_arrived(hdr, dir, &mut self.servant, mailbox)?;
        self.complete_ongoing_transitions(mailbox).await
    }

    async fn dispatch_callback(
        &mut self,
        hdr: HeaderRef,
        pid: u32,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        self.kernel.buffer_released(hdr, pid, &mut self.servant)?;
        self.complete_ongoing_transitions(mailbox).await
    }

    async fn dispatch_pluggable(
        &mut self,
        event: Box<dyn PluggableEvent>,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        let (prc, mut ctx) = self.prc_split(mailbox);
        prc.receive_pluggable_event(&mut ctx, event).await
    }

    /// Buffers-ready gating: the processor is not poked in Pause, while
    /// winding down to Idle, or for ports that are (being) disabled.
    async fn dispatch_buffers_ready(&mut self, pid: u32, mailbox: &Mailbox) -> IlResult<()> {
        self.kernel.check_pid(pid)?;
        let now = self.fsm.state();
        if matches!(
            now,
            FsmState::Pause | FsmState::ExecutingToIdle | FsmState::PauseToIdle
        ) {
            return Ok(());
        }
        let port = self.kernel.port(pid);
        if !port.is_enabled() || port.is_being_disabled() {
            return Ok(());
        }
        let (prc, mut ctx) = self.prc_split(mailbox);
        prc.buffers_ready(&mut ctx).await
    }

    async fn dispatch_io_ready(
        &mut self,
        watcher: crate::watchers::WatcherKey,
        id: u64,
        readiness: crate::watchers::IoEvents,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        if !self.watchers.is_current(watcher, id) {
            trace!(watcher, id, "stale io event ignored");
            return Ok(());
        }
        if self.watchers.fires_once(watcher) {
            self.watchers.note_fired(watcher);
        }
        let fd = self.watchers.io_fd(watcher).unwrap_or(-1);
        let (prc, mut ctx) = self.prc_split(mailbox);
        prc.io_ready(&mut ctx, watcher, fd, readiness).await
    }

    async fn dispatch_timer_ready(
        &mut self,
        watcher: crate::watchers::WatcherKey,
        id: u64,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        if !self.watchers.is_current(watcher, id) {
            trace!(watcher, id, "stale timer event ignored");
            return Ok(());
        }
        let (prc, mut ctx) = self.prc_split(mailbox);
        prc.timer_ready(&mut ctx, watcher).await
    }

    async fn dispatch_stat_ready(
        &mut self,
        watcher: crate::watchers::WatcherKey,
        id: u64,
        events: u32,
        mailbox: &Mailbox,
    ) -> IlResult<()> {
        if !self.watchers.is_current(watcher, id) {
            return Ok(());
        }
        let (prc, mut ctx) = self.prc_split(mailbox);
        prc.stat_ready(&mut ctx, watcher, events).await
    }
}

pub(crate) struct ComponentInner {
    pub(crate) id: ComponentId,
    pub(crate) name: String,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) core: Mutex<Core>,
    pub(crate) cancel: CancellationToken,
    pub(crate) callbacks: StdMutex<Option<Arc<dyn HostCallbacks>>>,
    pub(crate) runtime: Weak<RuntimeShared>,
    pub(crate) task: StdMutex<Option<JoinHandle<()>>>,
}

/// Host-facing handle of one component instance.
#[derive(Clone)]
pub struct Component {
    pub(crate) inner: Arc<ComponentInner>,
}

impl Component {
    pub fn id(&self) -> ComponentId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers the host callbacks. Must happen before any command that
    /// can emit events; events raised without callbacks are dropped.
    pub fn set_callbacks(&self, callbacks: Arc<dyn HostCallbacks>) {
        *self.inner.callbacks.lock().expect("callbacks poisoned") = Some(callbacks);
    }

    pub async fn get_state(&self) -> State {
        self.inner.core.lock().await.fsm.current_state()
    }

    pub async fn get_component_version(&self) -> ComponentVersion {
        self.inner
            .core
            .lock()
            .await
            .kernel
            .config_port()
            .component_version()
            .clone()
    }

    /// Plain-data identity of this instance (name plus current role).
    pub async fn info(&self) -> ComponentInfo {
        let role = self
            .inner
            .core
            .lock()
            .await
            .kernel
            .config_port()
            .role()
            .to_string();
        ComponentInfo {
            name: self.inner.name.clone(),
            role,
        }
    }

    /// `SendCommand`. A state-set request moves the FSM into its
    /// transition substate synchronously (so follow-up calls like
    /// `UseBuffer` see it) and queues the kernel/processor micro-steps at
    /// urgent priority; the other commands validate their port index and
    /// queue whole.
    pub async fn send_command(&self, req: CommandReq) -> IlResult<()> {
        match &req {
            CommandReq::StateSet(state) => {
                let state = *state;
                let effects = {
                    let mut core = self.inner.core.lock().await;
                    let kind = core.fsm.begin_transition(state)?;
                    if kind == TransitionKind::Immediate {
                        core.fsm.settle(state);
                        core.servant.issue_trans_event(state, None);
                    } else {
                        if core.fsm.in_substate() {
                            core.transition_steps_done = false;
                        }
                        self.inner
                            .mailbox
                            .post(Msg::SendCommand(CommandReq::StateSet(state)))?;
                    }
                    core.servant.take_effects()
                };
                self.drain_effects(effects).await;
                return Ok(());
            }
            CommandReq::Flush(PortSelector::Port(pid))
            | CommandReq::PortDisable(PortSelector::Port(pid))
            | CommandReq::PortEnable(PortSelector::Port(pid))
            | CommandReq::MarkBuffer(pid, _) => {
                self.inner.core.lock().await.kernel.check_pid(*pid)?;
            }
            _ => {}
        }
        self.inner.mailbox.post(Msg::SendCommand(req))
    }

    pub async fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        self.inner.core.lock().await.kernel.get_parameter(value)
    }

    /// `SetParameter` is legal in Loaded and WaitForResources, or towards
    /// a disabled port.
    pub async fn set_parameter(&self, value: &dyn IlStruct) -> IlResult<()> {
        let effects = {
            let mut core = self.inner.core.lock().await;
            let state_ok = matches!(
                core.fsm.current_state(),
                State::Loaded | State::WaitForResources
            );
            if !state_ok {
                let port_disabled = value
                    .port_index()
                    .is_some_and(|pid| {
                        core.kernel.check_pid(pid).is_ok() && !core.kernel.port(pid).is_enabled()
                    });
                if !port_disabled {
                    return Err(IlError::IncorrectStateOperation);
                }
            }
            let Core { kernel, servant, .. } = &mut *core;
            kernel.set_parameter(value, servant)?;
            core.servant.take_effects()
        };
        self.drain_effects(effects).await;
        Ok(())
    }

    pub async fn get_config(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        self.inner.core.lock().await.kernel.get_config(value)
    }

    /// `SetConfig` delegates to the kernel and then either notifies the
    /// processor of the change or, for tunneled-port status updates that
    /// unlatch a transition phase, re-runs the pending micro-step.
    pub async fn set_config(&self, value: &dyn IlStruct) -> IlResult<()> {
        let effects = {
            let mut core = self.inner.core.lock().await;
            let action = core.kernel.set_config(value)?;
            match action {
                SetConfigAction::ForwardToProcessor => {
                    let pid = value.port_index();
                    let index = value.index();
                    let (prc, mut ctx) = core.prc_split(&self.inner.mailbox);
                    prc.config_change(&mut ctx, pid, index).await?;
                }
                SetConfigAction::StatusUpdate => {
                    core.tunneled_ports_status_update(&self.inner.mailbox).await?;
                }
                SetConfigAction::Nothing => {}
            }
            core.servant.take_effects()
        };
        self.drain_effects(effects).await;
        Ok(())
    }

    pub async fn get_extension_index(&self, name: &str) -> IlResult<Index> {
        self.inner.core.lock().await.kernel.get_extension_index(name)
    }

    /// `UseBuffer`: legal while a Loaded-to-Idle transition is pending or
    /// towards a (being-)disabled port.
    pub async fn use_buffer(&self, pid: u32, buffer: Vec<u8>) -> IlResult<HeaderRef> {
        let (hdr, effects) = {
            let mut core = self.inner.core.lock().await;
            self.check_allocation_allowed(&core, pid)?;
            let Core { kernel, servant, .. } = &mut *core;
            let (hdr, _) = kernel.use_buffer(pid, buffer, servant)?;
            core.after_buffer_population(pid, &self.inner.mailbox).await?;
            core.complete_ongoing_transitions(&self.inner.mailbox).await?;
            (hdr, core.servant.take_effects())
        };
        self.drain_effects(effects).await;
        Ok(hdr)
    }

    pub async fn allocate_buffer(&self, pid: u32, size: usize) -> IlResult<HeaderRef> {
        let (hdr, effects) = {
            let mut core = self.inner.core.lock().await;
            self.check_allocation_allowed(&core, pid)?;
            let Core { kernel, servant, .. } = &mut *core;
            let (hdr, _) = kernel.allocate_buffer(pid, size, servant)?;
            core.after_buffer_population(pid, &self.inner.mailbox).await?;
            core.complete_ongoing_transitions(&self.inner.mailbox).await?;
            (hdr, core.servant.take_effects())
        };
        self.drain_effects(effects).await;
        Ok(hdr)
    }

    pub async fn use_egl_image(&self, pid: u32, egl: EglImage) -> IlResult<HeaderRef> {
        let (hdr, effects) = {
            let mut core = self.inner.core.lock().await;
            self.check_allocation_allowed(&core, pid)?;
            let Core { kernel, servant, .. } = &mut *core;
            let (hdr, _) = kernel.use_egl_image(pid, egl, servant)?;
            core.after_buffer_population(pid, &self.inner.mailbox).await?;
            core.complete_ongoing_transitions(&self.inner.mailbox).await?;
            (hdr, core.servant.take_effects())
        };
        self.drain_effects(effects).await;
        Ok(hdr)
    }

    fn check_allocation_allowed(&self, core: &Core, pid: u32) -> IlResult<()> {
        core.kernel.check_pid(pid)?;
        let in_loaded_to_idle = core.fsm.state() == FsmState::LoadedToIdle;
        let port = core.kernel.port(pid);
        if in_loaded_to_idle || !port.is_enabled() || port.is_being_enabled() {
            Ok(())
        } else {
            Err(IlError::IncorrectStateOperation)
        }
    }

    pub async fn free_buffer(&self, pid: u32, hdr: &HeaderRef) -> IlResult<()> {
        let effects = {
            let mut core = self.inner.core.lock().await;
            core.kernel.check_pid(pid)?;
            let in_idle_to_loaded = core.fsm.state() == FsmState::IdleToLoaded;
            let Core { kernel, servant, .. } = &mut *core;
            kernel.free_buffer(pid, hdr, in_idle_to_loaded, servant)?;
            core.complete_ongoing_transitions(&self.inner.mailbox).await?;
            core.servant.take_effects()
        };
        self.drain_effects(effects).await;
        Ok(())
    }

    pub async fn empty_this_buffer(&self, hdr: HeaderRef) -> IlResult<()> {
        let pid = hdr
            .lock()
            .expect("header poisoned")
            .input_port_index
            .ok_or(IlError::BadPortIndex)?;
        self.check_exchange_allowed(pid).await?;
        self.inner.mailbox.post(Msg::EmptyThisBuffer { hdr })
    }

    pub async fn fill_this_buffer(&self, hdr: HeaderRef) -> IlResult<()> {
        let pid = hdr
            .lock()
            .expect("header poisoned")
            .output_port_index
            .ok_or(IlError::BadPortIndex)?;
        self.check_exchange_allowed(pid).await?;
        self.inner.mailbox.post(Msg::FillThisBuffer { hdr })
    }

    async fn check_exchange_allowed(&self, pid: u32) -> IlResult<()> {
        let core = self.inner.core.lock().await;
        core.kernel.check_pid(pid)?;
        if !core.kernel.port(pid).is_enabled() {
            return Err(IlError::IncorrectStateOperation);
        }
        match core.fsm.current_state() {
            State::Idle | State::Executing | State::Pause => Ok(()),
            _ => Err(IlError::IncorrectStateOperation),
        }
    }

    /// `ComponentTunnelRequest`. The output side runs first and proposes;
    /// the input side decides the supplier (input unless the output end
    /// insists) and the shared pool geometry, and pushes both back to the
    /// peer. A `None` peer tears the tunnel down.
    pub async fn component_tunnel_request(
        &self,
        pid: u32,
        peer: Option<(&Component, u32)>,
        setup: &mut TunnelSetup,
    ) -> IlResult<()> {
        let Some((peer, peer_pid)) = peer else {
            let mut core = self.inner.core.lock().await;
            core.kernel.set_tunnel(pid, None)?;
            return Ok(());
        };

        let (dir, my_count, my_size, my_domain, preference) = {
            let core = self.inner.core.lock().await;
            core.kernel.check_pid(pid)?;
            let state_ok = core.fsm.current_state() == State::Loaded
                || !core.kernel.port(pid).is_enabled();
            if !state_ok {
                return Err(IlError::IncorrectStateOperation);
            }
            if core.kernel.port(pid).is_tunneled() {
                // Re-tunnelling requires an explicit teardown first.
                return Err(IlError::PortsNotCompatible);
            }
            let port = core.kernel.port(pid);
            let def = port.definition();
            (
                port.dir(),
                def.buffer_count_actual,
                def.buffer_size,
                port.domain(),
                port.supplier_preference(),
            )
        };

        if dir == Dir::Output {
            // Proposing side: record the binding, state a preference and
            // let the input side decide.
            setup.supplier = preference;
            let mut core = self.inner.core.lock().await;
            core.kernel.set_tunnel(
                pid,
                Some(Tunnel {
                    peer_component: peer.id(),
                    peer_port: peer_pid,
                    supplier: preference == BufferSupplier::Output,
                    peer_status: TunneledPortStatus::empty(),
                }),
            )?;
            return Ok(());
        }

        // Input side: fetch the peer's geometry and check compatibility.
        let mut peer_def = PortDefinition::query(peer_pid);
        peer.get_parameter(&mut peer_def).await?;
        if peer_def.dir != Dir::Output || peer_def.domain() != my_domain {
            warn!(
                component = %self.inner.name,
                pid, peer_pid, "tunnel setup rejected, incompatible ports"
            );
            return Err(IlError::PortsNotCompatible);
        }

        let count = my_count.max(peer_def.buffer_count_actual);
        let size = my_size.max(peer_def.buffer_size);
        let output_supplies = setup.supplier == BufferSupplier::Output;
        let supplier = if output_supplies {
            BufferSupplier::Output
        } else {
            BufferSupplier::Input
        };

        {
            let mut core = self.inner.core.lock().await;
            core.kernel
                .port_mut(pid)
                .set_negotiated_geometry(count, size);
            core.kernel.set_tunnel(
                pid,
                Some(Tunnel {
                    peer_component: peer.id(),
                    peer_port: peer_pid,
                    supplier: supplier == BufferSupplier::Input,
                    peer_status: TunneledPortStatus::empty(),
                }),
            )?;
        }
        setup.supplier = supplier;

        // Push the decision and the negotiated geometry to the peer.
        peer.set_parameter(&CompBufferSupplier {
            port_index: peer_pid,
            supplier,
        })
        .await?;
        peer.apply_tunnel_geometry(peer_pid, count, size).await?;
        Ok(())
    }

    /// Peer side of the geometry negotiation.
    pub(crate) async fn apply_tunnel_geometry(
        &self,
        pid: u32,
        count: u32,
        size: usize,
    ) -> IlResult<()> {
        let mut core = self.inner.core.lock().await;
        core.kernel.check_pid(pid)?;
        core.kernel
            .port_mut(pid)
            .set_negotiated_geometry(count, size);
        Ok(())
    }

    /// Schedules a host-injected event on the component task.
    pub fn receive_pluggable_event(&self, event: Box<dyn PluggableEvent>) -> IlResult<()> {
        self.inner.mailbox.post(Msg::Pluggable { event })
    }

    // -----------------------------------------------------------------
    // Tunnel-internal entry points (called by the peer's effect drain)
    // -----------------------------------------------------------------

    pub(crate) async fn attach_tunnel_buffer(&self, pid: u32, hdr: HeaderRef) -> IlResult<()> {
        let effects = {
            let mut core = self.inner.core.lock().await;
            let Core { kernel, servant, .. } = &mut *core;
            kernel.attach_tunnel_buffer(pid, hdr, servant)?;
            core.after_buffer_population(pid, &self.inner.mailbox).await?;
            core.complete_ongoing_transitions(&self.inner.mailbox).await?;
            core.servant.take_effects()
        };
        self.drain_effects(effects).await;
        Ok(())
    }

    pub(crate) async fn detach_tunnel_buffer(&self, pid: u32, hdr: &HeaderRef) -> IlResult<()> {
        let effects = {
            let mut core = self.inner.core.lock().await;
            let Core { kernel, servant, .. } = &mut *core;
            kernel.detach_tunnel_buffer(pid, hdr, servant)?;
            core.complete_ongoing_transitions(&self.inner.mailbox).await?;
            core.servant.take_effects()
        };
        self.drain_effects(effects).await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------

    fn lookup_peer(&self, id: ComponentId) -> Option<Component> {
        self.inner.runtime.upgrade()?.lookup(id)
    }

    /// A tunnel peer refused a buffer (typically because its exchange
    /// phase has not started). Park the header back on our egress; the
    /// next transfer re-flushes it.
    async fn requeue_tunnel_buffer(&self, hdr: HeaderRef, own_dir: Dir) {
        let pid = {
            let h = hdr.lock().expect("header poisoned");
            match own_dir {
                Dir::Input => h.input_port_index,
                Dir::Output => h.output_port_index,
            }
        };
        let Some(pid) = pid else { return };
        let mut core = self.inner.core.lock().await;
        if core.kernel.check_pid(pid).is_err() || !core.kernel.port(pid).owns(&hdr) {
            return;
        }
        core.kernel
            .port_mut(pid)
            .set_slot(&hdr, crate::port::HeaderSlot::Egress);
        core.kernel.push_egress(pid, hdr);
    }

    pub(crate) fn drain_effects<'a>(
        &'a self,
        effects: Vec<Effect>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            for effect in effects {
                match effect {
                    Effect::Event(event) => {
                        let callbacks = self
                            .inner
                            .callbacks
                            .lock()
                            .expect("callbacks poisoned")
                            .clone();
                        if let Some(cb) = callbacks {
                            cb.event_handler(self.inner.id, event).await;
                        } else {
                            trace!(component = %self.inner.name, "event dropped, no callbacks");
                        }
                    }
                    Effect::EmptyBufferDone(hdr) => {
                        let callbacks = self
                            .inner
                            .callbacks
                            .lock()
                            .expect("callbacks poisoned")
                            .clone();
                        if let Some(cb) = callbacks {
                            cb.empty_buffer_done(self.inner.id, hdr).await;
                        }
                    }
                    Effect::FillBufferDone(hdr) => {
                        let callbacks = self
                            .inner
                            .callbacks
                            .lock()
                            .expect("callbacks poisoned")
                            .clone();
                        if let Some(cb) = callbacks {
                            cb.fill_buffer_done(self.inner.id, hdr).await;
                        }
                    }
                    Effect::PeerEmptyThisBuffer { peer, hdr } => {
                        match self.lookup_peer(peer) {
                            Some(peer) => {
                                if let Err(error) = peer.empty_this_buffer(hdr.clone()).await {
                                    warn!(%error, "peer EmptyThisBuffer refused, requeueing");
                                    self.requeue_tunnel_buffer(hdr, Dir::Output).await;
                                }
                            }
                            None => warn!(%peer, "tunnel peer gone"),
                        }
                    }
                    Effect::PeerFillThisBuffer { peer, hdr } => match self.lookup_peer(peer) {
                        Some(peer) => {
                            if let Err(error) = peer.fill_this_buffer(hdr.clone()).await {
                                warn!(%error, "peer FillThisBuffer refused, requeueing");
                                self.requeue_tunnel_buffer(hdr, Dir::Input).await;
                            }
                        }
                        None => warn!(%peer, "tunnel peer gone"),
                    },
                    Effect::PeerSetConfig { peer, config } => match self.lookup_peer(peer) {
                        Some(peer) => {
                            if let Err(error) = peer.set_config(&config).await {
                                warn!(%error, "peer SetConfig failed");
                            }
                        }
                        None => warn!(%peer, "tunnel peer gone"),
                    },
                    Effect::PeerAttachBuffer { peer, pid, hdr } => match self.lookup_peer(peer) {
                        Some(peer) => {
                            if let Err(error) = peer.attach_tunnel_buffer(pid, hdr).await {
                                warn!(%error, "peer buffer attach failed");
                            }
                        }
                        None => warn!(%peer, "tunnel peer gone"),
                    },
                    Effect::PeerDetachBuffer { peer, pid, hdr } => match self.lookup_peer(peer) {
                        Some(peer) => {
                            if let Err(error) = peer.detach_tunnel_buffer(pid, &hdr).await {
                                warn!(%error, "peer buffer detach failed");
                            }
                        }
                        None => warn!(%peer, "tunnel peer gone"),
                    },
                }
            }
        })
    }
}

impl Core {
    /// A tunneled-port status phase predicate turned true: re-run the
    /// micro-step the current substate is blocked on.
    pub(crate) async fn tunneled_ports_status_update(&mut self, mailbox: &Mailbox) -> IlResult<()> {
        match self.fsm.state() {
            FsmState::LoadedToIdle => {
                self.kernel
                    .allocate_resources(PortSelector::All, &mut self.servant)?;
                self.complete_ongoing_transitions(mailbox).await
            }
            FsmState::Executing => {
                self.kernel
                    .transfer_and_process(PortSelector::All, &mut self.servant, mailbox)
            }
            FsmState::ExecutingToIdle | FsmState::PauseToIdle => {
                self.complete_ongoing_transitions(mailbox).await
            }
            _ => Ok(()),
        }
    }
}

/// Runs the component event loop until cancellation.
pub(crate) fn spawn_component_task(inner: Arc<ComponentInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let handle = Component {
            inner: Arc::clone(&inner),
        };
        loop {
            while let Some(msg) = inner.mailbox.take() {
                let effects = {
                    let mut core = inner.core.lock().await;
                    core.dispatch(msg, &inner.mailbox).await;
                    core.servant.take_effects()
                };
                handle.drain_effects(effects).await;
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.mailbox.notified() => {}
            }
        }
        debug!(component = %inner.name, "component task stopped");
    })
}
