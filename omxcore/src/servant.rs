//! The servant base: per-component mailbox and deferred side effects.
//!
//! Every component runs exactly one cooperative task. API calls and peer
//! components never touch component state directly; they post messages to
//! the [`Mailbox`] and the task dispatches them one at a time. Side effects
//! that leave the component (host callbacks, buffer-done notifications,
//! calls into a tunneled peer) are collected in the [`Servant`] outbox and
//! executed only after the component lock is dropped. A host callback may
//! therefore call straight back into the component API, and two tunneled
//! peers may signal each other concurrently.

use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use omxil::{
    Command, ComponentId, Dir, HeaderRef, IlError, State, TunneledPortStatusConfig,
};

use crate::events::IlEvent;
use crate::msg::Msg;
use crate::pqueue::PriorityQueue;

/// A side effect to run once the component lock is released.
#[derive(Debug)]
pub enum Effect {
    /// Deliver an event through the host `EventHandler`.
    Event(IlEvent),
    EmptyBufferDone(HeaderRef),
    FillBufferDone(HeaderRef),
    /// Hand a consumed buffer back to the upstream peer for a refill.
    PeerFillThisBuffer {
        peer: ComponentId,
        hdr: HeaderRef,
    },
    /// Push a produced buffer to the downstream peer.
    PeerEmptyThisBuffer {
        peer: ComponentId,
        hdr: HeaderRef,
    },
    /// Advertise tunneled-port readiness bits to the peer.
    PeerSetConfig {
        peer: ComponentId,
        config: TunneledPortStatusConfig,
    },
    /// Register a supplier-allocated header with the non-supplier peer.
    PeerAttachBuffer {
        peer: ComponentId,
        pid: u32,
        hdr: HeaderRef,
    },
    /// Withdraw a supplier-allocated header from the peer.
    PeerDetachBuffer {
        peer: ComponentId,
        pid: u32,
        hdr: HeaderRef,
    },
}

/// The component mailbox: bounded priority queue plus wakeup.
pub struct Mailbox {
    queue: Mutex<PriorityQueue<Msg>>,
    notify: Notify,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(PriorityQueue::new(capacity)),
            notify: Notify::new(),
        }
    }

    /// Enqueues one message at its class priority and wakes the task.
    pub fn post(&self, msg: Msg) -> Result<(), IlError> {
        let prio = msg.priority();
        {
            let mut q = self.queue.lock().expect("mailbox poisoned");
            q.send(msg, prio)?;
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn take(&self) -> Option<Msg> {
        self.queue.lock().expect("mailbox poisoned").receive()
    }

    pub fn is_ready(&self) -> bool {
        !self.queue.lock().expect("mailbox poisoned").is_empty()
    }

    /// Removes every queued message matching `pred`; used to drain buffer
    /// traffic at state transitions, flush and port disable.
    pub fn remove_if(&self, pred: impl FnMut(&Msg) -> bool) -> Vec<Msg> {
        self.queue.lock().expect("mailbox poisoned").remove_if(pred)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Event-emission half of the servant. Owned by the component core; all
/// `issue_*` calls land in the outbox.
pub struct Servant {
    id: ComponentId,
    name: String,
    outbox: Vec<Effect>,
}

impl Servant {
    pub fn new(id: ComponentId, name: String) -> Self {
        Self {
            id,
            name,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn issue_event(&mut self, event: IlEvent) {
        debug!(component = %self.name, event = ?event, "event");
        self.outbox.push(Effect::Event(event));
    }

    pub fn issue_err_event(&mut self, error: IlError) {
        warn!(component = %self.name, %error, "error event");
        self.outbox.push(Effect::Event(IlEvent::Error { error }));
    }

    pub fn issue_cmd_event(&mut self, command: Command, pid: u32, error: Option<IlError>) {
        self.issue_event(IlEvent::CmdComplete {
            command,
            pid,
            error,
        });
    }

    pub fn issue_trans_event(&mut self, state: State, error: Option<IlError>) {
        self.issue_event(IlEvent::StateSetComplete { state, error });
    }

    /// Returns a finished buffer to whoever provided it: the tunneled peer
    /// when one is present, the host otherwise. An input header goes back
    /// upstream for a refill; an output header is delivered downstream.
    pub fn issue_buf_callback(
        &mut self,
        hdr: HeaderRef,
        pid: u32,
        dir: Dir,
        peer: Option<ComponentId>,
    ) {
        trace!(component = %self.name, pid, %dir, tunneled = peer.is_some(), "buffer out");
        match (peer, dir) {
            (Some(peer), Dir::Input) => self.outbox.push(Effect::PeerFillThisBuffer { peer, hdr }),
            (Some(peer), Dir::Output) => {
                self.outbox.push(Effect::PeerEmptyThisBuffer { peer, hdr })
            }
            (None, Dir::Input) => self.outbox.push(Effect::EmptyBufferDone(hdr)),
            (None, Dir::Output) => self.outbox.push(Effect::FillBufferDone(hdr)),
        }
    }

    pub fn push_effect(&mut self, effect: Effect) {
        self.outbox.push(effect);
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }
}
