//! Timer and I/O event sources bound to a component task.
//!
//! A watcher never calls into the component; it posts a `TimerReady` or
//! `IoReady` message carrying the event id it was started with. Starting a
//! watcher allocates a fresh id from a per-component monotonic counter and
//! records it in the registry; by the time a message is dispatched the
//! watcher may have been stopped or restarted, in which case the id no
//! longer matches and the event is dropped as stale. Level-triggered I/O
//! watchers are disarmed on first delivery and need an explicit restart.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use omxil::{IlError, IlResult};

use crate::msg::Msg;
use crate::servant::Mailbox;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvents: u8 {
        const READ  = 0x1;
        const WRITE = 0x2;
    }
}

impl IoEvents {
    fn interest(self) -> Interest {
        match (self.contains(IoEvents::READ), self.contains(IoEvents::WRITE)) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // An empty set degenerates to a read watch.
            _ => Interest::READABLE,
        }
    }
}

/// Stable handle of one watcher within its component.
pub type WatcherKey = u64;

enum WatcherKind {
    Timer {
        after: Duration,
        repeat: Option<Duration>,
    },
    Io {
        fd: RawFd,
        events: IoEvents,
        only_once: bool,
    },
}

struct WatcherEntry {
    kind: WatcherKind,
    active: Option<ActiveWatch>,
}

struct ActiveWatch {
    id: u64,
    cancel: CancellationToken,
}

/// Registry of the watchers owned by one component.
pub struct Watchers {
    mailbox: Arc<Mailbox>,
    lifetime: CancellationToken,
    entries: HashMap<WatcherKey, WatcherEntry>,
    next_key: WatcherKey,
    next_id: u64,
}

impl Watchers {
    pub fn new(mailbox: Arc<Mailbox>, lifetime: CancellationToken) -> Self {
        Self {
            mailbox,
            lifetime,
            entries: HashMap::new(),
            next_key: 0,
            next_id: 0,
        }
    }

    fn insert(&mut self, kind: WatcherKind) -> WatcherKey {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.insert(key, WatcherEntry { kind, active: None });
        key
    }

    pub fn timer_watcher_init(&mut self) -> WatcherKey {
        self.insert(WatcherKind::Timer {
            after: Duration::ZERO,
            repeat: None,
        })
    }

    pub fn io_watcher_init(&mut self, fd: RawFd, events: IoEvents, only_once: bool) -> WatcherKey {
        self.insert(WatcherKind::Io {
            fd,
            events,
            only_once,
        })
    }

    /// Arms a timer. A second start on an already-armed watcher is a no-op;
    /// use `timer_watcher_restart` to supersede a pending expiry.
    pub fn timer_watcher_start(
        &mut self,
        key: WatcherKey,
        after: Duration,
        repeat: Option<Duration>,
    ) -> IlResult<()> {
        let entry = self.entries.get_mut(&key).ok_or(IlError::BadParameter)?;
        match &mut entry.kind {
            WatcherKind::Timer {
                after: a,
                repeat: r,
            } => {
                *a = after;
                *r = repeat;
            }
            WatcherKind::Io { .. } => return Err(IlError::BadParameter),
        }
        if entry.active.is_some() {
            return Ok(());
        }
        let id = self.next_id;
        self.next_id += 1;
        let cancel = self.lifetime.child_token();
        let entry = self.entries.get_mut(&key).expect("entry just touched");
        entry.active = Some(ActiveWatch {
            id,
            cancel: cancel.clone(),
        });
        spawn_timer_task(Arc::clone(&self.mailbox), cancel, key, id, after, repeat);
        trace!(watcher = key, id, "timer watcher started");
        Ok(())
    }

    /// Stops, reallocates the id and re-arms with the stored parameters.
    /// A stale expiry from before the restart will not be delivered.
    pub fn timer_watcher_restart(&mut self, key: WatcherKey) -> IlResult<()> {
        let (after, repeat) = match self.entries.get(&key).map(|e| &e.kind) {
            Some(WatcherKind::Timer { after, repeat }) => (*after, *repeat),
            _ => return Err(IlError::BadParameter),
        };
        self.deactivate(key);
        self.timer_watcher_start(key, after, repeat)
    }

    pub fn timer_watcher_stop(&mut self, key: WatcherKey) -> IlResult<()> {
        if self.entries.get(&key).and_then(|e| e.active.as_ref()).is_none() {
            return Err(IlError::BadParameter);
        }
        self.deactivate(key);
        trace!(watcher = key, "timer watcher stopped");
        Ok(())
    }

    pub fn timer_watcher_destroy(&mut self, key: WatcherKey) {
        self.deactivate(key);
        self.entries.remove(&key);
    }

    pub fn io_watcher_start(&mut self, key: WatcherKey) -> IlResult<()> {
        let entry = self.entries.get_mut(&key).ok_or(IlError::BadParameter)?;
        let (fd, events, only_once) = match entry.kind {
            WatcherKind::Io {
                fd,
                events,
                only_once,
            } => (fd, events, only_once),
            WatcherKind::Timer { .. } => return Err(IlError::BadParameter),
        };
        if entry.active.is_some() {
            return Ok(());
        }
        let id = self.next_id;
        self.next_id += 1;
        let cancel = self.lifetime.child_token();
        entry.active = Some(ActiveWatch {
            id,
            cancel: cancel.clone(),
        });
        spawn_io_task(
            Arc::clone(&self.mailbox),
            cancel,
            key,
            id,
            fd,
            events,
            only_once,
        );
        trace!(watcher = key, id, fd, "io watcher started");
        Ok(())
    }

    pub fn io_watcher_stop(&mut self, key: WatcherKey) -> IlResult<()> {
        if self.entries.get(&key).and_then(|e| e.active.as_ref()).is_none() {
            return Err(IlError::BadParameter);
        }
        self.deactivate(key);
        Ok(())
    }

    pub fn io_watcher_destroy(&mut self, key: WatcherKey) {
        self.deactivate(key);
        self.entries.remove(&key);
    }

    /// True when `id` is still the id the watcher was last started with.
    pub fn is_current(&self, key: WatcherKey, id: u64) -> bool {
        self.entries
            .get(&key)
            .and_then(|e| e.active.as_ref())
            .is_some_and(|a| a.id == id)
    }

    /// Whether a delivered event disarms the watcher (level-triggered I/O,
    /// one-shot timers stay registered but a fired one-shot I/O watcher is
    /// removed from the active set).
    pub fn fires_once(&self, key: WatcherKey) -> bool {
        matches!(
            self.entries.get(&key).map(|e| &e.kind),
            Some(WatcherKind::Io {
                only_once: true,
                ..
            })
        )
    }

    /// Disarms after a delivered one-shot event.
    pub fn note_fired(&mut self, key: WatcherKey) {
        self.deactivate(key);
    }

    pub fn io_fd(&self, key: WatcherKey) -> Option<RawFd> {
        match self.entries.get(&key).map(|e| &e.kind) {
            Some(WatcherKind::Io { fd, .. }) => Some(*fd),
            _ => None,
        }
    }

    fn deactivate(&mut self, key: WatcherKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            if let Some(active) = entry.active.take() {
                active.cancel.cancel();
            }
        }
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        for key in self.entries.keys().copied().collect::<Vec<_>>() {
            self.deactivate(key);
        }
    }
}

fn spawn_timer_task(
    mailbox: Arc<Mailbox>,
    cancel: CancellationToken,
    watcher: WatcherKey,
    id: u64,
    after: Duration,
    repeat: Option<Duration>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(after) => {}
        }
        let _ = mailbox.post(Msg::TimerReady { watcher, id });
        let Some(period) = repeat else { return };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            if mailbox.post(Msg::TimerReady { watcher, id }).is_err() {
                // Mailbox full; drop the tick rather than pile up.
                warn!(watcher, "timer tick dropped, mailbox full");
            }
        }
    });
}

fn spawn_io_task(
    mailbox: Arc<Mailbox>,
    cancel: CancellationToken,
    watcher: WatcherKey,
    id: u64,
    fd: RawFd,
    events: IoEvents,
    only_once: bool,
) {
    tokio::spawn(async move {
        let interest = events.interest();
        let afd = match AsyncFd::with_interest(fd, interest) {
            Ok(afd) => afd,
            Err(error) => {
                warn!(watcher, fd, %error, "io watcher registration failed");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                guard = afd.ready(interest) => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    let mut readiness = IoEvents::empty();
                    if guard.ready().is_readable() {
                        readiness |= IoEvents::READ;
                    }
                    if guard.ready().is_writable() {
                        readiness |= IoEvents::WRITE;
                    }
                    let _ = mailbox.post(Msg::IoReady { watcher, id, readiness });
                    if only_once {
                        return;
                    }
                    guard.clear_ready();
                }
            }
        }
    });
}
