//! Peer-scoped timers
//!
//! A timer is a spawned sleep that posts a [`MeshEvent`] back into the
//! coordinator's loop. Handles live on the peer record, so releasing the
//! record aborts everything it scheduled.

use crate::event::{EventSender, MeshEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;

/// What a peer timer is for; at most one timer of each kind per record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Connection reported `disconnected`; check again before renegotiating
    DisconnectDebounce,
    /// Backoff before an ICE-restart offer
    IceRestart,
    /// Answer was rejected by signaling state; check again before re-offering
    AnswerRecovery,
    /// ICE gathering completed; notify if still not connected
    SlowConnection,
    /// Resend the relay candidate with this sequence number if ICE is still checking
    RelayRetransmit(u32),
}

/// Post `event` after `delay` unless aborted first
pub(crate) fn spawn_delayed(delay: Duration, events: &EventSender, event: MeshEvent) -> AbortHandle {
    let events = events.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // Receiver gone means the mesh shut down
        let _ = events.send(event);
    })
    .abort_handle()
}

/// Timers owned by one peer record
#[derive(Debug, Default)]
pub struct PeerTimers {
    handles: HashMap<TimerKind, AbortHandle>,
}

impl PeerTimers {
    /// Schedule a timer, replacing any timer of the same kind
    pub(crate) fn schedule(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        events: &EventSender,
        event: MeshEvent,
    ) {
        let handle = spawn_delayed(delay, events, event);
        if let Some(previous) = self.handles.insert(kind, handle) {
            previous.abort();
        }
    }

    /// Abort a timer; returns whether one was still pending
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.handles.remove(&kind) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.handles.get(&kind).is_some_and(|h| !h.is_finished())
    }

    pub fn pending_count(&self) -> usize {
        self.handles.values().filter(|h| !h.is_finished()).count()
    }

    pub fn clear(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for PeerTimers {
    fn drop(&mut self) {
        self.clear();
    }
}
