//! Connection health supervision
//!
//! Every connection-state change goes through [`plan_repair`], a pure table
//! from (state, history, attempts) to exactly one follow-up. The supervisor
//! carries the follow-up out: schedule a timer, send an offer, or remove the
//! connection and maybe schedule a single full recreation.
//!
//! ```text
//! new -> connecting -> connected <-> disconnected -> failed -> (ICE restart | removed)
//!                                                      \-> closed -> released
//! ```

use crate::config::HealthOptions;
use crate::context::MeshContext;
use crate::coordinator::Notice;
use crate::negotiator::Negotiator;
use crate::peer::{
    ConnectionId, ConnectionState, IceConnectionState, OpenOptions, PeerId, PeerInfo, Role,
    SignalingState, TimerKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How many times and how fast a failed connection is repaired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    /// Attempts before the connection is given up (default: 3)
    pub max_attempts: u32,
    /// Linear backoff unit; attempt `n` waits `n` units (default: 1s)
    pub backoff_unit: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(1000),
        }
    }
}

impl ReconnectionPolicy {
    pub fn from_options(options: &HealthOptions) -> Self {
        Self {
            max_attempts: options.max_reconnect_attempts,
            backoff_unit: Duration::from_millis(options.restart_backoff_unit_ms),
        }
    }

    /// Delay before repair attempt `attempt` (1-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }

    /// Whether attempt number `attempt` may still run
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Follow-up for a connection-state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Nothing to do
    None,
    /// Record the successful connection and reset repair state
    MarkConnected,
    /// Wait before renegotiating; disconnects often heal by themselves
    DebounceDisconnect,
    /// Send an ICE-restart offer after `delay`
    RestartIce { attempt: u32, delay: Duration },
    /// Never connected: drop without retry
    Discard,
    /// Attempts used up: drop and maybe recreate once
    Exhaust { attempts: u32 },
    /// Transport closed: release the record
    Release,
}

pub fn plan_repair(
    state: ConnectionState,
    has_ever_connected: bool,
    attempts: u32,
    policy: &ReconnectionPolicy,
) -> Repair {
    match state {
        ConnectionState::New | ConnectionState::Connecting => Repair::None,
        ConnectionState::Connected => Repair::MarkConnected,
        ConnectionState::Disconnected => Repair::DebounceDisconnect,
        ConnectionState::Failed if !has_ever_connected => Repair::Discard,
        ConnectionState::Failed => {
            let attempt = attempts + 1;
            if policy.should_retry(attempt) {
                Repair::RestartIce {
                    attempt,
                    delay: policy.calculate_backoff(attempt),
                }
            } else {
                Repair::Exhaust { attempts: attempt }
            }
        }
        ConnectionState::Closed => Repair::Release,
    }
}

/// Connections the periodic sweep should force-recreate
///
/// A connection qualifies once it is old enough, has connected before, is
/// stuck in `disconnected` or `failed`, its peer is still in the call, and no
/// repair will run for it anymore (attempts used up or nothing scheduled).
pub fn sweep_candidates(
    snapshot: &[PeerInfo],
    policy: &ReconnectionPolicy,
    min_age: Duration,
    in_call: impl Fn(&PeerId) -> bool,
) -> Vec<PeerId> {
    snapshot
        .iter()
        .filter(|info| info.age >= min_age)
        .filter(|info| {
            matches!(
                info.connection_state,
                ConnectionState::Disconnected | ConnectionState::Failed
            )
        })
        .filter(|info| info.has_ever_connected)
        .filter(|info| info.reconnect_attempts >= policy.max_attempts || !info.repair_pending)
        .filter(|info| in_call(&info.peer_id))
        .map(|info| info.peer_id.clone())
        .collect()
}

/// Watches transport state and repairs or removes connections
pub(crate) struct HealthSupervisor {
    ctx: Arc<MeshContext>,
    negotiator: Negotiator,
    policy: ReconnectionPolicy,
}

impl HealthSupervisor {
    pub fn new(ctx: Arc<MeshContext>, negotiator: Negotiator) -> Self {
        let policy = ReconnectionPolicy::from_options(&ctx.config.health);
        Self {
            ctx,
            negotiator,
            policy,
        }
    }

    pub fn on_connection_state(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        state: ConnectionState,
    ) {
        let Some((previous, has_ever_connected, attempts)) =
            self.ctx.registry.update(peer_id, connection_id, |r| {
                let previous = r.connection_state;
                r.connection_state = state;
                (previous, r.has_ever_connected, r.reconnect_attempts)
            })
        else {
            return;
        };
        if previous == state {
            return;
        }
        info!(
            "Peer {} connection {}: {:?} -> {:?}",
            peer_id, connection_id, previous, state
        );

        match plan_repair(state, has_ever_connected, attempts, &self.policy) {
            Repair::None => {}
            Repair::MarkConnected => self.mark_connected(peer_id, connection_id),
            Repair::DebounceDisconnect => {
                self.ctx.registry.schedule_timer(
                    peer_id,
                    connection_id,
                    TimerKind::DisconnectDebounce,
                    self.ctx.config.health.disconnect_debounce(),
                );
            }
            Repair::RestartIce { attempt, delay } => {
                warn!(
                    "Connection to peer {} failed; ICE restart {}/{} in {:?}",
                    peer_id, attempt, self.policy.max_attempts, delay
                );
                self.ctx.registry.update(peer_id, connection_id, |r| {
                    r.reconnect_attempts = attempt;
                });
                self.ctx
                    .registry
                    .schedule_timer(peer_id, connection_id, TimerKind::IceRestart, delay);
            }
            Repair::Discard => self.discard(peer_id, connection_id),
            Repair::Exhaust { attempts } => {
                warn!(
                    "Connection to peer {} failed after {} attempt(s); giving up",
                    peer_id, attempts
                );
                self.exhaust(peer_id, connection_id, Notice::ConnectionLost {
                    peer_id: peer_id.clone(),
                });
            }
            Repair::Release => self.release_closed(peer_id, connection_id),
        }
    }

    pub fn on_ice_state(
        &self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        state: IceConnectionState,
    ) {
        let updated = self
            .ctx
            .registry
            .update(peer_id, connection_id, |r| r.ice_state = state)
            .is_some();
        if updated
            && matches!(
                state,
                IceConnectionState::Connected | IceConnectionState::Completed
            )
        {
            self.mark_connected(peer_id, connection_id);
        }
    }

    /// Start the slow-connection watchdog
    pub fn on_gathering_complete(&self, peer_id: &PeerId, connection_id: ConnectionId) {
        let connected = self
            .ctx
            .registry
            .get(peer_id)
            .is_some_and(|info| info.connection_state == ConnectionState::Connected);
        if connected {
            return;
        }
        self.ctx.registry.schedule_timer(
            peer_id,
            connection_id,
            TimerKind::SlowConnection,
            self.ctx.config.health.slow_connection_watchdog(),
        );
    }

    pub async fn on_timer(&self, peer_id: &PeerId, connection_id: ConnectionId, kind: TimerKind) {
        let Some(info) = self
            .ctx
            .registry
            .get(peer_id)
            .filter(|info| info.connection_id == connection_id)
        else {
            return;
        };

        let result = match kind {
            TimerKind::DisconnectDebounce => {
                let renegotiate = info.connection_state == ConnectionState::Disconnected
                    && info.role == Role::Initiator
                    && info.signaling_state == SignalingState::Stable;
                if !renegotiate {
                    return;
                }
                info!("Peer {} still disconnected; renegotiating", peer_id);
                self.negotiator
                    .send_offer(peer_id, connection_id, false)
                    .await
            }
            TimerKind::IceRestart => {
                if info.connection_state == ConnectionState::Connected {
                    return;
                }
                info!(
                    "Restarting ICE with peer {} (attempt {})",
                    peer_id, info.reconnect_attempts
                );
                self.negotiator.send_offer(peer_id, connection_id, true).await
            }
            TimerKind::AnswerRecovery => {
                self.recover_answer(peer_id, connection_id, &info).await;
                return;
            }
            TimerKind::SlowConnection => {
                if info.connection_state != ConnectionState::Connected
                    && info.role == Role::Initiator
                {
                    self.ctx.notify(Notice::ConnectionSlow {
                        peer_id: peer_id.clone(),
                    });
                }
                return;
            }
            TimerKind::RelayRetransmit(seq) => {
                self.negotiator
                    .retransmit_relay(peer_id, connection_id, seq)
                    .await
            }
        };

        if let Err(e) = result {
            error!("Repair of connection to peer {} failed: {}", peer_id, e);
        }
    }

    /// Run a scheduled full recreation if it is still wanted
    pub async fn on_recreate(&self, peer_id: &PeerId) {
        if !self.ctx.registry.take_recreation(peer_id) {
            debug!("Recreation for peer {} was cancelled", peer_id);
            return;
        }
        if !self.ctx.roster.contains(peer_id) {
            debug!("Peer {} left; skipping recreation", peer_id);
            return;
        }
        let connected = self
            .ctx
            .registry
            .get(peer_id)
            .is_some_and(|info| info.connection_state == ConnectionState::Connected);
        if connected {
            return;
        }

        info!("Recreating connection to peer {}", peer_id);
        let options = OpenOptions {
            recreated: true,
            user_accepted: false,
        };
        if let Err(e) = self.negotiator.open(peer_id, Role::Initiator, options).await {
            error!("Failed to recreate connection to peer {}: {}", peer_id, e);
        }
    }

    /// Force-recreate connections stuck without any repair left
    pub async fn sweep(&self) -> usize {
        let stuck = sweep_candidates(
            &self.ctx.registry.snapshot(),
            &self.policy,
            self.ctx.config.health.sweep_min_age(),
            |peer_id| self.ctx.roster.contains(peer_id),
        );

        for peer_id in &stuck {
            warn!("Connection to peer {} is stuck; recreating", peer_id);
            self.ctx.tracks.release(peer_id);
            let options = OpenOptions {
                recreated: true,
                user_accepted: false,
            };
            if let Err(e) = self.negotiator.open(peer_id, Role::Initiator, options).await {
                error!("Failed to recreate connection to peer {}: {}", peer_id, e);
            }
        }
        stuck.len()
    }

    fn mark_connected(&self, peer_id: &PeerId, connection_id: ConnectionId) {
        self.ctx.registry.update(peer_id, connection_id, |r| {
            if !r.has_ever_connected {
                info!("Connected to peer {}", peer_id);
            }
            r.has_ever_connected = true;
            r.reconnect_attempts = 0;
            r.options.recreated = false;
            r.timers.cancel(TimerKind::DisconnectDebounce);
            r.timers.cancel(TimerKind::IceRestart);
            r.timers.cancel(TimerKind::SlowConnection);
        });
    }

    /// Answer recovery: offer again while attempts remain, else give up
    async fn recover_answer(&self, peer_id: &PeerId, connection_id: ConnectionId, info: &PeerInfo) {
        let Ok(transport) = self.negotiator.current_transport(peer_id, connection_id) else {
            return;
        };
        if transport.signaling_state() == SignalingState::Stable {
            debug!("Signaling with peer {} settled by itself", peer_id);
            return;
        }

        let attempt = info.reconnect_attempts + 1;
        if !self.policy.should_retry(attempt) {
            warn!("Negotiation with peer {} did not recover; giving up", peer_id);
            self.exhaust(peer_id, connection_id, Notice::NegotiationFailed {
                peer_id: peer_id.clone(),
            });
            return;
        }

        self.ctx.registry.update(peer_id, connection_id, |r| {
            r.reconnect_attempts = attempt;
        });
        if let Err(e) = self.negotiator.recovery_offer(peer_id, connection_id).await {
            error!("Recovery offer to peer {} failed: {}", peer_id, e);
        }
    }

    /// Never connected: remove without retry
    fn discard(&self, peer_id: &PeerId, connection_id: ConnectionId) {
        let Some(info) = self.ctx.registry.remove_if_current(peer_id, connection_id) else {
            return;
        };
        warn!("Connection to peer {} failed before connecting", peer_id);
        self.ctx.tracks.release(peer_id);
        if info.user_accepted {
            self.ctx.notify(Notice::CallFailed {
                peer_id: peer_id.clone(),
            });
        }
        self.ctx.after_removal();
    }

    /// Remove the connection and schedule one recreation if the peer is still here
    fn exhaust(&self, peer_id: &PeerId, connection_id: ConnectionId, notice: Notice) {
        let Some(info) = self.ctx.registry.remove_if_current(peer_id, connection_id) else {
            return;
        };
        self.ctx.tracks.release(peer_id);
        self.ctx.notify(notice);

        if info.recreated {
            info!("Recreated connection to peer {} failed too; not retrying", peer_id);
        } else if self.ctx.roster.contains(peer_id) {
            self.ctx
                .registry
                .schedule_recreation(peer_id, self.ctx.config.health.recreate_delay());
        }
        self.ctx.after_removal();
    }

    fn release_closed(&self, peer_id: &PeerId, connection_id: ConnectionId) {
        let Some(info) = self.ctx.registry.remove_if_current(peer_id, connection_id) else {
            return;
        };
        info!("Connection to peer {} closed", peer_id);
        self.ctx.tracks.release(peer_id);

        let recreate = self.ctx.config.health.recreate_on_close
            && info.role == Role::Initiator
            && !info.recreated
            && self.ctx.roster.contains(peer_id);
        if recreate {
            self.ctx.registry.schedule_recreation(
                peer_id,
                self.ctx.config.health.closed_recreate_cooldown(),
            );
        }
        self.ctx.after_removal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(peer: &str, state: ConnectionState) -> PeerInfo {
        PeerInfo {
            peer_id: PeerId::from(peer),
            connection_id: 1,
            role: Role::Initiator,
            connection_state: state,
            signaling_state: SignalingState::Stable,
            ice_state: IceConnectionState::Disconnected,
            has_ever_connected: true,
            reconnect_attempts: 0,
            pending_candidates: 0,
            remote_description_set: true,
            screen_share: false,
            recreated: false,
            user_accepted: false,
            repair_pending: false,
            age: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_policy_defaults_match_options() {
        let policy = ReconnectionPolicy::from_options(&HealthOptions::default());
        assert_eq!(policy, ReconnectionPolicy::default());
    }

    #[test]
    fn test_linear_backoff() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectionPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_never_connected_failure_is_discarded() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(
            plan_repair(ConnectionState::Failed, false, 0, &policy),
            Repair::Discard
        );
    }

    #[test]
    fn test_failure_sequence_reaches_cap() {
        let policy = ReconnectionPolicy::default();

        assert_eq!(
            plan_repair(ConnectionState::Failed, true, 0, &policy),
            Repair::RestartIce {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            plan_repair(ConnectionState::Failed, true, 1, &policy),
            Repair::RestartIce {
                attempt: 2,
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(
            plan_repair(ConnectionState::Failed, true, 2, &policy),
            Repair::Exhaust { attempts: 3 }
        );
    }

    #[test]
    fn test_other_states() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(
            plan_repair(ConnectionState::Connected, false, 2, &policy),
            Repair::MarkConnected
        );
        assert_eq!(
            plan_repair(ConnectionState::Disconnected, true, 0, &policy),
            Repair::DebounceDisconnect
        );
        assert_eq!(
            plan_repair(ConnectionState::Closed, true, 0, &policy),
            Repair::Release
        );
        assert_eq!(
            plan_repair(ConnectionState::Connecting, true, 1, &policy),
            Repair::None
        );
    }

    #[test]
    fn test_sweep_selects_stuck_connections() {
        let policy = ReconnectionPolicy::default();
        let min_age = Duration::from_secs(30);

        let stuck = info("a", ConnectionState::Disconnected);

        let mut young = info("b", ConnectionState::Failed);
        young.age = Duration::from_secs(10);

        let healthy = info("c", ConnectionState::Connected);

        let mut never = info("d", ConnectionState::Failed);
        never.has_ever_connected = false;

        let mut repairing = info("e", ConnectionState::Failed);
        repairing.repair_pending = true;
        repairing.reconnect_attempts = 1;

        let mut exhausted = info("f", ConnectionState::Failed);
        exhausted.repair_pending = true;
        exhausted.reconnect_attempts = 3;

        let gone = info("g", ConnectionState::Disconnected);

        let snapshot = vec![stuck, young, healthy, never, repairing, exhausted, gone];
        let selected = sweep_candidates(&snapshot, &policy, min_age, |peer| peer.as_str() != "g");

        assert_eq!(selected, vec![PeerId::from("a"), PeerId::from("f")]);
    }
}
