// Presence: the local availability state machine and the authoritative
// table of remote user states.
//
// The local session moves ONLINE <-> AWAY from activity and visibility
// signals, and reaches OFFLINE only on explicit teardown. Broadcast
// decisions are pure functions of injected instants so the throttle rules
// are testable without timers.

use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::models::PresenceState;

pub struct PresenceTracker {
    local_user_id: String,
    local_state: PresenceState,
    visible: bool,
    torn_down: bool,
    last_activity: Instant,
    /// Last state actually put on the wire, and when.
    last_broadcast: Option<(PresenceState, Instant)>,
    idle_threshold: Duration,
    min_interval: Duration,
    refresh_interval: Duration,
    remote: HashMap<String, PresenceState>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>, config: &SyncConfig, now: Instant) -> Self {
        PresenceTracker {
            local_user_id: local_user_id.into(),
            local_state: PresenceState::Online,
            visible: true,
            torn_down: false,
            last_activity: now,
            last_broadcast: None,
            idle_threshold: config.idle_threshold,
            min_interval: config.presence_min_interval,
            refresh_interval: config.presence_refresh_interval,
            remote: HashMap::new(),
        }
    }

    pub fn local_state(&self) -> PresenceState {
        self.local_state
    }

    /// Override the idle threshold at runtime (user preference).
    pub fn set_idle_threshold(&mut self, threshold: Duration) {
        self.idle_threshold = threshold;
    }

    /// Central broadcast gate. A state goes on the wire when it changed (or
    /// `force` bypasses that check), but never more often than the minimum
    /// interval regardless of the trigger.
    fn gate(&mut self, state: PresenceState, now: Instant, force: bool) -> Option<PresenceState> {
        if let Some((last_state, at)) = self.last_broadcast {
            if now.duration_since(at) < self.min_interval {
                debug!("Presence broadcast suppressed by minimum interval");
                return None;
            }
            if !force && last_state == state && now.duration_since(at) < self.refresh_interval {
                return None;
            }
        }
        self.last_broadcast = Some((state, now));
        Some(state)
    }

    /// An input event arrived. Resets the idle timer; returns a state to
    /// broadcast when this wakes the session out of AWAY.
    pub fn note_activity(&mut self, now: Instant) -> Option<PresenceState> {
        if self.torn_down {
            return None;
        }
        self.last_activity = now;
        if self.local_state == PresenceState::Away && self.visible {
            self.local_state = PresenceState::Online;
            return self.gate(PresenceState::Online, now, false);
        }
        None
    }

    /// Page visibility change. Hidden forces AWAY; visible forces ONLINE and
    /// re-broadcasts unconditionally (the server may hold stale state), still
    /// subject to the minimum interval.
    pub fn set_visibility(&mut self, visible: bool, now: Instant) -> Option<PresenceState> {
        if self.torn_down {
            return None;
        }
        self.visible = visible;
        if visible {
            self.local_state = PresenceState::Online;
            self.last_activity = now;
            self.gate(PresenceState::Online, now, true)
        } else {
            self.local_state = PresenceState::Away;
            self.gate(PresenceState::Away, now, false)
        }
    }

    /// Periodic driver: idle expiry flips ONLINE -> AWAY; otherwise the
    /// forced refresh re-announces the current state when due.
    pub fn tick(&mut self, now: Instant) -> Option<PresenceState> {
        if self.torn_down {
            return None;
        }
        if self.local_state == PresenceState::Online
            && now.duration_since(self.last_activity) >= self.idle_threshold
        {
            self.local_state = PresenceState::Away;
            return self.gate(PresenceState::Away, now, false);
        }
        let refresh_due = match self.last_broadcast {
            Some((_, at)) => now.duration_since(at) >= self.refresh_interval,
            None => true,
        };
        if refresh_due {
            return self.gate(self.local_state, now, true);
        }
        None
    }

    /// Announce the current state regardless of the only-on-change rule,
    /// e.g. right after (re)connecting when server-side state is not trusted.
    pub fn force_broadcast(&mut self, now: Instant) -> Option<PresenceState> {
        if self.torn_down {
            return None;
        }
        self.gate(self.local_state, now, true)
    }

    /// Session teardown: the one path to OFFLINE. Always broadcast; the
    /// throttle does not apply to the final frame.
    pub fn teardown(&mut self, now: Instant) -> PresenceState {
        self.torn_down = true;
        self.local_state = PresenceState::Offline;
        self.last_broadcast = Some((PresenceState::Offline, now));
        PresenceState::Offline
    }

    /// Apply a remote presence event to the authoritative table.
    /// Self-originated events are ignored to avoid feedback loops.
    /// Returns true if the table changed.
    pub fn apply_remote(&mut self, user_id: &str, state: PresenceState) -> bool {
        if user_id == self.local_user_id {
            debug!("Ignoring self-originated presence event");
            return false;
        }
        self.remote.insert(user_id.to_string(), state) != Some(state)
    }

    /// Authoritative state for a user; unknown users read as OFFLINE.
    pub fn remote(&self, user_id: &str) -> PresenceState {
        self.remote
            .get(user_id)
            .copied()
            .unwrap_or(PresenceState::Offline)
    }
}
