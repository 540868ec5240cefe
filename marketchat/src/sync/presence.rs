//! Presence and typing indicators.
//!
//! [`PresenceTracker`] keeps the ephemeral sets of online users and of users
//! typing toward the current user. Remote typing marks expire on their own
//! if `typing_stop` never arrives. [`TypingNotifier`] is the outbound side:
//! it turns local keystrokes into one `typing_start` per burst and a
//! `typing_stop` after an idle period.
//!
//! Nothing here is persisted, and everything is cleared when the connection
//! drops. Presence never gates sending.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use marketchat_proto::event::ClientEvent;
use marketchat_proto::ids::UserId;
use marketchat_proto::presence::PresenceUpdate;
use marketchat_proto::typing::TypingPhase;

use crate::connection::ConnectionManager;
use crate::transport::Connector;

#[derive(Debug, Default)]
struct PresenceState {
    online: HashSet<UserId>,
    typing: HashMap<UserId, Instant>,
}

/// Online and typing-toward-me sets.
#[derive(Debug)]
pub struct PresenceTracker {
    typing_expiry: Duration,
    state: Mutex<PresenceState>,
}

impl PresenceTracker {
    /// Creates an empty tracker whose typing marks last `typing_expiry`.
    #[must_use]
    pub fn new(typing_expiry: Duration) -> Self {
        Self {
            typing_expiry,
            state: Mutex::new(PresenceState::default()),
        }
    }

    /// How long a typing mark lasts without a stop.
    #[must_use]
    pub const fn typing_expiry(&self) -> Duration {
        self.typing_expiry
    }

    /// Records a `presence_update`. Returns `true` if the set changed.
    pub fn apply(&self, update: &PresenceUpdate) -> bool {
        let mut state = self.state.lock();
        if update.online {
            state.online.insert(update.user_id.clone())
        } else {
            // An offline user cannot keep typing.
            state.typing.remove(&update.user_id);
            state.online.remove(&update.user_id)
        }
    }

    /// Records a typing start/stop from `user`. Returns `true` if the
    /// visible typing state changed.
    pub fn apply_typing(&self, user: &UserId, phase: TypingPhase) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        match phase {
            TypingPhase::Started => {
                let was_typing = state
                    .typing
                    .get(user)
                    .is_some_and(|expires| *expires > now);
                state.typing.insert(user.clone(), now + self.typing_expiry);
                !was_typing
            }
            TypingPhase::Stopped => state
                .typing
                .remove(user)
                .is_some_and(|expires| expires > now),
        }
    }

    /// Whether `user` is online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.state.lock().online.contains(user)
    }

    /// Whether `user` is typing toward the current user.
    #[must_use]
    pub fn is_typing(&self, user: &UserId) -> bool {
        self.state
            .lock()
            .typing
            .get(user)
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Online users, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.state.lock().online.iter().cloned().collect();
        users.sort();
        users
    }

    /// Users currently typing, sorted.
    #[must_use]
    pub fn typing_users(&self) -> Vec<UserId> {
        let now = Instant::now();
        let mut users: Vec<UserId> = self
            .state
            .lock()
            .typing
            .iter()
            .filter(|(_, expires)| **expires > now)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Drops expired typing marks and returns whose they were.
    pub fn prune_expired(&self) -> Vec<UserId> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<UserId> = state
            .typing
            .iter()
            .filter(|(_, expires)| **expires <= now)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            state.typing.remove(user);
        }
        expired
    }

    /// Forgets everything (connection lost).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.online.clear();
        state.typing.clear();
    }
}

#[derive(Debug, Default)]
struct Burst {
    receiver: Option<UserId>,
    generation: u64,
}

struct NotifierInner<C: Connector> {
    connection: ConnectionManager<C>,
    idle: Duration,
    burst: Mutex<Burst>,
}

/// Outbound typing notifications for the local user.
///
/// Fire-and-forget: publish failures are logged and otherwise ignored.
pub struct TypingNotifier<C: Connector> {
    inner: Arc<NotifierInner<C>>,
}

impl<C: Connector> Clone for TypingNotifier<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> TypingNotifier<C> {
    /// Creates a notifier that stops a burst after `idle` without input.
    #[must_use]
    pub fn new(connection: ConnectionManager<C>, idle: Duration) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                connection,
                idle,
                burst: Mutex::new(Burst::default()),
            }),
        }
    }

    /// The local input box toward `receiver` now holds `text`.
    ///
    /// Starts a burst on the first non-empty input, re-arms the idle timer
    /// on every change, and stops the burst when the input becomes empty.
    /// Switching receivers stops the previous burst first.
    pub async fn input_changed(&self, receiver: &UserId, text: &str) {
        if text.trim().is_empty() {
            self.blur().await;
            return;
        }

        let (stop_previous, start, generation) = {
            let mut burst = self.inner.burst.lock();
            let (stop_previous, start) = match &burst.receiver {
                Some(current) if current == receiver => (None, false),
                Some(current) => (Some(current.clone()), true),
                None => (None, true),
            };
            burst.receiver = Some(receiver.clone());
            burst.generation += 1;
            (stop_previous, start, burst.generation)
        };
        if let Some(previous) = stop_previous {
            self.publish(ClientEvent::TypingStop {
                receiver_id: previous,
            })
            .await;
        }
        if start {
            self.publish(ClientEvent::TypingStart {
                receiver_id: receiver.clone(),
            })
            .await;
        }
        self.arm_idle_stop(generation);
    }

    /// The input lost focus or was cleared: stop the current burst, if any.
    pub async fn blur(&self) {
        let receiver = {
            let mut burst = self.inner.burst.lock();
            burst.generation += 1;
            burst.receiver.take()
        };
        if let Some(receiver) = receiver {
            self.publish(ClientEvent::TypingStop {
                receiver_id: receiver,
            })
            .await;
        }
    }

    /// Receiver of the current burst, if one is active.
    #[must_use]
    pub fn active_receiver(&self) -> Option<UserId> {
        self.inner.burst.lock().receiver.clone()
    }

    fn arm_idle_stop(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let idle = self.inner.idle;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let receiver = {
                let mut burst = inner.burst.lock();
                if burst.generation != generation {
                    return;
                }
                burst.receiver.take()
            };
            if let Some(receiver) = receiver {
                tracing::trace!(receiver = %receiver, "typing idle, stopping");
                Self { inner }
                    .publish(ClientEvent::TypingStop {
                        receiver_id: receiver,
                    })
                    .await;
            }
        });
    }

    async fn publish(&self, event: ClientEvent) {
        if let Err(e) = self.inner.connection.publish(&event).await {
            tracing::debug!(event = event.name(), err = %e, "typing notification dropped");
        }
    }
}
