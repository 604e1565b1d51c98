//! Notification Backoff
//!
//! Discovered entities and facts are surfaced proactively, but an idle
//! user should hear from us less and less. Each user carries a delay
//! that starts at zero, doubles with every proactive send that goes
//! unacknowledged (0 → 1 → 2 → 4 … minutes), and snaps back to zero on
//! any user action. One notification per (entity, new-fact-set) pair;
//! each queues and releases independently.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

/// What was discovered
#[derive(Debug, Clone)]
pub enum Discovery {
    /// A brand-new entity with its tagline
    NewEntity { tagline: String },
    /// New facts on an already-known entity
    NewFacts { facts: Vec<String> },
}

/// One proactive message about one entity
#[derive(Debug, Clone)]
pub struct Notification {
    pub user_id: i64,
    pub entity_id: String,
    pub entity_name: String,
    pub discovery: Discovery,
    pub created_at: i64,
}

/// Delivery boundary; the chat adapter implements this.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Fallback notifier for hosts without a chat adapter wired in
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        match &notification.discovery {
            Discovery::NewEntity { tagline } => info!(
                "Discovered entity for user {}: {} ({})",
                notification.user_id, notification.entity_name, tagline
            ),
            Discovery::NewFacts { facts } => info!(
                "Learned {} new fact(s) about {} for user {}",
                facts.len(),
                notification.entity_name,
                notification.user_id
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct UserBackoff {
    /// Proactive sends since the last user action
    consecutive_sends: u32,
    /// Unix seconds before which nothing more may be sent
    next_allowed_at: i64,
    pending: VecDeque<Notification>,
}

/// Per-user doubling-delay governor
pub struct BackoffGovernor {
    base_delay: Duration,
    users: Mutex<HashMap<i64, UserBackoff>>,
}

impl BackoffGovernor {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Any user-originated action (message, reaction, command) resets
    /// the delay to zero.
    pub fn record_user_action(&self, user_id: i64) {
        let mut users = self.users.lock();
        let state = users.entry(user_id).or_default();
        state.consecutive_sends = 0;
        state.next_allowed_at = 0;
        debug!("Backoff reset for user {}", user_id);
    }

    /// Queue a discovery for delivery
    pub fn submit(&self, notification: Notification) {
        let mut users = self.users.lock();
        users
            .entry(notification.user_id)
            .or_default()
            .pending
            .push_back(notification);
    }

    /// Notifications due at `now`, in submission order. Each release
    /// doubles the delay before the next one.
    pub fn release_due(&self, user_id: i64, now: i64) -> Vec<Notification> {
        let mut users = self.users.lock();
        let state = match users.get_mut(&user_id) {
            Some(s) => s,
            None => return vec![],
        };

        let mut released = Vec::new();
        while !state.pending.is_empty() && now >= state.next_allowed_at {
            let notification = state.pending.pop_front().unwrap();
            state.consecutive_sends += 1;
            let delay = Self::delay_after(self.base_delay, state.consecutive_sends);
            state.next_allowed_at = now + delay.as_secs() as i64;
            released.push(notification);
        }

        if !released.is_empty() {
            debug!(
                "Released {} notification(s) for user {}, next delay {:?}",
                released.len(),
                user_id,
                Self::delay_after(self.base_delay, state.consecutive_sends)
            );
        }
        released
    }

    /// Delay applied after N consecutive unacknowledged sends:
    /// base × 2^(N-1), zero before the first send.
    fn delay_after(base: Duration, consecutive_sends: u32) -> Duration {
        if consecutive_sends == 0 {
            return Duration::ZERO;
        }
        base * 2_u32.saturating_pow(consecutive_sends - 1)
    }

    /// The delay currently in force for the user's next notification
    pub fn current_delay(&self, user_id: i64) -> Duration {
        let users = self.users.lock();
        users
            .get(&user_id)
            .map(|s| Self::delay_after(self.base_delay, s.consecutive_sends))
            .unwrap_or(Duration::ZERO)
    }

    pub fn pending_count(&self, user_id: i64) -> usize {
        let users = self.users.lock();
        users.get(&user_id).map(|s| s.pending.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn notification(user_id: i64, entity: &str) -> Notification {
        Notification {
            user_id,
            entity_id: entity.to_string(),
            entity_name: entity.to_string(),
            discovery: Discovery::NewFacts {
                facts: vec!["a fact".to_string()],
            },
            created_at: 0,
        }
    }

    #[test]
    fn test_first_notification_immediate() {
        let governor = BackoffGovernor::new(MINUTE);
        governor.submit(notification(1, "nvidia"));

        let released = governor.release_due(1, 0);
        assert_eq!(released.len(), 1);
        assert_eq!(governor.current_delay(1), MINUTE);
    }

    #[test]
    fn test_delay_doubles_per_unacknowledged_send() {
        let governor = BackoffGovernor::new(MINUTE);

        let mut now = 0;
        for expected_minutes in [1_u64, 2, 4, 8] {
            governor.submit(notification(1, "nvidia"));
            let released = governor.release_due(1, now);
            assert_eq!(released.len(), 1);
            assert_eq!(
                governor.current_delay(1),
                MINUTE * expected_minutes as u32,
                "after send with expected delay {}m",
                expected_minutes
            );
            // Jump past the new delay so the next one releases
            now += (60 * expected_minutes) as i64;
        }
    }

    #[test]
    fn test_not_due_stays_pending() {
        let governor = BackoffGovernor::new(MINUTE);
        governor.submit(notification(1, "a"));
        governor.submit(notification(1, "b"));

        // First goes out, second is inside the 1-minute window
        let released = governor.release_due(1, 0);
        assert_eq!(released.len(), 1);
        assert_eq!(governor.pending_count(1), 1);

        assert!(governor.release_due(1, 30).is_empty());
        assert_eq!(governor.release_due(1, 61).len(), 1);
    }

    #[test]
    fn test_user_action_resets_delay() {
        let governor = BackoffGovernor::new(MINUTE);

        let mut now = 0;
        for _ in 0..4 {
            governor.submit(notification(1, "nvidia"));
            governor.release_due(1, now);
            now += 600;
        }
        assert_eq!(governor.current_delay(1), MINUTE * 8);

        governor.record_user_action(1);
        assert_eq!(governor.current_delay(1), Duration::ZERO);

        // Next notification goes out immediately again
        governor.submit(notification(1, "nvidia"));
        assert_eq!(governor.release_due(1, now).len(), 1);
    }

    #[test]
    fn test_users_are_independent() {
        let governor = BackoffGovernor::new(MINUTE);
        governor.submit(notification(1, "a"));
        governor.release_due(1, 0);

        governor.submit(notification(2, "b"));
        assert_eq!(governor.release_due(2, 0).len(), 1);
        assert_eq!(governor.current_delay(1), MINUTE);
        assert_eq!(governor.current_delay(2), MINUTE);
    }
}
