/// Staleness and lock predicates for the recap card.
///
/// The predicates only decide whether an attempt is worthwhile. The lock is
/// actually taken by [`CardStore::try_claim_recap_lock`], which re-checks the
/// same condition atomically.
use crate::cards::StoredCard;
use crate::store::CardStore;
use chrono::{DateTime, Duration, Utc};

/// A missing card is stale. A card covering every current line is never
/// stale. Otherwise the card goes stale once `window` has elapsed since it was
/// computed; new lines alone do not force a regeneration.
pub fn is_stale(
    card: Option<&StoredCard>,
    current_line_count: u64,
    window: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(card) = card else {
        return true;
    };
    if card.up_to_line >= current_line_count {
        return false;
    }
    now - card.computed_at >= window
}

/// True when no lock is held or the held lock is at least `timeout` old.
pub fn can_acquire_lock(card: Option<&StoredCard>, timeout: Duration, now: DateTime<Utc>) -> bool {
    match card.and_then(|c| c.computing_started_at) {
        None => true,
        Some(started) => now - started >= timeout,
    }
}

/// Clears the recap lock when dropped, unless disarmed after a successful
/// write already released it.
pub(crate) struct LockGuard<'a, S: CardStore + ?Sized> {
    store: &'a S,
    session_id: &'a str,
    armed: bool,
}

impl<'a, S: CardStore + ?Sized> LockGuard<'a, S> {
    pub(crate) fn new(store: &'a S, session_id: &'a str) -> Self {
        Self {
            store,
            session_id,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S: CardStore + ?Sized> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.store.clear_recap_lock(self.session_id) {
            // The lock still expires on its own after the timeout.
            tracing::warn!(
                error = %e,
                session_id = self.session_id,
                "failed to release recap lock"
            );
        }
    }
}
