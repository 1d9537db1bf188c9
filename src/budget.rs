// ai-writer-service/src/budget.rs

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::{BudgetSnapshot, BudgetState};
use crate::persistence::KeyValueStore;

const LEDGER_KEY: &str = "budget/ledger";

/// Injectable calendar source so day-rollover logic is testable.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock with a fixed, configurable day boundary offset from UTC.
pub struct SystemClock {
    day_boundary_offset_hours: i64,
}

impl SystemClock {
    pub fn new(day_boundary_offset_hours: i64) -> Self {
        Self {
            day_boundary_offset_hours,
        }
    }
}

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        (Utc::now() + Duration::hours(self.day_boundary_offset_hours)).date_naive()
    }
}

/// Test clock pinned to a settable date.
pub struct FixedClock {
    today: std::sync::RwLock<NaiveDate>,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: std::sync::RwLock::new(today),
        }
    }

    pub fn set_today(&self, today: NaiveDate) {
        *self.today.write().unwrap() = today;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.today.read().unwrap()
    }
}

/// Static quota policy. The pre-flight gate closes at `daily_limit`; the
/// `bonus` is overrun headroom for usage reported after the fact, counted
/// only in the effective limit shown to callers.
#[derive(Debug, Clone, Copy)]
pub struct BudgetPolicy {
    pub daily_limit: u64,
    pub bonus: u64,
}

impl BudgetPolicy {
    pub fn effective_limit(&self) -> u64 {
        self.daily_limit + self.bonus
    }
}

/// Daily token ledger: single instance per process, one lock around the
/// whole read-reset-evaluate sequence.
///
/// The ledger never refuses to account. `check_budget` is the pre-flight
/// gate; `consume` records whatever the provider reported, even past the
/// soft cap, because usage arrives after the fact. Store write failures
/// are logged and accounting continues in memory.
pub struct BudgetLedger {
    state: Mutex<BudgetState>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: BudgetPolicy,
}

impl BudgetLedger {
    /// Read persisted state (if any) and take ownership of it.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        policy: BudgetPolicy,
    ) -> Self {
        let state = match store.get(LEDGER_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<BudgetState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "Stored budget ledger unreadable, starting fresh");
                    BudgetState {
                        date: clock.today(),
                        tokens_used_today: 0,
                    }
                }
            },
            Ok(None) => BudgetState {
                date: clock.today(),
                tokens_used_today: 0,
            },
            Err(e) => {
                warn!(error = %e, "Budget store unreachable, starting fresh");
                BudgetState {
                    date: clock.today(),
                    tokens_used_today: 0,
                }
            }
        };

        Self {
            state: Mutex::new(state),
            store,
            clock,
            policy,
        }
    }

    /// Zero the counter and stamp the new date if the stored day is stale.
    /// Must run under the lock before any evaluation.
    fn reset_if_stale(&self, state: &mut BudgetState) -> bool {
        let today = self.clock.today();
        if state.date != today {
            debug!(old = %state.date, new = %today, "Budget day rolled over, resetting");
            state.date = today;
            state.tokens_used_today = 0;
            true
        } else {
            false
        }
    }

    async fn persist(&self, state: &BudgetState) {
        match serde_json::to_string(state) {
            Ok(encoded) => {
                if let Err(e) = self.store.put(LEDGER_KEY, &encoded).await {
                    warn!(error = %e, "Failed to persist budget ledger");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode budget ledger"),
        }
    }

    fn snapshot_of(&self, state: &BudgetState) -> BudgetSnapshot {
        let effective_limit = self.policy.effective_limit();
        BudgetSnapshot {
            date: state.date,
            tokens_used_today: state.tokens_used_today,
            effective_limit,
            remaining: effective_limit.saturating_sub(state.tokens_used_today),
        }
    }

    /// Pre-flight gate: would `estimated_cost` more tokens stay within the
    /// daily limit?
    pub async fn check_budget(&self, estimated_cost: u64) -> bool {
        let mut state = self.state.lock().await;
        if self.reset_if_stale(&mut state) {
            self.persist(&state).await;
        }
        state.tokens_used_today + estimated_cost <= self.policy.daily_limit
    }

    /// Record actual usage reported after a call. May exceed the soft cap.
    pub async fn consume(&self, actual_cost: u64) -> BudgetSnapshot {
        let mut state = self.state.lock().await;
        self.reset_if_stale(&mut state);
        state.tokens_used_today += actual_cost;
        self.persist(&state).await;
        debug!(
            tokens = actual_cost,
            used_today = state.tokens_used_today,
            "Charged token usage"
        );
        self.snapshot_of(&state)
    }

    pub async fn remaining(&self) -> u64 {
        self.snapshot().await.remaining
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.state.lock().await;
        if self.reset_if_stale(&mut state) {
            self.persist(&state).await;
        }
        self.snapshot_of(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn ledger_with(
        used: u64,
        clock: Arc<FixedClock>,
        store: Arc<InMemoryStore>,
    ) -> BudgetLedger {
        let state = BudgetState {
            date: clock.today(),
            tokens_used_today: used,
        };
        store
            .put(LEDGER_KEY, &serde_json::to_string(&state).unwrap())
            .await
            .unwrap();
        BudgetLedger::load(
            store,
            clock,
            BudgetPolicy {
                daily_limit: 5000,
                bonus: 500,
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_gate_closes_at_daily_limit_not_bonus() {
        let clock = Arc::new(FixedClock::new(date(2025, 3, 1)));
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(5400, clock, store).await;

        // Past the daily limit: the gate is closed even for one token,
        // though the bonus headroom still shows as remaining.
        assert!(!ledger.check_budget(1).await);
        assert_eq!(ledger.remaining().await, 100);
    }

    #[tokio::test]
    async fn test_gate_open_below_daily_limit() {
        let clock = Arc::new(FixedClock::new(date(2025, 3, 1)));
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(3000, clock, store).await;

        assert!(ledger.check_budget(2000).await);
        assert!(!ledger.check_budget(2001).await);
    }

    #[tokio::test]
    async fn test_day_rollover_resets_lazily() {
        let clock = Arc::new(FixedClock::new(date(2025, 3, 1)));
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(5400, Arc::clone(&clock), store).await;

        assert!(!ledger.check_budget(1000).await);

        clock.set_today(date(2025, 3, 2));
        assert!(ledger.check_budget(1).await);

        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.date, date(2025, 3, 2));
        assert_eq!(snapshot.tokens_used_today, 0);
        assert_eq!(snapshot.remaining, 5500);
    }

    #[tokio::test]
    async fn test_consume_past_soft_cap_is_accounted_not_refused() {
        let clock = Arc::new(FixedClock::new(date(2025, 3, 1)));
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(5400, clock, store).await;

        let snapshot = ledger.consume(700).await;
        assert_eq!(snapshot.tokens_used_today, 6100);
        assert_eq!(snapshot.remaining, 0);
    }

    #[tokio::test]
    async fn test_consume_persists_through_store() {
        let clock = Arc::new(FixedClock::new(date(2025, 3, 1)));
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger_with(0, Arc::clone(&clock), Arc::clone(&store)).await;

        ledger.consume(250).await;

        // A fresh ledger over the same store sees the charge.
        let reloaded = BudgetLedger::load(
            store,
            clock,
            BudgetPolicy {
                daily_limit: 5000,
                bonus: 500,
            },
        )
        .await;
        assert_eq!(reloaded.snapshot().await.tokens_used_today, 250);
    }
}
