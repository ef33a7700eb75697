use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{AccountSeed, ResearchCredits};

/// Length of one points/research billing window.
pub const BILLING_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub points: f64,
    #[serde(default)]
    pub bonus_points: f64,
    /// Models this plan may use; empty allows every model.
    #[serde(default)]
    pub active_models: Vec<String>,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price <= 0.0
    }

    pub fn allows(&self, model_id: &str) -> bool {
        self.active_models.is_empty() || self.active_models.iter().any(|m| m == model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccountError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("Monthly research limit reached, available in {available_in_days} days")]
    QuotaExceeded { available_in_days: i64 },

    #[error("Your plan is out of date")]
    PlanExpired,

    #[error("You have exceeded your available points")]
    PointsExhausted,

    #[error("You don't have access to model {0}")]
    ModelNotAllowed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub email: String,
    pub plan: Plan,
    pub points_used: f64,
    pub points_reset_date: DateTime<Utc>,
    pub plan_end_date: Option<DateTime<Utc>>,
    research_runs: Vec<DateTime<Utc>>,
}

impl Account {
    pub fn new(email: impl Into<String>, plan: Plan, points_reset_date: DateTime<Utc>) -> Self {
        Self {
            email: email.into(),
            plan,
            points_used: 0.0,
            points_reset_date,
            plan_end_date: None,
            research_runs: Vec::new(),
        }
    }

    fn from_seed(seed: &AccountSeed, now: DateTime<Utc>) -> Self {
        Self {
            points_used: seed.points_used,
            plan_end_date: seed.plan_end_date,
            ..Self::new(
                seed.email.clone(),
                seed.plan.clone(),
                seed.points_reset_date
                    .unwrap_or_else(|| now + Duration::days(BILLING_WINDOW_DAYS)),
            )
        }
    }

    pub fn available_points(&self) -> f64 {
        self.plan.points + self.plan.bonus_points
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.points_reset_date - Duration::days(BILLING_WINDOW_DAYS)
    }

    /// Research runs recorded in the current window.
    pub fn research_runs(&self) -> usize {
        let start = self.window_start();
        self.research_runs.iter().filter(|at| **at >= start).count()
    }

    fn roll_window(&mut self, now: DateTime<Utc>) {
        while now >= self.points_reset_date {
            self.points_reset_date += Duration::days(BILLING_WINDOW_DAYS);
            self.points_used = 0.0;
            debug!("Rolled billing window for {}", self.email);
        }
        let start = self.window_start();
        self.research_runs.retain(|at| *at >= start);
    }
}

/// Whole days until `reset`, rounded to the nearest day.
pub fn days_until(reset: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (reset - now).num_milliseconds() as f64;
    (millis / Duration::days(1).num_milliseconds() as f64).round() as i64
}

/// Proof that a research run was counted against the monthly quota.
#[derive(Debug, Clone, PartialEq)]
pub struct ResearchReservation {
    pub email: String,
    pub at: DateTime<Utc>,
}

/// In-memory user accounts keyed by e-mail, with bearer-token lookup.
///
/// Each mutation runs under the account's map entry lock, so the research
/// quota is checked and reserved in one step.
#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: DashMap<String, Account>,
    tokens: DashMap<String, String>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: &[AccountSeed], now: DateTime<Utc>) -> Self {
        let store = Self::new();
        for seed in seeds {
            store.insert(seed.token.clone(), Account::from_seed(seed, now));
        }
        info!("Loaded {} accounts", store.accounts.len());
        store
    }

    pub fn insert(&self, token: impl Into<String>, account: Account) {
        self.tokens.insert(token.into(), account.email.clone());
        self.accounts.insert(account.email.clone(), account);
    }

    pub fn authenticate(&self, token: &str) -> Option<Account> {
        let email = self.tokens.get(token)?.value().clone();
        self.get(&email)
    }

    pub fn get(&self, email: &str) -> Option<Account> {
        self.accounts.get(email).map(|entry| entry.value().clone())
    }

    pub fn reserve_research(
        &self,
        email: &str,
        credits: &ResearchCredits,
        now: DateTime<Utc>,
    ) -> Result<ResearchReservation, AccountError> {
        let mut account = self
            .accounts
            .get_mut(email)
            .ok_or_else(|| AccountError::UnknownAccount(email.to_string()))?;
        account.roll_window(now);

        let limit = credits.for_plan(&account.plan) as usize;
        let used = account.research_runs();
        if used >= limit {
            let available_in_days = days_until(account.points_reset_date, now);
            info!(
                "Research quota exhausted for {} ({}/{}), resets in {} days",
                email, used, limit, available_in_days
            );
            return Err(AccountError::QuotaExceeded { available_in_days });
        }

        account.research_runs.push(now);
        debug!("Reserved research run {}/{} for {}", used + 1, limit, email);
        Ok(ResearchReservation {
            email: email.to_string(),
            at: now,
        })
    }

    /// Gives back a reservation whose run never got past planning.
    pub fn release_research(&self, reservation: &ResearchReservation) {
        if let Some(mut account) = self.accounts.get_mut(&reservation.email) {
            if let Some(pos) = account.research_runs.iter().position(|at| *at == reservation.at) {
                account.research_runs.remove(pos);
            }
        }
    }

    pub fn check_generation(
        &self,
        email: &str,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AccountError> {
        let mut account = self
            .accounts
            .get_mut(email)
            .ok_or_else(|| AccountError::UnknownAccount(email.to_string()))?;
        account.roll_window(now);

        if !account.plan.is_free() && account.plan_end_date.is_some_and(|end| end < now) {
            return Err(AccountError::PlanExpired);
        }
        if account.available_points() < account.points_used {
            return Err(AccountError::PointsExhausted);
        }
        if !account.plan.allows(model_id) {
            return Err(AccountError::ModelNotAllowed(model_id.to_string()));
        }
        Ok(())
    }

    pub fn charge(&self, email: &str, points: f64, now: DateTime<Utc>) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.roll_window(now);
            account.points_used += points;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plan(price: f64) -> Plan {
        Plan {
            id: if price > 0.0 { "pro" } else { "free" }.to_string(),
            name: String::new(),
            price,
            points: 100.0,
            bonus_points: 10.0,
            active_models: vec!["gpt-4o-mini".to_string()],
        }
    }

    fn store_with(account: Account) -> AccountStore {
        let store = AccountStore::new();
        store.insert("token", account);
        store
    }

    #[test]
    fn authenticate_resolves_tokens() {
        let now = Utc::now();
        let store = store_with(Account::new("a@example.com", plan(0.0), now + Duration::days(3)));
        assert_eq!(store.authenticate("token").unwrap().email, "a@example.com");
        assert!(store.authenticate("other").is_none());
    }

    #[test]
    fn quota_blocks_after_credits_and_reports_days() {
        let now = Utc::now();
        let store = store_with(Account::new("a@example.com", plan(20.0), now + Duration::days(12)));
        let credits = ResearchCredits::default();

        for _ in 0..20 {
            store.reserve_research("a@example.com", &credits, now).unwrap();
        }
        assert_eq!(
            store.reserve_research("a@example.com", &credits, now),
            Err(AccountError::QuotaExceeded { available_in_days: 12 })
        );
    }

    #[test]
    fn free_plan_gets_free_credits() {
        let now = Utc::now();
        let store = store_with(Account::new("a@example.com", plan(0.0), now + Duration::days(1)));
        let credits = ResearchCredits::default();
        assert!(store.reserve_research("a@example.com", &credits, now).is_ok());
        assert!(store.reserve_research("a@example.com", &credits, now).is_ok());
        assert!(store.reserve_research("a@example.com", &credits, now).is_err());
    }

    #[test]
    fn released_reservation_frees_a_slot() {
        let now = Utc::now();
        let store = store_with(Account::new("a@example.com", plan(0.0), now + Duration::days(1)));
        let credits = ResearchCredits { free: 1, pro: 1 };
        let reservation = store.reserve_research("a@example.com", &credits, now).unwrap();
        assert!(store.reserve_research("a@example.com", &credits, now).is_err());
        store.release_research(&reservation);
        assert!(store.reserve_research("a@example.com", &credits, now).is_ok());
    }

    #[test]
    fn window_rolls_forward_and_resets_usage() {
        let now = Utc::now();
        let store = store_with(Account::new("a@example.com", plan(0.0), now - Duration::days(1)));
        let credits = ResearchCredits::default();
        store.charge("a@example.com", 50.0, now - Duration::days(2));
        store.reserve_research("a@example.com", &credits, now).unwrap();

        let account = store.get("a@example.com").unwrap();
        assert_eq!(account.points_reset_date, now + Duration::days(29));
        assert_eq!(account.points_used, 0.0);
        assert_eq!(account.research_runs(), 1);
    }

    #[test]
    fn generation_gates() {
        let now = Utc::now();
        let mut expired = Account::new("a@example.com", plan(20.0), now + Duration::days(5));
        expired.plan_end_date = Some(now - Duration::days(1));
        assert_eq!(
            store_with(expired).check_generation("a@example.com", "gpt-4o-mini", now),
            Err(AccountError::PlanExpired)
        );

        let mut spent = Account::new("a@example.com", plan(0.0), now + Duration::days(5));
        spent.points_used = 111.0;
        assert_eq!(
            store_with(spent).check_generation("a@example.com", "gpt-4o-mini", now),
            Err(AccountError::PointsExhausted)
        );

        let store = store_with(Account::new("a@example.com", plan(0.0), now + Duration::days(5)));
        assert_eq!(
            store.check_generation("a@example.com", "o1", now),
            Err(AccountError::ModelNotAllowed("o1".to_string()))
        );
        assert!(store.check_generation("a@example.com", "gpt-4o-mini", now).is_ok());
    }

    #[test]
    fn rounding_of_days_until_reset() {
        let now = Utc::now();
        assert_eq!(days_until(now + Duration::hours(36), now), 2);
        assert_eq!(days_until(now + Duration::hours(35), now), 1);
        assert_eq!(days_until(now - Duration::hours(12), now), -1);
    }
}
