mod accounts;
mod history;

pub use accounts::{Account, AccountError, AccountStore, Plan, ResearchReservation};
pub use history::{HistoryStore, InMemoryHistoryStore, StoreError};
