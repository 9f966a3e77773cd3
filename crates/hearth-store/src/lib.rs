pub mod auth;
pub mod history;
pub mod lease;

pub use auth::AuthStore;
pub use history::{HistoryLog, NewEvent};
pub use lease::{LeaseStore, StoreOptions};
