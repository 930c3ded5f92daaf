pub mod config;
pub mod error;
pub mod store;
pub mod trial;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use store::{OutcomeStore, PricePathFeed, TrialLog};
pub use trial::{ObjectiveVector, RunRecord, Trial, TrialState};
pub use types::*;
