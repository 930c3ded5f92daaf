//! Thompson-sampling selection among the live candidate configurations of
//! one signal source.

pub mod thompson;

pub use thompson::{Arm, BanditConfig, ThompsonSelector};
