pub mod alerts;
pub mod builder;
pub mod merger;
mod types;

pub use types::{CandidateInterval, DetectionEvent, OpenInterval, PersonKey};
