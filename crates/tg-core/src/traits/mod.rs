//! Core trait definitions

mod registry;

pub use registry::{CasOutcome, JoinRecord, SessionRecord, SessionRegistry};
