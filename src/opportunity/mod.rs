//! Opportunity records and their stage state machine.

pub mod store;
pub mod types;

pub use store::OpportunityStore;
pub use types::{
    Competition, Opportunity, OpportunityCandidate, OpportunityFilter, REJECTED_STAGE,
};
