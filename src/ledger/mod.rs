//! Hierarchy lookup, commission cascade and ledger posting

pub mod cascade;
pub mod hierarchy;
pub mod poster;

pub use cascade::{
    CascadeMode, CascadeOutcome, CascadePolicy, CommissionCascade, CommissionRequest, FlowFlags,
    PostedLevel,
};
pub use hierarchy::HierarchyResolver;
pub use poster::{LedgerDeltas, LedgerEntry, LedgerPoster};
