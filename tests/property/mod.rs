//! Property-based tests for opsync invariants

mod ordering;
mod similarity;
mod store_roundtrip;
