//! Integration tests for the opsync mailbox queue

mod config_integration;
mod conflict_detection;
mod coordinator_flow;
mod file_store;
mod retry_scheduling;
mod test_utils;
mod worker_exchange;
