pub mod governor;
pub mod mapping;
pub mod orchestrator;
pub mod remote;
pub mod router;
pub mod tracker;
pub mod triggers;
