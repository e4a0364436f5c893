pub mod credentials;
pub mod daemon;
pub mod models;
pub mod store;
pub mod sync;
