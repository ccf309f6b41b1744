pub mod catalog;
pub mod config;
pub mod datasets;
pub mod fetch;
pub mod ledger;
pub mod scheduler;
pub mod statlog;
pub mod status;
pub mod submit;
pub mod supervisor;
