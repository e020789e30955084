pub mod config;
pub mod event;
pub mod live;
pub mod pricing;
pub mod session;
pub mod trace;
pub mod transcript;
pub mod usage;
