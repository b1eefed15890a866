pub mod checker;
pub mod dispatcher;
pub mod download;
pub mod installer;
pub mod manager;
pub mod manifest;
pub mod providers;
pub mod session;
pub mod spigot_session;
pub mod store;
pub mod triage;
