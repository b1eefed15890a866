pub mod check;
pub mod config;
pub mod profile;
pub mod record;
pub mod summary;
pub mod version;
