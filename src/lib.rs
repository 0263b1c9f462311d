pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod setting_kinds;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::GuildStore;
