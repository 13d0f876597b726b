//! Online book store backend: catalog, accounts, favorites, download
//! history, personal library and paid-book checkout behind a JSON API.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod payment;
pub mod server;
pub mod userdata;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use db::Database;
pub use error::{AppError, Result};
