pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
