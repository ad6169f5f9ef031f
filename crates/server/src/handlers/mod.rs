//! HTTP request handlers.

pub mod admin;
pub mod object;

pub use admin::{admin_options, config_echo, manifest, status};
pub use object::data_object;
