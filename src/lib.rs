pub mod backends;
pub mod endpoints;
pub mod error;
pub mod setup;
