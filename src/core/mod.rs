//! Core model: configuration, datasources, tag resolution, step lifecycle and scheduling.

pub mod cookbook;
pub mod error;
pub mod executor;
pub mod parser;
pub mod recipe;
pub mod registry;
pub mod resolver;
pub mod step;
pub mod template;
pub mod types;
