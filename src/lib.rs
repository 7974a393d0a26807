//! dbchef: reproducible dev/test database environments.
//!
//! Recipes are folders of YAML step files bound to datasources by tag.
//! Steps sharing a priority form a tier; tiers run in ascending order and a
//! failing tier cancels its siblings and stops the recipe.

pub mod cli;
pub mod connect;
pub mod core;
pub mod journal;
pub mod steps;
