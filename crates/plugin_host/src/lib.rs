//! Plugin host - registry and built-in plugins
//!
//! `PluginManager` keeps one prototype per plugin id and hands out fresh
//! unconfigured clones on every `resolve`.

mod builtin;
mod manager;

pub use builtin::{InventoryPlugin, SizeLimitPlugin};
pub use manager::PluginManager;
