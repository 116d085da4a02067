//! Generic utility primitives with zero domain knowledge.
//!
//! - `shell` - Shell escaping and quoting
//! - `template` - `%key%` placeholder rendering

pub mod shell;
pub mod template;
