//! Target providers shipped with the binary

pub mod list;

pub use list::{ListProvider, ListSettings};
