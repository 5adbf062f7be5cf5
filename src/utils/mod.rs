//! Small shared helpers.

pub mod command;
pub mod hash;
