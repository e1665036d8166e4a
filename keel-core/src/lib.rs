//! Keel core - ambient utilities shared by every Keel crate.

pub mod cli;
pub mod collections;
pub mod log;
