//! CLI Commands

pub mod admin;
pub mod tunnel;
