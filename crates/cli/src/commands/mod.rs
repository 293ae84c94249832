//! CLI Commands

pub mod peers;
