#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Real-time voice sessions against a remote conversational agent.

pub mod config;
pub mod voice;

pub use config::Config;
