//! Command-line front end of the upscaling engine
//!
//! Only built with the `cli` feature.

mod config;
#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, Cli, CliContentHint, CliOutputFormat};
