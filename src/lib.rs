#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod observability;
pub mod params;
pub mod pipeline;
pub mod runner;
pub mod table;
pub mod util;
