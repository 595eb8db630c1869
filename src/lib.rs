#![deny(clippy::all, clippy::perf, clippy::correctness)]

#[macro_use]
extern crate log;

mod config;
mod constants;
mod error;
mod input;
mod metadata;
mod pieces;
mod runner;
mod sealer;
mod state;

pub use crate::config::*;
pub use crate::constants::*;
pub use crate::error::*;
pub use crate::input::Packer;
pub use crate::metadata::*;
pub use crate::pieces::*;
pub use crate::sealer::*;
pub use crate::state::{SectorEvent, SectorState};
