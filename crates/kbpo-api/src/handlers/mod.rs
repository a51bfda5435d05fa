//! API handlers
//!
//! Author: hephaex@gmail.com

pub mod batches;
pub mod health;
pub mod leaderboard;
pub mod submissions;
