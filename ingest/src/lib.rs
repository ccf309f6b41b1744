//! Receiving side of the solver bots: stores each distinct result once and hands out the job catalog.

pub mod dedup;
pub mod intake;
pub mod pather;
pub mod server;
