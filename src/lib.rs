//! Bad block management for raw NAND flash.
//!
//! Raw NAND controllers leave bad-block bookkeeping to software. This crate
//! keeps a persistent Bad Block Table in a small reserved range of blocks
//! (see [`bbt`] for the on-flash format), answers block-health queries, and
//! multiplexes the device into partitions that each see their own translated
//! view of the table (see [`part`]).

pub mod bbt;
mod error;
pub mod nand;
pub mod part;

pub use error::{BadBlockError, Result};
