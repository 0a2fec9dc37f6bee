//! Persistent bad block table ("BBT") management for raw NAND.
//!
//! NAND blocks wear out and fail in the field, so the set of unusable blocks
//! has to live on the flash itself, in blocks that can themselves go bad. The
//! table is kept log-structured inside a small reserved range of blocks:
//!
//! ```text
//! /========== reserved block 60 ==========\  /== block 61 ==\
//! | record gen 3 | record gen 4 | (free)  |  |   (erased)   |  ...
//! | page 0..s    | page s..2s   |         |  |              |
//! \=======================================/  \==============/
//! ```
//!
//! Each record is the whole table image written across `s` consecutive pages
//! (one byte of status per block, `s` = table bytes rounded up to pages), and
//! every page of a record carries an OOB header with a magic, the host
//! block's program/erase count, and a generation number. On first use the
//! reserved range is scanned, the block holding the highest generation wins,
//! and the last *complete* record in it is loaded; a torn tail makes the
//! table migrate to a different reserved block on the next write. Hosts are
//! chosen by lowest wear, and a host that fails to erase or program is
//! itself marked bad in the table it was hosting.

mod discovery;
mod io;
mod oob;
mod reserved;
mod writer;

pub use oob::{OobHeader, BBT_MAGIC};
pub use reserved::MAX_RESERVED;

use std::sync::{Arc, Mutex};

use log::error;

use crate::nand::NandController;
use crate::{BadBlockError, Result};
use io::NandIo;
use reserved::ReservedRegion;

/// Reads attempted per reserved block before it is deemed untrustworthy
pub const DISCOVERY_READ_ATTEMPTS: u32 = 6;

/// Table status byte: block is usable
pub const BLOCK_GOOD: u8 = 0x00;

/// Table status byte: block must not be used again
pub const BLOCK_BAD: u8 = 0x01;

/// Platform configuration: the inclusive range of blocks reserved for table
/// copies.
#[derive(Debug, Copy, Clone)]
pub struct BadBlockConfig {
    pub table_start_block: u32,
    pub table_end_block: u32,
}

impl BadBlockConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let spread = self
            .table_end_block
            .checked_sub(self.table_start_block)
            .unwrap_or(0);
        if spread == 0 || spread as usize >= MAX_RESERVED {
            error!("unsupported number of blocks used for BBT");
            return Err(BadBlockError::NotSupported);
        }
        Ok(())
    }
}

/// Where the next table record will land
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TableLocation {
    /// The block currently hosting the table
    pub block: u32,

    /// The next free page offset within the host
    pub page: u32,

    /// The generation the next record will carry
    pub generation: u16,
}

/// Everything behind the lock: buffers, reserved-region state, and the
/// current-host cursor.
pub(crate) struct Core {
    io: NandIo,
    config: BadBlockConfig,
    reserved: ReservedRegion,
    host: Option<usize>,
    page: u32,
    generation: u16,
    found: bool,
}

impl Core {
    /// Pages per table record
    fn stride(&self) -> u32 {
        let info = self.io.info();
        (info.num_blocks as usize).div_ceil(info.page_size) as u32
    }

    fn block_status(&self, block: u32) -> u8 {
        self.io.table()[block as usize]
    }

    fn set_block_status(&mut self, block: u32, status: u8) {
        self.io.table()[block as usize] = status;
    }
}

/// The bad block table service.
///
/// All entry points serialise on one lock and lazily locate the on-flash
/// table the first time any of them is called.
pub struct BadBlockTable {
    core: Mutex<Core>,
}

impl BadBlockTable {
    /// Build over a controller; allocates the DMA buffers, performs no I/O
    pub fn new(controller: Arc<dyn NandController>, config: BadBlockConfig) -> Self {
        let io = NandIo::new(controller);
        Self {
            core: Mutex::new(Core {
                io,
                config,
                reserved: ReservedRegion::default(),
                host: None,
                page: 0,
                generation: 0,
                found: false,
            }),
        }
    }

    /// Is `block` recorded as unusable?
    pub fn is_bad(&self, block: u32) -> Result<bool> {
        let mut core = self.core.lock().unwrap();
        core.ensure_found()?;

        if block >= core.io.info().num_blocks {
            return Err(BadBlockError::OutOfRange { block });
        }

        Ok(core.block_status(block) != BLOCK_GOOD)
    }

    /// All unusable blocks in the half-open range `[first, last)`
    pub fn list_bad(&self, first: u32, last: u32) -> Result<Vec<u32>> {
        let mut core = self.core.lock().unwrap();
        core.ensure_found()?;

        let num_blocks = core.io.info().num_blocks;
        if first >= num_blocks || last > num_blocks {
            return Err(BadBlockError::InvalidArgs);
        }

        let table = core.io.table();
        let bad = |b: &u32| table[*b as usize] != BLOCK_GOOD;
        let count = (first..last).filter(|b| bad(b)).count();

        let mut bad_blocks = Vec::new();
        bad_blocks
            .try_reserve_exact(count)
            .map_err(|_| BadBlockError::NoMemory)?;
        bad_blocks.extend((first..last).filter(|b| bad(b)));

        Ok(bad_blocks)
    }

    /// Record `block` as unusable and persist a new table record.
    ///
    /// A no-op for blocks already recorded. On a device that has never held
    /// a table, the first call creates one.
    pub fn mark_bad(&self, block: u32) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let no_table_yet = match core.ensure_found() {
            Err(BadBlockError::NotFound) => true,
            other => {
                other?;
                false
            }
        };

        if block >= core.io.info().num_blocks {
            return Err(BadBlockError::OutOfRange { block });
        }

        if no_table_yet {
            core.start_empty_table();
        }

        // Early return if the block is already marked bad.
        if core.block_status(block) != BLOCK_GOOD {
            return Ok(());
        }
        core.set_block_status(block, BLOCK_BAD);

        core.write_table(false)
    }

    /// Where the next record will land; mainly for inspection tooling
    pub fn location(&self) -> Result<TableLocation> {
        let mut core = self.core.lock().unwrap();
        core.ensure_found()?;

        let host = core.host.ok_or(BadBlockError::Internal)?;
        Ok(TableLocation {
            block: core.reserved.get(host).block,
            page: core.page,
            generation: core.generation,
        })
    }
}
