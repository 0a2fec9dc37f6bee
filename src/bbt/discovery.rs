//! Locating the freshest persisted copy of the bad block table.
//!
//! Discovery runs once, lazily, under the subsystem lock: scan the reserved
//! range for blocks that host table records, pick the block whose records
//! carry the highest generation, then walk that block stride by stride to
//! find the last complete record. An unreadable window in the middle of the
//! walk is a torn write: the previous complete record wins, and the table is
//! relocated off the suspect block before anything else happens.

use log::{error, info, trace};

use super::oob::OobHeader;
use super::{Core, BLOCK_GOOD, DISCOVERY_READ_ATTEMPTS};
use crate::{BadBlockError, Result};

impl Core {
    /// Run discovery if it hasn't succeeded yet
    pub(crate) fn ensure_found(&mut self) -> Result<()> {
        if self.found {
            return Ok(());
        }
        self.find_table()
    }

    fn find_table(&mut self) -> Result<()> {
        trace!("finding bad block table");

        let info = *self.io.info();
        if OobHeader::SIZE > info.oob_size {
            error!(
                "OOB too small: need {}, found {}",
                OobHeader::SIZE,
                info.oob_size
            );
            return Err(BadBlockError::NotSupported);
        }

        self.config.validate()?;
        let stride = self.stride();
        debug_assert!(stride > 0);

        trace!(
            "searching reserved blocks {}..={}",
            self.config.table_start_block,
            self.config.table_end_block
        );

        // First find the block the table lives in.
        self.reserved.clear();
        self.host = None;
        let mut any_readable = false;
        let mut all_erased = true;
        for block in self.config.table_start_block..=self.config.table_end_block {
            // Attempt a handful of reads at record offsets to see whether the
            // block is trustworthy at all.
            let mut page = block * info.pages_per_block;
            let mut result = Err(BadBlockError::Internal);
            for _ in 0..DISCOVERY_READ_ATTEMPTS {
                result = self.io.read_page(page, 0);
                if result.is_ok() {
                    break;
                }
                page += stride;
            }
            if result.is_err() {
                // This block is untrustworthy; leave it out of the candidate
                // set. TODO(policy): decide whether such blocks should be
                // marked bad or erased instead of silently dropped.
                error!("unable to read any pages in reserved block {block}");
                continue;
            }

            any_readable = true;
            let header = self.io.oob_header();

            // Wear is only knowable from a decoded header; an erased or
            // garbled OOB counts as fresh.
            let pe_cycles = header.map_or(0, |h| h.pe_cycles);
            let index = self.reserved.push(block, pe_cycles);

            match header {
                Some(header) => {
                    trace!("reserved block {block} has table records");
                    all_erased = false;
                    if header.generation >= self.generation {
                        self.host = Some(index);
                        self.generation = header.generation;
                    }
                }
                None => {
                    if !self.io.oob_is_erased() {
                        all_erased = false;
                    }
                }
            }
        }

        let Some(host) = self.host else {
            if any_readable && all_erased {
                // Nothing has ever been written here.
                info!("reserved region is erased; no table on this device");
                return Err(BadBlockError::NotFound);
            }
            error!("no reserved block carries a bad block table");
            return Err(BadBlockError::Internal);
        };
        let host_block = self.reserved.get(host).block;

        trace!("finding last table record in block {host_block}");

        // Next find the last complete record in the block. Whole windows of
        // `stride` pages stand or fall together.
        let mut found_one = false;
        let mut latest_entry_bad = true;
        let mut page = 0;
        'windows: while page + stride <= info.pages_per_block {
            for i in 0..stride {
                let nand_page = host_block * info.pages_per_block + page + i;
                if let Err(error) = self.io.read_page(nand_page, i as usize) {
                    // Unreadable records are fine as long as a later one is
                    // readable; only the record we settle on must be intact.
                    trace!("unable to read page {page}: {error}");
                    latest_entry_bad = true;
                    page += stride;
                    continue 'windows;
                }
                if self.io.oob_header().is_none() {
                    // The free tail of the block starts here.
                    trace!("page {page} does not contain a table record");
                    break 'windows;
                }
            }

            let header = self.io.oob_header().ok_or(BadBlockError::Internal)?;
            trace!("table record in page {page} is valid");
            latest_entry_bad = false;
            found_one = true;
            self.page = page;
            self.generation = header.generation.wrapping_add(1);
            page += stride;
        }

        if !found_one {
            error!("unable to find a valid copy of the bad block table");
            return Err(BadBlockError::NotFound);
        }

        // The walk clobbered the data buffer, so re-read the winning record
        // into it.
        for i in 0..stride {
            let nand_page = host_block * info.pages_per_block + self.page + i;
            if let Err(error) = self.io.read_page(nand_page, i as usize) {
                error!("unable to re-read latest copy of the bad block table");
                return Err(error);
            }
            if self.io.oob_header().is_none() {
                error!("latest copy of the bad block table lost its magic");
                return Err(BadBlockError::Internal);
            }
        }

        if latest_entry_bad {
            // A torn write sits after the record we loaded. Move the table to
            // a different reserved block before trusting this one again.
            error!("latest record in block {host_block} is torn; relocating table");
            self.write_table(true)
                .map_err(|_| BadBlockError::NotSupported)?;
        } else {
            info!("latest table record found in page {}", self.page);
            // Point at the next free slot.
            self.page += stride;
        }

        self.found = true;
        Ok(())
    }

    /// Start a fresh, all-good table on a device that has never persisted
    /// one. The first record written from this state carries generation 1.
    pub(crate) fn start_empty_table(&mut self) {
        info!("initializing empty bad block table");
        self.io.table().fill(BLOCK_GOOD);
        self.host = None;
        self.page = 0;
        self.generation = 1;
        self.found = true;
    }
}
