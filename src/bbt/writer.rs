//! Appending table records, with self-healing relocation.
//!
//! The write loop owns every recovery decision: a host that fails to erase
//! or program is marked bad in the very table being written, its reserved
//! entry is invalidated, and a fresh host is elected by lowest wear. The
//! loop only ends in success or in the reserved region running dry.

use log::{error, info, trace};

use super::oob::OobHeader;
use super::{Core, BLOCK_BAD, BLOCK_GOOD};
use crate::{BadBlockError, Result};

impl Core {
    /// Append one record holding the current table image.
    ///
    /// `use_new_block` forces the record onto a different reserved block than
    /// the current host (used after a torn write is detected).
    pub(crate) fn write_table(&mut self, mut use_new_block: bool) -> Result<()> {
        let info = *self.io.info();
        let stride = self.stride();

        loop {
            let host = match self.host {
                Some(host)
                    if !use_new_block
                        && self.block_status(self.reserved.get(host).block) == BLOCK_GOOD
                        && self.page + stride <= info.pages_per_block =>
                {
                    host
                }
                _ => {
                    // Current host is gone, bad, or full; find a new one.
                    use_new_block = false;
                    info!("finding a new block to store the bad block table");
                    self.new_host()?
                }
            };

            let entry = *self.reserved.get(host);
            self.io.set_oob_header(OobHeader {
                pe_cycles: entry.pe_cycles,
                generation: self.generation,
            });

            let mut successful = true;
            for i in 0..stride {
                let nand_page = entry.block * info.pages_per_block + self.page + i;
                if let Err(error) = self.io.write_page(nand_page, i as usize) {
                    error!(
                        "table write failed ({error}); marking block {} bad and trying again",
                        entry.block
                    );
                    self.set_block_status(entry.block, BLOCK_BAD);
                    successful = false;
                    break;
                }
                trace!(
                    "table write to block {} page {} successful",
                    entry.block,
                    self.page + i
                );
            }

            if successful {
                self.page += stride;
                self.generation = self.generation.wrapping_add(1);
                return Ok(());
            }
        }
    }

    /// Elect, erase, and age the least-worn valid reserved block.
    ///
    /// Blocks that fail to erase are marked bad and invalidated; the search
    /// keeps going until a block survives or none are left.
    fn new_host(&mut self) -> Result<usize> {
        loop {
            let Some(index) = self.reserved.least_worn(self.host) else {
                error!("unable to find a valid block to store the bad block table");
                return Err(BadBlockError::NotFound);
            };
            let block = self.reserved.get(index).block;

            // Make sure we aren't about to write into a bad block.
            if self.block_status(block) != BLOCK_GOOD {
                self.reserved.invalidate(index);
                continue;
            }

            // Erase the block before using it.
            if let Err(error) = self.io.erase(block) {
                error!("failed to erase block {block} ({error}), marking bad");
                self.set_block_status(block, BLOCK_BAD);
                self.reserved.invalidate(index);
                continue;
            }

            info!("moving bad block table to block {block}");
            self.host = Some(index);
            self.reserved.age(index);
            self.page = 0;
            return Ok(index);
        }
    }
}
