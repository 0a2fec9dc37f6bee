//! The blocking NAND adapter: one controller operation per call, caller
//! blocked until the controller completes it.

use std::sync::mpsc;
use std::sync::{Arc, MutexGuard};

use super::oob::OobHeader;
use crate::nand::{
    shared_buffer, NandCommand, NandController, NandInfo, NandOperation, PageIo, PageUtil,
    SharedBuffer,
};
use crate::{BadBlockError, Result};

/// Owns the controller handle and the two DMA-visible buffers every table
/// operation goes through: a data buffer holding the in-memory table image
/// (padded to whole pages) and an OOB buffer holding one record header.
pub(crate) struct NandIo {
    controller: Arc<dyn NandController>,
    info: NandInfo,
    data: SharedBuffer,
    oob: SharedBuffer,
}

impl NandIo {
    pub fn new(controller: Arc<dyn NandController>) -> Self {
        let info = controller.query();

        // The table image occupies one byte per block, carried in whole pages.
        let stride = (info.num_blocks as usize).div_ceil(info.page_size);
        let data = shared_buffer(stride * info.page_size);
        let oob = shared_buffer(OobHeader::SIZE);

        Self {
            controller,
            info,
            data,
            oob,
        }
    }

    pub fn info(&self) -> &NandInfo {
        &self.info
    }

    /// The table image; the first `num_blocks` bytes are the block statuses.
    pub fn table(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }

    /// Decode the record header currently sitting in the OOB buffer
    pub fn oob_header(&self) -> Option<OobHeader> {
        OobHeader::decode(&self.oob.lock().unwrap())
    }

    /// Is the OOB buffer all-0xFF (a free slot)?
    pub fn oob_is_erased(&self) -> bool {
        self.oob.lock().unwrap().is_erased()
    }

    /// Stage a record header into the OOB buffer for subsequent writes
    pub fn set_oob_header(&self, header: OobHeader) {
        header.encode(&mut self.oob.lock().unwrap());
    }

    pub fn erase(&self, block: u32) -> Result<()> {
        self.submit(NandCommand::Erase {
            first_block: block,
            num_blocks: 1,
        })
    }

    /// Read one page into the data buffer at `data_offset` pages, and its OOB
    /// header into the OOB buffer
    pub fn read_page(&self, page: u32, data_offset: usize) -> Result<()> {
        self.submit(NandCommand::ReadPage(self.page_io(page, data_offset)))
    }

    /// Write one page from the data buffer at `data_offset` pages, with the
    /// staged OOB header
    pub fn write_page(&self, page: u32, data_offset: usize) -> Result<()> {
        self.submit(NandCommand::WritePage(self.page_io(page, data_offset)))
    }

    fn page_io(&self, page: u32, data_offset: usize) -> PageIo {
        PageIo {
            page,
            data: self.data.clone(),
            data_offset,
            oob: self.oob.clone(),
            oob_offset: 0,
        }
    }

    fn submit(&self, command: NandCommand) -> Result<()> {
        let (completion, done) = mpsc::channel();
        self.controller.queue(NandOperation {
            command,
            completion,
        });

        // Wait on completion. The controller dropping the channel without
        // answering would be a protocol violation.
        done.recv().map_err(|_| BadBlockError::Internal)?
    }
}
