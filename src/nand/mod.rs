//! Abstractions and code to access raw NAND flash through the controller
//! protocol.
//!
//! The controller's queue is asynchronous: each [`NandOperation`] carries a
//! single-shot completion channel, and the controller may complete it from
//! any thread. Callers that need a blocking contract submit an op and wait on
//! the channel (see `bbt::io`).

use std::collections::HashSet;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::{BadBlockError, Result};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page or OOB
/// contents
pub trait PageUtil {
    /// Does this buffer contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A buffer shared between the submitting subsystem and the controller for
/// the lifetime of an operation. Must be memory-mapped and physically
/// addressable as the driver requires.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Allocate a zeroed [SharedBuffer] of the given size.
pub fn shared_buffer(size: usize) -> SharedBuffer {
    Arc::new(Mutex::new(vec![0u8; size]))
}

/// A pub-fields struct describing the data layout of a NAND flash device, as
/// reported by its controller
#[derive(Debug, Copy, Clone)]
pub struct NandInfo {
    pub num_blocks: u32,
    pub pages_per_block: u32,
    pub page_size: usize,
    pub oob_size: usize,
}

/// Parse strings like "BLOCKSxPAGESxBYTESxOOB"
impl FromStr for NandInfo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [num_blocks, pages_per_block, page_size, oob_size]: [&str; 4] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#"))?;
        let num_blocks = num_blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let page_size = page_size.parse()?;
        let oob_size = oob_size.parse()?;

        Ok(NandInfo {
            num_blocks,
            pages_per_block,
            page_size,
            oob_size,
        })
    }
}

/// One page-granular transfer: a page of data plus its OOB bytes.
///
/// `data_offset` is in pages; `oob_offset` in bytes. The controller moves one
/// page of data and as many OOB bytes as the buffer holds past `oob_offset`,
/// capped at the device's OOB size.
#[derive(Debug, Clone)]
pub struct PageIo {
    pub page: u32,
    pub data: SharedBuffer,
    pub data_offset: usize,
    pub oob: SharedBuffer,
    pub oob_offset: usize,
}

/// The commands a NAND controller accepts.
///
/// The hardware protocol historically had combined and split encodings for
/// the page ops; a controller implementation is free to issue either wire
/// form for [`NandCommand::ReadPage`]/[`NandCommand::WritePage`].
#[derive(Debug, Clone)]
pub enum NandCommand {
    Erase { first_block: u32, num_blocks: u32 },
    ReadPage(PageIo),
    WritePage(PageIo),
}

/// One queued controller operation, completed exactly once over `completion`.
pub struct NandOperation {
    pub command: NandCommand,
    pub completion: mpsc::Sender<Result<()>>,
}

/// Represents a NAND flash device behind its controller protocol
pub trait NandController: Send + Sync {
    /// Report the device geometry
    fn query(&self) -> NandInfo;

    /// Submit one operation. Must not block on the caller consuming the
    /// completion.
    fn queue(&self, op: NandOperation);
}

/// Blocking helper for tests and tooling: submit one command and wait.
pub fn submit_and_wait(controller: &dyn NandController, command: NandCommand) -> Result<()> {
    let (completion, done) = mpsc::channel();
    controller.queue(NandOperation {
        command,
        completion,
    });
    done.recv().map_err(|_| BadBlockError::Internal)?
}

/// A simulated in-memory NAND flash, for testing purposes.
///
/// Cloning is cheap and shares the underlying flash image, so a "power
/// cycle" is expressed by handing a clone to a fresh consumer. Fault
/// injection persists until the image is reloaded: a failed page or block
/// keeps failing.
#[derive(Debug, Clone)]
pub struct SimNand {
    state: Arc<Mutex<SimState>>,
    info: NandInfo,
}

#[derive(Debug)]
struct SimState {
    blocks: Vec<SimBlock>,
    fail_reads: HashSet<u32>,
    fail_writes: HashSet<u32>,
    fail_erases: HashSet<u32>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    pages: Vec<SimPage>,
}

/// One page; empty vectors represent the erased (all-0xFF) state
#[derive(Debug, Clone, Default)]
struct SimPage {
    data: Vec<u8>,
    oob: Vec<u8>,
}

impl SimPage {
    fn is_erased(&self) -> bool {
        self.data.is_empty() && self.oob.is_empty()
    }
}

impl SimNand {
    /// Create an erased SimNand with the specified geometry
    pub fn new(info: NandInfo) -> Self {
        let block = SimBlock {
            pages: vec![SimPage::default(); info.pages_per_block as usize],
        };
        let state = SimState {
            blocks: vec![block; info.num_blocks as usize],
            fail_reads: HashSet::new(),
            fail_writes: HashSet::new(),
            fail_erases: HashSet::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            info,
        }
    }

    /// Make every read of the given absolute page fail
    pub fn fail_read(&self, page: u32) {
        self.state.lock().unwrap().fail_reads.insert(page);
    }

    /// Make every write of the given absolute page fail
    pub fn fail_write(&self, page: u32) {
        self.state.lock().unwrap().fail_writes.insert(page);
    }

    /// Make every erase of the given block fail
    pub fn fail_erase(&self, block: u32) {
        self.state.lock().unwrap().fail_erases.insert(block);
    }

    /// Scribble over the OOB area of a page, as a disturbed program would
    pub fn corrupt_oob(&self, page: u32) {
        let mut state = self.state.lock().unwrap();
        let oob_size = self.info.oob_size;
        if let Ok(page) = state.page_mut(&self.info, page) {
            page.oob = vec![0u8; oob_size];
        }
    }

    /// Read back one absolute page (data, oob); erased pages come back as
    /// all-0xFF
    pub fn peek(&self, page: u32) -> (Vec<u8>, Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        let page = state
            .page_mut(&self.info, page)
            .expect("page out of range");
        let mut data = page.data.clone();
        let mut oob = page.oob.clone();
        data.resize(self.info.page_size, 0xFF);
        oob.resize(self.info.oob_size, 0xFF);
        (data, oob)
    }

    /// Initialize the NAND contents from a raw image (per page: data bytes,
    /// then OOB bytes), resetting all fault injection.
    pub fn load<R: Read>(&self, read: &mut R) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.fail_reads.clear();
        state.fail_writes.clear();
        state.fail_erases.clear();

        let mut data = vec![0; self.info.page_size];
        let mut oob = vec![0; self.info.oob_size];
        for block in &mut state.blocks {
            for page in &mut block.pages {
                read.read_exact(&mut data)?;
                read.read_exact(&mut oob)?;
                *page = if data.is_erased() && oob.is_erased() {
                    SimPage::default()
                } else {
                    SimPage {
                        data: data.clone(),
                        oob: oob.clone(),
                    }
                };
            }
        }

        Ok(())
    }

    /// Write the simulated flash out as a raw image readable by [`Self::load`]
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let state = self.state.lock().unwrap();

        for block in &state.blocks {
            for page in &block.pages {
                let mut data = page.data.clone();
                let mut oob = page.oob.clone();
                data.resize(self.info.page_size, 0xFF);
                oob.resize(self.info.oob_size, 0xFF);
                write.write_all(&data)?;
                write.write_all(&oob)?;
            }
        }

        Ok(())
    }

    fn read_page(&self, io: &PageIo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_reads.contains(&io.page) {
            return Err(sim_io_error(format!("read failure on page {}", io.page)));
        }

        let (data, oob) = {
            let page = state.page_mut(&self.info, io.page)?;
            (page.data.clone(), page.oob.clone())
        };
        drop(state);

        let mut buf = io.data.lock().unwrap();
        let begin = io.data_offset * self.info.page_size;
        let out = buf
            .get_mut(begin..begin + self.info.page_size)
            .ok_or(BadBlockError::InvalidArgs)?;
        out.fill(0xFF);
        out[..data.len()].copy_from_slice(&data);
        drop(buf);

        let mut buf = io.oob.lock().unwrap();
        let out = buf
            .get_mut(io.oob_offset..)
            .ok_or(BadBlockError::InvalidArgs)?;
        let len = std::cmp::min(out.len(), self.info.oob_size);
        let out = &mut out[..len];
        out.fill(0xFF);
        let len = std::cmp::min(len, oob.len());
        out[..len].copy_from_slice(&oob[..len]);

        Ok(())
    }

    fn write_page(&self, io: &PageIo) -> Result<()> {
        let data = {
            let buf = io.data.lock().unwrap();
            let begin = io.data_offset * self.info.page_size;
            buf.get(begin..begin + self.info.page_size)
                .ok_or(BadBlockError::InvalidArgs)?
                .to_vec()
        };
        let oob = {
            let buf = io.oob.lock().unwrap();
            let tail = buf
                .get(io.oob_offset..)
                .ok_or(BadBlockError::InvalidArgs)?;
            tail[..std::cmp::min(tail.len(), self.info.oob_size)].to_vec()
        };

        let mut state = self.state.lock().unwrap();
        if state.fail_writes.contains(&io.page) {
            return Err(sim_io_error(format!("write failure on page {}", io.page)));
        }

        let page = state.page_mut(&self.info, io.page)?;
        if !page.is_erased() {
            return Err(sim_io_error(format!(
                "write to programmed page {}",
                io.page
            )));
        }

        // Writing fully-erased content is a no-op.
        if !data.is_erased() || !oob.is_erased() {
            page.data = data;
            page.oob = oob;
        }

        Ok(())
    }

    fn erase(&self, first_block: u32, num_blocks: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for block in first_block..first_block + num_blocks {
            if state.fail_erases.contains(&block) {
                return Err(sim_io_error(format!("erase failure on block {block}")));
            }
            let block = state
                .blocks
                .get_mut(block as usize)
                .ok_or(BadBlockError::InvalidArgs)?;
            block.pages.fill(SimPage::default());
        }

        Ok(())
    }
}

impl SimState {
    fn page_mut(&mut self, info: &NandInfo, page: u32) -> Result<&mut SimPage> {
        let block = page / info.pages_per_block;
        let index = (page % info.pages_per_block) as usize;
        self.blocks
            .get_mut(block as usize)
            .and_then(|b| b.pages.get_mut(index))
            .ok_or(BadBlockError::InvalidArgs)
    }
}

fn sim_io_error(message: String) -> BadBlockError {
    BadBlockError::Io {
        source: std::io::Error::other(message),
    }
}

impl NandController for SimNand {
    fn query(&self) -> NandInfo {
        self.info
    }

    fn queue(&self, op: NandOperation) {
        let result = match &op.command {
            NandCommand::Erase {
                first_block,
                num_blocks,
            } => self.erase(*first_block, *num_blocks),
            NandCommand::ReadPage(io) => self.read_page(io),
            NandCommand::WritePage(io) => self.write_page(io),
        };

        // The submitter may have stopped listening; that's its business.
        let _ = op.completion.send(result);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_INFO: NandInfo = NandInfo {
        num_blocks: 8,
        pages_per_block: 16,
        page_size: 256,
        oob_size: 16,
    };

    fn read_op(page: u32, data: &SharedBuffer, oob: &SharedBuffer) -> NandCommand {
        NandCommand::ReadPage(PageIo {
            page,
            data: data.clone(),
            data_offset: 0,
            oob: oob.clone(),
            oob_offset: 0,
        })
    }

    fn write_op(page: u32, data: &SharedBuffer, oob: &SharedBuffer) -> NandCommand {
        NandCommand::WritePage(PageIo {
            page,
            data: data.clone(),
            data_offset: 0,
            oob: oob.clone(),
            oob_offset: 0,
        })
    }

    #[test]
    fn test_sim_read_write() {
        let nand = SimNand::new(TEST_INFO);
        let data = shared_buffer(TEST_INFO.page_size);
        let oob = shared_buffer(TEST_INFO.oob_size);

        data.lock().unwrap().fill(0xA5);
        oob.lock().unwrap().fill(0x5A);
        submit_and_wait(&nand, write_op(2, &data, &oob)).unwrap();

        // Rewriting a programmed page must fail
        assert!(submit_and_wait(&nand, write_op(2, &data, &oob)).is_err());

        submit_and_wait(&nand, read_op(1, &data, &oob)).unwrap();
        assert!(data.lock().unwrap().is_erased());
        assert!(oob.lock().unwrap().is_erased());

        submit_and_wait(&nand, read_op(2, &data, &oob)).unwrap();
        assert!(data.lock().unwrap().iter().all(|&x| x == 0xA5));
        assert!(oob.lock().unwrap().iter().all(|&x| x == 0x5A));
    }

    #[test]
    fn test_sim_erase() {
        let nand = SimNand::new(TEST_INFO);
        let data = shared_buffer(TEST_INFO.page_size);
        let oob = shared_buffer(TEST_INFO.oob_size);

        data.lock().unwrap().fill(0x11);
        submit_and_wait(&nand, write_op(16, &data, &oob)).unwrap();

        submit_and_wait(
            &nand,
            NandCommand::Erase {
                first_block: 1,
                num_blocks: 1,
            },
        )
        .unwrap();

        submit_and_wait(&nand, read_op(16, &data, &oob)).unwrap();
        assert!(data.lock().unwrap().is_erased());

        // Erasing past the device must fail
        assert!(submit_and_wait(
            &nand,
            NandCommand::Erase {
                first_block: TEST_INFO.num_blocks,
                num_blocks: 1,
            },
        )
        .is_err());
    }

    #[test]
    fn test_sim_fault_injection() {
        let nand = SimNand::new(TEST_INFO);
        let data = shared_buffer(TEST_INFO.page_size);
        let oob = shared_buffer(TEST_INFO.oob_size);

        nand.fail_read(3);
        nand.fail_write(4);
        nand.fail_erase(2);

        assert!(submit_and_wait(&nand, read_op(3, &data, &oob)).is_err());
        // Faults persist across attempts
        assert!(submit_and_wait(&nand, read_op(3, &data, &oob)).is_err());

        data.lock().unwrap().fill(0x22);
        assert!(submit_and_wait(&nand, write_op(4, &data, &oob)).is_err());
        assert!(submit_and_wait(
            &nand,
            NandCommand::Erase {
                first_block: 2,
                num_blocks: 1,
            },
        )
        .is_err());
    }

    #[test]
    fn test_sim_save_load() -> anyhow::Result<()> {
        let nand = SimNand::new(TEST_INFO);
        let data = shared_buffer(TEST_INFO.page_size);
        let oob = shared_buffer(TEST_INFO.oob_size);

        data.lock().unwrap().fill(0x77);
        submit_and_wait(&nand, write_op(9, &data, &oob)).unwrap();

        let mut image = Vec::new();
        nand.save(&mut image)?;

        let other = SimNand::new(TEST_INFO);
        other.load(&mut image.as_slice())?;
        let (page, _) = other.peek(9);
        assert!(page.iter().all(|&x| x == 0x77));
        let (page, _) = other.peek(10);
        assert!(page.is_erased());

        Ok(())
    }

    #[test]
    fn test_info_from_str() {
        let info: NandInfo = "64x64x2048x16".parse().unwrap();
        assert_eq!(info.num_blocks, 64);
        assert_eq!(info.pages_per_block, 64);
        assert_eq!(info.page_size, 2048);
        assert_eq!(info.oob_size, 16);
        assert!("64x64".parse::<NandInfo>().is_err());
    }
}
