//! An operator tool for the on-flash bad block table.
//!
//! This is not a unit test because it's meant to be used interactively, on
//! either a real MTD NAND or a simulated image file, to inspect and exercise
//! the table exactly as the driver stack would.

use anyhow::{bail, ensure, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(target_os = "linux")]
use nandbbt::nand::mtd::MtdNand;
use nandbbt::{
    bbt::{BadBlockConfig, BadBlockTable},
    nand::{
        shared_buffer, submit_and_wait, NandCommand, NandController, NandInfo, PageIo, SimNand,
    },
    BadBlockError,
};

/// Selects the flash to operate on: a real MTD device or a simulated image
#[derive(Args, Debug)]
struct NandOptions {
    /// MTD device to open: a /dev path, or a partition name from /proc/mtd
    #[cfg(target_os = "linux")]
    #[clap(long, conflicts_with = "sim_info")]
    mtd: Option<String>,

    /// Simulate a NAND with this geometry (BLOCKSxPAGESxBYTESxOOB) instead
    /// of opening an MTD device
    #[clap(long)]
    sim_info: Option<NandInfo>,

    /// Image file backing the simulated NAND; loaded at startup when it
    /// already exists, otherwise the simulation starts erased
    #[clap(long, requires = "sim_info")]
    sim_path: Option<PathBuf>,

    /// Write the simulated NAND back to the image file on exit
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

/// An open flash, plus the write-back owed for simulated runs
struct NandSession {
    controller: Arc<dyn NandController>,
    writeback: Option<(SimNand, PathBuf)>,
}

impl NandOptions {
    fn open(&self) -> Result<NandSession> {
        #[cfg(target_os = "linux")]
        if let Some(target) = &self.mtd {
            return Ok(NandSession {
                controller: Arc::new(MtdNand::open(target)?),
                writeback: None,
            });
        }

        let Some(info) = self.sim_info else {
            bail!("select a NAND to operate on (--sim-info or an MTD device)");
        };

        let sim = SimNand::new(info);
        if let Some(path) = &self.sim_path {
            if path.exists() {
                sim.load(&mut File::open(path)?)?;
            }
        }

        let writeback = match (&self.sim_path, self.sim_write) {
            (Some(path), true) => Some((sim.clone(), path.clone())),
            _ => None,
        };

        Ok(NandSession {
            controller: Arc::new(sim),
            writeback,
        })
    }
}

impl NandSession {
    /// Flush a written-back simulation out to its image file
    fn finish(self) -> Result<()> {
        if let Some((sim, path)) = self.writeback {
            sim.save(&mut File::create(path)?)?;
        }

        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the device geometry, table location, and bad block list
    Info,

    /// List the bad blocks in a range of the device
    List {
        /// The first block of the range
        #[clap(default_value_t = 0)]
        first: u32,

        /// One past the last block of the range; the device end if omitted
        last: Option<u32>,
    },

    /// Mark a block bad and persist a new table record
    MarkBad {
        /// The block to mark, in whole-device numbering
        block: u32,
    },

    /// Read every page of every good block, reporting blocks with
    /// unreadable pages
    Scan {
        /// Also mark each unreadable block bad in the table
        #[clap(long)]
        mark: bool,
    },
}

impl Command {
    fn execute(self, controller: Arc<dyn NandController>, table: &BadBlockTable) -> Result<()> {
        let info = controller.query();

        match self {
            Command::Info => {
                println!(
                    "{} blocks x {} pages x {} bytes (+{} OOB)",
                    info.num_blocks, info.pages_per_block, info.page_size, info.oob_size
                );

                match table.location() {
                    Ok(location) => {
                        println!(
                            "table hosted in block {}, next record at page {}, generation {}",
                            location.block, location.page, location.generation
                        );
                        let bad = table.list_bad(0, info.num_blocks)?;
                        println!("bad blocks ({}): {bad:?}", bad.len());
                    }
                    Err(BadBlockError::NotFound) => {
                        println!("no bad block table on this device");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            Command::List { first, last } => {
                let last = last.unwrap_or(info.num_blocks);
                for block in table.list_bad(first, last)? {
                    println!("{block}");
                }
            }

            Command::MarkBad { block } => {
                table.mark_bad(block)?;
                println!("block {block} marked bad");
            }

            Command::Scan { mark } => {
                let rpt = howudoin::new()
                    .label("Scanning blocks")
                    .set_len(u64::from(info.num_blocks));

                let data = shared_buffer(info.page_size);
                let oob = shared_buffer(info.oob_size);

                let mut skipped = 0u32;
                let mut unreadable = Vec::new();
                for block in 0..info.num_blocks {
                    rpt.inc();

                    let known_bad = match table.is_bad(block) {
                        Ok(bad) => bad,
                        // A device with no table yet has nothing to skip
                        Err(BadBlockError::NotFound) => false,
                        Err(e) => return Err(e.into()),
                    };
                    if known_bad {
                        skipped += 1;
                        continue;
                    }

                    let failed = (0..info.pages_per_block).any(|page| {
                        submit_and_wait(
                            &*controller,
                            NandCommand::ReadPage(PageIo {
                                page: block * info.pages_per_block + page,
                                data: data.clone(),
                                data_offset: 0,
                                oob: oob.clone(),
                                oob_offset: 0,
                            }),
                        )
                        .is_err()
                    });

                    if failed {
                        unreadable.push(block);
                        if mark {
                            table.mark_bad(block)?;
                        }
                    }
                }

                rpt.close();

                println!(
                    "scanned {} blocks ({skipped} already bad): {} with unreadable pages",
                    info.num_blocks,
                    unreadable.len()
                );
                for block in unreadable {
                    let marked = if mark { " (marked bad)" } else { "" };
                    println!("{block}{marked}");
                }
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// First block of the range reserved for table copies
    #[clap(long)]
    table_start: u32,

    /// Last block (inclusive) of the range reserved for table copies
    #[clap(long)]
    table_end: u32,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let session = args.nand.open()?;

    // Catch a bad reserved range against the real geometry up front, rather
    // than as a discovery failure on the first table operation.
    let info = session.controller.query();
    ensure!(
        args.table_start <= args.table_end && args.table_end < info.num_blocks,
        "reserved range {}..={} does not fit a device of {} blocks",
        args.table_start,
        args.table_end,
        info.num_blocks
    );

    let table = BadBlockTable::new(
        session.controller.clone(),
        BadBlockConfig {
            table_start_block: args.table_start,
            table_end_block: args.table_end,
        },
    );

    args.cmd.execute(session.controller.clone(), &table)?;
    session.finish()
}
