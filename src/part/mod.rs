//! The partition multiplexer: presents each partition of the NAND as its own
//! controller, translating partition-relative addresses to device addresses,
//! and projects the bad block table onto each partition's block range.

use std::sync::{Arc, Mutex};

use log::{error, trace};

use crate::bbt::BadBlockTable;
use crate::nand::{NandCommand, NandController, NandInfo, NandOperation};
use crate::{BadBlockError, Result};

/// One entry of the externally-sanitized partition map: an inclusive range
/// of erase blocks plus identity
#[derive(Debug, Clone)]
pub struct Partition {
    pub first_block: u32,
    pub last_block: u32,
    pub type_guid: [u8; 16],
    pub name: String,
}

impl Partition {
    fn num_blocks(&self) -> u32 {
        self.last_block - self.first_block + 1
    }
}

/// Verify that a partition map really was sanitized: non-empty, ascending,
/// non-overlapping, and contained by the device.
pub fn check_partition_map(map: &[Partition], info: &NandInfo) -> Result<()> {
    if map.is_empty() {
        error!("partition count is zero");
        return Err(BadBlockError::InvalidArgs);
    }

    for partition in map {
        if partition.last_block < partition.first_block {
            error!("partition {} has an inverted block range", partition.name);
            return Err(BadBlockError::InvalidArgs);
        }
    }

    for pair in map.windows(2) {
        if pair[0].last_block >= pair[1].first_block {
            error!(
                "partitions {} and {} overlap or are out of order",
                pair[0].name, pair[1].name
            );
            return Err(BadBlockError::InvalidArgs);
        }
    }

    if let Some(partition) = map.last() {
        if partition.last_block >= info.num_blocks {
            return Err(BadBlockError::OutOfRange {
                block: partition.last_block,
            });
        }
    }

    Ok(())
}

/// One partition's view of the device.
///
/// Implements [`NandController`] so the layers above see an ordinary, smaller
/// NAND; holds a shared reference to the single bad-block core (the core
/// holds none back).
pub struct PartitionDevice {
    parent: Arc<dyn NandController>,
    bad_block: Arc<BadBlockTable>,
    info: NandInfo,
    first_block: u32,
    name: String,

    /// Partition-relative bad list, filled on first use. The core is the
    /// single writer, so the only invalidation is our own write-through.
    bad_block_list: Mutex<Option<Vec<u32>>>,
}

impl PartitionDevice {
    pub fn new(
        parent: Arc<dyn NandController>,
        bad_block: Arc<BadBlockTable>,
        partition: &Partition,
    ) -> Result<Self> {
        let mut info = parent.query();
        if partition.last_block < partition.first_block {
            return Err(BadBlockError::InvalidArgs);
        }
        if partition.last_block >= info.num_blocks {
            return Err(BadBlockError::OutOfRange {
                block: partition.last_block,
            });
        }
        info.num_blocks = partition.num_blocks();

        Ok(Self {
            parent,
            bad_block,
            info,
            first_block: partition.first_block,
            name: partition.name.clone(),
            bad_block_list: Mutex::new(None),
        })
    }

    /// Create one device per entry of a sanitized partition map
    pub fn from_map(
        parent: &Arc<dyn NandController>,
        bad_block: &Arc<BadBlockTable>,
        map: &[Partition],
    ) -> Result<Vec<Self>> {
        check_partition_map(map, &parent.query())?;
        map.iter()
            .map(|partition| Self::new(parent.clone(), bad_block.clone(), partition))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The partition's bad blocks, partition-relative
    pub fn bad_block_list(&self) -> Result<Vec<u32>> {
        let mut cache = self.bad_block_list.lock().unwrap();
        self.ensure_cached(&mut cache)?;
        Ok(cache.clone().unwrap_or_default())
    }

    pub fn is_bad(&self, block: u32) -> Result<bool> {
        if block >= self.info.num_blocks {
            return Err(BadBlockError::OutOfRange { block });
        }

        let mut cache = self.bad_block_list.lock().unwrap();
        self.ensure_cached(&mut cache)?;

        // The list is small and unsorted; walk the whole thing.
        Ok(cache.as_deref().unwrap_or_default().contains(&block))
    }

    pub fn mark_bad(&self, block: u32) -> Result<()> {
        if block >= self.info.num_blocks {
            return Err(BadBlockError::OutOfRange { block });
        }

        let mut cache = self.bad_block_list.lock().unwrap();
        self.ensure_cached(&mut cache)?;

        // First update the cached copy, then write through to the core.
        if let Some(list) = cache.as_mut() {
            if !list.contains(&block) {
                list.push(block);
            }
        }
        self.bad_block.mark_bad(self.first_block + block)
    }

    fn ensure_cached(&self, cache: &mut Option<Vec<u32>>) -> Result<()> {
        if cache.is_none() {
            let first = self.first_block;
            let absolute = self
                .bad_block
                .list_bad(first, first + self.info.num_blocks)?;
            trace!(
                "partition {}: bad block count: {}",
                self.name,
                absolute.len()
            );
            *cache = Some(absolute.into_iter().map(|block| block - first).collect());
        }
        Ok(())
    }
}

impl NandController for PartitionDevice {
    fn query(&self) -> NandInfo {
        self.info
    }

    fn queue(&self, mut op: NandOperation) {
        // Make offsets relative to the full underlying device
        match &mut op.command {
            NandCommand::ReadPage(io) | NandCommand::WritePage(io) => {
                io.page += self.first_block * self.info.pages_per_block;
            }
            NandCommand::Erase { first_block, .. } => {
                *first_block += self.first_block;
            }
        }

        self.parent.queue(op);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bbt::BadBlockConfig;
    use crate::nand::{shared_buffer, submit_and_wait, PageIo, PageUtil, SimNand};

    const TEST_INFO: NandInfo = NandInfo {
        num_blocks: 64,
        pages_per_block: 16,
        page_size: 512,
        oob_size: 16,
    };

    const TEST_CONFIG: BadBlockConfig = BadBlockConfig {
        table_start_block: 60,
        table_end_block: 63,
    };

    fn partition(name: &str, first_block: u32, last_block: u32) -> Partition {
        Partition {
            first_block,
            last_block,
            type_guid: [0xAB; 16],
            name: name.to_string(),
        }
    }

    fn setup(nand: &SimNand) -> (Arc<dyn NandController>, Arc<BadBlockTable>) {
        let parent: Arc<dyn NandController> = Arc::new(nand.clone());
        let table = Arc::new(BadBlockTable::new(parent.clone(), TEST_CONFIG));
        (parent, table)
    }

    #[test]
    fn test_check_partition_map() {
        let map = [partition("boot", 0, 9), partition("data", 10, 59)];
        check_partition_map(&map, &TEST_INFO).unwrap();

        assert!(matches!(
            check_partition_map(&[], &TEST_INFO),
            Err(BadBlockError::InvalidArgs)
        ));

        let overlapping = [partition("boot", 0, 10), partition("data", 10, 59)];
        assert!(matches!(
            check_partition_map(&overlapping, &TEST_INFO),
            Err(BadBlockError::InvalidArgs)
        ));

        let unsorted = [partition("data", 10, 59), partition("boot", 0, 9)];
        assert!(matches!(
            check_partition_map(&unsorted, &TEST_INFO),
            Err(BadBlockError::InvalidArgs)
        ));

        let inverted = [partition("boot", 9, 0)];
        assert!(matches!(
            check_partition_map(&inverted, &TEST_INFO),
            Err(BadBlockError::InvalidArgs)
        ));

        let outside = [partition("data", 10, 64)];
        assert!(matches!(
            check_partition_map(&outside, &TEST_INFO),
            Err(BadBlockError::OutOfRange { block: 64 })
        ));
    }

    #[test]
    fn test_new_rejects_unsanitized_partition() {
        let nand = SimNand::new(TEST_INFO);
        let (parent, table) = setup(&nand);

        assert!(matches!(
            PartitionDevice::new(parent.clone(), table.clone(), &partition("inverted", 9, 0)),
            Err(BadBlockError::InvalidArgs)
        ));

        // Running past the device is a range error, as in check_partition_map
        assert!(matches!(
            PartitionDevice::new(parent, table, &partition("oversized", 10, 64)),
            Err(BadBlockError::OutOfRange { block: 64 })
        ));
    }

    #[test]
    fn test_query_is_partition_shaped() {
        let nand = SimNand::new(TEST_INFO);
        let (parent, table) = setup(&nand);
        let device = PartitionDevice::new(parent, table, &partition("data", 10, 59)).unwrap();

        let info = device.query();
        assert_eq!(info.num_blocks, 50);
        assert_eq!(info.pages_per_block, TEST_INFO.pages_per_block);
    }

    #[test]
    fn test_queue_rebases_addresses() {
        let nand = SimNand::new(TEST_INFO);
        let (parent, table) = setup(&nand);
        let device = PartitionDevice::new(parent, table, &partition("data", 10, 59)).unwrap();

        // Write partition page 0 and find it at the device offset
        let data = shared_buffer(TEST_INFO.page_size);
        let oob = shared_buffer(TEST_INFO.oob_size);
        data.lock().unwrap().fill(0x5C);
        submit_and_wait(
            &device,
            NandCommand::WritePage(PageIo {
                page: 0,
                data: data.clone(),
                data_offset: 0,
                oob: oob.clone(),
                oob_offset: 0,
            }),
        )
        .unwrap();

        let absolute = 10 * TEST_INFO.pages_per_block;
        let (written, _) = nand.peek(absolute);
        assert!(written.iter().all(|&x| x == 0x5C));

        // Erase partition block 0 and see the device block wiped
        submit_and_wait(
            &device,
            NandCommand::Erase {
                first_block: 0,
                num_blocks: 1,
            },
        )
        .unwrap();
        let (wiped, _) = nand.peek(absolute);
        assert!(wiped.is_erased());
    }

    #[test]
    fn test_bad_list_projection() {
        let nand = SimNand::new(TEST_INFO);
        let (parent, table) = setup(&nand);

        // An absolute mark through the core shows up partition-relative
        table.mark_bad(12).unwrap();

        let device =
            PartitionDevice::new(parent.clone(), table.clone(), &partition("data", 10, 59))
                .unwrap();
        assert_eq!(device.bad_block_list().unwrap(), vec![2]);
        assert!(device.is_bad(2).unwrap());
        assert!(!device.is_bad(3).unwrap());

        assert!(matches!(
            device.is_bad(50),
            Err(BadBlockError::OutOfRange { block: 50 })
        ));

        // A sibling partition sees none of it
        let boot = PartitionDevice::new(parent, table, &partition("boot", 0, 9)).unwrap();
        assert_eq!(boot.bad_block_list().unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_mark_bad_writes_through() {
        let nand = SimNand::new(TEST_INFO);
        let (parent, table) = setup(&nand);
        let device =
            PartitionDevice::new(parent, table.clone(), &partition("data", 10, 59)).unwrap();

        // Get a table onto the flash first; the cache fill propagates the
        // core's NotFound on a virgin device
        table.mark_bad(5).unwrap();

        device.mark_bad(4).unwrap();

        // Cache updated and core persisted the absolute block
        assert_eq!(device.bad_block_list().unwrap(), vec![4]);
        assert!(table.is_bad(14).unwrap());

        // Marking again neither duplicates nor writes another record
        let location = table.location().unwrap();
        device.mark_bad(4).unwrap();
        assert_eq!(device.bad_block_list().unwrap(), vec![4]);
        assert_eq!(table.location().unwrap(), location);
    }

    #[test]
    fn test_from_map() {
        let nand = SimNand::new(TEST_INFO);
        let (parent, table) = setup(&nand);

        let devices = PartitionDevice::from_map(
            &parent,
            &table,
            &[partition("boot", 0, 9), partition("data", 10, 59)],
        )
        .unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name(), "boot");
        assert_eq!(devices[1].query().num_blocks, 50);
    }
}
