use serde::Deserialize;

use crate::error::{Error, Result};

/// Named, offset-addressed contiguous flash region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionDescriptor {
    pub name: String,
    pub offset: u32,
    pub length: u32,
}

/// Rejects a region request before any device I/O when it is empty or does
/// not lie within `[0, flash_size)`.
pub fn check_range(start: u32, length: u32, flash_size: u32) -> Result<()> {
    let end = start as u64 + length as u64;

    if length == 0 || end > flash_size as u64 {
        return Err(Error::InvalidRange {
            start,
            length,
            flash_size,
        });
    }

    Ok(())
}

/// Static mapping from partition name to flash region.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    entries: Vec<PartitionDescriptor>,
}

impl PartitionTable {
    pub fn new(entries: Vec<PartitionDescriptor>) -> PartitionTable {
        PartitionTable { entries }
    }

    /// The stock layout of a 4 MiB ESP32-class module.
    pub fn esp32_4m() -> PartitionTable {
        let entry = |name: &str, offset, length| PartitionDescriptor {
            name: name.to_string(),
            offset,
            length,
        };

        PartitionTable::new(vec![
            entry("nvs", 0x9000, 0x6000),
            entry("otadata", 0xe000, 0x2000),
            entry("app0", 0x10000, 0x10_0000),
            entry("app1", 0x11_0000, 0x10_0000),
            entry("spiffs", 0x29_0000, 0x17_0000),
        ])
    }

    pub fn entries(&self) -> &[PartitionDescriptor] {
        &self.entries
    }

    /// Checks that every descriptor lies within the flash and that no two
    /// descriptors overlap.
    pub fn validate(&self, flash_size: u32) -> Result<()> {
        for entry in &self.entries {
            check_range(entry.offset, entry.length, flash_size)?;

            if self
                .entries
                .iter()
                .filter(|other| other.name == entry.name)
                .count()
                > 1
            {
                return Err(Error::DuplicatePartition(entry.name.clone()));
            }
        }

        let mut sorted: Vec<&PartitionDescriptor> = self.entries.iter().collect();
        sorted.sort_by_key(|entry| entry.offset);

        for pair in sorted.windows(2) {
            let end = pair[0].offset as u64 + pair[0].length as u64;

            if end > pair[1].offset as u64 {
                return Err(Error::OverlappingPartitions {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Resolves `name` against the table and bounds-checks the result for
    /// the given flash size.
    pub fn resolve(&self, name: &str, flash_size: u32) -> Result<&PartitionDescriptor> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| Error::UnknownPartition(name.to_string()))?;

        check_range(entry.offset, entry.length, flash_size)?;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLASH_SIZE: u32 = 4 * 1024 * 1024;

    #[test]
    fn it_should_resolve_a_named_partition() {
        let table = PartitionTable::esp32_4m();
        let app0 = table.resolve("app0", FLASH_SIZE).unwrap();

        assert_eq!(app0.offset, 65536);
        assert_eq!(app0.length, 1_048_576);
    }

    #[test]
    fn it_should_reject_an_unknown_name() {
        let table = PartitionTable::esp32_4m();

        match table.resolve("bootloader2", FLASH_SIZE) {
            Err(Error::UnknownPartition(name)) => assert_eq!(name, "bootloader2"),
            other => panic!("expected UnknownPartition, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn it_should_reject_a_partition_beyond_the_flash() {
        let table = PartitionTable::esp32_4m();

        // spiffs ends at 4 MiB exactly; a 2 MiB chip cannot hold it
        assert!(matches!(
            table.resolve("spiffs", 2 * 1024 * 1024),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn it_should_reject_empty_and_overflowing_ranges() {
        assert!(matches!(
            check_range(0x1000, 0, FLASH_SIZE),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            check_range(0xffff_f000, 0x2000, FLASH_SIZE),
            Err(Error::InvalidRange { .. })
        ));
        assert!(check_range(0x10000, 0x10_0000, FLASH_SIZE).is_ok());
    }

    #[test]
    fn it_should_detect_overlapping_partitions() {
        let table = PartitionTable::new(vec![
            PartitionDescriptor {
                name: "a".to_string(),
                offset: 0x1000,
                length: 0x2000,
            },
            PartitionDescriptor {
                name: "b".to_string(),
                offset: 0x2000,
                length: 0x1000,
            },
        ]);

        assert!(matches!(
            table.validate(FLASH_SIZE),
            Err(Error::OverlappingPartitions { .. })
        ));
    }

    #[test]
    fn it_should_detect_duplicate_names() {
        let table = PartitionTable::new(vec![
            PartitionDescriptor {
                name: "a".to_string(),
                offset: 0x1000,
                length: 0x1000,
            },
            PartitionDescriptor {
                name: "a".to_string(),
                offset: 0x4000,
                length: 0x1000,
            },
        ]);

        assert!(matches!(
            table.validate(FLASH_SIZE),
            Err(Error::DuplicatePartition(_))
        ));
    }

    #[test]
    fn it_should_accept_the_default_layout() {
        PartitionTable::esp32_4m().validate(FLASH_SIZE).unwrap();
    }
}
