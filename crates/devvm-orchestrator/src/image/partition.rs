//! Minimal MBR/GPT partition table reader.
//!
//! Only what flasher detection needs: where each partition starts, how long it
//! is, and what it is called. GPT partitions carry their own names; MBR
//! partitions are named after their ext2/3/4 volume label, which is how OS
//! images label `resin-rootA` and friends on DOS-partitioned disks.

use std::io::{self, Read, Seek, SeekFrom};

pub const SECTOR_SIZE: u64 = 512;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 446;
const GPT_PROTECTIVE: u8 = 0xEE;
const EXTENDED_TYPES: &[u8] = &[0x05, 0x0F, 0x85];
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const MAX_LOGICAL_PARTITIONS: usize = 128;
const MAX_GPT_ENTRIES: u32 = 1024;

const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT_MAGIC_OFFSET: usize = 0x38;
const EXT_LABEL_OFFSET: usize = 0x78;
const EXT_MAGIC: u16 = 0xEF53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 1-based, in the numbering `fdisk` would show.
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    /// GPT partition name; `None` on MBR disks.
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub kind: TableKind,
    pub partitions: Vec<Partition>,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

struct MbrEntry {
    kind: u8,
    start_lba: u64,
    sectors: u64,
}

fn mbr_entries(sector: &[u8]) -> Vec<MbrEntry> {
    (0..4)
        .map(|i| {
            let base = MBR_TABLE_OFFSET + i * 16;
            MbrEntry {
                kind: sector[base + 4],
                start_lba: u64::from(le_u32(sector, base + 8)),
                sectors: u64::from(le_u32(sector, base + 12)),
            }
        })
        .collect()
}

/// Read the partition table at the start of `reader`.
pub fn read_partition_table<R: Read + Seek>(reader: &mut R) -> io::Result<PartitionTable> {
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    read_at(reader, 0, &mut mbr)?;
    if mbr[510..512] != MBR_SIGNATURE {
        return Err(invalid("no MBR boot signature"));
    }

    let entries = mbr_entries(&mbr);
    if entries.iter().any(|e| e.kind == GPT_PROTECTIVE) {
        return read_gpt(reader);
    }

    let mut partitions = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if entry.kind == 0 || entry.sectors == 0 {
            continue;
        }
        if EXTENDED_TYPES.contains(&entry.kind) {
            read_logical(reader, entry.start_lba, &mut partitions)?;
            continue;
        }
        partitions.push(Partition {
            index: i as u32 + 1,
            offset: entry.start_lba * SECTOR_SIZE,
            size: entry.sectors * SECTOR_SIZE,
            name: None,
        });
    }
    Ok(PartitionTable {
        kind: TableKind::Mbr,
        partitions,
    })
}

/// Walk the EBR chain of an extended partition. Logical partitions number from 5.
fn read_logical<R: Read + Seek>(
    reader: &mut R,
    extended_start: u64,
    partitions: &mut Vec<Partition>,
) -> io::Result<()> {
    let mut ebr_lba = extended_start;
    let mut index = 5;
    for _ in 0..MAX_LOGICAL_PARTITIONS {
        let mut ebr = [0u8; SECTOR_SIZE as usize];
        read_at(reader, ebr_lba * SECTOR_SIZE, &mut ebr)?;
        if ebr[510..512] != MBR_SIGNATURE {
            return Err(invalid(format!("bad EBR signature at LBA {ebr_lba}")));
        }
        let entries = mbr_entries(&ebr);
        let logical = &entries[0];
        if logical.kind != 0 && logical.sectors != 0 {
            partitions.push(Partition {
                index,
                offset: (ebr_lba + logical.start_lba) * SECTOR_SIZE,
                size: logical.sectors * SECTOR_SIZE,
                name: None,
            });
            index += 1;
        }
        let next = &entries[1];
        if next.kind == 0 || next.start_lba == 0 {
            return Ok(());
        }
        ebr_lba = extended_start + next.start_lba;
    }
    Err(invalid("EBR chain too long"))
}

fn read_gpt<R: Read + Seek>(reader: &mut R) -> io::Result<PartitionTable> {
    let mut header = [0u8; SECTOR_SIZE as usize];
    read_at(reader, SECTOR_SIZE, &mut header)?;
    if &header[0..8] != GPT_SIGNATURE {
        return Err(invalid("protective MBR without GPT header"));
    }
    let entries_lba = le_u64(&header, 72);
    let entry_count = le_u32(&header, 80);
    let entry_size = le_u32(&header, 84) as usize;
    if entry_count > MAX_GPT_ENTRIES || entry_size < 128 {
        return Err(invalid("implausible GPT entry array"));
    }

    let mut table = vec![0u8; entry_count as usize * entry_size];
    read_at(reader, entries_lba * SECTOR_SIZE, &mut table)?;

    let mut partitions = Vec::new();
    for (i, entry) in table.chunks_exact(entry_size).enumerate() {
        if entry[0..16].iter().all(|b| *b == 0) {
            continue;
        }
        let first_lba = le_u64(entry, 32);
        let last_lba = le_u64(entry, 40);
        let units: Vec<u16> = entry[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        partitions.push(Partition {
            index: i as u32 + 1,
            offset: first_lba * SECTOR_SIZE,
            size: last_lba.saturating_sub(first_lba).saturating_add(1) * SECTOR_SIZE,
            name: Some(String::from_utf16_lossy(&units)),
        });
    }
    Ok(PartitionTable {
        kind: TableKind::Gpt,
        partitions,
    })
}

/// Volume label of an ext2/3/4 filesystem starting at `offset`, if there is one.
pub fn ext_volume_label<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
) -> io::Result<Option<String>> {
    let mut superblock = [0u8; 256];
    read_at(reader, offset + EXT_SUPERBLOCK_OFFSET, &mut superblock)?;
    let at = EXT_MAGIC_OFFSET;
    let magic = u16::from_le_bytes([superblock[at], superblock[at + 1]]);
    if magic != EXT_MAGIC {
        return Ok(None);
    }
    let raw = &superblock[EXT_LABEL_OFFSET..EXT_LABEL_OFFSET + 16];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let label = String::from_utf8_lossy(&raw[..end]).into_owned();
    Ok((!label.is_empty()).then_some(label))
}

/// Name used to match a partition: the GPT name, else the filesystem label.
pub fn partition_display_name<R: Read + Seek>(
    reader: &mut R,
    partition: &Partition,
) -> io::Result<Option<String>> {
    match &partition.name {
        Some(name) if !name.is_empty() => Ok(Some(name.clone())),
        _ => ext_volume_label(reader, partition.offset),
    }
}


#[cfg(test)]
mod tests {
    use super::test_images::*;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rejects_unpartitioned_data() {
        let mut cursor = Cursor::new(vec![0u8; 4096]);
        assert!(read_partition_table(&mut cursor).is_err());
    }

    #[test]
    fn test_reads_gpt_names_and_offsets() {
        let image = gpt_image(&["resin-boot", "flash-rootA"]);
        let table = read_partition_table(&mut Cursor::new(image)).unwrap();
        assert_eq!(table.kind, TableKind::Gpt);
        assert_eq!(table.partitions.len(), 2);
        let root = &table.partitions[1];
        assert_eq!(root.index, 2);
        assert_eq!(root.name.as_deref(), Some("flash-rootA"));
        assert_eq!(root.offset, 42 * SECTOR_SIZE);
        assert_eq!(root.size, 8 * SECTOR_SIZE);
    }

    #[test]
    fn test_reads_mbr_with_logical_partitions() {
        let mut image = vec![0u8; 64 * SECTOR_SIZE as usize];
        mbr_entry(&mut image, 0, 0x0C, 4, 4);
        mbr_entry(&mut image, 1, 0x83, 8, 8);
        mbr_entry(&mut image, 2, 0x05, 20, 40);
        // First EBR at LBA 20: logical at +2, next EBR at extended+20.
        let ebr1 = 20 * SECTOR_SIZE as usize;
        mbr_entry(&mut image[ebr1..ebr1 + 512], 0, 0x83, 2, 6);
        mbr_entry(&mut image[ebr1..ebr1 + 512], 1, 0x05, 20, 12);
        let ebr2 = 40 * SECTOR_SIZE as usize;
        mbr_entry(&mut image[ebr2..ebr2 + 512], 0, 0x83, 2, 4);

        let table = read_partition_table(&mut Cursor::new(image)).unwrap();
        assert_eq!(table.kind, TableKind::Mbr);
        let indexes: Vec<u32> = table.partitions.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![1, 2, 5, 6]);
        assert_eq!(table.partitions[2].offset, 22 * SECTOR_SIZE);
        assert_eq!(table.partitions[3].offset, 42 * SECTOR_SIZE);
    }

    #[test]
    fn test_mbr_partition_named_by_ext_label() {
        let mut image = vec![0u8; 64 * SECTOR_SIZE as usize];
        mbr_entry(&mut image, 0, 0x83, 8, 40);
        write_ext_label(&mut image, 8 * SECTOR_SIZE as usize, "resin-rootA");

        let mut cursor = Cursor::new(image);
        let table = read_partition_table(&mut cursor).unwrap();
        let name = partition_display_name(&mut cursor, &table.partitions[0]).unwrap();
        assert_eq!(name.as_deref(), Some("resin-rootA"));
    }

    #[test]
    fn test_non_ext_partition_has_no_label() {
        let mut cursor = Cursor::new(vec![0u8; 8192]);
        assert_eq!(ext_volume_label(&mut cursor, 0).unwrap(), None);
    }
}
