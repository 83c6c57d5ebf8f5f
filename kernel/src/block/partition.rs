//! MBR and GPT partition table support
//!
//! After a physical disk is registered, [`scan`] reads its first two sectors
//! (uncached), decodes whichever partition table it finds and registers one
//! derived device per partition. Partitions are named `<disk><n>` where `n`
//! is the entry's slot in the table counting from 1, so emptying one slot
//! never renames the others. Partitions are never scanned themselves.

use super::{BlockDevice, BlockDeviceRegistry, BlockError, DeviceId, MINORS_PER_DISK};
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// MBR boot signature at byte 510
const MBR_SIGNATURE: u16 = 0xAA55;
const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_ENTRY_COUNT: usize = 4;

/// Protective MBR type covering a GPT disk
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
/// Minimum header size defined by UEFI (revision 1.0)
const GPT_MIN_HEADER_SIZE: u32 = 92;
const GPT_MIN_ENTRY_SIZE: u32 = 128;
/// Upper bound on entries we are willing to read
const GPT_MAX_ENTRIES: u32 = 1024;
const GPT_NAME_UNITS: usize = 36;

/// 16-byte GUID as stored on disk (first three fields little-endian)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const LINUX_FILESYSTEM: Guid = Guid::from_fields(0x0FC63DAF, 0x8483, 0x4772, [0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4]);
    pub const LINUX_SWAP: Guid = Guid::from_fields(0x0657FD6D, 0xA4AB, 0x43C4, [0x84, 0xE5, 0x09, 0x33, 0xC8, 0x4B, 0x4F, 0x4F]);
    pub const LINUX_LVM: Guid = Guid::from_fields(0xE6D6D379, 0xF507, 0x44C2, [0xA2, 0x3C, 0x23, 0x8F, 0x2A, 0x3D, 0xF9, 0x28]);
    pub const EFI_SYSTEM: Guid = Guid::from_fields(0xC12A7328, 0xF81F, 0x11D2, [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B]);
    pub const MS_BASIC_DATA: Guid = Guid::from_fields(0xEBD0A0A2, 0xB9E5, 0x4433, [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7]);

    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        let a = d1.to_le_bytes();
        let b = d2.to_le_bytes();
        let c = d3.to_le_bytes();
        Guid([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5],
            d4[6], d4[7],
        ])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            LittleEndian::read_u32(&g[0..4]),
            LittleEndian::read_u16(&g[4..6]),
            LittleEndian::read_u16(&g[6..8]),
            g[8], g[9], g[10], g[11], g[12], g[13], g[14], g[15]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// Partition type as recorded in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// MBR system id byte
    Mbr(u8),
    /// GPT partition type GUID
    Gpt(Guid),
}

impl PartitionType {
    /// Human-readable type name
    pub fn name(&self) -> &'static str {
        match *self {
            PartitionType::Mbr(0x83) => "Linux",
            PartitionType::Mbr(0x82) => "Linux swap",
            PartitionType::Mbr(0x8e) => "Linux LVM",
            PartitionType::Mbr(0xef) => "EFI System",
            PartitionType::Mbr(0x0b) | PartitionType::Mbr(0x0c) => "FAT32",
            PartitionType::Mbr(0x07) => "NTFS/exFAT",
            PartitionType::Mbr(0x05) | PartitionType::Mbr(0x0f) => "Extended",
            PartitionType::Mbr(_) => "Unknown",
            PartitionType::Gpt(g) if g == Guid::LINUX_FILESYSTEM => "Linux filesystem",
            PartitionType::Gpt(g) if g == Guid::LINUX_SWAP => "Linux swap",
            PartitionType::Gpt(g) if g == Guid::LINUX_LVM => "Linux LVM",
            PartitionType::Gpt(g) if g == Guid::EFI_SYSTEM => "EFI System",
            PartitionType::Gpt(g) if g == Guid::MS_BASIC_DATA => "Microsoft basic data",
            PartitionType::Gpt(_) => "Unknown",
        }
    }
}

/// A decoded partition table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Position in the table, counting from 1
    pub slot: u32,
    pub start_lba: u64,
    pub sector_count: u64,
    pub kind: PartitionType,
    /// GPT partition name, if set
    pub label: Option<String>,
}

/// Sector window onto a parent device
///
/// Holds a weak reference: the registry owns the parent.
pub struct PartitionView {
    parent: Weak<BlockDevice>,
    start_lba: u64,
    sector_count: u64,
    kind: PartitionType,
    label: Option<String>,
}

impl PartitionView {
    pub fn new(parent: &Arc<BlockDevice>, entry: &PartitionEntry) -> Self {
        Self {
            parent: Arc::downgrade(parent),
            start_lba: entry.start_lba,
            sector_count: entry.sector_count,
            kind: entry.kind,
            label: entry.label.clone(),
        }
    }

    pub fn start_lba(&self) -> u64 {
        self.start_lba
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn kind(&self) -> PartitionType {
        self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn parent(&self) -> Option<Arc<BlockDevice>> {
        self.parent.upgrade()
    }

    /// Translate a partition-relative request to the parent's LBA space
    fn translate(&self, lba: u64, len: usize) -> Result<(Arc<BlockDevice>, u64), BlockError> {
        let parent = self.parent().ok_or(BlockError::DeviceNotReady)?;
        let count = (len / parent.sector_size()) as u64;
        match lba.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok((parent, self.start_lba + lba)),
            _ => Err(BlockError::OutOfBounds),
        }
    }

    pub(super) fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let (parent, abs) = self.translate(lba, buf.len())?;
        parent.read_sectors(abs, buf)
    }

    pub(super) fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        let (parent, abs) = self.translate(lba, buf.len())?;
        parent.write_sectors(abs, buf)
    }

    pub(super) fn flush(&self) -> Result<(), BlockError> {
        self.parent().ok_or(BlockError::DeviceNotReady)?.flush()
    }
}

impl fmt::Debug for PartitionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionView")
            .field("start_lba", &self.start_lba)
            .field("sector_count", &self.sector_count)
            .field("kind", &self.kind.name())
            .field("label", &self.label)
            .finish()
    }
}

/// Decode the four primary MBR entries
///
/// Returns `None` when the boot signature is missing. Empty slots and slots
/// with a zero length are skipped.
pub fn parse_mbr(sector0: &[u8]) -> Option<Vec<PartitionEntry>> {
    if sector0.len() < 512 || LittleEndian::read_u16(&sector0[MBR_SIGNATURE_OFFSET..]) != MBR_SIGNATURE {
        return None;
    }

    let mut entries = Vec::new();
    for slot in 0..MBR_ENTRY_COUNT {
        let raw = &sector0[MBR_TABLE_OFFSET + slot * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
        let status = raw[0];
        let system_id = raw[4];
        let start_lba = LittleEndian::read_u32(&raw[8..12]) as u64;
        let sector_count = LittleEndian::read_u32(&raw[12..16]) as u64;

        if system_id == 0 {
            continue;
        }
        if status != 0x00 && status != 0x80 {
            log::warn!("partition: MBR slot {} has invalid status {:#04x}, skipping", slot, status);
            continue;
        }
        if sector_count == 0 || start_lba == 0 {
            log::warn!("partition: MBR slot {} has an empty or overlapping range, skipping", slot);
            continue;
        }

        entries.push(PartitionEntry {
            slot: slot as u32 + 1,
            start_lba,
            sector_count,
            kind: PartitionType::Mbr(system_id),
            label: None,
        });
    }
    Some(entries)
}

/// Fields of the GPT header needed to locate the entry array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
}

impl GptHeader {
    /// Parse the header at LBA 1
    ///
    /// Returns `Ok(None)` if the signature is absent and
    /// `Err(InvalidStructure)` if it is present but the header is malformed.
    /// Entries may not straddle sectors, so `entry_size` is bounded by the
    /// length of `sector1`.
    pub fn parse(sector1: &[u8], capacity_sectors: u64) -> Result<Option<Self>, BlockError> {
        if sector1.len() < GPT_MIN_HEADER_SIZE as usize || &sector1[0..8] != GPT_SIGNATURE {
            return Ok(None);
        }

        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&sector1[56..72]);
        let header = GptHeader {
            revision: LittleEndian::read_u32(&sector1[8..12]),
            header_size: LittleEndian::read_u32(&sector1[12..16]),
            first_usable_lba: LittleEndian::read_u64(&sector1[40..48]),
            last_usable_lba: LittleEndian::read_u64(&sector1[48..56]),
            disk_guid: Guid(disk_guid),
            entries_lba: LittleEndian::read_u64(&sector1[72..80]),
            num_entries: LittleEndian::read_u32(&sector1[80..84]),
            entry_size: LittleEndian::read_u32(&sector1[84..88]),
        };
        let my_lba = LittleEndian::read_u64(&sector1[24..32]);

        if my_lba != 1
            || header.header_size < GPT_MIN_HEADER_SIZE
            || header.header_size as usize > sector1.len()
        {
            log::warn!("partition: GPT header at LBA {} with size {} is invalid", my_lba, header.header_size);
            return Err(BlockError::InvalidStructure);
        }
        if header.entry_size < GPT_MIN_ENTRY_SIZE
            || !header.entry_size.is_power_of_two()
            || header.entry_size as usize > sector1.len()
            || header.num_entries > GPT_MAX_ENTRIES
        {
            log::warn!(
                "partition: GPT entry array {} x {} bytes is invalid",
                header.num_entries,
                header.entry_size
            );
            return Err(BlockError::InvalidStructure);
        }
        let table_end = header.entries_lba.checked_add(header.entry_sectors(sector1.len()));
        if header.entries_lba < 2
            || !matches!(table_end, Some(end) if end <= capacity_sectors)
            || header.first_usable_lba > header.last_usable_lba
            || header.last_usable_lba >= capacity_sectors
        {
            log::warn!("partition: GPT layout does not fit a {}-sector disk", capacity_sectors);
            return Err(BlockError::InvalidStructure);
        }
        Ok(Some(header))
    }

    /// Sectors occupied by the entry array
    pub fn entry_sectors(&self, sector_size: usize) -> u64 {
        (self.num_entries as u64 * self.entry_size as u64).div_ceil(sector_size as u64)
    }
}

/// Decode one sector's worth of the GPT entry array
///
/// `first` is the array index of the first entry in `sector`. Entries with an
/// all-zero type GUID are unused and skipped; entries whose range falls
/// outside the usable area are rejected with a warning.
pub fn parse_gpt_entries(header: &GptHeader, sector: &[u8], first: u32) -> Vec<PartitionEntry> {
    let remaining = header.num_entries.saturating_sub(first) as usize;
    let mut entries = Vec::new();
    for (i, raw) in sector
        .chunks_exact(header.entry_size as usize)
        .take(remaining)
        .enumerate()
    {
        let index = first + i as u32;
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&raw[0..16]);
        let type_guid = Guid(type_guid);
        if type_guid.is_zero() {
            continue;
        }

        let first_lba = LittleEndian::read_u64(&raw[32..40]);
        let last_lba = LittleEndian::read_u64(&raw[40..48]);
        if first_lba > last_lba
            || first_lba < header.first_usable_lba
            || last_lba > header.last_usable_lba
        {
            log::warn!(
                "partition: GPT entry {} spans {}..={} outside usable range, skipping",
                index,
                first_lba,
                last_lba
            );
            continue;
        }

        entries.push(PartitionEntry {
            slot: index + 1,
            start_lba: first_lba,
            sector_count: last_lba - first_lba + 1,
            kind: PartitionType::Gpt(type_guid),
            label: decode_gpt_name(&raw[56..56 + GPT_NAME_UNITS * 2]),
        });
    }
    entries
}

/// UTF-16LE, NUL-terminated
fn decode_gpt_name(raw: &[u8]) -> Option<String> {
    let units = raw
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0);
    let name: String = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Read the partition table of `device` without going through the cache
///
/// GPT takes precedence over the protective MBR. A malformed GPT header
/// falls back to whatever the MBR describes. A disk with neither signature
/// has no partitions.
pub fn read_table(device: &BlockDevice) -> Result<Vec<PartitionEntry>, BlockError> {
    let sector_size = device.sector_size();
    let mut sector0 = vec![0u8; sector_size];
    device.read_sectors(0, &mut sector0)?;

    if device.capacity_sectors() > 1 {
        let mut sector1 = vec![0u8; sector_size];
        device.read_sectors(1, &mut sector1)?;
        match GptHeader::parse(&sector1, device.capacity_sectors()) {
            Ok(Some(header)) => return read_gpt_entries(device, &header),
            Ok(None) => {}
            Err(e) => log::warn!("partition: {}: GPT header unusable ({}), trying the MBR", device.name(), e),
        }
    }

    match parse_mbr(&sector0) {
        Some(entries) => Ok(entries
            .into_iter()
            .filter(|e| {
                let protective = e.kind == PartitionType::Mbr(MBR_TYPE_GPT_PROTECTIVE);
                if protective {
                    log::warn!("partition: {}: protective MBR without a GPT header", device.name());
                }
                !protective
            })
            .collect()),
        None => Ok(Vec::new()),
    }
}

/// Read the entry array one sector at a time
fn read_gpt_entries(device: &BlockDevice, header: &GptHeader) -> Result<Vec<PartitionEntry>, BlockError> {
    log::debug!(
        "partition: {}: GPT rev {:#x}, disk {}, {} entries at LBA {}",
        device.name(),
        header.revision,
        header.disk_guid,
        header.num_entries,
        header.entries_lba
    );
    let sector_size = device.sector_size();
    let per_sector = (sector_size / header.entry_size as usize) as u32;
    let mut sector = vec![0u8; sector_size];
    let mut entries = Vec::new();
    for i in 0..header.entry_sectors(sector_size) {
        device.read_sectors(header.entries_lba + i, &mut sector)?;
        entries.extend(parse_gpt_entries(header, &sector, i as u32 * per_sector));
    }
    Ok(entries)
}

/// Detect partitions on a freshly registered disk and register them
///
/// Partition devices themselves are never scanned. Each partition takes the
/// minor number `disk minor + slot`; entries whose slot has no minor left, or
/// that do not fit the disk, are skipped.
pub fn scan(
    registry: &BlockDeviceRegistry,
    device: &Arc<BlockDevice>,
) -> Result<Vec<Arc<BlockDevice>>, BlockError> {
    if device.is_partition() {
        return Ok(Vec::new());
    }

    let entries = read_table(device)?;
    if entries.is_empty() {
        log::info!("partition: {}: no partitions", device.name());
        return Ok(Vec::new());
    }

    let mut registered = Vec::new();
    for entry in entries {
        let index = entry.slot;
        if index >= MINORS_PER_DISK {
            log::warn!("partition: {}: no minor number for table slot {}, skipping", device.name(), index);
            continue;
        }

        let name = format!("{}{}", device.name(), index);
        let id = DeviceId::new(device.id().major, device.id().minor + index);
        let part = match BlockDevice::partition(&name, id, device, PartitionView::new(device, &entry)) {
            Ok(part) => part,
            Err(e) => {
                log::warn!(
                    "partition: {}: entry at LBA {} (+{}) rejected: {}",
                    device.name(),
                    entry.start_lba,
                    entry.sector_count,
                    e
                );
                continue;
            }
        };

        log::info!(
            "partition: {} start={} sectors={} type={}{}",
            name,
            entry.start_lba,
            entry.sector_count,
            entry.kind.name(),
            entry.label.as_deref().map(|l| format!(" \"{}\"", l)).unwrap_or_default()
        );
        registered.push(registry.register(part)?);
    }
    Ok(registered)
}
