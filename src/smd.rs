//! Slot metadata (SMD) handling for A/B-slotted platforms.
//!
//! The SMD records which of the two boot slots the ROM will try first.
//! It is stored twice (partitions `SMD` and `SMD_b`) as a small binary
//! record:
//!
//! ```text
//! magic[4]  version u16  num_slots u16
//! per slot: priority u8  suffix[2]  retry_count u8  boot_successful u8
//! crc32 u32
//! ```
//!
//! The version field doubles as the redundancy level: 1 means no
//! redundancy, 2 redundant boot chains, 3 full redundancy including user
//! partitions.

use std::fs;

use anyhow::{bail, Context, Result};
use flate2::Crc;
use log::debug;

use crate::blockdev::BootDevicePair;
use crate::gpt::GptContext;
use crate::soc::Slot;

const SMD_MAGIC: [u8; 4] = *b"SMDB";
const SMD_LEN: usize = 22;
const CRC_OFFSET: usize = SMD_LEN - 4;
const MAX_PRIORITY: u8 = 15;
const DEFAULT_RETRIES: u8 = 7;

const SMD_PARTITIONS: [&str; 2] = ["SMD", "SMD_b"];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RedundancyLevel {
	None,
	BootOnly,
	Full,
}

impl RedundancyLevel {
	fn from_version(version: u16) -> Option<Self> {
		match version {
			1 => Some(Self::None),
			2 => Some(Self::BootOnly),
			3 => Some(Self::Full),
			_ => None,
		}
	}

	fn version(self) -> u16 {
		match self {
			Self::None => 1,
			Self::BootOnly => 2,
			Self::Full => 3,
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SlotInfo {
	priority: u8,
	suffix: [u8; 2],
	retry_count: u8,
	boot_successful: bool,
}

/// In-memory slot metadata, loaded from disk or freshly initialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotMetadata {
	level: RedundancyLevel,
	slots: [SlotInfo; 2],
}

impl SlotMetadata {
	/// Fresh metadata for an initialized device: slot A bootable and
	/// preferred, slot B standing by.
	pub fn new(level: RedundancyLevel) -> Self {
		Self {
			level,
			slots: [
				SlotInfo {
					priority: MAX_PRIORITY,
					suffix: *b"_a",
					retry_count: DEFAULT_RETRIES,
					boot_successful: true,
				},
				SlotInfo {
					priority: MAX_PRIORITY - 1,
					suffix: *b"_b",
					retry_count: DEFAULT_RETRIES,
					boot_successful: false,
				},
			],
		}
	}

	/// Load the metadata from the SMD partition, falling back to its
	/// backup copy.
	pub fn load(gpt: &GptContext, devs: &BootDevicePair) -> Result<Self> {
		let mut last_err = None;
		for name in SMD_PARTITIONS {
			let Some(part) = gpt.find_by_name(name) else {
				continue;
			};
			match Self::load_copy(part.start_offset(), devs, name) {
				Ok(smd) => return Ok(smd),
				Err(e) => {
					debug!("cannot use {} partition: {}", name, e);
					last_err = Some(e);
				}
			}
		}
		match last_err {
			Some(e) => Err(e.context("loading slot metadata")),
			None => bail!("no slot metadata partition found"),
		}
	}

	fn load_copy(start_offset: u64, devs: &BootDevicePair, name: &str) -> Result<Self> {
		let (dev, offset) = devs.locate(start_offset, name)?;
		let mut raw = [0u8; SMD_LEN];
		dev.read_at(&mut raw, offset)?;
		Self::decode(&raw)
	}

	pub fn decode(raw: &[u8]) -> Result<Self> {
		if raw.len() < SMD_LEN {
			bail!("slot metadata record too short");
		}
		if raw[..4] != SMD_MAGIC {
			bail!("bad slot metadata magic");
		}
		let mut crc = Crc::new();
		crc.update(&raw[..CRC_OFFSET]);
		let stored = u32::from_le_bytes([
			raw[CRC_OFFSET],
			raw[CRC_OFFSET + 1],
			raw[CRC_OFFSET + 2],
			raw[CRC_OFFSET + 3],
		]);
		if crc.sum() != stored {
			bail!("slot metadata checksum mismatch");
		}
		let version = u16::from_le_bytes([raw[4], raw[5]]);
		let level = RedundancyLevel::from_version(version)
			.context(format!("unsupported slot metadata version {}", version))?;
		let num_slots = u16::from_le_bytes([raw[6], raw[7]]);
		if num_slots != 2 {
			bail!("unsupported slot count {}", num_slots);
		}
		let slot = |base: usize| SlotInfo {
			priority: raw[base],
			suffix: [raw[base + 1], raw[base + 2]],
			retry_count: raw[base + 3],
			boot_successful: raw[base + 4] != 0,
		};
		Ok(Self {
			level,
			slots: [slot(8), slot(13)],
		})
	}

	pub fn encode(&self) -> [u8; SMD_LEN] {
		let mut raw = [0u8; SMD_LEN];
		raw[..4].copy_from_slice(&SMD_MAGIC);
		raw[4..6].copy_from_slice(&self.level.version().to_le_bytes());
		raw[6..8].copy_from_slice(&2u16.to_le_bytes());
		for (i, slot) in self.slots.iter().enumerate() {
			let base = 8 + i * 5;
			raw[base] = slot.priority;
			raw[base + 1] = slot.suffix[0];
			raw[base + 2] = slot.suffix[1];
			raw[base + 3] = slot.retry_count;
			raw[base + 4] = slot.boot_successful as u8;
		}
		let mut crc = Crc::new();
		crc.update(&raw[..CRC_OFFSET]);
		raw[CRC_OFFSET..].copy_from_slice(&crc.sum().to_le_bytes());
		raw
	}

	pub fn redundancy_level(&self) -> RedundancyLevel {
		self.level
	}

	pub fn set_redundancy_level(&mut self, level: RedundancyLevel) {
		self.level = level;
	}

	/// Make `slot` the boot ROM's first choice for the next boot: top
	/// priority and a fresh retry budget, with the other slot demoted
	/// below it.
	pub fn mark_active(&mut self, slot: Slot) {
		let active = slot.index() as usize;
		let other = 1 - active;
		self.slots[active].priority = MAX_PRIORITY;
		self.slots[active].retry_count = DEFAULT_RETRIES;
		self.slots[active].boot_successful = false;
		self.slots[other].priority = self.slots[other].priority.min(MAX_PRIORITY - 1);
	}

	/// Persist the metadata to the SMD partitions. The primary copy must
	/// exist; the backup is written when present.
	pub fn update(&self, gpt: &GptContext, devs: &BootDevicePair, initialize: bool) -> Result<()> {
		let raw = self.encode();
		for (i, name) in SMD_PARTITIONS.iter().enumerate() {
			let part = match gpt.find_by_name(name) {
				Some(part) => part,
				None if i > 0 => continue,
				None => bail!("cannot locate {} partition", name),
			};
			if raw.len() as u64 > part.size_bytes() {
				bail!("slot metadata record too large for {} partition", name);
			}
			let (dev, offset) = devs.locate(part.start_offset(), name)?;
			if !initialize {
				let mut current = [0u8; SMD_LEN];
				if dev.read_at(&mut current, offset).is_ok() && current == raw {
					continue;
				}
			}
			dev.write_at(&raw, offset, &[0u8; SMD_LEN])?;
		}
		Ok(())
	}
}

/// The slot the running system booted from, taken from the kernel
/// command line.
pub fn booted_slot() -> Result<u32> {
	let cmdline = fs::read_to_string("/proc/cmdline")?;
	booted_slot_from_cmdline(&cmdline).context("retrieving current boot slot")
}

pub fn booted_slot_from_cmdline(cmdline: &str) -> Option<u32> {
	for arg in cmdline.split_whitespace() {
		let Some(suffix) = arg
			.strip_prefix("boot.slot_suffix=")
			.or_else(|| arg.strip_prefix("androidboot.slot_suffix="))
		else {
			continue;
		};
		return match suffix {
			"" | "_a" => Some(0),
			"_b" => Some(1),
			_ => None,
		};
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_encode_decode_roundtrip() -> Result<()> {
		let mut smd = SlotMetadata::new(RedundancyLevel::BootOnly);
		smd.mark_active(Slot::B);
		let decoded = SlotMetadata::decode(&smd.encode())?;
		assert_eq!(decoded, smd);
		Ok(())
	}

	#[test]
	fn test_decode_rejects_corruption() {
		let smd = SlotMetadata::new(RedundancyLevel::Full);
		let mut raw = smd.encode();
		raw[9] ^= 0xff;
		assert!(SlotMetadata::decode(&raw).is_err());

		let mut raw = smd.encode();
		raw[0] = b'X';
		assert!(SlotMetadata::decode(&raw).is_err());

		assert!(SlotMetadata::decode(&[0u8; 8]).is_err());
	}

	#[test]
	fn test_mark_active_demotes_other_slot() {
		let mut smd = SlotMetadata::new(RedundancyLevel::Full);
		assert_eq!(smd.slots[0].priority, MAX_PRIORITY);

		smd.mark_active(Slot::B);
		assert_eq!(smd.slots[1].priority, MAX_PRIORITY);
		assert_eq!(smd.slots[1].retry_count, DEFAULT_RETRIES);
		assert!(!smd.slots[1].boot_successful);
		assert!(smd.slots[0].priority < MAX_PRIORITY);

		smd.mark_active(Slot::A);
		assert_eq!(smd.slots[0].priority, MAX_PRIORITY);
		assert!(smd.slots[1].priority < MAX_PRIORITY);
	}

	#[test]
	fn test_redundancy_level_versions() {
		for level in [
			RedundancyLevel::None,
			RedundancyLevel::BootOnly,
			RedundancyLevel::Full,
		] {
			assert_eq!(RedundancyLevel::from_version(level.version()), Some(level));
		}
		assert_eq!(RedundancyLevel::from_version(7), None);
	}

	#[test]
	fn test_booted_slot_from_cmdline() {
		let cmdline = "console=ttyS0,115200 boot.slot_suffix=_b root=/dev/mmcblk0p1";
		assert_eq!(booted_slot_from_cmdline(cmdline), Some(1));
		let cmdline = "androidboot.slot_suffix=_a console=ttyS0";
		assert_eq!(booted_slot_from_cmdline(cmdline), Some(0));
		assert_eq!(booted_slot_from_cmdline("console=ttyS0"), None);
	}
}
