//! SoC family and boot medium detection.
//!
//! The SoC family selects the redundancy scheme (A/B slots on T186/T194,
//! multi-copy in-partition redundancy on T210), the BCT write protocol and
//! the naming convention for the backup copy of a redundant partition. The
//! boot medium selects the erase-block and page geometry of the boot device.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use strum::Display;

const COMPATIBLE_PATH: &str = "/proc/device-tree/compatible";

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum SocFamily {
	T210,
	T186,
	T194,
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum BootMedium {
	#[strum(serialize = "eMMC")]
	Emmc,
	#[strum(serialize = "SPI flash")]
	SpiFlash,
}

/// One of the two A/B boot slots. Slot A carries no name suffix,
/// slot B carries `_b`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
	A,
	B,
}

impl SocFamily {
	/// Determine the SoC family of the running system from the device tree.
	pub fn detect() -> Result<Self> {
		let compatible = fs::read(COMPATIBLE_PATH)?;
		match Self::from_compatible(&compatible) {
			Some(soc) => Ok(soc),
			None => bail!("could not determine SoC type"),
		}
	}

	/// Map the NUL-separated compatible strings of the device tree root
	/// to a SoC family.
	pub fn from_compatible(compatible: &[u8]) -> Option<Self> {
		for entry in compatible.split(|b| *b == 0) {
			let entry = String::from_utf8_lossy(entry);
			if entry.contains("tegra210") {
				return Some(Self::T210);
			}
			if entry.contains("tegra186") {
				return Some(Self::T186);
			}
			if entry.contains("tegra194") {
				return Some(Self::T194);
			}
		}
		None
	}

	/// Whether this family uses A/B boot slots with slot metadata.
	pub fn is_slotted(self) -> bool {
		!matches!(self, Self::T210)
	}

	/// Name of the backup copy of a redundant partition. The convention
	/// differs between families, and on T210 also between partitions and
	/// boot media.
	pub fn redundant_name(self, partname: &str, medium: BootMedium) -> String {
		if self != Self::T210 {
			return format!("{}_b", partname);
		}
		match partname {
			"NVC" if medium == BootMedium::SpiFlash => format!("{}_R", partname),
			"NVC" => format!("{}-1", partname),
			"VER" => format!("{}_b", partname),
			_ => format!("{}-1", partname),
		}
	}
}

impl BootMedium {
	/// Classify the boot medium from the boot device node path.
	pub fn from_boot_device(path: &Path) -> Result<Self> {
		let path = path.to_string_lossy();
		if path.starts_with("/dev/mtd") {
			Ok(Self::SpiFlash)
		} else if path.starts_with("/dev/mmc") {
			Ok(Self::Emmc)
		} else {
			bail!("unrecognized boot device: {}", path);
		}
	}

	/// Erase block size of the boot device.
	pub fn block_size(self) -> usize {
		match self {
			Self::Emmc => 16384,
			Self::SpiFlash => 32768,
		}
	}

	/// Page size of the boot device.
	pub fn page_size(self) -> usize {
		match self {
			Self::Emmc => 512,
			Self::SpiFlash => 2048,
		}
	}

	/// Number of BCT copies stored in block 0 on T210 platforms.
	pub fn bct_copies_per_block(self) -> usize {
		match self {
			Self::Emmc => 1,
			Self::SpiFlash => 2,
		}
	}

	/// Whether a second boot device holding the tail of the GPT address
	/// space exists (eMMC boot0/boot1 pairs only).
	pub fn has_gpt_device(self) -> bool {
		matches!(self, Self::Emmc)
	}
}

impl Slot {
	pub fn index(self) -> u32 {
		match self {
			Self::A => 0,
			Self::B => 1,
		}
	}

	pub fn other(self) -> Self {
		match self {
			Self::A => Self::B,
			Self::B => Self::A,
		}
	}

	pub fn from_index(index: u32) -> Self {
		if index == 0 {
			Self::A
		} else {
			Self::B
		}
	}
}

impl FromStr for Slot {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"" | "_a" => Ok(Self::A),
			"_b" => Ok(Self::B),
			_ => Err("slot suffix must be either _a or _b".to_string()),
		}
	}
}
