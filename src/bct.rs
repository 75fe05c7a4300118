//! BCT write protocols.
//!
//! The BCT is the first structure the boot ROM fetches, which makes it the
//! riskiest write of an update. Both protocols below order their writes so
//! that at any crash point a valid BCT copy is still reachable by the ROM:
//!
//! - T186/T194 keep three slots (block 0 slot 1, block 1 slot 0, block 0
//!   slot 0) and write them in that order.
//! - T210 keeps up to 64 copies at block stride and writes last copy,
//!   middle copies, first copy, with the non-BCT partition writes
//!   interleaved between the three phases.

use std::io::Write;

use anyhow::{bail, Result};
use owo_colors::OwoColorize;

use crate::blockdev::BlockDev;
use crate::soc::{BootMedium, SocFamily};

// Continuation lines of the T210 multi-copy writer line up under the
// "  Processing BCT... " leader.
const INDENT: &str = "                    ";

/// A single write of the BCT protocol, relative to the partition start.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BctWrite {
	pub offset: u64,
	pub erase_len: usize,
}

/// Progress of the three-phase T210 BCT update. The executor owns one of
/// these and passes it to the writer for each `BCT` occurrence in the
/// ordered plan; the writer advances it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BctPhase {
	WriteLast,
	WriteMiddle,
	WriteFirst,
}

impl BctPhase {
	fn advance(self) -> Self {
		match self {
			Self::WriteLast => Self::WriteMiddle,
			Self::WriteMiddle => Self::WriteFirst,
			// Wrap back around for symmetry with the initial state.
			Self::WriteFirst => Self::WriteLast,
		}
	}

	/// Copy indices covered by this phase, highest first.
	fn copy_range(self, copies_used: usize) -> Vec<usize> {
		match self {
			Self::WriteLast => vec![copies_used - 1],
			Self::WriteMiddle => (1..copies_used.saturating_sub(1)).rev().collect(),
			Self::WriteFirst => vec![0],
		}
	}
}

/// Well-formedness check for a proposed BCT update against the BCT
/// currently on disk. Performed only in update mode; a failure aborts the
/// whole batch before the first write.
pub fn update_valid(current: &[u8], new: &[u8], soc: SocFamily, medium: BootMedium) -> bool {
	if new.len() < 4 || current.len() < 4 {
		return false;
	}
	if new.len() > medium.block_size() {
		return false;
	}
	if soc == SocFamily::T210 && new.len() % medium.page_size() != 0 {
		return false;
	}
	// The leading device signature word must survive an update; a mismatch
	// means the payload was generated for a different boot device.
	current[..4] == new[..4]
}

/// The fixed T186/T194 write sequence: block 0 slot 1, block 1 slot 0,
/// block 0 slot 0.
pub fn t18x_write_plan(payload_len: usize, medium: BootMedium) -> Vec<BctWrite> {
	let slot_size = bct_slot_size(payload_len, medium);
	[slot_size as u64, medium.block_size() as u64, 0]
		.iter()
		.map(|offset| BctWrite {
			offset: *offset,
			erase_len: slot_size,
		})
		.collect()
}

/// Number of BCT copies the partition holds, capped at what the boot ROM
/// will look at.
pub fn t210_copies_used(part_size: u64, medium: BootMedium) -> usize {
	((part_size / medium.block_size() as u64) as usize).min(64)
}

fn bct_slot_size(payload_len: usize, medium: BootMedium) -> usize {
	let page = medium.page_size();
	page * payload_len.div_ceil(page)
}

/// Execute the T186/T194 BCT update at `part_offset` on `dev`.
///
/// `current` holds the present partition contents when updating (`None`
/// when initializing); matching slots are skipped.
#[allow(clippy::too_many_arguments)]
pub fn update_t18x(
	dev: &BlockDev,
	part_offset: u64,
	part_size: usize,
	current: Option<&[u8]>,
	new: &[u8],
	zero: &[u8],
	soc: SocFamily,
	medium: BootMedium,
) -> Result<()> {
	if soc == SocFamily::T210 {
		bail!("Internal error: incorrect BCT update function for t210");
	}
	if let Some(current) = current {
		if !update_valid(current, new, soc, medium) {
			bail!("validation check failed for BCT update");
		}
	}
	let slot_size = bct_slot_size(new.len(), medium);
	if part_size < medium.block_size() + slot_size {
		bail!("BCT partition too small for redundant copies");
	}

	for write in t18x_write_plan(new.len(), medium) {
		if slot_matches(current, write.offset, new) {
			print!("[offset={},no update needed]...", write.offset);
			continue;
		}
		print!("[offset={}]...", write.offset);
		let _ = std::io::stdout().flush();
		dev.write_at(new, part_offset + write.offset, &zero[..write.erase_len])?;
	}
	dev.flush()?;
	println!("{}", "[OK]".green());
	Ok(())
}

/// Execute one phase of the T210 BCT update at `part_offset` on `dev`,
/// advancing `phase` for the next `BCT` occurrence in the plan.
#[allow(clippy::too_many_arguments)]
pub fn update_t210(
	dev: &BlockDev,
	part_offset: u64,
	part_size: u64,
	current: Option<&[u8]>,
	new: &[u8],
	zero: &[u8],
	phase: &mut BctPhase,
	soc: SocFamily,
	medium: BootMedium,
) -> Result<()> {
	if soc != SocFamily::T210 {
		bail!("Internal error: incorrect BCT update function for non-t210");
	}
	if let Some(current) = current {
		if !update_valid(current, new, soc, medium) {
			bail!("validation check failed for BCT update");
		}
	}
	if new.len() % medium.page_size() != 0 {
		bail!("BCT update payload not an even multiple of boot device page size");
	}
	let copies_per_block = medium.bct_copies_per_block();
	if new.len() * copies_per_block > medium.block_size() {
		bail!(
			"{} BCT payload{} too large for boot device block size",
			copies_per_block,
			if copies_per_block == 1 { "" } else { "s" }
		);
	}
	let copies_used = t210_copies_used(part_size, medium);
	if copies_used == 0 {
		bail!("BCT partition smaller than one boot device block");
	}

	let block_size = medium.block_size() as u64;
	let mut prefix = "";
	for idx in phase.copy_range(copies_used) {
		let offset = idx as u64 * block_size;
		let name = if idx == 0 {
			"BCT".to_string()
		} else {
			format!("BCT-{}", idx)
		};
		if slot_matches(current, offset, new) {
			println!("{}{}: [no update needed]", prefix, name);
			prefix = INDENT;
			continue;
		}
		print!("{}{}: ", prefix, name);
		let _ = std::io::stdout().flush();
		dev.write_at(new, part_offset + offset, &zero[..new.len()])?;
		if idx == 0 && copies_per_block == 2 {
			let dup = offset + new.len() as u64;
			dev.write_at(new, part_offset + dup, &zero[..new.len()])?;
		}
		println!("{}", "[OK]".green());
		prefix = INDENT;
	}
	dev.flush()?;
	*phase = phase.advance();
	Ok(())
}

fn slot_matches(current: Option<&[u8]>, offset: u64, new: &[u8]) -> bool {
	let Some(current) = current else {
		return false;
	};
	let offset = offset as usize;
	match current.get(offset..offset + new.len()) {
		Some(slot) => slot == new,
		None => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs::File;
	use std::path::PathBuf;

	fn scratch_device(dir: &tempfile::TempDir, len: usize) -> PathBuf {
		let _ = env_logger::builder().is_test(true).try_init();
		let path = dir.path().join("bootdev");
		let mut f = File::create(&path).unwrap();
		f.write_all(&vec![0xffu8; len]).unwrap();
		path
	}

	fn read_back(dev: &BlockDev, offset: u64, len: usize) -> Vec<u8> {
		let mut buf = vec![0u8; len];
		dev.read_at(&mut buf, offset).unwrap();
		buf
	}

	#[test]
	fn test_t18x_plan_offsets() {
		// 3000-byte payload on eMMC rounds to six 512-byte pages.
		let plan = t18x_write_plan(3000, BootMedium::Emmc);
		let offsets: Vec<u64> = plan.iter().map(|w| w.offset).collect();
		assert_eq!(offsets, vec![3072, 16384, 0]);
		assert!(plan.iter().all(|w| w.erase_len == 3072));

		let plan = t18x_write_plan(3000, BootMedium::SpiFlash);
		let offsets: Vec<u64> = plan.iter().map(|w| w.offset).collect();
		assert_eq!(offsets, vec![4096, 32768, 0]);
	}

	#[test]
	fn test_t18x_writes_three_slots() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = scratch_device(&dir, 64 * 1024);
		let dev = BlockDev::open(&path, true)?;
		let payload = vec![0xabu8; 3000];
		let zero = vec![0u8; 64 * 1024];

		update_t18x(
			&dev,
			0,
			64 * 1024,
			None,
			&payload,
			&zero,
			SocFamily::T186,
			BootMedium::Emmc,
		)?;

		assert_eq!(read_back(&dev, 0, 3000), payload);
		assert_eq!(read_back(&dev, 3072, 3000), payload);
		assert_eq!(read_back(&dev, 16384, 3000), payload);
		// Slot padding is erased, the rest of the partition untouched.
		assert!(read_back(&dev, 3000, 72).iter().all(|b| *b == 0));
		assert!(read_back(&dev, 6144, 512).iter().all(|b| *b == 0xff));
		Ok(())
	}

	#[test]
	fn test_t18x_skips_matching_slots() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = scratch_device(&dir, 64 * 1024);
		let payload = vec![0xabu8; 3000];
		let zero = vec![0u8; 64 * 1024];

		{
			let dev = BlockDev::open(&path, true)?;
			update_t18x(
				&dev,
				0,
				64 * 1024,
				None,
				&payload,
				&zero,
				SocFamily::T186,
				BootMedium::Emmc,
			)?;
		}

		// All three slots now match; a second run on a read-only handle
		// must issue no writes at all.
		let dev = BlockDev::open(&path, false)?;
		let current = read_back(&dev, 0, 64 * 1024);
		update_t18x(
			&dev,
			0,
			64 * 1024,
			Some(&current),
			&payload,
			&zero,
			SocFamily::T186,
			BootMedium::Emmc,
		)?;
		Ok(())
	}

	#[test]
	fn test_t18x_rejects_invalid_update() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = scratch_device(&dir, 64 * 1024);
		let dev = BlockDev::open(&path, false)?;
		let payload = vec![0xabu8; 3000];
		let zero = vec![0u8; 64 * 1024];
		// Current BCT carries a different device signature word.
		let current = vec![0x11u8; 64 * 1024];

		assert!(update_t18x(
			&dev,
			0,
			64 * 1024,
			Some(&current),
			&payload,
			&zero,
			SocFamily::T186,
			BootMedium::Emmc,
		)
		.is_err());
		Ok(())
	}

	#[test]
	fn test_t210_three_phases_cover_every_copy() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let copies = 8usize;
		let part_size = copies * 16384;
		let path = scratch_device(&dir, part_size);
		let dev = BlockDev::open(&path, true)?;
		let payload = vec![0xcdu8; 2048];
		let zero = vec![0u8; part_size];
		let mut phase = BctPhase::WriteLast;

		let run = |phase: &mut BctPhase, dev: &BlockDev| {
			update_t210(
				dev,
				0,
				part_size as u64,
				None,
				&payload,
				&zero,
				phase,
				SocFamily::T210,
				BootMedium::Emmc,
			)
		};
		let written = |dev: &BlockDev| -> Vec<usize> {
			(0..copies)
				.filter(|idx| read_back(dev, (idx * 16384) as u64, 2048) == payload)
				.collect()
		};

		run(&mut phase, &dev)?;
		assert_eq!(phase, BctPhase::WriteMiddle);
		assert_eq!(written(&dev), vec![copies - 1]);

		run(&mut phase, &dev)?;
		assert_eq!(phase, BctPhase::WriteFirst);
		assert_eq!(written(&dev), (1..copies).collect::<Vec<usize>>());

		run(&mut phase, &dev)?;
		// The state machine wraps back around after the first copy.
		assert_eq!(phase, BctPhase::WriteLast);
		assert_eq!(written(&dev), (0..copies).collect::<Vec<usize>>());
		Ok(())
	}

	#[test]
	fn test_t210_spi_duplicates_copy_zero() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let copies = 4usize;
		let part_size = copies * 32768;
		let path = scratch_device(&dir, part_size);
		let dev = BlockDev::open(&path, true)?;
		let payload = vec![0xcdu8; 4096];
		let zero = vec![0u8; part_size];

		let mut phase = BctPhase::WriteLast;
		for _ in 0..3 {
			update_t210(
				&dev,
				0,
				part_size as u64,
				None,
				&payload,
				&zero,
				&mut phase,
				SocFamily::T210,
				BootMedium::SpiFlash,
			)?;
		}
		// Block 0 holds two copies on SPI flash.
		assert_eq!(read_back(&dev, 0, 4096), payload);
		assert_eq!(read_back(&dev, 4096, 4096), payload);
		for idx in 1..copies {
			assert_eq!(read_back(&dev, (idx * 32768) as u64, 4096), payload);
		}
		Ok(())
	}

	#[test]
	fn test_t210_rejects_unaligned_payload() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = scratch_device(&dir, 4 * 16384);
		let dev = BlockDev::open(&path, false)?;
		let zero = vec![0u8; 4 * 16384];
		let mut phase = BctPhase::WriteLast;

		assert!(update_t210(
			&dev,
			0,
			4 * 16384,
			None,
			&vec![0u8; 2047],
			&zero,
			&mut phase,
			SocFamily::T210,
			BootMedium::Emmc,
		)
		.is_err());
		Ok(())
	}

	#[test]
	fn test_phase_copy_ranges() {
		assert_eq!(BctPhase::WriteLast.copy_range(8), vec![7]);
		assert_eq!(BctPhase::WriteMiddle.copy_range(8), vec![6, 5, 4, 3, 2, 1]);
		assert_eq!(BctPhase::WriteFirst.copy_range(8), vec![0]);
		// Single-copy partitions have no middle entries.
		assert!(BctPhase::WriteMiddle.copy_range(1).is_empty());
		assert!(BctPhase::WriteMiddle.copy_range(2).is_empty());
	}

	#[test]
	fn test_t210_copies_capped() {
		assert_eq!(t210_copies_used(1024 * 16384, BootMedium::Emmc), 64);
		assert_eq!(t210_copies_used(16384, BootMedium::Emmc), 1);
		assert_eq!(t210_copies_used(8192, BootMedium::Emmc), 0);
	}

	#[test]
	fn test_update_valid() {
		let current = vec![0x42u8; 4096];
		let mut new = vec![0x42u8; 2048];
		assert!(update_valid(
			&current,
			&new,
			SocFamily::T186,
			BootMedium::Emmc
		));
		// Signature word mismatch.
		new[0] = 0x43;
		assert!(!update_valid(
			&current,
			&new,
			SocFamily::T186,
			BootMedium::Emmc
		));
		new[0] = 0x42;
		// T210 payloads must be page aligned.
		let odd = vec![0x42u8; 2047];
		assert!(!update_valid(&current, &odd, SocFamily::T210, BootMedium::Emmc));
		assert!(!update_valid(&current, &[], SocFamily::T186, BootMedium::Emmc));
	}
}
