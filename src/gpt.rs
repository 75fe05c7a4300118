//! Boot device partition table handling.
//!
//! The boot device carries a GPT whose only valid copy sits at the end of
//! the device (the backup table); `gptman` falls back to it when the
//! primary header is absent. When initializing, the expected layout is
//! read from a TOML layout file instead and a fresh table is written out.
//!
//! All LBAs are in 512-byte sectors regardless of the medium's native
//! page size.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{bail, Context, Result};
use gptman::{GPTPartitionEntry, GPT};
use log::debug;
use serde::Deserialize;
use uuid::{uuid, Uuid};

pub const SECTOR_SIZE: u64 = 512;

// Boot partitions carry no filesystem; they are recorded as basic data.
const PARTTYPE_BASIC_UUID: Uuid = uuid!("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7");

/// Default layout description installed alongside the tool.
pub const LAYOUT_CONFIG_PATH: &str = match option_env!("BOOT_LAYOUT_CONFIG") {
	Some(x) => x,
	_ => "/etc/tegra-boot-update/layout.toml",
};

/// A partition of the boot device, immutable once loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDesc {
	pub name: String,
	pub first_lba: u64,
	pub last_lba: u64,
}

impl PartitionDesc {
	pub fn start_offset(&self) -> u64 {
		self.first_lba * SECTOR_SIZE
	}

	pub fn size_bytes(&self) -> u64 {
		(self.last_lba - self.first_lba + 1) * SECTOR_SIZE
	}
}

/// One `[[partition]]` entry of the layout file.
#[derive(Clone, Debug, Deserialize)]
pub struct LayoutPartition {
	pub name: String,
	pub start_sector: u64,
	pub size_in_sectors: u64,
}

/// The expected boot device layout, as shipped with the BSP.
#[derive(Clone, Debug, Deserialize)]
pub struct LayoutConfig {
	#[serde(alias = "partition")]
	pub partitions: Vec<LayoutPartition>,
}

impl LayoutConfig {
	pub fn from_path(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.context(format!("Unable to read layout file '{}'", path.display()))?;
		let config: LayoutConfig = toml::from_str(&content).context(format!(
			"Unable to parse layout file '{}'",
			path.display()
		))?;
		if config.partitions.is_empty() {
			bail!("Layout file '{}' defines no partitions", path.display());
		}
		for p in &config.partitions {
			if p.size_in_sectors == 0 {
				bail!("Layout partition '{}' has zero size", p.name);
			}
		}
		Ok(config)
	}
}

/// The partition table of the boot device (plus GPT device, whose address
/// space continues it).
pub struct GptContext {
	parts: Vec<PartitionDesc>,
}

impl GptContext {
	/// Load the partition table from the GPT device.
	pub fn load(device: &Path) -> Result<Self> {
		let mut fd = File::open(device)
			.context(format!("Unable to open '{}'", device.display()))?;
		let table = GPT::find_from(&mut fd).context(format!(
			"cannot load boot sector partition table from '{}'",
			device.display()
		))?;
		let parts: Vec<PartitionDesc> = table
			.iter()
			.filter(|(_, entry)| entry.is_used())
			.map(|(_, entry)| PartitionDesc {
				name: entry.partition_name.as_str().to_string(),
				first_lba: entry.starting_lba,
				last_lba: entry.ending_lba,
			})
			.collect();
		debug!(
			"Loaded {} boot partitions from '{}'",
			parts.len(),
			device.display()
		);
		Ok(Self { parts })
	}

	/// Build the partition table from the layout file instead of the
	/// device contents. Used when initializing.
	pub fn load_from_config(config: &Path) -> Result<Self> {
		let layout = LayoutConfig::from_path(config)?;
		let parts = layout
			.partitions
			.iter()
			.map(|p| PartitionDesc {
				name: p.name.clone(),
				first_lba: p.start_sector,
				last_lba: p.start_sector + p.size_in_sectors - 1,
			})
			.collect();
		Ok(Self { parts })
	}

	pub fn find_by_name(&self, name: &str) -> Option<&PartitionDesc> {
		self.parts.iter().find(|p| p.name == name)
	}

	pub fn partitions(&self) -> &[PartitionDesc] {
		&self.parts
	}

	/// Whether the table matches the layout file: same partition count,
	/// and every layout entry present with the same extent.
	pub fn layout_matches(&self, config: &Path) -> Result<bool> {
		let layout = LayoutConfig::from_path(config)?;
		if layout.partitions.len() != self.parts.len() {
			return Ok(false);
		}
		for expected in &layout.partitions {
			let Some(part) = self.find_by_name(&expected.name) else {
				return Ok(false);
			};
			let last = expected.start_sector + expected.size_in_sectors - 1;
			if part.first_lba != expected.start_sector || part.last_lba != last {
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Write a fresh partition table describing this context to the GPT
	/// device. Only used when initializing the boot device.
	pub fn save(&self, fd: &File) -> Result<()> {
		let mut fd = fd;
		let disk_guid = Uuid::new_v4().to_bytes_le();
		let mut table = GPT::new_from(&mut fd, SECTOR_SIZE, disk_guid)
			.context("Unable to create a new boot partition table")?;
		for (i, part) in self.parts.iter().enumerate() {
			table[i as u32 + 1] = GPTPartitionEntry {
				partition_type_guid: PARTTYPE_BASIC_UUID.to_bytes_le(),
				unique_partition_guid: Uuid::new_v4().to_bytes_le(),
				starting_lba: part.first_lba,
				ending_lba: part.last_lba,
				attribute_bits: 0,
				partition_name: part.name.as_str().into(),
			};
		}
		table
			.write_into(&mut fd)
			.context("could not initialize boot sector partition table")?;
		fd.sync_all()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use std::path::PathBuf;

	const LAYOUT: &str = r#"
[[partition]]
name = "BCT"
start_sector = 40
size_in_sectors = 128

[[partition]]
name = "mb1"
start_sector = 168
size_in_sectors = 512

[[partition]]
name = "mb1_b"
start_sector = 680
size_in_sectors = 512
"#;

	fn layout_file(dir: &tempfile::TempDir) -> PathBuf {
		let path = dir.path().join("layout.toml");
		let mut f = File::create(&path).unwrap();
		f.write_all(LAYOUT.as_bytes()).unwrap();
		path
	}

	#[test]
	fn test_load_from_config() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = layout_file(&dir);
		let gpt = GptContext::load_from_config(&path)?;
		let bct = gpt.find_by_name("BCT").unwrap();
		assert_eq!(bct.first_lba, 40);
		assert_eq!(bct.last_lba, 167);
		assert_eq!(bct.size_bytes(), 128 * 512);
		let mb1 = gpt.find_by_name("mb1").unwrap();
		assert_eq!(mb1.start_offset(), 168 * 512);
		assert!(gpt.find_by_name("mb2").is_none());
		Ok(())
	}

	#[test]
	fn test_layout_match() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = layout_file(&dir);
		let gpt = GptContext::load_from_config(&path)?;
		assert!(gpt.layout_matches(&path)?);

		// A shifted partition no longer matches.
		let moved = LAYOUT.replace("start_sector = 680", "start_sector = 768");
		let other = dir.path().join("layout2.toml");
		File::create(&other)?.write_all(moved.as_bytes())?;
		assert!(!gpt.layout_matches(&other)?);

		// A missing layout file is a comparison error, not a mismatch.
		assert!(gpt.layout_matches(&dir.path().join("nonexistent.toml")).is_err());
		Ok(())
	}

	#[test]
	fn test_save_and_reload() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let path = layout_file(&dir);
		let gpt = GptContext::load_from_config(&path)?;

		let img = dir.path().join("bootdev.img");
		let fd = File::options()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&img)?;
		// 4 MiB scratch device.
		fd.set_len(4 * 1024 * 1024)?;
		gpt.save(&fd)?;

		let reloaded = GptContext::load(&img)?;
		assert_eq!(reloaded.partitions().len(), 3);
		let mb1_b = reloaded.find_by_name("mb1_b").unwrap();
		assert_eq!(mb1_b.first_lba, 680);
		assert_eq!(mb1_b.last_lba, 1191);
		Ok(())
	}
}
