//! Bootloader update package (BUP) container handling.
//!
//! A BUP is a vendor-produced blob: a fixed header followed by a directory
//! of entries keyed by partition name, each pointing at a firmware payload
//! inside the blob. Entries may be restricted to a hardware variant
//! (TNSPEC); entries for other variants are filtered out of enumeration.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header:  magic[16] version u32 size u32 header_size u32
//!          entry_count u32 blob_type u32 uncomp_size u32
//! entry:   name[40] offset u32 length u32 version u32 op_mode u32
//!          spec[128]
//! ```

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::soc::SocFamily;

pub const BLOB_MAGIC: &[u8; 16] = b"NVIDIA__BLOB__V2";

const HEADER_LEN: usize = 40;
const ENTRY_LEN: usize = 184;
const ENTRY_NAME_LEN: usize = 40;
const ENTRY_SPEC_LEN: usize = 128;
const MAX_BLOB_ENTRIES: u32 = 64;

/// Identity of the running hardware variant, written at provisioning time.
pub const MACHINE_SPEC_PATH: &str = match option_env!("MACHINE_SPEC_PATH") {
	Some(x) => x,
	_ => "/etc/tegra-boot-update/tnspec",
};

// Boot-chain partitions every update payload must cover. A payload missing
// any of these cannot be applied.
const REQUIRED_T18X: &[&str] = &["BCT", "mb1", "mb2"];
const REQUIRED_T210: &[&str] = &[
	"BCT", "PT", "TBC", "RP1", "EBT", "WB0", "BPF", "DTB", "TOS", "LNX", "NVC", "VER",
];

/// Whether a partition named in the payload but absent from the system is
/// a fatal condition. Encryption-key and bitmap partitions are optional.
pub fn should_be_present(name: &str) -> bool {
	!(name.starts_with("EKS") || name.starts_with("BMP"))
}

/// One directory entry of the blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BupEntry {
	pub name: String,
	pub offset: u64,
	pub length: usize,
	/// Per-entry payload version and operating mode; carried through from
	/// the directory but not interpreted here.
	#[allow(dead_code)]
	pub version: u32,
	#[allow(dead_code)]
	pub op_mode: u32,
	pub spec: String,
}

/// An open update package.
pub struct BupContext {
	file: File,
	path: PathBuf,
	tnspec: String,
	compat_spec: Option<String>,
	entries: Vec<BupEntry>,
	boot_device: PathBuf,
	gpt_device: PathBuf,
}

impl BupContext {
	/// Open a package, reading the machine TNSPEC from the provisioning
	/// file and probing the system's boot device nodes.
	pub fn open(path: &Path) -> Result<Self> {
		let (tnspec, compat_spec) = read_machine_spec(Path::new(MACHINE_SPEC_PATH));
		let (boot_device, gpt_device) = default_devices();
		Self::open_with(path, tnspec, compat_spec, boot_device, gpt_device)
	}

	pub fn open_with(
		path: &Path,
		tnspec: String,
		compat_spec: Option<String>,
		boot_device: PathBuf,
		gpt_device: PathBuf,
	) -> Result<Self> {
		let file = File::open(path)
			.context(format!("Unable to open BUP package '{}'", path.display()))?;
		let blob_len = file.metadata()?.len();
		let entries = parse_directory(&file, blob_len)
			.context(format!("Invalid BUP package '{}'", path.display()))?;
		debug!(
			"BUP package '{}' holds {} entries",
			path.display(),
			entries.len()
		);
		Ok(Self {
			file,
			path: path.to_path_buf(),
			tnspec,
			compat_spec,
			entries,
			boot_device,
			gpt_device,
		})
	}

	pub fn tnspec(&self) -> &str {
		&self.tnspec
	}

	pub fn compat_spec(&self) -> Option<&str> {
		self.compat_spec.as_deref()
	}

	pub fn boot_device_path(&self) -> &Path {
		&self.boot_device
	}

	pub fn gpt_device_path(&self) -> &Path {
		&self.gpt_device
	}

	/// Entries applicable to this machine, in blob order.
	pub fn entries(&self) -> impl Iterator<Item = &BupEntry> {
		self.entries.iter().filter(|e| self.spec_matches(e))
	}

	fn spec_matches(&self, entry: &BupEntry) -> bool {
		entry.spec.is_empty()
			|| entry.spec == self.tnspec
			|| self.compat_spec.as_deref() == Some(entry.spec.as_str())
	}

	/// Read exactly `buf.len()` payload bytes at `offset` into `buf`.
	pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		self.file
			.read_exact_at(buf, offset)
			.context(format!("error reading content from '{}'", self.path.display()))
	}

	/// Boot-chain partitions required for this SoC family that the
	/// package does not cover.
	pub fn find_missing(&self, soc: SocFamily) -> Vec<&'static str> {
		let required: &[&str] = match soc {
			SocFamily::T210 => REQUIRED_T210,
			_ => REQUIRED_T18X,
		};
		required
			.iter()
			.filter(|name| !self.entries().any(|e| e.name == **name))
			.copied()
			.collect()
	}
}

fn parse_directory(file: &File, blob_len: u64) -> Result<Vec<BupEntry>> {
	let mut header = [0u8; HEADER_LEN];
	file.read_exact_at(&mut header, 0)
		.context("package too short for blob header")?;
	if &header[..16] != BLOB_MAGIC {
		bail!("not a bootloader update package (bad magic)");
	}
	let _version = read_u32(&header, 16);
	let size = read_u32(&header, 20) as u64;
	let header_size = read_u32(&header, 24) as u64;
	let entry_count = read_u32(&header, 28);
	let blob_type = read_u32(&header, 32);

	if blob_type != 0 {
		bail!("blob is not an update payload (type {})", blob_type);
	}
	if size > blob_len {
		bail!("blob header declares {} bytes, file holds {}", size, blob_len);
	}
	if entry_count > MAX_BLOB_ENTRIES {
		bail!("too many entries in update payload ({})", entry_count);
	}
	if header_size < HEADER_LEN as u64 {
		bail!("blob header size too small");
	}

	let mut entries = Vec::with_capacity(entry_count as usize);
	let mut raw = [0u8; ENTRY_LEN];
	for i in 0..entry_count as u64 {
		let pos = header_size + i * ENTRY_LEN as u64;
		file.read_exact_at(&mut raw, pos)
			.context("package too short for entry directory")?;
		let name = fixed_string(&raw[..ENTRY_NAME_LEN]);
		let offset = read_u32(&raw, 40) as u64;
		let length = read_u32(&raw, 44) as usize;
		let version = read_u32(&raw, 48);
		let op_mode = read_u32(&raw, 52);
		let spec = fixed_string(&raw[56..56 + ENTRY_SPEC_LEN]);
		if name.is_empty() {
			bail!("entry {} has an empty partition name", i);
		}
		if offset + length as u64 > size {
			bail!("entry {} payload extends past end of blob", name);
		}
		entries.push(BupEntry {
			name,
			offset,
			length,
			version,
			op_mode,
			spec,
		});
	}
	Ok(entries)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
	u32::from_le_bytes([
		buf[offset],
		buf[offset + 1],
		buf[offset + 2],
		buf[offset + 3],
	])
}

fn fixed_string(raw: &[u8]) -> String {
	let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
	String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn read_machine_spec(path: &Path) -> (String, Option<String>) {
	match fs::read_to_string(path) {
		Ok(content) => {
			let mut lines = content.lines().map(str::trim);
			let tnspec = lines.next().unwrap_or("").to_string();
			let compat = lines.next().filter(|l| !l.is_empty()).map(String::from);
			(tnspec, compat)
		}
		Err(e) => {
			debug!("No machine TNSPEC at '{}': {}", path.display(), e);
			(String::new(), None)
		}
	}
}

/// The system's (boot device, GPT device) node pair.
pub fn default_devices() -> (PathBuf, PathBuf) {
	let mtd = PathBuf::from("/dev/mtdblock0");
	if mtd.exists() {
		// SPI platforms have a single device holding both the boot
		// partitions and the partition table.
		(mtd.clone(), mtd)
	} else {
		(
			PathBuf::from("/dev/mmcblk0boot0"),
			PathBuf::from("/dev/mmcblk0boot1"),
		)
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	fn open_blob(
		dir: &tempfile::TempDir,
		entries: &[(&str, &[u8], &str)],
		tnspec: &str,
	) -> Result<BupContext> {
		let path = testblob::write_to(dir.path(), entries);
		BupContext::open_with(
			&path,
			tnspec.to_string(),
			None,
			PathBuf::from("/dev/mmcblk0boot0"),
			PathBuf::from("/dev/mmcblk0boot1"),
		)
	}

	#[test]
	fn test_parse_and_read() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let bup = open_blob(
			&dir,
			&[("BCT", b"bct-data", ""), ("mb1", b"mb1-data", "")],
			"",
		)?;
		let entries: Vec<&BupEntry> = bup.entries().collect();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].name, "BCT");
		assert_eq!(entries[0].length, 8);

		let mut buf = vec![0u8; entries[1].length];
		bup.read_exact_at(entries[1].offset, &mut buf)?;
		assert_eq!(&buf, b"mb1-data");
		Ok(())
	}

	#[test]
	fn test_spec_filtering() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let bup = open_blob(
			&dir,
			&[
				("BCT", b"bct-jetson", "jetson-xavier-mmc"),
				("BCT", b"bct-other", "other-board-spi"),
				("mb1", b"mb1-any", ""),
			],
			"jetson-xavier-mmc",
		)?;
		let names: Vec<&str> = bup.entries().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec!["BCT", "mb1"]);
		Ok(())
	}

	#[test]
	fn test_bad_magic_rejected() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let mut blob = testblob::build(&[("BCT", b"x", "")]);
		blob[0] = b'X';
		let path = dir.path().join("bad.bup");
		fs::write(&path, blob)?;
		assert!(BupContext::open_with(
			&path,
			String::new(),
			None,
			PathBuf::from("/dev/null"),
			PathBuf::from("/dev/null"),
		)
		.is_err());
		Ok(())
	}

	#[test]
	fn test_truncated_payload_rejected() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let blob = testblob::build(&[("BCT", b"payload", "")]);
		let path = dir.path().join("short.bup");
		fs::write(&path, &blob[..blob.len() - 3])?;
		assert!(BupContext::open_with(
			&path,
			String::new(),
			None,
			PathBuf::from("/dev/null"),
			PathBuf::from("/dev/null"),
		)
		.is_err());
		Ok(())
	}

	#[test]
	fn test_find_missing() -> Result<()> {
		let dir = tempfile::tempdir()?;
		let bup = open_blob(&dir, &[("BCT", b"x", ""), ("mb1", b"y", "")], "")?;
		assert_eq!(bup.find_missing(SocFamily::T186), vec!["mb2"]);

		let bup = open_blob(
			&dir,
			&[
				("BCT", b"a", ""),
				("PT", b"b", ""),
				("TBC", b"c", ""),
				("RP1", b"d", ""),
				("EBT", b"e", ""),
				("WB0", b"f", ""),
				("BPF", b"g", ""),
				("DTB", b"h", ""),
				("TOS", b"i", ""),
				("LNX", b"j", ""),
				("NVC", b"k", ""),
				("VER", b"l", ""),
			],
			"",
		)?;
		assert!(bup.find_missing(SocFamily::T210).is_empty());
		Ok(())
	}

	#[test]
	fn test_optional_partitions() {
		assert!(!should_be_present("EKS"));
		assert!(!should_be_present("EKS-1"));
		assert!(!should_be_present("BMP"));
		assert!(should_be_present("cboot"));
		assert!(should_be_present("kernel"));
	}
}
