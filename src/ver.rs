//! Parsing of the VER partition contents.
//!
//! A VER partition holds NUL-terminated text written at flashing time:
//! a signature line, the BSP revision line, then `KEY=value` lines:
//!
//! ```text
//! NV3
//! # R32 , REVISION: 5.1
//! BOARDID=3448 BOARDSKU=0000 FAB=300
//! ```
//!
//! Only the packed BSP version and a checksum over the text region are of
//! interest here; two VER partitions disagreeing on either encodes a prior
//! update failure.

use anyhow::{bail, Context, Result};
use flate2::Crc;

/// Version information extracted from a VER payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VerInfo {
	/// BSP version packed as `major << 16 | minor << 8 | maint`.
	pub bsp_version: u32,
	/// CRC32 over the text region of the partition.
	pub crc: u32,
}

impl VerInfo {
	/// An all-zero version marks a blank or corrupted VER partition.
	pub fn is_valid(&self) -> bool {
		self.bsp_version != 0
	}
}

pub fn pack_version(major: u32, minor: u32, maint: u32) -> u32 {
	(major << 16) | (minor << 8) | maint
}

pub fn version_major(version: u32) -> u32 {
	version >> 16
}

pub fn version_minor(version: u32) -> u32 {
	(version >> 8) & 0xff
}

pub fn version_maint(version: u32) -> u32 {
	version & 0xff
}

/// `major.minor.maint` rendering for messages.
pub fn format_version(version: u32) -> String {
	format!(
		"{}.{}.{}",
		version_major(version),
		version_minor(version),
		version_maint(version)
	)
}

/// Parse the contents of a VER partition or BUP VER payload.
pub fn extract_info(data: &[u8]) -> Result<VerInfo> {
	let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
	let text = std::str::from_utf8(&data[..end]).context("version info is not text")?;

	let mut lines = text.lines();
	match lines.next() {
		Some("NV3") => (),
		_ => bail!("bad version info signature"),
	}
	let revline = lines
		.find(|l| l.starts_with("# R"))
		.context("version info has no revision line")?;
	let bsp_version =
		parse_revision_line(revline).context(format!("malformed revision line: {}", revline))?;

	let mut crc = Crc::new();
	crc.update(&data[..end]);
	Ok(VerInfo {
		bsp_version,
		crc: crc.sum(),
	})
}

/// Parse `# R<major> , REVISION: <minor>.<maint>`.
fn parse_revision_line(line: &str) -> Option<u32> {
	let rest = line.strip_prefix("# R")?;
	let major: String = rest.chars().take_while(char::is_ascii_digit).collect();
	let major: u32 = major.parse().ok()?;
	let rev = rest.split("REVISION:").nth(1)?.trim();
	let rev = rev.split_whitespace().next()?;
	let mut parts = rev.split('.');
	let minor: u32 = parts.next()?.parse().ok()?;
	let maint: u32 = match parts.next() {
		Some(m) => m.parse().ok()?,
		None => 0,
	};
	Some(pack_version(major, minor, maint))
}
