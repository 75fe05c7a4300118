//! Low-level access to the boot block devices.
//!
//! The boot medium may appear as two independent block devices: the "boot
//! device" (`mmcblk0boot0` or `mtdblock0`) and, on eMMC platforms, a second
//! "GPT device" (`mmcblk0boot1`) whose address space is logically
//! concatenated after the first in GPT LBA order.
//!
//! There is no filesystem on these devices, so erasure is explicit: a write
//! may be preceded by zeroing the full erase region, with a durability
//! barrier between the erase and the payload write.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;

/// An open boot block device.
///
/// Dropping the handle flushes it and restores the write-protect status
/// that was toggled at open time, so cleanup happens on every exit path.
pub struct BlockDev {
	file: File,
	path: PathBuf,
	size: u64,
	reset_readonly: bool,
}

impl BlockDev {
	/// Open a block device, optionally for writing. Opening for write
	/// clears the kernel's `force_ro` protection on eMMC boot devices;
	/// the previous state is restored when the handle is dropped.
	pub fn open(path: &Path, writeable: bool) -> Result<Self> {
		let mut reset_readonly = false;
		if writeable {
			reset_readonly = set_writeable_status(path, true)
				.context(format!("Unable to write-enable '{}'", path.display()))?;
		}
		let file = OpenOptions::new()
			.read(true)
			.write(writeable)
			.open(path)
			.context(format!("Unable to open device '{}'", path.display()))?;
		// Block device nodes report zero length through metadata.
		let mut size = file.metadata().map(|m| m.len()).unwrap_or(0);
		if size == 0 {
			size = device_size(&file)
				.context(format!("Unable to size device '{}'", path.display()))?;
		}
		Ok(Self {
			file,
			path: path.to_path_buf(),
			size,
			reset_readonly,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	pub fn as_file(&self) -> &File {
		&self.file
	}

	/// Read exactly `buf.len()` bytes at `offset`, looping over short
	/// reads. Fails on a true error or EOF before the buffer is full.
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		self.file
			.read_exact_at(buf, offset)
			.context(format!("Error reading '{}'", self.path.display()))
	}

	/// Write `buf` at `offset`. If `erase` is non-empty, the erase region
	/// is zeroed and flushed first so that no stale data survives past the
	/// payload. The write is flushed before returning.
	pub fn write_at(&self, buf: &[u8], offset: u64, erase: &[u8]) -> Result<()> {
		if !erase.is_empty() {
			self.file
				.write_all_at(erase, offset)
				.context(format!("Error erasing '{}'", self.path.display()))?;
			self.flush()?;
		}
		self.file
			.write_all_at(buf, offset)
			.context(format!("Error writing '{}'", self.path.display()))?;
		self.flush()
	}

	pub fn flush(&self) -> Result<()> {
		self.file
			.sync_all()
			.context(format!("Error flushing '{}'", self.path.display()))
	}
}

impl Drop for BlockDev {
	fn drop(&mut self) {
		// Final durability barrier; the fd closes right after.
		let _ = self.file.sync_all();
		if self.reset_readonly {
			if let Err(e) = set_writeable_status(&self.path, false) {
				debug!(
					"Unable to restore write protection on '{}': {}",
					self.path.display(),
					e
				);
			}
		}
	}
}

/// The boot device plus the optional GPT device that continues its
/// address space.
pub struct BootDevicePair {
	pub boot: BlockDev,
	pub gpt: Option<BlockDev>,
}

impl BootDevicePair {
	/// Resolve an absolute GPT byte offset to a device handle and the
	/// offset within that device. Offsets past the end of the boot device
	/// fall into the GPT device; if none exists that is a fatal
	/// configuration error.
	pub fn locate(&self, offset: u64, partname: &str) -> Result<(&BlockDev, u64)> {
		if offset < self.boot.size() {
			return Ok((&self.boot, offset));
		}
		match &self.gpt {
			Some(dev) => Ok((dev, offset - self.boot.size())),
			None => bail!(
				"Partition {} starts past end of boot device",
				partname
			),
		}
	}

	/// Flush both devices.
	pub fn flush(&self) -> Result<()> {
		self.boot.flush()?;
		if let Some(dev) = &self.gpt {
			dev.flush()?;
		}
		Ok(())
	}
}

/// Toggle the kernel write protection of an eMMC boot device through its
/// `force_ro` sysfs attribute. Returns whether the status was changed (and
/// therefore must be restored later). Devices without the attribute are
/// left alone.
pub fn set_writeable_status(path: &Path, writeable: bool) -> Result<bool> {
	let Some(name) = path.file_name() else {
		return Ok(false);
	};
	if !path.to_string_lossy().starts_with("/dev/mmcblk") {
		return Ok(false);
	}
	let force_ro = PathBuf::from("/sys/block")
		.join(name)
		.join("force_ro");
	if !force_ro.exists() {
		return Ok(false);
	}
	let current = fs::read_to_string(&force_ro)
		.context(format!("Unable to read '{}'", force_ro.display()))?;
	let is_readonly = current.trim() != "0";
	if is_readonly != writeable {
		// Already in the requested state.
		return Ok(false);
	}
	fs::write(&force_ro, if writeable { "0" } else { "1" })
		.context(format!("Unable to write '{}'", force_ro.display()))?;
	debug!(
		"{} is now {}",
		path.display(),
		if writeable { "writeable" } else { "write-protected" }
	);
	Ok(true)
}

/// Regular files report their size through metadata; block device nodes
/// need a seek to the end.
fn device_size(file: &File) -> Result<u64> {
	use std::io::{Seek, SeekFrom};
	let mut f = file;
	let size = f.seek(SeekFrom::End(0))?;
	f.seek(SeekFrom::Start(0))?;
	Ok(size)
}

/// Size of a device node without holding it open.
pub fn query_device_size(path: &Path) -> Result<u64> {
	let file = File::open(path)
		.context(format!("Unable to open device '{}'", path.display()))?;
	let size = file.metadata()?.len();
	if size > 0 {
		return Ok(size);
	}
	device_size(&file)
}
