//! The update orchestrator.
//!
//! Given an open BUP and the live boot device(s), decides which partitions
//! must be written, in what order and with what redundancy, runs the
//! version gate, carries the writes out, and commits the new slot. The
//! whole run is single-threaded and blocking: the correctness argument for
//! a crashed update rests entirely on the write order.

use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use flate2::Crc;
use log::{debug, error, warn};
use owo_colors::OwoColorize;

use crate::bct::{self, BctPhase};
use crate::blockdev::{BlockDev, BootDevicePair};
use crate::bup::{self, BupContext};
use crate::cli::Cmdline;
use crate::gpt::{GptContext, PartitionDesc, LAYOUT_CONFIG_PATH};
use crate::plan::{self, Buffers, Plan, PlanRequest, Target, UpdateEntry, PARTLABEL_DIR};
use crate::smd::{self, RedundancyLevel, SlotMetadata};
use crate::soc::{BootMedium, Slot, SocFamily};
use crate::ver::{self, VerInfo};

/// Answer of the repartition probe.
pub enum RepartitionCheck {
	Needed,
	NotNeeded,
}

/// Compare the boot device's current GPT layout against the expected
/// layout without writing anything. Only meaningful on T186/T194.
pub fn run_repartition_check(cmdline: &Cmdline) -> Result<RepartitionCheck> {
	let soc = SocFamily::detect()?;
	if soc == SocFamily::T210 {
		// No boot device GPT on t210; a full erasure is never required.
		return Ok(RepartitionCheck::NotNeeded);
	}
	let gpt_device = match &cmdline.bup_package {
		Some(path) => BupContext::open(path)?.gpt_device_path().to_path_buf(),
		None => bup::default_devices().1,
	};
	let gpt = match GptContext::load(&gpt_device) {
		Ok(gpt) => gpt,
		Err(e) => {
			debug!("no usable partition table: {:#}", e);
			return Ok(RepartitionCheck::Needed);
		}
	};
	let matches = gpt
		.layout_matches(Path::new(LAYOUT_CONFIG_PATH))
		.context("could not compare existing boot partition layout with configuration")?;
	if matches {
		Ok(RepartitionCheck::NotNeeded)
	} else {
		Ok(RepartitionCheck::Needed)
	}
}

/// Run a full update or initialization from the command line request.
pub fn run_update(cmdline: &Cmdline) -> Result<()> {
	let soc = SocFamily::detect()?;
	let dryrun = cmdline.dry_run;
	let slot_specified = cmdline.slot_suffix.is_some();
	let mut initialize = cmdline.initialize;
	let mut force_initialize = false;
	let mut curslot = None;
	let mut target_slot = cmdline.slot_suffix.unwrap_or(Slot::A);

	match soc {
		SocFamily::T186 | SocFamily::T194 => {
			if !slot_specified && !initialize {
				let cur = smd::booted_slot()?;
				curslot = Some(cur);
				target_slot = Slot::from_index(cur).other();
			}
		}
		SocFamily::T210 => {
			if slot_specified {
				bail!("unsupported operation for t210 platform");
			}
			// On t210 the operation is always an initialization; an
			// explicit --initialize forces it past the version checks.
			force_initialize = initialize;
			initialize = true;
		}
	}

	let bup_path = cmdline
		.bup_package
		.as_ref()
		.context("missing required argument")?;
	let bup = BupContext::open(bup_path)?;
	let medium = BootMedium::from_boot_device(bup.boot_device_path())?;
	debug!("{} platform booting from {}", soc, medium);

	let devs = BootDevicePair {
		boot: BlockDev::open(bup.boot_device_path(), !dryrun)?,
		gpt: if medium.has_gpt_device() {
			Some(BlockDev::open(bup.gpt_device_path(), !dryrun)?)
		} else {
			None
		},
	};

	let layout_config = Path::new(LAYOUT_CONFIG_PATH);
	let gpt = if initialize {
		GptContext::load_from_config(layout_config)?
	} else {
		GptContext::load(bup.gpt_device_path())?
	};
	debug!("boot partition table holds {} partitions", gpt.partitions().len());

	if initialize && !dryrun && soc.is_slotted() {
		let target = devs.gpt.as_ref().unwrap_or(&devs.boot);
		gpt.save(target.as_file())?;
	}

	let mut smdctx = if !soc.is_slotted() {
		None
	} else if initialize {
		Some(SlotMetadata::new(RedundancyLevel::Full))
	} else {
		Some(SlotMetadata::load(&gpt, &devs)?)
	};

	if let Some(smdctx) = smdctx.as_mut() {
		if !slot_specified && smdctx.redundancy_level() != RedundancyLevel::Full {
			if dryrun {
				println!("[skip] enable redundancy in slot metadata");
			} else {
				smdctx.set_redundancy_level(RedundancyLevel::Full);
			}
		}
	}

	let missing = bup.find_missing(soc);
	if !missing.is_empty() {
		bail!(
			"missing entries for partition{}: {}\n       for TNSPEC {}",
			if missing.len() == 1 { "" } else { "s" },
			missing.join(", "),
			bup.tnspec()
		);
	}

	println!("Native TNSPEC:   {}", bup.tnspec());
	if let Some(compat) = bup.compat_spec() {
		println!("Compatible with: {}", compat);
	}

	let request = PlanRequest {
		soc,
		medium,
		initialize,
		target_slot,
		partlabel_dir: Path::new(PARTLABEL_DIR),
	};
	let mut plan = Plan::build(&request, &bup, &gpt)?;
	if soc == SocFamily::T210 {
		plan.merge_nonredundant();
	}

	let bufs = Buffers::allocate(&plan)?;
	let mut exec = Executor {
		soc,
		medium,
		dryrun,
		initialize,
		force_initialize,
		bup: &bup,
		devs: &devs,
		bufs,
		bct_updated: false,
	};

	let mut phase = BctPhase::WriteLast;
	if soc == SocFamily::T210 {
		exec.version_gate(&plan.redundant)?;
		for ent in plan::order_t210(&plan.redundant, medium)? {
			exec.process_entry(ent, &mut phase)?;
		}
	} else {
		for ent in plan::order_t18x(&plan.redundant) {
			exec.process_entry(ent, &mut phase)?;
		}
		if initialize {
			for ent in &plan.nonredundant {
				exec.process_entry(ent, &mut phase)?;
			}
		} else if exec.bct_updated {
			// mb1 is tightly versioned against the BCT: once the BCT has
			// been rewritten, the non-selected slot's mb1 must follow.
			let companion = plan
				.mb1_companion
				.as_ref()
				.context("could not update alternate mb1 partition")?;
			exec.process_entry(companion, &mut phase)?;
		}
		if !slot_specified {
			commit(&gpt, &devs, smdctx.as_mut(), initialize, curslot, dryrun)?;
		}
	}

	if !dryrun {
		devs.flush()?;
	}
	Ok(())
}

/// Flip the active slot in the slot metadata and persist it. Skipped
/// entirely when the caller requested a specific slot.
fn commit(
	gpt: &GptContext,
	devs: &BootDevicePair,
	smdctx: Option<&mut SlotMetadata>,
	initialize: bool,
	curslot: Option<u32>,
	dryrun: bool,
) -> Result<()> {
	let newslot = if initialize {
		Slot::A
	} else {
		Slot::from_index(curslot.context("current boot slot unknown")?).other()
	};
	if dryrun {
		println!("[skip] mark slot {} as active", newslot.index());
		return Ok(());
	}
	let smdctx = smdctx.context("slot metadata not loaded")?;
	smdctx.mark_active(newslot);
	println!("Slot {} marked as active for next boot", newslot.index());
	if let Err(e) = smdctx.update(gpt, devs, initialize) {
		// The partitions themselves are already updated; a failed
		// metadata write leaves the previous slot active.
		error!("updating slot metadata: {:#}", e);
	}
	Ok(())
}

struct Executor<'r> {
	soc: SocFamily,
	medium: BootMedium,
	dryrun: bool,
	initialize: bool,
	force_initialize: bool,
	bup: &'r BupContext,
	devs: &'r BootDevicePair,
	bufs: Buffers,
	bct_updated: bool,
}

impl Executor<'_> {
	/// Fetch an entry's payload and write it to its target (unless this
	/// is a dry run).
	fn process_entry(&mut self, ent: &UpdateEntry, phase: &mut BctPhase) -> Result<()> {
		print!("  Processing {}... ", ent.partname);
		let _ = std::io::stdout().flush();
		if ent.length > self.bufs.content.len() {
			return Err(step_failed(anyhow!(
				"content buffer too small for {}",
				ent.partname
			)));
		}
		self.bup
			.read_exact_at(ent.bup_offset, &mut self.bufs.content[..ent.length])
			.context(format!("could not read content for {}", ent.partname))
			.map_err(step_failed)?;

		if self.dryrun {
			println!("[OK] (dry run)");
			return Ok(());
		}
		match &ent.target {
			Target::Boot(part) => self.update_boot_partition(ent, part, phase),
			Target::Node(path) => self.write_device_node(ent, path),
		}
	}

	/// Write an in-boot-device partition, comparing against the current
	/// contents first. The BCT is delegated to its family-specific
	/// protocol.
	fn update_boot_partition(
		&mut self,
		ent: &UpdateEntry,
		part: &PartitionDesc,
		phase: &mut BctPhase,
	) -> Result<()> {
		let part_size = part.size_bytes() as usize;
		if ent.length > part_size {
			return Err(step_failed(anyhow!(
				"BUP contents too large for boot partition"
			)));
		}
		let (dev, offset) = self
			.devs
			.locate(part.start_offset(), &ent.partname)
			.map_err(step_failed)?;
		dev.read_at(&mut self.bufs.slot[..part_size], offset)
			.map_err(step_failed)?;

		if ent.partname == "BCT" {
			let current = if self.initialize {
				None
			} else {
				Some(&self.bufs.slot[..part_size])
			};
			let new = &self.bufs.content[..ent.length];
			let result = if self.soc == SocFamily::T210 {
				bct::update_t210(
					dev,
					offset,
					part.size_bytes(),
					current,
					new,
					&self.bufs.zero,
					phase,
					self.soc,
					self.medium,
				)
			} else {
				bct::update_t18x(
					dev,
					offset,
					part_size,
					current,
					new,
					&self.bufs.zero,
					self.soc,
					self.medium,
				)
			};
			result.map_err(step_failed)?;
			self.bct_updated = true;
			return Ok(());
		}

		if self.bufs.content[..ent.length] == self.bufs.slot[..ent.length] {
			println!("[no update needed]");
			return Ok(());
		}
		dev.write_at(
			&self.bufs.content[..ent.length],
			offset,
			&self.bufs.zero[..part_size],
		)
		.map_err(step_failed)?;
		println!("{}", "[OK]".green());
		Ok(())
	}

	/// Write an externally named device node, erasing the whole device
	/// first.
	fn write_device_node(&mut self, ent: &UpdateEntry, path: &Path) -> Result<()> {
		let dev = BlockDev::open(path, true).map_err(step_failed)?;
		debug!(
			"writing {} bytes to '{}'",
			ent.length,
			dev.path().display()
		);
		let erase = dev.size() as usize;
		if erase > self.bufs.zero.len() {
			return Err(step_failed(anyhow!(
				"device {} larger than erase buffer",
				path.display()
			)));
		}
		dev.write_at(&self.bufs.content[..ent.length], 0, &self.bufs.zero[..erase])
			.map_err(step_failed)?;
		println!("{}", "[OK]".green());
		Ok(())
	}

	/// The T210 version gate: decide from the paired VER partitions and
	/// the payload's version whether this update may be applied at all.
	/// Payloads without a VER entry do not touch the boot chain and pass
	/// unconditionally.
	fn version_gate(&mut self, entries: &[UpdateEntry]) -> Result<()> {
		let ver_b_name = self.soc.redundant_name("VER", self.medium);
		let nvc_b_name = self.soc.redundant_name("NVC", self.medium);
		let find = |name: &str| entries.iter().find(|e| e.partname == name);
		let ver = [find("VER"), find(&ver_b_name)];
		let nvc = [find("NVC"), find(&nvc_b_name)];

		let Some(ver0) = ver[0] else {
			return Ok(());
		};

		self.bup
			.read_exact_at(ver0.bup_offset, &mut self.bufs.content[..ver0.length])
			.context("could not find version info in BUP payload")?;
		let bup_info = ver::extract_info(&self.bufs.content[..ver0.length])
			.context("validating version info in BUP payload")?;

		let mut info = [VerInfo::default(); 2];
		for (i, ent) in ver.iter().enumerate() {
			let Some(ent) = ent else {
				continue;
			};
			let Target::Boot(part) = &ent.target else {
				bail!("Error locating {} partition", ent.partname);
			};
			let part_size = part.size_bytes() as usize;
			let (dev, offset) = self.devs.locate(part.start_offset(), &ent.partname)?;
			dev.read_at(&mut self.bufs.slot[..part_size], offset)
				.context(format!("Error reading {} partition", ent.partname))?;
			// A parse failure leaves the copy marked invalid; one valid
			// copy can still be enough.
			if let Ok(parsed) = ver::extract_info(&self.bufs.slot[..part_size]) {
				info[i] = parsed;
			}
		}

		let agree = info[0].bsp_version == info[1].bsp_version && info[0].is_valid();
		let nvc_match = if agree && info[0].crc == info[1].crc {
			self.nvc_parts_match(nvc[0], nvc[1])
		} else {
			false
		};

		match gate_verdict(&info[0], &info[1], &bup_info, nvc_match, self.force_initialize) {
			Verdict::Allow => Ok(()),
			Verdict::AllowWithWarning(msg) => {
				warn!("{}", msg);
				Ok(())
			}
			Verdict::Reject(msg) => bail!("{}", msg),
		}
	}

	/// Whether the NVC partition and its backup hold identical contents.
	/// Any missing partition or read failure counts as a mismatch.
	fn nvc_parts_match(
		&mut self,
		nvc0: Option<&UpdateEntry>,
		nvc1: Option<&UpdateEntry>,
	) -> bool {
		let (Some(nvc0), Some(nvc1)) = (nvc0, nvc1) else {
			return false;
		};
		let mut crcs = [0u32; 2];
		for (i, ent) in [nvc0, nvc1].iter().enumerate() {
			let Target::Boot(part) = &ent.target else {
				return false;
			};
			let part_size = part.size_bytes() as usize;
			if part_size > self.bufs.slot.len() {
				return false;
			}
			let Ok((dev, offset)) = self.devs.locate(part.start_offset(), &ent.partname)
			else {
				return false;
			};
			if dev.read_at(&mut self.bufs.slot[..part_size], offset).is_err() {
				return false;
			}
			let mut crc = Crc::new();
			crc.update(&self.bufs.slot[..part_size]);
			crcs[i] = crc.sum();
		}
		crcs[0] == crcs[1]
	}
}

enum Verdict {
	Allow,
	AllowWithWarning(String),
	Reject(String),
}

/// The version gate decision table. `cur` and `other` are the two VER
/// partitions (invalid copies are zeroed), `bup` the payload's version.
fn gate_verdict(
	cur: &VerInfo,
	other: &VerInfo,
	bup: &VerInfo,
	nvc_match: bool,
	force: bool,
) -> Verdict {
	// Both copies valid and in agreement: the previous update completed.
	if cur.bsp_version == other.bsp_version && cur.is_valid() {
		if cur.bsp_version > bup.bsp_version {
			return Verdict::Reject(format!(
				"current bootloader version is {}; cannot roll back to {}",
				ver::format_version(cur.bsp_version),
				ver::format_version(bup.bsp_version)
			));
		}
		// Matching VER checksums promise matching NVC copies; a mismatch
		// means the last update tore partway through.
		if cur.crc == other.crc && !nvc_match {
			return Verdict::Reject("NVC partition mismatch - reflash required".to_string());
		}
		return Verdict::Allow;
	}
	// Backup invalid but primary valid: only a downgrade is suspect.
	if !other.is_valid() && cur.is_valid() && cur.bsp_version > bup.bsp_version {
		if force {
			return Verdict::AllowWithWarning(format!(
				"downgrading bootloader from {} to {}",
				ver::format_version(cur.bsp_version),
				ver::format_version(bup.bsp_version)
			));
		}
		return Verdict::Reject(format!(
			"current bootloader version is {}; cannot downgrade to {}",
			ver::format_version(cur.bsp_version),
			ver::format_version(bup.bsp_version)
		));
	}
	// Backup valid but disagreeing: an interrupted update must resume
	// with the version it started with.
	if other.is_valid() && other.bsp_version != bup.bsp_version {
		return Verdict::Reject(format!(
			"previous update was incomplete; please update with version {}",
			ver::format_version(other.bsp_version)
		));
	}
	if force {
		return Verdict::AllowWithWarning(
			"bootloader version partitions were corrupted".to_string(),
		);
	}
	Verdict::Reject("bootloader version partitions are corrupted; cannot apply update".to_string())
}

fn step_failed(e: anyhow::Error) -> anyhow::Error {
	println!("{}", "[FAIL]".red());
	e
}
