//! Update plan construction and ordering.
//!
//! The plan is built by walking the BUP entry directory and classifying
//! each entry: redundant entries (those with an A/B partner partition, or
//! the internally-redundant BCT) are always executed; non-redundant
//! entries only when initializing. The execution order is what makes a
//! crashed update recoverable, so ordering is a first-class step with a
//! policy per SoC family.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::blockdev::query_device_size;
use crate::bup::{self, BupContext};
use crate::gpt::{GptContext, PartitionDesc};
use crate::soc::{BootMedium, Slot, SocFamily};

/// Per-label device node namespace for partitions outside the boot device.
pub const PARTLABEL_DIR: &str = "/dev/disk/by-partlabel";

const MAX_PLAN_ENTRIES: usize = 64;

/// Partition update order for T210 eMMC platforms. Only eMMC-based T210
/// platforms have redundant copies of most boot partitions. The three
/// `BCT` occurrences are the three phases of the multi-copy BCT protocol,
/// all pointing back at the same payload entry.
const T210_EMMC_ORDER: &[&str] = &[
	"VER_b", "BCT", "NVC-1",
	"PT-1", "TBC-1", "RP1-1", "EBT-1", "WB0-1", "BPF-1", "DTB-1", "TOS-1", "EKS-1", "LNX-1",
	"BCT",
	"BCT",
	"PT", "TBC", "RP1", "EBT", "WB0", "BPF", "DTB", "TOS", "EKS", "LNX",
	"NVC", "VER",
];

/// Partition update order for T210 SPI/SD platforms, which name the
/// backup NVC differently and keep no backups of the other partitions.
const T210_SPI_SD_ORDER: &[&str] = &[
	"VER_b", "BCT", "NVC_R",
	"BCT",
	"BCT",
	"PT", "TBC", "RP1", "EBT", "WB0", "BPF", "DTB", "TOS", "EKS", "LNX",
	"NVC", "VER",
];

/// Where an update entry's bytes go.
pub enum Target<'a> {
	/// A partition inside the boot device (or its GPT-device tail).
	Boot(&'a PartitionDesc),
	/// An externally named block device node.
	Node(PathBuf),
}

/// One unit of work: a payload region of the BUP and the place it is
/// written to.
pub struct UpdateEntry<'a> {
	pub partname: String,
	pub target: Target<'a>,
	pub bup_offset: u64,
	pub length: usize,
}

/// The classified update tasks, before ordering.
pub struct Plan<'a> {
	pub redundant: Vec<UpdateEntry<'a>>,
	pub nonredundant: Vec<UpdateEntry<'a>>,
	/// The copy of mb1 belonging to the non-selected slot, recorded while
	/// building an update-mode plan. mb1 is tightly versioned against the
	/// BCT, so a BCT update forces this entry as a follow-up write.
	pub mb1_companion: Option<UpdateEntry<'a>>,
	largest_payload: usize,
}

pub struct PlanRequest<'r> {
	pub soc: SocFamily,
	pub medium: BootMedium,
	pub initialize: bool,
	/// Slot whose copies are written in update mode; ignored when
	/// initializing.
	pub target_slot: Slot,
	pub partlabel_dir: &'r Path,
}

/// Buffers shared by all steps of the plan: `content` holds the payload
/// of the current entry, `slot` the current on-disk contents of its
/// target, `zero` stays zeroed for pre-erase.
pub struct Buffers {
	pub content: Vec<u8>,
	pub slot: Vec<u8>,
	pub zero: Vec<u8>,
}

impl<'a> Plan<'a> {
	/// Classify every applicable BUP entry into the plan.
	pub fn build(
		req: &PlanRequest,
		bup: &BupContext,
		gpt: &'a GptContext,
	) -> Result<Plan<'a>> {
		let mut plan = Plan {
			redundant: Vec::new(),
			nonredundant: Vec::new(),
			mb1_companion: None,
			largest_payload: 0,
		};

		for entry in bup.entries() {
			plan.largest_payload = plan.largest_payload.max(entry.length);
			let name_b = req.soc.redundant_name(&entry.name, req.medium);
			let make = |partname: String, target: Target<'a>| UpdateEntry {
				partname,
				target,
				bup_offset: entry.offset,
				length: entry.length,
			};

			if let Some(part) = gpt.find_by_name(&entry.name) {
				// Partition is located in the boot device.
				let part_b = gpt.find_by_name(&name_b);
				if req.initialize {
					if part_b.is_some() || entry.name == "BCT" {
						plan.redundant
							.push(make(entry.name.clone(), Target::Boot(part)));
						if let Some(part_b) = part_b {
							plan.redundant
								.push(make(name_b.clone(), Target::Boot(part_b)));
						}
					} else {
						plan.nonredundant
							.push(make(entry.name.clone(), Target::Boot(part)));
					}
				} else if part_b.is_some() || entry.name == "BCT" {
					let (selname, selpart) = match part_b {
						Some(pb) if req.target_slot == Slot::B => (name_b.clone(), pb),
						_ => (entry.name.clone(), part),
					};
					if entry.name == "mb1" {
						plan.mb1_companion = match req.target_slot {
							Slot::B => Some(make(entry.name.clone(), Target::Boot(part))),
							Slot::A => part_b
								.map(|pb| make(name_b.clone(), Target::Boot(pb))),
						};
					}
					plan.redundant.push(make(selname, Target::Boot(selpart)));
				}
			} else {
				// Normal partition, not in the boot device.
				let node = req.partlabel_dir.join(&entry.name);
				if !node.exists() {
					if bup::should_be_present(&entry.name) {
						bail!("cannot locate partition: {}", entry.name);
					}
					debug!("skipping optional partition {}", entry.name);
					continue;
				}
				let node_b = req.partlabel_dir.join(&name_b);
				let redundant = node_b.exists();
				if req.initialize {
					if redundant {
						plan.redundant
							.push(make(entry.name.clone(), Target::Node(node)));
						plan.redundant
							.push(make(name_b.clone(), Target::Node(node_b)));
					} else {
						plan.nonredundant
							.push(make(entry.name.clone(), Target::Node(node)));
					}
				} else if redundant {
					let ent = match req.target_slot {
						Slot::B => make(name_b.clone(), Target::Node(node_b)),
						Slot::A => make(entry.name.clone(), Target::Node(node)),
					};
					plan.redundant.push(ent);
				}
			}
		}

		if plan.redundant.len() + plan.nonredundant.len() > MAX_PLAN_ENTRIES {
			bail!(
				"too many partitions to {}",
				if req.initialize { "initialize" } else { "update" }
			);
		}
		Ok(plan)
	}

	/// On T210 everything is written, so the non-redundant tasks fold
	/// into the redundant list before ordering.
	pub fn merge_nonredundant(&mut self) {
		self.redundant.append(&mut self.nonredundant);
	}

	pub fn largest_payload(&self) -> usize {
		self.largest_payload
	}

	/// Size of the largest write target across both task lists, rounded
	/// up to a whole sector.
	pub fn largest_target_size(&self) -> Result<u64> {
		let mut largest = 0u64;
		for ent in self.redundant.iter().chain(self.nonredundant.iter()) {
			let size = match &ent.target {
				Target::Boot(part) => part.size_bytes(),
				Target::Node(path) => query_device_size(path)
					.context(format!("Error sizing partition {}", ent.partname))?,
			};
			largest = largest.max(size);
		}
		Ok(512 * largest.div_ceil(512))
	}
}

impl Buffers {
	pub fn allocate(plan: &Plan) -> Result<Self> {
		let target_size = plan
			.largest_target_size()
			.context("Error obtaining partition sizes")? as usize;
		Ok(Self {
			content: vec![0u8; plan.largest_payload()],
			slot: vec![0u8; target_size],
			zero: vec![0u8; target_size],
		})
	}
}

/// T186/T194 ordering: everything else first, then mb2 and its partner,
/// then the BCT, then mb1 and its partner. mb1 is the primary boot stage
/// and must come last so that a crash between earlier writes leaves the
/// previous boot chain intact; mb2 must precede the BCT because the BCT
/// references it.
pub fn order_t18x<'p, 'g>(entries: &'p [UpdateEntry<'g>]) -> Vec<&'p UpdateEntry<'g>> {
	let mut ordered = Vec::with_capacity(entries.len());
	let mut mb1 = None;
	let mut mb1_b = None;
	let mut mb2 = None;
	let mut mb2_b = None;
	// The BCT may legitimately appear more than once (distinct writes
	// from the same source entry).
	let mut bcts = Vec::new();

	for ent in entries {
		match ent.partname.as_str() {
			"mb1" => mb1 = Some(ent),
			"mb1_b" => mb1_b = Some(ent),
			"mb2" => mb2 = Some(ent),
			"mb2_b" => mb2_b = Some(ent),
			"BCT" => bcts.push(ent),
			_ => ordered.push(ent),
		}
	}
	ordered.extend(mb2);
	ordered.extend(mb2_b);
	ordered.extend(bcts);
	ordered.extend(mb1);
	ordered.extend(mb1_b);
	ordered
}

/// T210 ordering: walk the fixed per-medium template, looking each name
/// up in the plan. Missing `EKS` entries are optional; any other missing
/// template name is fatal. Entries the template does not know are
/// appended in input order. The ordered list is longer than the input
/// because the template names `BCT` three times.
pub fn order_t210<'p, 'g>(
	entries: &'p [UpdateEntry<'g>],
	medium: BootMedium,
) -> Result<Vec<&'p UpdateEntry<'g>>> {
	let template = match medium {
		BootMedium::Emmc => T210_EMMC_ORDER,
		BootMedium::SpiFlash => T210_SPI_SD_ORDER,
	};
	let mut used = vec![false; entries.len()];
	let mut ordered = Vec::with_capacity(template.len());
	for name in template {
		match entries.iter().position(|e| e.partname == *name) {
			Some(idx) => {
				ordered.push(&entries[idx]);
				used[idx] = true;
			}
			None if name.starts_with("EKS") => continue,
			None => bail!("payload or partition not found for {}", name),
		}
	}
	for (idx, ent) in entries.iter().enumerate() {
		if !used[idx] {
			ordered.push(ent);
		}
	}
	Ok(ordered)
}
