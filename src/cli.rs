//! Module defining the command line usage.
//!
//! ```shell
//! tegra-boot-update [OPTIONS] <bup-package-path>
//! ```
//!
//! The package path may only be omitted with `--needs-repartition`, which
//! answers through the exit status and performs no writes.

use std::path::PathBuf;

use clap::Parser;

use crate::soc::Slot;

/// Update or initialize Tegra boot partitions from a bootloader update
/// package (BUP).
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cmdline {
	/// Initialize the entire set of boot partitions.
	#[arg(short = 'i', long, conflicts_with = "slot_suffix")]
	pub initialize: bool,

	/// Update only the redundant boot partitions with the specified
	/// suffix (with no slot metadata update). Must be _a or _b.
	#[arg(short = 's', long, value_name = "SUFFIX", value_parser = parse_slot_suffix)]
	pub slot_suffix: Option<Slot>,

	/// Do not perform any writes, just show what would be written.
	#[arg(short = 'n', long)]
	pub dry_run: bool,

	/// Check if the boot device needs repartitioning (T186/T194 only).
	#[arg(short = 'N', long)]
	pub needs_repartition: bool,

	/// Turns on debug output.
	#[arg(long)]
	pub debug: bool,

	/// Pathname of the bootloader update package.
	#[arg(
		value_name = "bup-package-path",
		required_unless_present = "needs_repartition"
	)]
	pub bup_package: Option<PathBuf>,
}

fn parse_slot_suffix(s: &str) -> Result<Slot, String> {
	s.parse()
}
