mod bct;
mod blockdev;
mod bup;
mod cli;
mod gpt;
mod plan;
mod smd;
mod soc;
mod update;
mod ver;

use anyhow::{bail, Result};
use clap::Parser;
use log::{debug, error};

use cli::Cmdline;
use update::RepartitionCheck;

fn main() {
	let cmdline = Cmdline::parse();
	let mut logger = colog::basic_builder();
	if cmdline.debug {
		logger.filter(None, log::LevelFilter::Debug);
	} else {
		logger.filter(None, log::LevelFilter::Info);
	}
	logger.init();
	if cmdline.debug {
		debug!("Debug output enabled.");
	}

	if cmdline.needs_repartition {
		// Probe mode answers through the exit status: 0 means the layout
		// differs and repartitioning is needed, 1 means it matches (or
		// there is no GPT to compare), 2 means the comparison failed.
		match update::run_repartition_check(&cmdline) {
			Ok(RepartitionCheck::Needed) => std::process::exit(0),
			Ok(RepartitionCheck::NotNeeded) => std::process::exit(1),
			Err(e) => {
				report_error(&e);
				std::process::exit(2);
			}
		}
	}

	if let Err(e) = try_main(&cmdline) {
		report_error(&e);
		std::process::exit(1);
	}
}

fn try_main(cmdline: &Cmdline) -> Result<()> {
	if !cmdline.dry_run && unsafe { libc::geteuid() } != 0 {
		bail!("Please run me as root!");
	}
	update::run_update(cmdline)
}

// Use the logger to pretty-print the error chain.
fn report_error(e: &anyhow::Error) {
	let mut str_buf = String::new();
	error!("Error encountered!\n{}", e);
	let mut ident = 0;
	e.chain().skip(1).for_each(|cause| {
		let ident_str = "\t".repeat(ident);
		ident += 1;
		str_buf += &format!("{0}- Caused by:\n{0}  {1}", ident_str, cause);
	});
	if !str_buf.is_empty() {
		error!("{}", str_buf);
	}
}
