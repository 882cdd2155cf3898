use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use orcrebuild_core::{RebuildConfig, RebuildError, Rebuilder, SevenZipReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orcrebuild", version, about = "Rebuild the original file-system layout from a DFIR-Orc collection archive")]
struct Cli {
	/// Enable debug logging (RUST_LOG overrides)
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Args, Debug)]
struct RunOptions {
	/// Configuration file (TOML)
	#[arg(short = 'c', long = "conf")]
	conf: Option<PathBuf>,
	/// Password for a sub-archive, as NAME=SECRET (NAME "." is the archive itself)
	#[arg(long = "password", value_name = "NAME=SECRET")]
	passwords: Vec<String>,
	/// Keep raw volume identifiers as root directory names
	#[arg(long)]
	keep_volume_ids: bool,
	/// Do not open nested sub-archives
	#[arg(long)]
	no_nested: bool,
	/// Deepest sub-archive nesting to open
	#[arg(long)]
	max_depth: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Extract every collected file into its original location below DEST
	Rebuild {
		/// Collection archive (.7z)
		archive: PathBuf,
		/// Destination root, ideally empty
		dest: PathBuf,
		#[command(flatten)]
		options: RunOptions,
		/// Write the JSON run summary to this file
		#[arg(long)]
		summary: Option<PathBuf>,
	},
	/// Show how volume identifiers map to root directories
	Volumes {
		archive: PathBuf,
		#[command(flatten)]
		options: RunOptions,
	},
	/// Dry run: show where every file would go, writing nothing
	Plan {
		archive: PathBuf,
		dest: PathBuf,
		#[command(flatten)]
		options: RunOptions,
		/// Print the plan as JSON
		#[arg(long)]
		json: bool,
	},
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	init_logging(cli.verbose)?;

	match cli.command {
		Commands::Rebuild { archive, dest, options, summary } => rebuild(&archive, &dest, &options, summary.as_deref()),
		Commands::Volumes { archive, options } => volumes(&archive, &options),
		Commands::Plan { archive, dest, options, json } => plan(&archive, &dest, &options, json),
	}
}

fn init_logging(verbose: bool) -> Result<()> {
	let core = if verbose { "orcrebuild_core=debug" } else { "orcrebuild_core=warn" };
	let cli = if verbose { "orcrebuild=debug" } else { "orcrebuild=info" };
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(core.parse()?).add_directive(cli.parse()?))
		.with_writer(std::io::stderr)
		.init();
	Ok(())
}

fn load_config(options: &RunOptions) -> Result<RebuildConfig> {
	let mut config = match &options.conf {
		Some(path) => RebuildConfig::from_file(path).with_context(|| format!("loading configuration {}", path.display()))?,
		None => RebuildConfig::default(),
	};

	for pair in &options.passwords {
		let Some((name, secret)) = pair.split_once('=') else {
			bail!("--password expects NAME=SECRET, got `{}`", pair);
		};
		config = config.with_password(name.trim(), secret);
	}
	if options.keep_volume_ids {
		config.rename_volumes = false;
	}
	if options.no_nested {
		config.nested.enabled = false;
	}
	if let Some(depth) = options.max_depth {
		config.nested.max_depth = depth;
	}

	config.validate()?;
	tracing::debug!(
		"rename_volumes={} nested={} max_depth={} extra_manifests={}",
		config.rename_volumes,
		config.nested.enabled,
		config.nested.max_depth,
		config.manifests.len()
	);
	Ok(config)
}

fn open_rebuilder(archive: &Path, options: &RunOptions) -> Result<Rebuilder<SevenZipReader>> {
	let config = load_config(options)?;
	let reader = SevenZipReader::open(archive).with_context(|| format!("opening {}", archive.display()))?;
	Ok(Rebuilder::new(reader, config))
}

fn rebuild(archive: &Path, dest: &Path, options: &RunOptions, summary: Option<&Path>) -> Result<()> {
	println!("🔍 Rebuilding {} into {}", archive.display(), dest.display());
	let mut rebuilder = open_rebuilder(archive, options)?;

	let spinner = ProgressBar::new_spinner();
	spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
	spinner.enable_steady_tick(Duration::from_millis(100));
	let bar = spinner.clone();
	rebuilder.set_progress_callback(move |progress| {
		bar.set_message(format!(
			"{} {} item(s), {} written, {} not extracted",
			progress.current_operation, progress.items_processed, progress.files_written, progress.failures
		));
	});

	let result = rebuilder.run(dest);
	spinner.finish_and_clear();

	let report = match result {
		Ok(report) => report,
		Err(RebuildError::NoManifest { audit_file }) => {
			eprintln!("❌ No readable manifest found in {}", archive.display());
			eprintln!("📄 Problems encountered: {}", audit_file.display());
			bail!("nothing to rebuild");
		}
		Err(e) => return Err(e).context("rebuild failed"),
	};

	println!("✅ Rebuild completed");
	println!("📊 Run ID: {}", report.run_id);
	println!("💽 Volumes: {}", report.volumes.len());
	println!("📄 Manifests: {} read, {} unusable", report.catalog.manifests_parsed, report.catalog.manifests_failed);
	println!("📦 Containers: {} opened, {} failed", report.catalog.containers_opened, report.catalog.containers_failed);
	println!("📁 Files written: {} ({} bytes)", report.extraction.files_written, report.extraction.bytes_written);
	if report.extraction.disambiguated > 0 {
		println!("🔀 Renamed on collision: {}", report.extraction.disambiguated);
	}
	if report.extraction.reports_copied > 0 {
		println!("📋 Reports copied: {}", report.extraction.reports_copied);
	}
	println!("⚠️  Not extracted: {}", report.audit.total_records);
	for (reason, count) in &report.audit.by_reason {
		println!("   {:<28} {}", reason.as_str(), count);
	}
	println!("📝 Audit file: {}", report.audit_file.display());

	if let Some(path) = summary {
		let json = report.to_json()?;
		std::fs::write(path, json).with_context(|| format!("writing summary {}", path.display()))?;
		println!("💾 Summary: {}", path.display());
	}
	Ok(())
}

fn volumes(archive: &Path, options: &RunOptions) -> Result<()> {
	let mut rebuilder = open_rebuilder(archive, options)?;
	let map = rebuilder.resolve_volumes()?;

	if map.is_empty() {
		println!("❌ No volume mapping available, identifiers are used verbatim");
		return Ok(());
	}

	println!("💽 {} volume(s):", map.len());
	for (identifier, label) in map.iter() {
		println!("   {:<48} -> {}", identifier, label);
	}
	Ok(())
}

fn plan(archive: &Path, dest: &Path, options: &RunOptions, json: bool) -> Result<()> {
	let mut rebuilder = open_rebuilder(archive, options)?;
	let planned = rebuilder.plan(dest)?;

	if json {
		println!("{}", serde_json::to_string_pretty(&planned)?);
		return Ok(());
	}

	let mut skipped = 0usize;
	for item in &planned {
		match (&item.destination, item.reason) {
			(Some(destination), _) => println!("✅ {} -> {}", item.source, destination.display()),
			(None, Some(reason)) => {
				skipped += 1;
				println!("❌ [{}] {} ({})", reason, item.original_path, item.detail);
			}
			(None, None) => {}
		}
	}
	println!();
	println!("📈 {} placed, {} not extractable", planned.len() - skipped, skipped);
	Ok(())
}
