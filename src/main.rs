//! peinspect CLI - PE/COFF structure dumper.
//!
//! Loads an image from disk and prints the requested headers and data
//! directories in winedump's layout.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use peinspect::{render, DumpConfig, DumpSection, Dumper, PeImage, ProgressInfo};

/// Dump the structure of a PE/COFF image.
#[derive(Parser)]
#[command(name = "peinspect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump headers and data directories
    Dump {
        /// Image to dump
        file: PathBuf,

        /// Directory to dump (repeatable); headers only when omitted
        #[arg(short = 'j', long = "section", value_enum)]
        sections: Vec<DumpSection>,

        /// Also print the headers and section table
        #[arg(short = 'f', long)]
        full: bool,

        /// Maximum x86-64 unwind chain links followed per function
        #[arg(long)]
        max_unwind_chain: Option<usize>,

        /// Maximum bytes hex-dumped per opaque resource
        #[arg(long, default_value = "256")]
        resource_preview: usize,
    },

    /// List the section table with sizes
    Sections {
        /// Image to inspect
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dump {
            file,
            sections,
            full,
            max_unwind_chain,
            resource_preview,
        } => {
            let config = DumpConfig {
                sections,
                show_headers: full,
                max_unwind_chain,
                resource_preview,
                progress_callback: Some(Box::new(|info: &ProgressInfo| {
                    tracing::info!(
                        "decoding {} ({}/{})",
                        info.section.name(),
                        info.current,
                        info.total
                    );
                })),
            };
            dump(&file, &config)?;
        }

        Commands::Sections { file } => {
            list_sections(&file)?;
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn dump(path: &Path, config: &DumpConfig) -> anyhow::Result<()> {
    let data = load(path)?;
    let dumper = Dumper::new(&data).with_context(|| format!("{} is not a PE image", path.display()))?;
    let report = dumper.run(config);

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    writeln!(out, "Contents of {}: {} bytes\n", path.display(), data.len())?;
    render::write_report(&mut out, dumper.image(), &report, config)?;
    out.flush()?;
    Ok(())
}

fn list_sections(path: &Path) -> anyhow::Result<()> {
    let data = load(path)?;
    let image = PeImage::parse(&data).with_context(|| format!("{} is not a PE image", path.display()))?;
    let sections = &image.headers().sections;

    println!("Sections ({}):", sections.len());
    println!("{:<10} {:<10} {:>12} {:>12}  Flags", "Name", "VirtAddr", "VirtSize", "RawSize");
    for section in sections {
        let flags: Vec<&str> = section.flags().iter_names().map(|(name, _)| name).collect();
        println!(
            "{:<10} 0x{:08X} {:>12} {:>12}  {}",
            section.name,
            section.virtual_address,
            ByteSize::b(section.virtual_size as u64).to_string(),
            ByteSize::b(section.size_of_raw_data as u64).to_string(),
            flags.join(" ")
        );
    }

    Ok(())
}
