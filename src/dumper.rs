//! The dump driver.
//!
//! Picks the directories a [`DumpConfig`] asks for and runs their decoders
//! over one image:
//! 1. Parse the headers (the only step that can fail the whole dump)
//! 2. Expand the section selection (`all` means every directory)
//! 3. Decode each directory independently into a [`Report`]
//!
//! A decoder that fails leaves its error in its slot of the report; the
//! remaining directories are still decoded.

use clap::ValueEnum;
use tracing::{debug, warn};

use crate::clr::{self, ClrHeader};
use crate::debug::{self as debug_dir, DebugEntry};
use crate::error::Result;
use crate::export::{self, ExportDirectory};
use crate::image::PeImage;
use crate::import::{self, DelayImportDirectory, ImportDirectory};
use crate::loadcfg::{self, LoadConfig};
use crate::reloc::{self, RelocationBlock};
use crate::resource::{self, ResourceTree};
use crate::tls::{self, TlsDirectory};
use crate::unwind::{self, ExceptionDirectory};

/// A `-j` selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum DumpSection {
    Header,
    Import,
    Export,
    Debug,
    Resource,
    Tls,
    Loadcfg,
    Clr,
    Reloc,
    Except,
    All,
}

impl DumpSection {
    /// Directory selections in the order they are dumped.
    pub const DIRECTORIES: [DumpSection; 9] = [
        Self::Import,
        Self::Export,
        Self::Debug,
        Self::Resource,
        Self::Tls,
        Self::Loadcfg,
        Self::Clr,
        Self::Reloc,
        Self::Except,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Import => "import",
            Self::Export => "export",
            Self::Debug => "debug",
            Self::Resource => "resource",
            Self::Tls => "tls",
            Self::Loadcfg => "loadcfg",
            Self::Clr => "clr",
            Self::Reloc => "reloc",
            Self::Except => "except",
            Self::All => "all",
        }
    }
}

/// Progress information reported once per decoded directory.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    pub section: DumpSection,
    /// 1-based index of this directory in the selection.
    pub current: usize,
    pub total: usize,
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for a dump.
pub struct DumpConfig {
    /// Directories to decode. Empty means headers only.
    pub sections: Vec<DumpSection>,
    /// Print the headers and the section table in addition to `sections`.
    pub show_headers: bool,
    /// Maximum x86-64 chain links followed per function. Defaults to the
    /// number of entries in the function table.
    pub max_unwind_chain: Option<usize>,
    /// Maximum number of opaque resource bytes hex-dumped per leaf.
    pub resource_preview: usize,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for DumpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpConfig")
            .field("sections", &self.sections)
            .field("show_headers", &self.show_headers)
            .field("max_unwind_chain", &self.max_unwind_chain)
            .field("resource_preview", &self.resource_preview)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            sections: Vec::new(),
            show_headers: false,
            max_unwind_chain: None,
            resource_preview: 256,
            progress_callback: None,
        }
    }
}

impl DumpConfig {
    /// Config that dumps every directory.
    pub fn all() -> Self {
        Self {
            sections: vec![DumpSection::All],
            ..Default::default()
        }
    }

    /// The selected directories, deduplicated and in dump order.
    pub fn directories(&self) -> Vec<DumpSection> {
        let all = self.sections.contains(&DumpSection::All);
        DumpSection::DIRECTORIES
            .into_iter()
            .filter(|s| all || self.sections.contains(s))
            .collect()
    }

    pub fn header_view(&self) -> HeaderView {
        if self.show_headers || self.sections.contains(&DumpSection::Header) {
            HeaderView::Full
        } else if self.sections.is_empty() {
            HeaderView::Summary
        } else {
            HeaderView::None
        }
    }
}

/// How much of the headers a dump shows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderView {
    None,
    /// File and optional headers.
    Summary,
    /// Headers plus the section table.
    Full,
}

/// Outcome of one directory decoder: `Ok(None)` when the image has no such
/// directory.
pub type Decoded<T> = Result<Option<T>>;

#[derive(Debug)]
pub enum DirectoryReport<'a> {
    Import(Decoded<ImportDirectory>),
    DelayImport(Decoded<DelayImportDirectory>),
    Export(Decoded<ExportDirectory>),
    Debug(Decoded<Vec<DebugEntry>>),
    Resource(Decoded<ResourceTree<'a>>),
    Tls(Decoded<TlsDirectory>),
    LoadConfig(Decoded<LoadConfig>),
    Clr(Decoded<ClrHeader>),
    Reloc(Decoded<Vec<RelocationBlock>>),
    Exception(Decoded<ExceptionDirectory>),
}

impl DirectoryReport<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Import(_) => "import",
            Self::DelayImport(_) => "delay import",
            Self::Export(_) => "export",
            Self::Debug(_) => "debug",
            Self::Resource(_) => "resource",
            Self::Tls(_) => "tls",
            Self::LoadConfig(_) => "loadcfg",
            Self::Clr(_) => "clr",
            Self::Reloc(_) => "reloc",
            Self::Exception(_) => "except",
        }
    }

    pub fn is_err(&self) -> bool {
        match self {
            Self::Import(r) => r.is_err(),
            Self::DelayImport(r) => r.is_err(),
            Self::Export(r) => r.is_err(),
            Self::Debug(r) => r.is_err(),
            Self::Resource(r) => r.is_err(),
            Self::Tls(r) => r.is_err(),
            Self::LoadConfig(r) => r.is_err(),
            Self::Clr(r) => r.is_err(),
            Self::Reloc(r) => r.is_err(),
            Self::Exception(r) => r.is_err(),
        }
    }
}

/// Everything one dump decoded, in output order.
#[derive(Debug)]
pub struct Report<'a> {
    pub headers: HeaderView,
    pub directories: Vec<DirectoryReport<'a>>,
}

/// Runs the directory decoders over one image.
pub struct Dumper<'a> {
    image: PeImage<'a>,
}

impl<'a> Dumper<'a> {
    /// Parse the headers of `data`. Fails only on a broken header.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let image = PeImage::parse(data)?;
        debug!(
            machine = image.headers().file.machine,
            sections = image.headers().sections.len(),
            is_64bit = image.is_64bit(),
            "parsed image headers"
        );
        Ok(Self { image })
    }

    pub fn image(&self) -> &PeImage<'a> {
        &self.image
    }

    /// Decode one directory selection. `import` yields both the import and
    /// the delay-import tables; `header` and `all` yield nothing here.
    pub fn decode(&self, section: DumpSection, config: &DumpConfig) -> Vec<DirectoryReport<'a>> {
        let image = &self.image;
        match section {
            DumpSection::Import => vec![
                DirectoryReport::Import(import::decode(image)),
                DirectoryReport::DelayImport(import::decode_delay(image)),
            ],
            DumpSection::Export => vec![DirectoryReport::Export(export::decode(image))],
            DumpSection::Debug => vec![DirectoryReport::Debug(debug_dir::decode(image))],
            DumpSection::Resource => vec![DirectoryReport::Resource(resource::decode(image))],
            DumpSection::Tls => vec![DirectoryReport::Tls(tls::decode(image))],
            DumpSection::Loadcfg => vec![DirectoryReport::LoadConfig(loadcfg::decode(image))],
            DumpSection::Clr => vec![DirectoryReport::Clr(clr::decode(image))],
            DumpSection::Reloc => vec![DirectoryReport::Reloc(reloc::decode(image))],
            DumpSection::Except => vec![DirectoryReport::Exception(unwind::decode(
                image,
                config.max_unwind_chain,
            ))],
            DumpSection::Header | DumpSection::All => Vec::new(),
        }
    }

    /// Decode everything `config` selects.
    pub fn run(&self, config: &DumpConfig) -> Report<'a> {
        let selected = config.directories();
        let total = selected.len();
        let mut directories = Vec::new();

        for (i, section) in selected.into_iter().enumerate() {
            if let Some(callback) = &config.progress_callback {
                callback(&ProgressInfo {
                    section,
                    current: i + 1,
                    total,
                });
            }
            for report in self.decode(section, config) {
                if report.is_err() {
                    warn!(directory = report.name(), "directory could not be decoded");
                }
                directories.push(report);
            }
        }

        debug!(directories = directories.len(), "dump complete");
        Report {
            headers: config.header_view(),
            directories,
        }
    }
}
