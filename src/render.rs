//! Text rendering of decoded records.
//!
//! The layout follows winedump's, so dumps can be compared line by line
//! with existing tooling. Everything writes to an arbitrary [`Write`].

use std::io::{self, Write};

use crate::clr::ClrHeader;
use crate::debug::{self, DebugEntry, DEBUG_MISC_EXENAME};
use crate::dumper::{Decoded, DirectoryReport, DumpConfig, HeaderView, Report};
use crate::error::Error;
use crate::export::{ExportDirectory, ExportTarget};
use crate::image::PeImage;
use crate::import::{DelayImportDirectory, ImportDirectory, Thunk, ThunkKind};
use crate::loadcfg::LoadConfig;
use crate::pe::{machine_name, subsystem_name, DirectoryIndex, Headers, SectionHeader, WineDll};
use crate::reloc::RelocationBlock;
use crate::resource::{self, ResourceContent, ResourceId, ResourceTree};
use crate::tls::TlsDirectory;
use crate::unwind::arm64::{Arm64Function, Arm64Unwind};
use crate::unwind::armnt::{ArmntFunction, ArmntUnwind};
use crate::unwind::x86_64::{ChainStop, UnwindFlags, UnwindStep, X64Function};
use crate::unwind::{CodeLine, ExceptionDirectory, Functions};

/// Render a whole report.
pub fn write_report<W: Write>(
    out: &mut W,
    image: &PeImage<'_>,
    report: &Report<'_>,
    config: &DumpConfig,
) -> io::Result<()> {
    let headers = image.headers();
    write_wine_dll(out, headers)?;
    match report.headers {
        HeaderView::None => {}
        HeaderView::Summary => write_headers(out, headers)?,
        HeaderView::Full => {
            write_headers(out, headers)?;
            write_sections(out, &headers.sections)?;
        }
    }

    for directory in &report.directories {
        match directory {
            DirectoryReport::Import(r) => with_decoded(out, r, write_imports)?,
            DirectoryReport::DelayImport(r) => with_decoded(out, r, write_delay_imports)?,
            DirectoryReport::Export(r) => with_decoded(out, r, write_exports)?,
            DirectoryReport::Debug(r) => with_decoded(out, r, |o, e| write_debug(o, e))?,
            DirectoryReport::Resource(r) => {
                with_decoded(out, r, |o, t| write_resources(o, t, config.resource_preview))?
            }
            DirectoryReport::Tls(r) => with_decoded(out, r, write_tls)?,
            DirectoryReport::LoadConfig(r) => {
                with_decoded(out, r, |o, c| write_load_config(o, c, image.is_64bit()))?
            }
            DirectoryReport::Clr(r) => with_decoded(out, r, write_clr)?,
            DirectoryReport::Reloc(r) => with_decoded(out, r, |o, b| write_relocations(o, b))?,
            DirectoryReport::Exception(r) => with_decoded(out, r, write_exceptions)?,
        }
    }
    Ok(())
}

fn with_decoded<W: Write, T>(
    out: &mut W,
    decoded: &Decoded<T>,
    write: impl FnOnce(&mut W, &T) -> io::Result<()>,
) -> io::Result<()> {
    match decoded {
        Ok(Some(value)) => write(out, value),
        Ok(None) => Ok(()),
        Err(e) => writeln!(out, "{}\n", capitalize(&e.to_string())),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn word<W: Write>(out: &mut W, title: &str, value: u16) -> io::Result<()> {
    writeln!(out, "  {title:<34} 0x{value:<4X}         {value}")
}

fn dword<W: Write>(out: &mut W, title: &str, value: u32) -> io::Result<()> {
    writeln!(out, "  {title:<34} 0x{value:<8x}     {value}")
}

fn longlong<W: Write>(out: &mut W, title: &str, value: u64) -> io::Result<()> {
    writeln!(out, "  {title:<34} 0x{value:x}")
}

fn version<W: Write>(out: &mut W, title: &str, major: u16, minor: u16) -> io::Result<()> {
    writeln!(out, "  {title:<34} {major}.{minor:02}")
}

/// Pointer-sized header field: 32-bit images print as a dword.
fn pointer<W: Write>(out: &mut W, title: &str, value: u64, is_64bit: bool) -> io::Result<()> {
    if is_64bit {
        longlong(out, title, value)
    } else {
        dword(out, title, value as u32)
    }
}

fn write_wine_dll<W: Write>(out: &mut W, headers: &Headers) -> io::Result<()> {
    match headers.wine_dll {
        Some(WineDll::Builtin) => writeln!(out, "*** This is a Wine builtin DLL ***\n"),
        Some(WineDll::Placeholder) => writeln!(out, "*** This is a Wine placeholder DLL ***\n"),
        None => Ok(()),
    }
}

pub fn write_headers<W: Write>(out: &mut W, headers: &Headers) -> io::Result<()> {
    let file = &headers.file;
    writeln!(out, "File Header")?;
    writeln!(out, "  Machine:                      {:04X} ({})", file.machine, machine_name(file.machine))?;
    writeln!(out, "  Number of Sections:           {}", file.number_of_sections)?;
    writeln!(
        out,
        "  TimeDateStamp:                {:08X} offset {}",
        file.time_date_stamp,
        headers.pe_offset + 8
    )?;
    writeln!(out, "  PointerToSymbolTable:         {:08X}", file.pointer_to_symbol_table)?;
    writeln!(out, "  NumberOfSymbols:              {:08X}", file.number_of_symbols)?;
    writeln!(out, "  SizeOfOptionalHeader:         {:04X}", file.size_of_optional_header)?;
    writeln!(out, "  Characteristics:              {:04X}", file.characteristics.bits())?;
    for (name, _) in file.characteristics.iter_names() {
        let name = match name {
            "MACHINE_16BIT" => "16BIT_MACHINE",
            "MACHINE_32BIT" => "32BIT_MACHINE",
            other => other,
        };
        writeln!(out, "    {name}")?;
    }
    writeln!(out)?;

    let oh = &headers.optional;
    let wide = oh.is_64bit();
    writeln!(out, "Optional Header ({})", oh.magic_name())?;
    if !matches!(oh.magic_name(), "32bit" | "64bit") {
        writeln!(out, "  Unknown optional header magic: 0x{:<4X}", oh.magic)?;
        return Ok(());
    }
    word(out, "Magic", oh.magic)?;
    version(out, "linker version", oh.major_linker_version as u16, oh.minor_linker_version as u16)?;
    dword(out, "size of code", oh.size_of_code)?;
    dword(out, "size of initialized data", oh.size_of_initialized_data)?;
    dword(out, "size of uninitialized data", oh.size_of_uninitialized_data)?;
    dword(out, "entrypoint RVA", oh.address_of_entry_point)?;
    dword(out, "base of code", oh.base_of_code)?;
    if !wide {
        dword(out, "base of data", oh.base_of_data)?;
    }
    pointer(out, "image base", oh.image_base, wide)?;
    dword(out, "section align", oh.section_alignment)?;
    dword(out, "file align", oh.file_alignment)?;
    version(
        out,
        "required OS version",
        oh.major_operating_system_version,
        oh.minor_operating_system_version,
    )?;
    version(out, "image version", oh.major_image_version, oh.minor_image_version)?;
    version(out, "subsystem version", oh.major_subsystem_version, oh.minor_subsystem_version)?;
    dword(out, "Win32 Version", oh.win32_version_value)?;
    dword(out, "size of image", oh.size_of_image)?;
    dword(out, "size of headers", oh.size_of_headers)?;
    dword(out, "checksum", oh.check_sum)?;
    writeln!(
        out,
        "  {:<34} 0x{:X} ({})",
        "Subsystem",
        oh.subsystem,
        subsystem_name(oh.subsystem)
    )?;
    writeln!(out, "  {:<34} 0x{:X}", "DLL characteristics:", oh.dll_characteristics.bits())?;
    for (name, _) in oh.dll_characteristics.iter_names() {
        writeln!(out, "    {name}")?;
    }
    pointer(out, "stack reserve size", oh.size_of_stack_reserve, wide)?;
    pointer(out, "stack commit size", oh.size_of_stack_commit, wide)?;
    pointer(out, "heap reserve size", oh.size_of_heap_reserve, wide)?;
    pointer(out, "heap commit size", oh.size_of_heap_commit, wide)?;
    dword(out, "loader flags", oh.loader_flags)?;
    dword(out, "RVAs & sizes", oh.number_of_rva_and_sizes)?;
    writeln!(out)?;

    writeln!(out, "Data Directory")?;
    for (index, dir) in DirectoryIndex::ALL.iter().zip(&oh.data_directories) {
        writeln!(
            out,
            "  {:<12} rva: 0x{:<8x}  size: 0x{:<8x}",
            index.name(),
            dir.virtual_address,
            dir.size
        )?;
    }
    writeln!(out)
}

pub fn write_sections<W: Write>(out: &mut W, sections: &[SectionHeader]) -> io::Result<()> {
    writeln!(out, "Section Table")?;
    for section in sections {
        write_section(out, section)?;
    }
    Ok(())
}

fn write_section<W: Write>(out: &mut W, s: &SectionHeader) -> io::Result<()> {
    let raw = crate::bytes::cstr(&s.raw_name);
    if raw.starts_with('/') && raw != s.name {
        write!(out, "  {raw} ({})", s.name)?;
    } else {
        write!(out, "  {raw:<8}")?;
    }
    writeln!(out, "   VirtSize: 0x{:08x}  VirtAddr:  0x{:08x}", s.virtual_size, s.virtual_address)?;
    writeln!(
        out,
        "    raw data offs:   0x{:08x}  raw data size: 0x{:08x}",
        s.pointer_to_raw_data, s.size_of_raw_data
    )?;
    writeln!(
        out,
        "    relocation offs: 0x{:08x}  relocations:   0x{:08x}",
        s.pointer_to_relocations, s.number_of_relocations
    )?;
    writeln!(
        out,
        "    line # offs:     {:<8}  line #'s:      {:<8}",
        s.pointer_to_linenumbers, s.number_of_linenumbers
    )?;
    writeln!(out, "    characteristics: 0x{:08x}", s.characteristics)?;
    write!(out, "    ")?;

    // The alignment nibble sits between the low flags and LNK_NRELOC_OVFL.
    let mut aligned = false;
    let mut alignment = |out: &mut W| -> io::Result<()> {
        if !aligned {
            aligned = true;
            if let Some(bytes) = s.alignment() {
                write!(out, "  ALIGN_{bytes}BYTES")?;
            }
        }
        Ok(())
    };
    for (name, flag) in s.flags().iter_names() {
        if flag.bits() >= 0x0100_0000 {
            alignment(&mut *out)?;
        }
        write!(out, "  {}", name.trim_start_matches("CNT_"))?;
    }
    alignment(&mut *out)?;
    writeln!(out, "\n")
}

/// Escape a string the way winedump prints resource text.
pub fn escape(text: &str) -> String {
    const ESCAPES: &[u8; 32] = b".......abtnvfr.............e....";
    let chars: Vec<char> = text.chars().collect();
    let mut escaped = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        let next = chars.get(i + 1).copied();
        let code = c as u32;
        if code > 127 {
            if next.is_some_and(|n| n.is_ascii_hexdigit()) {
                escaped.push_str(&format!("\\x{code:04x}"));
            } else {
                escaped.push_str(&format!("\\x{code:x}"));
            }
        } else if code < 32 {
            if code == 0 && next.is_none() {
                continue;
            }
            let letter = ESCAPES[code as usize];
            if letter != b'.' {
                escaped.push('\\');
                escaped.push(letter as char);
            } else if next.is_some_and(|n| ('0'..='7').contains(&n)) {
                escaped.push_str(&format!("\\{code:03o}"));
            } else {
                escaped.push_str(&format!("\\{code:o}"));
            }
        } else {
            if c == '\\' {
                escaped.push('\\');
            }
            escaped.push(c);
        }
    }
    escaped
}

/// Hex dump of at most `limit` bytes, 16 per line.
pub fn write_hex<W: Write>(out: &mut W, data: &[u8], prefix: &str, limit: usize) -> io::Result<()> {
    let shown = &data[..data.len().min(limit)];
    for (line, chunk) in shown.chunks(16).enumerate() {
        write!(out, "{prefix}{:08x}: ", line * 16)?;
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => write!(out, "{b:02x} ")?,
                None => write!(out, "   ")?,
            }
        }
        let text: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        writeln!(out, " {text}")?;
    }
    if shown.len() < data.len() {
        writeln!(out, "{prefix}... ({} of {} bytes shown)", shown.len(), data.len())?;
    }
    Ok(())
}

pub fn write_exports<W: Write>(out: &mut W, dir: &ExportDirectory) -> io::Result<()> {
    writeln!(out, "Exports table:\n")?;
    writeln!(out, "  Name:            {}", dir.name.as_deref().unwrap_or("<unknown>"))?;
    writeln!(out, "  Characteristics: {:08x}", dir.characteristics)?;
    writeln!(out, "  TimeDateStamp:   {:08X}", dir.time_date_stamp)?;
    writeln!(out, "  Version:         {}.{:02}", dir.major_version, dir.minor_version)?;
    writeln!(out, "  Ordinal base:    {}", dir.base)?;
    writeln!(out, "  # of functions:  {}", dir.number_of_functions)?;
    writeln!(out, "  # of Names:      {}", dir.number_of_names)?;
    writeln!(out, "Addresses of functions: {:08X}", dir.address_of_functions)?;
    writeln!(out, "Addresses of name ordinals: {:08X}", dir.address_of_name_ordinals)?;
    writeln!(out, "Addresses of names: {:08X}", dir.address_of_names)?;
    writeln!(out)?;
    writeln!(out, "  Entry Pt  Ordn  Name")?;
    for export in &dir.exports {
        write!(out, "  {:08X} {:5} ", export.rva, export.ordinal)?;
        match &export.name {
            Some(name) => write!(out, "{name}")?,
            None => write!(out, "<by ordinal>")?,
        }
        if let ExportTarget::Forwarder(target) = &export.target {
            write!(out, " (-> {})", target.as_deref().unwrap_or("???"))?;
        }
        writeln!(out)?;
    }
    writeln!(out)
}

fn write_thunks<W: Write>(out: &mut W, thunks: Option<&[Thunk]>) -> io::Result<()> {
    writeln!(out, "   Thunk    Ordn  Name")?;
    let Some(thunks) = thunks else {
        return writeln!(out, "Can't grab thunk data, going to next imported DLL");
    };
    for thunk in thunks {
        match &thunk.kind {
            ThunkKind::Ordinal(ordinal) => writeln!(out, "  {:08x}  {ordinal:4}  <by ordinal>", thunk.thunk_rva)?,
            ThunkKind::Named { hint, name } => writeln!(out, "  {:08x}  {hint:4}  {name}", thunk.thunk_rva)?,
            ThunkKind::Unresolved(_) => {
                writeln!(out, "Can't grab import by name info, skipping to next ordinal")?
            }
        }
    }
    writeln!(out)
}

pub fn write_imports<W: Write>(out: &mut W, dir: &ImportDirectory) -> io::Result<()> {
    writeln!(out, "Import Table size: {:08x}", dir.size)?;
    for desc in &dir.descriptors {
        writeln!(
            out,
            "  offset {:08x} {}",
            desc.offset,
            desc.dll_name.as_deref().unwrap_or("<unknown>")
        )?;
        writeln!(out, "  Hint/Name Table: {:08X}", desc.original_first_thunk)?;
        writeln!(out, "  TimeDateStamp:   {:08X}", desc.time_date_stamp)?;
        writeln!(out, "  ForwarderChain:  {:08X}", desc.forwarder_chain)?;
        writeln!(out, "  First thunk RVA: {:08X}", desc.first_thunk)?;
        write_thunks(out, desc.thunks.as_deref())?;
    }
    writeln!(out)
}

pub fn write_delay_imports<W: Write>(out: &mut W, dir: &DelayImportDirectory) -> io::Result<()> {
    writeln!(out, "Delay Import Table size: {:08x}", dir.size)?;
    for desc in &dir.descriptors {
        writeln!(
            out,
            "  grAttrs {:08x} offset {:08x} {}",
            desc.attributes,
            desc.offset,
            desc.dll_name.as_deref().unwrap_or("<unknown>")
        )?;
        writeln!(out, "  Hint/Name Table: {:08x}", desc.import_name_table)?;
        writeln!(out, "  Address Table:   {:08x}", desc.import_address_table)?;
        writeln!(out, "  TimeDateStamp:   {:08X}", desc.time_date_stamp)?;
        write_thunks(out, desc.thunks.as_deref())?;
    }
    writeln!(out)
}

pub fn write_debug<W: Write>(out: &mut W, entries: &[DebugEntry]) -> io::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    writeln!(out, "Debug Table ({} directories)", entries.len())?;
    for (i, entry) in entries.iter().enumerate() {
        writeln!(out, "Directory {:02}", i + 1)?;
        writeln!(out, "  Characteristics:   {:08X}", entry.characteristics)?;
        writeln!(out, "  TimeDateStamp:     {:08X}", entry.time_date_stamp)?;
        writeln!(out, "  Version            {}.{:02}", entry.major_version, entry.minor_version)?;
        writeln!(out, "  Type:              {} ({})", entry.kind, debug::type_name(entry.kind))?;
        writeln!(out, "  SizeOfData:        {}", entry.size_of_data)?;
        writeln!(out, "  AddressOfRawData:  {:08X}", entry.address_of_raw_data)?;
        writeln!(out, "  PointerToRawData:  {:08X}", entry.pointer_to_raw_data)?;
        if entry.kind == debug::DEBUG_TYPE_MISC {
            match &entry.misc {
                Some(misc) => {
                    let kind = if misc.data_type == DEBUG_MISC_EXENAME { "Exe name" } else { "Unknown" };
                    writeln!(out, "    DataType:          {} ({kind})", misc.data_type)?;
                    writeln!(out, "    Length:            {}", misc.length)?;
                    writeln!(out, "    Unicode:           {}", if misc.unicode { "Yes" } else { "No" })?;
                    writeln!(out, "    Data:              {}", misc.data)?;
                }
                None => writeln!(out, "Can't get misc debug information")?,
            }
        }
        writeln!(out)?;
    }
    writeln!(out)
}

fn resource_id(id: &ResourceId) -> String {
    match id {
        ResourceId::Id(id) => format!("{id:04x}"),
        ResourceId::Name(name) => escape(name),
    }
}

pub fn write_resources<W: Write>(out: &mut W, tree: &ResourceTree<'_>, preview: usize) -> io::Result<()> {
    write!(out, "Resources:")?;
    for leaf in &tree.leaves {
        let kind = match &leaf.type_id {
            ResourceId::Id(id) => resource::type_name(*id).map_or_else(|| format!("{id:04x}"), str::to_string),
            name => resource_id(name),
        };
        writeln!(
            out,
            "\n  {kind} Name={} Language={:04x}:",
            resource_id(&leaf.name),
            leaf.language
        )?;
        match &leaf.content {
            ResourceContent::Strings(strings) => {
                for (id, text) in strings {
                    writeln!(out, "    {id:04x} \"{}\"", escape(text))?;
                }
            }
            ResourceContent::Messages(messages) => {
                for message in messages {
                    let wide = if message.unicode { "L" } else { "" };
                    writeln!(out, "    {:08x} {wide}\"{}\"", message.id, escape(&message.text))?;
                }
            }
            ResourceContent::Raw(data) => write_hex(out, data, "    ", preview)?,
            ResourceContent::Unresolved => {
                let err = Error::unresolved("resource data", leaf.data_rva, leaf.size as usize);
                writeln!(out, "    {err}")?;
            }
        }
    }
    for err in &tree.errors {
        write!(out, "\n  *** {err}")?;
    }
    writeln!(out, "\n")
}

pub fn write_tls<W: Write>(out: &mut W, tls: &TlsDirectory) -> io::Result<()> {
    writeln!(out, "Thread Local Storage")?;
    writeln!(
        out,
        "  Raw data        {:08x}-{:08x} (data size {:x} zero fill size {:x})",
        tls.start_address_of_raw_data,
        tls.end_address_of_raw_data,
        tls.raw_data_size(),
        tls.size_of_zero_fill
    )?;
    writeln!(out, "  Index address   {:08x}", tls.address_of_index)?;
    writeln!(out, "  Characteristics {:08x}", tls.characteristics)?;
    write!(out, "  Callbacks       {:08x} -> {{", tls.address_of_callbacks)?;
    for callback in &tls.callbacks {
        write!(out, " {callback:08x}")?;
    }
    writeln!(out, " }}\n")
}

pub fn write_load_config<W: Write>(out: &mut W, cfg: &LoadConfig, is_64bit: bool) -> io::Result<()> {
    writeln!(out, "Loadconfig")?;
    dword(out, "Size", cfg.size)?;
    dword(out, "TimeDateStamp", cfg.time_date_stamp)?;
    word(out, "MajorVersion", cfg.major_version)?;
    word(out, "MinorVersion", cfg.minor_version)?;
    dword(out, "GlobalFlagsClear", cfg.global_flags_clear)?;
    dword(out, "GlobalFlagsSet", cfg.global_flags_set)?;
    dword(out, "CriticalSectionDefaultTimeout", cfg.critical_section_default_timeout)?;
    pointer(out, "DeCommitFreeBlockThreshold", cfg.de_commit_free_block_threshold, is_64bit)?;
    pointer(out, "DeCommitTotalFreeThreshold", cfg.de_commit_total_free_threshold, is_64bit)?;
    pointer(out, "MaximumAllocationSize", cfg.maximum_allocation_size, is_64bit)?;
    pointer(out, "VirtualMemoryThreshold", cfg.virtual_memory_threshold, is_64bit)?;
    dword(out, "ProcessHeapFlags", cfg.process_heap_flags)?;
    pointer(out, "ProcessAffinityMask", cfg.process_affinity_mask, is_64bit)?;
    word(out, "CSDVersion", cfg.csd_version)?;
    word(out, "Reserved", cfg.reserved1)?;
    pointer(out, "SecurityCookie", cfg.security_cookie, is_64bit)?;
    pointer(out, "SEHandlerTable", cfg.se_handler_table, is_64bit)?;
    pointer(out, "SEHandlerCount", cfg.se_handler_count, is_64bit)?;
    writeln!(out)
}

pub fn write_clr<W: Write>(out: &mut W, clr: &ClrHeader) -> io::Result<()> {
    writeln!(out, "CLR Header")?;
    dword(out, "Header Size", clr.cb)?;
    version(
        out,
        "Required runtime version",
        clr.major_runtime_version,
        clr.minor_runtime_version,
    )?;
    writeln!(out, "  {:<34} 0x{:X}", "Flags", clr.flags.bits())?;
    for name in clr.flags.names() {
        writeln!(out, "    {name}")?;
    }
    dword(out, "EntryPointToken", clr.entry_point)?;
    writeln!(out)?;
    writeln!(out, "CLR Data Directory")?;
    for (name, dir) in clr.directories() {
        writeln!(
            out,
            "  {name:<23} rva: 0x{:<8x}  size: 0x{:<8x}",
            dir.virtual_address, dir.size
        )?;
    }
    writeln!(out)
}

pub fn write_relocations<W: Write>(out: &mut W, blocks: &[RelocationBlock]) -> io::Result<()> {
    writeln!(out, "Relocations")?;
    for block in blocks {
        writeln!(out, "  Page {:x}", block.page_rva)?;
        for reloc in &block.entries {
            writeln!(out, "    off {:04x} type {}", reloc.offset, reloc.type_name())?;
        }
    }
    writeln!(out)
}

pub fn write_exceptions<W: Write>(out: &mut W, dir: &ExceptionDirectory) -> io::Result<()> {
    if let Functions::Unsupported = dir.functions {
        return writeln!(
            out,
            "Exception information not supported for {} binaries",
            machine_name(dir.machine)
        );
    }
    writeln!(out, "Exception info ({} functions):", dir.len())?;
    match &dir.functions {
        Functions::X64(functions) => functions.iter().try_for_each(|f| write_x64_function(out, f)),
        Functions::Armnt(functions) => functions.iter().try_for_each(|f| write_armnt_function(out, f)),
        Functions::Arm64(functions) => functions.iter().try_for_each(|f| write_arm64_function(out, f)),
        Functions::Unsupported => Ok(()),
    }
}

fn write_x64_function<W: Write>(out: &mut W, f: &X64Function) -> io::Result<()> {
    writeln!(out, "\nFunction {:08x}-{:08x}:", f.function.begin, f.function.end)?;
    for step in &f.steps {
        match step {
            UnwindStep::Redirect(next) => writeln!(out, "  -> function {:08x}-{:08x}", next.begin, next.end)?,
            UnwindStep::Info(info) => {
                writeln!(out, "  unwind info at {:08x}", info.rva)?;
                if !info.is_known_version() {
                    writeln!(out, "    *** unknown version {}", info.version)?;
                    continue;
                }
                write!(out, "    flags {:x}", info.flags.bits())?;
                for (flag, name) in [
                    (UnwindFlags::EHANDLER, " EHANDLER"),
                    (UnwindFlags::UHANDLER, " UHANDLER"),
                    (UnwindFlags::CHAININFO, " CHAININFO"),
                ] {
                    if info.flags.contains(flag) {
                        write!(out, "{name}")?;
                    }
                }
                writeln!(out, "\n    prolog 0x{:x} bytes", info.prolog_size)?;
                if let Some(reg) = info.frame_register_name() {
                    writeln!(out, "    frame register {reg} offset 0x{:x}(%rsp)", info.frame_offset)?;
                }
                for code in &info.codes {
                    writeln!(out, "      0x{:02x}: {}", code.offset, code.op)?;
                }
                if let Some(parent) = &info.chained {
                    writeln!(out, "    -> function {:08x}-{:08x}", parent.begin, parent.end)?;
                }
                if let Some(handler) = &info.handler {
                    writeln!(out, "    handler {:08x} data at {:08x}", handler.rva, handler.data_rva)?;
                }
            }
        }
    }
    match &f.stop {
        Some(ChainStop::Unresolved(e)) => writeln!(out, "    {}", capitalize(&e.to_string())),
        Some(ChainStop::CapReached(cap)) => writeln!(out, "    *** chain walk stopped after {cap} links"),
        None => Ok(()),
    }
}

fn write_armnt_function<W: Write>(out: &mut W, f: &ArmntFunction) -> io::Result<()> {
    let info = match &f.unwind {
        Err(e) => {
            writeln!(out, "\nFunction {:08x}:", f.start())?;
            return writeln!(out, "    {}", capitalize(&e.to_string()));
        }
        Ok(ArmntUnwind::Packed(p)) => {
            writeln!(out, "\nFunction {:08x}-{:08x}:", f.start(), f.end().unwrap_or(0))?;
            writeln!(out, "    Flag           {:x}", p.flag())?;
            writeln!(out, "    FunctionLength {:x}", p.function_length())?;
            writeln!(out, "    Ret            {:x}", p.ret())?;
            writeln!(out, "    H              {:x}", p.h() as u8)?;
            writeln!(out, "    Reg            {:x}", p.reg())?;
            writeln!(out, "    R              {:x}", p.r() as u8)?;
            writeln!(out, "    L              {:x}", p.l() as u8)?;
            writeln!(out, "    C              {:x}", p.c() as u8)?;
            writeln!(out, "    StackAdjust    {:x}", p.stack_adjust())?;
            for line in p.codes() {
                writeln!(out, "    Unwind Code\t{line}")?;
            }
            return Ok(());
        }
        Ok(ArmntUnwind::Expanded(info)) => info,
    };

    writeln!(out, "\nFunction {:08x}-{:08x}:", f.start(), f.end().unwrap_or(0))?;
    writeln!(out, "  unwind info at {:08x}", info.rva)?;
    writeln!(out, "    Flag           {:x}", f.unwind_data & 3)?;
    writeln!(out, "    FunctionLength {:x}", info.function_length)?;
    writeln!(out, "    Version        {:x}", info.version)?;
    writeln!(out, "    X              {:x}", info.x as u8)?;
    writeln!(out, "    E              {:x}", info.e as u8)?;
    writeln!(out, "    F              {:x}", info.f as u8)?;
    if info.extended {
        writeln!(out, "    Count          0\n    Words          0")?;
        writeln!(out, "    ExtCount       {:x}", info.count)?;
        writeln!(out, "    ExtWords       {:x}", info.words)?;
    } else {
        writeln!(out, "    Count          {:x}", info.count)?;
        writeln!(out, "    Words          {:x}", info.words)?;
    }
    for (i, scope) in info.epilogues.iter().enumerate() {
        writeln!(out, "    Epilogue Scope {i:x}")?;
        writeln!(out, "      Offset       {:x}", scope.offset)?;
        writeln!(out, "      Reserved     {:x}", scope.reserved)?;
        writeln!(out, "      Condition    {:x}", scope.condition)?;
        writeln!(out, "      Index        {:x}", scope.index)?;
    }
    for line in &info.codes {
        match line {
            CodeLine::Epilogue => writeln!(out, "Epilogue:")?,
            CodeLine::EpilogueScope { index, address } => {
                writeln!(out, "Epilogue from Scope {index:x} at {address:08x}:")?
            }
            CodeLine::Code { code, text, .. } => writeln!(out, "    Unwind Code {code:x}\t{text}")?,
        }
    }
    if let Some(handler) = &info.handler {
        writeln!(out, "    handler {:08x} data at {:08x}", handler.rva, handler.data_rva)?;
    }
    Ok(())
}

fn write_arm64_function<W: Write>(out: &mut W, f: &Arm64Function) -> io::Result<()> {
    let info = match &f.unwind {
        Err(e) => {
            writeln!(out, "\nFunction {:08x}:", f.begin)?;
            return writeln!(out, "    {}", capitalize(&e.to_string()));
        }
        Ok(Arm64Unwind::Packed(p)) => {
            writeln!(out, "\nFunction {:08x}-{:08x}:", f.begin, f.end().unwrap_or(0))?;
            writeln!(
                out,
                "    len={:#x} flag={:x} regF={} regI={} H={} CR={} frame={:x}",
                p.function_length(),
                p.flag(),
                p.reg_f(),
                p.reg_i(),
                p.h() as u8,
                p.cr(),
                p.frame_size()
            )?;
            for (pos, line) in p.codes().iter().enumerate() {
                writeln!(out, "    {pos:04x}:  {line}")?;
            }
            return Ok(());
        }
        Ok(Arm64Unwind::Expanded(info)) => info,
    };

    writeln!(out, "\nFunction {:08x}-{:08x}:", f.begin, f.end().unwrap_or(0))?;
    writeln!(
        out,
        "    len={:#x} ver={} X={} E={} epilogs={} codes={}",
        info.function_length,
        info.version,
        info.x as u8,
        info.e as u8,
        info.epilog,
        info.codes * 4
    )?;
    if info.e {
        writeln!(out, "    epilog 0: code={:04x}", info.epilog)?;
    }
    for (i, scope) in info.epilogs.iter().enumerate() {
        writeln!(
            out,
            "    epilog {i}: pc={:08x} code={:04x}",
            f.begin.wrapping_add(scope.offset * 4),
            scope.index
        )?;
    }
    if let Some(handler) = &info.handler {
        writeln!(out, "    handler: {:08x} data {:08x}", handler.rva, handler.data_rva)?;
    }
    for code in &info.code {
        write!(out, "    {:04x}: ", code.offset)?;
        for i in 0..4 {
            match code.bytes.get(i) {
                Some(b) => write!(out, "{b:02x} ")?,
                None => write!(out, "   ")?,
            }
        }
        writeln!(out, "{}", code.op)?;
    }
    if info.truncated {
        writeln!(out, "    *** truncated code")?;
    }
    Ok(())
}
