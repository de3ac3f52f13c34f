//! Exception directory and unwind information.
//!
//! The exception directory is an array of runtime function entries whose
//! layout depends on the machine. Each architecture has its own decoder;
//! this module picks one and walks the array.

pub mod arm64;
pub mod armnt;
pub mod x86_64;

use tracing::debug;

use crate::error::Result;
use crate::image::PeImage;
use crate::pe::{DirectoryIndex, MACHINE_AMD64, MACHINE_ARM64, MACHINE_ARMNT};

/// Language-specific handler referenced from unwind info.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handler {
    pub rva: u32,
    /// RVA of the handler data that immediately follows the handler field.
    pub data_rva: u32,
}

/// One rendered line of an ARM-family unwind code stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeLine {
    /// The shared epilogue begins here (`E` bit set).
    Epilogue,
    /// Epilogue scope `index` begins here; `address` is where its code sits.
    EpilogueScope { index: usize, address: u32 },
    Code { offset: usize, code: u8, text: String },
}

#[derive(Debug)]
pub enum Functions {
    X64(Vec<x86_64::X64Function>),
    Armnt(Vec<armnt::ArmntFunction>),
    Arm64(Vec<arm64::Arm64Function>),
    /// No unwind decoder exists for this machine.
    Unsupported,
}

#[derive(Debug)]
pub struct ExceptionDirectory {
    pub machine: u16,
    pub functions: Functions,
}

impl ExceptionDirectory {
    pub fn len(&self) -> usize {
        match &self.functions {
            Functions::X64(f) => f.len(),
            Functions::Armnt(f) => f.len(),
            Functions::Arm64(f) => f.len(),
            Functions::Unsupported => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode every runtime function in the exception directory.
///
/// `max_chain` bounds how many x86-64 chain links are followed per function;
/// by default the number of entries in the table.
pub fn decode(image: &PeImage<'_>, max_chain: Option<usize>) -> Result<Option<ExceptionDirectory>> {
    let Some(dir) = image.directory(DirectoryIndex::Exception)? else {
        return Ok(None);
    };
    let machine = image.headers().file.machine;

    let functions = match machine {
        MACHINE_AMD64 => {
            let count = dir.data.len() / x86_64::RUNTIME_FUNCTION_SIZE;
            let cap = max_chain.unwrap_or(count).max(1);
            Functions::X64(
                dir.data
                    .chunks_exact(x86_64::RUNTIME_FUNCTION_SIZE)
                    .map(|raw| x86_64::decode_function(image, x86_64::RuntimeFunction::parse(raw), cap))
                    .collect(),
            )
        }
        MACHINE_ARMNT => Functions::Armnt(
            dir.data
                .chunks_exact(armnt::RUNTIME_FUNCTION_SIZE)
                .map(|raw| armnt::decode_function(image, raw))
                .collect(),
        ),
        MACHINE_ARM64 => Functions::Arm64(
            dir.data
                .chunks_exact(arm64::RUNTIME_FUNCTION_SIZE)
                .map(|raw| arm64::decode_function(image, raw))
                .collect(),
        ),
        _ => Functions::Unsupported,
    };

    let directory = ExceptionDirectory { machine, functions };
    debug!(machine, functions = directory.len(), "decoded exception directory");
    Ok(Some(directory))
}

/// Extract `width` bits of `value` starting at bit `shift`.
#[inline]
pub(crate) fn bits(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & ((1 << width) - 1)
}

/// Read an optional handler RVA at `rva`.
pub(crate) fn read_handler(image: &PeImage<'_>, rva: u32) -> Option<Handler> {
    image.read_u32(rva).map(|handler| Handler {
        rva: handler,
        data_rva: rva.wrapping_add(4),
    })
}
