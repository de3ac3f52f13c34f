//! x86-64 unwind information.
//!
//! `UNWIND_INFO` carries an array of 16-bit slots. Most operations fit in
//! one slot; `ALLOC_LARGE` and the `SAVE_*` operations pull their operand
//! from the following one or two slots, which the decoder must skip.

use std::fmt;

use bitflags::bitflags;
use tracing::warn;

use super::{read_handler, Handler};
use crate::bytes::{read_u16, read_u32, FieldReader};
use crate::error::{Error, Result};
use crate::image::PeImage;

pub const RUNTIME_FUNCTION_SIZE: usize = 12;
const UNWIND_INFO_HEADER_SIZE: u32 = 4;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_EPILOG: u8 = 6;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

pub const REGISTER_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

fn reg(n: u8) -> &'static str {
    REGISTER_NAMES[(n & 0xf) as usize]
}

bitflags! {
    /// `UNW_FLAG_*`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UnwindFlags: u8 {
        const EHANDLER = 0x1;
        const UHANDLER = 0x2;
        const CHAININFO = 0x4;
    }
}

/// `RUNTIME_FUNCTION` for x86-64.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind_data: u32,
}

impl RuntimeFunction {
    pub(crate) fn parse(raw: &[u8]) -> Self {
        let mut r = FieldReader::new(raw);
        Self {
            begin: r.u32(),
            end: r.u32(),
            unwind_data: r.u32(),
        }
    }

    /// Low bit of `UnwindData` set: the rest is the RVA of another entry.
    pub fn is_indirect(&self) -> bool {
        self.unwind_data & 1 != 0
    }
}

/// One decoded unwind operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum X64Op {
    PushNonvol(u8),
    Alloc(u32),
    SetFpreg { reg: u8, offset: u32 },
    SaveNonvol { reg: u8, offset: u32 },
    SaveXmm128 { reg: u8, offset: u32 },
    PushMachframe(u8),
    /// Version 2 epilogue marker.
    Epilog(u8),
    Unknown(u8),
    /// The operation's extra slots run past the declared count.
    Truncated(u8),
}

impl fmt::Display for X64Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PushNonvol(r) => write!(f, "push %{}", reg(r)),
            Self::Alloc(size) => write!(f, "sub $0x{size:x},%rsp"),
            Self::SetFpreg { reg: r, offset } => write!(f, "lea 0x{offset:x}(%rsp),{}", reg(r)),
            Self::SaveNonvol { reg: r, offset } => write!(f, "mov %{},0x{offset:x}(%rsp)", reg(r)),
            Self::SaveXmm128 { reg: r, offset } => write!(f, "movaps %xmm{r},0x{offset:x}(%rsp)"),
            Self::PushMachframe(info) => write!(f, "PUSH_MACHFRAME {info}"),
            Self::Epilog(info) => write!(f, "EPILOG flags {info:x}"),
            Self::Unknown(code) => write!(f, "*** unknown code {code}"),
            Self::Truncated(code) => write!(f, "*** truncated code {code}"),
        }
    }
}

/// An operation and the prologue offset it applies at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindCode {
    pub offset: u8,
    pub op: X64Op,
}

/// Decoded `UNWIND_INFO`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwindInfo {
    pub rva: u32,
    pub version: u8,
    pub flags: UnwindFlags,
    pub prolog_size: u8,
    pub count: u8,
    pub frame_register: u8,
    /// Scaled frame offset in bytes.
    pub frame_offset: u32,
    pub codes: Vec<UnwindCode>,
    pub handler: Option<Handler>,
    /// Parent entry when `CHAININFO` is set.
    pub chained: Option<RuntimeFunction>,
}

impl UnwindInfo {
    pub fn is_known_version(&self) -> bool {
        matches!(self.version, 1 | 2)
    }

    pub fn frame_register_name(&self) -> Option<&'static str> {
        (self.frame_register != 0).then(|| reg(self.frame_register))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnwindStep {
    /// An entry whose `UnwindData` points at another entry.
    Redirect(RuntimeFunction),
    Info(UnwindInfo),
}

/// Why a chain walk ended before reaching a terminal record.
#[derive(Debug)]
pub enum ChainStop {
    Unresolved(Error),
    CapReached(usize),
}

#[derive(Debug)]
pub struct X64Function {
    pub function: RuntimeFunction,
    /// The function's own unwind info first, then each chained parent.
    pub steps: Vec<UnwindStep>,
    pub stop: Option<ChainStop>,
}

/// Decode the unwind info of `function`, following redirect and
/// `CHAININFO` links for at most `cap` hops.
pub fn decode_function(image: &PeImage<'_>, function: RuntimeFunction, cap: usize) -> X64Function {
    let mut steps = Vec::new();
    let mut stop = None;
    let mut data = function.unwind_data;
    let mut hops = 0;

    loop {
        if data & 1 != 0 {
            if hops >= cap {
                stop = Some(ChainStop::CapReached(cap));
                break;
            }
            hops += 1;
            let target = data & !1;
            match image.require("chained function", target, RUNTIME_FUNCTION_SIZE as u32) {
                Ok(raw) => {
                    let next = RuntimeFunction::parse(raw);
                    steps.push(UnwindStep::Redirect(next));
                    data = next.unwind_data;
                    continue;
                }
                Err(e) => {
                    stop = Some(ChainStop::Unresolved(e));
                    break;
                }
            }
        }

        let info = match decode_info(image, data) {
            Ok(info) => info,
            Err(e) => {
                stop = Some(ChainStop::Unresolved(e));
                break;
            }
        };
        let parent = info.chained;
        steps.push(UnwindStep::Info(info));
        let Some(parent) = parent else {
            break;
        };
        if hops >= cap {
            stop = Some(ChainStop::CapReached(cap));
            break;
        }
        hops += 1;
        data = parent.unwind_data;
    }

    if let Some(ChainStop::CapReached(cap)) = &stop {
        warn!(begin = format_args!("{:#x}", function.begin), cap, "unwind chain cap reached");
    }
    X64Function { function, steps, stop }
}

/// Decode one `UNWIND_INFO` record at `rva`.
pub fn decode_info(image: &PeImage<'_>, rva: u32) -> Result<UnwindInfo> {
    let header = image.require("unwind info", rva, UNWIND_INFO_HEADER_SIZE)?;
    let version = header[0] & 0x7;
    let flags = UnwindFlags::from_bits_retain(header[0] >> 3);
    let prolog_size = header[1];
    let count = header[2];
    let frame_register = header[3] & 0xf;
    let frame_offset = (header[3] >> 4) as u32 * 16;

    let mut info = UnwindInfo {
        rva,
        version,
        flags,
        prolog_size,
        count,
        frame_register,
        frame_offset,
        codes: Vec::new(),
        handler: None,
        chained: None,
    };
    if !info.is_known_version() {
        return Ok(info);
    }

    let slots_rva = rva.wrapping_add(UNWIND_INFO_HEADER_SIZE);
    let slots = image.require("unwind codes", slots_rva, count as u32 * 2)?;
    info.codes = decode_codes(slots, version, frame_register, frame_offset);

    let tail = slots_rva.wrapping_add(((count as u32 + 1) & !1) * 2);
    if flags.contains(UnwindFlags::CHAININFO) {
        let raw = image.require("chained function", tail, RUNTIME_FUNCTION_SIZE as u32)?;
        info.chained = Some(RuntimeFunction::parse(raw));
    } else if flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
        info.handler = read_handler(image, tail);
        if info.handler.is_none() {
            warn!(rva = format_args!("{tail:#x}"), "can't grab exception handler");
        }
    }
    Ok(info)
}

/// Walk the slot array front to back.
pub fn decode_codes(slots: &[u8], version: u8, frame_register: u8, frame_offset: u32) -> Vec<UnwindCode> {
    let count = slots.len() / 2;
    let slot16 = |i: usize| read_u16(slots, i * 2).map(u32::from);
    let slot32 = |i: usize| {
        if i + 1 < count {
            read_u32(slots, i * 2)
        } else {
            None
        }
    };

    let mut codes = Vec::with_capacity(count);
    let mut i = 0;
    while i < count {
        let offset = slots[i * 2];
        let code = slots[i * 2 + 1] & 0xf;
        let info = slots[i * 2 + 1] >> 4;

        let (op, extra) = match code {
            UWOP_PUSH_NONVOL => (Some(X64Op::PushNonvol(info)), 0),
            UWOP_ALLOC_LARGE if info != 0 => (slot32(i + 1).map(X64Op::Alloc), 2),
            UWOP_ALLOC_LARGE => (slot16(i + 1).map(|n| X64Op::Alloc(n * 8)), 1),
            UWOP_ALLOC_SMALL => (Some(X64Op::Alloc((info as u32 + 1) * 8)), 0),
            UWOP_SET_FPREG => (
                Some(X64Op::SetFpreg {
                    reg: frame_register,
                    offset: frame_offset,
                }),
                0,
            ),
            UWOP_SAVE_NONVOL => (
                slot16(i + 1).map(|n| X64Op::SaveNonvol { reg: info, offset: n * 8 }),
                1,
            ),
            UWOP_SAVE_NONVOL_FAR => (
                slot32(i + 1).map(|offset| X64Op::SaveNonvol { reg: info, offset }),
                2,
            ),
            UWOP_EPILOG if version == 2 => (Some(X64Op::Epilog(info)), 0),
            UWOP_SAVE_XMM128 => (
                slot16(i + 1).map(|n| X64Op::SaveXmm128 { reg: info, offset: n * 16 }),
                1,
            ),
            UWOP_SAVE_XMM128_FAR => (
                slot32(i + 1).map(|offset| X64Op::SaveXmm128 { reg: info, offset }),
                2,
            ),
            UWOP_PUSH_MACHFRAME => (Some(X64Op::PushMachframe(info)), 0),
            _ => (Some(X64Op::Unknown(code)), 0),
        };

        match op {
            Some(op) => codes.push(UnwindCode { offset, op }),
            None => {
                codes.push(UnwindCode {
                    offset,
                    op: X64Op::Truncated(code),
                });
                break;
            }
        }
        i += 1 + extra;
    }
    codes
}
