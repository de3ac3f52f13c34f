//! ARM64 unwind information.

use std::fmt;

use super::{bits, read_handler, Handler};
use crate::bytes::read_u32;
use crate::error::Result;
use crate::image::PeImage;

pub const RUNTIME_FUNCTION_SIZE: usize = 8;

/// Encoded length in bytes of each unwind opcode, indexed by its first byte.
pub const CODE_LENGTHS: [u8; 256] = {
    let mut table = [1u8; 256];
    let mut i = 0xc0;
    while i < 0xe0 {
        table[i] = 2;
        i += 1;
    }
    table[0xe0] = 4; // alloc_l
    table[0xe2] = 2; // add_fp
    table[0xe7] = 2; // arithmetic
    table
};

/// Packed `UnwindData` word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arm64Packed(pub u32);

impl Arm64Packed {
    pub fn flag(self) -> u32 {
        bits(self.0, 0, 2)
    }

    pub fn function_length(self) -> u32 {
        bits(self.0, 2, 11)
    }

    pub fn reg_f(self) -> u32 {
        bits(self.0, 13, 3)
    }

    pub fn reg_i(self) -> u32 {
        bits(self.0, 16, 4)
    }

    pub fn h(self) -> bool {
        bits(self.0, 20, 1) != 0
    }

    pub fn cr(self) -> u32 {
        bits(self.0, 21, 2)
    }

    pub fn frame_size(self) -> u32 {
        bits(self.0, 23, 9)
    }

    /// The equivalent unwind program, innermost operation first.
    pub fn codes(self) -> Vec<String> {
        let (regf, regi, cr) = (self.reg_f(), self.reg_i(), self.cr());
        let mut intsz = regi * 8;
        let mut fpsz = regf * 8;
        if cr == 1 {
            intsz += 8;
        }
        if regf != 0 {
            fpsz += 8;
        }
        let savesz = (intsz + fpsz + 8 * 8 * self.h() as u32 + 0xf) & !0xf;
        let locsz = (self.frame_size() * 16) as i32 - savesz as i32;

        let mut out = Vec::new();
        let allocate = match cr {
            3 => {
                out.push("mov x29,sp".to_string());
                if locsz <= 512 {
                    out.push(format!("stp x29,lr,[sp,-#{locsz:#x}]!"));
                    false
                } else {
                    out.push("stp x29,lr,[sp,0]".to_string());
                    true
                }
            }
            0 | 1 => true,
            _ => false,
        };
        if allocate {
            if locsz <= 4080 {
                out.push(format!("sub sp,sp,#{locsz:#x}"));
            } else {
                out.push(format!("sub sp,sp,#{:#x}", locsz - 4080));
                out.push("sub sp,sp,#4080".to_string());
            }
        }

        if self.h() {
            let base = intsz + fpsz;
            out.push(format!("stp x6,x7,[sp,#{:#x}]", base + 48));
            out.push(format!("stp x4,x5,[sp,#{:#x}]", base + 32));
            out.push(format!("stp x2,x3,[sp,#{:#x}]", base + 16));
            out.push(format!("stp x0,x1,[sp,#{base:#x}]"));
        }

        if regf != 0 {
            if regf % 2 == 0 {
                out.push(format!("str d{},[sp,#{:#x}]", 8 + regf, intsz + fpsz - 8));
            }
            for i in (0..regf.div_ceil(2)).rev() {
                if i == 0 && intsz == 0 {
                    out.push(format!("stp d8,d9,[sp,-#{savesz:#x}]!"));
                } else {
                    out.push(format!("stp d{},d{},[sp,#{:#x}]", 8 + 2 * i, 9 + 2 * i, intsz + 16 * i));
                }
            }
        }

        match regi {
            0 => {
                if cr == 1 {
                    out.push(format!("str lr,[sp,-#{savesz:#x}]!"));
                }
            }
            1 => {
                out.push(if cr == 1 {
                    format!("stp x19,lr,[sp,-#{savesz:#x}]!")
                } else {
                    format!("str x19,[sp,-#{savesz:#x}]!")
                });
            }
            _ => {
                if regi % 2 == 1 {
                    out.push(if cr == 1 {
                        format!("stp x{},lr,[sp,#{:#x}]", 18 + regi, 8 * regi - 8)
                    } else {
                        format!("str x{},[sp,#{:#x}]", 18 + regi, 8 * regi - 8)
                    });
                } else if cr == 1 {
                    out.push(format!("str lr,[sp,#{:#x}]", intsz - 8));
                }
                for i in (0..regi / 2).rev() {
                    if i != 0 {
                        out.push(format!("stp x{},x{},[sp,#{:#x}]", 19 + 2 * i, 20 + 2 * i, 16 * i));
                    } else {
                        out.push(format!("stp x19,x20,[sp,-#{savesz:#x}]!"));
                    }
                }
            }
        }
        out.push("end".to_string());
        out
    }
}

/// One decoded unwind opcode. Offsets and sizes are in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arm64Op {
    AllocS(u32),
    SaveR19R20X(u32),
    SaveFpLr(u32),
    SaveFpLrX(u32),
    AllocM(u32),
    SaveRegP { reg: u32, offset: u32 },
    SaveRegPX { reg: u32, offset: u32 },
    SaveReg { reg: u32, offset: u32 },
    SaveRegX { reg: u32, offset: u32 },
    SaveLrPair { reg: u32, offset: u32 },
    SaveFRegP { reg: u32, offset: u32 },
    SaveFRegPX { reg: u32, offset: u32 },
    SaveFReg { reg: u32, offset: u32 },
    SaveFRegX { reg: u32, offset: u32 },
    AllocL(u32),
    SetFp,
    AddFp(u32),
    Nop,
    End,
    EndC,
    SaveNext,
    /// `0xe7` arithmetic/PAC operation selected by bits 4-7 of the operand.
    Arithmetic(u8),
    TrapFrame,
    MachineFrame,
    Context,
    ClearUnwoundToCall,
    Unknown(u8),
}

impl Arm64Op {
    /// Decode an instruction. `value` holds its bytes big-endian, first byte highest.
    pub fn decode(code: u8, value: u32) -> Self {
        let pair_reg = 19 + ((value >> 6) & 0xf);
        let fp_reg = 8 + ((value >> 6) & 0x7);
        let scaled = (value & 0x3f) * 8;
        match code {
            0x00..=0x1f => Self::AllocS(16 * (value & 0x1f)),
            0x20..=0x3f => Self::SaveR19R20X(8 * (value & 0x1f)),
            0x40..=0x7f => Self::SaveFpLr(8 * (value & 0x3f)),
            0x80..=0xbf => Self::SaveFpLrX(8 * (value & 0x3f) + 8),
            0xc0..=0xc7 => Self::AllocM(16 * (value & 0x7ff)),
            0xc8..=0xcb => Self::SaveRegP {
                reg: pair_reg,
                offset: scaled,
            },
            0xcc..=0xcf => Self::SaveRegPX {
                reg: pair_reg,
                offset: scaled + 8,
            },
            0xd0..=0xd3 => Self::SaveReg {
                reg: pair_reg,
                offset: scaled,
            },
            0xd4 | 0xd5 => Self::SaveRegX {
                reg: 19 + ((value >> 5) & 0xf),
                offset: (value & 0x1f) * 8 + 8,
            },
            0xd6 | 0xd7 => Self::SaveLrPair {
                reg: 19 + 2 * ((value >> 6) & 0x7),
                offset: scaled,
            },
            0xd8 | 0xd9 => Self::SaveFRegP {
                reg: fp_reg,
                offset: scaled,
            },
            0xda | 0xdb => Self::SaveFRegPX {
                reg: fp_reg,
                offset: scaled + 8,
            },
            0xdc | 0xdd => Self::SaveFReg {
                reg: fp_reg,
                offset: scaled,
            },
            0xde => Self::SaveFRegX {
                reg: 8 + ((value >> 5) & 0x7),
                offset: (value & 0x1f) * 8 + 8,
            },
            0xe0 => Self::AllocL(16 * (value & 0xff_ffff)),
            0xe1 => Self::SetFp,
            0xe2 => Self::AddFp(8 * (value & 0xff)),
            0xe3 => Self::Nop,
            0xe4 => Self::End,
            0xe5 => Self::EndC,
            0xe6 => Self::SaveNext,
            0xe7 => Self::Arithmetic(((value >> 4) & 0xf) as u8),
            0xe8 => Self::TrapFrame,
            0xe9 => Self::MachineFrame,
            0xea => Self::Context,
            0xec => Self::ClearUnwoundToCall,
            _ => Self::Unknown(code),
        }
    }
}

const ARITHMETIC: [Option<&str>; 10] = [
    Some("add lr,lr,x28"),
    Some("add lr,lr,sp"),
    Some("sub lr,lr,x28"),
    Some("sub lr,lr,sp"),
    Some("eor lr,lr,x28"),
    Some("eor lr,lr,sp"),
    Some("rol lr,lr,neg x28"),
    None,
    Some("ror lr,lr,x28"),
    Some("ror lr,lr,sp"),
];

impl fmt::Display for Arm64Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::AllocS(n) | Self::AllocM(n) | Self::AllocL(n) => write!(f, "sub sp,sp,#{n:#x}"),
            Self::SaveR19R20X(n) => write!(f, "stp x19,x20,[sp,-#{n:#x}]!"),
            Self::SaveFpLr(n) => write!(f, "stp x29,lr,[sp,#{n:#x}]"),
            Self::SaveFpLrX(n) => write!(f, "stp x29,lr,[sp,-#{n:#x}]!"),
            Self::SaveRegP { reg, offset } => write!(f, "stp x{reg},x{},[sp,#{offset:#x}]", reg + 1),
            Self::SaveRegPX { reg, offset } => write!(f, "stp x{reg},x{},[sp,-#{offset:#x}]!", reg + 1),
            Self::SaveReg { reg, offset } => write!(f, "str x{reg},[sp,#{offset:#x}]"),
            Self::SaveRegX { reg, offset } => write!(f, "str x{reg},[sp,-#{offset:#x}]!"),
            Self::SaveLrPair { reg, offset } => write!(f, "stp x{reg},lr,[sp,#{offset:#x}]"),
            Self::SaveFRegP { reg, offset } => write!(f, "stp d{reg},d{},[sp,#{offset:#x}]", reg + 1),
            Self::SaveFRegPX { reg, offset } => write!(f, "stp d{reg},d{},[sp,-#{offset:#x}]!", reg + 1),
            Self::SaveFReg { reg, offset } => write!(f, "str d{reg},[sp,#{offset:#x}]"),
            Self::SaveFRegX { reg, offset } => write!(f, "str d{reg},[sp,-#{offset:#x}]!"),
            Self::SetFp => f.write_str("mov x29,sp"),
            Self::AddFp(n) => write!(f, "add x29,sp,#{n:#x}"),
            Self::Nop => f.write_str("nop"),
            Self::End => f.write_str("end"),
            Self::EndC => f.write_str("end_c"),
            Self::SaveNext => f.write_str("save_next"),
            Self::Arithmetic(kind) => f.write_str(ARITHMETIC.get(kind as usize).copied().flatten().unwrap_or("unknown op")),
            Self::TrapFrame => f.write_str("MSFT_OP_TRAP_FRAME"),
            Self::MachineFrame => f.write_str("MSFT_OP_MACHINE_FRAME"),
            Self::Context => f.write_str("MSFT_OP_CONTEXT"),
            Self::ClearUnwoundToCall => f.write_str("MSFT_OP_CLEAR_UNWOUND_TO_CALL"),
            Self::Unknown(_) => f.write_str("??"),
        }
    }
}

/// An instruction and its position in the code stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arm64Code {
    pub offset: usize,
    pub bytes: Vec<u8>,
    pub op: Arm64Op,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpilogScope {
    pub offset: u32,
    pub reserved: u32,
    pub index: u32,
}

/// Expanded `.xdata` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arm64Info {
    pub rva: u32,
    pub function_length: u32,
    pub version: u32,
    pub x: bool,
    pub e: bool,
    /// Epilog scope count, or the index of the single epilog when `E` is set.
    pub epilog: u32,
    /// Code words.
    pub codes: u32,
    pub extended: bool,
    pub epilogs: Vec<EpilogScope>,
    pub code: Vec<Arm64Code>,
    /// The last instruction ran past the end of the code words.
    pub truncated: bool,
    pub handler: Option<Handler>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arm64Unwind {
    Packed(Arm64Packed),
    Expanded(Arm64Info),
}

#[derive(Debug)]
pub struct Arm64Function {
    pub begin: u32,
    pub unwind_data: u32,
    pub unwind: Result<Arm64Unwind>,
}

impl Arm64Function {
    /// End address when the function length is known.
    pub fn end(&self) -> Option<u32> {
        let words = match &self.unwind {
            Ok(Arm64Unwind::Packed(p)) => p.function_length(),
            Ok(Arm64Unwind::Expanded(info)) => info.function_length,
            Err(_) => return None,
        };
        Some(self.begin.wrapping_add(words * 4))
    }
}

pub(crate) fn decode_function(image: &PeImage<'_>, raw: &[u8]) -> Arm64Function {
    let begin = read_u32(raw, 0).unwrap_or(0);
    let unwind_data = read_u32(raw, 4).unwrap_or(0);
    let packed = Arm64Packed(unwind_data);
    let unwind = if packed.flag() != 0 {
        Ok(Arm64Unwind::Packed(packed))
    } else {
        decode_info(image, unwind_data).map(Arm64Unwind::Expanded)
    };
    Arm64Function {
        begin,
        unwind_data,
        unwind,
    }
}

fn decode_info(image: &PeImage<'_>, rva: u32) -> Result<Arm64Info> {
    let word = read_u32(image.require("unwind info", rva, 4)?, 0).unwrap_or(0);
    let mut info = Arm64Info {
        rva,
        function_length: bits(word, 0, 18),
        version: bits(word, 18, 2),
        x: bits(word, 20, 1) != 0,
        e: bits(word, 21, 1) != 0,
        epilog: bits(word, 22, 5),
        codes: bits(word, 27, 5),
        extended: false,
        epilogs: Vec::new(),
        code: Vec::new(),
        truncated: false,
        handler: None,
    };
    let mut next = rva.wrapping_add(4);

    if info.epilog == 0 && info.codes == 0 {
        let ext = image.require("extended unwind header", next, 4)?;
        info.epilog = u16::from_le_bytes([ext[0], ext[1]]) as u32;
        info.codes = ext[2] as u32;
        info.extended = true;
        next = next.wrapping_add(4);
    }

    if !info.e {
        let raw = image.require("epilog scopes", next, info.epilog * 4)?;
        info.epilogs = raw
            .chunks_exact(4)
            .map(|c| {
                let scope = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                EpilogScope {
                    offset: bits(scope, 0, 18),
                    reserved: bits(scope, 18, 4),
                    index: bits(scope, 22, 10),
                }
            })
            .collect();
        next = next.wrapping_add(info.epilog * 4);
    }

    let bytes = image.require("unwind codes", next, info.codes * 4)?;
    (info.code, info.truncated) = decode_codes(bytes);
    next = next.wrapping_add(info.codes * 4);

    if info.x {
        info.handler = read_handler(image, next);
    }
    Ok(info)
}

/// Decode a code stream; the flag is set if the last instruction is cut off.
pub fn decode_codes(bytes: &[u8]) -> (Vec<Arm64Code>, bool) {
    let mut codes = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let code = bytes[pos];
        let len = CODE_LENGTHS[code as usize] as usize;
        let Some(raw) = bytes.get(pos..pos + len) else {
            return (codes, true);
        };
        let value = raw.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        codes.push(Arm64Code {
            offset: pos,
            bytes: raw.to_vec(),
            op: Arm64Op::decode(code, value),
        });
        pos += len;
    }
    (codes, false)
}
