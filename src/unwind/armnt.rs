//! ARM (Thumb-2) unwind information.
//!
//! A runtime function entry either packs the whole prologue shape into its
//! second word (`Flag != 0`) or points at an `.xdata` record holding
//! epilogue scopes and a byte-coded unwind program.

use super::{bits, read_handler, CodeLine, Handler};
use crate::bytes::read_u32;
use crate::error::Result;
use crate::image::PeImage;

pub const RUNTIME_FUNCTION_SIZE: usize = 8;

/// Packed `UnwindData` word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArmntPacked(pub u32);

impl ArmntPacked {
    pub fn flag(self) -> u32 {
        bits(self.0, 0, 2)
    }

    pub fn function_length(self) -> u32 {
        bits(self.0, 2, 11)
    }

    pub fn ret(self) -> u32 {
        bits(self.0, 13, 2)
    }

    pub fn h(self) -> bool {
        bits(self.0, 15, 1) != 0
    }

    pub fn reg(self) -> u32 {
        bits(self.0, 16, 3)
    }

    pub fn r(self) -> bool {
        bits(self.0, 19, 1) != 0
    }

    pub fn l(self) -> bool {
        bits(self.0, 20, 1) != 0
    }

    pub fn c(self) -> bool {
        bits(self.0, 21, 1) != 0
    }

    pub fn stack_adjust(self) -> u32 {
        bits(self.0, 22, 10)
    }

    /// Prologue then epilogue, as pseudo-instructions.
    pub fn codes(self) -> Vec<String> {
        let (h, reg, r, l, c, sa) = (self.h(), self.reg(), self.r(), self.l(), self.c(), self.stack_adjust());
        // Values from 0x3f4 up fold the push/pop of r0-r3 into StackAdjust.
        let (pf, ef) = if sa >= 0x3f4 {
            (sa & 0x04 != 0, sa & 0x08 != 0)
        } else {
            (false, false)
        };
        let first = !sa & 3;

        let mut push = String::new();
        let mut pop = String::new();
        let mut sc = 0;
        let separate = |push: &mut String, pop: &mut String| {
            if c || l {
                push.push_str(", ");
                if c || (l && !h) {
                    pop.push_str(", ");
                }
            }
        };
        match (r, pf) {
            (false, false) => {
                let list = if reg != 0 {
                    format!("r4-r{}", reg + 4)
                } else {
                    "r4".to_string()
                };
                push.push_str(&list);
                pop.push_str(&list);
                sc = reg + 1;
                separate(&mut push, &mut pop);
            }
            (true, true) => {
                let list = if first != 3 {
                    format!("r{first}-r3")
                } else {
                    "r3".to_string()
                };
                push.push_str(&list);
                pop.push_str(&list);
                sc = 4 - first;
                separate(&mut push, &mut pop);
            }
            (false, true) => {
                let list = format!("r{first}-r{}", reg + 4);
                push.push_str(&list);
                pop.push_str(&list);
                sc = reg + 5 - first;
                separate(&mut push, &mut pop);
            }
            (true, false) => {
                if !c && !l {
                    push.push_str("none");
                    pop.push_str("none");
                }
            }
        }

        match (c, l) {
            (true, false) => {
                push.push_str("r11");
                pop.push_str("r11");
            }
            (true, true) => {
                push.push_str("r11, lr");
                pop.push_str(if h { "r11" } else { "r11, pc" });
            }
            (false, true) => {
                push.push_str("lr");
                if !h {
                    pop.push_str("pc");
                }
            }
            (false, false) => {}
        }

        let vfp = match (r, reg) {
            (true, 0) => "d8".to_string(),
            (true, reg) => format!("d8-d{}", reg + 8),
            (false, _) => "none".to_string(),
        };

        let mut out = Vec::new();
        if h {
            out.push("push {r0-r3}".to_string());
        }
        if r || l || c || pf {
            out.push(format!("push {{{push}}}"));
        }
        if c && r && !l && !pf {
            out.push("mov r11, sp".to_string());
        } else if c && (!r || l || pf) {
            out.push(if sa >= 0x3f4 && sc == 0 {
                "add r11, sp, #<unknown>".to_string()
            } else if sa >= 0x3f4 {
                format!("add r11, sp, #{}", sc * 4)
            } else {
                format!("add r11, sp, #{}", sa * 4)
            });
        }
        if r && reg != 7 {
            out.push(format!("vpush {{{vfp}}}"));
        }
        if sa < 0x3f4 && !pf {
            out.push(format!("sub sp, sp, #{}", sa * 4));
        }

        if sa < 0x3f4 && !ef {
            out.push(format!("add sp, sp, #{}", sa * 4));
        }
        if r && reg != 7 {
            out.push(format!("vpop {{{vfp}}}"));
        }
        if c || !r || ef || (l && !h) {
            out.push(format!("pop {{{pop}}}"));
        }
        if h && !l {
            out.push("add sp, sp, #16".to_string());
        } else if h && l {
            out.push("ldr pc, [sp], #20".to_string());
        }
        match self.ret() {
            1 => out.push("bx <reg>".to_string()),
            2 => out.push("b <address>".to_string()),
            _ => {}
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpilogueScope {
    pub offset: u32,
    pub reserved: u32,
    pub condition: u32,
    pub index: u32,
}

/// Expanded `.xdata` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArmntInfo {
    pub rva: u32,
    pub function_length: u32,
    pub version: u32,
    pub x: bool,
    pub e: bool,
    pub f: bool,
    pub count: u32,
    pub words: u32,
    /// Counts came from the extension word because both header fields were zero.
    pub extended: bool,
    pub epilogues: Vec<EpilogueScope>,
    pub codes: Vec<CodeLine>,
    pub handler: Option<Handler>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArmntUnwind {
    Packed(ArmntPacked),
    Expanded(ArmntInfo),
}

#[derive(Debug)]
pub struct ArmntFunction {
    /// `BeginAddress` including the Thumb bit.
    pub begin: u32,
    pub unwind_data: u32,
    pub unwind: Result<ArmntUnwind>,
}

impl ArmntFunction {
    pub fn start(&self) -> u32 {
        self.begin & !1
    }

    /// End address when the function length is known.
    pub fn end(&self) -> Option<u32> {
        let halfwords = match &self.unwind {
            Ok(ArmntUnwind::Packed(p)) => p.function_length(),
            Ok(ArmntUnwind::Expanded(info)) => info.function_length,
            Err(_) => return None,
        };
        Some(self.start().wrapping_add(halfwords * 2))
    }
}

pub(crate) fn decode_function(image: &PeImage<'_>, raw: &[u8]) -> ArmntFunction {
    let begin = read_u32(raw, 0).unwrap_or(0);
    let unwind_data = read_u32(raw, 4).unwrap_or(0);
    let packed = ArmntPacked(unwind_data);
    let unwind = if packed.flag() != 0 {
        Ok(ArmntUnwind::Packed(packed))
    } else {
        decode_info(image, unwind_data, begin & !1).map(ArmntUnwind::Expanded)
    };
    ArmntFunction {
        begin,
        unwind_data,
        unwind,
    }
}

fn decode_info(image: &PeImage<'_>, rva: u32, start: u32) -> Result<ArmntInfo> {
    let word = read_u32(image.require("unwind info", rva, 4)?, 0).unwrap_or(0);
    let mut info = ArmntInfo {
        rva,
        function_length: bits(word, 0, 18),
        version: bits(word, 18, 2),
        x: bits(word, 20, 1) != 0,
        e: bits(word, 21, 1) != 0,
        f: bits(word, 22, 1) != 0,
        count: bits(word, 23, 5),
        words: bits(word, 28, 4),
        extended: false,
        epilogues: Vec::new(),
        codes: Vec::new(),
        handler: None,
    };
    let mut next = rva.wrapping_add(4);

    if info.count == 0 && info.words == 0 {
        let ext = image.require("extended unwind header", next, 4)?;
        info.count = u16::from_le_bytes([ext[0], ext[1]]) as u32;
        info.words = ext[2] as u32;
        info.extended = true;
        next = next.wrapping_add(4);
    }

    if !info.e {
        let raw = image.require("epilogue scopes", next, info.count * 4)?;
        info.epilogues = raw
            .chunks_exact(4)
            .map(|c| {
                let scope = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                EpilogueScope {
                    offset: bits(scope, 0, 18),
                    reserved: bits(scope, 18, 2),
                    condition: bits(scope, 20, 4),
                    index: bits(scope, 24, 8),
                }
            })
            .collect();
        next = next.wrapping_add(info.count * 4);
    }

    if info.words != 0 {
        let bytes = image.require("unwind codes", next, info.words * 4)?;
        info.codes = decode_codes(bytes, &info, start);
        next = next.wrapping_add(info.words * 4);
    }

    if info.x {
        info.handler = read_handler(image, next);
    }
    Ok(info)
}

fn register_list(mask: u32, highest: u32, extra: Option<&str>) -> String {
    let mut regs: Vec<String> = (0..=highest).filter(|f| mask >> f & 1 != 0).map(|f| format!("r{f}")).collect();
    regs.extend(extra.map(str::to_string));
    regs.join(", ")
}

/// Decode the byte-coded unwind program.
pub fn decode_codes(bytes: &[u8], info: &ArmntInfo, start: u32) -> Vec<CodeLine> {
    let mut lines = Vec::new();
    let mut in_epilogue = false;
    let mut b = 0;

    while b < bytes.len() {
        if info.e && b as u32 == info.count {
            lines.push(CodeLine::Epilogue);
            in_epilogue = true;
        } else if !info.e {
            for (index, scope) in info.epilogues.iter().enumerate() {
                if b as u32 == scope.index {
                    lines.push(CodeLine::EpilogueScope {
                        index,
                        address: start.wrapping_add(scope.offset * 2),
                    });
                    in_epilogue = true;
                }
            }
        }

        let offset = b;
        let code = bytes[b];
        let len = operand_bytes(code);
        let Some(operands) = bytes.get(b + 1..b + 1 + len) else {
            lines.push(CodeLine::Code {
                offset,
                code,
                text: "truncated".to_string(),
            });
            break;
        };
        let (text, ends) = render(code, operands, in_epilogue);
        lines.push(CodeLine::Code { offset, code, text });
        if ends {
            in_epilogue = true;
        }
        b += 1 + len;
    }
    lines
}

/// Operand bytes following an opcode byte.
fn operand_bytes(code: u8) -> usize {
    match code {
        0x80..=0xbf | 0xe8..=0xef | 0xf5 | 0xf6 => 1,
        0xf7 | 0xf9 => 2,
        0xf8 | 0xfa => 3,
        _ => 0,
    }
}

/// Render one opcode; the flag reports an end marker.
fn render(code: u8, ops: &[u8], epi: bool) -> (String, bool) {
    let pick = |epilogue: &'static str, prologue: &'static str| if epi { epilogue } else { prologue };
    let x = |i: usize| ops.get(i).copied().unwrap_or(0) as u32;
    let c = code as u32;

    let text = match code {
        0x00..=0x7f => format!("{} sp, sp, #{}", pick("add", "sub"), c * 4),
        0x80..=0xbf => {
            let excode = (c << 8) | x(0);
            let extra = (excode & 0x2000 != 0).then(|| pick("pc", "lr"));
            format!("{} {{{}}}", pick("pop", "push"), register_list(excode, 12, extra))
        }
        0xc0..=0xcf if epi => format!("mov sp, r{}", c & 0x0f),
        0xc0..=0xcf => format!("mov r{}, sp", c & 0x0f),
        0xd0..=0xdf => {
            let base = if code <= 0xd7 { 4 } else { 8 };
            let link = if c & 0x04 != 0 { pick(", pc", ", lr") } else { "" };
            format!("{} {{r4-r{}{}}}", pick("pop", "push"), (c & 0x03) + base, link)
        }
        0xe0..=0xe7 => format!("{} {{d8-d{}}}", pick("vpop", "vpush"), (c & 0x07) + 8),
        0xe8..=0xeb => {
            let excode = (c << 8) | x(0);
            format!("{} sp, sp, #{}", pick("addw", "subw"), (excode & 0x03ff) * 4)
        }
        0xec | 0xed => {
            let excode = (c << 8) | x(0);
            let extra = (excode & 0x0100 != 0).then(|| pick("pc", "lr"));
            format!("{} {{{}}}", pick("pop", "push"), register_list(excode, 7, extra))
        }
        0xee => "unknown 16".to_string(),
        0xef if epi && x(0) <= 0x0f => format!("ldr lr, [sp], #{}", (x(0) & 0x0f) * 4),
        0xef => "unknown 32".to_string(),
        0xf0..=0xf4 => "unknown".to_string(),
        0xf5 | 0xf6 => {
            let base = if code == 0xf6 { 16 } else { 0 };
            format!(
                "{} {{d{}-d{}}}",
                pick("vpop", "vpush"),
                ((x(0) & 0xf0) >> 4) + base,
                (x(0) & 0x0f) + base
            )
        }
        0xf7 | 0xf9 => format!("{} sp, sp, #{}", pick("add", "sub"), ((x(0) << 8) | x(1)) * 4),
        0xf8 | 0xfa => format!(
            "{} sp, sp, #{}",
            pick("add", "sub"),
            ((x(0) << 16) | (x(1) << 8) | x(2)) * 4
        ),
        0xfb | 0xfc => "nop".to_string(),
        0xfd | 0xfe => return ("(end) nop".to_string(), true),
        0xff => return ("end".to_string(), true),
    };
    (text, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[CodeLine]) -> Vec<String> {
        lines
            .iter()
            .map(|l| match l {
                CodeLine::Epilogue => "Epilogue:".to_string(),
                CodeLine::EpilogueScope { index, address } => format!("scope {index} at {address:08x}"),
                CodeLine::Code { text, .. } => text.clone(),
            })
            .collect()
    }

    fn info(e: bool, count: u32, epilogues: Vec<EpilogueScope>) -> ArmntInfo {
        ArmntInfo {
            rva: 0,
            function_length: 0,
            version: 0,
            x: false,
            e,
            f: false,
            count,
            words: 1,
            extended: false,
            epilogues,
            codes: Vec::new(),
            handler: None,
        }
    }

    #[test]
    fn test_packed_bit_fields() {
        // Flag=1, FunctionLength=0x20, Ret=0, H=0, Reg=3, R=0, L=1, C=1, StackAdjust=4.
        let word = 1 | (0x20 << 2) | (3 << 16) | (1 << 20) | (1 << 21) | (4 << 22);
        let p = ArmntPacked(word);
        assert_eq!(p.flag(), 1);
        assert_eq!(p.function_length(), 0x20);
        assert_eq!(p.reg(), 3);
        assert!(p.l() && p.c() && !p.r() && !p.h());
        assert_eq!(p.stack_adjust(), 4);
        assert_eq!(
            p.codes(),
            [
                "push {r4-r7, r11, lr}",
                "add r11, sp, #16",
                "sub sp, sp, #16",
                "add sp, sp, #16",
                "pop {r4-r7, r11, pc}",
            ]
        );
    }

    #[test]
    fn test_packed_home_args_and_float_regs() {
        // Flag=1, Ret=1, H=1, Reg=1, R=1, L=0, C=0, StackAdjust=0.
        let word = 1 | (1 << 13) | (1 << 15) | (1 << 16) | (1 << 19);
        assert_eq!(
            ArmntPacked(word).codes(),
            [
                "push {r0-r3}",
                "push {none}",
                "vpush {d8-d9}",
                "sub sp, sp, #0",
                "add sp, sp, #0",
                "vpop {d8-d9}",
                "add sp, sp, #16",
                "bx <reg>",
            ]
        );
    }

    #[test]
    fn test_shared_epilogue_flips_push_to_pop() {
        // Prologue: sub sp #8; push {r4-r5, lr}; end. Epilogue at byte 3.
        let bytes = [0x02, 0xd5, 0xff, 0x02, 0xd5, 0xff, 0x00, 0x00];
        let lines = decode_codes(&bytes, &info(true, 3, Vec::new()), 0x1000);
        assert_eq!(
            texts(&lines),
            [
                "sub sp, sp, #8",
                "push {r4-r5, lr}",
                "end",
                "Epilogue:",
                "add sp, sp, #8",
                "pop {r4-r5, pc}",
                "end",
                "add sp, sp, #0",
                "add sp, sp, #0",
            ]
        );
    }

    #[test]
    fn test_scoped_epilogue_and_wide_operands() {
        let scope = EpilogueScope {
            offset: 0x10,
            reserved: 0,
            condition: 0xe,
            index: 6,
        };
        // 0xa0 0x30: push {r4, r5, lr}; 0xf7 0x01 0x00: sub sp #1024; 0xfd.
        let bytes = [0xa0, 0x30, 0xf7, 0x01, 0x00, 0x00, 0x00, 0xff];
        let lines = decode_codes(&bytes, &info(false, 1, vec![scope]), 0x1000);
        assert_eq!(
            texts(&lines),
            [
                "push {r4, r5, lr}",
                "sub sp, sp, #1024",
                "sub sp, sp, #0",
                "scope 0 at 00001020",
                "add sp, sp, #0",
                "end",
            ]
        );
    }

    #[test]
    fn test_expanded_record_from_image() {
        use crate::pe::{DirectoryIndex, MACHINE_ARMNT};
        use crate::testutil::{put32, ImageBuilder};

        let mut pdata = vec![0u8; 8];
        put32(&mut pdata, 0, 0x1001);
        put32(&mut pdata, 4, 0x4000);
        let mut xdata = vec![0u8; 8];
        // FunctionLength=0x10, E=1, epilogue at byte 2, one code word.
        put32(&mut xdata, 0, 0x10 | (1 << 21) | (2 << 23) | (1 << 28));
        xdata[4..8].copy_from_slice(&[0x02, 0xff, 0x02, 0xff]);

        let bytes = ImageBuilder::pe32()
            .machine(MACHINE_ARMNT)
            .section(".pdata", 0x3000, 0x200, &pdata)
            .section(".xdata", 0x4000, 0x200, &xdata)
            .directory(DirectoryIndex::Exception, 0x3000, 8)
            .build();
        let image = PeImage::parse(&bytes).unwrap();
        let dir = super::super::decode(&image, None).unwrap().unwrap();
        let super::super::Functions::Armnt(functions) = dir.functions else {
            panic!("expected ARM functions");
        };
        assert_eq!(functions[0].start(), 0x1000);
        assert_eq!(functions[0].end(), Some(0x1020));
        let Ok(ArmntUnwind::Expanded(info)) = &functions[0].unwind else {
            panic!("expected expanded unwind info");
        };
        assert!(info.e && !info.extended);
        assert_eq!(
            texts(&info.codes),
            ["sub sp, sp, #8", "end", "Epilogue:", "add sp, sp, #8", "end"]
        );
    }

    #[test]
    fn test_truncated_operand() {
        let lines = decode_codes(&[0xf8, 0x01], &info(true, 8, Vec::new()), 0);
        assert_eq!(texts(&lines), ["truncated"]);
    }
}
