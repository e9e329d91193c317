//! The `--audit` walker: scan the code section without executing and report
//! every opcode, syscall, and library function the runtime cannot handle.

use std::io::Write;

use crate::ain::Ain;
use crate::hll::LinkedLibrary;
use crate::instructions::{Opcode, SYSCALLS};

pub fn audit<W: Write>(out: &mut W, ain: &Ain, linked: &[LinkedLibrary]) -> std::io::Result<()> {
    let mut addr = 0usize;
    while addr + 2 <= ain.code.len() {
        let raw = u16::from_le_bytes(ain.code[addr..addr + 2].try_into().unwrap());
        let Some(op) = Opcode::from_raw(raw) else {
            writeln!(out, "{addr:#010x}: invalid/unknown opcode {raw:#06x}")?;
            break;
        };
        let width = op.width(ain.version);
        if addr + width > ain.code.len() {
            writeln!(out, "{addr:#010x}: truncated {} instruction", op.name())?;
            break;
        }
        if !op.implemented() {
            writeln!(out, "{addr:#010x}: {} (unimplemented instruction)", op.name())?;
        }
        let arg = |n: usize| {
            i32::from_le_bytes(ain.code[addr + 2 + n * 4..addr + 6 + n * 4].try_into().unwrap())
        };
        if op == Opcode::CALLSYS {
            let code = arg(0);
            match usize::try_from(code).ok().and_then(|c| SYSCALLS.get(c)) {
                Some(sys) if !sys.implemented => {
                    writeln!(out, "{addr:#010x}: CALLSYS {} (unimplemented system call)", sys.name)?;
                }
                Some(_) => {}
                None => {
                    writeln!(out, "{addr:#010x}: CALLSYS system.({code:#x})")?;
                }
            }
        }
        if op == Opcode::CALLHLL {
            let lib = arg(0) as usize;
            let fun = arg(1) as usize;
            match ain.libraries.get(lib) {
                Some(decl) => {
                    let name = decl
                        .functions
                        .get(fun)
                        .map(|f| f.name.as_utf8_lossy().into_owned())
                        .unwrap_or_else(|| format!("({fun})"));
                    let resolved = linked
                        .get(lib)
                        .and_then(|l| l.functions.get(fun))
                        .is_some_and(Option::is_some);
                    if crate::hll::find_library(decl.name.as_bytes()).is_none() {
                        writeln!(
                            out,
                            "{addr:#010x}: CALLHLL {}.{name} (unimplemented library)",
                            decl.name
                        )?;
                    } else if !resolved {
                        writeln!(
                            out,
                            "{addr:#010x}: CALLHLL {}.{name} (unimplemented function)",
                            decl.name
                        )?;
                    }
                }
                None => {
                    writeln!(out, "{addr:#010x}: CALLHLL ({lib}).({fun}) (no such library)")?;
                }
            }
        }
        addr += width;
    }
    out.flush()
}
