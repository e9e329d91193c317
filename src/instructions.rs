//! Static metadata for the System 4 instruction set.
//!
//! The numeric encoding is part of the on-disk ABI and must not change. The
//! table is the single source of truth for argument widths: the interpreter,
//! the audit walker, and the tests all take instruction sizes from here.

/// Semantic kind of one 32-bit instruction argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// integer immediate
    Int,
    /// float immediate (bit pattern in the 32-bit word)
    Float,
    /// code address
    Addr,
    /// function index
    Func,
    /// string table index
    String,
    /// message table index
    Msg,
    /// local variable index
    Local,
    /// global variable index
    Global,
    /// struct index
    Struct,
    /// syscall code
    Syscall,
    /// library index
    Lib,
    /// library function index
    HllFunc,
    /// filename table index
    File,
    /// delegate type index
    Delegate,
}

macro_rules! instruction_table {
    ($($name:ident = $code:literal, $kind:ident, [$($arg:ident),*]);* $(;)?) => {
        // Variant names double as the assembler mnemonics.
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($name = $code),*
        }

        impl Opcode {
            pub fn from_raw(raw: u16) -> Option<Opcode> {
                match raw {
                    $($code => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }

            /// Argument kinds before any image-version adjustment.
            pub fn args(self) -> &'static [ArgKind] {
                match self {
                    $(Opcode::$name => &[$(ArgKind::$arg),*]),*
                }
            }

            /// Whether execution sets the instruction pointer itself. All
            /// other opcodes advance it by the instruction width.
            pub fn sets_ip(self) -> bool {
                match self {
                    $(Opcode::$name => instruction_table!(@jumps $kind)),*
                }
            }
        }
    };
    (@jumps op) => { false };
    (@jumps jmp) => { true };
}

instruction_table! {
    PUSH = 0x00, op, [Int];
    POP = 0x01, op, [];
    REF = 0x02, op, [];
    REFREF = 0x03, op, [];
    PUSHGLOBALPAGE = 0x04, op, [];
    PUSHLOCALPAGE = 0x05, op, [];
    INV = 0x06, op, [];
    NOT = 0x07, op, [];
    COMPL = 0x08, op, [];
    ADD = 0x09, op, [];
    SUB = 0x0A, op, [];
    MUL = 0x0B, op, [];
    DIV = 0x0C, op, [];
    MOD = 0x0D, op, [];
    AND = 0x0E, op, [];
    OR = 0x0F, op, [];
    XOR = 0x10, op, [];
    LSHIFT = 0x11, op, [];
    RSHIFT = 0x12, op, [];
    LT = 0x13, op, [];
    GT = 0x14, op, [];
    LTE = 0x15, op, [];
    GTE = 0x16, op, [];
    NOTE = 0x17, op, [];
    EQUALE = 0x18, op, [];
    ASSIGN = 0x19, op, [];
    PLUSA = 0x1A, op, [];
    MINUSA = 0x1B, op, [];
    MULA = 0x1C, op, [];
    DIVA = 0x1D, op, [];
    MODA = 0x1E, op, [];
    ANDA = 0x1F, op, [];
    ORA = 0x20, op, [];
    XORA = 0x21, op, [];
    LSHIFTA = 0x22, op, [];
    RSHIFTA = 0x23, op, [];
    F_ASSIGN = 0x24, op, [];
    F_PLUSA = 0x25, op, [];
    F_MINUSA = 0x26, op, [];
    F_MULA = 0x27, op, [];
    F_DIVA = 0x28, op, [];
    DUP2 = 0x29, op, [];
    DUP_X2 = 0x2A, op, [];
    CMP = 0x2B, op, [];
    JUMP = 0x2C, jmp, [Addr];
    IFZ = 0x2D, jmp, [Addr];
    IFNZ = 0x2E, jmp, [Addr];
    RETURN = 0x2F, jmp, [];
    CALLFUNC = 0x30, jmp, [Func];
    INC = 0x31, op, [];
    DEC = 0x32, op, [];
    FTOI = 0x33, op, [];
    ITOF = 0x34, op, [];
    F_INV = 0x35, op, [];
    F_ADD = 0x36, op, [];
    F_SUB = 0x37, op, [];
    F_MUL = 0x38, op, [];
    F_DIV = 0x39, op, [];
    F_LT = 0x3A, op, [];
    F_GT = 0x3B, op, [];
    F_LTE = 0x3C, op, [];
    F_GTE = 0x3D, op, [];
    F_NOTE = 0x3E, op, [];
    F_EQUALE = 0x3F, op, [];
    F_PUSH = 0x40, op, [Float];
    S_PUSH = 0x41, op, [String];
    S_POP = 0x42, op, [];
    S_ADD = 0x43, op, [];
    S_ASSIGN = 0x44, op, [];
    S_PLUSA = 0x45, op, [];
    S_REF = 0x46, op, [];
    S_REFREF = 0x47, op, [];
    S_NOTE = 0x48, op, [];
    S_EQUALE = 0x49, op, [];
    SF_CREATE = 0x4A, op, [];
    SF_CREATEPIXEL = 0x4B, op, [];
    SF_CREATEALPHA = 0x4C, op, [];
    SR_POP = 0x4D, op, [];
    SR_ASSIGN = 0x4E, op, [];
    SR_REF = 0x4F, op, [Struct];
    SR_REFREF = 0x50, op, [];
    A_ALLOC = 0x51, op, [];
    A_REALLOC = 0x52, op, [];
    A_FREE = 0x53, op, [];
    A_NUMOF = 0x54, op, [];
    A_COPY = 0x55, op, [];
    A_FILL = 0x56, op, [];
    C_REF = 0x57, op, [];
    C_ASSIGN = 0x58, op, [];
    MSG = 0x59, jmp, [Msg];
    CALLHLL = 0x5A, op, [Lib, HllFunc];
    PUSHSTRUCTPAGE = 0x5B, op, [];
    CALLMETHOD = 0x5C, jmp, [Func];
    SH_GLOBALREF = 0x5D, op, [Global];
    SH_LOCALREF = 0x5E, op, [Local];
    SWITCH = 0x5F, jmp, [Int];
    STRSWITCH = 0x60, jmp, [Int];
    FUNC = 0x61, op, [Func];
    _EOF = 0x62, op, [File];
    CALLSYS = 0x63, op, [Syscall];
    SJUMP = 0x64, jmp, [];
    CALLONJUMP = 0x65, op, [];
    SWAP = 0x66, op, [];
    SH_STRUCTREF = 0x67, op, [Int];
    S_LENGTH = 0x68, op, [];
    S_LENGTHBYTE = 0x69, op, [];
    I_STRING = 0x6A, op, [];
    CALLFUNC2 = 0x6B, jmp, [];
    DUP2_X1 = 0x6C, op, [];
    R_ASSIGN = 0x6D, op, [];
    FT_ASSIGNS = 0x6E, op, [];
    ASSERT = 0x6F, op, [];
    S_LT = 0x70, op, [];
    S_GT = 0x71, op, [];
    S_LTE = 0x72, op, [];
    S_GTE = 0x73, op, [];
    S_LENGTH2 = 0x74, op, [];
    S_LENGTHBYTE2 = 0x75, op, [];
    NEW = 0x76, op, [];
    DELETE = 0x77, op, [];
    CHECKUDO = 0x78, op, [];
    A_REF = 0x79, op, [];
    DUP = 0x7A, op, [];
    DUP_U2 = 0x7B, op, [];
    SP_INC = 0x7C, op, [];
    SP_DEC = 0x7D, op, [];
    ENDFUNC = 0x7E, op, [Func];
    R_EQUALE = 0x7F, op, [];
    R_NOTE = 0x80, op, [];
    SH_LOCALCREATE = 0x81, op, [Local, Struct];
    SH_LOCALDELETE = 0x82, op, [Local];
    STOI = 0x83, op, [];
    A_PUSHBACK = 0x84, op, [];
    A_POPBACK = 0x85, op, [];
    S_EMPTY = 0x86, op, [];
    A_EMPTY = 0x87, op, [];
    A_ERASE = 0x88, op, [];
    A_INSERT = 0x89, op, [];
    SH_LOCALINC = 0x8A, op, [Local];
    SH_LOCALDEC = 0x8B, op, [Local];
    SH_LOCALASSIGN = 0x8C, op, [Local, Int];
    ITOB = 0x8D, op, [];
    S_FIND = 0x8E, op, [];
    S_GETPART = 0x8F, op, [];
    A_SORT = 0x90, op, [];
    S_PUSHBACK = 0x91, op, [];
    S_POPBACK = 0x92, op, [];
    FTOS = 0x93, op, [];
    S_MOD = 0x94, op, [];
    S_PLUSA2 = 0x95, op, [];
    OBJSWAP = 0x96, op, [];
    S_ERASE = 0x97, op, [];
    SR_REF2 = 0x98, op, [];
    S_ERASE2 = 0x99, op, [];
    S_PUSHBACK2 = 0x9A, op, [];
    S_POPBACK2 = 0x9B, op, [];
    ITOLI = 0x9C, op, [];
    LI_ADD = 0x9D, op, [];
    LI_SUB = 0x9E, op, [];
    LI_MUL = 0x9F, op, [];
    LI_DIV = 0xA0, op, [];
    LI_MOD = 0xA1, op, [];
    LI_ASSIGN = 0xA2, op, [];
    LI_PLUSA = 0xA3, op, [];
    LI_MINUSA = 0xA4, op, [];
    LI_MULA = 0xA5, op, [];
    LI_DIVA = 0xA6, op, [];
    LI_MODA = 0xA7, op, [];
    LI_ANDA = 0xA8, op, [];
    LI_ORA = 0xA9, op, [];
    LI_XORA = 0xAA, op, [];
    LI_LSHIFTA = 0xAB, op, [];
    LI_RSHIFTA = 0xAC, op, [];
    LI_INC = 0xAD, op, [];
    LI_DEC = 0xAE, op, [];
    A_FIND = 0xAF, op, [];
    A_REVERSE = 0xB0, op, [];
    SH_SR_ASSIGN = 0xB1, op, [];
    SH_MEM_ASSIGN_LOCAL = 0xB2, op, [];
    A_NUMOF_GLOB_1 = 0xB3, op, [];
    A_NUMOF_STRUCT_1 = 0xB4, op, [];
    SH_MEM_ASSIGN_IMM = 0xB5, op, [];
    SH_LOCALREFREF = 0xB6, op, [];
    SH_LOCALASSIGN_SUB_IMM = 0xB7, op, [];
    SH_IF_LOC_LT_IMM = 0xB8, op, [];
    SH_IF_LOC_GE_IMM = 0xB9, op, [];
    SH_LOCREF_ASSIGN_MEM = 0xBA, op, [];
    PAGE_REF = 0xBB, op, [];
    SH_GLOBAL_ASSIGN_LOCAL = 0xBC, op, [];
    SH_STRUCTREF_GT_IMM = 0xBD, op, [];
    SH_STRUCT_ASSIGN_LOCALREF_ITOB = 0xBE, op, [];
    SH_LOCAL_ASSIGN_STRUCTREF = 0xBF, op, [];
    SH_IF_STRUCTREF_NE_LOCALREF = 0xC0, op, [];
    SH_IF_STRUCTREF_GT_IMM = 0xC1, op, [];
    SH_STRUCTREF_CALLMETHOD_NO_PARAM = 0xC2, op, [];
    SH_STRUCTREF2 = 0xC3, op, [];
    SH_REF_STRUCTREF2 = 0xC4, op, [];
    SH_STRUCTREF3 = 0xC5, op, [];
    SH_STRUCTREF2_CALLMETHOD_NO_PARAM = 0xC6, op, [];
    SH_IF_STRUCTREF_Z = 0xC7, op, [];
    SH_IF_STRUCT_A_NOT_EMPTY = 0xC8, op, [];
    SH_IF_LOC_GT_IMM = 0xC9, op, [];
    SH_IF_STRUCTREF_NE_IMM = 0xCA, op, [];
    THISCALLMETHOD_NOPARAM = 0xCB, op, [];
    SH_IF_LOC_NE_IMM = 0xCC, op, [];
    SH_IF_STRUCTREF_EQ_IMM = 0xCD, op, [];
    SH_GLOBAL_ASSIGN_IMM = 0xCE, op, [];
    SH_LOCALSTRUCT_ASSIGN_IMM = 0xCF, op, [];
    SH_STRUCT_A_PUSHBACK_LOCAL_STRUCT = 0xD0, op, [];
    SH_GLOBAL_A_PUSHBACK_LOCAL_STRUCT = 0xD1, op, [];
    SH_LOCAL_A_PUSHBACK_LOCAL_STRUCT = 0xD2, op, [];
    SH_IF_SREF_NE_STR0 = 0xD3, op, [];
    SH_S_ASSIGN_REF = 0xD4, op, [];
    SH_A_FIND_SREF = 0xD5, op, [];
    SH_SREF_EMPTY = 0xD6, op, [];
    SH_STRUCTSREF_EQ_LOCALSREF = 0xD7, op, [];
    SH_LOCALSREF_EQ_STR0 = 0xD8, op, [];
    SH_STRUCTSREF_NE_LOCALSREF = 0xD9, op, [];
    SH_LOCALSREF_NE_STR0 = 0xDA, op, [];
    SH_STRUCT_SR_REF = 0xDB, op, [];
    SH_STRUCT_S_REF = 0xDC, op, [];
    S_REF2 = 0xDD, op, [];
    SH_REF_LOCAL_ASSIGN_STRUCTREF2 = 0xDE, op, [];
    SH_GLOBAL_S_REF = 0xDF, op, [];
    SH_LOCAL_S_REF = 0xE0, op, [];
    SH_LOCALREF_SASSIGN_LOCALSREF = 0xE1, op, [];
    SH_LOCAL_APUSHBACK_LOCALSREF = 0xE2, op, [];
    SH_S_ASSIGN_CALLSYS19 = 0xE3, op, [];
    SH_S_ASSIGN_STR0 = 0xE4, op, [];
    SH_SASSIGN_LOCALSREF = 0xE5, op, [];
    SH_STRUCTREF_SASSIGN_LOCALSREF = 0xE6, op, [];
    SH_LOCALSREF_EMPTY = 0xE7, op, [];
    SH_GLOBAL_APUSHBACK_LOCALSREF = 0xE8, op, [];
    SH_STRUCT_APUSHBACK_LOCALSREF = 0xE9, op, [];
    SH_STRUCTSREF_EMPTY = 0xEA, op, [];
    SH_GLOBALSREF_EMPTY = 0xEB, op, [];
    SH_SASSIGN_STRUCTSREF = 0xEC, op, [];
    SH_SASSIGN_GLOBALSREF = 0xED, op, [];
    SH_STRUCTSREF_NE_STR0 = 0xEE, op, [];
    SH_GLOBALSREF_NE_STR0 = 0xEF, op, [];
    SH_LOC_LT_IMM_OR_LOC_GE_IMM = 0xF0, op, [];
    A_SORT_MEM = 0xF1, op, [];
    DG_ADD = 0xF2, op, [];
    DG_SET = 0xF3, op, [];
    DG_CALL = 0xF4, op, [];
    DG_NUMOF = 0xF5, op, [];
    DG_EXIST = 0xF6, op, [];
    DG_ERASE = 0xF7, op, [];
    DG_CLEAR = 0xF8, op, [];
    DG_COPY = 0xF9, op, [];
    DG_ASSIGN = 0xFA, op, [];
    DG_PLUSA = 0xFB, op, [];
    DG_POP = 0xFC, op, [];
    DG_NEW_FROM_METHOD = 0xFD, op, [];
    DG_MINUSA = 0xFE, op, [];
    DG_CALLBEGIN = 0xFF, op, [];
    DG_NEW = 0x100, op, [];
    DG_STR_TO_METHOD = 0x101, op, [];
    OP_0x102 = 0x102, op, [];
    OP_0x103 = 0x103, op, [];
    OP_0x104 = 0x104, op, [];
    OP_0x105 = 0x105, op, [];
}

pub const NR_OPCODES: u16 = 0x106;

impl Opcode {
    /// Argument count for an image of the given version. Images newer than
    /// version 8 widen a handful of instructions.
    pub fn nr_args(self, version: u32) -> usize {
        if version > 8 {
            match self {
                Opcode::CALLHLL => return 3,
                Opcode::S_MOD | Opcode::OBJSWAP | Opcode::DG_STR_TO_METHOD => return 1,
                _ => {}
            }
        }
        self.args().len()
    }

    /// Full encoded width: 2-byte opcode plus 4 bytes per argument.
    pub fn width(self, version: u32) -> usize {
        2 + 4 * self.nr_args(version)
    }

    /// Whether the interpreter executes this opcode. Unimplemented opcodes
    /// still occupy their table slot (the encoding is fixed) but trap when
    /// reached; `--audit` lists them.
    pub fn implemented(self) -> bool {
        use Opcode::*;
        if self as u16 >= SH_SR_ASSIGN as u16 {
            // fused variable shortcuts, delegates and reserved codes
            return false;
        }
        !matches!(
            self,
            CMP | S_REFREF
                | SF_CREATE
                | SF_CREATEPIXEL
                | SF_CREATEALPHA
                | SR_REFREF
                | FT_ASSIGNS
                | CHECKUDO
                | SP_DEC
                | ENDFUNC
                | _EOF
                | R_EQUALE
                | R_NOTE
                | S_PUSHBACK
                | S_POPBACK
                | OBJSWAP
                | S_ERASE
                | SR_REF2
        )
    }
}

// Built-in system call codes.
pub const SYS_EXIT: i32 = 0x00;
pub const SYS_LOCK_PEEK: i32 = 0x03;
pub const SYS_UNLOCK_PEEK: i32 = 0x04;
pub const SYS_OUTPUT: i32 = 0x06;
pub const SYS_GET_SAVE_FOLDER_NAME: i32 = 0x0C;
pub const SYS_GET_TIME: i32 = 0x0D;
pub const SYS_PEEK: i32 = 0x14;
pub const SYS_SLEEP: i32 = 0x15;

#[derive(Debug, Clone, Copy)]
pub struct SyscallInfo {
    pub name: &'static str,
    pub implemented: bool,
}

pub static SYSCALLS: [SyscallInfo; 0x1D] = [
    SyscallInfo { name: "Exit", implemented: true },
    SyscallInfo { name: "GlobalSave", implemented: false },
    SyscallInfo { name: "GlobalLoad", implemented: false },
    SyscallInfo { name: "LockPeek", implemented: true },
    SyscallInfo { name: "UnlockPeek", implemented: true },
    SyscallInfo { name: "Reset", implemented: false },
    SyscallInfo { name: "Output", implemented: true },
    SyscallInfo { name: "MsgBox", implemented: false },
    SyscallInfo { name: "ResumeSave", implemented: false },
    SyscallInfo { name: "ResumeLoad", implemented: false },
    SyscallInfo { name: "ExistsFile", implemented: false },
    SyscallInfo { name: "OpenWeb", implemented: false },
    SyscallInfo { name: "GetSaveFolderName", implemented: true },
    SyscallInfo { name: "GetTime", implemented: true },
    SyscallInfo { name: "GetGameName", implemented: false },
    SyscallInfo { name: "Error", implemented: false },
    SyscallInfo { name: "ExistsSaveFile", implemented: false },
    SyscallInfo { name: "IsDebugMode", implemented: false },
    SyscallInfo { name: "MsgBoxOkCancel", implemented: false },
    SyscallInfo { name: "GetFuncStackName", implemented: false },
    SyscallInfo { name: "Peek", implemented: true },
    SyscallInfo { name: "Sleep", implemented: true },
    SyscallInfo { name: "ResumeWriteComment", implemented: false },
    SyscallInfo { name: "ResumeReadComment", implemented: false },
    SyscallInfo { name: "GroupSave", implemented: false },
    SyscallInfo { name: "GroupLoad", implemented: false },
    SyscallInfo { name: "DeleteSaveFile", implemented: false },
    SyscallInfo { name: "ExistFunc", implemented: false },
    SyscallInfo { name: "CopySaveFile", implemented: false },
];
