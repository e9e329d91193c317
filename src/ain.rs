//! The AIN program image: container detection, tag walk, and the resulting
//! immutable [`Ain`].
//!
//! On disk an image is either zlib-compressed behind an `AI2` header or
//! XOR-obfuscated (see [`crate::obfuscate`]). The decrypted payload is a
//! sequence of records, each introduced by a 4-byte ASCII tag; unknown tags
//! terminate the walk so that forward-compatible images still load.

use std::io::{BufRead, Cursor, Read};
use std::path::Path;
use std::rc::Rc;

use log::debug;
use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::ain_reader::{AinBufRead, AinRead};
use crate::obfuscate;
use crate::vm_string::VmString;

#[derive(Debug, Error)]
pub enum AinError {
    #[error("Error opening AIN file")]
    File(#[source] std::io::Error),
    #[error("Unrecognized or invalid AIN format")]
    UnrecognizedFormat,
    #[error("AIN decompression failed")]
    Decompress,
    #[error("Truncated AIN file")]
    Truncated,
    #[error("Invalid AIN file: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for AinError {
    fn from(e: std::io::Error) -> AinError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            AinError::Truncated
        } else {
            AinError::File(e)
        }
    }
}

type Result<T> = std::result::Result<T, AinError>;

/// A shift-JIS name from the image. Kept as raw bytes; rendered lossily for
/// diagnostics only.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct AinString(Vec<u8>);

impl AinString {
    pub fn new(data: Vec<u8>) -> Self {
        AinString(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_utf8_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl std::fmt::Display for AinString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_utf8_lossy().fmt(f)
    }
}

impl std::fmt::Debug for AinString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_utf8_lossy())
    }
}


/// The fixed type enumeration used by variables, members, globals and
/// library declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(i32)]
pub enum DataType {
    Void = 0,
    Int = 10,
    Float = 11,
    String = 12,
    Struct = 13,
    ArrayInt = 14,
    ArrayFloat = 15,
    ArrayString = 16,
    ArrayStruct = 17,
    RefInt = 18,
    RefFloat = 19,
    RefString = 20,
    RefStruct = 21,
    RefArrayInt = 22,
    RefArrayFloat = 23,
    RefArrayString = 24,
    RefArrayStruct = 25,
    ImainSystem = 26,
    FuncType = 27,
    ArrayFuncType = 30,
    RefFuncType = 31,
    RefArrayFuncType = 32,
    Bool = 47,
    ArrayBool = 50,
    RefBool = 51,
    RefArrayBool = 52,
    LongInt = 55,
    ArrayLongInt = 58,
    RefLongInt = 59,
    RefArrayLongInt = 60,
    Delegate = 63,
    ArrayDelegate = 66,
    RefArrayDelegate = 69,
    // opaque types from newer images, carried but never interpreted
    Type67 = 67,
    Type74 = 74,
    Type75 = 75,
    Array = 79,
    RefArray = 80,
    Type82 = 82,
    Type86 = 86,
    Type89 = 89,
    Type92 = 92,
    Type93 = 93,
    Type95 = 95,
}

impl DataType {
    pub fn is_ref(self) -> bool {
        use DataType::*;
        matches!(
            self,
            RefInt
                | RefFloat
                | RefString
                | RefStruct
                | RefArrayInt
                | RefArrayFloat
                | RefArrayString
                | RefArrayStruct
                | RefFuncType
                | RefArrayFuncType
                | RefBool
                | RefArrayBool
                | RefLongInt
                | RefArrayLongInt
                | RefArrayDelegate
                | RefArray
        )
    }

    pub fn is_array(self) -> bool {
        use DataType::*;
        matches!(
            self,
            ArrayInt
                | ArrayFloat
                | ArrayString
                | ArrayStruct
                | ArrayFuncType
                | ArrayBool
                | ArrayLongInt
                | ArrayDelegate
                | Array
        )
    }

    /// Element type of an array type; `Void` when not an array.
    pub fn element(self) -> DataType {
        use DataType::*;
        match self {
            ArrayInt => Int,
            ArrayFloat => Float,
            ArrayString => String,
            ArrayStruct => Struct,
            ArrayFuncType => FuncType,
            ArrayBool => Bool,
            ArrayLongInt => LongInt,
            ArrayDelegate => Delegate,
            _ => Void,
        }
    }

    fn uses_struct_type(self) -> bool {
        use DataType::*;
        matches!(self, Struct | RefStruct | ArrayStruct | RefArrayStruct)
    }
}

/// Literal initial value attached to a variable or global.
#[derive(Debug, Clone, PartialEq)]
pub enum InitValue {
    Int(i32),
    String(AinString),
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: AinString,
    pub data_type: DataType,
    pub struct_type: i32,
    pub array_rank: i32,
    pub initval: Option<InitValue>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub address: u32,
    pub name: AinString,
    pub is_label: bool,
    pub data_type: DataType,
    pub struct_type: i32,
    pub is_lambda: bool,
    pub nr_args: usize,
    pub crc: i32,
    pub vars: Vec<Variable>,
}

impl Function {
    pub fn nr_vars(&self) -> usize {
        self.vars.len()
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub var: Variable,
    pub group_index: i32,
}

#[derive(Debug, Clone)]
pub struct GlobalInitVal {
    pub global_index: i32,
    pub data_type: DataType,
    pub value: InitValue,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub struct_type: i32,
    pub uk: i32,
}

#[derive(Debug, Clone)]
pub struct Struct {
    pub name: AinString,
    pub interfaces: Vec<Interface>,
    pub constructor: i32,
    pub destructor: i32,
    pub members: Vec<Variable>,
}

#[derive(Debug, Clone)]
pub struct HllArgument {
    pub name: AinString,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub struct HllFunction {
    pub name: AinString,
    pub data_type: DataType,
    pub arguments: Vec<HllArgument>,
}

#[derive(Debug, Clone)]
pub struct Library {
    pub name: AinString,
    pub functions: Vec<HllFunction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum SwitchKind {
    Int = 2,
    String = 4,
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchCase {
    pub value: i32,
    pub address: u32,
}

#[derive(Debug, Clone)]
pub struct Switch {
    pub case_kind: SwitchKind,
    pub default_address: i32,
    pub cases: Vec<SwitchCase>,
}

#[derive(Debug, Clone)]
pub struct FunctionType {
    pub name: AinString,
    pub data_type: DataType,
    pub struct_type: i32,
    pub nr_arguments: usize,
    pub variables: Vec<Variable>,
}

/// The parsed program image. Loaded once, never mutated.
#[derive(Default, Debug)]
pub struct Ain {
    pub version: u32,
    pub keycode: i32,
    pub game_version: i32,
    pub code: Vec<u8>,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub global_initvals: Vec<GlobalInitVal>,
    pub structures: Vec<Struct>,
    pub messages: Vec<Rc<VmString>>,
    pub strings: Vec<Rc<VmString>>,
    pub libraries: Vec<Library>,
    pub switches: Vec<Switch>,
    pub function_types: Vec<FunctionType>,
    pub delegates: Vec<FunctionType>,
    pub filenames: Vec<AinString>,
    pub global_group_names: Vec<AinString>,
    pub enums: Vec<AinString>,
    pub main: Option<usize>,
    pub msgf: Option<usize>,
    pub ojmp: Option<usize>,
    /// Index of the function named "0", run before main to allocate global
    /// arrays.
    pub alloc: Option<usize>,
    /// Unknown leading words of MSG1/FNCT/DELG, stored verbatim.
    pub msg1_uk: i32,
    pub fnct_uk: i32,
    pub delg_uk: i32,
}

impl Ain {
    pub fn open(path: &Path) -> Result<Ain> {
        let buf = std::fs::read(path).map_err(AinError::File)?;
        Ain::load(buf)
    }

    /// Detect the container, undo compression or obfuscation, and parse.
    pub fn load(mut buf: Vec<u8>) -> Result<Ain> {
        if buf.len() >= 8 && &buf[..8] == b"AI2\0\0\0\0\0" {
            buf = decompress(&buf)?;
        } else if obfuscate::is_obfuscated(&buf) {
            obfuscate::crypt(&mut buf);
        } else {
            return Err(AinError::UnrecognizedFormat);
        }

        let ain = parse(&buf)?;
        ain.validate()?;
        Ok(ain)
    }

    pub fn get_function_by_name(&self, name: &[u8]) -> Option<usize> {
        self.functions.iter().position(|f| f.name.as_bytes() == name)
    }

    fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(AinError::Invalid("missing VERS record".to_string()));
        }
        for (i, f) in self.functions.iter().enumerate() {
            if f.address as usize >= self.code.len() {
                return Err(AinError::Invalid(format!(
                    "function {i} address {:#x} outside code section",
                    f.address
                )));
            }
            self.validate_variables(&f.vars)?;
        }
        for g in &self.globals {
            self.validate_variable(&g.var)?;
        }
        for s in &self.structures {
            self.validate_variables(&s.members)?;
        }
        for (i, sw) in self.switches.iter().enumerate() {
            if sw.default_address > 0 && sw.default_address as usize >= self.code.len() {
                return Err(AinError::Invalid(format!(
                    "switch {i} default address outside code section"
                )));
            }
            for c in &sw.cases {
                if c.address as usize >= self.code.len() {
                    return Err(AinError::Invalid(format!(
                        "switch {i} case address {:#x} outside code section",
                        c.address
                    )));
                }
            }
        }
        for v in &self.global_initvals {
            if v.global_index < 0 || v.global_index as usize >= self.globals.len() {
                return Err(AinError::Invalid(format!(
                    "initval for out-of-range global {}",
                    v.global_index
                )));
            }
        }
        Ok(())
    }

    fn validate_variables(&self, vars: &[Variable]) -> Result<()> {
        for v in vars {
            self.validate_variable(v)?;
        }
        Ok(())
    }

    fn validate_variable(&self, v: &Variable) -> Result<()> {
        if v.data_type.uses_struct_type()
            && (v.struct_type < 0 || v.struct_type as usize >= self.structures.len())
        {
            return Err(AinError::Invalid(format!(
                "variable {} has invalid struct type {}",
                v.name, v.struct_type
            )));
        }
        Ok(())
    }
}

fn decompress(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 16 {
        return Err(AinError::Truncated);
    }
    let [out_len, in_len]: [i32; 2] =
        bincode::deserialize(&buf[8..16]).map_err(|_| AinError::Truncated)?;
    if out_len < 0 || in_len < 0 {
        return Err(AinError::Invalid("negative size in AI2 header".to_string()));
    }
    let end = 16usize
        .checked_add(in_len as usize)
        .filter(|&e| e <= buf.len())
        .ok_or(AinError::Truncated)?;

    let mut out = Vec::with_capacity(out_len as usize);
    let mut decoder = flate2::read::ZlibDecoder::new(&buf[16..end]);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| AinError::Decompress)?;
    if out.len() != out_len as usize {
        return Err(AinError::Decompress);
    }
    Ok(out)
}

fn data_type(raw: i32) -> Result<DataType> {
    DataType::try_from(raw).map_err(|_| AinError::Invalid(format!("unknown data type {raw}")))
}

fn parse(data: &[u8]) -> Result<Ain> {
    let mut r = Cursor::new(data);
    let mut ain = Ain::default();
    while let Some(tag) = r.read_tag()? {
        if !read_record(&mut r, &tag, &mut ain)? {
            debug!(
                "stopping at unknown tag {:?}",
                String::from_utf8_lossy(&tag)
            );
            break;
        }
    }
    Ok(ain)
}

// One tag record. Returns false on an unknown tag.
fn read_record<R: BufRead>(r: &mut R, tag: &[u8; 4], ain: &mut Ain) -> Result<bool> {
    match tag {
        b"VERS" => ain.version = r.read_i32()? as u32,
        b"KEYC" => ain.keycode = r.read_i32()?,
        b"CODE" => {
            let size = r.read_i32()?;
            if size < 0 {
                return Err(AinError::Invalid("negative CODE size".to_string()));
            }
            ain.code = r.read_bytes(size as usize)?;
        }
        b"FUNC" => {
            let count = read_count(r)?;
            for i in 0..count {
                let f = read_function(r, ain.version)?;
                if f.name.as_bytes() == b"0" {
                    ain.alloc = Some(i);
                }
                ain.functions.push(f);
            }
        }
        b"GLOB" => {
            let mut count = read_count(r)?;
            // the count is short by one from version 12 on
            if ain.version >= 12 {
                count += 1;
            }
            for _ in 0..count {
                ain.globals.push(read_global(r, ain.version)?);
            }
        }
        b"GSET" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.global_initvals.push(read_initval(r)?);
            }
        }
        b"STRT" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.structures.push(read_structure(r, ain.version)?);
            }
        }
        b"MSG0" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.messages.push(Rc::new(read_vm_string(r)?));
            }
        }
        b"MSG1" => {
            let count = read_count(r)?;
            ain.msg1_uk = r.read_i32()?;
            for _ in 0..count {
                ain.messages.push(Rc::new(read_msg1_string(r)?));
            }
        }
        b"MAIN" => ain.main = read_function_index(r)?,
        b"MSGF" => ain.msgf = read_function_index(r)?,
        b"HLL0" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.libraries.push(read_library(r)?);
            }
        }
        b"SWI0" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.switches.push(read_switch(r)?);
            }
        }
        b"GVER" => ain.game_version = r.read_i32()?,
        b"STR0" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.strings.push(Rc::new(read_vm_string(r)?));
            }
        }
        b"FNAM" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.filenames.push(read_name(r)?);
            }
        }
        b"OJMP" => ain.ojmp = read_function_index(r)?,
        b"FNCT" => {
            ain.fnct_uk = r.read_i32()?;
            let count = read_count(r)?;
            for _ in 0..count {
                ain.function_types.push(read_function_type(r, ain.version)?);
            }
        }
        b"DELG" => {
            ain.delg_uk = r.read_i32()?;
            let count = read_count(r)?;
            for _ in 0..count {
                ain.delegates.push(read_function_type(r, ain.version)?);
            }
        }
        b"OBJG" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.global_group_names.push(read_name(r)?);
            }
        }
        b"ENUM" => {
            let count = read_count(r)?;
            for _ in 0..count {
                ain.enums.push(read_name(r)?);
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn read_count<R: BufRead>(r: &mut R) -> Result<usize> {
    let n = r.read_i32()?;
    if n < 0 {
        return Err(AinError::Invalid(format!("negative record count {n}")));
    }
    Ok(n as usize)
}

fn read_function_index<R: BufRead>(r: &mut R) -> Result<Option<usize>> {
    let n = r.read_i32()?;
    Ok((n >= 0).then_some(n as usize))
}

fn read_name<R: BufRead>(r: &mut R) -> Result<AinString> {
    Ok(AinString::new(r.read_c_string_raw()?))
}

fn read_vm_string<R: BufRead>(r: &mut R) -> Result<VmString> {
    Ok(VmString::new(r.read_c_string_raw()?))
}

// MSG1 strings are length-prefixed and additionally scrambled.
fn read_msg1_string<R: BufRead>(r: &mut R) -> Result<VmString> {
    let len = read_count(r)?;
    let mut bytes = r.read_bytes(len)?;
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = b.wrapping_sub(i as u8).wrapping_sub(0x60);
    }
    Ok(VmString::new(bytes))
}

fn read_variable<R: BufRead>(r: &mut R, version: u32) -> Result<Variable> {
    let name = read_name(r)?;
    if version >= 12 {
        let _name2 = read_name(r)?; // duplicate of name
    }
    let data_type = data_type(r.read_i32()?)?;
    let struct_type = r.read_i32()?;
    let array_rank = r.read_i32()?;
    let mut initval = None;
    if version >= 8 {
        // nested array element descriptors for the generic array types
        let raw = data_type as i32;
        if raw == 79 || raw == 80 || raw == 82 {
            let inner = r.read_i32()?;
            let _struct_type = r.read_i32()?;
            let _rank = r.read_i32()?;
            if inner == 79 {
                let _ = r.read_i32()?;
                let _ = r.read_i32()?;
                let _ = r.read_i32()?;
            }
        }
        let has_initval = r.read_i32()?;
        if has_initval != 0 && has_initval != 1 {
            return Err(AinError::Invalid(format!(
                "non-boolean initval flag {has_initval}"
            )));
        }
        if has_initval == 1 {
            initval = match data_type {
                DataType::String => Some(InitValue::String(read_name(r)?)),
                DataType::Delegate => None,
                t if t.is_ref() => None,
                _ => Some(InitValue::Int(r.read_i32()?)),
            };
        }
    }
    Ok(Variable { name, data_type, struct_type, array_rank, initval })
}

fn read_variables<R: BufRead>(r: &mut R, count: usize, version: u32) -> Result<Vec<Variable>> {
    (0..count).map(|_| read_variable(r, version)).collect()
}

fn read_function<R: BufRead>(r: &mut R, version: u32) -> Result<Function> {
    let address = r.read_i32()? as u32;
    let name = read_name(r)?;
    let is_label = if version > 0 && version < 7 {
        r.read_i32()? != 0
    } else {
        false
    };
    let data_type = data_type(r.read_i32()?)?;
    let struct_type = r.read_i32()?;
    if version >= 11 {
        // optional descriptor for generic-array return types
        let exists = r.read_i32()?;
        if exists == 1 {
            let _ = r.read_i32()?;
            let _ = r.read_i32()?;
            let _ = r.read_i32()?;
        } else if exists != 0 {
            return Err(AinError::Invalid(format!(
                "non-boolean return descriptor flag {exists}"
            )));
        }
    }
    let nr_args = read_count(r)?;
    let nr_vars = read_count(r)?;
    let is_lambda = if version >= 11 { r.read_i32()? != 0 } else { false };
    let crc = if version > 0 { r.read_i32()? } else { 0 };
    let vars = read_variables(r, nr_vars, version)?;
    if nr_args > vars.len() {
        return Err(AinError::Invalid(format!(
            "function {name} declares {nr_args} args but {} vars",
            vars.len()
        )));
    }
    Ok(Function {
        address,
        name,
        is_label,
        data_type,
        struct_type,
        is_lambda,
        nr_args,
        crc,
        vars,
    })
}

// Globals have their own record shape: an element descriptor only for the
// generic array type, and no inline initial value (GSET supplies those).
fn read_global<R: BufRead>(r: &mut R, version: u32) -> Result<Global> {
    let name = read_name(r)?;
    if version >= 12 {
        let _name2 = read_name(r)?; // duplicate of name
    }
    let data_type = data_type(r.read_i32()?)?;
    let struct_type = r.read_i32()?;
    let array_rank = r.read_i32()?;
    if data_type == DataType::Array {
        let _elem_type = r.read_i32()?;
        let _elem_struct_type = r.read_i32()?;
        let _elem_rank = r.read_i32()?;
    }
    let group_index = if version >= 5 { r.read_i32()? } else { 0 };
    Ok(Global {
        var: Variable { name, data_type, struct_type, array_rank, initval: None },
        group_index,
    })
}

fn read_initval<R: BufRead>(r: &mut R) -> Result<GlobalInitVal> {
    let global_index = r.read_i32()?;
    let data_type = data_type(r.read_i32()?)?;
    let value = if data_type == DataType::String {
        InitValue::String(read_name(r)?)
    } else {
        InitValue::Int(r.read_i32()?)
    };
    Ok(GlobalInitVal { global_index, data_type, value })
}

fn read_structure<R: BufRead>(r: &mut R, version: u32) -> Result<Struct> {
    let name = read_name(r)?;
    let mut interfaces = vec![];
    if version >= 11 {
        let count = read_count(r)?;
        for _ in 0..count {
            interfaces.push(Interface { struct_type: r.read_i32()?, uk: r.read_i32()? });
        }
    }
    let constructor = r.read_i32()?;
    let destructor = r.read_i32()?;
    let nr_members = read_count(r)?;
    let members = read_variables(r, nr_members, version)?;
    Ok(Struct { name, interfaces, constructor, destructor, members })
}

fn read_library<R: BufRead>(r: &mut R) -> Result<Library> {
    let name = read_name(r)?;
    let nr_functions = read_count(r)?;
    let mut functions = Vec::with_capacity(nr_functions);
    for _ in 0..nr_functions {
        let name = read_name(r)?;
        let dt = data_type(r.read_i32()?)?;
        let nr_arguments = read_count(r)?;
        let mut arguments = Vec::with_capacity(nr_arguments);
        for _ in 0..nr_arguments {
            arguments.push(HllArgument {
                name: read_name(r)?,
                data_type: data_type(r.read_i32()?)?,
            });
        }
        functions.push(HllFunction { name, data_type: dt, arguments });
    }
    Ok(Library { name, functions })
}

fn read_switch<R: BufRead>(r: &mut R) -> Result<Switch> {
    let raw_kind = r.read_i32()?;
    let case_kind = SwitchKind::try_from(raw_kind)
        .map_err(|_| AinError::Invalid(format!("unknown switch case kind {raw_kind}")))?;
    let default_address = r.read_i32()?;
    let nr_cases = read_count(r)?;
    let mut cases = Vec::with_capacity(nr_cases);
    for _ in 0..nr_cases {
        cases.push(SwitchCase { value: r.read_i32()?, address: r.read_i32()? as u32 });
    }
    Ok(Switch { case_kind, default_address, cases })
}

fn read_function_type<R: BufRead>(r: &mut R, version: u32) -> Result<FunctionType> {
    let name = read_name(r)?;
    let data_type = data_type(r.read_i32()?)?;
    let struct_type = r.read_i32()?;
    if version >= 11 {
        let exists = r.read_i32()?;
        if exists == 1 {
            let _ = r.read_i32()?;
            let _ = r.read_i32()?;
            let _ = r.read_i32()?;
        } else if exists != 0 {
            return Err(AinError::Invalid(format!(
                "non-boolean return descriptor flag {exists}"
            )));
        }
    }
    let nr_arguments = read_count(r)?;
    let nr_variables = read_count(r)?;
    let variables = read_variables(r, nr_variables, version)?;
    Ok(FunctionType { name, data_type, struct_type, nr_arguments, variables })
}
