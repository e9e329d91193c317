use rstest::rstest;

use std::rc::Rc;

use crate::ain::{Ain, AinError, DataType};
use crate::config::Config;
use crate::heap::Heap;
use crate::instructions::Opcode;
use crate::page::{self, Value};
use crate::vm::{Vm, VmError};
use crate::vm_string::{self, FormatArg, VmString};
use crate::{audit, hll, obfuscate};

// --- builders ---

/// Assembles code sections: 2-byte opcode, 4-byte little-endian arguments.
#[derive(Default)]
struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    fn addr(&self) -> i32 {
        self.buf.len() as i32
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.buf.extend((op as u16).to_le_bytes());
        self
    }

    fn op1(&mut self, op: Opcode, a: i32) -> &mut Self {
        self.op(op);
        self.buf.extend(a.to_le_bytes());
        self
    }

    fn op2(&mut self, op: Opcode, a: i32, b: i32) -> &mut Self {
        self.op1(op, a);
        self.buf.extend(b.to_le_bytes());
        self
    }

    fn into_code(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Clone)]
struct VarSpec {
    name: &'static str,
    data_type: i32,
    struct_type: i32,
    rank: i32,
    /// Element descriptor for the generic array type (79), globals only.
    array_elem: Option<(i32, i32, i32)>,
    group: i32,
}

fn var(name: &'static str, data_type: DataType) -> VarSpec {
    VarSpec {
        name,
        data_type: data_type as i32,
        struct_type: -1,
        rank: 0,
        array_elem: None,
        group: 0,
    }
}

fn struct_var(name: &'static str, struct_type: i32) -> VarSpec {
    VarSpec {
        name,
        data_type: DataType::Struct as i32,
        struct_type,
        rank: 0,
        array_elem: None,
        group: 0,
    }
}

fn array_var(name: &'static str, data_type: DataType) -> VarSpec {
    VarSpec {
        name,
        data_type: data_type as i32,
        struct_type: -1,
        rank: 1,
        array_elem: None,
        group: 0,
    }
}

fn generic_array_var(name: &'static str, element: DataType) -> VarSpec {
    VarSpec {
        name,
        data_type: DataType::Array as i32,
        struct_type: -1,
        rank: 1,
        array_elem: Some((element as i32, -1, 0)),
        group: 0,
    }
}

struct FuncSpec {
    name: &'static str,
    address: i32,
    nr_args: usize,
    vars: Vec<VarSpec>,
}

fn func(name: &'static str, address: i32) -> FuncSpec {
    FuncSpec { name, address, nr_args: 0, vars: vec![] }
}

fn func_with_args(
    name: &'static str,
    address: i32,
    nr_args: usize,
    vars: Vec<VarSpec>,
) -> FuncSpec {
    FuncSpec { name, address, nr_args, vars }
}

/// Builds an image payload tag by tag; version 4 unless asked otherwise.
struct ImageBuilder {
    version: i32,
    buf: Vec<u8>,
}

impl ImageBuilder {
    fn new() -> Self {
        ImageBuilder::with_version(4)
    }

    fn with_version(version: i32) -> Self {
        let mut b = ImageBuilder { version, buf: vec![] };
        b.tag("VERS");
        b.int(version);
        b
    }

    fn tag(&mut self, tag: &str) {
        self.buf.extend(tag.as_bytes());
    }

    fn int(&mut self, v: i32) {
        self.buf.extend(v.to_le_bytes());
    }

    fn cstr(&mut self, s: &[u8]) {
        self.buf.extend(s);
        self.buf.push(0);
    }

    fn variable(&mut self, v: &VarSpec) {
        self.cstr(v.name.as_bytes());
        self.int(v.data_type);
        self.int(v.struct_type);
        self.int(v.rank);
    }

    fn code(mut self, code: &[u8]) -> Self {
        self.tag("CODE");
        self.int(code.len() as i32);
        self.buf.extend(code);
        self
    }

    fn functions(mut self, funcs: &[FuncSpec]) -> Self {
        self.tag("FUNC");
        self.int(funcs.len() as i32);
        for f in funcs {
            self.int(f.address);
            self.cstr(f.name.as_bytes());
            self.int(0); // is_label
            self.int(DataType::Void as i32);
            self.int(-1);
            self.int(f.nr_args as i32);
            self.int(f.vars.len() as i32);
            self.int(0); // crc
            for v in &f.vars {
                self.variable(v);
            }
        }
        self
    }

    fn globals(mut self, globals: &[VarSpec]) -> Self {
        self.tag("GLOB");
        // the stored count is short by one from version 12 on
        let count = if self.version >= 12 { globals.len() - 1 } else { globals.len() };
        self.int(count as i32);
        for g in globals {
            self.cstr(g.name.as_bytes());
            if self.version >= 12 {
                self.cstr(g.name.as_bytes()); // name2
            }
            self.int(g.data_type);
            self.int(g.struct_type);
            self.int(g.rank);
            if g.data_type == DataType::Array as i32 {
                let (elem_type, elem_struct, elem_rank) = g.array_elem.unwrap_or((0, -1, 0));
                self.int(elem_type);
                self.int(elem_struct);
                self.int(elem_rank);
            }
            if self.version >= 5 {
                self.int(g.group);
            }
        }
        self
    }

    fn global_initval_string(mut self, index: i32, value: &[u8]) -> Self {
        self.tag("GSET");
        self.int(1);
        self.int(index);
        self.int(DataType::String as i32);
        self.cstr(value);
        self
    }

    fn structure(mut self, name: &str, members: &[VarSpec]) -> Self {
        self.tag("STRT");
        self.int(1);
        self.cstr(name.as_bytes());
        self.int(-1); // constructor
        self.int(-1); // destructor
        self.int(members.len() as i32);
        for m in members {
            self.variable(m);
        }
        self
    }

    fn strings(mut self, strings: &[&[u8]]) -> Self {
        self.tag("STR0");
        self.int(strings.len() as i32);
        for s in strings {
            self.cstr(s);
        }
        self
    }

    fn messages(mut self, messages: &[&[u8]]) -> Self {
        self.tag("MSG0");
        self.int(messages.len() as i32);
        for m in messages {
            self.cstr(m);
        }
        self
    }

    fn msg1(mut self, messages: &[&[u8]]) -> Self {
        self.tag("MSG1");
        self.int(messages.len() as i32);
        self.int(0); // unknown word
        for m in messages {
            self.int(m.len() as i32);
            // inverse of the loader's unscramble
            for (i, b) in m.iter().enumerate() {
                self.buf.push(b.wrapping_add(0x60).wrapping_add(i as u8));
            }
        }
        self
    }

    fn switch(mut self, kind: i32, default_address: i32, cases: &[(i32, i32)]) -> Self {
        self.tag("SWI0");
        self.int(1);
        self.int(kind);
        self.int(default_address);
        self.int(cases.len() as i32);
        for (value, address) in cases {
            self.int(*value);
            self.int(*address);
        }
        self
    }

    fn library(mut self, name: &str, functions: &[(&str, DataType, &[(&str, DataType)])]) -> Self {
        self.tag("HLL0");
        self.int(1);
        self.cstr(name.as_bytes());
        self.int(functions.len() as i32);
        for (fname, ret, args) in functions {
            self.cstr(fname.as_bytes());
            self.int(*ret as i32);
            self.int(args.len() as i32);
            for (aname, atype) in *args {
                self.cstr(aname.as_bytes());
                self.int(*atype as i32);
            }
        }
        self
    }

    fn main_fn(mut self, index: i32) -> Self {
        self.tag("MAIN");
        self.int(index);
        self
    }

    fn msgf_fn(mut self, index: i32) -> Self {
        self.tag("MSGF");
        self.int(index);
        self
    }

    fn build_plain(self) -> Vec<u8> {
        self.buf
    }

    fn build_obfuscated(self) -> Vec<u8> {
        let mut buf = self.buf;
        obfuscate::crypt(&mut buf);
        buf
    }

    fn build_compressed(self) -> Vec<u8> {
        use std::io::Write;
        let mut out = b"AI2\0\0\0\0\0".to_vec();
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&self.buf).unwrap();
        let compressed = encoder.finish().unwrap();
        out.extend((self.buf.len() as u32).to_le_bytes());
        out.extend((compressed.len() as u32).to_le_bytes());
        out.extend(compressed);
        out
    }
}

fn load(builder: ImageBuilder) -> Ain {
    Ain::load(builder.build_obfuscated()).unwrap()
}

fn vm(builder: ImageBuilder) -> Vm {
    Vm::new(load(builder), Config::default()).unwrap()
}

// --- obfuscation and containers ---

#[test]
fn obfuscate_round_trip() {
    let original: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();
    let mut buf = original.clone();
    obfuscate::crypt(&mut buf);
    assert_ne!(buf, original);
    obfuscate::crypt(&mut buf);
    assert_eq!(buf, original);
}

#[test]
fn detects_obfuscated_image() {
    let encrypted = ImageBuilder::new().build_obfuscated();
    assert!(obfuscate::is_obfuscated(&encrypted));
    assert!(!obfuscate::is_obfuscated(b"VERS\x04\0\0\0"));
}

#[test]
fn loads_compressed_image() {
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let ain = Ain::load(
        ImageBuilder::new()
            .code(&code)
            .functions(&[func("main", 0)])
            .build_compressed(),
    )
    .unwrap();
    assert_eq!(ain.version, 4);
    assert_eq!(ain.functions.len(), 1);
}

#[test]
fn rejects_garbage() {
    let err = Ain::load(b"not an image at all".to_vec()).unwrap_err();
    assert!(matches!(err, AinError::UnrecognizedFormat));
}

#[test]
fn rejects_truncated_record() {
    let mut payload = ImageBuilder::new().build_plain();
    payload.extend(b"CODE\x10\0\0\0ab"); // claims 16 bytes, provides 2
    obfuscate::crypt(&mut payload);
    let err = Ain::load(payload).unwrap_err();
    assert!(matches!(err, AinError::Truncated));
}

#[test]
fn rejects_missing_vers() {
    // a VERS of zero is indistinguishable from an image with none
    let mut buf = vec![];
    buf.extend(b"VERS");
    buf.extend(0i32.to_le_bytes());
    obfuscate::crypt(&mut buf);
    let err = Ain::load(buf).unwrap_err();
    assert!(matches!(err, AinError::Invalid(_)));
}

#[test]
fn rejects_function_address_outside_code() {
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let image = ImageBuilder::new()
        .code(&code)
        .functions(&[func("main", 999)])
        .build_obfuscated();
    assert!(matches!(Ain::load(image), Err(AinError::Invalid(_))));
}

#[test]
fn rejects_case_address_outside_code() {
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let image = ImageBuilder::new()
        .code(&code)
        .functions(&[func("main", 0)])
        .switch(2, 0, &[(1, 500)])
        .build_obfuscated();
    assert!(matches!(Ain::load(image), Err(AinError::Invalid(_))));
}

#[test]
fn rejects_invalid_struct_type() {
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let image = ImageBuilder::new()
        .code(&code)
        .functions(&[func("main", 0)])
        .globals(&[struct_var("g", 3)])
        .build_obfuscated();
    assert!(matches!(Ain::load(image), Err(AinError::Invalid(_))));
}

#[test]
fn unscrambles_msg1_strings() {
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let ain = load(
        ImageBuilder::new()
            .code(&code)
            .functions(&[func("main", 0)])
            .msg1(&[b"hello", b"second message"]),
    );
    assert_eq!(ain.messages.len(), 2);
    assert_eq!(ain.messages[0].as_bytes(), b"hello");
    assert_eq!(ain.messages[1].as_bytes(), b"second message");
}

#[test]
fn records_alloc_function() {
    let mut code = Asm::default();
    code.op(Opcode::RETURN);
    let at = code.addr();
    code.op(Opcode::RETURN);
    let ain = load(
        ImageBuilder::new()
            .code(&code.into_code())
            .functions(&[func("main", 0), func("0", at)]),
    );
    assert_eq!(ain.alloc, Some(1));
    assert_eq!(ain.get_function_by_name(b"0"), Some(1));
}

#[rstest]
#[case(5)]
#[case(8)]
#[case(12)]
fn parses_versioned_globals(#[case] version: i32) {
    // a generic-array global (element descriptor follows) next to a plain
    // one; the trailing STR0 record proves the cursor stayed in sync
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let mut xs = generic_array_var("xs", DataType::Int);
    xs.group = 3;
    let mut count = var("count", DataType::Int);
    count.group = 7;
    let ain = load(
        ImageBuilder::with_version(version)
            .code(&code)
            .globals(&[xs, count])
            .strings(&[b"after"]),
    );
    assert_eq!(ain.version, version as u32);
    assert_eq!(ain.globals.len(), 2);
    assert_eq!(ain.globals[0].var.name.as_bytes(), b"xs");
    assert_eq!(ain.globals[0].var.data_type, DataType::Array);
    assert_eq!(ain.globals[0].group_index, 3);
    assert_eq!(ain.globals[1].var.name.as_bytes(), b"count");
    assert_eq!(ain.globals[1].var.data_type, DataType::Int);
    assert_eq!(ain.globals[1].group_index, 7);
    assert_eq!(ain.strings.len(), 1);
    assert_eq!(ain.strings[0].as_bytes(), b"after");
}

// --- strings ---

#[rstest]
#[case(b"abc", 3, 3)]
#[case(b"", 0, 0)]
// 0x82 0xA0 is one double-byte character
#[case(&[0x82, 0xA0, b'a'], 2, 3)]
#[case(&[0x82, 0xA0, 0x83, 0x41], 2, 4)]
#[case(&[0xE0, 0x41], 1, 2)]
fn sjis_lengths(#[case] bytes: &[u8], #[case] chars: usize, #[case] byte_len: usize) {
    let s = VmString::from_bytes(bytes);
    assert_eq!(s.len_chars(), chars);
    assert_eq!(s.len_bytes(), byte_len);
    assert!(s.len_chars() <= s.len_bytes());
}

#[test]
fn sjis_char_access() {
    let s = VmString::new(vec![b'a', 0x82, 0xA0, b'b']);
    assert_eq!(s.get_char(0), 'a' as i32);
    assert_eq!(s.get_char(1), 0x82A0);
    assert_eq!(s.get_char(2), 'b' as i32);
    assert_eq!(s.get_char(3), 0);

    let mut t = s.clone();
    t.set_char(1, 'x' as u32);
    assert_eq!(t.as_bytes(), b"axb");
    t.push_back(0x82A0);
    assert_eq!(t.len_chars(), 4);
    t.pop_back();
    assert_eq!(t.as_bytes(), b"axb");
    t.erase_at(1);
    assert_eq!(t.as_bytes(), b"ab");
}

#[test]
fn string_find_is_byte_offset() {
    let hay = VmString::from_bytes(b"hello world");
    assert_eq!(hay.find(&VmString::from_bytes(b"world")), 6);
    assert_eq!(hay.find(&VmString::from_bytes(b"o w")), 4);
    assert_eq!(hay.find(&VmString::from_bytes(b"xyzzy")), -1);
    assert_eq!(hay.find(&VmString::from_bytes(b"")), 0);
}

#[test]
fn string_copy_clamps() {
    let s = VmString::from_bytes(b"abcdef");
    assert_eq!(s.copy(1, 3).as_bytes(), b"bcd");
    assert_eq!(s.copy(4, 10).as_bytes(), b"ef");
    assert_eq!(s.copy(9, 2).as_bytes(), b"");
}

#[rstest]
#[case("count=%d", FormatArg::Int(42), b"count=42")]
#[case("%05d!", FormatArg::Int(-42), b"-0042!")]
#[case("%x", FormatArg::Int(255), b"ff")]
#[case("%.2f", FormatArg::Float(1.5), b"1.50")]
#[case("100%% sure: %d", FormatArg::Int(1), b"100% sure: 1")]
fn format_directives(#[case] fmt: &str, #[case] arg: FormatArg, #[case] expect: &[u8]) {
    let out = vm_string::string_format(&VmString::from_bytes(fmt.as_bytes()), arg);
    assert_eq!(out.as_bytes(), expect);
}

#[test]
fn format_substitutes_only_once() {
    let s = VmString::from_bytes(b"ok");
    let out = vm_string::string_format(&VmString::from_bytes(b"%s-%s"), FormatArg::Str(&s));
    assert_eq!(out.as_bytes(), b"ok-%s");
}

#[rstest]
#[case(0)]
#[case(7)]
#[case(-13)]
#[case(i32::MAX)]
#[case(i32::MIN)]
fn format_matches_decimal_rendering(#[case] n: i32) {
    let out = vm_string::string_format(&VmString::from_bytes(b"%d"), FormatArg::Int(n));
    assert_eq!(out.as_bytes(), n.to_string().as_bytes());
    assert_eq!(VmString::from_int(n).as_bytes(), n.to_string().as_bytes());
}

#[test]
fn float_rendering_defaults_to_six_digits() {
    assert_eq!(VmString::from_float(1.25, -1).as_bytes(), b"1.250000");
    assert_eq!(VmString::from_float(1.25, 2).as_bytes(), b"1.25");
    assert_eq!(VmString::from_float(2.0, 0).as_bytes(), b"2");
}

// --- heap ---

#[test]
fn double_free_is_a_trap() {
    let ain = Ain::default();
    let mut heap = Heap::new();
    let slot = heap.alloc_string(Rc::new(VmString::from_bytes(b"x")));
    heap.release(&ain, slot).unwrap();
    assert!(matches!(heap.release(&ain, slot), Err(VmError::DoubleFree(_))));
}

#[test]
fn release_recycles_slots() {
    let ain = Ain::default();
    let mut heap = Heap::new();
    let a = heap.alloc_string(Rc::new(VmString::from_bytes(b"a")));
    heap.retain(a).unwrap();
    heap.release(&ain, a).unwrap();
    assert_eq!(heap.live_count(), 1);
    heap.release(&ain, a).unwrap();
    assert_eq!(heap.live_count(), 0);
    let b = heap.alloc_string(Rc::new(VmString::from_bytes(b"b")));
    assert_eq!(a, b);
}

#[test]
fn copy_page_is_deep() {
    // struct S { string name; array@int xs; }
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let ain = load(
        ImageBuilder::new()
            .code(&code)
            .functions(&[func("main", 0)])
            .structure(
                "S",
                &[var("name", DataType::String), array_var("xs", DataType::ArrayInt)],
            ),
    );
    let mut heap = Heap::new();
    let original = page::alloc_struct(&mut heap, &ain, 0).unwrap();

    // give the members content
    let name_slot = heap.page(original).unwrap().values[0].as_int();
    heap.set_string(name_slot, Rc::new(VmString::from_bytes(b"x"))).unwrap();
    let xs_slot = heap.page(original).unwrap().values[1].as_int();
    let xs =
        page::alloc_array(&mut heap, &ain, DataType::ArrayInt, -1, 1, &[Value::int(2)]).unwrap();
    heap.set_page(&ain, xs_slot, Some(xs)).unwrap();
    heap.page_mut(xs_slot).unwrap().values[0] = Value::int(7);

    let copy = heap.copy_slot_page(&ain, original).unwrap();

    // mutate the copy
    let copy_name = heap.page(copy).unwrap().values[0].as_int();
    heap.set_string(copy_name, Rc::new(VmString::from_bytes(b"y"))).unwrap();
    let copy_xs = heap.page(copy).unwrap().values[1].as_int();
    heap.page_mut(copy_xs).unwrap().values[0] = Value::int(99);

    // the original is untouched
    assert_eq!(heap.string(name_slot).unwrap().as_bytes(), b"x");
    assert_eq!(heap.page(xs_slot).unwrap().values[0], Value::int(7));
    // and vice versa
    heap.page_mut(xs_slot).unwrap().values[1] = Value::int(8);
    assert_eq!(heap.page(copy_xs).unwrap().values[1], Value::int(0));

    heap.release(&ain, copy).unwrap();
    heap.release(&ain, original).unwrap();
    assert_eq!(heap.live_count(), 0);
}

// --- interpreter: end-to-end scenarios ---

#[test]
fn arithmetic_and_branch() {
    let mut a = Asm::default();
    // PUSH 3; PUSH 4; ADD; PUSH 10; LT; IFZ else; PUSH 1; JUMP end;
    // else: PUSH 0; end: RETURN
    let addr_else = 6 + 6 + 2 + 6 + 2 + 6 + 6 + 6;
    let addr_end = addr_else + 6;
    a.op1(Opcode::PUSH, 3)
        .op1(Opcode::PUSH, 4)
        .op(Opcode::ADD)
        .op1(Opcode::PUSH, 10)
        .op(Opcode::LT)
        .op1(Opcode::IFZ, addr_else)
        .op1(Opcode::PUSH, 1)
        .op1(Opcode::JUMP, addr_end);
    assert_eq!(a.addr(), addr_else);
    a.op1(Opcode::PUSH, 0);
    assert_eq!(a.addr(), addr_end);
    a.op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .main_fn(0));
    let status = vm.run().unwrap();
    assert_eq!(status, 0);
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(1));
    assert_eq!(vm.heap.live_count(), 0);
}

#[test]
fn string_concat_allocates_one_slot() {
    let mut a = Asm::default();
    a.op1(Opcode::S_PUSH, 0)
        .op1(Opcode::S_PUSH, 1)
        .op(Opcode::S_ADD)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .strings(&[b"hello ", b"world"])
        .main_fn(0));

    let baseline = vm.heap.live_count();
    vm.call_function(0).unwrap();
    let slot = vm.stack().last().unwrap().as_int();
    assert_eq!(vm.heap.string(slot).unwrap().as_bytes(), b"hello world");
    assert_eq!(vm.heap.live_count(), baseline + 1);
    // what S_POP would do at the callsite
    vm.heap.release(&vm.ain, slot).unwrap();
    assert_eq!(vm.heap.live_count(), baseline);
}

#[test]
fn recursive_factorial() {
    // fact(n): if n <= 1 return 1 else return n * fact(n - 1)
    let mut a = Asm::default();
    a.op1(Opcode::PUSH, 5).op1(Opcode::CALLFUNC, 1).op(Opcode::RETURN);
    let fact = a.addr();
    let addr_else = fact + 2 + 6 + 2 + 6 + 2 + 6 + 6 + 2;
    a.op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::LTE)
        .op1(Opcode::IFZ, addr_else)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::RETURN);
    assert_eq!(a.addr(), addr_else);
    a.op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::SUB)
        .op1(Opcode::CALLFUNC, 1)
        .op(Opcode::MUL)
        .op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[
            func("main", 0),
            func_with_args("fact", fact, 1, vec![var("n", DataType::Int)]),
        ])
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(120));
    assert!(vm.stack_trace().is_empty());
    assert_eq!(vm.heap.live_count(), 1); // just the global page
}

#[test]
fn array_copy_independence() {
    let mut a = Asm::default();
    // int[4] a = {1,2,3,4} in global 0
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::PUSH, 4)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::A_ALLOC);
    for i in 0..4 {
        a.op(Opcode::PUSHGLOBALPAGE)
            .op1(Opcode::PUSH, 0)
            .op(Opcode::REF)
            .op1(Opcode::PUSH, i)
            .op1(Opcode::PUSH, i + 1)
            .op(Opcode::ASSIGN)
            .op(Opcode::POP);
    }
    // b = copy of a; b[0] = 99; leave b's slot on the stack
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op(Opcode::A_REF)
        .op(Opcode::DUP)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::PUSH, 99)
        .op(Opcode::ASSIGN)
        .op(Opcode::POP)
        .op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .globals(&[array_var("a", DataType::ArrayInt)])
        .main_fn(0));
    vm.call_function(0).unwrap();

    let b = vm.stack().last().unwrap().as_int();
    let a_slot = vm.global_get(0).unwrap().as_int();
    assert_eq!(vm.heap.page(a_slot).unwrap().values[0], Value::int(1));
    assert_eq!(vm.heap.page(b).unwrap().values[0], Value::int(99));
    assert_eq!(vm.heap.page(b).unwrap().values[3], Value::int(4));
}

#[test]
fn struct_deep_copy() {
    // struct P { string name; }; P p1, p2 in globals
    let mut a = Asm::default();
    // p1.name = "x"
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op1(Opcode::S_PUSH, 0)
        .op(Opcode::S_ASSIGN)
        .op(Opcode::S_POP);
    // p2 = p1
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::REF)
        .op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::SR_REF, 0)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::SR_ASSIGN)
        .op(Opcode::SR_POP);
    // p2.name = "y"
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::REF)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op1(Opcode::S_PUSH, 1)
        .op(Opcode::S_ASSIGN)
        .op(Opcode::S_POP)
        .op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .structure("P", &[var("name", DataType::String)])
        .globals(&[struct_var("p1", 0), struct_var("p2", 0)])
        .strings(&[b"x", b"y"])
        .main_fn(0));
    vm.call_function(0).unwrap();

    let p1 = vm.global_get(0).unwrap().as_int();
    let p2 = vm.global_get(1).unwrap().as_int();
    let p1_name = vm.heap.page(p1).unwrap().values[0].as_int();
    let p2_name = vm.heap.page(p2).unwrap().values[0].as_int();
    assert_eq!(vm.heap.string(p1_name).unwrap().as_bytes(), b"x");
    assert_eq!(vm.heap.string(p2_name).unwrap().as_bytes(), b"y");
}

#[test]
fn switch_dispatch() {
    let mut a = Asm::default();
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op1(Opcode::SWITCH, 0);
    let case_a = a.addr();
    a.op1(Opcode::PUSH, 100).op(Opcode::RETURN);
    let case_b = a.addr();
    a.op1(Opcode::PUSH, 200).op(Opcode::RETURN);
    let case_c = a.addr();
    a.op1(Opcode::PUSH, 300).op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .globals(&[var("g", DataType::Int)])
        .switch(2, case_c, &[(1, case_a), (2, case_b)])
        .main_fn(0));

    for (input, expect) in [(1, 100), (2, 200), (3, 300)] {
        vm.global_set(0, Value::int(input)).unwrap();
        vm.call_function(0).unwrap();
        assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(expect));
    }
}

#[test]
fn strswitch_dispatch() {
    let mut a = Asm::default();
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::S_REF)
        .op1(Opcode::STRSWITCH, 0);
    let case_a = a.addr();
    a.op1(Opcode::PUSH, 1).op(Opcode::RETURN);
    let case_miss = a.addr();
    a.op1(Opcode::PUSH, -1).op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .globals(&[var("g", DataType::String)])
        .strings(&[b"go"])
        .switch(4, case_miss, &[(0, case_a)])
        .main_fn(0));

    let g = vm.global_get(0).unwrap().as_int();
    vm.heap.set_string(g, Rc::new(VmString::from_bytes(b"go"))).unwrap();
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(1));

    vm.heap.set_string(g, Rc::new(VmString::from_bytes(b"stop"))).unwrap();
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(-1));
}

#[test]
fn exit_leaves_no_live_objects() {
    let mut a = Asm::default();
    // allocate an array-of-strings global, then exit 42 with the locals and
    // the struct page still live; shutdown must reclaim everything
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 1)
        .op1(Opcode::PUSH, 8)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::A_ALLOC)
        .op1(Opcode::PUSH, 42)
        .op1(Opcode::CALLSYS, 0);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func_with_args(
            "main",
            0,
            0,
            vec![var("s", DataType::String), struct_var("p", 0)],
        )])
        .structure("P", &[var("name", DataType::String)])
        .globals(&[var("greeting", DataType::String), array_var("xs", DataType::ArrayString)])
        .global_initval_string(0, b"boo")
        .main_fn(0));
    let status = vm.run().unwrap();
    assert_eq!(status, 42);
    assert_eq!(vm.heap.live_count(), 0);
}

#[test]
fn global_initval_applies() {
    let code = Asm::default().op(Opcode::RETURN).buf.clone();
    let vm = vm(ImageBuilder::new()
        .code(&code)
        .functions(&[func("main", 0)])
        .globals(&[var("greeting", DataType::String)])
        .global_initval_string(0, b"boo")
        .main_fn(0));
    let slot = vm.global_get(0).unwrap().as_int();
    assert_eq!(vm.heap.string(slot).unwrap().as_bytes(), b"boo");
}

#[test]
fn reference_arguments_write_through() {
    // inc(ref int x) { x = 42; }  main: local y = 7; inc(ref y); push y
    let mut a = Asm::default();
    a.op2(Opcode::SH_LOCALASSIGN, 0, 7)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::CALLFUNC, 1)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op(Opcode::RETURN);
    let inc = a.addr();
    a.op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REFREF)
        .op1(Opcode::PUSH, 42)
        .op(Opcode::ASSIGN)
        .op(Opcode::POP)
        .op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[
            func_with_args("main", 0, 0, vec![var("y", DataType::Int)]),
            func_with_args(
                "inc",
                inc,
                2,
                vec![var("x", DataType::RefInt), var("<dummy>", DataType::Void)],
            ),
        ])
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(42));
    assert_eq!(vm.heap.live_count(), 1);
}

#[test]
fn scenario_jump_replaces_call_stack() {
    let mut a = Asm::default();
    a.op1(Opcode::S_PUSH, 0).op(Opcode::CALLONJUMP).op(Opcode::SJUMP);
    let scene = a.addr();
    a.op1(Opcode::PUSH, 7).op1(Opcode::CALLSYS, 0);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0), func("scene", scene)])
        .strings(&[b"scene"])
        .main_fn(0));
    let status = vm.run().unwrap();
    assert_eq!(status, 7);
    assert_eq!(vm.heap.live_count(), 0);
}

#[test]
fn message_dispatch_calls_message_function() {
    // msgf(int index, int total, string text) { g = index; }
    let mut a = Asm::default();
    a.op1(Opcode::MSG, 0).op(Opcode::RETURN);
    let msgf = a.addr();
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op(Opcode::ASSIGN)
        .op(Opcode::POP)
        .op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[
            func("main", 0),
            func_with_args(
                "msgf",
                msgf,
                3,
                vec![
                    var("index", DataType::Int),
                    var("total", DataType::Int),
                    var("text", DataType::String),
                ],
            ),
        ])
        .globals(&[var("g", DataType::Int)])
        .messages(&[b"hi there"])
        .main_fn(0)
        .msgf_fn(1));
    vm.global_set(0, Value::int(-1)).unwrap();
    vm.call_function(0).unwrap();
    assert_eq!(vm.global_get(0).unwrap().as_int(), 0);
    assert_eq!(vm.heap.live_count(), 1);
}

#[test]
fn array_sort_and_find() {
    let mut a = Asm::default();
    // alloc int[3] = {3,1,2}
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::PUSH, 3)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::A_ALLOC);
    for (i, v) in [(0, 3), (1, 1), (2, 2)] {
        a.op(Opcode::PUSHGLOBALPAGE)
            .op1(Opcode::PUSH, 0)
            .op(Opcode::REF)
            .op1(Opcode::PUSH, i)
            .op1(Opcode::PUSH, v)
            .op(Opcode::ASSIGN)
            .op(Opcode::POP);
    }
    // sort with cmp, then find the value 2 without a comparator
    a.op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::PUSH, 1)
        .op(Opcode::A_SORT)
        .op(Opcode::PUSHGLOBALPAGE)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::PUSH, 0)
        .op1(Opcode::PUSH, 3)
        .op1(Opcode::PUSH, 2)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::A_FIND)
        .op(Opcode::RETURN);
    let cmp = a.addr();
    // cmp(ref int x, ref int y) = x - y
    a.op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REFREF)
        .op(Opcode::REF)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 2)
        .op(Opcode::REFREF)
        .op(Opcode::REF)
        .op(Opcode::SUB)
        .op(Opcode::RETURN);

    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[
            func("main", 0),
            func_with_args(
                "cmp",
                cmp,
                4,
                vec![
                    var("x", DataType::RefInt),
                    var("<dummy>", DataType::Void),
                    var("y", DataType::RefInt),
                    var("<dummy>", DataType::Void),
                ],
            ),
        ])
        .globals(&[array_var("xs", DataType::ArrayInt)])
        .main_fn(0));
    vm.call_function(0).unwrap();

    let xs = vm.global_get(0).unwrap().as_int();
    let sorted: Vec<i32> =
        vm.heap.page(xs).unwrap().values.iter().map(|v| v.as_int()).collect();
    assert_eq!(sorted, vec![1, 2, 3]);
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(1));
    assert_eq!(vm.heap.live_count(), 2); // global page + array
}

#[test]
fn assertion_failure_is_fatal() {
    let mut a = Asm::default();
    // push condition, expression text, file, line
    a.op1(Opcode::PUSH, 0)
        .op1(Opcode::S_PUSH, 0)
        .op1(Opcode::S_PUSH, 1)
        .op1(Opcode::PUSH, 17)
        .op(Opcode::ASSERT)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .strings(&[b"x > 0", b"test.adv"])
        .main_fn(0));
    match vm.call_function(0).unwrap_err() {
        VmError::AssertionFailed { file, line, expr } => {
            assert_eq!(file, "test.adv");
            assert_eq!(line, 17);
            assert_eq!(expr, "x > 0");
        }
        other => panic!("expected assertion failure, got {other}"),
    }
}

#[test]
fn illegal_opcode_is_a_trap() {
    let code = vec![0xFF, 0x7F]; // no such opcode
    let mut vm = vm(ImageBuilder::new()
        .code(&code)
        .functions(&[func("main", 0)])
        .main_fn(0));
    assert!(matches!(vm.call_function(0), Err(VmError::IllegalOpcode(0x7FFF))));
}

#[test]
fn unimplemented_opcode_is_a_trap() {
    let mut a = Asm::default();
    a.op(Opcode::DG_CLEAR).op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .main_fn(0));
    assert!(matches!(
        vm.call_function(0),
        Err(VmError::UnimplementedInstruction("DG_CLEAR"))
    ));
}

// --- HLL ---

#[test]
fn hll_call_resolves_by_name() {
    let mut a = Asm::default();
    a.op1(Opcode::PUSH, 3)
        .op1(Opcode::PUSH, 9)
        .op2(Opcode::CALLHLL, 0, 0)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .library(
            "Math",
            &[("Max", DataType::Int, &[("a", DataType::Int), ("b", DataType::Int)])],
        )
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(9));
}

#[test]
fn hll_reference_arguments_borrow() {
    let mut a = Asm::default();
    a.op2(Opcode::SH_LOCALASSIGN, 0, 1)
        .op2(Opcode::SH_LOCALASSIGN, 1, 2)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 1)
        .op2(Opcode::CALLHLL, 0, 0)
        .op(Opcode::POP)
        .op(Opcode::PUSHLOCALPAGE)
        .op1(Opcode::PUSH, 0)
        .op(Opcode::REF)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func_with_args(
            "main",
            0,
            0,
            vec![var("a", DataType::Int), var("b", DataType::Int)],
        )])
        .library(
            "Math",
            &[("Swap", DataType::Int, &[("a", DataType::RefInt), ("b", DataType::RefInt)])],
        )
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(2));
    assert_eq!(vm.heap.live_count(), 1);
}

#[test]
fn unlinked_hll_call_is_fatal() {
    let mut a = Asm::default();
    a.op2(Opcode::CALLHLL, 0, 0).op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .library("SACT2", &[("Init", DataType::Int, &[])])
        .main_fn(0));
    match vm.call_function(0) {
        Err(VmError::UnlinkedCall(lib, fun)) => {
            assert_eq!(lib, "SACT2");
            assert_eq!(fun, "Init");
        }
        other => panic!("expected unlinked-call trap, got {other:?}"),
    }
}

// --- audit ---

#[test]
fn audit_reports_unimplemented_surface() {
    let mut a = Asm::default();
    a.op1(Opcode::CALLSYS, 0x07) // MsgBox: known, unimplemented
        .op2(Opcode::CALLHLL, 0, 0)
        .op(Opcode::DG_ADD)
        .op(Opcode::RETURN);
    let ain = load(
        ImageBuilder::new()
            .code(&a.into_code())
            .functions(&[func("main", 0)])
            .library("SACT2", &[("Init", DataType::Int, &[])])
            .main_fn(0),
    );
    let linked = hll::link(&ain).unwrap();
    let mut out = Vec::new();
    audit::audit(&mut out, &ain, &linked).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("CALLSYS MsgBox (unimplemented system call)"));
    assert!(report.contains("CALLHLL SACT2.Init (unimplemented library)"));
    assert!(report.contains("DG_ADD (unimplemented instruction)"));
}

// --- configuration ---

fn write_temp_config(name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn config_reads_ini_entries() {
    let path = write_temp_config(
        "xsystem4_config_ascii.ini",
        b"GameName = \"Some Game\"\r\nCodeName = \"Some.ain\"\nSaveFolder = \"SaveData\"\nnot an entry\n",
    );
    let config = Config::from_ini(&path).unwrap();
    assert_eq!(config.game_name.as_deref(), Some(b"Some Game".as_slice()));
    assert_eq!(config.ain_filename.as_deref(), Some(b"Some.ain".as_slice()));
    assert_eq!(config.save_dir.as_deref(), Some(b"SaveData".as_slice()));
    assert_eq!(config.game_dir, path.parent().unwrap());
    assert_eq!(
        config.ain_path().unwrap(),
        path.parent().unwrap().join("Some.ain")
    );
}

#[test]
fn config_keeps_shift_jis_bytes() {
    // GameName is three double-byte shift-JIS characters; the bytes must
    // come back untouched, not replaced by U+FFFD
    let sjis = [0x82, 0xB3, 0x82, 0xAD, 0x82, 0xE7];
    let mut ini = b"GameName = \"".to_vec();
    ini.extend_from_slice(&sjis);
    ini.extend_from_slice(b"\"\nCodeName = \"System40.ain\"\n");
    let path = write_temp_config("xsystem4_config_sjis.ini", &ini);
    let config = Config::from_ini(&path).unwrap();
    assert_eq!(config.game_name.as_deref(), Some(sjis.as_slice()));
    assert_eq!(config.ain_filename.as_deref(), Some(b"System40.ain".as_slice()));
}

#[test]
fn config_defaults_from_ain_path() {
    let config = Config::default_for(std::path::Path::new("games/demo/Demo.ain"));
    assert_eq!(config.game_name.as_deref(), Some(b"Demo".as_slice()));
    assert_eq!(config.ain_filename.as_deref(), Some(b"Demo.ain".as_slice()));
    assert_eq!(config.game_dir, std::path::Path::new("games/demo"));
    assert!(config.save_dir.is_none());
}

#[test]
fn save_folder_syscall_returns_configured_bytes() {
    let sjis = [0x83, 0x5A, 0x81, 0x5B, 0x83, 0x75];
    let mut a = Asm::default();
    a.op1(Opcode::CALLSYS, 0x0C).op(Opcode::RETURN);
    let config = Config { save_dir: Some(sjis.to_vec()), ..Config::default() };
    let mut vm = Vm::new(
        load(
            ImageBuilder::new()
                .code(&a.into_code())
                .functions(&[func("main", 0)])
                .main_fn(0),
        ),
        config,
    )
    .unwrap();
    vm.call_function(0).unwrap();
    let slot = vm.stack().last().unwrap().as_int();
    assert_eq!(vm.heap.string(slot).unwrap().as_bytes(), sjis.as_slice());
}

// --- instruction table ---

#[test]
fn instruction_widths_follow_argument_counts() {
    assert_eq!(Opcode::PUSH.width(4), 6);
    assert_eq!(Opcode::ADD.width(4), 2);
    assert_eq!(Opcode::CALLHLL.width(4), 10);
    assert_eq!(Opcode::CALLHLL.width(9), 14);
    assert_eq!(Opcode::S_MOD.width(4), 2);
    assert_eq!(Opcode::S_MOD.width(9), 6);
    assert_eq!(Opcode::SH_LOCALASSIGN.width(4), 10);
}

#[test]
fn opcode_round_trips_through_raw() {
    for raw in 0..0x106u16 {
        let op = Opcode::from_raw(raw).unwrap();
        assert_eq!(op as u16, raw);
    }
    assert!(Opcode::from_raw(0x106).is_none());
    assert_eq!(Opcode::S_PUSH.name(), "S_PUSH");
    assert!(Opcode::JUMP.sets_ip());
    assert!(!Opcode::ADD.sets_ip());
}

// --- odds and ends ---

#[test]
fn stoi_parses_leading_integer() {
    let mut a = Asm::default();
    a.op1(Opcode::S_PUSH, 0).op(Opcode::STOI).op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .strings(&[b"  -42abc"])
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(-42));
}

#[test]
fn s_mod_formats_through_the_heap() {
    let mut a = Asm::default();
    // on version <= 8 images the type tag is popped from the stack
    a.op1(Opcode::S_PUSH, 0)
        .op1(Opcode::PUSH, 7)
        .op1(Opcode::PUSH, DataType::Int as i32)
        .op(Opcode::S_MOD)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .strings(&[b"lucky %d!"])
        .main_fn(0));
    vm.call_function(0).unwrap();
    let slot = vm.stack().last().unwrap().as_int();
    assert_eq!(vm.heap.string(slot).unwrap().as_bytes(), b"lucky 7!");
}

#[test]
fn division_by_zero_is_a_trap() {
    let mut a = Asm::default();
    a.op1(Opcode::PUSH, 1).op1(Opcode::PUSH, 0).op(Opcode::DIV).op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .main_fn(0));
    assert!(matches!(vm.call_function(0), Err(VmError::DivisionByZero)));
}

#[test]
fn long_arithmetic() {
    let mut a = Asm::default();
    a.op1(Opcode::PUSH, 2_000_000_000)
        .op(Opcode::ITOLI)
        .op1(Opcode::PUSH, 2_000_000_000)
        .op(Opcode::ITOLI)
        .op(Opcode::LI_ADD)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_long()), Some(4_000_000_000));
}

#[test]
fn float_arithmetic_bit_reinterprets() {
    let mut a = Asm::default();
    a.op1(Opcode::PUSH, 2)
        .op(Opcode::ITOF)
        .op1(Opcode::F_PUSH, 1.5f32.to_bits() as i32)
        .op(Opcode::F_MUL)
        .op(Opcode::FTOI)
        .op(Opcode::RETURN);
    let mut vm = vm(ImageBuilder::new()
        .code(&a.into_code())
        .functions(&[func("main", 0)])
        .main_fn(0));
    vm.call_function(0).unwrap();
    assert_eq!(vm.stack().last().map(|v| v.as_int()), Some(3));
}
