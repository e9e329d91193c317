//! The bytecode interpreter: fetch/decode/execute over the instruction set,
//! the operand stack, the call stack, and the shared heap.
//!
//! Calling convention: the caller pushes arguments in order; CALLFUNC pops
//! them into a fresh local page, records the return address, and jumps;
//! the callee pushes its return value before RETURN. A reference occupies
//! two cells (page slot, variable index) everywhere.

use std::io::Write as _;
use std::rc::Rc;
use std::time::Instant;

use log::{debug, error, warn};
use thiserror::Error;

use crate::ain::{Ain, DataType};
use crate::config::Config;
use crate::heap::{Heap, HeapValue};
use crate::hll::{self, HllArg, LinkedLibrary};
use crate::instructions::{self, Opcode};
use crate::page::{self, Page, PageKind, Value};
use crate::vm_string::{self, FormatArg, VmString};

/// Sentinel return address: reaching it halts the execute loop.
pub const VM_RETURN: u32 = 0xFFFF_FFFF;

/// The global page always occupies the first heap slot.
pub const GLOBAL_PAGE_SLOT: i32 = 0;

const MAX_CALL_DEPTH: usize = 4096;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("Illegal instruction pointer: {0:#010X}")]
    IllegalIp(u32),
    #[error("Illegal opcode: {0:#06X}")]
    IllegalOpcode(u16),
    #[error("Unimplemented instruction: {0}")]
    UnimplementedInstruction(&'static str),
    #[error("Out of bounds heap slot: {0}")]
    BadSlot(i32),
    #[error("Heap slot {0} does not hold a page")]
    NotAPage(i32),
    #[error("Heap slot {0} does not hold a string")]
    NotAString(i32),
    #[error("Double free of slot {0}")]
    DoubleFree(i32),
    #[error("Null pointer dereference")]
    NullDereference,
    #[error("Out of bounds page index: {slot}/{index}")]
    OutOfBoundsPage { slot: i32, index: i32 },
    #[error("Out of bounds array index: {index}/{len}")]
    OutOfBoundsArray { index: i32, len: usize },
    #[error("Invalid struct type: {0}")]
    BadStruct(i32),
    #[error("Invalid array rank: {0}")]
    BadArrayRank(i32),
    #[error("Invalid function index: {0}")]
    BadFunction(i32),
    #[error("Out of bounds {0} index: {1}")]
    BadIndex(&'static str, i32),
    #[error("Invalid scenario function: {0}")]
    BadScenarioFunction(String),
    #[error("No main function")]
    NoMain,
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Call stack overflow")]
    CallStackOverflow,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Unimplemented library function: {0}.{1}")]
    UnlinkedCall(String, String),
    #[error("Too many arguments to library function: {0}")]
    TooManyHllArguments(String),
    #[error("Assertion failed at {file}:{line}: {expr}")]
    AssertionFailed { file: String, line: i32, expr: String },
    /// Not a fault: carries the SYS_EXIT status out of the execute loop.
    #[error("Exit with status {0}")]
    Exit(i32),
}

pub type VmResult<T> = Result<T, VmError>;

/// One call-stack entry.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub function: usize,
    pub return_address: u32,
    pub page_slot: i32,
    /// Struct page slot for method frames, -1 otherwise.
    pub struct_page: i32,
}

pub struct Vm {
    pub ain: Ain,
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    ip: u32,
    libraries: Vec<LinkedLibrary>,
    save_dir: Option<Vec<u8>>,
    started: Instant,
    pub(crate) rand_state: u32,
}

impl Vm {
    /// Link host libraries, build the global page (slot 0) and apply literal
    /// initial values. Code does not run until [`Vm::run`] or an explicit
    /// call.
    pub fn new(ain: Ain, config: Config) -> VmResult<Vm> {
        let libraries = hll::link(&ain)?;
        let mut heap = Heap::new();
        let global = heap.alloc(HeapValue::Page(None));
        debug_assert_eq!(global, GLOBAL_PAGE_SLOT);

        let mut values = Vec::with_capacity(ain.globals.len());
        for g in &ain.globals {
            values.push(page::variable_initval(
                &mut heap,
                &ain,
                g.var.data_type,
                g.var.struct_type,
            )?);
        }
        heap.set_page(
            &ain,
            GLOBAL_PAGE_SLOT,
            Some(Page { kind: PageKind::Global, values }),
        )?;

        for v in &ain.global_initvals {
            let index = v.global_index as usize;
            match &v.value {
                crate::ain::InitValue::String(s) => {
                    let old = heap.page(GLOBAL_PAGE_SLOT)?.values[index];
                    heap.release_value(&ain, old, DataType::String)?;
                    let slot = heap.alloc_string(Rc::new(VmString::from_bytes(s.as_bytes())));
                    heap.page_mut(GLOBAL_PAGE_SLOT)?.values[index] = Value::int(slot);
                }
                crate::ain::InitValue::Int(n) => {
                    heap.page_mut(GLOBAL_PAGE_SLOT)?.values[index] = Value::int(*n);
                }
            }
        }

        Ok(Vm {
            ain,
            heap,
            stack: vec![],
            frames: vec![],
            ip: VM_RETURN,
            libraries,
            save_dir: config.save_dir,
            started: Instant::now(),
            rand_state: 0,
        })
    }

    /// Run the program: the alloc function ("0"), global struct
    /// constructors, then main. Returns the exit status; traps are logged
    /// with a stack trace and returned as errors.
    pub fn run(&mut self) -> VmResult<i32> {
        match self.run_main() {
            Ok(()) => {
                self.shutdown()?;
                Ok(0)
            }
            Err(VmError::Exit(code)) => {
                self.shutdown()?;
                Ok(code)
            }
            Err(e) => {
                self.report_trap(&e);
                Err(e)
            }
        }
    }

    fn run_main(&mut self) -> VmResult<()> {
        if let Some(alloc) = self.ain.alloc {
            self.call_function(alloc)?;
        }
        // constructors run after the literal initial values are in place, so
        // a global set by a constructor is not clobbered
        for i in 0..self.ain.globals.len() {
            let (data_type, struct_type) = {
                let g = &self.ain.globals[i];
                (g.var.data_type, g.var.struct_type)
            };
            if data_type != DataType::Struct {
                continue;
            }
            let constructor = self.ain.structures[struct_type as usize].constructor;
            if constructor >= 0 {
                let slot = self.global_get(i)?.as_int();
                self.call_method(constructor as usize, slot)?;
            }
        }
        let main = self.ain.main.ok_or(VmError::NoMain)?;
        self.call_function(main)
    }

    /// Release the remaining frames top-down, then the global page, and
    /// report anything still live.
    fn shutdown(&mut self) -> VmResult<()> {
        while let Some(frame) = self.frames.pop() {
            self.heap.release(&self.ain, frame.page_slot)?;
        }
        self.heap.release(&self.ain, GLOBAL_PAGE_SLOT)?;
        let leaked = self.heap.live_count();
        if leaked > 0 {
            warn!("Number of leaked objects: {leaked}");
        }
        Ok(())
    }

    /// Re-entrant call used for startup, constructors, comparators and
    /// tests: runs `fno` to completion, then restores the instruction
    /// pointer.
    pub fn call_function(&mut self, fno: usize) -> VmResult<()> {
        self.vm_call(fno, -1)
    }

    pub fn call_method(&mut self, fno: usize, struct_page: i32) -> VmResult<()> {
        self.vm_call(fno, struct_page)
    }

    fn vm_call(&mut self, fno: usize, struct_page: i32) -> VmResult<()> {
        let saved_ip = self.ip;
        if struct_page < 0 {
            self.function_call(fno, VM_RETURN)?;
        } else {
            self.push(Value::int(struct_page));
            self.method_call(fno, VM_RETURN)?;
        }
        self.execute()?;
        self.ip = saved_ip;
        Ok(())
    }

    // --- stack primitives ---

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn push_int(&mut self, v: i32) {
        self.stack.push(Value::int(v));
    }

    fn push_bool(&mut self, v: bool) {
        self.stack.push(Value::bool(v));
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_int(&mut self) -> VmResult<i32> {
        Ok(self.pop()?.as_int())
    }

    fn peek(&self, n: usize) -> VmResult<Value> {
        let len = self.stack.len();
        if n >= len {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - n])
    }

    fn set(&mut self, n: usize, v: Value) -> VmResult<()> {
        let len = self.stack.len();
        if n >= len {
            return Err(VmError::StackUnderflow);
        }
        self.stack[len - 1 - n] = v;
        Ok(())
    }

    fn push_string(&mut self, s: Rc<VmString>) {
        let slot = self.heap.alloc_string(s);
        self.push_int(slot);
    }

    fn peek_string(&self, n: usize) -> VmResult<&Rc<VmString>> {
        self.heap.string(self.peek(n)?.as_int())
    }

    /// Pop a two-cell reference and validate the referenced location.
    fn pop_ref(&mut self) -> VmResult<(i32, i32)> {
        let index = self.pop_int()?;
        let slot = self.pop_int()?;
        let page = self.heap.page(slot)?;
        if index < 0 || index as usize >= page.nr_vars() {
            return Err(VmError::OutOfBoundsPage { slot, index });
        }
        Ok((slot, index))
    }

    fn var_get(&self, slot: i32, index: i32) -> VmResult<Value> {
        let page = self.heap.page(slot)?;
        page.values
            .get(index as usize)
            .copied()
            .ok_or(VmError::OutOfBoundsPage { slot, index })
    }

    fn var_set(&mut self, slot: i32, index: i32, v: Value) -> VmResult<()> {
        let page = self.heap.page_mut(slot)?;
        match page.values.get_mut(index as usize) {
            Some(cell) => {
                *cell = v;
                Ok(())
            }
            None => Err(VmError::OutOfBoundsPage { slot, index }),
        }
    }

    // --- frame helpers ---

    fn frame(&self) -> VmResult<&Frame> {
        self.frames.last().ok_or(VmError::StackUnderflow)
    }

    fn local_page_slot(&self) -> VmResult<i32> {
        Ok(self.frame()?.page_slot)
    }

    fn struct_page_slot(&self) -> VmResult<i32> {
        let slot = self.frame()?.struct_page;
        if slot < 0 {
            return Err(VmError::NullDereference);
        }
        Ok(slot)
    }

    fn local_get(&self, varno: i32) -> VmResult<Value> {
        self.var_get(self.local_page_slot()?, varno)
    }

    fn local_set(&mut self, varno: i32, v: Value) -> VmResult<()> {
        self.var_set(self.local_page_slot()?, varno, v)
    }

    pub fn global_get(&self, varno: usize) -> VmResult<Value> {
        self.var_get(GLOBAL_PAGE_SLOT, varno as i32)
    }

    pub fn global_set(&mut self, varno: usize, v: Value) -> VmResult<()> {
        self.var_set(GLOBAL_PAGE_SLOT, varno as i32, v)
    }

    /// The operand stack, bottom first.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    // --- decoding ---

    fn get_argument(&self, n: usize) -> i32 {
        let off = self.ip as usize + 2 + n * 4;
        i32::from_le_bytes(self.ain.code[off..off + 4].try_into().unwrap())
    }

    fn get_argument_float(&self, n: usize) -> f32 {
        f32::from_bits(self.get_argument(n) as u32)
    }

    fn current_instruction_name(&self) -> &'static str {
        if self.ip == VM_RETURN || self.ip as usize + 1 >= self.ain.code.len() {
            return "UNKNOWN OPCODE";
        }
        let raw = u16::from_le_bytes(
            self.ain.code[self.ip as usize..self.ip as usize + 2]
                .try_into()
                .unwrap(),
        );
        Opcode::from_raw(raw).map_or("UNKNOWN OPCODE", Opcode::name)
    }

    /// Function names of the live frames, innermost first.
    pub fn stack_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|f| self.ain.functions[f.function].name.as_utf8_lossy().into_owned())
            .collect()
    }

    fn report_trap(&self, e: &VmError) {
        error!("{e}");
        error!(
            "at {} ({:#010X}) in:",
            self.current_instruction_name(),
            self.ip
        );
        for name in self.stack_trace() {
            error!("\t{name}");
        }
    }

    // --- calling convention ---

    fn function_call(&mut self, fno: usize, return_address: u32) -> VmResult<()> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::CallStackOverflow);
        }
        let (nr_args, nr_vars) = {
            let f = self
                .ain
                .functions
                .get(fno)
                .ok_or(VmError::BadFunction(fno as i32))?;
            (f.nr_args, f.nr_vars())
        };
        if self.stack.len() < nr_args {
            return Err(VmError::StackUnderflow);
        }

        let mut values = vec![Value::int(0); nr_vars];
        // pop arguments into the parameter slots; a reference argument's
        // page cell keeps its referent alive for the frame's lifetime
        for i in (0..nr_args).rev() {
            let v = self.pop()?;
            values[i] = v;
            if self.ain.functions[fno].vars[i].data_type.is_ref() && v.as_int() != -1 {
                self.heap.retain(v.as_int())?;
            }
        }
        for i in nr_args..nr_vars {
            let (data_type, struct_type) = {
                let var = &self.ain.functions[fno].vars[i];
                (var.data_type, var.struct_type)
            };
            values[i] = page::variable_initval(&mut self.heap, &self.ain, data_type, struct_type)?;
        }

        let slot = self.heap.alloc(HeapValue::Page(Some(Page {
            kind: PageKind::Local { function: fno },
            values,
        })));
        self.frames.push(Frame {
            function: fno,
            return_address,
            page_slot: slot,
            struct_page: -1,
        });
        self.ip = self.ain.functions[fno].address;
        Ok(())
    }

    fn method_call(&mut self, fno: usize, return_address: u32) -> VmResult<()> {
        self.function_call(fno, return_address)?;
        let obj = self.pop_int()?;
        self.frames.last_mut().unwrap().struct_page = obj;
        Ok(())
    }

    fn function_return(&mut self) -> VmResult<()> {
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow)?;
        self.heap.release(&self.ain, frame.page_slot)?;
        self.ip = frame.return_address;
        Ok(())
    }

    /// Abandon every live frame and restart from the pre-allocated scenario
    /// page: the language's only non-structured control transfer.
    fn scenario_call(&mut self, slot: i32) -> VmResult<()> {
        let fno = match self.heap.page(slot)?.kind {
            PageKind::Local { function } => function,
            _ => return Err(VmError::NotAPage(slot)),
        };
        while let Some(frame) = self.frames.pop() {
            self.heap.release(&self.ain, frame.page_slot)?;
        }
        self.frames.push(Frame {
            function: fno,
            return_address: VM_RETURN,
            page_slot: slot,
            struct_page: -1,
        });
        self.ip = self.ain.functions[fno].address;
        Ok(())
    }

    fn alloc_scenario_page(&mut self, name: &[u8]) -> VmResult<i32> {
        let fno = self.ain.get_function_by_name(name).ok_or_else(|| {
            VmError::BadScenarioFunction(String::from_utf8_lossy(name).into_owned())
        })?;
        let nr_vars = self.ain.functions[fno].nr_vars();
        let mut values = Vec::with_capacity(nr_vars);
        for i in 0..nr_vars {
            let (data_type, struct_type) = {
                let var = &self.ain.functions[fno].vars[i];
                (var.data_type, var.struct_type)
            };
            values.push(page::variable_initval(
                &mut self.heap,
                &self.ain,
                data_type,
                struct_type,
            )?);
        }
        Ok(self.heap.alloc(HeapValue::Page(Some(Page {
            kind: PageKind::Local { function: fno },
            values,
        }))))
    }

    // --- dispatch helpers ---

    fn binop_int(&mut self, f: impl FnOnce(i32, i32) -> VmResult<i32>) -> VmResult<()> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        let r = f(a, b)?;
        self.push_int(r);
        Ok(())
    }

    fn cmp_int(&mut self, f: impl FnOnce(i32, i32) -> bool) -> VmResult<()> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push_bool(f(a, b));
        Ok(())
    }

    fn compound_int(&mut self, f: impl FnOnce(i32, i32) -> VmResult<i32>) -> VmResult<()> {
        let n = self.pop_int()?;
        let (slot, index) = self.pop_ref()?;
        let r = f(self.var_get(slot, index)?.as_int(), n)?;
        self.var_set(slot, index, Value::int(r))?;
        self.push_int(r);
        Ok(())
    }

    fn binop_float(&mut self, f: impl FnOnce(f32, f32) -> f32) -> VmResult<()> {
        let b = self.pop()?.as_float();
        let a = self.peek(0)?.as_float();
        self.set(0, Value::float(f(a, b)))
    }

    fn cmp_float(&mut self, f: impl FnOnce(f32, f32) -> bool) -> VmResult<()> {
        let b = self.pop()?.as_float();
        let a = self.peek(0)?.as_float();
        self.set(0, Value::bool(f(a, b)))
    }

    fn compound_float(&mut self, f: impl FnOnce(f32, f32) -> f32) -> VmResult<()> {
        let n = self.pop()?.as_float();
        let (slot, index) = self.pop_ref()?;
        let r = f(self.var_get(slot, index)?.as_float(), n);
        self.var_set(slot, index, Value::float(r))?;
        self.push(Value::float(r));
        Ok(())
    }

    fn binop_long(&mut self, f: impl FnOnce(i64, i64) -> VmResult<i64>) -> VmResult<()> {
        let b = self.pop()?.as_long();
        let a = self.pop()?.as_long();
        let r = f(a, b)?;
        self.push(Value::long(r));
        Ok(())
    }

    fn compound_long(&mut self, f: impl FnOnce(i64, i64) -> VmResult<i64>) -> VmResult<()> {
        let n = self.pop()?.as_long();
        let (slot, index) = self.pop_ref()?;
        let r = f(self.var_get(slot, index)?.as_long(), n)?;
        self.var_set(slot, index, Value::long(r))?;
        self.push(Value::long(r));
        Ok(())
    }

    fn cmp_string(&mut self, f: impl FnOnce(std::cmp::Ordering) -> bool) -> VmResult<()> {
        let ord = {
            let a = self.peek_string(1)?;
            let b = self.peek_string(0)?;
            a.as_bytes().cmp(b.as_bytes())
        };
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.heap.release(&self.ain, b)?;
        self.heap.release(&self.ain, a)?;
        self.push_bool(f(ord));
        Ok(())
    }

    /// The element data type and struct type of the array held in variable
    /// (`pageno`, `varno`), straight from the variable metadata.
    fn array_var_type(&self, pageno: i32, varno: i32) -> VmResult<(DataType, i32)> {
        let page = self.heap.page(pageno)?;
        if varno < 0 || varno as usize >= page.nr_vars() {
            return Err(VmError::OutOfBoundsPage { slot: pageno, index: varno });
        }
        Ok(page.var_type(&self.ain, varno as usize))
    }

    fn element_type(&self, slot: i32) -> VmResult<(DataType, i32)> {
        match self.heap.page_opt(slot)? {
            Some(page) => {
                let (dt, st) = match page.kind {
                    PageKind::Array { data_type, struct_type, rank } => {
                        if rank > 1 {
                            (data_type, struct_type)
                        } else {
                            (data_type.element(), struct_type)
                        }
                    }
                    _ => return Err(VmError::NotAPage(slot)),
                };
                Ok((dt, st))
            }
            None => Ok((DataType::Void, -1)),
        }
    }

    // --- the interpreter loop ---

    fn execute(&mut self) -> VmResult<()> {
        loop {
            if self.ip == VM_RETURN {
                return Ok(());
            }
            let ip = self.ip as usize;
            if ip + 2 > self.ain.code.len() {
                return Err(VmError::IllegalIp(self.ip));
            }
            let raw = u16::from_le_bytes(self.ain.code[ip..ip + 2].try_into().unwrap());
            let op = Opcode::from_raw(raw).ok_or(VmError::IllegalOpcode(raw))?;
            let width = op.width(self.ain.version);
            if ip + width > self.ain.code.len() {
                return Err(VmError::IllegalIp(self.ip));
            }
            self.execute_instruction(op)?;
            if !op.sets_ip() {
                self.ip += width as u32;
            }
        }
    }

    fn execute_instruction(&mut self, op: Opcode) -> VmResult<()> {
        use Opcode::*;
        match op {
            //
            // --- Stack Management ---
            //
            PUSH => {
                let v = self.get_argument(0);
                self.push_int(v);
            }
            POP => {
                self.pop()?;
            }
            F_PUSH => {
                let v = self.get_argument_float(0);
                self.push(Value::float(v));
            }
            REF => {
                // dereference a reference to a value
                let (slot, index) = self.pop_ref()?;
                let v = self.var_get(slot, index)?;
                self.push(v);
            }
            REFREF => {
                // dereference a reference to a reference
                let (slot, index) = self.pop_ref()?;
                let page = self.var_get(slot, index)?;
                let var = self.var_get(slot, index + 1)?;
                self.push(page);
                self.push(var);
            }
            DUP => {
                // A -> AA
                let a = self.peek(0)?;
                self.push(a);
            }
            DUP2 => {
                // AB -> ABAB
                let a = self.peek(1)?;
                let b = self.peek(0)?;
                self.push(a);
                self.push(b);
            }
            DUP_X2 => {
                // ABC -> CABC
                let a = self.peek(2)?;
                let b = self.peek(1)?;
                let c = self.peek(0)?;
                self.set(2, c)?;
                self.set(1, a)?;
                self.set(0, b)?;
                self.push(c);
            }
            DUP2_X1 => {
                // ABC -> BCABC
                let a = self.peek(2)?;
                let b = self.peek(1)?;
                let c = self.peek(0)?;
                self.set(2, b)?;
                self.set(1, c)?;
                self.set(0, a)?;
                self.push(b);
                self.push(c);
            }
            DUP_U2 => {
                // AB -> ABA
                let a = self.peek(1)?;
                self.push(a);
            }
            SWAP => {
                let a = self.peek(1)?;
                let b = self.peek(0)?;
                self.set(1, b)?;
                self.set(0, a)?;
            }
            //
            // --- Variables ---
            //
            PUSHGLOBALPAGE => {
                self.push_int(GLOBAL_PAGE_SLOT);
            }
            PUSHLOCALPAGE => {
                let slot = self.local_page_slot()?;
                self.push_int(slot);
            }
            PUSHSTRUCTPAGE => {
                let slot = self.struct_page_slot()?;
                self.push_int(slot);
            }
            ASSIGN | F_ASSIGN | LI_ASSIGN => {
                let val = self.pop()?;
                let (slot, index) = self.pop_ref()?;
                self.var_set(slot, index, val)?;
                self.push(val);
            }
            SH_GLOBALREF => {
                let v = self.global_get(self.get_argument(0) as usize)?;
                self.push(v);
            }
            SH_LOCALREF => {
                let v = self.local_get(self.get_argument(0))?;
                self.push(v);
            }
            SH_STRUCTREF => {
                let v = self.var_get(self.struct_page_slot()?, self.get_argument(0))?;
                self.push(v);
            }
            SH_LOCALASSIGN => {
                self.local_set(self.get_argument(0), Value::int(self.get_argument(1)))?;
            }
            SH_LOCALINC => {
                let varno = self.get_argument(0);
                let v = self.local_get(varno)?.as_int();
                self.local_set(varno, Value::int(v.wrapping_add(1)))?;
            }
            SH_LOCALDEC => {
                let varno = self.get_argument(0);
                let v = self.local_get(varno)?.as_int();
                self.local_set(varno, Value::int(v.wrapping_sub(1)))?;
            }
            SH_LOCALDELETE => {
                let varno = self.get_argument(0);
                let slot = self.local_get(varno)?.as_int();
                if slot != -1 {
                    self.heap.release(&self.ain, slot)?;
                    self.local_set(varno, Value::int(-1))?;
                }
            }
            SH_LOCALCREATE => {
                // VARNO, STRUCTNO; the constructor call, if any, is emitted
                // separately by the compiler
                let varno = self.get_argument(0);
                let structno = self.get_argument(1);
                if structno < 0 || structno as usize >= self.ain.structures.len() {
                    return Err(VmError::BadStruct(structno));
                }
                let old = self.local_get(varno)?.as_int();
                if old != -1 {
                    self.heap.release(&self.ain, old)?;
                }
                let slot = page::alloc_struct(&mut self.heap, &self.ain, structno as usize)?;
                self.local_set(varno, Value::int(slot))?;
            }
            R_ASSIGN => {
                let src_var = self.pop_int()?;
                let src_page = self.pop_int()?;
                let dst_var = self.pop_int()?;
                let dst_page = self.pop_int()?;
                if src_page != -1 {
                    self.heap.retain(src_page)?;
                }
                let old = self.var_get(dst_page, dst_var)?.as_int();
                if old != -1 {
                    self.heap.release(&self.ain, old)?;
                }
                self.var_set(dst_page, dst_var, Value::int(src_page))?;
                self.var_set(dst_page, dst_var + 1, Value::int(src_var))?;
                self.push_int(src_page);
                self.push_int(src_var);
            }
            NEW => {
                let structno = self.pop_int()?;
                if structno < 0 || structno as usize >= self.ain.structures.len() {
                    return Err(VmError::BadStruct(structno));
                }
                let slot = page::alloc_struct(&mut self.heap, &self.ain, structno as usize)?;
                self.push_int(slot);
            }
            DELETE => {
                let slot = self.pop_int()?;
                if slot != -1 {
                    self.heap.release(&self.ain, slot)?;
                }
            }
            SP_INC => {
                let slot = self.pop_int()?;
                self.heap.retain(slot)?;
            }
            //
            // --- Control Flow ---
            //
            CALLFUNC => {
                let fno = self.get_argument(0);
                let ret = self.ip + op.width(self.ain.version) as u32;
                self.function_call(fno as usize, ret)?;
            }
            CALLFUNC2 => {
                self.pop()?; // function-type index, compile-time only
                let fno = self.pop_int()?;
                if fno < 0 {
                    return Err(VmError::BadFunction(fno));
                }
                let ret = self.ip + op.width(self.ain.version) as u32;
                self.function_call(fno as usize, ret)?;
            }
            CALLMETHOD => {
                let fno = self.get_argument(0);
                let ret = self.ip + op.width(self.ain.version) as u32;
                self.method_call(fno as usize, ret)?;
            }
            CALLHLL => {
                let lib = self.get_argument(0);
                let fun = self.get_argument(1);
                self.hll_call(lib, fun)?;
            }
            RETURN => {
                self.function_return()?;
            }
            CALLSYS => {
                let code = self.get_argument(0);
                self.system_call(code)?;
            }
            CALLONJUMP => {
                let str_slot = self.pop_int()?;
                let name = self.heap.string(str_slot)?.as_bytes().to_vec();
                let page_slot = self.alloc_scenario_page(&name)?;
                self.push_int(page_slot);
                self.heap.release(&self.ain, str_slot)?;
            }
            SJUMP => {
                let slot = self.pop_int()?;
                self.scenario_call(slot)?;
            }
            MSG => {
                let width = op.width(self.ain.version) as u32;
                let Some(msgf) = self.ain.msgf else {
                    self.ip += width;
                    return Ok(());
                };
                let index = self.get_argument(0);
                let message = self
                    .ain
                    .messages
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::BadIndex("message", index))?;
                self.push_int(index);
                self.push_int(self.ain.messages.len() as i32);
                self.push_string(message);
                self.function_call(msgf, self.ip + width)?;
            }
            JUMP => {
                self.ip = self.get_argument(0) as u32;
            }
            IFZ => {
                if self.pop_int()? == 0 {
                    self.ip = self.get_argument(0) as u32;
                } else {
                    self.ip += op.width(self.ain.version) as u32;
                }
            }
            IFNZ => {
                if self.pop_int()? != 0 {
                    self.ip = self.get_argument(0) as u32;
                } else {
                    self.ip += op.width(self.ain.version) as u32;
                }
            }
            SWITCH => {
                let no = self.get_argument(0);
                let val = self.pop_int()?;
                self.exec_switch(no, val)?;
            }
            STRSWITCH => {
                let no = self.get_argument(0);
                let slot = self.pop_int()?;
                self.exec_strswitch(no, slot)?;
                self.heap.release(&self.ain, slot)?;
            }
            ASSERT => {
                let line = self.pop_int()?;
                let file = self.pop_int()?;
                let expr = self.pop_int()?;
                if self.pop_int()? == 0 {
                    return Err(VmError::AssertionFailed {
                        file: self.heap.string(file)?.as_utf8_lossy().into_owned(),
                        line,
                        expr: self.heap.string(expr)?.as_utf8_lossy().into_owned(),
                    });
                }
                self.heap.release(&self.ain, file)?;
                self.heap.release(&self.ain, expr)?;
            }
            FUNC => {}
            //
            // --- Integer Arithmetic ---
            //
            INV => {
                let v = self.peek(0)?.as_int();
                self.set(0, Value::int(v.wrapping_neg()))?;
            }
            NOT => {
                let v = self.peek(0)?.as_int();
                self.set(0, Value::bool(v == 0))?;
            }
            COMPL => {
                let v = self.peek(0)?.as_int();
                self.set(0, Value::int(!v))?;
            }
            ADD => self.binop_int(|a, b| Ok(a.wrapping_add(b)))?,
            SUB => self.binop_int(|a, b| Ok(a.wrapping_sub(b)))?,
            MUL => self.binop_int(|a, b| Ok(a.wrapping_mul(b)))?,
            DIV => self.binop_int(int_div)?,
            MOD => self.binop_int(int_mod)?,
            AND => self.binop_int(|a, b| Ok(a & b))?,
            OR => self.binop_int(|a, b| Ok(a | b))?,
            XOR => self.binop_int(|a, b| Ok(a ^ b))?,
            LSHIFT => self.binop_int(|a, b| Ok(a.wrapping_shl(b as u32)))?,
            RSHIFT => self.binop_int(|a, b| Ok(a.wrapping_shr(b as u32)))?,
            LT => self.cmp_int(|a, b| a < b)?,
            GT => self.cmp_int(|a, b| a > b)?,
            LTE => self.cmp_int(|a, b| a <= b)?,
            GTE => self.cmp_int(|a, b| a >= b)?,
            NOTE => self.cmp_int(|a, b| a != b)?,
            EQUALE => self.cmp_int(|a, b| a == b)?,
            PLUSA => self.compound_int(|a, b| Ok(a.wrapping_add(b)))?,
            MINUSA => self.compound_int(|a, b| Ok(a.wrapping_sub(b)))?,
            MULA => self.compound_int(|a, b| Ok(a.wrapping_mul(b)))?,
            DIVA => self.compound_int(int_div)?,
            MODA => self.compound_int(int_mod)?,
            ANDA => self.compound_int(|a, b| Ok(a & b))?,
            ORA => self.compound_int(|a, b| Ok(a | b))?,
            XORA => self.compound_int(|a, b| Ok(a ^ b))?,
            LSHIFTA => self.compound_int(|a, b| Ok(a.wrapping_shl(b as u32)))?,
            RSHIFTA => self.compound_int(|a, b| Ok(a.wrapping_shr(b as u32)))?,
            INC => {
                let (slot, index) = self.pop_ref()?;
                let v = self.var_get(slot, index)?.as_int();
                self.var_set(slot, index, Value::int(v.wrapping_add(1)))?;
            }
            DEC => {
                let (slot, index) = self.pop_ref()?;
                let v = self.var_get(slot, index)?.as_int();
                self.var_set(slot, index, Value::int(v.wrapping_sub(1)))?;
            }
            ITOB => {
                let v = self.peek(0)?.as_int();
                self.set(0, Value::bool(v != 0))?;
            }
            //
            // --- 64-bit Integers ---
            //
            ITOLI => {
                let v = self.peek(0)?.as_int();
                self.set(0, Value::long(v as i64))?;
            }
            LI_ADD => self.binop_long(|a, b| Ok(a.wrapping_add(b)))?,
            LI_SUB => self.binop_long(|a, b| Ok(a.wrapping_sub(b)))?,
            LI_MUL => self.binop_long(|a, b| Ok(a.wrapping_mul(b)))?,
            LI_DIV => self.binop_long(long_div)?,
            LI_MOD => self.binop_long(long_mod)?,
            LI_PLUSA => self.compound_long(|a, b| Ok(a.wrapping_add(b)))?,
            LI_MINUSA => self.compound_long(|a, b| Ok(a.wrapping_sub(b)))?,
            LI_MULA => self.compound_long(|a, b| Ok(a.wrapping_mul(b)))?,
            LI_DIVA => self.compound_long(long_div)?,
            LI_MODA => self.compound_long(long_mod)?,
            LI_ANDA => self.compound_long(|a, b| Ok(a & b))?,
            LI_ORA => self.compound_long(|a, b| Ok(a | b))?,
            LI_XORA => self.compound_long(|a, b| Ok(a ^ b))?,
            LI_LSHIFTA => self.compound_long(|a, b| Ok(a.wrapping_shl(b as u32)))?,
            LI_RSHIFTA => self.compound_long(|a, b| Ok(a.wrapping_shr(b as u32)))?,
            LI_INC => {
                let (slot, index) = self.pop_ref()?;
                let v = self.var_get(slot, index)?.as_long();
                self.var_set(slot, index, Value::long(v.wrapping_add(1)))?;
            }
            LI_DEC => {
                let (slot, index) = self.pop_ref()?;
                let v = self.var_get(slot, index)?.as_long();
                self.var_set(slot, index, Value::long(v.wrapping_sub(1)))?;
            }
            //
            // --- Floating Point ---
            //
            FTOI => {
                let v = self.peek(0)?.as_float();
                self.set(0, Value::int(v as i32))?;
            }
            ITOF => {
                let v = self.peek(0)?.as_int();
                self.set(0, Value::float(v as f32))?;
            }
            F_INV => {
                let v = self.peek(0)?.as_float();
                self.set(0, Value::float(-v))?;
            }
            F_ADD => self.binop_float(|a, b| a + b)?,
            F_SUB => self.binop_float(|a, b| a - b)?,
            F_MUL => self.binop_float(|a, b| a * b)?,
            F_DIV => self.binop_float(|a, b| a / b)?,
            F_LT => self.cmp_float(|a, b| a < b)?,
            F_GT => self.cmp_float(|a, b| a > b)?,
            F_LTE => self.cmp_float(|a, b| a <= b)?,
            F_GTE => self.cmp_float(|a, b| a >= b)?,
            F_NOTE => self.cmp_float(|a, b| a != b)?,
            F_EQUALE => self.cmp_float(|a, b| a == b)?,
            F_PLUSA => self.compound_float(|a, b| a + b)?,
            F_MINUSA => self.compound_float(|a, b| a - b)?,
            F_MULA => self.compound_float(|a, b| a * b)?,
            F_DIVA => self.compound_float(|a, b| a / b)?,
            //
            // --- Strings ---
            //
            S_PUSH => {
                let index = self.get_argument(0);
                let s = self
                    .ain
                    .strings
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::BadIndex("string", index))?;
                self.push_string(s);
            }
            S_POP | SR_POP => {
                let slot = self.pop_int()?;
                self.heap.release(&self.ain, slot)?;
            }
            S_REF => {
                let (slot, index) = self.pop_ref()?;
                let str_slot = self.var_get(slot, index)?.as_int();
                let s = self.heap.string(str_slot)?.clone();
                self.push_string(s);
            }
            S_ASSIGN => {
                let rval = self.peek(0)?.as_int();
                let lval = self.peek(1)?.as_int();
                let s = self.heap.string(rval)?.clone();
                self.heap.set_string(lval, s)?;
                self.set(1, Value::int(rval))?;
                self.pop()?;
            }
            S_PLUSA => {
                let b = self.pop_int()?;
                let (slot, index) = self.pop_ref()?;
                let target = self.var_get(slot, index)?.as_int();
                let suffix = VmString::clone(self.heap.string(b)?);
                vm_string::string_append(self.heap.string_mut(target)?, &suffix);
                self.heap.release(&self.ain, b)?;
                let s = self.heap.string(target)?.clone();
                self.push_string(s);
            }
            S_PLUSA2 => {
                let a = self.peek(1)?.as_int();
                let b = self.peek(0)?.as_int();
                let suffix = VmString::clone(self.heap.string(b)?);
                vm_string::string_append(self.heap.string_mut(a)?, &suffix);
                self.heap.release(&self.ain, b)?;
                self.pop()?;
                self.pop()?;
                let s = self.heap.string(a)?.clone();
                self.push_string(s);
            }
            S_ADD => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let joined = VmString::concat(self.heap.string(a)?, self.heap.string(b)?);
                self.heap.release(&self.ain, a)?;
                self.heap.release(&self.ain, b)?;
                self.push_string(Rc::new(joined));
            }
            S_LT => self.cmp_string(|o| o.is_lt())?,
            S_GT => self.cmp_string(|o| o.is_gt())?,
            S_LTE => self.cmp_string(|o| o.is_le())?,
            S_GTE => self.cmp_string(|o| o.is_ge())?,
            S_NOTE => self.cmp_string(|o| o.is_ne())?,
            S_EQUALE => self.cmp_string(|o| o.is_eq())?,
            S_LENGTH => {
                let (slot, index) = self.pop_ref()?;
                let str_slot = self.var_get(slot, index)?.as_int();
                let len = self.heap.string(str_slot)?.len_chars();
                self.push_int(len as i32);
            }
            S_LENGTH2 => {
                let slot = self.pop_int()?;
                let len = self.heap.string(slot)?.len_chars();
                self.heap.release(&self.ain, slot)?;
                self.push_int(len as i32);
            }
            S_LENGTHBYTE => {
                let (slot, index) = self.pop_ref()?;
                let str_slot = self.var_get(slot, index)?.as_int();
                let len = self.heap.string(str_slot)?.len_bytes();
                self.push_int(len as i32);
            }
            S_LENGTHBYTE2 => {
                let slot = self.pop_int()?;
                let len = self.heap.string(slot)?.len_bytes();
                self.heap.release(&self.ain, slot)?;
                self.push_int(len as i32);
            }
            S_EMPTY => {
                let slot = self.pop_int()?;
                let empty = self.heap.string(slot)?.is_empty();
                self.heap.release(&self.ain, slot)?;
                self.push_bool(empty);
            }
            S_FIND => {
                let found = {
                    let haystack = self.peek_string(1)?;
                    let needle = self.peek_string(0)?;
                    haystack.find(needle)
                };
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.heap.release(&self.ain, b)?;
                self.heap.release(&self.ain, a)?;
                self.push_int(found);
            }
            S_GETPART => {
                let len = self.pop_int()?;
                let index = self.pop_int()?;
                let part = self.peek_string(0)?.copy(index, len);
                let slot = self.pop_int()?;
                self.heap.release(&self.ain, slot)?;
                self.push_string(Rc::new(part));
            }
            S_PUSHBACK2 => {
                let c = self.pop_int()?;
                let slot = self.pop_int()?;
                Rc::make_mut(self.heap.string_mut(slot)?).push_back(c as u32);
            }
            S_POPBACK2 => {
                let slot = self.pop_int()?;
                Rc::make_mut(self.heap.string_mut(slot)?).pop_back();
            }
            S_ERASE2 => {
                self.pop()?;
                let index = self.pop_int()?;
                let slot = self.pop_int()?;
                Rc::make_mut(self.heap.string_mut(slot)?).erase_at(index);
            }
            S_MOD => {
                if self.ain.version <= 8 {
                    self.pop()?; // type tag
                }
                let val = self.pop()?;
                let fmt_slot = self.pop_int()?;
                let result = {
                    let fmt = self.heap.string(fmt_slot)?.clone();
                    match vm_string::format_kind(&fmt) {
                        Some(b's') => {
                            let s = self.heap.string(val.as_int())?.clone();
                            let r = vm_string::string_format(&fmt, FormatArg::Str(&s));
                            self.heap.release(&self.ain, val.as_int())?;
                            r
                        }
                        Some(b'f') => vm_string::string_format(&fmt, FormatArg::Float(val.as_float())),
                        _ => vm_string::string_format(&fmt, FormatArg::Int(val.as_int())),
                    }
                };
                self.heap.release(&self.ain, fmt_slot)?;
                self.push_string(Rc::new(result));
            }
            I_STRING => {
                let n = self.pop_int()?;
                self.push_string(Rc::new(VmString::from_int(n)));
            }
            FTOS => {
                let precision = self.pop_int()?;
                let f = self.pop()?.as_float();
                self.push_string(Rc::new(VmString::from_float(f, precision)));
            }
            STOI => {
                let slot = self.pop_int()?;
                let n = atoi(self.heap.string(slot)?.as_bytes());
                self.heap.release(&self.ain, slot)?;
                self.push_int(n);
            }
            //
            // --- Characters ---
            //
            C_REF => {
                let index = self.pop_int()?;
                let slot = self.pop_int()?;
                let c = self.heap.string(slot)?.get_char(index);
                self.push_int(c);
            }
            C_ASSIGN => {
                let c = self.pop_int()?;
                let index = self.pop_int()?;
                let slot = self.pop_int()?;
                Rc::make_mut(self.heap.string_mut(slot)?).set_char(index, c as u32);
                self.push_int(c);
            }
            //
            // --- Structs ---
            //
            SR_REF => {
                let (slot, index) = self.pop_ref()?;
                let page_slot = self.var_get(slot, index)?.as_int();
                if page_slot == -1 {
                    return Err(VmError::NullDereference);
                }
                let copied = self.heap.copy_slot_page(&self.ain, page_slot)?;
                self.push_int(copied);
            }
            SR_ASSIGN => {
                self.pop()?; // struct type
                let rval = self.pop_int()?;
                let lval = self.pop_int()?;
                if lval == -1 || rval == -1 {
                    return Err(VmError::NullDereference);
                }
                let src = self.heap.page(rval)?.clone();
                let copied = self.heap.copy_page(&self.ain, &src)?;
                self.heap.set_page(&self.ain, lval, Some(copied))?;
                self.push_int(rval);
            }
            //
            // --- Arrays ---
            //
            A_ALLOC => {
                let (slot, data_type, struct_type, rank, dims) = self.pop_array_alloc_args()?;
                let new = page::alloc_array(&mut self.heap, &self.ain, data_type, struct_type, rank, &dims)?;
                self.heap.set_page(&self.ain, slot, Some(new))?;
            }
            A_REALLOC => {
                let (slot, data_type, struct_type, rank, dims) = self.pop_array_alloc_args()?;
                let old = self.heap.take_page(slot)?;
                let new = page::realloc_array(&mut self.heap, &self.ain, old, data_type, struct_type, rank, &dims)?;
                self.heap.set_page(&self.ain, slot, Some(new))?;
            }
            A_FREE => {
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                self.heap.set_page(&self.ain, array, None)?;
            }
            A_REF => {
                let array = self.pop_int()?;
                let copied = self.heap.copy_slot_page(&self.ain, array)?;
                self.push_int(copied);
            }
            A_NUMOF => {
                let rank = self.pop_int()?;
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                let n = page::array_numof(&self.heap, self.heap.page_opt(array)?, rank)?;
                self.push_int(n);
            }
            A_COPY => {
                let n = self.pop_int()?;
                let src_i = self.pop_int()?;
                let src = self.pop_int()?;
                let dst_i = self.pop_int()?;
                let (slot, index) = self.pop_ref()?;
                let dst = self.var_get(slot, index)?.as_int();
                let copied = self.array_copy(dst, dst_i, src, src_i, n)?;
                self.push_int(copied);
            }
            A_FILL => {
                let val = self.pop()?;
                let n = self.pop_int()?;
                let start = self.pop_int()?;
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                let filled = self.array_fill(array, start, n, val)?;
                self.push_int(filled);
            }
            A_PUSHBACK => {
                let val = self.pop()?;
                let varno = self.pop_int()?;
                let pageno = self.pop_int()?;
                let (data_type, struct_type) = self.array_var_type(pageno, varno)?;
                let array = self.var_get(pageno, varno)?.as_int();
                self.array_pushback(array, val, data_type, struct_type)?;
            }
            A_POPBACK => {
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                self.array_popback(array)?;
            }
            A_EMPTY => {
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                let empty = self.heap.page_opt(array)?.is_none();
                self.push_bool(empty);
            }
            A_ERASE => {
                let index = self.pop_int()?;
                let (slot, varno) = self.pop_ref()?;
                let array = self.var_get(slot, varno)?.as_int();
                let ok = self.array_erase(array, index)?;
                self.push_bool(ok);
            }
            A_INSERT => {
                let val = self.pop()?;
                let index = self.pop_int()?;
                let varno = self.pop_int()?;
                let pageno = self.pop_int()?;
                let (data_type, struct_type) = self.array_var_type(pageno, varno)?;
                let array = self.var_get(pageno, varno)?.as_int();
                self.array_insert(array, index, val, data_type, struct_type)?;
            }
            A_SORT => {
                let fno = self.pop_int()?;
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                self.array_sort(array, fno)?;
            }
            A_FIND => {
                let fno = self.pop_int()?;
                let v = self.pop()?;
                let end = self.pop_int()?;
                let start = self.pop_int()?;
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                let found = self.array_find(array, start, end, v, fno)?;
                self.push_int(found);
            }
            A_REVERSE => {
                let (slot, index) = self.pop_ref()?;
                let array = self.var_get(slot, index)?.as_int();
                if self.heap.page_opt(array)?.is_some() {
                    self.heap.page_mut(array)?.values.reverse();
                }
            }
            _ => return Err(VmError::UnimplementedInstruction(op.name())),
        }
        Ok(())
    }

    // --- switch dispatch ---

    fn switch_table(&self, no: i32) -> VmResult<&crate::ain::Switch> {
        self.ain
            .switches
            .get(no as usize)
            .ok_or(VmError::BadIndex("switch", no))
    }

    fn exec_switch(&mut self, no: i32, val: i32) -> VmResult<()> {
        let (target, default) = {
            let s = self.switch_table(no)?;
            let hit = s.cases.iter().find(|c| c.value == val).map(|c| c.address);
            (hit, s.default_address)
        };
        match target {
            Some(addr) => self.ip = addr,
            None if default > 0 => self.ip = default as u32,
            None => self.ip += Opcode::SWITCH.width(self.ain.version) as u32,
        }
        Ok(())
    }

    fn exec_strswitch(&mut self, no: i32, str_slot: i32) -> VmResult<()> {
        let bytes = self.heap.string(str_slot)?.as_bytes().to_vec();
        let (target, default) = {
            let s = self.switch_table(no)?;
            let mut hit = None;
            for case in &s.cases {
                let case_str = self
                    .ain
                    .strings
                    .get(case.value as usize)
                    .ok_or(VmError::BadIndex("string", case.value))?;
                if case_str.as_bytes() == bytes {
                    hit = Some(case.address);
                    break;
                }
            }
            (hit, s.default_address)
        };
        match target {
            Some(addr) => self.ip = addr,
            None if default > 0 => self.ip = default as u32,
            None => self.ip += Opcode::STRSWITCH.width(self.ain.version) as u32,
        }
        Ok(())
    }

    // --- syscalls ---

    fn system_call(&mut self, code: i32) -> VmResult<()> {
        match code {
            instructions::SYS_EXIT => {
                let status = self.pop_int()?;
                Err(VmError::Exit(status))
            }
            instructions::SYS_LOCK_PEEK | instructions::SYS_UNLOCK_PEEK => {
                self.push_int(1);
                Ok(())
            }
            instructions::SYS_OUTPUT => {
                // the caller pops the argument afterwards
                let text = self.peek_string(0)?.as_utf8_lossy().into_owned();
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
                Ok(())
            }
            instructions::SYS_GET_SAVE_FOLDER_NAME => {
                let s = match &self.save_dir {
                    Some(dir) => VmString::from_bytes(dir),
                    None => VmString::empty(),
                };
                self.push_string(Rc::new(s));
                Ok(())
            }
            instructions::SYS_GET_TIME => {
                self.push_int(self.started.elapsed().as_millis() as i32);
                Ok(())
            }
            instructions::SYS_PEEK => Ok(()),
            instructions::SYS_SLEEP => {
                self.pop()?;
                Ok(())
            }
            _ => {
                warn!("Unimplemented syscall: {code:#X}");
                for name in self.stack_trace() {
                    debug!("\t{name}");
                }
                Ok(())
            }
        }
    }

    // --- HLL dispatch ---

    fn hll_call(&mut self, libno: i32, fno: i32) -> VmResult<()> {
        let lib = self
            .ain
            .libraries
            .get(libno as usize)
            .ok_or(VmError::BadIndex("library", libno))?;
        let decl = lib
            .functions
            .get(fno as usize)
            .ok_or(VmError::BadIndex("library function", fno))?;
        let Some(fun) = self.libraries[libno as usize].functions[fno as usize] else {
            return Err(VmError::UnlinkedCall(
                lib.name.as_utf8_lossy().into_owned(),
                decl.name.as_utf8_lossy().into_owned(),
            ));
        };

        let arg_types: Vec<DataType> = decl.arguments.iter().map(|a| a.data_type).collect();
        let return_type = decl.data_type;

        let mut args = Vec::with_capacity(arg_types.len());
        for ty in arg_types.iter().rev() {
            match ty {
                DataType::RefInt | DataType::RefBool | DataType::RefFloat => {
                    let var = self.pop_int()?;
                    let page = self.pop_int()?;
                    args.push(HllArg::Ref { page, var });
                }
                _ => {
                    let v = self.pop()?;
                    args.push(HllArg::Value(v));
                }
            }
        }
        args.reverse();

        let result = fun(self, &args)?;

        // the host borrowed reference arguments; only value arguments are
        // finalized here
        for (arg, ty) in args.iter().zip(&arg_types) {
            if let HllArg::Value(v) = arg {
                if !ty.is_ref() {
                    self.heap.release_value(&self.ain, *v, *ty)?;
                }
            }
        }
        if return_type != DataType::Void {
            self.push(result.unwrap_or(Value::int(0)));
        }
        Ok(())
    }

    /// Read a value through a borrowed HLL reference argument.
    pub fn hll_ref_get(&self, arg: &HllArg) -> VmResult<Value> {
        match arg {
            HllArg::Ref { page, var } => self.var_get(*page, *var),
            HllArg::Value(_) => Err(VmError::NullDereference),
        }
    }

    /// Write a value through a borrowed HLL reference argument.
    pub fn hll_ref_set(&mut self, arg: &HllArg, v: Value) -> VmResult<()> {
        match arg {
            HllArg::Ref { page, var } => self.var_set(*page, *var, v),
            HllArg::Value(_) => Err(VmError::NullDereference),
        }
    }

    /// Resolve an HLL string argument to its bytes.
    pub fn hll_string_arg(&self, arg: &HllArg) -> VmResult<&Rc<VmString>> {
        match arg {
            HllArg::Value(v) => self.heap.string(v.as_int()),
            HllArg::Ref { .. } => Err(VmError::NullDereference),
        }
    }

    // --- array operations that re-enter the interpreter or need the
    //     deep-copy rules ---

    fn pop_array_alloc_args(&mut self) -> VmResult<(i32, DataType, i32, i32, Vec<Value>)> {
        let rank = self.pop_int()?;
        if rank < 1 || rank as usize > self.stack.len() {
            return Err(VmError::BadArrayRank(rank));
        }
        let dims = self.stack.split_off(self.stack.len() - rank as usize);
        let varno = self.pop_int()?;
        let pageno = self.pop_int()?;
        let (data_type, struct_type) = self.array_var_type(pageno, varno)?;
        let slot = self.var_get(pageno, varno)?.as_int();
        Ok((slot, data_type, struct_type, rank, dims))
    }

    fn array_copy(&mut self, dst: i32, dst_i: i32, src: i32, src_i: i32, n: i32) -> VmResult<i32> {
        if n <= 0 {
            return Ok(0);
        }
        let (elem_type, _) = self.element_type(src)?;
        let src_len = self.heap.page_opt(src)?.map_or(0, |p| p.values.len());
        let dst_len = self.heap.page_opt(dst)?.map_or(0, |p| p.values.len());
        if src_i < 0 || src_i as i64 + n as i64 > src_len as i64 {
            return Err(VmError::OutOfBoundsArray { index: src_i.saturating_add(n), len: src_len });
        }
        if dst_i < 0 || dst_i as i64 + n as i64 > dst_len as i64 {
            return Err(VmError::OutOfBoundsArray { index: dst_i.saturating_add(n), len: dst_len });
        }
        // deep-copy the source range first so overlapping self-copies stay
        // sound
        let src_cells: Vec<Value> = self.heap.page(src)?.values
            [src_i as usize..(src_i + n) as usize]
            .to_vec();
        let mut copies = Vec::with_capacity(n as usize);
        for cell in src_cells {
            copies.push(self.heap.copy_value(&self.ain, cell, elem_type)?);
        }
        let (dst_type, _) = self.element_type(dst)?;
        for (k, copy) in copies.into_iter().enumerate() {
            let old = self.heap.page(dst)?.values[dst_i as usize + k];
            self.heap.release_value(&self.ain, old, dst_type)?;
            self.heap.page_mut(dst)?.values[dst_i as usize + k] = copy;
        }
        Ok(n)
    }

    fn array_fill(&mut self, array: i32, start: i32, n: i32, val: Value) -> VmResult<i32> {
        let (elem_type, _) = self.element_type(array)?;
        let len = self.heap.page_opt(array)?.map_or(0, |p| p.values.len());
        let begin = start.max(0) as usize;
        let end = (start.saturating_add(n).max(0) as usize).min(len);
        let mut filled = 0;
        for i in begin..end.max(begin) {
            let old = self.heap.page(array)?.values[i];
            self.heap.release_value(&self.ain, old, elem_type)?;
            let copy = self.heap.copy_value(&self.ain, val, elem_type)?;
            self.heap.page_mut(array)?.values[i] = copy;
            filled += 1;
        }
        // the popped fill value itself is consumed
        self.heap.release_value(&self.ain, val, elem_type)?;
        Ok(filled)
    }

    fn array_pushback(
        &mut self,
        array: i32,
        val: Value,
        data_type: DataType,
        struct_type: i32,
    ) -> VmResult<()> {
        match self.heap.page_opt(array)? {
            Some(_) => self.heap.page_mut(array)?.values.push(val),
            None => {
                let page = Page {
                    kind: PageKind::Array { data_type, struct_type, rank: 1 },
                    values: vec![val],
                };
                self.heap.set_page(&self.ain, array, Some(page))?;
            }
        }
        Ok(())
    }

    fn array_popback(&mut self, array: i32) -> VmResult<()> {
        let (elem_type, _) = self.element_type(array)?;
        if self.heap.page_opt(array)?.is_none() {
            return Ok(());
        }
        let last = self.heap.page_mut(array)?.values.pop();
        if let Some(last) = last {
            self.heap.release_value(&self.ain, last, elem_type)?;
        }
        Ok(())
    }

    fn array_erase(&mut self, array: i32, index: i32) -> VmResult<bool> {
        let (elem_type, _) = self.element_type(array)?;
        let len = self.heap.page_opt(array)?.map_or(0, |p| p.values.len());
        if index < 0 || index as usize >= len {
            return Ok(false);
        }
        let removed = self.heap.page_mut(array)?.values.remove(index as usize);
        self.heap.release_value(&self.ain, removed, elem_type)?;
        Ok(true)
    }

    fn array_insert(
        &mut self,
        array: i32,
        index: i32,
        val: Value,
        data_type: DataType,
        struct_type: i32,
    ) -> VmResult<()> {
        match self.heap.page_opt(array)? {
            Some(page) => {
                let at = index.max(0).min(page.values.len() as i32) as usize;
                self.heap.page_mut(array)?.values.insert(at, val);
            }
            None => {
                let page = Page {
                    kind: PageKind::Array { data_type, struct_type, rank: 1 },
                    values: vec![val],
                };
                self.heap.set_page(&self.ain, array, Some(page))?;
            }
        }
        Ok(())
    }

    fn array_sort(&mut self, array: i32, fno: i32) -> VmResult<()> {
        if fno < 0 || fno as usize >= self.ain.functions.len() {
            return Err(VmError::BadFunction(fno));
        }
        let len = self.heap.page_opt(array)?.map_or(0, |p| p.values.len());
        // insertion sort: stable, and re-entering the comparator between
        // swaps is straightforward
        for i in 1..len {
            let mut j = i;
            while j > 0 && self.sort_compare(fno as usize, array, j, j - 1)? < 0 {
                self.heap.page_mut(array)?.values.swap(j, j - 1);
                j -= 1;
            }
        }
        Ok(())
    }

    // Call the comparator with references to elements `ia` and `ib`.
    fn sort_compare(&mut self, fno: usize, array: i32, ia: usize, ib: usize) -> VmResult<i32> {
        self.push_int(array);
        self.push_int(ia as i32);
        self.push_int(array);
        self.push_int(ib as i32);
        self.call_function(fno)?;
        self.pop_int()
    }

    fn array_find(
        &mut self,
        array: i32,
        start: i32,
        end: i32,
        v: Value,
        fno: i32,
    ) -> VmResult<i32> {
        let (elem_type, _) = self.element_type(array)?;
        let len = self.heap.page_opt(array)?.map_or(0, |p| p.values.len());
        let begin = start.max(0) as usize;
        let stop = (end.max(0) as usize).min(len);
        let mut found = -1;
        for i in begin..stop.max(begin) {
            let elem = self.heap.page(array)?.values[i];
            let hit = if fno > 0 {
                let a = self.heap.copy_value(&self.ain, elem, elem_type)?;
                let b = self.heap.copy_value(&self.ain, v, elem_type)?;
                self.push(a);
                self.push(b);
                self.call_function(fno as usize)?;
                self.pop_int()? != 0
            } else if elem_type == DataType::String {
                self.heap.string(elem.as_int())?.as_bytes()
                    == self.heap.string(v.as_int())?.as_bytes()
            } else {
                elem.as_long() == v.as_long()
            };
            if hit {
                found = i as i32;
                break;
            }
        }
        self.heap.release_value(&self.ain, v, elem_type)?;
        Ok(found)
    }
}

fn int_div(a: i32, b: i32) -> VmResult<i32> {
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(a.wrapping_div(b))
}

fn int_mod(a: i32, b: i32) -> VmResult<i32> {
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(a.wrapping_rem(b))
}

fn long_div(a: i64, b: i64) -> VmResult<i64> {
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(a.wrapping_div(b))
}

fn long_mod(a: i64, b: i64) -> VmResult<i64> {
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(a.wrapping_rem(b))
}

// C atoi: optional whitespace and sign, then leading digits, clamped.
fn atoi(bytes: &[u8]) -> i32 {
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    let mut acc: i64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        acc = acc * 10 + (bytes[i] - b'0') as i64;
        if acc > i32::MAX as i64 + 1 {
            acc = i32::MAX as i64 + 1;
            break;
        }
        i += 1;
    }
    if negative {
        (-acc).max(i32::MIN as i64) as i32
    } else {
        acc.min(i32::MAX as i64) as i32
    }
}
