//! Pages: the fixed-width records backing globals, locals, struct instances
//! and arrays, plus the cells they are made of.

use std::rc::Rc;

use crate::ain::{Ain, DataType};
use crate::heap::{Heap, HeapValue};
use crate::vm::{VmError, VmResult};
use crate::vm_string::VmString;

/// One stack or page cell. Interpreted as a signed 32-bit integer, a
/// bit-reinterpreted binary32 float, a heap slot index, or a 64-bit integer,
/// according to the declared type of whatever it backs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Value(i64);

impl Value {
    pub fn int(v: i32) -> Value {
        Value(v as i64)
    }

    pub fn float(v: f32) -> Value {
        Value(v.to_bits() as i64)
    }

    pub fn long(v: i64) -> Value {
        Value(v)
    }

    pub fn bool(v: bool) -> Value {
        Value(v as i64)
    }

    pub fn as_int(self) -> i32 {
        self.0 as i32
    }

    pub fn as_float(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn as_long(self) -> i64 {
        self.0
    }
}

/// What a page stores and which metadata table types its cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Global,
    Local { function: usize },
    Struct { struct_type: usize },
    Array { data_type: DataType, struct_type: i32, rank: i32 },
}

#[derive(Debug, Clone)]
pub struct Page {
    pub kind: PageKind,
    pub values: Vec<Value>,
}

impl Page {
    pub fn nr_vars(&self) -> usize {
        self.values.len()
    }

    /// Declared type of cell `varno`: `(data_type, struct_type)`. Cells past
    /// the metadata (which a well-formed image never produces) type as void.
    pub fn var_type(&self, ain: &Ain, varno: usize) -> (DataType, i32) {
        let var = match self.kind {
            PageKind::Global => ain.globals.get(varno).map(|g| &g.var),
            PageKind::Local { function } => {
                ain.functions.get(function).and_then(|f| f.vars.get(varno))
            }
            PageKind::Struct { struct_type } => ain
                .structures
                .get(struct_type)
                .and_then(|s| s.members.get(varno)),
            PageKind::Array { data_type, struct_type, rank } => {
                return if rank > 1 {
                    (data_type, struct_type)
                } else {
                    (data_type.element(), struct_type)
                };
            }
        };
        var.map_or((DataType::Void, -1), |v| (v.data_type, v.struct_type))
    }
}

/// Default cell value for a freshly created variable of the given type.
/// Strings get a fresh empty-string slot, structs a fully default-initialized
/// page, arrays an allocated-but-empty slot, references the null handle.
pub fn variable_initval(
    heap: &mut Heap,
    ain: &Ain,
    data_type: DataType,
    struct_type: i32,
) -> VmResult<Value> {
    if data_type.is_ref() {
        return Ok(Value::int(-1));
    }
    match data_type {
        DataType::String => Ok(Value::int(heap.alloc_string(Rc::new(VmString::empty())))),
        DataType::Struct => {
            if struct_type < 0 || struct_type as usize >= ain.structures.len() {
                return Err(VmError::BadStruct(struct_type));
            }
            alloc_struct(heap, ain, struct_type as usize).map(Value::int)
        }
        t if t.is_array() => Ok(Value::int(heap.alloc(HeapValue::Page(None)))),
        _ => Ok(Value::int(0)),
    }
}

/// Allocate a struct page with default-initialized members. The constructor,
/// if any, is invoked separately by the interpreter.
pub fn alloc_struct(heap: &mut Heap, ain: &Ain, struct_type: usize) -> VmResult<i32> {
    let nr_members = ain.structures[struct_type].members.len();
    let mut values = Vec::with_capacity(nr_members);
    for i in 0..nr_members {
        let m = &ain.structures[struct_type].members[i];
        values.push(variable_initval(heap, ain, m.data_type, m.struct_type)?);
    }
    Ok(heap.alloc(HeapValue::Page(Some(Page {
        kind: PageKind::Struct { struct_type },
        values,
    }))))
}

/// Build an array of the given rank. A rank-1 array holds default-initialized
/// elements; higher ranks hold slots of rank-1 sub-arrays, recursively.
pub fn alloc_array(
    heap: &mut Heap,
    ain: &Ain,
    data_type: DataType,
    struct_type: i32,
    rank: i32,
    dims: &[Value],
) -> VmResult<Page> {
    if rank < 1 || dims.is_empty() {
        return Err(VmError::BadArrayRank(rank));
    }
    let len = dims[0].as_int();
    if len < 0 {
        return Err(VmError::OutOfBoundsArray { index: len, len: 0 });
    }
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        if rank == 1 {
            values.push(variable_initval(heap, ain, data_type.element(), struct_type)?);
        } else {
            let sub = alloc_array(heap, ain, data_type, struct_type, rank - 1, &dims[1..])?;
            values.push(Value::int(heap.alloc(HeapValue::Page(Some(sub)))));
        }
    }
    Ok(Page {
        kind: PageKind::Array { data_type, struct_type, rank },
        values,
    })
}

/// Rebuild an array with new dimensions, preserving the elements that still
/// fit and default-initializing the growth.
pub fn realloc_array(
    heap: &mut Heap,
    ain: &Ain,
    old: Option<Page>,
    data_type: DataType,
    struct_type: i32,
    rank: i32,
    dims: &[Value],
) -> VmResult<Page> {
    let mut new = alloc_array(heap, ain, data_type, struct_type, rank, dims)?;
    let Some(mut old) = old else {
        return Ok(new);
    };
    let keep = old.values.len().min(new.values.len());
    for i in 0..keep {
        // keep the old element, hand its freshly made default back to `old`
        std::mem::swap(&mut new.values[i], &mut old.values[i]);
    }
    // `old` now holds the swapped-out defaults plus any elements past the new
    // length; tear them all down
    for i in 0..old.values.len() {
        let (elem_type, _) = old.var_type(ain, i);
        heap.release_value(ain, old.values[i], elem_type)?;
    }
    Ok(new)
}

/// Length along `rank` (1-based, matching the on-stack convention).
pub fn array_numof(heap: &Heap, page: Option<&Page>, rank: i32) -> VmResult<i32> {
    let Some(page) = page else {
        return Ok(0);
    };
    if rank <= 1 {
        return Ok(page.values.len() as i32);
    }
    match page.values.first() {
        Some(v) => array_numof(heap, heap.page_opt(v.as_int())?, rank - 1),
        None => Ok(0),
    }
}
