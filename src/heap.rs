//! The reference-counted heap.
//!
//! A flat table of slots, each holding either a page or a string. Slots are
//! recycled through a free-list, so allocation and release are O(1) outside
//! of the recursive teardown itself. Releasing a slot whose count already
//! reached zero is a fatal trap, never a silent decrement.

use std::rc::Rc;

use crate::ain::{Ain, DataType};
use crate::page::Page;
use crate::vm::{VmError, VmResult};
use crate::vm_string::VmString;

const HEAP_ALLOC_STEP: usize = 4096;

#[derive(Debug, Clone)]
pub enum HeapValue {
    /// `None` is an allocated-but-empty array slot (`A_FREE`d or not yet
    /// `A_ALLOC`ed).
    Page(Option<Page>),
    String(Rc<VmString>),
}

#[derive(Debug, Default)]
struct Slot {
    ref_count: i32,
    value: Option<HeapValue>,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    fn grow(&mut self) {
        let start = self.slots.len();
        self.slots
            .extend((0..HEAP_ALLOC_STEP).map(|_| Slot::default()));
        // reversed so that low slot numbers are handed out first
        self.free.extend((start..start + HEAP_ALLOC_STEP).rev());
    }

    pub fn alloc(&mut self, value: HeapValue) -> i32 {
        if self.free.is_empty() {
            self.grow();
        }
        let slot = self.free.pop().unwrap();
        self.slots[slot] = Slot { ref_count: 1, value: Some(value) };
        slot as i32
    }

    pub fn alloc_string(&mut self, s: Rc<VmString>) -> i32 {
        self.alloc(HeapValue::String(s))
    }

    fn slot(&self, slot: i32) -> VmResult<&Slot> {
        self.slots
            .get(slot as usize)
            .filter(|s| s.value.is_some())
            .ok_or(VmError::BadSlot(slot))
    }

    pub fn get(&self, slot: i32) -> VmResult<&HeapValue> {
        Ok(self.slot(slot)?.value.as_ref().unwrap())
    }

    pub fn ref_count(&self, slot: i32) -> VmResult<i32> {
        Ok(self.slot(slot)?.ref_count)
    }

    /// The page stored at `slot`; trap if the slot holds no page at all
    /// (freed arrays yield an error here too, like a null page would).
    pub fn page(&self, slot: i32) -> VmResult<&Page> {
        match self.get(slot)? {
            HeapValue::Page(Some(page)) => Ok(page),
            HeapValue::Page(None) => Err(VmError::NullDereference),
            HeapValue::String(_) => Err(VmError::NotAPage(slot)),
        }
    }

    pub fn page_mut(&mut self, slot: i32) -> VmResult<&mut Page> {
        let s = self
            .slots
            .get_mut(slot as usize)
            .filter(|s| s.value.is_some())
            .ok_or(VmError::BadSlot(slot))?;
        match s.value.as_mut().unwrap() {
            HeapValue::Page(Some(page)) => Ok(page),
            HeapValue::Page(None) => Err(VmError::NullDereference),
            HeapValue::String(_) => Err(VmError::NotAPage(slot)),
        }
    }

    /// The page option for slots where an empty array is a valid state.
    pub fn page_opt(&self, slot: i32) -> VmResult<Option<&Page>> {
        match self.get(slot)? {
            HeapValue::Page(page) => Ok(page.as_ref()),
            HeapValue::String(_) => Err(VmError::NotAPage(slot)),
        }
    }

    pub fn string(&self, slot: i32) -> VmResult<&Rc<VmString>> {
        match self.get(slot)? {
            HeapValue::String(s) => Ok(s),
            HeapValue::Page(_) => Err(VmError::NotAString(slot)),
        }
    }

    pub fn string_mut(&mut self, slot: i32) -> VmResult<&mut Rc<VmString>> {
        let s = self
            .slots
            .get_mut(slot as usize)
            .filter(|s| s.value.is_some())
            .ok_or(VmError::BadSlot(slot))?;
        match s.value.as_mut().unwrap() {
            HeapValue::String(s) => Ok(s),
            HeapValue::Page(_) => Err(VmError::NotAString(slot)),
        }
    }

    /// Replace the string in `slot`, keeping the slot's reference count.
    pub fn set_string(&mut self, slot: i32, s: Rc<VmString>) -> VmResult<()> {
        *self.string_mut(slot)? = s;
        Ok(())
    }

    /// Detach and return the page content of `slot` without tearing it down.
    pub fn take_page(&mut self, slot: i32) -> VmResult<Option<Page>> {
        let s = self
            .slots
            .get_mut(slot as usize)
            .filter(|s| s.value.is_some())
            .ok_or(VmError::BadSlot(slot))?;
        match s.value.as_mut().unwrap() {
            HeapValue::Page(p) => Ok(p.take()),
            HeapValue::String(_) => Err(VmError::NotAPage(slot)),
        }
    }

    /// Replace the page content of `slot`, tearing down the old content.
    /// The slot's own reference count is unchanged.
    pub fn set_page(&mut self, ain: &Ain, slot: i32, page: Option<Page>) -> VmResult<()> {
        let old = {
            let s = self
                .slots
                .get_mut(slot as usize)
                .filter(|s| s.value.is_some())
                .ok_or(VmError::BadSlot(slot))?;
            match s.value.as_mut().unwrap() {
                HeapValue::Page(p) => std::mem::replace(p, page),
                HeapValue::String(_) => return Err(VmError::NotAPage(slot)),
            }
        };
        if let Some(old) = old {
            self.delete_page(ain, old)?;
        }
        Ok(())
    }

    pub fn retain(&mut self, slot: i32) -> VmResult<()> {
        let s = self
            .slots
            .get_mut(slot as usize)
            .filter(|s| s.value.is_some())
            .ok_or(VmError::BadSlot(slot))?;
        s.ref_count += 1;
        Ok(())
    }

    /// Drop one reference; at zero, recursively tear down owned children and
    /// return the slot to the free-list.
    pub fn release(&mut self, ain: &Ain, slot: i32) -> VmResult<()> {
        let s = self
            .slots
            .get_mut(slot as usize)
            .ok_or(VmError::BadSlot(slot))?;
        if s.ref_count <= 0 || s.value.is_none() {
            return Err(VmError::DoubleFree(slot));
        }
        s.ref_count -= 1;
        if s.ref_count > 0 {
            return Ok(());
        }
        let value = s.value.take();
        self.free.push(slot as usize);
        if let Some(HeapValue::Page(Some(page))) = value {
            self.delete_page(ain, page)?;
        }
        Ok(())
    }

    /// Release the owned children of a page that has already been detached
    /// from its slot.
    fn delete_page(&mut self, ain: &Ain, page: Page) -> VmResult<()> {
        for (i, v) in page.values.iter().enumerate() {
            let (data_type, _) = page.var_type(ain, i);
            self.release_value(ain, *v, data_type)?;
        }
        Ok(())
    }

    /// Type-directed release of one cell. Strings always hold a live slot;
    /// struct, array and reference cells use -1 as the null handle.
    pub fn release_value(
        &mut self,
        ain: &Ain,
        v: crate::page::Value,
        data_type: DataType,
    ) -> VmResult<()> {
        match data_type {
            DataType::String => self.release(ain, v.as_int()),
            t if t == DataType::Struct || t.is_array() || t.is_ref() => {
                if v.as_int() != -1 {
                    self.release(ain, v.as_int())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Type-directed deep copy of one cell, for assignment into a new owner.
    /// Strings and aggregates get fresh slots; reference cells are shared and
    /// retained; scalars copy verbatim.
    pub fn copy_value(
        &mut self,
        ain: &Ain,
        v: crate::page::Value,
        data_type: DataType,
    ) -> VmResult<crate::page::Value> {
        use crate::page::Value;
        match data_type {
            DataType::String => {
                let dup = VmString::clone(self.string(v.as_int())?);
                Ok(Value::int(self.alloc_string(Rc::new(dup))))
            }
            t if t == DataType::Struct || t.is_array() => {
                if v.as_int() == -1 {
                    return Ok(v);
                }
                let slot = self.copy_slot_page(ain, v.as_int())?;
                Ok(Value::int(slot))
            }
            t if t.is_ref() => {
                if v.as_int() != -1 {
                    self.retain(v.as_int())?;
                }
                Ok(v)
            }
            _ => Ok(v),
        }
    }

    /// Allocate a fresh slot holding a deep copy of the page in `slot`.
    pub fn copy_slot_page(&mut self, ain: &Ain, slot: i32) -> VmResult<i32> {
        let src = self.page_opt(slot)?.cloned();
        let copied = match src {
            Some(page) => Some(self.copy_page(ain, &page)?),
            None => None,
        };
        Ok(self.alloc(HeapValue::Page(copied)))
    }

    /// Recursive page copy: same shape, fresh owned children.
    pub fn copy_page(&mut self, ain: &Ain, src: &Page) -> VmResult<Page> {
        let mut values = Vec::with_capacity(src.values.len());
        for (i, v) in src.values.iter().enumerate() {
            let (data_type, _) = src.var_type(ain, i);
            values.push(self.copy_value(ain, *v, data_type)?);
        }
        Ok(Page { kind: src.kind, values })
    }

    /// Number of live slots; zero after a clean shutdown.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }
}
