//! Host library ("HLL") dispatch.
//!
//! The image declares external libraries by name; at startup each declared
//! function is resolved by name against the built-in registry. Missing
//! libraries and functions are link warnings; calling an unresolved slot is
//! a fatal trap.

use log::warn;

use crate::ain::Ain;
use crate::page::Value;
use crate::vm::{Vm, VmError, VmResult};

pub const HLL_MAX_ARGS: usize = 64;

/// A marshalled call argument: plain values are popped as cells, reference
/// arguments as their two-cell pair, borrowed by the host for the duration
/// of the call.
#[derive(Debug, Clone, Copy)]
pub enum HllArg {
    Value(Value),
    Ref { page: i32, var: i32 },
}

impl HllArg {
    pub fn value(&self) -> Value {
        match self {
            HllArg::Value(v) => *v,
            HllArg::Ref { .. } => Value::int(-1),
        }
    }

    pub fn as_int(&self) -> i32 {
        self.value().as_int()
    }

    pub fn as_float(&self) -> f32 {
        self.value().as_float()
    }
}

pub type HllImpl = fn(&mut Vm, &[HllArg]) -> VmResult<Option<Value>>;

pub struct HostFunction {
    pub name: &'static str,
    pub fun: HllImpl,
}

pub struct HostLibrary {
    pub name: &'static str,
    pub functions: &'static [HostFunction],
}

/// Per-image-library table of resolved callbacks, parallel to the declared
/// function list.
pub struct LinkedLibrary {
    pub functions: Vec<Option<HllImpl>>,
}

pub fn find_library(name: &[u8]) -> Option<&'static HostLibrary> {
    LIBRARIES
        .iter()
        .copied()
        .find(|lib| lib.name.as_bytes() == name)
}

/// Resolve every declared library function against the host registry.
pub fn link(ain: &Ain) -> VmResult<Vec<LinkedLibrary>> {
    let mut linked = Vec::with_capacity(ain.libraries.len());
    for lib in &ain.libraries {
        let host = find_library(lib.name.as_bytes());
        if host.is_none() {
            warn!("Unimplemented library: {}", lib.name);
        }
        let mut functions = Vec::with_capacity(lib.functions.len());
        for f in &lib.functions {
            if f.arguments.len() >= HLL_MAX_ARGS {
                return Err(VmError::TooManyHllArguments(
                    f.name.as_utf8_lossy().into_owned(),
                ));
            }
            let fun = host.and_then(|h| {
                h.functions
                    .iter()
                    .find(|hf| hf.name.as_bytes() == f.name.as_bytes())
                    .map(|hf| hf.fun)
            });
            if host.is_some() && fun.is_none() {
                warn!("Unimplemented library function: {}.{}", lib.name, f.name);
            }
            functions.push(fun);
        }
        linked.push(LinkedLibrary { functions });
    }
    Ok(linked)
}

macro_rules! hll_unimplemented {
    ($lib:literal, $display:literal, $name:ident) => {
        fn $name(_vm: &mut Vm, _args: &[HllArg]) -> VmResult<Option<Value>> {
            Err(VmError::UnlinkedCall($lib.to_string(), $display.to_string()))
        }
    };
}

macro_rules! hll_warn_unimplemented {
    ($lib:literal, $display:literal, $name:ident) => {
        fn $name(_vm: &mut Vm, _args: &[HllArg]) -> VmResult<Option<Value>> {
            warn!(concat!("Unimplemented HLL function: ", $lib, ".", $display));
            Ok(Some(Value::int(0)))
        }
    };
}

// --- Math ---

fn deg2rad(deg: f32) -> f32 {
    deg * (std::f32::consts::PI / 180.0)
}

fn math_cos(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(deg2rad(args[0].as_float()).cos())))
}

fn math_sin(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(deg2rad(args[0].as_float()).sin())))
}

fn math_sqrt(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().sqrt())))
}

fn math_atan(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().atan())))
}

fn math_atan2(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().atan2(args[1].as_float()))))
}

fn math_abs(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::int(args[0].as_int().wrapping_abs())))
}

fn math_abs_f(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().abs())))
}

fn math_pow(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().powf(args[1].as_float()))))
}

fn math_set_seed(vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    vm.rand_state = args[0].as_int() as u32;
    Ok(Some(Value::int(0)))
}

fn math_rand(vm: &mut Vm, _args: &[HllArg]) -> VmResult<Option<Value>> {
    vm.rand_state = vm.rand_state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    Ok(Some(Value::int(((vm.rand_state >> 16) & 0x7FFF) as i32)))
}

fn math_min(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::int(args[0].as_int().min(args[1].as_int()))))
}

fn math_min_f(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().min(args[1].as_float()))))
}

fn math_max(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::int(args[0].as_int().max(args[1].as_int()))))
}

fn math_max_f(_vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    Ok(Some(Value::float(args[0].as_float().max(args[1].as_float()))))
}

fn math_swap(vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    let a = vm.hll_ref_get(&args[0])?;
    let b = vm.hll_ref_get(&args[1])?;
    vm.hll_ref_set(&args[0], b)?;
    vm.hll_ref_set(&args[1], a)?;
    Ok(Some(Value::int(0)))
}

hll_unimplemented!("Math", "SetRandMode", math_set_rand_mode);
hll_unimplemented!("Math", "RandF", math_rand_f);
hll_unimplemented!("Math", "RandTableInit", math_rand_table_init);
hll_unimplemented!("Math", "RandTable", math_rand_table);
hll_unimplemented!("Math", "RandTable2Init", math_rand_table2_init);
hll_unimplemented!("Math", "RandTable2", math_rand_table2);

static MATH: HostLibrary = HostLibrary {
    name: "Math",
    functions: &[
        HostFunction { name: "Cos", fun: math_cos },
        HostFunction { name: "Sin", fun: math_sin },
        HostFunction { name: "Sqrt", fun: math_sqrt },
        HostFunction { name: "Atan", fun: math_atan },
        HostFunction { name: "Atan2", fun: math_atan2 },
        HostFunction { name: "Abs", fun: math_abs },
        HostFunction { name: "AbsF", fun: math_abs_f },
        HostFunction { name: "Pow", fun: math_pow },
        HostFunction { name: "SetSeed", fun: math_set_seed },
        HostFunction { name: "SetRandMode", fun: math_set_rand_mode },
        HostFunction { name: "Rand", fun: math_rand },
        HostFunction { name: "RandF", fun: math_rand_f },
        HostFunction { name: "RandTableInit", fun: math_rand_table_init },
        HostFunction { name: "RandTable", fun: math_rand_table },
        HostFunction { name: "RandTable2Init", fun: math_rand_table2_init },
        HostFunction { name: "RandTable2", fun: math_rand_table2 },
        HostFunction { name: "Min", fun: math_min },
        HostFunction { name: "MinF", fun: math_min_f },
        HostFunction { name: "Max", fun: math_max },
        HostFunction { name: "MaxF", fun: math_max_f },
        HostFunction { name: "Swap", fun: math_swap },
        HostFunction { name: "SwapF", fun: math_swap },
    ],
};

// --- OutputLog ---

fn output_log_output(vm: &mut Vm, args: &[HllArg]) -> VmResult<Option<Value>> {
    use std::io::Write as _;
    let text = vm.hll_string_arg(&args[1])?.as_utf8_lossy().into_owned();
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
    Ok(Some(Value::int(0)))
}

hll_warn_unimplemented!("OutputLog", "Create", output_log_create);
hll_warn_unimplemented!("OutputLog", "Clear", output_log_clear);
hll_warn_unimplemented!("OutputLog", "Save", output_log_save);
hll_warn_unimplemented!("OutputLog", "EnableAutoSave", output_log_enable_auto_save);
hll_warn_unimplemented!("OutputLog", "DisableAutoSave", output_log_disable_auto_save);

static OUTPUT_LOG: HostLibrary = HostLibrary {
    name: "OutputLog",
    functions: &[
        HostFunction { name: "Create", fun: output_log_create },
        HostFunction { name: "Output", fun: output_log_output },
        HostFunction { name: "Clear", fun: output_log_clear },
        HostFunction { name: "Save", fun: output_log_save },
        HostFunction { name: "EnableAutoSave", fun: output_log_enable_auto_save },
        HostFunction { name: "DisableAutoSave", fun: output_log_disable_auto_save },
    ],
};

pub static LIBRARIES: &[&HostLibrary] = &[&MATH, &OUTPUT_LOG];
