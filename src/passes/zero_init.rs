//! Zero-initialization of workgroup storage at the top of compute entry points.
//!
//! The shading languages this IR models require workgroup memory to read as
//! zero before the entry point's body runs, but nothing in straight-line
//! translation produces those stores. This pass synthesizes them: for each
//! compute entry point it finds every transitively referenced
//! workgroup-address-space variable (via [`ReferencedVars`]), decomposes each
//! variable's store type into leaf stores ([`decompose_var`]), groups leaves
//! by the number of invocations' worth of work they represent, and emits the
//! cheapest covering strategy per group ([`strategy_for`]) followed by exactly
//! one [`WorkgroupBarrier`](crate::InstKind::WorkgroupBarrier).
//!
//! All of an entry point's new instructions are spliced before its first
//! existing instruction, so the original body observes fully zeroed storage.

use crate::analyze::ReferencedVars;
use crate::{
    AddressSpace, ArrayCount, Builder, BuiltinValue, Function, FunctionParam, FxIndexMap, Module,
    Stage, Type, TypeKind, Value, Var, WorkgroupDim,
};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::mem;

#[derive(Debug, thiserror::Error)]
pub enum ZeroInitError {
    /// Array lengths reachable from workgroup storage must have been resolved
    /// to constants by earlier passes.
    #[error("workgroup variable `{var}` contains an array with no compile-time element count")]
    NonConstantArrayCount { var: String },
    #[error("iteration count overflows u32 while decomposing workgroup variable `{var}`")]
    IterationCountOverflow { var: String },
    #[error("workgroup size of entry point `{function}` overflows u32")]
    WorkgroupSizeOverflow { function: String },
}

/// One storable element of a workgroup variable, plus the index path that
/// reaches it from the variable's root pointer.
#[derive(Clone, Debug)]
pub struct StoreLeaf {
    pub var: Var,
    /// The leaf's own type (what gets stored): trivially zeroable, or atomic.
    pub ty: Type,
    pub index_path: SmallVec<[Index; 4]>,
    /// Invocations' worth of work to zero every element reachable through
    /// this leaf: the product of every array extent above it.
    pub iteration_count: u32,
}

/// One step of a [`StoreLeaf`]'s index path.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Index {
    /// Struct-member index or the slot of a length-1 array.
    Constant(u32),
    /// Array slot selected from the per-iteration counter `i`.
    Array(ArrayIndex),
}

/// Selects an array slot as `(i mod modulus) / division`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ArrayIndex {
    pub modulus: u32,
    pub division: u32,
}

/// How one iteration group's stores get covered by the workgroup.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Strategy {
    /// A plain block, every invocation stores. Never produced by
    /// [`strategy_for`]: a guard is kept even when every invocation has work.
    Unconditional,
    /// `if (i < N) { stores }`, each of the first `N` invocations zeroes one
    /// logical element.
    Guarded,
    /// `for (idx = i; idx < N; idx += W) { stores }`, invocations
    /// cooperatively cover all `N` elements.
    Looped,
}

/// Picks the emission strategy for a group of `iteration_count` stores given
/// the linear workgroup size (`None` when any dimension is override-controlled).
pub fn strategy_for(iteration_count: u32, workgroup_size: Option<u32>) -> Strategy {
    match workgroup_size {
        Some(size) if iteration_count <= size => Strategy::Guarded,
        _ => Strategy::Looped,
    }
}

/// Runs the pass over every compute entry point of `module`.
pub fn run(module: &mut Module) -> Result<(), ZeroInitError> {
    // Analysis phase: the cache is only valid against the unedited module, so
    // collect everything first and drop the analysis before mutating.
    let mut work: Vec<(Function, Vec<Var>)> = Vec::new();
    {
        let mut analysis = ReferencedVars::with_predicate(&*module, |m, var| {
            m.var_address_space(var) == AddressSpace::Workgroup
        });
        let entry_points: Vec<Function> = module
            .functions
            .iter()
            .filter(|(_, decl)| matches!(decl.stage, Some(Stage::Compute { .. })))
            .map(|(func, _)| func)
            .collect();
        for func in entry_points {
            let vars = analysis.transitive_references(Some(func));
            if vars.is_empty() {
                continue;
            }
            work.push((func, vars.iter().copied().collect()));
        }
    }
    for (func, vars) in work {
        log::debug!(
            "zero-initializing {} workgroup variable(s) in `{}`",
            vars.len(),
            module.functions[func].name
        );
        zero_init_entry_point(module, func, &vars)?;
    }
    Ok(())
}

/// Raw index-path step recorded while descending; the `{modulus, division}`
/// pair of an array step can only be fixed up once the leaf's total iteration
/// count is known.
#[derive(Copy, Clone)]
enum RawIndex {
    Constant(u32),
    /// `prefix` is the iteration count in effect when the array was entered.
    Array { prefix: u32, count: u32 },
}

/// Decomposes `var`'s store type into leaf stores, in declaration order.
pub fn decompose_var(module: &Module, var: Var) -> Result<Vec<StoreLeaf>, ZeroInitError> {
    decompose(module, var, module.var_store_type(var), 1, Vec::new())
}

fn decompose(
    module: &Module,
    var: Var,
    ty: Type,
    iteration_count: u32,
    path: Vec<RawIndex>,
) -> Result<Vec<StoreLeaf>, ZeroInitError> {
    if module.is_trivially_zeroable(ty) {
        return Ok(vec![leaf(var, ty, iteration_count, &path)]);
    }
    match &module.types[ty] {
        // Atomics need a dedicated store operation, but they are leaves.
        TypeKind::Atomic(_) => Ok(vec![leaf(var, ty, iteration_count, &path)]),
        TypeKind::Array { element, count } => {
            let count = match *count {
                ArrayCount::Constant(count) => count,
                ArrayCount::Runtime => {
                    return Err(ZeroInitError::NonConstantArrayCount {
                        var: var_name(module, var),
                    });
                }
            };
            let mut path = path;
            if count == 1 {
                path.push(RawIndex::Constant(0));
                decompose(module, var, *element, iteration_count, path)
            } else {
                path.push(RawIndex::Array { prefix: iteration_count, count });
                let total = iteration_count.checked_mul(count).ok_or_else(|| {
                    ZeroInitError::IterationCountOverflow { var: var_name(module, var) }
                })?;
                decompose(module, var, *element, total, path)
            }
        }
        // Struct members do not multiply the iteration count; only arrays do.
        TypeKind::Struct { members, .. } => {
            let mut leaves = Vec::new();
            for (i, member) in members.iter().enumerate() {
                let mut member_path = path.clone();
                member_path.push(RawIndex::Constant(i as u32));
                leaves.extend(decompose(module, var, member.ty, iteration_count, member_path)?);
            }
            Ok(leaves)
        }
        TypeKind::Scalar(_) | TypeKind::Vector { .. } | TypeKind::Matrix { .. } => {
            unreachable!("trivially zeroable type fell through the fast path")
        }
    }
}

fn leaf(var: Var, ty: Type, iteration_count: u32, path: &[RawIndex]) -> StoreLeaf {
    let index_path = path
        .iter()
        .map(|&raw| match raw {
            RawIndex::Constant(index) => Index::Constant(index),
            RawIndex::Array { prefix, count } => {
                // With the leaf's total now known, an array entered at
                // `prefix` iterations spans `iteration_count / prefix` of
                // them, `division` per slot.
                let modulus = iteration_count / prefix;
                Index::Array(ArrayIndex { modulus, division: modulus / count })
            }
        })
        .collect();
    StoreLeaf { var, ty, index_path, iteration_count }
}

fn var_name(module: &Module, var: Var) -> String {
    module.insts[var.0].name.clone().unwrap_or_else(|| format!("{:?}", var.0))
}

fn zero_init_entry_point(
    module: &mut Module,
    function: Function,
    vars: &[Var],
) -> Result<(), ZeroInitError> {
    let workgroup_size = match &module.functions[function].stage {
        Some(Stage::Compute { workgroup_size }) => *workgroup_size,
        _ => unreachable!("zero-init only runs on compute entry points"),
    };
    let linear = linear_workgroup_size(module, function, &workgroup_size)?;

    // Ascending iteration count keeps the emitted prologue reproducible.
    let mut groups: BTreeMap<u32, Vec<StoreLeaf>> = BTreeMap::new();
    for &var in vars {
        for leaf in decompose_var(module, var)? {
            groups.entry(leaf.iteration_count).or_default().push(leaf);
        }
    }

    let counter = local_invocation_index(module, function);
    let body = module.functions[function].body;
    let original = mem::take(&mut module.blocks[body].insts);

    let mut b = Builder::new(module, body);
    let mut step: Option<Value> = None;
    for (&n, leaves) in &groups {
        match strategy_for(n, linear) {
            Strategy::Unconditional => emit_stores(&mut b, counter, n, leaves),
            Strategy::Guarded => {
                let bound = b.const_u32(n);
                let cond = b.less_than(counter, bound);
                let then_block = b.if_(cond);
                let mut gb = b.in_block(then_block);
                emit_stores(&mut gb, counter, n, leaves);
            }
            Strategy::Looped => {
                let step = match step {
                    Some(step) => step,
                    None => {
                        let value = workgroup_step(&mut b, linear, &workgroup_size);
                        step = Some(value);
                        value
                    }
                };
                let u32_ty = b.module.ty_u32();
                let blocks = b.loop_();
                let idx = {
                    let mut ib = b.in_block(blocks.initializer);
                    ib.var("idx", AddressSpace::Function, u32_ty, Some(counter))
                };
                {
                    let mut lb = b.in_block(blocks.body);
                    let i = lb.load(idx.ptr());
                    let bound = lb.const_u32(n);
                    let done = lb.greater_eq(i, bound);
                    lb.break_if(done);
                    emit_stores(&mut lb, i, n, leaves);
                }
                {
                    let mut cb = b.in_block(blocks.continuing);
                    let current = cb.load(idx.ptr());
                    let next = cb.add(current, step);
                    cb.store(idx.ptr(), next);
                }
            }
        }
    }
    b.workgroup_barrier();

    module.blocks[body].insts.extend(original);
    Ok(())
}

/// The entry point's per-invocation linear index, synthesizing the parameter
/// if the entry point lacks one.
fn local_invocation_index(module: &mut Module, function: Function) -> Value {
    let existing = module.functions[function]
        .params
        .iter()
        .position(|param| param.builtin == Some(BuiltinValue::LocalInvocationIndex));
    if let Some(index) = existing {
        return Value::Param { func: function, index: index as u32 };
    }
    let ty = module.ty_u32();
    let decl = &mut module.functions[function];
    let index = decl.params.len() as u32;
    decl.params.push(FunctionParam {
        name: "local_invocation_index".into(),
        ty,
        builtin: Some(BuiltinValue::LocalInvocationIndex),
    });
    Value::Param { func: function, index }
}

/// Product of the fixed dimensions, or `None` when any dimension is only
/// known at pipeline creation.
fn linear_workgroup_size(
    module: &Module,
    function: Function,
    workgroup_size: &[WorkgroupDim; 3],
) -> Result<Option<u32>, ZeroInitError> {
    let mut product: u32 = 1;
    let mut known = true;
    for dim in workgroup_size {
        match *dim {
            WorkgroupDim::Fixed(n) => {
                product = product.checked_mul(n).ok_or_else(|| {
                    ZeroInitError::WorkgroupSizeOverflow {
                        function: module.functions[function].name.clone(),
                    }
                })?;
            }
            WorkgroupDim::Expr(_) => known = false,
        }
    }
    Ok(known.then_some(product))
}

/// The loop step: the linear workgroup size as an IR value. With
/// override-controlled dimensions this is a product expression built in place.
fn workgroup_step(
    b: &mut Builder<'_>,
    linear: Option<u32>,
    workgroup_size: &[WorkgroupDim; 3],
) -> Value {
    if let Some(size) = linear {
        return b.const_u32(size);
    }
    let mut fixed: u32 = 1;
    let mut value: Option<Value> = None;
    for dim in workgroup_size {
        match *dim {
            // Overflow of the fixed part was ruled out by
            // `linear_workgroup_size`.
            WorkgroupDim::Fixed(n) => fixed *= n,
            WorkgroupDim::Expr(expr) => {
                value = Some(match value {
                    Some(acc) => b.mul(acc, expr),
                    None => expr,
                });
            }
        }
    }
    let Some(value) = value else {
        return b.const_u32(fixed);
    };
    if fixed == 1 {
        value
    } else {
        let fixed = b.const_u32(fixed);
        b.mul(value, fixed)
    }
}

/// Emits one zero store per leaf, `counter`-indexed, into the current block.
///
/// The block first binds one index value per distinct `{modulus, division}`
/// pair used by the group, in first-use order, then emits the stores. The
/// modulus is elided when the group's iteration count never exceeds it, and
/// the division when it is 1; a leaf whose arithmetic fully elides indexes
/// directly by `counter`.
fn emit_stores(b: &mut Builder<'_>, counter: Value, iteration_count: u32, leaves: &[StoreLeaf]) {
    let mut index_values: FxIndexMap<ArrayIndex, Value> = FxIndexMap::default();
    for leaf in leaves {
        for index in &leaf.index_path {
            if let Index::Array(array_index) = *index {
                if !index_values.contains_key(&array_index) {
                    let value = array_index_value(b, counter, iteration_count, array_index);
                    index_values.insert(array_index, value);
                }
            }
        }
    }
    for leaf in leaves {
        let mut indices: SmallVec<[Value; 4]> = SmallVec::new();
        for index in &leaf.index_path {
            let value = match *index {
                Index::Constant(index) => b.const_u32(index),
                Index::Array(array_index) => index_values[&array_index],
            };
            indices.push(value);
        }
        let target = if indices.is_empty() {
            leaf.var.ptr()
        } else {
            b.access(leaf.var.ptr(), indices)
        };
        let atomic_scalar = match &b.module.types[leaf.ty] {
            TypeKind::Atomic(scalar) => Some(*scalar),
            _ => None,
        };
        match atomic_scalar {
            Some(scalar) => {
                let scalar_ty = b.module.ty(TypeKind::Scalar(scalar));
                let zero = b.zero_value(scalar_ty);
                b.atomic_store(target, zero);
            }
            None => {
                let zero = b.zero_value(leaf.ty);
                b.store(target, zero);
            }
        }
    }
}

fn array_index_value(
    b: &mut Builder<'_>,
    counter: Value,
    iteration_count: u32,
    index: ArrayIndex,
) -> Value {
    let mut value = counter;
    let mut derived = false;
    if index.modulus < iteration_count {
        let modulus = b.const_u32(index.modulus);
        value = b.modulo(value, modulus);
        derived = true;
    }
    if index.division != 1 {
        let division = b.const_u32(index.division);
        value = b.div(value, division);
        derived = true;
    }
    if derived { b.let_(None, value) } else { value }
}
