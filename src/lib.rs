//! Workgroup-memory analyses and transforms over a structured shader IR.
//!
//! A [`Module`] is the unit everything operates on: it owns arenas of blocks,
//! instructions, functions, interned types and interned constants, plus a root
//! [`Block`] holding every module-scope variable declaration. Compute entry
//! points are [`FunctionDecl`]s tagged with [`Stage::Compute`].
//!
//! #### Notable types/modules
//!
//! ##### IR data types
//! * [`Module`]: owns all IR storage (rooted by [`root_block`](Module::root_block)
//!   and [`functions`](Module::functions))
//! * [`entity`]: arena/handle plumbing every IR object is addressed through
//! * [`Builder`]: exclusive-write handle for constructing instructions in place
//!
//! ##### Analyses and passes
//! * [`analyze::ReferencedVars`]: per-function transitive module-variable
//!   reachability, memoized across a call graph
//! * [`passes::zero_init`]: synthesizes zero-initialization of workgroup
//!   storage at the top of compute entry points
//! * [`print`](mod@print): plain-text printer for modules

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::map_unwrap_or,
    clippy::needless_continue,
    clippy::semicolon_if_nothing_returned,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]

pub mod analyze;
pub mod builder;
pub mod entity;
pub mod print;
pub mod passes {
    //! IR transformations (typically whole-[`Module`](crate::Module)).
    //
    // NOTE: inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod zero_init;
}

use smallvec::SmallVec;

// HACK: work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
pub type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
pub type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

pub use builder::Builder;
pub use entity::{Arena, Handle, UniqueArena};

/// Interned handle for a [`TypeKind`].
pub type Type = Handle<TypeKind>;
/// Interned handle for a [`ConstKind`].
pub type Const = Handle<ConstKind>;
/// Handle for a [`BlockDef`].
pub type Block = Handle<BlockDef>;
/// Handle for an [`InstDef`].
pub type Inst = Handle<InstDef>;
/// Handle for a [`FunctionDecl`].
pub type Function = Handle<FunctionDecl>;

/// A single shader module: the IR that analyses read and passes mutate in place.
///
/// All IR objects live in the module's arenas and are addressed by handles;
/// handles stay valid for the module's lifetime (nothing is ever removed).
/// A pass takes `&mut Module` (usually through a [`Builder`]) and edits it in
/// place; analyses take `&Module` and must be dropped before the next edit.
pub struct Module {
    pub types: UniqueArena<TypeKind>,
    pub consts: UniqueArena<ConstKind>,
    pub blocks: Arena<BlockDef>,
    pub insts: Arena<InstDef>,
    pub functions: Arena<FunctionDecl>,

    /// Module-scope declarations. Every module-scope [`InstKind::Var`] is
    /// declared exactly once, in this block.
    pub root_block: Block,
}

impl Module {
    pub fn new() -> Self {
        let mut blocks = Arena::default();
        let root_block = blocks.append(BlockDef::default());
        Self {
            types: UniqueArena::default(),
            consts: UniqueArena::default(),
            blocks,
            insts: Arena::default(),
            functions: Arena::default(),
            root_block,
        }
    }

    pub fn ty(&mut self, kind: TypeKind) -> Type {
        self.types.insert(kind)
    }

    pub fn ty_u32(&mut self) -> Type {
        self.ty(TypeKind::Scalar(ScalarKind::U32))
    }

    /// Whether a single store of a zero value covers the whole object: true
    /// iff no array and no atomic occurs anywhere in the type's structure.
    pub fn is_trivially_zeroable(&self, ty: Type) -> bool {
        match &self.types[ty] {
            TypeKind::Scalar(_) | TypeKind::Vector { .. } | TypeKind::Matrix { .. } => true,
            TypeKind::Atomic(_) | TypeKind::Array { .. } => false,
            TypeKind::Struct { members, .. } => {
                members.iter().all(|member| self.is_trivially_zeroable(member.ty))
            }
        }
    }

    /// Declares a module-scope variable in the root block.
    pub fn declare_module_var(
        &mut self,
        name: impl Into<String>,
        address_space: AddressSpace,
        store_ty: Type,
    ) -> Var {
        let inst = self.insts.append(InstDef {
            name: Some(name.into()),
            kind: InstKind::Var { address_space, store_ty, initializer: None },
        });
        let root = self.root_block;
        self.blocks[root].insts.push(inst);
        Var(inst)
    }

    /// Declares a function with a fresh, empty body block.
    pub fn declare_function(&mut self, name: impl Into<String>, stage: Option<Stage>) -> Function {
        let body = self.blocks.append(BlockDef::default());
        self.functions.append(FunctionDecl { name: name.into(), params: Vec::new(), body, stage })
    }

    pub fn var_store_type(&self, var: Var) -> Type {
        match self.insts[var.0].kind {
            InstKind::Var { store_ty, .. } => store_ty,
            _ => unreachable!("Var handle does not refer to a Var instruction"),
        }
    }

    pub fn var_address_space(&self, var: Var) -> AddressSpace {
        match self.insts[var.0].kind {
            InstKind::Var { address_space, .. } => address_space,
            _ => unreachable!("Var handle does not refer to a Var instruction"),
        }
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an [`InstKind::Var`] instruction: the declaration is the identity
/// of the variable, and its result value is the pointer to the storage.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Var(pub Inst);

impl Var {
    /// The pointer value produced by the declaration.
    pub fn ptr(self) -> Value {
        Value::Inst(self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ScalarKind {
    Bool,
    I32,
    U32,
    F32,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeKind {
    Scalar(ScalarKind),
    Vector { scalar: ScalarKind, size: u32 },
    /// Column-major matrix of `f32`.
    Matrix { columns: u32, rows: u32 },
    /// An atomic scalar; only writable through dedicated atomic operations.
    Atomic(ScalarKind),
    Array { element: Type, count: ArrayCount },
    Struct { name: String, members: Vec<StructMember> },
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ArrayCount {
    /// Element count resolved to a compile-time constant by earlier passes.
    Constant(u32),
    /// Element count only known at runtime (e.g. the trailing array of a
    /// storage buffer). Never valid for workgroup storage.
    Runtime,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StructMember {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConstKind {
    U32(u32),
    /// The zero value of a type: every leaf zeroed, every `bool` false.
    Zero(Type),
    /// A pipeline-overridable `u32` constant, fixed at pipeline creation.
    Override { name: String },
}

/// Definition for a [`Block`]: an ordered sequence of instructions.
///
/// Blocks nest inside control instructions ([`InstKind::If`],
/// [`InstKind::Switch`], [`InstKind::Loop`]), forming a tree rooted at a
/// function's body (or at [`Module::root_block`] for module-scope decls).
#[derive(Clone, Default)]
pub struct BlockDef {
    pub insts: Vec<Inst>,
}

/// Definition for an [`Inst`]: one instruction, owned by exactly one block.
#[derive(Clone)]
pub struct InstDef {
    /// Debug name for the result (used by `Var` and `Let` declarations).
    pub name: Option<String>,
    pub kind: InstKind,
}

#[derive(Clone)]
pub enum InstKind {
    /// Declares one storage location; the result value is a pointer to it.
    Var { address_space: AddressSpace, store_ty: Type, initializer: Option<Value> },
    /// Binds a value to an immutable (optionally named) result.
    Let { value: Value },
    Load { ptr: Value },
    Store { ptr: Value, value: Value },
    AtomicStore { ptr: Value, value: Value },
    /// Pointer into `base`'s storage, one index per array/struct nesting level.
    Access { base: Value, indices: SmallVec<[Value; 4]> },
    Binary { op: BinaryOp, lhs: Value, rhs: Value },
    Call { callee: Function, args: SmallVec<[Value; 2]> },
    If { condition: Value, then_block: Block, else_block: Option<Block> },
    Switch { selector: Value, cases: SmallVec<[Block; 2]> },
    Loop { initializer: Block, body: Block, continuing: Block },
    /// Exits the innermost enclosing loop when `condition` holds.
    BreakIf { condition: Value },
    Return { value: Option<Value> },
    /// Synchronizes the workgroup: no invocation proceeds past the barrier
    /// until every invocation's prior workgroup-memory accesses are visible.
    WorkgroupBarrier,
}

impl InstKind {
    /// Calls `f` for every value operand this instruction reads.
    pub fn for_each_operand(&self, mut f: impl FnMut(Value)) {
        match self {
            InstKind::Var { initializer, .. } => {
                if let Some(init) = initializer {
                    f(*init);
                }
            }
            InstKind::Let { value } => f(*value),
            InstKind::Load { ptr } => f(*ptr),
            InstKind::Store { ptr, value } | InstKind::AtomicStore { ptr, value } => {
                f(*ptr);
                f(*value);
            }
            InstKind::Access { base, indices } => {
                f(*base);
                for &index in indices {
                    f(index);
                }
            }
            InstKind::Binary { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            InstKind::Call { args, .. } => {
                for &arg in args {
                    f(arg);
                }
            }
            InstKind::If { condition, .. } => f(*condition),
            InstKind::Switch { selector, .. } => f(*selector),
            InstKind::BreakIf { condition } => f(*condition),
            InstKind::Return { value } => {
                if let Some(value) = value {
                    f(*value);
                }
            }
            InstKind::Loop { .. } | InstKind::WorkgroupBarrier => {}
        }
    }

    /// Calls `f` for every child block nested under this instruction.
    pub fn for_each_child_block(&self, mut f: impl FnMut(Block)) {
        match self {
            InstKind::If { then_block, else_block, .. } => {
                f(*then_block);
                if let Some(else_block) = else_block {
                    f(*else_block);
                }
            }
            InstKind::Switch { cases, .. } => {
                for &case in cases {
                    f(case);
                }
            }
            InstKind::Loop { initializer, body, continuing } => {
                f(*initializer);
                f(*body);
                f(*continuing);
            }
            _ => {}
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    Add,
    Mul,
    Mod,
    Div,
    LessThan,
    GreaterThanEqual,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AddressSpace {
    Function,
    Private,
    Workgroup,
    Storage,
    Uniform,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum Value {
    #[from]
    Const(Const),
    /// The result of an instruction (e.g. the pointer produced by a `Var`).
    #[from]
    Inst(Inst),
    /// The `index`th parameter of `func`.
    Param { func: Function, index: u32 },
}

/// Declaration/definition for a [`Function`].
#[derive(Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<FunctionParam>,
    /// The entry block of the function's body.
    pub body: Block,
    /// `Some` tags the function as a pipeline entry point.
    pub stage: Option<Stage>,
}

#[derive(Clone)]
pub struct FunctionParam {
    pub name: String,
    pub ty: Type,
    pub builtin: Option<BuiltinValue>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BuiltinValue {
    LocalInvocationId,
    /// Per-invocation linear index, unique within the workgroup, in
    /// `[0, linear workgroup size)`.
    LocalInvocationIndex,
    GlobalInvocationId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Stage {
    Compute { workgroup_size: [WorkgroupDim; 3] },
    Fragment,
    Vertex,
}

/// One dimension of a compute entry point's workgroup size.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WorkgroupDim {
    Fixed(u32),
    /// Override-controlled: only known at pipeline creation. The value is
    /// typically a [`ConstKind::Override`] constant.
    Expr(Value),
}
