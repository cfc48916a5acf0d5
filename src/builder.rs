//! In-place IR construction.
//!
//! A [`Builder`] owns exclusive write access to a [`Module`] for the duration
//! of an edit and appends instructions to one insertion block at a time;
//! nested blocks are built through short-lived reborrows ([`Builder::in_block`]).
//! Concurrent passes must not share a builder, and the `&mut Module` borrow is
//! what enforces that.

use crate::{
    AddressSpace, BinaryOp, Block, BlockDef, ConstKind, Function, Inst, InstDef, InstKind, Module,
    Type, Value, Var,
};
use smallvec::SmallVec;

pub struct Builder<'m> {
    pub module: &'m mut Module,
    block: Block,
}

/// The three child blocks of a freshly built [`InstKind::Loop`].
pub struct LoopBlocks {
    pub initializer: Block,
    pub body: Block,
    pub continuing: Block,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module, block: Block) -> Self {
        Self { module, block }
    }

    /// The current insertion block.
    pub fn block(&self) -> Block {
        self.block
    }

    /// Reborrows this builder with the insertion point moved to `block`.
    pub fn in_block(&mut self, block: Block) -> Builder<'_> {
        Builder { module: &mut *self.module, block }
    }

    /// Allocates a fresh, empty block (not yet attached to any instruction).
    pub fn new_block(&mut self) -> Block {
        self.module.blocks.append(BlockDef::default())
    }

    pub fn append(&mut self, kind: InstKind) -> Inst {
        self.append_named(None, kind)
    }

    pub fn append_named(&mut self, name: Option<String>, kind: InstKind) -> Inst {
        let inst = self.module.insts.append(InstDef { name, kind });
        let block = self.block;
        self.module.blocks[block].insts.push(inst);
        inst
    }

    // Constants.

    pub fn const_u32(&mut self, value: u32) -> Value {
        Value::Const(self.module.consts.insert(ConstKind::U32(value)))
    }

    /// The zero value of `ty` (every leaf zeroed).
    pub fn zero_value(&mut self, ty: Type) -> Value {
        Value::Const(self.module.consts.insert(ConstKind::Zero(ty)))
    }

    // Declarations.

    pub fn var(
        &mut self,
        name: impl Into<String>,
        address_space: AddressSpace,
        store_ty: Type,
        initializer: Option<Value>,
    ) -> Var {
        let inst = self.append_named(
            Some(name.into()),
            InstKind::Var { address_space, store_ty, initializer },
        );
        Var(inst)
    }

    pub fn let_(&mut self, name: Option<String>, value: Value) -> Value {
        Value::Inst(self.append_named(name, InstKind::Let { value }))
    }

    // Memory.

    pub fn load(&mut self, ptr: Value) -> Value {
        Value::Inst(self.append(InstKind::Load { ptr }))
    }

    pub fn store(&mut self, ptr: Value, value: Value) {
        self.append(InstKind::Store { ptr, value });
    }

    pub fn atomic_store(&mut self, ptr: Value, value: Value) {
        self.append(InstKind::AtomicStore { ptr, value });
    }

    pub fn access(&mut self, base: Value, indices: impl IntoIterator<Item = Value>) -> Value {
        let indices: SmallVec<[Value; 4]> = indices.into_iter().collect();
        Value::Inst(self.append(InstKind::Access { base, indices }))
    }

    // Arithmetic and comparison.

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        Value::Inst(self.append(InstKind::Binary { op, lhs, rhs }))
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn modulo(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Mod, lhs, rhs)
    }

    pub fn div(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn less_than(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::LessThan, lhs, rhs)
    }

    pub fn greater_eq(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::GreaterThanEqual, lhs, rhs)
    }

    // Calls and control flow.

    pub fn call(&mut self, callee: Function, args: impl IntoIterator<Item = Value>) -> Value {
        let args: SmallVec<[Value; 2]> = args.into_iter().collect();
        Value::Inst(self.append(InstKind::Call { callee, args }))
    }

    /// Appends an `if` with a fresh `then` block (no `else`), returning the
    /// `then` block.
    pub fn if_(&mut self, condition: Value) -> Block {
        let then_block = self.new_block();
        self.append(InstKind::If { condition, then_block, else_block: None });
        then_block
    }

    /// Appends a `loop` with fresh initializer/body/continuing blocks.
    pub fn loop_(&mut self) -> LoopBlocks {
        let initializer = self.new_block();
        let body = self.new_block();
        let continuing = self.new_block();
        self.append(InstKind::Loop { initializer, body, continuing });
        LoopBlocks { initializer, body, continuing }
    }

    pub fn break_if(&mut self, condition: Value) {
        self.append(InstKind::BreakIf { condition });
    }

    pub fn return_(&mut self, value: Option<Value>) {
        self.append(InstKind::Return { value });
    }

    pub fn workgroup_barrier(&mut self) {
        self.append(InstKind::WorkgroupBarrier);
    }
}
