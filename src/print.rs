//! Plain-text printing of a [`Module`], for logs, tests and debugging.
//!
//! The output is deterministic (arena order, with sequential `%N` ids for
//! unnamed results) but has no stability guarantees beyond that; it is not a
//! parseable surface syntax.

use crate::{
    ArrayCount, BinaryOp, Block, ConstKind, Inst, InstKind, Module, ScalarKind, Stage, Type,
    TypeKind, Value, WorkgroupDim,
};
use itertools::Itertools as _;
use rustc_hash::FxHashMap;
use std::fmt::Write as _;

pub fn module_to_string(module: &Module) -> String {
    let mut printer = Printer { module, ids: FxHashMap::default(), next_id: 0, out: String::new() };
    printer.print_module();
    printer.out
}

struct Printer<'a> {
    module: &'a Module,
    /// Sequential ids for unnamed instruction results, in print order.
    ids: FxHashMap<Inst, usize>,
    next_id: usize,
    out: String,
}

impl Printer<'_> {
    fn print_module(&mut self) {
        let module = self.module;
        for &inst in &module.blocks[module.root_block].insts {
            self.inst(0, inst);
        }
        for (_, decl) in module.functions.iter() {
            self.out.push('\n');
            if let Some(stage) = &decl.stage {
                let stage = self.stage(stage);
                let _ = writeln!(self.out, "{stage}");
            }
            let params = decl
                .params
                .iter()
                .map(|param| match param.builtin {
                    Some(builtin) => {
                        format!("{}: {} @{:?}", param.name, self.ty(param.ty), builtin)
                    }
                    None => format!("{}: {}", param.name, self.ty(param.ty)),
                })
                .join(", ");
            let _ = writeln!(self.out, "fn {}({params}) {{", decl.name);
            self.block_insts(1, decl.body);
            self.out.push_str("}\n");
        }
    }

    fn stage(&self, stage: &Stage) -> String {
        match stage {
            Stage::Compute { workgroup_size } => {
                let dims = workgroup_size
                    .iter()
                    .map(|dim| match dim {
                        WorkgroupDim::Fixed(n) => n.to_string(),
                        WorkgroupDim::Expr(value) => self.value(*value),
                    })
                    .join(", ");
                format!("@compute @workgroup_size({dims})")
            }
            Stage::Fragment => "@fragment".into(),
            Stage::Vertex => "@vertex".into(),
        }
    }

    fn block_insts(&mut self, depth: usize, block: Block) {
        let module = self.module;
        for &inst in &module.blocks[block].insts {
            self.inst(depth, inst);
        }
    }

    fn inst(&mut self, depth: usize, inst: Inst) {
        let indent = "    ".repeat(depth);
        // Operand strings are rendered up front; `self.out` is only touched
        // once per line.
        let line = match &self.module.insts[inst].kind {
            InstKind::Var { address_space, store_ty, initializer } => {
                let result = self.result(inst);
                let mut line =
                    format!("{result} = var<{address_space:?}> {}", self.ty(*store_ty));
                if let Some(init) = initializer {
                    let _ = write!(line, " = {}", self.value(*init));
                }
                line
            }
            InstKind::Let { value } => {
                format!("{} = let {}", self.result(inst), self.value(*value))
            }
            InstKind::Load { ptr } => {
                format!("{} = load {}", self.result(inst), self.value(*ptr))
            }
            InstKind::Store { ptr, value } => {
                format!("store {}, {}", self.value(*ptr), self.value(*value))
            }
            InstKind::AtomicStore { ptr, value } => {
                format!("atomic_store {}, {}", self.value(*ptr), self.value(*value))
            }
            InstKind::Access { base, indices } => {
                let indices = indices.iter().map(|&index| self.value(index)).join(", ");
                format!("{} = access {}[{indices}]", self.result(inst), self.value(*base))
            }
            InstKind::Binary { op, lhs, rhs } => {
                let op = match op {
                    BinaryOp::Add => "add",
                    BinaryOp::Mul => "mul",
                    BinaryOp::Mod => "mod",
                    BinaryOp::Div => "div",
                    BinaryOp::LessThan => "lt",
                    BinaryOp::GreaterThanEqual => "ge",
                };
                format!("{} = {op} {}, {}", self.result(inst), self.value(*lhs), self.value(*rhs))
            }
            InstKind::Call { callee, args } => {
                let args = args.iter().map(|&arg| self.value(arg)).join(", ");
                format!("{} = call {}({args})", self.result(inst), self.module.functions[*callee].name)
            }
            &InstKind::If { condition, then_block, else_block } => {
                let condition = self.value(condition);
                let _ = writeln!(self.out, "{indent}if {condition} {{");
                self.block_insts(depth + 1, then_block);
                if let Some(else_block) = else_block {
                    let _ = writeln!(self.out, "{indent}}} else {{");
                    self.block_insts(depth + 1, else_block);
                }
                let _ = writeln!(self.out, "{indent}}}");
                return;
            }
            InstKind::Switch { selector, cases } => {
                let selector = self.value(*selector);
                let cases = cases.clone();
                let _ = writeln!(self.out, "{indent}switch {selector} {{");
                for (i, &case) in cases.iter().enumerate() {
                    let _ = writeln!(self.out, "{indent}    case {i} {{");
                    self.block_insts(depth + 2, case);
                    let _ = writeln!(self.out, "{indent}    }}");
                }
                let _ = writeln!(self.out, "{indent}}}");
                return;
            }
            &InstKind::Loop { initializer, body, continuing } => {
                let _ = writeln!(self.out, "{indent}loop initializer {{");
                self.block_insts(depth + 1, initializer);
                let _ = writeln!(self.out, "{indent}}} body {{");
                self.block_insts(depth + 1, body);
                let _ = writeln!(self.out, "{indent}}} continuing {{");
                self.block_insts(depth + 1, continuing);
                let _ = writeln!(self.out, "{indent}}}");
                return;
            }
            InstKind::BreakIf { condition } => format!("break_if {}", self.value(*condition)),
            InstKind::Return { value } => match value {
                Some(value) => format!("return {}", self.value(*value)),
                None => "return".into(),
            },
            InstKind::WorkgroupBarrier => "workgroup_barrier".into(),
        };
        let _ = writeln!(self.out, "{indent}{line}");
    }

    /// `%name` for named results, `%N` (sequential, first-print order) otherwise.
    fn result(&mut self, inst: Inst) -> String {
        if let Some(name) = &self.module.insts[inst].name {
            return format!("%{name}");
        }
        let next_id = &mut self.next_id;
        let id = *self.ids.entry(inst).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            id
        });
        format!("%{id}")
    }

    fn value(&self, value: Value) -> String {
        match value {
            Value::Const(konst) => match &self.module.consts[konst] {
                ConstKind::U32(n) => format!("{n}u"),
                ConstKind::Zero(ty) => format!("zero<{}>", self.ty(*ty)),
                ConstKind::Override { name } => format!("override({name})"),
            },
            Value::Inst(inst) => match &self.module.insts[inst].name {
                Some(name) => format!("%{name}"),
                None => match self.ids.get(&inst) {
                    Some(id) => format!("%{id}"),
                    None => format!("%?{}", inst.index()),
                },
            },
            Value::Param { func, index } => {
                let decl = &self.module.functions[func];
                match decl.params.get(index as usize) {
                    Some(param) => format!("%{}", param.name),
                    None => format!("%param{index}"),
                }
            }
        }
    }

    fn ty(&self, ty: Type) -> String {
        match &self.module.types[ty] {
            TypeKind::Scalar(scalar) => scalar_str(*scalar).into(),
            TypeKind::Vector { scalar, size } => format!("vec{size}<{}>", scalar_str(*scalar)),
            TypeKind::Matrix { columns, rows } => format!("mat{columns}x{rows}<f32>"),
            TypeKind::Atomic(scalar) => format!("atomic<{}>", scalar_str(*scalar)),
            TypeKind::Array { element, count } => match count {
                ArrayCount::Constant(n) => format!("array<{}, {n}>", self.ty(*element)),
                ArrayCount::Runtime => format!("array<{}>", self.ty(*element)),
            },
            TypeKind::Struct { name, .. } => name.clone(),
        }
    }
}

fn scalar_str(scalar: ScalarKind) -> &'static str {
    match scalar {
        ScalarKind::Bool => "bool",
        ScalarKind::I32 => "i32",
        ScalarKind::U32 => "u32",
        ScalarKind::F32 => "f32",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, Builder};

    #[test]
    fn prints_declarations_and_bodies() {
        let mut module = Module::new();
        let u32_ty = module.ty_u32();
        let arr = module.ty(TypeKind::Array { element: u32_ty, count: ArrayCount::Constant(8) });
        let w = module.declare_module_var("w", AddressSpace::Workgroup, arr);

        let func = module.declare_function(
            "main",
            Some(Stage::Compute {
                workgroup_size: [
                    WorkgroupDim::Fixed(8),
                    WorkgroupDim::Fixed(1),
                    WorkgroupDim::Fixed(1),
                ],
            }),
        );
        let body = module.functions[func].body;
        let mut b = Builder::new(&mut module, body);
        let zero = b.const_u32(0);
        let elem = b.access(w.ptr(), [zero]);
        let zero_val = b.zero_value(u32_ty);
        b.store(elem, zero_val);
        b.workgroup_barrier();

        let text = module_to_string(&module);
        assert!(text.contains("%w = var<Workgroup> array<u32, 8>"));
        assert!(text.contains("@compute @workgroup_size(8, 1, 1)"));
        assert!(text.contains("fn main() {"));
        assert!(text.contains("access %w[0u]"));
        assert!(text.contains("store %0, zero<u32>"));
        assert!(text.contains("workgroup_barrier"));
    }

    #[test]
    fn prints_control_flow_nesting() {
        let mut module = Module::new();
        let func = module.declare_function("f", None);
        let body = module.functions[func].body;
        let mut b = Builder::new(&mut module, body);
        let cond = b.const_u32(1);
        let then_block = b.if_(cond);
        let mut tb = b.in_block(then_block);
        let blocks = tb.loop_();
        let mut lb = tb.in_block(blocks.body);
        lb.break_if(cond);

        let text = module_to_string(&module);
        assert!(text.contains("if 1u {"));
        assert!(text.contains("loop initializer {"));
        assert!(text.contains("break_if 1u"));
    }
}
