//! Transitive module-variable reachability over the call and control-flow graph.
//!
//! [`ReferencedVars`] answers, per function, "which module-scope variables can
//! this function's body touch, directly or through any call it makes". The
//! answer is an insertion-ordered, duplicate-free set in first-discovery
//! program order, and is memoized per function so shared callees are analyzed
//! once no matter how many callers (or entry points) reach them.
//!
//! The cache holds no validity tokens: construct an instance immediately
//! before a pass needs it, query it, and drop it before the module is edited.
//! The shared `&Module` borrow makes the borrow checker enforce exactly that.

use crate::{Block, Function, FxIndexSet, Inst, InstKind, Module, Value, Var};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Insertion-ordered, duplicate-free set of module-scope variables.
pub type VarSet = FxIndexSet<Var>;

enum FuncState {
    InProgress,
    Complete(Rc<VarSet>),
}

/// Per-function transitive references to module-scope variables matching a
/// predicate (default: all of them).
pub struct ReferencedVars<'a> {
    module: &'a Module,
    /// Matching module-scope variables directly referenced by each block's own
    /// instructions, in root-block declaration order.
    block_refs: FxHashMap<Block, Vec<Var>>,
    cache: FxHashMap<Function, FuncState>,
    empty: Rc<VarSet>,
}

impl<'a> ReferencedVars<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self::with_predicate(module, |_, _| true)
    }

    /// Restricts the analysis to module-scope variables accepted by `predicate`.
    ///
    /// Construction performs the only all-instructions scan: one walk over
    /// every function body records each instruction's containing block and a
    /// reverse use index, then the root block's variables are mapped to the
    /// blocks that directly use them. Everything per-function is lazy.
    pub fn with_predicate(
        module: &'a Module,
        predicate: impl Fn(&Module, Var) -> bool,
    ) -> Self {
        let mut parent_block: FxHashMap<Inst, Block> = FxHashMap::default();
        let mut users: FxHashMap<Inst, Vec<Inst>> = FxHashMap::default();
        for (_, decl) in module.functions.iter() {
            record_uses(module, decl.body, &mut parent_block, &mut users);
        }

        let mut block_refs: FxHashMap<Block, Vec<Var>> = FxHashMap::default();
        for &inst in &module.blocks[module.root_block].insts {
            if !matches!(module.insts[inst].kind, InstKind::Var { .. }) {
                continue;
            }
            let var = Var(inst);
            if !predicate(module, var) {
                continue;
            }
            for &user in users.get(&inst).map(Vec::as_slice).unwrap_or(&[]) {
                let block = parent_block[&user];
                let refs = block_refs.entry(block).or_default();
                if !refs.contains(&var) {
                    refs.push(var);
                }
            }
        }
        log::trace!(
            "ReferencedVars: {} blocks directly reference matching variables",
            block_refs.len()
        );

        Self { module, block_refs, cache: FxHashMap::default(), empty: Rc::new(VarSet::default()) }
    }

    /// The ordered set of matching module-scope variables `function` may read
    /// or write, directly or through any call it makes.
    ///
    /// `None` is accepted (and yields the empty set) so callers holding an
    /// unresolved callee don't need a special case.
    ///
    /// Panics if the call graph turns out to be recursive; the source
    /// languages this IR models forbid recursion, so a query can never land
    /// on a function whose own computation is still in flight.
    pub fn transitive_references(&mut self, function: Option<Function>) -> Rc<VarSet> {
        let Some(function) = function else {
            return self.empty.clone();
        };
        match self.cache.get(&function) {
            Some(FuncState::Complete(set)) => return set.clone(),
            Some(FuncState::InProgress) => {
                panic!("recursive call graph: re-entered {:?}", function)
            }
            None => {}
        }
        self.cache.insert(function, FuncState::InProgress);

        let mut set = VarSet::default();
        self.gather(self.module.functions[function].body, &mut set);
        log::trace!(
            "ReferencedVars: `{}` reaches {} variable(s)",
            self.module.functions[function].name,
            set.len()
        );

        let set = Rc::new(set);
        self.cache.insert(function, FuncState::Complete(set.clone()));
        set
    }

    fn gather(&mut self, block: Block, set: &mut VarSet) {
        let module = self.module;
        if let Some(direct) = self.block_refs.get(&block) {
            set.extend(direct.iter().copied());
        }
        for &inst in &module.blocks[block].insts {
            match &module.insts[inst].kind {
                &InstKind::Call { callee, .. } => {
                    let callee_refs = self.transitive_references(Some(callee));
                    for &var in callee_refs.iter() {
                        set.insert(var);
                    }
                }
                kind => kind.for_each_child_block(|child| self.gather(child, set)),
            }
        }
    }
}

fn record_uses(
    module: &Module,
    block: Block,
    parent_block: &mut FxHashMap<Inst, Block>,
    users: &mut FxHashMap<Inst, Vec<Inst>>,
) {
    for &inst in &module.blocks[block].insts {
        parent_block.insert(inst, block);
        let def = &module.insts[inst];
        def.kind.for_each_operand(|operand| {
            if let Value::Inst(producer) = operand {
                users.entry(producer).or_default().push(inst);
            }
        });
        def.kind
            .for_each_child_block(|child| record_uses(module, child, parent_block, users));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, Builder, Type};
    use smallvec::smallvec;

    struct Fixture {
        module: Module,
        u32_ty: Type,
    }

    impl Fixture {
        fn new() -> Self {
            let mut module = Module::new();
            let u32_ty = module.ty_u32();
            Self { module, u32_ty }
        }

        fn workgroup_var(&mut self, name: &str) -> Var {
            self.module.declare_module_var(name, AddressSpace::Workgroup, self.u32_ty)
        }

        fn private_var(&mut self, name: &str) -> Var {
            self.module.declare_module_var(name, AddressSpace::Private, self.u32_ty)
        }

        fn func(&mut self, name: &str) -> Function {
            self.module.declare_function(name, None)
        }

        fn body(&mut self, func: Function) -> Builder<'_> {
            let body = self.module.functions[func].body;
            Builder::new(&mut self.module, body)
        }
    }

    fn vars(set: &Rc<VarSet>) -> Vec<Var> {
        set.iter().copied().collect()
    }

    #[test]
    fn function_with_no_references_yields_empty_set() {
        let mut fx = Fixture::new();
        let _w = fx.workgroup_var("w");
        let f = fx.func("f");
        fx.body(f).return_(None);

        let mut analysis = ReferencedVars::new(&fx.module);
        assert!(analysis.transitive_references(Some(f)).is_empty());
    }

    #[test]
    fn absent_function_yields_empty_set() {
        let fx = Fixture::new();
        let mut analysis = ReferencedVars::new(&fx.module);
        assert!(analysis.transitive_references(None).is_empty());
    }

    #[test]
    fn direct_references_are_found_through_uses() {
        let mut fx = Fixture::new();
        let w = fx.workgroup_var("w");
        let f = fx.func("f");
        {
            let mut b = fx.body(f);
            let loaded = b.load(w.ptr());
            b.store(w.ptr(), loaded);
        }

        let mut analysis = ReferencedVars::new(&fx.module);
        assert_eq!(vars(&analysis.transitive_references(Some(f))), vec![w]);
    }

    #[test]
    fn first_discovery_order_beats_declaration_order() {
        let mut fx = Fixture::new();
        let a = fx.workgroup_var("a");
        let b_var = fx.workgroup_var("b");

        // `g` touches only `b`.
        let g = fx.func("g");
        {
            let mut b = fx.body(g);
            let loaded = b.load(b_var.ptr());
            b.store(b_var.ptr(), loaded);
        }
        // `f` calls `g` first, then touches `a` inside a nested block; the
        // result must read [b, a] even though `a` is declared first.
        let f = fx.func("f");
        {
            let mut b = fx.body(f);
            b.call(g, []);
            let cond = b.const_u32(1);
            let then_block = b.if_(cond);
            let mut tb = b.in_block(then_block);
            tb.store(a.ptr(), cond);
        }

        let mut analysis = ReferencedVars::new(&fx.module);
        assert_eq!(vars(&analysis.transitive_references(Some(f))), vec![b_var, a]);
    }

    #[test]
    fn caller_set_is_a_superset_of_callee_set() {
        let mut fx = Fixture::new();
        let x = fx.workgroup_var("x");
        let y = fx.workgroup_var("y");

        let callee = fx.func("callee");
        {
            let mut b = fx.body(callee);
            let loaded = b.load(x.ptr());
            b.return_(Some(loaded));
        }
        let caller = fx.func("caller");
        {
            let mut b = fx.body(caller);
            let loaded = b.load(y.ptr());
            b.call(callee, []);
            b.return_(Some(loaded));
        }

        let mut analysis = ReferencedVars::new(&fx.module);
        let callee_set = analysis.transitive_references(Some(callee));
        let caller_set = analysis.transitive_references(Some(caller));
        for var in callee_set.iter() {
            assert!(caller_set.contains(var));
        }
        assert_eq!(vars(&caller_set), vec![y, x]);
    }

    #[test]
    fn repeated_queries_are_stable() {
        let mut fx = Fixture::new();
        let x = fx.workgroup_var("x");
        let y = fx.workgroup_var("y");
        let f = fx.func("f");
        {
            let mut b = fx.body(f);
            let lx = b.load(x.ptr());
            let ly = b.load(y.ptr());
            b.store(x.ptr(), ly);
            b.store(y.ptr(), lx);
        }

        let mut analysis = ReferencedVars::new(&fx.module);
        let first = vars(&analysis.transitive_references(Some(f)));
        let second = vars(&analysis.transitive_references(Some(f)));
        assert_eq!(first, second);
        assert_eq!(first, vec![x, y]);
    }

    #[test]
    fn predicate_filters_variables() {
        let mut fx = Fixture::new();
        let w = fx.workgroup_var("w");
        let p = fx.private_var("p");
        let f = fx.func("f");
        {
            let mut b = fx.body(f);
            let lp = b.load(p.ptr());
            b.store(w.ptr(), lp);
        }

        let mut analysis = ReferencedVars::with_predicate(&fx.module, |m, var| {
            m.var_address_space(var) == AddressSpace::Workgroup
        });
        assert_eq!(vars(&analysis.transitive_references(Some(f))), vec![w]);
    }

    #[test]
    fn nested_control_flow_is_traversed() {
        let mut fx = Fixture::new();
        let w = fx.workgroup_var("w");
        let f = fx.func("f");
        {
            let mut b = fx.body(f);
            let sel = b.const_u32(0);
            let case0 = b.new_block();
            let case1 = b.new_block();
            b.append(InstKind::Switch { selector: sel, cases: smallvec![case0, case1] });
            let mut cb = b.in_block(case1);
            let blocks = cb.loop_();
            let mut lb = cb.in_block(blocks.body);
            let zero = lb.const_u32(0);
            lb.store(w.ptr(), zero);
            lb.break_if(zero);
        }

        let mut analysis = ReferencedVars::new(&fx.module);
        assert_eq!(vars(&analysis.transitive_references(Some(f))), vec![w]);
    }

    #[test]
    #[should_panic(expected = "recursive call graph")]
    fn recursive_call_graph_panics() {
        let mut fx = Fixture::new();
        let f = fx.func("f");
        fx.body(f).call(f, []);

        let mut analysis = ReferencedVars::new(&fx.module);
        analysis.transitive_references(Some(f));
    }

    #[test]
    fn shared_callee_is_analyzed_once() {
        let mut fx = Fixture::new();
        let w = fx.workgroup_var("w");
        let helper = fx.func("helper");
        {
            let mut b = fx.body(helper);
            let zero = b.const_u32(0);
            b.store(w.ptr(), zero);
        }
        let f = fx.func("f");
        fx.body(f).call(helper, []);
        let g = fx.func("g");
        fx.body(g).call(helper, []);

        let mut analysis = ReferencedVars::new(&fx.module);
        let f_set = analysis.transitive_references(Some(f));
        let g_set = analysis.transitive_references(Some(g));
        // Both resolve through the same cached entry.
        assert!(Rc::ptr_eq(
            &analysis.transitive_references(Some(helper)),
            &analysis.transitive_references(Some(helper)),
        ));
        assert_eq!(vars(&f_set), vec![w]);
        assert_eq!(vars(&g_set), vec![w]);
    }
}
