// This module implements control-flow analysis over a Function: successor lists taken from
// block terminators, a reverse post-order (RPO) block layout computed with an explicit DFS
// stack, and an immediate-dominator table computed with the iterative two-finger algorithm
// over that order. Blocks not reachable from the entry block are absent from the order and
// have no dominator; callers treat them as dominated by everything. The verifier uses the
// dominator table to check that every use of an instruction result is dominated by its
// definition, and the x86-64 lowering reuses the reachability information.

use super::module::Function;
use hashbrown::HashSet;

/// Block layout and dominance information for a single function.
#[derive(Debug, Default, Clone)]
pub struct Analyzer {
    order: Vec<usize>,
    rpo_index: Vec<Option<usize>>,
    idom: Vec<Option<usize>>,
}

/// Successor block indices of block `index` (empty when it has no terminator).
pub fn block_succs(function: &Function, index: usize) -> Vec<usize> {
    let Some(block) = function.blocks().get(index) else {
        return Vec::new();
    };
    let Some(term) = block.terminator().and_then(|id| function.inst(id)) else {
        return Vec::new();
    };
    term.instruction()
        .successors()
        .into_iter()
        .filter(|dest| dest.func() == function.id() && dest.index() < function.blocks().len())
        .map(|dest| dest.index())
        .collect()
}

impl Analyzer {
    pub fn new(function: &Function) -> Self {
        let count = function.blocks().len();
        let mut analyzer = Analyzer {
            order: Vec::new(),
            rpo_index: vec![None; count],
            idom: vec![None; count],
        };
        if count == 0 {
            return analyzer;
        }

        // -------- build RPO order ---------
        let succs: Vec<Vec<usize>> = (0..count).map(|b| block_succs(function, b)).collect();
        let mut post = Vec::with_capacity(count);
        let mut stack = vec![(0usize, false)];
        let mut visited = HashSet::new();
        while let Some((block, processed)) = stack.pop() {
            if processed {
                post.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            for &succ in succs[block].iter().rev() {
                stack.push((succ, false));
            }
        }
        post.reverse();
        for (idx, &b) in post.iter().enumerate() {
            analyzer.rpo_index[b] = Some(idx);
        }
        analyzer.order = post;

        // -------- compute dominators ---------
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (b, list) in succs.iter().enumerate() {
            if analyzer.rpo_index[b].is_none() {
                continue;
            }
            for &s in list {
                preds[s].push(b);
            }
        }
        analyzer.idom[0] = Some(0);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in analyzer.order.iter().skip(1) {
                let mut new_idom: Option<usize> = None;
                for &p in &preds[b] {
                    if analyzer.idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => analyzer.intersect(p, cur),
                    });
                }
                if new_idom.is_some() && analyzer.idom[b] != new_idom {
                    analyzer.idom[b] = new_idom;
                    changed = true;
                }
            }
        }
        analyzer
    }

    fn intersect(&self, mut a: usize, mut b: usize) -> usize {
        let pos = |x: usize| self.rpo_index[x].unwrap_or(usize::MAX);
        while a != b {
            while pos(a) > pos(b) {
                match self.idom[a] {
                    Some(next) if next != a => a = next,
                    _ => return b,
                }
            }
            while pos(b) > pos(a) {
                match self.idom[b] {
                    Some(next) if next != b => b = next,
                    _ => return a,
                }
            }
        }
        a
    }

    /// Reachable blocks in reverse post order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn is_reachable(&self, block: usize) -> bool {
        self.rpo_index.get(block).is_some_and(|idx| idx.is_some())
    }

    /// Immediate dominator; the entry block is its own dominator.
    pub fn idom(&self, block: usize) -> Option<usize> {
        self.idom.get(block).copied().flatten()
    }

    /// Whether block `a` dominates block `b`. Unreachable blocks are dominated by every block.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if !self.is_reachable(b) {
            return true;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(next) if next != cur => cur = next,
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::Builder;
    use crate::core::module::Module;
    use crate::core::types::TypeRegistry;

    #[test]
    fn test_diamond_dominators() {
        let mut types = TypeRegistry::new();
        let void = types.void_type();
        let i1 = types.i1();
        let fn_ty = types.function_type(&void, &[i1], false).unwrap();
        let mut module = Module::new("cfg");
        let f = module.add_function(&fn_ty, "f").unwrap();
        let entry = module.append_block(f, "entry").unwrap();
        let left = module.append_block(f, "left").unwrap();
        let right = module.append_block(f, "right").unwrap();
        let join = module.append_block(f, "join").unwrap();
        let dead = module.append_block(f, "dead").unwrap();
        let cond = module.param(f, 0).unwrap();

        let mut b = Builder::new(&mut module);
        b.position_at_end(entry);
        b.cond_br(&cond, left, right).unwrap();
        b.position_at_end(left);
        b.br(join).unwrap();
        b.position_at_end(right);
        b.br(join).unwrap();
        b.position_at_end(join);
        b.ret_void().unwrap();
        b.position_at_end(dead);
        b.br(join).unwrap();

        let analyzer = Analyzer::new(module.function(f).unwrap());
        assert_eq!(analyzer.order().first(), Some(&0));
        assert_eq!(analyzer.order().len(), 4);
        assert_eq!(analyzer.idom(3), Some(0));
        assert!(analyzer.dominates(0, 3));
        assert!(!analyzer.dominates(1, 3));
        assert!(!analyzer.is_reachable(4));
        assert!(analyzer.dominates(2, 4));
    }
}
