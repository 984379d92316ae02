//! Structural transformations over `AluExp` terms.
//!
//! All transformations rebuild nodes through the validating constructors,
//! so local simplification is re-applied as rewritten children expose new
//! constants or intervals.

use std::collections::HashMap;

use super::{AluArg, AluExp, AluOp};
use crate::error::IrError;
use crate::IrResult;

impl AluExp {
    /// Rebuild this node with new children, revalidating and
    /// re-simplifying.
    pub(crate) fn reconstruct(&self, src: Vec<AluExp>) -> IrResult<AluExp> {
        match self.op() {
            AluOp::Add | AluOp::Sub | AluOp::Mul | AluOp::Idiv | AluOp::Mod => {
                let [a, b] = into_pair(src)?;
                Self::binary(self.op(), a, b)
            }
            AluOp::Neg
            | AluOp::Sin
            | AluOp::Cos
            | AluOp::Exp
            | AluOp::Log
            | AluOp::Sqrt
            | AluOp::Reciprocal => {
                let [a] = into_one(src)?;
                Self::unary(self.op(), a)
            }
            AluOp::Cmplt | AluOp::Cmpeq | AluOp::Cmpne => {
                let [a, b] = into_pair(src)?;
                Self::compare(self.op(), a, b)
            }
            AluOp::Where => {
                if src.len() != 3 {
                    return Err(IrError::Type("Where expects 3 operands".into()));
                }
                let mut it = src.into_iter();
                let (c, a, b) = (
                    it.next().expect("len checked"),
                    it.next().expect("len checked"),
                    it.next().expect("len checked"),
                );
                Self::where_(c, a, b)
            }
            AluOp::Const | AluOp::Special => Ok(self.clone()),
            AluOp::GlobalView => match self.arg() {
                AluArg::View { gid, tracker } => {
                    Self::global_view(*gid, tracker.clone(), src, self.dtype())
                }
                _ => Err(IrError::Type("GlobalView without view arg".into())),
            },
            AluOp::GlobalIndex => match self.arg() {
                AluArg::Global { gid } => {
                    let [off] = into_one(src)?;
                    Self::global_index(*gid, off, self.dtype())
                }
                _ => Err(IrError::Type("GlobalIndex without gid arg".into())),
            },
        }
    }

    /// Replace every `Special(name)` with `env[name]`, simultaneously: a
    /// replacement is never itself substituted, so renamings like
    /// `{idx0 -> idx1, idx1 -> idx2}` do not chain.
    pub fn substitute(&self, env: &HashMap<String, AluExp>) -> IrResult<AluExp> {
        if let AluArg::Special { name, .. } = self.arg() {
            if let Some(replacement) = env.get(name) {
                return Ok(replacement.clone());
            }
        }
        if self.src().is_empty() {
            return Ok(self.clone());
        }
        let src = self
            .src()
            .iter()
            .map(|s| s.substitute(env))
            .collect::<IrResult<Vec<_>>>()?;
        self.reconstruct(src)
    }

    /// Bottom-up rewriting to a fixpoint. `f` returns the replacement for a
    /// node, or `None` to keep it. Children are rewritten before parents;
    /// each replacement is itself rewritten until `f` declines.
    pub fn rewrite(&self, f: &mut dyn FnMut(&AluExp) -> Option<AluExp>) -> IrResult<AluExp> {
        let mut rebuilt = if self.src().is_empty() {
            self.clone()
        } else {
            let src = self
                .src()
                .iter()
                .map(|s| s.rewrite(f))
                .collect::<IrResult<Vec<_>>>()?;
            self.reconstruct(src)?
        };
        let mut budget = 1000usize;
        while let Some(next) = f(&rebuilt) {
            if next == rebuilt {
                break;
            }
            // a fresh replacement may itself contain rewritable children
            rebuilt = if next.src().is_empty() {
                next
            } else {
                let src = next
                    .src()
                    .iter()
                    .map(|s| s.rewrite(f))
                    .collect::<IrResult<Vec<_>>>()?;
                next.reconstruct(src)?
            };
            budget -= 1;
            if budget == 0 {
                return Err(IrError::Eval("rewrite did not reach a fixpoint".into()));
            }
        }
        Ok(rebuilt)
    }

    /// Enumerate all subterms matching `pred`, preorder.
    pub fn collect(&self, pred: &dyn Fn(&AluExp) -> bool) -> Vec<AluExp> {
        let mut found = Vec::new();
        self.collect_into(pred, &mut found);
        found
    }

    fn collect_into(&self, pred: &dyn Fn(&AluExp) -> bool, found: &mut Vec<AluExp>) {
        if pred(self) {
            found.push(self.clone());
        }
        for s in self.src() {
            s.collect_into(pred, found);
        }
    }

    /// Renumber the buffer ids of `GlobalView`/`GlobalIndex` reads. Every
    /// referenced gid must be present in `map`.
    pub fn reindex_gids(&self, map: &HashMap<usize, usize>) -> IrResult<AluExp> {
        let src = self
            .src()
            .iter()
            .map(|s| s.reindex_gids(map))
            .collect::<IrResult<Vec<_>>>()?;
        match self.arg() {
            AluArg::View { gid, tracker } => {
                let new_gid = *map
                    .get(gid)
                    .ok_or_else(|| IrError::Eval(format!("unmapped buffer id {gid}")))?;
                Self::global_view(new_gid, tracker.clone(), src, self.dtype())
            }
            AluArg::Global { gid } => {
                let new_gid = *map
                    .get(gid)
                    .ok_or_else(|| IrError::Eval(format!("unmapped buffer id {gid}")))?;
                let [off] = into_one(src)?;
                Self::global_index(new_gid, off, self.dtype())
            }
            _ => {
                if src.is_empty() {
                    Ok(self.clone())
                } else {
                    self.reconstruct(src)
                }
            }
        }
    }
}

fn into_pair(src: Vec<AluExp>) -> IrResult<[AluExp; 2]> {
    <[AluExp; 2]>::try_from(src).map_err(|_| IrError::Type("expected 2 operands".into()))
}

fn into_one(src: Vec<AluExp>) -> IrResult<[AluExp; 1]> {
    <[AluExp; 1]>::try_from(src).map_err(|_| IrError::Type("expected 1 operand".into()))
}
