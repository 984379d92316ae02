//! The stable Jaxpr text format.
//!
//! ```text
//! { lambda a:float32[2,3] .
//!   let b:float32[2,3] = add a 2
//!       c:float32[2,3] = mul b a
//!   in ( c ) }
//! ```
//!
//! Binders are renamed `a, b, c, ...` in definition order (`v_N` past
//! `z`); literals print inline; `jit_call` equations expand their program
//! as an indented nested block. Golden tests pin this format exactly.

use std::collections::HashMap;
use std::fmt;

use crate::primitives::Primitive;

use super::{Atom, Jaxpr, Var};

fn short_name(index: usize) -> String {
    if index < 26 {
        char::from(b'a' + index as u8).to_string()
    } else {
        format!("v_{index}")
    }
}

struct Namer {
    names: HashMap<u32, String>,
}

impl Namer {
    fn for_jaxpr(jaxpr: &Jaxpr) -> Namer {
        let mut names = HashMap::new();
        let mut next = 0usize;
        let mut assign = |names: &mut HashMap<u32, String>, v: &Var| {
            names.entry(v.id).or_insert_with(|| {
                let name = short_name(next);
                next += 1;
                name
            });
        };
        for binder in &jaxpr.in_binders {
            assign(&mut names, binder);
        }
        for eqn in &jaxpr.eqns {
            for binder in &eqn.out_binders {
                assign(&mut names, binder);
            }
        }
        Namer { names }
    }

    fn atom(&self, atom: &Atom) -> String {
        match atom {
            Atom::Var(v) => self
                .names
                .get(&v.id)
                .cloned()
                .unwrap_or_else(|| format!("?v{}", v.id)),
            Atom::Lit(l) => l.value.to_string(),
        }
    }

    fn binder(&self, v: &Var) -> String {
        format!("{}:{}", self.atom(&Atom::Var(v.clone())), v.aval)
    }
}

fn list(items: &[usize]) -> String {
    let inner: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("[{}]", inner.join(","))
}

/// Parameter block of a primitive, e.g. `[axes=[0]]`; empty for
/// parameterless primitives. `jit_call` renders its program inline,
/// indented `indent` spaces past the equation.
fn params(prim: &Primitive, indent: usize) -> String {
    match prim {
        Primitive::ReduceSum { axes } | Primitive::Flip { axes } => {
            format!("[axes={}]", list(axes))
        }
        Primitive::Compare { op } => format!("[op={}]", op.name()),
        Primitive::Transpose { perm } => format!("[perm={}]", list(perm)),
        Primitive::Broadcast { shape, axes } => {
            format!("[shape={} axes={}]", list(shape), list(axes))
        }
        Primitive::Reshape { shape } | Primitive::RandomBits { shape } => {
            format!("[shape={}]", list(shape))
        }
        Primitive::JitCall { jaxpr, num_consts } => {
            let nested = jaxpr.to_string();
            let pad = " ".repeat(indent + 4);
            let indented = nested.replace('\n', &format!("\n{pad}"));
            format!("[ jaxpr={indented} numConsts={num_consts} ]")
        }
        _ => String::new(),
    }
}

impl fmt::Display for Jaxpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namer = Namer::for_jaxpr(self);
        let binders: Vec<String> = self.in_binders.iter().map(|b| namer.binder(b)).collect();
        writeln!(f, "{{ lambda {} .", binders.join(" "))?;
        for (k, eqn) in self.eqns.iter().enumerate() {
            let prefix = if k == 0 { "  let " } else { "      " };
            let outs: Vec<String> = eqn.out_binders.iter().map(|b| namer.binder(b)).collect();
            let args: Vec<String> = eqn.inputs.iter().map(|a| namer.atom(a)).collect();
            let p = params(&eqn.prim, prefix.len());
            let mut line = format!("{}{} = {}{}", prefix, outs.join(" "), eqn.prim.name(), p);
            if !args.is_empty() {
                line.push(' ');
                line.push_str(&args.join(" "));
            }
            writeln!(f, "{line}")?;
        }
        let outs: Vec<String> = self.outs.iter().map(|a| namer.atom(a)).collect();
        write!(f, "  in ( {} ) }}", outs.join(" "))
    }
}
