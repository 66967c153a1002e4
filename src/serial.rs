use std::io::{self, Read, Write};

use hashbrown::HashMap;

use crate::expr::{mk_app, mk_const, mk_lambda, mk_let, mk_local_w_serial, mk_meta, mk_pi, mk_sort, mk_var, Binding, BinderStyle, Expr};
use crate::level::{mk_imax, mk_max, mk_param, mk_succ, mk_zero, Level};
use crate::macros::MacroSerializer;
use crate::name::Name;

const TAG_VAR: u8 = 0;
const TAG_SORT: u8 = 1;
const TAG_CONST: u8 = 2;
const TAG_APP: u8 = 3;
const TAG_LAMBDA: u8 = 4;
const TAG_PI: u8 = 5;
const TAG_LET: u8 = 6;
const TAG_LOCAL: u8 = 7;
const TAG_META: u8 = 8;
const TAG_MACRO: u8 = 9;
/// A reference back into the already-written stream, taking the place of a
/// node that would otherwise be repeated verbatim; this is what lets the
/// wire format preserve the source DAG's sharing instead of unfolding it
/// into a tree.
const TAG_BACKREF: u8 = 255;

const LVL_ZERO: u8 = 0;
const LVL_SUCC: u8 = 1;
const LVL_MAX: u8 = 2;
const LVL_IMAX: u8 = 3;
const LVL_PARAM: u8 = 4;
const LVL_META: u8 = 5;
const LVL_BACKREF: u8 = 255;

const STYLE_DEFAULT: u8 = 0;
const STYLE_IMPLICIT: u8 = 1;
const STYLE_STRICT_IMPLICIT: u8 = 2;
const STYLE_INST_IMPLICIT: u8 = 3;

fn write_u64(w: &mut impl Write, n: u64) -> io::Result<()> {
    w.write_all(&n.to_le_bytes())
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    write_u64(w, s.len() as u64)?;
    w.write_all(s.as_bytes())
}

fn read_str(r: &mut impl Read) -> io::Result<String> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn style_tag(style: BinderStyle) -> u8 {
    match style {
        BinderStyle::Default => STYLE_DEFAULT,
        BinderStyle::Implicit => STYLE_IMPLICIT,
        BinderStyle::StrictImplicit => STYLE_STRICT_IMPLICIT,
        BinderStyle::InstImplicit => STYLE_INST_IMPLICIT,
    }
}

fn style_from_tag(tag: u8) -> io::Result<BinderStyle> {
    match tag {
        STYLE_DEFAULT => Ok(BinderStyle::Default),
        STYLE_IMPLICIT => Ok(BinderStyle::Implicit),
        STYLE_STRICT_IMPLICIT => Ok(BinderStyle::StrictImplicit),
        STYLE_INST_IMPLICIT => Ok(BinderStyle::InstImplicit),
        owise => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown binder style tag {}", owise))),
    }
}

/// Serializes `Level` and `Expr` trees to a compact binary format that
/// preserves maximal sharing: every node is assigned a back-reference index
/// the first time it's written, and every later occurrence of an
/// already-seen (by structural digest) node is written as a single-byte tag
/// plus a back-reference index instead of being repeated.
pub struct TermWriter<W> {
    out: W,
    seen_levels: HashMap<u64, u64>,
    seen_exprs: HashMap<u64, u64>,
    next_level_idx: u64,
    next_expr_idx: u64,
}

impl<W: Write> TermWriter<W> {
    pub fn new(out: W) -> Self {
        TermWriter { out, seen_levels: HashMap::new(), seen_exprs: HashMap::new(), next_level_idx: 0, next_expr_idx: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write_level(&mut self, level: &Level) -> io::Result<()> {
        let digest = level_digest(level);
        if let Some(&idx) = self.seen_levels.get(&digest) {
            self.out.write_all(&[LVL_BACKREF])?;
            return write_u64(&mut self.out, idx);
        }
        let idx = self.next_level_idx;
        self.next_level_idx += 1;
        self.seen_levels.insert(digest, idx);

        match level.as_ref() {
            crate::level::InnerLevel::Zero => self.out.write_all(&[LVL_ZERO]),
            crate::level::InnerLevel::Succ(inner) => {
                self.out.write_all(&[LVL_SUCC])?;
                self.write_level(inner)
            }
            crate::level::InnerLevel::Max(a, b) => {
                self.out.write_all(&[LVL_MAX])?;
                self.write_level(a)?;
                self.write_level(b)
            }
            crate::level::InnerLevel::IMax(a, b) => {
                self.out.write_all(&[LVL_IMAX])?;
                self.write_level(a)?;
                self.write_level(b)
            }
            crate::level::InnerLevel::Param(n) => {
                self.out.write_all(&[LVL_PARAM])?;
                self.write_name(n)
            }
            crate::level::InnerLevel::Meta(n) => {
                self.out.write_all(&[LVL_META])?;
                self.write_name(n)
            }
        }
    }

    fn write_name(&mut self, name: &Name) -> io::Result<()> {
        write_str(&mut self.out, &format!("{:?}", name))
    }

    pub fn write_expr(&mut self, e: &Expr) -> io::Result<()> {
        let digest = e.get_digest();
        if let Some(&idx) = self.seen_exprs.get(&digest) {
            self.out.write_all(&[TAG_BACKREF])?;
            return write_u64(&mut self.out, idx);
        }
        let idx = self.next_expr_idx;
        self.next_expr_idx += 1;
        self.seen_exprs.insert(digest, idx);

        if e.is_var() {
            self.out.write_all(&[TAG_VAR])?;
            let dbj = match e.as_ref() {
                crate::expr::InnerExpr::Var { dbj, .. } => *dbj,
                _ => unreachable!(),
            };
            return write_u64(&mut self.out, dbj as u64);
        }
        if e.is_sort() {
            self.out.write_all(&[TAG_SORT])?;
            return self.write_level(e.get_sort_level());
        }
        if e.is_const() {
            self.out.write_all(&[TAG_CONST])?;
            self.write_name(e.get_const_name())?;
            let levels = e.get_const_levels();
            write_u64(&mut self.out, levels.len() as u64)?;
            for l in levels.iter() {
                self.write_level(l)?;
            }
            return Ok(());
        }
        if e.is_app() {
            self.out.write_all(&[TAG_APP])?;
            let (fun, args) = e.unfold_apps();
            self.write_expr(&fun)?;
            write_u64(&mut self.out, args.len() as u64)?;
            for a in &args {
                self.write_expr(a)?;
            }
            return Ok(());
        }
        if e.is_lambda() || e.is_pi() {
            self.out.write_all(&[if e.is_lambda() { TAG_LAMBDA } else { TAG_PI }])?;
            let binder = e.get_binder();
            self.write_name(&binder.pp_name)?;
            self.out.write_all(&[style_tag(binder.style)])?;
            self.write_expr(&binder.ty)?;
            return self.write_expr(e.get_body());
        }
        if e.is_let() {
            self.out.write_all(&[TAG_LET])?;
            let binder = e.get_binder();
            self.write_name(&binder.pp_name)?;
            self.write_expr(&binder.ty)?;
            let val = match e.as_ref() {
                crate::expr::InnerExpr::Let { val, .. } => val.clone(),
                _ => unreachable!(),
            };
            self.write_expr(&val)?;
            return self.write_expr(e.get_body());
        }
        if e.is_local() {
            self.out.write_all(&[TAG_LOCAL])?;
            write_u64(&mut self.out, e.get_local_serial())?;
            let binder = e.get_binder();
            self.write_name(&binder.pp_name)?;
            self.out.write_all(&[style_tag(binder.style)])?;
            return self.write_expr(&binder.ty);
        }
        if e.is_meta_node() {
            self.out.write_all(&[TAG_META])?;
            let (name, ty) = match e.as_ref() {
                crate::expr::InnerExpr::Meta { name, ty, .. } => (name.clone(), ty.clone()),
                _ => unreachable!(),
            };
            self.write_name(&name)?;
            return self.write_expr(&ty);
        }
        // Macro: only the name and argument list survive serialization; the
        // reader needs a `MacroSerializer` to turn that back into a live
        // `MacroDefinition`.
        self.out.write_all(&[TAG_MACRO])?;
        let (name, args) = match e.as_ref() {
            crate::expr::InnerExpr::Macro { definition, args, .. } => (definition.macro_name().clone(), args.clone()),
            _ => unreachable!(),
        };
        self.write_name(&name)?;
        write_u64(&mut self.out, args.len() as u64)?;
        for a in &args {
            self.write_expr(a)?;
        }
        Ok(())
    }
}

fn level_digest(l: &Level) -> u64 {
    fxhash::hash64(&format!("{:?}", l))
}

pub struct TermReader<'m, R> {
    input: R,
    levels: Vec<Level>,
    exprs: Vec<Expr>,
    macros: &'m dyn MacroSerializer,
}

impl<'m, R: Read> TermReader<'m, R> {
    pub fn new(input: R, macros: &'m dyn MacroSerializer) -> Self {
        TermReader { input, levels: Vec::new(), exprs: Vec::new(), macros }
    }

    fn read_tag(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_name(&mut self) -> io::Result<Name> {
        let s = read_str(&mut self.input)?;
        Ok(name_from_debug_repr(&s))
    }

    pub fn read_level(&mut self) -> io::Result<Level> {
        let tag = self.read_tag()?;
        if tag == LVL_BACKREF {
            let idx = read_u64(&mut self.input)? as usize;
            return self.levels.get(idx).cloned().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad level back-reference"));
        }
        // Reserve this node's index before recursing into its children, so it
        // lines up with the index `TermWriter::write_level` assigned it on
        // the way down rather than the order its subtree finishes reading.
        let idx = self.levels.len();
        self.levels.push(mk_zero());
        let result = match tag {
            LVL_ZERO => mk_zero(),
            LVL_SUCC => {
                let inner = self.read_level()?;
                mk_succ(inner)
            }
            LVL_MAX => {
                let a = self.read_level()?;
                let b = self.read_level()?;
                mk_max(a, b)
            }
            LVL_IMAX => {
                let a = self.read_level()?;
                let b = self.read_level()?;
                mk_imax(a, b)
            }
            LVL_PARAM => {
                let n = self.read_name()?;
                mk_param(n)
            }
            LVL_META => {
                let n = self.read_name()?;
                mk_meta(n)
            }
            owise => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown level tag {}", owise))),
        };
        self.levels[idx] = result.clone();
        Ok(result)
    }

    pub fn read_expr(&mut self) -> io::Result<Expr> {
        let tag = self.read_tag()?;
        if tag == TAG_BACKREF {
            let idx = read_u64(&mut self.input)? as usize;
            return self.exprs.get(idx).cloned().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad expr back-reference"));
        }
        // Reserve this node's index before recursing into its children, so it
        // lines up with the index `TermWriter::write_expr` assigned it on the
        // way down rather than the order its subtree finishes reading.
        let idx = self.exprs.len();
        self.exprs.push(mk_var(0));
        let result = match tag {
            TAG_VAR => {
                let dbj = read_u64(&mut self.input)?;
                mk_var(dbj as u16)
            }
            TAG_SORT => {
                let level = self.read_level()?;
                mk_sort(level)
            }
            TAG_CONST => {
                let name = self.read_name()?;
                let n_levels = read_u64(&mut self.input)?;
                let mut levels = Vec::with_capacity(n_levels as usize);
                for _ in 0..n_levels {
                    levels.push(self.read_level()?);
                }
                mk_const(name, levels)
            }
            TAG_APP => {
                let fun = self.read_expr()?;
                let n_args = read_u64(&mut self.input)?;
                let mut acc = fun;
                let mut args = Vec::with_capacity(n_args as usize);
                for _ in 0..n_args {
                    args.push(self.read_expr()?);
                }
                for a in &args {
                    acc = mk_app(acc, a.clone());
                }
                acc
            }
            TAG_LAMBDA | TAG_PI => {
                let name = self.read_name()?;
                let style_tag = self.read_tag()?;
                let style = style_from_tag(style_tag)?;
                let ty = self.read_expr()?;
                let body = self.read_expr()?;
                let binder = Binding::mk(name, ty, style);
                if tag == TAG_LAMBDA { mk_lambda(binder, body) } else { mk_pi(binder, body) }
            }
            TAG_LET => {
                let name = self.read_name()?;
                let ty = self.read_expr()?;
                let val = self.read_expr()?;
                let body = self.read_expr()?;
                mk_let(Binding::mk(name, ty, BinderStyle::Default), val, body)
            }
            TAG_LOCAL => {
                let serial = read_u64(&mut self.input)?;
                let name = self.read_name()?;
                let style_tag = self.read_tag()?;
                let style = style_from_tag(style_tag)?;
                let ty = self.read_expr()?;
                mk_local_w_serial(name, ty, style, serial)
            }
            TAG_META => {
                let name = self.read_name()?;
                let ty = self.read_expr()?;
                mk_meta(name, ty)
            }
            TAG_MACRO => {
                let name = self.read_name()?;
                let n_args = read_u64(&mut self.input)?;
                let mut args = Vec::with_capacity(n_args as usize);
                for _ in 0..n_args {
                    args.push(self.read_expr()?);
                }
                let definition = self
                    .macros
                    .lookup(&name)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unregistered macro {:?}", name)))?;
                crate::expr::mk_macro(definition, args)
            }
            owise => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown expr tag {}", owise))),
        };
        self.exprs[idx] = result.clone();
        Ok(result)
    }
}

fn name_from_debug_repr(s: &str) -> Name {
    if s.is_empty() {
        return Name::anon_placeholder();
    }
    s.split('.').fold(Name::anon_placeholder(), |acc, part| {
        match part.parse::<u64>() {
            Ok(n) => acc.extend_num(n),
            Err(_) => acc.extend_str(part),
        }
    })
}

#[cfg(test)]
mod serial_tests {
    use super::*;
    use crate::expr::{mk_app, mk_const, mk_var};
    use crate::macros::MacroDefinition;
    use std::sync::Arc;

    struct NoMacros;
    impl MacroSerializer for NoMacros {
        fn lookup(&self, _name: &Name) -> Option<Arc<dyn MacroDefinition>> {
            None
        }
    }

    #[test]
    fn roundtrips_shared_subterm() {
        let shared = mk_const("foo", Arc::new(vec![mk_param("u")]));
        let term = mk_app(shared.clone(), shared.clone());

        let mut buf = Vec::new();
        let mut w = TermWriter::new(&mut buf);
        w.write_expr(&term).unwrap();

        let no_macros = NoMacros;
        let mut r = TermReader::new(buf.as_slice(), &no_macros);
        let back = r.read_expr().unwrap();
        assert_eq!(back, term);
    }

    #[test]
    fn roundtrips_meta_level_distinct_from_param() {
        let term = mk_sort_for_test(mk_meta("?u"));
        let mut buf = Vec::new();
        let mut w = TermWriter::new(&mut buf);
        w.write_expr(&term).unwrap();
        let no_macros = NoMacros;
        let mut r = TermReader::new(buf.as_slice(), &no_macros);
        let back = r.read_expr().unwrap();
        assert_eq!(back, term);
        assert!(back.get_sort_level().is_meta());
    }

    fn mk_sort_for_test(level: Level) -> Expr {
        crate::expr::mk_sort(level)
    }

    #[test]
    fn roundtrips_var_and_sort() {
        let term = mk_var(3);
        let mut buf = Vec::new();
        let mut w = TermWriter::new(&mut buf);
        w.write_expr(&term).unwrap();
        let no_macros = NoMacros;
        let mut r = TermReader::new(buf.as_slice(), &no_macros);
        assert_eq!(r.read_expr().unwrap(), term);
    }
}
