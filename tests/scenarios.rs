//! End-to-end exercise of the six concrete scenarios from the
//! specification's testable-properties section, driven entirely through
//! the crate's public API (`env` + `converter` + `expr`), since each one
//! composes more than a single module's inline unit tests can reach.

use std::sync::Arc;

use kernel_core::constraint::CollectingSink;
use kernel_core::converter::{Converter, ConverterConfig};
use kernel_core::env::{Definition, EnvView, InMemoryEnv};
use kernel_core::errors::{KernelErr, KernelResult};
use kernel_core::expr::{mk_app, mk_const, mk_lambda, mk_let, mk_meta, mk_prop, mk_var, Binding, BinderStyle, Expr};
use kernel_core::macros::ExtensionContext;
use kernel_core::name::Name;

struct NullCtx<'e> {
    env: &'e dyn EnvView,
}

impl<'e> ExtensionContext for NullCtx<'e> {
    fn env(&self) -> &dyn EnvView {
        self.env
    }
    fn whnf(&mut self, e: &Expr) -> KernelResult<Expr> {
        Ok(e.clone())
    }
    fn infer_type(&mut self, _e: &Expr) -> KernelResult<Expr> {
        Err(KernelErr::NotDefEq)
    }
    fn fresh_name(&mut self) -> Name {
        Name::from("fresh")
    }
    fn add_constraint(&mut self, _c: kernel_core::constraint::Constraint) -> KernelResult<()> {
        Ok(())
    }
}

fn no_args() -> Arc<Vec<kernel_core::level::Level>> {
    Arc::new(Vec::new())
}

#[test]
fn scenario_i_beta_reduction() {
    let env = InMemoryEnv::new(true, true);
    let conv = Converter::new(&env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &env };

    let identity = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_var(0));
    let a = mk_const("a", no_args());
    let applied = mk_app(identity, a.clone());

    assert_eq!(conv.whnf(&applied, &mut ctx).unwrap(), a);
}

#[test]
fn scenario_ii_eta_reduction_respects_toggle() {
    let f = mk_const("f", no_args());
    let lam = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_app(f.clone(), mk_var(0)));

    let eta_env = InMemoryEnv::new(true, true);
    let conv = Converter::new(&eta_env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &eta_env };
    assert_eq!(conv.whnf(&lam, &mut ctx).unwrap(), f);

    let no_eta_env = InMemoryEnv::new(false, true);
    let conv2 = Converter::new(&no_eta_env, ConverterConfig::default());
    let mut ctx2 = NullCtx { env: &no_eta_env };
    assert_eq!(conv2.whnf(&lam, &mut ctx2).unwrap(), lam);
}

#[test]
fn scenario_iii_let_reduction() {
    let env = InMemoryEnv::new(true, true);
    let conv = Converter::new(&env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &env };

    let value = mk_const("v", no_args());
    let let_expr = mk_let(Binding::mk("x", mk_prop(), BinderStyle::Default), value.clone(), mk_var(0));

    assert_eq!(conv.whnf(&let_expr, &mut ctx).unwrap(), conv.whnf(&value, &mut ctx).unwrap());
}

#[test]
fn scenario_iv_lazy_delta_unfolds_by_weight_only_as_needed() {
    let mut env = InMemoryEnv::new(true, true);
    let k = mk_const("k", no_args());
    env.insert(Definition::new_definition(Name::from("h"), Vec::new(), k.clone(), 0, 0, true));
    let h = mk_const("h", no_args());
    env.insert(Definition::new_definition(Name::from("g"), Vec::new(), h, 1, 0, true));
    let g = mk_const("g", no_args());
    env.insert(Definition::new_definition(Name::from("f"), Vec::new(), g, 2, 0, true));

    let conv = Converter::new(&env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &env };
    let mut sink = CollectingSink::default();

    let f = mk_const("f", no_args());
    assert!(conv.is_def_eq(&f, &k, &mut ctx, &mut sink).unwrap());
    assert!(sink.constraints.is_empty());
}

#[test]
fn scenario_v_arguments_equal_shortcut_avoids_unfolding() {
    let mut env = InMemoryEnv::new(true, true);
    let x_ty = mk_prop();
    let body = mk_app(mk_app(mk_const("pair", no_args()), mk_var(1)), mk_var(0));
    let p_value = mk_lambda(
        Binding::mk("x", x_ty.clone(), BinderStyle::Default),
        mk_lambda(Binding::mk("y", x_ty, BinderStyle::Default), body),
    );
    env.insert(Definition::new_definition(Name::from("p"), Vec::new(), p_value, 1, 0, true));

    let conv = Converter::new(&env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &env };
    let mut sink = CollectingSink::default();

    let a = mk_const("a", no_args());
    let b = mk_const("b", no_args());
    let p = mk_const("p", no_args());
    let lhs = mk_app(mk_app(p.clone(), a.clone()), b.clone());
    let rhs = mk_app(mk_app(p, a), b);

    assert!(conv.is_def_eq(&lhs, &rhs, &mut ctx, &mut sink).unwrap());
    assert!(sink.constraints.is_empty());
}

#[test]
fn scenario_vi_metavariable_emits_single_term_constraint() {
    let env = InMemoryEnv::new(true, true);
    let conv = Converter::new(&env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &env };
    let mut sink = CollectingSink::default();

    let m = mk_meta("?m", mk_prop());
    let a = mk_const("a", no_args());
    assert!(conv.is_def_eq(&m, &a, &mut ctx, &mut sink).unwrap());
    assert_eq!(sink.constraints.len(), 1);
    match &sink.constraints[0] {
        kernel_core::constraint::Constraint::TermEq { lhs, rhs, .. } => {
            assert_eq!(lhs, &m);
            assert_eq!(rhs, &a);
        }
        kernel_core::constraint::Constraint::LevelEq { .. } => panic!("expected a term constraint"),
    }
}

#[test]
fn converter_reflexivity_emits_no_constraints() {
    let env = InMemoryEnv::new(true, true);
    let conv = Converter::new(&env, ConverterConfig::default());
    let mut ctx = NullCtx { env: &env };
    let mut sink = CollectingSink::default();

    let e = mk_app(mk_const("f", no_args()), mk_const("a", no_args()));
    assert!(conv.is_def_eq(&e, &e, &mut ctx, &mut sink).unwrap());
    assert!(sink.constraints.is_empty());
}

#[test]
fn home_module_unlocks_opacity_for_its_own_declarations() {
    let mut env = InMemoryEnv::new(true, true);
    let def = Definition::new_opaque_definition(Name::from("priv"), Vec::new(), mk_prop(), 0, 7, true);
    env.insert(def);

    let home_config = ConverterConfig { home_module_idx: Some(7), extra_opaque: Default::default(), memoize: true };
    let conv_home = Converter::new(&env, home_config);
    let mut ctx_home = NullCtx { env: &env };
    let mut sink_home = CollectingSink::default();
    let priv_const = mk_const("priv", no_args());
    let prop = mk_prop();
    assert!(conv_home.is_def_eq(&priv_const, &prop, &mut ctx_home, &mut sink_home).unwrap());

    let elsewhere_config = ConverterConfig { home_module_idx: Some(9), extra_opaque: Default::default(), memoize: true };
    let conv_elsewhere = Converter::new(&env, elsewhere_config);
    let mut ctx_elsewhere = NullCtx { env: &env };
    let mut sink_elsewhere = CollectingSink::default();
    assert!(!conv_elsewhere.is_def_eq(&priv_const, &prop, &mut ctx_elsewhere, &mut sink_elsewhere).unwrap());
}
