//! Demonstration driver for the term algebra / convertibility kernel core.
//!
//! This binary is not part of the library's public contract; it wires a
//! small `InMemoryEnv` together with the `Converter` and walks through the
//! six concrete scenarios described in the specification's testable
//! properties section, printing each verdict. A real embedding (elaborator,
//! tactic engine, ...) would drive `kernel_core::converter::Converter`
//! directly against its own `EnvView` instead of going through this binary.

use std::sync::Arc;

use structopt::StructOpt;

use kernel_core::cli::{try_read_converter_options, ConverterOptions, Opt};
use kernel_core::constraint::CollectingSink;
use kernel_core::converter::{Converter, ConverterConfig};
use kernel_core::env::{Definition, EnvView, InMemoryEnv};
use kernel_core::errors::KernelResult;
use kernel_core::expr::{mk_app, mk_const, mk_lambda, mk_let, mk_meta, mk_prop, mk_var, Binding, BinderStyle, Expr};
use kernel_core::macros::ExtensionContext;
use kernel_core::name::Name;

/// The minimal `ExtensionContext` the demonstration binary needs: it never
/// expands a macro or infers a type on its own behalf, so those hooks are
/// stubs; a real caller's elaborator would supply a live type-checker here.
struct DemoCtx<'e> {
    env: &'e dyn EnvView,
}

impl<'e> ExtensionContext for DemoCtx<'e> {
    fn env(&self) -> &dyn EnvView {
        self.env
    }

    fn whnf(&mut self, e: &Expr) -> KernelResult<Expr> {
        Ok(e.clone())
    }

    fn infer_type(&mut self, _e: &Expr) -> KernelResult<Expr> {
        Err(kernel_core::errors::KernelErr::NotDefEq)
    }

    fn fresh_name(&mut self) -> Name {
        Name::from("fresh")
    }

    fn add_constraint(&mut self, _c: kernel_core::constraint::Constraint) -> KernelResult<()> {
        Ok(())
    }
}

fn merge_options(opt: &Opt) -> ConverterOptions {
    let mut opts = try_read_converter_options().unwrap_or_else(ConverterOptions::new_default);
    if opt.no_eta {
        opts.eta = false;
    }
    if opt.no_proof_irrel {
        opts.proof_irrel = false;
    }
    opts
}

/// Builds the `ConverterConfig` each scenario actually runs against from the
/// merged CLI/config-file options, so `converter_options.txt`'s
/// `home_module`/`extra_opaque`/`memoize` entries reach the converters this
/// binary constructs instead of being parsed and then discarded.
fn config_from(opts: &ConverterOptions) -> ConverterConfig {
    let home_module_idx = if opts.home_module_idx == 0 { None } else { Some(opts.home_module_idx as u32) };
    ConverterConfig { home_module_idx, extra_opaque: opts.extra_opaque.iter().cloned().collect(), memoize: opts.memoize }
}

fn run_scenario(name: &str, ok: bool) {
    if ok {
        println!("[ok]   {}", name);
    } else {
        println!("[FAIL] {}", name);
    }
}

/// Scenario (i): `whnf(App(I, a)) == a` for `I := λx. x`.
fn scenario_beta(env: &InMemoryEnv, config: &ConverterConfig) -> bool {
    let conv = Converter::new(env, config.clone());
    let mut ctx = DemoCtx { env };
    let identity = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_var(0));
    let a = mk_const("a", Arc::new(Vec::new()));
    let applied = mk_app(identity, a.clone());
    match conv.whnf(&applied, &mut ctx) {
        Ok(reduced) => reduced == a,
        Err(_) => false,
    }
}

/// Scenario (ii): eta-reduction collapses `λx. f x` to `f` when enabled, and
/// is a no-op when disabled.
fn scenario_eta(eta_env: &InMemoryEnv, no_eta_env: &InMemoryEnv, config: &ConverterConfig) -> bool {
    let f = mk_const("f", Arc::new(Vec::new()));
    let lam = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_app(f.clone(), mk_var(0)));

    let conv_eta = Converter::new(eta_env, config.clone());
    let mut ctx_eta = DemoCtx { env: eta_env };
    let reduced_on = match conv_eta.whnf(&lam, &mut ctx_eta) {
        Ok(r) => r == f,
        Err(_) => false,
    };

    let conv_no_eta = Converter::new(no_eta_env, config.clone());
    let mut ctx_no_eta = DemoCtx { env: no_eta_env };
    let reduced_off = match conv_no_eta.whnf(&lam, &mut ctx_no_eta) {
        Ok(r) => r == lam,
        Err(_) => false,
    };

    reduced_on && reduced_off
}

/// Scenario (iii): `whnf(Let(x, T, V, Var(0))) == whnf(V)`.
fn scenario_let(env: &InMemoryEnv, config: &ConverterConfig) -> bool {
    let conv = Converter::new(env, config.clone());
    let mut ctx = DemoCtx { env };
    let value = mk_const("v", Arc::new(Vec::new()));
    let let_expr = mk_let(Binding::mk("x", mk_prop(), BinderStyle::Default), value.clone(), mk_var(0));
    match (conv.whnf(&let_expr, &mut ctx), conv.whnf(&value, &mut ctx)) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => false,
    }
}

/// Scenario (iv): lazy delta unfolds in weight order and never touches the
/// most-fundamental definition `k`.
fn scenario_lazy_delta(config: &ConverterConfig) -> bool {
    let mut env = InMemoryEnv::new(true, true);
    let k = mk_const("k", Arc::new(Vec::new()));
    env.insert(Definition::new_definition(Name::from("h"), Vec::new(), k.clone(), 0, 0, true));
    let h = mk_const("h", Arc::new(Vec::new()));
    env.insert(Definition::new_definition(Name::from("g"), Vec::new(), h, 1, 0, true));
    let g = mk_const("g", Arc::new(Vec::new()));
    env.insert(Definition::new_definition(Name::from("f"), Vec::new(), g, 2, 0, true));

    let conv = Converter::new(&env, config.clone());
    let mut ctx = DemoCtx { env: &env };
    let mut sink = CollectingSink::default();
    let f = mk_const("f", Arc::new(Vec::new()));
    match conv.is_def_eq(&f, &k, &mut ctx, &mut sink) {
        Ok(result) => result,
        Err(_) => false,
    }
}

/// Scenario (v): the arguments-equal shortcut decides `p a b =?= p a b`
/// without unfolding `p`.
fn scenario_args_equal_shortcut(config: &ConverterConfig) -> bool {
    let mut env = InMemoryEnv::new(true, true);
    let x_ty = mk_prop();
    let body = mk_app(
        mk_app(mk_const("pair", Arc::new(Vec::new())), mk_var(1)),
        mk_var(0),
    );
    let p_value = mk_lambda(
        Binding::mk("x", x_ty.clone(), BinderStyle::Default),
        mk_lambda(Binding::mk("y", x_ty, BinderStyle::Default), body),
    );
    env.insert(Definition::new_definition(Name::from("p"), Vec::new(), p_value, 1, 0, true));

    let conv = Converter::new(&env, config.clone());
    let mut ctx = DemoCtx { env: &env };
    let mut sink = CollectingSink::default();
    let a = mk_const("a", Arc::new(Vec::new()));
    let b = mk_const("b", Arc::new(Vec::new()));
    let p = mk_const("p", Arc::new(Vec::new()));
    let lhs = mk_app(mk_app(p.clone(), a.clone()), b.clone());
    let rhs = mk_app(mk_app(p, a), b);
    match conv.is_def_eq(&lhs, &rhs, &mut ctx, &mut sink) {
        Ok(result) => result,
        Err(_) => false,
    }
}

/// Scenario (vi): comparing a metavariable against a constant succeeds and
/// emits exactly one term constraint.
fn scenario_metavariable_constraint(env: &InMemoryEnv) -> bool {
    let conv = Converter::new(env, ConverterConfig::default());
    let mut ctx = DemoCtx { env };
    let mut sink = CollectingSink::default();
    let m = mk_meta("?m", mk_prop());
    let a = mk_const("a", Arc::new(Vec::new()));
    let decided = match conv.is_def_eq(&m, &a, &mut ctx, &mut sink) {
        Ok(result) => result,
        Err(_) => false,
    };
    decided && sink.constraints.len() == 1
}

fn run_all(opt: &Opt, opts: &ConverterOptions) {
    let config = config_from(opts);
    let env = InMemoryEnv::new(opts.eta, opts.proof_irrel);
    let no_eta_env = InMemoryEnv::new(false, opts.proof_irrel);

    let scenarios: &[(&str, bool)] = &[
        ("beta reduction", scenario_beta(&env, &config)),
        ("eta reduction (enabled + disabled)", scenario_eta(&env, &no_eta_env, &config)),
        ("let/zeta reduction", scenario_let(&env, &config)),
        ("lazy delta by weight", scenario_lazy_delta(&config)),
        ("arguments-equal shortcut", scenario_args_equal_shortcut(&config)),
        ("metavariable constraint emission", scenario_metavariable_constraint(&env)),
    ];

    for (name, ok) in scenarios {
        if opt.scenario == "all" || opt.scenario == *name {
            run_scenario(name, *ok);
        }
    }
}

fn main() {
    let opt = Opt::from_args();

    if opt.debug {
        tracing_subscriber::fmt::init();
        println!("CLI returned these arguments: {:#?}", opt);
    }

    let opts = merge_options(&opt);
    run_all(&opt, &opts);
}
