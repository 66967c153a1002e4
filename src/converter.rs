use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::{HashMap, HashSet};

use crate::constraint::{CollectingSink, Constraint, ConstraintSink};
use crate::env::{Definition, EnvView};
use crate::errors::{KernelErr, KernelResult};
use crate::expr::Expr;
use crate::justification::{ConstraintRecord, DelayedJustification, Justification};
use crate::level::Level;
use crate::macros::ExtensionContext;
use crate::name::Name;

/// Constructor-time configuration for a `Converter`. Two converters built
/// from the same `ConverterConfig` against the same environment always agree
/// on every comparison; the config exists so that a caller checking one
/// specific module can loosen opacity for declarations local to that module
/// without mutating the environment itself.
#[derive(Clone)]
pub struct ConverterConfig {
    /// The compilation unit currently being checked, if any. Declarations
    /// whose `module_idx` matches this one are unfolded even when marked
    /// opaque, mirroring "a module can see its own private definitions".
    pub home_module_idx: Option<u32>,
    /// Declarations forced opaque regardless of their own `is_opaque` flag,
    /// for callers implementing a `set_option`-style override.
    pub extra_opaque: HashSet<Name>,
    /// Whether `whnf_core`/`whnf` results are cached at all. Disabling this
    /// trades memory for determinism when debugging a suspected caching bug;
    /// every other part of the converter behaves identically either way.
    pub memoize: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        ConverterConfig { home_module_idx: None, extra_opaque: HashSet::new(), memoize: true }
    }
}

/// Single-threaded, cooperatively-cancellable engine for weak head
/// normalization and definitional equality. A `Converter` owns no state that
/// must outlive one top-level call; its caches exist purely to avoid
/// repeating work within a single comparison (or a short burst of related
/// comparisons against the same environment) and may be dropped or rebuilt
/// freely. Every cache here is a `RefCell`, not a `Mutex`/`RwLock`: per the
/// concurrency model, one `Converter` instance is driven by exactly one
/// thread at a time, even though the `Expr`/`Level` values it touches are
/// shared freely with other threads via `Arc`.
pub struct Converter<'e> {
    env: &'e dyn EnvView,
    config: ConverterConfig,
    /// Caches `whnf_core` (no delta-unfolding) results.
    whnf_core_cache: RefCell<HashMap<Expr, Expr>>,
    /// Caches full `whnf` (delta + normalizer extensions) results, kept
    /// separate from `whnf_core_cache` because the two operations are run
    /// at different points in `is_def_eq` and agreeing on what's memoized
    /// where keeps cache keys from silently shadowing each other.
    whnf_cache: RefCell<HashMap<Expr, Expr>>,
    interrupted: Arc<AtomicBool>,
}

pub fn new_default_env_converter<'e>(env: &'e dyn EnvView) -> Converter<'e> {
    Converter::new(env, ConverterConfig::default())
}

impl<'e> Converter<'e> {
    pub fn new(env: &'e dyn EnvView, config: ConverterConfig) -> Self {
        Converter {
            env,
            config,
            whnf_core_cache: RefCell::new(HashMap::new()),
            whnf_cache: RefCell::new(HashMap::new()),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle the owner of this converter can hand to another thread (or
    /// a signal handler) to request that the in-progress computation bail
    /// out at its next cooperative checkpoint.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn check_system(&self) -> KernelResult<()> {
        if self.interrupted.load(Ordering::Relaxed) {
            tracing::warn!("converter interrupted mid-traversal");
            Err(KernelErr::Interrupted)
        } else {
            Ok(())
        }
    }

    /// The opacity decision, in priority order: (1) theorems are always
    /// opaque, since their proofs carry no computational content worth
    /// unfolding; (2) an explicit per-call override always wins next; (3) a
    /// definition never marked opaque in the first place is transparent;
    /// (4) a definition declared in the converter's own home module is
    /// transparent even if marked opaque; (5) otherwise, opaque.
    fn is_opaque(&self, def: &Definition) -> bool {
        if def.is_theorem() {
            return true;
        }
        if self.config.extra_opaque.contains(def.get_name()) {
            return true;
        }
        if !def.is_opaque() {
            return false;
        }
        if self.config.home_module_idx == Some(def.get_module_idx()) {
            return false;
        }
        true
    }

    fn unfold_definition(&self, name: &Name, levels: &[Level]) -> Option<Expr> {
        let def = self.env.find(name)?;
        if self.is_opaque(def) {
            return None;
        }
        Some(def.get_value().instantiate_lparams(def.get_params(), levels))
    }

    fn weight_of(&self, name: &Name) -> Option<u32> {
        self.env.find(name).map(|d| d.get_weight())
    }

    fn unfold_const_head(&self, e: &Expr) -> Option<Expr> {
        if !e.is_const() {
            return None;
        }
        self.unfold_definition(e.get_const_name(), e.get_const_levels())
    }

    /// Tries to collapse `Lambda(_, App(f, Var(0)))` down to `f`, when `f`
    /// does not itself mention the bound variable. Preserves sharing: when
    /// the eta-contraction is available, the original `fun` subterm is
    /// returned verbatim rather than a freshly-built but structurally equal
    /// node.
    fn try_eta(&self, e: &Expr) -> Option<Expr> {
        if !self.env.eta() || !e.is_lambda() {
            return None;
        }
        let body = e.get_body();
        if !body.is_app() {
            return None;
        }
        let (fun, args) = body.unfold_apps();
        if args.len() != 1 {
            return None;
        }
        if !args[0].is_var() {
            return None;
        }
        if fun.has_free_var(0) {
            return None;
        }
        Some(fun.lower_free_vars(1))
    }

    /// One pass of weak head normalization with no delta-unfolding: beta,
    /// zeta (let), eta (if enabled), and a memoized spine reduction. Macro
    /// expansion is attempted as a last resort, since an unexpanded macro
    /// head still counts as being "in whnf" as far as this pass is
    /// concerned -- only `whnf` (below) interleaves macro/normalizer-
    /// extension steps with further `whnf_core` passes.
    pub fn whnf_core(&self, e: &Expr, ctx: &mut dyn ExtensionContext) -> KernelResult<Expr> {
        self.check_system()?;
        if !self.config.memoize {
            return self.whnf_core_uncached(e, ctx);
        }
        if let Some(cached) = self.whnf_core_cache.borrow().get(e) {
            tracing::trace!(digest = cached.get_digest(), "whnf_core cache hit");
            return Ok(cached.clone());
        }
        let result = self.whnf_core_uncached(e, ctx)?;
        self.whnf_core_cache.borrow_mut().insert(e.clone(), result.clone());
        Ok(result)
    }

    fn whnf_core_uncached(&self, e: &Expr, ctx: &mut dyn ExtensionContext) -> KernelResult<Expr> {
        if e.is_let() {
            let val = match e.as_ref() {
                crate::expr::InnerExpr::Let { val, .. } => val.clone(),
                _ => unreachable!(),
            };
            let body = e.get_body();
            return self.whnf_core(&body.instantiate(&val), ctx);
        }

        if e.is_app() {
            let (head, args) = e.unfold_apps();
            let head_whnf = self.whnf_core(&head, ctx)?;
            if head_whnf.is_lambda() {
                let mut cursor = head_whnf;
                let mut remaining = args.as_slice();
                let mut consumed = Vec::new();
                while cursor.is_lambda() && !remaining.is_empty() {
                    consumed.push(remaining[0].clone());
                    cursor = cursor.get_body().clone();
                    remaining = &remaining[1..];
                }
                let reduced = cursor.instantiate_multi(&consumed.iter().rev().cloned().collect::<Vec<_>>());
                let reapplied = reduced.fold_apps(remaining.iter());
                return self.whnf_core(&reapplied, ctx);
            }
            if let Some(expanded) = self.try_macro_expand1(&head_whnf, &args, ctx) {
                return self.whnf_core(&expanded, ctx);
            }
            if head_whnf == head {
                return Ok(e.clone());
            }
            return Ok(head_whnf.fold_apps(args.iter()));
        }

        if let Some(eta_reduced) = self.try_eta(e) {
            return self.whnf_core(&eta_reduced, ctx);
        }

        if let Some(expanded) = self.try_macro_expand1(e, &[], ctx) {
            return self.whnf_core(&expanded, ctx);
        }

        Ok(e.clone())
    }

    fn try_macro_expand1(&self, head: &Expr, _outer_args: &[Expr], ctx: &mut dyn ExtensionContext) -> Option<Expr> {
        if !head.is_macro() {
            return None;
        }
        match head.as_ref() {
            crate::expr::InnerExpr::Macro { definition, args, .. } => definition.expand1(args, ctx),
            _ => None,
        }
    }

    /// Delta-reduces `e` to weak head normal form, unfolding the head
    /// constant only while its weight is `>= weight_floor`, alternating with
    /// `whnf_core` until a fixpoint is reached. `weight_floor` lets
    /// `is_def_eq`'s lazy-delta loop unfold only the heavier of two mismatched
    /// heads on a given round instead of eagerly unfolding everything.
    pub fn whnf_core_delta(&self, e: &Expr, weight_floor: u32, ctx: &mut dyn ExtensionContext) -> KernelResult<Expr> {
        let mut current = self.whnf_core(e, ctx)?;
        loop {
            self.check_system()?;
            let (head, args) = current.unfold_apps();
            let unfolded = match self.weight_of_head(&head) {
                Some(w) if w >= weight_floor => self.unfold_const_head(&head),
                _ => None,
            };
            match unfolded {
                Some(new_head) => {
                    if head.is_const() {
                        tracing::debug!(
                            name = ?head.get_const_name(),
                            weight_floor,
                            "delta-unfolding definition"
                        );
                    }
                    let reapplied = new_head.fold_apps(args.iter());
                    current = self.whnf_core(&reapplied, ctx)?;
                }
                None => return Ok(current),
            }
        }
    }

    fn weight_of_head(&self, head: &Expr) -> Option<u32> {
        if !head.is_const() {
            return None;
        }
        self.weight_of(head.get_const_name())
    }

    /// Full weak head normal form: repeatedly alternates `whnf_core` (beta/
    /// zeta/eta + unbounded delta) with a normalizer-extension attempt,
    /// until neither makes progress. Kept in its own cache separate from
    /// `whnf_core_cache` since it represents a strictly further-reduced (and
    /// more expensive to recompute) state.
    pub fn whnf(&self, e: &Expr, ctx: &mut dyn ExtensionContext) -> KernelResult<Expr> {
        let _span = tracing::debug_span!("whnf", digest = e.get_digest()).entered();
        self.check_system()?;
        if self.config.memoize {
            if let Some(cached) = self.whnf_cache.borrow().get(e) {
                return Ok(cached.clone());
            }
        }
        let mut current = self.whnf_core_delta(e, 0, ctx)?;
        loop {
            self.check_system()?;
            match self.env.norm_ext(&current, ctx) {
                Some(next) => {
                    current = self.whnf_core_delta(&next, 0, ctx)?;
                }
                None => break,
            }
        }
        if self.config.memoize {
            self.whnf_cache.borrow_mut().insert(e.clone(), current.clone());
        }
        Ok(current)
    }

    /// Phase 1 (quick check): identical nodes, or nodes structurally equal
    /// under the canonical `Expr::eq`, are trivially definitionally equal
    /// without reducing anything.
    fn quick_is_def_eq(&self, t: &Expr, s: &Expr) -> bool {
        t == s
    }

    /// If the head of either side's spine is a metavariable, the converter
    /// can't decide the comparison on its own; it speculatively reports
    /// success and hands the decision to the elaborator as a constraint. A
    /// metavariable buried under a constant head (e.g. `f ?m`) is left for
    /// the structural/congruence paths to decompose instead. If the sink
    /// refuses the constraint, the speculative success is retracted and the
    /// comparison fails.
    fn try_defer_to_metavariable(
        &self,
        t: &Expr,
        s: &Expr,
        sink: &mut dyn ConstraintSink,
    ) -> Option<KernelResult<bool>> {
        if !t.is_meta() && !s.is_meta() {
            return None;
        }
        tracing::debug!(lhs = t.get_digest(), rhs = s.get_digest(), "deferring comparison to metavariable constraint");
        let (t2, s2) = (t.clone(), s.clone());
        let dj = DelayedJustification::lazy(move || Justification::Propagation(Box::new(ConstraintRecord::TermEq(t2.clone(), s2.clone()))));
        let constraint = Constraint::TermEq { lhs: t.clone(), rhs: s.clone(), justification: dj.materialize() };
        match sink.add_constraint(constraint) {
            Ok(()) => Some(Ok(true)),
            Err(_) => Some(Err(KernelErr::ConstraintRetracted)),
        }
    }

    fn is_def_eq_levels(&self, lhs: &[Level], rhs: &[Level], sink: &mut dyn ConstraintSink) -> KernelResult<bool> {
        if lhs.len() != rhs.len() {
            return Ok(false);
        }
        for (a, b) in lhs.iter().zip(rhs.iter()) {
            if a.has_metavariable() || b.has_metavariable() {
                let (a2, b2) = (a.clone(), b.clone());
                let dj = DelayedJustification::lazy(move || Justification::Propagation(Box::new(ConstraintRecord::LevelEq(a2.clone(), b2.clone()))));
                let constraint = Constraint::LevelEq { lhs: a.clone(), rhs: b.clone(), justification: dj.materialize() };
                sink.add_constraint(constraint).map_err(|_| KernelErr::ConstraintRetracted)?;
            } else if !a.eq_by_antisymm(b) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The "arguments-equal" shortcut: when both sides are applications of
    /// the very same (pointer-identical) definition, neither side contains a
    /// metavariable, the head is transparent-or-not-the-point (we never
    /// unfolded it to get here), and the definition opted in via
    /// `use_conv_opt`, it suffices to check the spines pointwise rather than
    /// re-deriving full congruence; this is purely an optimization; the
    /// slower congruence path below would reach the same answer.
    ///
    /// The attempt is speculative: argument comparisons run against a
    /// buffered sink rather than `sink` directly, so a mismatch partway
    /// through the spine can abandon the branch atomically instead of
    /// leaving constraints from the pairs that did match stranded in the
    /// caller's sink. A mismatch falls through to the default unfolding
    /// path (`Ok(None)`), not a hard failure (`Ok(Some(false))`) -- the
    /// shortcut not applying says nothing about whether `t` and `s` are
    /// actually definitionally equal.
    fn try_args_equal_shortcut(
        &self,
        t: &Expr,
        s: &Expr,
        ctx: &mut dyn ExtensionContext,
        sink: &mut dyn ConstraintSink,
    ) -> KernelResult<Option<bool>> {
        let (t_head, t_args) = t.unfold_apps();
        let (s_head, s_args) = s.unfold_apps();
        if !t_head.is_const() || !s_head.is_const() {
            return Ok(None);
        }
        if t_head.get_const_name() != s_head.get_const_name() {
            return Ok(None);
        }
        if t_args.len() != s_args.len() {
            return Ok(None);
        }
        if t.has_metavariable() || s.has_metavariable() {
            return Ok(None);
        }
        let def = match self.env.find(t_head.get_const_name()) {
            Some(d) => d,
            None => return Ok(None),
        };
        if self.is_opaque(def) || !def.use_conv_opt() {
            return Ok(None);
        }
        let mut buffered = CollectingSink::default();
        if !self.is_def_eq_levels(t_head.get_const_levels(), s_head.get_const_levels(), &mut buffered)? {
            return Ok(None);
        }
        for (a, b) in t_args.iter().zip(s_args.iter()) {
            if !self.is_def_eq(a, b, ctx, &mut buffered)? {
                return Ok(None);
            }
        }
        for constraint in buffered.constraints {
            sink.add_constraint(constraint).map_err(|_| KernelErr::ConstraintRetracted)?;
        }
        Ok(Some(true))
    }

    fn is_def_eq_binding(&self, t: &Expr, s: &Expr, ctx: &mut dyn ExtensionContext, sink: &mut dyn ConstraintSink) -> KernelResult<bool> {
        let t_binder = t.get_binder();
        let s_binder = s.get_binder();
        if !self.is_def_eq(&t_binder.ty, &s_binder.ty, ctx, sink)? {
            return Ok(false);
        }
        let shared_local = crate::expr::mk_local(t_binder.pp_name.clone(), t_binder.ty.clone(), t_binder.style);
        let t_body = t.get_body().instantiate(&shared_local);
        let s_body = s.get_body().instantiate(&shared_local);
        self.is_def_eq(&t_body, &s_body, ctx, sink)
    }

    fn is_def_eq_app(&self, t: &Expr, s: &Expr, ctx: &mut dyn ExtensionContext, sink: &mut dyn ConstraintSink) -> KernelResult<bool> {
        let (t_head, t_args) = t.unfold_apps();
        let (s_head, s_args) = s.unfold_apps();
        if t_args.len() != s_args.len() {
            return Ok(false);
        }
        if !self.is_def_eq(&t_head, &s_head, ctx, sink)? {
            return Ok(false);
        }
        for (a, b) in t_args.iter().zip(s_args.iter()) {
            if !self.is_def_eq(a, b, ctx, sink)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Phase 6: two terms whose types are both definitionally `Prop`
    /// (`Sort 0`) are considered equal regardless of their own structure,
    /// since by proof irrelevance no observation inside this kernel can
    /// distinguish two proofs of the same proposition.
    fn try_proof_irrelevance(&self, t: &Expr, s: &Expr, ctx: &mut dyn ExtensionContext, sink: &mut dyn ConstraintSink) -> KernelResult<bool> {
        if !self.env.proof_irrel() {
            return Ok(false);
        }
        let t_ty = match ctx.infer_type(t) {
            Ok(ty) => ty,
            Err(_) => return Ok(false),
        };
        let s_ty = match ctx.infer_type(s) {
            Ok(ty) => ty,
            Err(_) => return Ok(false),
        };
        let t_ty_whnf = self.whnf(&t_ty, ctx)?;
        if !t_ty_whnf.is_sort() || !t_ty_whnf.get_sort_level().is_zero() {
            return Ok(false);
        }
        self.is_def_eq(&t_ty, &s_ty, ctx, sink)
    }

    /// The full definitional equality check: quick structural check, reduce
    /// to `whnf_core` and recheck, lazy-delta unfold the heavier head in a
    /// loop until either a decision falls out or neither side is
    /// delta-reducible any further, try registered normalizer extensions,
    /// applicative congruence, and finally proof irrelevance.
    pub fn is_def_eq(&self, t: &Expr, s: &Expr, ctx: &mut dyn ExtensionContext, sink: &mut dyn ConstraintSink) -> KernelResult<bool> {
        let _span = tracing::debug_span!("is_def_eq", lhs = t.get_digest(), rhs = s.get_digest()).entered();
        self.check_system()?;

        if self.quick_is_def_eq(t, s) {
            return Ok(true);
        }

        if let Some(result) = self.try_defer_to_metavariable(t, s, sink) {
            return result;
        }

        match (t.as_ref(), s.as_ref()) {
            (crate::expr::InnerExpr::Sort { level: l1, .. }, crate::expr::InnerExpr::Sort { level: l2, .. }) => {
                return self.is_def_eq_levels(std::slice::from_ref(l1), std::slice::from_ref(l2), sink);
            }
            (crate::expr::InnerExpr::Local { serial: a, .. }, crate::expr::InnerExpr::Local { serial: b, .. }) => {
                return Ok(a == b);
            }
            _ => (),
        }

        if let Some(decided) = self.try_args_equal_shortcut(t, s, ctx, sink)? {
            return Ok(decided);
        }

        let t_whnf = self.whnf_core(t, ctx)?;
        let s_whnf = self.whnf_core(s, ctx)?;
        if self.quick_is_def_eq(&t_whnf, &s_whnf) {
            return Ok(true);
        }

        let t_weight = self.weight_of_head(&t_whnf.unfold_apps().0);
        let s_weight = self.weight_of_head(&s_whnf.unfold_apps().0);
        if t_weight.is_some() || s_weight.is_some() {
            let floor = match (t_weight, s_weight) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => 0,
            };
            let t_delta = self.whnf_core_delta(&t_whnf, floor, ctx)?;
            let s_delta = self.whnf_core_delta(&s_whnf, floor, ctx)?;
            if !Expr::eq(&t_delta, &t_whnf) || !Expr::eq(&s_delta, &s_whnf) {
                return self.is_def_eq(&t_delta, &s_delta, ctx, sink);
            }
        }

        if let Some(t_ext) = self.env.norm_ext(&t_whnf, ctx) {
            return self.is_def_eq(&t_ext, &s_whnf, ctx, sink);
        }
        if let Some(s_ext) = self.env.norm_ext(&s_whnf, ctx) {
            return self.is_def_eq(&t_whnf, &s_ext, ctx, sink);
        }

        match (t_whnf.is_pi() && s_whnf.is_pi(), t_whnf.is_lambda() && s_whnf.is_lambda()) {
            (true, _) | (_, true) => {
                if self.is_def_eq_binding(&t_whnf, &s_whnf, ctx, sink)? {
                    return Ok(true);
                }
            }
            _ => {
                if t_whnf.is_app() && s_whnf.is_app() {
                    if self.is_def_eq_app(&t_whnf, &s_whnf, ctx, sink)? {
                        return Ok(true);
                    }
                }
            }
        }

        self.try_proof_irrelevance(&t_whnf, &s_whnf, ctx, sink)
    }
}

/// A `Converter` that never reduces or unfolds anything and always reports
/// equality; used by callers that only want the term-representation layer
/// (e.g. a pretty-printer) without paying for a real equality engine, and in
/// tests that want to isolate behavior from the converter entirely.
pub struct DummyConverter;

impl DummyConverter {
    pub fn whnf(&self, e: &Expr) -> Expr {
        e.clone()
    }

    pub fn is_def_eq(&self, _t: &Expr, _s: &Expr) -> bool {
        true
    }
}

#[cfg(test)]
mod converter_tests {
    use super::*;
    use crate::constraint::CollectingSink;
    use crate::env::InMemoryEnv;
    use crate::expr::{mk_app, mk_const, mk_lambda, mk_prop, mk_var, Binding, BinderStyle};
    use crate::macros::NoExtensions;

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
        fn add_constraint(&mut self, _c: Constraint) -> KernelResult<()> {
            Ok(())
        }
    }

    #[test]
    fn beta_reduces_under_whnf() {
        let env = InMemoryEnv::new(true, true);
        let conv = Converter::new(&env, ConverterConfig::default());
        let mut ctx = NullCtx { env: &env };
        let lam = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_var(0));
        let applied = mk_app(lam, mk_prop());
        let reduced = conv.whnf(&applied, &mut ctx).unwrap();
        assert_eq!(reduced, mk_prop());
    }

    #[test]
    fn eta_reduces_when_enabled() {
        let env = InMemoryEnv::new(true, true);
        let conv = Converter::new(&env, ConverterConfig::default());
        let f = mk_const("f", Arc::new(Vec::new()));
        let lam = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_app(f.clone(), mk_var(0)));
        assert_eq!(conv.try_eta(&lam), Some(f));
    }

    #[test]
    fn eta_disabled_does_nothing() {
        let env = InMemoryEnv::new(false, true);
        let conv = Converter::new(&env, ConverterConfig::default());
        let f = mk_const("f", Arc::new(Vec::new()));
        let lam = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_app(f, mk_var(0)));
        assert_eq!(conv.try_eta(&lam), None);
    }

    #[test]
    fn def_eq_quick_path() {
        let env = InMemoryEnv::new(true, true);
        let conv = Converter::new(&env, ConverterConfig::default());
        let mut ctx = NullCtx { env: &env };
        let mut sink = CollectingSink::default();
        let a = mk_prop();
        let b = mk_prop();
        assert!(conv.is_def_eq(&a, &b, &mut ctx, &mut sink).unwrap());
    }

    #[test]
    fn metavariable_emits_constraint() {
        let env = InMemoryEnv::new(true, true);
        let conv = Converter::new(&env, ConverterConfig::default());
        let mut ctx = NullCtx { env: &env };
        let mut sink = CollectingSink::default();
        let m = crate::expr::mk_meta("?m", mk_prop());
        let p = mk_prop();
        assert!(conv.is_def_eq(&m, &p, &mut ctx, &mut sink).unwrap());
        assert_eq!(sink.constraints.len(), 1);
    }

    #[test]
    fn theorems_stay_opaque_even_in_their_home_module() {
        let mut env = InMemoryEnv::new(true, true);
        let def = Definition::new_theorem(Name::from("foo"), Vec::new(), mk_prop(), 0, 7);
        env.insert(def);
        let conv_home = Converter::new(&env, ConverterConfig { home_module_idx: Some(7), extra_opaque: HashSet::new(), memoize: true });
        let found = env.find(&Name::from("foo")).unwrap();
        assert!(conv_home.is_opaque(found));
        let _ = NoExtensions;
    }

    #[test]
    fn opaque_definition_unlocks_in_its_home_module_but_not_elsewhere() {
        let mut env = InMemoryEnv::new(true, true);
        let def = Definition::new_opaque_definition(Name::from("foo"), Vec::new(), mk_prop(), 0, 7, true);
        env.insert(def);
        let found = env.find(&Name::from("foo")).unwrap();

        let conv_home = Converter::new(&env, ConverterConfig { home_module_idx: Some(7), extra_opaque: HashSet::new(), memoize: true });
        assert!(!conv_home.is_opaque(found));

        let conv_elsewhere = Converter::new(&env, ConverterConfig { home_module_idx: Some(9), extra_opaque: HashSet::new(), memoize: true });
        assert!(conv_elsewhere.is_opaque(found));
    }

    #[test]
    fn extra_opaque_overrides_home_module() {
        let mut env = InMemoryEnv::new(true, true);
        let def = Definition::new_opaque_definition(Name::from("foo"), Vec::new(), mk_prop(), 0, 7, true);
        env.insert(def);
        let found = env.find(&Name::from("foo")).unwrap();

        let mut extra_opaque = HashSet::new();
        extra_opaque.insert(Name::from("foo"));
        let conv = Converter::new(&env, ConverterConfig { home_module_idx: Some(7), extra_opaque, memoize: true });
        assert!(conv.is_opaque(found));
    }
}
