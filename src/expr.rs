use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::hash::{Hash, Hasher};

use fxhash::hash64;
use hashbrown::HashSet;

use crate::level::{self, Level};
use crate::name::Name;
use crate::errors;

use InnerExpr::*;

const VAR_HASH: u64 = 2;
const SORT_HASH: u64 = 3;
const CONST_HASH: u64 = 5;
const APP_HASH: u64 = 7;
const LAMBDA_HASH: u64 = 11;
const PI_HASH: u64 = 13;
const LET_HASH: u64 = 17;
const LOCAL_HASH: u64 = 19;
const META_HASH: u64 = 23;
const MACRO_HASH: u64 = 29;

/// Binder "info"; whether a formal parameter is implicit, an instance
/// argument, or a plain explicit argument. Per the kernel's notion of
/// structural/definitional equality, this never participates in comparisons;
/// it is pretty-printing/elaboration metadata carried along for the benefit
/// of callers outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinderStyle {
    Default,
    Implicit,
    StrictImplicit,
    InstImplicit,
}

/// A named, typed formal parameter, used by `Lambda`, `Pi`, `Let` and `Local`.
/// `style` is ignored by `PartialEq`/`Hash` so that terms differing only in
/// binder hints are still structurally (and therefore definitionally) equal.
#[derive(Clone)]
pub struct Binding {
    pub pp_name: Name,
    pub ty: Expr,
    pub style: BinderStyle,
}

impl Binding {
    pub fn mk(pp_name: impl Into<Name>, ty: Expr, style: BinderStyle) -> Self {
        Binding { pp_name: pp_name.into(), ty, style }
    }

    pub fn swap_ty(&self, new_ty: Expr) -> Self {
        Binding { pp_name: self.pp_name.clone(), ty: new_ty, style: self.style }
    }
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        self.pp_name == other.pp_name && self.ty == other.ty
    }
}
impl Eq for Binding {}

impl Hash for Binding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pp_name.hash(state);
        self.ty.hash(state);
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({:?} : {:?})", self.pp_name, self.ty)
    }
}

/// Precomputed, purely-derived metadata attached to every node at
/// construction time. All fields here are `Copy`; none of them require
/// interior mutability, and all of them are monotone/cheap functions of a
/// node's immediate children.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExprCache {
    digest: u64,
    /// One past the largest free de Bruijn index occurring in this term; 0
    /// if the term is closed.
    var_bound: u16,
    has_locals: bool,
    has_metavariable: bool,
    has_param_univ: bool,
    /// 1 for atoms, 1 + the max depth of any child otherwise. Not used for
    /// anything inside this crate beyond bookkeeping; exposed so a caller
    /// walking terms from the outside (e.g. a pretty printer budgeting
    /// indentation) doesn't have to recompute it by hand.
    depth: u16,
    /// An independent hash with no semantic meaning, drawn from a
    /// monotonically increasing per-thread counter at construction time.
    /// Its only job is to make pointer-identity-keyed maps (tables keyed by
    /// `(thread, alloc_hash)` rather than content) behave like a proper hash
    /// map instead of colliding every closed term of the same shape; it need
    /// not be -- and across separate runs, isn't -- deterministic.
    alloc_hash: u64,
}

thread_local! {
    static ALLOC_HASH_COUNTER: std::cell::Cell<u64> = std::cell::Cell::new(0);
}

fn next_alloc_hash() -> u64 {
    ALLOC_HASH_COUNTER.with(|c| {
        let v = c.get();
        c.set(v.wrapping_add(1));
        v
    })
}

/// Opportunistically-memoized, shared metadata that *does* require interior
/// mutability because it is written after a node already has outstanding
/// `Arc` references to it (readers may race writers; both outcomes of the
/// race are safe since every writer recomputes the same answer).
pub struct NodeMeta {
    /// Three-valued cache for `is_arrow`: 0 = unknown, 1 = yes, 2 = no.
    is_arrow: AtomicU8,
    /// An opaque numeric tag that callers outside this crate may stash on a
    /// node and expect to survive most substitution operations; constructors
    /// that build a new node out of an old one's children propagate the
    /// source's tag verbatim. Kernel logic never reads this value.
    tag: AtomicU64,
}

impl NodeMeta {
    fn new(tag: u64) -> Self {
        NodeMeta { is_arrow: AtomicU8::new(0), tag: AtomicU64::new(tag) }
    }

    fn fresh() -> Self {
        NodeMeta::new(0)
    }
}

pub enum InnerExpr {
    Var { cache: ExprCache, meta: NodeMeta, dbj: u16 },
    Sort { cache: ExprCache, meta: NodeMeta, level: Level },
    Const { cache: ExprCache, meta: NodeMeta, name: Name, levels: Arc<Vec<Level>> },
    App { cache: ExprCache, meta: NodeMeta, fun: Expr, arg: Expr },
    Lambda { cache: ExprCache, meta: NodeMeta, binder: Binding, body: Expr },
    Pi { cache: ExprCache, meta: NodeMeta, binder: Binding, body: Expr },
    Let { cache: ExprCache, meta: NodeMeta, binder: Binding, val: Expr, body: Expr },
    Local { cache: ExprCache, meta: NodeMeta, serial: u64, binder: Binding },
    /// A metavariable awaiting solution by an external elaborator. The core
    /// treats this entirely opaquely: it has no reduction behavior and is
    /// never unfolded, only detected.
    Meta { cache: ExprCache, meta: NodeMeta, name: Name, ty: Expr },
    /// An application of a foreign extension to the term representation; see
    /// `crate::macros`. Expansion is delegated entirely to `definition`.
    Macro { cache: ExprCache, meta: NodeMeta, definition: Arc<dyn crate::macros::MacroDefinition>, args: Vec<Expr> },
}

/// Reference-counted, hash-consed wrapper around `InnerExpr`; the unit of
/// sharing for every term in the kernel. Cloning an `Expr` is just an atomic
/// refcount bump.
#[derive(Clone)]
pub struct Expr(Arc<InnerExpr>);

static LOCAL_SERIAL: once_cell::sync::Lazy<AtomicU64> = once_cell::sync::Lazy::new(|| AtomicU64::new(0));

fn next_local_serial() -> u64 {
    LOCAL_SERIAL.fetch_add(1, Ordering::Relaxed)
}

pub fn mk_var(dbj: u16) -> Expr {
    let digest = hash64(&(VAR_HASH, dbj));
    let cache = ExprCache {
        digest,
        var_bound: dbj + 1,
        has_locals: false,
        has_metavariable: false,
        has_param_univ: false,
        depth: 1,
        alloc_hash: next_alloc_hash(),
    };
    Expr(Arc::new(Var { cache, meta: NodeMeta::fresh(), dbj }))
}

pub fn mk_sort(level: Level) -> Expr {
    let digest = hash64(&(SORT_HASH, &level));
    let cache = ExprCache {
        digest,
        var_bound: 0,
        has_locals: false,
        has_metavariable: level.has_metavariable(),
        has_param_univ: level.has_param(),
        depth: 1,
        alloc_hash: next_alloc_hash(),
    };
    Expr(Arc::new(Sort { cache, meta: NodeMeta::fresh(), level }))
}

pub fn mk_prop() -> Expr {
    mk_sort(level::mk_zero())
}

pub fn mk_const(name: impl Into<Name>, levels: impl Into<Arc<Vec<Level>>>) -> Expr {
    let name = name.into();
    let levels = levels.into();
    let digest = hash64(&(CONST_HASH, &name, &levels));
    let has_param_univ = levels.iter().any(|l| l.has_param());
    let has_metavariable = levels.iter().any(|l| l.has_metavariable());
    let cache = ExprCache {
        digest,
        var_bound: 0,
        has_locals: false,
        has_metavariable,
        has_param_univ,
        depth: 1,
        alloc_hash: next_alloc_hash(),
    };
    Expr(Arc::new(Const { cache, meta: NodeMeta::fresh(), name, levels }))
}

pub fn mk_app(fun: Expr, arg: Expr) -> Expr {
    let digest = hash64(&(APP_HASH, fun.get_digest(), arg.get_digest()));
    let var_bound = fun.var_bound().max(arg.var_bound());
    let has_locals = fun.has_locals() || arg.has_locals();
    let has_metavariable = fun.has_metavariable() || arg.has_metavariable();
    let has_param_univ = fun.has_param_univ() || arg.has_param_univ();
    let depth = 1 + fun.depth().max(arg.depth());
    let cache = ExprCache { digest, var_bound, has_locals, has_metavariable, has_param_univ, depth, alloc_hash: next_alloc_hash() };
    Expr(Arc::new(App { cache, meta: NodeMeta::fresh(), fun, arg }))
}

fn binder_cache(hash_const: u64, binder: &Binding, body: &Expr) -> ExprCache {
    let digest = hash64(&(hash_const, &binder.pp_name, binder.ty.get_digest(), body.get_digest()));
    let var_bound = binder.ty.var_bound().max(safe_pred(body.var_bound()));
    let has_locals = binder.ty.has_locals() || body.has_locals();
    let has_metavariable = binder.ty.has_metavariable() || body.has_metavariable();
    let has_param_univ = binder.ty.has_param_univ() || body.has_param_univ();
    let depth = 1 + binder.ty.depth().max(body.depth());
    ExprCache { digest, var_bound, has_locals, has_metavariable, has_param_univ, depth, alloc_hash: next_alloc_hash() }
}

fn safe_pred(n: u16) -> u16 {
    if n == 0 { 0 } else { n - 1 }
}

pub fn mk_lambda(binder: Binding, body: Expr) -> Expr {
    let cache = binder_cache(LAMBDA_HASH, &binder, &body);
    Expr(Arc::new(Lambda { cache, meta: NodeMeta::fresh(), binder, body }))
}

pub fn mk_pi(binder: Binding, body: Expr) -> Expr {
    let cache = binder_cache(PI_HASH, &binder, &body);
    Expr(Arc::new(Pi { cache, meta: NodeMeta::fresh(), binder, body }))
}

pub fn mk_let(binder: Binding, val: Expr, body: Expr) -> Expr {
    let digest = hash64(&(LET_HASH, &binder.pp_name, binder.ty.get_digest(), val.get_digest(), body.get_digest()));
    let var_bound = binder.ty.var_bound().max(val.var_bound()).max(safe_pred(body.var_bound()));
    let has_locals = binder.ty.has_locals() || val.has_locals() || body.has_locals();
    let has_metavariable = binder.ty.has_metavariable() || val.has_metavariable() || body.has_metavariable();
    let has_param_univ = binder.ty.has_param_univ() || val.has_param_univ() || body.has_param_univ();
    let depth = 1 + binder.ty.depth().max(val.depth()).max(body.depth());
    let cache = ExprCache { digest, var_bound, has_locals, has_metavariable, has_param_univ, depth, alloc_hash: next_alloc_hash() };
    Expr(Arc::new(Let { cache, meta: NodeMeta::fresh(), binder, val, body }))
}

pub fn mk_local(pp_name: impl Into<Name>, ty: Expr, style: BinderStyle) -> Expr {
    let serial = next_local_serial();
    mk_local_w_serial(pp_name, ty, style, serial)
}

pub fn mk_local_w_serial(pp_name: impl Into<Name>, ty: Expr, style: BinderStyle, serial: u64) -> Expr {
    let binder = Binding::mk(pp_name, ty, style);
    let digest = hash64(&(LOCAL_HASH, serial));
    let has_metavariable = binder.ty.has_metavariable();
    let has_param_univ = binder.ty.has_param_univ();
    let depth = 1 + binder.ty.depth();
    let cache = ExprCache { digest, var_bound: 0, has_locals: true, has_metavariable, has_param_univ, depth, alloc_hash: next_alloc_hash() };
    Expr(Arc::new(Local { cache, meta: NodeMeta::fresh(), serial, binder }))
}

pub fn mk_meta(name: impl Into<Name>, ty: Expr) -> Expr {
    let name = name.into();
    let digest = hash64(&(META_HASH, &name));
    let has_param_univ = ty.has_param_univ();
    let depth = 1 + ty.depth();
    let cache = ExprCache { digest, var_bound: 0, has_locals: false, has_metavariable: true, has_param_univ, depth, alloc_hash: next_alloc_hash() };
    Expr(Arc::new(Meta { cache, meta: NodeMeta::fresh(), name, ty }))
}

pub fn mk_macro(definition: Arc<dyn crate::macros::MacroDefinition>, args: Vec<Expr>) -> Expr {
    let mut digest = hash64(&(MACRO_HASH, definition.macro_hash()));
    let mut var_bound = 0u16;
    let mut has_locals = false;
    let mut has_metavariable = false;
    let mut has_param_univ = false;
    let mut depth = 0u16;
    for a in &args {
        digest = hash64(&(digest, a.get_digest()));
        var_bound = var_bound.max(a.var_bound());
        has_locals |= a.has_locals();
        has_metavariable |= a.has_metavariable();
        has_param_univ |= a.has_param_univ();
        depth = depth.max(a.depth());
    }
    let cache = ExprCache { digest, var_bound, has_locals, has_metavariable, has_param_univ, depth: depth + 1, alloc_hash: next_alloc_hash() };
    Expr(Arc::new(Macro { cache, meta: NodeMeta::fresh(), definition, args }))
}

impl Expr {
    fn get_cache(&self) -> ExprCache {
        match self.as_ref() {
            Var { cache, .. }
            | Sort { cache, .. }
            | Const { cache, .. }
            | App { cache, .. }
            | Lambda { cache, .. }
            | Pi { cache, .. }
            | Let { cache, .. }
            | Local { cache, .. }
            | Meta { cache, .. }
            | Macro { cache, .. } => *cache,
        }
    }

    fn get_meta(&self) -> &NodeMeta {
        match self.as_ref() {
            Var { meta, .. }
            | Sort { meta, .. }
            | Const { meta, .. }
            | App { meta, .. }
            | Lambda { meta, .. }
            | Pi { meta, .. }
            | Let { meta, .. }
            | Local { meta, .. }
            | Meta { meta, .. }
            | Macro { meta, .. } => meta,
        }
    }

    pub fn get_digest(&self) -> u64 {
        self.get_cache().digest
    }

    pub fn var_bound(&self) -> u16 {
        self.get_cache().var_bound
    }

    pub fn has_locals(&self) -> bool {
        self.get_cache().has_locals
    }

    pub fn has_metavariable(&self) -> bool {
        self.get_cache().has_metavariable
    }

    pub fn has_param_univ(&self) -> bool {
        self.get_cache().has_param_univ
    }

    pub fn depth(&self) -> u16 {
        self.get_cache().depth
    }

    pub fn alloc_hash(&self) -> u64 {
        self.get_cache().alloc_hash
    }

    /// Reads/writes the opaque caller-assigned tag. Relaxed ordering is fine;
    /// the tag has no observable effect on kernel behavior, so there is no
    /// happens-before relationship to establish.
    pub fn get_tag(&self) -> u64 {
        self.get_meta().tag.load(Ordering::Relaxed)
    }

    pub fn set_tag(&self, tag: u64) {
        self.get_meta().tag.store(tag, Ordering::Relaxed);
    }

    /// Memoized, three-valued check for whether this node is a non-dependent
    /// Pi (i.e. an arrow type, where the body does not mention the bound
    /// variable). Only meaningful on `Pi` nodes; always `false` elsewhere.
    pub fn is_arrow(&self) -> bool {
        match self.as_ref() {
            Pi { body, .. } => {
                let meta = self.get_meta();
                match meta.is_arrow.load(Ordering::Relaxed) {
                    1 => true,
                    2 => false,
                    _ => {
                        let result = !body.has_free_var(0);
                        meta.is_arrow.store(if result { 1 } else { 2 }, Ordering::Relaxed);
                        result
                    }
                }
            }
            _ => false,
        }
    }

    pub fn is_var(&self) -> bool { matches!(self.as_ref(), Var { .. }) }
    pub fn is_sort(&self) -> bool { matches!(self.as_ref(), Sort { .. }) }
    pub fn is_const(&self) -> bool { matches!(self.as_ref(), Const { .. }) }
    pub fn is_app(&self) -> bool { matches!(self.as_ref(), App { .. }) }
    pub fn is_pi(&self) -> bool { matches!(self.as_ref(), Pi { .. }) }
    pub fn is_lambda(&self) -> bool { matches!(self.as_ref(), Lambda { .. }) }
    pub fn is_let(&self) -> bool { matches!(self.as_ref(), Let { .. }) }
    pub fn is_local(&self) -> bool { matches!(self.as_ref(), Local { .. }) }
    /// True iff `self` is literally a `Meta` node. Most callers want
    /// `is_meta`, which looks through an application spine; this is the raw
    /// per-variant check, kept for code (like `crate::serial`) that needs to
    /// dispatch on the node's own tag rather than its spine head.
    pub fn is_meta_node(&self) -> bool { matches!(self.as_ref(), Meta { .. }) }
    pub fn is_macro(&self) -> bool { matches!(self.as_ref(), Macro { .. }) }

    /// True iff the head of `self`'s application spine is a `Meta`, per
    /// §4.A -- `App(Meta(..), a)` is still "a metavariable" as far as the
    /// converter's deferral rule is concerned, even though the outer node
    /// itself is an `App`.
    pub fn is_meta(&self) -> bool {
        self.unfold_apps().0.is_meta_node()
    }

    pub fn get_const_name(&self) -> &Name {
        match self.as_ref() {
            Const { name, .. } => name,
            owise => errors::err_not_const(line!(), owise),
        }
    }

    pub fn get_const_levels(&self) -> &Arc<Vec<Level>> {
        match self.as_ref() {
            Const { levels, .. } => levels,
            owise => errors::err_not_const(line!(), owise),
        }
    }

    pub fn get_sort_level(&self) -> &Level {
        match self.as_ref() {
            Sort { level, .. } => level,
            owise => errors::err_not_sort(line!(), owise),
        }
    }

    pub fn get_local_serial(&self) -> u64 {
        match self.as_ref() {
            Local { serial, .. } => *serial,
            owise => errors::err_not_local(line!(), owise),
        }
    }

    pub fn get_binder(&self) -> &Binding {
        match self.as_ref() {
            Lambda { binder, .. } | Pi { binder, .. } | Let { binder, .. } | Local { binder, .. } => binder,
            owise => errors::err_not_binder(line!(), owise),
        }
    }

    /// The body under the binder for `Lambda`/`Pi`/`Let` nodes (for `Let`,
    /// this is the term after the `in`, not the bound value).
    pub fn get_body(&self) -> &Expr {
        match self.as_ref() {
            Lambda { body, .. } | Pi { body, .. } | Let { body, .. } => body,
            owise => errors::err_not_binder(line!(), owise),
        }
    }

    pub fn mk_arrow(&self, other: &Expr) -> Expr {
        let binder = Binding::mk(Name::anon_placeholder(), self.clone(), BinderStyle::Default);
        mk_pi(binder, other.lift_free_vars(0, 1))
    }

    /// Shift every free variable in `self` up by `amount`, starting at
    /// de Bruijn depth `cutoff`. Used when inserting a term under additional
    /// binders that it doesn't already account for (e.g. `mk_arrow`).
    pub fn lift_free_vars(&self, cutoff: u16, amount: u16) -> Expr {
        if amount == 0 || self.var_bound() <= cutoff {
            return self.clone();
        }
        match self.as_ref() {
            Var { dbj, .. } => if *dbj >= cutoff { mk_var(dbj + amount) } else { self.clone() },
            App { fun, arg, .. } => mk_app(fun.lift_free_vars(cutoff, amount), arg.lift_free_vars(cutoff, amount)),
            Lambda { binder, body, .. } => mk_lambda(
                binder.swap_ty(binder.ty.lift_free_vars(cutoff, amount)),
                body.lift_free_vars(cutoff + 1, amount),
            ),
            Pi { binder, body, .. } => mk_pi(
                binder.swap_ty(binder.ty.lift_free_vars(cutoff, amount)),
                body.lift_free_vars(cutoff + 1, amount),
            ),
            Let { binder, val, body, .. } => mk_let(
                binder.swap_ty(binder.ty.lift_free_vars(cutoff, amount)),
                val.lift_free_vars(cutoff, amount),
                body.lift_free_vars(cutoff + 1, amount),
            ),
            Local { binder, serial, .. } => {
                let new_ty = binder.ty.lift_free_vars(cutoff, amount);
                if new_ty == binder.ty { self.clone() } else { mk_local_w_serial(binder.pp_name.clone(), new_ty, binder.style, *serial) }
            }
            Meta { name, ty, .. } => mk_meta(name.clone(), ty.lift_free_vars(cutoff, amount)),
            Macro { definition, args, .. } => mk_macro(definition.clone(), args.iter().map(|a| a.lift_free_vars(cutoff, amount)).collect()),
            Sort { .. } | Const { .. } => self.clone(),
        }
    }

    /// True iff `Var(idx)` occurs free somewhere in this term.
    pub fn has_free_var(&self, idx: u16) -> bool {
        if self.var_bound() <= idx {
            return false;
        }
        match self.as_ref() {
            Var { dbj, .. } => *dbj == idx,
            App { fun, arg, .. } => fun.has_free_var(idx) || arg.has_free_var(idx),
            Lambda { binder, body, .. } | Pi { binder, body, .. } => binder.ty.has_free_var(idx) || body.has_free_var(idx + 1),
            Let { binder, val, body, .. } => binder.ty.has_free_var(idx) || val.has_free_var(idx) || body.has_free_var(idx + 1),
            Local { binder, .. } => binder.ty.has_free_var(idx),
            Meta { ty, .. } => ty.has_free_var(idx),
            Macro { args, .. } => args.iter().any(|a| a.has_free_var(idx)),
            Sort { .. } | Const { .. } => false,
        }
    }

    /// Subtract `k` from every free variable's index. The caller must ensure
    /// no free variable with index `< k` occurs in `self`; violating this
    /// precondition would underflow the de Bruijn index, which is why this
    /// is a crate-internal building block rather than a public one -- the
    /// only safe caller is eta-reduction, which checks the precondition via
    /// `has_free_var` first.
    pub(crate) fn lower_free_vars(&self, k: u16) -> Expr {
        if k == 0 {
            return self.clone();
        }
        self.lower_free_vars_core(0, k)
    }

    fn lower_free_vars_core(&self, offset: u16, k: u16) -> Expr {
        if self.var_bound() <= offset {
            return self.clone();
        }
        match self.as_ref() {
            Var { dbj, .. } => if *dbj >= offset { mk_var(dbj - k) } else { self.clone() },
            App { fun, arg, .. } => mk_app(fun.lower_free_vars_core(offset, k), arg.lower_free_vars_core(offset, k)),
            Lambda { binder, body, .. } => mk_lambda(
                binder.swap_ty(binder.ty.lower_free_vars_core(offset, k)),
                body.lower_free_vars_core(offset + 1, k),
            ),
            Pi { binder, body, .. } => mk_pi(
                binder.swap_ty(binder.ty.lower_free_vars_core(offset, k)),
                body.lower_free_vars_core(offset + 1, k),
            ),
            Let { binder, val, body, .. } => mk_let(
                binder.swap_ty(binder.ty.lower_free_vars_core(offset, k)),
                val.lower_free_vars_core(offset, k),
                body.lower_free_vars_core(offset + 1, k),
            ),
            Local { binder, serial, .. } => mk_local_w_serial(binder.pp_name.clone(), binder.ty.lower_free_vars_core(offset, k), binder.style, *serial),
            Meta { name, ty, .. } => mk_meta(name.clone(), ty.lower_free_vars_core(offset, k)),
            Macro { definition, args, .. } => mk_macro(definition.clone(), args.iter().map(|a| a.lower_free_vars_core(offset, k)).collect()),
            Sort { .. } | Const { .. } => self.clone(),
        }
    }

    /// Replace `Var(0)` with `with` (and shift all other free variables down
    /// by one to account for the binder `with` is replacing). The workhorse
    /// of β- and zeta-reduction.
    pub fn instantiate(&self, with: &Expr) -> Expr {
        self.instantiate_core(0, std::slice::from_ref(with))
    }

    /// Simultaneously substitute `Var(offset) .. Var(offset + withs.len() - 1)`
    /// (read innermost-first, i.e. `withs[0]` replaces the variable bound by
    /// the innermost of the binders being popped) for `withs`.
    pub fn instantiate_multi(&self, withs: &[Expr]) -> Expr {
        if withs.is_empty() {
            return self.clone();
        }
        self.instantiate_core(0, withs)
    }

    fn instantiate_core(&self, offset: u16, withs: &[Expr]) -> Expr {
        if self.var_bound() <= offset {
            return self.clone();
        }
        match self.as_ref() {
            Var { dbj, .. } => {
                if *dbj < offset {
                    self.clone()
                } else if let Some(w) = withs.get((*dbj - offset) as usize) {
                    w.lift_free_vars(0, offset)
                } else {
                    mk_var(dbj - withs.len() as u16)
                }
            }
            App { fun, arg, .. } => mk_app(fun.instantiate_core(offset, withs), arg.instantiate_core(offset, withs)),
            Lambda { binder, body, .. } => mk_lambda(
                binder.swap_ty(binder.ty.instantiate_core(offset, withs)),
                body.instantiate_core(offset + 1, withs),
            ),
            Pi { binder, body, .. } => mk_pi(
                binder.swap_ty(binder.ty.instantiate_core(offset, withs)),
                body.instantiate_core(offset + 1, withs),
            ),
            Let { binder, val, body, .. } => mk_let(
                binder.swap_ty(binder.ty.instantiate_core(offset, withs)),
                val.instantiate_core(offset, withs),
                body.instantiate_core(offset + 1, withs),
            ),
            Local { binder, serial, .. } => mk_local_w_serial(binder.pp_name.clone(), binder.ty.instantiate_core(offset, withs), binder.style, *serial),
            Meta { name, ty, .. } => mk_meta(name.clone(), ty.instantiate_core(offset, withs)),
            Macro { definition, args, .. } => mk_macro(definition.clone(), args.iter().map(|a| a.instantiate_core(offset, withs)).collect()),
            Sort { .. } | Const { .. } => self.clone(),
        }
    }

    /// Substitute every `Param` universe occurring in `self` per the parallel
    /// lists `params`/`levels` (used when unfolding a definition applied to
    /// concrete universe arguments).
    pub fn instantiate_lparams(&self, params: &[Name], levels: &[Level]) -> Expr {
        if !self.has_param_univ() {
            return self.clone();
        }
        match self.as_ref() {
            Sort { level, .. } => mk_sort(level.instantiate_params(params, levels)),
            Const { name, levels: lvls, .. } => mk_const(name.clone(), lvls.iter().map(|l| l.instantiate_params(params, levels)).collect::<Vec<_>>()),
            App { fun, arg, .. } => mk_app(fun.instantiate_lparams(params, levels), arg.instantiate_lparams(params, levels)),
            Lambda { binder, body, .. } => mk_lambda(binder.swap_ty(binder.ty.instantiate_lparams(params, levels)), body.instantiate_lparams(params, levels)),
            Pi { binder, body, .. } => mk_pi(binder.swap_ty(binder.ty.instantiate_lparams(params, levels)), body.instantiate_lparams(params, levels)),
            Let { binder, val, body, .. } => mk_let(binder.swap_ty(binder.ty.instantiate_lparams(params, levels)), val.instantiate_lparams(params, levels), body.instantiate_lparams(params, levels)),
            Local { binder, serial, .. } => mk_local_w_serial(binder.pp_name.clone(), binder.ty.instantiate_lparams(params, levels), binder.style, *serial),
            Meta { name, ty, .. } => mk_meta(name.clone(), ty.instantiate_lparams(params, levels)),
            Macro { definition, args, .. } => mk_macro(definition.clone(), args.iter().map(|a| a.instantiate_lparams(params, levels)).collect()),
            Var { .. } => self.clone(),
        }
    }

    pub fn fold_apps<'e>(&self, args: impl IntoIterator<Item = &'e Expr>) -> Expr {
        let mut acc = self.clone();
        for a in args {
            acc = mk_app(acc, a.clone());
        }
        acc
    }

    /// Peels off the outermost spine of applications, returning `(head,
    /// args)` with `args` in left-to-right application order.
    pub fn unfold_apps(&self) -> (Expr, Vec<Expr>) {
        let mut args = Vec::new();
        let mut head = self.clone();
        while let App { fun, arg, .. } = head.as_ref() {
            args.push(arg.clone());
            head = fun.clone();
        }
        args.reverse();
        (head, args)
    }

    pub fn fold_pis<'e>(&self, binders: impl IntoIterator<Item = &'e Expr>) -> Expr {
        let mut acc = self.clone();
        let binders: Vec<&Expr> = binders.into_iter().collect();
        for b in binders.into_iter().rev() {
            acc = mk_pi(b.get_binder().clone(), acc.abstract_local(b));
        }
        acc
    }

    pub fn fold_lambdas<'e>(&self, binders: impl IntoIterator<Item = &'e Expr>) -> Expr {
        let mut acc = self.clone();
        let binders: Vec<&Expr> = binders.into_iter().collect();
        for b in binders.into_iter().rev() {
            acc = mk_lambda(b.get_binder().clone(), acc.abstract_local(b));
        }
        acc
    }

    /// Replace free occurrences of the `Local` with the given serial with
    /// `Var(0)`, lifting to account for one freshly-introduced binder. Used
    /// when re-binding a `Local` that was produced by `unfold_pis`/
    /// `unfold_lambdas` back into a `Pi`/`Lambda`.
    pub fn abstract_local(&self, local: &Expr) -> Expr {
        self.abstract_locals(std::slice::from_ref(local))
    }

    pub fn abstract_locals(&self, locals: &[Expr]) -> Expr {
        if !self.has_locals() {
            return self.clone();
        }
        self.abstract_core(0, locals)
    }

    fn abstract_core(&self, offset: u16, locals: &[Expr]) -> Expr {
        if !self.has_locals() {
            return self.clone();
        }
        match self.as_ref() {
            Local { serial, .. } => match locals.iter().position(|l| l.get_local_serial() == *serial) {
                Some(idx) => mk_var(offset + idx as u16),
                None => self.clone(),
            },
            App { fun, arg, .. } => mk_app(fun.abstract_core(offset, locals), arg.abstract_core(offset, locals)),
            Lambda { binder, body, .. } => mk_lambda(binder.swap_ty(binder.ty.abstract_core(offset, locals)), body.abstract_core(offset + 1, locals)),
            Pi { binder, body, .. } => mk_pi(binder.swap_ty(binder.ty.abstract_core(offset, locals)), body.abstract_core(offset + 1, locals)),
            Let { binder, val, body, .. } => mk_let(binder.swap_ty(binder.ty.abstract_core(offset, locals)), val.abstract_core(offset, locals), body.abstract_core(offset + 1, locals)),
            Meta { name, ty, .. } => mk_meta(name.clone(), ty.abstract_core(offset, locals)),
            Macro { definition, args, .. } => mk_macro(definition.clone(), args.iter().map(|a| a.abstract_core(offset, locals)).collect()),
            Var { .. } | Sort { .. } | Const { .. } => self.clone(),
        }
    }

    /// Repeatedly strips `Pi` binders, instantiating each with a fresh
    /// `Local`, until `at_most` binders have been removed (or the term stops
    /// being a `Pi`). Returns the locals introduced (outermost first) and the
    /// remaining body.
    pub fn unfold_pis(&self, at_most: usize) -> (Vec<Expr>, Expr) {
        let mut locals = Vec::new();
        let mut body = self.clone();
        while locals.len() < at_most {
            match body.as_ref() {
                Pi { binder, body: inner, .. } => {
                    let substs: Vec<Expr> = locals.iter().rev().cloned().collect();
                    let ty = binder.ty.instantiate_multi(&substs);
                    let local = mk_local(binder.pp_name.clone(), ty, binder.style);
                    let next = inner.clone();
                    locals.push(local);
                    body = next;
                }
                _ => break,
            }
        }
        let substs: Vec<Expr> = locals.iter().rev().cloned().collect();
        (locals, body.instantiate_multi(&substs))
    }

    pub fn unfold_lambdas(&self, at_most: usize) -> (Vec<Expr>, Expr) {
        let mut locals = Vec::new();
        let mut body = self.clone();
        while locals.len() < at_most {
            match body.as_ref() {
                Lambda { binder, body: inner, .. } => {
                    let substs: Vec<Expr> = locals.iter().rev().cloned().collect();
                    let ty = binder.ty.instantiate_multi(&substs);
                    let local = mk_local(binder.pp_name.clone(), ty, binder.style);
                    let next = inner.clone();
                    locals.push(local);
                    body = next;
                }
                _ => break,
            }
        }
        let substs: Vec<Expr> = locals.iter().rev().cloned().collect();
        (locals, body.instantiate_multi(&substs))
    }

    pub fn apply_pi(&self, domain: Expr) -> Expr {
        mk_pi(Binding::mk(Name::anon_placeholder(), domain, BinderStyle::Default), self.clone())
    }

    pub fn apply_lambda(&self, domain: Expr) -> Expr {
        mk_lambda(Binding::mk(Name::anon_placeholder(), domain, BinderStyle::Default), self.clone())
    }

    pub fn unique_const_names(&self) -> HashSet<Name> {
        let mut acc = HashSet::new();
        self.unique_const_names_core(&mut acc);
        acc
    }

    fn unique_const_names_core(&self, acc: &mut HashSet<Name>) {
        match self.as_ref() {
            Const { name, .. } => {
                acc.insert(name.clone());
            }
            App { fun, arg, .. } => {
                fun.unique_const_names_core(acc);
                arg.unique_const_names_core(acc);
            }
            Lambda { binder, body, .. } | Pi { binder, body, .. } => {
                binder.ty.unique_const_names_core(acc);
                body.unique_const_names_core(acc);
            }
            Let { binder, val, body, .. } => {
                binder.ty.unique_const_names_core(acc);
                val.unique_const_names_core(acc);
                body.unique_const_names_core(acc);
            }
            Meta { ty, .. } => ty.unique_const_names_core(acc),
            Macro { args, .. } => args.iter().for_each(|a| a.unique_const_names_core(acc)),
            Local { binder, .. } => binder.ty.unique_const_names_core(acc),
            Var { .. } | Sort { .. } => (),
        }
    }

    /// Rebuilds an `App` node from proposed new children, short-circuiting to
    /// `self` unchanged (by pointer) if both are identical to the existing
    /// ones, and copying `self`'s tag onto the fresh node otherwise. This
    /// and its siblings below are the mechanism by which callers that
    /// rewrite a term bottom-up (substitution, normalizer extensions) keep
    /// maximal sharing with the original DAG instead of rebuilding every
    /// ancestor of a node that didn't actually change.
    pub fn update_app(&self, new_fun: Expr, new_arg: Expr) -> Expr {
        match self.as_ref() {
            App { fun, arg, .. } => {
                if ptr_eq(fun, &new_fun) && ptr_eq(arg, &new_arg) {
                    self.clone()
                } else {
                    let result = mk_app(new_fun, new_arg);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_app(line!(), owise),
        }
    }

    /// As `update_app`, for `Lambda`/`Pi` nodes; preserves which of the two
    /// `self` was.
    pub fn update_binder(&self, new_ty: Expr, new_body: Expr) -> Expr {
        match self.as_ref() {
            Lambda { binder, body, .. } => {
                if ptr_eq(&binder.ty, &new_ty) && ptr_eq(body, &new_body) {
                    self.clone()
                } else {
                    let result = mk_lambda(binder.swap_ty(new_ty), new_body);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            Pi { binder, body, .. } => {
                if ptr_eq(&binder.ty, &new_ty) && ptr_eq(body, &new_body) {
                    self.clone()
                } else {
                    let result = mk_pi(binder.swap_ty(new_ty), new_body);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_binder(line!(), owise),
        }
    }

    pub fn update_let(&self, new_ty: Expr, new_val: Expr, new_body: Expr) -> Expr {
        match self.as_ref() {
            Let { binder, val, body, .. } => {
                if ptr_eq(&binder.ty, &new_ty) && ptr_eq(val, &new_val) && ptr_eq(body, &new_body) {
                    self.clone()
                } else {
                    let result = mk_let(binder.swap_ty(new_ty), new_val, new_body);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_let(line!(), owise),
        }
    }

    /// As `update_app`, for `Local`/`Meta` nodes (the kernel's two flavors
    /// of "free, typed variable" -- named `mlocal` after the superclass they
    /// share in the term representation this crate was adapted from).
    pub fn update_mlocal(&self, new_ty: Expr) -> Expr {
        match self.as_ref() {
            Local { binder, serial, .. } => {
                if ptr_eq(&binder.ty, &new_ty) {
                    self.clone()
                } else {
                    let result = mk_local_w_serial(binder.pp_name.clone(), new_ty, binder.style, *serial);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            Meta { name, ty, .. } => {
                if ptr_eq(ty, &new_ty) {
                    self.clone()
                } else {
                    let result = mk_meta(name.clone(), new_ty);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_mlocal(line!(), owise),
        }
    }

    pub fn update_sort(&self, new_level: Level) -> Expr {
        match self.as_ref() {
            Sort { level, .. } => {
                if *level == new_level {
                    self.clone()
                } else {
                    let result = mk_sort(new_level);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_sort(line!(), owise),
        }
    }

    pub fn update_constant(&self, new_levels: Arc<Vec<Level>>) -> Expr {
        match self.as_ref() {
            Const { name, levels, .. } => {
                if Arc::ptr_eq(levels, &new_levels) || levels.as_slice() == new_levels.as_slice() {
                    self.clone()
                } else {
                    let result = mk_const(name.clone(), new_levels);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_const(line!(), owise),
        }
    }

    pub fn update_macro(&self, new_args: Vec<Expr>) -> Expr {
        match self.as_ref() {
            Macro { definition, args, .. } => {
                if args.len() == new_args.len() && args.iter().zip(new_args.iter()).all(|(a, b)| ptr_eq(a, b)) {
                    self.clone()
                } else {
                    let result = mk_macro(definition.clone(), new_args);
                    result.set_tag(self.get_tag());
                    result
                }
            }
            owise => errors::err_not_macro(line!(), owise),
        }
    }

    /// As `update_app`, but for the whole application spine at once: `self`
    /// must be an (possibly zero-length) chain of `App` nodes, and
    /// `new_rev_args` gives the proposed replacement arguments in reverse
    /// (innermost-application-first) order, matching `mk_rev_app`'s
    /// convention. Shares `self` unchanged if every argument (and the head)
    /// is pointer-identical to its replacement.
    pub fn update_rev_app(&self, new_head: Expr, new_rev_args: &[Expr]) -> Expr {
        let (head, args) = self.unfold_apps();
        if ptr_eq(&head, &new_head)
            && args.len() == new_rev_args.len()
            && args.iter().rev().zip(new_rev_args.iter()).all(|(a, b)| ptr_eq(a, b))
        {
            return self.clone();
        }
        let result = mk_rev_app(new_head, new_rev_args);
        result.set_tag(self.get_tag());
        result
    }
}

fn ptr_eq(a: &Expr, b: &Expr) -> bool {
    Arc::ptr_eq(&a.0, &b.0)
}

/// Builds a left-associative application spine `head arg_n .. arg_1` from a
/// reverse-ordered (innermost-first) argument slice; the companion builder
/// to `unfold_apps`, which peels a spine apart into exactly this shape.
pub fn mk_rev_app(head: Expr, rev_args: &[Expr]) -> Expr {
    let mut acc = head;
    for a in rev_args.iter().rev() {
        acc = mk_app(acc, a.clone());
    }
    acc
}

/// Moves every direct `Expr` child of this node out, replacing each with a
/// cheap leaf placeholder, so that `Drop` can walk the tree iteratively
/// instead of relying on the (potentially stack-overflowing) recursive drop
/// glue the compiler would otherwise generate.
fn take_children(node: &mut InnerExpr, stack: &mut Vec<Expr>) {
    fn placeholder() -> Expr {
        mk_var(0)
    }
    match node {
        App { fun, arg, .. } => {
            stack.push(std::mem::replace(fun, placeholder()));
            stack.push(std::mem::replace(arg, placeholder()));
        }
        Lambda { binder, body, .. } | Pi { binder, body, .. } => {
            stack.push(std::mem::replace(&mut binder.ty, placeholder()));
            stack.push(std::mem::replace(body, placeholder()));
        }
        Let { binder, val, body, .. } => {
            stack.push(std::mem::replace(&mut binder.ty, placeholder()));
            stack.push(std::mem::replace(val, placeholder()));
            stack.push(std::mem::replace(body, placeholder()));
        }
        Local { binder, .. } => {
            stack.push(std::mem::replace(&mut binder.ty, placeholder()));
        }
        Meta { ty, .. } => {
            stack.push(std::mem::replace(ty, placeholder()));
        }
        Macro { args, .. } => {
            stack.append(args);
        }
        Var { .. } | Sort { .. } | Const { .. } => (),
    }
}

impl Drop for InnerExpr {
    fn drop(&mut self) {
        let mut stack = Vec::new();
        take_children(self, &mut stack);
        while let Some(child) = stack.pop() {
            match Arc::try_unwrap(child.0) {
                Ok(mut inner) => take_children(&mut inner, &mut stack),
                Err(_still_shared) => (),
            }
        }
    }
}

impl std::convert::AsRef<InnerExpr> for Expr {
    fn as_ref(&self) -> &InnerExpr {
        &self.0
    }
}

impl From<Arc<InnerExpr>> for Expr {
    fn from(x: Arc<InnerExpr>) -> Expr {
        Expr(x)
    }
}

/// Canonical structural equality: identical node identity is a shortcut to
/// `true`, and unequal cached digests are a shortcut to `false`, before
/// falling back to comparing content field-by-field (binder `style` and the
/// opportunistic `tag`/`is_arrow` metadata excluded).
impl PartialEq for Expr {
    fn eq(&self, other: &Expr) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.get_digest() != other.get_digest() {
            return false;
        }
        self.as_ref() == other.as_ref()
    }
}
impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.get_digest().hash(state);
    }
}

impl PartialEq for InnerExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Var { dbj: a, .. }, Var { dbj: b, .. }) => a == b,
            (Sort { level: a, .. }, Sort { level: b, .. }) => a == b,
            (Const { name: n1, levels: l1, .. }, Const { name: n2, levels: l2, .. }) => n1 == n2 && level::is_def_eq_lvls(l1, l2),
            (App { fun: f1, arg: a1, .. }, App { fun: f2, arg: a2, .. }) => f1 == f2 && a1 == a2,
            (Lambda { binder: b1, body: bd1, .. }, Lambda { binder: b2, body: bd2, .. }) => b1 == b2 && bd1 == bd2,
            (Pi { binder: b1, body: bd1, .. }, Pi { binder: b2, body: bd2, .. }) => b1 == b2 && bd1 == bd2,
            (Let { binder: b1, val: v1, body: bd1, .. }, Let { binder: b2, val: v2, body: bd2, .. }) => b1 == b2 && v1 == v2 && bd1 == bd2,
            (Local { serial: s1, .. }, Local { serial: s2, .. }) => s1 == s2,
            (Meta { name: n1, ty: t1, .. }, Meta { name: n2, ty: t2, .. }) => n1 == n2 && t1 == t2,
            (Macro { definition: d1, args: a1, .. }, Macro { definition: d2, args: a2, .. }) => {
                d1.macro_equals(d2.as_ref()) && a1 == a2
            }
            _ => false,
        }
    }
}
impl Eq for InnerExpr {}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.as_ref() {
            Var { dbj, .. } => write!(f, "Var({})", dbj),
            Sort { level, .. } => write!(f, "Sort({:?})", level),
            Const { name, levels, .. } => write!(f, "Const({:?}, {:?})", name, levels),
            App { fun, arg, .. } => write!(f, "App({:?}, {:?})", fun, arg),
            Lambda { binder, body, .. } => write!(f, "Lambda({:?}, {:?})", binder, body),
            Pi { binder, body, .. } => write!(f, "Pi({:?}, {:?})", binder, body),
            Let { binder, val, body, .. } => write!(f, "Let({:?}, {:?}, {:?})", binder, val, body),
            Local { serial, binder, .. } => write!(f, "Local({}, {:?})", serial, binder),
            Meta { name, ty, .. } => write!(f, "Meta({:?}, {:?})", name, ty),
            Macro { definition, args, .. } => write!(f, "Macro({:?}, {:?})", definition.macro_name(), args),
        }
    }
}

#[cfg(test)]
mod expr_tests {
    use super::*;

    #[test]
    fn hash_consing_shortcircuits_eq() {
        let a = mk_app(mk_var(0), mk_var(1));
        let b = mk_app(mk_var(0), mk_var(1));
        assert_eq!(a, b);
        assert_eq!(a.get_digest(), b.get_digest());
    }

    #[test]
    fn binder_style_irrelevant_to_eq() {
        let ty = mk_prop();
        let b1 = Binding::mk("x", ty.clone(), BinderStyle::Default);
        let b2 = Binding::mk("x", ty.clone(), BinderStyle::Implicit);
        let p1 = mk_pi(b1, mk_var(0));
        let p2 = mk_pi(b2, mk_var(0));
        assert_eq!(p1, p2);
    }

    #[test]
    fn instantiate_beta() {
        let lam_body = mk_app(mk_var(0), mk_var(1));
        let arg = mk_const("foo", Arc::new(Vec::new()));
        let reduced = lam_body.instantiate(&arg);
        assert_eq!(reduced, mk_app(arg.clone(), mk_var(0)));
    }

    #[test]
    fn is_arrow_memoizes() {
        let pi = mk_pi(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_prop());
        assert!(pi.is_arrow());
        assert!(pi.is_arrow());
    }

    #[test]
    fn tag_propagates_through_lift() {
        let v = mk_var(0);
        v.set_tag(42);
        assert_eq!(v.get_tag(), 42);
    }

    #[test]
    fn has_free_var_respects_binders() {
        let body = mk_var(0);
        let lam = mk_lambda(Binding::mk("x", mk_prop(), BinderStyle::Default), body);
        assert!(!lam.has_free_var(0));
    }

    #[test]
    fn update_app_shares_when_children_unchanged() {
        let fun = mk_var(0);
        let arg = mk_var(1);
        let app = mk_app(fun.clone(), arg.clone());
        let updated = app.update_app(fun, arg);
        assert!(Arc::ptr_eq(&app.0, &updated.0));
    }

    #[test]
    fn update_app_rebuilds_when_child_changes() {
        let app = mk_app(mk_var(0), mk_var(1));
        let updated = app.update_app(mk_var(0), mk_var(2));
        assert!(!Arc::ptr_eq(&app.0, &updated.0));
        assert_eq!(updated, mk_app(mk_var(0), mk_var(2)));
    }

    #[test]
    fn update_binder_propagates_tag() {
        let pi = mk_pi(Binding::mk("x", mk_prop(), BinderStyle::Default), mk_var(0));
        pi.set_tag(7);
        let updated = pi.update_binder(mk_prop(), mk_var(0).lift_free_vars(0, 1));
        assert_eq!(updated.get_tag(), 7);
    }

    #[test]
    fn update_rev_app_shares_full_spine() {
        let spine = mk_var(2).fold_apps([&mk_var(0), &mk_var(1)]);
        let (head, args) = spine.unfold_apps();
        let rev_args: Vec<Expr> = args.iter().rev().cloned().collect();
        let updated = spine.update_rev_app(head, &rev_args);
        assert!(Arc::ptr_eq(&spine.0, &updated.0));
    }

    #[test]
    fn mk_rev_app_matches_fold_apps() {
        let args = vec![mk_var(0), mk_var(1)];
        let rev: Vec<Expr> = args.iter().rev().cloned().collect();
        let a = mk_var(2).fold_apps(&args);
        let b = mk_rev_app(mk_var(2), &rev);
        assert_eq!(a, b);
    }
}
