use hashbrown::HashMap;
use std::sync::Arc;

use crate::expr::Expr;
use crate::macros::{ExtensionContext, NormalizerExtension};
use crate::name::Name;

/// A single constant's entry in the environment, as seen by the converter.
/// This is intentionally a much smaller surface than a full elaborator's
/// notion of a declaration (no source position, no doc string, no pretty
/// printer notation) -- just the handful of fields `is_def_eq`'s delta-rule
/// and opacity policy actually consult.
#[derive(Clone)]
pub struct Definition {
    name: Name,
    is_definition: bool,
    is_theorem: bool,
    is_opaque: bool,
    /// Height in the dependency order definitions were declared in; taller
    /// (more recently declared, in terms of what it depends on) definitions
    /// unfold before shorter ones during lazy delta-reduction.
    weight: u32,
    /// Which compilation unit this declaration was declared in. Constants
    /// declared in the converter's own home module may be unfolded through
    /// even when otherwise marked opaque; see `Converter::is_opaque`.
    module_idx: u32,
    params: Vec<Name>,
    value: Expr,
    /// Whether this definition is eligible for the "arguments-equal"
    /// quick-accept optimization during congruence checking.
    use_conv_opt: bool,
}

impl Definition {
    pub fn new_definition(name: Name, params: Vec<Name>, value: Expr, weight: u32, module_idx: u32, use_conv_opt: bool) -> Self {
        Definition { name, is_definition: true, is_theorem: false, is_opaque: false, weight, module_idx, params, value, use_conv_opt }
    }

    pub fn new_theorem(name: Name, params: Vec<Name>, value: Expr, weight: u32, module_idx: u32) -> Self {
        Definition { name, is_definition: true, is_theorem: true, is_opaque: true, weight, module_idx, params, value, use_conv_opt: true }
    }

    /// A definition (not a theorem) marked opaque by its own flag -- e.g. a
    /// `set_option`-style `@[opaque]` definition. Unlike a theorem, this kind
    /// of opacity is waivable: `Converter::is_opaque`'s home-module step
    /// (§4.E.2, policy step 4) makes it transparent again to a converter
    /// whose home module matches `module_idx`.
    pub fn new_opaque_definition(name: Name, params: Vec<Name>, value: Expr, weight: u32, module_idx: u32, use_conv_opt: bool) -> Self {
        Definition { name, is_definition: true, is_theorem: false, is_opaque: true, weight, module_idx, params, value, use_conv_opt }
    }

    pub fn get_name(&self) -> &Name {
        &self.name
    }

    pub fn is_definition(&self) -> bool {
        self.is_definition
    }

    pub fn is_theorem(&self) -> bool {
        self.is_theorem
    }

    pub fn is_opaque(&self) -> bool {
        self.is_opaque
    }

    pub fn get_weight(&self) -> u32 {
        self.weight
    }

    pub fn get_module_idx(&self) -> u32 {
        self.module_idx
    }

    pub fn get_params(&self) -> &[Name] {
        &self.params
    }

    pub fn get_value(&self) -> &Expr {
        &self.value
    }

    pub fn use_conv_opt(&self) -> bool {
        self.use_conv_opt
    }
}

/// The read-only contract the converter needs from whatever the calling
/// elaborator uses to track declarations. Everything that actually manages
/// compiling/checking new declarations -- inductive families, recursors,
/// notation, module bookkeeping -- lives outside this crate; the converter
/// only ever asks an `EnvView` to look a name up, report a couple of global
/// policy flags, and (optionally) attempt a normalizer-extension step.
pub trait EnvView {
    fn find(&self, name: &Name) -> Option<&Definition>;

    /// Whether the environment's definitional equality should apply
    /// eta-reduction when comparing two lambdas/pis.
    fn eta(&self) -> bool;

    /// Whether the environment's definitional equality should treat any two
    /// proofs of the same proposition as equal regardless of their term
    /// structure.
    fn proof_irrel(&self) -> bool;

    /// Ask every registered normalizer extension (quotients, compiled
    /// recursors, ...) whether any of them can make progress reducing `e`.
    fn norm_ext(&self, e: &Expr, ctx: &mut dyn ExtensionContext) -> Option<Expr>;
}

/// A minimal, in-memory `EnvView` implementation: a `HashMap` of
/// declarations plus the handful of global policy flags and a list of
/// normalizer extensions to consult in order. Sufficient for driving the
/// converter in tests and the demonstration binary; a real elaborator would
/// supply its own `EnvView` backed by whatever persistent declaration store
/// it already maintains (typically behind a `parking_lot::RwLock` once
/// shared across worker threads, exactly as the rest of this crate's
/// ambient concurrency story assumes).
pub struct InMemoryEnv {
    declarations: HashMap<Name, Definition>,
    eta: bool,
    proof_irrel: bool,
    extensions: Vec<Arc<dyn NormalizerExtension>>,
}

impl InMemoryEnv {
    pub fn new(eta: bool, proof_irrel: bool) -> Self {
        InMemoryEnv { declarations: HashMap::new(), eta, proof_irrel, extensions: Vec::new() }
    }

    pub fn insert(&mut self, def: Definition) {
        self.declarations.insert(def.get_name().clone(), def);
    }

    pub fn register_extension(&mut self, ext: Arc<dyn NormalizerExtension>) {
        self.extensions.push(ext);
    }
}

impl EnvView for InMemoryEnv {
    fn find(&self, name: &Name) -> Option<&Definition> {
        self.declarations.get(name)
    }

    fn eta(&self) -> bool {
        self.eta
    }

    fn proof_irrel(&self) -> bool {
        self.proof_irrel
    }

    fn norm_ext(&self, e: &Expr, ctx: &mut dyn ExtensionContext) -> Option<Expr> {
        for ext in &self.extensions {
            if let Some(result) = ext.norm_ext(e, ctx) {
                return Some(result);
            }
        }
        None
    }
}

#[cfg(test)]
mod env_tests {
    use super::*;
    use crate::expr::mk_prop;

    #[test]
    fn lookup_roundtrips() {
        let mut env = InMemoryEnv::new(true, true);
        let def = Definition::new_definition(Name::from("foo"), Vec::new(), mk_prop(), 0, 0, true);
        env.insert(def);
        assert!(env.find(&Name::from("foo")).is_some());
        assert!(env.find(&Name::from("bar")).is_none());
    }
}
