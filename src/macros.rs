use std::fmt;

use crate::env::EnvView;
use crate::errors::KernelResult;
use crate::expr::Expr;
use crate::name::Name;

/// The capabilities a `MacroDefinition` needs from its caller in order to
/// expand, infer a type for, or otherwise reduce one of its instances. A
/// macro must never assume `self` is the only extension live in an
/// environment, so everything it needs -- environment lookups, a whnf
/// operation, type inference, fresh name generation, and a sink for any
/// constraint it has to emit against a metavariable it encounters along the
/// way -- is threaded through explicitly rather than captured globally.
pub trait ExtensionContext {
    fn env(&self) -> &dyn EnvView;

    /// Reduce `e` to weak head normal form using the ambient converter.
    fn whnf(&mut self, e: &Expr) -> KernelResult<Expr>;

    /// Infer the type of `e` using the ambient type checker.
    fn infer_type(&mut self, e: &Expr) -> KernelResult<Expr>;

    /// Produce a name guaranteed fresh with respect to everything currently
    /// in scope, for use when a macro needs to synthesize a new local.
    fn fresh_name(&mut self) -> Name;

    /// Record a constraint discovered while expanding or typing a macro
    /// instance (most commonly because one of its arguments contains a
    /// metavariable). Returns an error if the sink rejects it.
    fn add_constraint(&mut self, constraint: crate::constraint::Constraint) -> KernelResult<()>;
}

/// A polymorphic extension to the term representation (quotients, inductive
/// recursors compiled ahead of time, and similar constructs can all be
/// modeled as one of these instead of extending `InnerExpr` itself). The
/// kernel core only ever touches a macro instance through this trait; it
/// never downcasts to a concrete type.
pub trait MacroDefinition: fmt::Debug + Send + Sync {
    fn macro_name(&self) -> &Name;

    /// Fully expand this macro instance applied to `args`, or `None` if it
    /// is stuck (e.g. a recursor macro waiting on a constructor-headed
    /// argument that hasn't reduced far enough yet).
    fn expand(&self, args: &[Expr], ctx: &mut dyn ExtensionContext) -> Option<Expr>;

    /// Perform a single step of expansion, without necessarily reaching a
    /// fixpoint. Used by `whnf_core` so that one normalizer-extension step
    /// interleaves properly with ordinary delta/beta steps.
    fn expand1(&self, args: &[Expr], ctx: &mut dyn ExtensionContext) -> Option<Expr>;

    /// The type of this macro instance applied to `args`, given the already
    /// inferred types of those arguments, if it can be computed without a
    /// full expansion.
    fn get_type(&self, args: &[Expr], arg_types: &[Expr], ctx: &mut dyn ExtensionContext) -> Option<Expr>;

    /// How much this macro's producer is trusted; `0` means "as trusted as
    /// the kernel itself". Non-zero trust levels are surfaced to callers that
    /// want to refuse to certify proofs depending on untrusted extensions,
    /// but the kernel core itself does not interpret this value.
    fn trust_level(&self) -> u32 {
        0
    }

    /// A structural digest of this macro's identity, folded into the owning
    /// `Expr` node's cached digest.
    fn macro_hash(&self) -> u64;

    /// Structural equality between two macro definitions (not just their
    /// arguments, which the owning `Expr`'s equality handles separately).
    fn macro_equals(&self, other: &dyn MacroDefinition) -> bool;

    /// A total order over macro definitions, used only to give `Expr` an
    /// arbitrary but stable order for use in sorted containers; it carries
    /// no semantic meaning.
    fn macro_lt(&self, other: &dyn MacroDefinition) -> bool {
        self.macro_hash() < other.macro_hash()
    }
}

/// A process-wide place to look up a `MacroDefinition` by name when
/// deserializing a binary term stream (see `crate::serial`); the stream only
/// carries the macro's name and argument list, not its behavior.
pub trait MacroSerializer: Send + Sync {
    fn lookup(&self, name: &Name) -> Option<std::sync::Arc<dyn MacroDefinition>>;
}

/// A `NormalizerExtension` bridges the kernel's definitional equality engine
/// and the macro layer: when ordinary (beta/delta/eta) reduction gets stuck
/// on a head it doesn't understand, the `Converter` asks every registered
/// normalizer extension whether it can make progress. Quotient types and
/// compiled recursors are both normalizer extensions in addition to being
/// `MacroDefinition`s.
pub trait NormalizerExtension: Send + Sync {
    fn norm_ext(&self, e: &Expr, ctx: &mut dyn ExtensionContext) -> Option<Expr>;
}

/// Convenience no-op extension used by `crate::converter::dummy_converter`
/// and in tests that don't need any macros at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtensions;

impl NormalizerExtension for NoExtensions {
    fn norm_ext(&self, _e: &Expr, _ctx: &mut dyn ExtensionContext) -> Option<Expr> {
        None
    }
}
