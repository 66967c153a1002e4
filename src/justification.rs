use crate::expr::Expr;
use crate::level::Level;

/// A record of *why* a constraint was emitted, independent of whether it
/// ever gets used: the converter builds these eagerly so that a caller who
/// rejects a constraint (say, because unifying the underlying metavariable
/// would escape its scope) can see the full derivation, but nothing in this
/// crate ever inspects a `Justification`'s contents for correctness -- it is
/// pure provenance for the benefit of an external elaborator's error
/// messages and backtracking.
///
/// Modeled as a sum type rather than a class hierarchy with `dynamic_cast`:
/// adding a new justification kind here is a new variant, and `remove_detail`
/// (the one operation every kind must support) becomes an ordinary `match`
/// instead of a chain of downcasts.
#[derive(Debug, Clone)]
pub enum Justification {
    /// No further derivation; this constraint was asserted outright (e.g.
    /// supplied directly by the elaborator, not derived from another
    /// comparison).
    Asserted,
    /// This constraint followed directly from another single constraint
    /// (e.g. `f a =?= f b` propagated down to `a =?= b`).
    Propagation(Box<ConstraintRecord>),
    /// This constraint was derived by case-splitting on a set of candidate
    /// unifications, each of which failed; `cases` records one justification
    /// per rejected case, for diagnostic purposes.
    UnificationFailureByCases { constraint: Box<ConstraintRecord>, cases: Vec<Justification> },
    /// This constraint followed from substituting a single metavariable
    /// solution into another constraint.
    Substitution { constraint: Box<ConstraintRecord>, assignment: Box<Justification> },
    /// As `Substitution`, but for simultaneously substituting several
    /// metavariable solutions at once.
    MultiSubstitution { constraint: Box<ConstraintRecord>, assignments: Vec<Justification> },
    /// This constraint relates a metavariable to the type annotation it was
    /// created with.
    TypeofMetavar { mvar: Expr, ty: Expr, inner: Box<Justification> },
    /// This constraint was chosen among several simultaneously-valid
    /// solutions to a higher-order unification problem; `assumptions` records
    /// the alternatives that were considered and discarded.
    NextSolution { assumptions: Vec<Justification> },
}

/// A snapshot of the constraint a `Justification` is attached to, kept
/// alongside it for diagnostics; deliberately untyped with respect to
/// `crate::constraint::Constraint` itself; to avoid a cyclic type between
/// the two modules the distinction (term vs. level constraint) is inlined
/// here directly.
#[derive(Debug, Clone)]
pub enum ConstraintRecord {
    TermEq(Expr, Expr),
    LevelEq(Level, Level),
}

impl Justification {
    /// Strips a justification down to the minimal information needed to
    /// re-derive that *some* justification exists, discarding the detailed
    /// derivation tree. Used when a constraint crosses a trust boundary
    /// (e.g. gets serialized, or logged at a coarser verbosity) where the
    /// full case-split history isn't useful. Ported from a dynamic-dispatch
    /// `remove_detail` virtual method into a plain structural match.
    pub fn remove_detail(&self) -> Justification {
        match self {
            Justification::Asserted => Justification::Asserted,
            Justification::Propagation(c) => Justification::Propagation(c.clone()),
            Justification::UnificationFailureByCases { constraint, .. } => {
                Justification::Propagation(constraint.clone())
            }
            Justification::Substitution { constraint, .. } => Justification::Propagation(constraint.clone()),
            Justification::MultiSubstitution { constraint, .. } => Justification::Propagation(constraint.clone()),
            Justification::TypeofMetavar { mvar, ty, .. } => {
                Justification::Propagation(Box::new(ConstraintRecord::TermEq(mvar.clone(), ty.clone())))
            }
            Justification::NextSolution { .. } => Justification::Asserted,
        }
    }
}

/// A justification that is only actually built when (if ever) it is needed.
/// Most comparisons the converter performs never fail and never get
/// inspected for provenance, so eagerly allocating a `Justification` tree
/// for every one of them would be wasted work; this defers that cost to the
/// rare caller that asks.
pub enum DelayedJustification<'a> {
    Eager(Justification),
    Lazy(Box<dyn Fn() -> Justification + 'a>),
}

impl<'a> DelayedJustification<'a> {
    pub fn eager(j: Justification) -> Self {
        DelayedJustification::Eager(j)
    }

    pub fn lazy(f: impl Fn() -> Justification + 'a) -> Self {
        DelayedJustification::Lazy(Box::new(f))
    }

    pub fn materialize(&self) -> Justification {
        match self {
            DelayedJustification::Eager(j) => j.clone(),
            DelayedJustification::Lazy(f) => f(),
        }
    }
}

#[cfg(test)]
mod justification_tests {
    use super::*;
    use crate::expr::mk_prop;

    #[test]
    fn remove_detail_collapses_cases() {
        let record = Box::new(ConstraintRecord::TermEq(mk_prop(), mk_prop()));
        let j = Justification::UnificationFailureByCases { constraint: record.clone(), cases: vec![Justification::Asserted] };
        match j.remove_detail() {
            Justification::Propagation(r) => match *r {
                ConstraintRecord::TermEq(..) => (),
                _ => panic!("wrong record kind"),
            },
            _ => panic!("expected Propagation"),
        }
    }

    #[test]
    fn delayed_lazy_runs_on_demand() {
        let dj = DelayedJustification::lazy(|| Justification::Asserted);
        match dj.materialize() {
            Justification::Asserted => (),
            _ => panic!("expected Asserted"),
        }
    }
}
