use crate::errors::KernelErr;
use crate::expr::Expr;
use crate::justification::Justification;
use crate::level::Level;

/// A constraint emitted by the converter whenever it cannot decide a
/// comparison outright because one side involves a metavariable, and hands
/// the decision off to whatever external elaborator owns that metavariable.
#[derive(Debug, Clone)]
pub enum Constraint {
    TermEq { lhs: Expr, rhs: Expr, justification: Justification },
    LevelEq { lhs: Level, rhs: Level, justification: Justification },
}

impl Constraint {
    pub fn justification(&self) -> &Justification {
        match self {
            Constraint::TermEq { justification, .. } => justification,
            Constraint::LevelEq { justification, .. } => justification,
        }
    }
}

/// Where a `Converter` sends constraints as it discovers them. Implementors
/// are free to refuse a constraint (returning `Err`), which the converter
/// interprets as a retraction of whatever speculative comparison produced
/// it -- the comparison as a whole then fails, exactly as if the sides had
/// been found unequal outright.
pub trait ConstraintSink {
    fn add_constraint(&mut self, constraint: Constraint) -> Result<(), KernelErr>;
}

/// A `ConstraintSink` that accepts everything unconditionally and remembers
/// it, for use in tests and in the demonstration binary where there is no
/// elaborator downstream to hand constraints to.
#[derive(Default)]
pub struct CollectingSink {
    pub constraints: Vec<Constraint>,
}

impl ConstraintSink for CollectingSink {
    fn add_constraint(&mut self, constraint: Constraint) -> Result<(), KernelErr> {
        self.constraints.push(constraint);
        Ok(())
    }
}

/// A `ConstraintSink` that refuses every constraint, useful for exercising
/// the retraction path of the arguments-equal shortcut in tests.
#[derive(Default)]
pub struct RefusingSink;

impl ConstraintSink for RefusingSink {
    fn add_constraint(&mut self, _constraint: Constraint) -> Result<(), KernelErr> {
        Err(KernelErr::ConstraintRetracted)
    }
}

#[cfg(test)]
mod constraint_tests {
    use super::*;
    use crate::expr::mk_prop;
    use crate::justification::Justification;

    #[test]
    fn collecting_sink_accumulates() {
        let mut sink = CollectingSink::default();
        let c = Constraint::TermEq { lhs: mk_prop(), rhs: mk_prop(), justification: Justification::Asserted };
        sink.add_constraint(c).unwrap();
        assert_eq!(sink.constraints.len(), 1);
    }

    #[test]
    fn refusing_sink_errs() {
        let mut sink = RefusingSink::default();
        let c = Constraint::TermEq { lhs: mk_prop(), rhs: mk_prop(), justification: Justification::Asserted };
        assert!(sink.add_constraint(c).is_err());
    }
}
