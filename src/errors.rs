use std::fmt;
use std::error::Error;

/// Two tiers of failure. `KernelErr` covers outcomes an external caller can
/// reasonably recover from -- a failed definitional equality check, a
/// cancelled computation, a constraint an elaborator chose to retract.
/// Everything else (a pattern match that should be exhaustive given the
/// crate's own invariants, a partial accessor called on the wrong variant)
/// is a programmer error in this crate or its caller and panics immediately
/// via the free `err_*` functions below, the same way the upstream kernel
/// this was adapted from treats its own invariant violations as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelErr {
    /// `is_def_eq` or a full equality check determined the two terms are not
    /// definitionally equal.
    NotDefEq,
    /// A `Converter` computation was cancelled by its cooperative
    /// cancellation flag mid-traversal.
    Interrupted,
    /// A constraint producer's speculative path was retracted after a
    /// `ConstraintSink` refused a constraint (e.g. the elaborator rejected a
    /// metavariable assignment as out of scope).
    ConstraintRetracted,
}

pub type KernelResult<T> = Result<T, KernelErr>;

impl fmt::Display for KernelErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelErr::NotDefEq => write!(f, "terms are not definitionally equal"),
            KernelErr::Interrupted => write!(f, "computation was interrupted"),
            KernelErr::ConstraintRetracted => write!(f, "a speculatively-emitted constraint was retracted"),
        }
    }
}

impl Error for KernelErr {}

/// Most of the functions below are invoked in the event that a pattern match
/// expects something it doesn't end up getting -- a partial accessor called
/// on the wrong variant, or an algorithmic invariant this crate relies on
/// elsewhere having been violated. Ideally we would get rid of the ones
/// related to partial functions, but Rust's type system doesn't offer
/// discrimination of enum variants at the type level, and breaking each enum
/// variant out into its own struct would be a huge hit to readability and
/// directness for comparatively little safety gained, since these are all
/// cases that should be unreachable if the rest of the crate is correct.

pub fn err_not_const<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a `Const` node, got {:#?}", loc, owise);
    panic!("err_not_const");
}

pub fn err_not_sort<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a `Sort` node, got {:#?}", loc, owise);
    panic!("err_not_sort");
}

pub fn err_not_local<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a `Local` node, got {:#?}", loc, owise);
    panic!("err_not_local");
}

pub fn err_not_binder<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a node carrying a `Binding` (Lambda/Pi/Let/Local), got {:#?}", loc, owise);
    panic!("err_not_binder");
}

pub fn err_not_app<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected an `App` node, got {:#?}", loc, owise);
    panic!("err_not_app");
}

pub fn err_not_let<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a `Let` node, got {:#?}", loc, owise);
    panic!("err_not_let");
}

pub fn err_not_macro<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a `Macro` node, got {:#?}", loc, owise);
    panic!("err_not_macro");
}

pub fn err_not_mlocal<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("expr.rs line {}; expected a `Local` or `Meta` node, got {:#?}", loc, owise);
    panic!("err_not_mlocal");
}

pub fn err_param_name<T: fmt::Debug>(loc: u32, owise: &T) -> ! {
    eprintln!("level.rs line {}; expected a `Param` level, got {:#?}", loc, owise);
    panic!("err_param_name");
}

#[cfg(test)]
mod errors_tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(format!("{}", KernelErr::NotDefEq), "terms are not definitionally equal");
    }
}
