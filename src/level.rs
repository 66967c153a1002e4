use std::sync::Arc;
use hashbrown::HashSet;

use crate::name::Name;
use crate::errors;

use InnerLevel::*;

/// `Level` and `InnerLevel` together represent the universe level algebra that
/// sorts are indexed by. Structurally they're just trees, with `Level` acting
/// as a reference counted wrapper around `InnerLevel`. Zero, Param and Meta
/// values are always leaves. `Succ` is just like nat's succ, with the
/// predecessor it points to as its only child. `Max` is a node which always
/// has two children, and represents the eventual maximum of two `Level`
/// values, which we can't always immediately resolve due to the presence of
/// variables (Params) or metavariables (Meta).
/// `IMax` is a `Max` node with one special behavior; any time the right hand
/// branch of an `IMax` resolves to `Zero`, the whole term resolves to `Zero`.
/// This behavior has to do with correctly handling `Prop`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Level(Arc<InnerLevel>);

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum InnerLevel {
    Zero,
    Succ(Level),
    Max(Level, Level),
    IMax(Level, Level),
    Param(Name),
    /// A universe metavariable, to be solved by the elaborator. The kernel
    /// core treats this opaquely; it only needs to detect its presence and
    /// emit a constraint when one shows up in a comparison.
    Meta(Name),
}

pub fn mk_zero() -> Level {
    Level(Arc::new(InnerLevel::Zero))
}

pub fn mk_max(lhs: Level, rhs: Level) -> Level {
    Level(Arc::new(Max(lhs, rhs)))
}

pub fn mk_imax(lhs: Level, rhs: Level) -> Level {
    Level(Arc::new(IMax(lhs, rhs)))
}

pub fn mk_imax_refs(lhs: &Level, rhs: &Level) -> Level {
    Level(Arc::new(IMax(lhs.clone(), rhs.clone())))
}

pub fn mk_param(n: impl Into<Name>) -> Level {
    Level(Arc::new(Param(n.into())))
}

pub fn mk_meta(n: impl Into<Name>) -> Level {
    Level(Arc::new(Meta(n.into())))
}

pub fn mk_succ(l: Level) -> Level {
    Level(Arc::new(Succ(l)))
}

impl Level {
    pub fn get_param_name(&self) -> &Name {
        match self.as_ref() {
            Param(n) => n,
            owise => errors::err_param_name(line!(), owise),
        }
    }

    pub fn is_param(&self) -> bool {
        matches!(self.as_ref(), Param(..))
    }

    pub fn is_meta(&self) -> bool {
        matches!(self.as_ref(), Meta(..))
    }

    pub fn is_any_max(&self) -> bool {
        matches!(self.as_ref(), Max(..) | IMax(..))
    }

    /// Whether a universe metavariable occurs anywhere in this level. Used by
    /// the converter's Sort comparison (4.E.7, phase 1) to decide whether to
    /// emit a level constraint instead of deciding by the equivalence oracle.
    pub fn has_metavariable(&self) -> bool {
        match self.as_ref() {
            Zero | Param(..) => false,
            Meta(..) => true,
            Succ(l) => l.has_metavariable(),
            Max(a, b) | IMax(a, b) => a.has_metavariable() || b.has_metavariable(),
        }
    }

    /// Whether a universe parameter occurs anywhere in this level.
    pub fn has_param(&self) -> bool {
        match self.as_ref() {
            Zero | Meta(..) => false,
            Param(..) => true,
            Succ(l) => l.has_param(),
            Max(a, b) | IMax(a, b) => a.has_param() || b.has_param(),
        }
    }

    /// A non-naive way of combining two `Level` values (naive would be just
    /// creating a Max). gets used in `simplify`.
    pub fn combining(&self, other: &Level) -> Self {
        match (self.as_ref(), other.as_ref()) {
            (Zero, _) => other.clone(),
            (_, Zero) => self.clone(),
            (Succ(lhs), Succ(rhs)) => mk_succ(lhs.combining(rhs)),
            _ => mk_max(self.clone(), other.clone()),
        }
    }

    /// Brief simplification procedure mostly aimed at simplifying IMax terms
    /// (the rule about an IMax with a right hand side of Zero becoming Zero
    /// is enforced here).
    pub fn simplify(&self) -> Level {
        match self.as_ref() {
            Zero | Param(..) | Meta(..) => self.clone(),
            Succ(lvl) => mk_succ(lvl.simplify()),
            Max(a, b) => mk_max(a.simplify(), b.simplify()),
            IMax(a, b) => {
                let b_prime = b.simplify();
                match b_prime.as_ref() {
                    Zero => mk_zero(),
                    Succ(..) => a.simplify().combining(&b_prime),
                    _ => mk_imax(a.simplify(), b_prime),
                }
            }
        }
    }

    /// Given a `Level` `L`, and a mapping of `Level::Param |-> Level` `M`, traverse
    /// `L` and replace `Param` nodes found in `M` with their mapped value.
    pub fn instantiate_lvl(&self, substs: &[(Level, Level)]) -> Level {
        match self.as_ref() {
            Zero | Meta(..) => self.clone(),
            Succ(inner) => mk_succ(inner.instantiate_lvl(substs)),
            Max(a, b) => {
                let a_prime = a.instantiate_lvl(substs);
                let b_prime = b.instantiate_lvl(substs);
                mk_max(a_prime, b_prime)
            }
            IMax(a, b) => {
                let a_prime = a.instantiate_lvl(substs);
                let b_prime = b.instantiate_lvl(substs);
                mk_imax(a_prime, b_prime)
            }
            Param(..) => substs
                .iter()
                .find(|(l, _)| l == self)
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| self.clone()),
        }
    }

    /// Universe parameter instantiation at a definition's instantiation site;
    /// `params` and `levels` are parallel lists.
    pub fn instantiate_params(&self, params: &[Name], levels: &[Level]) -> Level {
        let substs: Vec<(Level, Level)> = params
            .iter()
            .cloned()
            .map(mk_param)
            .zip(levels.iter().cloned())
            .collect();
        self.instantiate_lvl(&substs)
    }

    /// Used in `leq_core` to handle the case where one of the levels in
    /// question is an IMax whose right hand side is some parameter `P`.
    pub fn ensure_imax_leq(&self, lhs: &Level, rhs: &Level, diff: i32) -> bool {
        assert!(self.is_param() || self.is_meta());

        let zero_map = vec![(self.clone(), mk_zero())];
        let nonzero_map = vec![(self.clone(), mk_succ(self.clone()))];

        let closure = |subst: &Vec<(Level, Level)>, left: &Level, right: &Level| {
            let left_prime = left.instantiate_lvl(subst).simplify();
            let right_prime = right.instantiate_lvl(subst).simplify();
            left_prime.leq_core(&right_prime, diff)
        };

        closure(&zero_map, lhs, rhs) && closure(&nonzero_map, lhs, rhs)
    }

    /// Essentially just a big case analysis (in the presence of variables and
    /// IMax's special casing) to determine whether the left hand side is less
    /// than or equal to the right hand side, using universe ordering rules,
    /// not Rust's derived `Ord`. `diff` tracks applications of `Succ(x)` as
    /// both sides are unrolled in recursive calls.
    pub fn leq_core(&self, other: &Level, diff: i32) -> bool {
        match (self.as_ref(), other.as_ref()) {
            (Zero, _) if diff >= 0 => true,
            (_, Zero) if diff < 0 => false,
            (Param(a), Param(x)) => a == x && diff >= 0,
            (Meta(a), Meta(x)) => a == x && diff >= 0,
            (Param(..), Zero) | (Meta(..), Zero) => false,
            (Zero, Param(..)) | (Zero, Meta(..)) => diff >= 0,

            (Succ(s), _) => s.leq_core(other, diff - 1),
            (_, Succ(s)) => self.leq_core(s, diff + 1),

            (Max(a, b), _) => a.leq_core(other, diff) && b.leq_core(other, diff),

            (Param(..), Max(x, y)) | (Meta(..), Max(x, y)) => {
                self.leq_core(x, diff) || self.leq_core(y, diff)
            }

            (Zero, Max(x, y)) => self.leq_core(x, diff) || self.leq_core(y, diff),

            (IMax(a, b), IMax(x, y)) if a == x && b == y => true,

            (IMax(.., b), _) if b.is_param() || b.is_meta() => b.ensure_imax_leq(self, other, diff),

            (_, IMax(.., y)) if y.is_param() || y.is_meta() => y.ensure_imax_leq(self, other, diff),

            (IMax(a, b), _) if b.is_any_max() => match b.as_ref() {
                IMax(x, y) => {
                    let new_max = mk_max(mk_imax_refs(a, y), mk_imax_refs(x, y));
                    Level::leq_core(&new_max, other, diff)
                }
                Max(x, y) => {
                    let new_max = mk_max(mk_imax_refs(a, x), mk_imax_refs(a, y)).simplify();
                    Level::leq_core(&new_max, other, diff)
                }
                _ => unreachable!(),
            },

            (_, IMax(x, y)) if y.is_any_max() => match y.as_ref() {
                IMax(j, k) => {
                    let new_max = mk_max(mk_imax_refs(x, k), mk_imax_refs(j, k));
                    self.leq_core(&new_max, diff)
                }
                Max(j, k) => {
                    let new_max = mk_max(mk_imax_refs(x, j), mk_imax_refs(x, k)).simplify();
                    self.leq_core(&new_max, diff)
                }
                _ => unreachable!(),
            },
            (Param(..), Meta(..)) | (Meta(..), Param(..)) => diff >= 0 && self == other,
            _ => unreachable!(),
        }
    }

    /// Outward-facing function that uses `leq_core` to determine whether
    /// `self <= other` using the universe ordering rules.
    pub fn leq(&self, other: &Level) -> bool {
        self.simplify().leq_core(&other.simplify(), 0)
    }

    /// Uses antisymmetry to determine whether two levels are equivalent.
    pub fn eq_by_antisymm(&self, other: &Level) -> bool {
        let l1 = self.simplify();
        let l2 = other.simplify();

        l1.leq_core(&l2, 0) && l2.leq_core(&l1, 0)
    }

    /// There is no level strictly less than Zero, so for any level `L`, if
    /// `L <= Zero`, `L` must be `Zero`.
    pub fn is_zero(&self) -> bool {
        self.leq(&mk_zero())
    }

    pub fn is_nonzero(&self) -> bool {
        mk_succ(mk_zero()).leq(self)
    }

    pub fn maybe_zero(&self) -> bool {
        !self.is_nonzero()
    }

    pub fn maybe_nonzero(&self) -> bool {
        !self.is_zero()
    }

    pub fn to_offset(&self) -> (usize, &Level) {
        let (mut succs, mut inner) = (0usize, self);

        while let Succ(x) = inner.as_ref() {
            succs += 1;
            inner = x;
        }

        (succs, inner)
    }
}

/// Compares two parallel lists of universe arguments for equivalence, as used
/// by `Const` comparison in structural/definitional equality.
pub fn is_def_eq_lvls(lhs: &[Level], rhs: &[Level]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs.iter()).all(|(a, b)| a.eq_by_antisymm(b))
}

pub fn unique_univ_params<'l>(lvl: &'l Level) -> HashSet<&'l Level> {
    let mut acc = HashSet::with_capacity(40);
    unique_univ_params_core(lvl, &mut acc);
    acc
}

pub fn unique_univ_params_core<'l, 's>(lvl: &'l Level, acc: &'s mut HashSet<&'l Level>) {
    match lvl.as_ref() {
        Zero | Meta(..) => (),
        Succ(lvl) => unique_univ_params_core(lvl, acc),
        Max(lhs, rhs) | IMax(lhs, rhs) => {
            unique_univ_params_core(lhs, acc);
            unique_univ_params_core(rhs, acc);
        }
        Param(..) => {
            acc.insert(lvl);
        }
    }
}

impl std::convert::AsRef<InnerLevel> for Level {
    fn as_ref(&self) -> &InnerLevel {
        match self {
            Level(x) => x.as_ref(),
        }
    }
}

impl From<Arc<InnerLevel>> for Level {
    fn from(x: Arc<InnerLevel>) -> Level {
        Level(x)
    }
}

impl From<InnerLevel> for Level {
    fn from(x: InnerLevel) -> Level {
        Level(Arc::new(x))
    }
}

impl From<&str> for Level {
    fn from(s: &str) -> Level {
        mk_param(s)
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.as_ref())
    }
}

impl std::fmt::Debug for InnerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Zero => write!(f, "Zero"),
            Succ(_) => {
                let outer = Level::from(self.clone());
                let (succs, inner) = outer.to_offset();
                let s = if inner.is_zero() {
                    format!("Sort {}", succs)
                } else {
                    format!("{} + {:?}", succs, inner)
                };

                write!(f, "{}", s)
            }
            Max(lhs, rhs) => write!(f, "Max({:?}, {:?})", lhs, rhs),
            IMax(lhs, rhs) => write!(f, "IMax({:?}, {:?})", lhs, rhs),
            Param(n) => write!(f, "Param({:?})", n),
            Meta(n) => write!(f, "Meta({:?})", n),
        }
    }
}

#[cfg(test)]
mod level_tests {
    use super::*;

    #[test]
    fn imax_zero_collapses() {
        let p = mk_param("u");
        let imax = mk_imax(p, mk_zero());
        assert!(imax.simplify().is_zero());
    }

    #[test]
    fn meta_has_metavariable() {
        let l = mk_imax(mk_param("u"), mk_meta("?m"));
        assert!(l.has_metavariable());
        assert!(l.has_param());
        assert!(!mk_zero().has_metavariable());
    }

    #[test]
    fn antisymm_eq() {
        let a = mk_succ(mk_zero());
        let b = mk_succ(mk_zero());
        assert!(a.eq_by_antisymm(&b));
    }
}
