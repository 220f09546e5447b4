//! Confidentiality levels and the promotion rule applied to signed copies.
//!
//! A ladder lists the known levels lowest first. When a signed copy is
//! split off a piece, its level is the piece's level escalated one step if
//! that level is among the lowest `promote_up_to` rungs, and unchanged
//! otherwise. Unknown levels are never touched, so promotion can only raise
//! a classification.

use crate::sparql::Expr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLadder {
    levels: Vec<String>,
    promote_up_to: usize,
}

impl AccessLadder {
    /// `promote_up_to` is clamped so the top rung is never escalated.
    pub fn new(levels: Vec<String>, promote_up_to: usize) -> Self {
        let promote_up_to = promote_up_to.min(levels.len().saturating_sub(1));
        Self {
            levels,
            promote_up_to,
        }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Position of `level` on the ladder, if known.
    pub fn rank(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }

    /// The level the signed copy of a piece at `level` receives.
    pub fn promote<'a>(&'a self, level: &'a str) -> &'a str {
        match self.rank(level) {
            Some(rank) if rank < self.promote_up_to => &self.levels[rank + 1],
            _ => level,
        }
    }

    /// The promotion rule as a SPARQL expression over `var`, for use in a
    /// `BIND` so the new level is computed from the value matched at write time.
    pub fn promotion_expr(&self, var: &str) -> Expr {
        let mut expr = Expr::var(var);
        for rank in (0..self.promote_up_to).rev() {
            expr = Expr::if_else(
                Expr::equals(Expr::var(var), Expr::iri(&self.levels[rank])),
                Expr::iri(&self.levels[rank + 1]),
                expr,
            );
        }
        expr
    }
}
