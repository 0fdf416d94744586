//! Operator chains and the query builder API.
//!
//! The front end of the larger system builds these chains from its own
//! comprehension syntax; here they are constructed explicitly. A [`Query`]
//! is a source (an array, or a zip of two arrays) followed by a strictly
//! ordered list of element-wise operators. Terminals are chosen by the
//! [`crate::Context`] entry point used to execute it: `run`/`fill`
//! materialize, [`Query::sum`]/[`Query::count`] produce a [`Reduction`].

use std::sync::Arc;

use crate::buffers::{ArrayHandle, BufferInner, DeviceElement};
use crate::error::{Error, Result};
use crate::expr::ScalarExpr;

/// Where the element stream comes from.
#[derive(Debug, Clone)]
pub(crate) enum QuerySource {
    /// A single device array.
    Array(Arc<BufferInner>),
    /// Pairwise combination of two already-realized device arrays of equal
    /// length. The combine expression references [`crate::expr::zip_left`]
    /// and [`crate::expr::zip_right`].
    Zip {
        left: Arc<BufferInner>,
        right: Arc<BufferInner>,
        combine: ScalarExpr,
    },
}

/// One query operator. Chains are linear and acyclic by construction.
#[derive(Debug, Clone)]
pub(crate) enum Operator {
    /// Element-wise transform; the expression's `elem()` is the current value.
    Map(ScalarExpr),
    /// Keep elements whose predicate holds; preserves relative order.
    Filter(ScalarExpr),
    /// Named binding, scoped to all downstream operators, evaluated exactly
    /// once per element in declaration order.
    Let(String, ScalarExpr),
}

/// A data-parallel pipeline over a device-resident source.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) source: QuerySource,
    pub(crate) ops: Vec<Operator>,
}

impl Query {
    pub(crate) fn from_source(source: QuerySource) -> Self {
        Self {
            source,
            ops: Vec::new(),
        }
    }

    /// Pairwise combination of two arrays. Fails with
    /// [`Error::MismatchedLength`] before any device work if the element
    /// counts differ.
    pub fn zip<A: DeviceElement, B: DeviceElement>(
        left: &ArrayHandle<A>,
        right: &ArrayHandle<B>,
        combine: ScalarExpr,
    ) -> Result<Query> {
        if left.len() != right.len() {
            return Err(Error::MismatchedLength {
                left: left.len(),
                right: right.len(),
            });
        }
        Ok(Query::from_source(QuerySource::Zip {
            left: left.inner.clone(),
            right: right.inner.clone(),
            combine,
        }))
    }

    /// Element-wise transform.
    pub fn select(mut self, expr: ScalarExpr) -> Self {
        self.ops.push(Operator::Map(expr));
        self
    }

    /// Order-preserving filter.
    pub fn filter(mut self, predicate: ScalarExpr) -> Self {
        self.ops.push(Operator::Filter(predicate));
        self
    }

    /// Introduce a named per-element binding, visible to all downstream
    /// operators. Later bindings may reference earlier ones by name, never
    /// themselves or later ones.
    pub fn let_binding(mut self, name: &str, expr: ScalarExpr) -> Self {
        self.ops.push(Operator::Let(name.to_string(), expr));
        self
    }

    /// Sum aggregation over the (possibly filtered) element stream.
    pub fn sum(self) -> Reduction {
        Reduction {
            query: self,
            kind: ReduceKind::Sum,
        }
    }

    /// Count of elements surviving the pipeline. Result type is i32.
    pub fn count(self) -> Reduction {
        Reduction {
            query: self,
            kind: ReduceKind::Count,
        }
    }
}

/// Reduction operator. Sum and Count are associative and commutative, which
/// the parallel combine order requires; any added kind must be too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Sum,
    Count,
}

/// A terminal aggregation over a query pipeline, executed by
/// [`crate::Context::reduce`].
#[derive(Debug, Clone)]
pub struct Reduction {
    pub(crate) query: Query,
    pub(crate) kind: ReduceKind,
}
