//! Fusion planner: operator chain → fused kernel plan.
//!
//! Walks the chain keeping a running per-element expression. Consecutive
//! `Map`/`Let`/`Filter` operators fold into that expression context without
//! materializing intermediates; a terminal reduction folds the (optional)
//! predicate into its combine input. The result is one [`KernelPlan`]:
//! everything the code generator and executor need, plus a structural
//! [`PlanSignature`] used as the kernel-cache key.
//!
//! Captured host constants are hoisted into a deduplicated ordered argument
//! list (constant lifting), so plans differing only in captured values
//! share one compiled kernel. Auxiliary buffers referenced by indexed reads
//! are deduplicated by buffer identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::buffers::BufferInner;
use crate::error::{Error, Result};
use crate::expr::{
    elem, lit_i32, ConstValue, ElementSchema, Expr, MathFn, ScalarExpr, ScalarType,
};
use crate::query::{Operator, Query, QuerySource, ReduceKind, Reduction};

/// Pipeline shape, deciding the execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlanShape {
    /// One output element per input element; single pass.
    Map,
    /// Output cardinality differs from input: mask → scan → scatter.
    FilterMap,
    /// Scalar aggregate: partial tree reduction → final combine.
    Reduce(ReduceKind),
}

/// The fused input source.
#[derive(Debug, Clone)]
pub(crate) enum PlanSource {
    Single(Arc<BufferInner>),
    Zip(Arc<BufferInner>, Arc<BufferInner>),
}

impl PlanSource {
    pub(crate) fn input_len(&self) -> usize {
        match self {
            PlanSource::Single(b) => b.len,
            PlanSource::Zip(l, _) => l.len,
        }
    }

    pub(crate) fn buffers(&self) -> Vec<&Arc<BufferInner>> {
        match self {
            PlanSource::Single(b) => vec![b],
            PlanSource::Zip(l, r) => vec![l, r],
        }
    }
}

/// The fused representation of one pipeline: per-element bindings in
/// declaration order, a final value expression, an optional predicate, the
/// lifted constants, and the auxiliary buffers.
#[derive(Debug)]
pub(crate) struct KernelPlan {
    pub shape: PlanShape,
    pub source: PlanSource,
    pub bindings: Vec<(String, ScalarExpr)>,
    pub value: ScalarExpr,
    pub predicate: Option<ScalarExpr>,
    pub constants: Vec<ConstValue>,
    pub aux: Vec<Arc<BufferInner>>,
    pub out_schema: ElementSchema,
    pub signature: PlanSignature,
}

impl KernelPlan {
    pub(crate) fn input_len(&self) -> usize {
        self.source.input_len()
    }

    /// Slot of a lifted constant (dedup by type + bit pattern).
    pub(crate) fn const_slot(&self, value: ConstValue) -> Option<usize> {
        self.constants.iter().position(|c| *c == value)
    }

    /// Slot of an auxiliary buffer (dedup by identity).
    pub(crate) fn aux_slot(&self, id: u64) -> Option<usize> {
        self.aux.iter().position(|b| b.id == id)
    }

    /// Words in the params uniform: element count + constants, padded to a
    /// 16-byte multiple.
    pub(crate) fn params_word_count(&self) -> usize {
        let used = 1 + self.constants.len();
        used.div_ceil(4) * 4
    }
}

/// Structural cache key: sensitive to operator identity, type, and
/// structure; blind to constant values and buffer identities. Keying the
/// cache map by this value type (not a precomputed hash) means hash
/// collisions fall back to full structural comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PlanSignature(Vec<u64>);

/// Build the plan for a materializing terminal (`run`/`fill`).
pub(crate) fn build_materialize(query: &Query) -> Result<KernelPlan> {
    build(query, None)
}

/// Build the plan for a reduction terminal.
pub(crate) fn build_reduce(reduction: &Reduction) -> Result<KernelPlan> {
    build(&reduction.query, Some(reduction.kind))
}

fn build(query: &Query, reduce: Option<ReduceKind>) -> Result<KernelPlan> {
    // Resolve the source and the initial running expression.
    let (source, mut current) = match &query.source {
        QuerySource::Array(buf) => {
            if buf.is_disposed() {
                return Err(Error::DisposedResource("query source"));
            }
            (PlanSource::Single(buf.clone()), elem())
        }
        QuerySource::Zip {
            left,
            right,
            combine,
        } => {
            if left.is_disposed() || right.is_disposed() {
                return Err(Error::DisposedResource("zip operand"));
            }
            if left.len != right.len {
                return Err(Error::MismatchedLength {
                    left: left.len,
                    right: right.len,
                });
            }
            (PlanSource::Zip(left.clone(), right.clone()), combine.clone())
        }
    };

    // Fold the chain into (bindings, predicate, value).
    let mut bindings: Vec<(String, ScalarExpr)> = Vec::new();
    let mut declared: HashSet<String> = HashSet::new();
    let mut predicate: Option<ScalarExpr> = None;

    for op in &query.ops {
        match op {
            Operator::Map(e) => {
                let fused = subst_element(e, &current);
                check_binding_refs(&fused, &declared)?;
                current = fused;
            }
            Operator::Filter(p) => {
                let fused = subst_element(p, &current);
                check_binding_refs(&fused, &declared)?;
                predicate = Some(match predicate.take() {
                    Some(prev) => prev.and(fused),
                    None => fused,
                });
            }
            Operator::Let(name, e) => {
                if declared.contains(name) {
                    return Err(Error::UnsupportedOperator(format!(
                        "duplicate let binding '{name}'"
                    )));
                }
                let fused = subst_element(e, &current);
                // Declaration order: only earlier bindings are in scope, so
                // forward and self references are rejected here.
                check_binding_refs(&fused, &declared)?;
                declared.insert(name.clone());
                bindings.push((name.clone(), fused));
            }
        }
    }

    // Terminal.
    let (shape, value) = match reduce {
        None => {
            let shape = if predicate.is_some() {
                PlanShape::FilterMap
            } else {
                PlanShape::Map
            };
            (shape, current)
        }
        Some(ReduceKind::Sum) => (PlanShape::Reduce(ReduceKind::Sum), current),
        // Count reduces `1` per surviving element; the predicate gates it.
        Some(ReduceKind::Count) => (PlanShape::Reduce(ReduceKind::Count), lit_i32(1)),
    };

    // Type inference over the fused plan, in evaluation order.
    let mut env = TypeEnv::new(&source);
    for (name, e) in &bindings {
        let ty = infer(e, &env)?;
        env.bindings.insert(name.clone(), ty);
    }
    if let Some(p) = &predicate {
        let ty = infer(p, &env)?;
        if ty != ElementSchema::Scalar(ScalarType::Bool) {
            return Err(Error::Schema(format!(
                "filter predicate must be bool, got {}",
                ty.describe()
            )));
        }
    }
    let out_schema = infer(&value, &env)?;
    match shape {
        PlanShape::Reduce(_) => {
            if !matches!(
                out_schema,
                ElementSchema::Scalar(ScalarType::I32) | ElementSchema::Scalar(ScalarType::F32)
            ) {
                return Err(Error::UnsupportedOperator(format!(
                    "reduction over non-numeric element type {}",
                    out_schema.describe()
                )));
            }
        }
        _ => out_schema.validate()?,
    }

    // Single traversal assigns constant and aux slots and writes the
    // structural signature.
    let mut enc = SigEncoder::new(&bindings);
    enc.push(match shape {
        PlanShape::Map => 1,
        PlanShape::FilterMap => 2,
        PlanShape::Reduce(ReduceKind::Sum) => 3,
        PlanShape::Reduce(ReduceKind::Count) => 4,
    });
    match &source {
        PlanSource::Single(b) => {
            enc.push(10);
            enc.push_schema(&b.schema);
        }
        PlanSource::Zip(l, r) => {
            enc.push(11);
            enc.push_schema(&l.schema);
            enc.push_schema(&r.schema);
        }
    }
    enc.push(bindings.len() as u64);
    for (_, e) in &bindings {
        enc.encode(e)?;
    }
    match &predicate {
        Some(p) => {
            enc.push(1);
            enc.encode(p)?;
        }
        None => enc.push(0),
    }
    enc.encode(&value)?;

    let SigEncoder {
        constants,
        aux,
        toks,
        ..
    } = enc;

    for a in &aux {
        if a.is_disposed() {
            return Err(Error::DisposedResource("indexed buffer"));
        }
    }

    Ok(KernelPlan {
        shape,
        source,
        bindings,
        value,
        predicate,
        constants,
        aux,
        out_schema,
        signature: PlanSignature(toks),
    })
}

// ── element substitution ────────────────────────────────────────────────

fn contains_element(e: &ScalarExpr) -> bool {
    match &*e.node {
        Expr::Element => true,
        Expr::ZipLeft | Expr::ZipRight | Expr::Binding(_) | Expr::Constant(_) => false,
        Expr::Field(inner, _) | Expr::Not(inner) | Expr::Cast(_, inner) => {
            contains_element(inner)
        }
        Expr::Binary(_, l, r) => contains_element(l) || contains_element(r),
        Expr::MakeStruct(_, fields) => fields.iter().any(contains_element),
        Expr::Math(_, args) => args.iter().any(contains_element),
        Expr::IndexRead(_, idx) => contains_element(idx),
    }
}

/// Replace `Element` with the running expression. Subtrees without an
/// element reference are shared, not copied.
fn subst_element(e: &ScalarExpr, current: &ScalarExpr) -> ScalarExpr {
    if !contains_element(e) {
        return e.clone();
    }
    match &*e.node {
        Expr::Element => current.clone(),
        Expr::Field(inner, name) => ScalarExpr::new(Expr::Field(
            subst_element(inner, current),
            name.clone(),
        )),
        Expr::Not(inner) => ScalarExpr::new(Expr::Not(subst_element(inner, current))),
        Expr::Cast(ty, inner) => {
            ScalarExpr::new(Expr::Cast(*ty, subst_element(inner, current)))
        }
        Expr::Binary(op, l, r) => ScalarExpr::new(Expr::Binary(
            *op,
            subst_element(l, current),
            subst_element(r, current),
        )),
        Expr::MakeStruct(schema, fields) => ScalarExpr::new(Expr::MakeStruct(
            schema.clone(),
            fields.iter().map(|f| subst_element(f, current)).collect(),
        )),
        Expr::Math(f, args) => ScalarExpr::new(Expr::Math(
            *f,
            args.iter().map(|a| subst_element(a, current)).collect(),
        )),
        Expr::IndexRead(aux, idx) => ScalarExpr::new(Expr::IndexRead(
            aux.clone(),
            subst_element(idx, current),
        )),
        // Leaves handled by the contains_element fast path above.
        Expr::ZipLeft | Expr::ZipRight | Expr::Binding(_) | Expr::Constant(_) => e.clone(),
    }
}

/// Reject references to bindings not yet declared (forward, self, or
/// unknown references).
fn check_binding_refs(e: &ScalarExpr, declared: &HashSet<String>) -> Result<()> {
    match &*e.node {
        Expr::Binding(name) => {
            if declared.contains(name) {
                Ok(())
            } else {
                Err(Error::UnsupportedOperator(format!(
                    "reference to undeclared binding '{name}'"
                )))
            }
        }
        Expr::Element | Expr::ZipLeft | Expr::ZipRight | Expr::Constant(_) => Ok(()),
        Expr::Field(inner, _) | Expr::Not(inner) | Expr::Cast(_, inner) => {
            check_binding_refs(inner, declared)
        }
        Expr::Binary(_, l, r) => {
            check_binding_refs(l, declared)?;
            check_binding_refs(r, declared)
        }
        Expr::MakeStruct(_, fields) => {
            fields.iter().try_for_each(|f| check_binding_refs(f, declared))
        }
        Expr::Math(_, args) => args.iter().try_for_each(|a| check_binding_refs(a, declared)),
        Expr::IndexRead(_, idx) => check_binding_refs(idx, declared),
    }
}

// ── type inference ──────────────────────────────────────────────────────

struct TypeEnv<'a> {
    source: &'a PlanSource,
    bindings: HashMap<String, ElementSchema>,
}

impl<'a> TypeEnv<'a> {
    fn new(source: &'a PlanSource) -> Self {
        Self {
            source,
            bindings: HashMap::new(),
        }
    }
}

fn scalar_of(ty: &ElementSchema, what: &str) -> Result<ScalarType> {
    match ty {
        ElementSchema::Scalar(t) => Ok(*t),
        ElementSchema::Struct(s) => Err(Error::Schema(format!(
            "{what} requires a scalar operand, got struct {}",
            s.name
        ))),
    }
}

fn infer(e: &ScalarExpr, env: &TypeEnv) -> Result<ElementSchema> {
    match &*e.node {
        Expr::Element => match env.source {
            PlanSource::Single(b) => Ok(b.schema.clone()),
            PlanSource::Zip(..) => Err(Error::UnsupportedOperator(
                "elem() inside a zip combine expression; use zip_left()/zip_right()".to_string(),
            )),
        },
        Expr::ZipLeft => match env.source {
            PlanSource::Zip(l, _) => Ok(l.schema.clone()),
            PlanSource::Single(_) => Err(Error::UnsupportedOperator(
                "zip_left() outside a zip pipeline".to_string(),
            )),
        },
        Expr::ZipRight => match env.source {
            PlanSource::Zip(_, r) => Ok(r.schema.clone()),
            PlanSource::Single(_) => Err(Error::UnsupportedOperator(
                "zip_right() outside a zip pipeline".to_string(),
            )),
        },
        Expr::Binding(name) => env.bindings.get(name).cloned().ok_or_else(|| {
            Error::UnsupportedOperator(format!("reference to undeclared binding '{name}'"))
        }),
        Expr::Constant(c) => Ok(ElementSchema::Scalar(c.scalar_type())),
        Expr::Field(inner, name) => match infer(inner, env)? {
            ElementSchema::Struct(s) => match s.field_index(name) {
                Some(i) => Ok(ElementSchema::Scalar(s.fields[i].ty)),
                None => Err(Error::Schema(format!(
                    "struct {} has no field '{name}'",
                    s.name
                ))),
            },
            other => Err(Error::Schema(format!(
                "field access '{name}' on non-struct {}",
                other.describe()
            ))),
        },
        Expr::MakeStruct(schema, fields) => {
            schema.validate()?;
            if fields.len() != schema.fields.len() {
                return Err(Error::Schema(format!(
                    "struct {} has {} fields, {} given",
                    schema.name,
                    schema.fields.len(),
                    fields.len()
                )));
            }
            for (f, def) in fields.iter().zip(&schema.fields) {
                let got = scalar_of(&infer(f, env)?, "struct field")?;
                if got != def.ty {
                    return Err(Error::Schema(format!(
                        "struct {} field {} expects {}, got {}",
                        schema.name,
                        def.name,
                        def.ty.wgsl(),
                        got.wgsl()
                    )));
                }
            }
            Ok(ElementSchema::Struct(schema.clone()))
        }
        Expr::Binary(op, l, r) => {
            let lt = scalar_of(&infer(l, env)?, "binary operator")?;
            let rt = scalar_of(&infer(r, env)?, "binary operator")?;
            if lt != rt {
                return Err(Error::Schema(format!(
                    "operand type mismatch: {} {} {}",
                    lt.wgsl(),
                    op.wgsl(),
                    rt.wgsl()
                )));
            }
            if op.is_arith() {
                if !lt.is_numeric() {
                    return Err(Error::Schema(format!(
                        "arithmetic '{}' on {}",
                        op.wgsl(),
                        lt.wgsl()
                    )));
                }
                Ok(ElementSchema::Scalar(lt))
            } else if op.is_compare() {
                if !lt.is_numeric() {
                    return Err(Error::Schema(format!(
                        "comparison '{}' on {}",
                        op.wgsl(),
                        lt.wgsl()
                    )));
                }
                Ok(ElementSchema::Scalar(ScalarType::Bool))
            } else {
                // And / Or
                if lt != ScalarType::Bool {
                    return Err(Error::Schema(format!(
                        "logic '{}' on {}",
                        op.wgsl(),
                        lt.wgsl()
                    )));
                }
                Ok(ElementSchema::Scalar(ScalarType::Bool))
            }
        }
        Expr::Not(inner) => {
            let t = scalar_of(&infer(inner, env)?, "not")?;
            if t != ScalarType::Bool {
                return Err(Error::Schema(format!("not on {}", t.wgsl())));
            }
            Ok(ElementSchema::Scalar(ScalarType::Bool))
        }
        Expr::Math(f, args) => {
            if args.len() != f.arity() {
                return Err(Error::UnsupportedOperator(format!(
                    "{} takes {} argument(s), {} given",
                    f.wgsl(),
                    f.arity(),
                    args.len()
                )));
            }
            let mut tys = Vec::with_capacity(args.len());
            for a in args {
                tys.push(scalar_of(&infer(a, env)?, f.wgsl())?);
            }
            if tys.windows(2).any(|w| w[0] != w[1]) {
                return Err(Error::Schema(format!(
                    "{} argument type mismatch",
                    f.wgsl()
                )));
            }
            match f {
                // abs/min/max work on both numeric scalar types
                MathFn::Abs | MathFn::Min | MathFn::Max => {
                    if !tys[0].is_numeric() {
                        return Err(Error::Schema(format!("{} on {}", f.wgsl(), tys[0].wgsl())));
                    }
                    Ok(ElementSchema::Scalar(tys[0]))
                }
                _ => {
                    if tys[0] != ScalarType::F32 {
                        return Err(Error::Schema(format!(
                            "{} requires f32 arguments, got {}",
                            f.wgsl(),
                            tys[0].wgsl()
                        )));
                    }
                    Ok(ElementSchema::Scalar(ScalarType::F32))
                }
            }
        }
        Expr::Cast(to, inner) => {
            let from = scalar_of(&infer(inner, env)?, "cast")?;
            if !from.is_numeric() || !to.is_numeric() {
                return Err(Error::Schema(format!(
                    "cast {} -> {}",
                    from.wgsl(),
                    to.wgsl()
                )));
            }
            Ok(ElementSchema::Scalar(*to))
        }
        Expr::IndexRead(aux, idx) => {
            let it = scalar_of(&infer(idx, env)?, "index")?;
            if it != ScalarType::I32 {
                return Err(Error::Schema(format!(
                    "buffer index must be i32, got {}",
                    it.wgsl()
                )));
            }
            Ok(aux.0.schema.clone())
        }
    }
}

// ── signature encoding + argument slot assignment ───────────────────────

struct SigEncoder<'a> {
    toks: Vec<u64>,
    constants: Vec<ConstValue>,
    aux: Vec<Arc<BufferInner>>,
    binding_order: HashMap<&'a str, usize>,
}

impl<'a> SigEncoder<'a> {
    fn new(bindings: &'a [(String, ScalarExpr)]) -> Self {
        let binding_order = bindings
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (n.as_str(), i))
            .collect();
        Self {
            toks: Vec::new(),
            constants: Vec::new(),
            aux: Vec::new(),
            binding_order,
        }
    }

    fn push(&mut self, tok: u64) {
        self.toks.push(tok);
    }

    fn push_schema(&mut self, schema: &ElementSchema) {
        match schema {
            ElementSchema::Scalar(t) => {
                self.push(20);
                self.push(scalar_tag(*t));
            }
            ElementSchema::Struct(s) => {
                self.push(21);
                self.push(s.fields.len() as u64);
                for f in &s.fields {
                    self.push(scalar_tag(f.ty));
                    // Field names decide the name→offset mapping, so two
                    // layouts with the same types in a different field order
                    // must not share a kernel.
                    self.push_str(&f.name);
                }
            }
        }
    }

    /// Push a string as its exact bytes: a length token, then the bytes
    /// packed little-endian into 8-byte words. The signature is the cache
    /// key's `Eq`, so equal signatures must imply equal structure — a
    /// digest here would compare hashes instead.
    fn push_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        self.push(bytes.len() as u64);
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.push(u64::from_le_bytes(word));
        }
    }

    /// Encode an expression's structure, assigning constant and aux slots
    /// in traversal order. Constant *values* never enter the signature —
    /// only their type and slot — so structurally identical plans share a
    /// kernel regardless of captured values.
    fn encode(&mut self, e: &ScalarExpr) -> Result<()> {
        match &*e.node {
            Expr::Element => self.push(30),
            Expr::ZipLeft => self.push(31),
            Expr::ZipRight => self.push(32),
            Expr::Binding(name) => {
                let idx = *self.binding_order.get(name.as_str()).ok_or_else(|| {
                    Error::UnsupportedOperator(format!(
                        "reference to undeclared binding '{name}'"
                    ))
                })?;
                self.push(33);
                self.push(idx as u64);
            }
            Expr::Constant(c) => {
                let slot = match self.constants.iter().position(|k| k == c) {
                    Some(i) => i,
                    None => {
                        self.constants.push(*c);
                        self.constants.len() - 1
                    }
                };
                self.push(34);
                self.push(scalar_tag(c.scalar_type()));
                self.push(slot as u64);
            }
            Expr::Field(inner, name) => {
                // Field names resolve to word offsets at codegen time, so the
                // name is structure and must enter the signature.
                self.push(35);
                self.encode(inner)?;
                self.push_str(name);
            }
            Expr::MakeStruct(schema, fields) => {
                self.push(36);
                self.push_schema(&ElementSchema::Struct(schema.clone()));
                for f in fields {
                    self.encode(f)?;
                }
            }
            Expr::Binary(op, l, r) => {
                self.push(37);
                self.push(*op as u64);
                self.encode(l)?;
                self.encode(r)?;
            }
            Expr::Not(inner) => {
                self.push(38);
                self.encode(inner)?;
            }
            Expr::Math(f, args) => {
                self.push(39);
                self.push(*f as u64);
                self.push(args.len() as u64);
                for a in args {
                    self.encode(a)?;
                }
            }
            Expr::Cast(ty, inner) => {
                self.push(40);
                self.push(scalar_tag(*ty));
                self.encode(inner)?;
            }
            Expr::IndexRead(aux, idx) => {
                let slot = match self.aux.iter().position(|b| b.id == aux.0.id) {
                    Some(i) => i,
                    None => {
                        self.aux.push(aux.0.clone());
                        self.aux.len() - 1
                    }
                };
                self.push(41);
                self.push(slot as u64);
                self.push_schema(&aux.0.schema);
                self.encode(idx)?;
            }
        }
        Ok(())
    }
}

fn scalar_tag(t: ScalarType) -> u64 {
    match t {
        ScalarType::I32 => 0,
        ScalarType::F32 => 1,
        ScalarType::Bool => 2,
    }
}
