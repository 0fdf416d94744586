//! WGSL generation for fused kernel plans.
//!
//! Every storage buffer is declared `array<u32>` and accessed through
//! `bitcast`, so one binding scheme covers i32, f32, and packed structs
//! uniformly; a struct element is its fields at consecutive word offsets.
//! Expression emission is let-per-node: each DAG node becomes one `let`
//! (one per field for struct-valued nodes), which keeps generated source
//! diffable and makes device compiler diagnostics traceable.
//!
//! Entry points by shape:
//!   Map       → `map_main`
//!   FilterMap → `mask_main` + `scatter_main` (the scan between them is the
//!               plan-independent module from [`scan_source`])
//!   Reduce    → `reduce_partial` + `reduce_final`

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::expr::{ElementSchema, Expr, ScalarExpr, ScalarType, StructSchema};
use crate::plan::{KernelPlan, PlanShape, PlanSource};
use crate::query::ReduceKind;

pub(crate) const WORKGROUP_SIZE: u32 = 256;

/// Binding index assignment shared between generation, bind group layout
/// creation, and bind group creation. Group 0 only:
///
/// ```text
/// 0                 params uniform (element count + lifted constants)
/// 1 .. srcs         source element buffers
/// .. + aux          auxiliary (indexed-read) buffers
/// then, per shape:
///   Map:       out
///   FilterMap: flags, scanned, out
///   Reduce:    partials, result, final params uniform
/// ```
#[derive(Debug, Clone, Copy)]
pub(crate) struct BindingManifest {
    pub srcs: usize,
    pub aux: usize,
}

impl BindingManifest {
    pub(crate) fn of(plan: &KernelPlan) -> Self {
        Self {
            srcs: match plan.source {
                PlanSource::Single(_) => 1,
                PlanSource::Zip(..) => 2,
            },
            aux: plan.aux.len(),
        }
    }

    pub(crate) fn src(self, i: usize) -> u32 {
        1 + i as u32
    }

    pub(crate) fn aux_binding(self, j: usize) -> u32 {
        1 + (self.srcs + j) as u32
    }

    /// First shape-specific binding index.
    pub(crate) fn shape_base(self) -> u32 {
        1 + (self.srcs + self.aux) as u32
    }
}

/// Number of words in the params uniform for `k` lifted constants.
pub(crate) fn params_words(constant_count: usize) -> usize {
    (1 + constant_count).div_ceil(4) * 4
}

/// Generate the WGSL module for one plan.
pub(crate) fn generate(plan: &KernelPlan) -> Result<String> {
    let manifest = BindingManifest::of(plan);
    let mut src = String::new();

    emit_params_struct(&mut src, plan.constants.len());

    for i in 0..manifest.srcs {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read> src{i}: array<u32>;",
            manifest.src(i)
        );
    }
    for j in 0..manifest.aux {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read> aux{j}: array<u32>;",
            manifest.aux_binding(j)
        );
    }
    let base = manifest.shape_base();
    match plan.shape {
        PlanShape::Map => {
            let _ = writeln!(
                src,
                "@group(0) @binding({base}) var<storage, read_write> out: array<u32>;"
            );
        }
        PlanShape::FilterMap => {
            let _ = writeln!(
                src,
                "@group(0) @binding({base}) var<storage, read_write> flags: array<u32>;"
            );
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read> scanned: array<u32>;",
                base + 1
            );
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read_write> out: array<u32>;",
                base + 2
            );
        }
        PlanShape::Reduce(_) => {
            let _ = writeln!(
                src,
                "@group(0) @binding({base}) var<storage, read_write> partials: array<u32>;"
            );
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read_write> result: array<u32>;",
                base + 1
            );
            let _ = writeln!(src, "struct FinalParams {{ m: u32, _p0: u32, _p1: u32, _p2: u32 }}");
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<uniform> final_params: FinalParams;",
                base + 2
            );
        }
    }
    src.push('\n');

    match plan.shape {
        PlanShape::Map => emit_map(&mut src, plan)?,
        PlanShape::FilterMap => emit_filter_map(&mut src, plan)?,
        PlanShape::Reduce(kind) => emit_reduce(&mut src, plan, kind)?,
    }

    Ok(src)
}

fn emit_params_struct(src: &mut String, constant_count: usize) {
    let words = params_words(constant_count);
    src.push_str("struct Params {\n    n: u32,\n");
    for k in 0..constant_count {
        let _ = writeln!(src, "    c{k}: u32,");
    }
    for p in 0..(words - 1 - constant_count) {
        let _ = writeln!(src, "    _pad{p}: u32,");
    }
    src.push_str("}\n@group(0) @binding(0) var<uniform> params: Params;\n");
}

// ── entry points ────────────────────────────────────────────────────────

fn emit_map(src: &mut String, plan: &KernelPlan) -> Result<()> {
    let _ = writeln!(
        src,
        "@compute @workgroup_size({WORKGROUP_SIZE})\nfn map_main(@builtin(global_invocation_id) gid: vec3<u32>) {{"
    );
    src.push_str("    let i = gid.x;\n    if (i >= params.n) { return; }\n");
    let mut em = Emitter::new(plan);
    em.emit_prelude()?;
    let value = em.emit(&plan.value)?;
    em.store_element(&value, "out", "i")?;
    src.push_str(&em.body);
    src.push_str("}\n");
    Ok(())
}

fn emit_filter_map(src: &mut String, plan: &KernelPlan) -> Result<()> {
    let predicate = plan
        .predicate
        .as_ref()
        .ok_or_else(|| Error::UnsupportedOperator("compaction without predicate".to_string()))?;

    let _ = writeln!(
        src,
        "@compute @workgroup_size({WORKGROUP_SIZE})\nfn mask_main(@builtin(global_invocation_id) gid: vec3<u32>) {{"
    );
    src.push_str("    let i = gid.x;\n    if (i >= params.n) { return; }\n");
    let mut em = Emitter::new(plan);
    em.emit_prelude()?;
    let pred = em.emit(predicate)?;
    let _ = writeln!(em.body, "    flags[i] = u32({});", pred.scalar_name()?);
    src.push_str(&em.body);
    src.push_str("}\n\n");

    let _ = writeln!(
        src,
        "@compute @workgroup_size({WORKGROUP_SIZE})\nfn scatter_main(@builtin(global_invocation_id) gid: vec3<u32>) {{"
    );
    src.push_str("    let i = gid.x;\n    if (i >= params.n) { return; }\n");
    src.push_str("    if (flags[i] == 0u) { return; }\n");
    let mut em = Emitter::new(plan);
    em.emit_prelude()?;
    let value = em.emit(&plan.value)?;
    // Inclusive scan: the output slot of a surviving element is its rank - 1.
    em.body.push_str("    let pos = scanned[i] - 1u;\n");
    em.store_element(&value, "out", "pos")?;
    src.push_str(&em.body);
    src.push_str("}\n");
    Ok(())
}

fn emit_reduce(src: &mut String, plan: &KernelPlan, kind: ReduceKind) -> Result<()> {
    let ty = match &plan.out_schema {
        ElementSchema::Scalar(t) => *t,
        ElementSchema::Struct(_) => {
            return Err(Error::UnsupportedOperator(
                "reduction over struct elements".to_string(),
            ))
        }
    };
    let wty = ty.wgsl();
    let identity = match ty {
        ScalarType::I32 => "0",
        ScalarType::F32 => "0.0",
        ScalarType::Bool => {
            return Err(Error::UnsupportedOperator(
                "reduction over bool".to_string(),
            ))
        }
    };
    let _ = kind; // Sum and Count share the combine; Count's value is the gated 1.

    let _ = writeln!(
        src,
        "var<workgroup> part: array<{wty}, {WORKGROUP_SIZE}u>;"
    );
    src.push('\n');

    // Per-workgroup partial: gated load, then a shared-memory halving tree.
    // Out-of-range and predicate-failing lanes contribute the identity, so
    // every lane reaches the barriers.
    let _ = writeln!(
        src,
        "@compute @workgroup_size({WORKGROUP_SIZE})\nfn reduce_partial(@builtin(global_invocation_id) gid: vec3<u32>,\n                  @builtin(local_invocation_id) lid: vec3<u32>,\n                  @builtin(workgroup_id) wid: vec3<u32>) {{"
    );
    src.push_str("    let i = gid.x;\n");
    let _ = writeln!(src, "    var acc: {wty} = {identity};");
    src.push_str("    if (i < params.n) {\n");
    let mut em = Emitter::new(plan);
    em.indent = 2;
    em.emit_prelude()?;
    match &plan.predicate {
        Some(p) => {
            let pred = em.emit(p)?;
            let value = em.emit(&plan.value)?;
            let _ = writeln!(
                em.body,
                "        if ({}) {{ acc = {}; }}",
                pred.scalar_name()?,
                value.scalar_name()?
            );
        }
        None => {
            let value = em.emit(&plan.value)?;
            let _ = writeln!(em.body, "        acc = {};", value.scalar_name()?);
        }
    }
    src.push_str(&em.body);
    src.push_str("    }\n");
    src.push_str("    part[lid.x] = acc;\n    workgroupBarrier();\n");
    let _ = writeln!(src, "    var stride = {}u;", WORKGROUP_SIZE / 2);
    src.push_str(
        "    loop {\n        if (stride == 0u) { break; }\n        if (lid.x < stride) { part[lid.x] = part[lid.x] + part[lid.x + stride]; }\n        workgroupBarrier();\n        stride = stride / 2u;\n    }\n",
    );
    let _ = writeln!(
        src,
        "    if (lid.x == 0u) {{ partials[wid.x] = bitcast<u32>(part[0u]); }}"
    );
    src.push_str("}\n\n");

    // Final combine in one workgroup: grid-stride accumulate, then the tree.
    let _ = writeln!(
        src,
        "@compute @workgroup_size({WORKGROUP_SIZE})\nfn reduce_final(@builtin(local_invocation_id) lid: vec3<u32>) {{"
    );
    let _ = writeln!(src, "    var acc: {wty} = {identity};");
    src.push_str("    var j = lid.x;\n    loop {\n        if (j >= final_params.m) { break; }\n");
    let _ = writeln!(src, "        acc = acc + bitcast<{wty}>(partials[j]);");
    let _ = writeln!(src, "        j = j + {WORKGROUP_SIZE}u;");
    src.push_str("    }\n");
    src.push_str("    part[lid.x] = acc;\n    workgroupBarrier();\n");
    let _ = writeln!(src, "    var stride = {}u;", WORKGROUP_SIZE / 2);
    src.push_str(
        "    loop {\n        if (stride == 0u) { break; }\n        if (lid.x < stride) { part[lid.x] = part[lid.x] + part[lid.x + stride]; }\n        workgroupBarrier();\n        stride = stride / 2u;\n    }\n",
    );
    src.push_str("    if (lid.x == 0u) { result[0u] = bitcast<u32>(part[0u]); }\n");
    src.push_str("}\n");
    Ok(())
}

// ── expression emission ─────────────────────────────────────────────────

/// An emitted value: a named scalar `let`, or a struct represented as one
/// `let` per field named `{base}_f{index}`.
#[derive(Debug, Clone)]
enum EmittedVal {
    Scalar(String, ScalarType),
    Struct(String, StructSchema),
}

impl EmittedVal {
    fn scalar_name(&self) -> Result<&str> {
        match self {
            EmittedVal::Scalar(name, _) => Ok(name),
            EmittedVal::Struct(_, s) => Err(Error::Schema(format!(
                "scalar expected, got struct {}",
                s.name
            ))),
        }
    }

    fn scalar_type(&self) -> Result<ScalarType> {
        match self {
            EmittedVal::Scalar(_, t) => Ok(*t),
            EmittedVal::Struct(_, s) => Err(Error::Schema(format!(
                "scalar expected, got struct {}",
                s.name
            ))),
        }
    }
}

struct Emitter<'a> {
    plan: &'a KernelPlan,
    body: String,
    tmp: usize,
    indent: usize,
    element: Option<EmittedVal>,
    zip_left: Option<EmittedVal>,
    zip_right: Option<EmittedVal>,
    bindings: HashMap<&'a str, EmittedVal>,
}

impl<'a> Emitter<'a> {
    fn new(plan: &'a KernelPlan) -> Self {
        Self {
            plan,
            body: String::new(),
            tmp: 0,
            indent: 1,
            element: None,
            zip_left: None,
            zip_right: None,
            bindings: HashMap::new(),
        }
    }

    fn pad(&self) -> String {
        "    ".repeat(self.indent)
    }

    fn fresh(&mut self) -> String {
        let name = format!("t{}", self.tmp);
        self.tmp += 1;
        name
    }

    fn let_scalar(&mut self, ty: ScalarType, rhs: &str) -> EmittedVal {
        let name = self.fresh();
        let _ = writeln!(self.body, "{}let {name}: {} = {rhs};", self.pad(), ty.wgsl());
        EmittedVal::Scalar(name, ty)
    }

    /// Load one element of `arr` (a `array<u32>` binding) at element index
    /// `idx` (a u32 expression) with the given schema.
    fn load_element(
        &mut self,
        arr: &str,
        idx: &str,
        schema: &ElementSchema,
        base: &str,
    ) -> Result<EmittedVal> {
        match schema {
            ElementSchema::Scalar(t) => {
                let _ = writeln!(
                    self.body,
                    "{}let {base}: {} = bitcast<{}>({arr}[{idx}]);",
                    self.pad(),
                    t.wgsl(),
                    t.wgsl()
                );
                Ok(EmittedVal::Scalar(base.to_string(), *t))
            }
            ElementSchema::Struct(s) => {
                let words = s.fields.len();
                for (w, f) in s.fields.iter().enumerate() {
                    let _ = writeln!(
                        self.body,
                        "{}let {base}_f{w}: {} = bitcast<{}>({arr}[{idx} * {words}u + {w}u]);",
                        self.pad(),
                        f.ty.wgsl(),
                        f.ty.wgsl()
                    );
                }
                Ok(EmittedVal::Struct(base.to_string(), s.clone()))
            }
        }
    }

    /// Store a value into `arr` at element index `idx` (a u32 expression).
    fn store_element(&mut self, value: &EmittedVal, arr: &str, idx: &str) -> Result<()> {
        match value {
            EmittedVal::Scalar(name, _) => {
                let _ = writeln!(
                    self.body,
                    "{}{arr}[{idx}] = bitcast<u32>({name});",
                    self.pad()
                );
            }
            EmittedVal::Struct(base, s) => {
                let words = s.fields.len();
                for w in 0..words {
                    let _ = writeln!(
                        self.body,
                        "{}{arr}[{idx} * {words}u + {w}u] = bitcast<u32>({base}_f{w});",
                        self.pad()
                    );
                }
            }
        }
        Ok(())
    }

    /// Load the source element(s) for lane `i` and evaluate every let
    /// binding in declaration order.
    fn emit_prelude(&mut self) -> Result<()> {
        match &self.plan.source {
            PlanSource::Single(b) => {
                self.element = Some(self.load_element("src0", "i", &b.schema, "el")?);
            }
            PlanSource::Zip(l, r) => {
                self.zip_left = Some(self.load_element("src0", "i", &l.schema, "lhs")?);
                self.zip_right = Some(self.load_element("src1", "i", &r.schema, "rhs")?);
            }
        }
        for (name, expr) in &self.plan.bindings {
            let val = self.emit(expr)?;
            self.bindings.insert(name.as_str(), val);
        }
        Ok(())
    }

    fn emit(&mut self, e: &ScalarExpr) -> Result<EmittedVal> {
        match &*e.node {
            Expr::Element => self
                .element
                .clone()
                .ok_or_else(|| Error::Schema("element outside single pipeline".to_string())),
            Expr::ZipLeft => self
                .zip_left
                .clone()
                .ok_or_else(|| Error::Schema("zip_left outside zip pipeline".to_string())),
            Expr::ZipRight => self
                .zip_right
                .clone()
                .ok_or_else(|| Error::Schema("zip_right outside zip pipeline".to_string())),
            Expr::Binding(name) => self.bindings.get(name.as_str()).cloned().ok_or_else(|| {
                Error::UnsupportedOperator(format!("reference to undeclared binding '{name}'"))
            }),
            Expr::Constant(c) => {
                let slot = self.plan.const_slot(*c).ok_or_else(|| {
                    Error::Schema("constant missing from lifted argument list".to_string())
                })?;
                let ty = c.scalar_type();
                let rhs = format!("bitcast<{}>(params.c{slot})", ty.wgsl());
                Ok(self.let_scalar(ty, &rhs))
            }
            Expr::Field(inner, name) => {
                let base = self.emit(inner)?;
                match base {
                    EmittedVal::Struct(base, schema) => {
                        let idx = schema.field_index(name).ok_or_else(|| {
                            Error::Schema(format!(
                                "struct {} has no field '{name}'",
                                schema.name
                            ))
                        })?;
                        Ok(EmittedVal::Scalar(
                            format!("{base}_f{idx}"),
                            schema.fields[idx].ty,
                        ))
                    }
                    EmittedVal::Scalar(_, t) => Err(Error::Schema(format!(
                        "field access '{name}' on scalar {}",
                        t.wgsl()
                    ))),
                }
            }
            Expr::MakeStruct(schema, fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for f in fields {
                    parts.push(self.emit(f)?);
                }
                let base = self.fresh();
                for (w, (part, def)) in parts.iter().zip(&schema.fields).enumerate() {
                    let _ = writeln!(
                        self.body,
                        "{}let {base}_f{w}: {} = {};",
                        self.pad(),
                        def.ty.wgsl(),
                        part.scalar_name()?
                    );
                }
                Ok(EmittedVal::Struct(base, schema.clone()))
            }
            Expr::Binary(op, l, r) => {
                let lv = self.emit(l)?;
                let rv = self.emit(r)?;
                let lt = lv.scalar_type()?;
                let out_ty = if op.is_arith() {
                    lt
                } else {
                    ScalarType::Bool
                };
                let rhs = format!(
                    "({} {} {})",
                    lv.scalar_name()?,
                    op.wgsl(),
                    rv.scalar_name()?
                );
                Ok(self.let_scalar(out_ty, &rhs))
            }
            Expr::Not(inner) => {
                let v = self.emit(inner)?;
                let rhs = format!("!({})", v.scalar_name()?);
                Ok(self.let_scalar(ScalarType::Bool, &rhs))
            }
            Expr::Math(f, args) => {
                let mut names = Vec::with_capacity(args.len());
                let mut ty = ScalarType::F32;
                for a in args {
                    let v = self.emit(a)?;
                    ty = v.scalar_type()?;
                    names.push(v.scalar_name()?.to_string());
                }
                let rhs = format!("{}({})", f.wgsl(), names.join(", "));
                Ok(self.let_scalar(ty, &rhs))
            }
            Expr::Cast(to, inner) => {
                let v = self.emit(inner)?;
                let rhs = format!("{}({})", to.wgsl(), v.scalar_name()?);
                Ok(self.let_scalar(*to, &rhs))
            }
            Expr::IndexRead(aux, idx) => {
                let slot = self.plan.aux_slot(aux.0.id).ok_or_else(|| {
                    Error::Schema("indexed buffer missing from argument list".to_string())
                })?;
                let iv = self.emit(idx)?;
                let uidx = self.fresh();
                let _ = writeln!(
                    self.body,
                    "{}let {uidx}: u32 = u32({});",
                    self.pad(),
                    iv.scalar_name()?
                );
                let arr = format!("aux{slot}");
                let base = self.fresh();
                let schema = aux.0.schema.clone();
                self.load_element(&arr, &uidx, &schema, &base)
            }
        }
    }
}

// ── stream compaction scan (plan-independent) ───────────────────────────

/// WGSL source for the three-dispatch inclusive prefix sum over the filter
/// mask. Compiled once per context and shared by every FilterMap plan.
///
/// `scan_block` produces per-workgroup inclusive scans plus one total per
/// block; `scan_totals` scans the block totals in a single workgroup with
/// per-thread chunking (so it handles up to 65535 * 256 elements);
/// `scan_apply` adds each block's preceding total back in.
pub(crate) const SCAN_SOURCE: &str = r#"
struct ScanParams {
    n: u32,
    num_blocks: u32,
    _p0: u32,
    _p1: u32,
}
@group(0) @binding(0) var<uniform> scan_params: ScanParams;
@group(0) @binding(1) var<storage, read> flags: array<u32>;
@group(0) @binding(2) var<storage, read_write> scanned: array<u32>;
@group(0) @binding(3) var<storage, read_write> block_sums: array<u32>;

var<workgroup> tile: array<u32, 256u>;

@compute @workgroup_size(256)
fn scan_block(@builtin(global_invocation_id) gid: vec3<u32>,
              @builtin(local_invocation_id) lid: vec3<u32>,
              @builtin(workgroup_id) wid: vec3<u32>) {
    let i = gid.x;
    var v: u32 = 0u;
    if (i < scan_params.n) {
        v = flags[i];
    }
    tile[lid.x] = v;
    workgroupBarrier();
    var offset = 1u;
    loop {
        if (offset >= 256u) { break; }
        var add: u32 = 0u;
        if (lid.x >= offset) {
            add = tile[lid.x - offset];
        }
        workgroupBarrier();
        tile[lid.x] = tile[lid.x] + add;
        workgroupBarrier();
        offset = offset * 2u;
    }
    if (i < scan_params.n) {
        scanned[i] = tile[lid.x];
    }
    if (lid.x == 255u) {
        block_sums[wid.x] = tile[255u];
    }
}

@compute @workgroup_size(256)
fn scan_totals(@builtin(local_invocation_id) lid: vec3<u32>) {
    let m = scan_params.num_blocks;
    let chunk = (m + 255u) / 256u;
    let lo = lid.x * chunk;

    var sum: u32 = 0u;
    var j = lo;
    loop {
        if (j >= lo + chunk || j >= m) { break; }
        sum = sum + block_sums[j];
        j = j + 1u;
    }
    tile[lid.x] = sum;
    workgroupBarrier();
    var offset = 1u;
    loop {
        if (offset >= 256u) { break; }
        var add: u32 = 0u;
        if (lid.x >= offset) {
            add = tile[lid.x - offset];
        }
        workgroupBarrier();
        tile[lid.x] = tile[lid.x] + add;
        workgroupBarrier();
        offset = offset * 2u;
    }
    var prefix: u32 = 0u;
    if (lid.x > 0u) {
        prefix = tile[lid.x - 1u];
    }
    j = lo;
    loop {
        if (j >= lo + chunk || j >= m) { break; }
        let inclusive = prefix + block_sums[j];
        prefix = inclusive;
        block_sums[j] = inclusive;
        j = j + 1u;
    }
}

@compute @workgroup_size(256)
fn scan_apply(@builtin(global_invocation_id) gid: vec3<u32>,
              @builtin(workgroup_id) wid: vec3<u32>) {
    let i = gid.x;
    if (i >= scan_params.n) { return; }
    if (wid.x > 0u) {
        scanned[i] = scanned[i] + block_sums[wid.x - 1u];
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{elem, lit_i32, make_struct, zip_left, zip_right, FieldDef};
    use crate::plan::build_materialize;
    use crate::query::{Query, QuerySource};
    use std::sync::Arc;

    fn i32_buffer(id: u64, len: usize) -> Arc<crate::buffers::BufferInner> {
        Arc::new(crate::buffers::BufferInner::for_tests(
            id,
            len,
            ElementSchema::Scalar(ScalarType::I32),
        ))
    }

    #[test]
    fn map_module_has_single_entry_and_lifted_constant() {
        let q = Query::from_source(QuerySource::Array(i32_buffer(1, 8)))
            .select(elem().mul(lit_i32(2)).add(lit_i32(1)));
        let plan = build_materialize(&q).unwrap();
        let wgsl = generate(&plan).unwrap();
        assert!(wgsl.contains("fn map_main"));
        assert!(!wgsl.contains("fn mask_main"));
        assert!(wgsl.contains("c0: u32"));
        assert!(wgsl.contains("c1: u32"));
        // constant values never appear in the source
        assert!(wgsl.contains("bitcast<i32>(params.c0)"));
    }

    #[test]
    fn filter_module_has_mask_and_scatter() {
        let q = Query::from_source(QuerySource::Array(i32_buffer(2, 8)))
            .filter(elem().rem(lit_i32(2)).eq(lit_i32(0)))
            .select(elem().mul(elem()));
        let plan = build_materialize(&q).unwrap();
        let wgsl = generate(&plan).unwrap();
        assert!(wgsl.contains("fn mask_main"));
        assert!(wgsl.contains("fn scatter_main"));
        assert!(wgsl.contains("flags[i] = u32("));
        assert!(wgsl.contains("let pos = scanned[i] - 1u;"));
    }

    #[test]
    fn struct_output_writes_one_word_per_field() {
        let schema = crate::expr::StructSchema::new(
            "Pair",
            vec![
                FieldDef::new("a", ScalarType::I32, 0),
                FieldDef::new("b", ScalarType::I32, 4),
            ],
            8,
        );
        let q = Query::from_source(QuerySource::Array(i32_buffer(3, 8)))
            .select(make_struct(schema, vec![elem(), elem().mul(elem())]));
        let plan = build_materialize(&q).unwrap();
        let wgsl = generate(&plan).unwrap();
        assert!(wgsl.contains("out[i * 2u + 0u]"));
        assert!(wgsl.contains("out[i * 2u + 1u]"));
    }

    #[test]
    fn zip_module_declares_two_sources() {
        let l = i32_buffer(4, 8);
        let r = i32_buffer(5, 8);
        let q = Query::from_source(QuerySource::Zip {
            left: l,
            right: r,
            combine: zip_left().add(zip_right()),
        });
        let plan = build_materialize(&q).unwrap();
        let wgsl = generate(&plan).unwrap();
        assert!(wgsl.contains("src0: array<u32>"));
        assert!(wgsl.contains("src1: array<u32>"));
    }

    #[test]
    fn reduce_module_has_both_phases() {
        let r = Query::from_source(QuerySource::Array(i32_buffer(6, 100)))
            .select(elem().mul(elem()))
            .sum();
        let plan = crate::plan::build_reduce(&r).unwrap();
        let wgsl = generate(&plan).unwrap();
        assert!(wgsl.contains("fn reduce_partial"));
        assert!(wgsl.contains("fn reduce_final"));
        assert!(wgsl.contains("var<workgroup> part"));
    }
}
