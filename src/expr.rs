//! Scalar expression DAG and element schemas.
//!
//! Expressions are small pure DAGs over: the current element, let-binding
//! references, captured host constants, struct field access/construction,
//! arithmetic/comparison operators, math intrinsics, and indexed reads of
//! auxiliary device buffers. Purity is what makes operator fusion safe:
//! the planner freely substitutes and reorders nodes within dependency
//! constraints.
//!
//! Element types are 4-byte scalars (i32, f32) or sequential-layout structs
//! of 4-byte scalars. The struct schema is an explicit caller-supplied
//! descriptor (ordered field name + type + byte offset) checked against the
//! host type's size at array creation, so host and device agree on layout
//! byte-for-byte.

use std::sync::Arc;

use crate::buffers::BufferInner;
use crate::error::{Error, Result};

/// Device-representable scalar type.
///
/// `Bool` only occurs inside expressions (predicates, comparison results);
/// it is never an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I32,
    F32,
    Bool,
}

impl ScalarType {
    pub(crate) fn wgsl(self) -> &'static str {
        match self {
            ScalarType::I32 => "i32",
            ScalarType::F32 => "f32",
            ScalarType::Bool => "bool",
        }
    }

    pub(crate) fn is_numeric(self) -> bool {
        matches!(self, ScalarType::I32 | ScalarType::F32)
    }
}

/// One field of a sequential-layout struct schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: ScalarType,
    pub offset: usize,
}

impl FieldDef {
    pub fn new(name: &str, ty: ScalarType, offset: usize) -> Self {
        Self {
            name: name.to_string(),
            ty,
            offset,
        }
    }
}

/// Explicit layout descriptor for a struct-valued element.
///
/// Fields must be 4-byte scalars at densely packed sequential offsets
/// (`0, 4, 8, …`) and `size` must equal `4 * fields.len()`. This is exactly
/// the layout a `#[repr(C)]` host struct of `i32`/`f32` fields has, so a
/// byte-level round trip through device memory reproduces the host value.
#[derive(Debug, Clone, PartialEq)]
pub struct StructSchema {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub size: usize,
}

impl StructSchema {
    pub fn new(name: &str, fields: Vec<FieldDef>, size: usize) -> Self {
        Self {
            name: name.to_string(),
            fields,
            size,
        }
    }

    /// Check the sequential-layout invariants.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::Schema(format!("struct {} has no fields", self.name)));
        }
        for (i, f) in self.fields.iter().enumerate() {
            if f.ty == ScalarType::Bool {
                return Err(Error::Schema(format!(
                    "struct {} field {} has non-element type bool",
                    self.name, f.name
                )));
            }
            if f.offset != i * 4 {
                return Err(Error::Schema(format!(
                    "struct {} field {} at offset {} breaks sequential layout (expected {})",
                    self.name,
                    f.name,
                    f.offset,
                    i * 4
                )));
            }
        }
        if self.size != self.fields.len() * 4 {
            return Err(Error::Schema(format!(
                "struct {} size {} does not match {} packed 4-byte fields",
                self.name,
                self.size,
                self.fields.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Element schema of a device buffer: a primitive or a sequential struct.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementSchema {
    Scalar(ScalarType),
    Struct(StructSchema),
}

impl ElementSchema {
    /// Number of 4-byte words one element occupies.
    pub fn word_count(&self) -> usize {
        match self {
            ElementSchema::Scalar(_) => 1,
            ElementSchema::Struct(s) => s.fields.len(),
        }
    }

    pub fn byte_size(&self) -> usize {
        self.word_count() * 4
    }

    /// Check that the schema is usable as an element type.
    pub fn validate(&self) -> Result<()> {
        match self {
            ElementSchema::Scalar(ScalarType::Bool) => {
                Err(Error::Schema("bool is not an element type".to_string()))
            }
            ElementSchema::Scalar(_) => Ok(()),
            ElementSchema::Struct(s) => s.validate(),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            ElementSchema::Scalar(t) => t.wgsl().to_string(),
            ElementSchema::Struct(s) => s.name.clone(),
        }
    }
}

/// A captured host constant, lifted into a kernel argument at plan time.
#[derive(Debug, Clone, Copy)]
pub enum ConstValue {
    I32(i32),
    F32(f32),
}

impl ConstValue {
    pub(crate) fn scalar_type(self) -> ScalarType {
        match self {
            ConstValue::I32(_) => ScalarType::I32,
            ConstValue::F32(_) => ScalarType::F32,
        }
    }

    /// Raw bit pattern as bound into the params uniform.
    pub(crate) fn bits(self) -> u32 {
        match self {
            ConstValue::I32(v) => v as u32,
            ConstValue::F32(v) => v.to_bits(),
        }
    }
}

// Constant identity is type + bit pattern (NaN-safe), matching how the
// value travels to the device.
impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        self.scalar_type() == other.scalar_type() && self.bits() == other.bits()
    }
}
impl Eq for ConstValue {}

/// Binary operators over expression scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub(crate) fn wgsl(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub(crate) fn is_arith(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem
        )
    }

    pub(crate) fn is_compare(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// Math intrinsics, lowered 1:1 to WGSL builtins.
///
/// Floating evaluation is f32 on the device; results match host evaluation
/// within 1e-3 (relative or absolute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum MathFn {
    Cos,
    Sin,
    Floor,
    Sqrt,
    Exp,
    Log,
    Pow,
    Abs,
    Min,
    Max,
}

impl MathFn {
    pub(crate) fn wgsl(self) -> &'static str {
        match self {
            MathFn::Cos => "cos",
            MathFn::Sin => "sin",
            MathFn::Floor => "floor",
            MathFn::Sqrt => "sqrt",
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Pow => "pow",
            MathFn::Abs => "abs",
            MathFn::Min => "min",
            MathFn::Max => "max",
        }
    }

    pub(crate) fn arity(self) -> usize {
        match self {
            MathFn::Pow | MathFn::Min | MathFn::Max => 2,
            _ => 1,
        }
    }
}

/// Reference to an auxiliary device buffer read from inside an expression.
#[derive(Debug, Clone)]
pub(crate) struct AuxBuffer(pub(crate) Arc<BufferInner>);

/// Expression node. Every node is pure.
#[derive(Debug)]
pub(crate) enum Expr {
    /// The current element of the (single) pipeline stream.
    Element,
    /// Left element of a zipped pair.
    ZipLeft,
    /// Right element of a zipped pair.
    ZipRight,
    /// Reference to an earlier let binding, by name.
    Binding(String),
    /// Captured host constant (lifted to a kernel argument, never inlined).
    Constant(ConstValue),
    /// Struct field access.
    Field(ScalarExpr, String),
    /// Struct construction; fields in schema order.
    MakeStruct(StructSchema, Vec<ScalarExpr>),
    Binary(BinOp, ScalarExpr, ScalarExpr),
    Not(ScalarExpr),
    Math(MathFn, Vec<ScalarExpr>),
    Cast(ScalarType, ScalarExpr),
    /// Indexed read of an auxiliary device buffer (index is i32).
    IndexRead(AuxBuffer, ScalarExpr),
}

/// A shareable handle to an expression DAG node.
#[derive(Debug, Clone)]
pub struct ScalarExpr {
    pub(crate) node: Arc<Expr>,
}

impl ScalarExpr {
    pub(crate) fn new(node: Expr) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    fn bin(self, op: BinOp, rhs: impl Into<ScalarExpr>) -> Self {
        Self::new(Expr::Binary(op, self, rhs.into()))
    }

    fn math(fn_: MathFn, args: Vec<ScalarExpr>) -> Self {
        Self::new(Expr::Math(fn_, args))
    }

    // ── arithmetic ──────────────────────────────────────────────────────
    pub fn add(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Add, rhs)
    }
    pub fn sub(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Sub, rhs)
    }
    pub fn mul(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Mul, rhs)
    }
    pub fn div(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Div, rhs)
    }
    pub fn rem(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Rem, rhs)
    }

    // ── comparison (result type bool) ───────────────────────────────────
    pub fn eq(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Eq, rhs)
    }
    pub fn ne(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Ne, rhs)
    }
    pub fn lt(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Lt, rhs)
    }
    pub fn le(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Le, rhs)
    }
    pub fn gt(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Gt, rhs)
    }
    pub fn ge(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Ge, rhs)
    }

    // ── logic ───────────────────────────────────────────────────────────
    pub fn and(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::And, rhs)
    }
    pub fn or(self, rhs: impl Into<ScalarExpr>) -> Self {
        self.bin(BinOp::Or, rhs)
    }
    pub fn not(self) -> Self {
        Self::new(Expr::Not(self))
    }

    // ── math intrinsics ─────────────────────────────────────────────────
    pub fn cos(self) -> Self {
        Self::math(MathFn::Cos, vec![self])
    }
    pub fn sin(self) -> Self {
        Self::math(MathFn::Sin, vec![self])
    }
    pub fn floor(self) -> Self {
        Self::math(MathFn::Floor, vec![self])
    }
    pub fn sqrt(self) -> Self {
        Self::math(MathFn::Sqrt, vec![self])
    }
    pub fn exp(self) -> Self {
        Self::math(MathFn::Exp, vec![self])
    }
    pub fn log(self) -> Self {
        Self::math(MathFn::Log, vec![self])
    }
    pub fn abs(self) -> Self {
        Self::math(MathFn::Abs, vec![self])
    }
    pub fn pow(self, exponent: impl Into<ScalarExpr>) -> Self {
        Self::math(MathFn::Pow, vec![self, exponent.into()])
    }
    pub fn min(self, rhs: impl Into<ScalarExpr>) -> Self {
        Self::math(MathFn::Min, vec![self, rhs.into()])
    }
    pub fn max(self, rhs: impl Into<ScalarExpr>) -> Self {
        Self::math(MathFn::Max, vec![self, rhs.into()])
    }

    // ── structs and casts ───────────────────────────────────────────────
    pub fn field(self, name: &str) -> Self {
        Self::new(Expr::Field(self, name.to_string()))
    }
    pub fn cast_i32(self) -> Self {
        Self::new(Expr::Cast(ScalarType::I32, self))
    }
    pub fn cast_f32(self) -> Self {
        Self::new(Expr::Cast(ScalarType::F32, self))
    }
}

impl From<i32> for ScalarExpr {
    fn from(v: i32) -> Self {
        lit_i32(v)
    }
}

impl From<f32> for ScalarExpr {
    fn from(v: f32) -> Self {
        lit_f32(v)
    }
}

/// The current element of the pipeline stream.
pub fn elem() -> ScalarExpr {
    ScalarExpr::new(Expr::Element)
}

/// Left element of a zip combine expression.
pub fn zip_left() -> ScalarExpr {
    ScalarExpr::new(Expr::ZipLeft)
}

/// Right element of a zip combine expression.
pub fn zip_right() -> ScalarExpr {
    ScalarExpr::new(Expr::ZipRight)
}

/// Reference to an earlier `let_binding` by name.
pub fn binding(name: &str) -> ScalarExpr {
    ScalarExpr::new(Expr::Binding(name.to_string()))
}

/// Captured i32 host constant (lifted to a kernel argument).
pub fn lit_i32(v: i32) -> ScalarExpr {
    ScalarExpr::new(Expr::Constant(ConstValue::I32(v)))
}

/// Captured f32 host constant (lifted to a kernel argument).
pub fn lit_f32(v: f32) -> ScalarExpr {
    ScalarExpr::new(Expr::Constant(ConstValue::F32(v)))
}

/// Struct construction; `fields` in schema order.
pub fn make_struct(schema: StructSchema, fields: Vec<ScalarExpr>) -> ScalarExpr {
    ScalarExpr::new(Expr::MakeStruct(schema, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_schema_sequential_layout_enforced() {
        let good = StructSchema::new(
            "Node",
            vec![
                FieldDef::new("x", ScalarType::I32, 0),
                FieldDef::new("y", ScalarType::I32, 4),
            ],
            8,
        );
        assert!(good.validate().is_ok());

        let gap = StructSchema::new(
            "Gap",
            vec![
                FieldDef::new("x", ScalarType::I32, 0),
                FieldDef::new("y", ScalarType::I32, 8),
            ],
            12,
        );
        assert!(matches!(gap.validate(), Err(Error::Schema(_))));

        let bad_size = StructSchema::new(
            "Bad",
            vec![FieldDef::new("x", ScalarType::F32, 0)],
            8,
        );
        assert!(matches!(bad_size.validate(), Err(Error::Schema(_))));
    }

    #[test]
    fn const_identity_is_bit_pattern() {
        assert_eq!(ConstValue::F32(1.5), ConstValue::F32(1.5));
        assert_ne!(ConstValue::F32(1.5), ConstValue::F32(-1.5));
        assert_ne!(ConstValue::I32(1), ConstValue::F32(f32::from_bits(1)));
        // NaN payloads compare by bits, not by float semantics
        assert_eq!(ConstValue::F32(f32::NAN), ConstValue::F32(f32::NAN));
    }

    #[test]
    fn bool_is_not_an_element_type() {
        assert!(ElementSchema::Scalar(ScalarType::Bool).validate().is_err());
        assert!(ElementSchema::Scalar(ScalarType::I32).validate().is_ok());
    }
}
