//! Declarative query pipelines compiled to fused GPU compute kernels.
//!
//! A pipeline is a chain of `select`/`filter`/`let_binding` operators over
//! a device-resident array (or a zip of two), ended by a materializing run
//! or a `sum`/`count` reduction. The whole chain compiles to a single
//! fused kernel: no intermediate arrays exist between operators, filters
//! become stream compaction (mask, prefix sum, scatter), and reductions a
//! two-phase tree. Compiled kernels are cached by pipeline structure, so
//! re-running a pipeline with different captured constants or over
//! different arrays reuses the kernel.
//!
//! ```no_run
//! use gpq::{elem, lit_i32, Context};
//!
//! # fn main() -> gpq::Result<()> {
//! let ctx = Context::new()?;
//! let xs = ctx.create_array(&[1i32, 2, 3, 4, 5, 6])?;
//! let evens_squared: Vec<i32> = ctx.run(
//!     &xs.query()
//!         .filter(elem().rem(lit_i32(2)).eq(lit_i32(0)))
//!         .select(elem().mul(elem())),
//! )?;
//! assert_eq!(evens_squared, vec![4, 16, 36]);
//! # Ok(())
//! # }
//! ```

mod buffer_pool;
mod buffers;
mod cache;
mod codegen;
mod context;
mod error;
mod exec;
mod expr;
mod plan;
mod query;

pub use buffers::{ArrayHandle, DeviceElement};
pub use context::{enumerate_devices, AdapterInfo, Context};
pub use error::{Error, Result};
pub use expr::{
    binding, elem, lit_f32, lit_i32, make_struct, zip_left, zip_right, ElementSchema, FieldDef,
    ScalarExpr, ScalarType, StructSchema,
};
pub use query::{Query, Reduction};
