//! Device-resident arrays: upload, readback, and scoped disposal.
//!
//! An [`ArrayHandle`] mirrors a host slice in a GPU storage buffer. The
//! handle exclusively owns the device memory: disposal (explicit or on
//! drop) deterministically releases it, and any later use — host readback
//! or appearance as a kernel argument — fails with
//! [`Error::DisposedResource`] rather than returning stale data.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wgpu::util::DeviceExt;

use crate::context::Gpu;
use crate::error::{Error, Result};
use crate::expr::{AuxBuffer, ElementSchema, Expr, ScalarExpr, ScalarType};
use crate::query::{Query, QuerySource};

/// Usage flags for element storage buffers (kernel input/output + host copy).
pub(crate) const ELEMENT_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::COPY_SRC);

/// Usage flags for staging (readback) buffers.
pub(crate) const STAGING_USAGE: wgpu::BufferUsages =
    wgpu::BufferUsages::MAP_READ.union(wgpu::BufferUsages::COPY_DST);

/// Usage flags for pooled intermediate storage (masks, scans, partials).
pub(crate) const SCRATCH_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// A host element type that can live in a device buffer.
///
/// The schema is an explicit layout descriptor checked against
/// `size_of::<Self>()` at array creation; for structs it must describe the
/// same sequential field layout the `#[repr(C)]` host type has.
pub trait DeviceElement: bytemuck::Pod {
    fn element_schema() -> ElementSchema;
}

impl DeviceElement for i32 {
    fn element_schema() -> ElementSchema {
        ElementSchema::Scalar(ScalarType::I32)
    }
}

impl DeviceElement for f32 {
    fn element_schema() -> ElementSchema {
        ElementSchema::Scalar(ScalarType::F32)
    }
}

/// Shared state of one device buffer. Queries hold an `Arc` to this, so a
/// disposed buffer is observed as an error at plan/launch time instead of
/// aliasing freed memory.
pub(crate) struct BufferInner {
    pub(crate) id: u64,
    pub(crate) len: usize,
    pub(crate) schema: ElementSchema,
    raw: Mutex<Option<Arc<wgpu::Buffer>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for BufferInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferInner {{ id: {}, len: {}, schema: {} }}",
            self.id,
            self.len,
            self.schema.describe()
        )
    }
}

impl BufferInner {
    /// Snapshot the underlying buffer, or fail if disposed. The returned
    /// `Arc` keeps the buffer alive for the duration of one encode/submit.
    pub(crate) fn raw(&self, context: &'static str) -> Result<Arc<wgpu::Buffer>> {
        self.raw
            .lock()
            .expect("buffer state lock poisoned")
            .clone()
            .ok_or(Error::DisposedResource(context))
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let taken = self.raw.lock().expect("buffer state lock poisoned").take();
        if let Some(buf) = taken {
            // Free the device allocation now rather than when the last
            // in-flight reference drops.
            buf.destroy();
            log::debug!("buffer {} disposed ({} elements)", self.id, self.len);
        }
    }

    /// Planner unit tests build plans over buffers that never touch a
    /// device; such a buffer cannot be bound or read back.
    #[cfg(test)]
    pub(crate) fn for_tests(id: u64, len: usize, schema: ElementSchema) -> Self {
        Self {
            id,
            len,
            schema,
            raw: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }
}

/// Handle to a device-resident array of `T`.
///
/// Created by [`crate::Context::create_array`]; element count is fixed at
/// creation. Not `Clone`: the handle is the single owner of the device
/// memory.
pub struct ArrayHandle<T: DeviceElement> {
    pub(crate) inner: Arc<BufferInner>,
    pub(crate) gpu: Arc<Gpu>,
    _elem: PhantomData<T>,
}

impl<T: DeviceElement> ArrayHandle<T> {
    /// Allocate a device buffer and copy `data` into it.
    pub(crate) fn create(gpu: Arc<Gpu>, id: u64, data: &[T]) -> Result<Self> {
        let schema = T::element_schema();
        schema.validate()?;
        if schema.byte_size() != std::mem::size_of::<T>() {
            return Err(Error::Schema(format!(
                "schema {} is {} bytes but host type is {} bytes",
                schema.describe(),
                schema.byte_size(),
                std::mem::size_of::<T>()
            )));
        }

        let bytes: &[u8] = bytemuck::cast_slice(data);
        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = if bytes.is_empty() {
            // Zero-length buffers cannot be bound; keep a minimal allocation
            // so the handle behaves uniformly.
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("gpq_array"),
                size: 4,
                usage: ELEMENT_USAGE,
                mapped_at_creation: false,
            })
        } else {
            gpu.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("gpq_array"),
                    contents: bytes,
                    usage: ELEMENT_USAGE,
                })
        };
        if let Some(e) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(Error::OutOfDeviceMemory(e.to_string()));
        }

        log::debug!(
            "buffer {} created: {} x {} ({} bytes)",
            id,
            data.len(),
            schema.describe(),
            bytes.len()
        );

        Ok(Self {
            inner: Arc::new(BufferInner {
                id,
                len: data.len(),
                schema,
                raw: Mutex::new(Some(Arc::new(buffer))),
                disposed: AtomicBool::new(false),
            }),
            gpu,
            _elem: PhantomData,
        })
    }

    /// Element count, fixed at creation.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn schema(&self) -> &ElementSchema {
        &self.inner.schema
    }

    /// Start a query pipeline with this array as the source.
    pub fn query(&self) -> Query {
        Query::from_source(QuerySource::Array(self.inner.clone()))
    }

    /// Device-side indexed read, usable inside a fused expression.
    ///
    /// `index` must evaluate to an in-range i32. Agrees with the host-side
    /// [`ArrayHandle::get`] for every in-range index.
    pub fn read_at(&self, index: impl Into<ScalarExpr>) -> ScalarExpr {
        ScalarExpr::new(Expr::IndexRead(
            AuxBuffer(self.inner.clone()),
            index.into(),
        ))
    }

    /// Synchronous device-to-host copy of the whole array.
    pub fn to_array(&self) -> Result<Vec<T>> {
        if self.inner.len == 0 {
            return Ok(Vec::new());
        }
        let raw = self.inner.raw("to_array")?;
        let byte_len = (self.inner.len * self.inner.schema.byte_size()) as u64;
        let bytes = read_buffer_bytes(&self.gpu, &raw, 0, byte_len)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Host-side synchronous read of a single element.
    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.inner.len {
            return Err(Error::Schema(format!(
                "index {} out of range for array of length {}",
                index, self.inner.len
            )));
        }
        let raw = self.inner.raw("get")?;
        let elem_size = self.inner.schema.byte_size() as u64;
        let bytes = read_buffer_bytes(&self.gpu, &raw, index as u64 * elem_size, elem_size)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Deterministically release the device memory. Idempotent; any later
    /// use of the handle (or of a query referencing it) fails with
    /// [`Error::DisposedResource`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<T: DeviceElement> Drop for ArrayHandle<T> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

/// Copy `len` bytes from `src` at `offset` into host memory via a pooled
/// staging buffer.
pub(crate) fn read_buffer_bytes(
    gpu: &Gpu,
    src: &wgpu::Buffer,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let staging = gpu.pool.acquire(&gpu.device, len, STAGING_USAGE);

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gpq_readback"),
        });
    encoder.copy_buffer_to_buffer(src, offset, &staging, 0, len);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(0..len);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    receiver
        .recv()
        .map_err(|_| Error::DeviceExecution("readback callback dropped".to_string()))?
        .map_err(|e| Error::DeviceExecution(format!("staging map failed: {e:?}")))?;

    let bytes = slice.get_mapped_range().to_vec();
    staging.unmap();
    gpu.pool.release(staging);
    Ok(bytes)
}
