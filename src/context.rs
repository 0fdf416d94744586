//! Device context: adapter selection, device/queue ownership, and the
//! public execution entry points.
//!
//! ## Device selection
//!
//! Set `GPQ_DEVICE` before [`Context::new`] to pick a specific adapter:
//! - A pure integer string (e.g. `"0"`, `"1"`) selects by index in the
//!   enumerated adapter list, provided the index is in range.
//! - Any other string (including out-of-range integers) is a
//!   case-insensitive substring match against the adapter name; the first
//!   match wins. `"3070"` matches "NVIDIA GeForce RTX 3070".
//! - Unset: wgpu's `HighPerformance` heuristic (discrete GPU preferred).
//!
//! `GPQ_DISABLE` set to anything makes [`Context::new`] fail, which is how
//! CI opts out of device tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer_pool::BufferPool;
use crate::buffers::{ArrayHandle, DeviceElement};
use crate::cache::KernelCache;
use crate::error::{Error, Result};
use crate::query::{Query, Reduction};
use crate::{exec, plan};

/// Shared device state: handles plus the transient-buffer pool. Everything
/// that outlives a single launch hangs off an `Arc` of this.
pub(crate) struct Gpu {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub pool: BufferPool,
}

/// Metadata about one adapter, for enumeration and diagnostics.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub index: usize,
    pub name: String,
    pub backend: String,
    pub device_type: String,
}

/// Owner of one compute device, its kernel cache, and the buffers created
/// through it.
pub struct Context {
    gpu: Arc<Gpu>,
    cache: KernelCache,
    /// Serializes encode/submit/readback sequences. Kernel launches from
    /// one context are totally ordered, which the multi-pass shapes
    /// (mask → scan → scatter) rely on.
    submit_lock: Mutex<()>,
    next_buffer_id: AtomicU64,
    info: AdapterInfo,
}

impl Context {
    /// Acquire a compute device. Fails with [`Error::DeviceUnavailable`]
    /// when no adapter is found or the device request is rejected.
    pub fn new() -> Result<Self> {
        if std::env::var("GPQ_DISABLE").is_ok() {
            return Err(Error::DeviceUnavailable(
                "disabled via GPQ_DISABLE".to_string(),
            ));
        }

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = select_adapter(&instance)
            .ok_or_else(|| Error::DeviceUnavailable("no suitable adapter".to_string()))?;
        let raw_info = adapter.get_info();
        let info = AdapterInfo {
            index: 0,
            name: raw_info.name.clone(),
            backend: format!("{:?}", raw_info.backend),
            device_type: format!("{:?}", raw_info.device_type),
        };
        log::info!(
            "adapter: {:?} | backend: {:?} | device_type: {:?}",
            raw_info.name,
            raw_info.backend,
            raw_info.device_type
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gpq"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| Error::DeviceUnavailable(format!("device request failed: {e}")))?;

        Ok(Self {
            gpu: Arc::new(Gpu {
                device,
                queue,
                pool: BufferPool::new(),
            }),
            cache: KernelCache::new(),
            submit_lock: Mutex::new(()),
            next_buffer_id: AtomicU64::new(1),
            info,
        })
    }

    /// Metadata of the selected adapter.
    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Upload a host slice into a new device-resident array.
    pub fn create_array<T: DeviceElement>(&self, data: &[T]) -> Result<ArrayHandle<T>> {
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        ArrayHandle::create(self.gpu.clone(), id, data)
    }

    /// Execute a pipeline and read the results back to the host.
    ///
    /// The pipeline's output element type must match `T` exactly.
    pub fn run<T: DeviceElement>(&self, query: &Query) -> Result<Vec<T>> {
        let plan = plan::build_materialize(query)?;
        check_out_schema::<T>(&plan.out_schema)?;
        if plan.input_len() == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.submit_lock.lock().expect("submit lock poisoned");
        let bytes = exec::materialize_to_vec(&self.gpu, &self.cache, &plan)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Execute a pipeline writing the results into an existing device
    /// array, avoiding the host round trip. Returns the number of elements
    /// written; fails with [`Error::MismatchedLength`] if the output would
    /// not fit in `dest`.
    pub fn fill<T: DeviceElement>(
        &self,
        query: &Query,
        dest: &ArrayHandle<T>,
    ) -> Result<usize> {
        let plan = plan::build_materialize(query)?;
        check_out_schema::<T>(&plan.out_schema)?;
        if plan.input_len() == 0 {
            return Ok(0);
        }
        let _guard = self.submit_lock.lock().expect("submit lock poisoned");
        exec::materialize_into(&self.gpu, &self.cache, &plan, &dest.inner)
    }

    /// Execute a terminal reduction and return the scalar result.
    pub fn reduce<T: DeviceElement>(&self, reduction: &Reduction) -> Result<T> {
        let plan = plan::build_reduce(reduction)?;
        check_out_schema::<T>(&plan.out_schema)?;
        if plan.input_len() == 0 {
            // Sum and Count of an empty stream are both the zero of T.
            return Ok(T::zeroed());
        }
        let _guard = self.submit_lock.lock().expect("submit lock poisoned");
        let word = exec::reduce_scalar(&self.gpu, &self.cache, &plan)?;
        Ok(bytemuck::pod_read_unaligned(&word.to_ne_bytes()))
    }
}

fn check_out_schema<T: DeviceElement>(out: &crate::expr::ElementSchema) -> Result<()> {
    let want = T::element_schema();
    if *out != want {
        return Err(Error::Schema(format!(
            "pipeline produces {}, requested element type is {}",
            out.describe(),
            want.describe()
        )));
    }
    Ok(())
}

/// Enumerate all adapters without creating a context.
pub fn enumerate_devices() -> Vec<AdapterInfo> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
        .map(|(i, a)| {
            let info = a.get_info();
            AdapterInfo {
                index: i,
                name: info.name.clone(),
                backend: format!("{:?}", info.backend),
                device_type: format!("{:?}", info.device_type),
            }
        })
        .collect()
}

/// Pick an adapter per `GPQ_DEVICE`, falling back to the `HighPerformance`
/// heuristic. A pure in-range integer selects by index; anything else is a
/// case-insensitive name substring.
fn select_adapter(instance: &wgpu::Instance) -> Option<wgpu::Adapter> {
    let default = || {
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
    };

    let selector = match std::env::var("GPQ_DEVICE") {
        Ok(s) => s,
        Err(_) => return default(),
    };

    let adapters: Vec<wgpu::Adapter> = instance.enumerate_adapters(wgpu::Backends::all());
    if adapters.is_empty() {
        log::warn!("GPQ_DEVICE set but no adapters found");
        return None;
    }

    if let Ok(idx) = selector.trim().parse::<usize>() {
        if idx < adapters.len() {
            let adapter = adapters.into_iter().nth(idx)?;
            log::info!(
                "selected adapter by index {}: {:?}",
                idx,
                adapter.get_info().name
            );
            return Some(adapter);
        }
        // Out-of-range integer falls through to the substring match.
        log::warn!(
            "GPQ_DEVICE index {} out of range ({} adapters), trying name match",
            idx,
            adapters.len()
        );
        return select_by_name(instance, &selector, default);
    }

    select_by_name(instance, &selector, default)
}

fn select_by_name(
    instance: &wgpu::Instance,
    selector: &str,
    default: impl Fn() -> Option<wgpu::Adapter>,
) -> Option<wgpu::Adapter> {
    let needle = selector.to_lowercase();
    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        if adapter.get_info().name.to_lowercase().contains(&needle) {
            log::info!(
                "selected adapter by name match {:?}: {:?}",
                selector,
                adapter.get_info().name
            );
            return Some(adapter);
        }
    }
    log::warn!("GPQ_DEVICE {selector:?} matched no adapter, using default");
    default()
}
