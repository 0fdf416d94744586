//! Kernel compilation and the structural-signature cache.
//!
//! Compiled pipelines are keyed by [`PlanSignature`], so two pipelines that
//! differ only in captured constant values or in which buffers they run
//! over resolve to the same entry. The map is keyed by the full signature
//! value, not a digest of it: a hash collision degrades to a structural
//! comparison instead of serving the wrong kernel.
//!
//! Compilation happens while the cache lock is held. That serializes
//! first-compile of identical pipelines racing from two threads, which is
//! exactly the dedup we want; distinct pipelines compile rarely enough
//! that the serialization does not matter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::codegen::{self, BindingManifest};
use crate::error::{Error, Result};
use crate::plan::{KernelPlan, PlanShape, PlanSignature};

/// A compiled plan: its pipelines plus the binding layout contract shared
/// with the executor.
pub(crate) struct CompiledKernel {
    pub manifest: BindingManifest,
    pub pipelines: KernelPipelines,
}

pub(crate) enum KernelPipelines {
    Map {
        layout: wgpu::BindGroupLayout,
        pipeline: wgpu::ComputePipeline,
    },
    FilterMap {
        mask_layout: wgpu::BindGroupLayout,
        mask: wgpu::ComputePipeline,
        scatter_layout: wgpu::BindGroupLayout,
        scatter: wgpu::ComputePipeline,
    },
    Reduce {
        partial_layout: wgpu::BindGroupLayout,
        partial: wgpu::ComputePipeline,
        final_layout: wgpu::BindGroupLayout,
        final_: wgpu::ComputePipeline,
    },
}

/// The fixed compaction-scan pipelines, compiled once per context.
pub(crate) struct ScanKernel {
    pub layout: wgpu::BindGroupLayout,
    pub block: wgpu::ComputePipeline,
    pub totals: wgpu::ComputePipeline,
    pub apply: wgpu::ComputePipeline,
}

pub(crate) struct KernelCache {
    kernels: Mutex<HashMap<PlanSignature, Arc<CompiledKernel>>>,
    scan: Mutex<Option<Arc<ScanKernel>>>,
}

impl KernelCache {
    pub(crate) fn new() -> Self {
        Self {
            kernels: Mutex::new(HashMap::new()),
            scan: Mutex::new(None),
        }
    }

    pub(crate) fn get_or_compile(
        &self,
        device: &wgpu::Device,
        plan: &KernelPlan,
    ) -> Result<Arc<CompiledKernel>> {
        let mut kernels = self.kernels.lock().expect("kernel cache lock poisoned");
        if let Some(kernel) = kernels.get(&plan.signature) {
            log::debug!("kernel cache hit ({} cached)", kernels.len());
            return Ok(kernel.clone());
        }
        log::debug!("kernel cache miss, compiling ({} cached)", kernels.len());
        let kernel = Arc::new(compile(device, plan)?);
        kernels.insert(plan.signature.clone(), kernel.clone());
        Ok(kernel)
    }

    /// The scan pipelines, compiled on first use.
    pub(crate) fn scan(&self, device: &wgpu::Device) -> Result<Arc<ScanKernel>> {
        let mut slot = self.scan.lock().expect("scan kernel lock poisoned");
        if let Some(scan) = slot.as_ref() {
            return Ok(scan.clone());
        }
        let scan = Arc::new(compile_scan(device)?);
        *slot = Some(scan.clone());
        Ok(scan)
    }
}

fn compile(device: &wgpu::Device, plan: &KernelPlan) -> Result<CompiledKernel> {
    let source = codegen::generate(plan)?;
    let manifest = BindingManifest::of(plan);

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("gpq_kernel"),
        source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
    });

    // Common prefix: params uniform, sources, aux buffers.
    let mut common: Vec<wgpu::BindGroupLayoutEntry> = vec![bgl_uniform(0)];
    for i in 0..manifest.srcs {
        common.push(bgl_storage_ro(manifest.src(i)));
    }
    for j in 0..manifest.aux {
        common.push(bgl_storage_ro(manifest.aux_binding(j)));
    }
    let base = manifest.shape_base();

    let pipelines = match plan.shape {
        PlanShape::Map => {
            let mut entries = common;
            entries.push(bgl_storage_rw(base));
            let layout = make_layout(device, "gpq_map", &entries);
            let pipeline = make_pipeline(device, "gpq_map", &layout, &module, "map_main");
            KernelPipelines::Map { layout, pipeline }
        }
        PlanShape::FilterMap => {
            let mut mask_entries = common.clone();
            mask_entries.push(bgl_storage_rw(base)); // flags
            let mask_layout = make_layout(device, "gpq_mask", &mask_entries);
            let mask = make_pipeline(device, "gpq_mask", &mask_layout, &module, "mask_main");

            let mut scatter_entries = common;
            scatter_entries.push(bgl_storage_rw(base)); // flags (declared read_write)
            scatter_entries.push(bgl_storage_ro(base + 1)); // scanned
            scatter_entries.push(bgl_storage_rw(base + 2)); // out
            let scatter_layout = make_layout(device, "gpq_scatter", &scatter_entries);
            let scatter =
                make_pipeline(device, "gpq_scatter", &scatter_layout, &module, "scatter_main");

            KernelPipelines::FilterMap {
                mask_layout,
                mask,
                scatter_layout,
                scatter,
            }
        }
        PlanShape::Reduce(_) => {
            let mut partial_entries = common;
            partial_entries.push(bgl_storage_rw(base)); // partials
            let partial_layout = make_layout(device, "gpq_reduce_partial", &partial_entries);
            let partial = make_pipeline(
                device,
                "gpq_reduce_partial",
                &partial_layout,
                &module,
                "reduce_partial",
            );

            // The final pass only touches partials, result, and its own
            // element-count uniform.
            let final_entries = vec![
                bgl_storage_rw(base),
                bgl_storage_rw(base + 1),
                bgl_uniform(base + 2),
            ];
            let final_layout = make_layout(device, "gpq_reduce_final", &final_entries);
            let final_ = make_pipeline(
                device,
                "gpq_reduce_final",
                &final_layout,
                &module,
                "reduce_final",
            );

            KernelPipelines::Reduce {
                partial_layout,
                partial,
                final_layout,
                final_,
            }
        }
    };

    if let Some(e) = pollster::block_on(device.pop_error_scope()) {
        return Err(Error::DeviceCompile {
            diagnostic: e.to_string(),
            wgsl: source,
        });
    }

    Ok(CompiledKernel {
        manifest,
        pipelines,
    })
}

fn compile_scan(device: &wgpu::Device) -> Result<ScanKernel> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("gpq_scan"),
        source: wgpu::ShaderSource::Wgsl(codegen::SCAN_SOURCE.into()),
    });
    let entries = vec![
        bgl_uniform(0),
        bgl_storage_ro(1),
        bgl_storage_rw(2),
        bgl_storage_rw(3),
    ];
    let layout = make_layout(device, "gpq_scan", &entries);
    let block = make_pipeline(device, "gpq_scan_block", &layout, &module, "scan_block");
    let totals = make_pipeline(device, "gpq_scan_totals", &layout, &module, "scan_totals");
    let apply = make_pipeline(device, "gpq_scan_apply", &layout, &module, "scan_apply");

    if let Some(e) = pollster::block_on(device.pop_error_scope()) {
        return Err(Error::DeviceCompile {
            diagnostic: e.to_string(),
            wgsl: codegen::SCAN_SOURCE.to_string(),
        });
    }

    Ok(ScanKernel {
        layout,
        block,
        totals,
        apply,
    })
}

// ── layout helpers ──────────────────────────────────────────────────────

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn make_layout(
    device: &wgpu::Device,
    label: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries,
    })
}

fn make_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}
