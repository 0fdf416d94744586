//! Kernel launch and readback.
//!
//! Entry points receive an already-built [`KernelPlan`]; the caller holds
//! the context submit lock, so the encode/submit/readback sequences here
//! never interleave between threads. All transient buffers (params
//! uniforms, masks, scan arrays, partials, output scratch) come from the
//! pool and go back to it before returning.
//!
//! Callers short-circuit empty inputs, so `plan.input_len() >= 1` in every
//! function here.

use std::sync::Arc;

use crate::buffers::{read_buffer_bytes, BufferInner, SCRATCH_USAGE};
use crate::cache::{CompiledKernel, KernelCache, KernelPipelines, ScanKernel};
use crate::codegen::WORKGROUP_SIZE;
use crate::context::Gpu;
use crate::error::{Error, Result};
use crate::plan::KernelPlan;

const UNIFORM_USAGE: wgpu::BufferUsages =
    wgpu::BufferUsages::UNIFORM.union(wgpu::BufferUsages::COPY_DST);

/// Hard cap from the single-dimension dispatch limit.
const MAX_WORKGROUPS: u32 = 65_535;

/// Run a Map or FilterMap plan and read the output back to the host.
pub(crate) fn materialize_to_vec(
    gpu: &Arc<Gpu>,
    cache: &KernelCache,
    plan: &KernelPlan,
) -> Result<Vec<u8>> {
    let kernel = cache.get_or_compile(&gpu.device, plan)?;
    let elem_bytes = plan.out_schema.byte_size();
    match &kernel.pipelines {
        KernelPipelines::Map { .. } => {
            let n = plan.input_len();
            let out = acquire_checked(gpu, (n * elem_bytes) as u64, SCRATCH_USAGE, "output")?;
            launch_map(gpu, &kernel, plan, &out)?;
            let bytes = read_buffer_bytes(gpu, &out, 0, (n * elem_bytes) as u64)?;
            gpu.pool.release(out);
            Ok(bytes)
        }
        KernelPipelines::FilterMap { .. } => {
            let compaction = run_mask_and_scan(gpu, cache, &kernel, plan)?;
            let count = compaction.count as usize;
            if count == 0 {
                compaction.release(gpu);
                return Ok(Vec::new());
            }
            let out =
                acquire_checked(gpu, (count * elem_bytes) as u64, SCRATCH_USAGE, "output")?;
            launch_scatter(gpu, &kernel, plan, &compaction, &out)?;
            let bytes = read_buffer_bytes(gpu, &out, 0, (count * elem_bytes) as u64)?;
            gpu.pool.release(out);
            compaction.release(gpu);
            Ok(bytes)
        }
        KernelPipelines::Reduce { .. } => Err(Error::UnsupportedOperator(
            "reduction plan passed to materialize".to_string(),
        )),
    }
}

/// Run a Map or FilterMap plan writing into an existing device array.
/// Returns the element count written.
pub(crate) fn materialize_into(
    gpu: &Arc<Gpu>,
    cache: &KernelCache,
    plan: &KernelPlan,
    dest: &Arc<BufferInner>,
) -> Result<usize> {
    let kernel = cache.get_or_compile(&gpu.device, plan)?;
    let dest_raw = dest.raw("fill destination")?;
    match &kernel.pipelines {
        KernelPipelines::Map { .. } => {
            let n = plan.input_len();
            if n > dest.len {
                return Err(Error::MismatchedLength {
                    left: n,
                    right: dest.len,
                });
            }
            launch_map(gpu, &kernel, plan, &dest_raw)?;
            Ok(n)
        }
        KernelPipelines::FilterMap { .. } => {
            let compaction = run_mask_and_scan(gpu, cache, &kernel, plan)?;
            let count = compaction.count as usize;
            if count > dest.len {
                compaction.release(gpu);
                return Err(Error::MismatchedLength {
                    left: count,
                    right: dest.len,
                });
            }
            if count > 0 {
                launch_scatter(gpu, &kernel, plan, &compaction, &dest_raw)?;
            }
            compaction.release(gpu);
            Ok(count)
        }
        KernelPipelines::Reduce { .. } => Err(Error::UnsupportedOperator(
            "reduction plan passed to fill".to_string(),
        )),
    }
}

/// Run a Reduce plan and return the raw result word.
pub(crate) fn reduce_scalar(
    gpu: &Arc<Gpu>,
    cache: &KernelCache,
    plan: &KernelPlan,
) -> Result<u32> {
    let kernel = cache.get_or_compile(&gpu.device, plan)?;
    let (partial_layout, partial, final_layout, final_) = match &kernel.pipelines {
        KernelPipelines::Reduce {
            partial_layout,
            partial,
            final_layout,
            final_,
        } => (partial_layout, partial, final_layout, final_),
        _ => {
            return Err(Error::UnsupportedOperator(
                "materialize plan passed to reduce".to_string(),
            ))
        }
    };

    let n = plan.input_len();
    let groups = workgroups(n)?;
    let params = upload_params(gpu, plan)?;
    let partials = acquire_checked(gpu, groups as u64 * 4, SCRATCH_USAGE, "partials")?;
    let result = acquire_checked(gpu, 4, SCRATCH_USAGE, "result")?;
    let final_params = upload_words(gpu, &[groups, 0, 0, 0])?;

    let inputs = snapshot_inputs(plan)?;
    let base = kernel.manifest.shape_base();

    let mut partial_entries = common_entries(&kernel, &params, &inputs);
    partial_entries.push(entry(base, &partials));
    let partial_group = make_group(gpu, partial_layout, &partial_entries);

    let final_entries = vec![
        entry(base, &partials),
        entry(base + 1, &result),
        entry(base + 2, &final_params),
    ];
    let final_group = make_group(gpu, final_layout, &final_entries);

    submit_passes(
        gpu,
        "gpq_reduce",
        &[(partial, &partial_group, groups), (final_, &final_group, 1)],
    )?;

    let bytes = read_buffer_bytes(gpu, &result, 0, 4)?;
    for buf in [params, partials, result, final_params] {
        gpu.pool.release(buf);
    }
    let word = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok(word)
}

// ── map ─────────────────────────────────────────────────────────────────

fn launch_map(
    gpu: &Arc<Gpu>,
    kernel: &CompiledKernel,
    plan: &KernelPlan,
    out: &wgpu::Buffer,
) -> Result<()> {
    let (layout, pipeline) = match &kernel.pipelines {
        KernelPipelines::Map { layout, pipeline } => (layout, pipeline),
        _ => {
            return Err(Error::UnsupportedOperator(
                "map launch on non-map kernel".to_string(),
            ))
        }
    };
    let groups = workgroups(plan.input_len())?;
    let params = upload_params(gpu, plan)?;
    let inputs = snapshot_inputs(plan)?;

    let mut entries = common_entries(kernel, &params, &inputs);
    entries.push(entry(kernel.manifest.shape_base(), out));
    let group = make_group(gpu, layout, &entries);

    submit_passes(gpu, "gpq_map", &[(pipeline, &group, groups)])?;
    gpu.pool.release(params);
    Ok(())
}

// ── stream compaction ───────────────────────────────────────────────────

/// Scratch surviving from mask+scan to the scatter pass.
struct Compaction {
    params: wgpu::Buffer,
    flags: wgpu::Buffer,
    scanned: wgpu::Buffer,
    /// Number of surviving elements (`scanned[n-1]`).
    count: u32,
}

impl Compaction {
    fn release(self, gpu: &Gpu) {
        gpu.pool.release(self.params);
        gpu.pool.release(self.flags);
        gpu.pool.release(self.scanned);
    }
}

/// Evaluate the fused predicate into a 0/1 mask, then an inclusive prefix
/// sum over it (block scan, block-totals scan, apply), then read the
/// survivor count back. One submit for the four passes, one for the count
/// copy.
fn run_mask_and_scan(
    gpu: &Arc<Gpu>,
    cache: &KernelCache,
    kernel: &CompiledKernel,
    plan: &KernelPlan,
) -> Result<Compaction> {
    let (mask_layout, mask) = match &kernel.pipelines {
        KernelPipelines::FilterMap {
            mask_layout, mask, ..
        } => (mask_layout, mask),
        _ => {
            return Err(Error::UnsupportedOperator(
                "compaction on non-filter kernel".to_string(),
            ))
        }
    };
    let scan: Arc<ScanKernel> = cache.scan(&gpu.device)?;

    let n = plan.input_len();
    let groups = workgroups(n)?;
    let params = upload_params(gpu, plan)?;
    let flags = acquire_checked(gpu, n as u64 * 4, SCRATCH_USAGE, "filter mask")?;
    let scanned = acquire_checked(gpu, n as u64 * 4, SCRATCH_USAGE, "scan")?;
    let block_sums = acquire_checked(gpu, groups as u64 * 4, SCRATCH_USAGE, "block sums")?;
    let scan_params = upload_words(gpu, &[n as u32, groups, 0, 0])?;

    let inputs = snapshot_inputs(plan)?;
    let mut mask_entries = common_entries(kernel, &params, &inputs);
    mask_entries.push(entry(kernel.manifest.shape_base(), &flags));
    let mask_group = make_group(gpu, mask_layout, &mask_entries);

    let scan_entries = vec![
        entry(0, &scan_params),
        entry(1, &flags),
        entry(2, &scanned),
        entry(3, &block_sums),
    ];
    let scan_group = make_group(gpu, &scan.layout, &scan_entries);

    submit_passes(
        gpu,
        "gpq_mask_scan",
        &[
            (mask, &mask_group, groups),
            (&scan.block, &scan_group, groups),
            (&scan.totals, &scan_group, 1),
            (&scan.apply, &scan_group, groups),
        ],
    )?;

    let bytes = read_buffer_bytes(gpu, &scanned, (n as u64 - 1) * 4, 4)?;
    let count = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    gpu.pool.release(block_sums);
    gpu.pool.release(scan_params);
    Ok(Compaction {
        params,
        flags,
        scanned,
        count,
    })
}

fn launch_scatter(
    gpu: &Arc<Gpu>,
    kernel: &CompiledKernel,
    plan: &KernelPlan,
    compaction: &Compaction,
    out: &wgpu::Buffer,
) -> Result<()> {
    let (scatter_layout, scatter) = match &kernel.pipelines {
        KernelPipelines::FilterMap {
            scatter_layout,
            scatter,
            ..
        } => (scatter_layout, scatter),
        _ => {
            return Err(Error::UnsupportedOperator(
                "scatter on non-filter kernel".to_string(),
            ))
        }
    };
    let groups = workgroups(plan.input_len())?;
    let inputs = snapshot_inputs(plan)?;
    let base = kernel.manifest.shape_base();

    let mut entries = common_entries(kernel, &compaction.params, &inputs);
    entries.push(entry(base, &compaction.flags));
    entries.push(entry(base + 1, &compaction.scanned));
    entries.push(entry(base + 2, out));
    let group = make_group(gpu, scatter_layout, &entries);

    submit_passes(gpu, "gpq_scatter", &[(scatter, &group, groups)])
}

// ── shared plumbing ─────────────────────────────────────────────────────

fn workgroups(n: usize) -> Result<u32> {
    let groups = n.div_ceil(WORKGROUP_SIZE as usize);
    if groups > MAX_WORKGROUPS as usize {
        return Err(Error::DeviceExecution(format!(
            "{n} elements need {groups} workgroups, limit is {MAX_WORKGROUPS}"
        )));
    }
    Ok(groups as u32)
}

/// Source and aux buffer snapshots, held for the duration of one launch.
struct InputBuffers {
    srcs: Vec<Arc<wgpu::Buffer>>,
    aux: Vec<Arc<wgpu::Buffer>>,
}

fn snapshot_inputs(plan: &KernelPlan) -> Result<InputBuffers> {
    let srcs = plan
        .source
        .buffers()
        .into_iter()
        .map(|b| b.raw("pipeline source"))
        .collect::<Result<Vec<_>>>()?;
    let aux = plan
        .aux
        .iter()
        .map(|b| b.raw("indexed buffer"))
        .collect::<Result<Vec<_>>>()?;
    Ok(InputBuffers { srcs, aux })
}

/// The params uniform: element count, then the lifted constant bits,
/// zero-padded to the struct's 16-byte multiple.
fn upload_params(gpu: &Arc<Gpu>, plan: &KernelPlan) -> Result<wgpu::Buffer> {
    let mut words = Vec::with_capacity(plan.params_word_count());
    words.push(plan.input_len() as u32);
    words.extend(plan.constants.iter().map(|c| c.bits()));
    words.resize(plan.params_word_count(), 0);
    upload_words(gpu, &words)
}

fn upload_words(gpu: &Arc<Gpu>, words: &[u32]) -> Result<wgpu::Buffer> {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    let buf = acquire_checked(gpu, bytes.len() as u64, UNIFORM_USAGE, "params")?;
    gpu.queue.write_buffer(&buf, 0, bytes);
    Ok(buf)
}

fn acquire_checked(
    gpu: &Arc<Gpu>,
    bytes: u64,
    usage: wgpu::BufferUsages,
    what: &str,
) -> Result<wgpu::Buffer> {
    gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let buf = gpu.pool.acquire(&gpu.device, bytes, usage);
    match pollster::block_on(gpu.device.pop_error_scope()) {
        Some(e) => Err(Error::OutOfDeviceMemory(format!("{what}: {e}"))),
        None => Ok(buf),
    }
}

fn entry<'a>(binding: u32, buffer: &'a wgpu::Buffer) -> wgpu::BindGroupEntry<'a> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn common_entries<'a>(
    kernel: &CompiledKernel,
    params: &'a wgpu::Buffer,
    inputs: &'a InputBuffers,
) -> Vec<wgpu::BindGroupEntry<'a>> {
    let mut entries = vec![entry(0, params)];
    for (i, src) in inputs.srcs.iter().enumerate() {
        entries.push(entry(kernel.manifest.src(i), src));
    }
    for (j, aux) in inputs.aux.iter().enumerate() {
        entries.push(entry(kernel.manifest.aux_binding(j), aux));
    }
    entries
}

fn make_group(
    gpu: &Gpu,
    layout: &wgpu::BindGroupLayout,
    entries: &[wgpu::BindGroupEntry],
) -> wgpu::BindGroup {
    gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("gpq"),
        layout,
        entries,
    })
}

/// Encode the given compute passes into one command buffer and submit it.
/// Validation faults raised during the sequence surface as
/// [`Error::DeviceExecution`].
fn submit_passes(
    gpu: &Arc<Gpu>,
    label: &str,
    passes: &[(&wgpu::ComputePipeline, &wgpu::BindGroup, u32)],
) -> Result<()> {
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
    for (pipeline, group, groups) in passes {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, *group, &[]);
        pass.dispatch_workgroups(*groups, 1, 1);
    }
    gpu.queue.submit(std::iter::once(encoder.finish()));
    if let Some(e) = pollster::block_on(gpu.device.pop_error_scope()) {
        return Err(Error::DeviceExecution(format!("{label}: {e}")));
    }
    Ok(())
}
