//! The per-present frame-doubling state machine.
//!
//! Every `vkQueuePresentKHR` that reaches a tracked, augmented
//! swapchain is handled as follows:
//!
//! 1. capture: the outgoing swapchain image is copied into the
//!    mirror's `current` slot;
//! 2. synthesis: when a previous frame exists, the outgoing image is
//!    overwritten with the synthesised in-between image (today: the
//!    previous frame, pasted back with a nearest blit) and presented;
//! 3. re-present: a fresh swapchain image is acquired, the captured
//!    frame is blitted into it, and it is presented as the real frame;
//! 4. the mirror swaps, so the captured frame becomes the previous
//!    frame of the next cycle.
//!
//! The host's present therefore becomes two display-visible presents.
//! One fence serialises the reusable command buffer across cycles;
//! every exit path leaves that fence signalled so the next cycle's
//! leading wait cannot deadlock. If one of the layer's own
//! submissions ever fails, the engine halts itself and all further
//! presents pass straight through.

use std::sync::atomic::Ordering;
use std::time::Instant;

use ash::vk;

use crate::chain::SurfaceChainRecord;
use crate::config::LayerConfig;
use crate::dispatch::DeviceRecord;
use crate::mirror::{StagingImage, StagingMirror};
use crate::pacing::TimingController;

/// Presents between two statistics log lines.
const STATS_INTERVAL: u64 = 300;

/// Mutable engine state of one device, guarded by the record's engine
/// mutex for the length of a present sequence.
pub struct EngineState {
    pub mirror: StagingMirror,
    pub pacing: TimingController,
    /// Set when one of the layer's own calls fails mid-sequence. A
    /// halted engine bypasses every later present, which also means
    /// its (possibly unsignalled) fence is never waited on again.
    pub halted: bool,
}

impl EngineState {
    pub fn new(config: &LayerConfig) -> Self {
        Self {
            mirror: StagingMirror::default(),
            pacing: TimingController::new(config),
            halted: false,
        }
    }
}

/// What to do with one incoming present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresentPlan {
    /// Hand the caller's present to the next layer untouched.
    Bypass,
    /// Run the augmentation sequence. `synthesize` is false on the
    /// first present after a mirror (re)configuration, which captures
    /// and forwards but cannot synthesise yet.
    Augment { synthesize: bool },
}

/// Decide between bypass and augmentation for one present.
fn plan_present(
    chain: Option<&SurfaceChainRecord>,
    image_index: u32,
    mirror_valid: bool,
    has_previous: bool,
    engaged: bool,
    halted: bool,
) -> PresentPlan {
    if halted || !engaged {
        return PresentPlan::Bypass;
    }
    let Some(chain) = chain else {
        return PresentPlan::Bypass;
    };
    if !chain.augmented
        || chain.images.is_empty()
        || image_index as usize >= chain.images.len()
        || !mirror_valid
    {
        return PresentPlan::Bypass;
    }
    PresentPlan::Augment {
        synthesize: has_previous,
    }
}

/// `vkQueuePresentKHR` hook body.
///
/// # Safety
/// Loader contract for `vkQueuePresentKHR`: `queue` belongs to
/// `record`'s device and `p_present_info` is valid for the duration
/// of the call.
pub unsafe fn on_queue_present(
    record: &DeviceRecord,
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let next_present = record.swapchain_fns.queue_present_khr;
    let config = LayerConfig::get();
    // SAFETY: p_present_info is valid per loader contract.
    let info = unsafe { &*p_present_info };

    if !config.enabled || info.swapchain_count == 0 {
        // SAFETY: delegating the caller's own arguments.
        return unsafe { next_present(queue, p_present_info) };
    }

    let observed =
        record.presents_observed.fetch_add(1, Ordering::Relaxed) + 1;

    let chain_count = info.swapchain_count as usize;
    // SAFETY: both arrays are swapchain_count entries long per the
    // Vulkan spec.
    let (swapchains, image_indices) = unsafe {
        (
            std::slice::from_raw_parts(info.p_swapchains, chain_count),
            std::slice::from_raw_parts(info.p_image_indices, chain_count),
        )
    };
    let image_index = image_indices[0];

    // Held only for the lookup, never across a Vulkan call.
    let chain = {
        let chains = record
            .chains
            .lock()
            .expect("surface-chain map lock poisoned");
        chains.get(&swapchains[0]).cloned()
    };

    let mut engine = record.engine.lock().expect("engine lock poisoned");
    let engine = &mut *engine;

    let mirror_valid = chain
        .as_ref()
        .is_some_and(|c| engine.mirror.is_valid_for(c.extent, c.format));
    let plan = plan_present(
        chain.as_ref(),
        image_index,
        mirror_valid,
        engine.mirror.has_previous(),
        engine.pacing.is_engaged(),
        engine.halted,
    );
    let PresentPlan::Augment { synthesize } = plan else {
        // SAFETY: delegating the caller's own arguments.
        return unsafe { next_present(queue, p_present_info) };
    };
    let (Some(chain), Some(previous), Some(current)) = (
        chain.as_ref(),
        engine.mirror.previous().copied(),
        engine.mirror.current().copied(),
    ) else {
        // SAFETY: delegating the caller's own arguments.
        return unsafe { next_present(queue, p_present_info) };
    };

    let wait_semaphores = if info.wait_semaphore_count > 0 {
        // SAFETY: the array is wait_semaphore_count entries long per
        // the Vulkan spec.
        unsafe {
            std::slice::from_raw_parts(
                info.p_wait_semaphores,
                info.wait_semaphore_count as usize,
            )
        }
    } else {
        &[]
    };

    let started = Instant::now();
    // SAFETY: queue and chain belong to record's device; the engine
    // mutex makes this the only sequence running on it.
    let result = unsafe {
        run_sequence(
            record,
            engine,
            queue,
            chain,
            image_index,
            previous,
            current,
            wait_semaphores,
            synthesize,
        )
    };

    let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
    let temperature = if config.thermal_protection {
        crate::pacing::read_gpu_temperature()
    } else {
        None
    };
    engine.pacing.on_frame_complete(elapsed_ms, temperature);

    if observed % STATS_INTERVAL == 0 {
        let synthesized = record.synthesized_presents.load(Ordering::Relaxed);
        tracing::info!(
            target: crate::log::TARGET,
            "{observed} presents, {synthesized} synthesised \
             ({:.0}% boost)",
            synthesized as f64 * 100.0 / observed as f64,
        );
    }

    // Any further swapchains in the same present are not augmented;
    // forward them as-is now that the first chain is done.
    let mut merged = result;
    if chain_count > 1 {
        // SAFETY: pointers offset within the caller's arrays.
        let trailing = unsafe { present_trailing(record, queue, info) };
        merged = merge_results(merged, trailing);
    }
    if !info.p_results.is_null() {
        // SAFETY: p_results, when set, has one slot per swapchain.
        unsafe { *info.p_results = result };
    }
    merged
}

/// Present every swapchain after the first with the caller's own
/// handles, indices, and result slots.
///
/// # Safety
/// `info` must have at least two swapchains; the wait semaphores were
/// already consumed by the capture submit.
unsafe fn present_trailing(
    record: &DeviceRecord,
    queue: vk::Queue,
    info: &vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let mut trailing = vk::PresentInfoKHR::default();
    trailing.swapchain_count = info.swapchain_count - 1;
    // SAFETY: offsets stay inside the caller's arrays per the count
    // checked by the caller.
    unsafe {
        trailing.p_swapchains = info.p_swapchains.add(1);
        trailing.p_image_indices = info.p_image_indices.add(1);
        if !info.p_results.is_null() {
            trailing.p_results = info.p_results.wrapping_add(1);
        }
    }
    // SAFETY: a fresh present info over the caller's live handles.
    unsafe { (record.swapchain_fns.queue_present_khr)(queue, &trailing) }
}

// ---------------------------------------------------------------------------
// The augmentation sequence
// ---------------------------------------------------------------------------

/// How the engine reacts to a driver result mid-sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverOutcome {
    /// Success or sub-optimal: keep going.
    Keep,
    /// The surface needs recreation; stop the sequence but keep the
    /// engine healthy (the chain-create hook will resize the mirror).
    Recoverable,
    /// Anything else: surface it to the caller untouched.
    Fatal,
}

fn classify(result: vk::Result) -> DriverOutcome {
    match result {
        vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR => {
            DriverOutcome::Keep
        }
        vk::Result::ERROR_OUT_OF_DATE_KHR
        | vk::Result::ERROR_SURFACE_LOST_KHR => DriverOutcome::Recoverable,
        _ => DriverOutcome::Fatal,
    }
}

/// Worst-of for the caller-visible return value: the first error wins,
/// then sub-optimal, then plain success.
fn merge_results(a: vk::Result, b: vk::Result) -> vk::Result {
    if a.as_raw() < 0 {
        a
    } else if b.as_raw() < 0 {
        b
    } else if a == vk::Result::SUBOPTIMAL_KHR
        || b == vk::Result::SUBOPTIMAL_KHR
    {
        vk::Result::SUBOPTIMAL_KHR
    } else {
        a
    }
}

fn halt(
    engine: &mut EngineState,
    what: &str,
    result: vk::Result,
) -> vk::Result {
    engine.halted = true;
    tracing::error!(
        target: crate::log::TARGET,
        "Engine halted while {what} ({result:?}); presents pass \
         through from now on"
    );
    result
}

/// Run one augmentation sequence.
///
/// Returns the caller-visible result for the first swapchain. The
/// mirror is swapped when the sequence completes, on the first-present
/// path, and when the synthesised present reports a recoverable
/// surface error (that capture still becomes the previous frame once
/// the host recreates the chain at the same size). Every other abort
/// leaves the mirror untouched, so the next cycle treats itself as a
/// first present.
///
/// # Safety
/// Caller holds the engine mutex. `chain` is tracked on `record`'s
/// device, `image_index` is in range, `previous`/`current` are the
/// mirror's live slots matching the chain's extent and format, and
/// `wait_semaphores` are the caller's present wait semaphores.
#[allow(clippy::too_many_arguments)]
unsafe fn run_sequence(
    record: &DeviceRecord,
    engine: &mut EngineState,
    queue: vk::Queue,
    chain: &SurfaceChainRecord,
    image_index: u32,
    previous: StagingImage,
    current: StagingImage,
    wait_semaphores: &[vk::Semaphore],
    synthesize: bool,
) -> vk::Result {
    let fns = &record.fns;
    let device = record.device;
    let cb = record.command_buffer;
    let fence = record.fence;
    let game_image = chain.images[image_index as usize];

    // The fence from the previous sequence serialises reuse of the
    // command buffer.
    // SAFETY: fence was created from device and is either signalled
    // or pending.
    let result =
        unsafe { (fns.wait_for_fences)(device, 1, &fence, vk::TRUE, u64::MAX) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "waiting for the engine fence", result);
    }
    // SAFETY: the fence is signalled, so it is not pending.
    let result = unsafe { (fns.reset_fences)(device, 1, &fence) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "resetting the engine fence", result);
    }

    // Record the capture (and, when possible, the synthesis) pass.
    // SAFETY: the fence wait above guarantees the buffer is not in
    // use; the pool allows individual reset.
    let result = unsafe {
        (fns.reset_command_buffer)(cb, vk::CommandBufferResetFlags::empty())
    };
    if result != vk::Result::SUCCESS {
        return halt(engine, "resetting the command buffer", result);
    }
    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: cb was just reset.
    let result = unsafe { (fns.begin_command_buffer)(cb, &begin_info) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "beginning the command buffer", result);
    }

    // The outgoing image arrives in present layout; make it a blit
    // source and copy it into the mirror's current slot.
    // SAFETY: all images below belong to record's device and cb is in
    // the recording state.
    unsafe {
        pipeline_barrier(
            fns,
            cb,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &image_barrier(
                game_image,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::TRANSFER_READ,
            ),
        );
        pipeline_barrier(
            fns,
            cb,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &image_barrier(
                current.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        );
        (fns.cmd_copy_image)(
            cb,
            game_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            current.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            1,
            &full_extent_copy(chain.extent),
        );

        if synthesize {
            pipeline_barrier(
                fns,
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &image_barrier(
                    previous.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                ),
            );
            pipeline_barrier(
                fns,
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &image_barrier(
                    game_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            );
            // Synthesis hook. A higher-fidelity synthesiser would
            // replace this single blit with a pass that also samples
            // the current capture and a motion field; its contract is
            // unchanged: the outgoing image ends up holding the image
            // to display for the early slot, same extent and format.
            (fns.cmd_blit_image)(
                cb,
                previous.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                game_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                1,
                &full_extent_blit(chain.extent),
                vk::Filter::NEAREST,
            );
            pipeline_barrier(
                fns,
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                &image_barrier(
                    game_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::MEMORY_READ,
                ),
            );
        } else {
            // Nothing to synthesise yet: hand the image straight back
            // for a normal present.
            pipeline_barrier(
                fns,
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                &image_barrier(
                    game_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::MEMORY_READ,
                ),
            );
        }
    }
    // SAFETY: cb is in the recording state.
    let result = unsafe { (fns.end_command_buffer)(cb) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "ending the command buffer", result);
    }

    // Submit, taking over the caller's wait semaphores at the
    // transfer stage, and block until the capture is done.
    let command_buffers = [cb];
    let wait_stages =
        vec![vk::PipelineStageFlags::TRANSFER; wait_semaphores.len()];
    let mut submit_info =
        vk::SubmitInfo::default().command_buffers(&command_buffers);
    if !wait_semaphores.is_empty() {
        submit_info = submit_info
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);
    }
    // SAFETY: submit_info borrows live locals; fence was reset above.
    let result = unsafe { (fns.queue_submit)(queue, 1, &submit_info, fence) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "submitting the capture pass", result);
    }
    // SAFETY: fence is pending from the submit above.
    let result =
        unsafe { (fns.wait_for_fences)(device, 1, &fence, vk::TRUE, u64::MAX) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "waiting for the capture pass", result);
    }

    if !synthesize {
        // First present after a mirror (re)configuration: the capture
        // is banked, the caller's image goes out once, unmodified.
        // SAFETY: chain and image_index are live per caller contract.
        let result =
            unsafe { present_one(record, queue, chain.handle, image_index) };
        engine.mirror.swap();
        return result;
    }

    // Present the synthesised image in the caller's slot.
    // SAFETY: chain and image_index are live per caller contract.
    let synth_result =
        unsafe { present_one(record, queue, chain.handle, image_index) };
    match classify(synth_result) {
        DriverOutcome::Keep => {
            record.synthesized_presents.fetch_add(1, Ordering::Relaxed);
        }
        DriverOutcome::Recoverable => {
            // No second acquire against a dead surface. The capture
            // still counts as the previous frame for the next cycle.
            engine.mirror.swap();
            return synth_result;
        }
        DriverOutcome::Fatal => return synth_result,
    }
    let mut worst = synth_result;

    // Acquire the slot for the real frame, reusing the engine fence
    // as the acquire fence.
    // SAFETY: the fence is signalled after the capture wait.
    let result = unsafe { (fns.reset_fences)(device, 1, &fence) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "resetting the acquire fence", result);
    }
    let mut acquired_index = 0u32;
    // SAFETY: chain.handle is live; the fence was just reset.
    let acquire_result = unsafe {
        (record.swapchain_fns.acquire_next_image_khr)(
            device,
            chain.handle,
            u64::MAX,
            vk::Semaphore::null(),
            fence,
            &mut acquired_index,
        )
    };
    match classify(acquire_result) {
        DriverOutcome::Keep => worst = merge_results(worst, acquire_result),
        DriverOutcome::Recoverable => {
            // The failed acquire left the fence unsignalled; restore
            // the resting state before leaving. The mirror is not
            // swapped: the real frame never reached the display, so
            // the next cycle treats itself as a first present.
            // SAFETY: fence is unsignalled and unqueued.
            unsafe { resignal_fence(record, engine, queue) };
            return acquire_result;
        }
        DriverOutcome::Fatal => {
            // SAFETY: as above.
            unsafe { resignal_fence(record, engine, queue) };
            return acquire_result;
        }
    }
    // SAFETY: fence is pending from the acquire.
    let result =
        unsafe { (fns.wait_for_fences)(device, 1, &fence, vk::TRUE, u64::MAX) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "waiting for the acquired image", result);
    }
    // SAFETY: the fence is signalled.
    let result = unsafe { (fns.reset_fences)(device, 1, &fence) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "resetting after acquire", result);
    }

    let Some(&acquired_image) =
        chain.images.get(acquired_index as usize)
    else {
        // The driver produced an index beyond the image list recorded
        // at creation; the chain is stale. Treat it like a surface
        // that needs recreation, leaving the mirror unswapped.
        tracing::warn!(
            target: crate::log::TARGET,
            "Acquired image index {acquired_index} outside the tracked \
             image list"
        );
        // SAFETY: fence is unsignalled and unqueued.
        unsafe { resignal_fence(record, engine, queue) };
        return vk::Result::ERROR_OUT_OF_DATE_KHR;
    };

    // Blit the banked capture into the acquired image and send the
    // real frame out.
    // SAFETY: the fence protocol above keeps cb unreferenced; images
    // belong to record's device.
    let result = unsafe {
        record_real_frame_blit(
            fns,
            cb,
            current.image,
            acquired_image,
            chain.extent,
        )
    };
    if result != vk::Result::SUCCESS {
        return halt(engine, "recording the real-frame blit", result);
    }
    let submit_info =
        vk::SubmitInfo::default().command_buffers(&command_buffers);
    // SAFETY: submit_info borrows live locals; fence was reset above.
    let result = unsafe { (fns.queue_submit)(queue, 1, &submit_info, fence) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "submitting the real-frame blit", result);
    }
    // SAFETY: fence is pending from the submit above.
    let result =
        unsafe { (fns.wait_for_fences)(device, 1, &fence, vk::TRUE, u64::MAX) };
    if result != vk::Result::SUCCESS {
        return halt(engine, "waiting for the real-frame blit", result);
    }

    // SAFETY: acquired_index came from the acquire above.
    let real_result =
        unsafe { present_one(record, queue, chain.handle, acquired_index) };
    match classify(real_result) {
        DriverOutcome::Keep => worst = merge_results(worst, real_result),
        // The real frame did not reach the display on either failure,
        // so the mirror stays unswapped.
        DriverOutcome::Recoverable => return real_result,
        DriverOutcome::Fatal => return real_result,
    }

    engine.mirror.swap();
    worst
}

/// Record the second pass: captured current frame into the freshly
/// acquired image, ready for present.
///
/// # Safety
/// `cb` must be idle and individually resettable; both images belong
/// to the device `fns` dispatches to.
unsafe fn record_real_frame_blit(
    fns: &ash::DeviceFnV1_0,
    cb: vk::CommandBuffer,
    captured: vk::Image,
    acquired: vk::Image,
    extent: vk::Extent2D,
) -> vk::Result {
    // SAFETY: cb is idle per caller contract.
    let result = unsafe {
        (fns.reset_command_buffer)(cb, vk::CommandBufferResetFlags::empty())
    };
    if result != vk::Result::SUCCESS {
        return result;
    }
    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: cb was just reset.
    let result = unsafe { (fns.begin_command_buffer)(cb, &begin_info) };
    if result != vk::Result::SUCCESS {
        return result;
    }
    // SAFETY: cb is recording; images are live per caller contract.
    unsafe {
        pipeline_barrier(
            fns,
            cb,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            &image_barrier(
                captured,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
        );
        pipeline_barrier(
            fns,
            cb,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &image_barrier(
                acquired,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        );
        (fns.cmd_blit_image)(
            cb,
            captured,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            acquired,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            1,
            &full_extent_blit(extent),
            vk::Filter::NEAREST,
        );
        pipeline_barrier(
            fns,
            cb,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &image_barrier(
                acquired,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::MEMORY_READ,
            ),
        );
        (fns.end_command_buffer)(cb)
    }
}

/// Present a single (swapchain, index) pair with no wait semaphores;
/// the caller's semaphores were consumed by the capture submit.
///
/// # Safety
/// `swapchain` is live on `record`'s device; `image_index` was
/// rendered to or transitioned to present layout.
unsafe fn present_one(
    record: &DeviceRecord,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    image_index: u32,
) -> vk::Result {
    let swapchains = [swapchain];
    let image_indices = [image_index];
    let present_info = vk::PresentInfoKHR::default()
        .swapchains(&swapchains)
        .image_indices(&image_indices);
    // SAFETY: present_info borrows live locals.
    unsafe { (record.swapchain_fns.queue_present_khr)(queue, &present_info) }
}

/// Return the engine fence to the signalled resting state with an
/// empty submit. Halts the engine if even that fails.
///
/// # Safety
/// The fence must be unsignalled and not pending on any queue.
unsafe fn resignal_fence(
    record: &DeviceRecord,
    engine: &mut EngineState,
    queue: vk::Queue,
) {
    // SAFETY: a zero-submit queue submission only signals the fence.
    let result = unsafe {
        (record.fns.queue_submit)(queue, 0, std::ptr::null(), record.fence)
    };
    if result != vk::Result::SUCCESS {
        let _ = halt(engine, "re-signalling the engine fence", result);
        return;
    }
    // SAFETY: the fence is pending from the empty submit.
    let result = unsafe {
        (record.fns.wait_for_fences)(
            record.device,
            1,
            &record.fence,
            vk::TRUE,
            u64::MAX,
        )
    };
    if result != vk::Result::SUCCESS {
        let _ = halt(engine, "waiting for the re-signalled fence", result);
    }
}

// ---------------------------------------------------------------------------
// Barrier and region builders
// ---------------------------------------------------------------------------

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
}

fn full_extent_copy(extent: vk::Extent2D) -> vk::ImageCopy {
    vk::ImageCopy {
        src_subresource: color_subresource_layers(),
        src_offset: vk::Offset3D::default(),
        dst_subresource: color_subresource_layers(),
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

fn full_extent_blit(extent: vk::Extent2D) -> vk::ImageBlit {
    let corners = [
        vk::Offset3D::default(),
        vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        },
    ];
    vk::ImageBlit {
        src_subresource: color_subresource_layers(),
        src_offsets: corners,
        dst_subresource: color_subresource_layers(),
        dst_offsets: corners,
    }
}

/// # Safety
/// `cb` must be in the recording state; `barrier.image` must be live
/// on the device `fns` dispatches to.
unsafe fn pipeline_barrier(
    fns: &ash::DeviceFnV1_0,
    cb: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    barrier: &vk::ImageMemoryBarrier<'_>,
) {
    // SAFETY: per caller contract; no memory or buffer barriers.
    unsafe {
        (fns.cmd_pipeline_barrier)(
            cb,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            1,
            barrier,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn tracked_chain() -> SurfaceChainRecord {
        SurfaceChainRecord {
            handle: vk::SwapchainKHR::from_raw(0xC0),
            images: vec![
                vk::Image::from_raw(1),
                vk::Image::from_raw(2),
                vk::Image::from_raw(3),
            ],
            format: vk::Format::B8G8R8A8_UNORM,
            extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            augmented: true,
        }
    }

    #[test]
    fn plan_bypasses_untracked_chain() {
        assert_eq!(
            plan_present(None, 0, true, true, true, false),
            PresentPlan::Bypass
        );
    }

    #[test]
    fn plan_bypasses_unaugmented_chain() {
        let chain = SurfaceChainRecord {
            augmented: false,
            ..tracked_chain()
        };
        assert_eq!(
            plan_present(Some(&chain), 0, true, true, true, false),
            PresentPlan::Bypass
        );
    }

    #[test]
    fn plan_bypasses_out_of_range_index() {
        let chain = tracked_chain();
        assert_eq!(
            plan_present(Some(&chain), 3, true, true, true, false),
            PresentPlan::Bypass
        );
    }

    #[test]
    fn plan_bypasses_invalid_mirror() {
        let chain = tracked_chain();
        assert_eq!(
            plan_present(Some(&chain), 0, false, false, true, false),
            PresentPlan::Bypass
        );
    }

    #[test]
    fn plan_bypasses_disengaged_or_halted_engine() {
        let chain = tracked_chain();
        assert_eq!(
            plan_present(Some(&chain), 0, true, true, false, false),
            PresentPlan::Bypass
        );
        assert_eq!(
            plan_present(Some(&chain), 0, true, true, true, true),
            PresentPlan::Bypass
        );
    }

    #[test]
    fn plan_first_present_captures_without_synthesis() {
        let chain = tracked_chain();
        assert_eq!(
            plan_present(Some(&chain), 0, true, false, true, false),
            PresentPlan::Augment { synthesize: false }
        );
    }

    #[test]
    fn plan_doubles_once_previous_exists() {
        let chain = tracked_chain();
        assert_eq!(
            plan_present(Some(&chain), 2, true, true, true, false),
            PresentPlan::Augment { synthesize: true }
        );
    }

    #[test]
    fn classify_keeps_suboptimal() {
        assert_eq!(classify(vk::Result::SUCCESS), DriverOutcome::Keep);
        assert_eq!(classify(vk::Result::SUBOPTIMAL_KHR), DriverOutcome::Keep);
        assert_eq!(
            classify(vk::Result::ERROR_OUT_OF_DATE_KHR),
            DriverOutcome::Recoverable
        );
        assert_eq!(
            classify(vk::Result::ERROR_SURFACE_LOST_KHR),
            DriverOutcome::Recoverable
        );
        assert_eq!(
            classify(vk::Result::ERROR_DEVICE_LOST),
            DriverOutcome::Fatal
        );
    }

    #[test]
    fn merge_prefers_errors_then_suboptimal() {
        use vk::Result as R;
        assert_eq!(merge_results(R::SUCCESS, R::SUCCESS), R::SUCCESS);
        assert_eq!(
            merge_results(R::SUBOPTIMAL_KHR, R::SUCCESS),
            R::SUBOPTIMAL_KHR
        );
        assert_eq!(
            merge_results(R::SUCCESS, R::SUBOPTIMAL_KHR),
            R::SUBOPTIMAL_KHR
        );
        assert_eq!(
            merge_results(R::ERROR_OUT_OF_DATE_KHR, R::SUBOPTIMAL_KHR),
            R::ERROR_OUT_OF_DATE_KHR
        );
        assert_eq!(
            merge_results(R::SUBOPTIMAL_KHR, R::ERROR_DEVICE_LOST),
            R::ERROR_DEVICE_LOST
        );
    }

    #[test]
    fn barriers_cover_the_color_subresource() {
        let barrier = image_barrier(
            vk::Image::from_raw(7),
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::TRANSFER_READ,
        );
        assert_eq!(barrier.image, vk::Image::from_raw(7));
        assert_eq!(barrier.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            barrier.new_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(barrier.subresource_range.layer_count, 1);
    }

    #[test]
    fn copy_and_blit_span_the_full_extent() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };

        let copy = full_extent_copy(extent);
        assert_eq!(copy.extent.width, 1280);
        assert_eq!(copy.extent.height, 720);
        assert_eq!(copy.extent.depth, 1);

        let blit = full_extent_blit(extent);
        assert_eq!(blit.src_offsets[0].x, 0);
        assert_eq!(blit.src_offsets[0].y, 0);
        assert_eq!(blit.src_offsets[1].x, 1280);
        assert_eq!(blit.src_offsets[1].y, 720);
        assert_eq!(blit.src_offsets[1].z, 1);
        assert_eq!(blit.dst_offsets[1].x, 1280);
        assert_eq!(blit.dst_offsets[1].y, 720);
    }
}
