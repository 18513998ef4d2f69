//! Layer-link consumption, per-object records, and the dispatch-key
//! registry.
//!
//! During `vkCreateInstance` / `vkCreateDevice` the loader threads a
//! layer-link record through the creation info's extension chain. This
//! module finds the layer's own link, captures the next layer's
//! proc-address functions from it, advances the link so the next layer
//! down sees its own entry, and then delegates creation. The next
//! layer's function tables are resolved eagerly into an
//! [`InstanceRecord`] or [`DeviceRecord`].
//!
//! Records are keyed by the *dispatch key*: the pointer-sized word at
//! offset zero of a dispatchable handle, which is the driver's
//! dispatch table pointer. Driver trampolines may hand the same
//! underlying object out under differently-wrapped handles, so the
//! handle bit pattern itself is not a usable key; the dispatch pointer
//! is how layered drivers identify peers. Queues share their device's
//! dispatch table, which is what lets a present arriving on a queue
//! find its device record.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, LazyLock, Mutex};

use ash::vk;
use thiserror::Error;

use crate::chain::SurfaceChainRecord;
use crate::engine::EngineState;

// ---------------------------------------------------------------------------
// Loader layer-link structures
// ---------------------------------------------------------------------------

// The loader's vk_layer.h chain records are not part of ash; these are
// layout-compatible renditions. Only the LAYER_LINK_INFO arm of the C
// union is ever read, and it is a single pointer.

/// `VkLayerFunction` value marking a link-info node.
pub const LAYER_LINK_INFO: i32 = 0;

#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr:
        Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_next_get_physical_device_proc_addr:
        Option<unsafe extern "system" fn()>,
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub p_layer_info: *mut LayerInstanceLink,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr:
        Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_next_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub p_layer_info: *mut LayerDeviceLink,
}

/// Walk a creation-info extension chain for this layer's link node.
///
/// # Safety
/// `p_next` must be the head of a well-formed Vulkan extension chain:
/// every node starts with `sType` + `pNext` and nodes with the
/// requested `s_type` have the layer-create-info layout.
unsafe fn find_link_node(
    p_next: *const c_void,
    s_type: vk::StructureType,
) -> Option<*mut c_void> {
    let mut node = p_next as *const vk::BaseInStructure;
    while !node.is_null() {
        // SAFETY: per caller contract every chain node begins with
        // sType and pNext.
        if unsafe { (*node).s_type } == s_type {
            // The loader emits several nodes of this sType; only the
            // link-info one carries the proc-address chain. `function`
            // sits directly after the common header in both layouts.
            let candidate = node as *mut LayerInstanceCreateInfo;
            // SAFETY: nodes with this sType have the layer layout.
            if unsafe { (*candidate).function } == LAYER_LINK_INFO {
                return Some(candidate as *mut c_void);
            }
        }
        // SAFETY: same contract.
        node = unsafe { (*node).p_next };
    }
    None
}

/// # Safety
/// See [`find_link_node`].
pub unsafe fn find_instance_link(
    p_next: *const c_void,
) -> Option<*mut LayerInstanceCreateInfo> {
    // SAFETY: forwarded caller contract.
    unsafe {
        find_link_node(p_next, vk::StructureType::LOADER_INSTANCE_CREATE_INFO)
    }
    .map(|node| node as *mut LayerInstanceCreateInfo)
}

/// # Safety
/// See [`find_link_node`].
pub unsafe fn find_device_link(
    p_next: *const c_void,
) -> Option<*mut LayerDeviceCreateInfo> {
    // SAFETY: forwarded caller contract.
    unsafe {
        find_link_node(p_next, vk::StructureType::LOADER_DEVICE_CREATE_INFO)
    }
    .map(|node| node as *mut LayerDeviceCreateInfo)
}

// ---------------------------------------------------------------------------
// Dispatch key
// ---------------------------------------------------------------------------

/// Read the dispatch key of a dispatchable handle.
///
/// # Safety
/// `handle` must be a live dispatchable Vulkan handle (instance,
/// device, or queue): its first pointer-sized word is the dispatch
/// table pointer this function reads.
pub unsafe fn dispatch_key(handle: u64) -> usize {
    // SAFETY: per caller contract the handle points at an object whose
    // first word is readable.
    unsafe { *(handle as usize as *const usize) }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-instance state: the next layer's proc-address function and the
/// instance-level functions the layer calls later.
pub struct InstanceRecord {
    pub instance: vk::Instance,
    pub gipa: vk::PFN_vkGetInstanceProcAddr,
    pub fns: ash::InstanceFnV1_0,
}

/// Per-device state. Everything the engine needs for one device lives
/// here: the next layer's dispatch tables, the queue, the reusable
/// command buffer and its serialising fence, the tracked swapchains,
/// and the engine's mutable state.
pub struct DeviceRecord {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub gdpa: vk::PFN_vkGetDeviceProcAddr,
    pub fns: ash::DeviceFnV1_0,
    pub swapchain_fns: ash::khr::swapchain::DeviceFn,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub command_pool: vk::CommandPool,
    /// Recorded into by at most one present sequence at a time; the
    /// fence serialises reuse across sequences.
    pub command_buffer: vk::CommandBuffer,
    /// Created signalled so the first sequence's leading wait returns
    /// immediately. Every sequence exit path leaves it signalled.
    pub fence: vk::Fence,
    pub chains: Mutex<HashMap<vk::SwapchainKHR, SurfaceChainRecord>>,
    pub engine: Mutex<EngineState>,
    pub presents_observed: AtomicU64,
    pub synthesized_presents: AtomicU64,
}

static INSTANCES: LazyLock<Mutex<HashMap<usize, Arc<InstanceRecord>>>> =
    LazyLock::new(Default::default);
static DEVICES: LazyLock<Mutex<HashMap<usize, Arc<DeviceRecord>>>> =
    LazyLock::new(Default::default);

/// Look up the instance record for a live instance handle.
///
/// # Safety
/// `instance` must be a live instance handle created through this
/// layer (the dispatch key is read from it).
pub unsafe fn instance_record(
    instance: vk::Instance,
) -> Option<Arc<InstanceRecord>> {
    use ash::vk::Handle;
    // SAFETY: instance is live per caller contract.
    let key = unsafe { dispatch_key(instance.as_raw()) };
    INSTANCES
        .lock()
        .expect("instance registry lock poisoned")
        .get(&key)
        .cloned()
}

/// Look up the device record for a live device or queue handle.
///
/// # Safety
/// `handle` must be a live device or queue handle created through
/// this layer.
pub unsafe fn device_record(handle: u64) -> Option<Arc<DeviceRecord>> {
    // SAFETY: handle is live per caller contract.
    let key = unsafe { dispatch_key(handle) };
    DEVICES
        .lock()
        .expect("device registry lock poisoned")
        .get(&key)
        .cloned()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LayerInitError {
    #[error("No layer link found in the creation info chain")]
    MissingLayerLink,
    #[error("Layer link carries no next-layer proc-address function")]
    IncompleteLayerLink,
    #[error("The next layer does not expose {0}")]
    MissingNextFunction(&'static str),
    #[error("Vulkan error creating engine resources: {0}")]
    EngineResources(vk::Result),
}

impl LayerInitError {
    fn as_vk_result(&self) -> vk::Result {
        match self {
            LayerInitError::EngineResources(result) => *result,
            _ => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }
}

// ---------------------------------------------------------------------------
// Instance lifecycle
// ---------------------------------------------------------------------------

/// `vkCreateInstance` hook body.
///
/// # Safety
/// Must only be called by the loader with valid create-info, allocator
/// and output pointers, with a loader layer chain threaded through
/// `p_create_info`.
pub unsafe fn on_create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    // SAFETY: forwarded loader contract.
    match unsafe { try_create_instance(p_create_info, p_allocator, p_instance) }
    {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                target: crate::log::TARGET,
                "Instance creation failed in the layer: {e}"
            );
            e.as_vk_result()
        }
    }
}

/// # Safety
/// See [`on_create_instance`].
unsafe fn try_create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> Result<vk::Result, LayerInitError> {
    use ash::vk::Handle;

    // SAFETY: p_create_info is valid per loader contract.
    let create_info = unsafe { &*p_create_info };
    // SAFETY: the chain hanging off a loader-delivered create info is
    // well formed.
    let link_info = unsafe { find_instance_link(create_info.p_next) }
        .ok_or(LayerInitError::MissingLayerLink)?;

    // SAFETY: link_info is a link node found above; the loader keeps
    // it alive and writable for the duration of creation.
    let link = unsafe { (*link_info).p_layer_info };
    if link.is_null() {
        return Err(LayerInitError::IncompleteLayerLink);
    }
    // SAFETY: link points at the loader's link entry for this layer.
    let gipa = unsafe { (*link).pfn_next_get_instance_proc_addr }
        .ok_or(LayerInitError::IncompleteLayerLink)?;
    // Advance the chain so the next layer finds its own link.
    // SAFETY: same as above; the loader expects this mutation.
    unsafe { (*link_info).p_layer_info = (*link).p_next };

    // SAFETY: vkCreateInstance is resolvable with a null instance.
    let next_create_instance = unsafe {
        resolve::<vk::PFN_vkCreateInstance>(
            gipa,
            vk::Instance::null(),
            c"vkCreateInstance",
        )
    }
    .ok_or(LayerInitError::MissingNextFunction("vkCreateInstance"))?;

    // SAFETY: delegating the caller's own arguments with the advanced
    // chain.
    let result = unsafe {
        next_create_instance(p_create_info, p_allocator, p_instance)
    };
    if result != vk::Result::SUCCESS {
        return Ok(result);
    }

    // SAFETY: creation succeeded, so the next layer wrote a valid
    // handle.
    let instance = unsafe { *p_instance };
    // Resolve the instance-level functions the layer calls later
    // through the next layer, never the loader trampolines.
    let fns =
        ash::InstanceFnV1_0::load(|name| pfn_to_ptr(gipa, instance, name));

    let record = Arc::new(InstanceRecord {
        instance,
        gipa,
        fns,
    });
    // SAFETY: instance is live; its dispatch key is readable.
    let key = unsafe { dispatch_key(instance.as_raw()) };
    INSTANCES
        .lock()
        .expect("instance registry lock poisoned")
        .insert(key, record);

    tracing::info!(
        target: crate::log::TARGET,
        "Layer active on instance {instance:?}"
    );
    Ok(vk::Result::SUCCESS)
}

/// `vkDestroyInstance` hook body.
///
/// # Safety
/// Loader contract for `vkDestroyInstance`; `instance` was created
/// through this layer.
pub unsafe fn on_destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    use ash::vk::Handle;
    if instance == vk::Instance::null() {
        return;
    }
    // SAFETY: instance is live until the delegated destroy below.
    let key = unsafe { dispatch_key(instance.as_raw()) };
    let record = INSTANCES
        .lock()
        .expect("instance registry lock poisoned")
        .remove(&key);
    let Some(record) = record else {
        tracing::warn!(
            target: crate::log::TARGET,
            "Destroy for unknown instance {instance:?}"
        );
        return;
    };
    tracing::debug!(
        target: crate::log::TARGET,
        "Destroying instance {instance:?}"
    );
    // SAFETY: delegating the caller's own arguments.
    unsafe { (record.fns.destroy_instance)(instance, p_allocator) };
}

// ---------------------------------------------------------------------------
// Device lifecycle
// ---------------------------------------------------------------------------

/// `vkCreateDevice` hook body.
///
/// # Safety
/// Loader contract for `vkCreateDevice`, with a loader layer chain
/// threaded through `p_create_info`.
pub unsafe fn on_create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    // SAFETY: forwarded loader contract.
    match unsafe {
        try_create_device(physical_device, p_create_info, p_allocator, p_device)
    } {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                target: crate::log::TARGET,
                "Device creation failed in the layer: {e}"
            );
            e.as_vk_result()
        }
    }
}

/// # Safety
/// See [`on_create_device`].
unsafe fn try_create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> Result<vk::Result, LayerInitError> {
    use ash::vk::Handle;

    // SAFETY: p_create_info is valid per loader contract.
    let create_info = unsafe { &*p_create_info };
    // SAFETY: loader-delivered chain is well formed.
    let link_info = unsafe { find_device_link(create_info.p_next) }
        .ok_or(LayerInitError::MissingLayerLink)?;

    // SAFETY: link_info was found above and stays valid through
    // creation.
    let link = unsafe { (*link_info).p_layer_info };
    if link.is_null() {
        return Err(LayerInitError::IncompleteLayerLink);
    }
    // SAFETY: link points at the loader's link entry for this layer.
    let (gipa, gdpa) = unsafe {
        (
            (*link).pfn_next_get_instance_proc_addr,
            (*link).pfn_next_get_device_proc_addr,
        )
    };
    let gipa = gipa.ok_or(LayerInitError::IncompleteLayerLink)?;
    let gdpa = gdpa.ok_or(LayerInitError::IncompleteLayerLink)?;
    // SAFETY: the loader expects this mutation.
    unsafe { (*link_info).p_layer_info = (*link).p_next };

    // SAFETY: the loader resolves vkCreateDevice for layers through a
    // null instance.
    let next_create_device = unsafe {
        resolve::<vk::PFN_vkCreateDevice>(
            gipa,
            vk::Instance::null(),
            c"vkCreateDevice",
        )
    }
    .ok_or(LayerInitError::MissingNextFunction("vkCreateDevice"))?;

    // SAFETY: delegating the caller's own arguments with the advanced
    // chain.
    let result = unsafe {
        next_create_device(
            physical_device,
            p_create_info,
            p_allocator,
            p_device,
        )
    };
    if result != vk::Result::SUCCESS {
        return Ok(result);
    }

    // SAFETY: creation succeeded.
    let device = unsafe { *p_device };
    // Resolve every device-level function the layer invokes through
    // the next layer's GetDeviceProcAddr. Names the next layer does
    // not know resolve to panicking stubs, so the table is never
    // part-null.
    let fns = ash::DeviceFnV1_0::load(|name| dpfn_to_ptr(gdpa, device, name));
    let swapchain_fns = ash::khr::swapchain::DeviceFn::load(|name| {
        dpfn_to_ptr(gdpa, device, name)
    });

    // SAFETY: physical_device is live; the registry only holds
    // instances that created it or siblings in the same process.
    let (memory_properties, queue_families) =
        unsafe { query_physical_device(physical_device) };

    let queue_create_infos = if create_info.queue_create_info_count > 0 {
        // SAFETY: count and pointer are paired per Vulkan spec.
        unsafe {
            std::slice::from_raw_parts(
                create_info.p_queue_create_infos,
                create_info.queue_create_info_count as usize,
            )
        }
    } else {
        &[]
    };
    let queue_family =
        choose_queue_family(queue_create_infos, &queue_families);

    let mut queue = vk::Queue::null();
    // SAFETY: queue_family comes from the caller's create info, so the
    // device has at least one queue in it.
    unsafe { (fns.get_device_queue)(device, queue_family, 0, &mut queue) };

    // SAFETY: device is live; on failure the helper destroys whatever
    // it created.
    let resources =
        match unsafe { create_engine_resources(&fns, device, queue_family) } {
            Ok(resources) => resources,
            Err(e) => {
                // Never leave a half-initialised device behind: fail
                // the whole creation with the driver's error.
                // SAFETY: nothing else references the device yet.
                unsafe { (fns.destroy_device)(device, p_allocator) };
                return Err(e);
            }
        };

    let record = Arc::new(DeviceRecord {
        device,
        physical_device,
        gdpa,
        fns,
        swapchain_fns,
        queue_family,
        queue,
        memory_properties,
        command_pool: resources.pool,
        command_buffer: resources.command_buffer,
        fence: resources.fence,
        chains: Mutex::new(HashMap::new()),
        engine: Mutex::new(EngineState::new(crate::config::LayerConfig::get())),
        presents_observed: AtomicU64::new(0),
        synthesized_presents: AtomicU64::new(0),
    });
    // SAFETY: device is live.
    let key = unsafe { dispatch_key(device.as_raw()) };
    DEVICES
        .lock()
        .expect("device registry lock poisoned")
        .insert(key, record);

    tracing::info!(
        target: crate::log::TARGET,
        "Layer active on device {device:?} (queue family {queue_family})"
    );
    Ok(vk::Result::SUCCESS)
}

/// `vkDestroyDevice` hook body.
///
/// # Safety
/// Loader contract for `vkDestroyDevice`; `device` was created through
/// this layer and all its child objects except the layer's own are
/// already destroyed.
pub unsafe fn on_destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    use ash::vk::Handle;
    use std::sync::atomic::Ordering;

    if device == vk::Device::null() {
        return;
    }
    // SAFETY: device is live until the delegated destroy below.
    let key = unsafe { dispatch_key(device.as_raw()) };
    let record = DEVICES
        .lock()
        .expect("device registry lock poisoned")
        .remove(&key);
    let Some(record) = record else {
        tracing::warn!(
            target: crate::log::TARGET,
            "Destroy for unknown device {device:?}"
        );
        return;
    };

    {
        let mut engine = record.engine.lock().expect("engine lock poisoned");
        // SAFETY: the host is destroying the device, so nothing is in
        // flight any more.
        unsafe { engine.mirror.destroy(&record.fns, device) };
    }
    // SAFETY: fence and pool were created from device; destroying the
    // pool frees the command buffer allocated from it.
    unsafe {
        (record.fns.destroy_fence)(device, record.fence, std::ptr::null());
        (record.fns.destroy_command_pool)(
            device,
            record.command_pool,
            std::ptr::null(),
        );
    }

    tracing::debug!(
        target: crate::log::TARGET,
        "Destroying device {device:?} (presents: {}, synthesised: {})",
        record.presents_observed.load(Ordering::Relaxed),
        record.synthesized_presents.load(Ordering::Relaxed),
    );
    // SAFETY: delegating the caller's own arguments.
    unsafe { (record.fns.destroy_device)(device, p_allocator) };
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve one named function through a proc-address function and cast
/// it to its concrete pointer type.
///
/// # Safety
/// `P` must be the Vulkan function pointer type matching `name`.
unsafe fn resolve<P>(
    gipa: vk::PFN_vkGetInstanceProcAddr,
    instance: vk::Instance,
    name: &std::ffi::CStr,
) -> Option<P> {
    // SAFETY: gipa is a proc-address function and name is a valid
    // C string.
    let raw = unsafe { gipa(instance, name.as_ptr()) }?;
    debug_assert_eq!(
        std::mem::size_of::<P>(),
        std::mem::size_of::<unsafe extern "system" fn()>()
    );
    // SAFETY: the loader contract guarantees the returned pointer has
    // the signature associated with `name`, which the caller asserts
    // matches `P`.
    Some(unsafe {
        std::mem::transmute_copy::<unsafe extern "system" fn(), P>(&raw)
    })
}

fn pfn_to_ptr(
    gipa: vk::PFN_vkGetInstanceProcAddr,
    instance: vk::Instance,
    name: &std::ffi::CStr,
) -> *const c_void {
    // SAFETY: gipa is a proc-address function and name is a valid
    // C string.
    match unsafe { gipa(instance, name.as_ptr()) } {
        Some(f) => f as *const c_void,
        None => std::ptr::null(),
    }
}

fn dpfn_to_ptr(
    gdpa: vk::PFN_vkGetDeviceProcAddr,
    device: vk::Device,
    name: &std::ffi::CStr,
) -> *const c_void {
    // SAFETY: gdpa is a proc-address function and name is a valid
    // C string.
    match unsafe { gdpa(device, name.as_ptr()) } {
        Some(f) => f as *const c_void,
        None => std::ptr::null(),
    }
}

/// Memory and queue-family properties of a physical device, queried
/// through whichever hooked instance is registered.
///
/// # Safety
/// `physical_device` must be live.
unsafe fn query_physical_device(
    physical_device: vk::PhysicalDevice,
) -> (
    vk::PhysicalDeviceMemoryProperties,
    Vec<vk::QueueFamilyProperties>,
) {
    let record = {
        let instances =
            INSTANCES.lock().expect("instance registry lock poisoned");
        instances.values().next().cloned()
    };
    let Some(record) = record else {
        // Device created without the instance hook having run; the
        // empty property table makes the mirror report no suitable
        // memory type and presents fall through to bypass.
        tracing::warn!(
            target: crate::log::TARGET,
            "No hooked instance; frame doubling will stay disabled"
        );
        return (vk::PhysicalDeviceMemoryProperties::default(), Vec::new());
    };

    let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
    // SAFETY: physical_device is live per caller contract.
    unsafe {
        (record.fns.get_physical_device_memory_properties)(
            physical_device,
            &mut memory_properties,
        )
    };

    let mut count = 0u32;
    // SAFETY: count-query form.
    unsafe {
        (record.fns.get_physical_device_queue_family_properties)(
            physical_device,
            &mut count,
            std::ptr::null_mut(),
        )
    };
    let mut families =
        vec![vk::QueueFamilyProperties::default(); count as usize];
    // SAFETY: families has room for exactly `count` entries.
    unsafe {
        (record.fns.get_physical_device_queue_family_properties)(
            physical_device,
            &mut count,
            families.as_mut_ptr(),
        )
    };
    families.truncate(count as usize);
    (memory_properties, families)
}

/// First queue-create entry whose family advertises graphics, falling
/// back to the first entry when none does (or when the family table is
/// unavailable).
fn choose_queue_family(
    queue_create_infos: &[vk::DeviceQueueCreateInfo<'_>],
    families: &[vk::QueueFamilyProperties],
) -> u32 {
    queue_create_infos
        .iter()
        .map(|info| info.queue_family_index)
        .find(|&family| {
            families.get(family as usize).is_some_and(|props| {
                props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
        })
        .or_else(|| {
            queue_create_infos.first().map(|info| info.queue_family_index)
        })
        .unwrap_or(0)
}

struct EngineResources {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Create the command pool, its one reusable primary command buffer,
/// and the signalled fence that serialises sequences.
///
/// # Safety
/// `fns` must dispatch to the live `device`.
unsafe fn create_engine_resources(
    fns: &ash::DeviceFnV1_0,
    device: vk::Device,
    queue_family: u32,
) -> Result<EngineResources, LayerInitError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);
    let mut pool = vk::CommandPool::null();
    // SAFETY: pool_info is fully initialised; device is live.
    let result = unsafe {
        (fns.create_command_pool)(
            device,
            &pool_info,
            std::ptr::null(),
            &mut pool,
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(LayerInitError::EngineResources(result));
    }

    let allocate_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let mut command_buffer = vk::CommandBuffer::null();
    // SAFETY: pool was just created from device.
    let result = unsafe {
        (fns.allocate_command_buffers)(
            device,
            &allocate_info,
            &mut command_buffer,
        )
    };
    if result != vk::Result::SUCCESS {
        // SAFETY: pool was created above and holds no buffers.
        unsafe { (fns.destroy_command_pool)(device, pool, std::ptr::null()) };
        return Err(LayerInitError::EngineResources(result));
    }

    let fence_info = vk::FenceCreateInfo::default()
        .flags(vk::FenceCreateFlags::SIGNALED);
    let mut fence = vk::Fence::null();
    // SAFETY: fence_info is fully initialised.
    let result = unsafe {
        (fns.create_fence)(device, &fence_info, std::ptr::null(), &mut fence)
    };
    if result != vk::Result::SUCCESS {
        // SAFETY: both were created above; destroying the pool frees
        // the command buffer.
        unsafe { (fns.destroy_command_pool)(device, pool, std::ptr::null()) };
        return Err(LayerInitError::EngineResources(result));
    }

    Ok(EngineResources {
        pool,
        command_buffer,
        fence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    unsafe extern "system" fn fake_gipa(
        _instance: vk::Instance,
        _name: *const std::ffi::c_char,
    ) -> vk::PFN_vkVoidFunction {
        None
    }

    #[test]
    fn dispatch_key_reads_first_word() {
        // A dispatchable handle points at an object whose first word
        // is the dispatch table pointer; fabricate one.
        let fake_object: [usize; 2] = [0x0D15_7AB1E, 7];
        let handle = fake_object.as_ptr() as u64;

        // SAFETY: handle points at a readable object.
        let key = unsafe { dispatch_key(handle) };
        assert_eq!(key, 0x0D15_7AB1E);
    }

    #[test]
    fn instance_link_walk_finds_and_matches_function_tag() {
        let mut link = LayerInstanceLink {
            p_next: ptr::null_mut(),
            pfn_next_get_instance_proc_addr: Some(fake_gipa),
            pfn_next_get_physical_device_proc_addr: None,
        };
        // A loader node of the right sType but the wrong function tag
        // must be skipped.
        let mut decoy = LayerInstanceCreateInfo {
            s_type: vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
            p_next: ptr::null(),
            function: 1,
            p_layer_info: ptr::null_mut(),
        };
        let mut link_node = LayerInstanceCreateInfo {
            s_type: vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
            p_next: ptr::null(),
            function: LAYER_LINK_INFO,
            p_layer_info: &mut link,
        };
        decoy.p_next = &mut link_node as *mut _ as *const _;

        // SAFETY: the fabricated chain is well formed.
        let found = unsafe {
            find_instance_link(&mut decoy as *mut _ as *const _)
        };
        assert_eq!(
            found.map(|p| p as usize),
            Some(&mut link_node as *mut _ as usize)
        );
    }

    #[test]
    fn instance_link_walk_reports_absence() {
        // A chain whose only node has an unrelated sType.
        let node = LayerInstanceCreateInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_next: ptr::null(),
            function: LAYER_LINK_INFO,
            p_layer_info: ptr::null_mut(),
        };
        // SAFETY: a single well-formed node.
        let found =
            unsafe { find_instance_link(&node as *const _ as *const _) };
        assert!(found.is_none());

        // SAFETY: an empty chain.
        let found = unsafe { find_instance_link(ptr::null()) };
        assert!(found.is_none());
    }

    #[test]
    fn advancing_the_link_exposes_the_next_entry() {
        unsafe extern "system" fn second_gipa(
            _instance: vk::Instance,
            _name: *const std::ffi::c_char,
        ) -> vk::PFN_vkVoidFunction {
            None
        }

        let mut second = LayerInstanceLink {
            p_next: ptr::null_mut(),
            pfn_next_get_instance_proc_addr: Some(second_gipa),
            pfn_next_get_physical_device_proc_addr: None,
        };
        let mut first = LayerInstanceLink {
            p_next: &mut second,
            pfn_next_get_instance_proc_addr: Some(fake_gipa),
            pfn_next_get_physical_device_proc_addr: None,
        };
        let mut link_node = LayerInstanceCreateInfo {
            s_type: vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
            p_next: ptr::null(),
            function: LAYER_LINK_INFO,
            p_layer_info: &mut first,
        };

        // The consumption pattern used by try_create_instance.
        // SAFETY: fabricated chain is well formed.
        let found = unsafe {
            find_instance_link(&mut link_node as *mut _ as *const _)
        }
        .expect("link present");
        // SAFETY: found points at link_node.
        unsafe {
            let link = (*found).p_layer_info;
            (*found).p_layer_info = (*link).p_next;
        }
        assert_eq!(link_node.p_layer_info, &mut second as *mut _);
    }

    #[test]
    fn queue_family_choice_prefers_graphics() {
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::TRANSFER,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE,
                ..Default::default()
            },
        ];
        let infos = [
            vk::DeviceQueueCreateInfo::default().queue_family_index(0),
            vk::DeviceQueueCreateInfo::default().queue_family_index(1),
        ];
        assert_eq!(choose_queue_family(&infos, &families), 1);
    }

    #[test]
    fn queue_family_choice_falls_back_to_first_entry() {
        let families = [vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::TRANSFER,
            ..Default::default()
        }];
        let infos =
            [vk::DeviceQueueCreateInfo::default().queue_family_index(0)];
        assert_eq!(choose_queue_family(&infos, &families), 0);
        assert_eq!(choose_queue_family(&[], &families), 0);
    }
}
