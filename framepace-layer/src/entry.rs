//! The loader-facing surface: exported entry points, layer
//! self-description, and proc-address routing.
//!
//! The loader resolves the symbols listed in the on-disk manifest,
//! calls the proc-address functions to discover the intercepted set,
//! and dispatches everything else past the layer. Only the operations
//! the engine needs are intercepted; every other name is delegated to
//! the next layer's proc-address function recorded at creation time.

use std::ffi::{CStr, c_char};

use ash::vk;

use crate::{chain, dispatch, engine};

pub const LAYER_NAME: &CStr = c"VK_LAYER_FRAMEPACE_frame_doubler";
pub const LAYER_SPEC_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);
pub const LAYER_IMPLEMENTATION_VERSION: u32 = 1;
pub const LAYER_DESCRIPTION: &CStr =
    c"framepace: transparent present-rate doubling layer";

/// Vulkan command name to exported symbol name, one entry per symbol
/// the shared object exports. The manifest generator consumes this
/// table, so the manifest can never drift from the binary.
pub const EXPORTED_SYMBOLS: &[(&str, &str)] = &[
    ("vkCreateInstance", "framepace_CreateInstance"),
    ("vkDestroyInstance", "framepace_DestroyInstance"),
    ("vkCreateDevice", "framepace_CreateDevice"),
    ("vkDestroyDevice", "framepace_DestroyDevice"),
    ("vkCreateSwapchainKHR", "framepace_CreateSwapchainKHR"),
    ("vkDestroySwapchainKHR", "framepace_DestroySwapchainKHR"),
    ("vkQueuePresentKHR", "framepace_QueuePresentKHR"),
    ("vkGetInstanceProcAddr", "framepace_GetInstanceProcAddr"),
    ("vkGetDeviceProcAddr", "framepace_GetDeviceProcAddr"),
    (
        "vkEnumerateInstanceLayerProperties",
        "framepace_EnumerateInstanceLayerProperties",
    ),
    (
        "vkEnumerateDeviceLayerProperties",
        "framepace_EnumerateDeviceLayerProperties",
    ),
    (
        "vkEnumerateInstanceExtensionProperties",
        "framepace_EnumerateInstanceExtensionProperties",
    ),
    (
        "vkEnumerateDeviceExtensionProperties",
        "framepace_EnumerateDeviceExtensionProperties",
    ),
];

/// The single layer record reported by enumeration.
pub fn layer_properties() -> vk::LayerProperties {
    let mut properties = vk::LayerProperties {
        spec_version: LAYER_SPEC_VERSION,
        implementation_version: LAYER_IMPLEMENTATION_VERSION,
        ..Default::default()
    };
    write_cstr(&mut properties.layer_name, LAYER_NAME);
    write_cstr(&mut properties.description, LAYER_DESCRIPTION);
    properties
}

/// Copy a C string into a fixed-size property field, truncating but
/// always leaving a terminator.
fn write_cstr(dst: &mut [c_char], src: &CStr) {
    let limit = dst.len().saturating_sub(1);
    let bytes = src.to_bytes();
    let count = bytes.len().min(limit);
    for (slot, &byte) in dst.iter_mut().zip(&bytes[..count]) {
        *slot = byte as c_char;
    }
    dst[count] = 0;
}

/// The count/pointer enumeration protocol for a single property.
///
/// # Safety
/// `p_count` must be valid; `p_out`, when non-null, must point at
/// `*p_count` writable slots.
unsafe fn write_one<T>(
    value: T,
    p_count: *mut u32,
    p_out: *mut T,
) -> vk::Result {
    if p_out.is_null() {
        // SAFETY: p_count is valid per caller contract.
        unsafe { *p_count = 1 };
        return vk::Result::SUCCESS;
    }
    // SAFETY: as above.
    if unsafe { *p_count } < 1 {
        // SAFETY: as above; zero entries were written.
        unsafe { *p_count = 0 };
        return vk::Result::INCOMPLETE;
    }
    // SAFETY: p_out has at least one writable slot.
    unsafe {
        *p_out = value;
        *p_count = 1;
    }
    vk::Result::SUCCESS
}

/// Extension enumeration against this layer: the layer brings no
/// extensions of its own, and any other layer name is not ours to
/// answer for.
///
/// # Safety
/// `p_count` must be valid; `p_layer_name`, when non-null, must be a
/// valid C string.
unsafe fn enumerate_layer_extensions(
    p_layer_name: *const c_char,
    p_count: *mut u32,
) -> vk::Result {
    // SAFETY: per caller contract.
    if !p_layer_name.is_null()
        && unsafe { CStr::from_ptr(p_layer_name) } == LAYER_NAME
    {
        // SAFETY: p_count is valid per caller contract.
        unsafe { *p_count = 0 };
        return vk::Result::SUCCESS;
    }
    vk::Result::ERROR_LAYER_NOT_PRESENT
}

// ---------------------------------------------------------------------------
// Exported entry points
// ---------------------------------------------------------------------------

/// # Safety
/// Loader contract for `vkCreateInstance` with a layer chain threaded
/// through the create info.
#[unsafe(export_name = "framepace_CreateInstance")]
pub unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    crate::log::init();
    // SAFETY: forwarded loader contract.
    unsafe {
        dispatch::on_create_instance(p_create_info, p_allocator, p_instance)
    }
}

/// # Safety
/// Loader contract for `vkDestroyInstance`.
#[unsafe(export_name = "framepace_DestroyInstance")]
pub unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    // SAFETY: forwarded loader contract.
    unsafe { dispatch::on_destroy_instance(instance, p_allocator) }
}

/// # Safety
/// Loader contract for `vkCreateDevice` with a layer chain threaded
/// through the create info.
#[unsafe(export_name = "framepace_CreateDevice")]
pub unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    crate::log::init();
    // SAFETY: forwarded loader contract.
    unsafe {
        dispatch::on_create_device(
            physical_device,
            p_create_info,
            p_allocator,
            p_device,
        )
    }
}

/// # Safety
/// Loader contract for `vkDestroyDevice`.
#[unsafe(export_name = "framepace_DestroyDevice")]
pub unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    // SAFETY: forwarded loader contract.
    unsafe { dispatch::on_destroy_device(device, p_allocator) }
}

/// # Safety
/// Loader contract for `vkCreateSwapchainKHR`; `device` was created
/// through this layer.
#[unsafe(export_name = "framepace_CreateSwapchainKHR")]
pub unsafe extern "system" fn create_swapchain_khr(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    use ash::vk::Handle;
    // SAFETY: device is live per loader contract.
    let Some(record) = (unsafe { dispatch::device_record(device.as_raw()) })
    else {
        tracing::warn!(
            target: crate::log::TARGET,
            "Swapchain creation on unhooked device {device:?}"
        );
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    // SAFETY: forwarded loader contract; record matches device.
    unsafe {
        chain::on_create_swapchain(
            &record,
            device,
            p_create_info,
            p_allocator,
            p_swapchain,
        )
    }
}

/// # Safety
/// Loader contract for `vkDestroySwapchainKHR`.
#[unsafe(export_name = "framepace_DestroySwapchainKHR")]
pub unsafe extern "system" fn destroy_swapchain_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    use ash::vk::Handle;
    // SAFETY: device is live per loader contract.
    let Some(record) = (unsafe { dispatch::device_record(device.as_raw()) })
    else {
        return;
    };
    // SAFETY: forwarded loader contract; record matches device.
    unsafe {
        chain::on_destroy_swapchain(&record, device, swapchain, p_allocator)
    }
}

/// # Safety
/// Loader contract for `vkQueuePresentKHR`; `queue` belongs to a
/// device created through this layer.
#[unsafe(export_name = "framepace_QueuePresentKHR")]
pub unsafe extern "system" fn queue_present_khr(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    use ash::vk::Handle;
    // SAFETY: queue is live, so its dispatch key is readable and
    // matches its device's.
    let Some(record) = (unsafe { dispatch::device_record(queue.as_raw()) })
    else {
        tracing::warn!(
            target: crate::log::TARGET,
            "Present on unhooked queue {queue:?}"
        );
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    // SAFETY: forwarded loader contract; record matches queue.
    unsafe { engine::on_queue_present(&record, queue, p_present_info) }
}

/// # Safety
/// Loader contract for `vkGetInstanceProcAddr`.
#[unsafe(export_name = "framepace_GetInstanceProcAddr")]
pub unsafe extern "system" fn get_instance_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    crate::log::init();
    if p_name.is_null() {
        return None;
    }
    // SAFETY: p_name is a valid C string per loader contract.
    let name = unsafe { CStr::from_ptr(p_name) };
    if let Some(own) = intercepted_instance_fn(name) {
        return Some(own);
    }
    if instance == vk::Instance::null() {
        return None;
    }
    // SAFETY: instance is live per loader contract.
    let record = unsafe { dispatch::instance_record(instance) }?;
    // SAFETY: delegating the caller's own query.
    unsafe { (record.gipa)(instance, p_name) }
}

/// # Safety
/// Loader contract for `vkGetDeviceProcAddr`.
#[unsafe(export_name = "framepace_GetDeviceProcAddr")]
pub unsafe extern "system" fn get_device_proc_addr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    use ash::vk::Handle;
    if p_name.is_null() {
        return None;
    }
    // SAFETY: p_name is a valid C string per loader contract.
    let name = unsafe { CStr::from_ptr(p_name) };
    if let Some(own) = intercepted_device_fn(name) {
        return Some(own);
    }
    if device == vk::Device::null() {
        return None;
    }
    // SAFETY: device is live per loader contract.
    let record = unsafe { dispatch::device_record(device.as_raw()) }?;
    // SAFETY: delegating the caller's own query.
    unsafe { (record.gdpa)(device, p_name) }
}

/// # Safety
/// `p_count` valid; `p_properties`, when non-null, points at
/// `*p_count` writable records.
#[unsafe(export_name = "framepace_EnumerateInstanceLayerProperties")]
pub unsafe extern "system" fn enumerate_instance_layer_properties(
    p_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    // SAFETY: forwarded caller contract.
    unsafe { write_one(layer_properties(), p_count, p_properties) }
}

/// # Safety
/// As [`enumerate_instance_layer_properties`].
#[unsafe(export_name = "framepace_EnumerateDeviceLayerProperties")]
pub unsafe extern "system" fn enumerate_device_layer_properties(
    _physical_device: vk::PhysicalDevice,
    p_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    // SAFETY: forwarded caller contract.
    unsafe { write_one(layer_properties(), p_count, p_properties) }
}

/// # Safety
/// `p_count` valid; `p_layer_name`, when non-null, a valid C string.
#[unsafe(export_name = "framepace_EnumerateInstanceExtensionProperties")]
pub unsafe extern "system" fn enumerate_instance_extension_properties(
    p_layer_name: *const c_char,
    p_count: *mut u32,
    _p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    // SAFETY: forwarded caller contract.
    unsafe { enumerate_layer_extensions(p_layer_name, p_count) }
}

/// # Safety
/// As [`enumerate_instance_extension_properties`].
#[unsafe(export_name = "framepace_EnumerateDeviceExtensionProperties")]
pub unsafe extern "system" fn enumerate_device_extension_properties(
    _physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_count: *mut u32,
    _p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    // SAFETY: forwarded caller contract.
    unsafe { enumerate_layer_extensions(p_layer_name, p_count) }
}

// ---------------------------------------------------------------------------
// Proc-address routing tables
// ---------------------------------------------------------------------------

type VoidFn = unsafe extern "system" fn();

/// Entry points returned from instance-level proc-address queries.
fn intercepted_instance_fn(name: &CStr) -> Option<VoidFn> {
    // SAFETY of every transmute below: the entry point's signature is
    // exactly the PFN type associated with the queried name; the
    // erased pointer is only ever called through that type.
    let own: VoidFn = match name.to_bytes() {
        b"vkCreateInstance" => unsafe {
            std::mem::transmute::<vk::PFN_vkCreateInstance, VoidFn>(
                create_instance,
            )
        },
        b"vkDestroyInstance" => unsafe {
            std::mem::transmute::<vk::PFN_vkDestroyInstance, VoidFn>(
                destroy_instance,
            )
        },
        b"vkCreateDevice" => unsafe {
            std::mem::transmute::<vk::PFN_vkCreateDevice, VoidFn>(
                create_device,
            )
        },
        b"vkDestroyDevice" => unsafe {
            std::mem::transmute::<vk::PFN_vkDestroyDevice, VoidFn>(
                destroy_device,
            )
        },
        b"vkCreateSwapchainKHR" => unsafe {
            std::mem::transmute::<vk::PFN_vkCreateSwapchainKHR, VoidFn>(
                create_swapchain_khr,
            )
        },
        b"vkDestroySwapchainKHR" => unsafe {
            std::mem::transmute::<vk::PFN_vkDestroySwapchainKHR, VoidFn>(
                destroy_swapchain_khr,
            )
        },
        b"vkQueuePresentKHR" => unsafe {
            std::mem::transmute::<vk::PFN_vkQueuePresentKHR, VoidFn>(
                queue_present_khr,
            )
        },
        b"vkGetInstanceProcAddr" => unsafe {
            std::mem::transmute::<vk::PFN_vkGetInstanceProcAddr, VoidFn>(
                get_instance_proc_addr,
            )
        },
        b"vkGetDeviceProcAddr" => unsafe {
            std::mem::transmute::<vk::PFN_vkGetDeviceProcAddr, VoidFn>(
                get_device_proc_addr,
            )
        },
        b"vkEnumerateInstanceLayerProperties" => unsafe {
            std::mem::transmute::<
                vk::PFN_vkEnumerateInstanceLayerProperties,
                VoidFn,
            >(enumerate_instance_layer_properties)
        },
        b"vkEnumerateDeviceLayerProperties" => unsafe {
            std::mem::transmute::<
                vk::PFN_vkEnumerateDeviceLayerProperties,
                VoidFn,
            >(enumerate_device_layer_properties)
        },
        b"vkEnumerateInstanceExtensionProperties" => unsafe {
            std::mem::transmute::<
                vk::PFN_vkEnumerateInstanceExtensionProperties,
                VoidFn,
            >(enumerate_instance_extension_properties)
        },
        b"vkEnumerateDeviceExtensionProperties" => unsafe {
            std::mem::transmute::<
                vk::PFN_vkEnumerateDeviceExtensionProperties,
                VoidFn,
            >(enumerate_device_extension_properties)
        },
        _ => return None,
    };
    Some(own)
}

/// Entry points returned from device-level proc-address queries.
fn intercepted_device_fn(name: &CStr) -> Option<VoidFn> {
    // SAFETY: as in intercepted_instance_fn.
    let own: VoidFn = match name.to_bytes() {
        b"vkDestroyDevice" => unsafe {
            std::mem::transmute::<vk::PFN_vkDestroyDevice, VoidFn>(
                destroy_device,
            )
        },
        b"vkCreateSwapchainKHR" => unsafe {
            std::mem::transmute::<vk::PFN_vkCreateSwapchainKHR, VoidFn>(
                create_swapchain_khr,
            )
        },
        b"vkDestroySwapchainKHR" => unsafe {
            std::mem::transmute::<vk::PFN_vkDestroySwapchainKHR, VoidFn>(
                destroy_swapchain_khr,
            )
        },
        b"vkQueuePresentKHR" => unsafe {
            std::mem::transmute::<vk::PFN_vkQueuePresentKHR, VoidFn>(
                queue_present_khr,
            )
        },
        b"vkGetDeviceProcAddr" => unsafe {
            std::mem::transmute::<vk::PFN_vkGetDeviceProcAddr, VoidFn>(
                get_device_proc_addr,
            )
        },
        _ => return None,
    };
    Some(own)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_properties_round_trip() {
        let properties = layer_properties();
        assert_eq!(properties.layer_name_as_c_str(), Ok(LAYER_NAME));
        assert_eq!(properties.description_as_c_str(), Ok(LAYER_DESCRIPTION));
        assert_eq!(properties.implementation_version, 1);
        assert_eq!(vk::api_version_major(properties.spec_version), 1);
        assert_eq!(vk::api_version_minor(properties.spec_version), 3);
    }

    #[test]
    fn write_cstr_truncates_with_terminator() {
        let mut dst = [1 as c_char; 4];
        write_cstr(&mut dst, c"abcdef");
        assert_eq!(dst[0], b'a' as c_char);
        assert_eq!(dst[2], b'c' as c_char);
        assert_eq!(dst[3], 0);
    }

    #[test]
    fn enumeration_count_query_then_fill() {
        let mut count = 0u32;
        // Count query.
        let result = unsafe {
            write_one(layer_properties(), &mut count, std::ptr::null_mut())
        };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 1);

        // Fill.
        let mut out = vk::LayerProperties::default();
        let result =
            unsafe { write_one(layer_properties(), &mut count, &mut out) };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 1);
        assert_eq!(out.layer_name_as_c_str(), Ok(LAYER_NAME));
    }

    #[test]
    fn enumeration_with_zero_capacity_is_incomplete() {
        let mut count = 0u32;
        let mut out = vk::LayerProperties::default();
        let result =
            unsafe { write_one(layer_properties(), &mut count, &mut out) };
        assert_eq!(result, vk::Result::INCOMPLETE);
        assert_eq!(count, 0);
        // Repeating the query afterwards still succeeds: nothing was
        // consumed by the failed call.
        let result = unsafe {
            write_one(layer_properties(), &mut count, std::ptr::null_mut())
        };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 1);
    }

    #[test]
    fn extension_enumeration_is_empty_for_own_name() {
        let mut count = 7u32;
        let result = unsafe {
            enumerate_layer_extensions(LAYER_NAME.as_ptr(), &mut count)
        };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(count, 0);
    }

    #[test]
    fn extension_enumeration_rejects_other_names() {
        let mut count = 7u32;
        let result = unsafe {
            enumerate_layer_extensions(c"VK_LAYER_other".as_ptr(), &mut count)
        };
        assert_eq!(result, vk::Result::ERROR_LAYER_NOT_PRESENT);
        assert_eq!(count, 7);

        let result =
            unsafe { enumerate_layer_extensions(std::ptr::null(), &mut count) };
        assert_eq!(result, vk::Result::ERROR_LAYER_NOT_PRESENT);
    }

    #[test]
    fn every_intercepted_name_is_exported() {
        for (vk_name, symbol) in EXPORTED_SYMBOLS {
            assert!(vk_name.starts_with("vk"), "{vk_name}");
            assert!(symbol.starts_with("framepace_"), "{symbol}");
        }
        let mut symbols: Vec<&str> =
            EXPORTED_SYMBOLS.iter().map(|(_, s)| *s).collect();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), EXPORTED_SYMBOLS.len());
    }

    #[test]
    fn instance_routing_covers_the_intercepted_set() {
        for name in [
            c"vkCreateInstance",
            c"vkDestroyInstance",
            c"vkCreateDevice",
            c"vkDestroyDevice",
            c"vkCreateSwapchainKHR",
            c"vkDestroySwapchainKHR",
            c"vkQueuePresentKHR",
            c"vkGetInstanceProcAddr",
            c"vkGetDeviceProcAddr",
            c"vkEnumerateInstanceLayerProperties",
            c"vkEnumerateDeviceLayerProperties",
            c"vkEnumerateInstanceExtensionProperties",
            c"vkEnumerateDeviceExtensionProperties",
        ] {
            assert!(
                intercepted_instance_fn(name).is_some(),
                "{name:?} not intercepted"
            );
        }
        assert!(intercepted_instance_fn(c"vkCmdDraw").is_none());
    }

    #[test]
    fn device_routing_covers_only_device_operations() {
        for name in [
            c"vkDestroyDevice",
            c"vkCreateSwapchainKHR",
            c"vkDestroySwapchainKHR",
            c"vkQueuePresentKHR",
            c"vkGetDeviceProcAddr",
        ] {
            assert!(
                intercepted_device_fn(name).is_some(),
                "{name:?} not intercepted"
            );
        }
        assert!(intercepted_device_fn(c"vkCreateInstance").is_none());
        assert!(intercepted_device_fn(c"vkQueueSubmit").is_none());
    }
}
