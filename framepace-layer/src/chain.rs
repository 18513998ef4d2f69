//! Swapchain tracking and creation-info augmentation.
//!
//! Every swapchain created on a hooked device is recorded together
//! with its driver-owned image list, format, and extent. Creation is
//! attempted with an augmented info first: one extra image (so the
//! engine can acquire a second image inside the same present cycle)
//! and transfer usage in both directions (so swapchain images are
//! legal blit sources and destinations). If the driver refuses the
//! augmented request, the caller's original info is retried verbatim
//! and the chain is recorded as unaugmented; the engine bypasses
//! presents against such a chain.

use ash::vk;

use crate::dispatch::DeviceRecord;

/// Shadow record of one driver-owned swapchain.
#[derive(Debug, Clone)]
pub struct SurfaceChainRecord {
    pub handle: vk::SwapchainKHR,
    /// Exactly what the next layer returned at creation time, never
    /// reordered. The driver owns these images.
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// False when creation fell back to the caller's original info.
    pub augmented: bool,
}

/// Derive the augmented creation info from the caller's.
///
/// Raises `min_image_count` to at least one more than requested (never
/// below 3) and unions transfer usage into `image_usage`. Every other
/// field passes through untouched.
fn augment_create_info<'a>(
    info: &vk::SwapchainCreateInfoKHR<'a>,
) -> vk::SwapchainCreateInfoKHR<'a> {
    let mut augmented = *info;
    augmented.min_image_count = info.min_image_count.saturating_add(1).max(3);
    augmented.image_usage |= vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    augmented
}

/// `vkCreateSwapchainKHR` hook body.
///
/// # Safety
/// Must only be called from the layer's swapchain-create entry point:
/// `p_create_info` and `p_swapchain` are valid per the Vulkan spec,
/// `device` was created through this layer and belongs to `record`.
pub unsafe fn on_create_swapchain(
    record: &DeviceRecord,
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let create_swapchain = record.swapchain_fns.create_swapchain_khr;
    // SAFETY: the loader guarantees p_create_info points at a valid
    // swapchain create info for the duration of this call.
    let create_info = unsafe { &*p_create_info };

    let augmented_info = augment_create_info(create_info);
    // SAFETY: augmented_info only changes two scalar fields of the
    // caller's valid create info; all chained pointers are unchanged.
    let mut result = unsafe {
        create_swapchain(device, &augmented_info, p_allocator, p_swapchain)
    };
    let mut augmented = true;

    if result != vk::Result::SUCCESS {
        tracing::warn!(
            target: crate::log::TARGET,
            "Augmented swapchain creation failed ({result:?}), \
             retrying with original parameters"
        );
        augmented = false;
        // SAFETY: delegating the caller's own arguments verbatim.
        result = unsafe {
            create_swapchain(device, p_create_info, p_allocator, p_swapchain)
        };
        if result != vk::Result::SUCCESS {
            return result;
        }
    }

    // SAFETY: creation succeeded, so the next layer wrote a valid
    // handle through p_swapchain.
    let handle = unsafe { *p_swapchain };

    // SAFETY: handle is the swapchain just created from device.
    let images = match unsafe {
        query_swapchain_images(record, device, handle)
    } {
        Ok(images) => images,
        Err(e) => {
            tracing::warn!(
                target: crate::log::TARGET,
                "Could not query images for swapchain {handle:?} ({e:?}); \
                 presents against it will pass through"
            );
            Vec::new()
        }
    };

    let chain = SurfaceChainRecord {
        handle,
        images,
        format: create_info.image_format,
        extent: create_info.image_extent,
        augmented,
    };

    tracing::info!(
        target: crate::log::TARGET,
        "Tracking swapchain {handle:?}: {}x{}, {} images, {:?}{}",
        chain.extent.width,
        chain.extent.height,
        chain.images.len(),
        chain.format,
        if augmented { "" } else { " (unaugmented)" },
    );

    {
        let mut chains = record
            .chains
            .lock()
            .expect("surface-chain map lock poisoned");
        chains.insert(handle, chain.clone());
    }

    // Size the staging mirror for this chain. Failure is absorbed:
    // presents bypass until a later swapchain creation succeeds here.
    let mut engine = record.engine.lock().expect("engine lock poisoned");
    // SAFETY: record's dispatch table targets `device`, which is alive
    // for the duration of this hook.
    if let Err(e) = unsafe {
        engine.mirror.ensure(
            &record.fns,
            device,
            &record.memory_properties,
            chain.extent,
            chain.format,
        )
    } {
        tracing::warn!(
            target: crate::log::TARGET,
            "Staging mirror unavailable ({e}); frame doubling disabled \
             until the next swapchain creation"
        );
    }

    result
}

/// `vkDestroySwapchainKHR` hook body.
///
/// # Safety
/// Same contract as [`on_create_swapchain`]; `swapchain` must be a
/// swapchain of `device` or null.
pub unsafe fn on_destroy_swapchain(
    record: &DeviceRecord,
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    {
        let mut chains = record
            .chains
            .lock()
            .expect("surface-chain map lock poisoned");
        if chains.remove(&swapchain).is_some() {
            tracing::debug!(
                target: crate::log::TARGET,
                "Untracking swapchain {swapchain:?}"
            );
        }
    }
    // SAFETY: delegating the caller's own arguments.
    unsafe {
        (record.swapchain_fns.destroy_swapchain_khr)(
            device,
            swapchain,
            p_allocator,
        )
    };
}

/// Two-call image list query against the next layer.
///
/// # Safety
/// `swapchain` must be a live swapchain of `device`.
unsafe fn query_swapchain_images(
    record: &DeviceRecord,
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
) -> Result<Vec<vk::Image>, vk::Result> {
    let get_images = record.swapchain_fns.get_swapchain_images_khr;
    let mut count = 0u32;
    // SAFETY: count-query form; swapchain is live per caller contract.
    let result = unsafe {
        get_images(device, swapchain, &mut count, std::ptr::null_mut())
    };
    if result != vk::Result::SUCCESS {
        return Err(result);
    }
    let mut images = vec![vk::Image::null(); count as usize];
    // SAFETY: images has room for exactly `count` handles.
    let result = unsafe {
        get_images(device, swapchain, &mut count, images.as_mut_ptr())
    };
    if result != vk::Result::SUCCESS {
        return Err(result);
    }
    images.truncate(count as usize);
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn augmentation_raises_image_count_and_usage() {
        let info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(2)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);

        let augmented = augment_create_info(&info);

        assert_eq!(augmented.min_image_count, 3);
        assert!(
            augmented
                .image_usage
                .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        );
        assert!(
            augmented
                .image_usage
                .contains(vk::ImageUsageFlags::TRANSFER_SRC)
        );
        assert!(
            augmented
                .image_usage
                .contains(vk::ImageUsageFlags::TRANSFER_DST)
        );
    }

    #[test]
    fn augmentation_lower_bounds_at_three() {
        let info = vk::SwapchainCreateInfoKHR::default().min_image_count(1);
        assert_eq!(augment_create_info(&info).min_image_count, 3);
    }

    #[test]
    fn augmentation_adds_one_above_three() {
        let info = vk::SwapchainCreateInfoKHR::default().min_image_count(4);
        assert_eq!(augment_create_info(&info).min_image_count, 5);
    }

    #[test]
    fn augmentation_leaves_other_fields_untouched() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(2)
            .image_format(vk::Format::B8G8R8A8_UNORM)
            .image_extent(extent)
            .image_array_layers(1)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let augmented = augment_create_info(&info);

        assert_eq!(augmented.image_format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(augmented.image_extent.width, 1920);
        assert_eq!(augmented.image_extent.height, 1080);
        assert_eq!(augmented.image_array_layers, 1);
        assert_eq!(augmented.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(augmented.clipped, vk::TRUE);
    }
}
