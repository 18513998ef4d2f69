//! The staging mirror: two device-local images that retain the last
//! two presented frames.
//!
//! `current` receives a copy of the outgoing swapchain image during
//! every augmented present; `swap` then rotates it into `previous`,
//! which is what the synthesis step samples on the next present. The
//! pair is (re)sized whenever a swapchain with a new extent or format
//! is created, and only after the device has gone fully idle, which is
//! the simplest way to guarantee no in-flight work still references
//! the old images.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Vulkan error waiting for device idle before resize: {0}")]
    WaitIdle(vk::Result),
    #[error("Vulkan error creating staging image: {0}")]
    CreateImage(vk::Result),
    #[error("No device-local memory type matches the staging image")]
    NoSuitableMemoryType,
    #[error("Vulkan error allocating staging memory: {0}")]
    AllocateMemory(vk::Result),
    #[error("Vulkan error binding staging memory: {0}")]
    BindMemory(vk::Result),
}

/// One staging slot: an image and the memory bound to it.
#[derive(Debug, Clone, Copy)]
pub struct StagingImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

/// The previous/current staging pair for one device.
///
/// Either both slots exist with matching (extent, format) or neither
/// does; [`ensure`](Self::ensure) and [`destroy`](Self::destroy) are
/// the only transitions between those states.
#[derive(Debug, Default)]
pub struct StagingMirror {
    previous: Option<StagingImage>,
    current: Option<StagingImage>,
    has_previous: bool,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl StagingMirror {
    /// True when both slots exist and were sized for exactly this
    /// extent and format.
    pub fn is_valid_for(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> bool {
        self.previous.is_some()
            && self.current.is_some()
            && self.extent.width == extent.width
            && self.extent.height == extent.height
            && self.format == format
    }

    /// `previous` holds the frame presented one cycle ago only after
    /// both slots have been written at least once in succession.
    pub fn has_previous(&self) -> bool {
        self.has_previous
    }

    pub fn previous(&self) -> Option<&StagingImage> {
        self.previous.as_ref()
    }

    pub fn current(&self) -> Option<&StagingImage> {
        self.current.as_ref()
    }

    /// Rotate the pair: the image just captured becomes the previous
    /// frame for the next present.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        self.has_previous = true;
    }

    /// Make both slots exist with the given extent and format,
    /// recreating them after a device-wide idle if they do not.
    ///
    /// On failure the mirror is left empty (torn back down), so the
    /// engine bypasses presents until a later swapchain creation runs
    /// this again.
    ///
    /// # Safety
    /// `fns` must dispatch to `device`, which must be alive.
    /// `memory_properties` must describe the physical device that
    /// `device` was created from. No other thread may be recording or
    /// submitting work for `device` during the call.
    pub unsafe fn ensure(
        &mut self,
        fns: &ash::DeviceFnV1_0,
        device: vk::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<(), MirrorError> {
        if self.is_valid_for(extent, format) {
            return Ok(());
        }

        // The old images may still be referenced by submitted work;
        // a full idle is required before they can be released.
        // SAFETY: device is alive per caller contract.
        let result = unsafe { (fns.device_wait_idle)(device) };
        if result != vk::Result::SUCCESS {
            return Err(MirrorError::WaitIdle(result));
        }

        // SAFETY: the device just went idle.
        unsafe { self.destroy(fns, device) };

        // SAFETY: per caller contract.
        let first = unsafe {
            create_staging_image(fns, device, memory_properties, extent, format)
        }?;
        // SAFETY: per caller contract.
        let second = match unsafe {
            create_staging_image(fns, device, memory_properties, extent, format)
        } {
            Ok(image) => image,
            Err(e) => {
                // SAFETY: `first` was created above and nothing has
                // been submitted against it.
                unsafe { destroy_staging_image(fns, device, &first) };
                return Err(e);
            }
        };

        self.previous = Some(first);
        self.current = Some(second);
        self.has_previous = false;
        self.extent = extent;
        self.format = format;

        tracing::info!(
            target: crate::log::TARGET,
            "Staging mirror sized {}x{} {:?}",
            extent.width,
            extent.height,
            format,
        );
        Ok(())
    }

    /// Release both slots and their memory.
    ///
    /// # Safety
    /// `fns` must dispatch to `device`; no submitted work may still
    /// reference the staging images.
    pub unsafe fn destroy(
        &mut self,
        fns: &ash::DeviceFnV1_0,
        device: vk::Device,
    ) {
        for slot in [self.previous.take(), self.current.take()]
            .into_iter()
            .flatten()
        {
            // SAFETY: slot was created from device and is unreferenced
            // per caller contract.
            unsafe { destroy_staging_image(fns, device, &slot) };
        }
        self.has_previous = false;
    }
}

/// First memory type whose bit is set in `type_bits` and whose
/// property flags contain everything in `required`.
fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&index| {
        type_bits & (1 << index) != 0
            && memory_properties.memory_types[index as usize]
                .property_flags
                .contains(required)
    })
}

/// # Safety
/// Same contract as [`StagingMirror::ensure`].
unsafe fn create_staging_image(
    fns: &ash::DeviceFnV1_0,
    device: vk::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    extent: vk::Extent2D,
    format: vk::Format,
) -> Result<StagingImage, MirrorError> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let mut image = vk::Image::null();
    // SAFETY: create_info is fully initialised with no chained
    // pointers; device is alive per caller contract.
    let result = unsafe {
        (fns.create_image)(device, &create_info, std::ptr::null(), &mut image)
    };
    if result != vk::Result::SUCCESS {
        return Err(MirrorError::CreateImage(result));
    }

    let mut requirements = vk::MemoryRequirements::default();
    // SAFETY: image was just created from device.
    unsafe {
        (fns.get_image_memory_requirements)(device, image, &mut requirements)
    };

    let Some(type_index) = find_memory_type(
        memory_properties,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ) else {
        // SAFETY: image is unbound and unreferenced.
        unsafe { (fns.destroy_image)(device, image, std::ptr::null()) };
        return Err(MirrorError::NoSuitableMemoryType);
    };

    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);

    let mut memory = vk::DeviceMemory::null();
    // SAFETY: allocate_info is fully initialised; type_index comes
    // from this physical device's memory type table.
    let result = unsafe {
        (fns.allocate_memory)(
            device,
            &allocate_info,
            std::ptr::null(),
            &mut memory,
        )
    };
    if result != vk::Result::SUCCESS {
        // SAFETY: image is unbound and unreferenced.
        unsafe { (fns.destroy_image)(device, image, std::ptr::null()) };
        return Err(MirrorError::AllocateMemory(result));
    }

    // SAFETY: memory was allocated against image's requirements with
    // offset 0.
    let result = unsafe { (fns.bind_image_memory)(device, image, memory, 0) };
    if result != vk::Result::SUCCESS {
        // SAFETY: both were created above and are unreferenced.
        unsafe {
            (fns.destroy_image)(device, image, std::ptr::null());
            (fns.free_memory)(device, memory, std::ptr::null());
        }
        return Err(MirrorError::BindMemory(result));
    }

    Ok(StagingImage { image, memory })
}

/// # Safety
/// `staging` must have been created from `device` and be unreferenced
/// by any submitted work.
unsafe fn destroy_staging_image(
    fns: &ash::DeviceFnV1_0,
    device: vk::Device,
    staging: &StagingImage,
) {
    // SAFETY: per caller contract; image before memory.
    unsafe {
        (fns.destroy_image)(device, staging.image, std::ptr::null());
        (fns.free_memory)(device, staging.memory, std::ptr::null());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn memory_properties(
        types: &[(u32, vk::MemoryPropertyFlags)],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (index, &(heap_index, flags)) in types.iter().enumerate() {
            props.memory_types[index] = vk::MemoryType {
                property_flags: flags,
                heap_index,
            };
        }
        props
    }

    #[test]
    fn memory_type_scan_picks_first_device_local_match() {
        let props = memory_properties(&[
            (0, vk::MemoryPropertyFlags::HOST_VISIBLE),
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            (1, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        ]);

        let chosen = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn memory_type_scan_respects_requirement_mask() {
        let props = memory_properties(&[
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        ]);

        // Type 0 is excluded by the requirement bits.
        let chosen = find_memory_type(
            &props,
            0b10,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn memory_type_scan_fails_when_nothing_matches() {
        let props =
            memory_properties(&[(0, vk::MemoryPropertyFlags::HOST_VISIBLE)]);

        let chosen = find_memory_type(
            &props,
            0b1,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(chosen, None);
    }

    fn fake_slot(raw: u64) -> StagingImage {
        StagingImage {
            image: vk::Image::from_raw(raw),
            memory: vk::DeviceMemory::from_raw(raw + 100),
        }
    }

    #[test]
    fn swap_rotates_slots_and_sets_has_previous() {
        let mut mirror = StagingMirror {
            previous: Some(fake_slot(1)),
            current: Some(fake_slot(2)),
            has_previous: false,
            extent: vk::Extent2D {
                width: 8,
                height: 8,
            },
            format: vk::Format::B8G8R8A8_UNORM,
        };

        mirror.swap();

        assert!(mirror.has_previous());
        assert_eq!(mirror.previous().unwrap().image.as_raw(), 2);
        assert_eq!(mirror.current().unwrap().image.as_raw(), 1);
    }

    #[test]
    fn validity_requires_both_slots_and_matching_shape() {
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let format = vk::Format::B8G8R8A8_UNORM;

        let empty = StagingMirror::default();
        assert!(!empty.is_valid_for(extent, format));

        let full = StagingMirror {
            previous: Some(fake_slot(1)),
            current: Some(fake_slot(2)),
            has_previous: false,
            extent,
            format,
        };
        assert!(full.is_valid_for(extent, format));
        assert!(!full.is_valid_for(
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
            format
        ));
        assert!(!full.is_valid_for(extent, vk::Format::R8G8B8A8_UNORM));
    }
}
