use std::ffi::c_void;
use std::ptr;

use vulkanalia::{
    Instance,
    vk::{self, InstanceV1_0, InstanceV1_1},
};

/// Enable instance validation layers when set and non-empty.
pub const ENV_ENABLE_VALIDATION: &str = "VULKAN_ENABLE_VALIDATION_LAYERS";
/// Force the deferred launch protocol when set and non-empty.
pub const ENV_DISABLE_PUSH_DESCRIPTOR: &str = "VULKAN_DISABLE_PUSH_DESCRIPTOR";
/// Force plain (non-dedicated) allocations when set and non-empty.
pub const ENV_DISABLE_DEDICATED_ALLOCATION: &str = "VULKAN_DISABLE_DEDICATED_ALLOCATION";

/// Capability map for one physical device, built once at init.
///
/// Mirrors what the kernel compiler needs to know about the device plus the
/// flags that select the runtime's launch and allocation strategies.
#[derive(Clone, Debug)]
pub struct Target {
    pub supports_float16: bool,
    pub supports_float32: bool,
    pub supports_float64: bool,
    pub supports_int8: bool,
    pub supports_int16: bool,
    pub supports_int32: bool,
    pub supports_int64: bool,
    pub supports_8bit_buffer: bool,
    pub supports_16bit_buffer: bool,
    pub supports_storage_buffer_storage_class: bool,
    pub supports_push_descriptor: bool,
    pub supports_dedicated_allocation: bool,
    pub supported_subgroup_operations: vk::SubgroupFeatureFlags,

    pub max_num_threads: u32,
    pub thread_warp_size: u32,
    pub max_block_size: [u32; 3],
    pub max_push_constants_size: u32,
    pub max_uniform_buffer_range: u32,
    pub max_storage_buffer_range: u32,
    pub max_per_stage_descriptor_storage_buffers: u32,
    pub max_shared_memory_per_block: u32,

    pub device_name: String,
    pub driver_version: u32,
    pub vulkan_api_version: u32,
    pub max_spirv_version: u32,
}

impl Target {
    pub const KIND: &'static str = "vulkan";
}

/// True when the variable is set and non-empty.
pub fn env_flag(name: &str) -> bool {
    flag_value(std::env::var_os(name))
}

fn flag_value(value: Option<std::ffi::OsString>) -> bool {
    value.map(|v| !v.is_empty()).unwrap_or(false)
}

/// An optional capability that needs two extensions and honours a disable flag.
fn extension_pair_enabled(has_first: bool, has_second: bool, disabled: bool) -> bool {
    has_first && has_second && !disabled
}

pub(crate) fn version_major(version: u32) -> u32 {
    version >> 22
}

pub(crate) fn version_minor(version: u32) -> u32 {
    (version >> 12) & 0x3ff
}

pub(crate) fn version_patch(version: u32) -> u32 {
    version & 0xfff
}

pub(crate) fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version_major(version),
        version_minor(version),
        version_patch(version)
    )
}

/// Maximum SPIR-V version usable on a device, from the "Versions and Formats"
/// section of the Vulkan spec.
pub(crate) fn max_spirv_version(api_version: u32, has_spirv_1_4: bool) -> u32 {
    if api_version >= vk::make_version(1, 2, 0) {
        0x10500
    } else if has_spirv_1_4 {
        0x10400
    } else if api_version >= vk::make_version(1, 1, 0) {
        0x10300
    } else {
        0x10000
    }
}

/// Limit the usable API version to the one that passed conformance tests,
/// when the driver reports a conformance version. Only major and minor are
/// compared; the clamped version always carries patch 0.
pub(crate) fn clamp_to_conformance(api_version: u32, conformance: Option<(u32, u32)>) -> u32 {
    let Some((conf_major, conf_minor)) = conformance else {
        return api_version;
    };
    let api_major = version_major(api_version);
    let api_minor = version_minor(api_version);
    if api_major > conf_major || (api_major == conf_major && api_minor > conf_minor) {
        vk::make_version(conf_major, conf_minor, 0)
    } else {
        api_version
    }
}

fn b32(value: vk::Bool32) -> bool {
    value != 0
}

fn device_name_string(properties: &vk::PhysicalDeviceProperties) -> String {
    String::from_utf8_lossy(
        &properties
            .device_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect::<Vec<u8>>(),
    )
    .to_string()
}

/// Query everything the runtime needs to know about one physical device.
///
/// Uses the `properties2`/`features2` chains when the instance supports them,
/// otherwise falls back to the Vulkan 1.0 queries and leaves the
/// extension-only feature structs zeroed.
pub(crate) fn describe_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    has_properties2: bool,
    instance_extensions: &[String],
    device_extensions: &[String],
) -> Target {
    let has_extension = |query: &str| {
        device_extensions.iter().any(|e| e == query)
            || instance_extensions.iter().any(|e| e == query)
    };

    // Initial v1.0 query so the apiVersion is known before chaining.
    let mut properties =
        unsafe { instance.get_physical_device_properties(physical_device) };

    let mut driver = vk::PhysicalDeviceDriverProperties {
        s_type: vk::StructureType::PHYSICAL_DEVICE_DRIVER_PROPERTIES,
        next: ptr::null_mut(),
        ..Default::default()
    };
    let mut subgroup = vk::PhysicalDeviceSubgroupProperties {
        s_type: vk::StructureType::PHYSICAL_DEVICE_SUBGROUP_PROPERTIES,
        next: ptr::null_mut(),
        ..Default::default()
    };

    let has_driver_properties = has_extension("VK_KHR_driver_properties");

    let mut storage_8bit = vk::PhysicalDevice8BitStorageFeatures {
        s_type: vk::StructureType::PHYSICAL_DEVICE_8BIT_STORAGE_FEATURES,
        next: ptr::null_mut(),
        ..Default::default()
    };
    let mut storage_16bit = vk::PhysicalDevice16BitStorageFeatures {
        s_type: vk::StructureType::PHYSICAL_DEVICE_16BIT_STORAGE_FEATURES,
        next: ptr::null_mut(),
        ..Default::default()
    };
    let mut float16_int8 = vk::PhysicalDeviceShaderFloat16Int8Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_SHADER_FLOAT16_INT8_FEATURES,
        next: ptr::null_mut(),
        ..Default::default()
    };

    let features = if has_properties2 {
        unsafe {
            // Chain the property structs the device can answer for.
            let mut props2 = vk::PhysicalDeviceProperties2 {
                s_type: vk::StructureType::PHYSICAL_DEVICE_PROPERTIES_2,
                next: ptr::null_mut(),
                properties: Default::default(),
            };
            let mut tail: *mut *mut c_void = &mut props2.next;
            if has_driver_properties {
                *tail = &mut driver as *mut _ as *mut c_void;
                tail = &mut driver.next;
            }
            if properties.api_version >= vk::make_version(1, 1, 0) {
                *tail = &mut subgroup as *mut _ as *mut c_void;
            }
            instance.get_physical_device_properties2(physical_device, &mut props2);
            properties = props2.properties;

            let mut features2 = vk::PhysicalDeviceFeatures2 {
                s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
                next: ptr::null_mut(),
                features: Default::default(),
            };
            let mut tail: *mut *mut c_void = &mut features2.next;
            if has_extension("VK_KHR_8bit_storage") {
                *tail = &mut storage_8bit as *mut _ as *mut c_void;
                tail = &mut storage_8bit.next;
            }
            if has_extension("VK_KHR_16bit_storage") {
                *tail = &mut storage_16bit as *mut _ as *mut c_void;
                tail = &mut storage_16bit.next;
            }
            if has_extension("VK_KHR_shader_float16_int8") {
                *tail = &mut float16_int8 as *mut _ as *mut c_void;
            }
            instance.get_physical_device_features2(physical_device, &mut features2);
            features2.features
        }
    } else {
        unsafe { instance.get_physical_device_features(physical_device) }
    };

    // Subgroup operations only count when usable from the compute stage.
    let supported_subgroup_operations = if subgroup
        .supported_stages
        .contains(vk::ShaderStageFlags::COMPUTE)
    {
        subgroup.supported_operations
    } else {
        vk::SubgroupFeatureFlags::empty()
    };

    // Warp size must be at least 1 even when the query is unavailable.
    let thread_warp_size = subgroup.subgroup_size.max(1);

    let conformance = has_driver_properties.then(|| {
        (
            driver.conformance_version.major as u32,
            driver.conformance_version.minor as u32,
        )
    });
    let vulkan_api_version = clamp_to_conformance(properties.api_version, conformance);

    let supports_push_descriptor = extension_pair_enabled(
        has_extension("VK_KHR_push_descriptor"),
        has_extension("VK_KHR_descriptor_update_template"),
        env_flag(ENV_DISABLE_PUSH_DESCRIPTOR),
    );
    let supports_dedicated_allocation = extension_pair_enabled(
        has_extension("VK_KHR_get_memory_requirements2"),
        has_extension("VK_KHR_dedicated_allocation"),
        env_flag(ENV_DISABLE_DEDICATED_ALLOCATION),
    );

    Target {
        supports_float16: b32(float16_int8.shader_float16),
        supports_float32: true,
        supports_float64: b32(features.shader_float64),
        supports_int8: b32(float16_int8.shader_int8),
        supports_int16: b32(features.shader_int16),
        supports_int32: true,
        supports_int64: b32(features.shader_int64),
        supports_8bit_buffer: b32(storage_8bit.storage_buffer_8bit_access),
        supports_16bit_buffer: b32(storage_16bit.storage_buffer_16bit_access),
        supports_storage_buffer_storage_class: has_extension(
            "VK_KHR_storage_buffer_storage_class",
        ),
        supports_push_descriptor,
        supports_dedicated_allocation,
        supported_subgroup_operations,

        max_num_threads: properties.limits.max_compute_work_group_invocations,
        thread_warp_size,
        max_block_size: properties.limits.max_compute_work_group_size,
        max_push_constants_size: properties.limits.max_push_constants_size,
        max_uniform_buffer_range: properties.limits.max_uniform_buffer_range,
        max_storage_buffer_range: properties.limits.max_storage_buffer_range,
        max_per_stage_descriptor_storage_buffers: properties
            .limits
            .max_per_stage_descriptor_storage_buffers,
        max_shared_memory_per_block: properties.limits.max_compute_shared_memory_size,

        device_name: device_name_string(&properties),
        driver_version: properties.driver_version,
        vulkan_api_version,
        max_spirv_version: max_spirv_version(
            vulkan_api_version,
            has_extension("VK_KHR_spirv_1_4"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_version_follows_api_version() {
        assert_eq!(max_spirv_version(vk::make_version(1, 0, 0), false), 0x10000);
        assert_eq!(max_spirv_version(vk::make_version(1, 0, 0), true), 0x10400);
        assert_eq!(max_spirv_version(vk::make_version(1, 1, 0), false), 0x10300);
        assert_eq!(max_spirv_version(vk::make_version(1, 1, 0), true), 0x10400);
        assert_eq!(max_spirv_version(vk::make_version(1, 2, 0), false), 0x10500);
        assert_eq!(max_spirv_version(vk::make_version(1, 3, 0), true), 0x10500);
    }

    #[test]
    fn spirv_version_is_monotone() {
        let apis = [
            vk::make_version(1, 0, 0),
            vk::make_version(1, 1, 0),
            vk::make_version(1, 2, 0),
        ];
        for has_ext in [false, true] {
            let mut last = 0;
            for api in apis {
                let v = max_spirv_version(api, has_ext);
                assert!(v >= last);
                last = v;
            }
        }
        for api in apis {
            assert!(max_spirv_version(api, true) >= max_spirv_version(api, false));
        }
    }

    #[test]
    fn conformance_clamp_compares_major_minor_only() {
        let api = vk::make_version(1, 2, 135);
        // conformance at or above the api version leaves it untouched
        assert_eq!(clamp_to_conformance(api, Some((1, 2))), api);
        assert_eq!(clamp_to_conformance(api, Some((1, 3))), api);
        assert_eq!(clamp_to_conformance(api, None), api);
        // a lower conformance version clamps, and always zeroes the patch
        let clamped = clamp_to_conformance(api, Some((1, 1)));
        assert_eq!(clamped, vk::make_version(1, 1, 0));
        assert_eq!(version_patch(clamped), 0);
    }

    #[test]
    fn push_descriptor_needs_both_extensions_and_no_disable() {
        assert!(extension_pair_enabled(true, true, false));
        assert!(!extension_pair_enabled(true, false, false));
        assert!(!extension_pair_enabled(false, true, false));
        // the disable flag wins even when both extensions are present
        assert!(!extension_pair_enabled(true, true, true));
    }

    #[test]
    fn flag_value_requires_set_and_non_empty() {
        assert!(!flag_value(None));
        assert!(!flag_value(Some(std::ffi::OsString::new())));
        assert!(flag_value(Some(std::ffi::OsString::from("1"))));
        assert!(flag_value(Some(std::ffi::OsString::from("0"))));
    }

    #[test]
    fn version_fields_round_trip() {
        let v = vk::make_version(1, 3, 275);
        assert_eq!(version_major(v), 1);
        assert_eq!(version_minor(v), 3);
        assert_eq!(version_patch(v), 275);
        assert_eq!(version_string(v), "1.3.275");
    }
}
