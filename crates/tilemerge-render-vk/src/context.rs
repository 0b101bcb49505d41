// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical/logical device and queues.
//!
//! STRICT ORDER:
//! 1) instance (WSI extensions, debug utils in debug builds)
//! 2) surface from that instance
//! 3) physical device scored against that surface
//! 4) logical device with one queue per distinct family
//!
//! Every step stores its handle in the context as soon as it exists, so a
//! failure part way leaves a context the teardown sweep can clean up.

use std::ffi::{CStr, CString};

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::vk;
use ash::{Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tilemerge_core::ScratchArena;
use tracing::{info, warn};

use crate::debug;
use crate::device_select::{select_physical_device, QueueFamilies};
use crate::teardown::{AshDestroyer, TeardownRecord};

/// Scratch space for enumeration during device selection.
const SELECT_SCRATCH_BYTES: usize = 64 * 1024;

pub struct GraphicsContext {
    entry: Entry,
    instance: Option<Instance>,
    debug_utils: Option<debug_utils::Instance>,
    debug_messenger: vk::DebugUtilsMessengerEXT,
    surface_loader: Option<surface::Instance>,
    surface: vk::SurfaceKHR,
    device: Option<ash::Device>,
    swapchain_loader: Option<swapchain::Device>,

    pub phys: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub min_uniform_offset_alignment: u64,
}

impl GraphicsContext {
    pub fn empty() -> Self {
        Self {
            entry: Entry::linked(),
            instance: None,
            debug_utils: None,
            debug_messenger: vk::DebugUtilsMessengerEXT::null(),
            surface_loader: None,
            surface: vk::SurfaceKHR::null(),
            device: None,
            swapchain_loader: None,
            phys: vk::PhysicalDevice::null(),
            families: QueueFamilies {
                graphics: 0,
                present: 0,
            },
            graphics_queue: vk::Queue::null(),
            present_queue: vk::Queue::null(),
            min_uniform_offset_alignment: 1,
        }
    }

    pub fn instance(&self) -> Result<&Instance> {
        self.instance.as_ref().ok_or_else(|| anyhow!("vulkan instance not created"))
    }

    pub fn device(&self) -> Result<&ash::Device> {
        self.device.as_ref().ok_or_else(|| anyhow!("logical device not created"))
    }

    pub fn surface_loader(&self) -> Result<&surface::Instance> {
        self.surface_loader
            .as_ref()
            .ok_or_else(|| anyhow!("surface loader not created"))
    }

    pub fn swapchain_loader(&self) -> Result<&swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| anyhow!("swapchain loader not created"))
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn destroyer(&self) -> AshDestroyer<'_> {
        AshDestroyer {
            instance: self.instance.as_ref(),
            device: self.device.as_ref(),
            surface: self.surface_loader.as_ref(),
            swapchain: self.swapchain_loader.as_ref(),
            debug_utils: self.debug_utils.as_ref(),
        }
    }

    /// Moves the context-owned handles into `record`.
    pub fn hand_over(&mut self, record: &mut TeardownRecord) {
        record.instance = self.instance.as_ref().map_or(vk::Instance::null(), |i| i.handle());
        record.device = self.device.as_ref().map_or(vk::Device::null(), |d| d.handle());
        record.surface = std::mem::replace(&mut self.surface, vk::SurfaceKHR::null());
        record.debug_messenger =
            std::mem::replace(&mut self.debug_messenger, vk::DebugUtilsMessengerEXT::null());
    }

    pub unsafe fn create_instance(
        &mut self,
        display: &dyn HasDisplayHandle,
        app_name: &str,
        layers: &[String],
    ) -> Result<()> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let app = CString::new(app_name.replace('\0', "")).context("application name")?;

        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app.as_ptr(),
            application_version: 0,
            p_engine_name: c"No Engine".as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_0,
            ..Default::default()
        };

        let mut exts = ash_window::enumerate_required_extensions(dh)
            .context("enumerate_required_extensions")?
            .to_vec();
        let want_debug = cfg!(debug_assertions);
        if want_debug {
            exts.push(debug_utils::NAME.as_ptr());
        }

        let layer_names = if want_debug {
            let offered = unsafe { self.entry.enumerate_instance_layer_properties() }
                .context("enumerate_instance_layer_properties")?;
            let offered: Vec<&CStr> = offered
                .iter()
                .filter_map(|l| l.layer_name_as_c_str().ok())
                .collect();
            available_layers(layers, &offered)
        } else {
            Vec::new()
        };
        let layer_ptrs: Vec<*const std::ffi::c_char> =
            layer_names.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: exts.len() as u32,
            pp_enabled_extension_names: exts.as_ptr(),
            enabled_layer_count: layer_ptrs.len() as u32,
            pp_enabled_layer_names: layer_ptrs.as_ptr(),
            ..Default::default()
        };
        let instance =
            unsafe { self.entry.create_instance(&create_info, None) }.context("create_instance")?;
        self.surface_loader = Some(surface::Instance::new(&self.entry, &instance));

        if want_debug {
            let loader = debug_utils::Instance::new(&self.entry, &instance);
            match unsafe { debug::create_messenger(&loader) } {
                Ok(m) => self.debug_messenger = m,
                Err(e) => warn!("debug messenger unavailable: {e:#}"),
            }
            self.debug_utils = Some(loader);
        }
        self.instance = Some(instance);
        Ok(())
    }

    pub unsafe fn create_surface(
        &mut self,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
    ) -> Result<()> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window.window_handle().map_err(|e| anyhow!("{e}"))?.as_raw();
        let instance = self.instance()?;
        self.surface = unsafe { ash_window::create_surface(&self.entry, instance, dh, wh, None) }
            .context("ash_window::create_surface")?;
        Ok(())
    }

    /// Picks the best physical device and creates the logical device with the
    /// required extensions enabled and no optional features.
    pub unsafe fn create_device(&mut self, extensions: &[String]) -> Result<()> {
        let required = device_extensions(extensions)?;
        let required_refs: Vec<&CStr> = required.iter().map(|c| c.as_c_str()).collect();

        let mut arena = ScratchArena::new(SELECT_SCRATCH_BYTES);
        let instance = self.instance()?;
        let selected = unsafe {
            select_physical_device(
                instance,
                self.surface_loader()?,
                self.surface,
                &required_refs,
                &mut arena,
            )
        }?;

        let priorities = [1.0_f32];
        let qinfos: Vec<vk::DeviceQueueCreateInfo> = selected
            .families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();
        let ext_ptrs: Vec<*const std::ffi::c_char> = required.iter().map(|c| c.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: qinfos.len() as u32,
            p_queue_create_infos: qinfos.as_ptr(),
            enabled_extension_count: ext_ptrs.len() as u32,
            pp_enabled_extension_names: ext_ptrs.as_ptr(),
            p_enabled_features: &features,
            ..Default::default()
        };
        let device = unsafe { instance.create_device(selected.phys, &dinfo, None) }
            .context("create_device")?;

        let swapchain_loader = swapchain::Device::new(instance, &device);
        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(selected.families.graphics, 0),
                device.get_device_queue(selected.families.present, 0),
            )
        };

        self.swapchain_loader = Some(swapchain_loader);
        self.graphics_queue = graphics_queue;
        self.present_queue = present_queue;
        self.phys = selected.phys;
        self.families = selected.families;
        self.min_uniform_offset_alignment = selected.min_uniform_offset_alignment.max(1);
        self.device = Some(device);
        info!(
            "device ready: {} (scratch peak {} bytes)",
            selected.name,
            arena.peak()
        );
        Ok(())
    }

    pub unsafe fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: self.families.graphics,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        unsafe { self.device()?.create_command_pool(&info, None) }.context("create_command_pool")
    }
}

/// The configured device extensions as C strings, with `VK_KHR_swapchain`
/// always present.
pub fn device_extensions(configured: &[String]) -> Result<Vec<CString>> {
    let mut out = Vec::with_capacity(configured.len() + 1);
    for name in configured {
        let c = CString::new(name.as_str())
            .with_context(|| format!("device extension name {name:?}"))?;
        if !out.contains(&c) {
            out.push(c);
        }
    }
    if !out.iter().any(|c| c.as_c_str() == swapchain::NAME) {
        out.push(swapchain::NAME.to_owned());
    }
    Ok(out)
}

/// Requested layers the loader actually offers; the rest are skipped with a
/// warning.
pub fn available_layers(requested: &[String], offered: &[&CStr]) -> Vec<CString> {
    requested
        .iter()
        .filter_map(|name| {
            let c = CString::new(name.as_str()).ok()?;
            if offered.contains(&c.as_c_str()) {
                Some(c)
            } else {
                warn!("validation layer {name} not available; skipping");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_extension_is_always_requested() {
        let exts = device_extensions(&[]).unwrap();
        assert_eq!(exts, vec![swapchain::NAME.to_owned()]);

        let exts = device_extensions(&["VK_KHR_swapchain".into(), "VK_KHR_swapchain".into()])
            .unwrap();
        assert_eq!(exts.len(), 1);
    }

    #[test]
    fn configured_extensions_keep_their_order() {
        let exts =
            device_extensions(&["VK_KHR_maintenance1".into(), "VK_KHR_swapchain".into()]).unwrap();
        assert_eq!(exts[0].as_c_str(), c"VK_KHR_maintenance1");
        assert_eq!(exts[1].as_c_str(), c"VK_KHR_swapchain");
    }

    #[test]
    fn interior_nul_in_extension_name_is_an_error() {
        assert!(device_extensions(&["bad\0name".into()]).is_err());
    }

    #[test]
    fn missing_layers_are_dropped() {
        let offered = [c"VK_LAYER_KHRONOS_validation"];
        let got = available_layers(
            &["VK_LAYER_KHRONOS_validation".into(), "VK_LAYER_missing".into()],
            &offered,
        );
        assert_eq!(got, vec![c"VK_LAYER_KHRONOS_validation".to_owned()]);
    }
}
