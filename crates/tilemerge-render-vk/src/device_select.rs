// SPDX-License-Identifier: CEPL-1.0
//! Physical device scoring and selection.
//!
//! Every hard requirement is checked before any bonus is added: a device
//! missing one never gets a score at all, however fast it is.

use std::ffi::CStr;

use anyhow::{Context, Result};
use ash::khr::surface;
use ash::vk;
use tilemerge_core::ScratchArena;
use tracing::{debug, info};

use crate::error::GfxError;

const DISCRETE_BONUS: u64 = 1024;
const SHARED_QUEUE_BONUS: u64 = 1023;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Everything scoring needs to know about one physical device.
#[derive(Clone, Debug)]
pub struct DeviceCandidate<'a> {
    pub discrete: bool,
    pub max_image_dimension_2d: u32,
    pub geometry_shader: bool,
    pub missing_extensions: usize,
    pub surface_formats: usize,
    pub present_modes: usize,
    pub families: &'a [QueueFamilySupport],
}

/// Prefers a single family that does both; otherwise the first family of each
/// kind.
pub fn find_queue_families(families: &[QueueFamilySupport]) -> Option<QueueFamilies> {
    if let Some(i) = families.iter().position(|f| f.graphics && f.present) {
        return Some(QueueFamilies {
            graphics: i as u32,
            present: i as u32,
        });
    }
    let graphics = families.iter().position(|f| f.graphics)?;
    let present = families.iter().position(|f| f.present)?;
    Some(QueueFamilies {
        graphics: graphics as u32,
        present: present as u32,
    })
}

/// `None` when the device fails a hard requirement.
pub fn rate_device(c: &DeviceCandidate<'_>) -> Option<(u64, QueueFamilies)> {
    if !c.geometry_shader
        || c.missing_extensions > 0
        || c.surface_formats == 0
        || c.present_modes == 0
    {
        return None;
    }
    let families = find_queue_families(c.families)?;

    let mut score = 1 + u64::from(c.max_image_dimension_2d);
    if c.discrete {
        score += DISCRETE_BONUS;
    }
    if families.shared() {
        score += SHARED_QUEUE_BONUS;
    }
    Some((score, families))
}

/// Index of the strictly highest rating; the earliest device wins ties.
pub fn pick_best<I>(ratings: I) -> Option<(usize, u64, QueueFamilies)>
where
    I: IntoIterator<Item = Option<(u64, QueueFamilies)>>,
{
    let mut best: Option<(usize, u64, QueueFamilies)> = None;
    for (i, r) in ratings.into_iter().enumerate() {
        let Some((score, fam)) = r else { continue };
        if best.map_or(true, |(_, s, _)| score > s) {
            best = Some((i, score, fam));
        }
    }
    best
}

pub fn missing_extensions<'r>(available: &[&CStr], required: &'r [&'r CStr]) -> Vec<&'r CStr> {
    required
        .iter()
        .copied()
        .filter(|r| !available.contains(r))
        .collect()
}

pub struct SelectedDevice {
    pub phys: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub name: String,
    pub min_uniform_offset_alignment: u64,
    pub score: u64,
}

pub(crate) unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    required: &[&CStr],
    arena: &mut ScratchArena,
) -> Result<SelectedDevice> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.context("enumerate_physical_devices")?;

    let mut ratings = Vec::with_capacity(devices.len());
    for &phys in &devices {
        let rating = arena.scope(|scratch| -> Result<Option<(u64, QueueFamilies)>> {
            let props = unsafe { instance.get_physical_device_properties(phys) };
            let features = unsafe { instance.get_physical_device_features(phys) };
            let exts = unsafe { instance.enumerate_device_extension_properties(phys) }
                .context("enumerate_device_extension_properties")?;
            let names: Vec<&CStr> = exts
                .iter()
                .filter_map(|e| e.extension_name_as_c_str().ok())
                .collect();
            let missing = missing_extensions(&names, required);

            let formats = unsafe {
                surface_loader.get_physical_device_surface_formats(phys, surface)
            }
            .unwrap_or_default();
            let modes = unsafe {
                surface_loader.get_physical_device_surface_present_modes(phys, surface)
            }
            .unwrap_or_default();

            let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
            let families = scratch.alloc_slice_fill(qprops.len(), QueueFamilySupport::default())?;
            for (i, q) in qprops.iter().enumerate() {
                families[i] = QueueFamilySupport {
                    graphics: q.queue_count > 0 && q.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                    present: unsafe {
                        surface_loader.get_physical_device_surface_support(phys, i as u32, surface)
                    }
                    .unwrap_or(false),
                };
            }

            let candidate = DeviceCandidate {
                discrete: props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
                max_image_dimension_2d: props.limits.max_image_dimension2_d,
                geometry_shader: features.geometry_shader == vk::TRUE,
                missing_extensions: missing.len(),
                surface_formats: formats.len(),
                present_modes: modes.len(),
                families,
            };
            let rating = rate_device(&candidate);
            debug!(
                device = %props.device_name_as_c_str().map(|n| n.to_string_lossy()).unwrap_or_default(),
                ?missing,
                score = rating.map(|(s, _)| s).unwrap_or(0),
                "rated physical device"
            );
            Ok(rating)
        })?;
        ratings.push(rating);
    }

    let (i, score, families) = pick_best(ratings).ok_or(GfxError::NoAdequateDevice)?;
    let phys = devices[i];
    let props = unsafe { instance.get_physical_device_properties(phys) };
    let name = props
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!(
        "gpu: {name} (score {score}), graphics family {}, present family {}",
        families.graphics, families.present
    );
    Ok(SelectedDevice {
        phys,
        families,
        name,
        min_uniform_offset_alignment: props.limits.min_uniform_buffer_offset_alignment,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: true,
    };
    const GFX: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: false,
    };
    const PRESENT: QueueFamilySupport = QueueFamilySupport {
        graphics: false,
        present: true,
    };

    fn candidate(families: &[QueueFamilySupport]) -> DeviceCandidate<'_> {
        DeviceCandidate {
            discrete: false,
            max_image_dimension_2d: 4096,
            geometry_shader: true,
            missing_extensions: 0,
            surface_formats: 2,
            present_modes: 1,
            families,
        }
    }

    #[test]
    fn shared_family_is_preferred_over_split() {
        let fams = [GFX, PRESENT, BOTH];
        assert_eq!(
            find_queue_families(&fams),
            Some(QueueFamilies {
                graphics: 2,
                present: 2
            })
        );
        let split = [PRESENT, GFX];
        assert_eq!(
            find_queue_families(&split),
            Some(QueueFamilies {
                graphics: 1,
                present: 0
            })
        );
        assert_eq!(find_queue_families(&[GFX]), None);
    }

    #[test]
    fn score_adds_bonuses_on_top_of_dimension() {
        let fams = [BOTH];
        let mut c = candidate(&fams);
        assert_eq!(rate_device(&c).map(|r| r.0), Some(1 + 4096 + 1023));
        c.discrete = true;
        assert_eq!(rate_device(&c).map(|r| r.0), Some(1 + 4096 + 1023 + 1024));

        let split = [GFX, PRESENT];
        let c = candidate(&split);
        assert_eq!(rate_device(&c).map(|r| r.0), Some(1 + 4096));
    }

    #[test]
    fn each_hard_requirement_disqualifies() {
        let fams = [BOTH];
        let base = candidate(&fams);

        let mut c = base.clone();
        c.geometry_shader = false;
        assert!(rate_device(&c).is_none());

        let mut c = base.clone();
        c.missing_extensions = 1;
        assert!(rate_device(&c).is_none());

        let mut c = base.clone();
        c.surface_formats = 0;
        assert!(rate_device(&c).is_none());

        let mut c = base.clone();
        c.present_modes = 0;
        assert!(rate_device(&c).is_none());

        let gfx_only = [GFX];
        assert!(rate_device(&candidate(&gfx_only)).is_none());
    }

    #[test]
    fn discrete_without_geometry_shader_loses_to_integrated() {
        let fams = [BOTH];
        let mut big = candidate(&fams);
        big.discrete = true;
        big.max_image_dimension_2d = 32768;
        big.geometry_shader = false;
        let small = candidate(&fams);
        let best = pick_best([rate_device(&big), rate_device(&small)]).unwrap();
        assert_eq!(best.0, 1);
    }

    #[test]
    fn ties_keep_the_first_device() {
        let fams = [BOTH];
        let c = candidate(&fams);
        let best = pick_best([rate_device(&c), rate_device(&c)]).unwrap();
        assert_eq!(best.0, 0);
    }

    #[test]
    fn no_qualifying_device_yields_none() {
        assert!(pick_best([None, None]).is_none());
        assert!(pick_best(Vec::new()).is_none());
    }

    #[test]
    fn every_required_extension_must_be_present() {
        let avail = [c"VK_KHR_swapchain", c"VK_KHR_maintenance1"];
        let req = [c"VK_KHR_swapchain", c"VK_EXT_fancy"];
        assert_eq!(missing_extensions(&avail, &req), vec![c"VK_EXT_fancy"]);
        assert!(missing_extensions(&avail, &req[..1]).is_empty());
    }
}
