// SPDX-License-Identifier: CEPL-1.0
//! Buffer allocation and synchronous transfers.

use anyhow::{Context, Result};
use ash::vk;

use crate::error::GfxError;

pub(crate) fn pick_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// Rounds `size` up to the next multiple of `align` (a power of two, or 0).
pub(crate) fn align_up(size: u64, align: u64) -> u64 {
    if align <= 1 {
        return size;
    }
    (size + align - 1) & !(align - 1)
}

pub(crate) unsafe fn create_buffer_and_memory(
    instance: &ash::Instance,
    device: &ash::Device,
    phys: vk::PhysicalDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    props: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buf = unsafe { device.create_buffer(&bci, None) }.context("create_buffer")?;
    let req = unsafe { device.get_buffer_memory_requirements(buf) };
    let mem_props = unsafe { instance.get_physical_device_memory_properties(phys) };
    let Some(mem_type) = pick_memory_type(&mem_props, req.memory_type_bits, props) else {
        unsafe { device.destroy_buffer(buf, None) };
        return Err(GfxError::NoMemoryType { required: props }.into());
    };
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: mem_type,
        ..Default::default()
    };
    let mem = match unsafe { device.allocate_memory(&mai, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_buffer(buf, None) };
            return Err(e).context("allocate_memory");
        }
    };
    if let Err(e) = unsafe { device.bind_buffer_memory(buf, mem, 0) } {
        unsafe {
            device.destroy_buffer(buf, None);
            device.free_memory(mem, None);
        }
        return Err(e).context("bind_buffer_memory");
    }
    Ok((buf, mem))
}

/// Writes `bytes` at `offset` into host-visible, host-coherent memory.
pub(crate) unsafe fn write_mapped(
    device: &ash::Device,
    mem: vk::DeviceMemory,
    offset: vk::DeviceSize,
    bytes: &[u8],
) -> Result<()> {
    let ptr = unsafe {
        device.map_memory(
            mem,
            offset,
            bytes.len() as vk::DeviceSize,
            vk::MemoryMapFlags::empty(),
        )
    }
    .context("map_memory")?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        device.unmap_memory(mem);
    }
    Ok(())
}

/// Records and submits a one-shot command buffer, then blocks until the queue
/// drains.
pub(crate) unsafe fn one_shot(
    device: &ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    record: impl FnOnce(vk::CommandBuffer),
) -> Result<()> {
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmds = unsafe { device.allocate_command_buffers(&ai) }
        .context("allocate_command_buffers(one-shot)")?;
    let cmd = cmds[0];
    let run = || -> Result<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { device.begin_command_buffer(cmd, &bi) }.context("begin_command_buffer")?;
        record(cmd);
        unsafe { device.end_command_buffer(cmd) }.context("end_command_buffer")?;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        unsafe {
            device
                .queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null())
                .context("queue_submit(one-shot)")?;
            device.queue_wait_idle(queue).context("queue_wait_idle")?;
        }
        Ok(())
    };
    let out = run();
    unsafe { device.free_command_buffers(pool, &cmds) };
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            p.memory_types[i].property_flags = f;
        }
        p
    }

    #[test]
    fn picks_first_type_allowed_by_mask_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(pick_memory_type(&p, 0b111, host), Some(1));
        assert_eq!(pick_memory_type(&p, 0b100, host), Some(2));
        assert_eq!(
            pick_memory_type(&p, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn reports_none_when_nothing_matches() {
        let p = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            pick_memory_type(&p, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
        assert_eq!(pick_memory_type(&p, 0, vk::MemoryPropertyFlags::empty()), None);
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(192, 256), 256);
        assert_eq!(align_up(192, 64), 192);
        assert_eq!(align_up(192, 0), 192);
        assert_eq!(align_up(1, 16), 16);
    }
}
