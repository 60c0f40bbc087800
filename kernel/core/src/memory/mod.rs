pub mod global_allocator;
pub mod hhdm_offset;
pub mod stack;

use limine::response::MemoryMapResponse;

/// Bring up the kernel heap on the BSP. APs share it; they have nothing to
/// initialize here.
///
/// # Safety
/// Must be called exactly once, before any allocation.
pub unsafe fn init_bsp(memory_map: &'static MemoryMapResponse) {
    unsafe { global_allocator::init(memory_map) };
}
