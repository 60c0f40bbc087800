use crate::lock::RawIrqSpin;
use crate::memory::hhdm_offset::phys_to_virt;
use limine::memory_map::EntryType;
use limine::response::MemoryMapResponse;
use talc::{ErrOnOom, Span, Talc, Talck};

/// 32 MiB of heap is plenty for the execution core plus test workloads.
pub const GLOBAL_ALLOCATOR_SIZE: u64 = 32 * 0x400 * 0x400;

#[global_allocator]
pub static GLOBAL_ALLOCATOR: Talck<RawIrqSpin, ErrOnOom> = Talck::new(Talc::new(ErrOnOom));

/// Claim heap memory from the largest usable memory-map entry.
///
/// # Safety
/// Must be called exactly once, with the Limine identity/higher-half
/// mappings still in place (the core never replaces them).
pub unsafe fn init(memory_map: &'static MemoryMapResponse) {
    let entry = memory_map
        .entries()
        .iter()
        .filter(|entry| entry.entry_type == EntryType::USABLE)
        .max_by_key(|entry| entry.length)
        .expect("no usable memory");
    let size = entry.length.min(GLOBAL_ALLOCATOR_SIZE) as usize;
    let base = phys_to_virt(entry.base);
    let mut talc = GLOBAL_ALLOCATOR.lock();
    unsafe { talc.claim(Span::from_base_size(base, size)) }.expect("heap claim failed");
}
