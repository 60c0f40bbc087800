use crate::limine_requests::HHDM_REQUEST;

/// Offset of the Limine higher-half direct map. All physical memory the
/// kernel touches is reached through it; the core never edits page tables.
pub fn hhdm_offset() -> u64 {
    HHDM_REQUEST
        .get_response()
        .expect("expected HHDM response")
        .offset()
}

pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (phys + hhdm_offset()) as *mut u8
}
