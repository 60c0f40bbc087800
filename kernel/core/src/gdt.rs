use crate::consts::EXCEPTION_STACK_SIZE;
use crate::cpu;
use crate::memory::stack::Stack;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use num_enum::IntoPrimitive;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

#[derive(Debug, IntoPrimitive)]
#[repr(u8)]
pub enum IstStackIndexes {
    Exception,
}

pub struct Gdt {
    gdt: GlobalDescriptorTable,
    kernel_code_selector: SegmentSelector,
    kernel_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Per-CPU GDT/TSS with a dedicated exception stack, so faults taken in
/// interrupt handlers still have a sane stack.
pub fn init() {
    let local = cpu::current_cpu();
    let tss = local.tss.call_once(|| {
        let mut tss = TaskStateSegment::new();
        let stack = Box::leak(Box::new(Stack::new(EXCEPTION_STACK_SIZE)));
        tss.interrupt_stack_table[u8::from(IstStackIndexes::Exception) as usize] =
            VirtAddr::new(stack.top());
        UnsafeCell::new(tss)
    });

    let gdt = local.gdt.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code_selector = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(unsafe { &*tss.get() }));
        Gdt {
            gdt,
            kernel_code_selector,
            kernel_data_selector,
            tss_selector,
        }
    });

    gdt.gdt.load();

    unsafe { CS::set_reg(gdt.kernel_code_selector) };
    unsafe { SS::set_reg(gdt.kernel_data_selector) };
    unsafe { load_tss(gdt.tss_selector) };
}
