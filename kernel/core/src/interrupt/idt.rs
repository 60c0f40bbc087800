use crate::cpu;
use crate::gdt::IstStackIndexes;
use crate::interrupt::InterruptVector;
use crate::interrupt::handlers::{
    apic_error_handler, breakpoint_handler, cpu_message_handler, double_fault_handler,
    general_protection_fault_handler, page_fault_handler, reschedule_handler, spurious_handler,
    timer_interrupt_handler,
};
use x86_64::VirtAddr;
use x86_64::structures::idt::InterruptDescriptorTable;

pub fn init() {
    let idt = cpu::current_cpu().idt.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(u8::from(IstStackIndexes::Exception).into())
        };
        unsafe {
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(u8::from(IstStackIndexes::Exception).into())
        };
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt[u8::from(InterruptVector::LocalApicSpurious)].set_handler_fn(spurious_handler);
        idt[u8::from(InterruptVector::LocalApicError)].set_handler_fn(apic_error_handler);
        // The timer entry is a naked stub (it saves the full frame
        // itself), so it is installed by address.
        unsafe {
            idt[u8::from(InterruptVector::LocalApicTimer)]
                .set_handler_addr(VirtAddr::new(timer_interrupt_handler as usize as u64))
        };
        idt[u8::from(InterruptVector::Reschedule)].set_handler_fn(reschedule_handler);
        idt[u8::from(InterruptVector::CpuMessage)].set_handler_fn(cpu_message_handler);
        idt
    });
    idt.load();
}
