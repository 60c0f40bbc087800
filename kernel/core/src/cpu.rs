use crate::consts::MAX_THREADS;
use crate::gdt::Gdt;
use crate::lock::irq_guarded;
use crate::queue::Queue;
use crate::sched::context::Ctx;
use crate::sched::kcontext::{KernelContext, SyscallContext};
use crate::sched::thread::ThreadContext;
use alloc::boxed::Box;
use alloc::vec::Vec;
use atomic_enum::atomic_enum;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use force_send_sync::SendSync;
use spin::{Mutex, Once};
use x2apic::lapic::LocalApic;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::GsBase;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum CpuState {
    NotPresent = 0,
    Idle,
    Kernel,
    Interrupt,
    User,
}

/// Cross-CPU message, delivered in interrupt context on the target.
pub type CpuThunk = Box<dyn FnOnce() + Send>;

/// Fields read gs-relative by the interrupt stub. Layout is ABI: keep
/// this struct first in `CpuInfo` and keep the field order.
#[repr(C)]
pub struct CpuMachine {
    /// gs:0, back-pointer to the containing CpuInfo.
    pub self_ptr: AtomicPtr<CpuInfo>,
    /// gs:8, frame of the currently installed context (null before the
    /// first install).
    pub current_frame: AtomicPtr<u64>,
    /// gs:16, stack top of the designated kernel context, the runloop's
    /// home.
    pub runloop_stack_top: AtomicU64,
}

pub const CPU_SELF_OFFSET: usize = 0;
pub const CPU_CURRENT_FRAME_OFFSET: usize = 8;
pub const CPU_RUNLOOP_STACK_TOP_OFFSET: usize = 16;

const _: () = {
    assert!(core::mem::offset_of!(CpuInfo, m) == 0);
    assert!(core::mem::offset_of!(CpuMachine, self_ptr) == CPU_SELF_OFFSET);
    assert!(core::mem::offset_of!(CpuMachine, current_frame) == CPU_CURRENT_FRAME_OFFSET);
    assert!(core::mem::offset_of!(CpuMachine, runloop_stack_top) == CPU_RUNLOOP_STACK_TOP_OFFSET);
};

#[repr(C)]
pub struct CpuInfo {
    pub m: CpuMachine,

    pub id: u32,
    pub local_apic_id: u32,
    pub state: AtomicCpuState,
    pub have_kernel_lock: AtomicBool,

    /// Runnable threads bound for this CPU.
    pub thread_queue: Queue<&'static ThreadContext>,
    /// Cross-CPU messages; drained in interrupt context.
    pub cpu_queue: Queue<CpuThunk>,

    pub free_kernel_contexts: Mutex<Vec<&'static KernelContext>>,
    pub free_syscall_contexts: Mutex<Vec<&'static SyscallContext>>,

    kernel_context: UnsafeCell<Option<&'static KernelContext>>,
    current: UnsafeCell<Option<Ctx>>,
    /// A context whose stack is being abandoned parks its handle here;
    /// the runloop releases it once safely on the kernel stack.
    retiring: Mutex<Option<Ctx>>,

    pub last_timer_update: AtomicU64,
    pub frcount: AtomicU64,
    pub inval_gen: AtomicU64,
    pub in_bh: AtomicBool,

    pub tss: Once<UnsafeCell<TaskStateSegment>>,
    pub gdt: Once<Gdt>,
    pub idt: Once<InterruptDescriptorTable>,
    pub local_apic: Once<UnsafeCell<SendSync<LocalApic>>>,
}

// Safety:
// - the UnsafeCell fields are only accessed by the owning CPU
// - everything else is atomic or internally locked
unsafe impl Sync for CpuInfo {}

impl CpuInfo {
    fn new(id: u32, local_apic_id: u32) -> CpuInfo {
        CpuInfo {
            m: CpuMachine {
                self_ptr: AtomicPtr::new(core::ptr::null_mut()),
                current_frame: AtomicPtr::new(core::ptr::null_mut()),
                runloop_stack_top: AtomicU64::new(0),
            },
            id,
            local_apic_id,
            state: AtomicCpuState::new(CpuState::NotPresent),
            have_kernel_lock: AtomicBool::new(false),
            thread_queue: Queue::new(MAX_THREADS),
            cpu_queue: Queue::new(8),
            free_kernel_contexts: Mutex::new(Vec::new()),
            free_syscall_contexts: Mutex::new(Vec::new()),
            kernel_context: UnsafeCell::new(None),
            current: UnsafeCell::new(None),
            retiring: Mutex::new(None),
            last_timer_update: AtomicU64::new(0),
            frcount: AtomicU64::new(0),
            inval_gen: AtomicU64::new(0),
            in_bh: AtomicBool::new(false),
            tss: Once::new(),
            gdt: Once::new(),
            idt: Once::new(),
            local_apic: Once::new(),
        }
    }

    pub fn current_context(&self) -> Ctx {
        self.try_current_context().expect("no current context")
    }

    pub fn try_current_context(&self) -> Option<Ctx> {
        unsafe { *self.current.get() }
    }

    /// Interrupts are disabled across the two-word store so the interrupt
    /// stub never observes a torn (context, frame) pair.
    pub fn set_current_context(&self, c: Ctx) {
        irq_guarded(|| {
            unsafe { *self.current.get() = Some(c) };
            self.m.current_frame.store(c.context().frame_ptr(), Ordering::Release);
        });
    }

    pub fn kernel_context(&self) -> &'static KernelContext {
        unsafe { (*self.kernel_context.get()).expect("no kernel context") }
    }

    pub fn set_kernel_context(&self, kc: &'static KernelContext) {
        irq_guarded(|| {
            unsafe { *self.kernel_context.get() = Some(kc) };
            self.m.runloop_stack_top.store(kc.stack_top(), Ordering::Release);
        });
    }

    pub fn set_retiring(&self, c: Ctx) {
        let prev = irq_guarded(|| self.retiring.lock().replace(c));
        debug_assert!(prev.is_none(), "retiring slot already occupied");
    }

    pub fn take_retiring(&self) -> Option<Ctx> {
        irq_guarded(|| self.retiring.lock().take())
    }

    pub fn in_bottom_half(&self) -> bool {
        self.in_bh.load(Ordering::Relaxed)
    }
}

static CPUINFOS: Once<Box<[CpuInfo]>> = Once::new();

/// Build the registry, one entry per CPU the bootloader reported.
pub fn init_cpuinfos(local_apic_ids: &[u32]) {
    CPUINFOS.call_once(|| {
        local_apic_ids
            .iter()
            .enumerate()
            .map(|(id, &lapic)| CpuInfo::new(id as u32, lapic))
            .collect()
    });
}

pub fn cpus_count() -> usize {
    CPUINFOS.get().map_or(1, |c| c.len())
}

pub fn cpuinfo_from_id(id: u32) -> &'static CpuInfo {
    &CPUINFOS.get().expect("cpuinfos not initialized")[id as usize]
}

pub fn local_apic_id_of(id: u32) -> u32 {
    cpuinfo_from_id(id).local_apic_id
}

pub fn cpu_id_for_lapic(lapic_id: u32) -> Option<u32> {
    CPUINFOS
        .get()?
        .iter()
        .find(|ci| ci.local_apic_id == lapic_id)
        .map(|ci| ci.id)
}

/// A cpuinfo that has a run queue and a runloop, i.e. may receive work.
pub fn try_get_ready_cpu(id: u32) -> Option<&'static CpuInfo> {
    let ci = CPUINFOS.get()?.get(id as usize)?;
    match ci.state.load(Ordering::Relaxed) {
        CpuState::NotPresent => None,
        _ => Some(ci),
    }
}

/// Point GS at this CPU's entry.
///
/// # Safety
/// Must run exactly once per CPU, on that CPU, before interrupts are
/// enabled.
pub unsafe fn install_cpu(id: u32) -> &'static CpuInfo {
    let ci = cpuinfo_from_id(id);
    ci.m.self_ptr.store(ci as *const _ as *mut _, Ordering::Release);
    unsafe { GsBase::write(VirtAddr::from_ptr(ci)) };
    ci
}

pub fn try_current_cpu() -> Option<&'static CpuInfo> {
    let ptr = NonNull::new(GsBase::read().as_mut_ptr::<CpuInfo>())?;
    // Safety: GsBase is only ever written by `install_cpu`, which stores a
    // &'static CpuInfo.
    unsafe { Some(ptr.as_ref()) }
}

pub fn current_cpu() -> &'static CpuInfo {
    try_current_cpu().expect("cpu not installed")
}
