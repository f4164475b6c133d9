#![no_std] // don't link the Rust standard library
#![no_main] // disable all Rust-level entry points

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use bootloader_api::BootInfo;
use kernel::interrupts::context_switch;
use kernel::task::thread::Thread;
use kernel::{gdt, hlt_loop, interrupts, memory, per_cpu, process, serial, serial_println, task};
use x86_64::VirtAddr;

bootloader_api::entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    serial_println!("kernel booting");
    kernel::logger::init_early();
    kernel::logger::serial_ready();

    let physical_memory_offset = VirtAddr::new(
        boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader did not provide a physical memory offset"),
    );
    let memory_regions = &boot_info.memory_regions;

    // per-CPU data before the memory subsystem: memory::init() writes the
    // master kernel PML4's CR3 into per-CPU storage once it builds it, and
    // that write is a no-op until GS base is set up.
    per_cpu::init();
    // gdt/IDT before paging: page/double faults taken while setting up
    // paging still need somewhere to land.
    interrupts::init();
    memory::init(physical_memory_offset, memory_regions);
    gdt::update_ist_stacks();
    interrupts::init_pic();

    let idle = Thread::new_kernel(String::from("idle"), context_switch::idle_loop, 0)
        .expect("failed to allocate idle thread");
    task::scheduler::init(Box::new(idle));

    process::init();

    // No root filesystem is wired up yet, so there is no init binary to
    // hand process::create_user_process here; a loader will call it once
    // one exists. Everything past this point just waits for interrupts.
    log::info!("kernel initialized, entering idle loop");

    x86_64::instructions::interrupts::enable();
    hlt_loop();
}

use core::panic::PanicInfo;

/// This function is called on panic.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("KERNEL PANIC: {}", info);
    hlt_loop();
}