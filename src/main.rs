//! qemu virt板上的内核镜像
//!
//! 这里只做板级启动：清空`.bss`，根据链接脚本中的符号描述内存布局，
//! 登记链接进内核的用户程序，然后把控制权交给内核核心。

#![no_std]
#![no_main]

#[macro_use]
extern crate log;

use core::arch::global_asm;
use os_core::config::{MEMORY_END, MMIO};
use os_core::mm::{self, KernelLayout};
use os_core::{loader, logging, task, timer, trap};

global_asm!(include_str!("entry.asm"));
global_asm!(include_str!(concat!(env!("OUT_DIR"), "/link_app.S")));

extern "C" {
    fn stext();
    fn etext();
    fn srodata();
    fn erodata();
    fn sdata();
    fn edata();
    fn sbss_with_stack();
    fn sbss();
    fn ebss();
    fn ekernel();
    fn strampoline();
    fn _num_app();
    fn _app_names();
}

/// 清空.bss段
fn clear_bss() {
    unsafe {
        core::slice::from_raw_parts_mut(sbss as usize as *mut u8, ebss as usize - sbss as usize)
            .fill(0);
    }
}

fn board_layout() -> KernelLayout {
    KernelLayout {
        text: stext as usize..etext as usize,
        rodata: srodata as usize..erodata as usize,
        data: sdata as usize..edata as usize,
        bss: sbss_with_stack as usize..ebss as usize,
        phys_memory: ekernel as usize..MEMORY_END,
        mmio: MMIO,
        frames: ekernel as usize..MEMORY_END,
        trampoline: strampoline as usize,
    }
}

/// 把`link_app.S`中的应用按名字登记到加载器
fn register_apps() {
    let num_app_ptr = _num_app as usize as *const usize;
    let num_app = unsafe { num_app_ptr.read_volatile() };
    let app_start = unsafe { core::slice::from_raw_parts(num_app_ptr.add(1), num_app + 1) };
    let mut name_ptr = _app_names as usize as *const u8;
    for i in 0..num_app {
        let name = unsafe {
            let mut end = name_ptr;
            while end.read_volatile() != b'\0' {
                end = end.add(1);
            }
            let bytes = core::slice::from_raw_parts(name_ptr, end as usize - name_ptr as usize);
            name_ptr = end.add(1);
            core::str::from_utf8(bytes).expect("app name is not valid utf-8")
        };
        let data = unsafe {
            core::slice::from_raw_parts(
                app_start[i] as *const u8,
                app_start[i + 1] - app_start[i],
            )
        };
        loader::register_app(name, data);
    }
}

#[no_mangle]
/// 内核的入口，由`entry.asm`在设置好启动栈之后调用
pub fn rust_main() -> ! {
    clear_bss();
    logging::init();
    info!("[kernel] Hello, world!");
    let layout = board_layout();
    mm::init(layout.clone());
    mm::remap_test(&layout);
    register_apps();
    loader::list_apps();
    trap::init();
    trap::enable_timer_interrupt();
    timer::set_next_trigger();
    task::add_initproc();
    task::run_tasks();
}
