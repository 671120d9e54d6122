//! 面向RISC-V64单核开发板的类Unix教学内核：虚拟内存与进程调度核心
//!
//! 内核核心由以下几部分组成：
//!
//! - [`mm`]：SV39分页机制下的地址类型、物理页帧分配、页表与地址空间；
//! - [`task`]：任务控制块、进程标识符与内核栈、就绪队列和处理器的调度循环；
//! - [`trap`]：陷入上下文与陷入分发（系统调用、时钟中断、异常）；
//! - [`syscall`]：由上述原语组合而成的进程相关系统调用。
//!
//! 块设备、文件系统、字符设备和板级启动都在核心之外。启动代码需要提供一个
//! [`mm::KernelLayout`]，把用户程序注册进[`loader`]，然后依次调用[`mm::init()`]、
//! [`trap::init()`]、[`task::add_initproc()`]和[`task::run_tasks()`]。
//!
//! 与目标平台相关的原语都在[`arch`]中。在非riscv64目标（主机上的单元测试）上，
//! 它们由一个简单的主机模型代替，物理内存由一段按页对齐的主机内存充当。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

#[macro_use]
pub mod console;
pub mod arch;
pub mod config;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod lang_items;
pub mod loader;
pub mod logging;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod timer;
pub mod trap;

#[cfg(test)]
mod test_support;
