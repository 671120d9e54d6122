//! 陷入(Trap)处理功能
//!
//! 在rCore中，`__alltraps`是陷入的唯一入口点。在[`init()`]的初始化时，我们将`stvec` CSR指向它。
//!
//! 所有陷入都要经过`__alltraps`，它被定义在`trap.S`中。汇编语言代码只需恢复内核空间上下文即可，
//! 保证Rust代码安全运行，并将控制权转移给[`trap_handler()`]。
//!
//! 然后它根据[`TrapCause`]调用不同的功能。例如，计时器中断触发任务抢占，系统调用转到[`syscall()`]。
//! 分发本身在[`handle_trap()`]中，与读取CSR的部分分开。

mod context;

use crate::arch;
use crate::config::{EXIT_CODE_ILLEGAL, EXIT_CODE_PAGE_FAULT, TRAMPOLINE, TRAP_CONTEXT};
use crate::syscall::{syscall, SyscallError};
use crate::task::{
    current_task, current_trap_cx, current_user_token, exit_current_and_run_next,
    suspend_current_and_run_next,
};
use crate::timer::set_next_trigger;

pub use context::TrapContext;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(include_str!("trap.S"));

/// 陷入的原因，由`scause`解码而来
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// 来自U态的`ecall`
    Syscall,
    /// 取指、访存的页错误或访问错误
    PageFault,
    IllegalInstruction,
    /// S态时钟中断
    Timer,
    /// 其他异常，附带`scause`中的异常号
    UnknownException(usize),
    /// 其他中断，附带`scause`中的中断号
    UnknownInterrupt(usize),
}

pub fn init() {
    set_kernel_trap_entry();
}

/// 设置CSR的`stvec`为`trap_from_kernel`的入口
fn set_kernel_trap_entry() {
    arch::set_trap_entry(trap_from_kernel as usize);
}

/// 设置CSR的`stvec`为`TRAMPOLINE`的入口
fn set_user_trap_entry() {
    arch::set_trap_entry(TRAMPOLINE);
}

/// 计时器中断使能
pub fn enable_timer_interrupt() {
    arch::enable_timer_interrupt();
}

/// 根据陷入原因处理一次来自用户态的陷入
pub fn handle_trap(cause: TrapCause, stval: usize) {
    match cause {
        TrapCause::Syscall => {
            let cx = current_trap_cx();
            // 返回到ecall的下一条指令
            cx.sepc += 4;
            match syscall(cx.x[17], [cx.x[10], cx.x[11], cx.x[12]]) {
                Ok(ret) => {
                    // exec之后陷入上下文的位置变了，需要重新获取
                    if let Some(task) = current_task() {
                        task.inner_exclusive_access().get_trap_cx().x[10] = ret as usize;
                    }
                }
                Err(SyscallError::Restart) => {
                    // 下次被调度时重新执行这条ecall
                    cx.sepc -= 4;
                    suspend_current_and_run_next();
                }
                Err(err) => {
                    error!("[kernel] {} in application, kernel killed it.", err);
                    exit_current_and_run_next(err.exit_code());
                }
            }
        }
        TrapCause::PageFault => {
            error!(
                "[kernel] PageFault in application, bad addr = {:#x}, bad instruction = {:#x}, kernel killed it.",
                stval,
                current_trap_cx().sepc,
            );
            exit_current_and_run_next(EXIT_CODE_PAGE_FAULT);
        }
        TrapCause::IllegalInstruction => {
            error!("[kernel] IllegalInstruction in application, kernel killed it.");
            exit_current_and_run_next(EXIT_CODE_ILLEGAL);
        }
        TrapCause::UnknownException(code) => {
            error!(
                "[kernel] Unsupported exception {} in application, stval = {:#x}, kernel killed it.",
                code, stval
            );
            exit_current_and_run_next(EXIT_CODE_ILLEGAL);
        }
        TrapCause::Timer => {
            set_next_trigger();
            suspend_current_and_run_next();
        }
        TrapCause::UnknownInterrupt(code) => {
            panic!("Unsupported interrupt {}, stval = {:#x}!", code, stval);
        }
    }
}

#[no_mangle]
/// 处理一个中断、异常或系统调用
pub fn trap_handler() -> ! {
    set_kernel_trap_entry();
    let (cause, stval) = arch::trap_cause();
    handle_trap(cause, stval);
    trap_return();
}

#[no_mangle]
/// 经由跳板页返回用户态
pub fn trap_return() -> ! {
    set_user_trap_entry();
    let trap_cx_ptr = TRAP_CONTEXT;
    let user_satp = current_user_token();
    restore(trap_cx_ptr, user_satp)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn restore(trap_cx_ptr: usize, user_satp: usize) -> ! {
    extern "C" {
        fn __alltraps();
        fn __restore();
    }
    let restore_va = __restore as usize - __alltraps as usize + TRAMPOLINE;
    unsafe {
        core::arch::asm!(
            "fence.i",
            "jr {restore_va}",
            restore_va = in(reg) restore_va,
            in("a0") trap_cx_ptr,
            in("a1") user_satp,
            options(noreturn)
        );
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn restore(_trap_cx_ptr: usize, _user_satp: usize) -> ! {
    unreachable!("returning to user mode needs the riscv64 target")
}

#[no_mangle]
pub fn trap_from_kernel() -> ! {
    panic!("a trap from kernel!");
}
