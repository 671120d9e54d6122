//! riscv64 S态的平台原语

use crate::trap::TrapCause;
use core::arch::asm;
use riscv::register::{
    scause::{self, Exception, Interrupt, Trap},
    sie, sstatus, stval, time,
};

const SBI_SET_TIMER: usize = 0;
const SBI_CONSOLE_PUTCHAR: usize = 1;
const SBI_CONSOLE_GETCHAR: usize = 2;
const SBI_SHUTDOWN: usize = 8;

/// sstatus中的SPP位，为0时`sret`返回U态
const SSTATUS_SPP: usize = 1 << 8;

#[inline(always)]
fn sbi_call(which: usize, arg0: usize, arg1: usize, arg2: usize) -> usize {
    let mut ret;
    unsafe {
        asm!(
            "ecall",
            inlateout("x10") arg0 => ret,
            in("x11") arg1,
            in("x12") arg2,
            in("x17") which,
        );
    }
    ret
}

/// 使用SBI调用设置下一次时钟中断的时间
pub fn set_timer(timer: usize) {
    sbi_call(SBI_SET_TIMER, timer, 0, 0);
}

/// 向控制台输出一个字符
pub fn console_putchar(c: usize) {
    sbi_call(SBI_CONSOLE_PUTCHAR, c, 0, 0);
}

/// 从控制台读取一个字符，没有输入时返回0
pub fn console_getchar() -> usize {
    match sbi_call(SBI_CONSOLE_GETCHAR, 0, 0, 0) as isize {
        -1 => 0,
        c => c as usize,
    }
}

/// 关机
pub fn shutdown(failure: bool) -> ! {
    sbi_call(SBI_SHUTDOWN, failure as usize, 0, 0);
    panic!("It should shutdown!");
}

/// 读取mtime计数
pub fn read_time() -> usize {
    time::read()
}

/// S态中断是否使能
pub fn intr_enabled() -> bool {
    sstatus::read().sie()
}

pub fn intr_disable() {
    unsafe {
        sstatus::clear_sie();
    }
}

pub fn intr_enable() {
    unsafe {
        sstatus::set_sie();
    }
}

/// 使能S态时钟中断
pub fn enable_timer_interrupt() {
    unsafe {
        sie::set_stimer();
    }
}

/// 将页表信令写入satp并刷新TLB
pub fn activate_page_table(satp: usize) {
    unsafe {
        asm!("csrw satp, {}", "sfence.vma", in(reg) satp);
    }
}

/// 设置stvec，陷入入口按Direct模式对齐
pub fn set_trap_entry(entry: usize) {
    unsafe {
        asm!("csrw stvec, {}", in(reg) entry & !0b11);
    }
}

/// 以当前sstatus为基础，返回`sret`后进入U态的sstatus
pub fn user_sstatus() -> usize {
    let bits: usize;
    unsafe {
        asm!("csrr {}, sstatus", out(reg) bits);
    }
    bits & !SSTATUS_SPP
}

/// 读取并解码本次陷入的原因，同时返回stval
pub fn trap_cause() -> (TrapCause, usize) {
    let scause = scause::read();
    let stval = stval::read();
    let cause = match scause.cause() {
        Trap::Exception(Exception::UserEnvCall) => TrapCause::Syscall,
        Trap::Exception(Exception::StoreFault)
        | Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::LoadFault)
        | Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::InstructionFault)
        | Trap::Exception(Exception::InstructionPageFault) => TrapCause::PageFault,
        Trap::Exception(Exception::IllegalInstruction) => TrapCause::IllegalInstruction,
        Trap::Interrupt(Interrupt::SupervisorTimer) => TrapCause::Timer,
        Trap::Exception(_) => TrapCause::UnknownException(scause.code()),
        Trap::Interrupt(_) => TrapCause::UnknownInterrupt(scause.code()),
    };
    (cause, stval)
}
