//! 主机上的平台模型，用于在开发机上运行单元测试
//!
//! 这里没有真正的特权级切换：sstatus.SIE和时钟是进程内的原子变量，
//! 每次读取时钟都会向前走一步，使得时间单调递增。控制台输入是一个由测试填充的队列。

use crate::trap::TrapCause;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

static SIE: AtomicBool = AtomicBool::new(false);
static MTIME: AtomicUsize = AtomicUsize::new(0);
static CONSOLE_INPUT: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());

/// 时钟每次被读取时前进的计数
const TICK_STEP: usize = 1000;

pub fn set_timer(_timer: usize) {}

pub fn console_putchar(c: usize) {
    #[cfg(test)]
    std::print!("{}", c as u8 as char);
    #[cfg(not(test))]
    let _ = c;
}

/// 取出一个待读的输入字符，没有输入时返回0
pub fn console_getchar() -> usize {
    CONSOLE_INPUT.lock().pop_front().map_or(0, usize::from)
}

#[cfg(test)]
pub fn push_console_input(bytes: &[u8]) {
    CONSOLE_INPUT.lock().extend(bytes.iter().copied());
}

pub fn shutdown(failure: bool) -> ! {
    panic!("shutdown requested (failure = {})", failure);
}

pub fn read_time() -> usize {
    MTIME.fetch_add(TICK_STEP, Ordering::Relaxed)
}

pub fn intr_enabled() -> bool {
    SIE.load(Ordering::Relaxed)
}

pub fn intr_disable() {
    SIE.store(false, Ordering::Relaxed);
}

pub fn intr_enable() {
    SIE.store(true, Ordering::Relaxed);
}

pub fn enable_timer_interrupt() {}

pub fn activate_page_table(_satp: usize) {}

pub fn set_trap_entry(_entry: usize) {}

pub fn user_sstatus() -> usize {
    0
}

pub fn trap_cause() -> (TrapCause, usize) {
    unreachable!("traps are only taken on the riscv64 target")
}
