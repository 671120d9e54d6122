//! RISC-V时钟中断相关的功能

use crate::arch::{read_time, set_timer};
use crate::config::CLOCK_FREQ;

/// 每秒的时钟中断次数
const TICKS_PER_SEC: usize = 100;
const MSEC_PER_SEC: usize = 1000;
const USEC_PER_SEC: usize = 1_000_000;

/// 读取mtime寄存器的值
pub fn get_time() -> usize {
    read_time()
}

/// 以毫秒为单位获取当前时间
pub fn get_time_ms() -> usize {
    get_time() / (CLOCK_FREQ / MSEC_PER_SEC)
}

/// 以微秒为单位获取当前时间
pub fn get_time_us() -> usize {
    get_time() / (CLOCK_FREQ / USEC_PER_SEC)
}

/// 设置下一次时钟中断的触发时间
pub fn set_next_trigger() {
    set_timer(get_time() + CLOCK_FREQ / TICKS_PER_SEC);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic_across_units() {
        let t0 = get_time();
        let t1 = get_time();
        assert!(t1 > t0);
        let ms = get_time_ms();
        let us = get_time_us();
        assert!(us / 1000 >= ms);
    }
}
