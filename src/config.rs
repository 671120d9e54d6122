//! 内核中使用的常量

#[allow(unused)]

/// 用户栈大小
pub const USER_STACK_SIZE: usize = 4096 * 2;
/// 每个任务的内核栈大小
pub const KERNEL_STACK_SIZE: usize = 4096 * 2;
/// 内核堆大小
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;
/// 页大小
pub const PAGE_SIZE: usize = 0x1000;
/// 页内偏移的位宽
pub const PAGE_SIZE_BITS: usize = 0xc;

/// 跳板页所在的虚拟地址，位于每个地址空间的最高页
pub const TRAMPOLINE: usize = usize::MAX - PAGE_SIZE + 1;
/// 陷入上下文所在的虚拟地址，紧挨在跳板页之下
pub const TRAP_CONTEXT: usize = TRAMPOLINE - PAGE_SIZE;

/// qemu virt平台的时钟频率
pub const CLOCK_FREQ: usize = 12500000;
/// qemu virt平台可用物理内存的结束地址
pub const MEMORY_END: usize = 0x8800_0000;

/// qemu virt平台的内存映射I/O区间，(起始地址, 长度)
pub const MMIO: &[(usize, usize)] = &[
    (0x0010_0000, 0x00_2000), // VIRT_TEST/RTC
    (0x1000_1000, 0x00_1000), // Virtio Block
];

/// 系统调用号的上界，只统计小于它的系统调用
pub const MAX_SYSCALL_NUM: usize = 500;
/// stride调度中优先级为1时的步长
pub const BIG_STRIDE: u64 = 0x10_0000;
/// 新任务的默认优先级
pub const DEFAULT_PRIORITY: usize = 16;

/// 初始进程对应的应用名
pub const INITPROC_NAME: &str = "initproc";

/// 因访存错误（页错误、非法的用户指针、内存耗尽）被内核终止的任务的退出码
pub const EXIT_CODE_PAGE_FAULT: i32 = -2;
/// 因非法指令或无法识别的系统调用被内核终止的任务的退出码
pub const EXIT_CODE_ILLEGAL: i32 = -3;
