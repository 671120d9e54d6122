//! 板级代码提供给内存管理的物理内存布局

use core::ops::Range;
use spin::Once;

/// 内核镜像各段、可用物理内存和MMIO区间的位置。
///
/// 所有区间都是物理地址，内核地址空间对它们做恒等映射。
#[derive(Clone, Debug)]
pub struct KernelLayout {
    pub text: Range<usize>,
    pub rodata: Range<usize>,
    pub data: Range<usize>,
    pub bss: Range<usize>,
    /// 内核镜像之后直到内存末尾的物理内存
    pub phys_memory: Range<usize>,
    /// (起始地址, 长度)
    pub mmio: &'static [(usize, usize)],
    /// 交给页帧分配器管理的物理内存
    pub frames: Range<usize>,
    /// 跳板代码所在的物理页的起始地址
    pub trampoline: usize,
}

/// 启动时由[`super::init`]设置一次
pub(crate) static LAYOUT: Once<KernelLayout> = Once::new();

pub(crate) fn kernel_layout() -> &'static KernelLayout {
    LAYOUT
        .get()
        .expect("kernel layout used before mm::init")
}
