//! 内存管理的实现
//!
//! 这里实现了用于RV64系统的SV39分页虚拟内存框架，以及跟内存管理相关的所有内容，如物理页帧管理器、
//! 页表、逻辑段和地址空间。
//!
//! 所有任务和进程都有一个地址空间去控制它的虚拟内存。

mod address;
mod frame_allocator;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod heap_allocator;
mod layout;
mod memory_set;
mod page_table;

use core::fmt::{self, Display, Formatter};

pub use address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use address::{StepByOne, VPNRange};
pub use frame_allocator::{available_frames, frame_alloc, frame_dealloc, FrameTracker};
pub(crate) use layout::kernel_layout;
pub use layout::KernelLayout;
pub use memory_set::{kernel_token, remap_test, MapArea, MapPermission, MapType, MemorySet, KERNEL_SPACE};
pub use page_table::{
    copy_to_user, translated_byte_buffer, translated_str, PTEFlags, PageTable, PageTableEntry,
    UserBuffer,
};

/// 由用户程序或资源耗尽引起的内存管理错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// 没有空闲的物理页帧
    OutOfMemory,
    /// 用户提供的地址未映射、不可由用户访问或不满足对齐要求
    BadAddress(usize),
    /// 新的映射与已有的逻辑段相交
    Overlap,
    /// 要解除的映射不存在
    NotMapped,
    /// 无法装载的ELF镜像
    InvalidElf(&'static str),
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "out of physical frames"),
            MemoryError::BadAddress(addr) => write!(f, "bad user address {:#x}", addr),
            MemoryError::Overlap => write!(f, "mapping overlaps an existing area"),
            MemoryError::NotMapped => write!(f, "no such mapping"),
            MemoryError::InvalidElf(reason) => write!(f, "invalid elf: {}", reason),
        }
    }
}

/// 初始化堆内存分配器、物理页帧管理器和内核空间
pub fn init(layout: KernelLayout) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    heap_allocator::init_heap();
    let layout = layout::LAYOUT.call_once(|| layout);
    frame_allocator::init_frame_allocator(layout.frames.clone());
    KERNEL_SPACE.exclusive_access().activate();
}
