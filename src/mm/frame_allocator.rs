//! 物理页帧管理器的实现，以及用RAII管理页帧所有权的[`FrameTracker`]

use super::{PhysAddr, PhysPageNum};
use crate::sync::UPIntrFreeCell;
use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};
use core::ops::Range;
use lazy_static::*;

/// 一个物理页帧的所有权。
///
/// 被释放时把页帧归还给全局的页帧分配器。分配时页帧内容不会被清零，
/// 需要干净页面的调用者要自己调用[`FrameTracker::clear`]。
pub struct FrameTracker {
    pub ppn: PhysPageNum,
}

impl FrameTracker {
    pub fn new(ppn: PhysPageNum) -> Self {
        Self { ppn }
    }
    /// 将页帧清零
    pub fn clear(&self) {
        self.ppn.get_bytes_array().fill(0);
    }
}

impl Debug for FrameTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("FrameTracker:PPN={:#x}", self.ppn.0))
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        frame_dealloc(self.ppn);
    }
}

trait FrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

/// 栈式的物理页帧分配器。
///
/// `[current, end)`是从未分配过的页帧，`recycled`是回收的页帧，优先分配最近回收的。
pub struct StackFrameAllocator {
    start: usize,
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    pub fn new() -> Self {
        Self {
            start: 0,
            current: 0,
            end: 0,
            recycled: Vec::new(),
        }
    }
    /// 用物理页号区间`[l, r)`初始化
    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        self.start = l.0;
        self.current = l.0;
        self.end = r.0;
        self.recycled.clear();
    }
    /// 还能分配出的页帧数
    pub fn available(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum> {
        if let Some(ppn) = self.recycled.pop() {
            Some(ppn.into())
        } else if self.current == self.end {
            None
        } else {
            self.current += 1;
            Some((self.current - 1).into())
        }
    }
    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        // 检查页帧的合法性
        if ppn < self.start || ppn >= self.current || self.recycled.iter().any(|&v| v == ppn) {
            panic!("Frame ppn={:#x} has not been allocated!", ppn);
        }
        self.recycled.push(ppn);
    }
}

type FrameAllocatorImpl = StackFrameAllocator;

lazy_static! {
    /// 全局的物理页帧分配器
    pub static ref FRAME_ALLOCATOR: UPIntrFreeCell<FrameAllocatorImpl> =
        unsafe { UPIntrFreeCell::new(FrameAllocatorImpl::new()) };
}

/// 用板级提供的空闲物理内存区间初始化页帧分配器
pub fn init_frame_allocator(memory: Range<usize>) {
    FRAME_ALLOCATOR.exclusive_access().init(
        PhysAddr::from(memory.start).ceil(),
        PhysAddr::from(memory.end).floor(),
    );
}

/// 分配一个物理页帧，内存耗尽时返回`None`
pub fn frame_alloc() -> Option<FrameTracker> {
    FRAME_ALLOCATOR
        .exclusive_access()
        .alloc()
        .map(FrameTracker::new)
}

/// 释放一个物理页帧
pub fn frame_dealloc(ppn: PhysPageNum) {
    FRAME_ALLOCATOR.exclusive_access().dealloc(ppn);
}

/// 全局分配器中还能分配出的页帧数
pub fn available_frames() -> usize {
    FRAME_ALLOCATOR.exclusive_access().available()
}
