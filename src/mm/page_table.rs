//! [`PageTableEntry`]和[`PageTable`]的实现，以及经由页表访问用户内存的辅助函数

use super::{frame_alloc, FrameTracker, MemoryError, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use crate::config::PAGE_SIZE;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::*;

bitflags! {
    /// 页表项的标志位
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// 页表项，`bits = ppn << 10 | flags`
#[derive(Copy, Clone)]
#[repr(C)]
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
    pub fn is_user(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }
}

/// SV39三级页表。
///
/// 根页表和按需分配的中间页表所在的页帧都归页表所有，页表被释放时一并回收。
/// 由[`PageTable::from_token`]得到的页表只是正在使用的页表的一个视图，不拥有任何页帧。
pub struct PageTable {
    root_ppn: PhysPageNum,
    frames: Vec<FrameTracker>,
}

impl PageTable {
    pub fn new() -> Result<Self, MemoryError> {
        let frame = frame_alloc().ok_or(MemoryError::OutOfMemory)?;
        frame.clear();
        Ok(PageTable {
            root_ppn: frame.ppn,
            frames: vec![frame],
        })
    }
    /// 临时借用一个地址空间的页表，用于访问用户空间的参数
    pub fn from_token(satp: usize) -> Self {
        Self {
            root_ppn: PhysPageNum::from(satp & ((1usize << 44) - 1)),
            frames: Vec::new(),
        }
    }
    /// 找到`vpn`对应的叶子页表项，途中缺失的页表会被分配并清零
    fn find_pte_create(&mut self, vpn: VirtPageNum) -> Result<&mut PageTableEntry, MemoryError> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == 2 {
                return Ok(pte);
            }
            if !pte.is_valid() {
                let frame = frame_alloc().ok_or(MemoryError::OutOfMemory)?;
                frame.clear();
                *pte = PageTableEntry::new(frame.ppn, PTEFlags::V);
                self.frames.push(frame);
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }
    fn find_pte(&self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if i == 2 {
                return Some(pte);
            }
            if !pte.is_valid() {
                return None;
            }
            ppn = pte.ppn();
        }
        None
    }
    /// 建立`vpn`到`ppn`的映射。
    ///
    /// 中间页表分配失败时返回[`MemoryError::OutOfMemory`]，此时不会写入叶子页表项。
    /// `vpn`已被映射是内核的错误，直接panic。
    pub fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> Result<(), MemoryError> {
        let pte = self.find_pte_create(vpn)?;
        assert!(!pte.is_valid(), "vpn {:?} is mapped before mapping", vpn);
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }
    /// 解除`vpn`的映射，中间页表保留到页表被释放为止
    pub fn unmap(&mut self, vpn: VirtPageNum) {
        match self.find_pte(vpn) {
            Some(pte) if pte.is_valid() => *pte = PageTableEntry::empty(),
            _ => panic!("vpn {:?} is invalid before unmapping", vpn),
        }
    }
    /// 查询`vpn`的有效页表项
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn).map(|pte| *pte).filter(|pte| pte.is_valid())
    }
    /// 把虚拟地址翻译为物理地址
    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(va.floor()).map(|pte| {
            let aligned_pa: PhysAddr = pte.ppn().into();
            (aligned_pa.0 + va.page_offset()).into()
        })
    }
    /// satp格式的页表信令，MODE字段为8表示SV39
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }
}

/// 翻译`va`所在的用户页，只接受有效且带U标志的页。
///
/// 不符合SV39规范（高位不是第38位的符号扩展）的地址一律拒绝。
fn translate_user_page(page_table: &PageTable, va: usize) -> Result<PhysPageNum, MemoryError> {
    let virt = VirtAddr::from(va);
    if usize::from(virt) != va {
        return Err(MemoryError::BadAddress(va));
    }
    match page_table.translate(virt.floor()) {
        Some(pte) if pte.is_user() => Ok(pte.ppn()),
        _ => Err(MemoryError::BadAddress(va)),
    }
}

/// 把用户空间中`[ptr, ptr + len)`的缓冲区按页切分，得到内核可以直接访问的若干片段。
///
/// 成功时各片段的长度之和恰好是`len`，任何一页不可访问都返回错误。
pub fn translated_byte_buffer(
    token: usize,
    ptr: *const u8,
    len: usize,
) -> Result<Vec<&'static mut [u8]>, MemoryError> {
    let page_table = PageTable::from_token(token);
    let mut start = ptr as usize;
    let end = start.checked_add(len).ok_or(MemoryError::BadAddress(start))?;
    let mut v = Vec::new();
    while start < end {
        // 逐页检查，越过用户空间顶端的地址在这里被拒绝
        let ppn = translate_user_page(&page_table, start)?;
        let offset = start % PAGE_SIZE;
        let page_end = (start - offset)
            .checked_add(PAGE_SIZE)
            .map_or(end, |next| next.min(end));
        v.push(&mut ppn.get_bytes_array()[offset..offset + (page_end - start)]);
        start = page_end;
    }
    Ok(v)
}

/// 读取用户空间中以`\0`结尾的字符串
pub fn translated_str(token: usize, ptr: *const u8) -> Result<String, MemoryError> {
    let page_table = PageTable::from_token(token);
    let mut string = String::new();
    let mut va = ptr as usize;
    loop {
        let ppn = translate_user_page(&page_table, va)?;
        let ch = ppn.get_bytes_array()[VirtAddr::from(va).page_offset()];
        if ch == 0 {
            break;
        }
        string.push(ch as char);
        va += 1;
    }
    Ok(string)
}

/// 把`value`写到用户空间的`ptr`处，目标可以跨越页边界
pub fn copy_to_user<T: Copy>(token: usize, ptr: *mut T, value: &T) -> Result<(), MemoryError> {
    let len = core::mem::size_of::<T>();
    let src = unsafe { core::slice::from_raw_parts(value as *const T as *const u8, len) };
    let mut buffer = UserBuffer::new(translated_byte_buffer(token, ptr as *const u8, len)?);
    buffer.write(src);
    Ok(())
}

/// 用户空间缓冲区在内核中的分散视图
pub struct UserBuffer {
    pub buffers: Vec<&'static mut [u8]>,
}

impl UserBuffer {
    pub fn new(buffers: Vec<&'static mut [u8]>) -> Self {
        Self { buffers }
    }
    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// 从`src`拷贝尽可能多的字节到缓冲区，返回拷贝的字节数
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        for sub_buff in self.buffers.iter_mut() {
            if copied == src.len() {
                break;
            }
            let n = sub_buff.len().min(src.len() - copied);
            sub_buff[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        copied
    }
    /// 从缓冲区拷贝尽可能多的字节到`dst`，返回拷贝的字节数
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for sub_buff in self.buffers.iter() {
            if copied == dst.len() {
                break;
            }
            let n = sub_buff.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&sub_buff[..n]);
            copied += n;
        }
        copied
    }
}

impl IntoIterator for UserBuffer {
    type Item = *mut u8;
    type IntoIter = UserBufferIterator;
    fn into_iter(self) -> Self::IntoIter {
        UserBufferIterator {
            buffers: self.buffers,
            current_buffer: 0,
            current_idx: 0,
        }
    }
}

/// 逐字节遍历[`UserBuffer`]
pub struct UserBufferIterator {
    buffers: Vec<&'static mut [u8]>,
    current_buffer: usize,
    current_idx: usize,
}

impl Iterator for UserBufferIterator {
    type Item = *mut u8;
    fn next(&mut self) -> Option<Self::Item> {
        while self.current_buffer < self.buffers.len() {
            let buffer = &mut self.buffers[self.current_buffer];
            if self.current_idx < buffer.len() {
                let r = &mut buffer[self.current_idx] as *mut _;
                self.current_idx += 1;
                return Some(r);
            }
            self.current_idx = 0;
            self.current_buffer += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{available_frames, FrameTracker};
    use crate::test_support;
    use proptest::prelude::*;

    fn user_page(page_table: &mut PageTable, vpn: usize, flags: PTEFlags) -> FrameTracker {
        let frame = frame_alloc().unwrap();
        frame.clear();
        page_table.map(VirtPageNum(vpn), frame.ppn, flags).unwrap();
        frame
    }

    #[test]
    fn map_then_unmap_leaves_nothing_behind() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let vpn = VirtPageNum(0x10);
        let frame = frame_alloc().unwrap();
        page_table.map(vpn, frame.ppn, PTEFlags::R | PTEFlags::W).unwrap();
        let pte = page_table.translate(vpn).unwrap();
        assert_eq!(pte.ppn(), frame.ppn);
        assert!(pte.readable() && pte.writable() && !pte.executable());
        page_table.unmap(vpn);
        assert!(page_table.translate(vpn).is_none());
    }

    #[test]
    fn remapping_shows_only_the_new_flags() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let vpn = VirtPageNum(0x123);
        let frame = frame_alloc().unwrap();
        page_table.map(vpn, frame.ppn, PTEFlags::R | PTEFlags::W | PTEFlags::U).unwrap();
        page_table.unmap(vpn);
        page_table.map(vpn, frame.ppn, PTEFlags::R | PTEFlags::X).unwrap();
        let flags = page_table.translate(vpn).unwrap().flags();
        assert_eq!(flags, PTEFlags::V | PTEFlags::R | PTEFlags::X);
    }

    #[test]
    #[should_panic(expected = "is mapped before mapping")]
    fn double_map_is_fatal() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let frame = frame_alloc().unwrap();
        page_table.map(VirtPageNum(7), frame.ppn, PTEFlags::R).unwrap();
        let _ = page_table.map(VirtPageNum(7), frame.ppn, PTEFlags::R);
    }

    #[test]
    #[should_panic(expected = "is invalid before unmapping")]
    fn unmapping_an_absent_page_is_fatal() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        page_table.unmap(VirtPageNum(7));
    }

    #[test]
    fn token_round_trips_through_satp() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let token = page_table.token();
        assert_eq!(token >> 60, 8);
        let frame = frame_alloc().unwrap();
        page_table.map(VirtPageNum(0x42), frame.ppn, PTEFlags::R).unwrap();
        let view = PageTable::from_token(token);
        assert_eq!(view.translate(VirtPageNum(0x42)).unwrap().ppn(), frame.ppn);
        let pa = view.translate_va(VirtAddr::from(0x42_123)).unwrap();
        assert_eq!(pa.0, PhysAddr::from(frame.ppn).0 + 0x123);
        assert!(view.translate_va(VirtAddr::from(0x43_000)).is_none());
    }

    #[test]
    fn dropping_a_page_table_returns_its_frames() {
        let _guard = test_support::boot();
        let before = available_frames();
        {
            let mut page_table = PageTable::new().unwrap();
            let frame = frame_alloc().unwrap();
            // 三个相距很远的页，各自需要独立的中间页表
            for vpn in [0x1usize, 0x4_0000, 0x7ff_ffff] {
                page_table.map(VirtPageNum(vpn), frame.ppn, PTEFlags::R).unwrap();
            }
        }
        assert_eq!(available_frames(), before);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn translate_agrees_with_the_mapped_set(ops in proptest::collection::vec((any::<bool>(), 0usize..64), 1..80)) {
            let _guard = test_support::boot();
            let mut page_table = PageTable::new().unwrap();
            let frame = frame_alloc().unwrap();
            let mut mapped = std::collections::BTreeSet::new();
            for (map, slot) in ops {
                // 让页号分散到不同的中间页表
                let vpn = VirtPageNum(slot << 9 | slot);
                if map && !mapped.contains(&slot) {
                    page_table.map(vpn, frame.ppn, PTEFlags::R).unwrap();
                    mapped.insert(slot);
                } else if !map && mapped.remove(&slot) {
                    page_table.unmap(vpn);
                }
                for s in 0..64usize {
                    let present = page_table.translate(VirtPageNum(s << 9 | s)).is_some();
                    prop_assert_eq!(present, mapped.contains(&s));
                }
            }
        }
    }

    #[test]
    fn user_buffers_span_page_boundaries() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let flags = PTEFlags::R | PTEFlags::W | PTEFlags::U;
        let _a = user_page(&mut page_table, 0x10, flags);
        let _b = user_page(&mut page_table, 0x11, flags);
        let token = page_table.token();
        let start = 0x10ffc as *const u8;
        let mut buffer = UserBuffer::new(translated_byte_buffer(token, start, 8).unwrap());
        assert_eq!(buffer.buffers.len(), 2);
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.write(b"abcdefghij"), 8);
        let mut out = [0u8; 8];
        let again = UserBuffer::new(translated_byte_buffer(token, start, 8).unwrap());
        assert_eq!(again.read(&mut out), 8);
        assert_eq!(&out, b"abcdefgh");
        let bytes: Vec<u8> = again.into_iter().map(|p| unsafe { *p }).collect();
        assert_eq!(bytes, b"abcdefgh");
    }

    #[test]
    fn user_helpers_reject_kernel_only_and_unmapped_pages() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let _user = user_page(&mut page_table, 0x10, PTEFlags::R | PTEFlags::W | PTEFlags::U);
        let _kernel = user_page(&mut page_table, 0x11, PTEFlags::R | PTEFlags::W);
        let token = page_table.token();
        assert_eq!(
            translated_byte_buffer(token, 0x10ff0 as *const u8, 0x20).err(),
            Some(MemoryError::BadAddress(0x11000))
        );
        assert_eq!(
            translated_byte_buffer(token, 0x20000 as *const u8, 1).err(),
            Some(MemoryError::BadAddress(0x20000))
        );
        assert!(translated_byte_buffer(token, 0x10000 as *const u8, 0).unwrap().is_empty());
    }

    #[test]
    fn user_buffers_never_run_past_the_top_of_user_space() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        // 用户空间的最后一页
        let _top = user_page(&mut page_table, 0x3ff_ffff, PTEFlags::R | PTEFlags::W | PTEFlags::U);
        let token = page_table.token();
        let last = 0x3f_ffff_fff8usize;
        let buffer = UserBuffer::new(translated_byte_buffer(token, last as *const u8, 8).unwrap());
        assert_eq!(buffer.len(), 8);
        assert_eq!(
            translated_byte_buffer(token, last as *const u8, 16).err(),
            Some(MemoryError::BadAddress(0x40_0000_0000))
        );
        assert_eq!(
            copy_to_user(token, last as *mut [u64; 2], &[1, 2]).err(),
            Some(MemoryError::BadAddress(0x40_0000_0000))
        );
    }

    #[test]
    fn strings_and_values_cross_into_user_space() {
        let _guard = test_support::boot();
        let mut page_table = PageTable::new().unwrap();
        let flags = PTEFlags::R | PTEFlags::W | PTEFlags::U;
        let a = user_page(&mut page_table, 0x10, flags);
        let b = user_page(&mut page_table, 0x11, flags);
        let token = page_table.token();
        // 字符串跨越两页
        a.ppn.get_bytes_array()[0xffe..].copy_from_slice(b"he");
        b.ppn.get_bytes_array()[..4].copy_from_slice(b"llo\0");
        assert_eq!(translated_str(token, 0x10ffe as *const u8).unwrap(), "hello");
        // 没有结尾的字符串读到未映射的页
        b.ppn.get_bytes_array().fill(b'x');
        assert_eq!(
            translated_str(token, 0x11ff0 as *const u8).err(),
            Some(MemoryError::BadAddress(0x12000))
        );
        copy_to_user(token, 0x10ffe as *mut i32, &0x1234_5678i32).unwrap();
        assert_eq!(&a.ppn.get_bytes_array()[0xffe..], &[0x78, 0x56]);
        assert_eq!(&b.ppn.get_bytes_array()[..2], &[0x34, 0x12]);
    }
}
