//! [`MapArea`]和[`MemorySet`]的实现

use super::{frame_alloc, FrameTracker, KernelLayout, MemoryError};
use super::{PTEFlags, PageTable, PageTableEntry};
use super::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use super::{StepByOne, VPNRange};
use crate::arch;
use crate::config::{PAGE_SIZE, TRAMPOLINE, TRAP_CONTEXT, USER_STACK_SIZE};
use crate::sync::UPIntrFreeCell;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::*;
use lazy_static::*;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

/// ELF文件的魔数
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// 用户地址空间的上界，SV39下低半部分的末尾
const USER_SPACE_END: usize = 1 << 38;

lazy_static! {
    /// 内核地址空间
    pub static ref KERNEL_SPACE: Arc<UPIntrFreeCell<MemorySet>> = Arc::new(unsafe {
        UPIntrFreeCell::new(
            MemorySet::new_kernel(super::layout::kernel_layout())
                .unwrap_or_else(|err| panic!("[kernel] cannot build kernel space: {}", err)),
        )
    });
}

/// 内核地址空间的页表信令
pub fn kernel_token() -> usize {
    KERNEL_SPACE.exclusive_access().token()
}

/// 地址空间：一个页表和其中的若干逻辑段
pub struct MemorySet {
    page_table: PageTable,
    areas: Vec<MapArea>,
}

impl MemorySet {
    pub fn new_bare() -> Result<Self, MemoryError> {
        Ok(Self {
            page_table: PageTable::new()?,
            areas: Vec::new(),
        })
    }
    pub fn token(&self) -> usize {
        self.page_table.token()
    }
    /// 假设新的逻辑段与已有的逻辑段不相交
    pub fn insert_framed_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
    ) -> Result<(), MemoryError> {
        assert!(
            self.is_range_free(start_va.floor(), end_va.ceil()),
            "area [{:?}, {:?}) overlaps an existing area",
            start_va,
            end_va
        );
        self.push(
            MapArea::new(start_va, end_va, MapType::Framed, permission),
            None,
        )
    }
    /// 移除以`start_vpn`开头的逻辑段并回收其页帧
    pub fn remove_area_with_start_vpn(&mut self, start_vpn: VirtPageNum) {
        match self
            .areas
            .iter()
            .position(|area| area.vpn_range.get_start() == start_vpn)
        {
            Some(idx) => {
                let mut area = self.areas.remove(idx);
                area.unmap(&mut self.page_table);
            }
            None => panic!("no area starts at {:?}", start_vpn),
        }
    }
    /// `[start_vpn, end_vpn)`是否与任何逻辑段以及跳板页都不相交
    pub fn is_range_free(&self, start_vpn: VirtPageNum, end_vpn: VirtPageNum) -> bool {
        let range = VPNRange::new(start_vpn, end_vpn);
        end_vpn <= VirtAddr::from(TRAMPOLINE).floor()
            && self.areas.iter().all(|area| !area.vpn_range.intersects(&range))
    }
    /// 映射逻辑段并把`data`拷贝到段内，`data`的第二项是数据在第一页内的偏移
    fn push(&mut self, mut map_area: MapArea, data: Option<(&[u8], usize)>) -> Result<(), MemoryError> {
        map_area.map(&mut self.page_table)?;
        if let Some((data, offset)) = data {
            map_area.copy_data(data, offset);
        }
        self.areas.push(map_area);
        Ok(())
    }
    /// 跳板页不属于任何逻辑段
    fn map_trampoline(&mut self, trampoline: PhysAddr) -> Result<(), MemoryError> {
        self.page_table.map(
            VirtAddr::from(TRAMPOLINE).into(),
            PhysPageNum::from(trampoline),
            PTEFlags::R | PTEFlags::X,
        )
    }
    /// 内核地址空间，对内核镜像、物理内存和MMIO做恒等映射
    pub fn new_kernel(layout: &KernelLayout) -> Result<Self, MemoryError> {
        let mut memory_set = Self::new_bare()?;
        memory_set.map_trampoline(PhysAddr::from(layout.trampoline))?;
        info!(
            "[kernel] .text [{:#x}, {:#x})",
            layout.text.start, layout.text.end
        );
        info!(
            "[kernel] .rodata [{:#x}, {:#x})",
            layout.rodata.start, layout.rodata.end
        );
        info!(
            "[kernel] .data [{:#x}, {:#x})",
            layout.data.start, layout.data.end
        );
        info!(
            "[kernel] .bss [{:#x}, {:#x})",
            layout.bss.start, layout.bss.end
        );
        let sections = [
            (&layout.text, MapPermission::R | MapPermission::X),
            (&layout.rodata, MapPermission::R),
            (&layout.data, MapPermission::R | MapPermission::W),
            (&layout.bss, MapPermission::R | MapPermission::W),
            (&layout.phys_memory, MapPermission::R | MapPermission::W),
        ];
        for (range, permission) in sections {
            memory_set.push(
                MapArea::new(
                    range.start.into(),
                    range.end.into(),
                    MapType::Identical,
                    permission,
                ),
                None,
            )?;
        }
        debug!("[kernel] mapping memory-mapped registers");
        for &(start, len) in layout.mmio {
            memory_set.push(
                MapArea::new(
                    start.into(),
                    (start + len).into(),
                    MapType::Identical,
                    MapPermission::R | MapPermission::W,
                ),
                None,
            )?;
        }
        Ok(memory_set)
    }
    /// 由ELF镜像构造用户地址空间。
    ///
    /// 地址空间包含各个LOAD段、一个保护页、用户栈、紧接用户栈顶的堆、陷入上下文和跳板页。
    /// 返回地址空间、用户栈顶和入口地址。
    pub fn from_elf(elf_data: &[u8]) -> Result<(Self, usize, usize), MemoryError> {
        if elf_data.len() < 64 || elf_data[..4] != ELF_MAGIC {
            return Err(MemoryError::InvalidElf("invalid elf magic"));
        }
        let elf = ElfFile::new(elf_data).map_err(MemoryError::InvalidElf)?;
        let mut memory_set = Self::new_bare()?;
        memory_set.map_trampoline(super::layout::kernel_layout().trampoline.into())?;
        let mut max_end_vpn = VirtPageNum(0);
        for ph in elf.program_iter() {
            if ph.get_type() != Ok(Type::Load) {
                continue;
            }
            let start = ph.virtual_addr() as usize;
            let end = start
                .checked_add(ph.mem_size() as usize)
                .filter(|&end| end <= USER_SPACE_END)
                .ok_or(MemoryError::InvalidElf("segment outside the user address range"))?;
            let offset = ph.offset() as usize;
            let file_size = ph.file_size() as usize;
            if file_size > ph.mem_size() as usize
                || offset.checked_add(file_size).map_or(true, |e| e > elf_data.len())
            {
                return Err(MemoryError::InvalidElf("segment data outside the file"));
            }
            let start_va: VirtAddr = start.into();
            let end_va: VirtAddr = end.into();
            if !memory_set.is_range_free(start_va.floor(), end_va.ceil()) {
                return Err(MemoryError::InvalidElf("overlapping segments"));
            }
            let mut map_perm = MapPermission::U;
            let ph_flags = ph.flags();
            if ph_flags.is_read() {
                map_perm |= MapPermission::R;
            }
            if ph_flags.is_write() {
                map_perm |= MapPermission::W;
            }
            if ph_flags.is_execute() {
                map_perm |= MapPermission::X;
            }
            let map_area = MapArea::new(start_va, end_va, MapType::Framed, map_perm);
            max_end_vpn = max_end_vpn.max(map_area.vpn_range.get_end());
            memory_set.push(
                map_area,
                Some((&elf_data[offset..offset + file_size], start_va.page_offset())),
            )?;
        }
        // 用户栈之下留一个保护页
        let max_end_va: VirtAddr = max_end_vpn.into();
        let user_stack_bottom: usize = usize::from(max_end_va) + PAGE_SIZE;
        let user_stack_top = user_stack_bottom + USER_STACK_SIZE;
        memory_set.push(
            MapArea::new(
                user_stack_bottom.into(),
                user_stack_top.into(),
                MapType::Framed,
                MapPermission::R | MapPermission::W | MapPermission::U,
            ),
            None,
        )?;
        // 堆从用户栈顶开始，初始为空
        memory_set.push(
            MapArea::new(
                user_stack_top.into(),
                user_stack_top.into(),
                MapType::Framed,
                MapPermission::R | MapPermission::W | MapPermission::U,
            ),
            None,
        )?;
        // 陷入上下文只在内核态通过跳板访问，不带U标志
        memory_set.push(
            MapArea::new(
                TRAP_CONTEXT.into(),
                TRAMPOLINE.into(),
                MapType::Framed,
                MapPermission::R | MapPermission::W,
            ),
            None,
        )?;
        Ok((
            memory_set,
            user_stack_top,
            elf.header.pt2.entry_point() as usize,
        ))
    }
    /// 深拷贝一个用户地址空间，新旧地址空间之后互不影响
    pub fn from_existing(user_space: &MemorySet) -> Result<Self, MemoryError> {
        let mut memory_set = Self::new_bare()?;
        let trampoline = user_space
            .translate(VirtAddr::from(TRAMPOLINE).into())
            .ok_or(MemoryError::NotMapped)?
            .ppn();
        memory_set.map_trampoline(trampoline.into())?;
        for area in user_space.areas.iter() {
            let mut new_area = MapArea::from_another(area);
            new_area.map(&mut memory_set.page_table)?;
            for (vpn, src) in area.data_frames.iter() {
                if let Some(dst) = new_area.data_frames.get(vpn) {
                    dst.ppn
                        .get_bytes_array()
                        .copy_from_slice(src.ppn.get_bytes_array());
                }
            }
            memory_set.areas.push(new_area);
        }
        Ok(memory_set)
    }
    /// 切换到这个地址空间
    pub fn activate(&self) {
        arch::activate_page_table(self.page_table.token());
    }
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(vpn)
    }
    /// 回收所有逻辑段。页表本身所在的页帧在地址空间被释放时回收
    pub fn recycle_data_pages(&mut self) {
        for mut area in self.areas.drain(..) {
            area.unmap(&mut self.page_table);
        }
    }
    /// 在`[start, start + len)`建立匿名映射
    pub fn mmap(&mut self, start: usize, len: usize, permission: MapPermission) -> Result<(), MemoryError> {
        let start_va = VirtAddr::from(start);
        if !start_va.aligned() || len == 0 {
            return Err(MemoryError::BadAddress(start));
        }
        let end = start
            .checked_add(len)
            .filter(|&end| end <= USER_SPACE_END)
            .ok_or(MemoryError::BadAddress(start))?;
        let end_va = VirtAddr::from(end);
        if !self.is_range_free(start_va.floor(), end_va.ceil()) {
            return Err(MemoryError::Overlap);
        }
        self.push(
            MapArea::new(start_va, end_va, MapType::Framed, permission | MapPermission::U),
            None,
        )
    }
    /// 解除由[`MemorySet::mmap`]建立的映射，区间必须恰好是一个完整的逻辑段
    pub fn munmap(&mut self, start: usize, len: usize) -> Result<(), MemoryError> {
        let start_va = VirtAddr::from(start);
        if !start_va.aligned() {
            return Err(MemoryError::BadAddress(start));
        }
        let end_vpn = VirtAddr::from(start.checked_add(len).ok_or(MemoryError::NotMapped)?).ceil();
        let start_vpn = start_va.floor();
        if start_vpn == end_vpn {
            return Err(MemoryError::NotMapped);
        }
        // 空的堆段可能与被解除的段起点相同，按整个区间查找
        let idx = self
            .areas
            .iter()
            .position(|area| {
                area.vpn_range.get_start() == start_vpn
                    && area.vpn_range.get_end() == end_vpn
                    && area.map_perm.contains(MapPermission::U)
            })
            .ok_or(MemoryError::NotMapped)?;
        let mut area = self.areas.remove(idx);
        area.unmap(&mut self.page_table);
        Ok(())
    }
    /// 把以`start`开头的逻辑段收缩到`new_end`
    pub fn shrink_to(&mut self, start: VirtAddr, new_end: VirtAddr) -> Result<(), MemoryError> {
        let area = self
            .areas
            .iter_mut()
            .find(|area| area.vpn_range.get_start() == start.floor())
            .ok_or(MemoryError::NotMapped)?;
        area.shrink_to(&mut self.page_table, new_end.ceil());
        Ok(())
    }
    /// 把以`start`开头的逻辑段扩展到`new_end`，扩展部分不能与其他逻辑段相交
    pub fn append_to(&mut self, start: VirtAddr, new_end: VirtAddr) -> Result<(), MemoryError> {
        let idx = self
            .areas
            .iter()
            .position(|area| area.vpn_range.get_start() == start.floor())
            .ok_or(MemoryError::NotMapped)?;
        let old_end = self.areas[idx].vpn_range.get_end();
        let new_end = new_end.ceil();
        if new_end <= old_end {
            return Ok(());
        }
        let grown = VPNRange::new(old_end, new_end);
        let collides = self
            .areas
            .iter()
            .enumerate()
            .any(|(i, area)| i != idx && area.vpn_range.intersects(&grown));
        if collides || new_end > VirtAddr::from(TRAMPOLINE).floor() {
            return Err(MemoryError::Overlap);
        }
        self.areas[idx].append_to(&mut self.page_table, new_end)
    }
}

/// 逻辑段：一段连续的、映射方式和权限都相同的虚拟页
pub struct MapArea {
    vpn_range: VPNRange,
    data_frames: BTreeMap<VirtPageNum, FrameTracker>,
    map_type: MapType,
    map_perm: MapPermission,
}

impl MapArea {
    pub fn new(
        start_va: VirtAddr,
        end_va: VirtAddr,
        map_type: MapType,
        map_perm: MapPermission,
    ) -> Self {
        let start_vpn: VirtPageNum = start_va.floor();
        let end_vpn: VirtPageNum = end_va.ceil();
        Self {
            vpn_range: VPNRange::new(start_vpn, end_vpn),
            data_frames: BTreeMap::new(),
            map_type,
            map_perm,
        }
    }
    /// 同样的区间、映射方式和权限，但还没有页帧
    pub fn from_another(another: &MapArea) -> Self {
        Self {
            vpn_range: VPNRange::new(another.vpn_range.get_start(), another.vpn_range.get_end()),
            data_frames: BTreeMap::new(),
            map_type: another.map_type,
            map_perm: another.map_perm,
        }
    }
    fn map_one(&mut self, page_table: &mut PageTable, vpn: VirtPageNum) -> Result<(), MemoryError> {
        let ppn: PhysPageNum = match self.map_type {
            MapType::Identical => PhysPageNum(vpn.0),
            MapType::Framed => {
                let frame = frame_alloc().ok_or(MemoryError::OutOfMemory)?;
                frame.clear();
                let ppn = frame.ppn;
                self.data_frames.insert(vpn, frame);
                ppn
            }
        };
        let pte_flags = PTEFlags::from_bits_truncate(self.map_perm.bits());
        if let Err(err) = page_table.map(vpn, ppn, pte_flags) {
            self.data_frames.remove(&vpn);
            return Err(err);
        }
        Ok(())
    }
    fn unmap_one(&mut self, page_table: &mut PageTable, vpn: VirtPageNum) {
        if self.map_type == MapType::Framed {
            self.data_frames.remove(&vpn);
        }
        page_table.unmap(vpn);
    }
    /// 映射整个逻辑段，失败时撤销已经建立的映射
    pub fn map(&mut self, page_table: &mut PageTable) -> Result<(), MemoryError> {
        for vpn in self.vpn_range {
            if let Err(err) = self.map_one(page_table, vpn) {
                for mapped in VPNRange::new(self.vpn_range.get_start(), vpn) {
                    self.unmap_one(page_table, mapped);
                }
                return Err(err);
            }
        }
        Ok(())
    }
    pub fn unmap(&mut self, page_table: &mut PageTable) {
        for vpn in self.vpn_range {
            self.unmap_one(page_table, vpn);
        }
    }
    pub fn shrink_to(&mut self, page_table: &mut PageTable, new_end: VirtPageNum) {
        let new_end = new_end.max(self.vpn_range.get_start());
        for vpn in VPNRange::new(new_end, self.vpn_range.get_end().max(new_end)) {
            self.unmap_one(page_table, vpn)
        }
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end.min(self.vpn_range.get_end()));
    }
    pub fn append_to(&mut self, page_table: &mut PageTable, new_end: VirtPageNum) -> Result<(), MemoryError> {
        let old_end = self.vpn_range.get_end();
        for vpn in VPNRange::new(old_end, new_end) {
            if let Err(err) = self.map_one(page_table, vpn) {
                for mapped in VPNRange::new(old_end, vpn) {
                    self.unmap_one(page_table, mapped);
                }
                return Err(err);
            }
        }
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end);
        Ok(())
    }
    /// 从段内第一页的`offset`处开始拷贝数据，只用于Framed逻辑段
    pub fn copy_data(&mut self, data: &[u8], offset: usize) {
        assert_eq!(self.map_type, MapType::Framed);
        let mut copied = 0;
        let mut page_offset = offset;
        let mut current_vpn = self.vpn_range.get_start();
        while copied < data.len() {
            let n = (PAGE_SIZE - page_offset).min(data.len() - copied);
            let frame = &self.data_frames[&current_vpn];
            frame.ppn.get_bytes_array()[page_offset..page_offset + n]
                .copy_from_slice(&data[copied..copied + n]);
            copied += n;
            page_offset = 0;
            current_vpn.step();
        }
    }
}

/// 逻辑段的映射方式
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum MapType {
    /// 恒等映射，虚拟页号等于物理页号
    Identical,
    /// 每个虚拟页对应一个新分配的物理页帧
    Framed,
}

bitflags! {
    /// 逻辑段的访问权限，与页表项中对应的标志位相同
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}

/// 检查内核地址空间中各段的权限
pub fn remap_test(layout: &KernelLayout) {
    let kernel_space = KERNEL_SPACE.exclusive_access();
    let mid = |range: &core::ops::Range<usize>| VirtAddr::from((range.start + range.end) / 2).floor();
    let text = kernel_space.page_table.translate(mid(&layout.text));
    let rodata = kernel_space.page_table.translate(mid(&layout.rodata));
    let data = kernel_space.page_table.translate(mid(&layout.data));
    assert!(text.map_or(false, |pte| !pte.writable() && pte.executable()));
    assert!(rodata.map_or(false, |pte| !pte.writable() && !pte.executable()));
    assert!(data.map_or(false, |pte| !pte.executable()));
    info!("[kernel] remap_test passed!");
}
