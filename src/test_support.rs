//! 主机上单元测试的公共设施
//!
//! 内核的全局状态（页帧分配器、内核空间、进程标识符分配器、调度器）在整个测试进程中只有一份，
//! 所以每个用到它们的测试都要先调用[`boot`]，持有返回的锁直到测试结束。
//! 物理内存是一段按页对齐、永不释放的主机内存，其第一页充当跳板页。

use crate::config::{INITPROC_NAME, MMIO, PAGE_SIZE};
use crate::mm::{self, translated_byte_buffer, KernelLayout, UserBuffer};
use crate::task::{
    add_task, current_trap_cx, dispatch_next, fetch_task, release_exited_stack, set_sched_policy,
    take_current_task, SchedPolicy, TaskControlBlock, INITPROC,
};
use crate::trap::{handle_trap, TrapCause};
use crate::{arch, loader, logging};
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{Mutex, MutexGuard, Once};

/// 交给内核的主机内存大小
const PHYS_MEMORY_SIZE: usize = 32 * 1024 * 1024;

static SERIAL: Mutex<()> = Mutex::new(());
static BOOT: Once = Once::new();

/// 启动（仅第一次）并清空调度器状态，返回的锁保证测试之间互不干扰
pub fn boot() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    BOOT.call_once(|| {
        logging::init();
        loader::register_app(INITPROC_NAME, leak(sample_elf()));
        loader::register_app("sample", leak(sample_elf()));
        let memory = unsafe {
            std::alloc::alloc(
                std::alloc::Layout::from_size_align(PHYS_MEMORY_SIZE, PAGE_SIZE)
                    .expect("bad host memory layout"),
            )
        } as usize;
        assert_ne!(memory, 0, "cannot allocate host memory");
        mm::init(KernelLayout {
            text: 0x8020_0000..0x8020_4000,
            rodata: 0x8020_4000..0x8020_6000,
            data: 0x8020_6000..0x8020_8000,
            bss: 0x8020_8000..0x8021_0000,
            phys_memory: 0x8021_0000..0x8080_0000,
            mmio: MMIO,
            frames: memory + PAGE_SIZE..memory + PHYS_MEMORY_SIZE,
            trampoline: memory,
        });
        // initproc的进程标识符为0
        lazy_static::initialize(&INITPROC);
    });
    reset();
    guard
}

/// 清空准备队列、处理器和控制台输入，回收initproc名下残留的子进程
fn reset() {
    while let Some(task) = fetch_task() {
        drop(task);
    }
    drop(take_current_task());
    // 释放尚未释放的内核栈
    dispatch_next();
    let orphans = core::mem::take(&mut INITPROC.inner_exclusive_access().children);
    drop(orphans);
    set_sched_policy(SchedPolicy::Fifo);
    while arch::console_getchar() != 0 {}
    arch::intr_disable();
}

/// 启动时使用的内存布局
pub fn layout() -> KernelLayout {
    mm::kernel_layout().clone()
}

fn leak(data: Vec<u8>) -> &'static [u8] {
    Vec::leak(data)
}

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// 样例程序的入口
pub const SAMPLE_ENTRY: usize = 0x10000;
/// 样例程序0x10000处的代码段内容
pub const SAMPLE_TEXT: &[u8] = &[
    0x93, 0x08, 0xd0, 0x05, 0x13, 0x05, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x6f, 0x00, 0x00, 0x00,
];
/// 样例程序0x11000处的数据段内容，其后是延伸到0x12800的bss
pub const SAMPLE_DATA: &[u8] = b"rcoredat";

/// ELF镜像中的一个LOAD段
pub struct ElfSegment {
    vaddr: usize,
    flags: u32,
    data: Vec<u8>,
    mem_size: usize,
}

impl ElfSegment {
    pub fn new(vaddr: usize, flags: u32, data: &[u8], mem_size: usize) -> Self {
        Self {
            vaddr,
            flags,
            data: data.to_vec(),
            mem_size,
        }
    }
}

/// 构造一个只有程序头表的RV64小端ELF可执行文件
pub fn build_elf(entry: usize, segments: &[ElfSegment]) -> Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;
    let mut image: Vec<u8> = Vec::new();
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&0xf3u16.to_le_bytes()); // EM_RISCV
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&(entry as u64).to_le_bytes());
    image.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    image.extend_from_slice(&0u64.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    image.extend_from_slice(&64u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(image.len(), EHDR_SIZE);
    let mut offset = EHDR_SIZE + PHDR_SIZE * segments.len();
    for segment in segments {
        image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image.extend_from_slice(&segment.flags.to_le_bytes());
        image.extend_from_slice(&(offset as u64).to_le_bytes());
        image.extend_from_slice(&(segment.vaddr as u64).to_le_bytes());
        image.extend_from_slice(&(segment.vaddr as u64).to_le_bytes());
        image.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
        image.extend_from_slice(&(segment.mem_size as u64).to_le_bytes());
        image.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        offset += segment.data.len();
    }
    for segment in segments {
        image.extend_from_slice(&segment.data);
    }
    image
}

/// 代码段在0x10000、数据段在0x11000的样例程序
pub fn sample_elf() -> Vec<u8> {
    build_elf(
        SAMPLE_ENTRY,
        &[
            ElfSegment::new(0x10000, PF_R | PF_X, SAMPLE_TEXT, SAMPLE_TEXT.len()),
            ElfSegment::new(0x11000, PF_R | PF_W, SAMPLE_DATA, 0x1800),
        ],
    )
}

/// 由initproc创建一个运行样例程序的子进程，并让它成为当前任务
pub fn run_spawned() -> Arc<TaskControlBlock> {
    let task = INITPROC
        .spawn(&sample_elf())
        .expect("cannot spawn the sample program");
    add_task(task.clone());
    assert!(dispatch_next());
    task
}

/// 当前任务执行一次`ecall`
pub fn ecall(id: usize, args: [usize; 3]) {
    let cx = current_trap_cx();
    cx.x[17] = id;
    cx.x[10..13].copy_from_slice(&args);
    handle_trap(TrapCause::Syscall, 0);
}

/// 任务陷入上下文中的a0
pub fn a0(task: &TaskControlBlock) -> isize {
    task.inner_exclusive_access().get_trap_cx().x[10] as isize
}

pub fn write_user(task: &TaskControlBlock, va: usize, bytes: &[u8]) {
    let token = task.inner_exclusive_access().get_user_token();
    let mut buffer = UserBuffer::new(
        translated_byte_buffer(token, va as *const u8, bytes.len()).expect("bad user buffer"),
    );
    assert_eq!(buffer.write(bytes), bytes.len());
}

pub fn read_user(task: &TaskControlBlock, va: usize, len: usize) -> Vec<u8> {
    let token = task.inner_exclusive_access().get_user_token();
    let buffer = UserBuffer::new(
        translated_byte_buffer(token, va as *const u8, len).expect("bad user buffer"),
    );
    let mut bytes = alloc::vec![0u8; len];
    assert_eq!(buffer.read(&mut bytes), len);
    bytes
}

/// 由initproc回收一个已退出的子进程，返回其退出码。
///
/// 真实的调度总是先经过空闲控制流，这里直接释放被停放的内核栈，
/// 免得进程标识符被复用时新的内核栈与它重叠。
pub fn reap(task: Arc<TaskControlBlock>) -> i32 {
    let pid = task.getpid();
    drop(task);
    release_exited_stack();
    INITPROC
        .wait_child(Some(pid))
        .expect("the task has not exited")
        .1
}
