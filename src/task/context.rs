//! [`TaskContext`]的实现

use crate::trap::trap_return;

/// 任务上下文结构体，保存`__switch`需要的被调用者保存寄存器
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct TaskContext {
    /// 返回地址，`__switch`之后从这里继续执行
    ra: usize,
    /// 内核栈指针
    sp: usize,
    /// s0-11
    s: [usize; 12],
}

impl TaskContext {
    pub fn zero_init() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
    /// 第一次被切换到时从`trap_return`进入用户态
    pub fn goto_trap_return(kstack_ptr: usize) -> Self {
        Self {
            ra: trap_return as usize,
            sp: kstack_ptr,
            s: [0; 12],
        }
    }
    pub fn sp(&self) -> usize {
        self.sp
    }
}
