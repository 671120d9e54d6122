//! 单核处理器上带中断屏蔽的内部可变封装

use crate::arch;
use core::cell::{RefCell, RefMut, UnsafeCell};
use core::ops::{Deref, DerefMut};
use lazy_static::*;

/// 不做任何检查的内部可变封装，只用来存放中断屏蔽的嵌套信息。
///
/// 仅单线程时安全。
pub struct UPSafeCellRaw<T> {
    inner: UnsafeCell<T>,
}

unsafe impl<T> Sync for UPSafeCellRaw<T> {}

impl<T> UPSafeCellRaw<T> {
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut T {
        unsafe { &mut (*self.inner.get()) }
    }
}

/// 中断屏蔽的嵌套层数，以及最外层屏蔽之前中断是否使能
pub struct IntrMaskingInfo {
    nested_level: usize,
    sie_before_masking: bool,
}

lazy_static! {
    static ref INTR_MASKING_INFO: UPSafeCellRaw<IntrMaskingInfo> =
        unsafe { UPSafeCellRaw::new(IntrMaskingInfo::new()) };
}

impl IntrMaskingInfo {
    pub fn new() -> Self {
        Self {
            nested_level: 0,
            sie_before_masking: false,
        }
    }

    pub fn enter(&mut self) {
        let sie = arch::intr_enabled();
        arch::intr_disable();
        if self.nested_level == 0 {
            self.sie_before_masking = sie;
        }
        self.nested_level += 1;
    }

    pub fn exit(&mut self) {
        self.nested_level -= 1;
        if self.nested_level == 0 && self.sie_before_masking {
            arch::intr_enable();
        }
    }
}

/// 全局数据结构的独占访问封装。
///
/// 借用期间屏蔽S态中断，所以持有借用的内核代码不会被可能再次进入同一结构的中断打断；
/// 借用结束时恢复最外层借用之前的中断使能状态。同一时刻只允许一个借用存在，
/// 重复借用直接panic，而不是产生别名。
///
/// 仅单核时安全。
pub struct UPIntrFreeCell<T> {
    /// 内部数据
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPIntrFreeCell<T> {}

/// [`UPIntrFreeCell::exclusive_access`]返回的借用，释放时解除这一层中断屏蔽
pub struct UPIntrRefMut<'a, T>(Option<RefMut<'a, T>>);

impl<T> UPIntrFreeCell<T> {
    /// 调用者有责任保证内部结构体只在单核上使用。
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// 获得内部数据的独占访问，使用后应及时`drop`。
    pub fn exclusive_access(&self) -> UPIntrRefMut<'_, T> {
        INTR_MASKING_INFO.get_mut().enter();
        match self.inner.try_borrow_mut() {
            Ok(inner) => UPIntrRefMut(Some(inner)),
            Err(_) => {
                INTR_MASKING_INFO.get_mut().exit();
                panic!("reentrant exclusive access to a UPIntrFreeCell");
            }
        }
    }

    /// 在独占访问期间执行`f`
    pub fn exclusive_session<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&mut T) -> V,
    {
        let mut inner = self.exclusive_access();
        f(inner.deref_mut())
    }
}

impl<'a, T> Drop for UPIntrRefMut<'a, T> {
    fn drop(&mut self) {
        self.0 = None;
        INTR_MASKING_INFO.get_mut().exit();
    }
}

impl<'a, T> Deref for UPIntrRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref().unwrap().deref()
    }
}

impl<'a, T> DerefMut for UPIntrRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut().unwrap().deref_mut()
    }
}
