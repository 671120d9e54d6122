//! 用户程序镜像的登记表
//!
//! 板级代码在启动时把链接进内核的各个应用的ELF镜像按名字登记在这里，
//! `exec`和`spawn`按名字查找。

use crate::sync::UPIntrFreeCell;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use lazy_static::*;

lazy_static! {
    static ref APPS: UPIntrFreeCell<BTreeMap<&'static str, &'static [u8]>> =
        unsafe { UPIntrFreeCell::new(BTreeMap::new()) };
}

/// 登记一个应用，同名的应用会被替换
pub fn register_app(name: &'static str, elf_data: &'static [u8]) {
    if APPS.exclusive_access().insert(name, elf_data).is_some() {
        warn!("[kernel] app {} registered twice, keeping the latest image", name);
    }
}

/// 按名字获取应用的ELF数据
pub fn get_app_data_by_name(name: &str) -> Option<&'static [u8]> {
    APPS.exclusive_access().get(name).copied()
}

/// 打印所有应用的名字
pub fn list_apps() -> Vec<&'static str> {
    let apps: Vec<&'static str> = APPS.exclusive_access().keys().copied().collect();
    println!("/**** APPS ****");
    for app in apps.iter() {
        println!("{}", app);
    }
    println!("**************/");
    apps
}
