//! 把用户程序的ELF镜像打包进`link_app.S`
//!
//! 镜像所在的目录由环境变量`USER_ELF_DIR`指定，默认是`../user/build/elf/`。
//! 目录不存在时生成一个空的应用表。

use std::env;
use std::fs::{read_dir, File};
use std::io::{Result, Write};
use std::path::{Path, PathBuf};

static DEFAULT_TARGET_PATH: &str = "../user/build/elf/";

fn main() {
    let target_path = env::var("USER_ELF_DIR").unwrap_or_else(|_| DEFAULT_TARGET_PATH.into());
    println!("cargo:rerun-if-env-changed=USER_ELF_DIR");
    println!("cargo:rerun-if-changed={}", target_path);
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    insert_app_data(Path::new(&target_path), &out_dir.join("link_app.S")).unwrap();
}

fn insert_app_data(target_path: &Path, output: &Path) -> Result<()> {
    let mut f = File::create(output)?;
    let mut apps: Vec<String> = match read_dir(target_path) {
        Ok(dir) => dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_suffix(".elf").map(String::from)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    apps.sort();

    writeln!(
        f,
        r#"
    .align 3
    .section .data
    .global _num_app
_num_app:
    .quad {}"#,
        apps.len()
    )?;

    for i in 0..apps.len() {
        writeln!(f, r#"    .quad app_{}_start"#, i)?;
    }
    if let Some(last) = apps.len().checked_sub(1) {
        writeln!(f, r#"    .quad app_{}_end"#, last)?;
    } else {
        writeln!(f, r#"    .quad 0"#)?;
    }

    writeln!(
        f,
        r#"
    .global _app_names
_app_names:"#
    )?;
    for app in apps.iter() {
        writeln!(f, r#"    .string "{}""#, app)?;
    }

    for (idx, app) in apps.iter().enumerate() {
        println!("app_{}: {}", idx, app);
        writeln!(
            f,
            r#"
    .section .data
    .global app_{0}_start
    .global app_{0}_end
    .align 3
app_{0}_start:
    .incbin "{1}"
app_{0}_end:"#,
            idx,
            target_path.join(format!("{}.elf", app)).display()
        )?;
    }
    Ok(())
}
