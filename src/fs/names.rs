//! 文件名处理：转义、Unicode 归一化、大小写折叠

use std::cmp::Ordering;
use unicode_normalization::UnicodeNormalization;

use super::FsFamily;

fn is_lower_hex(c: u8) -> bool {
    c.is_ascii_digit() || (b'a'..=b'f').contains(&c)
}

fn hex_val(c: u8) -> u8 {
    if c.is_ascii_digit() {
        c - b'0'
    } else {
        c - b'a' + 10
    }
}

/// 把目标家族禁用的字节替换成 `%xx`（小写十六进制）
///
/// 两个自指名字整体转义：`.` → `%2e`，`..` → `%2e%2e`。
/// 多字节 UTF-8 序列不转义。
pub fn escape_fs_incompatible(name: &str, family: FsFamily) -> String {
    if name == ".." {
        return "%2e%2e".to_string();
    }
    if name == "." {
        return "%2e".to_string();
    }

    let bytes = name.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c < 0x80 {
            if family.forbidden_byte(c) {
                out.push_str(&format!("%{:02x}", c));
            } else {
                out.push(c as char);
            }
            i += 1;
        } else {
            // 多字节序列整体保留
            let len = utf8_seq_len(c);
            let end = (i + len).min(bytes.len());
            out.push_str(std::str::from_utf8(&bytes[i..end]).unwrap_or(""));
            i = end;
        }
    }
    out
}

/// `escape_fs_incompatible` 的逆：只还原格式良好、且解码后字节
/// 在该家族确实被禁用的 `%xx`（避免误改用户内容里的 `%xx`）
pub fn unescape_fs_incompatible(name: &str, family: FsFamily) -> String {
    if name == "%2e%2e" {
        return "..".to_string();
    }
    if name == "%2e" {
        return ".".to_string();
    }

    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && is_lower_hex(bytes[i + 1])
            && is_lower_hex(bytes[i + 2])
        {
            let c = (hex_val(bytes[i + 1]) << 4) | hex_val(bytes[i + 2]);
            if family.forbidden_byte(c) {
                out.push(c);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn utf8_seq_len(first: u8) -> usize {
    if first >= 0xf0 {
        4
    } else if first >= 0xe0 {
        3
    } else if first >= 0xc0 {
        2
    } else {
        1
    }
}

/// NFC 归一化（本地名跨到云端前调用）
///
/// 个别文件系统允许名字里嵌 NUL：按 NUL 切段分别归一化，NUL 原样保留。
pub fn normalize_nfc(name: &str) -> String {
    if !name.contains('\0') {
        return name.nfc().collect();
    }

    let mut out = String::with_capacity(name.len());
    let mut first = true;
    for segment in name.split('\0') {
        if !first {
            out.push('\0');
        }
        first = false;
        out.extend(segment.nfc());
    }
    out
}

/// 按家族规则折叠名字，作为子项映射的键
pub fn fold_name(name: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        name.chars().flat_map(|c| c.to_lowercase()).collect()
    } else {
        name.to_string()
    }
}

/// 折叠后的比较（扫描结果排序与三元组分组都用它）
pub fn casefold_cmp(a: &str, b: &str, case_insensitive: bool) -> Ordering {
    if case_insensitive {
        fold_name(a, true).cmp(&fold_name(b, true))
    } else {
        a.cmp(b)
    }
}

/// 两个名字在该家族下是否视为同名
pub fn names_equal(a: &str, b: &str, case_insensitive: bool) -> bool {
    casefold_cmp(a, b, case_insensitive) == Ordering::Equal
}
