//! 配置存储：每个盘两个轮换槽文件，认证加密落盘
//!
//! 槽文件布局：`magic(4) | version(1) | reserved(3) | iv(16) |
//! ciphertext(n) | hmac_sha256(iv‖ciphertext)(32)`。明文是
//! `{"sq": 序列号, "sy": [配置…]}` 的 JSON；序列号随写入单调
//! 递增，读取时取通过认证的最高序列号槽，坏槽自动回退旧槽。
//! 明文永不落盘。

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::Result;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{ConfigJson, SyncConfig};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// 槽文件魔数
pub const CONFIG_MAGIC: [u8; 4] = *b"SCDB";
/// 当前格式版本
pub const CONFIG_VERSION: u8 = 1;
/// 每盘槽数
const SLOTS: u32 = 2;
/// 外置盘上的数据库目录名
const EXTERNAL_DB_DIR: &str = ".synccore";

const HEADER_LEN: usize = 4 + 1 + 3 + 16;
const TAG_LEN: usize = 32;

/// 槽文件明文
#[derive(Serialize, Deserialize)]
struct SlotPayload {
    sq: u64,
    sy: Vec<ConfigJson>,
}

/// 注入的密钥材料；加解密只在这里发生
pub struct ConfigCrypto {
    cipher_key: [u8; 16],
    auth_key: [u8; 32],
}

impl ConfigCrypto {
    pub fn new(cipher_key: [u8; 16], auth_key: [u8; 32]) -> ConfigCrypto {
        ConfigCrypto {
            cipher_key,
            auth_key,
        }
    }

    /// 组装一个完整槽文件
    fn encrypt_slot(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new(&self.cipher_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&CONFIG_MAGIC);
        out.push(CONFIG_VERSION);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);

        let mut mac = HmacSha256::new_from_slice(&self.auth_key)
            .map_err(|e| anyhow::anyhow!("HMAC 密钥错误: {}", e))?;
        mac.update(&out[8..]); // iv ‖ ciphertext
        out.extend_from_slice(&mac.finalize().into_bytes());

        Ok(out)
    }

    /// 验证并解出明文；格式错、认证失败、解密失败都返回 None
    fn decrypt_slot(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < HEADER_LEN + TAG_LEN {
            return None;
        }
        if data[..4] != CONFIG_MAGIC || data[4] != CONFIG_VERSION {
            return None;
        }

        let body = &data[8..data.len() - TAG_LEN]; // iv ‖ ciphertext
        let tag = &data[data.len() - TAG_LEN..];

        let mut mac = HmacSha256::new_from_slice(&self.auth_key).ok()?;
        mac.update(body);
        mac.verify_slice(tag).ok()?;

        let iv: [u8; 16] = body[..16].try_into().ok()?;
        let ciphertext = &body[16..];
        Aes128CbcDec::new(&self.cipher_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .ok()
    }
}

/// 盘的元信息
#[derive(Debug)]
struct DriveInfo {
    /// 当前最新数据所在槽；下次写另一个槽
    slot: u32,
    /// 最新序列号
    seq: u64,
    dirty: bool,
}

/// 配置存储
///
/// 空路径代表内部（主）盘；其他路径是外置盘，数据库放在
/// 盘根的 `.synccore/` 下。
pub struct ConfigStore {
    name: String,
    internal_dir: PathBuf,
    crypto: ConfigCrypto,
    drives: HashMap<PathBuf, DriveInfo>,
}

impl ConfigStore {
    pub fn new(
        internal_dir: PathBuf,
        name: String,
        cipher_key: [u8; 16],
        auth_key: [u8; 32],
    ) -> ConfigStore {
        ConfigStore {
            name,
            internal_dir,
            crypto: ConfigCrypto::new(cipher_key, auth_key),
            drives: HashMap::new(),
        }
    }

    fn db_dir_for(&self, drive: &Path) -> PathBuf {
        if drive.as_os_str().is_empty() {
            self.internal_dir.clone()
        } else {
            drive.join(EXTERNAL_DB_DIR)
        }
    }

    fn slot_path(&self, drive: &Path, slot: u32) -> PathBuf {
        self.db_dir_for(drive).join(format!("{}.{}", self.name, slot))
    }

    /// 读出一个盘的配置；两个槽都不可用时返回空表并登记该盘
    pub fn read(&mut self, drive: &Path) -> Result<Vec<SyncConfig>> {
        let mut best: Option<(u64, u32, Vec<SyncConfig>)> = None;

        for slot in 0..SLOTS {
            let path = self.slot_path(drive, slot);
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Some(plaintext) = self.crypto.decrypt_slot(&data) else {
                warn!("配置槽认证失败，回退另一槽: {:?}", path);
                continue;
            };
            let Ok(payload) = serde_json::from_slice::<SlotPayload>(&plaintext) else {
                warn!("配置槽 JSON 解析失败: {:?}", path);
                continue;
            };

            let mut configs = Vec::with_capacity(payload.sy.len());
            for json in payload.sy {
                match SyncConfig::try_from(json) {
                    Ok(config) => configs.push(config),
                    Err(e) => warn!("跳过一条损坏的配置: {}", e),
                }
            }

            if best.as_ref().map_or(true, |(seq, _, _)| payload.sq > *seq) {
                best = Some((payload.sq, slot, configs));
            }
        }

        match best {
            Some((seq, slot, mut configs)) => {
                if !drive.as_os_str().is_empty() {
                    for config in &mut configs {
                        config.external_drive_path = Some(drive.to_path_buf());
                    }
                }
                info!(
                    "读取配置成功: drive={:?} slot={} seq={} ({} 条)",
                    drive,
                    slot,
                    seq,
                    configs.len()
                );
                self.drives.insert(
                    drive.to_path_buf(),
                    DriveInfo {
                        slot,
                        seq,
                        dirty: false,
                    },
                );
                Ok(configs)
            }
            None => {
                self.drives.insert(
                    drive.to_path_buf(),
                    DriveInfo {
                        slot: SLOTS - 1,
                        seq: 0,
                        dirty: false,
                    },
                );
                Ok(Vec::new())
            }
        }
    }

    /// 写一个盘的配置：写入另一个槽并 fsync，成功后才翻转槽索引
    pub fn write(&mut self, drive: &Path, configs: &[SyncConfig]) -> Result<()> {
        let db_dir = self.db_dir_for(drive);
        std::fs::create_dir_all(&db_dir)?;

        let (next_slot, next_seq) = {
            let info = self
                .drives
                .entry(drive.to_path_buf())
                .or_insert(DriveInfo {
                    slot: SLOTS - 1,
                    seq: 0,
                    dirty: true,
                });
            ((info.slot + 1) % SLOTS, info.seq + 1)
        };

        let payload = SlotPayload {
            sq: next_seq,
            sy: configs.iter().map(ConfigJson::from).collect(),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        let blob = self.crypto.encrypt_slot(&plaintext)?;

        let path = self.slot_path(drive, next_slot);
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&blob)?;
        file.sync_all()?;

        if let Some(info) = self.drives.get_mut(drive) {
            info.slot = next_slot;
            info.seq = next_seq;
            info.dirty = false;
        }
        debug!(
            "配置写入: drive={:?} slot={} seq={} ({} 条)",
            drive,
            next_slot,
            next_seq,
            configs.len()
        );
        Ok(())
    }

    /// 标记盘待冲刷
    pub fn mark_drive_dirty(&mut self, drive: &Path) {
        self.drives
            .entry(drive.to_path_buf())
            .or_insert(DriveInfo {
                slot: SLOTS - 1,
                seq: 0,
                dirty: false,
            })
            .dirty = true;
    }

    /// 是否有盘待冲刷
    pub fn dirty(&self) -> bool {
        self.drives.values().any(|d| d.dirty)
    }

    /// 待冲刷的盘
    pub fn dirty_drives(&self) -> Vec<PathBuf> {
        self.drives
            .iter()
            .filter(|(_, d)| d.dirty)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn drive_known(&self, drive: &Path) -> bool {
        self.drives.contains_key(drive)
    }

    pub fn known_drives(&self) -> Vec<PathBuf> {
        self.drives.keys().cloned().collect()
    }

    /// 把盘从内存登记里移除（文件保留）；之前不认识该盘返回 false
    pub fn remove_drive(&mut self, drive: &Path) -> bool {
        self.drives.remove(drive).is_some()
    }

    /// 删除盘上的两个槽文件（彻底清除时用）
    pub fn remove_drive_files(&mut self, drive: &Path) -> Result<()> {
        for slot in 0..SLOTS {
            let path = self.slot_path(drive, slot);
            match std::fs::remove_file(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.drives.remove(drive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::NodeHandle;
    use crate::config::SyncType;

    fn keys() -> ([u8; 16], [u8; 32]) {
        ([7u8; 16], [9u8; 32])
    }

    fn make_store(dir: &Path) -> ConfigStore {
        let (ck, ak) = keys();
        ConfigStore::new(dir.to_path_buf(), "syncconfig".to_string(), ck, ak)
    }

    fn sample(name: &str) -> SyncConfig {
        SyncConfig::new(
            PathBuf::from("/data").join(name),
            name.to_string(),
            NodeHandle(5),
            format!("/cloud/{}", name),
            SyncType::TwoWay,
        )
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());

        let configs = vec![sample("a"), sample("b")];
        store.write(Path::new(""), &configs).unwrap();

        let mut fresh = make_store(dir.path());
        let read = fresh.read(Path::new("")).unwrap();
        assert_eq!(read, configs);
    }

    #[test]
    fn test_slots_alternate_and_seq_grows() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());

        store.write(Path::new(""), &[sample("v1")]).unwrap();
        store.write(Path::new(""), &[sample("v2")]).unwrap();

        // 两个槽文件都应存在
        assert!(dir.path().join("syncconfig.0").exists());
        assert!(dir.path().join("syncconfig.1").exists());

        // 新实例读到第二次写入的内容
        let mut fresh = make_store(dir.path());
        let read = fresh.read(Path::new("")).unwrap();
        assert_eq!(read[0].name, "v2");
    }

    #[test]
    fn test_corrupt_newest_slot_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());

        let v1 = vec![sample("v1")];
        store.write(Path::new(""), &v1).unwrap();
        store.write(Path::new(""), &[sample("v2")]).unwrap();

        // 第二次写入落在槽 1（初始槽索引指向 1，首写翻到 0，再写回 1）
        let newest = dir.path().join("syncconfig.1");
        let mut data = std::fs::read(&newest).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        std::fs::write(&newest, &data).unwrap();

        // 认证失败回退到旧槽
        let mut fresh = make_store(dir.path());
        let read = fresh.read(Path::new("")).unwrap();
        assert_eq!(read[0].name, "v1");
    }

    #[test]
    fn test_crash_before_index_flip_keeps_old_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());

        let v1 = vec![sample("v1")];
        store.write(Path::new(""), &v1).unwrap();

        // 模拟崩溃：手工向另一个槽写入垃圾（写了一半掉电）
        std::fs::write(dir.path().join("syncconfig.1"), b"partial garbage").unwrap();

        let mut fresh = make_store(dir.path());
        let read = fresh.read(Path::new("")).unwrap();
        assert_eq!(read, v1);
    }

    #[test]
    fn test_missing_slots_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());
        let read = store.read(Path::new("")).unwrap();
        assert!(read.is_empty());
        assert!(store.drive_known(Path::new("")));
    }

    #[test]
    fn test_wrong_auth_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());
        store.write(Path::new(""), &[sample("secret")]).unwrap();

        let (ck, _) = keys();
        let mut wrong = ConfigStore::new(
            dir.path().to_path_buf(),
            "syncconfig".to_string(),
            ck,
            [0u8; 32],
        );
        let read = wrong.read(Path::new("")).unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn test_dirty_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path());
        assert!(!store.dirty());

        store.mark_drive_dirty(Path::new(""));
        assert!(store.dirty());
        assert_eq!(store.dirty_drives().len(), 1);

        store.write(Path::new(""), &[]).unwrap();
        assert!(!store.dirty());
    }

    #[test]
    fn test_external_drive_path_attached() {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("usb");
        std::fs::create_dir_all(&drive).unwrap();

        let mut store = make_store(dir.path());
        store.write(&drive, &[sample("portable")]).unwrap();

        let mut fresh = make_store(dir.path());
        let read = fresh.read(&drive).unwrap();
        assert_eq!(read[0].external_drive_path.as_deref(), Some(drive.as_path()));
        // 外置盘数据库在盘根的内部目录里
        assert!(drive.join(EXTERNAL_DB_DIR).join("syncconfig.0").exists());
    }
}
