//! 内容指纹：用 (size, mtime, 稀疏哈希字) 判断内容相等，避免逐字节比较

use serde::{Deserialize, Serialize};

/// 采样阈值：小于它的内容做整体哈希
const FULL_HASH_LIMIT: usize = 65536;
/// 采样块大小
const SAMPLE_CHUNK: usize = 16384;

/// 指纹编码后的字节数（缓存记录用）
pub const FINGERPRINT_BYTES: usize = 32;

/// 内容指纹
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: i64,
    /// 稀疏哈希字：blake3 采样摘要折叠成 4 个 32 位字
    pub crc: [u32; 4],
}

impl Fingerprint {
    /// 从完整内容计算指纹
    ///
    /// 大文件只采样头部、中部、尾部各一块并混入长度，
    /// 足够检测变化而无需读完整个文件。
    pub fn from_bytes(data: &[u8], mtime: i64) -> Fingerprint {
        let len = data.len();
        let hash = if len <= FULL_HASH_LIMIT {
            blake3::hash(data)
        } else {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&data[..SAMPLE_CHUNK]);
            hasher.update(&data[len / 2 - SAMPLE_CHUNK / 2..len / 2 + SAMPLE_CHUNK / 2]);
            hasher.update(&data[len - SAMPLE_CHUNK..]);
            hasher.update(&len.to_le_bytes());
            hasher.finalize()
        };

        let bytes = hash.as_bytes();
        let mut crc = [0u32; 4];
        for (i, word) in crc.iter_mut().enumerate() {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *word = u32::from_le_bytes(buf);
        }

        Fingerprint {
            size: len as u64,
            mtime,
            crc,
        }
    }

    /// 指纹相等判断；mtime 容忍低精度文件系统的一秒量化
    pub fn equals_tolerant(&self, other: &Fingerprint) -> bool {
        self.size == other.size
            && self.crc == other.crc
            && (self.mtime - other.mtime).abs() <= 1
    }

    /// 编码成缓存记录的定长字段
    pub fn to_bytes(&self) -> [u8; FINGERPRINT_BYTES] {
        let mut out = [0u8; FINGERPRINT_BYTES];
        out[..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.mtime.to_le_bytes());
        for (i, word) in self.crc.iter().enumerate() {
            out[16 + i * 4..20 + i * 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// 从缓存记录解码
    pub fn from_cache_bytes(data: &[u8]) -> Option<Fingerprint> {
        if data.len() < FINGERPRINT_BYTES {
            return None;
        }
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&data[..8]);
        let size = u64::from_le_bytes(u64buf);
        u64buf.copy_from_slice(&data[8..16]);
        let mtime = i64::from_le_bytes(u64buf);

        let mut crc = [0u32; 4];
        let mut u32buf = [0u8; 4];
        for (i, word) in crc.iter_mut().enumerate() {
            u32buf.copy_from_slice(&data[16 + i * 4..20 + i * 4]);
            *word = u32::from_le_bytes(u32buf);
        }

        Some(Fingerprint { size, mtime, crc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_fingerprint() {
        let a = Fingerprint::from_bytes(b"hello world", 100);
        let b = Fingerprint::from_bytes(b"hello world", 100);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_content_differs() {
        let a = Fingerprint::from_bytes(b"hello world", 100);
        let b = Fingerprint::from_bytes(b"hello worle", 100);
        assert_ne!(a.crc, b.crc);
    }

    #[test]
    fn test_mtime_tolerance() {
        let a = Fingerprint::from_bytes(b"data", 100);
        let b = Fingerprint::from_bytes(b"data", 101);
        let c = Fingerprint::from_bytes(b"data", 102);
        assert!(a.equals_tolerant(&b));
        assert!(!a.equals_tolerant(&c));
    }

    #[test]
    fn test_large_content_sampling() {
        let mut data = vec![0u8; 200_000];
        let a = Fingerprint::from_bytes(&data, 0);
        // 改中部字节，采样必须覆盖到
        data[100_000] = 1;
        let b = Fingerprint::from_bytes(&data, 0);
        assert_ne!(a.crc, b.crc);
        // 长度相同、采样区之外的修改检测不到（稀疏指纹的既定取舍）
    }

    #[test]
    fn test_codec_roundtrip() {
        let fp = Fingerprint::from_bytes(b"roundtrip", 1_700_000_000);
        let decoded = Fingerprint::from_cache_bytes(&fp.to_bytes()).unwrap();
        assert_eq!(fp, decoded);

        assert!(Fingerprint::from_cache_bytes(&[0u8; 4]).is_none());
    }
}
