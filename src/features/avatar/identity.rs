use std::collections::HashMap;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

/// 兜底默认头像的名称
pub const NOBODY: &str = "nobody";

/// 身份标识规范化：去除首尾空白并转为小写（与 gravatar 约定一致）。
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_ascii_lowercase()
}

/// 计算身份哈希：规范化后的 MD5，32 位小写十六进制。
pub fn identity_hash(identity: &str) -> String {
    let digest = Md5::digest(normalize_identity(identity).as_bytes());
    hex::encode(digest)
}

/// 默认头像名称不区分大小写（配置加载时键名会被折叠为小写）。
pub fn normalize_default_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// 身份哈希 -> 源图片路径 的只读索引，启动时构建一次。
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    by_hash: HashMap<String, PathBuf>,
}

impl IdentityIndex {
    /// 对每个身份独立计算哈希。输入键的唯一性由配置保证，这里不再校验。
    pub fn build<I, K, V>(identities: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PathBuf>,
    {
        let by_hash = identities
            .into_iter()
            .filter_map(|(identity, image)| {
                let image = image.into();
                if image.as_os_str().is_empty() {
                    return None;
                }
                Some((identity_hash(identity.as_ref()), image))
            })
            .collect();
        Self { by_hash }
    }

    pub fn lookup(&self, hash: &str) -> Option<&Path> {
        self.by_hash.get(hash).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn images(&self) -> impl Iterator<Item = &Path> {
        self.by_hash.values().map(PathBuf::as_path)
    }
}

/// 默认头像名称 -> 源图片路径
#[derive(Debug, Clone, Default)]
pub struct DefaultRegistry {
    by_name: HashMap<String, PathBuf>,
}

impl DefaultRegistry {
    pub fn new<I, K, V>(defaults: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PathBuf>,
    {
        let by_name = defaults
            .into_iter()
            .map(|(name, image)| {
                let name: String = name.into();
                (normalize_default_name(&name), image.into())
            })
            .filter(|(_, image)| !image.as_os_str().is_empty())
            .collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.by_name
            .get(&normalize_default_name(name))
            .map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.by_name
            .iter()
            .map(|(name, image)| (name.as_str(), image.as_path()))
    }
}
