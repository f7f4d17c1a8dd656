//! 头像解析决策：把一次请求转换为 重定向 / 未找到 / (源图, 缓存键)。
//!
//! 优先级（先命中者胜出）：
//! 1. 身份命中且未强制默认 -> 身份源图；
//! 2. 启用 gravatar 且未强制默认 -> 307 到 gravatar；
//! 3. `default=404` -> 未找到；
//! 4. 请求的默认头像存在 -> 该默认；否则退回 `nobody`（只退一级）；
//! 5. 仍无可用源图 -> 未找到。
//!
//! 本模块不做任何 I/O。

use std::fmt;
use std::path::PathBuf;

use super::identity::{DefaultRegistry, IdentityIndex, NOBODY, normalize_default_name};

/// 默认 gravatar 回源地址
pub const DEFAULT_GRAVATAR_BASE_URL: &str = "https://secure.gravatar.com/avatar";

/// `default` 参数的特殊取值：直接返回 404
pub const NOT_FOUND_DEFAULT: &str = "404";

/// 一次头像请求（参数已在 handler 层校验完毕）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRequest {
    pub identity_hash: String,
    /// 取值范围 `[1, 512]`
    pub size: u32,
    /// 可能为空，或为特殊值 "404"
    pub requested_default: String,
    pub force_default: bool,
}

/// 缓存文件名（相对缓存目录）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `<hash>.s<size>.jpg`
    pub fn identity(hash: &str, size: u32) -> Self {
        Self(format!("{hash}.s{size}.jpg"))
    }

    /// `_default_<name>.s<size>.jpg`
    pub fn default_image(name: &str, size: u32) -> Self {
        Self(format!("_default_{name}.s{size}.jpg"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Redirect { url: String },
    NotFound,
    Serve { source: PathBuf, cache_key: CacheKey },
}

/// 解析所需的只读输入，启动后不再变化。
#[derive(Debug, Clone)]
pub struct AvatarCatalog {
    pub identities: IdentityIndex,
    pub defaults: DefaultRegistry,
    pub fallback_to_gravatar: bool,
    pub gravatar_base_url: String,
}

impl AvatarCatalog {
    pub fn new(identities: IdentityIndex, defaults: DefaultRegistry) -> Self {
        Self {
            identities,
            defaults,
            fallback_to_gravatar: false,
            gravatar_base_url: DEFAULT_GRAVATAR_BASE_URL.to_string(),
        }
    }

    pub fn with_gravatar(mut self, enabled: bool) -> Self {
        self.fallback_to_gravatar = enabled;
        self
    }

    fn gravatar_url(&self, hash: &str, size: u32) -> String {
        let base = self.gravatar_base_url.trim_end_matches('/');
        format!("{base}/{hash}?s={size}")
    }
}

pub fn resolve(request: &AvatarRequest, catalog: &AvatarCatalog) -> ResolutionOutcome {
    let size = request.size;

    if !request.force_default
        && let Some(image) = catalog.identities.lookup(&request.identity_hash)
    {
        return ResolutionOutcome::Serve {
            source: image.to_path_buf(),
            cache_key: CacheKey::identity(&request.identity_hash, size),
        };
    }

    if catalog.fallback_to_gravatar && !request.force_default {
        return ResolutionOutcome::Redirect {
            url: catalog.gravatar_url(&request.identity_hash, size),
        };
    }

    let requested = normalize_default_name(&request.requested_default);
    if requested == NOT_FOUND_DEFAULT {
        return ResolutionOutcome::NotFound;
    }

    let (image, default_name) = match catalog.defaults.get(&requested) {
        Some(image) if !requested.is_empty() => (Some(image), requested.as_str()),
        _ => (catalog.defaults.get(NOBODY), NOBODY),
    };

    match image {
        Some(image) => ResolutionOutcome::Serve {
            source: image.to_path_buf(),
            cache_key: CacheKey::default_image(default_name, size),
        },
        None => ResolutionOutcome::NotFound,
    }
}
