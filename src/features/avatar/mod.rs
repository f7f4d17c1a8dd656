pub mod cache;
pub mod handler;
pub mod identity;
pub mod resizer;
pub mod resolver;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{AvatarConfig, ResizerBackend, ResizerConfig};
use crate::error::AppError;

pub use cache::{CacheError, CacheStore};
pub use handler::create_avatar_router;
pub use identity::{DefaultRegistry, IdentityIndex, NOBODY, identity_hash};
pub use resizer::{CancelFlag, ImageResizer, MagickResizer, ResizeError, ResizeJob, Resizer};
pub use resolver::{AvatarCatalog, AvatarRequest, CacheKey, ResolutionOutcome, resolve};

/// 由配置构建只读的解析目录（身份索引在此一次性计算）。
pub fn catalog_from_config(cfg: &AvatarConfig) -> AvatarCatalog {
    let mut catalog = AvatarCatalog::new(
        IdentityIndex::build(&cfg.identities),
        DefaultRegistry::new(cfg.defaults.clone()),
    )
    .with_gravatar(cfg.gravatar);
    catalog.gravatar_base_url = cfg.gravatar_base_url.clone();
    catalog
}

/// 按配置选择缩放实现；`none` 返回 `None`。
pub fn resizer_from_config(cfg: &ResizerConfig) -> Result<Option<Arc<dyn Resizer>>, AppError> {
    let resizer: Arc<dyn Resizer> = match cfg.backend {
        ResizerBackend::None => return Ok(None),
        ResizerBackend::Builtin => {
            let filter = resizer::parse_filter(&cfg.filter).ok_or_else(|| {
                AppError::Internal(format!("resizer.filter 无效: {}", cfg.filter))
            })?;
            Arc::new(ImageResizer::new(filter, cfg.jpeg_quality))
        }
        ResizerBackend::Imagemagick => Arc::new(MagickResizer::new(
            cfg.program
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        )),
    };
    Ok(Some(resizer))
}
