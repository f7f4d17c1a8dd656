use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::features::avatar::{self, AvatarCatalog, CacheStore};

/// 聚合的应用共享状态
///
/// 目录与索引在启动时构建一次，之后只读，无需加锁。
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<AvatarCatalog>,
    pub cache: Arc<CacheStore>,
}

impl AppState {
    pub fn new(catalog: AvatarCatalog, cache: CacheStore) -> Self {
        Self {
            catalog: Arc::new(catalog),
            cache: Arc::new(cache),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let catalog = avatar::catalog_from_config(&config.avatar);
        let resizer = avatar::resizer_from_config(&config.resizer)?;
        let cache = CacheStore::new(
            config.cache_path(),
            resizer,
            config.resizer.max_parallel as usize,
        );
        Ok(Self::new(catalog, cache))
    }
}
