use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::features::avatar::{AvatarCatalog, NOBODY};
use crate::state::AppState;

/// 执行启动检查
///
/// 1. 检查并创建缓存目录（失败则阻断启动）
/// 2. 逐一检查已配置的源图片（缺失仅告警）
pub async fn run_startup_checks(state: &AppState) -> Result<(), AppError> {
    tracing::info!("🔍 开始执行启动检查...");

    ensure_cache_folder(state).await?;

    let missing = audit_sources(&state.catalog);
    let catalog = &state.catalog;
    tracing::info!(
        identities = catalog.identities.len(),
        defaults = catalog.defaults.len(),
        missing = missing.len(),
        gravatar = catalog.fallback_to_gravatar,
        resizer = state.cache.resizer_name().unwrap_or("none"),
        "头像目录已加载"
    );
    if catalog.defaults.get(NOBODY).is_none() && !catalog.fallback_to_gravatar {
        tracing::info!("未配置 nobody 默认头像且未启用 gravatar，未知身份将返回 404");
    }

    tracing::info!("✅ 启动检查完成");
    Ok(())
}

async fn ensure_cache_folder(state: &AppState) -> Result<(), AppError> {
    let folder = state.cache.folder();
    if folder.is_dir() {
        tracing::info!("✅ 缓存目录已存在: {:?}", folder);
        return Ok(());
    }

    tracing::warn!("📁 未找到缓存目录，正在创建: {:?}", folder);
    state
        .cache
        .prepare()
        .await
        .map_err(|e| AppError::Internal(format!("创建缓存目录失败 {}: {e}", folder.display())))?;
    tracing::info!("✅ 缓存目录创建成功");
    Ok(())
}

/// 返回不存在的源图片路径（去重后按路径排序），每个缺失项告警一次
pub fn audit_sources(catalog: &AvatarCatalog) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = catalog
        .identities
        .images()
        .chain(catalog.defaults.entries().map(|(_, path)| path))
        .filter(|path| !path.is_file())
        .map(Path::to_path_buf)
        .collect();
    missing.sort();
    missing.dedup();

    for path in &missing {
        tracing::warn!("⚠️ 源图片不存在: {}", path.display());
    }
    missing
}
