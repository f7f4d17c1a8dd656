use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;

use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// 服务状态
    #[schema(example = "healthy")]
    pub status: String,
    /// 服务名称
    #[schema(example = "avatar-server")]
    pub service: String,
    /// 当前版本（Cargo package version）
    #[schema(example = "0.1.0")]
    pub version: String,
    /// 已配置的身份数
    pub identities: usize,
    /// 已配置的默认头像数
    pub defaults: usize,
    /// 当前缩放实现；未配置时为 null
    #[schema(example = "builtin")]
    pub resizer: Option<String>,
}

#[utoipa::path(
    get,
    path = "/health",
    summary = "健康检查",
    description = "用于探活的健康检查端点，返回服务状态、版本与头像目录概况。",
    responses((status = 200, description = "服务健康", body = HealthResponse)),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            service: "avatar-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            identities: state.catalog.identities.len(),
            defaults: state.catalog.defaults.len(),
            resizer: state.cache.resizer_name().map(str::to_string),
        }),
    )
}
