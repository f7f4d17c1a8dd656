use axum::{Router, middleware, routing::get};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::features::{avatar, health};
use crate::openapi::ApiDoc;
use crate::request_id::request_id_middleware;
use crate::state::AppState;

/// 组装完整路由：头像、健康检查、文档，外层套 request_id 中间件。
pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/health", get(health::health_check))
        .merge(avatar::create_avatar_router())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
}
