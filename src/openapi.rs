use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::features::health::handler::health_check,
        crate::features::avatar::handler::get_avatar,
    ),
    components(schemas(crate::features::health::handler::HealthResponse)),
    tags(
        (
            name = "Avatar",
            description = "头像：按身份哈希返回缩放后的 JPEG，或重定向到 gravatar。"
        ),
        (name = "Health", description = "健康检查：服务探活。"),
    ),
    info(
        title = "Avatar Server API",
        version = env!("CARGO_PKG_VERSION"),
        description = "gravatar 兼容的自托管头像服务（Axum + utoipa）。"
    )
)]
pub struct ApiDoc;
