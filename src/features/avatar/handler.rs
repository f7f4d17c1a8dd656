use std::path::Path as FsPath;

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::debug;

use crate::{error::AppError, state::AppState};

use super::resolver::{AvatarRequest, ResolutionOutcome, resolve};

/// 默认边长（像素）
pub const DEFAULT_SIZE: i64 = 80;
/// 边长上下限（闭区间）
pub const MIN_SIZE: i64 = 1;
pub const MAX_SIZE: i64 = 512;
/// 身份哈希最大长度
const MAX_HASH_LEN: usize = 128;

/// 头像查询参数。长短两种写法等价，同时出现时取第一个非空值（长名优先）；
/// 同名参数重复出现时同样取第一个非空值。
#[derive(Debug, Clone, Default)]
pub struct AvatarQuery {
    size: Option<String>,
    s: Option<String>,
    default: Option<String>,
    d: Option<String>,
    forcedefault: Option<String>,
    f: Option<String>,
}

impl AvatarQuery {
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let pick = |name: &str| {
            pairs
                .iter()
                .find(|(k, v)| k == name && !v.is_empty())
                .map(|(_, v)| v.clone())
        };
        Self {
            size: pick("size"),
            s: pick("s"),
            default: pick("default"),
            d: pick("d"),
            forcedefault: pick("forcedefault"),
            f: pick("f"),
        }
    }

    fn first<'a>(values: [&'a Option<String>; 2]) -> Option<&'a str> {
        values
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|v| !v.is_empty())
    }

    /// 非整数按缺省值处理；整数越界为 400。
    pub fn size(&self) -> Result<u32, AppError> {
        let size = Self::first([&self.size, &self.s])
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(DEFAULT_SIZE);
        if !(MIN_SIZE..=MAX_SIZE).contains(&size) {
            return Err(AppError::BadRequest("Invalid size".to_string()));
        }
        Ok(size as u32)
    }

    pub fn requested_default(&self) -> String {
        Self::first([&self.default, &self.d])
            .unwrap_or_default()
            .to_string()
    }

    /// 只有字面量 `y` 为真
    pub fn force_default(&self) -> bool {
        Self::first([&self.forcedefault, &self.f]) == Some("y")
    }
}

fn validate_hash(hash: &str) -> Result<(), AppError> {
    if hash.is_empty() {
        return Err(AppError::BadRequest("No hash specified".to_string()));
    }
    if hash.len() > MAX_HASH_LEN {
        return Err(AppError::BadRequest("Invalid hash".to_string()));
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/avatar/{hash}",
    summary = "获取头像",
    description = "按身份哈希返回指定尺寸的头像。无匹配时按 gravatar 回源 / 命名默认头像 / nobody 的顺序兜底。",
    params(
        ("hash" = String, Path, description = "身份哈希（邮箱的 MD5，小写十六进制）"),
        ("size" = Option<u32>, Query, description = "边长像素 1-512，默认 80；别名 s"),
        ("default" = Option<String>, Query, description = "默认头像名称；404 表示直接返回 404；别名 d"),
        ("forcedefault" = Option<String>, Query, description = "y 表示忽略身份匹配，强制使用默认头像；别名 f")
    ),
    responses(
        (status = 200, description = "JPEG bytes of the avatar"),
        (status = 307, description = "Redirect to gravatar"),
        (status = 400, description = "Missing hash or invalid size"),
        (status = 404, description = "No avatar available"),
        (status = 500, description = "Source image missing or resize failed")
    ),
    tag = "Avatar"
)]
pub async fn get_avatar(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    req: Request,
) -> Result<Response, AppError> {
    validate_hash(&hash)?;
    let q = AvatarQuery::from_pairs(&pairs);
    let size = q.size()?;
    let request = AvatarRequest {
        identity_hash: hash,
        size,
        requested_default: q.requested_default(),
        force_default: q.force_default(),
    };

    match resolve(&request, &state.catalog) {
        ResolutionOutcome::Redirect { url } => {
            debug!(hash = %request.identity_hash, "重定向到 gravatar");
            redirect(&url)
        }
        ResolutionOutcome::NotFound => Err(AppError::NotFound),
        ResolutionOutcome::Serve { source, cache_key } => {
            let path = state.cache.ensure_fresh(&cache_key, &source, size).await?;
            Ok(serve_file(&path, req).await)
        }
    }
}

/// 307 跳转。哈希原样拼进 URL，含控制字符等无法放入响应头的内容时按参数错误处理。
fn redirect(url: &str) -> Result<Response, AppError> {
    let location = HeaderValue::from_str(url)
        .map_err(|_| AppError::BadRequest("Invalid hash".to_string()))?;
    Ok((StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response())
}

async fn missing_hash() -> AppError {
    AppError::BadRequest("No hash specified".to_string())
}

/// 复用 ServeFile：按扩展名设置 Content-Type，支持 Range / 条件请求。
async fn serve_file(path: &FsPath, req: Request) -> Response {
    ServeFile::new(path)
        .oneshot(req)
        .await
        .map(|res| res.map(Body::new))
        .unwrap_or_else(|never| match never {})
}

pub fn create_avatar_router() -> Router<AppState> {
    Router::new()
        .route("/avatar", get(missing_hash))
        .route("/avatar/", get(missing_hash))
        .route("/avatar/:hash", get(get_avatar))
}
