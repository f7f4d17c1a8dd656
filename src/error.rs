use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::features::avatar::cache::CacheError;

/// 应用统一错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 请求参数错误（缺少哈希、尺寸越界等），内容即返回给客户端的文本
    #[error("请求参数错误: {0}")]
    BadRequest(String),

    /// 无身份匹配且无可用默认头像，或显式请求 `default=404`
    #[error("未找到头像")]
    NotFound,

    /// 源图缺失 / 缩放失败 / 未配置缩放实现
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// 内部服务器错误
    #[error("内部错误: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Cache(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 稳定的错误码，仅用于日志检索
    pub fn stable_code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound => "NOT_FOUND",
            AppError::Cache(CacheError::SourceUnavailable { .. }) => "SOURCE_UNAVAILABLE",
            AppError::Cache(CacheError::NoResizer) => "NO_RESIZER",
            AppError::Cache(CacheError::ResizeFailed { .. }) => "RESIZE_FAILED",
            AppError::Cache(CacheError::Io(_)) => "CACHE_IO",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 返回给客户端的纯文本；服务端细节只进日志。
    fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::NotFound => "Not found".to_string(),
            AppError::Cache(CacheError::SourceUnavailable { .. }) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
            AppError::Cache(_) => "Failed to generate image".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.stable_code(), "{}", self);
        } else {
            tracing::debug!(code = self.stable_code(), "{}", self);
        }

        let mut res = (status, self.public_message()).into_response();
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        res
    }
}
