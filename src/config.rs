use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::features::avatar::resizer::parse_filter;
use crate::features::avatar::resolver::DEFAULT_GRAVATAR_BASE_URL;

/// 未显式指定时尝试加载的配置文件（不存在则跳过）
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
}

impl ServerConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }
    fn default_port() -> u16 {
        8888
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缩放图写入目录
    #[serde(default = "CacheConfig::default_folder")]
    pub folder: String,
}

impl CacheConfig {
    fn default_folder() -> String {
        "cache".to_string()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            folder: Self::default_folder(),
        }
    }
}

/// 头像映射配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarConfig {
    /// 未匹配的身份是否重定向到 gravatar
    #[serde(default)]
    pub gravatar: bool,
    /// gravatar 回源基地址
    #[serde(default = "AvatarConfig::default_gravatar_base_url")]
    pub gravatar_base_url: String,
    /// 身份（邮箱）-> 源图片路径
    #[serde(default)]
    pub identities: HashMap<String, String>,
    /// 默认头像名称 -> 源图片路径（`nobody` 为最终兜底）
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

impl AvatarConfig {
    fn default_gravatar_base_url() -> String {
        DEFAULT_GRAVATAR_BASE_URL.to_string()
    }
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            gravatar: false,
            gravatar_base_url: Self::default_gravatar_base_url(),
            identities: HashMap::new(),
            defaults: HashMap::new(),
        }
    }
}

/// 缩放实现
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResizerBackend {
    /// `image` crate
    #[default]
    Builtin,
    /// ImageMagick 命令行
    Imagemagick,
    /// 不配置缩放（缓存未命中即 500）
    None,
}

impl FromStr for ResizerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "builtin" => Ok(Self::Builtin),
            "imagemagick" | "magick" => Ok(Self::Imagemagick),
            "none" => Ok(Self::None),
            other => Err(format!("未知的缩放实现: {other}")),
        }
    }
}

/// 缩放配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizerConfig {
    #[serde(default)]
    pub backend: ResizerBackend,
    /// ImageMagick 可执行文件（留空则自动查找 magick/convert）
    #[serde(default)]
    pub program: Option<String>,
    /// 采样过滤器：nearest|triangle|catmullrom|gaussian|lanczos3
    #[serde(default = "ResizerConfig::default_filter")]
    pub filter: String,
    /// JPEG 质量 1-100
    #[serde(default = "ResizerConfig::default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// 并发缩放许可数（0=自动，取 CPU 核心数）
    #[serde(default)]
    pub max_parallel: u32,
}

impl ResizerConfig {
    fn default_filter() -> String {
        "lanczos3".to_string()
    }
    fn default_jpeg_quality() -> u8 {
        85
    }
}

impl Default for ResizerConfig {
    fn default() -> Self {
        Self {
            backend: ResizerBackend::default(),
            program: None,
            filter: Self::default_filter(),
            jpeg_quality: Self::default_jpeg_quality(),
            max_parallel: 0,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（被 RUST_LOG 覆盖）
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 优雅退出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// 收到退出信号后等待在途请求完成的最长时间（秒）
    #[serde(default = "ShutdownConfig::default_timeout")]
    pub timeout_secs: u64,
}

impl ShutdownConfig {
    fn default_timeout() -> u64 {
        10
    }

    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub avatar: AvatarConfig,
    #[serde(default)]
    pub resizer: ResizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// 从配置文件加载配置，支持环境变量覆盖
    ///
    /// 显式给出的文件必须存在；缺省的 `config.toml` 不存在时只用默认值与环境变量。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let builder = ConfigBuilder::builder()
            .add_source(File::from(config_path.as_path()).required(required))
            // 支持环境变量覆盖，例如：APP_SERVER__PORT=9000、APP_AVATAR__GRAVATAR=true
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = builder.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message("server.port 不能为 0".to_string()));
        }
        if self.cache.folder.trim().is_empty() {
            return Err(ConfigError::Message("cache.folder 不能为空".to_string()));
        }
        if parse_filter(&self.resizer.filter).is_none() {
            return Err(ConfigError::Message(format!(
                "resizer.filter 无效: {}",
                self.resizer.filter
            )));
        }
        if !(1..=100).contains(&self.resizer.jpeg_quality) {
            return Err(ConfigError::Message(
                "resizer.jpeg_quality 必须在 1-100 范围内".to_string(),
            ));
        }
        Ok(())
    }

    /// 获取服务器监听地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 获取缓存目录
    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache.folder)
    }
}
