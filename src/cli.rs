//! `avatar-server [serve] [flags]` 的参数解析。
//!
//! 命令行只做覆盖：先加载配置文件与环境变量，再把这里给出的值写回 `AppConfig`。

use std::path::PathBuf;

use thiserror::Error;

use crate::config::{AppConfig, ResizerBackend};

pub const USAGE: &str = "\
用法: avatar-server [serve] [选项]

选项:
  --config PATH          配置文件（默认 config.toml，不存在则跳过）
  --addr HOST:PORT       监听地址（默认 127.0.0.1:8888）
  --cache-folder DIR     缩放图缓存目录（默认 cache）
  --email ID=IMG         身份 -> 源图片，可重复，也可用逗号分隔多组
  --default NAME=IMG     默认头像名称 -> 源图片，可重复；nobody 为兜底
  --gravatar             未匹配身份时重定向到 gravatar
  --no-gravatar          关闭 gravatar 回源
  --resizer BACKEND      builtin | imagemagick | none
  --verbose              输出调试日志
  -h, --help             显示本帮助
";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("缺少 {0} 的值")]
    MissingValue(String),

    #[error("{flag} 需要 KEY=VALUE 形式，收到: {raw}")]
    InvalidPair { flag: String, raw: String },

    #[error("--addr 需要 HOST:PORT 形式，收到: {0}")]
    InvalidAddr(String),

    #[error("{0}")]
    InvalidResizer(String),

    #[error("未知参数: {0}")]
    Unknown(String),
}

/// 解析后的 `serve` 参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeArgs {
    pub help: bool,
    pub verbose: bool,
    pub config: Option<PathBuf>,
    pub addr: Option<(String, u16)>,
    pub cache_folder: Option<String>,
    pub identities: Vec<(String, String)>,
    pub defaults: Vec<(String, String)>,
    pub gravatar: Option<bool>,
    pub resizer: Option<ResizerBackend>,
}

impl ServeArgs {
    /// 解析 `argv`（不含程序名）。允许前置的 `serve` 子命令，
    /// 值既可写成 `--flag value` 也可写成 `--flag=value`。
    pub fn parse<I, S>(argv: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let mut args = Self::default();
        let mut idx = usize::from(argv.first().map(String::as_str) == Some("serve"));

        while idx < argv.len() {
            let raw = argv[idx].as_str();
            let (flag, inline) = match raw.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f, Some(v.to_string())),
                _ => (raw, None),
            };
            idx += 1;

            let mut value = |name: &str| -> Result<String, CliError> {
                if let Some(v) = inline.clone() {
                    return Ok(v);
                }
                let v = argv
                    .get(idx)
                    .ok_or_else(|| CliError::MissingValue(name.to_string()))?;
                idx += 1;
                Ok(v.clone())
            };

            match flag {
                "-h" | "--help" => args.help = true,
                "--verbose" | "-v" => args.verbose = true,
                "--gravatar" => args.gravatar = Some(true),
                "--no-gravatar" => args.gravatar = Some(false),
                "--config" => args.config = Some(PathBuf::from(value("--config")?)),
                "--addr" => args.addr = Some(parse_addr(&value("--addr")?)?),
                "--cache-folder" => args.cache_folder = Some(value("--cache-folder")?),
                "--email" => args
                    .identities
                    .extend(parse_pairs("--email", &value("--email")?)?),
                "--default" => args
                    .defaults
                    .extend(parse_pairs("--default", &value("--default")?)?),
                "--resizer" => {
                    let raw = value("--resizer")?;
                    args.resizer = Some(
                        raw.parse::<ResizerBackend>()
                            .map_err(CliError::InvalidResizer)?,
                    );
                }
                other => return Err(CliError::Unknown(other.to_string())),
            }
        }

        Ok(args)
    }

    /// 把命令行给出的值覆盖到配置上
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some((host, port)) = &self.addr {
            config.server.host = host.clone();
            config.server.port = *port;
        }
        if let Some(folder) = &self.cache_folder {
            config.cache.folder = folder.clone();
        }
        for (identity, image) in &self.identities {
            config
                .avatar
                .identities
                .insert(identity.clone(), image.clone());
        }
        for (name, image) in &self.defaults {
            config.avatar.defaults.insert(name.clone(), image.clone());
        }
        if let Some(enabled) = self.gravatar {
            config.avatar.gravatar = enabled;
        }
        if let Some(backend) = self.resizer {
            config.resizer.backend = backend;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

fn parse_addr(raw: &str) -> Result<(String, u16), CliError> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| CliError::InvalidAddr(raw.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| CliError::InvalidAddr(raw.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

/// `a=x.png,b=y.png` -> [(a, x.png), (b, y.png)]
fn parse_pairs(flag: &str, raw: &str) -> Result<Vec<(String, String)>, CliError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(CliError::InvalidPair {
                flag: flag.to_string(),
                raw: item.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_argv_is_all_defaults() {
        let args = ServeArgs::parse(Vec::<String>::new()).expect("parse");
        assert_eq!(args, ServeArgs::default());
    }

    #[test]
    fn serve_subcommand_is_optional() {
        let a = ServeArgs::parse(["serve", "--gravatar"]).expect("parse");
        let b = ServeArgs::parse(["--gravatar"]).expect("parse");
        assert_eq!(a, b);
        assert_eq!(a.gravatar, Some(true));
    }

    #[test]
    fn flags_accept_both_value_forms() {
        let args = ServeArgs::parse([
            "--addr",
            "0.0.0.0:9000",
            "--cache-folder=/tmp/avatars",
            "--resizer=imagemagick",
            "--verbose",
        ])
        .expect("parse");
        assert_eq!(args.addr, Some(("0.0.0.0".to_string(), 9000)));
        assert_eq!(args.cache_folder.as_deref(), Some("/tmp/avatars"));
        assert_eq!(args.resizer, Some(ResizerBackend::Imagemagick));
        assert!(args.verbose);
    }

    #[test]
    fn mapping_flags_repeat_and_split_on_commas() {
        let args = ServeArgs::parse([
            "--email",
            "a@example.org=a.png,b@example.org=b.png",
            "--email=c@example.org=c.png",
            "--default",
            "nobody=nobody.png",
        ])
        .expect("parse");
        assert_eq!(args.identities.len(), 3);
        assert_eq!(
            args.identities[2],
            ("c@example.org".to_string(), "c.png".to_string())
        );
        assert_eq!(
            args.defaults,
            vec![("nobody".to_string(), "nobody.png".to_string())]
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(
            ServeArgs::parse(["--addr"]),
            Err(CliError::MissingValue("--addr".to_string()))
        );
        assert!(matches!(
            ServeArgs::parse(["--addr", "localhost"]),
            Err(CliError::InvalidAddr(_))
        ));
        assert!(matches!(
            ServeArgs::parse(["--email", "no-equals-sign"]),
            Err(CliError::InvalidPair { .. })
        ));
        assert!(matches!(
            ServeArgs::parse(["--resizer", "gimp"]),
            Err(CliError::InvalidResizer(_))
        ));
        assert_eq!(
            ServeArgs::parse(["--frobnicate"]),
            Err(CliError::Unknown("--frobnicate".to_string()))
        );
    }

    #[test]
    fn apply_overrides_config() {
        let args = ServeArgs::parse([
            "--addr=:7000",
            "--email",
            "a@example.org=a.png",
            "--default",
            "nobody=n.png",
            "--gravatar",
            "--resizer",
            "none",
            "--verbose",
        ])
        .expect("parse");

        let mut cfg = AppConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.server_addr(), "0.0.0.0:7000");
        assert_eq!(
            cfg.avatar.identities.get("a@example.org").map(String::as_str),
            Some("a.png")
        );
        assert!(cfg.avatar.defaults.contains_key("nobody"));
        assert!(cfg.avatar.gravatar);
        assert_eq!(cfg.resizer.backend, ResizerBackend::None);
        assert_eq!(cfg.logging.level, "debug");
    }
}
