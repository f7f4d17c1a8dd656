//! 缩放能力抽象。
//!
//! 缓存层只依赖 [`Resizer`]：给定源图、目标路径与尺寸，生成缩放后的图片。
//! 具体实现可替换：
//!
//! | backend | 实现 |
//! |---|---|
//! | `builtin` | [`ImageResizer`]，`image` crate 解码 + `resize_to_fill` + JPEG 编码 |
//! | `imagemagick` | [`MagickResizer`]，调用 `magick`（或 IM6 的 `convert`） |
//!
//! 实现均为同步阻塞调用，由缓存层放入 Tokio 阻塞线程池执行。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, ImageReader};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("图片解码失败: {0}")]
    Decode(String),
    #[error("图片编码失败: {0}")]
    Encode(String),
    #[error("未找到缩放工具: {0}")]
    ToolMissing(String),
    #[error("缩放工具执行失败: {0}")]
    ToolFailed(ExitStatus),
    #[error("缩放任务已取消")]
    Cancelled,
    #[error("阻塞缩放任务执行失败: {0}")]
    Join(String),
}

/// 单次缩放任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeJob {
    pub source: PathBuf,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// 取消标记：请求被中断时由缓存层置位，实现方在阶段之间检查。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 已取消时返回 `Err(Cancelled)`
    pub fn check(&self) -> Result<(), ResizeError> {
        if self.is_cancelled() {
            Err(ResizeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 析构时自动置位的守卫；正常完成后调用 [`CancelOnDrop::disarm`]。
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            flag: Some(self.clone()),
        }
    }
}

pub struct CancelOnDrop {
    flag: Option<CancelFlag>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.flag = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.cancel();
        }
    }
}

pub trait Resizer: Send + Sync {
    /// 用于日志与健康检查
    fn name(&self) -> &'static str;

    /// 从 `job.source` 生成 `job.width` x `job.height` 的图片写入 `job.output`。
    fn resize(&self, job: &ResizeJob, cancel: &CancelFlag) -> Result<(), ResizeError>;
}

/// 解析过滤器名称（大小写不敏感）
pub fn parse_filter(name: &str) -> Option<FilterType> {
    match name.to_ascii_lowercase().as_str() {
        "nearest" => Some(FilterType::Nearest),
        "triangle" => Some(FilterType::Triangle),
        "catmullrom" => Some(FilterType::CatmullRom),
        "gaussian" => Some(FilterType::Gaussian),
        "lanczos3" => Some(FilterType::Lanczos3),
        _ => None,
    }
}

/// 纯 Rust 实现：居中裁剪到目标尺寸并输出 JPEG。
#[derive(Debug, Clone)]
pub struct ImageResizer {
    filter: FilterType,
    quality: u8,
}

impl ImageResizer {
    pub fn new(filter: FilterType, quality: u8) -> Self {
        Self {
            filter,
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for ImageResizer {
    fn default() -> Self {
        Self::new(FilterType::Lanczos3, 85)
    }
}

impl Resizer for ImageResizer {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn resize(&self, job: &ResizeJob, cancel: &CancelFlag) -> Result<(), ResizeError> {
        cancel.check()?;
        let img = ImageReader::open(&job.source)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| {
                ResizeError::Decode(format!("{}: {e}", job.source.display()))
            })?;

        cancel.check()?;
        let rgb = img
            .resize_to_fill(job.width, job.height, self.filter)
            .to_rgb8();

        cancel.check()?;
        let mut out = BufWriter::new(File::create(&job.output)?);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(&rgb, rgb.width(), rgb.height(), ColorType::Rgb8.into())
            .map_err(|e| ResizeError::Encode(format!("{}: {e}", job.output.display())))?;
        out.flush()?;
        Ok(())
    }
}

/// 调用 ImageMagick 命令行。未显式配置程序时依次查找 `magick`、`convert`。
#[derive(Debug, Clone, Default)]
pub struct MagickResizer {
    program: Option<PathBuf>,
}

impl MagickResizer {
    pub fn new(program: Option<PathBuf>) -> Self {
        Self { program }
    }

    fn locate(&self) -> Result<PathBuf, ResizeError> {
        if let Some(p) = &self.program {
            return Ok(p.clone());
        }
        if let Some(p) = find_in_path("magick") {
            return Ok(p);
        }
        debug!("未找到 magick 命令，尝试 ImageMagick 6 的 convert");
        find_in_path("convert").ok_or_else(|| ResizeError::ToolMissing("magick/convert".into()))
    }
}

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

impl Resizer for MagickResizer {
    fn name(&self) -> &'static str {
        "imagemagick"
    }

    fn resize(&self, job: &ResizeJob, cancel: &CancelFlag) -> Result<(), ResizeError> {
        cancel.check()?;
        let bin = self.locate()?;
        let geometry = format!("{}x{}", job.width, job.height);
        debug!("{} -> {}", job.source.display(), job.output.display());

        let mut child = Command::new(&bin)
            .arg(&job.source)
            .arg("-resize")
            .arg(format!("{geometry}^"))
            .args(["-gravity", "center", "-extent"])
            .arg(&geometry)
            .arg(&job.output)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ResizeError::ToolMissing(bin.display().to_string())
                }
                _ => ResizeError::Io(e),
            })?;

        loop {
            if let Some(status) = child.try_wait()? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(ResizeError::ToolFailed(status))
                };
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ResizeError::Cancelled);
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        }
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .flat_map(|dir| candidates(&dir, program))
        .find(|p| p.is_file())
}

fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    let mut out = vec![dir.join(program)];
    if cfg!(windows) {
        out.push(dir.join(format!("{program}.exe")));
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;

    /// 只计数、写入占位文件的缩放实现，用于验证缓存命中与失效。
    #[derive(Default)]
    pub struct CountingResizer {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl CountingResizer {
        pub fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        pub fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Resizer for CountingResizer {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn resize(&self, job: &ResizeJob, cancel: &CancelFlag) -> Result<(), ResizeError> {
            cancel.check()?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ResizeError::Decode("broken source".into()));
            }
            std::fs::write(&job.output, format!("{}x{}", job.width, job.height))?;
            Ok(())
        }
    }

    fn write_png(path: &Path, w: u32, h: u32) {
        let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        img.save(path).expect("save png");
    }

    #[test]
    fn image_resizer_produces_exact_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("in.png");
        let output = dir.path().join("out.jpg");
        write_png(&source, 120, 80);

        let job = ResizeJob {
            source,
            output: output.clone(),
            width: 40,
            height: 40,
        };
        ImageResizer::default()
            .resize(&job, &CancelFlag::new())
            .expect("resize");

        let out = image::open(&output).expect("open output");
        assert_eq!(out.dimensions(), (40, 40));
    }

    #[test]
    fn image_resizer_reports_decode_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("in.png");
        std::fs::write(&source, b"definitely not an image").expect("write");
        let job = ResizeJob {
            source,
            output: dir.path().join("out.jpg"),
            width: 10,
            height: 10,
        };
        let err = ImageResizer::default()
            .resize(&job, &CancelFlag::new())
            .expect_err("should fail");
        assert!(matches!(err, ResizeError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn cancelled_job_does_not_write_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("in.png");
        write_png(&source, 16, 16);
        let output = dir.path().join("out.jpg");
        let job = ResizeJob {
            source,
            output: output.clone(),
            width: 8,
            height: 8,
        };

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = ImageResizer::default()
            .resize(&job, &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, ResizeError::Cancelled));
        assert!(!output.exists());
    }

    #[test]
    fn cancel_on_drop_raises_flag_unless_disarmed() {
        let flag = CancelFlag::new();
        flag.cancel_on_drop().disarm();
        assert!(!flag.is_cancelled());

        drop(flag.cancel_on_drop());
        assert!(flag.is_cancelled());
    }

    #[test]
    fn magick_with_missing_program_is_tool_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resizer = MagickResizer::new(Some(dir.path().join("no-such-magick")));
        let job = ResizeJob {
            source: dir.path().join("in.png"),
            output: dir.path().join("out.jpg"),
            width: 8,
            height: 8,
        };
        let err = resizer
            .resize(&job, &CancelFlag::new())
            .expect_err("missing tool");
        assert!(matches!(err, ResizeError::ToolMissing(_)), "got {err:?}");
    }

    #[test]
    fn filter_names_are_case_insensitive() {
        assert_eq!(parse_filter("Lanczos3"), Some(FilterType::Lanczos3));
        assert_eq!(parse_filter("TRIANGLE"), Some(FilterType::Triangle));
        assert_eq!(parse_filter("bicubic"), None);
    }
}
