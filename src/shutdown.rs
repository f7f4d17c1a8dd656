//! 优雅退出管理模块
//!
//! 提供跨平台的信号处理和优雅退出协调机制
//! 支持SIGINT、SIGTERM信号和Windows Ctrl+C处理

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// 优雅退出管理器
///
/// 退出原因存放在 watch 通道里：只记录第一次触发，先触发后等待的调用方也能立即拿到。
#[derive(Debug, Clone)]
pub struct ShutdownManager {
    inner: Arc<watch::Sender<Option<ShutdownReason>>>,
}

/// 退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户中断信号 (Ctrl+C)
    Interrupt,
    /// 终止信号 (SIGTERM)
    Terminate,
    /// 应用请求退出
    Application,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// 等待退出信号，返回第一次触发时的原因
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        debug!("等待退出信号...");
        let mut rx = self.inner.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::Application),
            // 发送端与管理器同生命周期，这里只在管理器整体被丢弃时出现
            Err(_) => ShutdownReason::Application,
        }
    }

    /// 触发优雅退出；重复触发被忽略
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        let first = self.inner.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });

        if first {
            info!("触发优雅退出: {:?}", reason);
        } else {
            debug!("重复的退出信号被忽略");
        }
    }

    /// 启动信号处理器
    ///
    /// 在Linux/macOS上监听SIGINT和SIGTERM
    /// 在Windows上监听Ctrl+C
    pub async fn start_signal_handler(&self) -> Result<(), ShutdownError> {
        #[cfg(unix)]
        {
            self.start_unix_signal_handler().await
        }

        #[cfg(windows)]
        {
            self.start_windows_signal_handler().await
        }
    }

    #[cfg(unix)]
    async fn start_unix_signal_handler(&self) -> Result<(), ShutdownError> {
        use tokio::signal::unix::{SignalKind, signal};

        info!("启动Unix信号处理器");

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| ShutdownError::SignalSetup(e.to_string()))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| ShutdownError::SignalSetup(e.to_string()))?;

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("接收到SIGINT信号 (Ctrl+C)");
                    manager.trigger_shutdown(ShutdownReason::Interrupt);
                }
                _ = sigterm.recv() => {
                    info!("接收到SIGTERM信号");
                    manager.trigger_shutdown(ShutdownReason::Terminate);
                }
            }
        });

        Ok(())
    }

    #[cfg(windows)]
    async fn start_windows_signal_handler(&self) -> Result<(), ShutdownError> {
        info!("启动Windows信号处理器");

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("监听Ctrl+C信号失败: {}", e);
                return;
            }

            info!("接收到Ctrl+C信号");
            manager.trigger_shutdown(ShutdownReason::Interrupt);
        });

        Ok(())
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 优雅退出错误类型
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("信号设置失败: {0}")]
    SignalSetup(String),
}
