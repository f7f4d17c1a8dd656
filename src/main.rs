use avatar_server::cli::{ServeArgs, USAGE};
use avatar_server::startup::run_startup_checks;
use avatar_server::{AppConfig, AppState, ShutdownManager, build_app};

#[tokio::main]
async fn main() {
    let args = match ServeArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("参数错误: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    if args.help {
        print!("{USAGE}");
        return;
    }

    let mut config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config init failed: {e}");
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("avatar_server={},tower_http=info", config.logging.level).into()
            }),
        )
        .init();

    if let Err(e) = config.validate() {
        tracing::error!("Config invalid: {}", e);
        std::process::exit(1);
    }

    // 创建优雅退出管理器并启动信号处理器
    let shutdown_manager = ShutdownManager::new();
    if let Err(e) = shutdown_manager.start_signal_handler().await {
        tracing::error!("信号处理器启动失败: {}", e);
        std::process::exit(1);
    }

    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("State init failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run_startup_checks(&state).await {
        tracing::error!("Startup checks failed: {}", e);
        std::process::exit(1);
    }

    let app = build_app(state);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Bind address failed {}: {}", addr, e);
            std::process::exit(1);
        });

    tracing::info!("Server: http://{}", addr);
    tracing::info!("Docs: http://{}/docs", addr);
    tracing::info!("Health: http://{}/health", addr);
    tracing::info!("Cache: {:?}", config.cache_path());

    let shutdown_timeout = config.shutdown.timeout_duration();
    let signal_manager = shutdown_manager.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let reason = signal_manager.wait_for_shutdown().await;
            tracing::info!("接收到退出信号: {:?}，开始优雅关闭HTTP服务器...", reason);
        })
        .into_future();
    tokio::pin!(server);

    // 收到信号后，在途请求最多再等 timeout_secs
    let result = tokio::select! {
        result = &mut server => result,
        _ = async {
            shutdown_manager.wait_for_shutdown().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            tracing::warn!(
                "优雅退出超时（{}秒），强制退出",
                config.shutdown.timeout_secs
            );
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!("服务器运行错误: {}", e);
        std::process::exit(1);
    }

    tracing::info!("服务器已优雅关闭");
}
