/// 启动检查工具模块
pub mod checks;

pub use checks::{audit_sources, run_startup_checks};
