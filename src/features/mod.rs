/// 头像：身份索引、解析、缓存与缩放
pub mod avatar;
/// 健康检查
pub mod health;
