//! 日志初始化：级别与输出格式来自配置，环境变量可覆盖。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

/// 初始化 tracing 日志订阅与默认过滤规则。
pub fn init_logging(logging: &LoggingSection) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
