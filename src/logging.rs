use tracing_subscriber::EnvFilter;

/// 日志等级（对应 `DEBUG` 配置）：
/// - off：不输出任何日志
/// - low：warn 以上，以及本 crate 的 info（key 分配失败、冷却、持久化异常）
/// - high：本 crate 的 debug（每次分配/跳过/预留的细节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    High = 2,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Self::Off,
            "high" | "debug" | "all" | "2" => Self::High,
            _ => Self::Low,
        }
    }

    pub fn directive(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "keycycle=info",
            Self::High => "keycycle=debug",
        }
    }
}

/// 构造过滤器：显式的 RUST_LOG 优先，但若其中没有提到本 crate，则补上本 crate 的等级，
/// 以免环境里预设的 RUST_LOG=warn 把分配/冷却日志过滤掉。
pub fn build_filter(level: LogLevel, rust_log: Option<&str>) -> EnvFilter {
    if level == LogLevel::Off {
        return EnvFilter::new("off");
    }
    let env = rust_log.unwrap_or_default().trim();
    if env.is_empty() {
        EnvFilter::new(format!("warn,{}", level.directive()))
    } else if env.contains("keycycle") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},{}", level.directive()))
    }
}

pub fn init_tracing(level: LogLevel) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(level, rust_log.as_deref());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}
