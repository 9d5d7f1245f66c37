//! 日志初始化模块：为二进制程序和测试安装 tracing 订阅器。
//!
//! Logging setup for binaries and tests.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! application's call. [`init_tracing`] is the default used by the
//! `cloudcall` binary.

use tracing_subscriber::EnvFilter;

/// Variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CLOUDCALL_LOG";

/// Filter from `CLOUDCALL_LOG`, then `RUST_LOG`, then `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    let from = |var: &str| {
        std::env::var(var)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| EnvFilter::try_new(s).ok())
    };
    from(LOG_ENV)
        .or_else(|| from(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|| EnvFilter::new(default_directive))
}

/// Install a compact stderr subscriber. Returns `false` if one was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }

    #[test]
    fn falls_back_to_default_directive() {
        let filter = env_filter("warn");
        assert!(!filter.to_string().is_empty());
    }
}
