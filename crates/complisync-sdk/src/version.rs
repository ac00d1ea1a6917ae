//! SDK 版本信息

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 包名 + 版本，用于日志
pub fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), SDK_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent() {
        assert!(user_agent().starts_with("complisync-sdk/"));
        assert!(user_agent().ends_with(SDK_VERSION));
    }
}
