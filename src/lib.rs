pub mod blob;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod logging;
pub mod pose;
pub mod poser;
pub mod protocol;
pub mod relay;
pub mod tracker;

/// パッケージバージョン（git管理下なら `+<短縮ハッシュ>` 付き）
pub const VERSION: &str = env!("HOBO_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_extends_package_version() {
        let rest = super::VERSION
            .strip_prefix(env!("CARGO_PKG_VERSION"))
            .unwrap();
        assert!(rest.is_empty() || (rest.starts_with('+') && rest.len() > 1), "{}", super::VERSION);
    }
}
