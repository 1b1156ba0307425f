use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.log`
pub fn log_file_path(dir: &Path, prefix: &str) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}.log", prefix, ts))
}

/// プロセス全体のロガーを初期化する（各バイナリの先頭で1回だけ呼ぶ）
///
/// stderr には常に出力し、`dir` が設定されていればファイルにも書く。
/// RUST_LOG が設定されていれば `level` より優先。作成したログファイルのパスを返す。
pub fn init(config: &LogConfig, prefix: &str) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, path) = match &config.dir {
        Some(dir) => {
            let dir = Path::new(dir);
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let path = log_file_path(dir, prefix);
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("logger already initialized")?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let path = log_file_path(Path::new("logs"), "relay");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("relay_"));
        assert!(name.ends_with(".log"));
        // relay_YYYYmmdd_HHMMSS.log
        assert_eq!(name.len(), "relay_".len() + 15 + ".log".len());
        assert!(path.starts_with("logs"));
    }
}
