use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 実行中のポーザーへの指示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoserCommand {
    Quit,
    /// トラッカー位置をデバイスへ反映するか
    UsePositions(bool),
    /// カルマンフィルタの学習
    Learning(bool),
}

pub const HELP: &str = "commands:
  q | quit          exit the poser
  pos on|off        use tracked positions
  learn on|off      kalman filter learning";

fn parse_switch(word: Option<&str>) -> Result<bool> {
    match word {
        Some("on" | "1" | "true") => Ok(true),
        Some("off" | "0" | "false") => Ok(false),
        Some(other) => bail!("expected on/off, got {:?}", other),
        None => bail!("expected on/off"),
    }
}

impl PoserCommand {
    /// コンソールの1行をコマンドに変換
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let cmd = match words.next() {
            Some("q" | "quit" | "exit") => Self::Quit,
            Some("pos") => Self::UsePositions(parse_switch(words.next())?),
            Some("learn") => Self::Learning(parse_switch(words.next())?),
            Some(other) => bail!("unknown command {:?}", other),
            None => bail!("empty command"),
        };
        if words.next().is_some() {
            bail!("trailing arguments in {:?}", line.trim());
        }
        Ok(cmd)
    }
}

/// コマンドで切り替わる実行時フラグ（タスクから参照する）
#[derive(Debug)]
pub struct PoserFlags {
    use_positions: AtomicBool,
    learning: AtomicBool,
}

impl Default for PoserFlags {
    fn default() -> Self {
        Self {
            use_positions: AtomicBool::new(true),
            learning: AtomicBool::new(true),
        }
    }
}

impl PoserFlags {
    pub fn use_positions(&self) -> bool {
        self.use_positions.load(Ordering::Acquire)
    }

    pub fn learning(&self) -> bool {
        self.learning.load(Ordering::Acquire)
    }

    /// Quit 以外を反映。Quit なら false を返す。
    pub fn apply(&self, cmd: PoserCommand) -> bool {
        match cmd {
            PoserCommand::Quit => return false,
            PoserCommand::UsePositions(on) => self.use_positions.store(on, Ordering::Release),
            PoserCommand::Learning(on) => self.learning.store(on, Ordering::Release),
        }
        true
    }
}

/// 標準入力を読み、コマンドを送り続ける（EOFで Quit）
pub async fn console_commands(tx: mpsc::Sender<PoserCommand>) {
    info!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match PoserCommand::parse(&line) {
            Ok(cmd) => {
                let quit = cmd == PoserCommand::Quit;
                if tx.send(cmd).await.is_err() || quit {
                    return;
                }
            }
            Err(e) => warn!("{e:#}\n{}", HELP),
        }
    }
    let _ = tx.send(PoserCommand::Quit).await;
}
