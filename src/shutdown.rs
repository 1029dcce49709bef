use anyhow::Result;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 进程控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM (优雅关闭)
    Terminate,
    /// SIGQUIT (立即关闭，不等待排空)
    Quit,
    /// SIGHUP (从配置文件重新加载)
    Hangup,
}

/// 信号对应的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown { graceful: bool },
    Reload,
}

impl ControlSignal {
    pub fn action(self) -> SignalAction {
        match self {
            ControlSignal::Interrupt | ControlSignal::Terminate => {
                SignalAction::Shutdown { graceful: true }
            }
            ControlSignal::Quit => SignalAction::Shutdown { graceful: false },
            ControlSignal::Hangup => SignalAction::Reload,
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::Interrupt => write!(f, "SIGINT"),
            ControlSignal::Terminate => write!(f, "SIGTERM"),
            ControlSignal::Quit => write!(f, "SIGQUIT"),
            ControlSignal::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// 信号监听器 - 将操作系统信号转为广播
pub struct SignalListener {
    signal_tx: broadcast::Sender<ControlSignal>,
}

impl Default for SignalListener {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalListener {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);
        Self { signal_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlSignal> {
        self.signal_tx.subscribe()
    }

    /// 程序内部触发
    pub fn trigger(&self, signal: ControlSignal) {
        if self.signal_tx.send(signal).is_err() {
            warn!("No receiver for {}", signal);
        }
    }

    /// 注册信号处理
    pub fn install(&self) -> Result<()> {
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for SIGINT: {}", e);
                    return;
                }
                info!("Received SIGINT signal");
                let _ = signal_tx.send(ControlSignal::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            for (kind, control) in [
                (SignalKind::terminate(), ControlSignal::Terminate),
                (SignalKind::quit(), ControlSignal::Quit),
                (SignalKind::hangup(), ControlSignal::Hangup),
            ] {
                let mut stream = signal(kind)?;
                let signal_tx = self.signal_tx.clone();
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        info!("Received {} signal", control);
                        let _ = signal_tx.send(control);
                    }
                });
            }
        }

        info!("Signal handlers registered successfully");
        Ok(())
    }
}
