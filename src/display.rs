use crate::{config::DisplayConfig, process_runner::CommandRunner};
use anyhow::{bail, Context, Result};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::sync::Arc;
use trait_variant::make;

/// The physical e-paper panel. Bitmap drawing and the panel's
/// init/display/sleep cycle live in an external helper; we only hand it
/// text.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DisplayPanel {
    async fn show(&mut self, text: String) -> Result<()>;
    async fn clear(&mut self) -> Result<()>;
}

pub struct EpdPanel<R: CommandRunner> {
    runner: Arc<R>,
    config: DisplayConfig,
}

impl<R: CommandRunner> EpdPanel<R> {
    pub fn new(runner: Arc<R>, config: DisplayConfig) -> Self {
        EpdPanel { runner, config }
    }

    async fn helper(&self, args: Vec<String>) -> Result<()> {
        let output = self
            .runner
            .run(
                self.config.helper_path.clone(),
                args,
                self.config.helper_timeout,
            )
            .await
            .context("display helper failed")?;

        if !output.success {
            bail!("display helper exited non-zero");
        }
        Ok(())
    }
}

impl<R: CommandRunner + Send + Sync> DisplayPanel for EpdPanel<R> {
    async fn show(&mut self, text: String) -> Result<()> {
        debug!("panel: {}", text.replace('\n', " | "));
        self.helper(vec!["--text".to_string(), text]).await
    }

    async fn clear(&mut self) -> Result<()> {
        self.helper(vec!["--clear".to_string()]).await
    }
}
