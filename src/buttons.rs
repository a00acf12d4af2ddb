use crate::{
    config::ButtonsConfig,
    dispatcher::{Command, Dispatcher},
};
use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::process::Stdio;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command as Process,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Button {
    View,
    Toggle,
    Scan,
    Sync,
}

impl Button {
    pub fn command(self) -> Command {
        match self {
            Button::View => Command::SwitchView,
            Button::Toggle => Command::ToggleActive,
            Button::Scan => Command::RescanDhcp,
            Button::Sync => Command::SyncTime,
        }
    }
}

/// Consumes button edge events from a long-running `gpiomon` child; the
/// debouncing and GPIO plumbing live there, we only map line offsets to
/// commands.
pub struct GpioButtons {
    config: ButtonsConfig,
}

impl GpioButtons {
    pub fn new(config: ButtonsConfig) -> Self {
        GpioButtons { config }
    }

    pub fn button_for_offset(&self, offset: u32) -> Option<Button> {
        if offset == self.config.view_offset {
            Some(Button::View)
        } else if offset == self.config.toggle_offset {
            Some(Button::Toggle)
        } else if offset == self.config.scan_offset {
            Some(Button::Scan)
        } else if offset == self.config.sync_offset {
            Some(Button::Sync)
        } else {
            None
        }
    }

    pub async fn run(self, dispatcher: Dispatcher) -> Result<()> {
        let mut child = Process::new("gpiomon")
            .args([
                "--edges",
                "rising",
                "--chip",
                &self.config.chip,
                &self.config.view_offset.to_string(),
                &self.config.toggle_offset.to_string(),
                &self.config.scan_offset.to_string(),
                &self.config.sync_offset.to_string(),
            ])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn gpiomon")?;

        let stdout = child
            .stdout
            .take()
            .context("gpiomon has no stdout handle")?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await.context("gpiomon read failed")? {
            let Some(button) = parse_event_offset(&line).and_then(|o| self.button_for_offset(o))
            else {
                debug!("unrecognized gpiomon event: {line}");
                continue;
            };

            info!("button {button:?} pressed");
            if let Err(e) = dispatcher.submit(button.command()).await {
                // the worker already put the failure on the panel
                info!("button {button:?} rejected: {e}");
            }
        }

        bail!("gpiomon exited");
    }
}

/// gpiomon event lines end in the line offset, e.g.
/// `1234.567890 rising gpiochip0 5`.
pub fn parse_event_offset(line: &str) -> Option<u32> {
    line.split_whitespace().last()?.parse().ok()
}
