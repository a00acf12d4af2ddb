use crate::{
    controller::{ControlError, RoleController, View},
    display::DisplayPanel,
    presentation::Presenter,
    probes::FactProbes,
    system_control::SystemControl,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    TogglePtp,
    ToggleDhcp,
    /// Toggle whichever axis the panel currently shows (button surface only)
    ToggleActive,
    RescanDhcp,
    SyncTime,
    SetTime(DateTime<Utc>),
    SwitchView,
}

type Reply = oneshot::Sender<Result<(), ControlError>>;

/// Routes both UI surfaces into one command queue.
///
/// A single worker task owns the RoleController and the Presenter and
/// executes one command to completion at a time. While a command is in
/// flight, further submissions are rejected with `Busy` instead of being
/// buffered: a queued button press would be stale by the time it ran.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<(Command, Reply)>,
    in_flight: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn spawn<S, P, D>(
        controller: RoleController<S, P>,
        presenter: Presenter<D, P>,
    ) -> (Dispatcher, oneshot::Sender<()>, JoinHandle<()>)
    where
        S: SystemControl + Send + Sync + 'static,
        P: FactProbes + Send + Sync + 'static,
        D: DisplayPanel + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let in_flight = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(worker_loop(
            controller,
            presenter,
            rx,
            shutdown_rx,
            in_flight.clone(),
        ));

        (Dispatcher { tx, in_flight }, shutdown_tx, worker)
    }

    /// Execute a mutating command, waiting for its completion. Returns
    /// `Busy` immediately if another command is already running.
    pub async fn submit(&self, command: Command) -> Result<(), ControlError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(ControlError::Busy);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((command, reply_tx)).await.is_err() {
            self.in_flight.store(false, Ordering::Release);
            return Err(ControlError::Process(anyhow!("command worker is gone")));
        }

        reply_rx
            .await
            .unwrap_or_else(|_| Err(ControlError::Process(anyhow!("command worker is gone"))))
    }
}

async fn worker_loop<S, P, D>(
    mut controller: RoleController<S, P>,
    mut presenter: Presenter<D, P>,
    mut rx: mpsc::Receiver<(Command, Reply)>,
    shutdown_rx: oneshot::Receiver<()>,
    in_flight: Arc<AtomicBool>,
) where
    S: SystemControl + Send + Sync,
    P: FactProbes + Send + Sync,
    D: DisplayPanel + Send,
{
    enum Wake {
        Shutdown(bool),
        Envelope(Option<(Command, Reply)>),
    }

    let mut shutdown_rx = Some(shutdown_rx);

    loop {
        let wake = match shutdown_rx.as_mut() {
            Some(shutdown) => tokio::select! {
                result = shutdown => Wake::Shutdown(result.is_ok()),
                received = rx.recv() => Wake::Envelope(received),
            },
            None => Wake::Envelope(rx.recv().await),
        };

        let (command, reply) = match wake {
            Wake::Shutdown(true) => break,
            Wake::Shutdown(false) => {
                // A dropped sender is not a shutdown request; keep serving
                // until the command queue itself closes.
                shutdown_rx = None;
                continue;
            }
            Wake::Envelope(Some(envelope)) => envelope,
            Wake::Envelope(None) => break,
        };

        debug!("executing {command:?}");
        let result = execute(&mut controller, command).await;

        match &result {
            Ok(()) => presenter.render().await,
            Err(e) => {
                warn!("{command:?} failed: {e:#}");
                presenter.render_error(&e.to_string()).await;
            }
        }

        in_flight.store(false, Ordering::Release);
        let _ = reply.send(result);
    }

    presenter.clear().await;
    debug!("command worker stopped");
}

async fn execute<S, P>(
    controller: &mut RoleController<S, P>,
    command: Command,
) -> Result<(), ControlError>
where
    S: SystemControl,
    P: FactProbes + Send + Sync,
{
    match command {
        Command::TogglePtp => controller.toggle_ptp_role().await,
        Command::ToggleDhcp => controller.toggle_dhcp_role().await,
        Command::ToggleActive => match controller.device_role().active_view {
            View::Dhcp => controller.toggle_dhcp_role().await,
            View::Ptp => controller.toggle_ptp_role().await,
        },
        Command::RescanDhcp => controller.rescan_dhcp().await,
        Command::SyncTime => controller.sync_time_from_master().await,
        Command::SetTime(instant) => controller.set_time(instant).await,
        Command::SwitchView => controller.switch_view().await,
    }
}
