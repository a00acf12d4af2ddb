use actix_files::Files;
use actix_web::{web, App, HttpServer};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use netclock_ui::{
    api::Api,
    buttons::GpioButtons,
    config::AppConfig,
    controller::{RoleController, SharedRole},
    dispatcher::Dispatcher,
    display::EpdPanel,
    presentation::Presenter,
    probes::SystemProbes,
    process_runner::SystemCommandRunner,
    system_control::SystemdControl,
};
use std::{io::Write, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};

type Probes = SystemProbes<SystemCommandRunner>;

#[actix_web::main]
async fn main() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("netclock-ui version: {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::get();

    let runner = Arc::new(SystemCommandRunner);
    let probes = Arc::new(Probes::new(
        runner.clone(),
        config.network.clone(),
        config.ptp.clone(),
    ));
    let system = SystemdControl::new(runner.clone(), config.network.clone(), config.ptp.clone());
    let role = SharedRole::default();

    let mut controller = RoleController::new(
        system,
        probes.clone(),
        role.clone(),
        config.ptp.confirm_timeout,
        config.ptp.confirm_poll_interval,
    );
    if let Err(e) = controller.initialize().await {
        error!("initialization failed: {e:#}");
        std::process::exit(1);
    }

    let panel = EpdPanel::new(runner.clone(), config.display.clone());
    let mut presenter = Presenter::new(panel, probes.clone(), role.clone());
    presenter.render().await;

    let (dispatcher, shutdown_tx, worker) = Dispatcher::spawn(controller, presenter);

    let buttons = GpioButtons::new(config.buttons.clone());
    let button_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = buttons.run(button_dispatcher).await {
            error!("button listener stopped: {e:#}");
        }
    });

    let api = Api {
        dispatcher,
        probes,
        role,
        index_html: config.paths.index_html.clone(),
    };
    let static_dir = std::fs::canonicalize(&config.paths.static_dir).expect("static folder");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(api.clone()))
            .route("/ptp_info", web::get().to(Api::<Probes>::ptp_info))
            .route("/dhcp_info", web::get().to(Api::<Probes>::dhcp_info))
            .route("/ptp_toggle", web::post().to(Api::<Probes>::ptp_toggle))
            .route("/dhcp_toggle", web::post().to(Api::<Probes>::dhcp_toggle))
            .route("/dhcp_scan", web::post().to(Api::<Probes>::dhcp_scan))
            .route("/set_time", web::post().to(Api::<Probes>::set_time))
            .route("/sync_time", web::post().to(Api::<Probes>::sync_time))
            .route("/version", web::get().to(Api::<Probes>::version))
            .service(Files::new("/static", static_dir.clone()))
            .default_service(web::to(Api::<Probes>::index))
    })
    .bind(("0.0.0.0", config.ui.port))
    .expect("bind server port")
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c");
            server_handle.stop(true).await;
        },
        _ = sigterm.recv() => {
            debug!("sigterm");
            server_handle.stop(true).await;
        },
        _ = server_task => {
            debug!("server stopped");
        },
    }

    // Drains the worker: it clears the panel on the way out. The PTP daemon
    // stays up; it is supervised externally.
    let _ = shutdown_tx.send(());
    let _ = worker.await;

    debug!("good bye");
}
