use crate::{
    controller::{ControlError, SharedRole},
    dispatcher::{Command, Dispatcher},
    presentation,
    probes::FactProbes,
};
use actix_files::NamedFile;
use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::Deserialize;
use std::{path::PathBuf, sync::Arc};

#[derive(Deserialize)]
pub struct SetTimePayload {
    time: String,
}

pub struct Api<P: FactProbes> {
    pub dispatcher: Dispatcher,
    pub probes: Arc<P>,
    pub role: SharedRole,
    pub index_html: PathBuf,
}

// Derived Clone would demand P: Clone; the probes are shared anyway.
impl<P: FactProbes> Clone for Api<P> {
    fn clone(&self) -> Self {
        Api {
            dispatcher: self.dispatcher.clone(),
            probes: self.probes.clone(),
            role: self.role.clone(),
            index_html: self.index_html.clone(),
        }
    }
}

impl<P: FactProbes + Send + Sync + 'static> Api<P> {
    pub async fn ptp_info(config: web::Data<Api<P>>) -> impl Responder {
        debug!("ptp_info() called");

        let role = config.role.get().await;
        HttpResponse::Ok().json(presentation::ptp_info(config.probes.as_ref(), &role).await)
    }

    pub async fn dhcp_info(config: web::Data<Api<P>>) -> impl Responder {
        debug!("dhcp_info() called");

        let role = config.role.get().await;
        HttpResponse::Ok().json(presentation::dhcp_info(config.probes.as_ref(), &role).await)
    }

    pub async fn ptp_toggle(config: web::Data<Api<P>>) -> impl Responder {
        debug!("ptp_toggle() called");
        command_response(config.dispatcher.submit(Command::TogglePtp).await)
    }

    pub async fn dhcp_toggle(config: web::Data<Api<P>>) -> impl Responder {
        debug!("dhcp_toggle() called");
        command_response(config.dispatcher.submit(Command::ToggleDhcp).await)
    }

    pub async fn dhcp_scan(config: web::Data<Api<P>>) -> impl Responder {
        debug!("dhcp_scan() called");
        command_response(config.dispatcher.submit(Command::RescanDhcp).await)
    }

    pub async fn sync_time(config: web::Data<Api<P>>) -> impl Responder {
        debug!("sync_time() called");
        command_response(config.dispatcher.submit(Command::SyncTime).await)
    }

    pub async fn set_time(
        body: web::Json<SetTimePayload>,
        config: web::Data<Api<P>>,
    ) -> impl Responder {
        debug!("set_time() called with {}", body.time);

        let instant = match DateTime::parse_from_rfc3339(&body.time) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(e) => {
                error!("set_time: unparseable time {:?}: {e}", body.time);
                return HttpResponse::BadRequest().body(format!("unparseable time: {e}"));
            }
        };

        command_response(config.dispatcher.submit(Command::SetTime(instant)).await)
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    /// SPA fallback for everything the API does not match.
    pub async fn index(config: web::Data<Api<P>>) -> actix_web::Result<NamedFile> {
        Ok(NamedFile::open(&config.index_html)?)
    }
}

fn command_response(result: Result<(), ControlError>) -> HttpResponse {
    match result {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e @ ControlError::Busy) | Err(e @ ControlError::ForeignServerPresent(_)) => {
            HttpResponse::Conflict().body(e.to_string())
        }
        Err(e @ ControlError::NoForeignMaster) | Err(e @ ControlError::NotApplicable) => {
            HttpResponse::PreconditionFailed().body(e.to_string())
        }
        Err(e @ ControlError::DaemonNotReady(_)) => {
            HttpResponse::GatewayTimeout().body(e.to_string())
        }
        Err(e) => {
            error!("command failed: {e:#}");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::RoleController;
    use crate::display::MockDisplayPanel;
    use crate::presentation::Presenter;
    use crate::probes::{DhcpScan, MockFactProbes};
    use crate::system_control::MockSystemControl;
    use actix_web::{http::StatusCode, test, App};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn quiet_panel() -> MockDisplayPanel {
        let mut panel = MockDisplayPanel::new();
        panel
            .expect_show()
            .returning(|_| Box::pin(async { Ok(()) }));
        panel.expect_clear().returning(|| Box::pin(async { Ok(()) }));
        panel
    }

    fn api(system: MockSystemControl, probes: MockFactProbes) -> Api<MockFactProbes> {
        let probes = Arc::new(probes);
        let role = SharedRole::default();

        let controller = RoleController::new(
            system,
            probes.clone(),
            role.clone(),
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        let presenter = Presenter::new(quiet_panel(), probes.clone(), role.clone());
        let (dispatcher, _shutdown, _worker) = Dispatcher::spawn(controller, presenter);

        Api {
            dispatcher,
            probes,
            role,
            index_html: PathBuf::from("static/index.html"),
        }
    }

    macro_rules! test_app {
        ($api:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($api))
                    .route("/ptp_info", web::get().to(Api::<MockFactProbes>::ptp_info))
                    .route(
                        "/dhcp_info",
                        web::get().to(Api::<MockFactProbes>::dhcp_info),
                    )
                    .route(
                        "/dhcp_toggle",
                        web::post().to(Api::<MockFactProbes>::dhcp_toggle),
                    )
                    .route(
                        "/dhcp_scan",
                        web::post().to(Api::<MockFactProbes>::dhcp_scan),
                    )
                    .route(
                        "/set_time",
                        web::post().to(Api::<MockFactProbes>::set_time),
                    )
                    .route("/version", web::get().to(Api::<MockFactProbes>::version)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn ptp_info_reports_nulls_while_unavailable() {
        let mut probes = MockFactProbes::new();
        probes
            .expect_ptp_status()
            .returning(|| Box::pin(async { None }));

        let app = test_app!(api(MockSystemControl::new(), probes));

        let request = test::TestRequest::get().uri("/ptp_info").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;

        assert_eq!(body["role"], "slave");
        assert!(body["foreign_master_present"].is_null());
        assert!(body["observed_clock_count"].is_null());
    }

    #[actix_web::test]
    async fn dhcp_info_reports_role_and_address() {
        let mut probes = MockFactProbes::new();
        probes
            .expect_own_address()
            .returning(|_| Box::pin(async { Some("192.168.1.23".to_string()) }));

        let app = test_app!(api(MockSystemControl::new(), probes));

        let request = test::TestRequest::get().uri("/dhcp_info").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;

        assert_eq!(body["role"], "client");
        assert_eq!(body["own_address"], "192.168.1.23");
        assert!(body["leases"].is_null());
    }

    #[actix_web::test]
    async fn scan_records_foreign_server_and_blocks_server_entry() {
        let foreign: Ipv4Addr = "192.0.2.1".parse().unwrap();

        let mut probes = MockFactProbes::new();
        probes
            .expect_scan_for_foreign_dhcp_server()
            .returning(move || Box::pin(async move { DhcpScan::Foreign(foreign) }));
        probes
            .expect_own_address()
            .returning(|_| Box::pin(async { None }));
        probes
            .expect_dhcp_leases()
            .returning(|| Box::pin(async { None }));

        // No profile swap is allowed anywhere in this scenario.
        let mut system = MockSystemControl::new();
        system.expect_apply_network_profile().times(0);

        let app = test_app!(api(system, probes));

        let scan = test::TestRequest::post().uri("/dhcp_scan").to_request();
        let response = test::call_service(&app, scan).await;
        assert_eq!(response.status(), StatusCode::OK);

        let toggle = test::TestRequest::post().uri("/dhcp_toggle").to_request();
        let response = test::call_service(&app, toggle).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn set_time_rejects_unparseable_payload() {
        let app = test_app!(api(MockSystemControl::new(), MockFactProbes::new()));

        let request = test::TestRequest::post()
            .uri("/set_time")
            .set_json(serde_json::json!({"time": "yesterday-ish"}))
            .to_request();
        let response = test::call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn set_time_passes_parsed_instant_to_the_clock() {
        let expected = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut system = MockSystemControl::new();
        system
            .expect_set_system_clock()
            .withf(move |instant| *instant == expected)
            .times(1)
            .returning(|_| Box::pin(async { Ok(()) }));

        let mut probes = MockFactProbes::new();
        probes
            .expect_own_address()
            .returning(|_| Box::pin(async { None }));

        let app = test_app!(api(system, probes));

        let request = test::TestRequest::post()
            .uri("/set_time")
            .set_json(serde_json::json!({"time": "2024-05-01T12:00:00Z"}))
            .to_request();
        let response = test::call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn version_reports_package_version() {
        let app = test_app!(api(MockSystemControl::new(), MockFactProbes::new()));

        let request = test::TestRequest::get().uri("/version").to_request();
        let body = test::call_and_read_body(&app, request).await;

        assert_eq!(body, env!("CARGO_PKG_VERSION").as_bytes());
    }
}
