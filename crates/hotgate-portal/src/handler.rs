//! Request routing: boilerplate, then probes, then admin or portal by origin.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use hotgate_logging::targets::T_PORTAL;
use hotgate_net::{FirewallService, MacAddr, MacResolver, NetworkOrchestrator};

use crate::boilerplate;
use crate::error::PortalError;
use crate::http::{HttpPetition, HttpResponse, Method};
use crate::logging::{format_visit_line, PortalLogger};
use crate::pages;
use crate::probe::CaptivePortalType;
use crate::session::{SessionStore, UserDirectory};

/// Collaborators a handler needs.
pub struct PortalContext {
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserDirectory>,
    pub resolver: Arc<dyn MacResolver>,
    pub firewall: Arc<FirewallService>,
    pub orchestrator: Arc<NetworkOrchestrator>,
    pub visits: Option<PortalLogger>,
}

/// What the handler decided, for the visit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Boilerplate,
    ProbeOpen,
    ProbeRedirect,
    Admin,
    Page,
    Redirect,
    LoggedIn,
    LoginFailed,
    Registered,
    LoggedOut,
    Unidentified,
    GrantFailed,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Boilerplate => "boilerplate",
            Decision::ProbeOpen => "probe_open",
            Decision::ProbeRedirect => "probe_redirect",
            Decision::Admin => "admin",
            Decision::Page => "page",
            Decision::Redirect => "redirect",
            Decision::LoggedIn => "logged_in",
            Decision::LoginFailed => "login_failed",
            Decision::Registered => "registered",
            Decision::LoggedOut => "logged_out",
            Decision::Unidentified => "unidentified",
            Decision::GrantFailed => "grant_failed",
        }
    }
}

pub struct Outcome {
    pub response: HttpResponse,
    pub mac: Option<MacAddr>,
    pub decision: Decision,
}

impl Outcome {
    fn new(response: HttpResponse, mac: Option<MacAddr>, decision: Decision) -> Self {
        Self {
            response,
            mac,
            decision,
        }
    }
}

pub struct PortalHandler {
    ctx: PortalContext,
}

impl PortalHandler {
    pub fn new(ctx: PortalContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PortalContext {
        &self.ctx
    }

    /// Answers one request and records it in the visit log.
    pub async fn handle(&self, req: &HttpPetition) -> HttpResponse {
        let outcome = self.route(req).await;
        let mac = outcome.mac.map(|m| m.to_string());
        debug!(
            target: T_PORTAL,
            ip = %req.client_ip,
            mac = mac.as_deref().unwrap_or("-"),
            os = %req.os_family(),
            browser = %req.browser_family(),
            status = outcome.response.status,
            "{} {} -> {}",
            req.host,
            req.uri(),
            outcome.decision.as_str()
        );
        if let Some(visits) = &self.ctx.visits {
            let line = format_visit_line(
                &req.client_ip.to_string(),
                mac.as_deref(),
                &req.uri(),
                outcome.decision.as_str(),
            );
            if let Err(err) = visits.log_visit_line(&line).await {
                warn!("Visit log write failed: {err:#}");
            }
        }
        outcome.response
    }

    pub async fn route(&self, req: &HttpPetition) -> Outcome {
        if let Some(response) = boilerplate::respond(req) {
            return Outcome::new(response, None, Decision::Boilerplate);
        }

        if let Some(kind) = CaptivePortalType::detect_request(req) {
            return self.probe(req, kind).await;
        }

        if req.is_loopback() {
            return Outcome::new(self.admin(req).await, None, Decision::Admin);
        }

        self.portal(req).await
    }

    /// Unknown IPv6 peers and unresolvable addresses yield `None`.
    pub async fn resolve_mac(&self, req: &HttpPetition) -> Option<MacAddr> {
        let ip = req.client_v4()?;
        let resolver = self.ctx.resolver.clone();
        match tokio::task::spawn_blocking(move || resolver.resolve(ip)).await {
            Ok(mac) => mac,
            Err(err) => {
                error!("MAC lookup for {ip} aborted: {err}");
                None
            }
        }
    }

    fn is_authenticated(&self, mac: Option<MacAddr>) -> bool {
        mac.is_some_and(|m| self.ctx.sessions.is_active_session(m))
    }

    fn login_url(&self) -> String {
        self.ctx.orchestrator.configuration().login_url()
    }

    fn status_url(&self) -> String {
        format!(
            "{}/portal/status",
            self.ctx.orchestrator.configuration().portal_base_url()
        )
    }

    async fn probe(&self, req: &HttpPetition, kind: CaptivePortalType) -> Outcome {
        let mac = self.resolve_mac(req).await;
        if self.is_authenticated(mac) {
            Outcome::new(kind.success_response(&req.path), mac, Decision::ProbeOpen)
        } else {
            debug!(ip = %req.client_ip, "{kind} probe from unauthenticated device");
            Outcome::new(
                HttpResponse::redirect(&self.login_url()),
                mac,
                Decision::ProbeRedirect,
            )
        }
    }

    async fn portal(&self, req: &HttpPetition) -> Outcome {
        let mac = self.resolve_mac(req).await;
        let authed = self.is_authenticated(mac);
        let redirect_login =
            || Outcome::new(HttpResponse::redirect(&self.login_url()), mac, Decision::Redirect);

        match (req.method, req.path.as_str()) {
            (Method::Post, "/portal/login") => self.login(req, mac, false).await,
            (Method::Post, "/portal/register") => self.login(req, mac, true).await,
            (_, "/portal/login") if authed => Outcome::new(
                HttpResponse::redirect(&self.status_url()),
                mac,
                Decision::Redirect,
            ),
            (_, "/portal/login") => Outcome::new(
                HttpResponse::html(200, pages::login(&self.ssid(), None)),
                mac,
                Decision::Page,
            ),
            (_, "/portal/register") => Outcome::new(
                HttpResponse::html(200, pages::register(None)),
                mac,
                Decision::Page,
            ),
            (_, "/portal/logout") => match mac {
                Some(mac) if authed => self.logout(req, mac).await,
                _ => redirect_login(),
            },
            _ if authed => match mac.and_then(|m| self.ctx.sessions.find_session(m)) {
                Some(session) => Outcome::new(
                    HttpResponse::html(200, pages::status(&session)),
                    mac,
                    Decision::Page,
                ),
                None => redirect_login(),
            },
            _ => redirect_login(),
        }
    }

    fn ssid(&self) -> String {
        self.ctx.orchestrator.configuration().ssid
    }

    async fn login(&self, req: &HttpPetition, mac: Option<MacAddr>, register: bool) -> Outcome {
        let form = req.form();
        let username = form.get("username").map(String::as_str).unwrap_or("").trim();
        let password = form.get("password").map(String::as_str).unwrap_or("");

        let checked = if register {
            self.ctx.users.register(username, password)
        } else {
            self.ctx.users.verify(username, password)
        };
        if let Err(err) = checked {
            let message = match &err {
                PortalError::UserExists(_) | PortalError::Malformed(_) => err.to_string(),
                _ => PortalError::InvalidCredentials.to_string(),
            };
            info!(ip = %req.client_ip, "Rejected {} for '{username}': {err}", verb(register));
            let page = if register {
                pages::register(Some(&message))
            } else {
                pages::login(&self.ssid(), Some(&message))
            };
            return Outcome::new(HttpResponse::html(200, page), mac, Decision::LoginFailed);
        }

        let Some(mac) = mac else {
            warn!(ip = %req.client_ip, "Login for '{username}' from a device without a known MAC");
            return Outcome::new(
                HttpResponse::html(403, pages::unidentified(&req.client_ip.to_string())),
                None,
                Decision::Unidentified,
            );
        };

        self.ctx.sessions.create_session(mac, req.client_v4(), username);
        let firewall = self.ctx.firewall.clone();
        let granted = tokio::task::spawn_blocking(move || firewall.grant(mac)).await;
        let failure = match granted {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            // No session may outlive a failed grant.
            self.ctx.sessions.invalidate_session(mac, username);
            error!(%mac, "Grant failed for '{username}': {reason}");
            return Outcome::new(
                HttpResponse::html(
                    503,
                    pages::message("Try again", "Internet access could not be enabled right now."),
                ),
                Some(mac),
                Decision::GrantFailed,
            );
        }

        info!(%mac, ip = %req.client_ip, "'{username}' {}", if register { "registered" } else { "logged in" });
        let decision = if register {
            Decision::Registered
        } else {
            Decision::LoggedIn
        };
        Outcome::new(HttpResponse::redirect(&self.status_url()), Some(mac), decision)
    }

    async fn logout(&self, req: &HttpPetition, mac: MacAddr) -> Outcome {
        if let Some(session) = self.ctx.sessions.find_session(mac) {
            self.ctx.sessions.invalidate_session(mac, &session.username);
        }
        let ip = req.client_v4();
        let firewall = self.ctx.firewall.clone();
        match tokio::task::spawn_blocking(move || firewall.revoke(mac, ip, true)).await {
            Ok(Ok(())) => info!(%mac, "Logged out"),
            Ok(Err(err)) => error!(%mac, "Revoke after logout failed: {err}"),
            Err(err) => error!(%mac, "Revoke after logout aborted: {err}"),
        }
        Outcome::new(
            HttpResponse::html(200, pages::logged_out(mac)),
            Some(mac),
            Decision::LoggedOut,
        )
    }

    /// The captive firewall is rebuilt empty on start and removed on stop,
    /// so no session may survive either.
    fn drop_sessions(&self, why: &str) {
        let dropped = self.ctx.sessions.invalidate_all();
        if dropped > 0 {
            info!("Dropped {dropped} session(s): {why}");
        }
    }

    async fn admin(&self, req: &HttpPetition) -> HttpResponse {
        let orchestrator = self.ctx.orchestrator.clone();
        match (req.method, req.path.as_str()) {
            (Method::Post, "/api/network/start") => {
                info!("Network start requested");
                self.drop_sessions("network restarting");
                tokio::task::spawn_blocking(move || {
                    if orchestrator.set_up_network() {
                        info!("Network is up");
                    } else {
                        error!("Network start failed, see earlier errors");
                    }
                });
                HttpResponse::json(202, &json!({ "status": "starting" }))
            }
            (Method::Post, "/api/network/stop") => {
                info!("Network stop requested");
                let stopped = tokio::task::spawn_blocking(move || {
                    orchestrator.restore_configuration();
                    orchestrator.status()
                })
                .await;
                self.drop_sessions("network stopped");
                match stopped {
                    Ok(status) => HttpResponse::json(200, &json!(status)),
                    Err(err) => internal(&err.to_string()),
                }
            }
            (Method::Get, "/api/network/status") => {
                HttpResponse::json(200, &json!(orchestrator.status()))
            }
            (Method::Get, "/api/device") => {
                let firewall = self.ctx.firewall.clone();
                match tokio::task::spawn_blocking(move || firewall.list_authenticated()).await {
                    Ok(devices) => HttpResponse::json(
                        200,
                        &json!({
                            "devices": devices,
                            "sessions": self.ctx.sessions.sessions(),
                        }),
                    ),
                    Err(err) => internal(&err.to_string()),
                }
            }
            (Method::Post, "/api/device/grant") => self.admin_grant(req).await,
            (Method::Post, "/api/device/revoke") => self.admin_revoke(req).await,
            (
                _,
                "/api/network/start" | "/api/network/stop" | "/api/network/status" | "/api/device"
                | "/api/device/grant" | "/api/device/revoke",
            ) => {
                HttpResponse::json(405, &json!({ "error": "method not allowed" }))
            }
            _ => HttpResponse::json(404, &json!({ "error": "not found" })),
        }
    }
}

impl PortalHandler {
    /// Opens a device by hand. The session is recorded first, like a login.
    async fn admin_grant(&self, req: &HttpPetition) -> HttpResponse {
        let mac = match mac_param(req) {
            Ok(mac) => mac,
            Err(resp) => return resp,
        };
        self.ctx.sessions.create_session(mac, None, ADMIN_USER);
        let firewall = self.ctx.firewall.clone();
        match tokio::task::spawn_blocking(move || firewall.grant(mac)).await {
            Ok(Ok(())) => {
                info!(%mac, "Granted from admin API");
                HttpResponse::json(200, &json!({ "granted": mac }))
            }
            Ok(Err(err)) => {
                self.ctx.sessions.invalidate_session(mac, ADMIN_USER);
                HttpResponse::json(503, &json!({ "error": err.to_string() }))
            }
            Err(err) => {
                self.ctx.sessions.invalidate_session(mac, ADMIN_USER);
                internal(&err.to_string())
            }
        }
    }

    /// Cuts a device off whoever owns its session.
    async fn admin_revoke(&self, req: &HttpPetition) -> HttpResponse {
        let mac = match mac_param(req) {
            Ok(mac) => mac,
            Err(resp) => return resp,
        };
        let params = req.query_params();
        let ip = match params.get("ip").map(|v| v.parse::<Ipv4Addr>()) {
            None => None,
            Some(Ok(ip)) => Some(ip),
            Some(Err(_)) => return HttpResponse::json(400, &json!({ "error": "bad ip" })),
        };
        let force = params.get("force").map(String::as_str) != Some("false");

        if let Some(session) = self.ctx.sessions.find_session(mac) {
            self.ctx.sessions.invalidate_session(mac, &session.username);
        }
        let firewall = self.ctx.firewall.clone();
        match tokio::task::spawn_blocking(move || firewall.revoke(mac, ip, force)).await {
            Ok(Ok(())) => {
                info!(%mac, "Revoked from admin API");
                HttpResponse::json(200, &json!({ "revoked": mac }))
            }
            Ok(Err(err)) => internal(&err.to_string()),
            Err(err) => internal(&err.to_string()),
        }
    }
}

/// Session owner recorded for devices opened through the admin API.
pub const ADMIN_USER: &str = "(admin)";

fn mac_param(req: &HttpPetition) -> std::result::Result<MacAddr, HttpResponse> {
    req.query_params()
        .get("mac")
        .and_then(|v| v.parse::<MacAddr>().ok())
        .ok_or_else(|| HttpResponse::json(400, &json!({ "error": "missing or bad mac" })))
}

fn verb(register: bool) -> &'static str {
    if register {
        "registration"
    } else {
        "login"
    }
}

fn internal(reason: &str) -> HttpResponse {
    HttpResponse::json(500, &json!({ "error": reason }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{JobHandler, PeerDispatcher};
    use crate::session::{InMemorySessionStore, InMemoryUserDirectory};
    use async_trait::async_trait;
    use hotgate_net::testing::SimulatedHost;
    use hotgate_net::{shared, NetworkConfiguration, SystemPaths, Timings};
    use std::net::IpAddr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 50, 23);
    const MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);

    struct Fixture {
        _tmp: TempDir,
        host: Arc<SimulatedHost>,
        sessions: Arc<InMemorySessionStore>,
        users: Arc<InMemoryUserDirectory>,
        handler: Arc<PortalHandler>,
    }

    fn fixture(network_up: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(SimulatedHost::new());
        host.add_neighbor(IpAddr::V4(CLIENT), MAC);
        let orchestrator = Arc::new(NetworkOrchestrator::new(
            host.clone(),
            shared(NetworkConfiguration::default()),
            SystemPaths::default().relocated(tmp.path()),
            Timings::immediate(),
        ));
        if network_up {
            assert!(orchestrator.set_up_network());
        }
        let sessions = Arc::new(InMemorySessionStore::new());
        let users = Arc::new(InMemoryUserDirectory::new());
        users.register("ann", "hunter22").unwrap();
        let handler = Arc::new(PortalHandler::new(PortalContext {
            sessions: sessions.clone(),
            users: users.clone(),
            resolver: Arc::new(orchestrator.mac_resolver()),
            firewall: Arc::new(orchestrator.firewall()),
            orchestrator,
            visits: Some(PortalLogger::new(&tmp.path().join("portal")).unwrap()),
        }));
        Fixture {
            _tmp: tmp,
            host,
            sessions,
            users,
            handler,
        }
    }

    fn request(raw: &str, from: Ipv4Addr) -> HttpPetition {
        HttpPetition::parse(raw.as_bytes(), IpAddr::V4(from)).unwrap()
    }

    fn login_post(user: &str, pass: &str) -> String {
        let body = format!("username={user}&password={pass}");
        format!(
            "POST /portal/login HTTP/1.1\r\nHost: 192.168.50.1:8080\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    const GENERATE_204: &str =
        "GET /generate_204 HTTP/1.1\r\nHost: connectivitycheck.gstatic.com\r\nUser-Agent: Dalvik/2.1.0\r\n\r\n";

    #[tokio::test]
    async fn android_probe_redirects_until_session_exists() {
        let f = fixture(false);
        let resp = f.handler.handle(&request(GENERATE_204, CLIENT)).await;
        assert_eq!(resp.status, 302);
        assert_eq!(
            resp.header("Location"),
            Some("http://192.168.50.1:8080/portal/login")
        );

        f.sessions.create_session(MAC, Some(CLIENT), "ann");
        let resp = f.handler.handle(&request(GENERATE_204, CLIENT)).await;
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn windows_probe_gets_ncsi_text_when_authenticated() {
        let f = fixture(false);
        f.sessions.create_session(MAC, Some(CLIENT), "ann");
        let resp = f
            .handler
            .handle(&request(
                "GET /ncsi.txt HTTP/1.1\r\nHost: www.msftncsi.com\r\nUser-Agent: Microsoft NCSI\r\n\r\n",
                CLIENT,
            ))
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"Microsoft NCSI");
    }

    #[tokio::test]
    async fn unknown_device_is_never_allowed() {
        let f = fixture(false);
        // A session for some MAC exists, but this client maps to no MAC.
        f.sessions.create_session(MAC, None, "ann");
        let stranger = Ipv4Addr::new(192, 168, 50, 99);
        for raw in [GENERATE_204, "GET /portal/status HTTP/1.1\r\nHost: 192.168.50.1\r\n\r\n"] {
            let resp = f.handler.handle(&request(raw, stranger)).await;
            assert_eq!(resp.status, 302);
        }
        // The resolver tried a ping before giving up.
        assert!(f.host.commands().iter().any(|c| c.starts_with("ping")));

        let outcome = f.handler.route(&request(&login_post("ann", "hunter22"), stranger)).await;
        assert_eq!(outcome.decision, Decision::Unidentified);
        assert_eq!(outcome.response.status, 403);
    }

    #[tokio::test]
    async fn login_grants_and_logout_revokes() {
        let f = fixture(true);
        let firewall = f.handler.context().firewall.clone();

        let outcome = f.handler.route(&request(&login_post("ann", "hunter22"), CLIENT)).await;
        assert_eq!(outcome.decision, Decision::LoggedIn);
        assert_eq!(
            outcome.response.header("Location"),
            Some("http://192.168.50.1:8080/portal/status")
        );
        assert!(f.sessions.is_active_session(MAC));
        assert_eq!(firewall.list_authenticated(), vec![MAC]);

        let status = f
            .handler
            .handle(&request("GET /portal/status HTTP/1.1\r\nHost: 192.168.50.1\r\n\r\n", CLIENT))
            .await;
        assert_eq!(status.status, 200);
        assert!(status.body_text().contains("ann"));

        f.host.add_flow(IpAddr::V4(CLIENT), IpAddr::from([1, 1, 1, 1]));
        let outcome = f
            .handler
            .route(&request("POST /portal/logout HTTP/1.1\r\nHost: 192.168.50.1\r\n\r\n", CLIENT))
            .await;
        assert_eq!(outcome.decision, Decision::LoggedOut);
        assert!(!f.sessions.is_active_session(MAC));
        assert!(firewall.list_authenticated().is_empty());
        assert_eq!(f.host.flows_involving(IpAddr::V4(CLIENT)), 0);
    }

    #[tokio::test]
    async fn bad_password_shows_login_again() {
        let f = fixture(true);
        let outcome = f.handler.route(&request(&login_post("ann", "nope"), CLIENT)).await;
        assert_eq!(outcome.decision, Decision::LoginFailed);
        assert_eq!(outcome.response.status, 200);
        assert!(outcome.response.body_text().contains("Invalid username or password"));
        assert!(!f.sessions.is_active_session(MAC));
    }

    #[tokio::test]
    async fn register_creates_user_and_session() {
        let f = fixture(true);
        let body = "username=bob&password=s3cret";
        let raw = format!(
            "POST /portal/register HTTP/1.1\r\nHost: 192.168.50.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let outcome = f.handler.route(&request(&raw, CLIENT)).await;
        assert_eq!(outcome.decision, Decision::Registered);
        assert_eq!(f.users.len(), 2);
        assert_eq!(f.sessions.find_session(MAC).unwrap().username, "bob");
    }

    #[tokio::test]
    async fn failed_grant_leaves_no_session() {
        // Without the captive firewall there is no AUTHENTICATED chain.
        let f = fixture(false);
        let outcome = f.handler.route(&request(&login_post("ann", "hunter22"), CLIENT)).await;
        assert_eq!(outcome.decision, Decision::GrantFailed);
        assert_eq!(outcome.response.status, 503);
        assert!(!f.sessions.is_active_session(MAC));
    }

    #[tokio::test]
    async fn loopback_reaches_admin_api() {
        let f = fixture(true);
        f.sessions.create_session(MAC, Some(CLIENT), "ann");
        f.handler.context().firewall.grant(MAC).unwrap();

        let status = f
            .handler
            .handle(&request("GET /api/network/status HTTP/1.1\r\n\r\n", Ipv4Addr::LOCALHOST))
            .await;
        assert_eq!(status.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&status.body).unwrap();
        assert_eq!(body["state"], "up");
        assert_eq!(body["active"], true);

        let devices = f
            .handler
            .handle(&request("GET /api/device HTTP/1.1\r\n\r\n", Ipv4Addr::LOCALHOST))
            .await;
        let body: serde_json::Value = serde_json::from_slice(&devices.body).unwrap();
        assert_eq!(body["devices"][0], "aa:bb:cc:00:11:22");

        let missing = f
            .handler
            .handle(&request("GET /api/users HTTP/1.1\r\n\r\n", Ipv4Addr::LOCALHOST))
            .await;
        assert_eq!(missing.status, 404);

        let wrong_method = f
            .handler
            .handle(&request("GET /api/network/stop HTTP/1.1\r\n\r\n", Ipv4Addr::LOCALHOST))
            .await;
        assert_eq!(wrong_method.status, 405);

        let stop = f
            .handler
            .handle(&request("POST /api/network/stop HTTP/1.1\r\n\r\n", Ipv4Addr::LOCALHOST))
            .await;
        let body: serde_json::Value = serde_json::from_slice(&stop.body).unwrap();
        assert_eq!(body["active"], false);
        assert_eq!(f.host.rule_count(), 0);
    }

    #[tokio::test]
    async fn admin_start_runs_detached() {
        let f = fixture(false);
        let resp = f
            .handler
            .handle(&request("POST /api/network/start HTTP/1.1\r\n\r\n", Ipv4Addr::LOCALHOST))
            .await;
        assert_eq!(resp.status, 202);
        wait_until_up(&f.handler.context().orchestrator).await;
    }

    fn admin(raw: &str) -> HttpPetition {
        request(raw, Ipv4Addr::LOCALHOST)
    }

    async fn wait_until_up(orchestrator: &NetworkOrchestrator) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !orchestrator.status().active {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn network_restart_forgets_sessions() {
        let f = fixture(true);
        let orchestrator = f.handler.context().orchestrator.clone();
        let firewall = f.handler.context().firewall.clone();

        let outcome = f.handler.route(&request(&login_post("ann", "hunter22"), CLIENT)).await;
        assert_eq!(outcome.decision, Decision::LoggedIn);

        let stop = f.handler.handle(&admin("POST /api/network/stop HTTP/1.1\r\n\r\n")).await;
        assert_eq!(stop.status, 200);
        assert!(!f.sessions.is_active_session(MAC));

        let start = f.handler.handle(&admin("POST /api/network/start HTTP/1.1\r\n\r\n")).await;
        assert_eq!(start.status, 202);
        wait_until_up(&orchestrator).await;
        assert!(!firewall.has_internet_access(MAC));

        let probe = f.handler.handle(&request(GENERATE_204, CLIENT)).await;
        assert_eq!(probe.status, 302);
        let login = f
            .handler
            .handle(&request("GET /portal/login HTTP/1.1\r\nHost: 192.168.50.1\r\n\r\n", CLIENT))
            .await;
        assert_eq!(login.status, 200);
    }

    #[tokio::test]
    async fn admin_grant_and_revoke_keep_sessions_in_step() {
        let f = fixture(true);
        let firewall = f.handler.context().firewall.clone();

        let grant = f
            .handler
            .handle(&admin("POST /api/device/grant?mac=aa:bb:cc:00:11:22 HTTP/1.1\r\n\r\n"))
            .await;
        assert_eq!(grant.status, 200);
        assert_eq!(f.sessions.find_session(MAC).unwrap().username, ADMIN_USER);
        assert!(firewall.has_internet_access(MAC));
        let probe = f.handler.handle(&request(GENERATE_204, CLIENT)).await;
        assert_eq!(probe.status, 204);

        let revoke = f
            .handler
            .handle(&admin(
                "POST /api/device/revoke?mac=aa:bb:cc:00:11:22&ip=192.168.50.23 HTTP/1.1\r\n\r\n",
            ))
            .await;
        assert_eq!(revoke.status, 200);
        assert!(!f.sessions.is_active_session(MAC));
        assert!(!firewall.has_internet_access(MAC));

        let bad = f
            .handler
            .handle(&admin("POST /api/device/grant?mac=nope HTTP/1.1\r\n\r\n"))
            .await;
        assert_eq!(bad.status, 400);
    }

    #[tokio::test]
    async fn visits_are_logged() {
        let f = fixture(false);
        f.handler.handle(&request(GENERATE_204, CLIENT)).await;
        let log = std::fs::read_to_string(f._tmp.path().join("portal").join("visits.log")).unwrap();
        assert!(log.contains("ip=192.168.50.23 mac=aa:bb:cc:00:11:22 uri=\"/generate_204\" decision=probe_redirect"));
    }

    struct Serial(Arc<PortalHandler>);

    #[async_trait]
    impl JobHandler<(HttpPetition, oneshot::Sender<HttpResponse>)> for Serial {
        async fn handle(&self, job: (HttpPetition, oneshot::Sender<HttpResponse>)) {
            let (req, reply) = job;
            let _ = reply.send(self.0.handle(&req).await);
        }
    }

    #[tokio::test]
    async fn later_request_sees_earlier_login_from_same_ip() {
        let f = fixture(true);
        let dispatcher = PeerDispatcher::<(HttpPetition, oneshot::Sender<HttpResponse>)>::new(
            Arc::new(Serial(f.handler.clone())),
            Duration::from_secs(5),
        );

        let (login_tx, login_rx) = oneshot::channel();
        let (probe_tx, probe_rx) = oneshot::channel();
        let peer = IpAddr::V4(CLIENT);
        dispatcher.submit(peer, (request(&login_post("ann", "hunter22"), CLIENT), login_tx));
        dispatcher.submit(peer, (request(GENERATE_204, CLIENT), probe_tx));

        assert_eq!(login_rx.await.unwrap().status, 302);
        assert_eq!(probe_rx.await.unwrap().status, 204);
    }
}
