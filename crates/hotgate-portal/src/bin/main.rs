use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::signal;
use tokio::sync::Notify;

use hotgate_net::{
    shared, CommandExecutor, FirewallService, MacResolver, NetworkOrchestrator, SystemExecutor,
    SystemPaths, Timings,
};
use hotgate_portal::cli::{admin_request, Cli, Commands, RevokeArgs, ServeArgs};
use hotgate_portal::logging::PortalLogger;
use hotgate_portal::{
    HttpServer, InMemorySessionStore, InMemoryUserDirectory, PortalContext, PortalHandler,
    PortalSettings, ServerOptions,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root;

    let log_cfg = hotgate_logging::fs::read_config(&root);
    let _logging_guards = hotgate_logging::init("portal", &root, &log_cfg)?;
    if let Err(err) = hotgate_logging::run_retention(&root, &log_cfg) {
        tracing::warn!("Log retention failed: {err:#}");
    }

    let settings = PortalSettings::load(&root)?;
    let orchestrator = Arc::new(build_orchestrator(&root, &settings));

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => serve(&root, &settings, orchestrator, args).await,
        Commands::Start => {
            let (_, body) = admin_request(settings.port, "POST", "/api/network/start").await?;
            emit(&body)
        }
        Commands::Stop => match admin_request(settings.port, "POST", "/api/network/stop").await {
            Ok((_, body)) => emit(&body),
            Err(err) => {
                tracing::info!("Portal not reachable ({err:#}), restoring locally");
                let status = tokio::task::spawn_blocking(move || {
                    orchestrator.restore_configuration();
                    orchestrator.status()
                })
                .await
                .context("restoring network configuration")?;
                emit(&json!(status))
            }
        },
        Commands::Status => match admin_request(settings.port, "GET", "/api/network/status").await {
            Ok((_, body)) => emit(&body),
            Err(err) => {
                tracing::debug!("Portal not reachable: {err:#}");
                emit(&json!({ "server": "not running", "network": orchestrator.status() }))
            }
        },
        Commands::Grant(args) => {
            let path = format!("/api/device/grant?mac={}", args.mac);
            match admin_request(settings.port, "POST", &path).await {
                Ok((status, body)) => admin_result(status, &body),
                Err(err) => {
                    tracing::debug!("Portal not reachable ({err:#}), granting locally");
                    let firewall = orchestrator.firewall();
                    blocking(move || firewall.grant(args.mac).map_err(anyhow::Error::from)).await?;
                    emit(&json!({ "granted": args.mac }))
                }
            }
        }
        Commands::Revoke(RevokeArgs { mac, ip, no_force }) => {
            let mut path = format!("/api/device/revoke?mac={mac}&force={}", !no_force);
            if let Some(ip) = ip {
                path.push_str(&format!("&ip={ip}"));
            }
            match admin_request(settings.port, "POST", &path).await {
                Ok((status, body)) => admin_result(status, &body),
                Err(err) => {
                    tracing::debug!("Portal not reachable ({err:#}), revoking locally");
                    let firewall = orchestrator.firewall();
                    blocking(move || firewall.revoke(mac, ip, !no_force).map_err(anyhow::Error::from))
                        .await?;
                    emit(&json!({ "revoked": mac }))
                }
            }
        }
        Commands::Devices => {
            let firewall = orchestrator.firewall();
            let devices = blocking(move || Ok(firewall.list_authenticated())).await?;
            emit(&json!({ "devices": devices }))
        }
    }
}

fn build_orchestrator(root: &Path, settings: &PortalSettings) -> NetworkOrchestrator {
    let exec: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor);
    NetworkOrchestrator::new(
        exec,
        shared(settings.network_config()),
        SystemPaths::with_root(root),
        Timings::default(),
    )
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .context("joining firewall task")?
}

/// A running server owns the sessions, so device changes go through it.
fn admin_result(status: u16, body: &Value) -> Result<()> {
    emit(body)?;
    if !(200..300).contains(&status) {
        anyhow::bail!("portal answered {status}");
    }
    Ok(())
}

fn emit(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(
    root: &Path,
    settings: &PortalSettings,
    orchestrator: Arc<NetworkOrchestrator>,
    args: ServeArgs,
) -> Result<()> {
    tracing::info!("Hotgate portal starting");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Interface: {}", settings.interface);
    tracing::info!("  SSID: {}", settings.ssid);
    tracing::info!("  Gateway: {}:{}", settings.gateway, settings.port);

    let resolver: Arc<dyn MacResolver> = Arc::new(orchestrator.mac_resolver());
    let firewall: Arc<FirewallService> = Arc::new(orchestrator.firewall());
    let visits = PortalLogger::new(&root.join("portal"))?;
    let handler = Arc::new(PortalHandler::new(PortalContext {
        sessions: Arc::new(InMemorySessionStore::new()),
        users: Arc::new(InMemoryUserDirectory::new()),
        resolver,
        firewall,
        orchestrator: orchestrator.clone(),
        visits: Some(visits),
    }));

    let addr = SocketAddr::new(settings.bind, settings.port);
    let server = HttpServer::bind(addr, handler, ServerOptions::from(settings)).await?;

    if args.start_network {
        let orchestrator = orchestrator.clone();
        tokio::task::spawn_blocking(move || {
            if !orchestrator.set_up_network() {
                tracing::error!("Captive network did not come up");
            }
        });
    }

    let shutdown = Arc::new(Notify::new());
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown.notify_one();
    let _ = tokio::time::timeout(Duration::from_secs(5), server_task).await;

    if args.restore_on_exit {
        tokio::task::spawn_blocking(move || orchestrator.restore_configuration())
            .await
            .context("restoring network configuration")?;
    }

    tracing::info!("Portal shutdown complete");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                return;
            }
            Err(err) => tracing::warn!("SIGTERM handler unavailable: {err}"),
        }
    }
    std::future::pending::<()>().await
}
