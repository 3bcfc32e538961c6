use std::path::Path;

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_log::LogTracer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::targets::T_NET;

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Keeps the non-blocking file writers alive; drop it last.
pub struct LoggingGuards {
    _file_guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber: stdout, `<root>/logs/<component>.log`
/// and `<root>/logs/net.log`. File output is skipped with a warning when the
/// log directory cannot be created.
pub fn init(component: &str, root: &Path, cfg: &LoggingConfig) -> Result<LoggingGuards> {
    let (filter_layer, handle) = reload::Layer::new(build_filter(cfg));
    let _ = RELOAD.set(handle);

    let registry = tracing_subscriber::registry()
        .with(filter_layer)
        .with(ErrorLayer::default())
        .with(fmt::layer().with_thread_ids(true).with_line_number(true).compact());

    let log_dir = root.join("logs");
    let prepared = prepare_dir(&log_dir);
    let mut guards = Vec::new();

    match &prepared {
        Err(_) => registry.try_init().ok(),
        Ok(_) => {
            let own = Targets::new()
                .with_default(LevelFilter::TRACE)
                .with_target(T_NET, LevelFilter::OFF);
            let (component_layer, guard) = file_layer(&log_dir, &component_log_name(component), own);
            guards.push(guard);

            let net = Targets::new().with_target(T_NET, LevelFilter::TRACE);
            let (net_layer, guard) = file_layer(&log_dir, "net.log", net);
            guards.push(guard);

            registry.with(component_layer).with(net_layer).try_init().ok()
        }
    };
    // `log` records from hotgate-net reach tracing through this bridge.
    let _ = LogTracer::init();

    match prepared {
        Err(err) => tracing::warn!("File logging disabled ({}): {}", log_dir.display(), err),
        Ok(Some(note)) => tracing::warn!("{note}"),
        Ok(None) => {}
    }

    Ok(LoggingGuards {
        _file_guards: guards,
    })
}

/// Creates the log directory; `Ok(Some(_))` carries a non-fatal note.
fn prepare_dir(log_dir: &Path) -> std::io::Result<Option<String>> {
    std::fs::create_dir_all(log_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::Permissions::from_mode(0o2750);
        if let Err(err) = std::fs::set_permissions(log_dir, mode) {
            return Ok(Some(format!(
                "Could not restrict {}: {}",
                log_dir.display(),
                err
            )));
        }
    }
    Ok(None)
}

fn file_layer<S>(
    log_dir: &Path,
    filename: &str,
    targets: Targets,
) -> (impl Layer<S> + Send + Sync, WorkerGuard)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, filename));
    let layer = fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .compact()
        .with_writer(writer)
        .with_filter(targets);
    (layer, guard)
}

/// Swaps the active level filter, e.g. after the config file changed.
pub fn apply(cfg: &LoggingConfig) -> Result<()> {
    RELOAD
        .get()
        .ok_or_else(|| anyhow!("logging not initialized"))?
        .reload(build_filter(cfg))?;
    Ok(())
}

fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    if !cfg.enabled {
        return EnvFilter::new("off");
    }
    EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub(crate) fn component_log_name(component: &str) -> String {
    let short = component.strip_prefix("hotgate-").unwrap_or(component);
    format!("{short}.log")
}
