//! `parrot run`: restore accounts, serve the control bot, shut down cleanly.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Result, bail},
    parrot_accounts::{
        AutoresponderService, platform::PlatformConnector, sender::Pacing,
        store_file::FileCredentialStore, templates::FileTemplates,
    },
    parrot_config::{ParrotConfig, validate::Severity},
    parrot_telegram::ControlContext,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

#[cfg(feature = "mtproto")]
fn platform_connector() -> Result<Arc<dyn PlatformConnector>> {
    Ok(Arc::new(parrot_telegram::MtprotoConnector::new()))
}

#[cfg(not(feature = "mtproto"))]
fn platform_connector() -> Result<Arc<dyn PlatformConnector>> {
    bail!("this build cannot connect accounts; rebuild with `--features mtproto`")
}

pub async fn handle_run(config: ParrotConfig) -> Result<()> {
    let validation = parrot_config::validate(&config, None);
    for d in &validation.diagnostics {
        match d.severity {
            Severity::Error => error!(path = %d.path, "{}", d.message),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
            Severity::Info => info!(path = %d.path, "{}", d.message),
        }
    }
    if validation.has_errors() {
        bail!("configuration has errors; run `parrot config check` for details");
    }

    let connector = platform_connector()?;
    let sessions_dir = parrot_config::sessions_dir(&config);
    info!(
        sessions_dir = %sessions_dir.display(),
        templates = %config.templates.path.display(),
        "starting autoresponder"
    );

    let service = Arc::new(AutoresponderService::new(
        Arc::new(FileCredentialStore::new(sessions_dir)),
        connector,
        Arc::new(FileTemplates::new(config.templates.path.clone())),
        Pacing::from(&config.sender),
    ));
    let restored = service.restore().await?;
    info!(
        loaded = restored.loaded,
        skipped = restored.skipped,
        started = restored.started,
        failed = restored.failed,
        "accounts restored"
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        on_signal.cancel();
    });

    supervise(&config, &service, &shutdown).await;

    service.shutdown().await;
    info!("parrot stopped");
    Ok(())
}

/// Keep the control bot running until shutdown, restarting it after a
/// backoff whenever it stops on its own.
async fn supervise(
    config: &ParrotConfig,
    service: &Arc<AutoresponderService>,
    shutdown: &CancellationToken,
) {
    let backoff = Duration::from_secs(config.supervisor.restart_backoff_secs);
    loop {
        let attempt = async {
            let control = parrot_telegram::connect(&config.telegram).await?;
            let ctx = ControlContext {
                service: Arc::clone(service),
                whitelist: config.telegram.whitelist.clone(),
                bot_username: control.username.clone(),
            };
            parrot_telegram::run_polling(&control.bot, &ctx, shutdown.clone()).await
        };

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return,
            outcome = attempt => outcome,
        };
        match outcome {
            Ok(()) => return,
            Err(e) => error!(
                error = %e,
                backoff_secs = backoff.as_secs(),
                "control bot stopped, restarting after backoff"
            ),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {},
        }
    }
}
