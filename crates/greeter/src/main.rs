//! # greeter
//!
//! Greeter server binary: loads settings and the agent directory, wires the
//! routing engine to the WebSocket transport, and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use greeter_router::{Collaborators, EventRouter, StaticBackend};
use greeter_server::{ConnectionHub, GreeterServer, ServerConfig};
use greeter_settings::GreeterSettings;

/// Greeter session engine server.
#[derive(Parser, Debug)]
#[command(name = "greeter", about = "Routes live-video greeting sessions between visitors and agents")]
struct Cli {
    /// Settings file (default `~/.greeter/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory file with orgs, pools, agents and tokens.
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn load_settings(&self) -> Result<GreeterSettings> {
        let mut settings = match &self.settings {
            Some(path) => greeter_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => greeter_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }
}

fn load_backend(path: Option<&Path>) -> Result<StaticBackend> {
    match path {
        Some(path) => StaticBackend::from_path(path)
            .with_context(|| format!("Failed to load directory from {}", path.display())),
        None => {
            tracing::warn!("no --directory given, every agent login will be rejected");
            Ok(StaticBackend::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;
    greeter_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = greeter_server::metrics::install_recorder().context("Failed to install metrics recorder")?;
    let backend = Arc::new(load_backend(args.directory.as_deref())?);

    let config = ServerConfig::from(&settings.server);
    let hub = Arc::new(ConnectionHub::new(config.max_connections, config.send_queue_size));
    let router = EventRouter::new(settings.routing.clone(), Collaborators::uniform(backend), hub.clone());
    let server = GreeterServer::new(config, router.clone(), hub, metrics);

    let sweep = router.spawn_staleness_sweep(server.shutdown().token());
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Greeter listening on http://{addr} (ws://{addr}/ws)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    router.shutdown();
    server.shutdown().graceful_shutdown(vec![handle, sweep], None).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_no_overrides() {
        let cli = Cli::parse_from(["greeter"]);
        assert!(cli.settings.is_none());
        assert!(cli.directory.is_none());
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn cli_paths() {
        let cli = Cli::parse_from(["greeter", "--settings", "/tmp/s.json", "--directory", "/tmp/d.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(cli.directory, Some(PathBuf::from("/tmp/d.json")));
    }

    #[test]
    fn flags_override_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 9000}, "routing": {"rnaTimeoutMs": 5000}}"#).unwrap();

        let cli = Cli::parse_from([
            "greeter",
            "--settings",
            path.to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--port",
            "0",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.routing.rna_timeout_ms, 5000);
    }

    #[test]
    fn invalid_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let cli = Cli::parse_from(["greeter", "--settings", path.to_str().unwrap()]);
        let err = cli.load_settings().unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[test]
    fn directory_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.json");
        let directory = serde_json::json!({
            "orgs": [{"orgId": "org-1"}],
            "agents": [{"agentId": "A1", "token": "t1", "orgId": "org-1"}]
        });
        std::fs::write(&path, directory.to_string()).unwrap();

        let backend = load_backend(Some(&path)).unwrap();
        assert_eq!(backend.directory().agents.len(), 1);
    }

    #[test]
    fn missing_directory_file_is_an_error() {
        let err = load_backend(Some(Path::new("/nonexistent/directory.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load directory"));
        assert!(load_backend(None).is_ok());
    }
}
