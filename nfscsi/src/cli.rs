//! Command-line surface of `nfscsi`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use libnfscsi::config::BackendConfig;
use libnfscsi::{
    CapacityRange, ControllerConfig, CreateVolumeRequest, CsiController, CsiIdentity,
    NfsController, VolumeCapability, VolumeId,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "nfscsi", version, about = "Provision NFS-backed CSI volumes")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// YAML controller configuration; flags override its values.
    #[arg(long, global = true, env = "NFS_CSI_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, env = "NFS_CSI_DRIVER_NAME")]
    pub driver_name: Option<String>,

    #[arg(long, global = true, env = "NFS_CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Local directory the export is mounted on while provisioning.
    #[arg(long, global = true, env = "NFS_CSI_MOUNT_ROOT")]
    pub mount_root: Option<PathBuf>,

    #[arg(long, global = true, env = "NFS_CSI_MOUNT_TIMEOUT_SECS")]
    pub mount_timeout_secs: Option<u64>,

    /// NFS mount option, repeatable.
    #[arg(long = "mount-option", global = true, value_delimiter = ',')]
    pub mount_options: Vec<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a volume and print it as JSON.
    Create(CreateArgs),
    /// Delete a volume by id.
    Delete {
        volume_id: String,
        /// Export to mount for the removal.
        #[arg(long, requires = "share")]
        server: Option<String>,
        #[arg(long, requires = "server")]
        share: Option<String>,
    },
    /// Print plugin info and capabilities as JSON.
    Info,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub server: String,
    #[arg(long)]
    pub share: String,
    /// Requested size in bytes; 1 GiB when omitted.
    #[arg(long)]
    pub capacity: Option<i64>,
    /// Extra `key=value` parameter passed through to the volume context.
    #[arg(long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let Some((key, value)) = s.split_once('=') else {
        return Err(format!("invalid key=value: no `=` found in `{s}`"));
    };
    if key.is_empty() {
        return Err(format!("invalid key=value: empty key in `{s}`"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

impl GlobalArgs {
    /// YAML file (or defaults), then `NFS_CSI_*` environment, then flags.
    pub fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?
                .with_env(),
            None => ControllerConfig::from_env(),
        }
        .context("reading NFS_CSI_* environment")?;
        if let Some(name) = &self.driver_name {
            config.driver_name = name.clone();
        }
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(root) = &self.mount_root {
            config.mount_root = root.clone();
        }
        if let Some(secs) = self.mount_timeout_secs {
            config.mount_timeout_secs = secs;
        }
        if !self.mount_options.is_empty() {
            config.mount_options = self.mount_options.clone();
        }
        Ok(config)
    }
}

impl CreateArgs {
    pub fn into_request(self) -> CreateVolumeRequest {
        let mut parameters: HashMap<String, String> = self.params.into_iter().collect();
        parameters.insert("server".to_owned(), self.server);
        parameters.insert("share".to_owned(), self.share);
        CreateVolumeRequest {
            name: self.name,
            capacity_range: self.capacity.map(|required_bytes| CapacityRange {
                required_bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::default()],
            parameters,
        }
    }
}

#[derive(Serialize)]
struct InfoOutput {
    plugin: libnfscsi::PluginInfo,
    plugin_capabilities: Vec<libnfscsi::PluginCapability>,
    controller_capabilities: Vec<libnfscsi::ControllerServiceCapability>,
}

/// Cancel `token` on the first Ctrl-C so a hung mount does not pin the CLI.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight operation");
            token.cancel();
        }
    });
}

/// Run one command against a freshly built controller.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = cli.global.controller_config()?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    match cli.command {
        Command::Create(args) => {
            let controller = NfsController::from_config(&config)?;
            let volume = controller
                .create_volume_with_cancel(args.into_request(), &cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&volume)?);
        }
        Command::Delete {
            volume_id,
            server,
            share,
        } => {
            if let (Some(server), Some(share)) = (server, share) {
                config.default_backend = Some(BackendConfig { server, share });
            }
            let volume_id = VolumeId::from(volume_id);
            let controller = NfsController::from_config(&config)?;
            controller
                .delete_volume_with_cancel(&volume_id, &cancel)
                .await
                .with_context(|| format!("deleting {volume_id}"))?;
        }
        Command::Info => {
            let controller = NfsController::from_config(&config)?;
            let info = InfoOutput {
                plugin: controller.get_plugin_info().await?,
                plugin_capabilities: controller.get_plugin_capabilities().await?,
                controller_capabilities: controller.controller_get_capabilities().await?,
            };
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}
