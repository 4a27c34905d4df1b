//! Seal CLI - create, scale, upgrade and tear down kubeadm clusters over SSH.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lifecycle::remote::ssh::{OpenSshExecutor, SshOptions};
use lifecycle::scale_args::{self, ScaleArgs};
use lifecycle::types::Ssh;
use lifecycle::{
    Applier, BuildahImageService, ClusterError, ClusterStore, Clusterfile, Environment,
    RuntimeConfig,
};

/// Seal CLI - Kubernetes cluster lifecycle over SSH.
#[derive(Parser)]
#[command(name = "seal")]
#[command(about = "Create, scale and delete kubeadm clusters")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Local cluster root (or set `SEALOS_RUNTIME_ROOT`).
    #[arg(long, global = true)]
    cluster_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the cluster described by a Clusterfile.
    Apply {
        /// Path to the Clusterfile.
        #[arg(short, long, default_value = "Clusterfile")]
        file: PathBuf,
    },

    /// Join hosts to an existing cluster.
    Add {
        /// Masters to join (comma-separated, IPv4 ranges allowed).
        #[arg(long, default_value = "")]
        masters: String,

        /// Nodes to join (comma-separated, IPv4 ranges allowed).
        #[arg(long, default_value = "")]
        nodes: String,

        /// Cluster name.
        #[arg(long, default_value = "default")]
        cluster: String,

        /// SSH user for the new hosts.
        #[arg(short, long)]
        user: Option<String>,

        /// SSH private key for the new hosts.
        #[arg(long)]
        pk: Option<String>,

        /// SSH port for the new hosts.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Remove hosts from an existing cluster.
    Delete {
        /// Masters to remove (comma-separated, IPv4 ranges allowed).
        #[arg(long, default_value = "")]
        masters: String,

        /// Nodes to remove (comma-separated, IPv4 ranges allowed).
        #[arg(long, default_value = "")]
        nodes: String,

        /// Cluster name.
        #[arg(long, default_value = "default")]
        cluster: String,

        /// Skip the confirmation prompt.
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Move the cluster to a new Kubernetes rootfs image.
    Upgrade {
        /// Rootfs image to upgrade to, e.g. `labring/kubernetes:v1.28.2`.
        image: String,

        /// Cluster name.
        #[arg(long, default_value = "default")]
        cluster: String,

        /// Skip the confirmation prompt.
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Tear the whole cluster down.
    Reset {
        /// Cluster name.
        #[arg(long, default_value = "default")]
        cluster: String,

        /// Skip the confirmation prompt.
        #[arg(long, default_value = "false")]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = RuntimeConfig::from_env();
    if let Some(root) = cli.cluster_root {
        config = config.with_cluster_root(root);
    }

    let result = match cli.command {
        Commands::Apply { file } => apply(config, &file).await,
        Commands::Add {
            masters,
            nodes,
            cluster,
            user,
            pk,
            port,
        } => {
            let ssh = (user.is_some() || pk.is_some() || port.is_some()).then(|| Ssh {
                user: user.unwrap_or_default(),
                pk,
                port,
                ..Ssh::default()
            });
            let args = ScaleArgs { masters, nodes, ssh };
            add(config, &cluster, &args).await
        }
        Commands::Delete {
            masters,
            nodes,
            cluster,
            force,
        } => {
            let args = ScaleArgs {
                masters,
                nodes,
                ssh: None,
            };
            delete(config, &cluster, &args, force).await
        }
        Commands::Upgrade {
            image,
            cluster,
            force,
        } => upgrade(config, &cluster, &image, force).await,
        Commands::Reset { cluster, force } => reset(config, &cluster, force).await,
    };

    match result {
        Err(e) if e.downcast_ref::<ClusterError>().is_some_and(ClusterError::is_cancelled) => {
            ui::print_warning("Operation cancelled.");
            Ok(())
        }
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

async fn apply(config: RuntimeConfig, file: &Path) -> Result<()> {
    let desired = Clusterfile::read(file)
        .with_context(|| format!("Failed to read Clusterfile {}", file.display()))?;
    ui::print_section(&format!("Applying cluster {}", desired.cluster.name()));
    run_apply(config, desired).await
}

async fn add(config: RuntimeConfig, name: &str, args: &ScaleArgs) -> Result<()> {
    let mut desired = load_record(&config, name)?;
    scale_args::verify_and_set_nodes(&mut desired.cluster, args)?;
    ui::print_section(&format!("Joining hosts to cluster {name}"));
    run_apply(config, desired).await
}

async fn delete(config: RuntimeConfig, name: &str, args: &ScaleArgs, force: bool) -> Result<()> {
    let mut desired = load_record(&config, name)?;
    scale_args::delete_nodes(&mut desired.cluster, args)?;
    confirm(
        &format!("Remove hosts from cluster {name}? Their Kubernetes state will be reset"),
        force,
    )?;
    ui::print_section(&format!("Removing hosts from cluster {name}"));
    run_apply(config, desired).await
}

async fn upgrade(config: RuntimeConfig, name: &str, image: &str, force: bool) -> Result<()> {
    let mut desired = load_record(&config, name)?;
    desired.cluster.replace_rootfs_image(image)?;
    confirm(
        &format!("Upgrade cluster {name} to {image}? Every node is cordoned in turn"),
        force,
    )?;
    ui::print_section(&format!("Upgrading cluster {name} to {image}"));
    run_apply(config, desired).await
}

async fn reset(config: RuntimeConfig, name: &str, force: bool) -> Result<()> {
    let record = load_record(&config, name)?;
    confirm(&format!("Reset every host of cluster {name}?"), force)?;
    ui::print_section(&format!("Resetting cluster {name}"));

    let env = environment(config, &[&record])?;
    let mut applier = Applier::new(env, record)?;
    applier.delete().await?;
    ui::print_success(&format!("Cluster {name} deleted"));
    Ok(())
}

/// Apply `desired`, reaching both the recorded and the desired hosts.
async fn run_apply(config: RuntimeConfig, desired: Clusterfile) -> Result<()> {
    let name = desired.cluster.name().to_string();
    let current = ClusterStore::new(config.paths(&name))
        .load()
        .context("Failed to load cluster record")?;
    let mut clusters = vec![&desired];
    clusters.extend(current.as_ref());
    let env = environment(config, &clusters)?;

    let mut applier = Applier::new(env, desired)?;
    applier.apply().await?;

    let cluster = applier.cluster();
    info!(
        cluster = %name,
        masters = cluster.master_ips().len(),
        nodes = cluster.node_ips().len(),
        "cluster applied"
    );
    ui::print_success(&format!("Cluster {name} applied"));
    Ok(())
}

fn environment(config: RuntimeConfig, files: &[&Clusterfile]) -> Result<Environment> {
    let clusters: Vec<_> = files.iter().map(|f| &f.cluster).collect();
    let executor = OpenSshExecutor::for_clusters(&clusters, SshOptions::default())
        .context("Failed to prepare SSH credentials")?;
    Ok(Environment {
        config,
        executor: Arc::new(executor),
        images: Arc::new(BuildahImageService::default()),
    })
}

fn load_record(config: &RuntimeConfig, name: &str) -> Result<Clusterfile> {
    ClusterStore::new(config.paths(name))
        .load()
        .context("Failed to load cluster record")?
        .with_context(|| format!("Cluster {name} not found; run `seal apply` first"))
}

fn confirm(prompt: &str, force: bool) -> Result<()> {
    if force {
        return Ok(());
    }
    let proceed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    if proceed {
        Ok(())
    } else {
        Err(ClusterError::Cancelled.into())
    }
}

mod ui {
    use colored::Colorize;

    /// Print a section header.
    pub fn print_section(title: &str) {
        println!();
        println!("{}", "═".repeat(70).bright_black());
        println!("{}", title.cyan().bold());
        println!("{}", "═".repeat(70).bright_black());
        println!();
    }

    pub fn print_success(message: &str) {
        println!("{} {}", "✓".green().bold(), message.green());
    }

    pub fn print_warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message.yellow());
    }

    pub fn print_error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message.red());
    }
}
