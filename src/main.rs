//! tunnelctl - provision and operate router tunnels

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnelctl::app::App;
use tunnelctl::config::AppConfig;
use tunnelctl_pki::{render_server_config, CertificateRepository, Subject};
use tunnelctl_provision::{HealthMonitor, HealthStatus, RouterId, RouterRepository};

/// Router tunnel provisioning and operations
#[derive(Parser, Debug)]
#[command(name = "tunnelctl")]
#[command(about = "Provision and operate router tunnels", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./tunnelctl.yml when present)
    #[arg(short, long, env = "TUNNELCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Same as --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage certificate authorities
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },
    /// Manage router records
    Router {
        #[command(subcommand)]
        command: RouterCommands,
    },
    /// Assign an address, issue a certificate and bind them
    Provision { router_id: RouterId },
    /// Revoke the router's certificate and release its address
    Deprovision { router_id: RouterId },
    /// Rotate the router's certificate
    Reprovision { router_id: RouterId },
    /// Print the client profile for a provisioned router
    ClientConfig {
        router_id: RouterId,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the tunnel server configuration
    ServerConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List connected clients
    Status,
    /// Aggregate server traffic
    Stats,
    /// Drop a connected client
    Kill { common_name: String },
    /// Check that the management interface answers
    Ping,
    /// Send a Disconnect-Request for a session
    Disconnect {
        /// Session user name
        #[arg(long, required_unless_present = "mac", conflicts_with = "mac")]
        user: Option<String>,
        /// Device hardware address
        #[arg(long)]
        mac: Option<String>,
        #[arg(long)]
        nas_ip: Option<Ipv4Addr>,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Change a session's rate limit or timeout
    Coa {
        user: String,
        /// MikroTik rate limit, e.g. 10M/10M
        #[arg(long)]
        rate_limit: Option<String>,
        /// Seconds
        #[arg(long)]
        session_timeout: Option<u32>,
        #[arg(long)]
        nas_ip: Option<Ipv4Addr>,
    },
    /// Reconcile tunnel state, in the background or once
    Monitor {
        /// Run every check once and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CaCommands {
    /// Create a CA and make it the active issuer
    Create {
        name: String,
        #[arg(long)]
        common_name: Option<String>,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long)]
        country: Option<String>,
        /// Validity in days
        #[arg(long)]
        days: Option<u32>,
    },
    /// List certificate authorities
    List,
    /// Make a CA the active issuer
    Activate { name: String },
    /// Print the revocation list of a CA (the configured one by default)
    Crl {
        name: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Issue the tunnel server certificate and write the server material
    ServerCert {
        common_name: String,
        /// Defaults to the server profile's material directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum RouterCommands {
    /// Register a router
    Add { name: String },
    /// List routers
    List,
    /// Show one router
    Show { router_id: RouterId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    init_logging(log_level)?;

    let config = AppConfig::load(cli.config.as_deref())?;
    let app = App::open(config).await?;

    match cli.command {
        Commands::Ca { command } => handle_ca_command(&app, command).await,
        Commands::Router { command } => handle_router_command(&app, command).await,
        Commands::Provision { router_id } => {
            let outcome = app.orchestrator().provision(router_id).await;
            app.persist().await?;
            let result = outcome?;
            println!("✅ Router {} provisioned", router_id);
            println!("   Address:     {}", result.address);
            println!("   Common name: {}", result.common_name);
            println!("   Serial:      {}", result.serial_number);
            if let Some(replaced) = result.replaced_serial {
                println!("   Replaced:    {}", replaced);
            }
            Ok(())
        }
        Commands::Deprovision { router_id } => {
            let outcome = app.orchestrator().deprovision(router_id).await;
            app.persist().await?;
            if outcome? {
                println!("✅ Router {} deprovisioned", router_id);
            } else {
                println!("Router {} was not provisioned", router_id);
            }
            Ok(())
        }
        Commands::Reprovision { router_id } => {
            let outcome = app.orchestrator().reprovision(router_id).await;
            app.persist().await?;
            let result = outcome?;
            println!(
                "✅ Router {} reprovisioned at {} (serial {})",
                router_id, result.address, result.serial_number
            );
            Ok(())
        }
        Commands::ClientConfig { router_id, output } => {
            let profile = app.client_config(router_id).await?;
            write_output(output.as_deref(), &profile).await
        }
        Commands::ServerConfig { output } => {
            let profile = render_server_config(&app.config().server);
            write_output(output.as_deref(), &profile).await
        }
        Commands::Status => {
            let clients = app.management().get_connected_clients().await?;
            if clients.is_empty() {
                println!("No connected clients");
                return Ok(());
            }
            println!(
                "{:<32} {:<22} {:<15} {:>12} {:>12}  SINCE",
                "COMMON NAME", "REAL ADDRESS", "VIRTUAL", "RX", "TX"
            );
            for client in clients {
                let virtual_address = client
                    .virtual_address
                    .map(|address| address.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<32} {:<22} {:<15} {:>12} {:>12}  {}",
                    client.common_name,
                    client.real_address,
                    virtual_address,
                    client.bytes_received,
                    client.bytes_sent,
                    client.connected_since
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = app.management().get_server_stats().await?;
            println!("Connected clients: {}", stats.connected_clients);
            println!("Bytes in:          {}", stats.bytes_in);
            println!("Bytes out:         {}", stats.bytes_out);
            Ok(())
        }
        Commands::Kill { common_name } => {
            if app.management().kill_client(&common_name).await? {
                println!("✅ Killed {}", common_name);
            } else {
                println!("No session for {}", common_name);
            }
            Ok(())
        }
        Commands::Ping => {
            let management = app.management();
            if management.ping().await {
                println!("✅ Management interface at {} is up", management.address());
                Ok(())
            } else {
                anyhow::bail!("Management interface at {} is unreachable", management.address())
            }
        }
        Commands::Disconnect {
            user,
            mac,
            nas_ip,
            session_id,
        } => {
            let coa = app.coa()?;
            let (subject, acknowledged) = match (user, mac) {
                (Some(user), _) => {
                    let acknowledged = coa
                        .disconnect_by_identity(&user, nas_ip, session_id.as_deref())
                        .await?;
                    (user, acknowledged)
                }
                (None, Some(mac)) => {
                    let acknowledged = coa.disconnect_by_hardware_address(&mac, nas_ip).await?;
                    (mac, acknowledged)
                }
                (None, None) => anyhow::bail!("Give --user or --mac"),
            };
            report_acknowledgement("Disconnect", &subject, acknowledged)
        }
        Commands::Coa {
            user,
            rate_limit,
            session_timeout,
            nas_ip,
        } => {
            let acknowledged = app
                .coa()?
                .change_session_attributes(&user, rate_limit.as_deref(), session_timeout, nas_ip)
                .await?;
            report_acknowledgement("CoA", &user, acknowledged)
        }
        Commands::Monitor { once } => run_monitor(&app, once).await,
    }
}

async fn handle_ca_command(app: &App, command: CaCommands) -> Result<()> {
    let pki = app.pki();
    let configured = &app.config().pki;

    match command {
        CaCommands::Create {
            name,
            common_name,
            organization,
            country,
            days,
        } => {
            let defaults = &configured.ca_subject;
            let subject = Subject::new(
                common_name.unwrap_or_else(|| defaults.common_name.clone()),
                organization.unwrap_or_else(|| defaults.organization.clone()),
                country.unwrap_or_else(|| defaults.country.clone()),
            );

            info!("Creating certificate authority '{}', this may take a while", name);
            let ca = pki.create_ca(&name, subject, days).await?;
            app.persist().await?;

            println!("✅ Certificate authority '{}' created", ca.name);
            println!("   ID:          {}", ca.id);
            println!("   Valid until: {}", ca.valid_until.to_rfc3339());
            if ca.name != configured.ca_name {
                warn!(
                    "Provisioning is configured to use '{}', not '{}'",
                    configured.ca_name, ca.name
                );
            }
            Ok(())
        }
        CaCommands::List => {
            let authorities = pki.repository().list_authorities().await?;
            if authorities.is_empty() {
                println!("No certificate authorities");
                return Ok(());
            }
            println!("{:<8} {:<30} {:<27} ID", "ACTIVE", "NAME", "VALID UNTIL");
            for ca in authorities {
                println!(
                    "{:<8} {:<30} {:<27} {}",
                    if ca.is_active { "yes" } else { "" },
                    ca.name,
                    ca.valid_until.to_rfc3339(),
                    ca.id
                );
            }
            Ok(())
        }
        CaCommands::Activate { name } => {
            let ca = pki.activate_ca(&name).await?;
            app.persist().await?;
            println!("✅ Certificate authority '{}' is now active", ca.name);
            if ca.name != configured.ca_name {
                warn!(
                    "Provisioning is configured to use '{}'; update pki.ca_name to issue from '{}'",
                    configured.ca_name, ca.name
                );
            }
            Ok(())
        }
        CaCommands::Crl { name, output } => {
            let name = name.unwrap_or_else(|| configured.ca_name.clone());
            let ca = pki
                .repository()
                .find_authority(&name)
                .await?
                .with_context(|| format!("Certificate authority '{}' not found", name))?;
            let crl = pki.generate_crl(&ca).await?;
            write_output(output.as_deref(), &crl).await
        }
        CaCommands::ServerCert {
            common_name,
            output_dir,
        } => {
            let outcome = app
                .write_server_material(&common_name, output_dir.as_deref())
                .await;
            app.persist().await?;
            let (certificate, dir) = outcome?;

            println!(
                "✅ Server certificate for {} written to {:?} (serial {})",
                common_name, dir, certificate.serial_number
            );
            Ok(())
        }
    }
}

async fn handle_router_command(app: &App, command: RouterCommands) -> Result<()> {
    let routers = app.routers();

    match command {
        RouterCommands::Add { name } => {
            let router = routers.create(&name).await?;
            app.persist().await?;
            println!("✅ Router '{}' registered with id {}", router.name, router.id);
            Ok(())
        }
        RouterCommands::List => {
            let all = routers.list().await?;
            if all.is_empty() {
                println!("No routers");
                return Ok(());
            }
            println!(
                "{:<6} {:<24} {:<12} {:<15} LAST SEEN",
                "ID", "NAME", "PROVISIONED", "ADDRESS"
            );
            for router in all {
                println!(
                    "{:<6} {:<24} {:<12} {:<15} {}",
                    router.id,
                    router.name,
                    if router.provisioned { "yes" } else { "no" },
                    router
                        .vpn_address
                        .map(|address| address.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    router
                        .last_seen
                        .map(|seen| seen.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
            Ok(())
        }
        RouterCommands::Show { router_id } => {
            let router = routers
                .get(router_id)
                .await?
                .with_context(|| format!("Router {} not found", router_id))?;
            let orchestrator = app.orchestrator();

            println!("Router {} ({})", router.id, router.name);
            println!("  Provisioned: {}", router.provisioned);
            if let Some(at) = router.provisioned_at {
                println!("  Since:       {}", at.to_rfc3339());
            }
            if let Some(address) = router.vpn_address {
                println!("  Address:     {}", address);
            }
            println!(
                "  Common name: {}",
                orchestrator.current_common_name(&router).await?
            );
            if let Some(certificate) = orchestrator.active_certificate(&router).await? {
                println!("  Serial:      {}", certificate.serial_number);
                println!(
                    "  Expires:     {} ({} days)",
                    certificate.valid_until.to_rfc3339(),
                    certificate.days_until_expiry(chrono::Utc::now())
                );
            }
            if let Some(seen) = router.last_seen {
                println!("  Last seen:   {}", seen.to_rfc3339());
            }
            Ok(())
        }
    }
}

async fn run_monitor(app: &App, once: bool) -> Result<()> {
    let monitor = Arc::new(HealthMonitor::new(
        app.config().monitor.clone(),
        app.orchestrator().clone(),
        Arc::new(app.management()),
    ));

    if once {
        let report = monitor.reconcile().await;
        let health = monitor.check_health().await;
        let expired = monitor.expire_certificates().await;
        app.persist().await?;

        let report = report?;
        println!(
            "Provisioned: {}  Connected: {}  Clients: {}",
            report.provisioned, report.connected, report.clients_total
        );
        for event in &report.events {
            println!("  ⚠️  {}", event);
        }
        match health {
            HealthStatus::Healthy { stats } => println!(
                "Server healthy: {} clients, {} bytes in, {} bytes out",
                stats.connected_clients, stats.bytes_in, stats.bytes_out
            ),
            HealthStatus::Unhealthy { reason } => println!("Server unhealthy: {}", reason),
        }
        let expired = expired?;
        if !expired.is_empty() {
            println!("Marked {} certificates expired", expired.len());
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = monitor.spawn(shutdown_rx);

    let mut save = tokio::time::interval(Duration::from_secs(60));
    save.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down monitor");
                break;
            }
            _ = save.tick() => {
                if let Err(e) = app.persist().await {
                    error!("Failed to save state: {:#}", e);
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.await {
        error!("Monitor task failed: {}", e);
    }
    app.persist().await
}

fn report_acknowledgement(kind: &str, subject: &str, acknowledged: bool) -> Result<()> {
    if acknowledged {
        println!("✅ {} acknowledged for {}", kind, subject);
        Ok(())
    } else {
        anyhow::bail!("{} for {} was not acknowledged", kind, subject)
    }
}

async fn write_output(path: Option<&Path>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            tokio::fs::write(path, content)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            info!("Wrote {:?}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
