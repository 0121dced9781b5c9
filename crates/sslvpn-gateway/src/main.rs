//! sslvpn-gateway
//!
//! Runs the SSL VPN data-plane: TUN diagnostics, NAT rule management and the
//! IP/MAC reservation table.

#[cfg(not(target_os = "linux"))]
compile_error!("sslvpn-gateway only supports Linux");

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use sslvpn_core::firewall::{parse_rule_spec, rules, RULE_TAG};
use sslvpn_core::{GatewayConfig, IpMap, IpMapTable, JsonIpMapStore, KernelGateway};

const DEFAULT_CONFIG: &str = "/etc/sslvpn/gateway.toml";

#[derive(Parser)]
#[command(name = "sslvpn-gateway")]
#[command(version)]
#[command(about = "SSL VPN gateway data-plane")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the startup diagnostic, apply NAT rules and wait for Ctrl-C
    Serve {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate the configuration and check that TUN devices can be created
    Check {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Manage the gateway's tagged NAT/FORWARD rules
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,

        /// Path to the TOML configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG, global = true)]
        config: PathBuf,
    },
    /// Manage IP/MAC reservations
    IpMap {
        #[command(subcommand)]
        action: IpMapAction,

        /// Path to the TOML configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG, global = true)]
        config: PathBuf,
    },
    /// Print the tokens of an `iptables -S` rule line
    ParseRule {
        /// Rule line, e.g. '-A FORWARD -m comment --comment "SSLVPN" -j ACCEPT'
        line: String,
    },
}

#[derive(Subcommand)]
enum FirewallAction {
    /// Add the NAT and FORWARD rules unless present
    Reconcile,
    /// Remove every rule tagged by the gateway
    Cleanup,
}

#[derive(Subcommand)]
enum IpMapAction {
    /// Add a reservation, or update it when --id is given
    Set {
        /// Reserved client address
        #[arg(long)]
        ip: String,

        /// Bound MAC address (any of aa:bb:.., aa-bb-.., aabb.ccdd.eeff)
        #[arg(long, default_value = "")]
        mac: String,

        /// User the address is bound to
        #[arg(long, default_value = "")]
        username: String,

        /// Keep the address bound to the user between sessions (requires --username)
        #[arg(long)]
        keep: bool,

        #[arg(long, default_value = "")]
        note: String,

        /// Id of the reservation to update
        #[arg(long, default_value = "0")]
        id: u64,
    },
    /// List reservations
    List,
    /// Delete a reservation by id
    Delete {
        #[arg(long)]
        id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Serve { config } => run_serve(&config).await,
        Command::Check { config } => run_check(&config).await,
        Command::Firewall { action, config } => run_firewall(action, &config).await,
        Command::IpMap { action, config } => run_ip_map(action, &config),
        Command::ParseRule { line } => {
            print_rule_tokens(&line);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    let config = GatewayConfig::load(path)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration {}: {}", path.display(), e))?;
    Ok(config)
}

fn open_gateway(path: &Path) -> Result<KernelGateway> {
    let config = load_config(path)?;
    KernelGateway::kernel(config).context("Failed to initialize gateway")
}

/// Run the gateway until Ctrl-C.
async fn run_serve(config_path: &Path) -> Result<()> {
    let gateway = open_gateway(config_path)?;
    let config = gateway.config().await;

    gateway
        .startup_check()
        .await
        .context("TUN startup check failed")?;

    log::info!("SSL VPN gateway data-plane ready:");
    log::info!("  Network: {}", config.ipv4_cidr);
    log::info!("  Gateway IP: {}", config.ipv4_gateway);
    log::info!("  Pool: {} - {}", config.ipv4_start, config.ipv4_end);
    log::info!("  Egress: {} (NAT {})", config.ipv4_master, if config.iptables_nat { "on" } else { "off" });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down");
    gateway.shutdown().await;
    Ok(())
}

async fn run_check(config_path: &Path) -> Result<()> {
    let gateway = open_gateway(config_path)?;
    gateway
        .links()
        .check_tun()
        .await
        .context("TUN check failed")?;
    println!("Configuration and TUN support OK");
    Ok(())
}

async fn run_firewall(action: FirewallAction, config_path: &Path) -> Result<()> {
    let gateway = open_gateway(config_path)?;
    let config = gateway.config().await;

    match action {
        FirewallAction::Reconcile => {
            gateway
                .firewall()
                .reconcile(&config)
                .await
                .context("Failed to apply NAT rules")?;
            println!("NAT and FORWARD rules in place");
        }
        FirewallAction::Cleanup => {
            let removed = gateway
                .firewall()
                .cleanup()
                .await
                .context("Failed to clean up firewall rules")?;
            println!("Removed {} rule(s) tagged {}", removed, RULE_TAG);
        }
    }
    Ok(())
}

fn run_ip_map(action: IpMapAction, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let store = JsonIpMapStore::open(&config.ip_map_file).with_context(|| {
        format!(
            "Failed to open reservation table {}",
            config.ip_map_file.display()
        )
    })?;
    let table = IpMapTable::new(store);

    match action {
        IpMapAction::Set {
            ip,
            mac,
            username,
            keep,
            note,
            id,
        } => {
            let stored = table
                .set_ip_map(IpMap {
                    id,
                    ip_addr: ip,
                    mac_addr: mac,
                    username,
                    keep,
                    note,
                    ..Default::default()
                })
                .context("Failed to save reservation")?;
            println!(
                "#{} {} {} {}",
                stored.id, stored.ip_addr, stored.mac_addr, stored.username
            );
        }
        IpMapAction::List => {
            for r in table.list().context("Failed to list reservations")? {
                println!(
                    "#{:<4} {:<15} {} {:<16} keep={} {}",
                    r.id, r.ip_addr, r.mac_addr, r.username, r.keep, r.note
                );
            }
        }
        IpMapAction::Delete { id } => {
            if table.delete(id).context("Failed to delete reservation")? {
                println!("Deleted reservation #{}", id);
            } else {
                anyhow::bail!("No reservation with id {}", id);
            }
        }
    }
    Ok(())
}

fn print_rule_tokens(line: &str) {
    if rules::is_chain_rule(line) {
        println!("(chain declaration, not a rule)");
        return;
    }
    let tokens = parse_rule_spec(line);
    if tokens.is_empty() {
        println!("(not a rule line)");
        return;
    }
    for token in &tokens {
        println!("{}", token);
    }
    if rules::has_comment_tag(&tokens, RULE_TAG) {
        println!("(tagged {})", RULE_TAG);
    }
}
