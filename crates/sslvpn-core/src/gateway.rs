//! Gateway data-plane facade.
//!
//! [`Gateway`] owns the configuration, the per-session [`LinkManager`], the
//! [`FirewallManager`] and the shared payload pool. The process calls
//! [`Gateway::startup_check`] once before accepting sessions and
//! [`Gateway::shutdown`] on exit.

use crate::buffer::PayloadPool;
use crate::command::{CommandRunner, SystemCommand};
use crate::config::{ConfigValue, GatewayConfig, LinkMode};
use crate::device::{KernelTun, TunProvider};
use crate::error::{GatewayError, GatewayResult};
use crate::firewall::{FirewallManager, Iptables, RuleTable};
use crate::kmod::ModuleLoader;
use crate::link::{LinkHandle, LinkManager};
use crate::session::{OutboundDispatch, TunnelSession};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Kernel modules required for NAT.
const NAT_MODULES: [&str; 2] = ["iptable_filter", "iptable_nat"];

/// Gateway backed by the kernel and system commands.
pub type KernelGateway = Gateway<KernelTun, SystemCommand, Iptables<SystemCommand>>;

pub struct Gateway<P, R, T> {
    config: RwLock<GatewayConfig>,
    links: LinkManager<P, R>,
    firewall: FirewallManager<T>,
    modules: ModuleLoader,
}

impl KernelGateway {
    /// Gateway using `/dev/net/tun`, `ip`/`sysctl`/`modprobe` and `iptables`.
    pub fn kernel(config: GatewayConfig) -> GatewayResult<Self> {
        let runner = Arc::new(SystemCommand);
        Self::new(
            config,
            KernelTun,
            runner.clone(),
            Iptables::new(runner),
            ModuleLoader::default(),
        )
    }
}

impl<P, R, T> Gateway<P, R, T>
where
    P: TunProvider,
    R: CommandRunner,
    T: RuleTable,
{
    /// Validate `config` and assemble the gateway.
    pub fn new(
        config: GatewayConfig,
        provider: P,
        runner: Arc<R>,
        rules: T,
        modules: ModuleLoader,
    ) -> GatewayResult<Self> {
        config.validate().map_err(GatewayError::config)?;
        if config.link_mode != LinkMode::Tun {
            return Err(GatewayError::config(format!(
                "link mode '{}' is not supported by this data-plane",
                config.link_mode
            )));
        }

        let links = LinkManager::new(
            provider,
            runner,
            config.ipv4_gateway,
            Arc::new(PayloadPool::default()),
        );

        Ok(Self {
            config: RwLock::new(config),
            links,
            firewall: FirewallManager::new(rules),
            modules,
        })
    }

    /// Snapshot of the current configuration.
    pub async fn config(&self) -> GatewayConfig {
        self.config.read().await.clone()
    }

    pub fn links(&self) -> &LinkManager<P, R> {
        &self.links
    }

    pub fn firewall(&self) -> &FirewallManager<T> {
        &self.firewall
    }

    /// One-time startup diagnostic.
    ///
    /// Fails if no TUN device can be opened and brought up. With NAT enabled
    /// it then clears stale tagged rules and applies the current ones; rule
    /// failures there are logged, not fatal.
    pub async fn startup_check(&self) -> GatewayResult<()> {
        let runner = self.links.runner().as_ref();
        self.modules.ensure(runner, "tun").await;
        self.links.check_tun().await?;

        let config = self.config().await;
        if config.iptables_nat {
            self.ensure_nat_modules().await;
            if let Err(e) = self.firewall.prime(&config).await {
                log::error!("Failed to apply NAT rules: {}", e);
            }
        }
        Ok(())
    }

    /// Attach a session to a new TUN link.
    pub async fn link_session<S, D>(&self, session: Arc<S>, dispatch: Arc<D>) -> GatewayResult<LinkHandle>
    where
        S: TunnelSession,
        D: OutboundDispatch<S>,
    {
        self.links.link_tun(session, dispatch).await
    }

    /// Switch NAT on (reconcile) or off (cleanup).
    ///
    /// Firewall failures are logged; the new setting is recorded either way.
    pub async fn set_nat(&self, enabled: bool) {
        let mut config = self.config.write().await;
        self.apply_nat(&mut config, enabled).await;
    }

    /// Apply a runtime configuration change.
    ///
    /// The configuration stays locked for the whole update, so concurrent
    /// updates never start from the same snapshot. Toggling `iptables_nat`
    /// reconciles or cleans up the firewall.
    pub async fn update_config(&self, key: &str, value: ConfigValue) -> GatewayResult<()> {
        let mut config = self.config.write().await;
        let mut next = config.clone();
        next.apply_update(key, value).map_err(GatewayError::config)?;

        let enabled = next.iptables_nat;
        if enabled != config.iptables_nat {
            self.apply_nat(&mut next, enabled).await;
        }

        *config = next;
        log::info!("Configuration '{}' updated", key);
        Ok(())
    }

    /// Remove the gateway's firewall rules. Failures are logged.
    pub async fn shutdown(&self) {
        if !self.config.read().await.iptables_nat {
            return;
        }
        match self.firewall.cleanup().await {
            Ok(removed) => log::info!("Removed {} firewall rules", removed),
            Err(e) => log::error!("Firewall cleanup failed: {}", e),
        }
    }

    async fn apply_nat(&self, config: &mut GatewayConfig, enabled: bool) {
        if enabled {
            self.ensure_nat_modules().await;
            if let Err(e) = self.firewall.reconcile(config).await {
                log::error!("Failed to apply NAT rules: {}", e);
            }
        } else {
            match self.firewall.cleanup().await {
                Ok(removed) => log::info!("NAT disabled, removed {} rules", removed),
                Err(e) => log::error!("Firewall cleanup failed: {}", e),
            }
        }
        config.iptables_nat = enabled;
    }

    async fn ensure_nat_modules(&self) {
        let runner = self.links.runner().as_ref();
        for module in NAT_MODULES {
            self.modules.ensure(runner, module).await;
        }
    }
}
