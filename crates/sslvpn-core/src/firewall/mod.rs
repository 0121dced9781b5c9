//! NAT and FORWARD rule management.
//!
//! The gateway owns exactly two iptables rules, both tagged with
//! [`RULE_TAG`]:
//!
//! - `nat/POSTROUTING`: masquerade the client network behind the egress
//!   interface;
//! - `filter/FORWARD`: accept forwarded traffic.
//!
//! [`FirewallManager::reconcile`] adds them if absent; [`FirewallManager::cleanup`]
//! removes every tagged rule, including duplicates left by earlier runs.
//! Each list-then-modify sequence runs under the manager's lock.

pub mod rules;

use crate::command::{args, CommandRunner};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use rules::{has_comment_tag, is_chain_rule, parse_rule_spec, render_rule, RULE_TAG};

/// NAT table.
pub const NAT_TABLE: &str = "nat";
/// Filter table.
pub const FILTER_TABLE: &str = "filter";
/// Chain holding the masquerade rule.
pub const POSTROUTING: &str = "POSTROUTING";
/// Chain holding the forward-accept rule.
pub const FORWARD: &str = "FORWARD";

/// Chains inspected by cleanup.
const MANAGED_CHAINS: [(&str, &str); 2] = [(NAT_TABLE, POSTROUTING), (FILTER_TABLE, FORWARD)];

/// Access to the kernel's rule tables.
pub trait RuleTable: Send + Sync + 'static {
    /// Rules of `chain` in `iptables -S` form.
    fn list(
        &self,
        table: &str,
        chain: &str,
    ) -> impl Future<Output = GatewayResult<Vec<String>>> + Send;

    /// Whether a rule with exactly this specification exists.
    fn exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> impl Future<Output = GatewayResult<bool>> + Send;

    fn append(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    fn delete(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> impl Future<Output = GatewayResult<()>> + Send;
}

/// [`RuleTable`] driving the `iptables` command.
pub struct Iptables<R> {
    runner: Arc<R>,
}

impl<R: CommandRunner> Iptables<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    async fn iptables(&self, table: &str, op: &str, chain: &str, spec: &[String]) -> GatewayResult<String> {
        let mut argv = args(["-w", "-t", table, op, chain]);
        argv.extend(spec.iter().cloned());

        let output = self.runner.run("iptables", &argv).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(GatewayError::Firewall(format!(
                "iptables {} failed: {}",
                argv.join(" "),
                output.stderr.trim()
            )))
        }
    }
}

impl<R: CommandRunner> RuleTable for Iptables<R> {
    async fn list(&self, table: &str, chain: &str) -> GatewayResult<Vec<String>> {
        let stdout = self.iptables(table, "-S", chain, &[]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> GatewayResult<bool> {
        let mut argv = args(["-w", "-t", table, "-C", chain]);
        argv.extend(spec.iter().cloned());
        // `-C` exits non-zero when the rule is missing.
        let output = self.runner.run("iptables", &argv).await?;
        Ok(output.success)
    }

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> GatewayResult<()> {
        self.iptables(table, "-A", chain, spec).await.map(drop)
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> GatewayResult<()> {
        self.iptables(table, "-D", chain, spec).await.map(drop)
    }
}

/// A rule owned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl FirewallRule {
    /// Masquerade rule for the client network.
    ///
    /// In a restricted namespace the egress-interface match is left out.
    pub fn nat(config: &GatewayConfig, tag: &str) -> Self {
        let mut spec = args(["-s", &config.ipv4_cidr.trunc().to_string()]);
        if !config.in_container {
            spec.extend(args(["-o", config.ipv4_master.as_str()]));
        }
        spec.extend(args(["-m", "comment", "--comment", tag, "-j", "MASQUERADE"]));
        Self {
            table: NAT_TABLE,
            chain: POSTROUTING,
            spec,
        }
    }

    /// Forward-accept rule.
    pub fn forward(tag: &str) -> Self {
        Self {
            table: FILTER_TABLE,
            chain: FORWARD,
            spec: args(["-m", "comment", "--comment", tag, "-j", "ACCEPT"]),
        }
    }
}

/// Serializes reconcile and cleanup of the gateway's tagged rules.
pub struct FirewallManager<T> {
    table: T,
    tag: String,
    lock: Mutex<()>,
}

impl<T: RuleTable> FirewallManager<T> {
    pub fn new(table: T) -> Self {
        Self::with_tag(table, RULE_TAG)
    }

    /// Manager owning the rules tagged `tag`.
    pub fn with_tag(table: T, tag: impl Into<String>) -> Self {
        Self {
            table,
            tag: tag.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Rules the given configuration requires.
    pub fn desired_rules(&self, config: &GatewayConfig) -> [FirewallRule; 2] {
        [FirewallRule::nat(config, &self.tag), FirewallRule::forward(&self.tag)]
    }

    /// Add the NAT and FORWARD rules unless already present.
    ///
    /// Both rules are attempted; the first failure is returned.
    pub async fn reconcile(&self, config: &GatewayConfig) -> GatewayResult<()> {
        let _guard = self.lock.lock().await;
        self.reconcile_locked(config).await
    }

    /// Remove every tagged rule from the managed chains.
    ///
    /// Failures to delete a single rule are logged and skipped. Returns the
    /// number of rules removed, or an error if no chain could be listed.
    pub async fn cleanup(&self) -> GatewayResult<usize> {
        let _guard = self.lock.lock().await;
        self.cleanup_locked().await
    }

    /// Startup priming: clear stale tagged rules, then reconcile.
    pub async fn prime(&self, config: &GatewayConfig) -> GatewayResult<()> {
        let _guard = self.lock.lock().await;
        if let Err(e) = self.cleanup_locked().await {
            log::error!("Firewall cleanup before priming failed: {}", e);
        }
        let result = self.reconcile_locked(config).await;
        self.log_listings().await;
        result
    }

    async fn reconcile_locked(&self, config: &GatewayConfig) -> GatewayResult<()> {
        let mut first_error = None;
        for rule in self.desired_rules(config) {
            if let Err(e) = self.append_unique(&rule).await {
                log::error!("Failed to apply {}/{} rule: {}", rule.table, rule.chain, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn append_unique(&self, rule: &FirewallRule) -> GatewayResult<()> {
        if self.table.exists(rule.table, rule.chain, &rule.spec).await? {
            log::debug!("{}/{} rule already present", rule.table, rule.chain);
            return Ok(());
        }
        self.table.append(rule.table, rule.chain, &rule.spec).await?;
        log::info!(
            "Added {} rule: {}",
            rule.table,
            render_rule(rule.chain, &rule.spec)
        );
        Ok(())
    }

    async fn cleanup_locked(&self) -> GatewayResult<usize> {
        log::info!("Removing firewall rules tagged {}", self.tag);

        let mut removed = 0;
        let mut listed_any = false;
        let mut last_error = None;

        for (table, chain) in MANAGED_CHAINS {
            let lines = match self.table.list(table, chain).await {
                Ok(lines) => lines,
                Err(e) => {
                    log::warn!("Failed to list {}/{}: {}", table, chain, e);
                    last_error = Some(e);
                    continue;
                }
            };
            listed_any = true;

            for line in &lines {
                let Some(spec) = rules::tagged_rule(line, chain, &self.tag) else {
                    continue;
                };
                match self.table.delete(table, chain, &spec).await {
                    Ok(()) => {
                        removed += 1;
                        log::info!("Removed {} rule: {}", table, line);
                    }
                    Err(e) => log::warn!("Failed to remove {} rule {}: {}", table, line, e),
                }
            }
        }

        match (listed_any, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(removed),
        }
    }

    async fn log_listings(&self) {
        for (table, chain) in MANAGED_CHAINS {
            match self.table.list(table, chain).await {
                Ok(lines) => log::info!("{}/{}:\n{}", table, chain, lines.join("\n")),
                Err(e) => log::warn!("Failed to list {}/{}: {}", table, chain, e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory rule table.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Rule table keeping specifications in memory and listing them the way
    /// `iptables -S` does, with a policy line first.
    #[derive(Default)]
    pub struct MemoryRuleTable {
        chains: StdMutex<HashMap<(String, String), Vec<Vec<String>>>>,
        fail_delete: StdMutex<Vec<String>>,
    }

    impl MemoryRuleTable {
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert a rule directly, bypassing uniqueness.
        pub fn seed(&self, table: &str, chain: &str, spec: &[&str]) {
            self.chains
                .lock()
                .unwrap()
                .entry((table.to_string(), chain.to_string()))
                .or_default()
                .push(spec.iter().map(|s| s.to_string()).collect());
        }

        /// Make deletion fail for rules containing `token`.
        pub fn fail_delete_on(&self, token: &str) {
            self.fail_delete.lock().unwrap().push(token.to_string());
        }

        pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
            self.chains
                .lock()
                .unwrap()
                .get(&(table.to_string(), chain.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        pub fn count_tagged(&self, table: &str, chain: &str, tag: &str) -> usize {
            self.rules(table, chain)
                .iter()
                .filter(|spec| has_comment_tag(spec, tag))
                .count()
        }
    }

    impl RuleTable for MemoryRuleTable {
        async fn list(&self, table: &str, chain: &str) -> GatewayResult<Vec<String>> {
            let mut lines = vec![format!("-P {} ACCEPT", chain)];
            lines.extend(
                self.rules(table, chain)
                    .iter()
                    .map(|spec| render_rule(chain, spec)),
            );
            Ok(lines)
        }

        async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> GatewayResult<bool> {
            Ok(self.rules(table, chain).iter().any(|r| r == spec))
        }

        async fn append(&self, table: &str, chain: &str, spec: &[String]) -> GatewayResult<()> {
            self.chains
                .lock()
                .unwrap()
                .entry((table.to_string(), chain.to_string()))
                .or_default()
                .push(spec.to_vec());
            Ok(())
        }

        async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> GatewayResult<()> {
            let blocked = self
                .fail_delete
                .lock()
                .unwrap()
                .iter()
                .any(|token| spec.contains(token));
            if blocked {
                return Err(GatewayError::Firewall("Resource temporarily unavailable".into()));
            }
            let mut chains = self.chains.lock().unwrap();
            let rules = chains
                .get_mut(&(table.to_string(), chain.to_string()))
                .ok_or_else(|| GatewayError::Firewall("No chain by that name".into()))?;
            let pos = rules.iter().position(|r| r == spec).ok_or_else(|| {
                GatewayError::Firewall("Bad rule (does a matching rule exist in that chain?)".into())
            })?;
            rules.remove(pos);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryRuleTable;
    use super::*;
    use crate::command::testing::RecordingRunner;

    fn config() -> GatewayConfig {
        GatewayConfig {
            ipv4_master: "eth0".into(),
            ipv4_cidr: "10.8.0.0/24".parse().unwrap(),
            ipv4_gateway: "10.8.0.1".parse().unwrap(),
            ipv4_start: "10.8.0.2".parse().unwrap(),
            ipv4_end: "10.8.0.254".parse().unwrap(),
            ..Default::default()
        }
    }

    fn seed_foreign_rules(table: &MemoryRuleTable) {
        table.seed(
            NAT_TABLE,
            POSTROUTING,
            &["-s", "172.17.0.0/16", "!", "-o", "docker0", "-j", "MASQUERADE"],
        );
        table.seed(
            FILTER_TABLE,
            FORWARD,
            &["-m", "comment", "--comment", "SSLVPN backup", "-j", "ACCEPT"],
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let manager = FirewallManager::new(MemoryRuleTable::new());
        manager.reconcile(&config()).await.unwrap();
        manager.reconcile(&config()).await.unwrap();

        let table = manager.table();
        assert_eq!(table.count_tagged(NAT_TABLE, POSTROUTING, RULE_TAG), 1);
        assert_eq!(table.count_tagged(FILTER_TABLE, FORWARD, RULE_TAG), 1);
        assert_eq!(
            table.rules(NAT_TABLE, POSTROUTING)[0],
            args([
                "-s", "10.8.0.0/24", "-o", "eth0", "-m", "comment", "--comment", "SSLVPN", "-j",
                "MASQUERADE"
            ])
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_tagged_rules() {
        let manager = FirewallManager::new(MemoryRuleTable::new());
        seed_foreign_rules(manager.table());
        manager.reconcile(&config()).await.unwrap();

        assert_eq!(manager.cleanup().await.unwrap(), 2);

        let table = manager.table();
        assert_eq!(table.count_tagged(NAT_TABLE, POSTROUTING, RULE_TAG), 0);
        assert_eq!(table.count_tagged(FILTER_TABLE, FORWARD, RULE_TAG), 0);
        assert_eq!(table.rules(NAT_TABLE, POSTROUTING).len(), 1);
        assert_eq!(table.rules(FILTER_TABLE, FORWARD).len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_duplicates_from_earlier_runs() {
        let manager = FirewallManager::new(MemoryRuleTable::new());
        let forward = FirewallRule::forward(RULE_TAG);
        let spec: Vec<&str> = forward.spec.iter().map(String::as_str).collect();
        for _ in 0..3 {
            manager.table().seed(FILTER_TABLE, FORWARD, &spec);
        }

        assert_eq!(manager.cleanup().await.unwrap(), 3);
        assert!(manager.table().rules(FILTER_TABLE, FORWARD).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_continues_after_failed_delete() {
        let manager = FirewallManager::new(MemoryRuleTable::new());
        manager.reconcile(&config()).await.unwrap();
        manager.table().fail_delete_on("MASQUERADE");

        assert_eq!(manager.cleanup().await.unwrap(), 1);
        assert_eq!(manager.table().count_tagged(NAT_TABLE, POSTROUTING, RULE_TAG), 1);
        assert_eq!(manager.table().count_tagged(FILTER_TABLE, FORWARD, RULE_TAG), 0);
    }

    #[tokio::test]
    async fn test_container_nat_rule_has_no_interface_match() {
        let mut config = config();
        config.in_container = true;
        let rule = FirewallRule::nat(&config, RULE_TAG);
        assert!(!rule.spec.contains(&"-o".to_string()));
        assert!(has_comment_tag(&rule.spec, RULE_TAG));

        let manager = FirewallManager::new(MemoryRuleTable::new());
        manager.reconcile(&config).await.unwrap();
        manager.reconcile(&config).await.unwrap();
        assert_eq!(manager.table().count_tagged(NAT_TABLE, POSTROUTING, RULE_TAG), 1);
    }

    #[tokio::test]
    async fn test_prime_replaces_stale_rules() {
        let manager = FirewallManager::new(MemoryRuleTable::new());
        // Left behind by a run with a different client network.
        manager.table().seed(
            NAT_TABLE,
            POSTROUTING,
            &["-s", "10.9.0.0/24", "-o", "eth0", "-m", "comment", "--comment", "SSLVPN", "-j", "MASQUERADE"],
        );

        manager.prime(&config()).await.unwrap();

        let nat = manager.table().rules(NAT_TABLE, POSTROUTING);
        assert_eq!(nat.len(), 1);
        assert_eq!(nat[0][1], "10.8.0.0/24");
    }

    #[tokio::test]
    async fn test_iptables_commands() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(
            "-S FORWARD",
            "-P FORWARD DROP\n-A FORWARD -m comment --comment \"SSLVPN\" -j ACCEPT\n",
        );
        let manager = FirewallManager::new(Iptables::new(runner.clone()));

        assert_eq!(manager.cleanup().await.unwrap(), 1);
        assert_eq!(
            runner.calls(),
            vec![
                "iptables -w -t nat -S POSTROUTING".to_string(),
                "iptables -w -t filter -S FORWARD".to_string(),
                "iptables -w -t filter -D FORWARD -m comment --comment SSLVPN -j ACCEPT".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_iptables_append_when_check_fails() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on(" -C ");
        let table = Iptables::new(runner.clone());
        let manager = FirewallManager::new(table);

        manager.reconcile(&config()).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[1],
            "iptables -w -t nat -A POSTROUTING -s 10.8.0.0/24 -o eth0 -m comment --comment SSLVPN -j MASQUERADE"
        );
    }

    #[tokio::test]
    async fn test_cleanup_fails_when_nothing_can_be_listed() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("-S");
        let manager = FirewallManager::new(Iptables::new(runner));
        assert!(matches!(
            manager.cleanup().await,
            Err(GatewayError::Firewall(_))
        ));
    }
}
