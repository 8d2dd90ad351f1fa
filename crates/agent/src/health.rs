use std::sync::Arc;
use std::time::Duration;

use concord_core::{BusConfig, DirectoryConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::directory::{AgentDirectory, HealthReport};
use crate::runtime::hours;

/// Result of one maintenance pass.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub health: HealthReport,
    pub evicted: Vec<String>,
    pub handlers_removed: usize,
    pub messages_pruned: usize,
}

/// Periodic health check, stale-agent eviction and conversation pruning.
pub struct HealthMonitor {
    directory: Arc<AgentDirectory>,
    bus: Arc<MessageBus>,
    interval: Duration,
    max_idle: Duration,
    conversation_max_age: Duration,
}

impl HealthMonitor {
    pub fn new(
        directory: Arc<AgentDirectory>,
        bus: Arc<MessageBus>,
        directory_config: &DirectoryConfig,
        bus_config: &BusConfig,
    ) -> Self {
        Self {
            directory,
            bus,
            interval: Duration::from_secs(directory_config.health_tick_secs.max(1)),
            max_idle: hours(directory_config.max_idle_hours),
            conversation_max_age: hours(bus_config.conversation_max_age_hours),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tick(&self) -> MaintenanceReport {
        let health = self.directory.health_check();
        if health.is_healthy() {
            debug!(agents = health.total_agents, "Agent directory healthy");
        } else {
            warn!(
                unhealthy = ?health.unhealthy,
                offline = ?health.offline,
                stale = ?health.stale,
                degraded = ?health.degraded,
                orchestrator_available = health.orchestrator_available,
                "Agent directory health problems"
            );
        }

        let evicted = self.directory.evict_stale_ids(self.max_idle);
        let handlers_removed: usize = evicted
            .iter()
            .map(|id| self.bus.unregister_agent_handlers(id))
            .sum();
        let messages_pruned = self.bus.prune_conversations(self.conversation_max_age);
        if !evicted.is_empty() || messages_pruned > 0 {
            info!(
                evicted = evicted.len(),
                handlers_removed,
                messages_pruned,
                "Maintenance pass cleaned up"
            );
        }

        MaintenanceReport {
            health,
            evicted,
            handlers_removed,
            messages_pruned,
        }
    }

    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "HealthMonitor started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.cancelled() => {
                    info!("HealthMonitor shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::new(self).run_loop(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::{agent, ScriptedLogic};
    use chrono::Utc;
    use concord_core::{AgentStatus, AgentType, Message, MessageType};

    fn setup() -> (Arc<AgentDirectory>, Arc<MessageBus>) {
        let directory = Arc::new(AgentDirectory::default());
        let bus = Arc::new(MessageBus::new(Arc::clone(&directory), BusConfig::default()));
        (directory, bus)
    }

    #[tokio::test]
    async fn test_tick_evicts_idle_agents_and_their_handlers() {
        let (directory, bus) = setup();
        let old = agent("health_specialized", AgentType::Health, ScriptedLogic::answering("x"));
        let fresh = agent("finance_specialized", AgentType::Finance, ScriptedLogic::answering("x"));
        directory.register(Arc::clone(&old));
        directory.register(Arc::clone(&fresh));
        bus.register_handler(old.id(), MessageType::Request, |_msg: Message| async { Ok(None) });
        old.set_last_active(Utc::now() - chrono::Duration::hours(48));

        let monitor = HealthMonitor::new(
            Arc::clone(&directory),
            Arc::clone(&bus),
            &DirectoryConfig::default(),
            &BusConfig::default(),
        )
        .with_max_idle(Duration::from_secs(3600));
        let report = monitor.tick();

        assert_eq!(report.evicted, vec!["health_specialized".to_string()]);
        assert_eq!(report.handlers_removed, 1);
        assert!(report.health.stale.contains(&"health_specialized".to_string()));
        assert!(directory.contains("finance_specialized"));
        assert!(!directory.contains("health_specialized"));
    }

    #[tokio::test]
    async fn test_tick_keeps_busy_agents() {
        let (directory, bus) = setup();
        let busy = agent("journal_specialized", AgentType::Journal, ScriptedLogic::answering("x"));
        directory.register(Arc::clone(&busy));
        busy.set_last_active(Utc::now() - chrono::Duration::hours(48));
        busy.set_status(AgentStatus::Active);

        let monitor = HealthMonitor::new(directory.clone(), bus, &DirectoryConfig::default(), &BusConfig::default())
            .with_max_idle(Duration::from_secs(60));
        assert!(monitor.tick().evicted.is_empty());
        assert!(directory.contains("journal_specialized"));
    }

    #[tokio::test]
    async fn test_unbounded_ages_evict_and_prune_nothing() {
        let (directory, bus) = setup();
        let a = agent("journal_specialized", AgentType::Journal, ScriptedLogic::answering("x"));
        directory.register(Arc::clone(&a));
        a.set_last_active(Utc::now() - chrono::Duration::hours(48));

        let directory_config = DirectoryConfig { max_idle_hours: u64::MAX, ..DirectoryConfig::default() };
        let bus_config = BusConfig { conversation_max_age_hours: u64::MAX, ..BusConfig::default() };
        let report = HealthMonitor::new(Arc::clone(&directory), Arc::clone(&bus), &directory_config, &bus_config).tick();

        assert!(report.evicted.is_empty());
        assert_eq!(report.messages_pruned, 0);
        assert!(directory.contains("journal_specialized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_cancel() {
        let (directory, bus) = setup();
        let token = CancellationToken::new();
        let handle = HealthMonitor::new(directory, bus, &DirectoryConfig::default(), &BusConfig::default())
            .with_interval(Duration::from_secs(5))
            .spawn(token.clone());
        tokio::time::sleep(Duration::from_secs(12)).await;
        token.cancel();
        assert!(handle.await.is_ok());
    }
}
