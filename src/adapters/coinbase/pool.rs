//! Connection pool: one streaming connection per batch of instruments.
//!
//! The pool partitions the monitoring universe into disjoint batches, spawns a
//! [`Connection`] task per batch (staggered so the exchange never sees a burst
//! of dials), and keeps a per-connection command channel used for priority
//! elevation. Every connection runs under a child of the pool's cancellation
//! token: disposing one cancels only that task, shutdown cancels them all.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::types::{ConnectionHealth, ConnectionState, ConnectionStats};
use crate::core::channels::MarketEvent;
use crate::core::trading_state::PriorityCommand;

use super::connection::{Connection, ConnectionCommand, ConnectionContext};

/// Split ids into disjoint batches of at most `batch_size`, dropping
/// duplicates and empty ids while preserving first-seen order.
pub fn partition(instrument_ids: &[String], batch_size: usize) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    let mut seen = HashSet::new();
    let unique: Vec<String> = instrument_ids
        .iter()
        .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
        .cloned()
        .collect();
    unique.chunks(batch_size).map(|chunk| chunk.to_vec()).collect()
}

struct Slot {
    id: usize,
    instruments: Vec<String>,
    health: Arc<ConnectionHealth>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Routes priority commands to the connections owning the instruments
#[derive(Clone, Default)]
pub struct PriorityRouter {
    owners: HashMap<String, (usize, mpsc::UnboundedSender<ConnectionCommand>)>,
}

impl PriorityRouter {
    /// Forward a command, split by owning connection. Returns how many
    /// connections were addressed.
    pub fn route(&self, command: PriorityCommand) -> usize {
        let (ids, elevate) = match command {
            PriorityCommand::Elevate(ids) => (ids, true),
            PriorityCommand::Release(ids) => (ids, false),
        };

        let mut per_connection: BTreeMap<usize, (mpsc::UnboundedSender<ConnectionCommand>, Vec<String>)> =
            BTreeMap::new();
        for id in ids {
            match self.owners.get(&id) {
                Some((conn_id, tx)) => per_connection
                    .entry(*conn_id)
                    .or_insert_with(|| (tx.clone(), Vec::new()))
                    .1
                    .push(id),
                None => warn!(instrument = %id, "[POOL] No connection serves instrument"),
            }
        }

        let mut addressed = 0;
        for (conn_id, (tx, ids)) in per_connection {
            let command = if elevate {
                ConnectionCommand::Elevate(ids)
            } else {
                ConnectionCommand::Release(ids)
            };
            if tx.send(command).is_ok() {
                addressed += 1;
            } else {
                warn!(connection_id = conn_id, "[POOL] Connection gone, priority command dropped");
            }
        }
        addressed
    }

    pub fn owner_of(&self, instrument_id: &str) -> Option<usize> {
        self.owners.get(instrument_id).map(|(id, _)| *id)
    }
}

pub struct ConnectionPool {
    ctx: ConnectionContext,
    cancel: CancellationToken,
    slots: Vec<Slot>,
    next_id: usize,
}

impl ConnectionPool {
    pub fn new(ctx: ConnectionContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            slots: Vec::new(),
            next_id: 0,
        }
    }

    /// Partition `instrument_ids` and open one connection per batch.
    ///
    /// Connections are started one after another with
    /// `connection_stagger_ms` between dials. Returns the number opened.
    pub async fn initialize(&mut self, instrument_ids: &[String], batch_size: usize) -> usize {
        let already_served: HashSet<&str> = self
            .slots
            .iter()
            .flat_map(|s| s.instruments.iter().map(String::as_str))
            .collect();
        let fresh: Vec<String> = instrument_ids
            .iter()
            .filter(|id| !already_served.contains(id.as_str()))
            .cloned()
            .collect();

        let batches = partition(&fresh, batch_size);
        if batches.is_empty() {
            warn!("[POOL] No instruments to monitor");
            return 0;
        }

        let stagger = Duration::from_millis(self.ctx.config.connection_stagger_ms);
        let total = batches.len();
        info!(
            instruments = fresh.len(),
            connections = total,
            batch_size,
            "[POOL] Initializing connection pool"
        );

        for (i, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.spawn_connection(batch);
            if i + 1 < total && !stagger.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(stagger) => {}
                }
            }
        }

        total
    }

    fn spawn_connection(&mut self, instruments: Vec<String>) {
        let id = self.next_id;
        self.next_id += 1;

        let health = ConnectionHealth::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let connection = Connection::new(
            id,
            instruments.clone(),
            self.ctx.clone(),
            health.clone(),
            commands_rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(connection.run());

        self.slots.push(Slot {
            id,
            instruments,
            health,
            commands,
            cancel,
            handle,
        });
    }

    pub fn router(&self) -> PriorityRouter {
        let mut owners = HashMap::new();
        for slot in &self.slots {
            for id in &slot.instruments {
                owners.insert(id.clone(), (slot.id, slot.commands.clone()));
            }
        }
        PriorityRouter { owners }
    }

    pub fn connection_count(&self) -> usize {
        self.slots.len()
    }

    pub fn instruments_of(&self, connection_id: usize) -> Option<&[String]> {
        self.slots
            .iter()
            .find(|s| s.id == connection_id)
            .map(|s| s.instruments.as_slice())
    }

    pub fn stats(&self) -> Vec<ConnectionStats> {
        self.slots
            .iter()
            .map(|s| s.health.snapshot(s.id, s.instruments.len()))
            .collect()
    }

    /// Ask one connection to re-send its whole subscription set
    pub fn resubscribe(&self, connection_id: usize) -> bool {
        self.slots
            .iter()
            .find(|s| s.id == connection_id)
            .map(|s| s.commands.send(ConnectionCommand::Resubscribe).is_ok())
            .unwrap_or(false)
    }

    /// Stop a single connection and wait for its task. Other connections are
    /// untouched.
    pub async fn dispose_connection(&mut self, connection_id: usize) -> bool {
        let Some(pos) = self.slots.iter().position(|s| s.id == connection_id) else {
            return false;
        };
        let slot = self.slots.remove(pos);
        slot.cancel.cancel();
        if let Err(e) = slot.handle.await {
            warn!(connection_id, error = %e, "[POOL] Connection task panicked");
        }
        info!(connection_id, instruments = slot.instruments.len(), "[POOL] Connection disposed");
        true
    }

    /// Periodically publish [`ConnectionStats`] for every connection alive
    /// when the task was spawned.
    pub fn spawn_health_task(&self) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.ctx.config.health_interval_secs.max(1));
        let events = self.ctx.events.clone();
        let cancel = self.cancel.clone();
        let watched: Vec<(usize, usize, Arc<ConnectionHealth>)> = self
            .slots
            .iter()
            .map(|s| (s.id, s.instruments.len(), s.health.clone()))
            .collect();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut connected = 0;
                let mut messages = 0;
                for (id, count, health) in &watched {
                    let stats = health.snapshot(*id, *count);
                    if stats.state == ConnectionState::Connected {
                        connected += 1;
                    }
                    messages += stats.messages_received;
                    let _ = events.try_send(MarketEvent::Health(stats));
                }
                info!(
                    connections = watched.len(),
                    connected,
                    messages_received = messages,
                    "[POOL] Health"
                );
            }
        })
    }

    /// Cancel every connection and wait for all of them to close.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for slot in self.slots.drain(..) {
            if let Err(e) = slot.handle.await {
                warn!(connection_id = slot.id, error = %e, "[POOL] Connection task panicked");
            }
        }
        info!("[POOL] All connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::coinbase::connection::tests::{
        next_json, next_market, test_context, test_ingestion_config, ticker_frame,
    };
    use crate::adapters::shared::{MemoryConnector, MemorySession};
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::time::Instant;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}-USD", prefix, i)).collect()
    }

    #[test]
    fn test_partition_respects_batch_size_and_dedupes() {
        let mut input = ids("A", 120);
        input.push("A0-USD".to_string());
        input.push(String::new());
        let batches = partition(&input, 50);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 50);
        assert_eq!(batches[2].len(), 20);
        assert_eq!(batches[0][0], "A0-USD");
        assert!(partition(&[], 50).is_empty());
    }

    proptest! {
        #[test]
        fn prop_partition_is_disjoint_cover(
            raw in proptest::collection::vec(0u16..300, 0..400),
            batch_size in 1usize..80,
        ) {
            let input: Vec<String> = raw.iter().map(|n| format!("I{}", n)).collect();
            let batches = partition(&input, batch_size);

            let mut seen = HashSet::new();
            for batch in &batches {
                prop_assert!(!batch.is_empty() && batch.len() <= batch_size);
                for id in batch {
                    prop_assert!(seen.insert(id.clone()), "duplicate {}", id);
                }
            }
            let expected: HashSet<String> = input.into_iter().collect();
            prop_assert_eq!(seen, expected);
        }
    }

    async fn open_pool(
        universe: &[String],
        batch_size: usize,
    ) -> (
        ConnectionPool,
        Arc<MemoryConnector>,
        Vec<MemorySession>,
        mpsc::UnboundedReceiver<MemorySession>,
        mpsc::Receiver<MarketEvent>,
    ) {
        let (ctx, connector, mut sessions_rx, events, _signer) = test_context(test_ingestion_config());
        let mut pool = ConnectionPool::new(ctx, CancellationToken::new());
        let opened = pool.initialize(universe, batch_size).await;
        let mut sessions = Vec::new();
        for _ in 0..opened {
            sessions.push(sessions_rx.recv().await.unwrap());
        }
        (pool, connector, sessions, sessions_rx, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_opens_one_connection_per_batch() {
        let universe = ids("X", 120);
        let (mut pool, connector, mut sessions, _sessions_rx, _events) = open_pool(&universe, 50).await;

        assert_eq!(pool.connection_count(), 3);
        assert_eq!(pool.instruments_of(2).unwrap().len(), 20);

        for (i, session) in sessions.iter_mut().enumerate() {
            let hb = next_json(session).await;
            assert_eq!(hb["channel"], "heartbeats");
            let ticker = next_json(session).await;
            assert_eq!(
                ticker["product_ids"].as_array().unwrap().len(),
                pool.instruments_of(i).unwrap().len()
            );
        }

        let dials = connector.attempt_times();
        assert_eq!(dials.len(), 3);
        assert!(dials[1] - dials[0] >= Duration::from_millis(5));

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_backs_off_while_others_deliver() {
        let universe = ids("D", 100);
        let (mut pool, connector, mut sessions, mut sessions_rx, mut events) = open_pool(&universe, 50).await;
        let healthy = sessions.pop().unwrap();
        let dropped = sessions.pop().unwrap();

        connector.set_refuse(true);
        let t0 = Instant::now();
        dropped.close();

        // Three refused attempts land at t0+1s, t0+3s, t0+7s
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        healthy.send_text(ticker_frame(1, &[("D50-USD", 2.0)]));
        match next_market(&mut events).await {
            MarketEvent::Ticker(s) => assert_eq!(s.instrument_id, "D50-USD"),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep_until(t0 + Duration::from_millis(7_500)).await;

        let dials = connector.attempt_times();
        assert_eq!(dials.len(), 5);
        assert_eq!(dials[2] - t0, Duration::from_secs(1));
        assert_eq!(dials[3] - dials[2], Duration::from_secs(2));
        assert_eq!(dials[4] - dials[3], Duration::from_secs(4));

        let stats = pool.stats();
        assert_eq!(stats[0].state, ConnectionState::Reconnecting);
        assert_eq!(stats[0].current_backoff_ms, 8_000);
        assert_eq!(stats[1].state, ConnectionState::Connected);

        // Next attempt at t0+15s succeeds, then a drop starts again from base
        connector.set_refuse(false);
        let reconnected = sessions_rx.recv().await.unwrap();
        assert_eq!(Instant::now() - t0, Duration::from_secs(15));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.stats()[0].reconnect_attempts, 0);
        assert_eq!(pool.stats()[0].state, ConnectionState::Connected);

        let t1 = Instant::now();
        reconnected.close();
        let _again = sessions_rx.recv().await.unwrap();
        assert_eq!(Instant::now() - t1, Duration::from_secs(1));

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_elevates_on_owning_connection_only() {
        let universe = ids("R", 4);
        let (mut pool, _connector, mut sessions, _sessions_rx, _events) = open_pool(&universe, 2).await;
        for session in sessions.iter_mut() {
            for _ in 0..3 {
                next_json(session).await;
            }
        }

        let router = pool.router();
        assert_eq!(router.owner_of("R3-USD"), Some(1));
        let addressed = router.route(PriorityCommand::Elevate(vec![
            "R3-USD".to_string(),
            "UNKNOWN".to_string(),
        ]));
        assert_eq!(addressed, 1);

        let frame = next_json(&mut sessions[1]).await;
        assert_eq!(frame["channel"], "ticker");
        assert_eq!(frame["product_ids"], json!(["R3-USD"]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sessions[0].try_next_text().is_none());

        router.route(PriorityCommand::Release(vec!["R3-USD".to_string()]));
        let frame = next_json(&mut sessions[1]).await;
        assert_eq!(frame["type"], "unsubscribe");

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_targets_single_connection() {
        let universe = ids("S", 4);
        let (mut pool, _connector, mut sessions, _sessions_rx, _events) = open_pool(&universe, 2).await;
        for session in sessions.iter_mut() {
            for _ in 0..3 {
                next_json(session).await;
            }
        }

        assert!(pool.resubscribe(0));
        assert!(!pool.resubscribe(9));
        assert_eq!(next_json(&mut sessions[0]).await["channel"], "heartbeats");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sessions[1].try_next_text().is_none());

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_single_connection() {
        let universe = ids("P", 4);
        let (mut pool, _connector, sessions, _sessions_rx, _events) = open_pool(&universe, 2).await;

        assert!(pool.dispose_connection(0).await);
        assert!(!pool.dispose_connection(0).await);
        assert!(sessions[0].is_client_closed());
        assert!(!sessions[1].is_client_closed());
        assert_eq!(pool.connection_count(), 1);

        pool.shutdown().await;
        assert!(sessions[1].is_client_closed());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_task_publishes_stats() {
        let universe = ids("H", 3);
        let (mut pool, _connector, _sessions, _sessions_rx, mut events) = open_pool(&universe, 2).await;
        let handle = pool.spawn_health_task();

        let mut reported = HashSet::new();
        while reported.len() < 2 {
            if let Some(MarketEvent::Health(stats)) = events.recv().await {
                if stats.state == ConnectionState::Connected {
                    reported.insert(stats.connection_id);
                }
            }
        }

        pool.shutdown().await;
        handle.await.unwrap();
    }
}
