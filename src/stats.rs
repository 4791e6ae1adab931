//! Traffic counters pulled from the running relay
//!
//! The relay publishes cumulative counters at `/debug/vars` on its control
//! port. Each [`StatsCollector::collect_traffic`] call opens one connection,
//! reads a snapshot, closes the connection and returns the growth since the
//! previous snapshot of the same instance.

use crate::db::Database;
use crate::error::{ControlError, Result};
use crate::supervisor::Supervisor;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const STATS_PATH: &str = "/debug/vars";

/// Traffic of one inbound or outbound since the previous collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traffic {
    pub is_inbound: bool,
    pub is_outbound: bool,
    pub tag: String,
    pub up: i64,
    pub down: i64,
}

/// Traffic of one client since the previous collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientTraffic {
    pub email: String,
    pub up: i64,
    pub down: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ExpVars {
    #[serde(default)]
    stats: StatsVars,
}

/// Cumulative counters as published by the relay
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsVars {
    #[serde(default)]
    pub inbound: BTreeMap<String, Counter>,
    #[serde(default)]
    pub outbound: BTreeMap<String, Counter>,
    #[serde(default)]
    pub user: BTreeMap<String, Counter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Counter {
    #[serde(default)]
    pub uplink: i64,
    #[serde(default)]
    pub downlink: i64,
}

impl Counter {
    /// Growth since `previous`; a counter that went backwards restarted
    fn since(self, previous: Option<Counter>) -> Counter {
        let grow = |now: i64, before: Option<i64>| match before {
            Some(before) if now >= before => now - before,
            _ => now,
        };
        Counter {
            uplink: grow(self.uplink, previous.map(|p| p.uplink)),
            downlink: grow(self.downlink, previous.map(|p| p.downlink)),
        }
    }

    fn is_zero(&self) -> bool {
        self.uplink == 0 && self.downlink == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Inbound,
    Outbound,
    User,
}

struct Baseline {
    instance: u64,
    counters: HashMap<(Kind, String), Counter>,
}

/// Collects traffic deltas from the relay managed by a [`Supervisor`]
pub struct StatsCollector {
    supervisor: Arc<Supervisor>,
    timeout: Duration,
    baseline: Mutex<Option<Baseline>>,
}

impl StatsCollector {
    pub fn new(supervisor: Arc<Supervisor>, timeout: Duration) -> Self {
        Self {
            supervisor,
            timeout,
            baseline: Mutex::new(None),
        }
    }

    /// Traffic since the previous call.
    ///
    /// Fails with [`ControlError::NotRunning`] without touching the network
    /// when the relay is down.
    pub async fn collect_traffic(&self) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        let (instance, vars) = self.snapshot().await?;
        self.advance(instance, vars, |_, _| Ok(()))
    }

    /// Collect traffic and add it to the persisted totals.
    ///
    /// The baseline only moves once the write committed; after a failed
    /// write the next call reports that growth again.
    pub async fn collect_into(&self, db: &Database) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)> {
        let (instance, vars) = self.snapshot().await?;
        let (traffic, clients) = self.advance(instance, vars, |traffic, clients| {
            db.add_all_traffic(traffic, clients)?;
            Ok(())
        })?;
        debug!(
            traffic = traffic.len(),
            clients = clients.len(),
            "Traffic persisted"
        );
        Ok((traffic, clients))
    }

    async fn snapshot(&self) -> Result<(u64, StatsVars)> {
        let (instance, port) = self
            .supervisor
            .stats_endpoint()
            .ok_or(ControlError::NotRunning)?;

        let vars = query_stats(port, self.timeout).await?;
        Ok((instance, vars))
    }

    /// Compute deltas against the baseline of `instance` and hand them to
    /// `persist`; the baseline is only updated when `persist` succeeds
    fn advance<F>(&self, instance: u64, vars: StatsVars, persist: F) -> Result<(Vec<Traffic>, Vec<ClientTraffic>)>
    where
        F: FnOnce(&[Traffic], &[ClientTraffic]) -> Result<()>,
    {
        let mut guard = self.baseline.lock();
        if guard.as_ref().is_some_and(|b| b.instance != instance) {
            *guard = None;
        }
        let baseline = guard.get_or_insert_with(|| {
            debug!(instance, "Starting new traffic baseline");
            Baseline {
                instance,
                counters: HashMap::new(),
            }
        });

        let mut next = HashMap::new();
        let mut delta = |kind: Kind, name: &str, now: Counter| {
            let key = (kind, name.to_string());
            let previous = baseline.counters.get(&key).copied();
            next.insert(key, now);
            now.since(previous)
        };

        let mut traffic = Vec::new();
        for (kind, counters) in [(Kind::Inbound, vars.inbound), (Kind::Outbound, vars.outbound)] {
            for (tag, now) in counters {
                let grown = delta(kind, &tag, now);
                if grown.is_zero() {
                    continue;
                }
                traffic.push(Traffic {
                    is_inbound: kind == Kind::Inbound,
                    is_outbound: kind == Kind::Outbound,
                    tag,
                    up: grown.uplink,
                    down: grown.downlink,
                });
            }
        }

        let mut clients = Vec::new();
        for (email, now) in vars.user {
            let grown = delta(Kind::User, &email, now);
            if grown.is_zero() {
                continue;
            }
            clients.push(ClientTraffic {
                email,
                up: grown.uplink,
                down: grown.downlink,
            });
        }

        persist(&traffic, &clients)?;
        baseline.counters.extend(next);
        Ok((traffic, clients))
    }
}

/// Fetch one snapshot over a connection that lives only for this call
pub async fn query_stats(port: u16, timeout: Duration) -> Result<StatsVars> {
    tokio::time::timeout(timeout, fetch_vars(port))
        .await
        .map_err(|_| ControlError::Transport(format!("stats query timed out after {}ms", timeout.as_millis())))?
}

async fn fetch_vars(port: u16) -> Result<StatsVars> {
    let transport = |e: &dyn std::fmt::Display| ControlError::Transport(format!("stats query failed: {}", e));

    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| transport(&e))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| transport(&e))?;
    let conn = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Stats connection closed with error");
        }
    });

    let request = Request::get(STATS_PATH)
        .header(hyper::header::HOST, format!("127.0.0.1:{}", port))
        .body(Empty::<Bytes>::new())
        .map_err(|e| transport(&e))?;

    let result = async {
        let response = sender.send_request(request).await.map_err(|e| transport(&e))?;
        if !response.status().is_success() {
            return Err(ControlError::Transport(format!(
                "stats endpoint returned {}",
                response.status()
            )));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(&e))?
            .to_bytes();
        serde_json::from_slice::<ExpVars>(&body)
            .map(|vars| vars.stats)
            .map_err(|e| ControlError::MalformedResponse(format!("stats: {}", e)))
    }
    .await;

    drop(sender);
    conn.abort();
    result
}
