//! In-process miniature cluster.
//!
//! The real thing this stands in for is a multi-daemon service; here the
//! whole cluster is one background thread with a loopback TCP health
//! endpoint and a metadata directory. Tests and the harness talk to it the
//! same way they would talk to the full service: connect, send `PING`, read
//! `OK <cluster-id>`.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::HarnessError;
use crate::paths;

const VERSION_FILE: &str = "VERSION";
const ACCEPT_WAKE_TIMEOUT: Duration = Duration::from_millis(500);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Metadata record written to `<name dir>/VERSION` at startup.
///
/// A later harness refusing to reuse a base dir can point at this file to
/// say who owned it.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterVersion {
    pub cluster_id: String,
    pub namespace: String,
    pub created_ms: u64,
}

/// Handle to the running in-process cluster.
///
/// Dropping the handle shuts the service thread down; [`MiniCluster::shutdown`]
/// does the same eagerly and is idempotent.
pub struct MiniCluster {
    cluster_id: String,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    service: Option<JoinHandle<()>>,
}

impl MiniCluster {
    /// Bind the health endpoint, write the `VERSION` record, and spawn the
    /// service thread.
    ///
    /// The listener binds an ephemeral port on IPv4 or IPv6 loopback
    /// according to `config.prefer_ipv4`. The returned handle is live but
    /// not necessarily ready; call [`await_ready`](Self::await_ready) to
    /// block until the endpoint answers.
    pub fn start(config: &ClusterConfig) -> Result<Self, HarnessError> {
        let bind_addr = if config.prefer_ipv4 { "127.0.0.1:0" } else { "[::1]:0" };
        let listener = TcpListener::bind(bind_addr)
            .map_err(|e| HarnessError::provision(format!("bind {bind_addr}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::provision("read bound address", e))?;
        let cluster_id = new_cluster_id();

        write_version(config, &cluster_id)?;

        let stop = Arc::new(AtomicBool::new(false));
        let service = {
            let stop = Arc::clone(&stop);
            let cluster_id = cluster_id.clone();
            thread::Builder::new()
                .name("silo-health".into())
                .spawn(move || serve(listener, cluster_id, stop))
                .map_err(|e| HarnessError::provision("spawn service thread", e))?
        };

        info!(%addr, cluster_id, "minicluster started");
        Ok(Self { cluster_id, addr, stop, service: Some(service) })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Address of the health endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the health endpoint answers a `PING`, or fail with
    /// [`HarnessError::Provision`] once `timeout` has elapsed.
    pub fn await_ready(&self, timeout: Duration) -> Result<(), HarnessError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.ping() {
                Ok(id) if id == self.cluster_id => return Ok(()),
                Ok(id) => {
                    return Err(HarnessError::provision_bare(format!(
                        "health endpoint answered for foreign cluster {id}"
                    )));
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(HarnessError::provision(
                        format!("cluster not ready within {timeout:?}"),
                        e,
                    ));
                }
                Err(_) => thread::sleep(READY_POLL_INTERVAL),
            }
        }
    }

    /// One health round-trip. Returns the cluster id the endpoint reported.
    pub fn ping(&self) -> io::Result<String> {
        let mut stream = TcpStream::connect_timeout(&self.addr, ACCEPT_WAKE_TIMEOUT)?;
        stream.set_read_timeout(Some(ACCEPT_WAKE_TIMEOUT))?;
        stream.write_all(b"PING\n")?;
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply)?;
        match reply.trim_end().strip_prefix("OK ") {
            Some(id) => Ok(id.to_string()),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected health reply: {reply:?}"),
            )),
        }
    }

    /// Stop the service thread and wait for it to exit. Safe to call twice.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.service.take() else { return };
        self.stop.store(true, Ordering::SeqCst);
        // The accept loop may be parked in accept(); poke it awake.
        let _ = TcpStream::connect_timeout(&self.addr, ACCEPT_WAKE_TIMEOUT);
        if handle.join().is_err() {
            warn!(cluster_id = self.cluster_id, "service thread panicked");
        }
        debug!(cluster_id = self.cluster_id, "minicluster stopped");
    }
}

impl Drop for MiniCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(listener: TcpListener, cluster_id: String, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "health accept failed");
                continue;
            }
        };
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = answer(stream, &cluster_id) {
            debug!(%peer, error = %e, "health exchange failed");
        }
    }
}

fn answer(stream: TcpStream, cluster_id: &str) -> io::Result<()> {
    stream.set_read_timeout(Some(ACCEPT_WAKE_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut request = String::new();
    reader.read_line(&mut request)?;
    let mut stream = reader.into_inner();
    if request.trim_end() == "PING" {
        stream.write_all(format!("OK {cluster_id}\n").as_bytes())?;
    } else {
        stream.write_all(b"ERR unknown request\n")?;
    }
    stream.flush()
}

fn write_version(config: &ClusterConfig, cluster_id: &str) -> Result<(), HarnessError> {
    let namespace = paths::cluster_path(&config.namespace_dir())?;
    let created_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64;
    let record = ClusterVersion {
        cluster_id: cluster_id.to_string(),
        namespace,
        created_ms,
    };
    let path = config.name_dir().join(VERSION_FILE);
    let body = serde_json::to_vec_pretty(&record)
        .map_err(|e| HarnessError::provision_bare(format!("encode VERSION record: {e}")))?;
    std::fs::write(&path, body)
        .map_err(|e| HarnessError::provision(format!("write {}", path.display()), e))
}

fn new_cluster_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .subsec_nanos();
    format!("silo-{:08x}", nanos ^ std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioned_config() -> anyhow::Result<(tempfile::TempDir, ClusterConfig)> {
        let tmp = tempfile::tempdir()?;
        let config = ClusterConfig::new(tmp.path());
        config.acquire()?;
        Ok((tmp, config))
    }

    #[test]
    fn ping_round_trip_reports_the_cluster_id() -> anyhow::Result<()> {
        let (_tmp, config) = provisioned_config()?;
        let cluster = MiniCluster::start(&config)?;
        cluster.await_ready(config.startup_timeout)?;
        assert_eq!(cluster.ping()?, cluster.cluster_id());
        config.release_lock();
        Ok(())
    }

    #[test]
    fn version_record_lands_in_the_name_dir() -> anyhow::Result<()> {
        let (_tmp, config) = provisioned_config()?;
        let cluster = MiniCluster::start(&config)?;
        let raw = std::fs::read(config.name_dir().join(VERSION_FILE))?;
        let record: ClusterVersion = serde_json::from_slice(&raw)?;
        assert_eq!(record.cluster_id, cluster.cluster_id());
        assert!(record.namespace.ends_with("fs"));
        config.release_lock();
        Ok(())
    }

    #[test]
    fn shutdown_is_idempotent() -> anyhow::Result<()> {
        let (_tmp, config) = provisioned_config()?;
        let mut cluster = MiniCluster::start(&config)?;
        cluster.await_ready(config.startup_timeout)?;
        cluster.shutdown();
        cluster.shutdown();
        config.release_lock();
        Ok(())
    }

    #[test]
    fn shutdown_survives_a_panicked_service_thread() -> anyhow::Result<()> {
        let (_tmp, config) = provisioned_config()?;
        let mut cluster = MiniCluster::start(&config)?;
        cluster.await_ready(config.startup_timeout)?;
        cluster.shutdown();
        // Swap in a service thread that died mid-flight; shutdown must
        // still run to completion.
        cluster.service = Some(thread::spawn(|| panic!("health loop fell over")));
        cluster.shutdown();
        assert!(cluster.service.is_none());
        config.release_lock();
        Ok(())
    }
}
