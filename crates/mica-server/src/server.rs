//! Server assembly: runtimes, event dispatcher, cache table and the
//! accept loop.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context as _;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use mica_event::Handle;
use mica_runtime::{current, Priority, PumpFn, RuntimeGroup, RuntimeOptions, WorkItem};
use mica_table::{EngineMode, Table, TableConfig};

use crate::conn::{self, Conn};
use crate::exec::ExecCtx;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Total cache bytes across all partitions.
    pub volume: usize,
    /// Desired partition count (rounded down to a power of two).
    pub partitions: usize,
    pub engine: EngineMode,
    /// Runtime count; zero means one per available CPU.
    pub ncores: usize,
    /// CPU indices to pin runtimes to.
    pub affinity: Option<Vec<usize>>,
    pub workers_max: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:11211".parse().expect("static address"),
            volume: 64 * 1024 * 1024,
            partitions: 8,
            engine: EngineMode::Combiner,
            ncores: 0,
            affinity: None,
            workers_max: 256,
        }
    }
}

/// A running cache server. Dropping it stops the runtimes.
pub struct Server {
    group: RuntimeGroup,
    addr: SocketAddr,
}

impl Server {
    pub fn start(config: ServerConfig) -> anyhow::Result<Self> {
        let ncores = match (config.ncores, &config.affinity) {
            (0, Some(set)) if !set.is_empty() => set.len(),
            (0, _) => num_cpus::get().max(1),
            (n, _) => n,
        };

        let (mut poller, events) = mica_event::dispatcher().context("event dispatcher")?;

        let table = Arc::new(
            Table::new(&TableConfig {
                volume: config.volume,
                nparts: config.partitions,
                mode: config.engine,
                ncores,
            })
            .context("cache table")?,
        );

        let listener = TcpListener::bind(config.listen).context("bind listener")?;
        let addr = listener.local_addr()?;

        // The primary dealer pumps the poller; cross-thread posts to the
        // primary wake it through the dispatcher waker.
        let pump_events = Arc::clone(&events);
        let pump: PumpFn = Box::new(move |timeout| {
            if let Err(e) = poller.pump(&pump_events, timeout) {
                error!(error = %e, "event poll failed");
            }
        });
        let notify_events = Arc::clone(&events);

        let group = RuntimeGroup::start(RuntimeOptions {
            ncores,
            nworkers_max: config.workers_max,
            affinity: config.affinity.clone(),
            primary_pump: Some(pump),
            primary_notify: Some(Arc::new(move || notify_events.notify())),
        })
        .context("start runtimes")?;

        let accept_events = Arc::clone(&events);
        let accept_table = Arc::clone(&table);
        group.post(
            0,
            WorkItem::new("acceptor", move || accept_loop(listener, accept_events, accept_table)),
        );

        info!(%addr, ncores, engine = %config.engine, "mica listening");
        Ok(Self { group, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the runtimes and join their threads. Open connections are
    /// dropped; their cleanup runs as the tasks unwind.
    pub fn stop(mut self) {
        self.group.stop();
    }
}

/// Accept connections on the primary runtime and deal them out to the
/// runtimes round-robin.
async fn accept_loop(listener: TcpListener, events: Arc<Handle>, table: Arc<Table>) {
    let rt = current();
    let key = match events.register(listener.as_raw_fd()) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "cannot register listener");
            return;
        }
    };

    let mut next_core = 0usize;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let core = next_core % rt.ncores();
                next_core = next_core.wrapping_add(1);
                let conn_events = Arc::clone(&events);
                let conn_table = Arc::clone(&table);
                rt.submit(
                    core,
                    WorkItem::new("connection", move || {
                        serve_connection(stream, peer, conn_events, conn_table)
                    }),
                )
                .await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                events.readable(key).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Bootstrap one connection on its owning runtime: register the socket
/// and spawn the reader/writer task pair.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, events: Arc<Handle>, table: Arc<Table>) {
    let rt = current();
    let key = match events.register(stream.as_raw_fd()) {
        Ok(key) => key,
        Err(e) => {
            debug!(%peer, error = %e, "cannot register connection");
            return;
        }
    };
    let conn = Conn::new(stream, key, events, Rc::clone(rt.pool()), peer);
    let ctx = Rc::new(ExecCtx { table });

    let reader_conn = Rc::clone(&conn);
    rt.spawn("conn reader", Priority::Work, conn::reader(reader_conn, ctx));
    rt.spawn("conn writer", Priority::Work, conn::writer(conn));
}
