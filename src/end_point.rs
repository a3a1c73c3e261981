use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::codec::Payload;
use crate::config::ReliabilityConfig;
use crate::engine::{ReliabilityEngine, SendOptions};
use crate::payload_handler::PayloadHandler;
use crate::task::ticker::{ScheduledTicker, TaskHandle};
use crate::task::worker_pool::WorkerPool;

/// EndPoint is the place where all parts come together: It listens on a UDP socket, hands
///  incoming datagrams to the engine on the worker pool, drives the engine's maintenance from
///  the ticker, and has an API for application code to send payloads.
///
/// Packets are sent from the receive socket, so that peers can reply to the address a packet
///  came from.
pub struct EndPoint {
    config: Arc<ReliabilityConfig>,
    receive_socket: UdpSocket,
    engine: Arc<ReliabilityEngine>,
    payload_handler: Arc<dyn PayloadHandler>,
    worker_pool: Arc<WorkerPool>,
    ticker: ScheduledTicker,
    maintenance_tasks: Mutex<Vec<TaskHandle>>,
    shutdown_signal: Notify,
}

impl EndPoint {
    pub async fn new(
        payload_handler: Arc<dyn PayloadHandler>,
        config: Arc<ReliabilityConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let std_socket = std::net::UdpSocket::bind(config.self_addr)?;
        std_socket.set_nonblocking(true)?;
        // the clone shares the OS socket, including the non-blocking mode. Sending retries when
        //  the send buffer is full.
        let send_socket = Arc::new(std_socket.try_clone()?);
        let receive_socket = UdpSocket::from_std(std_socket)?;
        info!("bound socket to {:?}", receive_socket.local_addr()?);

        let worker_pool = Arc::new(WorkerPool::new("worker", config.num_workers)?);
        let ticker = ScheduledTicker::new(config.tick_interval, worker_pool.clone())?;

        let engine = Arc::new(ReliabilityEngine::new(config.clone(), send_socket));
        let maintenance_tasks = engine.start_maintenance(&ticker, &worker_pool)?;

        Ok(EndPoint {
            config,
            receive_socket,
            engine,
            payload_handler,
            worker_pool,
            ticker,
            maintenance_tasks: Mutex::new(maintenance_tasks),
            shutdown_signal: Notify::new(),
        })
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.receive_socket.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<ReliabilityEngine> {
        &self.engine
    }

    pub fn send(&self, to: SocketAddr, payload: &Payload, options: SendOptions) -> anyhow::Result<Bytes> {
        trace!("sending {} to {:?} with {:?}", payload, to, options);
        self.engine.send(to, payload, options)
    }

    /// Receives datagrams until [Self::shutdown] is called. Each datagram is processed on the
    ///  worker pool.
    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        // one extra byte to detect oversized datagrams
        let mut buf = vec![0u8; self.config.max_datagram_size + 1];
        loop {
            let (num_read, from) = tokio::select! {
                result = self.receive_socket.recv_from(&mut buf) => match result {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown_signal.notified() => {
                    info!("receive loop shut down");
                    return;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            let submitted = span.in_scope(|| {
                trace!("received datagram from {:?}: {:?}", from, &buf[..num_read]);

                if num_read > self.config.max_datagram_size {
                    debug!("datagram from {:?} exceeds the maximum size - dropping", from);
                    return true;
                }

                let datagram = buf[..num_read].to_vec();
                let engine = self.engine.clone();
                let payload_handler = self.payload_handler.clone();
                let span = span.clone();
                let result = self.worker_pool.submit(move || {
                    let _entered = span.enter();
                    if let Some(payload) = engine.on_datagram(from, &datagram) {
                        payload_handler.on_payload(from, payload);
                    }
                });

                match result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("dropping datagram from {:?}: {}", from, e);
                        false
                    }
                }
            });

            if !submitted {
                info!("worker pool is shut down - terminating receive loop");
                return;
            }
        }
    }

    /// Stops the receive loop, the maintenance tasks and the worker threads. Queued work is
    ///  discarded.
    pub fn shutdown(&self) {
        info!("shutting down end point");
        self.shutdown_signal.notify_one();
        for handle in self.maintenance_tasks.lock().unwrap().drain(..) {
            self.ticker.cancel(handle);
        }
        self.ticker.shutdown();
        self.worker_pool.shutdown();
    }
}
