//! The juggler gateway daemon, backed by the in-process store.
//!
//! Usage: `jugglerd [addr] [echo-workers]`
//!
//! Accepts line-framed juggler connections on `addr` (default
//! 127.0.0.1:9000). When `echo-workers` is nonzero (default 2), an
//! in-process callee pool serves the `echo` URI, answering every call
//! with its own arguments.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use may::go;
use may::net::TcpListener;

use juggler::handler::log_conn;
use juggler::msg::CallPayload;
use juggler::{Callee, Counters, KvBroker, MemoryStore, Server, ServerConfig, TcpTransport};

fn main() {
    env_logger::init();

    let addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:9000".to_owned());
    let echo_workers: usize = env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);

    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(KvBroker::new(store));

    let mut srv = Server::new(broker.clone(), broker.clone());
    srv.config = ServerConfig {
        read_limit: 1 << 20,
        read_timeout: Duration::ZERO,
        write_limit: 1 << 20,
        write_timeout: Duration::from_secs(10),
        acquire_write_lock_timeout: Duration::from_secs(10),
    };
    let counters = Arc::new(Counters::default());
    srv.counters = Some(counters.clone());
    srv.conn_state = Some(Box::new(log_conn));
    let srv = Arc::new(srv);

    go!(move || loop {
        may::coroutine::sleep(Duration::from_secs(60));
        info!("counters: {:?}", counters.snapshot());
    });

    let _pool = if echo_workers > 0 {
        let callee = Callee::new(broker);
        Some(
            callee
                .listen(
                    &["echo"],
                    echo_workers,
                    Arc::new(|cp: &CallPayload| Ok(cp.args.clone())),
                )
                .expect("failed to start echo callees"),
        )
    } else {
        None
    };

    let listener = TcpListener::bind(&addr).expect("failed to bind");
    info!("listening on {addr} with subprotocol {}", juggler::SUBPROTOCOL);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        match TcpTransport::accept(stream) {
            Ok(t) => {
                if let Err(e) = srv.clone().serve(Arc::new(t)) {
                    error!("failed to serve connection: {e}");
                }
            }
            Err(e) => error!("handshake failed: {e}"),
        }
    }
}
