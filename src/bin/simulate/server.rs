use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Exp};

/// How a simulated origin treats probe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Always answers 200.
    Healthy,
    /// Always answers 500.
    Sick,
    /// Fails the given percentage of requests.
    Flaky(u32),
    /// Accepts and reads the request, then never answers.
    Stalling,
}

/// A fake origin server listening on a loopback port.
pub struct OriginServer {
    pub addr: SocketAddr,
    pub behavior: Behavior,
    hits: Arc<AtomicUsize>,
    _thread: thread::JoinHandle<()>,
}

impl OriginServer {
    pub fn spawn(behavior: Behavior, mean_latency_ms: f64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind origin server");
        let addr = listener.local_addr().expect("origin server has no address");
        let hits = Arc::new(AtomicUsize::new(0));

        let thread_hits = Arc::clone(&hits);
        let _thread = thread::spawn(move || {
            let latency = Exp::new(1.0 / mean_latency_ms.max(0.001)).unwrap();
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                thread_hits.fetch_add(1, Ordering::SeqCst);

                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf);

                let wait = latency.sample(&mut rand::thread_rng());
                thread::sleep(Duration::from_secs_f64(wait / 1e3));

                let status = match behavior {
                    Behavior::Healthy => 200,
                    Behavior::Sick => 500,
                    Behavior::Flaky(percent) => {
                        if rand::thread_rng().gen_range(0..100) < percent {
                            500
                        } else {
                            200
                        }
                    }
                    Behavior::Stalling => {
                        // hold the connection open until the probe gives up
                        thread::sleep(Duration::from_secs(60));
                        continue;
                    }
                };
                let _ = stream.write_all(
                    format!("HTTP/1.1 {} Simulated\r\nConnection: close\r\n\r\n", status)
                        .as_bytes(),
                );
            }
        });

        Self {
            addr,
            behavior,
            hits,
            _thread,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}
