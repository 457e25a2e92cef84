use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// One upstream origin as seen by request routing.
///
/// The poller thread owns the health information; the backend only carries
/// the published view of it. `healthy` is atomic so the request path can
/// consult it without touching the poller lock.
#[derive(Debug)]
pub struct Backend {
    name: String,
    addr_v4: Option<SocketAddr>,
    addr_v6: Option<SocketAddr>,
    healthy: AtomicBool,
    happy: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    changed: Option<SystemTime>,
    probe: Option<usize>,
}

impl Backend {
    /// Creates a backend with explicit IPv4/IPv6 probe candidates. A backend
    /// starts out healthy until a probe says otherwise.
    pub fn new(
        name: impl Into<String>,
        addr_v4: Option<SocketAddr>,
        addr_v6: Option<SocketAddr>,
    ) -> Self {
        if let Some(a) = addr_v4 {
            assert!(a.is_ipv4(), "addr_v4 must be an IPv4 address");
        }
        if let Some(a) = addr_v6 {
            assert!(a.is_ipv6(), "addr_v6 must be an IPv6 address");
        }
        Self {
            name: name.into(),
            addr_v4,
            addr_v6,
            healthy: AtomicBool::new(true),
            happy: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Creates a backend from a single address, filed under its family.
    pub fn with_address(name: impl Into<String>, addr: SocketAddr) -> Self {
        if addr.is_ipv4() {
            Self::new(name, Some(addr), None)
        } else {
            Self::new(name, None, Some(addr))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr_v4(&self) -> Option<SocketAddr> {
        self.addr_v4
    }

    pub fn addr_v6(&self) -> Option<SocketAddr> {
        self.addr_v6
    }

    /// Current aggregate health, as published by the poller.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// When the health state last flipped, if it ever has.
    pub fn health_changed(&self) -> Option<SystemTime> {
        self.inner.lock().unwrap().changed
    }

    /// The latest happy bitmap, bit 0 newest.
    pub fn happy_bitmap(&self) -> u64 {
        self.happy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn stamp_changed(&self) {
        self.inner.lock().unwrap().changed = Some(SystemTime::now());
    }

    pub(crate) fn publish_happy(&self, happy: u64) {
        self.happy.store(happy, Ordering::SeqCst);
    }

    pub(crate) fn probe_slot(&self) -> Option<usize> {
        self.inner.lock().unwrap().probe
    }

    /// Installs (or clears) the probe slot id, returning the previous one.
    pub(crate) fn set_probe_slot(&self, slot: Option<usize>) -> Option<usize> {
        std::mem::replace(&mut self.inner.lock().unwrap().probe, slot)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
