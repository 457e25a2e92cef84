use std::borrow::Cow;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use log::info;

use crate::backend::Backend;
use crate::conn::ConnectionPool;
use crate::spec::ProbeSpec;

/// Smoothing cap for the response-time moving average.
const AVG_RATE: u64 = 4;

/// Size of the response-line buffer; anything past this is drained and
/// discarded.
pub(crate) const RESP_BUF_SIZE: usize = 128;

pub(crate) struct BitmapDesc {
    pub glyph: char,
    pub label: &'static str,
    pub always_show: bool,
}

pub(crate) const GOOD_IPV4: usize = 0;
pub(crate) const GOOD_IPV6: usize = 1;
pub(crate) const ERR_XMIT: usize = 2;
pub(crate) const GOOD_XMIT: usize = 3;
pub(crate) const ERR_RECV: usize = 4;
pub(crate) const GOOD_RECV: usize = 5;
pub(crate) const HAPPY: usize = 6;

/// The history criteria, in render and summary order.
pub(crate) const BITMAPS: [BitmapDesc; 7] = [
    BitmapDesc { glyph: '4', label: "Good IPv4", always_show: false },
    BitmapDesc { glyph: '6', label: "Good IPv6", always_show: false },
    BitmapDesc { glyph: 'x', label: "Error Xmit", always_show: false },
    BitmapDesc { glyph: 'X', label: "Good Xmit", always_show: false },
    BitmapDesc { glyph: 'r', label: "Error Recv", always_show: false },
    BitmapDesc { glyph: 'R', label: "Good Recv", always_show: false },
    BitmapDesc { glyph: 'H', label: "Happy", always_show: true },
];

pub(crate) const NBITMAPS: usize = BITMAPS.len();

fn window_mask(window: u32) -> u64 {
    if window >= 64 {
        u64::MAX
    } else {
        (1u64 << window) - 1
    }
}

/// Per-backend probe state.
///
/// While a probe task is running this struct is checked out of the poller's
/// slot table and mutated by that task alone; no lock covers the fields.
pub(crate) struct Target {
    pub(crate) spec: ProbeSpec,
    pub(crate) req: Bytes,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) bitmaps: [u64; NBITMAPS],
    pub(crate) resp_buf: [u8; RESP_BUF_SIZE],
    pub(crate) resp_len: usize,
    /// RTT of the last answered probe, seconds.
    pub(crate) last: f64,
    avg: f64,
    rate: u64,
    pub(crate) good: u32,
    bits: [u8; NBITMAPS],
}

impl Target {
    pub(crate) fn new(spec: ProbeSpec, req: Bytes, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            spec,
            req,
            pool,
            bitmaps: [0; NBITMAPS],
            resp_buf: [0; RESP_BUF_SIZE],
            resp_len: 0,
            last: 0.0,
            avg: 0.0,
            rate: 0,
            good: 0,
            bits: [b'-'; NBITMAPS],
        }
    }

    /// Opens a probe cycle: shifts every history bitmap so bit 0 awaits this
    /// probe's verdicts, and clears the per-probe scratch.
    pub(crate) fn start_poke(&mut self) {
        for map in &mut self.bitmaps {
            *map <<= 1;
        }
        self.last = 0.0;
        self.resp_buf = [0; RESP_BUF_SIZE];
        self.resp_len = 0;
    }

    /// Closes a probe cycle: folds the RTT into the moving average when the
    /// probe was happy, renders the one-glyph-per-criterion summary, and
    /// recounts `good` over the window.
    pub(crate) fn has_poked(&mut self) {
        if self.bitmaps[HAPPY] & 1 != 0 {
            if self.rate < AVG_RATE {
                self.rate += 1;
            }
            self.avg += (self.last - self.avg) / self.rate as f64;
        }
        for (i, desc) in BITMAPS.iter().enumerate() {
            self.bits[i] = if self.bitmaps[i] & 1 != 0 {
                desc.glyph as u8
            } else {
                b'-'
            };
        }
        self.good = (self.bitmaps[HAPPY] & window_mask(self.spec.window)).count_ones();
    }

    /// Drives the backend's two-state health machine from the current `good`
    /// count and emits the health log line. Caller holds the poller mutex.
    pub(crate) fn publish(&self, backend: &Backend) {
        let now_healthy = self.good >= self.spec.threshold;
        let label = match (backend.is_healthy(), now_healthy) {
            (true, true) => "Still healthy",
            (true, false) => "Went sick",
            (false, true) => "Back healthy",
            (false, false) => "Still sick",
        };
        if backend.is_healthy() != now_healthy {
            backend.set_healthy(now_healthy);
            backend.stamp_changed();
        }
        info!(
            target: "backend_health",
            "{} {} {} {} {} {} {:.6} {:.6} {}",
            backend.name(),
            label,
            self.bits_summary(),
            self.good,
            self.spec.threshold,
            self.spec.window,
            self.last,
            self.avg,
            self.resp_line(),
        );
        backend.publish_happy(self.bitmaps[HAPPY]);
    }

    /// Preloads the history with synthetic happy probes so a freshly
    /// inserted backend is not falsely reported sick.
    pub(crate) fn seed(&mut self, backend: &Backend) {
        let initial = self.spec.initial_count();
        for _ in 0..initial {
            self.start_poke();
            self.bitmaps[HAPPY] |= 1;
            self.has_poked();
            self.publish(backend);
        }
    }

    pub(crate) fn bits_summary(&self) -> &str {
        // always ASCII by construction
        std::str::from_utf8(&self.bits).unwrap()
    }

    /// The saved response status line, truncated at the buffer limit.
    pub(crate) fn resp_line(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.resp_buf[..self.resp_len])
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            bitmaps: self.bitmaps,
            good: self.good,
            window: self.spec.window,
            threshold: self.spec.threshold,
            avg: self.avg,
        }
    }

    #[cfg(test)]
    pub(crate) fn avg(&self) -> f64 {
        self.avg
    }
}

/// Copy of a target's renderable state, refreshed each time a probe cycle
/// publishes. Status requests read this instead of the live target, which a
/// running task may own.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusSnapshot {
    pub bitmaps: [u64; NBITMAPS],
    pub good: u32,
    pub window: u32,
    pub threshold: u32,
    pub avg: f64,
}

impl StatusSnapshot {
    pub(crate) fn render_brief(&self, w: &mut dyn io::Write) -> io::Result<()> {
        write!(w, "{}/{}", self.good, self.window)
    }

    pub(crate) fn render_details(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(
            w,
            "Current states  good: {:2} threshold: {:2} window: {:2}",
            self.good, self.threshold, self.window
        )?;
        writeln!(w, "Average response time of good probes: {:.6}", self.avg)?;
        writeln!(w, "Oldest {} Newest", "=".repeat(50))?;
        for (i, desc) in BITMAPS.iter().enumerate() {
            let map = self.bitmaps[i];
            if map == 0 && !desc.always_show {
                continue;
            }
            let mut row = String::with_capacity(64);
            for bit in (0..64).rev() {
                row.push(if map >> bit & 1 != 0 { desc.glyph } else { '-' });
            }
            writeln!(w, "{} {}", row, desc.label)?;
        }
        Ok(())
    }
}
