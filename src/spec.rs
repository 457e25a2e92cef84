use std::time::Duration;

use bytes::Bytes;

/// Probes may keep at most this many results in their sliding window.
pub const MAX_WINDOW: u32 = 64;

/// Parameters controlling how one backend is probed.
///
/// A spec is normalized once at insert time; out-of-range combinations are
/// clamped rather than rejected, so a sloppy configuration still yields a
/// working probe.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    /// Path requested on every probe.
    pub url: String,
    /// Full request override. When non-empty these bytes are sent verbatim
    /// and `url` is ignored.
    pub request: String,
    /// Wall-clock budget for one probe attempt.
    pub timeout: Duration,
    /// Time between consecutive probes of the same backend.
    pub interval: Duration,
    /// Number of most-recent probes considered for health, `1..=64`.
    pub window: u32,
    /// Minimum count of happy probes within the window for healthy status.
    pub threshold: u32,
    /// Synthetic happy probes seeded at insert time. `None` means
    /// `threshold - 1`.
    pub initial: Option<u32>,
    /// Status code a happy probe must return.
    pub expected_status: u16,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            url: "/".to_string(),
            request: String::new(),
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(5),
            window: 8,
            threshold: 3,
            initial: None,
            expected_status: 200,
        }
    }
}

impl ProbeSpec {
    /// Resolves defaults and clamps the window geometry:
    /// `threshold <= window <= 64` and `initial <= threshold`.
    pub fn normalized(mut self) -> Self {
        self.window = self.window.clamp(1, MAX_WINDOW);
        self.threshold = self.threshold.min(self.window);
        let initial = self
            .initial
            .unwrap_or_else(|| self.threshold.saturating_sub(1));
        self.initial = Some(initial.min(self.threshold));
        self
    }

    /// Number of seed probes after normalization.
    pub fn initial_count(&self) -> u32 {
        self.initial.unwrap_or_else(|| self.threshold.saturating_sub(1))
    }

    /// Derives the fixed bytes sent on every probe.
    ///
    /// A non-empty `request` wins verbatim; otherwise a minimal HTTP/1.1
    /// request for `url` is synthesized, with a `Host` header only when the
    /// caller supplies one.
    pub fn build_request(&self, host: Option<&str>) -> Bytes {
        if !self.request.is_empty() {
            return Bytes::copy_from_slice(self.request.as_bytes());
        }
        let mut req = format!("GET {} HTTP/1.1\r\n", self.url);
        if let Some(host) = host {
            req.push_str("Host: ");
            req.push_str(host);
            req.push_str("\r\n");
        }
        req.push_str("Connection: close\r\n\r\n");
        Bytes::from(req.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = ProbeSpec::default().normalized();
        assert_eq!(spec.url, "/");
        assert_eq!(spec.timeout, Duration::from_secs(2));
        assert_eq!(spec.interval, Duration::from_secs(5));
        assert_eq!(spec.window, 8);
        assert_eq!(spec.threshold, 3);
        assert_eq!(spec.initial, Some(2));
        assert_eq!(spec.expected_status, 200);
    }

    #[test]
    fn test_threshold_clamped_to_window() {
        let spec = ProbeSpec {
            window: 4,
            threshold: 10,
            ..Default::default()
        }
        .normalized();
        assert_eq!(spec.window, 4);
        assert_eq!(spec.threshold, 4);
    }

    #[test]
    fn test_window_clamped_to_bitmap_width() {
        let spec = ProbeSpec {
            window: 100,
            ..Default::default()
        }
        .normalized();
        assert_eq!(spec.window, MAX_WINDOW);

        let spec = ProbeSpec {
            window: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(spec.window, 1);
    }

    #[test]
    fn test_initial_clamped_to_threshold() {
        let spec = ProbeSpec {
            threshold: 3,
            initial: Some(7),
            ..Default::default()
        }
        .normalized();
        assert_eq!(spec.initial, Some(3));
    }

    #[test]
    fn test_build_request_with_host() {
        let spec = ProbeSpec::default().normalized();
        let req = spec.build_request(Some("origin.example.com"));
        assert_eq!(
            &req[..],
            b"GET / HTTP/1.1\r\nHost: origin.example.com\r\nConnection: close\r\n\r\n" as &[u8]
        );
    }

    #[test]
    fn test_build_request_without_host() {
        let spec = ProbeSpec {
            url: "/healthz".to_string(),
            ..Default::default()
        }
        .normalized();
        let req = spec.build_request(None);
        assert_eq!(
            &req[..],
            b"GET /healthz HTTP/1.1\r\nConnection: close\r\n\r\n" as &[u8]
        );
    }

    #[test]
    fn test_build_request_verbatim_override() {
        let spec = ProbeSpec {
            request: "PING\r\n\r\n".to_string(),
            ..Default::default()
        }
        .normalized();
        let req = spec.build_request(Some("ignored.example.com"));
        assert_eq!(&req[..], b"PING\r\n\r\n" as &[u8]);
    }
}
