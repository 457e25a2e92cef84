use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;

use crate::target::{
    Target, ERR_RECV, ERR_XMIT, GOOD_IPV4, GOOD_IPV6, GOOD_RECV, GOOD_XMIT, HAPPY, RESP_BUF_SIZE,
};

lazy_static! {
    /// Equivalent of scanning `HTTP/<version> <status>[ <reason>]`.
    static ref STATUS_LINE: Regex = Regex::new(r"^HTTP/\S+\s+(\d+)").unwrap();
}

fn parse_status_line(line: &str) -> Option<u16> {
    STATUS_LINE.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Remaining budget before `deadline` in whole milliseconds, rounded to
/// nearest. `None` once the budget is spent.
fn remaining_ms(deadline: Instant) -> Option<u64> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    let ms = ((deadline - now).as_secs_f64() * 1e3).round() as u64;
    if ms == 0 {
        None
    } else {
        Some(ms)
    }
}

/// One probe attempt against the target's backend; no retries.
///
/// Sets this cycle's verdict bits on the target's bitmaps. Every return path
/// closes the socket; the whole attempt observes the wall-clock deadline
/// `start + spec.timeout`, each blocking call getting the remaining budget.
pub(crate) fn poke(vt: &mut Target) {
    let t_start = Instant::now();
    let deadline = t_start + vt.spec.timeout;

    let mut stream = match vt.pool.open(vt.spec.timeout) {
        Ok(stream) => stream,
        // connect failure is a silent miss
        Err(_) => return,
    };

    match stream.peer_addr() {
        Ok(peer) if peer.is_ipv4() => vt.bitmaps[GOOD_IPV4] |= 1,
        Ok(_) => vt.bitmaps[GOOD_IPV6] |= 1,
        Err(_) => return,
    }

    let Some(tmo) = remaining_ms(deadline) else {
        return;
    };

    // The request goes out in one write; anything short is a transmit
    // failure, and only an outright error earns the error bit.
    let _ = stream.set_write_timeout(Some(Duration::from_millis(tmo)));
    match stream.write(&vt.req) {
        Ok(n) if n == vt.req.len() => vt.bitmaps[GOOD_XMIT] |= 1,
        Ok(_) => return,
        Err(_) => {
            vt.bitmaps[ERR_XMIT] |= 1;
            return;
        }
    }

    // Fill the response-line buffer first, then drain the rest until EOF.
    let mut scratch = [0u8; 1024];
    let mut total = 0usize;
    loop {
        let Some(tmo) = remaining_ms(deadline) else {
            return;
        };
        let _ = stream.set_read_timeout(Some(Duration::from_millis(tmo)));
        let into_resp = vt.resp_len < RESP_BUF_SIZE;
        let read = if into_resp {
            stream.read(&mut vt.resp_buf[vt.resp_len..])
        } else {
            stream.read(&mut scratch)
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if into_resp {
                    vt.resp_len += n;
                }
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                // out of time waiting for the backend
                return;
            }
            Err(_) => {
                vt.bitmaps[ERR_RECV] |= 1;
                return;
            }
        }
    }

    if total == 0 {
        return;
    }

    vt.last = t_start.elapsed().as_secs_f64();
    vt.bitmaps[GOOD_RECV] |= 1;

    // Keep only the status line for parsing and the log.
    if let Some(eol) = vt.resp_buf[..vt.resp_len]
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
    {
        vt.resp_len = eol;
    }
    let line = String::from_utf8_lossy(&vt.resp_buf[..vt.resp_len]);
    if parse_status_line(&line) == Some(vt.spec.expected_status) {
        vt.bitmaps[HAPPY] |= 1;
    }
}
