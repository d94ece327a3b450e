//! Connection and resume rate limiting.
//!
//! Two independent limiters gate the session lifecycle: one keyed by
//! client IP for fresh connection attempts, one keyed by session ID for
//! resume attempts (a more sensitive operation, since it targets a
//! specific prior session). Both are pure in-memory counters; absence
//! of a record means "not yet seen, admit".

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Fixed window for resume attempts.
const RESUME_WINDOW: Duration = Duration::from_secs(60);
/// Fixed block duration after a resume-limit violation.
const RESUME_BLOCK: Duration = Duration::from_secs(300);
/// Session entries older than this are swept.
const RESUME_ENTRY_TTL: Duration = Duration::from_secs(600);

/// Rate limiting configuration, loaded from the `[ratelimit]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Connection attempts admitted per IP per window.
    pub connection_limit: u32,
    /// Connection window length in seconds.
    pub connection_window_secs: u64,
    /// Resume attempts admitted per session ID per minute.
    pub resume_limit: u32,
    /// Limit multiplier for loopback clients (subject to the proxy guard).
    pub localhost_multiplier: u32,
    /// Disable the loopback exemption entirely.
    pub disable_localhost_exemption: bool,
    /// Honor forwarded-for headers from trusted proxies.
    pub trust_proxy: bool,
    /// Socket peers allowed to set forwarded-for headers.
    pub trusted_proxies: Vec<IpAddr>,
    /// Bypass all limiting; every admission call returns true.
    /// Required so correctness tests are not flaky under shared CI load.
    pub test_mode: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connection_limit: 30,
            connection_window_secs: 60,
            resume_limit: 5,
            localhost_multiplier: 10,
            disable_localhost_exemption: false,
            trust_proxy: false,
            trusted_proxies: Vec::new(),
            test_mode: false,
        }
    }
}

/// Counter state for one IP or one session ID.
#[derive(Debug, Clone)]
struct Entry {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked_until: None,
        }
    }
}

/// In-memory rate limiter for connection and resume admission.
pub struct RateLimiter {
    config: RateLimitConfig,
    connection_window: Duration,
    by_ip: DashMap<IpAddr, Entry>,
    by_session: DashMap<String, Entry>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let connection_window = Duration::from_secs(config.connection_window_secs.max(1));
        Self {
            config,
            connection_window,
            by_ip: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Extract the effective client IP for a connection.
    ///
    /// Forwarded-for headers are honored only when proxy trust is
    /// configured *and* the immediate socket peer is in the proxy
    /// allow-list; anything else would let arbitrary clients spoof
    /// their address. Returns the IP and whether forwarded headers
    /// were present on the request.
    pub fn client_ip(&self, peer: SocketAddr, headers: &HeaderMap) -> (IpAddr, bool) {
        let forwarded = forwarded_ip(headers);
        let forwarded_present = forwarded.is_some()
            || headers.contains_key("x-forwarded-for")
            || headers.contains_key("x-real-ip");

        if self.config.trust_proxy
            && self.config.trusted_proxies.contains(&peer.ip())
            && let Some(ip) = forwarded
        {
            return (ip, forwarded_present);
        }

        (peer.ip(), forwarded_present)
    }

    /// Admit or reject a fresh connection attempt from `ip`.
    ///
    /// A violation does not merely cap the window: the IP is blocked
    /// for the remainder of the current window plus one full additional
    /// window.
    pub fn admit_connection(&self, ip: IpAddr, forwarded_present: bool) -> bool {
        if self.config.test_mode {
            return true;
        }

        let now = Instant::now();
        let limit = self.effective_connection_limit(ip, forwarded_present);
        let mut entry = self.by_ip.entry(ip).or_insert_with(|| Entry::new(now));

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return false;
            }
            *entry = Entry::new(now);
        }

        if now.duration_since(entry.window_start) >= self.connection_window {
            *entry = Entry::new(now);
        }

        entry.count += 1;
        if entry.count > limit {
            // Block through the end of this window plus one more.
            entry.blocked_until = Some(entry.window_start + self.connection_window * 2);
            warn!("rate limit exceeded for {}, blocking", ip);
            return false;
        }

        true
    }

    /// Admit or reject a resume attempt for `session_id`.
    ///
    /// Fixed 1-minute window and fixed 5-minute block, independent of
    /// the IP limiter's configuration.
    pub fn admit_resume(&self, session_id: &str) -> bool {
        if self.config.test_mode {
            return true;
        }

        let now = Instant::now();
        let mut entry = self
            .by_session
            .entry(session_id.to_string())
            .or_insert_with(|| Entry::new(now));

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return false;
            }
            *entry = Entry::new(now);
        }

        if now.duration_since(entry.window_start) >= RESUME_WINDOW {
            *entry = Entry::new(now);
        }

        entry.count += 1;
        if entry.count > self.config.resume_limit {
            entry.blocked_until = Some(now + RESUME_BLOCK);
            warn!("resume rate limit exceeded for session {}", short_id(session_id));
            return false;
        }

        true
    }

    /// Effective per-window limit for an IP.
    ///
    /// The loopback multiplier applies only when no reverse proxy can
    /// be in the path: a proxy running on the loopback interface would
    /// otherwise turn the exemption into a trivial bypass.
    fn effective_connection_limit(&self, ip: IpAddr, forwarded_present: bool) -> u32 {
        let base = self.config.connection_limit;
        let exempt = ip.is_loopback()
            && !self.config.trust_proxy
            && !forwarded_present
            && !self.config.disable_localhost_exemption;
        if exempt {
            base.saturating_mul(self.config.localhost_multiplier.max(1))
        } else {
            base
        }
    }

    /// Drop stale entries to bound memory growth.
    pub fn sweep(&self) {
        let now = Instant::now();
        let ip_ttl = self.connection_window * 2;
        self.by_ip.retain(|_, entry| {
            entry
                .blocked_until
                .map(|until| now < until)
                .unwrap_or_else(|| now.duration_since(entry.window_start) < ip_ttl)
        });
        self.by_session.retain(|_, entry| {
            entry
                .blocked_until
                .map(|until| now < until)
                .unwrap_or_else(|| now.duration_since(entry.window_start) < RESUME_ENTRY_TTL)
        });
        debug!(
            "rate limiter sweep: {} ip entries, {} session entries remain",
            self.by_ip.len(),
            self.by_session.len()
        );
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.connection_window;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        })
    }

    /// Snapshot for the `/stats` endpoint.
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let blocked_ips = self
            .by_ip
            .iter()
            .filter(|e| e.blocked_until.is_some_and(|u| now < u))
            .count();
        RateLimiterStats {
            ip_entries: self.by_ip.len(),
            session_entries: self.by_session.len(),
            blocked_ips,
        }
    }
}

/// Operational snapshot of limiter state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub ip_entries: usize,
    pub session_entries: usize,
    pub blocked_ips: usize,
}

/// First usable address from forwarded-for style headers.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(value) = headers.get("x-forwarded-for")
        && let Ok(text) = value.to_str()
        && let Some(first) = text.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
}

/// Short prefix of an identifier, safe for log correlation.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn remote_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_blocks() {
        let l = limiter(RateLimitConfig {
            connection_limit: 3,
            ..Default::default()
        });
        let ip = remote_ip();
        for _ in 0..3 {
            assert!(l.admit_connection(ip, false));
        }
        assert!(!l.admit_connection(ip, false));
        // Still blocked even after more attempts.
        assert!(!l.admit_connection(ip, false));
    }

    #[tokio::test(start_paused = true)]
    async fn block_spans_remainder_plus_full_window() {
        let l = limiter(RateLimitConfig {
            connection_limit: 1,
            connection_window_secs: 60,
            ..Default::default()
        });
        let ip = remote_ip();
        assert!(l.admit_connection(ip, false));
        assert!(!l.admit_connection(ip, false)); // blocked at window start

        // One window later: a plain cap would have reset, but the block
        // covers a second full window.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!l.admit_connection(ip, false));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(l.admit_connection(ip, false));
    }

    #[tokio::test(start_paused = true)]
    async fn window_reset_without_violation() {
        let l = limiter(RateLimitConfig {
            connection_limit: 2,
            connection_window_secs: 60,
            ..Default::default()
        });
        let ip = remote_ip();
        assert!(l.admit_connection(ip, false));
        assert!(l.admit_connection(ip, false));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(l.admit_connection(ip, false));
    }

    #[tokio::test(start_paused = true)]
    async fn loopback_exemption_multiplies_limit() {
        let l = limiter(RateLimitConfig {
            connection_limit: 2,
            localhost_multiplier: 3,
            ..Default::default()
        });
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..6 {
            assert!(l.admit_connection(lo, false));
        }
        assert!(!l.admit_connection(lo, false));
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_headers_void_loopback_exemption() {
        // Apparent loopback with forwarded headers implies a proxy in
        // the path; the base limit must apply.
        let l = limiter(RateLimitConfig {
            connection_limit: 2,
            localhost_multiplier: 10,
            ..Default::default()
        });
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(l.admit_connection(lo, true));
        assert!(l.admit_connection(lo, true));
        assert!(!l.admit_connection(lo, true));
    }

    #[tokio::test(start_paused = true)]
    async fn trust_proxy_voids_loopback_exemption() {
        let l = limiter(RateLimitConfig {
            connection_limit: 2,
            localhost_multiplier: 10,
            trust_proxy: true,
            ..Default::default()
        });
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(l.admit_connection(lo, false));
        assert!(l.admit_connection(lo, false));
        assert!(!l.admit_connection(lo, false));
    }

    #[tokio::test(start_paused = true)]
    async fn disable_flag_voids_loopback_exemption() {
        let l = limiter(RateLimitConfig {
            connection_limit: 1,
            localhost_multiplier: 10,
            disable_localhost_exemption: true,
            ..Default::default()
        });
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(l.admit_connection(lo, false));
        assert!(!l.admit_connection(lo, false));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_limit_blocks_for_five_minutes() {
        let l = limiter(RateLimitConfig {
            resume_limit: 2,
            ..Default::default()
        });
        assert!(l.admit_resume("sess-1"));
        assert!(l.admit_resume("sess-1"));
        assert!(!l.admit_resume("sess-1"));

        tokio::time::advance(Duration::from_secs(240)).await;
        assert!(!l.admit_resume("sess-1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(l.admit_resume("sess-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_limits_are_per_session() {
        let l = limiter(RateLimitConfig {
            resume_limit: 1,
            ..Default::default()
        });
        assert!(l.admit_resume("a"));
        assert!(!l.admit_resume("a"));
        assert!(l.admit_resume("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_bypasses_everything() {
        let l = limiter(RateLimitConfig {
            connection_limit: 0,
            resume_limit: 0,
            test_mode: true,
            ..Default::default()
        });
        let ip = remote_ip();
        for _ in 0..100 {
            assert!(l.admit_connection(ip, false));
            assert!(l.admit_resume("s"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_stale_entries_keeps_blocked() {
        let l = limiter(RateLimitConfig {
            connection_limit: 1,
            connection_window_secs: 60,
            ..Default::default()
        });
        let a = remote_ip();
        let b = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8));
        assert!(l.admit_connection(a, false));
        assert!(l.admit_connection(b, false));
        assert!(!l.admit_connection(b, false)); // b now blocked

        tokio::time::advance(Duration::from_secs(121)).await;
        l.sweep();
        let stats = l.stats();
        // a's window is stale and swept; b's block (through second
        // window end) just elapsed too.
        assert_eq!(stats.ip_entries, 0);
    }

    #[test]
    fn client_ip_ignores_forwarded_from_untrusted_peer() {
        let l = limiter(RateLimitConfig::default());
        let peer: SocketAddr = "203.0.113.7:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        let (ip, forwarded) = l.client_ip(peer, &headers);
        assert_eq!(ip, peer.ip());
        assert!(forwarded);
    }

    #[test]
    fn client_ip_honors_forwarded_from_trusted_proxy() {
        let l = limiter(RateLimitConfig {
            trust_proxy: true,
            trusted_proxies: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        });
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.1".parse().unwrap());
        let (ip, _) = l.client_ip(peer, &headers);
        assert_eq!(ip, "198.51.100.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
