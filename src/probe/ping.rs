//! ICMP echo prober with native sockets (high-precision) and command fallback.
//!
//! The socket exchange runs in spawn_blocking for sub-millisecond timing precision.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{loss_percent, resolve_address, EchoReply, ProbeError, ProbeStats, Prober};

/// Delay between two consecutive echo requests of one cycle.
pub const ECHO_INTERVAL: Duration = Duration::from_secs(1);

/// Size of an echo request: 8 byte header + 56 byte payload.
const PACKET_SIZE: usize = 64;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// The production [`Prober`]: real ICMP echoes, falling back to the system
/// `ping` binary when the process may not open ICMP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpProber;

impl IcmpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError> {
        resolve_address(host).await
    }

    async fn ping(
        &self,
        addr: IpAddr,
        count: usize,
        timeout: Duration,
        replies: mpsc::UnboundedSender<EchoReply>,
    ) -> Result<ProbeStats, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Native {
            let native_replies = replies.clone();
            let result = tokio::task::spawn_blocking(move || {
                run_blocking_ping(addr, count, timeout, &native_replies)
            })
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

            match result {
                Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                    tracing::warn!(
                        "Native ping failed with permission error for {}, falling back to command: {}",
                        addr,
                        msg
                    );
                }
                other => return other,
            }
        }

        run_ping_command(addr, count, timeout, &replies).await
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Per address family ICMP parameters.
#[derive(Debug, Clone, Copy)]
struct IcmpFamily {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
}

impl IcmpFamily {
    fn for_addr(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self {
                domain: Domain::IPV4,
                protocol: Protocol::ICMPV4,
                request_type: 8,
                reply_type: 0,
            },
            IpAddr::V6(_) => Self {
                domain: Domain::IPV6,
                protocol: Protocol::ICMPV6,
                request_type: 128,
                reply_type: 129,
            },
        }
    }

    fn is_v4(&self) -> bool {
        self.domain == Domain::IPV4
    }
}

/// An open ICMP socket and whether the kernel owns the echo identifier.
struct EchoSocket {
    socket: Socket,
    /// DGRAM sockets get their identifier rewritten by the kernel and only
    /// ever see replies addressed to them.
    kernel_identifier: bool,
}

fn open_socket(family: IcmpFamily, ip: IpAddr, timeout: Duration) -> Result<EchoSocket, ProbeError> {
    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, kernel_identifier) =
        match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
            Ok(s) => (s, false),
            Err(_) => {
                let s = Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
                    .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;
                (s, true)
            }
        };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    Ok(EchoSocket {
        socket,
        kernel_identifier,
    })
}

/// Run one cycle of echo requests with precise timing.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(
    ip: IpAddr,
    count: usize,
    timeout: Duration,
    replies: &mpsc::UnboundedSender<EchoReply>,
) -> Result<ProbeStats, ProbeError> {
    let family = IcmpFamily::for_addr(ip);
    let echo = open_socket(family, ip, timeout)?;
    let identifier: u16 = rand::random();

    let start = Instant::now();
    let deadline = start + timeout;
    let mut next_send = start;
    let mut sent_at: Vec<Instant> = Vec::with_capacity(count);
    let mut received = vec![false; count];
    let mut rtts: Vec<Duration> = Vec::with_capacity(count);

    loop {
        let now = Instant::now();

        if sent_at.len() < count && now >= next_send && now < deadline {
            let seq = sent_at.len() as u16;
            let packet = build_echo_request(family, identifier, seq);
            echo.socket.send(&packet).map_err(|e| {
                if e.kind() == ErrorKind::PermissionDenied {
                    ProbeError::Network(format!("Permission denied: {}", e))
                } else {
                    ProbeError::Network(format!("Failed to send: {}", e))
                }
            })?;
            // Start timing just after send
            sent_at.push(Instant::now());
            next_send += ECHO_INTERVAL;
            continue;
        }

        if rtts.len() == count || now >= deadline {
            break;
        }

        let wake = if sent_at.len() < count {
            next_send.min(deadline)
        } else {
            deadline
        };
        let wait = wake.saturating_duration_since(now);
        if wait.is_zero() {
            continue;
        }
        echo.socket
            .set_read_timeout(Some(wait))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = match echo.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProbeError::Network(format!("Failed to receive: {}", e))),
        };
        // Stop timing immediately after receive
        let arrived = Instant::now();
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let expected_id = (!echo.kernel_identifier).then_some(identifier);
        let Some(seq) = parse_echo_reply(family, buf, expected_id) else {
            // Received something else, keep waiting
            continue;
        };

        let idx = seq as usize;
        if idx >= sent_at.len() || received[idx] {
            continue;
        }
        received[idx] = true;

        let rtt = arrived.duration_since(sent_at[idx]);
        rtts.push(rtt);
        let _ = replies.send(EchoReply {
            seq,
            bytes: len,
            addr: ip,
            rtt,
        });
    }

    Ok(ProbeStats::from_rtts(ip, sent_at.len(), &rtts))
}

/// Build an ICMP or ICMPv6 Echo Request packet (code 0).
fn build_echo_request(family: IcmpFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];

    packet[0] = family.request_type;
    packet[1] = 0; // Code: 0
    // Checksum at [2..4], computed later
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Fill payload with timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum (it covers a pseudo-header)
    if family.is_v4() {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Extract the sequence number of an echo reply.
///
/// Raw IPv4 sockets deliver the IP header in front of the ICMP message.
/// When `identifier` is set, replies carrying another identifier are ignored.
fn parse_echo_reply(family: IcmpFamily, buf: &[u8], identifier: Option<u16>) -> Option<u16> {
    let offset = if family.is_v4() && !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0f) as usize) * 4
    } else {
        0
    };

    let icmp = buf.get(offset..offset + 8)?;
    if icmp[0] != family.reply_type {
        return None;
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    if identifier.is_some_and(|id| id != reply_id) {
        return None;
    }

    Some(u16::from_be_bytes([icmp[6], icmp[7]]))
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Seconds handed to `ping` as its overall deadline. The last second of
/// `timeout` is left for the process to print its summary and exit.
fn command_deadline_secs(timeout: Duration) -> u64 {
    timeout.as_secs().saturating_sub(1).max(1)
}

/// Arguments for a `ping` run that stops after `count` replies or at the
/// deadline, whichever comes first.
fn ping_command_args(addr: IpAddr, count: usize, timeout: Duration) -> Vec<String> {
    // -w on Linux and -t on BSD/macOS bound the whole run, not each reply.
    let deadline_flag = if cfg!(target_os = "linux") { "-w" } else { "-t" };
    vec![
        "-c".to_string(),
        count.to_string(),
        deadline_flag.to_string(),
        command_deadline_secs(timeout).to_string(),
        addr.to_string(),
    ]
}

/// Run ping via command execution (fallback).
async fn run_ping_command(
    addr: IpAddr,
    count: usize,
    timeout: Duration,
    replies: &mpsc::UnboundedSender<EchoReply>,
) -> Result<ProbeStats, ProbeError> {
    let mut command = Command::new("ping");
    command
        .args(ping_command_args(addr, count, timeout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_output(addr, &stdout) {
        Some(parsed) => {
            for reply in parsed.replies {
                let _ = replies.send(reply);
            }
            Ok(parsed.stats)
        }
        None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProbeError::Command(format!(
                "failed to parse ping output: {}{}",
                stdout, stderr
            )))
        }
    }
}

/// Replies and statistics recovered from `ping` command output.
#[derive(Debug)]
struct ParsedPing {
    replies: Vec<EchoReply>,
    stats: ProbeStats,
}

/// Parse ping command output for per-reply times and the summary.
///
/// Returns `None` when the output carries no transmitted/received summary.
fn parse_ping_output(addr: IpAddr, output: &str) -> Option<ParsedPing> {
    // Per-packet response "64 bytes from ...: icmp_seq=1 ttl=117 time=12.345 ms"
    static REPLY: OnceLock<Regex> = OnceLock::new();
    let reply_re = REPLY.get_or_init(|| {
        Regex::new(r"(?P<bytes>\d+) bytes from .*icmp_seq=(?P<seq>\d+).*time[=<](?P<time>[0-9.]+)\s*ms")
            .unwrap()
    });

    // "5 packets transmitted, 4 received" (Linux) / "4 packets received" (macOS)
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary_re = SUMMARY.get_or_init(|| {
        Regex::new(r"(?P<sent>\d+) packets transmitted, (?P<recv>\d+) (?:packets )?received").unwrap()
    });

    // "rtt min/avg/max/mdev = ..." (Linux) / "round-trip min/avg/max/stddev = ..." (macOS)
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt_re = RTT.get_or_init(|| {
        Regex::new(r"min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)/([0-9.]+)").unwrap()
    });

    let replies: Vec<EchoReply> = reply_re
        .captures_iter(output)
        .filter_map(|caps| {
            Some(EchoReply {
                seq: caps["seq"].parse().ok()?,
                bytes: caps["bytes"].parse().ok()?,
                addr,
                rtt: millis(caps["time"].parse().ok()?),
            })
        })
        .collect();

    let summary = summary_re.captures(output)?;
    let sent: usize = summary["sent"].parse().ok()?;
    let received: usize = summary["recv"].parse().ok()?;

    let mut stats = ProbeStats::from_rtts(addr, sent, &[]);
    stats.packets_received = received;
    stats.loss_percent = loss_percent(sent, received);

    if let Some(caps) = rtt_re.captures(output) {
        let field = |i: usize| caps[i].parse::<f64>().ok().map(millis);
        stats.min_rtt = field(1)?;
        stats.avg_rtt = field(2)?;
        stats.max_rtt = field(3)?;
        stats.stddev_rtt = field(4)?;
    }

    Some(ParsedPing { replies, stats })
}

fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4() -> IcmpFamily {
        IcmpFamily::for_addr("127.0.0.1".parse().unwrap())
    }

    fn v6() -> IcmpFamily {
        IcmpFamily::for_addr("::1".parse().unwrap())
    }

    #[test]
    fn test_icmp_checksum() {
        let mut packet = vec![0u8; 8];
        packet[0] = 8; // Echo request
        packet[4] = 0x12; // ID high
        packet[5] = 0x34; // ID low
        packet[7] = 0x01; // Seq low

        // 0x0800 + 0x1234 + 0x0001 = 0x1a35
        assert_eq!(icmp_checksum(&packet), !0x1a35u16);

        // A packet carrying its own checksum sums to zero
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0x01]), !0x0100u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_echo_request(v4(), 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmpv6_packet() {
        let packet = build_echo_request(v6(), 0xabcd, 0x0002);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet[6..8], [0x00, 0x02]);
    }

    #[test]
    fn test_parse_echo_reply_dgram() {
        let mut reply = build_echo_request(v4(), 0x1234, 7);
        reply[0] = 0;
        assert_eq!(parse_echo_reply(v4(), &reply, None), Some(7));
        assert_eq!(parse_echo_reply(v4(), &reply, Some(0x1234)), Some(7));
        assert_eq!(parse_echo_reply(v4(), &reply, Some(0x9999)), None);
    }

    #[test]
    fn test_parse_echo_reply_raw_with_ip_header() {
        let mut reply = build_echo_request(v4(), 0x1234, 3);
        reply[0] = 0;
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45; // IPv4, 5 words
        datagram.extend_from_slice(&reply);
        assert_eq!(parse_echo_reply(v4(), &datagram, Some(0x1234)), Some(3));
    }

    #[test]
    fn test_parse_echo_reply_ignores_requests_and_short_packets() {
        let request = build_echo_request(v4(), 0x1234, 3);
        assert_eq!(parse_echo_reply(v4(), &request, None), None);
        assert_eq!(parse_echo_reply(v4(), &[0, 0, 0], None), None);

        let mut reply = build_echo_request(v6(), 1, 9);
        reply[0] = 129;
        assert_eq!(parse_echo_reply(v6(), &reply, Some(1)), Some(9));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=14.1 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 12.300/13.200/14.100/0.900 ms"#;
        let addr: IpAddr = "8.8.8.8".parse().unwrap();
        let parsed = parse_ping_output(addr, output).unwrap();

        assert_eq!(parsed.replies.len(), 2);
        assert_eq!(parsed.replies[0].seq, 1);
        assert_eq!(parsed.replies[0].bytes, 64);
        assert!((parsed.replies[1].rtt.as_secs_f64() - 0.0141).abs() < 1e-8);

        let stats = parsed.stats;
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_received, 2);
        assert!((stats.loss_percent - 100.0 / 3.0).abs() < 1e-9);
        assert!((stats.min_rtt.as_secs_f64() - 0.0123).abs() < 1e-8);
        assert!((stats.avg_rtt.as_secs_f64() - 0.0132).abs() < 1e-8);
        assert!((stats.max_rtt.as_secs_f64() - 0.0141).abs() < 1e-8);
        assert!((stats.stddev_rtt.as_secs_f64() - 0.0009).abs() < 1e-8);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes
64 bytes from 142.250.69.174: icmp_seq=0 ttl=117 time=17.906 ms

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let addr: IpAddr = "142.250.69.174".parse().unwrap();
        let parsed = parse_ping_output(addr, output).unwrap();
        assert_eq!(parsed.replies.len(), 1);
        assert_eq!(parsed.stats.packets_received, 1);
        assert_eq!(parsed.stats.loss_percent, 0.0);
        assert!((parsed.stats.avg_rtt.as_secs_f64() - 0.017906).abs() < 1e-8);
    }

    #[test]
    fn test_parse_ping_output_total_loss() {
        let output = r#"PING 10.255.255.1 (10.255.255.1) 56(84) bytes of data.

--- 10.255.255.1 ping statistics ---
5 packets transmitted, 0 received, 100% packet loss, time 4099ms
"#;
        let addr: IpAddr = "10.255.255.1".parse().unwrap();
        let parsed = parse_ping_output(addr, output).unwrap();
        assert!(parsed.replies.is_empty());
        assert_eq!(parsed.stats.loss_percent, 100.0);
        assert_eq!(parsed.stats.avg_rtt, Duration::ZERO);
    }

    #[test]
    fn test_ping_command_stays_within_timeout() {
        let deadline_flag = if cfg!(target_os = "linux") { "-w" } else { "-t" };
        let args = ping_command_args(IpAddr::from([127, 0, 0, 1]), 5, Duration::from_secs(15));
        assert_eq!(args, vec!["-c", "5", deadline_flag, "14", "127.0.0.1"]);
        assert!(!args.iter().any(|a| a == "-W"));

        assert_eq!(command_deadline_secs(Duration::from_secs(2)), 1);
        assert_eq!(command_deadline_secs(Duration::from_millis(500)), 1);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(parse_ping_output(addr, "ping: unknown host").is_none());
    }
}
