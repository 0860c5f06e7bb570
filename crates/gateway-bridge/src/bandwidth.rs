//! Interface bandwidth sampling: `/proc/net/dev` byte counters converted to
//! a kilobits/second up/down pair, cached for the liveness clock to publish.

use std::path::Path;
use std::time::Instant;

const PROC_NET_DEV: &str = "/proc/net/dev";

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Samples are kept in two alternating slots rather than one rolling
/// previous value, so each delta is always measured against the sample from
/// two ticks back — a fixed window instead of compounding rounding error
/// tick over tick.
pub struct BandwidthSampler {
    interface: String,
    slots: [Option<Sample>; 2],
    next_slot: usize,
}

impl BandwidthSampler {
    pub fn new(interface: String) -> Self {
        Self {
            interface,
            slots: [None, None],
            next_slot: 0,
        }
    }

    /// Reads the current counters and returns `(up_kbps, down_kbps)`
    /// against the sample two ticks ago, or `None` on the first two ticks
    /// or if the interface can't be read.
    pub async fn sample(&mut self) -> Option<(u32, u32)> {
        self.sample_from(Path::new(PROC_NET_DEV)).await
    }

    async fn sample_from(&mut self, proc_net_dev: &Path) -> Option<(u32, u32)> {
        let (rx_bytes, tx_bytes) = read_interface_counters(proc_net_dev, &self.interface).await?;
        let now = Instant::now();
        let slot = self.next_slot;
        let previous = self.slots[slot].replace(Sample {
            at: now,
            rx_bytes,
            tx_bytes,
        });
        self.next_slot = 1 - slot;

        let previous = previous?;
        let elapsed = now.duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let down = kbps(rx_bytes.saturating_sub(previous.rx_bytes), elapsed);
        let up = kbps(tx_bytes.saturating_sub(previous.tx_bytes), elapsed);
        Some((up, down))
    }
}

fn kbps(bytes_delta: u64, elapsed_secs: f64) -> u32 {
    (bytes_delta as f64 / elapsed_secs / 128.0).round() as u32
}

async fn read_interface_counters(proc_net_dev: &Path, interface: &str) -> Option<(u64, u64)> {
    let contents = tokio::fs::read_to_string(proc_net_dev).await.ok()?;
    parse_proc_net_dev(&contents, interface)
}

/// `/proc/net/dev` lines look like:
/// ` eth0: 123 0 0 0 0 0 0 0 456 0 0 0 0 0 0 0`
/// (rx bytes first, 7 more rx fields, then tx bytes).
fn parse_proc_net_dev(contents: &str, interface: &str) -> Option<(u64, u64)> {
    for line in contents.lines().skip(2) {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != interface {
            continue;
        }
        let mut fields = rest.split_whitespace();
        let rx_bytes: u64 = fields.next()?.parse().ok()?;
        for _ in 0..7 {
            fields.next()?;
        }
        let tx_bytes: u64 = fields.next()?.parse().ok()?;
        return Some((rx_bytes, tx_bytes));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PROC: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000       0    0    0    0     0          0         0     1000       0    0    0    0     0       0          0
  eth0:    2000      10    0    0    0     0          0         0     3000      20    0    0    0     0       0          0
";

    #[test]
    fn parses_named_interface() {
        assert_eq!(parse_proc_net_dev(SAMPLE_PROC, "eth0"), Some((2000, 3000)));
    }

    #[test]
    fn missing_interface_is_none() {
        assert_eq!(parse_proc_net_dev(SAMPLE_PROC, "wlan0"), None);
    }

    #[tokio::test]
    async fn first_two_samples_have_no_delta() {
        let dir = std::env::temp_dir().join(format!("gw-bw-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("net_dev");
        tokio::fs::write(&path, SAMPLE_PROC).await.unwrap();

        let mut sampler = BandwidthSampler::new("eth0".to_string());
        assert!(sampler.sample_from(&path).await.is_none());
        assert!(sampler.sample_from(&path).await.is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn third_sample_reports_delta_against_first() {
        let dir = std::env::temp_dir().join(format!("gw-bw-test2-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("net_dev");

        tokio::fs::write(&path, SAMPLE_PROC).await.unwrap();
        let mut sampler = BandwidthSampler::new("eth0".to_string());
        sampler.sample_from(&path).await;
        sampler.sample_from(&path).await;

        let grown = SAMPLE_PROC.replace("2000", "2128").replace("3000", "3256");
        tokio::fs::write(&path, grown).await.unwrap();
        // Delta compares against the first sample (two ticks back), not the
        // second, which was never populated in its slot yet on this tick.
        let result = sampler.sample_from(&path).await;
        assert!(result.is_some());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
