//! dnsmasq lease file ingestion.
//!
//! Each line of the lease file reads
//! `<expiry> <macaddr> <ip> <hostname> <client-id>`. The whole file is
//! re-read on every change notification.

use std::io;
use std::net::IpAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;

use crate::cache::{LinkLookup, NameCache};
use crate::codec::MacAddr;

const MIN_FIELDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: IpAddr,
    pub hostname: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LeaseLineError {
    #[error("expected at least 5 fields, got {0}")]
    TooFewFields(usize),
    #[error("invalid lease macaddr {0:?}")]
    InvalidMac(String),
    #[error("invalid lease ip {0:?}")]
    InvalidIp(String),
}

pub fn parse_lease_line(line: &str) -> Result<Lease, LeaseLineError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return Err(LeaseLineError::TooFewFields(fields.len()));
    }

    let mac = fields[1]
        .parse::<MacAddr>()
        .map_err(|_| LeaseLineError::InvalidMac(fields[1].to_string()))?;
    let ip = fields[2]
        .parse::<IpAddr>()
        .map_err(|_| LeaseLineError::InvalidIp(fields[2].to_string()))?;

    Ok(Lease {
        mac,
        ip,
        hostname: fields[3].to_string(),
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub applied: usize,
    pub skipped: usize,
}

/// Read the whole lease file into `cache`. Malformed lines are logged and
/// skipped.
pub async fn load_leases<L: LinkLookup>(
    path: &Path,
    cache: &NameCache<L>,
) -> io::Result<LoadSummary> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut summary = LoadSummary::default();

    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_lease_line(line) {
            Ok(lease) => {
                cache.set_lease_name(&lease.mac.to_string(), &lease.hostname);
                summary.applied += 1;
            }
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "skipping dnsmasq lease line");
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}

struct LeaseNotify(Inotify);

impl AsRawFd for LeaseNotify {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

fn watch(path: &Path) -> io::Result<AsyncFd<LeaseNotify>> {
    let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
    inotify.add_watch(path, AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CLOSE_WRITE)?;
    // SAFETY: `LeaseNotify` owns the inotify descriptor, which stays open and
    // unchanged until the `AsyncFd` drops it.
    let notify = unsafe { AsyncFd::register_with_interest(LeaseNotify(inotify), Interest::READABLE) }?;
    Ok(notify)
}

async fn reload<L: LinkLookup>(path: &Path, cache: &NameCache<L>) {
    match load_leases(path, cache).await {
        Ok(summary) => tracing::debug!(
            applied = summary.applied,
            skipped = summary.skipped,
            "dnsmasq leases loaded"
        ),
        Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to read dnsmasq leases"),
    }
}

/// Load the lease file, then keep `cache` in sync with it until `cancel`
/// fires.
pub async fn watch_leases<L: LinkLookup>(
    path: &Path,
    cache: &NameCache<L>,
    cancel: CancellationToken,
) {
    if path.as_os_str().is_empty() {
        tracing::info!("no dnsmasq lease file, ignoring");
        return;
    }

    reload(path, cache).await;

    let mut notify = match watch(path) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to watch dnsmasq leases file");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            ready = notify.readable_mut() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::error!(error = %e, "lease watcher poll failed");
                        return;
                    }
                };

                match guard.get_inner().0.read_events() {
                    Ok(events) if !events.is_empty() => {
                        tracing::info!("dnsmasq file changed, updating");
                        reload(path, cache).await;
                    }
                    Ok(_) => {}
                    Err(nix::Error::EAGAIN) => guard.clear_ready(),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read lease notifications");
                        guard.clear_ready();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::FakeLinks;
    use std::io::Write;
    use std::time::Duration;

    fn cache() -> NameCache<FakeLinks> {
        NameCache::with_lookup(FakeLinks::default())
    }

    #[test]
    fn parses_valid_line() {
        let lease =
            parse_lease_line("1700000000 AA:BB:CC:DD:EE:FF 192.168.1.20 laptop 01:aa:bb:cc:dd:ee:ff")
                .unwrap();
        assert_eq!(lease.mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(lease.ip, "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(lease.hostname, "laptop");
    }

    #[test]
    fn rejects_short_and_invalid_lines() {
        assert_eq!(
            parse_lease_line("1700000000 aa:bb:cc:dd:ee:ff 192.168.1.20 laptop"),
            Err(LeaseLineError::TooFewFields(4))
        );
        assert!(matches!(
            parse_lease_line("1 not-a-mac 192.168.1.20 laptop *"),
            Err(LeaseLineError::InvalidMac(_))
        ));
        assert!(matches!(
            parse_lease_line("1 aa:bb:cc:dd:ee:ff 999.1.1.1 laptop *"),
            Err(LeaseLineError::InvalidIp(_))
        ));
    }

    #[tokio::test]
    async fn load_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1700000000 aa:bb:cc:dd:ee:01 10.0.0.2 alpha *").unwrap();
        writeln!(file, "1700000000 aa:bb:cc:dd:ee:02 10.0.0.3 beta").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "1700000000 AA:BB:CC:DD:EE:03 fe80::1 gamma 01:02").unwrap();
        file.flush().unwrap();

        let cache = cache();
        let summary = load_leases(file.path(), &cache).await.unwrap();
        assert_eq!(summary, LoadSummary { applied: 2, skipped: 1 });
        assert_eq!(cache.lease_name("aa:bb:cc:dd:ee:01").as_deref(), Some("alpha"));
        assert_eq!(cache.lease_name("aa:bb:cc:dd:ee:02"), None);
        assert_eq!(cache.lease_name("aa:bb:cc:dd:ee:03").as_deref(), Some("gamma"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_leases(&dir.path().join("absent.leases"), &cache())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn watcher_picks_up_changes_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        std::fs::write(&path, "1 aa:bb:cc:dd:ee:01 10.0.0.2 alpha *\n").unwrap();

        let cache = std::sync::Arc::new(cache());
        let cancel = CancellationToken::new();
        let task = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move { watch_leases(&path, &cache, cancel).await })
        };

        let mut seen_initial = false;
        for _ in 0..100 {
            if cache.lease_name("aa:bb:cc:dd:ee:01").is_some() {
                seen_initial = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen_initial);

        // Give the watch time to register before rewriting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, "1 aa:bb:cc:dd:ee:01 10.0.0.2 renamed *\n").unwrap();

        let mut renamed = false;
        for _ in 0..200 {
            if cache.lease_name("aa:bb:cc:dd:ee:01").as_deref() == Some("renamed") {
                renamed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(renamed);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn empty_path_disables_watcher() {
        let cancel = CancellationToken::new();
        watch_leases(Path::new(""), &cache(), cancel).await;
    }
}
