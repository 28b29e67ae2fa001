//! Network namespace plumbing

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;

const IPV6_DISABLE_KEYS: [&str; 2] = [
    "/proc/sys/net/ipv6/conf/all/disable_ipv6",
    "/proc/sys/net/ipv6/conf/default/disable_ipv6",
];

/// Run `f` with the thread switched into the namespace at `netns_path`,
/// restoring the original namespace afterwards.
///
/// setns moves only the calling thread, so the work runs on a dedicated
/// thread instead of poisoning a runtime worker.
pub fn with_netns<T, F>(netns_path: &str, f: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    std::thread::scope(|scope| {
        let path = netns_path;
        scope
            .spawn(move || enter_and_run(path, f))
            .join()
            .map_err(|_| anyhow::anyhow!("namespace worker thread panicked"))?
    })
}

fn enter_and_run<T, F>(netns_path: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let orig_fd = open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())
        .context("Failed to open current network namespace")?;

    let target_fd = match open(netns_path, OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = close(orig_fd);
            return Err(e).with_context(|| format!("Failed to open network namespace {}", netns_path));
        }
    };

    let outcome = setns(target_fd, CloneFlags::CLONE_NEWNET)
        .context("Failed to enter network namespace")
        .and_then(|_| f());
    let _ = close(target_fd);

    let restored = setns(orig_fd, CloneFlags::CLONE_NEWNET)
        .context("Failed to restore original network namespace");
    let _ = close(orig_fd);

    let value = outcome?;
    restored?;
    Ok(value)
}

/// Turn IPv6 off inside the pod namespace. Pods receive IPv4 allocations
/// only, so IPv6 autoconf in the namespace is shut down before the delegate
/// wires anything up.
pub fn disable_ipv6(netns_path: &str) -> Result<()> {
    with_netns(netns_path, || {
        for key in IPV6_DISABLE_KEYS {
            if let Err(e) = std::fs::write(key, "1") {
                // Kernels built without IPv6 expose no conf tree at all.
                if e.kind() == std::io::ErrorKind::NotFound {
                    continue;
                }
                return Err(e).with_context(|| format!("Failed to write {}", key));
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_namespace_path_fails_before_switching() {
        let err = with_netns("/no/such/netns", || Ok(())).unwrap_err();
        assert!(err.to_string().contains("/no/such/netns"));
    }
}
