use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::{CancelToken, Clock};
use crate::client::Liveness;
use crate::error::Result;

/// Block until the control plane answers its liveness probe.
///
/// Transport errors are swallowed; there is no deadline. Only `cancel` ends
/// the wait early. Returns the number of probes sent.
pub fn wait_until_reachable<L, K>(
    target: &L,
    clock: &K,
    cancel: &CancelToken,
    interval: Duration,
) -> Result<u32>
where
    L: Liveness + ?Sized,
    K: Clock + ?Sized,
{
    let mut probes = 0u32;
    loop {
        cancel.check()?;
        probes += 1;
        if target.is_reachable() {
            info!(probes, "control plane reachable");
            return Ok(probes);
        }
        debug!(probes, "control plane not reachable yet");
        clock.sleep(interval, cancel)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KillchainError;
    use crate::testing::{FakeControlPlane, ManualClock};

    #[test]
    fn returns_immediately_when_up() {
        let fake = FakeControlPlane::new();
        let clock = ManualClock::new();
        let n = wait_until_reachable(&fake, &clock, &CancelToken::new(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(clock.slept(), Duration::ZERO);
    }

    #[test]
    fn keeps_probing_on_fixed_interval() {
        let fake = FakeControlPlane::new();
        fake.reachable_after.set(3);
        let clock = ManualClock::new();
        let n = wait_until_reachable(&fake, &clock, &CancelToken::new(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(clock.slept(), Duration::from_secs(6));
    }

    #[test]
    fn cancellation_ends_an_endless_wait() {
        let fake = FakeControlPlane::new();
        fake.reachable_after.set(u32::MAX);
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        clock.cancel_after(10, cancel.clone());

        let err = wait_until_reachable(&fake, &clock, &cancel, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, KillchainError::Cancelled));
        assert_eq!(fake.probes(), 10);
    }
}
