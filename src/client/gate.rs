/*!
 * Client-wide enable/disable switch
 *
 * Every request checks the gate before it is sent, and every retry wait sleeps
 * on the gate's condvar so that disabling the client wakes it immediately.
 */

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Result, VaultError};

/// Shared enable/disable flag with interruptible waits
#[derive(Clone)]
pub struct ClientGate {
    state: Arc<GateState>,
}

struct GateState {
    enabled: Mutex<bool>,
    condvar: Condvar,
}

impl ClientGate {
    /// Create an enabled gate
    pub fn new() -> Self {
        Self {
            state: Arc::new(GateState {
                enabled: Mutex::new(true),
                condvar: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.state.enabled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether requests may be sent
    pub fn is_enabled(&self) -> bool {
        *self.lock()
    }

    /// Allow requests again
    pub fn enable(&self) {
        *self.lock() = true;
        self.state.condvar.notify_all();
    }

    /// Reject new requests and wake every waiter
    pub fn disable(&self) {
        *self.lock() = false;
        self.state.condvar.notify_all();
    }

    /// Fail with `ClientDisabled` if the gate is closed
    pub fn check(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(VaultError::ClientDisabled)
        }
    }

    /// Sleep for `duration`, returning early with `ClientDisabled` on disable
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut enabled = self.lock();

        loop {
            if !*enabled {
                return Err(VaultError::ClientDisabled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _) = self
                .state
                .condvar
                .wait_timeout(enabled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            enabled = guard;
        }
    }
}

impl Default for ClientGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientGate")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_check_follows_flag() {
        let gate = ClientGate::new();
        assert!(gate.check().is_ok());
        gate.disable();
        assert!(matches!(gate.check(), Err(VaultError::ClientDisabled)));
        gate.enable();
        assert!(gate.check().is_ok());
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let gate = ClientGate::new();
        let start = Instant::now();
        gate.sleep(Duration::from_millis(30)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_disable_interrupts_sleep() {
        let gate = ClientGate::new();
        let waiter = gate.clone();

        let start = Instant::now();
        let handle = thread::spawn(move || waiter.sleep(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        gate.disable();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(VaultError::ClientDisabled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_sleep_on_disabled_gate_returns_immediately() {
        let gate = ClientGate::new();
        gate.disable();
        let start = Instant::now();
        assert!(gate.sleep(Duration::from_secs(5)).is_err());
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
