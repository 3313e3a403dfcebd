use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Process-wide service mode flag. Cloned handles share one atomic cell, so the control
/// loop and web handlers can flip it without torn reads. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct ServiceMode {
    active: Arc<AtomicBool>,
}

impl ServiceMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Flips the flag and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.active.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn label(active: bool) -> &'static str {
        if active {
            "enabled"
        } else {
            "disabled"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_inactive() {
        assert!(!ServiceMode::new().get());
    }

    #[test]
    fn toggle_returns_new_state() {
        let mode = ServiceMode::new();
        assert!(mode.toggle());
        assert!(mode.get());
        assert!(!mode.toggle());
        assert!(!mode.get());
    }

    #[test]
    fn clones_share_state() {
        let mode = ServiceMode::new();
        let handler_view = mode.clone();
        handler_view.set(true);
        assert!(mode.get());
    }

    #[test]
    fn concurrent_toggles_are_not_lost() {
        let mode = ServiceMode::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mode = mode.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        mode.toggle();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!mode.get());
    }
}
