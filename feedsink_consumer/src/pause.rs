use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use feedsink_log::ConsumerGroup;
use observability_deps::tracing::info;

/// Group-wide pause switch.
///
/// Pausing stops delivery to every claim without leaving the group. The flag is flipped with a
/// compare-exchange before the group is told, so concurrent callers never issue the same
/// transition twice.
#[derive(Debug)]
pub struct PauseControl {
    paused: AtomicBool,
    group: Arc<dyn ConsumerGroup>,
}

impl PauseControl {
    pub fn new(group: Arc<dyn ConsumerGroup>) -> Self {
        Self {
            paused: AtomicBool::new(false),
            group,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause consumption, returns `false` if it already was paused
    pub fn pause(&self) -> bool {
        if self
            .paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.group.pause_all();
        info!("pausing consumption");
        true
    }

    /// Resume consumption, returns `false` if it was not paused
    pub fn resume(&self) -> bool {
        if self
            .paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.group.resume_all();
        info!("resuming consumption");
        true
    }

    /// Flip between paused and running, returns whether consumption is now paused
    pub fn toggle(&self) -> bool {
        loop {
            if self.is_paused() {
                if self.resume() {
                    return false;
                }
            } else if self.pause() {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use feedsink_log::{GroupOptions, mock::MockBroker};

    use super::*;

    #[test]
    fn transitions_are_idempotent() {
        let broker = MockBroker::new();
        let group = Arc::new(broker.consumer_group("g", GroupOptions::default()));
        let control = PauseControl::new(Arc::clone(&group) as _);

        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.is_paused());
        assert!(group.is_paused());

        assert!(control.resume());
        assert!(!control.resume());
        assert!(!group.is_paused());

        assert_eq!(group.pause_calls(), 1);
        assert_eq!(group.resume_calls(), 1);
    }

    #[test]
    fn toggle_alternates() {
        let broker = MockBroker::new();
        let group = Arc::new(broker.consumer_group("g", GroupOptions::default()));
        let control = PauseControl::new(Arc::clone(&group) as _);

        for i in 0..6 {
            assert_eq!(control.toggle(), i % 2 == 0);
        }
        assert!(!control.is_paused());
        assert_eq!(group.pause_calls(), 3);
        assert_eq!(group.resume_calls(), 3);
    }
}
