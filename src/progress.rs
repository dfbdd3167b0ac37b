//! Progress channels between a running populator and its consumer.
//!
//! Every channel is a `watch`: the producer overwrites the previous value and
//! never waits, the consumer always sees the freshest reading.

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct ProgressReporter {
    percent: watch::Sender<u64>,
    clone_bytes: watch::Sender<u64>,
    xcopy_used: watch::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct ProgressWatcher {
    pub percent: watch::Receiver<u64>,
    pub clone_bytes: watch::Receiver<u64>,
    pub xcopy_used: watch::Receiver<bool>,
}

impl ProgressReporter {
    pub fn channel() -> (ProgressReporter, ProgressWatcher) {
        let (percent, percent_rx) = watch::channel(0);
        let (clone_bytes, clone_bytes_rx) = watch::channel(0);
        let (xcopy_used, xcopy_used_rx) = watch::channel(false);
        (
            ProgressReporter {
                percent,
                clone_bytes,
                xcopy_used,
            },
            ProgressWatcher {
                percent: percent_rx,
                clone_bytes: clone_bytes_rx,
                xcopy_used: xcopy_used_rx,
            },
        )
    }

    /// Publishes `value` only if it moves progress forward.
    pub fn report_percent(&self, value: u64) {
        let value = value.min(100);
        self.percent.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    pub fn complete(&self) {
        self.percent.send_replace(100);
    }

    pub fn fail(&self) {
        self.percent.send_replace(0);
    }

    pub fn report_clone_bytes(&self, bytes: u64) {
        self.clone_bytes.send_if_modified(|current| {
            let changed = *current != bytes;
            *current = bytes;
            changed
        });
    }

    pub fn report_xcopy_used(&self, used: bool) {
        self.xcopy_used.send_replace(used);
    }

    /// Raw percent sender for adapters that drive their own copy.
    pub fn percent_sender(&self) -> &watch::Sender<u64> {
        &self.percent
    }

    pub fn current_percent(&self) -> u64 {
        *self.percent.borrow()
    }
}
