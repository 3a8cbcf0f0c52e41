use crate::send_queue::Pushed;

/// Counters for a single transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames fully handed to the OS.
    pub frames_sent: u64,
    /// Frames that had to wait in the send queue.
    pub frames_queued: u64,
    /// `transfer` calls rejected because the queue was full.
    pub backpressure_rejections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub descriptors_sent: u64,
    pub descriptors_received: u64,
}

impl TransportStats {
    pub(crate) fn record_push(&mut self, pushed: &Pushed) {
        self.bytes_sent += pushed.bytes as u64;
        self.descriptors_sent += pushed.descriptors as u64;
        if pushed.complete {
            self.frames_sent += 1;
        }
    }

    pub(crate) fn record_read(&mut self, bytes: usize, descriptors: usize) {
        self.bytes_received += bytes as u64;
        self.descriptors_received += descriptors as u64;
    }
}
