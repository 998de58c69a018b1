use tokio::sync::mpsc;

use crate::frame::Frame;

/// Producer half of a bounded frame queue. `send` blocks (awaits) when the
/// queue is full — frames are never dropped.
pub type FrameSender = mpsc::Sender<Frame>;

/// Consumer half of a bounded frame queue. `recv` blocks (awaits) when the
/// queue is empty.
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Create a bounded FIFO frame queue of the given capacity.
pub fn bounded(capacity: usize) -> (FrameSender, FrameReceiver) {
    mpsc::channel(capacity)
}
