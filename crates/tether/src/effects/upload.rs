//! Upload bodies produced off the loop thread.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use bytes::{Buf, Bytes};
use tether_buffer::{LocalWaker, SharedSource, SourceRead, UploadSource};
use tokio::sync::mpsc::{self, error::TryRecvError};

use super::runtime::{EventLoop, RemoteWaker, WakeRegistration};

/// Create a sequential upload body fed by an [`UploadSender`].
///
/// The source has no known size, so backends that need to replay the
/// body get it buffered in full before they start.
pub fn upload_channel(event_loop: &EventLoop) -> (UploadSender, SharedSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let slot: Rc<RefCell<Option<LocalWaker>>> = Rc::new(RefCell::new(None));
    let wake_slot = slot.clone();
    let registration = event_loop.remote_waker(move || {
        let waker = wake_slot.borrow().clone();
        if let Some(waker) = waker {
            waker();
        }
    });
    let sender = UploadSender {
        tx: Some(tx),
        waker: registration.waker(),
    };
    let source = ChannelSource {
        rx,
        pending: Bytes::new(),
        waker: slot,
        _registration: registration,
    };
    (sender, Rc::new(RefCell::new(source)))
}

/// Sending half; may move to any thread. Dropping it ends the body.
#[derive(Debug)]
pub struct UploadSender {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    waker: RemoteWaker,
}

impl UploadSender {
    /// Returns `false` once the receiving reply is gone.
    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let sent = tx.send(data.into()).is_ok();
        self.waker.wake();
        sent
    }

    pub fn finish(self) {}
}

impl Drop for UploadSender {
    fn drop(&mut self) {
        // Close the channel before waking so the reader sees the end.
        drop(self.tx.take());
        self.waker.wake();
    }
}

/// Receiving half of [`upload_channel`].
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    waker: Rc<RefCell<Option<LocalWaker>>>,
    _registration: WakeRegistration,
}

impl UploadSource for ChannelSource {
    fn is_sequential(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<SourceRead> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(SourceRead::Data(n));
            }
            match self.rx.try_recv() {
                Ok(data) => self.pending = data,
                Err(TryRecvError::Empty) => return Ok(SourceRead::Pending),
                Err(TryRecvError::Disconnected) => return Ok(SourceRead::Eof),
            }
        }
    }

    fn set_waker(&mut self, waker: Option<LocalWaker>) {
        *self.waker.borrow_mut() = waker;
    }
}
