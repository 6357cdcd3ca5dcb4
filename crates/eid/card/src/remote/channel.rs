use std::{fmt::Debug, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use super::IfdError;

/// Text frame transport between a remote reader client and its server
pub trait IfdChannel: Send + Debug {
    /// Send one frame
    fn send(&mut self, frame: String) -> Result<(), IfdError>;

    /// Wait for the next frame
    fn receive(&mut self) -> Result<String, IfdError>;
}

impl<C: IfdChannel + ?Sized> IfdChannel for Box<C> {
    fn send(&mut self, frame: String) -> Result<(), IfdError> {
        (**self).send(frame)
    }

    fn receive(&mut self) -> Result<String, IfdError> {
        (**self).receive()
    }
}

/// One end of an in-process channel pair
#[derive(Debug)]
pub struct MemoryChannel {
    sender: Sender<String>,
    receiver: Receiver<String>,
    timeout: Option<Duration>,
}

impl MemoryChannel {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (left_sender, right_receiver) = unbounded();
        let (right_sender, left_receiver) = unbounded();
        (
            Self {
                sender: left_sender,
                receiver: left_receiver,
                timeout: None,
            },
            Self {
                sender: right_sender,
                receiver: right_receiver,
                timeout: None,
            },
        )
    }

    /// Give up waiting for a frame after `timeout`
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl IfdChannel for MemoryChannel {
    fn send(&mut self, frame: String) -> Result<(), IfdError> {
        self.sender.send(frame).map_err(|_| IfdError::Closed)
    }

    fn receive(&mut self) -> Result<String, IfdError> {
        match self.timeout {
            Some(timeout) => self.receiver.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => IfdError::Timeout,
                RecvTimeoutError::Disconnected => IfdError::Closed,
            }),
            None => self.receiver.recv().map_err(|_| IfdError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_over() {
        let (mut left, mut right) = MemoryChannel::pair();
        left.send("ping".to_owned()).unwrap();
        assert_eq!(right.receive().unwrap(), "ping");
        right.send("pong".to_owned()).unwrap();
        assert_eq!(left.receive().unwrap(), "pong");
    }

    #[test]
    fn closed_and_silent_peers() {
        let (left, right) = MemoryChannel::pair();
        let mut left = left.with_timeout(Duration::from_millis(10));
        assert!(matches!(left.receive(), Err(IfdError::Timeout)));
        drop(right);
        assert!(matches!(left.receive(), Err(IfdError::Closed)));
        assert!(matches!(left.send("late".to_owned()), Err(IfdError::Closed)));
    }
}
