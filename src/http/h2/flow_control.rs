//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! Each stream, and the connection as a whole, carries a send window
//! (how much DATA the peer lets us send) and a receive window (how much
//! DATA we let the peer send before we must replenish it).

use super::error::protocol_error;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::http::Result;

/// Flow control window
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size (can be negative after a SETTINGS shrink)
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Consume window capacity for sending data
    ///
    /// Returns the actual amount that can be sent (may be less than requested)
    pub fn consume(&mut self, amount: usize) -> usize {
        let to_send = amount.min(self.available());
        self.current_size -= to_send as i64;
        to_send
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(protocol_error("window update increment must be non-zero"));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(protocol_error(format!(
                "flow control window {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Update initial window size from SETTINGS
    ///
    /// The current size moves by the same delta as the initial size.
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(protocol_error(format!(
                "new window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Send and receive windows of one flow-controlled entity
#[derive(Debug, Clone)]
pub struct FlowControl {
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
}

impl FlowControl {
    /// Windows with the given initial sizes
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    /// Get send window
    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    /// Get mutable send window
    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    /// Get receive window
    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// Charge inbound DATA against the receive window
    ///
    /// A peer that overruns the window is violating flow control.
    pub fn consume_recv_window(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.recv_window.size() {
            return Err(protocol_error(format!(
                "peer sent {} bytes with only {} bytes of window",
                amount,
                self.recv_window.size()
            )));
        }
        self.recv_window.decrease(amount);
        Ok(())
    }

    /// Replenish the receive window once it falls below half
    ///
    /// Returns the increment to advertise in a WINDOW_UPDATE.
    pub fn take_window_update(&mut self) -> Option<u32> {
        let recv_size = self.recv_window.size();
        let initial_size = self.recv_window.initial_size() as i64;

        if recv_size < initial_size / 2 {
            let increment = (initial_size - recv_size) as u32;
            self.recv_window.current_size += increment as i64;
            Some(increment)
        } else {
            None
        }
    }
}
