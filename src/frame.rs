// frame.rs — P1 telegram framing from a raw serial byte stream

use crate::*;

/// Working buffer size; a complete DSMR-5.0 telegram must fit in full.
pub const TELEGRAM_BUFFER_SIZE: usize = 1500;

/// Trailer after the telegram body: four CRC hex digits plus CRLF.
pub const TELEGRAM_TRAILER_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameState {
    Idle,
    Data,
    End,
}

/// Reassembles complete P1 telegrams from arbitrarily chunked serial input.
///
/// A telegram starts at `'/'`, runs through `'!'` and the four CRC digits,
/// and closes on the first `\r\n` after the `'!'`. Bytes between telegrams
/// are discarded. A telegram that does not fit the working buffer is dropped
/// silently and assembly restarts at the next `'/'`.
pub struct TelegramAssembler {
    buf: Vec<u8>,
    state: FrameState,
    telegram_start: usize,
}

impl TelegramAssembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(TELEGRAM_BUFFER_SIZE),
            state: FrameState::Idle,
            telegram_start: 0,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.state = FrameState::Idle;
        self.telegram_start = 0;
    }

    /// Feed one chunk of serial data. `on_telegram` is invoked once per
    /// completed frame with the whole telegram, CRC trailer and closing
    /// `\r\n` included.
    pub fn feed(&mut self, chunk: &[u8], mut on_telegram: impl FnMut(&[u8])) {
        if self.buf.len() + chunk.len() > TELEGRAM_BUFFER_SIZE {
            warn!("Not enough space in the telegram buffer, dropping frame in progress");
            self.reset();
            if chunk.len() > TELEGRAM_BUFFER_SIZE {
                return;
            }
        }

        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let mut pos = scan_from;
        while pos < self.buf.len() {
            match self.state {
                FrameState::Idle => {
                    if self.buf[pos] == b'/' {
                        debug!("Telegram start found");
                        self.state = FrameState::Data;
                        self.telegram_start = pos;
                    }
                }
                FrameState::Data => {
                    if self.buf[pos] == b'!' {
                        debug!("Telegram end found");
                        self.state = FrameState::End;
                    }
                }
                FrameState::End => {
                    if self.buf[pos] == b'\n' && self.buf[pos - 1] == b'\r' {
                        let telegram = &self.buf[self.telegram_start..=pos];
                        debug!("Complete telegram found with size: {}", telegram.len());
                        on_telegram(telegram);
                        self.state = FrameState::Idle;
                    }
                }
            }
            pos += 1;
        }

        match self.state {
            // Nothing in flight: whatever is left is inter-telegram noise
            // or an already-delivered frame.
            FrameState::Idle => self.reset(),
            // Move the frame in progress to the buffer base so that any
            // telegram up to the full buffer size can still be assembled,
            // no matter how the stream was aligned.
            FrameState::Data | FrameState::End => {
                if self.telegram_start > 0 {
                    let len = self.buf.len();
                    self.buf.copy_within(self.telegram_start..len, 0);
                    self.buf.truncate(len - self.telegram_start);
                    self.telegram_start = 0;
                }
            }
        }
    }
}

impl Default for TelegramAssembler {
    fn default() -> Self {
        Self::new()
    }
}

// EOF
