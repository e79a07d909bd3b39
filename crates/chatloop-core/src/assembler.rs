//! Streaming assembler: turns ordered deltas into one finalized message.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::message::MessageId;

/// Handle to the open buffer, returned by [`StreamAssembler::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferHandle {
    pub message_id: MessageId,
}

/// In-flight streaming state for one assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBuffer {
    pub message_id: MessageId,
    pub text: String,
    /// Sequence number of the last applied delta; 0 before the first delta.
    pub last_seq: u64,
    pub finalized: bool,
}

/// Result of offering a delta to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// `seq <= last_seq`: already applied, nothing changed.
    Duplicate,
    /// The conversation was not streaming; the delta was dropped.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct StreamAssembler {
    buffer: Option<StreamBuffer>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a buffer for `message_id`. At most one unfinalized buffer may exist.
    pub fn open(&mut self, message_id: MessageId) -> Result<BufferHandle> {
        if let Some(existing) = &self.buffer {
            if !existing.finalized {
                return Err(EngineError::StreamAlreadyOpen(existing.message_id.to_string()));
            }
        }
        self.buffer = Some(StreamBuffer {
            message_id,
            text: String::new(),
            last_seq: 0,
            finalized: false,
        });
        Ok(BufferHandle { message_id })
    }

    /// Apply delta `seq`. Exactly `last_seq + 1` appends; replays are ignored;
    /// gaps fail with `OutOfOrderDelta` and leave the buffer unchanged.
    pub fn append(&mut self, handle: BufferHandle, seq: u64, chunk: &str) -> Result<DeltaOutcome> {
        let buffer = self.open_buffer_mut(handle)?;
        let expected = buffer.last_seq + 1;

        if seq < expected {
            debug!(
                message_id = %buffer.message_id,
                seq,
                last_seq = buffer.last_seq,
                "Ignoring duplicate delta"
            );
            return Ok(DeltaOutcome::Duplicate);
        }
        if seq > expected {
            return Err(EngineError::OutOfOrderDelta { expected, got: seq });
        }

        buffer.text.push_str(chunk);
        buffer.last_seq = seq;
        Ok(DeltaOutcome::Applied)
    }

    /// Seal the buffer and hand back its text. A second call for the same
    /// handle returns `None`.
    pub fn finalize(&mut self, handle: BufferHandle) -> Result<Option<String>> {
        match &mut self.buffer {
            Some(buffer) if buffer.message_id == handle.message_id => {
                if buffer.finalized {
                    return Ok(None);
                }
                buffer.finalized = true;
                Ok(Some(buffer.text.clone()))
            }
            _ => Err(EngineError::NoOpenStream),
        }
    }

    /// The buffer, open or most recently finalized.
    pub fn current(&self) -> Option<&StreamBuffer> {
        self.buffer.as_ref()
    }

    /// Handle of the open (unfinalized) buffer, if any.
    pub fn open_handle(&self) -> Option<BufferHandle> {
        self.buffer
            .as_ref()
            .filter(|b| !b.finalized)
            .map(|b| BufferHandle { message_id: b.message_id })
    }

    fn open_buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut StreamBuffer> {
        match &mut self.buffer {
            Some(buffer) if buffer.message_id == handle.message_id && !buffer.finalized => {
                Ok(buffer)
            }
            _ => Err(EngineError::NoOpenStream),
        }
    }
}
