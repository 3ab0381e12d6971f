//! Per-call handler state machines and the arena that owns them.
//!
//! A handler lives for exactly one inbound call:
//!
//! ```text
//! ACCEPTING --Accepted(request)--> PROCESSING --reply submitted--> FINISHING
//! FINISHING --Delivered--> (removed)
//! ```
//!
//! The arena is keyed by the handler's tag, which is also the tag the
//! substrate reports its events under. Removing the entry ends the handler.

use std::collections::HashMap;
use std::fmt;

use crate::error::EngineError;
use crate::tag::CallTag;

/// Lifecycle state of a call handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    /// Registered with the substrate, waiting for a call.
    Accepting,

    /// Holding a call and computing its reply.
    Processing,

    /// Reply submitted, waiting for the delivery report.
    Finishing,
}

impl HandlerState {
    /// Stable name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            HandlerState::Accepting => "ACCEPTING",
            HandlerState::Processing => "PROCESSING",
            HandlerState::Finishing => "FINISHING",
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub(crate) struct CallHandler {
    tag: CallTag,
    state: HandlerState,
}

impl CallHandler {
    fn new(tag: CallTag) -> Self {
        Self {
            tag,
            state: HandlerState::Accepting,
        }
    }

    /// Move from `from` to `to`, refusing any other starting state.
    fn advance(&mut self, from: HandlerState, to: HandlerState) -> Result<(), EngineError> {
        if self.state != from {
            return Err(EngineError::UnexpectedEvent {
                tag: self.tag,
                state: self.state.name(),
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Every live handler, addressed by tag.
#[derive(Debug, Default)]
pub(crate) struct HandlerArena {
    handlers: HashMap<CallTag, CallHandler>,
    accepting: usize,
}

impl HandlerArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// State of the handler tagged `tag`.
    pub(crate) fn state(&self, tag: CallTag) -> Option<HandlerState> {
        self.handlers.get(&tag).map(|h| h.state)
    }

    /// Handlers currently ACCEPTING.
    pub(crate) fn accepting(&self) -> usize {
        self.accepting
    }

    /// Handlers in any state.
    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    fn get_mut(&mut self, tag: CallTag) -> Result<&mut CallHandler, EngineError> {
        self.handlers
            .get_mut(&tag)
            .ok_or(EngineError::UnknownTag { tag })
    }

    /// Add a fresh ACCEPTING handler.
    pub(crate) fn insert_acceptor(&mut self, tag: CallTag) -> Result<(), EngineError> {
        if self.handlers.contains_key(&tag) {
            return Err(EngineError::DuplicateTag { tag });
        }
        self.handlers.insert(tag, CallHandler::new(tag));
        self.accepting += 1;
        Ok(())
    }

    /// ACCEPTING -> PROCESSING for `tag`, adding `replacement` as the new
    /// acceptor in the same step.
    ///
    /// Nothing changes if either part would fail.
    pub(crate) fn accept(
        &mut self,
        tag: CallTag,
        replacement: Option<CallTag>,
    ) -> Result<(), EngineError> {
        if let Some(replacement) = replacement {
            if self.handlers.contains_key(&replacement) {
                return Err(EngineError::DuplicateTag { tag: replacement });
            }
        }

        self.get_mut(tag)?
            .advance(HandlerState::Accepting, HandlerState::Processing)?;
        self.accepting -= 1;

        if let Some(replacement) = replacement {
            self.insert_acceptor(replacement)?;
        }
        Ok(())
    }

    /// PROCESSING -> FINISHING for `tag`.
    pub(crate) fn finish(&mut self, tag: CallTag) -> Result<(), EngineError> {
        self.get_mut(tag)?
            .advance(HandlerState::Processing, HandlerState::Finishing)
    }

    /// Remove a FINISHING handler.
    pub(crate) fn release(&mut self, tag: CallTag) -> Result<(), EngineError> {
        let state = self.state(tag).ok_or(EngineError::UnknownTag { tag })?;
        if state != HandlerState::Finishing {
            return Err(EngineError::UnexpectedEvent {
                tag,
                state: state.name(),
            });
        }
        self.handlers.remove(&tag);
        Ok(())
    }

    /// Remove an ACCEPTING handler whose accept was cancelled, adding
    /// `replacement` in the same step.
    pub(crate) fn replace_acceptor(
        &mut self,
        tag: CallTag,
        replacement: Option<CallTag>,
    ) -> Result<(), EngineError> {
        let state = self.state(tag).ok_or(EngineError::UnknownTag { tag })?;
        if state != HandlerState::Accepting {
            return Err(EngineError::UnexpectedEvent {
                tag,
                state: state.name(),
            });
        }
        if let Some(replacement) = replacement {
            if self.handlers.contains_key(&replacement) {
                return Err(EngineError::DuplicateTag { tag: replacement });
            }
        }

        self.handlers.remove(&tag);
        self.accepting -= 1;
        if let Some(replacement) = replacement {
            self.insert_acceptor(replacement)?;
        }
        Ok(())
    }
}
