//! The per-connection milter state machine.
//!
//! Shared between `miltr-server` and `miltr-client`: both drive the same
//! phase graph, just from opposite ends of the wire. A `Session` tracks the
//! negotiated [`OptNeg`], the current [`Phase`], which streaming stages have
//! been shortcut with `Skip`, and the macros the MTA has defined so far.

use std::collections::HashMap;

use crate::optneg::{MacroStage, OptNeg};
use crate::ProtocolError;

/// One step of the milter dialog.
///
/// `Rcpt`, `Header` and `Body` are the only phases that may repeat
/// themselves (one `Rcpt` per recipient, one `Header`/`Body` per chunk).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Negotiated,
    Conn,
    Helo,
    Mail,
    Rcpt,
    Data,
    Header,
    Eoh,
    Body,
    Eob,
    Closed,
}

/// The phases in protocol order. Used to validate that a phase transition
/// only ever moves one step forward (self-loops on `Rcpt`/`Header`/`Body`
/// are handled separately).
const ORDER: &[Phase] = &[
    Phase::Init,
    Phase::Negotiated,
    Phase::Conn,
    Phase::Helo,
    Phase::Mail,
    Phase::Rcpt,
    Phase::Data,
    Phase::Header,
    Phase::Eoh,
    Phase::Body,
    Phase::Eob,
];

/// The streaming stages a filter may shortcut with a `Skip` decision.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkippableStage {
    Header,
    Body,
}

/// The shared milter session state machine.
///
/// Owned exclusively by whoever drives the connection (the connection
/// handler on the server, the `Connection` on the client); there is no
/// concurrent mutation.
#[derive(Debug, Clone)]
pub struct Session {
    /// The negotiated options, once past `Phase::Init`.
    pub options: Option<OptNeg>,
    phase: Phase,
    skipped: [bool; 2],
    macros: HashMap<u32, HashMap<String, String>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a fresh session, starting in `Phase::Init`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: None,
            phase: Phase::Init,
            skipped: [false, false],
            macros: HashMap::new(),
        }
    }

    /// The session's current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True once `Phase::Closed` has been reached.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Store the negotiated options and move from `Init` to `Negotiated`.
    ///
    /// # Errors
    /// Fails if the session is not currently in `Phase::Init`.
    pub fn negotiate(&mut self, options: OptNeg) -> Result<(), ProtocolError> {
        self.advance(Phase::Negotiated, b'O')?;
        self.options = Some(options);
        Ok(())
    }

    /// Validate and perform a phase transition for an inbound/outbound
    /// packet identified by `command` (its wire code, used only for the
    /// error message).
    ///
    /// # Errors
    /// Returns [`ProtocolError::IllegalPhase`] if `next` is not reachable
    /// from the current phase.
    pub fn advance(&mut self, next: Phase, command: u8) -> Result<(), ProtocolError> {
        if self.phase == Phase::Closed {
            return Err(ProtocolError::IllegalPhase {
                from: self.phase,
                command,
            });
        }

        let is_self_loop = matches!(
            (self.phase, next),
            (Phase::Rcpt, Phase::Rcpt) | (Phase::Header, Phase::Header) | (Phase::Body, Phase::Body)
        );

        let is_next_step = ORDER
            .iter()
            .position(|p| *p == self.phase)
            .and_then(|idx| ORDER.get(idx + 1))
            .is_some_and(|expected| *expected == next);

        // `Header` and `Body` are zero-or-more streaming stages: a message
        // with no headers, or no body chunks, never enters them at all, so
        // `Data` -> `Eoh` and `Eoh` -> `Eob` are legal shortcuts alongside
        // the strict `ORDER` progression.
        let is_optional_stage_skip = matches!(
            (self.phase, next),
            (Phase::Data, Phase::Eoh) | (Phase::Eoh, Phase::Eob)
        );

        if !is_self_loop && !is_next_step && !is_optional_stage_skip {
            return Err(ProtocolError::IllegalPhase {
                from: self.phase,
                command,
            });
        }

        // Entering a new, non-repeated phase clears that phase's skip flag;
        // a fresh Header/Body block always starts deliverable.
        if self.phase != next {
            if next == Phase::Header {
                self.skipped[0] = false;
            }
            if next == Phase::Body {
                self.skipped[1] = false;
            }
        }

        self.phase = next;
        Ok(())
    }

    /// Record that the filter returned `Skip` for the given stage.
    ///
    /// # Errors
    /// Returns [`ProtocolError::ActionNotPermitted`] if called outside the
    /// `Header` or `Body` phase -- Skip is scoped to those two streaming
    /// stages only.
    pub fn skip(&mut self, stage: SkippableStage) -> Result<(), ProtocolError> {
        match (stage, self.phase) {
            (SkippableStage::Header, Phase::Header) => self.skipped[0] = true,
            (SkippableStage::Body, Phase::Body) => self.skipped[1] = true,
            _ => {
                return Err(ProtocolError::ActionNotPermitted(
                    "Skip is only legal during Header or Body streaming",
                ))
            }
        }
        Ok(())
    }

    /// Whether further chunks of `stage` should be withheld from the filter.
    #[must_use]
    pub fn is_skipped(&self, stage: SkippableStage) -> bool {
        match stage {
            SkippableStage::Header => self.skipped[0],
            SkippableStage::Body => self.skipped[1],
        }
    }

    /// Record the macros-in-effect for the stage identified by a command's
    /// wire `code` (as carried in a `DEFINE_MACROS` packet).
    pub fn set_macros<I: IntoIterator<Item = (String, String)>>(&mut self, code: u8, values: I) {
        let stage = Self::stage_for_code(code);
        let entry = self.macros.entry(stage).or_default();
        for (name, value) in values {
            entry.insert(name, value);
        }
    }

    /// The macros-in-effect for the given stage, if any were ever defined.
    #[must_use]
    pub fn macros(&self, code: u8) -> Option<&HashMap<String, String>> {
        self.macros.get(&Self::stage_for_code(code))
    }

    fn stage_for_code(code: u8) -> u32 {
        let stage: MacroStage = match code {
            b'C' => MacroStage::Connect,
            b'H' => MacroStage::Helo,
            b'M' => MacroStage::MailFrom,
            b'R' => MacroStage::RcptTo,
            b'T' => MacroStage::Data,
            b'E' => MacroStage::EndOfBody,
            b'N' => MacroStage::EndOfHeaders,
            b'L' => MacroStage::Header,
            b'B' => MacroStage::Body,
            _ => MacroStage::Unknown,
        };
        stage.into()
    }

    /// Discard message-scoped state (skip flags and macros gathered since
    /// the last `Mail`) and return to `Phase::Helo`, ready for the next
    /// envelope's `Mail` command.
    ///
    /// Used for both `Abort` and a clean end-of-message: the connection and
    /// the `Conn`/`Helo` identity are preserved. Resetting to `Phase::Helo`
    /// rather than `Phase::Mail` matters: `Mail` is only a legal *target* of
    /// `advance`, reachable as the next step from `Helo`, never a phase the
    /// session can already be sitting in when another `Mail` command arrives
    /// (`(Mail, Mail)` is not one of the `Rcpt`/`Header`/`Body` self-loops).
    pub fn reset_for_next_message(&mut self) {
        self.skipped = [false, false];
        self.macros
            .retain(|stage, _| *stage == MacroStage::Connect.into() || *stage == MacroStage::Helo.into());
        self.phase = Phase::Helo;
    }

    /// Move the session to `Phase::Closed`. Terminal; no further packets are
    /// expected.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }

    /// Discard all per-connection state gathered since negotiation (macros,
    /// skip flags) and return to `Phase::Negotiated`, ready for a fresh
    /// `Connect` on the same socket.
    ///
    /// Used for `QUIT_NC`: the real protocol negotiates options once per TCP
    /// connection, so `options` is kept, but everything tied to the SMTP
    /// session that just ended (including `Connect`/`Helo` macros) is not.
    pub fn reset_for_new_connection(&mut self) {
        self.skipped = [false, false];
        self.macros.clear();
        self.phase = Phase::Negotiated;
    }
}
