#![doc = include_str!("../Readme.md")]

mod codec;

#[cfg(feature = "_fuzzing")]
pub mod fuzzing;

use std::{ops::Deref, sync::Arc};

use asynchronous_codec::Framed;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, SinkExt, StreamExt};
use miltr_utils::debug;
use paste::paste;
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{instrument, Level};

use miltr_common::{
    actions::{Abort, Action, Continue, Quit, QuitNc, Skip},
    commands::{
        Body, Command, Connect, Data, EndOfBody, EndOfHeader, Header, Helo, Mail, Recipient,
        Unknown,
    },
    decoding::ServerCommand,
    modifications::{ModificationAction, ModificationResponse},
    optneg::{CompatibilityError, OptNeg},
    session::{Phase, Session, SkippableStage},
    ProtocolError,
};

use self::codec::MilterCodec;

/// A milter client using some options and a codec to talk to a milter server
pub struct Client {
    options: Arc<OptNeg>,
    codec: MilterCodec,
}

/// A single milter connection
///
/// This can be created by calling [`Client::connect_via`] to establish
/// a milter session.
///
/// A regular session could use these commands in order:
///
/// - [`Connection::connect`]
/// - [`Connection::helo`]
/// - [`Connection::mail`]
/// - [`Connection::recipient`]
/// - [`Connection::data`]
/// - [`Connection::header`] (multiple)
/// - [`Connection::end_of_header`]
/// - [`Connection::body`] (multiple) or [`Connection::body_read_from`]
/// - [`Connection::end_of_body`]
///
/// Be careful about the ordering of these commands, milter implementations
/// are designed to expect them in order they appear in the SMTP protocol.
///
/// # Protocol from `OptNeg`
///
/// Depending on what was set by client and server during option negotiation
/// when establishing the connection, commands might either not be sent at all
/// or no response is awaited.
///
/// Assuming [`Protocol::NO_HELO`](miltr_common::optneg::Protocol::NO_HELO) is
/// set during option negotiation, calling [`Connection::helo`] short-circuits
/// to returning [`Action::Continue`] without sending anything.
///
/// If [`Protocol::NR_HELO`](miltr_common::optneg::Protocol::NR_HELO) is set,
/// calling [`Connection::helo`] does not wait for an answer from the milter
/// server, it immediately returns [`Action::Continue`] after sending the
/// command.
///
/// Commands behave differently here, see the implementations for
/// [`Protocol::skip_send`](miltr_common::optneg::Protocol::should_skip_send) and
/// [`Protocol::skip_response`](miltr_common::optneg::Protocol::should_skip_response)
/// for details.
pub struct Connection<RW: AsyncRead + AsyncWrite + Unpin> {
    framed: Framed<RW, MilterCodec>,
    options: OptNeg,
    session: Session,
}

impl Client {
    /// Create a client which is able to handle connections with the provided
    /// options.
    #[must_use]
    pub fn new(options: OptNeg) -> Self {
        let codec = MilterCodec::new(2_usize.pow(16));

        Self {
            options: Arc::new(options),
            codec,
        }
    }

    /// Option negotiate with the server
    ///
    /// The steps are:
    /// 1. Send our options to the server
    /// 2. Receive it's options back
    /// 3. Merge them into one
    async fn recv_option_negotiation<RW: AsyncRead + AsyncWrite + Unpin>(
        &self,
        framed: &mut Framed<RW, MilterCodec>,
    ) -> Result<OptNeg, ResponseError> {
        let client_options = &self.options;
        framed.send(&client_options.deref().clone().into()).await?;

        let resp = framed
            .next()
            .await
            .ok_or(ResponseError::MissingServerResponse)??;

        let server_options = match resp {
            ServerCommand::OptNeg(optneg) => Ok(optneg),
            command => Err(ResponseError::Unexpected(command)),
        }?;

        let options = server_options.merge_compatible(&self.options)?;

        Ok(options)
    }

    /// Handle a single milter connection via the provided RW connection
    ///
    /// # Errors
    /// This fails if an io-error is experienced or option negotiation fails
    pub async fn connect_via<RW: AsyncRead + AsyncWrite + Unpin>(
        &self,
        connection: RW,
    ) -> Result<Connection<RW>, ResponseError> {
        let codec = self.codec.clone();
        let mut framed = Framed::new(connection, codec);
        let options = self.recv_option_negotiation(&mut framed).await?;

        let mut session = Session::new();
        session.negotiate(options.clone())?;

        let connection = Connection {
            framed,
            options,
            session,
        };

        Ok(connection)
    }
}

macro_rules! command {
    (
        $(#[$outer:meta])*
        (into) $variant:ident, $phase:expr, $code:expr
    ) => {
        paste! {
            $(#[$outer])*
            pub async fn [<$variant:snake>]<C: Into<[<$variant:camel>]>>(&mut self, command: C) -> Result<Action, ResponseError> {
                self.session.advance($phase, $code)?;
                let command_intoed: [<$variant:camel>] = command.into();
                let command: Command = command_intoed.into();

                self.send_command(command).await
            }
        }
    };
    (
        $(#[$outer:meta])*
        (new) $variant:ident, $phase:expr, $code:expr
    ) => {
        paste! {
            $(#[$outer])*
            pub async fn [<$variant:snake>](&mut self) -> Result<Action, ResponseError> {
                self.session.advance($phase, $code)?;
                let command: Command = [<$variant:camel>].into();

                self.send_command(command).await
            }
        }
    };
}

impl<RW: AsyncRead + AsyncWrite + Unpin> Connection<RW> {
    command!(
        /// Send connect information.
        ///
        /// # Errors
        /// Errors on io or codec problems, or if the server replies out of
        /// turn for the current phase.
        (into) Connect, Phase::Conn, b'C'
    );

    command!(
        /// Handle a client helo
        ///
        /// # Errors
        /// Errors on io or codec problems, or if the server replies out of
        /// turn for the current phase.
        (into) Helo, Phase::Helo, b'H'
    );

    command!(
        /// Send the sender info
        ///
        /// # Errors
        /// Errors on io or codec problems, or if the server replies out of
        /// turn for the current phase.
        (into) Mail, Phase::Mail, b'M'
    );

    command!(
        /// Send the recipient info
        ///
        /// # Errors
        /// Errors on io or codec problems, or if the server replies out of
        /// turn for the current phase.
        (into) Recipient, Phase::Rcpt, b'R'
    );

    command!(
        /// Indicate that data follows
        ///
        /// # Errors
        /// Errors on io or codec problems, or if the server replies out of
        /// turn for the current phase.
        (new) Data, Phase::Data, b'T'
    );

    /// Send a header.
    ///
    /// Once the server has returned `Skip` for a header in this message's
    /// header block, further calls to this method become no-ops returning
    /// the last `Skip` decision again, until [`Connection::end_of_header`]
    /// is called.
    ///
    /// # Errors
    /// Errors on io or codec problems, or if the server replies out of turn
    /// for the current phase.
    pub async fn header<C: Into<Header>>(&mut self, command: C) -> Result<Action, ResponseError> {
        self.session.advance(Phase::Header, b'L')?;

        if self.session.is_skipped(SkippableStage::Header) {
            return Ok(Skip.into());
        }

        let command: Command = command.into().into();
        self.send_command(command).await
    }

    command!(
        /// Indicate all headers have been sent
        ///
        /// # Errors
        /// Errors on io or codec problems, or if the server replies out of
        /// turn for the current phase.
        (new) EndOfHeader, Phase::Eoh, b'N'
    );

    /// Send a single body chunk.
    ///
    /// Once the server has returned `Skip` for a chunk of this message's
    /// body, further calls to this method become no-ops returning the last
    /// `Skip` decision again, until [`Connection::end_of_body`] is called.
    /// For a whole message body use [`Connection::body_read_from`] instead.
    ///
    /// # Errors
    /// Errors on io or codec problems, or if the server replies out of turn
    /// for the current phase.
    pub async fn body<C: Into<Body>>(&mut self, command: C) -> Result<Action, ResponseError> {
        self.session.advance(Phase::Body, b'B')?;

        if self.session.is_skipped(SkippableStage::Body) {
            return Ok(Skip.into());
        }

        let command: Command = command.into().into();
        self.send_command(command).await
    }

    /// Stream a whole message body from `reader`, chunked to the negotiated
    /// `data_size`, respecting `Skip`, then send `EndOfBody` and collect the
    /// modification packets that follow, in the order they arrived.
    ///
    /// # Errors
    /// Errors on io or codec problems, or if the server replies out of turn
    /// for the current phase.
    pub async fn body_read_from<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
    ) -> Result<ModificationResponse, ResponseError> {
        // A few bytes of overhead for the frame header and command code are
        // already accounted for by the codec; stay comfortably under the
        // negotiated ceiling.
        let chunk_size = (self.options.data_size().bytes() as usize).saturating_sub(64);
        let mut buf = vec![0_u8; chunk_size.max(1)];

        loop {
            if self.session.is_skipped(SkippableStage::Body) {
                // The server already asked us to stop; drain the reader
                // without sending anything further.
                break;
            }

            let read = reader.read(&mut buf).await.map_err(ProtocolError::from)?;
            if read == 0 {
                break;
            }

            self.body(&buf[..read]).await?;
        }

        self.end_of_body().await
    }

    // command!(
    //     /// Indicate all body parts have been sent
    //     ///
    //     /// # Errors
    //     /// Errors on any response from the milter server that is not Continue
    //     (new) EndOfBody
    // );

    /// Indicate all body parts have been sent
    ///
    /// # Errors
    /// Errors on any response from the milter server that is not Continue
    pub async fn end_of_body(&mut self) -> Result<ModificationResponse, ResponseError> {
        self.session.advance(Phase::Eob, b'E')?;

        // First, send the eob command
        let command: Command = EndOfBody.into();
        self.framed.send(&command.into()).await?;

        let mut modification_response_builder = ModificationResponse::builder();
        loop {
            // Receive a response from the server
            let answer = self.receive_answer().await?;

            // Convert it to a command type
            let command: CommandType = answer.try_into()?;

            match command {
                CommandType::Action(action) => {
                    return Ok(modification_response_builder.build(action));
                }
                CommandType::ModificationAction(action) => {
                    modification_response_builder.push(action);
                }
            };
        }
    }

    /// Receive all modification requests from the server
    ///
    /// # Errors
    /// Errors on error regarding server communication
    pub async fn modification(&mut self) -> Result<CommandType, ResponseError> {
        let resp = self.receive_answer().await?;

        CommandType::try_from(resp)
    }

    /// Ask for a graceful connection shutdown
    ///
    /// # Errors
    /// Errors on io or codec Errors
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.framed.send(&Action::Quit(Quit).into()).await?;
        self.session.close();

        Ok(())
    }

    /// Tell the server this envelope's SMTP client has gone away, but the
    /// connection itself should be kept around for a new, unrelated one.
    ///
    /// Resets to `Phase::Negotiated`: the next command on this connection
    /// must be a fresh [`Connection::connect`], same as right after
    /// [`Client::connect_via`], but skipping option negotiation again.
    ///
    /// # Errors
    /// Errors on io or codec Errors
    pub async fn quit_nc(&mut self) -> Result<(), ProtocolError> {
        self.framed.send(&Action::from(QuitNc).into()).await?;
        self.session.reset_for_new_connection();

        Ok(())
    }

    /// Abort processing for the current mail and re-enter `Phase::Helo` on
    /// the same connection, so another envelope's `mail` call can be driven
    /// through it.
    ///
    /// # Errors
    /// Errors on io or codec Errors
    pub async fn reset(&mut self) -> Result<(), ProtocolError> {
        self.framed.send(&Action::from(Abort).into()).await?;
        self.session.reset_for_next_message();

        Ok(())
    }

    /// Send an unknown command to the server.
    ///
    /// Unknown commands may legally arrive in place of any SMTP-phase
    /// command, so this does not advance the session's phase.
    ///
    /// # Errors
    /// Errors on io or codec Errors
    pub async fn unknown<C: Into<Unknown>>(&mut self, command: C) -> Result<Action, ResponseError> {
        let command_intoed: Unknown = command.into();
        let command: Command = command_intoed.into();

        self.send_command(command).await
    }

    /// Send a command to the server respecting protocol settings
    #[cfg_attr(feature = "tracing", instrument(level = Level::DEBUG, skip(self), fields(%command), err))]
    async fn send_command(&mut self, command: Command) -> Result<Action, ResponseError> {
        // Eval skips
        if self.options.protocol.should_skip_send(&command) {
            debug!("Skip sending");
            return Ok(Continue.into());
        }
        let skip_response = self.options.protocol.should_skip_response(&command);

        // Send it
        debug!("Sending command");
        self.framed.send(&command.into()).await?;

        // Check response
        if skip_response {
            debug!("Skip receiving response");
            return Ok(Continue.into());
        }
        self.expect_decision().await
    }

    /// Shortcut to fetch an answer from the server
    async fn receive_answer(&mut self) -> Result<ServerCommand, ResponseError> {
        let resp = self
            .framed
            .next()
            .await
            .ok_or(ResponseError::MissingServerResponse)??;

        Ok(resp)
    }

    /// Wait for the server's decision about the last command.
    ///
    /// `Progress` is a keep-alive, not a decision: it is swallowed here and
    /// the wait continues for the real answer. A `Skip` decision is recorded
    /// on the session so subsequent `header`/`body` calls become no-ops.
    async fn expect_decision(&mut self) -> Result<Action, ResponseError> {
        loop {
            let resp = self.receive_answer().await?;

            let command = match CommandType::try_from(resp)? {
                CommandType::Action(action) => action,
                CommandType::ModificationAction(_) => {
                    return Err(ResponseError::UnexpectedModification)
                }
            };

            match &command {
                Action::Progress(_) => continue,
                Action::Skip(_) => {
                    match self.session.phase() {
                        Phase::Header => self.session.skip(SkippableStage::Header)?,
                        Phase::Body => self.session.skip(SkippableStage::Body)?,
                        _ => return Err(ResponseError::ProtocolError(
                            ProtocolError::ActionNotPermitted(
                                "Skip is only legal during Header or Body streaming",
                            ),
                        )),
                    }
                    return Ok(command);
                }
                _ => return Ok(command),
            }
        }
    }
}

/// An error for all problems the client could experience
#[derive(Debug, Error)]
pub enum ResponseError {
    /// Anything protocol related
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),
    /// If there should have been a response
    #[error("Server did not respond to a query")]
    MissingServerResponse,
    /// If there was a response but it was the wrong one
    #[error("Server respond with an unexpected answer")]
    Unexpected(ServerCommand),
    /// A modification packet arrived outside of end-of-body processing
    #[error("Received a modification action outside end-of-body processing")]
    UnexpectedModification,
    /// If we have a protocol compatibility issue
    #[error(transparent)]
    CompatibilityError(#[from] CompatibilityError),
}

/// The types of commands the server may respond with
pub enum CommandType {
    /// A regular control flow action
    Action(Action),
    /// A data modification action
    ModificationAction(ModificationAction),
}

impl TryFrom<ServerCommand> for CommandType {
    type Error = ResponseError;

    fn try_from(value: ServerCommand) -> Result<Self, Self::Error> {
        match value {
            ServerCommand::OptNeg(value) => Err(ResponseError::Unexpected(value.into())),
            ServerCommand::Abort(value) => Ok(Self::Action(value.into())),
            ServerCommand::Continue(value) => Ok(Self::Action(value.into())),
            ServerCommand::Accept(value) => Ok(Self::Action(value.into())),
            ServerCommand::Discard(value) => Ok(Self::Action(value.into())),
            ServerCommand::Reject(value) => Ok(Self::Action(value.into())),
            ServerCommand::Tempfail(value) => Ok(Self::Action(value.into())),
            ServerCommand::Skip(value) => Ok(Self::Action(value.into())),
            ServerCommand::Replycode(value) => Ok(Self::Action(value.into())),
            ServerCommand::Progress(value) => Ok(Self::Action(value.into())),
            ServerCommand::AddRecipient(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::AddRecipientWithArgs(value) => {
                Ok(Self::ModificationAction(value.into()))
            }
            ServerCommand::DeleteRecipient(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::ReplaceBody(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::ChangeFrom(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::AddHeader(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::InsertHeader(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::ChangeHeader(value) => Ok(Self::ModificationAction(value.into())),
            ServerCommand::Quarantine(value) => Ok(Self::ModificationAction(value.into())),
        }
    }
}
