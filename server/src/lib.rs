#![doc = include_str!("../Readme.md")]

mod codec;
mod listener;
mod milter;

#[cfg(feature = "_fuzzing")]
pub mod fuzzing;

use std::any::Any;
use std::panic::AssertUnwindSafe;

use asynchronous_codec::Framed;
pub use listener::{Listener, ShutdownHandle, StopSignal};
pub use milter::{Error, Milter, MilterFactory};

use futures::{AsyncRead, AsyncWrite, Future, FutureExt, SinkExt, StreamExt};
use miltr_common::{
    actions::{Action, Skip},
    decoding::ClientCommand,
    encoding::ServerMessage,
    optneg::Capability,
    session::{Phase, Session, SkippableStage},
};
use miltr_utils::debug;
#[cfg(feature = "tracing")]
use tracing::instrument;

pub(crate) use self::codec::MilterCodec;

/// The entry point to host a milter server
#[derive(Debug)]
pub struct Server<'m, M: Milter> {
    milter: &'m mut M,
    codec: MilterCodec,
    quit_on_abort: bool,
    stop_signal: Option<StopSignal>,
}

impl<'m, M: Milter> Server<'m, M> {
    /// Create a new Server to handle connections
    pub fn new(milter: &'m mut M, quit_on_abort: bool, max_buffer_size: usize) -> Self {
        let codec = MilterCodec::new(max_buffer_size);
        Self {
            milter,
            codec,
            quit_on_abort,
            stop_signal: None,
        }
    }

    /// Check `signal` between messages and close the connection instead of
    /// waiting for the next envelope once it reports stopping.
    ///
    /// Used by [`Listener::serve`] to implement
    /// [`ShutdownHandle::shutdown`](crate::ShutdownHandle::shutdown)'s
    /// "complete the current message, then close" contract rather than
    /// cutting the connection off mid-message.
    #[must_use]
    pub fn with_stop_signal(mut self, signal: StopSignal) -> Self {
        self.stop_signal = Some(signal);
        self
    }

    /// True once a stop has been requested and there's no message in
    /// flight for this connection to finish first.
    fn should_stop(&self) -> bool {
        self.stop_signal.as_ref().is_some_and(StopSignal::is_stopping)
    }

    /// Create a server with defaults working with postfix.
    ///
    /// The main difference is treating the call to `abort` like a call to
    /// `quit`. See [this comment][c] as a source in the postfix docs
    ///
    /// AFAIK, originally there where three use cases individual methods:
    /// 1. Abort \
    ///   The current smtp client that is connected to the milter client
    ///   has finished. Next mail arrives.
    /// 2. Quit \
    ///   The current smtp client that was connected to the milter client
    ///   has quit it's connection and the milter client will now quit this
    ///   connection.
    /// 3. Quit NC \
    ///   The current smtp client that was connected to the milter client
    ///   has quit it's connection but the milter client would like to re-use
    ///   this connection for someone else.
    ///
    /// Different implementation mix them up, making e.g. postfix just always
    /// opening up a new connection for every milter conversation.
    ///
    /// [c]: https://github.com/vdukhovni/postfix/blob/17dbfb9b8b9b483a23ea84dcd272c6d4010ad74b/postfix/src/milter/milter8.c#L387-L392
    #[must_use]
    pub fn default_postfix(milter: &'m mut M) -> Self {
        Self::new(milter, true, 2_usize.pow(16))
    }

    /// Handle a single milter connection.
    ///
    /// Drives a fresh [`Session`] state machine alongside the wire protocol:
    /// packets out of order for the current SMTP phase are rejected with a
    /// [`ProtocolError::IllegalPhase`](miltr_common::ProtocolError::IllegalPhase)
    /// before the filter is ever called, a `Skip` decision during `Header` or
    /// `Body` withholds further chunks of that stage from the filter, and
    /// `Abort`/end-of-message return the session to `Phase::Helo` for the
    /// next envelope's `Mail` on the same connection.
    ///
    /// # Arguments
    /// - milter: the object implementing [`crate::Milter`]. It's methods will
    ///   be called at the appropriate times.
    ///
    /// # Errors
    /// This basically errors for three cases: Io Problems, Codec Problems and
    /// problems returned by the milter implementation.
    ///
    /// Have a look at [`enum@crate::Error`] for more information.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub async fn handle_connection<RW: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        socket: RW,
    ) -> Result<(), Error<M::Error>> {
        let mut framed = Framed::new(socket, &mut self.codec);
        let mut session = Session::new();

        while let Some(command) = framed.next().await {
            let command = command?;
            debug!("Received {}", command);

            match command {
                // First, all the regular smtp related commands
                ClientCommand::Helo(helo) => {
                    session.advance(Phase::Helo, b'H')?;
                    Self::notify_respond_answer(
                        guarded(self.milter.helo(helo)),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                ClientCommand::Connect(connect) => {
                    session.advance(Phase::Conn, b'C')?;
                    Self::notify_respond_answer(
                        guarded(self.milter.connect(connect)),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                ClientCommand::Mail(mail) => {
                    session.advance(Phase::Mail, b'M')?;
                    Self::notify_respond_answer(
                        guarded(self.milter.mail(mail)),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                ClientCommand::Recipient(rcpt) => {
                    session.advance(Phase::Rcpt, b'R')?;
                    Self::notify_respond_answer(
                        guarded(self.milter.rcpt(rcpt)),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                ClientCommand::Data(_v) => {
                    session.advance(Phase::Data, b'T')?;
                    Self::notify_respond_answer(
                        guarded(self.milter.data()),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                ClientCommand::Header(header) => {
                    session.advance(Phase::Header, b'L')?;

                    if session.is_skipped(SkippableStage::Header) {
                        framed.send(&Action::from(Skip).into()).await?;
                        continue;
                    }

                    let response = guarded(self.milter.header(header)).await;
                    Self::respond_and_track_skip(
                        response,
                        &mut framed,
                        &mut session,
                        SkippableStage::Header,
                    )
                    .await?;
                }
                ClientCommand::EndOfHeader(_v) => {
                    session.advance(Phase::Eoh, b'N')?;
                    Self::notify_respond_answer(
                        guarded(self.milter.end_of_header()),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                ClientCommand::Body(body) => {
                    session.advance(Phase::Body, b'B')?;

                    if session.is_skipped(SkippableStage::Body) {
                        framed.send(&Action::from(Skip).into()).await?;
                        continue;
                    }

                    let response = guarded(self.milter.body(body)).await;
                    Self::respond_and_track_skip(
                        response,
                        &mut framed,
                        &mut session,
                        SkippableStage::Body,
                    )
                    .await?;
                }
                ClientCommand::Unknown(unknown) => {
                    Self::notify_respond_answer(
                        guarded(self.milter.unknown(unknown)),
                        &mut framed,
                        &mut session,
                    )
                    .await?;
                }
                // Regular smtp session related commands that need special responses
                ClientCommand::EndOfBody(_v) => {
                    session.advance(Phase::Eob, b'E')?;

                    // Notify the milter trait implementation
                    let responses = match guarded(self.milter.end_of_body()).await {
                        Ok(responses) => responses,
                        Err(err) if is_recoverable(&err) => {
                            log_recovered_panic(&err);
                            session.reset_for_next_message();
                            let tempfail: Action = miltr_common::actions::Tempfail.into();
                            framed.send(&tempfail.into()).await?;
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    // A modification outside the negotiated capabilities is
                    // a protocol violation (invariant I3): close the
                    // session instead of silently dropping the offending
                    // entry. Best-effort notify the filter via `abort`,
                    // the closest thing to a Cleanup callback this trait
                    // has, before tearing the connection down.
                    if let Err(err) = responses.check_capabilities(
                        session
                            .options
                            .as_ref()
                            .map_or(Capability::all(), |o| o.capabilities),
                    ) {
                        let _ = self.milter.abort().await;
                        session.close();
                        return Err(err.into());
                    }

                    // And send them back
                    let responses: Vec<ServerMessage> = responses.into();
                    for response in responses {
                        debug!("Sending response");
                        framed.send(&response).await?;
                    }

                    session.reset_for_next_message();

                    if self.should_stop() {
                        session.close();
                        return Err(Error::ShuttingDown);
                    }
                }
                ClientCommand::Macro(macro_) => {
                    session.set_macros(
                        macro_.code,
                        macro_.macros().map(|(name, value)| {
                            (
                                String::from_utf8_lossy(name).into_owned(),
                                String::from_utf8_lossy(value).into_owned(),
                            )
                        }),
                    );
                    self.milter
                        .macro_(macro_)
                        .await
                        .map_err(Error::from_app_error)?;
                    continue;
                }

                // Control flow cases
                // Option Negotiation
                ClientCommand::OptNeg(opt_neg) => {
                    let response = self.milter.option_negotiation(opt_neg).await?;
                    session.negotiate(response.clone())?;
                    framed.send(&response.into()).await?;
                }
                // Abort the current smtp session handling
                ClientCommand::Abort(_v) => {
                    let response = self.milter.abort().await.map_err(Error::from_app_error)?;

                    if self.quit_on_abort {
                        self.milter.quit().await.map_err(Error::from_app_error)?;
                        session.close();
                        return Ok(());
                    }
                    session.reset_for_next_message();
                    framed.send(&response.into()).await?;

                    if self.should_stop() {
                        session.close();
                        return Err(Error::ShuttingDown);
                    }
                }
                // Quit this connection
                ClientCommand::Quit(_v) => {
                    self.milter.quit().await.map_err(Error::from_app_error)?;
                    session.close();
                    return Ok(());
                }
                // Quit and re-use this connection
                ClientCommand::QuitNc(_v) => {
                    self.milter.quit_nc().await.map_err(Error::from_app_error)?;
                    session.reset_for_new_connection();
                    continue;
                }
            };
        }
        Ok(())
    }

    /// Helper function to notify the milter, handle errors and respond
    async fn notify_respond_answer<RW: AsyncRead + AsyncWrite + Unpin>(
        milter_fn: impl Future<Output = Result<impl Into<Action>, Error<M::Error>>>,
        framed: &mut Framed<RW, &mut MilterCodec>,
        session: &mut Session,
    ) -> Result<(), Error<M::Error>> {
        let response: Action = match milter_fn.await {
            Ok(response) => response.into(),
            Err(err) if is_recoverable(&err) => {
                log_recovered_panic(&err);
                session.reset_for_next_message();
                miltr_common::actions::Tempfail.into()
            }
            Err(err) => return Err(err),
        };

        framed.send(&response.into()).await?;
        Ok(())
    }

    /// Like [`Self::notify_respond_answer`], but additionally records a
    /// `Skip` decision on the session so further chunks of `stage` are
    /// withheld from the filter.
    async fn respond_and_track_skip<RW: AsyncRead + AsyncWrite + Unpin>(
        response: Result<Action, Error<M::Error>>,
        framed: &mut Framed<RW, &mut MilterCodec>,
        session: &mut Session,
        stage: SkippableStage,
    ) -> Result<(), Error<M::Error>> {
        let response = match response {
            Ok(response) => response,
            Err(err) if is_recoverable(&err) => {
                log_recovered_panic(&err);
                session.reset_for_next_message();
                miltr_common::actions::Tempfail.into()
            }
            Err(err) => return Err(err),
        };

        if matches!(response, Action::Skip(_)) {
            session.skip(stage)?;
        }

        framed.send(&response.into()).await?;
        Ok(())
    }
}

/// Run `fut`, catching any panic and turning it into [`Error::Panicked`]
/// instead of unwinding across the connection's task boundary.
async fn guarded<Fut, T, E>(fut: Fut) -> Result<T, Error<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(inner) => inner.map_err(Error::from_app_error),
        Err(panic) => Err(Error::Panicked(panic_message(&panic))),
    }
}

/// A panic on a message-scoped callback is recoverable: the envelope gets a
/// `Tempfail` and the connection stays open for the next message. A
/// `Cleanup`-equivalent (`abort`/`quit`) panic is not caught this way; those
/// calls are awaited directly and close the connection.
fn is_recoverable<E>(err: &Error<E>) -> bool {
    matches!(err, Error::Panicked(_) | Error::Impl { .. })
}

fn log_recovered_panic<E>(err: &Error<E>) {
    debug!("Filter callback failed, converting to Tempfail for this envelope: {err}");
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
