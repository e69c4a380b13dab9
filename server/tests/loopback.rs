//! End-to-end protocol tests: a `miltr_client::Client` and a `miltr_server::Server`
//! talking over an in-process duplex pipe, with no real MTA involved.
//!
//! This exercises the session state machine, `Skip`, capability filtering
//! and abort/reset the way the postfix-backed integration tests can't: those
//! need a running postfix and only drive the happy path.

use async_trait::async_trait;
use tokio_util::compat::TokioAsyncReadCompatExt;

use miltr_client::Client;
use miltr_common::{
    actions::{Accept, Action, Continue, Reject},
    commands::{Body, Connect, Family, Header, Helo, Mail, Recipient, Unknown},
    modifications::{headers::AddHeader, body::ReplaceBody, ModificationResponse},
    optneg::{Capability, OptNeg},
    ProtocolError,
};
use miltr_server::{Error, Milter, Server};

fn connect_info() -> Connect {
    Connect::new(b"localhost", Family::Inet, Some(2525), b"127.0.0.1")
}

struct AcceptMilter;

#[async_trait]
impl Milter for AcceptMilter {
    type Error = std::convert::Infallible;

    async fn end_of_body(&mut self) -> Result<ModificationResponse, Self::Error> {
        Ok(ModificationResponse::builder().build(Accept))
    }

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn empty_message_is_accepted() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = AcceptMilter;
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client
        .connect_via(client_side.compat())
        .await
        .expect("option negotiation failed");

    assert!(matches!(
        connection.connect(connect_info()).await.unwrap(),
        Action::Continue(_)
    ));
    assert!(matches!(
        connection.helo(Helo::from(&b"localhost"[..])).await.unwrap(),
        Action::Continue(_)
    ));
    assert!(matches!(
        connection.mail(Mail::from(&b"sender@test.local"[..])).await.unwrap(),
        Action::Continue(_)
    ));
    assert!(matches!(
        connection
            .recipient(Recipient::from(&b"rcpt@test.local"[..]))
            .await
            .unwrap(),
        Action::Continue(_)
    ));
    assert!(matches!(connection.data().await.unwrap(), Action::Continue(_)));

    // No headers, no body: end_of_header and end_of_body follow directly.
    assert!(matches!(
        connection.end_of_header().await.unwrap(),
        Action::Continue(_)
    ));
    let response = connection.end_of_body().await.unwrap();
    assert!(response.modifications().is_empty());
    assert!(matches!(response.final_action(), Action::Accept(_)));

    connection.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

struct RejectAtRcptMilter;

#[async_trait]
impl Milter for RejectAtRcptMilter {
    type Error = std::convert::Infallible;

    async fn rcpt(&mut self, _recipient: Recipient) -> Result<Action, Self::Error> {
        Ok(Reject.into())
    }

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn reject_at_rcpt_then_reset_for_next_message() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = RejectAtRcptMilter;
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client.connect_via(client_side.compat()).await.unwrap();

    connection.connect(connect_info()).await.unwrap();
    connection.helo(Helo::from(&b"localhost"[..])).await.unwrap();
    connection.mail(Mail::from(&b"sender@test.local"[..])).await.unwrap();

    let decision = connection
        .recipient(Recipient::from(&b"rcpt@test.local"[..]))
        .await
        .unwrap();
    assert!(matches!(decision, Action::Reject(_)));

    // The MTA gives up on this envelope and resets for the next one on the
    // same connection.
    connection.reset().await.unwrap();

    connection.mail(Mail::from(&b"sender2@test.local"[..])).await.unwrap();
    connection
        .recipient(Recipient::from(&b"other@test.local"[..]))
        .await
        .unwrap();

    connection.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

struct HeaderSkipMilter {
    seen: usize,
}

#[async_trait]
impl Milter for HeaderSkipMilter {
    type Error = std::convert::Infallible;

    async fn header(&mut self, _header: Header) -> Result<Action, Self::Error> {
        self.seen += 1;
        if self.seen >= 3 {
            Ok(miltr_common::actions::Skip.into())
        } else {
            Ok(Continue.into())
        }
    }

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn header_skip_after_third_field_withholds_the_rest() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = HeaderSkipMilter { seen: 0 };
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client.connect_via(client_side.compat()).await.unwrap();

    connection.connect(connect_info()).await.unwrap();
    connection.helo(Helo::from(&b"localhost"[..])).await.unwrap();
    connection.mail(Mail::from(&b"sender@test.local"[..])).await.unwrap();
    connection
        .recipient(Recipient::from(&b"rcpt@test.local"[..]))
        .await
        .unwrap();
    connection.data().await.unwrap();

    let headers = [
        ("From", "sender@test.local"),
        ("To", "rcpt@test.local"),
        ("Subject", "hello"),
        ("X-Extra", "should be skipped"),
        ("X-More", "also skipped"),
    ];
    let mut decisions = Vec::new();
    for (name, value) in headers {
        let decision = connection
            .header(Header::new(name.as_bytes(), value.as_bytes()))
            .await
            .unwrap();
        decisions.push(decision);
    }

    assert!(matches!(decisions[0], Action::Continue(_)));
    assert!(matches!(decisions[1], Action::Continue(_)));
    assert!(matches!(decisions[2], Action::Skip(_)));
    // Once skipped, further header() calls on the client side are no-ops
    // that don't even reach the filter.
    assert!(matches!(decisions[3], Action::Skip(_)));
    assert!(matches!(decisions[4], Action::Skip(_)));

    connection.end_of_header().await.unwrap();
    let response = connection
        .body_read_from(futures::io::Cursor::new(&b""[..]))
        .await
        .unwrap();
    assert!(matches!(response.final_action(), Action::Continue(_)));

    connection.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

struct BodyReplaceMilter;

#[async_trait]
impl Milter for BodyReplaceMilter {
    type Error = std::convert::Infallible;

    async fn end_of_body(&mut self) -> Result<ModificationResponse, Self::Error> {
        let mut builder = ModificationResponse::builder();
        builder.push(ReplaceBody::new(b"REPLACED BODY"));
        Ok(builder.contin())
    }

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn body_replacement_is_returned_as_a_modification() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = BodyReplaceMilter;
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client.connect_via(client_side.compat()).await.unwrap();

    connection.connect(connect_info()).await.unwrap();
    connection.helo(Helo::from(&b"localhost"[..])).await.unwrap();
    connection.mail(Mail::from(&b"sender@test.local"[..])).await.unwrap();
    connection
        .recipient(Recipient::from(&b"rcpt@test.local"[..]))
        .await
        .unwrap();
    connection.data().await.unwrap();
    connection.end_of_header().await.unwrap();

    let response = connection
        .body_read_from(futures::io::Cursor::new(&b"original body"[..]))
        .await
        .unwrap();

    assert_eq!(response.modifications().len(), 1);
    assert!(matches!(response.final_action(), Action::Continue(_)));

    connection.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

struct CapabilityRestrictedMilter;

#[async_trait]
impl Milter for CapabilityRestrictedMilter {
    type Error = std::convert::Infallible;

    async fn option_negotiation(
        &mut self,
        _theirs: OptNeg,
    ) -> Result<OptNeg, Error<Self::Error>> {
        Ok(OptNeg {
            capabilities: Capability::all().difference(Capability::SMFIF_ADDHDRS),
            ..OptNeg::default()
        })
    }

    async fn end_of_body(&mut self) -> Result<ModificationResponse, Self::Error> {
        let mut builder = ModificationResponse::builder();
        builder.push(AddHeader::new(b"X-Disallowed", b"should not arrive"));
        Ok(builder.contin())
    }

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn modification_outside_negotiated_capabilities_closes_the_session() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = CapabilityRestrictedMilter;
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client.connect_via(client_side.compat()).await.unwrap();

    connection.connect(connect_info()).await.unwrap();
    connection.helo(Helo::from(&b"localhost"[..])).await.unwrap();
    connection.mail(Mail::from(&b"sender@test.local"[..])).await.unwrap();
    connection
        .recipient(Recipient::from(&b"rcpt@test.local"[..]))
        .await
        .unwrap();
    connection.data().await.unwrap();
    connection.end_of_header().await.unwrap();

    // The server's own negotiated capabilities excluded SMFIF_ADDHDRS, but
    // the filter pushed an `AddHeader` anyway: the runtime raises
    // `ProtocolError::ActionNotPermitted` and closes the connection without
    // ever sending a response, instead of silently dropping the
    // modification and continuing.
    let result = connection
        .body_read_from(futures::io::Cursor::new(&b""[..]))
        .await;
    assert!(result.is_err());

    let server_result = server_task.await.unwrap();
    assert!(matches!(
        server_result,
        Err(Error::Codec(ProtocolError::ActionNotPermitted(_)))
    ));
}

struct AbortMidBodyMilter;

#[async_trait]
impl Milter for AbortMidBodyMilter {
    type Error = std::convert::Infallible;

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn abort_mid_body_resets_session_for_the_next_message() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = AbortMidBodyMilter;
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client.connect_via(client_side.compat()).await.unwrap();

    connection.connect(connect_info()).await.unwrap();
    connection.helo(Helo::from(&b"localhost"[..])).await.unwrap();
    connection.mail(Mail::from(&b"sender@test.local"[..])).await.unwrap();
    connection
        .recipient(Recipient::from(&b"rcpt@test.local"[..]))
        .await
        .unwrap();
    connection.data().await.unwrap();
    connection.end_of_header().await.unwrap();
    connection
        .body(Body::from(&b"first chunk, never finished"[..]))
        .await
        .unwrap();

    // The MTA aborts mid-body; the connection stays open for a new message.
    connection.reset().await.unwrap();

    connection.mail(Mail::from(&b"sender2@test.local"[..])).await.unwrap();
    connection
        .recipient(Recipient::from(&b"other@test.local"[..]))
        .await
        .unwrap();
    connection.data().await.unwrap();
    connection.end_of_header().await.unwrap();
    let response = connection
        .body_read_from(futures::io::Cursor::new(&b"second message body"[..]))
        .await
        .unwrap();
    assert!(matches!(response.final_action(), Action::Continue(_)));

    connection.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}

struct UnknownCommandMilter;

#[async_trait]
impl Milter for UnknownCommandMilter {
    type Error = std::convert::Infallible;

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

#[tokio::test]
async fn unknown_command_does_not_disturb_the_phase() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut milter = UnknownCommandMilter;
        let mut server = Server::new(&mut milter, false, 2_usize.pow(16));
        server.handle_connection(server_side.compat()).await
    });

    let client = Client::new(OptNeg::default());
    let mut connection = client.connect_via(client_side.compat()).await.unwrap();

    connection.connect(connect_info()).await.unwrap();
    assert!(matches!(
        connection.unknown(Unknown::from(&b"WEIRD COMMAND"[..])).await.unwrap(),
        Action::Continue(_)
    ));
    connection.helo(Helo::from(&b"localhost"[..])).await.unwrap();

    connection.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}
