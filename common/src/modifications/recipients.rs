//! Add or delete recipients

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use crate::decoding::Parsable;
use crate::encoding::Writable;
use crate::{InvalidData, ProtocolError};
use miltr_utils::ByteParsing;

#[derive(Debug, Clone)]

///Does not change To in Header
pub struct AddRecipient {
    recipient: BytesMut,
}

impl AddRecipient {
    const CODE: u8 = b'+';

    /// Add the specified recipient
    #[must_use]
    pub fn new(recipient: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from_iter(recipient),
        }
    }

    /// The recipient to add
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }
}

impl Parsable for AddRecipient {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.delimited(0) else {
            return Err(InvalidData::new(
                "Received add recipient package without null byte terminating it",
                buffer,
            )
            .into());
        };

        Ok(Self { recipient })
    }
}

impl Writable for AddRecipient {
    ///buffer = recipients
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
/// Does not change To in Header
pub struct DeleteRecipient {
    recipient: BytesMut,
}

impl DeleteRecipient {
    const CODE: u8 = b'-';

    /// Delete the specified recipient
    #[must_use]
    pub fn new(recipient: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from_iter(recipient),
        }
    }

    /// The (exact) recipient to be deleted
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }
}

impl Parsable for DeleteRecipient {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.delimited(0) else {
            return Err(InvalidData::new(
                "Received delete recipient package without null byte terminating it",
                buffer,
            )
            .into());
        };

        Ok(Self { recipient })
    }
}

impl Writable for DeleteRecipient {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Add a recipient, carrying along ESMTP arguments for it (`SMFIR_ADDRCPT_PAR`).
///
/// Unlike [`AddRecipient`] this lets the filter attach the same `MAIL`/`RCPT`
/// parameters (e.g. `SIZE=`, `BODY=`) the MTA would have received for a
/// recipient added directly on the SMTP connection.
#[derive(Debug, Clone)]
pub struct AddRecipientWithArgs {
    recipient: BytesMut,
    esmtp_args: BytesMut,
}

impl AddRecipientWithArgs {
    const CODE: u8 = b'2';

    /// Add `recipient`, passing `esmtp_args` (may be empty) along with it.
    #[must_use]
    pub fn new(recipient: &[u8], esmtp_args: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from_iter(recipient),
            esmtp_args: BytesMut::from_iter(esmtp_args),
        }
    }

    /// The recipient to add
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }

    /// The ESMTP arguments to add alongside the recipient
    #[must_use]
    pub fn esmtp_args(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.esmtp_args)
    }
}

impl Parsable for AddRecipientWithArgs {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.delimited(0) else {
            return Err(InvalidData::new(
                "Received add recipient (with args) package without null byte terminating the recipient",
                buffer,
            )
            .into());
        };

        // The esmtp args are the rest of the payload, NUL-terminated same as
        // the recipient; a missing trailing NUL on this final field is
        // tolerated like any other trailing cstring.
        let esmtp_args = buffer.delimited(0).unwrap_or(buffer);

        Ok(Self {
            recipient,
            esmtp_args,
        })
    }
}

impl Writable for AddRecipientWithArgs {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
        buffer.extend_from_slice(&self.esmtp_args);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1 + self.esmtp_args.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Change the envelope sender (`SMFIR_CHGFROM`), optionally with ESMTP args.
#[derive(Debug, Clone)]
pub struct ChangeFrom {
    from: BytesMut,
    esmtp_args: BytesMut,
}

impl ChangeFrom {
    const CODE: u8 = b'e';

    /// Change the envelope sender to `from`, with optional `esmtp_args`.
    #[must_use]
    pub fn new(from: &[u8], esmtp_args: &[u8]) -> Self {
        Self {
            from: BytesMut::from_iter(from),
            esmtp_args: BytesMut::from_iter(esmtp_args),
        }
    }

    /// The new envelope sender
    #[must_use]
    pub fn from(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.from)
    }

    /// The ESMTP arguments accompanying the new sender
    #[must_use]
    pub fn esmtp_args(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.esmtp_args)
    }
}

impl Parsable for ChangeFrom {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(from) = buffer.delimited(0) else {
            return Err(InvalidData::new(
                "Received change-from package without null byte terminating the sender",
                buffer,
            )
            .into());
        };

        let esmtp_args = buffer.delimited(0).unwrap_or(buffer);

        Ok(Self { from, esmtp_args })
    }
}

impl Writable for ChangeFrom {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.from);
        buffer.put_u8(0);
        buffer.extend_from_slice(&self.esmtp_args);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.from.len() + 1 + self.esmtp_args.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_recipient_with_args_roundtrip() {
        let mut buffer = BytesMut::new();
        let add_rcpt = AddRecipientWithArgs::new(b"alex@gmail", b"SIZE=1024");
        add_rcpt.write(&mut buffer);

        let parsed = AddRecipientWithArgs::parse(buffer).expect("parses back");
        assert_eq!(parsed.recipient(), "alex@gmail");
        assert_eq!(parsed.esmtp_args(), "SIZE=1024");
    }

    #[test]
    fn test_change_from_roundtrip() {
        let mut buffer = BytesMut::new();
        let chg_from = ChangeFrom::new(b"new@sender.example", b"");
        chg_from.write(&mut buffer);

        let parsed = ChangeFrom::parse(buffer).expect("parses back");
        assert_eq!(parsed.from(), "new@sender.example");
        assert_eq!(parsed.esmtp_args(), "");
    }

    #[test]
    fn test_add_recipient() {
        let mut buffer = BytesMut::new();
        let add_rcpt = AddRecipient {
            recipient: BytesMut::from("alex@gmail"),
        };
        add_rcpt.write(&mut buffer);

        assert_eq!(buffer.len(), add_rcpt.len());
        assert_eq!(buffer, BytesMut::from("alex@gmail\0"));
    }

    #[test]
    fn test_delete_recipient() {
        let mut buffer = BytesMut::new();
        let add_rcpt = AddRecipient {
            recipient: BytesMut::from("alex@gmail"),
        };
        add_rcpt.write(&mut buffer);

        assert_eq!(buffer.len(), add_rcpt.len());
        assert_eq!(buffer, BytesMut::from("alex@gmail\0"));
    }
}
