//! Mail transport over the serial link to the network co-processor, which
//! runs the authenticated SMTP session.
//!
//! Frame sent per message:
//!
//! ```text
//! MAIL <host>:<port>
//! USER <username>
//! PASS <password>
//! TO <recipient>
//! SUBJECT <subject>
//! <body, dot-stuffed>
//! .
//! ```
//!
//! The co-processor answers `OK` or `ERR <reason>`.

use arrayvec::ArrayString;
use core::fmt::Write;
use embassy_stm32::mode::Async;
use embassy_stm32::usart::Uart;
use embassy_time::{Duration, with_timeout};

use business_logic::notification::{Envelope, Mailer, TransportError};
use crate::fmt::debug;

const FRAME_LEN: usize = 768;
const REPLY_LEN: usize = 32;
pub const SEND_TIMEOUT: Duration = Duration::from_secs(20); // SMTP handshake plus TLS.

pub struct LinkMailer {
    uart: Uart<'static, Async>,
    timeout: Duration,
}

impl LinkMailer {
    pub fn new(uart: Uart<'static, Async>, timeout: Duration) -> Self {
        Self { uart, timeout }
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.uart.write(frame).await.map_err(|_| TransportError::Link)?;
        let mut reply = [0u8; REPLY_LEN];
        let n = self
            .uart
            .read_until_idle(&mut reply)
            .await
            .map_err(|_| TransportError::Link)?;
        let reply = core::str::from_utf8(&reply[..n]).map_err(|_| TransportError::Link)?;
        debug!("mail link replied {=str}", reply.trim());
        match reply.trim() {
            "OK" => Ok(()),
            r if r.starts_with("ERR") => Err(TransportError::Rejected),
            _ => Err(TransportError::Link),
        }
    }
}

impl Mailer for LinkMailer {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = encode_frame(envelope).ok_or(TransportError::Rejected)?;
        with_timeout(self.timeout, self.exchange(frame.as_bytes()))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

fn encode_frame(envelope: &Envelope) -> Option<ArrayString<FRAME_LEN>> {
    let mut frame = ArrayString::new();
    let account = &envelope.account;
    write!(frame, "MAIL {}:{}\n", account.host, account.port).ok()?;
    write!(frame, "USER {}\nPASS {}\n", account.username, account.password).ok()?;
    write!(frame, "TO {}\nSUBJECT {}\n", envelope.recipient, envelope.message.subject).ok()?;
    for line in envelope.message.body.lines() {
        if line.starts_with('.') {
            frame.try_push('.').ok()?;
        }
        write!(frame, "{}\n", line).ok()?;
    }
    frame.try_push_str(".\n").ok()?;
    Some(frame)
}
