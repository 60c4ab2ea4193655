//! Anonymous NTLM message codec.
//!
//! Produces the three-message NTLMSSP handshake with no real identity: the
//! negotiate (Type 1) and authenticate (Type 3) messages carry empty
//! domain/user buffers and the anonymous flag, and the challenge (Type 2) is
//! only validated and echoed into the final message's flags. No credential
//! material exists anywhere in this module, so there is nothing to hash or
//! encrypt; some origins accept exactly this.

use crate::errors::{Error, Result};

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ANONYMOUS: u32 = 0x0000_0800;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

/// NTLM client context configured for anonymous identity.
///
/// Mirrors the shape of a real NTLM client (create context, produce
/// negotiate, feed challenge, produce authenticate) with empty
/// domain/user/secret throughout.
#[derive(Debug, Default)]
pub struct AnonClient;

impl AnonClient {
  /// Create an anonymous client context.
  pub fn new() -> Self {
    Self
  }

  /// Build the Type 1 (Negotiate) message.
  pub fn negotiate(&self) -> Vec<u8> {
    let flags: u32 = NEGOTIATE_UNICODE
      | NEGOTIATE_OEM
      | REQUEST_TARGET
      | NEGOTIATE_NTLM
      | NEGOTIATE_ANONYMOUS
      | NEGOTIATE_ALWAYS_SIGN;

    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(NTLMSSP_SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes()); // MessageType = 1
    msg.extend_from_slice(&flags.to_le_bytes());
    // DomainNameFields (length=0, maxlength=0, offset=32)
    write_security_buffer(&mut msg, 0, 32);
    // WorkstationFields (length=0, maxlength=0, offset=32)
    write_security_buffer(&mut msg, 0, 32);
    msg
  }

  /// Validate the Type 2 (Challenge) message and build the anonymous Type 3
  /// (Authenticate) answer.
  ///
  /// The LM response is the single zero byte MS-NLMP prescribes for anonymous
  /// sessions; the NT response and all identity buffers are empty.
  pub fn authenticate(&self, challenge: &[u8]) -> Result<Vec<u8>> {
    // The server challenge has nothing to sign against without credentials,
    // so the message is only validated, not used.
    let _server_challenge = parse_challenge(challenge)?;

    let flags: u32 =
      NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_ANONYMOUS | NEGOTIATE_ALWAYS_SIGN;
    let lm_response = [0u8; 1];

    // Fixed header: signature(8) + type(4) + five security buffers(40)
    // + session key buffer(8) + flags(4) = 64 bytes.
    let base_offset = 64u32;
    let lm_offset = base_offset;
    let empty_offset = lm_offset + lm_response.len() as u32;

    let mut msg = Vec::with_capacity(base_offset as usize + lm_response.len());
    msg.extend_from_slice(NTLMSSP_SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes()); // MessageType = 3
    // LmChallengeResponseFields
    write_security_buffer(&mut msg, lm_response.len() as u16, lm_offset);
    // NtChallengeResponseFields
    write_security_buffer(&mut msg, 0, empty_offset);
    // DomainNameFields
    write_security_buffer(&mut msg, 0, empty_offset);
    // UserNameFields
    write_security_buffer(&mut msg, 0, empty_offset);
    // WorkstationFields
    write_security_buffer(&mut msg, 0, empty_offset);
    // EncryptedRandomSessionKeyFields
    write_security_buffer(&mut msg, 0, empty_offset);
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&lm_response);
    Ok(msg)
  }
}

/// Parse and validate an NTLM Type 2 (Challenge) message, returning the
/// server challenge bytes.
fn parse_challenge(data: &[u8]) -> Result<[u8; 8]> {
  if data.len() < 32 {
    return Err(Error::NtlmAuth(format!(
      "NTLM challenge too short: {} bytes",
      data.len()
    )));
  }
  if &data[0..8] != NTLMSSP_SIGNATURE {
    return Err(Error::ntlm("invalid NTLMSSP signature"));
  }
  let msg_type = u32::from_le_bytes(data[8..12].try_into().unwrap_or_default());
  if msg_type != 2 {
    return Err(Error::NtlmAuth(format!(
      "expected NTLM type 2, got {}",
      msg_type
    )));
  }
  let mut server_challenge = [0u8; 8];
  server_challenge.copy_from_slice(&data[24..32]);
  Ok(server_challenge)
}

fn write_security_buffer(buf: &mut Vec<u8>, length: u16, offset: u32) {
  buf.extend_from_slice(&length.to_le_bytes());
  buf.extend_from_slice(&length.to_le_bytes()); // MaxLength == Length
  buf.extend_from_slice(&offset.to_le_bytes());
}
