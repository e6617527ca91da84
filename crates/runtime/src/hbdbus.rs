//! HBDBus subprotocol
//!
//! A data-bus layer stacked on the framed message protocol. Packets are
//! JSON texts; the first exchange authenticates the connection: the
//! server sends an `auth` packet carrying a challenge code, the client
//! answers with its identity and an HMAC-SHA256 signature of the
//! challenge, encoded in base64.

use crate::error::{set_last_error, Error};
use crate::message::MessageChannel;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::cell::RefCell;
use std::rc::Rc;

pub const HBDBUS_PROTOCOL_NAME: &str = "HBDBUS";
pub const HBDBUS_PROTOCOL_VERSION: u32 = 200;
pub const HBDBUS_MINIMAL_PROTOCOL_VERSION: u32 = 200;

pub const HBDBUS_MIN_PACKET_BUFF_SIZE: usize = 512;
pub const HBDBUS_DEF_PACKET_BUFF_SIZE: usize = 1024;

/// The framing limits this subprotocol runs with.
pub const HBDBUS_MAX_FRAME_PAYLOAD_SIZE: usize = 4096;
pub const HBDBUS_MAX_INMEM_PAYLOAD_SIZE: usize = 40960;
pub const HBDBUS_MAX_PING_TIME: u32 = 60;
pub const HBDBUS_MAX_NO_RESPONDING_TIME: u32 = 90;

/// The length of an application signing key.
pub const LEN_PRIVATE_HMAC_KEY: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// Who this endpoint claims to be, plus its signing key.
#[derive(Debug, Clone)]
pub struct BusIdentity {
    pub host_name: String,
    pub app_name: String,
    pub runner_name: String,
    pub secret_key: Vec<u8>,
}

/// Sign arbitrary data with an app key.
pub fn sign_data(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-position comparison of a signature against freshly signed
/// data.
pub fn verify_signature(key: &[u8], data: &[u8], sig: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.verify_slice(sig).is_ok()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitialPacket {
    packet_type: String,
    #[serde(default)]
    challenge_code: Option<String>,
    #[serde(default)]
    protocol_name: Option<String>,
    #[serde(default)]
    protocol_version: Option<u32>,
    #[serde(default)]
    ret_code: Option<i32>,
    #[serde(default)]
    ret_msg: Option<String>,
}

/// Extract the challenge code from the server's initial packet,
/// verifying protocol name and version.
pub fn parse_challenge(payload: &str) -> Result<String, Error> {
    let packet: InitialPacket =
        serde_json::from_str(payload).map_err(|_| set_last_error(Error::ProtocolViolation))?;

    match packet.packet_type.to_ascii_lowercase().as_str() {
        "error" => {
            tracing::warn!(
                ret_code = packet.ret_code.unwrap_or(0),
                ret_msg = packet.ret_msg.as_deref().unwrap_or("<N/A>"),
                "refused by server"
            );
            Err(set_last_error(Error::AccessDenied))
        }
        "auth" => {
            let name = packet.protocol_name.as_deref().unwrap_or("<N/A>");
            let version = packet.protocol_version.unwrap_or(0);
            if !name.eq_ignore_ascii_case(HBDBUS_PROTOCOL_NAME)
                || version < HBDBUS_MINIMAL_PROTOCOL_VERSION
            {
                return Err(set_last_error(Error::ProtocolViolation));
            }
            packet
                .challenge_code
                .ok_or_else(|| set_last_error(Error::ProtocolViolation))
        }
        _ => Err(set_last_error(Error::ProtocolViolation)),
    }
}

/// The `auth` packet answering a challenge. Base64 keeps the signature
/// free of characters needing JSON escapes.
pub fn compose_auth_packet(identity: &BusIdentity, challenge: &str) -> String {
    let sig = sign_data(&identity.secret_key, challenge.as_bytes());
    format!(
        "{{\
         \"packetType\":\"auth\",\
         \"protocolName\":\"{}\",\
         \"protocolVersion\":{},\
         \"hostName\":\"{}\",\
         \"appName\":\"{}\",\
         \"runnerName\":\"{}\",\
         \"signature\":\"{}\",\
         \"encodedIn\":\"base64\"\
         }}",
        HBDBUS_PROTOCOL_NAME,
        HBDBUS_PROTOCOL_VERSION,
        identity.host_name,
        identity.app_name,
        identity.runner_name,
        BASE64.encode(sig),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusPhase {
    Authenticating,
    Ready,
    Failed,
}

/// The bus connection: authentication state over a message channel.
pub struct BusChannel {
    chan: Rc<MessageChannel>,
    identity: BusIdentity,
    phase: RefCell<BusPhase>,
}

impl BusChannel {
    pub fn new(chan: Rc<MessageChannel>, identity: BusIdentity) -> Rc<BusChannel> {
        Rc::new(BusChannel {
            chan,
            identity,
            phase: RefCell::new(BusPhase::Authenticating),
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.phase.borrow() == BusPhase::Ready
    }

    /// Feed one inbound TEXT payload. During authentication the packet
    /// is consumed here; afterwards `Ok(Some(_))` hands it to the
    /// application.
    pub fn on_packet(self: &Rc<Self>, payload: &str) -> Result<Option<String>, Error> {
        let phase = *self.phase.borrow();
        match phase {
            BusPhase::Authenticating => {
                match parse_challenge(payload) {
                    Ok(challenge) => {
                        let auth = compose_auth_packet(&self.identity, &challenge);
                        self.chan.send_message(true, auth.as_bytes())?;
                        *self.phase.borrow_mut() = BusPhase::Ready;
                        Ok(None)
                    }
                    Err(e) => {
                        *self.phase.borrow_mut() = BusPhase::Failed;
                        Err(e)
                    }
                }
            }
            BusPhase::Ready => Ok(Some(payload.to_string())),
            BusPhase::Failed => Err(set_last_error(Error::AccessDenied)),
        }
    }

    /// Send one JSON packet to the bus.
    pub fn send_packet(self: &Rc<Self>, json: &str) -> Result<(), Error> {
        if !self.is_ready() {
            return Err(set_last_error(Error::Again));
        }
        self.chan.send_message(true, json.as_bytes())
    }

    pub fn close(self: &Rc<Self>) -> Result<(), Error> {
        self.chan.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> BusIdentity {
        BusIdentity {
            host_name: "localhost".to_string(),
            app_name: "cn.example.app".to_string(),
            runner_name: "main".to_string(),
            secret_key: vec![0x5A; LEN_PRIVATE_HMAC_KEY],
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let key = [7u8; LEN_PRIVATE_HMAC_KEY];
        let sig = sign_data(&key, b"challenge-123");
        assert_eq!(sig.len(), 32);
        assert!(verify_signature(&key, b"challenge-123", &sig));
        assert!(!verify_signature(&key, b"challenge-124", &sig));
        let other = [8u8; LEN_PRIVATE_HMAC_KEY];
        assert!(!verify_signature(&other, b"challenge-123", &sig));
    }

    #[test]
    fn test_parse_challenge() {
        let packet = format!(
            "{{\"packetType\":\"auth\",\"protocolName\":\"{HBDBUS_PROTOCOL_NAME}\",\
             \"protocolVersion\":{HBDBUS_PROTOCOL_VERSION},\
             \"challengeCode\":\"deadbeef\"}}"
        );
        assert_eq!(parse_challenge(&packet).unwrap(), "deadbeef");
    }

    #[test]
    fn test_parse_challenge_rejects() {
        // wrong version
        let packet = "{\"packetType\":\"auth\",\"protocolName\":\"HBDBUS\",\
                      \"protocolVersion\":100,\"challengeCode\":\"x\"}";
        assert_eq!(parse_challenge(packet), Err(Error::ProtocolViolation));

        // server-side refusal
        let packet = "{\"packetType\":\"error\",\"retCode\":403,\"retMsg\":\"denied\"}";
        assert_eq!(parse_challenge(packet), Err(Error::AccessDenied));

        // missing challenge
        let packet = "{\"packetType\":\"auth\",\"protocolName\":\"HBDBUS\",\
                      \"protocolVersion\":200}";
        assert_eq!(parse_challenge(packet), Err(Error::ProtocolViolation));

        // not even JSON
        assert_eq!(parse_challenge("garbage"), Err(Error::ProtocolViolation));
    }

    #[test]
    fn test_auth_packet_shape() {
        let packet = compose_auth_packet(&identity(), "deadbeef");
        let parsed: serde_json::Value = serde_json::from_str(&packet).unwrap();
        assert_eq!(parsed["packetType"], "auth");
        assert_eq!(parsed["protocolName"], HBDBUS_PROTOCOL_NAME);
        assert_eq!(parsed["protocolVersion"], HBDBUS_PROTOCOL_VERSION);
        assert_eq!(parsed["appName"], "cn.example.app");
        assert_eq!(parsed["encodedIn"], "base64");

        // the signature round-trips through base64 and verifies
        let sig = BASE64
            .decode(parsed["signature"].as_str().unwrap())
            .unwrap();
        assert!(verify_signature(
            &identity().secret_key,
            b"deadbeef",
            &sig
        ));
    }
}
