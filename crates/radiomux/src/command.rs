//! Typed commands on top of the raw request surface.
//!
//! A command is a request code plus an argument encoder and a response
//! decoder; [`Dispatcher::call`](crate::Dispatcher::call) glues the two
//! ends together. The handful defined here cover the payloads whose shape
//! this crate itself depends on.

use bytes::{Buf, Bytes};

use crate::domain::Domain;
use crate::error::RequestError;
use crate::request::{RequestCode, Response};

pub trait Command {
    const DOMAIN: Domain;
    const CODE: RequestCode;
    type Output: Send + 'static;

    fn encode(&self) -> Bytes;

    fn decode(response: &Response) -> Result<Self::Output, RequestError>;
}

/// Modem activity counters, all in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityInfo {
    pub sleep_ms: u32,
    pub idle_ms: u32,
    pub tx_ms: u32,
    pub rx_ms: u32,
    /// True when the modem did not answer in time and this is the
    /// all-zero default.
    pub synthesized: bool,
}

/// Blocking call: answered with zeroed counters if the modem is slow.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetActivityInfo;

impl Command for GetActivityInfo {
    const DOMAIN: Domain = Domain::Modem;
    const CODE: RequestCode = RequestCode::GET_ACTIVITY_INFO;
    type Output = ActivityInfo;

    fn encode(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(response: &Response) -> Result<ActivityInfo, RequestError> {
        let mut buf = response.payload.clone();
        if buf.remaining() < 16 {
            return Err(RequestError::InvalidResponse(format!(
                "activity info needs 16 bytes, got {}",
                buf.remaining()
            )));
        }
        Ok(ActivityInfo {
            sleep_ms: buf.get_u32_le(),
            idle_ms: buf.get_u32_le(),
            tx_ms: buf.get_u32_le(),
            rx_ms: buf.get_u32_le(),
            synthesized: response.synthesized,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetBasebandVersion;

impl Command for GetBasebandVersion {
    const DOMAIN: Domain = Domain::Modem;
    const CODE: RequestCode = RequestCode::BASEBAND_VERSION;
    type Output = String;

    fn encode(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(response: &Response) -> Result<String, RequestError> {
        String::from_utf8(response.payload.to_vec())
            .map_err(|e| RequestError::InvalidResponse(e.to_string()))
    }
}

/// Turns the radio on or off.
#[derive(Debug, Clone, Copy)]
pub struct SetRadioPower {
    pub on: bool,
}

impl Command for SetRadioPower {
    const DOMAIN: Domain = Domain::Modem;
    const CODE: RequestCode = RequestCode::RADIO_POWER;
    type Output = ();

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[u8::from(self.on)])
    }

    fn decode(_: &Response) -> Result<(), RequestError> {
        Ok(())
    }
}
