//! Kite Ticker Codec
//!
//! Encodes subscription requests and decodes ticker frames.
//!
//! # Binary Frames
//!
//! Market data arrives as binary frames, big-endian throughout:
//!
//! ```text
//! [u16 packet count] ([u16 packet length] [packet bytes])*
//! ```
//!
//! Each packet starts with the instrument token and last price. Its length
//! selects the layout:
//!
//! | Length | Layout |
//! |--------|--------|
//! | 8      | LTP: token, last price |
//! | 28     | Index quote: + high, low, open, close, change |
//! | 32     | Index full: + exchange timestamp |
//! | 44     | Quote: + quantity, average, volume, buy/sell totals, OHLC |
//! | 184    | Full: + trade time, open interest, exchange timestamp, depth |
//!
//! Prices are integers in paise; currency derivatives use a finer scale.
//! A 1-byte frame is a heartbeat.
//!
//! # Text Frames
//!
//! Postbacks and errors arrive as JSON `{"type": ..., "data": ...}`.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::market::{Instrument, Ohlc, Tick};

// =============================================================================
// Constants
// =============================================================================

const LTP_PACKET: usize = 8;
const INDEX_QUOTE_PACKET: usize = 28;
const INDEX_FULL_PACKET: usize = 32;
const QUOTE_PACKET: usize = 44;
const FULL_PACKET: usize = 184;

const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;

// =============================================================================
// Errors
// =============================================================================

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame shorter than its header claims.
    #[error("truncated frame: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        /// Offset of the read.
        offset: usize,
        /// Bytes the read needed.
        needed: usize,
        /// Bytes left in the frame.
        available: usize,
    },

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

impl CodecError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Truncated { .. } => "truncated",
            Self::InvalidFormat(_) => "invalid_format",
        }
    }
}

// =============================================================================
// Tick Mode
// =============================================================================

/// Detail level requested per instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// Last traded price only.
    Ltp,
    /// Price, volume and day OHLC.
    #[default]
    Quote,
    /// Quote plus open interest, timestamps and market depth.
    Full,
}

impl TickMode {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

impl FromStr for TickMode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ltp" => Ok(Self::Ltp),
            "quote" => Ok(Self::Quote),
            "full" => Ok(Self::Full),
            other => Err(CodecError::InvalidFormat(format!("unknown tick mode: {other}"))),
        }
    }
}

// =============================================================================
// Control Messages
// =============================================================================

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Order postback.
    Order(Value),
    /// Server-side error, usually followed by a close.
    Error(String),
    /// Informational broadcast.
    Message(String),
    /// Anything else, kept for tracing.
    Other {
        /// Declared type.
        kind: String,
        /// Payload.
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
struct RawControl {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    a: &'static str,
    v: RequestValue<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestValue<'a> {
    Tokens(&'a [u32]),
    Mode(&'static str, &'a [u32]),
}

// =============================================================================
// Codec
// =============================================================================

/// Kite ticker codec.
#[derive(Debug, Default, Clone)]
pub struct KiteCodec;

impl KiteCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a subscribe request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn subscribe(&self, tokens: &[u32]) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&Request {
            a: "subscribe",
            v: RequestValue::Tokens(tokens),
        })?)
    }

    /// Encode an unsubscribe request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn unsubscribe(&self, tokens: &[u32]) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&Request {
            a: "unsubscribe",
            v: RequestValue::Tokens(tokens),
        })?)
    }

    /// Encode a mode change request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn mode(&self, mode: TickMode, tokens: &[u32]) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&Request {
            a: "mode",
            v: RequestValue::Mode(mode.as_str(), tokens),
        })?)
    }

    /// Decode a binary market data frame.
    ///
    /// Heartbeats decode to an empty batch. Packets with an unknown length
    /// are skipped. `received_at` stamps packets that carry no exchange time.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is shorter than its headers declare.
    pub fn decode_binary(
        &self,
        frame: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<Tick>, CodecError> {
        if frame.len() < 2 {
            return Ok(Vec::new());
        }

        let count = usize::from(read_u16(frame, 0)?);
        let mut ticks = Vec::with_capacity(count);
        let mut offset = 2;

        for _ in 0..count {
            let length = usize::from(read_u16(frame, offset)?);
            offset += 2;
            let packet = slice(frame, offset, length)?;
            offset += length;

            match decode_packet(packet, received_at)? {
                Some(tick) => ticks.push(tick),
                None => tracing::trace!(length, "Skipping packet with unknown layout"),
            }
        }

        Ok(ticks)
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object with a `type`.
    pub fn decode_text(&self, text: &str) -> Result<ControlMessage, CodecError> {
        let raw: RawControl = serde_json::from_str(text.trim())?;

        Ok(match raw.kind.as_str() {
            "order" => ControlMessage::Order(raw.data),
            "error" => ControlMessage::Error(value_text(raw.data)),
            "message" => ControlMessage::Message(value_text(raw.data)),
            _ => ControlMessage::Other {
                kind: raw.kind,
                data: raw.data,
            },
        })
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

// =============================================================================
// Packet Decoding
// =============================================================================

fn decode_packet(packet: &[u8], received_at: DateTime<Utc>) -> Result<Option<Tick>, CodecError> {
    let layout = packet.len();
    if !matches!(
        layout,
        LTP_PACKET | INDEX_QUOTE_PACKET | INDEX_FULL_PACKET | QUOTE_PACKET | FULL_PACKET
    ) {
        return Ok(None);
    }

    let token = read_u32(packet, 0)?;
    let scale = price_scale(token);
    let price = |offset: usize| -> Result<Decimal, CodecError> {
        Ok(Decimal::new(i64::from(read_i32(packet, offset)?), scale))
    };

    let mut tick = Tick::new(Instrument::from_token(token), price(4)?, received_at);

    match layout {
        INDEX_QUOTE_PACKET | INDEX_FULL_PACKET => {
            tick = tick.with_ohlc(Ohlc {
                high: price(8)?,
                low: price(12)?,
                open: price(16)?,
                close: price(20)?,
            });
            if layout == INDEX_FULL_PACKET {
                tick.timestamp = exchange_time(read_u32(packet, 28)?).unwrap_or(received_at);
            }
        }
        QUOTE_PACKET | FULL_PACKET => {
            tick = tick
                .with_volume(u64::from(read_u32(packet, 16)?))
                .with_ohlc(Ohlc {
                    open: price(28)?,
                    high: price(32)?,
                    low: price(36)?,
                    close: price(40)?,
                });
            if layout == FULL_PACKET {
                tick.timestamp = exchange_time(read_u32(packet, 60)?).unwrap_or(received_at);
            }
        }
        _ => {}
    }

    Ok(Some(tick))
}

/// Decimal places for the instrument's exchange segment.
const fn price_scale(token: u32) -> u32 {
    match token & 0xff {
        SEGMENT_CDS => 7,
        SEGMENT_BCD => 4,
        _ => 2,
    }
}

fn exchange_time(epoch_secs: u32) -> Option<DateTime<Utc>> {
    if epoch_secs == 0 {
        return None;
    }
    Utc.timestamp_opt(i64::from(epoch_secs), 0).single()
}

fn slice(frame: &[u8], offset: usize, needed: usize) -> Result<&[u8], CodecError> {
    frame
        .get(offset..offset + needed)
        .ok_or(CodecError::Truncated {
            offset,
            needed,
            available: frame.len().saturating_sub(offset),
        })
}

fn read_u16(frame: &[u8], offset: usize) -> Result<u16, CodecError> {
    let bytes = slice(frame, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(frame: &[u8], offset: usize) -> Result<u32, CodecError> {
    let bytes = slice(frame, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(frame: &[u8], offset: usize) -> Result<i32, CodecError> {
    let bytes = slice(frame, offset, 4)?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const GOLDM: u32 = 53_505_799; // low byte 7: MCX
    const USDINR: u32 = 1_234_435; // low byte 3: CDS

    fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut out = u16::try_from(packets.len()).unwrap().to_be_bytes().to_vec();
        for packet in packets {
            out.extend_from_slice(&u16::try_from(packet.len()).unwrap().to_be_bytes());
            out.extend_from_slice(packet);
        }
        out
    }

    fn packet(len: usize, fields: &[(usize, i64)]) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for &(offset, value) in fields {
            let bytes = i32::try_from(value).unwrap().to_be_bytes();
            out[offset..offset + 4].copy_from_slice(&bytes);
        }
        out
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_768_800_000, 0).unwrap()
    }

    #[test]
    fn heartbeat_is_empty() {
        let codec = KiteCodec::new();
        assert!(codec.decode_binary(&[0], now()).unwrap().is_empty());
    }

    #[test]
    fn ltp_packet() {
        let codec = KiteCodec::new();
        let bytes = frame(&[packet(8, &[(0, i64::from(GOLDM)), (4, 7_215_050)])]);

        let ticks = codec.decode_binary(&bytes, now()).unwrap();

        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument, Instrument::from_token(GOLDM));
        assert_eq!(ticks[0].price, Decimal::new(7_215_050, 2));
        assert_eq!(ticks[0].timestamp, now());
        assert!(ticks[0].ohlc.is_none());
    }

    #[test]
    fn quote_packet_carries_volume_and_ohlc() {
        let codec = KiteCodec::new();
        let bytes = frame(&[packet(
            44,
            &[
                (0, i64::from(GOLDM)),
                (4, 7_215_050),
                (16, 12_345),
                (28, 7_200_000),
                (32, 7_230_000),
                (36, 7_190_000),
                (40, 7_205_000),
            ],
        )]);

        let tick = &codec.decode_binary(&bytes, now()).unwrap()[0];

        assert_eq!(tick.volume, Some(12_345));
        let ohlc = tick.ohlc.unwrap();
        assert_eq!(ohlc.open, Decimal::new(7_200_000, 2));
        assert_eq!(ohlc.high, Decimal::new(7_230_000, 2));
        assert_eq!(ohlc.low, Decimal::new(7_190_000, 2));
        assert_eq!(ohlc.close, Decimal::new(7_205_000, 2));
    }

    #[test]
    fn full_packet_uses_exchange_time() {
        let codec = KiteCodec::new();
        let bytes = frame(&[packet(
            184,
            &[(0, i64::from(GOLDM)), (4, 100), (60, 1_768_700_000)],
        )]);

        let tick = &codec.decode_binary(&bytes, now()).unwrap()[0];

        assert_eq!(tick.timestamp, Utc.timestamp_opt(1_768_700_000, 0).unwrap());
    }

    #[test]
    fn currency_segment_uses_fine_scale() {
        let codec = KiteCodec::new();
        let bytes = frame(&[packet(8, &[(0, i64::from(USDINR)), (4, 832_512_500)])]);

        let tick = &codec.decode_binary(&bytes, now()).unwrap()[0];

        assert_eq!(tick.price, Decimal::new(832_512_500, 7));
    }

    #[test]
    fn multiple_packets_keep_order() {
        let codec = KiteCodec::new();
        let bytes = frame(&[
            packet(8, &[(0, 1), (4, 100)]),
            packet(12, &[(0, 2)]),
            packet(8, &[(0, 1), (4, 101)]),
        ]);

        let ticks = codec.decode_binary(&bytes, now()).unwrap();

        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].price, Decimal::new(101, 2));
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let codec = KiteCodec::new();
        let mut bytes = frame(&[packet(44, &[(0, 1)])]);
        bytes.truncate(20);

        let err = codec.decode_binary(&bytes, now()).unwrap_err();
        assert_eq!(err.kind(), "truncated");
    }

    #[test]
    fn requests_encode() {
        let codec = KiteCodec::new();

        assert_eq!(
            serde_json::from_str::<Value>(&codec.subscribe(&[408_065, 884_737]).unwrap()).unwrap(),
            json!({"a": "subscribe", "v": [408_065, 884_737]})
        );
        assert_eq!(
            serde_json::from_str::<Value>(&codec.unsubscribe(&[1]).unwrap()).unwrap(),
            json!({"a": "unsubscribe", "v": [1]})
        );
        assert_eq!(
            serde_json::from_str::<Value>(&codec.mode(TickMode::Full, &[1]).unwrap()).unwrap(),
            json!({"a": "mode", "v": ["full", [1]]})
        );
    }

    #[test]
    fn text_frames_decode() {
        let codec = KiteCodec::new();

        assert_eq!(
            codec
                .decode_text(r#"{"type":"error","data":"Invalid access token"}"#)
                .unwrap(),
            ControlMessage::Error("Invalid access token".to_string())
        );
        assert!(matches!(
            codec.decode_text(r#"{"type":"order","data":{"status":"COMPLETE"}}"#).unwrap(),
            ControlMessage::Order(_)
        ));
        assert!(codec.decode_text("not json").is_err());
    }

    #[test]
    fn tick_mode_parses() {
        assert_eq!("QUOTE".parse::<TickMode>().unwrap(), TickMode::Quote);
        assert_eq!(TickMode::default(), TickMode::Quote);
        assert!("depth".parse::<TickMode>().is_err());
    }
}
