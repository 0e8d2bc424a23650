//! Channel URI grammar and per-stream parameter resolution.
//!
//! `aqueduct:udp?endpoint=host:port|mtu=1408`, `aqueduct:ipc`, and the spy
//! form `spy:aqueduct:udp?...`. Params are `key=value` pairs joined by `|`;
//! time values accept a bare number or an `ns`/`us`/`ms`/`s` suffix.

use std::collections::BTreeMap;

use crate::config::{parse_duration_ns, DriverConfig};
use crate::logbuffer::meta::check_term_length;
use crate::{Error, Result};

pub const SCHEME: &str = "aqueduct";
pub const SPY_PREFIX: &str = "spy:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Media {
    Udp,
    Ipc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMode {
    Manual,
    Dynamic,
    Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampOffset {
    /// Stamp into the frame's reserved-value slot.
    Reserved,
    /// Stamp at a fixed payload offset.
    Offset(u32),
}

const RECOGNIZED_KEYS: &[&str] = &[
    "endpoint",
    "control",
    "control-mode",
    "term-length",
    "mtu",
    "init-term-id",
    "term-id",
    "term-offset",
    "session-id",
    "linger",
    "sparse",
    "eos",
    "tether",
    "group",
    "rejoin",
    "ssc",
    "so-sndbuf",
    "so-rcvbuf",
    "rcv-wnd",
    "reliable",
    "ttl",
    "cc",
    "fc",
    "gtag",
    "alias",
    "tags",
    "response-correlation-id",
    "nak-delay",
    "untethered-window-limit-timeout",
    "untethered-linger-timeout",
    "untethered-resting-timeout",
    "max-resend",
    "stream-id",
    "pub-wnd",
    "channel-rcv-ts-offset",
    "channel-snd-ts-offset",
    "media-rcv-ts-offset",
];

#[derive(Clone, Debug)]
pub struct ChannelUri {
    pub is_spy: bool,
    pub media: Media,
    params: BTreeMap<String, String>,
    canonical: String,
}

impl ChannelUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let canonical = uri.to_string();
        let (is_spy, rest) = match uri.strip_prefix(SPY_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, uri),
        };
        let rest = rest
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| Error::InvalidChannel(format!("missing {SCHEME}: scheme: {uri}")))?;

        let (media_str, params_str) = match rest.split_once('?') {
            Some((media, params)) => (media, Some(params)),
            None => (rest, None),
        };

        let media = match media_str {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => return Err(Error::InvalidChannel(format!("unknown media: {other}"))),
        };

        if is_spy && media != Media::Udp {
            return Err(Error::InvalidChannel("spy prefix requires udp media".into()));
        }

        let mut params = BTreeMap::new();
        if let Some(params_str) = params_str {
            for pair in params_str.split('|').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidChannel(format!("bad param: {pair}")))?;
                if !RECOGNIZED_KEYS.contains(&key) {
                    return Err(Error::InvalidChannel(format!("unrecognized param: {key}")));
                }
                if params.insert(key.to_string(), value.to_string()).is_some() {
                    return Err(Error::InvalidChannel(format!("duplicate param: {key}")));
                }
            }
        }

        let uri = Self { is_spy, media, params, canonical };
        uri.validate()?;
        Ok(uri)
    }

    fn validate(&self) -> Result<()> {
        if self.media == Media::Udp && !self.is_spy && self.get("endpoint").is_none()
            && self.get("control").is_none()
        {
            return Err(Error::InvalidChannel("udp channel needs endpoint or control".into()));
        }
        let position_keys =
            ["init-term-id", "term-id", "term-offset"].map(|key| self.get(key).is_some());
        if position_keys.iter().any(|&p| p) && !position_keys.iter().all(|&p| p) {
            return Err(Error::InvalidChannel(
                "init-term-id, term-id and term-offset must be set together".into(),
            ));
        }
        self.control_mode()?;
        self.timestamp_offset("channel-rcv-ts-offset")?;
        self.timestamp_offset("channel-snd-ts-offset")?;
        self.timestamp_offset("media-rcv-ts-offset")?;
        self.response_correlation_id()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.get("endpoint")
    }

    pub fn control_mode(&self) -> Result<Option<ControlMode>> {
        match self.get("control-mode") {
            None => Ok(None),
            Some("manual") => Ok(Some(ControlMode::Manual)),
            Some("dynamic") => Ok(Some(ControlMode::Dynamic)),
            Some("response") => Ok(Some(ControlMode::Response)),
            Some(other) => Err(Error::InvalidChannel(format!("unknown control-mode: {other}"))),
        }
    }

    pub fn response_correlation_id(&self) -> Result<Option<i64>> {
        match self.get("response-correlation-id") {
            None => Ok(None),
            Some("prototype") => Ok(Some(-1)),
            Some(value) => {
                let id: i64 = value.parse().map_err(|_| {
                    Error::InvalidChannel(format!("bad response-correlation-id: {value}"))
                })?;
                if id < -1 {
                    return Err(Error::InvalidChannel(format!(
                        "response-correlation-id must be >= -1: {value}"
                    )));
                }
                Ok(Some(id))
            }
        }
    }

    pub fn timestamp_offset(&self, key: &str) -> Result<Option<TimestampOffset>> {
        match self.get(key) {
            None => Ok(None),
            Some("reserved") => Ok(Some(TimestampOffset::Reserved)),
            Some(value) => value
                .parse::<u32>()
                .map(|offset| Some(TimestampOffset::Offset(offset)))
                .map_err(|_| Error::InvalidChannel(format!("bad {key}: {value}"))),
        }
    }

    fn bool_param(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(Error::InvalidChannel(format!("bad boolean {key}: {other}"))),
        }
    }

    fn i32_param(&self, key: &str) -> Result<Option<i32>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<i32>()
                .map(Some)
                .map_err(|_| Error::InvalidChannel(format!("bad {key}: {value}"))),
        }
    }

    fn i64_param(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::InvalidChannel(format!("bad {key}: {value}"))),
        }
    }

    fn size_param(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => parse_size(value)
                .map(Some)
                .map_err(|_| Error::InvalidChannel(format!("bad {key}: {value}"))),
        }
    }

    fn duration_param(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => parse_duration_ns(value)
                .map(Some)
                .map_err(|_| Error::InvalidChannel(format!("bad {key}: {value}"))),
        }
    }
}

/// Sizes accept a bare byte count or a `k`/`m`/`g` suffix.
pub fn parse_size(value: &str) -> Result<usize> {
    let value = value.trim();
    let (digits, scale) = match value.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 1024usize),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let number: usize = digits
        .parse()
        .map_err(|_| Error::Generic(format!("bad size: {value}")))?;
    number
        .checked_mul(scale)
        .ok_or_else(|| Error::Generic(format!("size overflows: {value}")))
}

/// Resolved parameters for creating a publication.
#[derive(Clone, Debug)]
pub struct PublicationParams {
    pub term_length: usize,
    pub mtu_length: usize,
    pub publication_window_length: usize,
    pub session_id: Option<i32>,
    pub initial_term_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub has_explicit_position: bool,
    pub linger_timeout_ns: u64,
    pub untethered_window_limit_timeout_ns: u64,
    pub untethered_linger_timeout_ns: u64,
    pub untethered_resting_timeout_ns: u64,
    pub signal_eos: bool,
    pub sparse: bool,
    pub spies_simulate_connection: bool,
    pub max_resend: usize,
    pub flow_control: Option<String>,
    pub group_tag: Option<i64>,
    pub response_correlation_id: Option<i64>,
}

impl PublicationParams {
    pub fn from_channel(uri: &ChannelUri, config: &DriverConfig) -> Result<Self> {
        let default_term = match uri.media {
            Media::Ipc => config.ipc_term_buffer_length,
            Media::Udp => config.term_buffer_length,
        };
        let term_length = uri.size_param("term-length")?.unwrap_or(default_term);
        check_term_length(term_length).map_err(|err| Error::InvalidChannel(err.to_string()))?;

        let mtu_length = uri.size_param("mtu")?.unwrap_or(config.mtu_length);
        if mtu_length % 32 != 0 || mtu_length < 96 || mtu_length > 65504 {
            return Err(Error::InvalidChannel(format!("bad mtu: {mtu_length}")));
        }

        let publication_window_length = match uri.size_param("pub-wnd")? {
            Some(window) => {
                if window > term_length / 2 {
                    return Err(Error::InvalidChannel(format!(
                        "pub-wnd {window} exceeds half the term length"
                    )));
                }
                window
            }
            None => config.publication_window_for(term_length),
        };

        let has_explicit_position = uri.get("term-id").is_some();
        let initial_term_id = uri.i32_param("init-term-id")?.unwrap_or(0);
        let term_id = uri.i32_param("term-id")?.unwrap_or(initial_term_id);
        let term_offset = uri.i32_param("term-offset")?.unwrap_or(0);
        if has_explicit_position {
            if term_offset as usize > term_length {
                return Err(Error::InvalidChannel(format!("term-offset {term_offset} beyond term")));
            }
            if term_offset % crate::logbuffer::FRAME_ALIGNMENT as i32 != 0 {
                return Err(Error::InvalidChannel(format!(
                    "term-offset {term_offset} not frame aligned"
                )));
            }
            let term_count = term_id.wrapping_sub(initial_term_id);
            if term_count < 0 {
                return Err(Error::InvalidChannel(
                    "term-id must not precede init-term-id".into(),
                ));
            }
        }

        Ok(Self {
            term_length,
            mtu_length,
            publication_window_length,
            session_id: uri.i32_param("session-id")?,
            initial_term_id,
            term_id,
            term_offset,
            has_explicit_position,
            linger_timeout_ns: uri
                .duration_param("linger")?
                .unwrap_or(config.publication_linger_timeout_ns),
            untethered_window_limit_timeout_ns: uri
                .duration_param("untethered-window-limit-timeout")?
                .unwrap_or(config.untethered_window_limit_timeout_ns),
            untethered_linger_timeout_ns: uri
                .duration_param("untethered-linger-timeout")?
                .unwrap_or(config.untethered_linger_timeout_ns),
            untethered_resting_timeout_ns: uri
                .duration_param("untethered-resting-timeout")?
                .unwrap_or(config.untethered_resting_timeout_ns),
            signal_eos: uri.bool_param("eos", true)?,
            sparse: uri.bool_param("sparse", false)?,
            spies_simulate_connection: uri.bool_param("ssc", false)?,
            max_resend: uri
                .size_param("max-resend")?
                .unwrap_or(config.max_resend),
            flow_control: uri.get("fc").map(str::to_string),
            group_tag: uri.i64_param("gtag")?,
            response_correlation_id: uri.response_correlation_id()?,
        })
    }
}

/// Resolved parameters for creating a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionParams {
    pub is_tether: bool,
    pub is_reliable: bool,
    pub is_rejoin: bool,
    pub is_spy: bool,
    pub group_tag: Option<i64>,
    pub receiver_window_length: usize,
    pub nak_delay_ns: Option<u64>,
    pub session_id: Option<i32>,
}

impl SubscriptionParams {
    pub fn from_channel(uri: &ChannelUri, config: &DriverConfig) -> Result<Self> {
        Ok(Self {
            is_tether: uri.bool_param("tether", true)?,
            is_reliable: uri.bool_param("reliable", true)?,
            is_rejoin: uri.bool_param("rejoin", true)?,
            is_spy: uri.is_spy,
            group_tag: uri.i64_param("gtag")?,
            receiver_window_length: uri
                .size_param("rcv-wnd")?
                .unwrap_or(config.initial_window_length),
            nak_delay_ns: uri.duration_param("nak-delay")?,
            session_id: uri.i32_param("session-id")?,
        })
    }
}
