//! Core wire-level types: transport kinds, transfer formats, and the
//! connection state machine's states.

use std::fmt;

/// The set of physical transports a SignalR-protocol server can
/// advertise during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Full-duplex WebSocket transport.
    WebSockets,
    /// Server-Sent Events. Decoded for wire compatibility with servers
    /// that advertise it, but never selected by
    /// [`crate::transport::factory::select_transport`] (see spec §9).
    ServerSentEvents,
    /// HTTP long-polling transport.
    LongPolling,
}

impl TransportKind {
    /// The canonical wire string for this transport, as it appears in
    /// a negotiate response's `transport` field.
    #[must_use]
    pub const fn as_wire_str(self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
            Self::ServerSentEvents => "ServerSentEvents",
            Self::LongPolling => "LongPolling",
        }
    }

    /// Parses a wire string into a `TransportKind`. Unknown strings are
    /// a hard decode error (spec §3).
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "WebSockets" => Some(Self::WebSockets),
            "ServerSentEvents" => Some(Self::ServerSentEvents),
            "LongPolling" => Some(Self::LongPolling),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// The wire encoding negotiated for messages flowing over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    /// UTF-8 text frames.
    Text,
    /// Raw binary frames.
    Binary,
}

impl TransferFormat {
    /// The canonical wire string for this format.
    #[must_use]
    pub const fn as_wire_str(self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Binary => "Binary",
        }
    }

    /// Parses a wire string into a `TransferFormat`. Unknown strings are
    /// a hard decode error (spec §3).
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(Self::Text),
            "Binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// A transport advertised by the server, paired with the transfer
/// formats it supports. Immutable once decoded; equality is by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescription {
    /// Which physical transport this entry describes.
    pub kind: TransportKind,
    /// The transfer formats the server supports for this transport.
    pub transfer_formats: Vec<TransferFormat>,
}

impl TransportDescription {
    /// Creates a new description.
    #[must_use]
    pub const fn new(kind: TransportKind, transfer_formats: Vec<TransferFormat>) -> Self {
        Self {
            kind,
            transfer_formats,
        }
    }

    /// The synthetic single-entry list used when negotiation is skipped
    /// (spec §4.4): `[webSockets{text,binary}]`.
    #[must_use]
    pub fn skip_negotiation_default() -> Vec<Self> {
        vec![Self::new(
            TransportKind::WebSockets,
            vec![TransferFormat::Text, TransferFormat::Binary],
        )]
    }
}

/// The lifecycle state of an [`crate::connection::HttpConnection`].
///
/// `Stopped` is terminal: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Freshly constructed; only `start()` is valid.
    Initial = 0,
    /// Negotiating and/or starting a transport.
    Connecting = 1,
    /// Transport is open; sends are legal.
    Connected = 2,
    /// Terminal. All further operations are no-ops or `InvalidState`.
    Stopped = 3,
}

impl ConnectionState {
    pub(crate) const fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::Initial,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_wire_round_trip() {
        for kind in [
            TransportKind::WebSockets,
            TransportKind::ServerSentEvents,
            TransportKind::LongPolling,
        ] {
            assert_eq!(TransportKind::from_wire_str(kind.as_wire_str()), Some(kind));
        }
    }

    #[test]
    fn transport_kind_rejects_unknown() {
        assert_eq!(TransportKind::from_wire_str("Carrier Pigeon"), None);
    }

    #[test]
    fn transfer_format_wire_round_trip() {
        for format in [TransferFormat::Text, TransferFormat::Binary] {
            assert_eq!(
                TransferFormat::from_wire_str(format.as_wire_str()),
                Some(format)
            );
        }
    }

    #[test]
    fn skip_negotiation_default_is_websockets_text_and_binary() {
        let descs = TransportDescription::skip_negotiation_default();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].kind, TransportKind::WebSockets);
        assert_eq!(
            descs[0].transfer_formats,
            vec![TransferFormat::Text, TransferFormat::Binary]
        );
    }

    #[test]
    fn connection_state_tag_round_trip() {
        for state in [
            ConnectionState::Initial,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Stopped,
        ] {
            assert_eq!(ConnectionState::from_tag(state as u8), state);
        }
    }
}
