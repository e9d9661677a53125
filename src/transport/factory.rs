//! Transport selection by fixed preference (spec §4.4).

use crate::error::TransportError;
use crate::types::{TransportDescription, TransportKind};

/// Fixed selection order: WebSockets first, then long-polling.
/// Server-Sent Events is decoded for wire compatibility but never
/// selected (spec §9, resolved Open Question).
const PREFERENCE_ORDER: [TransportKind; 2] = [TransportKind::WebSockets, TransportKind::LongPolling];

/// Chooses a transport from the advertised list by fixed preference.
///
/// Returns [`TransportError::InvalidNegotiationResponse`] if neither
/// preferred transport is advertised.
pub fn select_transport(available: &[TransportDescription]) -> Result<TransportKind, TransportError> {
    for preferred in PREFERENCE_ORDER {
        if available.iter().any(|desc| desc.kind == preferred) {
            return Ok(preferred);
        }
    }
    Err(TransportError::InvalidNegotiationResponse(
        "server did not advertise a supported transport".to_string(),
    ))
}
