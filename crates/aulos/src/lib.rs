#![forbid(unsafe_code)]

//! # Aulos
//!
//! Facade crate for the aulos adaptive bitrate control loop.
//!
//! ## Quick start
//!
//! ```ignore
//! use aulos::prelude::*;
//!
//! let session = Arc::new(AbrSession::start(player, AbrOptions::default())?);
//! let transport = HttpTransport::new(NetOptions::default(), session.clone())?;
//!
//! session.init(|variant| player.switch_to(variant));
//! session.refresh_variants();
//! session.enable();
//!
//! let bytes = transport.fetch(segment_url, RequestKind::Segment).await?;
//! session.segment_downloaded(elapsed, bytes.len() as u64);
//! ```

// ── Re-export sub-crates ────────────────────────────────────────────────

pub mod abr {
    pub use aulos_abr::*;
}

pub mod events {
    pub use aulos_events::*;
}

pub mod net {
    pub use aulos_net::*;
}

pub mod platform {
    pub use aulos_platform::*;
}

// ── Prelude ─────────────────────────────────────────────────────────────

pub mod prelude {
    pub use aulos_abr::{
        AbrError, AbrEvent, AbrOptions, AbrSession, BufferHealth, BufferedRange, Event,
        EventBus, LevelPolicies, LevelPolicy, NetEvent, Player, Variant, VariantRestrictions,
    };
    pub use aulos_net::{
        CloseReason, Failure, HttpTransport, NetError, NetOptions, RequestControl, RequestInfo,
        RequestKind, RetryDecision, RetryParameters, Transport, TransportObserver,
    };
}
